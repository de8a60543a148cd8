use crate::error::ControlError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Learned zone thermal dynamics `T[k+1] = Ax T[k] + Au p[k+1] + Aw w[k+1]`.
///
/// `Ax` couples zone temperatures (Z x Z), `Au` maps heater powers in kW to
/// temperature gains (Z x U), `Aw` maps disturbance channels such as outdoor
/// temperature (Z x D). Stability requires the spectral radius of `Ax` to
/// stay at or below one and `Au` to be elementwise nonnegative; the learner
/// keeps `Au` nonnegative by projection, rejects unstable fits, and
/// [`ThermalModel::validate`] re-checks artifacts loaded from disk.
/// Off-diagonal `Ax` entries and `Aw` may be negative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThermalModel {
    pub ax: Vec<Vec<f64>>,
    pub au: Vec<Vec<f64>>,
    pub aw: Vec<Vec<f64>>,
    pub learned_at: DateTime<Utc>,
}

impl ThermalModel {
    /// Number of thermal zones `Z`.
    pub fn zones(&self) -> usize {
        self.ax.len()
    }

    /// Number of heater inputs `U`.
    pub fn heater_inputs(&self) -> usize {
        self.au.first().map(|r| r.len()).unwrap_or(0)
    }

    /// Number of disturbance channels `D`.
    pub fn disturbance_channels(&self) -> usize {
        self.aw.first().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_fresh(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        now <= self.learned_at + ttl
    }

    /// Shape and stability checks for artifacts read back from disk.
    pub fn validate(&self) -> Result<(), ControlError> {
        let z = self.zones();
        if z == 0 {
            return Err(ControlError::ModelLoadFailed(
                "thermal model has no zones".into(),
            ));
        }
        if self.ax.iter().any(|row| row.len() != z) {
            return Err(ControlError::ModelLoadFailed(
                "Ax is not square".into(),
            ));
        }
        if self.au.len() != z || self.aw.len() != z {
            return Err(ControlError::ModelLoadFailed(
                "Au/Aw row count does not match zone count".into(),
            ));
        }
        let u = self.heater_inputs();
        let d = self.disturbance_channels();
        if self.au.iter().any(|row| row.len() != u) || self.aw.iter().any(|row| row.len() != d) {
            return Err(ControlError::ModelLoadFailed(
                "ragged Au/Aw matrix".into(),
            ));
        }
        if self
            .au
            .iter()
            .flatten()
            .chain(self.ax.iter().flatten())
            .chain(self.aw.iter().flatten())
            .any(|v| !v.is_finite())
        {
            return Err(ControlError::ModelLoadFailed(
                "non-finite matrix entry".into(),
            ));
        }
        if self.au.iter().flatten().any(|v| *v < 0.0) {
            return Err(ControlError::ModelLoadFailed(
                "Au must be elementwise nonnegative".into(),
            ));
        }
        let radius = crate::thermal::spectral_radius(&self.ax);
        if radius > 1.0 + 1e-9 {
            return Err(ControlError::ModelLoadFailed(format!(
                "Ax spectral radius {radius:.6} exceeds 1"
            )));
        }
        Ok(())
    }
}
