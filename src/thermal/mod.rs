//! Thermal-model learning and persistence.
//!
//! The space-heating sub-model needs the state-space matrices
//! `(Ax, Au, Aw)`; this module learns them from historical telemetry
//! ([`learner`]), persists them as a JSON artifact and decides when to
//! relearn ([`store`]).

pub mod learner;
pub mod store;

use crate::domain::ThermalModel;
use chrono::Utc;
use nalgebra::{DMatrix, DVector};

/// Spectral radius estimate via power iteration on the signed matrix:
/// the per-step growth of `||Ax^k v||` converges to the dominant
/// eigenvalue magnitude. Late growth factors are averaged geometrically,
/// which also smooths the oscillation a dominant complex pair causes.
/// Signed entries matter here: inter-zone coupling may legitimately be
/// negative, and an absolute-value bound would overstate the radius.
pub fn spectral_radius(rows: &[Vec<f64>]) -> f64 {
    let n = rows.len();
    if n == 0 {
        return 0.0;
    }
    let m = DMatrix::from_fn(n, n, |i, j| rows[i][j]);
    let mut v = DVector::from_element(n, 1.0 / (n as f64).sqrt());
    let mut log_growth = 0.0;
    let mut averaged = 0u32;
    for iteration in 0..400 {
        let next = &m * &v;
        let norm = next.norm();
        if norm < 1e-300 {
            return 0.0;
        }
        if iteration >= 200 {
            log_growth += norm.ln();
            averaged += 1;
        }
        v = next / norm;
    }
    (log_growth / averaged as f64).exp()
}

/// Fallback dynamics used when learning is impossible and no prior
/// artifact exists: strong self-coupling with weak symmetric spill-over
/// (row sums 0.99, so stable by construction), a small direct heater gain
/// per zone and no disturbance response.
pub fn default_model(zones: usize) -> ThermalModel {
    let zones = zones.max(1);
    let off_diagonal = if zones > 1 {
        0.04 / (zones as f64 - 1.0)
    } else {
        0.0
    };
    let diagonal = if zones > 1 { 0.95 } else { 0.99 };
    let ax = (0..zones)
        .map(|i| {
            (0..zones)
                .map(|j| if i == j { diagonal } else { off_diagonal })
                .collect()
        })
        .collect();
    let au = (0..zones)
        .map(|i| {
            (0..zones)
                .map(|j| if i == j { 0.02 } else { 0.0 })
                .collect()
        })
        .collect();
    let aw = vec![vec![0.0]; zones];
    ThermalModel {
        ax,
        au,
        aw,
        learned_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spectral_radius_of_diagonal_matrix() {
        let rows = vec![vec![0.9, 0.0], vec![0.0, 0.5]];
        assert!((spectral_radius(&rows) - 0.9).abs() < 1e-9);
    }

    #[test]
    fn spectral_radius_detects_instability() {
        let rows = vec![vec![1.2, 0.0], vec![0.0, 0.3]];
        assert!(spectral_radius(&rows) > 1.0);
    }

    #[test]
    fn spectral_radius_uses_signed_entries() {
        // Complex dominant pair with magnitude sqrt(0.61) ~ 0.78; an
        // entrywise absolute bound would report 1.2 and reject a stable
        // system with negative coupling.
        let rows = vec![vec![0.9, -0.5], vec![0.5, 0.4]];
        let radius = spectral_radius(&rows);
        assert!((radius - 0.61f64.sqrt()).abs() < 0.05, "radius {radius}");
    }

    #[test]
    fn default_model_is_stable_for_many_zones() {
        for zones in 1..=6 {
            let m = default_model(zones);
            m.validate().unwrap();
            assert!(spectral_radius(&m.ax) <= 1.0 + 1e-9);
        }
    }
}
