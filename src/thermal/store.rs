//! Persistence and freshness policy for the thermal-model artifact.
//!
//! The artifact is a single JSON file `{ax, au, aw, learned_at}` written
//! by the learner and read once per planning cycle. A model older than
//! the configured TTL triggers a relearn; a failed relearn falls back to
//! the prior artifact, or to the default model when none exists. Learning
//! failures never fail a planning cycle.

use crate::core_api::CoreApi;
use crate::domain::{Device, DeviceKind, ThermalModel};
use crate::error::ControlError;
use crate::thermal::learner::{self, LearningData, RidgeWeights};
use chrono::{DateTime, Duration, Utc};
use nalgebra::DMatrix;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub struct ThermalStore {
    path: PathBuf,
    ttl: Duration,
}

impl ThermalStore {
    pub fn new(path: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            path: path.into(),
            ttl,
        }
    }

    pub fn load(&self) -> Result<ThermalModel, ControlError> {
        let raw = std::fs::read_to_string(&self.path)
            .map_err(|e| ControlError::ModelLoadFailed(format!("{}: {e}", self.path.display())))?;
        let model: ThermalModel = serde_json::from_str(&raw)
            .map_err(|e| ControlError::ModelLoadFailed(format!("{}: {e}", self.path.display())))?;
        model.validate()?;
        Ok(model)
    }

    /// Write `latest` plus a timestamped sibling for traceability.
    pub fn save(&self, model: &ThermalModel) -> Result<(), ControlError> {
        let body = serde_json::to_string_pretty(model)
            .map_err(|e| ControlError::WriteFailed(e.to_string()))?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ControlError::WriteFailed(format!("{}: {e}", parent.display())))?;
        }
        std::fs::write(&self.path, &body)
            .map_err(|e| ControlError::WriteFailed(format!("{}: {e}", self.path.display())))?;

        let stamped = self.stamped_path(model.learned_at);
        if let Err(e) = std::fs::write(&stamped, &body) {
            warn!(path = %stamped.display(), error = %e, "failed to write dated thermal model copy");
        }
        Ok(())
    }

    fn stamped_path(&self, learned_at: DateTime<Utc>) -> PathBuf {
        let stamp = learned_at
            .format("%Y-%m-%dT%H-%M-%S")
            .to_string();
        let directory = self.path.parent().unwrap_or_else(|| Path::new("."));
        directory.join(format!("{stamp}.json"))
    }

    /// Return a usable thermal model, relearning when the artifact is
    /// missing, stale or unreadable. Never fails: a learn failure falls
    /// back to the prior artifact or the default near-diagonal model.
    pub async fn validate_or_learn(
        &self,
        api: &dyn CoreApi,
        lookback: Duration,
        now: DateTime<Utc>,
    ) -> ThermalModel {
        let prior = self.load();
        if let Ok(model) = &prior {
            if model.is_fresh(self.ttl, now) {
                info!(learned_at = %model.learned_at, "thermal model is fresh, reusing");
                return model.clone();
            }
            info!(learned_at = %model.learned_at, "thermal model is stale, relearning");
        } else {
            info!("no usable thermal model artifact, learning");
        }

        match self.learn(api, lookback, now).await {
            Ok(model) => {
                if let Err(e) = self.save(&model) {
                    warn!(error = %e, "failed to persist learned thermal model");
                }
                model
            }
            Err(e) => {
                warn!(error = %e, kind = e.kind(), "thermal learning failed");
                match prior {
                    Ok(model) => {
                        warn!("keeping prior thermal model for this cycle");
                        model
                    }
                    Err(_) => {
                        let zones = self.zone_count(api).await;
                        warn!(zones, "falling back to default thermal model");
                        let model = crate::thermal::default_model(zones);
                        if let Err(e) = self.save(&model) {
                            warn!(error = %e, "failed to persist default thermal model");
                        }
                        model
                    }
                }
            }
        }
    }

    async fn zone_count(&self, api: &dyn CoreApi) -> usize {
        match api.devices().await {
            Ok(devices) => space_heating_zones(&devices).len().max(1),
            Err(_) => 1,
        }
    }

    /// Fetch historical traces and fit the model.
    async fn learn(
        &self,
        api: &dyn CoreApi,
        lookback: Duration,
        now: DateTime<Utc>,
    ) -> Result<ThermalModel, ControlError> {
        let devices = api.devices().await?;
        let zones = space_heating_zones(&devices);
        if zones.is_empty() {
            return Err(ControlError::ModelLearnFailed(
                "no space heating devices in inventory".into(),
            ));
        }

        let start = now - lookback;
        let mut temperature_series = Vec::with_capacity(zones.len());
        let mut consumption_series = Vec::with_capacity(zones.len());
        for zone in &zones {
            temperature_series.push(
                api.historic("tz-temperature", start, now, Some(&zone.entity_id))
                    .await?,
            );
            consumption_series.push(
                api.historic("tz-electric-consumption", start, now, Some(&zone.entity_id))
                    .await?,
            );
        }
        let outdoor = api
            .weather(crate::core_api::WeatherScope::Historic, "temperature", start, now)
            .await?;

        // Trim all traces to their common timestamps before stacking.
        let mut common: BTreeSet<_> = temperature_series[0].0.keys().copied().collect();
        for series in temperature_series[1..].iter().chain(consumption_series.iter()) {
            common = common
                .intersection(&series.0.keys().copied().collect())
                .copied()
                .collect();
        }
        common = common
            .intersection(&outdoor.0.keys().copied().collect())
            .copied()
            .collect();
        let timestamps: Vec<_> = common.into_iter().collect();
        let samples = timestamps.len();
        let z = zones.len();
        if samples < 2 {
            return Err(ControlError::ModelLearnFailed(format!(
                "only {samples} aligned historical samples"
            )));
        }

        let temperatures = DMatrix::from_fn(z, samples, |i, k| {
            temperature_series[i].0[&timestamps[k]]
        });
        // Meter sign convention is negative-for-consumption in W; the
        // learner wants positive kW, clamped at zero.
        let heater_powers = DMatrix::from_fn(z, samples, |i, k| {
            (-consumption_series[i].0[&timestamps[k]] / 1000.0).max(0.0)
        });
        let disturbances = DMatrix::from_fn(1, samples, |_, k| outdoor.0[&timestamps[k]]);

        learner::fit(
            &LearningData {
                temperatures,
                heater_powers,
                disturbances,
            },
            RidgeWeights::default(),
        )
    }
}

/// Space-heating devices in planner zone order (ascending priority).
pub fn space_heating_zones(devices: &[Device]) -> Vec<Device> {
    let mut zones: Vec<Device> = devices
        .iter()
        .filter(|d| d.kind() == DeviceKind::SpaceHeating)
        .cloned()
        .collect();
    zones.sort_by_key(|d| d.priority);
    zones
}
