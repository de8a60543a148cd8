//! Space heating sub-model.
//!
//! All thermal zones are planned together through the learned state-space
//! dynamics `T[k+1] = Ax T[k] + Au p[k+1] + Aw w[k+1]`. The comfort
//! objective combines an occupancy-weighted quadratic deviation from the
//! preferred setpoints with a heavily weighted worst-case (infinity-norm)
//! term, so no single zone is sacrificed for the average. Heater powers
//! share a fixed electrical budget and are rate limited between steps.
//! Critical action is the minimum allowed setpoint.

use crate::core_api::CoreApi;
use crate::devices::{DeviceModel, Formulation, PlannedSeries, Signal};
use crate::domain::{Device, DeviceKind, DeviceParams, Horizon, SpaceHeatingParams, ThermalModel};
use crate::error::ControlError;
use crate::planner::objective::{deviation, quadratic_penalty, weighted_max_abs};
use crate::thermal::store::space_heating_zones;
use good_lp::{constraint, variable, Expression, ProblemVariables};
use tracing::warn;

pub const SETPOINT_PREFERENCES: &str = "setpoint-preferences";
pub const OCCUPANCY_PREFERENCES: &str = "occupancy-preferences";

/// Temperature deviation normalization, degrees.
const NORM_FACTOR_C: f64 = 10.0;
/// Weight of the worst-case deviation term relative to the quadratic sum.
const PEAK_WEIGHT: f64 = 100.0;
/// Total electrical budget shared by all zone heaters, kW.
const HEATER_BUDGET_KW: f64 = 16.0;
/// Maximum heater power change between consecutive steps, kW.
const RAMP_LIMIT_KW: f64 = 2.0;

struct Zone {
    device: Device,
    params: SpaceHeatingParams,
    initial_temperature_c: f64,
    setpoints_c: Vec<f64>,
    occupancy: Vec<f64>,
}

pub struct SpaceHeatingModel {
    zones: Vec<Zone>,
    thermal: ThermalModel,
    /// Disturbance channels on the horizon grid, D x N.
    disturbances: Vec<Vec<f64>>,
}

impl SpaceHeatingModel {
    pub async fn retrieve(
        api: &dyn CoreApi,
        devices: &[Device],
        horizon: &Horizon,
        thermal: &ThermalModel,
    ) -> Result<Option<Self>, ControlError> {
        let ordered = space_heating_zones(devices);
        if ordered.is_empty() {
            return Ok(None);
        }
        if thermal.zones() != ordered.len() {
            return Err(ControlError::ModelLoadFailed(format!(
                "thermal model covers {} zones but inventory has {}",
                thermal.zones(),
                ordered.len()
            )));
        }
        if thermal.heater_inputs() != ordered.len() {
            return Err(ControlError::ModelLoadFailed(format!(
                "thermal model has {} heater inputs for {} zones",
                thermal.heater_inputs(),
                ordered.len()
            )));
        }

        let mut zones = Vec::with_capacity(ordered.len());
        for device in &ordered {
            let params = match &device.params {
                DeviceParams::SpaceHeating(p) => p.clone(),
                _ => unreachable!("filtered on kind"),
            };
            let initial_temperature_c = api.device_state(&device.entity_id, None).await?;
            let setpoints_c = api
                .preferences(
                    SETPOINT_PREFERENCES,
                    &device.entity_id,
                    horizon.start,
                    horizon.stop,
                )
                .await?
                .dense(horizon, "setpoint preferences")?;
            let occupancy = api
                .preferences(
                    OCCUPANCY_PREFERENCES,
                    &device.entity_id,
                    horizon.start,
                    horizon.stop,
                )
                .await?
                .dense(horizon, "occupancy preferences")?;
            zones.push(Zone {
                device: device.clone(),
                params,
                initial_temperature_c,
                setpoints_c,
                occupancy,
            });
        }

        // Disturbance channels: outdoor temperature first, irradiance
        // second when the model was learned with two channels.
        let channels = thermal.disturbance_channels();
        if channels > 2 {
            return Err(ControlError::ModelLoadFailed(format!(
                "thermal model expects {channels} disturbance channels, at most 2 supported"
            )));
        }
        let mut disturbances = Vec::with_capacity(channels);
        let temperature = api
            .weather(
                crate::core_api::WeatherScope::Forecast,
                "temperature",
                horizon.start,
                horizon.stop,
            )
            .await?
            .dense(horizon, "temperature forecast")?;
        disturbances.push(temperature);
        if channels == 2 {
            let irradiance = api
                .weather(
                    crate::core_api::WeatherScope::Forecast,
                    "irradiance",
                    horizon.start,
                    horizon.stop,
                )
                .await?
                .dense(horizon, "irradiance forecast")?;
            disturbances.push(irradiance);
        }

        Ok(Some(Self {
            zones,
            thermal: thermal.clone(),
            disturbances,
        }))
    }
}

impl DeviceModel for SpaceHeatingModel {
    fn kind(&self) -> DeviceKind {
        DeviceKind::SpaceHeating
    }

    fn formulate(
        &self,
        horizon: &Horizon,
        vars: &mut ProblemVariables,
    ) -> Result<Formulation, ControlError> {
        let n = horizon.steps();
        let z_count = self.zones.len();
        let per_heater_cap = HEATER_BUDGET_KW / z_count as f64;

        let mut constraints = Vec::new();

        // Zone temperatures are free-signed states; heater powers share
        // the electrical budget equally.
        let temperatures: Vec<Vec<good_lp::Variable>> = (0..z_count)
            .map(|_| vars.add_vector(variable(), n))
            .collect();
        let heaters: Vec<Vec<good_lp::Variable>> = (0..z_count)
            .map(|_| vars.add_vector(variable().min(0.0).max(per_heater_cap), n))
            .collect();

        for (z, zone) in self.zones.iter().enumerate() {
            let mut t_min = zone.params.min_setpoint_c;
            let mut t_max = zone.params.max_setpoint_c;
            if zone.initial_temperature_c < t_min {
                warn!(entity_id = %zone.device.entity_id, initial = zone.initial_temperature_c,
                      min = t_min, "initial zone temperature below minimum setpoint, relaxing to 0");
                t_min = 0.0;
            }
            if zone.initial_temperature_c > t_max {
                warn!(entity_id = %zone.device.entity_id, initial = zone.initial_temperature_c,
                      max = t_max, "initial zone temperature above maximum setpoint, relaxing to 30");
                t_max = 30.0;
            }

            constraints.push(constraint!(
                temperatures[z][0] == zone.initial_temperature_c
            ));
            for k in 0..n {
                constraints.push(constraint!(temperatures[z][k] >= t_min));
                constraints.push(constraint!(temperatures[z][k] <= t_max));
            }
            for k in 1..n {
                constraints.push(constraint!(
                    heaters[z][k] - heaters[z][k - 1] <= RAMP_LIMIT_KW
                ));
                constraints.push(constraint!(
                    heaters[z][k - 1] - heaters[z][k] <= RAMP_LIMIT_KW
                ));
            }
        }

        // Thermal balance, vectorized over zones.
        for k in 1..n {
            for z in 0..z_count {
                let mut rhs = Expression::from_other_affine(0.0);
                for j in 0..z_count {
                    rhs += self.thermal.ax[z][j] * temperatures[j][k - 1];
                    rhs += self.thermal.au[z][j] * heaters[j][k];
                }
                for (c, channel) in self.disturbances.iter().enumerate() {
                    rhs += Expression::from_other_affine(self.thermal.aw[z][c] * channel[k]);
                }
                constraints.push(constraint!(temperatures[z][k] == rhs));
            }
        }

        // Comfort: occupancy-weighted quadratic deviation plus a worst
        // case term across zones and steps.
        let mut comfort = Expression::from_other_affine(0.0);
        let mut peak_terms = Vec::new();
        for (z, zone) in self.zones.iter().enumerate() {
            let priority = zone.device.priority as f64;
            let t_min = zone.params.min_setpoint_c.min(zone.initial_temperature_c);
            let t_max = zone.params.max_setpoint_c.max(zone.initial_temperature_c);
            for k in 0..n {
                let weight = priority * zone.occupancy[k];
                if weight <= 0.0 {
                    continue;
                }
                let target = zone.setpoints_c[k];
                let radius =
                    ((target - t_min).abs()).max((target - t_max).abs()) / NORM_FACTOR_C;
                let error = deviation(target, temperatures[z][k], NORM_FACTOR_C);
                comfort +=
                    quadratic_penalty(vars, &mut constraints, error.clone(), radius, weight);
                peak_terms.push((weight, error));
            }
        }
        comfort += PEAK_WEIGHT * weighted_max_abs(vars, &mut constraints, &peak_terms);

        let dispatch_kw: Vec<Expression> = (0..n)
            .map(|k| {
                let mut total = Expression::from_other_affine(0.0);
                for heater in &heaters {
                    total += Expression::from(heater[k]);
                }
                total
            })
            .collect();

        let mut series = Vec::new();
        for (z, zone) in self.zones.iter().enumerate() {
            // The planned temperature trajectory doubles as the commanded
            // thermostat setpoint; flagged for review downstream.
            series.push(PlannedSeries {
                entity_id: zone.device.entity_id.clone(),
                kind: DeviceKind::SpaceHeating,
                signal: Signal::SetpointC,
                is_control: true,
                steps: (0..n)
                    .map(|k| Expression::from(temperatures[z][k]))
                    .collect(),
            });
            series.push(PlannedSeries {
                entity_id: zone.device.entity_id.clone(),
                kind: DeviceKind::SpaceHeating,
                signal: Signal::PowerW,
                is_control: false,
                steps: (0..n).map(|k| 1000.0 * heaters[z][k]).collect(),
            });
        }

        Ok(Formulation {
            comfort,
            constraints,
            dispatch_kw,
            series,
            guards: Vec::new(),
            has_binaries: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn zone(entity_id: &str, priority: i64, n: usize) -> Zone {
        let device: Device = serde_json::from_value(serde_json::json!({
            "entity_id": entity_id,
            "kind": "space_heating",
            "priority": priority
        }))
        .unwrap();
        let params = match &device.params {
            DeviceParams::SpaceHeating(p) => p.clone(),
            _ => unreachable!(),
        };
        Zone {
            device,
            params,
            initial_temperature_c: 20.0,
            setpoints_c: vec![21.0; n],
            occupancy: vec![1.0; n],
        }
    }

    fn horizon(steps: i64) -> Horizon {
        let start = Utc.with_ymd_and_hms(2025, 5, 26, 19, 0, 0).unwrap();
        Horizon::new(start, start + Duration::minutes(10 * steps), 10).unwrap()
    }

    fn model(n: usize) -> SpaceHeatingModel {
        SpaceHeatingModel {
            zones: vec![zone("tz_living", 5, n), zone("tz_bedroom", 3, n)],
            thermal: ThermalModel {
                ax: vec![vec![0.9, 0.05], vec![0.05, 0.9]],
                au: vec![vec![0.5, 0.0], vec![0.0, 0.5]],
                aw: vec![vec![0.02], vec![0.02]],
                learned_at: Utc::now(),
            },
            disturbances: vec![vec![-5.0; n]],
        }
    }

    #[test]
    fn formulation_emits_setpoint_controls_per_zone() {
        let m = model(4);
        let mut vars = ProblemVariables::new();
        let f = m.formulate(&horizon(4), &mut vars).unwrap();
        assert_eq!(f.dispatch_kw.len(), 4);
        let controls: Vec<_> = f.series.iter().filter(|s| s.is_control).collect();
        assert_eq!(controls.len(), 2);
        assert!(controls.iter().all(|s| s.signal == Signal::SetpointC));
        assert!(!f.has_binaries);
    }

    #[test]
    fn unoccupied_steps_carry_no_comfort_weight() {
        let mut m = model(3);
        for zone in &mut m.zones {
            zone.occupancy = vec![0.0; 3];
        }
        let mut vars = ProblemVariables::new();
        // All weights zero: the formulation still builds, with comfort
        // reduced to the (empty) peak term.
        m.formulate(&horizon(3), &mut vars).unwrap();
    }
}
