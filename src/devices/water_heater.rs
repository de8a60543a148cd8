//! Water heater sub-model.
//!
//! One continuous power decision per step drives the tank temperature
//! state through a per-step energy balance covering the heating element,
//! the hot-water draw and the standing loss to the surrounding zone. The
//! comfort objective penalizes deviation from the desired tank
//! temperature; the critical action is power off.

use crate::core_api::CoreApi;
use crate::devices::{DeviceModel, Formulation, PlannedSeries, Signal};
use crate::domain::{Device, DeviceKind, DeviceParams, Horizon, WaterHeaterParams};
use crate::error::ControlError;
use crate::planner::objective::{deviation, quadratic_penalty};
use good_lp::{constraint, variable, Expression, ProblemVariables};
use tracing::warn;

pub const CONSUMPTION_PREFERENCES: &str = "water-heater-consumption-preferences";

/// Temperature deviation normalization, degrees.
const NORM_FACTOR_C: f64 = 50.0;
/// Standing loss to the ambient zone, W per degree.
const STANDING_LOSS_W_PER_C: f64 = 2.0;
/// Fallback ambient temperature when the tank has no associated zone.
const DEFAULT_AMBIENT_C: f64 = 20.0;

struct TankUnit {
    device: Device,
    params: WaterHeaterParams,
    initial_temperature_c: f64,
    ambient_temperature_c: f64,
    /// Hot water drawn per step, litres.
    draw_l_per_step: Vec<f64>,
}

pub struct WaterHeaterModel {
    units: Vec<TankUnit>,
}

impl WaterHeaterModel {
    pub async fn retrieve(
        api: &dyn CoreApi,
        devices: &[Device],
        horizon: &Horizon,
    ) -> Result<Option<Self>, ControlError> {
        let tanks: Vec<&Device> = devices
            .iter()
            .filter(|d| d.kind() == DeviceKind::WaterHeater)
            .collect();
        if tanks.is_empty() {
            return Ok(None);
        }

        let mut units = Vec::with_capacity(tanks.len());
        for device in tanks {
            let params = match &device.params {
                DeviceParams::WaterHeater(p) => p.clone(),
                _ => unreachable!("filtered on kind"),
            };
            let initial_temperature_c = api
                .device_state(&device.entity_id, Some("water_heater_temperature"))
                .await?;
            let ambient_temperature_c = match &params.thermal_zone {
                Some(zone) => api.device_state(zone, None).await.unwrap_or_else(|_| {
                    warn!(entity_id = %device.entity_id, zone = %zone,
                          "ambient zone state unavailable, using default");
                    DEFAULT_AMBIENT_C
                }),
                None => {
                    warn!(entity_id = %device.entity_id,
                          "no thermal zone associated with tank, using default ambient");
                    DEFAULT_AMBIENT_C
                }
            };
            let draw_l_per_step = api
                .preferences(
                    CONSUMPTION_PREFERENCES,
                    &device.entity_id,
                    horizon.start,
                    horizon.stop,
                )
                .await?
                .dense(horizon, "hot water draw preferences")?;

            units.push(TankUnit {
                device: device.clone(),
                params,
                initial_temperature_c,
                ambient_temperature_c,
                draw_l_per_step,
            });
        }
        Ok(Some(Self { units }))
    }
}

impl DeviceModel for WaterHeaterModel {
    fn kind(&self) -> DeviceKind {
        DeviceKind::WaterHeater
    }

    fn formulate(
        &self,
        horizon: &Horizon,
        vars: &mut ProblemVariables,
    ) -> Result<Formulation, ControlError> {
        let n = horizon.steps();
        let dt = horizon.dt_hours();

        let mut comfort = Expression::from_other_affine(0.0);
        let mut constraints = Vec::new();
        let mut dispatch_kw = vec![Expression::from_other_affine(0.0); n];
        let mut series = Vec::new();

        for unit in &self.units {
            let p = &unit.params;
            let mut t_min = p.min_temperature_c;
            let mut t_max = p.max_temperature_c;
            if unit.initial_temperature_c < t_min {
                warn!(entity_id = %unit.device.entity_id, initial = unit.initial_temperature_c,
                      min = t_min, "initial tank temperature below minimum, relaxing bound");
                t_min = 0.0;
            }
            if unit.initial_temperature_c > t_max {
                warn!(entity_id = %unit.device.entity_id, initial = unit.initial_temperature_c,
                      max = t_max, "initial tank temperature above maximum, relaxing bound");
                t_max = 100.0;
            }

            let power = vars.add_vector(
                variable().min(0.0).max(p.power_capacity_kw),
                n,
            );
            let temperature = vars.add_vector(variable().min(0.0), n + 1);

            constraints.push(constraint!(temperature[0] == unit.initial_temperature_c));
            for k in 0..=n {
                constraints.push(constraint!(temperature[k] >= t_min));
                constraints.push(constraint!(temperature[k] <= t_max));
            }

            // Tank heat capacity in Wh per degree.
            let tank_capacity = p.heater_constant_wh_per_c_l * p.tank_volume_l;
            for k in 0..n {
                // Draw enters as a flow rate; a draw equal to the full tank
                // volume in one step stays finite.
                let flow_l_per_h = unit.draw_l_per_step[k] / dt;
                let draw_coupling = p.heater_constant_wh_per_c_l * flow_l_per_h;
                let retained =
                    1.0 - dt * (draw_coupling + STANDING_LOSS_W_PER_C) / tank_capacity;
                let heater_gain = dt * 1000.0 / tank_capacity;
                let inflow = dt
                    * (draw_coupling * p.inlet_temperature_c
                        + STANDING_LOSS_W_PER_C * unit.ambient_temperature_c)
                    / tank_capacity;
                constraints.push(constraint!(
                    temperature[k + 1]
                        == Expression::from_other_affine(inflow)
                            + retained * temperature[k]
                            + heater_gain * power[k]
                ));
            }

            let weight = unit.device.priority as f64;
            let radius = ((p.desired_temperature_c - t_min).abs())
                .max((p.desired_temperature_c - t_max).abs())
                / NORM_FACTOR_C;
            for k in 0..n {
                let error = deviation(p.desired_temperature_c, temperature[k], NORM_FACTOR_C);
                comfort += quadratic_penalty(vars, &mut constraints, error, radius, weight);
            }

            for k in 0..n {
                dispatch_kw[k] += Expression::from(power[k]);
            }
            series.push(PlannedSeries {
                entity_id: unit.device.entity_id.clone(),
                kind: DeviceKind::WaterHeater,
                signal: Signal::PowerW,
                is_control: true,
                steps: (0..n).map(|k| 1000.0 * power[k]).collect(),
            });
            series.push(PlannedSeries {
                entity_id: unit.device.entity_id.clone(),
                kind: DeviceKind::WaterHeater,
                signal: Signal::TemperatureC,
                is_control: false,
                steps: (1..=n).map(|k| Expression::from(temperature[k])).collect(),
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
