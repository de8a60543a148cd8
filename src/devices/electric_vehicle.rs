//! Unidirectional (V1G) electric vehicle sub-model.
//!
//! Charging is a binary gate per step: the charger either runs at full
//! power or not at all, and only while the vehicle is plugged in
//! according to the known connection profile. This is the only sub-model
//! that introduces binaries, turning the global program mixed-integer.
//! Critical action is to stop charging.

use crate::core_api::CoreApi;
use crate::devices::{DeviceModel, Formulation, PlannedSeries, Signal};
use crate::domain::{Device, DeviceKind, DeviceParams, ElectricVehicleParams, Horizon};
use crate::error::ControlError;
use crate::planner::objective::{deviation, quadratic_penalty};
use good_lp::{constraint, variable, Expression, ProblemVariables};
use tracing::{debug, warn};

pub const CONNECTION_PREFERENCES: &str = "vehicle-branched-preferences";
pub const SOC_PREFERENCES: &str = "vehicle-soc-preferences";

struct VehicleUnit {
    device: Device,
    params: ElectricVehicleParams,
    initial_energy_kwh: f64,
    /// Plugged-in profile, exactly 0.0 or 1.0 per step.
    connected: Vec<f64>,
    desired_energy_kwh: Vec<f64>,
}

pub struct ElectricVehicleModel {
    units: Vec<VehicleUnit>,
}

impl ElectricVehicleModel {
    pub async fn retrieve(
        api: &dyn CoreApi,
        devices: &[Device],
        horizon: &Horizon,
    ) -> Result<Option<Self>, ControlError> {
        let vehicles: Vec<&Device> = devices
            .iter()
            .filter(|d| d.kind() == DeviceKind::ElectricVehicleV1g)
            .collect();
        if vehicles.is_empty() {
            return Ok(None);
        }

        let mut units = Vec::with_capacity(vehicles.len());
        for device in vehicles {
            let params = match &device.params {
                DeviceParams::ElectricVehicleV1g(p) => p.clone(),
                _ => unreachable!("filtered on kind"),
            };
            let capacity = params.energy_capacity_kwh;
            let initial_pct = api
                .device_state(&device.entity_id, Some("electric_vehicle_soc"))
                .await?;
            let connected = api
                .preferences(
                    CONNECTION_PREFERENCES,
                    &device.entity_id,
                    horizon.start,
                    horizon.stop,
                )
                .await?
                .dense(horizon, "vehicle connection profile")?;
            if connected
                .iter()
                .any(|v| (*v - 0.0).abs() > 1e-9 && (*v - 1.0).abs() > 1e-9)
            {
                return Err(ControlError::DataUnavailable(format!(
                    "connection profile for {} must contain only 0 and 1",
                    device.entity_id
                )));
            }
            let desired_energy_kwh = match api
                .preferences(SOC_PREFERENCES, &device.entity_id, horizon.start, horizon.stop)
                .await
                .ok()
                .and_then(|series| series.dense(horizon, "vehicle soc preferences").ok())
            {
                Some(pcts) => pcts.iter().map(|p| p / 100.0 * capacity).collect(),
                None => {
                    debug!(entity_id = %device.entity_id,
                           "no vehicle soc preference series, using configured desired state");
                    vec![params.desired_state_pct / 100.0 * capacity; horizon.steps()]
                }
            };

            units.push(VehicleUnit {
                device: device.clone(),
                params,
                initial_energy_kwh: initial_pct / 100.0 * capacity,
                connected,
                desired_energy_kwh,
            });
        }
        Ok(Some(Self { units }))
    }
}

impl DeviceModel for ElectricVehicleModel {
    fn kind(&self) -> DeviceKind {
        DeviceKind::ElectricVehicleV1g
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
            let capacity = p.energy_capacity_kwh;
            let mut e_min = p.min_residual_energy_pct / 100.0 * capacity;
            let mut e_max = p.max_residual_energy_pct / 100.0 * capacity;
            if unit.initial_energy_kwh > e_max {
                warn!(entity_id = %unit.device.entity_id, initial = unit.initial_energy_kwh,
                      max = e_max, "initial vehicle energy above maximum, widening bound");
                e_max = capacity;
            }
            if unit.initial_energy_kwh < e_min {
                warn!(entity_id = %unit.device.entity_id, initial = unit.initial_energy_kwh,
                      min = e_min, "initial vehicle energy below minimum, widening bound");
                e_min = 0.0;
            }

            let gate = vars.add_vector(variable().binary(), n);
            let energy = vars.add_vector(variable().min(0.0), n + 1);

            constraints.push(constraint!(energy[0] == unit.initial_energy_kwh));
            for k in 0..=n {
                constraints.push(constraint!(energy[k] >= e_min));
                constraints.push(constraint!(energy[k] <= e_max));
            }
            if let Some(final_pct) = p.final_soc_requirement_pct {
                constraints.push(constraint!(energy[n] >= final_pct / 100.0 * capacity));
            }

            // Effective charge power: gate times connection times capacity.
            // While disconnected the gate is forced open to zero.
            let charge_kw: Vec<Expression> = (0..n)
                .map(|k| (unit.connected[k] * p.power_capacity_kw) * gate[k])
                .collect();
            for k in 0..n {
                if unit.connected[k] == 0.0 {
                    constraints.push(constraint!(gate[k] == 0.0));
                }
                constraints.push(constraint!(
                    energy[k + 1]
                        == p.decay_factor * energy[k]
                            + (p.charging_efficiency * dt) * charge_kw[k].clone()
                ));
            }

            let weight = unit.device.priority as f64;
            for k in 0..n {
                let desired = unit.desired_energy_kwh[k];
                let radius = ((desired - e_min).abs()).max((desired - e_max).abs()) / capacity;
                let error = deviation(desired, energy[k], capacity);
                comfort += quadratic_penalty(vars, &mut constraints, error, radius, weight);
            }

            for k in 0..n {
                dispatch_kw[k] += charge_kw[k].clone();
            }
            series.push(PlannedSeries {
                entity_id: unit.device.entity_id.clone(),
                kind: DeviceKind::ElectricVehicleV1g,
                signal: Signal::PowerW,
                is_control: true,
                steps: (0..n).map(|k| 1000.0 * charge_kw[k].clone()).collect(),
            });
            series.push(PlannedSeries {
                entity_id: unit.device.entity_id.clone(),
                kind: DeviceKind::ElectricVehicleV1g,
                signal: Signal::SocWh,
                is_control: false,
                steps: (1..=n).map(|k| 1000.0 * energy[k]).collect(),
            });
        }

        Ok(Formulation {
            comfort,
            constraints,
            dispatch_kw,
            series,
            guards: Vec::new(),
            has_binaries: true,
        })
    }
}
