//! Stationary battery sub-model.
//!
//! Split charge/discharge decisions drive the residual-energy state
//! through a decay-and-efficiency balance. Charge/discharge exclusivity
//! is deliberately relaxed: with round-trip losses and nonnegative prices
//! a simultaneous nonzero pair is never optimal, so no binary is spent on
//! it; the interpreter still guards the solution and zeroes the smaller
//! side if one appears. Critical action is to stop charging.

use crate::core_api::CoreApi;
use crate::devices::{
    DeviceModel, ExclusivityGuard, Formulation, PlannedSeries, Signal,
};
use crate::domain::{Device, DeviceKind, DeviceParams, ElectricStorageParams, Horizon};
use crate::error::ControlError;
use crate::planner::objective::{deviation, quadratic_penalty};
use good_lp::{constraint, variable, Expression, ProblemVariables};
use tracing::{debug, warn};

pub const SOC_PREFERENCES: &str = "electric-battery-soc-preferences";

struct StorageUnit {
    device: Device,
    params: ElectricStorageParams,
    /// Initial residual energy, kWh.
    initial_energy_kwh: f64,
    /// Desired residual energy per step, kWh.
    desired_energy_kwh: Vec<f64>,
}

pub struct ElectricStorageModel {
    units: Vec<StorageUnit>,
}

impl ElectricStorageModel {
    pub async fn retrieve(
        api: &dyn CoreApi,
        devices: &[Device],
        horizon: &Horizon,
    ) -> Result<Option<Self>, ControlError> {
        let batteries: Vec<&Device> = devices
            .iter()
            .filter(|d| d.kind() == DeviceKind::ElectricStorage)
            .collect();
        if batteries.is_empty() {
            return Ok(None);
        }

        let mut units = Vec::with_capacity(batteries.len());
        for device in batteries {
            let params = match &device.params {
                DeviceParams::ElectricStorage(p) => p.clone(),
                _ => unreachable!("filtered on kind"),
            };
            let capacity = params.energy_capacity_kwh;
            let initial_pct = api
                .device_state(&device.entity_id, Some("electric_storage_soc"))
                .await?;
            let initial_energy_kwh = initial_pct / 100.0 * capacity;

            // A time-varying SoC target comes from preferences when the
            // Core API has one; the static desired state covers the rest.
            let desired_energy_kwh = match api
                .preferences(SOC_PREFERENCES, &device.entity_id, horizon.start, horizon.stop)
                .await
                .ok()
                .and_then(|series| series.dense(horizon, "battery soc preferences").ok())
            {
                Some(pcts) => pcts.iter().map(|p| p / 100.0 * capacity).collect(),
                None => {
                    debug!(entity_id = %device.entity_id,
                           "no soc preference series, using configured desired state");
                    vec![params.desired_state_pct / 100.0 * capacity; horizon.steps()]
                }
            };

            units.push(StorageUnit {
                device: device.clone(),
                params,
                initial_energy_kwh,
                desired_energy_kwh,
            });
        }
        Ok(Some(Self { units }))
    }
}

impl DeviceModel for ElectricStorageModel {
    fn kind(&self) -> DeviceKind {
        DeviceKind::ElectricStorage
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
        let mut guards = Vec::new();

        for unit in &self.units {
            let p = &unit.params;
            let capacity = p.energy_capacity_kwh;
            let mut e_min = p.min_residual_energy_pct / 100.0 * capacity;
            let mut e_max = p.max_residual_energy_pct / 100.0 * capacity;
            if unit.initial_energy_kwh > e_max {
                warn!(entity_id = %unit.device.entity_id, initial = unit.initial_energy_kwh,
                      max = e_max, "initial battery energy above maximum, widening bound");
                e_max = capacity;
            }
            if unit.initial_energy_kwh < e_min {
                warn!(entity_id = %unit.device.entity_id, initial = unit.initial_energy_kwh,
                      min = e_min, "initial battery energy below minimum, widening bound");
                e_min = 0.0;
            }

            let charge = vars.add_vector(variable().min(0.0).max(p.power_capacity_kw), n);
            let discharge = vars.add_vector(variable().min(0.0).max(p.power_capacity_kw), n);
            let energy = vars.add_vector(variable().min(0.0), n + 1);

            constraints.push(constraint!(energy[0] == unit.initial_energy_kwh));
            for k in 0..=n {
                constraints.push(constraint!(energy[k] >= e_min));
                constraints.push(constraint!(energy[k] <= e_max));
            }
            if let Some(final_pct) = p.final_soc_requirement_pct {
                constraints.push(constraint!(energy[n] >= final_pct / 100.0 * capacity));
            }

            for k in 0..n {
                constraints.push(constraint!(
                    energy[k + 1]
                        == p.decay_factor * energy[k]
                            + (p.charging_efficiency * dt) * charge[k]
                            + (-dt / p.discharging_efficiency) * discharge[k]
                ));
            }

            let weight = unit.device.priority as f64;
            for k in 0..n {
                let desired = unit.desired_energy_kwh[k];
                let radius =
                    ((desired - e_min).abs()).max((desired - e_max).abs()) / capacity;
                let error = deviation(desired, energy[k], capacity);
                comfort += quadratic_penalty(vars, &mut constraints, error, radius, weight);
            }

            for k in 0..n {
                dispatch_kw[k] += charge[k] - discharge[k];
            }
            series.push(PlannedSeries {
                entity_id: unit.device.entity_id.clone(),
                kind: DeviceKind::ElectricStorage,
                signal: Signal::PowerW,
                is_control: true,
                steps: (0..n)
                    .map(|k| 1000.0 * charge[k] - 1000.0 * discharge[k])
                    .collect(),
            });
            series.push(PlannedSeries {
                entity_id: unit.device.entity_id.clone(),
                kind: DeviceKind::ElectricStorage,
                signal: Signal::SocWh,
                is_control: false,
                steps: (1..=n).map(|k| 1000.0 * energy[k]).collect(),
            });
            guards.push(ExclusivityGuard {
                entity_id: unit.device.entity_id.clone(),
                charge_kw: charge,
                discharge_kw: discharge,
            });
        }

        Ok(Formulation {
            comfort,
            constraints,
            dispatch_kw,
            series,
            guards,
            has_binaries: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn unit(initial_pct: f64) -> StorageUnit {
        let device: Device = serde_json::from_value(serde_json::json!({
            "entity_id": "battery_1",
            "kind": "electric_storage",
            "priority": 13
        }))
        .unwrap();
        let params = match &device.params {
            DeviceParams::ElectricStorage(p) => p.clone(),
            _ => unreachable!(),
        };
        let capacity = params.energy_capacity_kwh;
        StorageUnit {
            device,
            params,
            initial_energy_kwh: initial_pct / 100.0 * capacity,
            desired_energy_kwh: vec![0.9 * capacity; 4],
        }
    }

    fn horizon() -> Horizon {
        let start = Utc.with_ymd_and_hms(2025, 5, 26, 19, 0, 0).unwrap();
        Horizon::new(start, start + Duration::minutes(40), 10).unwrap()
    }

    #[test]
    fn formulation_exposes_exclusivity_guard() {
        let model = ElectricStorageModel {
            units: vec![unit(50.0)],
        };
        let mut vars = ProblemVariables::new();
        let f = model.formulate(&horizon(), &mut vars).unwrap();
        assert_eq!(f.guards.len(), 1);
        assert_eq!(f.guards[0].charge_kw.len(), 4);
        assert_eq!(f.dispatch_kw.len(), 4);
        assert!(!f.has_binaries);
    }

    #[test]
    fn out_of_band_initial_soc_widens_bounds() {
        // 10% initial is below the default 30% floor; formulation must
        // not pin an infeasible initial state.
        let model = ElectricStorageModel {
            units: vec![unit(10.0)],
        };
        let mut vars = ProblemVariables::new();
        model.formulate(&horizon(), &mut vars).unwrap();
    }
}
