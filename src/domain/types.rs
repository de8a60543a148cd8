use crate::error::ControlError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Controllable device classes known to the planner and the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    SpaceHeating,
    WaterHeater,
    ElectricStorage,
    ElectricVehicleV1g,
}

impl DeviceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::SpaceHeating => "space_heating",
            DeviceKind::WaterHeater => "water_heater",
            DeviceKind::ElectricStorage => "electric_storage",
            DeviceKind::ElectricVehicleV1g => "electric_vehicle_v1g",
        }
    }
}

/// A device as reported by the Core API inventory.
///
/// Devices are immutable within a planning cycle; the kind-specific
/// parameters ride along in the same JSON object, discriminated by the
/// `kind` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub entity_id: String,
    /// Higher values mean more important; the limiter curtails the lowest
    /// priority first.
    pub priority: i64,
    /// Kind-specific fallback override; [`Device::critical_action`]
    /// supplies the default when absent.
    #[serde(default)]
    pub critical_action: Option<f64>,
    #[serde(flatten)]
    pub params: DeviceParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviceParams {
    SpaceHeating(SpaceHeatingParams),
    WaterHeater(WaterHeaterParams),
    ElectricStorage(ElectricStorageParams),
    ElectricVehicleV1g(ElectricVehicleParams),
}

impl Device {
    pub fn kind(&self) -> DeviceKind {
        match self.params {
            DeviceParams::SpaceHeating(_) => DeviceKind::SpaceHeating,
            DeviceParams::WaterHeater(_) => DeviceKind::WaterHeater,
            DeviceParams::ElectricStorage(_) => DeviceKind::ElectricStorage,
            DeviceParams::ElectricVehicleV1g(_) => DeviceKind::ElectricVehicleV1g,
        }
    }

    /// Minimum-impact fallback written by the real-time limiter: minimum
    /// setpoint for heating zones, zero power for everything else.
    pub fn critical_action(&self) -> f64 {
        if let Some(action) = self.critical_action {
            return action;
        }
        match &self.params {
            DeviceParams::SpaceHeating(p) => p.min_setpoint_c,
            DeviceParams::WaterHeater(_) => 0.0,
            DeviceParams::ElectricStorage(_) => 0.0,
            DeviceParams::ElectricVehicleV1g(_) => 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpaceHeatingParams {
    #[serde(default = "defaults::min_setpoint_c")]
    pub min_setpoint_c: f64,
    #[serde(default = "defaults::max_setpoint_c")]
    pub max_setpoint_c: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaterHeaterParams {
    #[serde(default = "defaults::tank_volume_l")]
    pub tank_volume_l: f64,
    #[serde(default = "defaults::wh_min_temperature_c")]
    pub min_temperature_c: f64,
    #[serde(default = "defaults::wh_max_temperature_c")]
    pub max_temperature_c: f64,
    #[serde(default = "defaults::inlet_temperature_c")]
    pub inlet_temperature_c: f64,
    #[serde(default = "defaults::wh_desired_temperature_c")]
    pub desired_temperature_c: f64,
    #[serde(default = "defaults::wh_power_capacity_kw")]
    pub power_capacity_kw: f64,
    /// Volumetric heat capacity of water, Wh per degree Celsius per litre.
    #[serde(default = "defaults::heater_constant")]
    pub heater_constant_wh_per_c_l: f64,
    /// Identifier of the thermal zone the tank stands in, when known.
    #[serde(default)]
    pub thermal_zone: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectricStorageParams {
    #[serde(default = "defaults::bs_energy_capacity_kwh")]
    pub energy_capacity_kwh: f64,
    #[serde(default = "defaults::bs_power_capacity_kw")]
    pub power_capacity_kw: f64,
    #[serde(default = "defaults::bs_efficiency")]
    pub charging_efficiency: f64,
    #[serde(default = "defaults::bs_efficiency")]
    pub discharging_efficiency: f64,
    #[serde(default = "defaults::bs_decay_factor")]
    pub decay_factor: f64,
    #[serde(default = "defaults::bs_min_residual_pct")]
    pub min_residual_energy_pct: f64,
    #[serde(default = "defaults::bs_max_residual_pct")]
    pub max_residual_energy_pct: f64,
    #[serde(default = "defaults::bs_desired_pct")]
    pub desired_state_pct: f64,
    #[serde(default)]
    pub final_soc_requirement_pct: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectricVehicleParams {
    #[serde(default = "defaults::ev_energy_capacity_kwh")]
    pub energy_capacity_kwh: f64,
    #[serde(default = "defaults::ev_power_capacity_kw")]
    pub power_capacity_kw: f64,
    #[serde(default = "defaults::ev_charging_efficiency")]
    pub charging_efficiency: f64,
    #[serde(default = "defaults::ev_decay_factor")]
    pub decay_factor: f64,
    #[serde(default = "defaults::ev_min_residual_pct")]
    pub min_residual_energy_pct: f64,
    #[serde(default = "defaults::ev_max_residual_pct")]
    pub max_residual_energy_pct: f64,
    #[serde(default = "defaults::ev_desired_pct")]
    pub desired_state_pct: f64,
    #[serde(default)]
    pub final_soc_requirement_pct: Option<f64>,
}

mod defaults {
    pub fn min_setpoint_c() -> f64 {
        15.0
    }
    pub fn max_setpoint_c() -> f64 {
        25.0
    }
    pub fn tank_volume_l() -> f64 {
        270.0
    }
    pub fn wh_min_temperature_c() -> f64 {
        30.0
    }
    pub fn wh_max_temperature_c() -> f64 {
        90.0
    }
    pub fn inlet_temperature_c() -> f64 {
        16.0
    }
    pub fn wh_desired_temperature_c() -> f64 {
        90.0
    }
    pub fn wh_power_capacity_kw() -> f64 {
        4.5
    }
    pub fn heater_constant() -> f64 {
        4190.0 / 3600.0
    }
    pub fn bs_energy_capacity_kwh() -> f64 {
        15.0
    }
    pub fn bs_power_capacity_kw() -> f64 {
        4.5
    }
    pub fn bs_efficiency() -> f64 {
        0.98
    }
    pub fn bs_decay_factor() -> f64 {
        0.995
    }
    pub fn bs_min_residual_pct() -> f64 {
        30.0
    }
    pub fn bs_max_residual_pct() -> f64 {
        95.0
    }
    pub fn bs_desired_pct() -> f64 {
        90.0
    }
    pub fn ev_energy_capacity_kwh() -> f64 {
        60.0
    }
    pub fn ev_power_capacity_kw() -> f64 {
        7.2
    }
    pub fn ev_charging_efficiency() -> f64 {
        0.99
    }
    pub fn ev_decay_factor() -> f64 {
        0.99
    }
    pub fn ev_min_residual_pct() -> f64 {
        25.0
    }
    pub fn ev_max_residual_pct() -> f64 {
        95.0
    }
    pub fn ev_desired_pct() -> f64 {
        90.0
    }
}

/// Discrete optimization horizon: `[start, stop)` divided into `N` steps
/// of equal duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Horizon {
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
    pub interval_minutes: i64,
}

impl Horizon {
    pub fn new(
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
        interval_minutes: i64,
    ) -> Result<Self, ControlError> {
        if stop <= start {
            return Err(ControlError::HorizonInvalid(format!(
                "stop {stop} must be after start {start}"
            )));
        }
        if interval_minutes <= 0 {
            return Err(ControlError::HorizonInvalid(format!(
                "interval must be positive, got {interval_minutes} minutes"
            )));
        }
        let span = stop - start;
        let interval = Duration::minutes(interval_minutes);
        let steps = span.num_minutes() / interval_minutes;
        if interval * steps as i32 != span {
            return Err(ControlError::HorizonInvalid(format!(
                "interval of {interval_minutes} minutes does not divide the {} minute range",
                span.num_minutes()
            )));
        }
        Ok(Self {
            start,
            stop,
            interval_minutes,
        })
    }

    /// Number of discrete steps `N`.
    pub fn steps(&self) -> usize {
        ((self.stop - self.start).num_minutes() / self.interval_minutes) as usize
    }

    pub fn interval(&self) -> Duration {
        Duration::minutes(self.interval_minutes)
    }

    /// Step duration in hours, for power-to-energy conversion.
    pub fn dt_hours(&self) -> f64 {
        self.interval_minutes as f64 / 60.0
    }

    /// Timestamp of step `k` (the left edge of the step).
    pub fn timestamp(&self, k: usize) -> DateTime<Utc> {
        self.start + self.interval() * k as i32
    }

    pub fn timestamps(&self) -> impl Iterator<Item = DateTime<Utc>> + '_ {
        (0..self.steps()).map(move |k| self.timestamp(k))
    }
}
