//! Device model library.
//!
//! Each controllable device class contributes the same four things to a
//! planning cycle: comfort objective terms, operating constraints, a
//! dispatch expression (its instantaneous grid draw in kW) and the result
//! series to extract after the solve. The real-time limiter additionally
//! relies on every device's critical action, which lives on
//! [`crate::domain::Device`].
//!
//! Sub-models are tagged variants behind the [`DeviceModel`] contract; the
//! registry in [`retrieve_models`] instantiates the enabled ones from the
//! Core API inventory.

pub mod electric_storage;
pub mod electric_vehicle;
pub mod space_heating;
pub mod water_heater;

use crate::core_api::CoreApi;
use crate::domain::{Device, DeviceKind, Horizon, ThermalModel};
use crate::error::ControlError;
use good_lp::{Constraint, Expression, ProblemVariables, Variable};
use tracing::info;

/// Which device classes a planning request enables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnabledKinds {
    pub space_heating: bool,
    pub electric_storage: bool,
    pub electric_vehicle: bool,
    pub water_heater: bool,
}

impl EnabledKinds {
    pub fn all() -> Self {
        Self {
            space_heating: true,
            electric_storage: true,
            electric_vehicle: true,
            water_heater: true,
        }
    }

    pub fn allows(&self, kind: DeviceKind) -> bool {
        match kind {
            DeviceKind::SpaceHeating => self.space_heating,
            DeviceKind::WaterHeater => self.water_heater,
            DeviceKind::ElectricStorage => self.electric_storage,
            DeviceKind::ElectricVehicleV1g => self.electric_vehicle,
        }
    }
}

/// Physical quantity of a planned result series, named after the TSDB
/// field it is persisted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    PowerW,
    TemperatureC,
    SetpointC,
    SocWh,
}

impl Signal {
    pub fn field(&self) -> &'static str {
        match self {
            Signal::PowerW => "power_w",
            Signal::TemperatureC => "temperature_c",
            Signal::SetpointC => "setpoint_c",
            Signal::SocWh => "soc_wh",
        }
    }
}

/// A result series to evaluate from the solved problem: one expression
/// per horizon step, already scaled to the signal unit. Control series
/// (`is_control`) become the posted dispatch schedule.
#[derive(Debug)]
pub struct PlannedSeries {
    pub entity_id: String,
    pub kind: DeviceKind,
    pub signal: Signal,
    pub is_control: bool,
    pub steps: Vec<Expression>,
}

/// Charge/discharge pairs whose exclusivity is relaxed in the program;
/// the interpreter zeroes the smaller side if both come back nonzero.
#[derive(Debug)]
pub struct ExclusivityGuard {
    pub entity_id: String,
    pub charge_kw: Vec<Variable>,
    pub discharge_kw: Vec<Variable>,
}

/// Everything one sub-model contributes to the global program.
pub struct Formulation {
    pub comfort: Expression,
    pub constraints: Vec<Constraint>,
    /// Instantaneous grid draw per step in kW, positive for consumption.
    pub dispatch_kw: Vec<Expression>,
    pub series: Vec<PlannedSeries>,
    pub guards: Vec<ExclusivityGuard>,
    /// Whether the formulation introduced binary variables.
    pub has_binaries: bool,
}

pub trait DeviceModel: Send + Sync {
    fn kind(&self) -> DeviceKind;

    fn formulate(
        &self,
        horizon: &Horizon,
        vars: &mut ProblemVariables,
    ) -> Result<Formulation, ControlError>;
}

/// Instantiate sub-models for every enabled device class present in the
/// inventory. Classes that are enabled but have no devices are skipped.
pub async fn retrieve_models(
    api: &dyn CoreApi,
    devices: &[Device],
    horizon: &Horizon,
    enabled: &EnabledKinds,
    thermal: Option<&ThermalModel>,
) -> Result<Vec<Box<dyn DeviceModel>>, ControlError> {
    let mut models: Vec<Box<dyn DeviceModel>> = Vec::new();

    if enabled.electric_storage {
        match electric_storage::ElectricStorageModel::retrieve(api, devices, horizon).await? {
            Some(model) => models.push(Box::new(model)),
            None => info!("no electric storage devices found, skipping sub-model"),
        }
    }
    if enabled.electric_vehicle {
        match electric_vehicle::ElectricVehicleModel::retrieve(api, devices, horizon).await? {
            Some(model) => models.push(Box::new(model)),
            None => info!("no electric vehicle devices found, skipping sub-model"),
        }
    }
    if enabled.water_heater {
        match water_heater::WaterHeaterModel::retrieve(api, devices, horizon).await? {
            Some(model) => models.push(Box::new(model)),
            None => info!("no water heater devices found, skipping sub-model"),
        }
    }
    if enabled.space_heating {
        if let Some(thermal) = thermal {
            match space_heating::SpaceHeatingModel::retrieve(api, devices, horizon, thermal)
                .await?
            {
                Some(model) => models.push(Box::new(model)),
                None => info!("no space heating devices found, skipping sub-model"),
            }
        } else {
            info!("space heating enabled but no thermal model available, skipping sub-model");
        }
    }

    Ok(models)
}
