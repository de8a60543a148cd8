pub mod schedule;
pub mod series;
pub mod thermal;
pub mod types;

pub use schedule::{DispatchSchedule, ScheduleWire};
pub use series::TimeSeries;
pub use thermal::ThermalModel;
pub use types::{
    Device, DeviceKind, DeviceParams, ElectricStorageParams, ElectricVehicleParams, Horizon,
    SpaceHeatingParams, WaterHeaterParams,
};
