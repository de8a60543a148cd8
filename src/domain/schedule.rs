use crate::domain::series::TimeSeries;
use crate::domain::types::Horizon;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Wire format accepted by `POST /devices/schedule/{priority}`:
/// one series of control values per entity, ISO-8601 keys.
pub type ScheduleWire = BTreeMap<String, TimeSeries>;

/// The dispatch schedule produced by one successful planning cycle.
///
/// Holds the control signal to apply per device: thermostat setpoints in
/// degrees Celsius for heating zones, powers in watts for everything else.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchSchedule {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub priority: i64,
    pub horizon: Horizon,
    pub controls: ScheduleWire,
}

impl DispatchSchedule {
    pub fn new(priority: i64, horizon: Horizon) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            priority,
            horizon,
            controls: BTreeMap::new(),
        }
    }

    pub fn add_control(&mut self, entity_id: &str, series: TimeSeries) {
        self.controls.insert(entity_id.to_string(), series);
    }

    /// Body posted to the Core API.
    pub fn wire_body(&self) -> serde_json::Value {
        serde_json::to_value(&self.controls).unwrap_or_else(|_| serde_json::json!({}))
    }

    /// Control value for a device at an instant, piecewise constant.
    pub fn control_at(&self, entity_id: &str, at: DateTime<Utc>) -> Option<f64> {
        self.controls.get(entity_id).and_then(|s| s.value_at(at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn wire_body_maps_entities_to_timestamped_values() {
        let start = Utc.with_ymd_and_hms(2025, 5, 26, 19, 0, 0).unwrap();
        let horizon = Horizon::new(start, start + Duration::minutes(20), 10).unwrap();
        let mut schedule = DispatchSchedule::new(25, horizon);
        schedule.add_control(
            "water_heater_1",
            TimeSeries::on_grid(&horizon, &[4500.0, 0.0]),
        );

        let body = schedule.wire_body();
        let series = body.get("water_heater_1").unwrap().as_object().unwrap();
        assert_eq!(series.len(), 2);
        assert_eq!(
            schedule.control_at("water_heater_1", start + Duration::minutes(15)),
            Some(4500.0)
        );
    }
}
