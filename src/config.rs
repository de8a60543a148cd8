use crate::error::ControlError;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use validator::Validate;

/// Environment variables recognized by [`AppConfig::load`].
const ENV_KEYS: &[&str] = &[
    "LOGLEVEL",
    "MPC_PRIORITY",
    "RTL_TICK_PERIOD_S",
    "RTL_SAFETY_MARGIN_KW",
    "RTL_ANTIREBOUND_DEFAULT_S",
    "RTL_ANTIREBOUND_BATTERY_S",
    "THERMAL_MODEL_PATH",
    "THERMAL_MODEL_TTL_H",
    "THERMAL_LOOKBACK_DAYS",
    "CORE_API_URL",
    "BUS_URL",
    "TSDB_URL",
    "HTTP_TIMEOUT_S",
    "PLANNER_LEAD_MINUTES",
];

/// Application configuration.
///
/// Field names match the (lowercased) environment variables; an optional
/// `hem-controller.toml` provides file-based overrides for development.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct AppConfig {
    #[serde(default = "default_loglevel")]
    pub loglevel: String,

    /// Priority tag applied to posted dispatch schedules.
    #[serde(default = "default_mpc_priority")]
    pub mpc_priority: i64,

    #[serde(default = "default_tick_period")]
    #[validate(range(min = 1, max = 3600))]
    pub rtl_tick_period_s: u64,

    #[serde(default = "default_safety_margin")]
    #[validate(range(min = 0.0))]
    pub rtl_safety_margin_kw: f64,

    #[serde(default = "default_antirebound_default")]
    pub rtl_antirebound_default_s: u64,

    #[serde(default = "default_antirebound_battery")]
    pub rtl_antirebound_battery_s: u64,

    #[serde(default = "default_thermal_model_path")]
    pub thermal_model_path: PathBuf,

    /// Hours before a persisted thermal model is considered stale.
    #[serde(default = "default_thermal_ttl")]
    #[validate(range(min = 1, max = 720))]
    pub thermal_model_ttl_h: i64,

    /// Days of telemetry used when (re)learning the thermal model.
    #[serde(default = "default_lookback_days")]
    #[validate(range(min = 1, max = 90))]
    pub thermal_lookback_days: i64,

    #[serde(default = "default_core_api_url")]
    #[validate(url)]
    pub core_api_url: String,

    #[serde(default = "default_bus_url")]
    pub bus_url: String,

    /// Postgres/Timescale connection string; result series are only
    /// logged when unset.
    #[serde(default)]
    pub tsdb_url: Option<String>,

    #[serde(default = "default_http_timeout")]
    #[validate(range(min = 1, max = 300))]
    pub http_timeout_s: u64,

    /// How early the planner job runs before the horizon start.
    #[serde(default = "default_planner_lead")]
    #[validate(range(min = 0, max = 120))]
    pub planner_lead_minutes: i64,
}

fn default_loglevel() -> String {
    "INFO".to_string()
}
fn default_mpc_priority() -> i64 {
    25
}
fn default_tick_period() -> u64 {
    1
}
fn default_safety_margin() -> f64 {
    0.5
}
fn default_antirebound_default() -> u64 {
    5
}
fn default_antirebound_battery() -> u64 {
    30
}
fn default_thermal_model_path() -> PathBuf {
    PathBuf::from("data/thermal_model/latest.json")
}
fn default_thermal_ttl() -> i64 {
    24
}
fn default_lookback_days() -> i64 {
    10
}
fn default_core_api_url() -> String {
    "http://localhost:8000".to_string()
}
fn default_bus_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}
fn default_http_timeout() -> u64 {
    30
}
fn default_planner_lead() -> i64 {
    10
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            loglevel: default_loglevel(),
            mpc_priority: default_mpc_priority(),
            rtl_tick_period_s: default_tick_period(),
            rtl_safety_margin_kw: default_safety_margin(),
            rtl_antirebound_default_s: default_antirebound_default(),
            rtl_antirebound_battery_s: default_antirebound_battery(),
            thermal_model_path: default_thermal_model_path(),
            thermal_model_ttl_h: default_thermal_ttl(),
            thermal_lookback_days: default_lookback_days(),
            core_api_url: default_core_api_url(),
            bus_url: default_bus_url(),
            tsdb_url: None,
            http_timeout_s: default_http_timeout(),
            planner_lead_minutes: default_planner_lead(),
        }
    }
}

impl AppConfig {
    /// Load configuration from `hem-controller.toml` (if present) overlaid
    /// with environment variables. Invalid configuration is the only fatal
    /// startup error.
    pub fn load() -> Result<Self, ControlError> {
        let config: AppConfig = Figment::new()
            .merge(Toml::file("hem-controller.toml"))
            .merge(Env::raw().only(ENV_KEYS))
            .extract()
            .map_err(|e| ControlError::ConfigInvalid(e.to_string()))?;
        config
            .validate()
            .map_err(|e| ControlError::ConfigInvalid(e.to_string()))?;
        Ok(config)
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_secs(self.rtl_tick_period_s.max(1))
    }

    pub fn antirebound_default(&self) -> Duration {
        Duration::from_secs(self.rtl_antirebound_default_s)
    }

    pub fn antirebound_battery(&self) -> Duration {
        Duration::from_secs(self.rtl_antirebound_battery_s)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_s)
    }

    pub fn thermal_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.thermal_model_ttl_h)
    }

    pub fn planner_lead(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.planner_lead_minutes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_spec() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.loglevel, "INFO");
        assert_eq!(cfg.rtl_tick_period_s, 1);
        assert!((cfg.rtl_safety_margin_kw - 0.5).abs() < f64::EPSILON);
        assert_eq!(cfg.rtl_antirebound_default_s, 5);
        assert_eq!(cfg.rtl_antirebound_battery_s, 30);
        assert_eq!(cfg.thermal_model_ttl_h, 24);
        assert_eq!(cfg.mpc_priority, 25);
        cfg.validate().expect("defaults must validate");
    }

    #[test]
    fn rejects_zero_tick_period() {
        let cfg = AppConfig {
            rtl_tick_period_s: 0,
            ..AppConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
