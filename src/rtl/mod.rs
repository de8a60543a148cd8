//! Real-time limiter.
//!
//! A long-running task samples total building consumption once per tick
//! and compares it against the dynamic power limit minus a safety
//! margin. When the limit is threatened the least-important available
//! device is set to its critical action; per-device anti-rebound windows
//! prevent rapid cycling, and an exhausted curtailment order emits a user
//! notification. Devices are left in their last commanded state on
//! shutdown; the next planning cycle overwrites them.

use crate::bus::Notifier;
use crate::config::AppConfig;
use crate::core_api::CoreApi;
use crate::domain::{Device, DeviceKind, TimeSeries};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Lifecycle of the limiter task. Transitions are driven by the
/// dispatcher only: `Stopped -> Running -> Stopping -> Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtlPhase {
    Stopped,
    Running,
    Stopping,
}

#[derive(Debug, Clone)]
pub struct RtlSettings {
    pub tick_period: Duration,
    pub safety_margin_kw: f64,
    pub antirebound_default: Duration,
    pub antirebound_battery: Duration,
}

impl RtlSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            tick_period: cfg.tick_period(),
            safety_margin_kw: cfg.rtl_safety_margin_kw,
            antirebound_default: cfg.antirebound_default(),
            antirebound_battery: cfg.antirebound_battery(),
        }
    }
}

struct RtlDevice {
    entity_id: String,
    kind: DeviceKind,
    priority: i64,
    critical_action: f64,
    last_adjusted: Option<Instant>,
    at_critical: bool,
}

enum TickOutcome {
    Continue,
    ProfileExhausted,
}

struct Limiter {
    api: Arc<dyn CoreApi>,
    notifier: Arc<dyn Notifier>,
    settings: RtlSettings,
    devices: Vec<RtlDevice>,
    limit_profile: TimeSeries,
}

impl Limiter {
    fn new(
        api: Arc<dyn CoreApi>,
        notifier: Arc<dyn Notifier>,
        settings: RtlSettings,
        devices: Vec<Device>,
        limit_profile: TimeSeries,
    ) -> Self {
        // Curtailment walks devices from least to most important.
        let mut devices: Vec<RtlDevice> = devices
            .into_iter()
            .map(|d| RtlDevice {
                critical_action: d.critical_action(),
                kind: d.kind(),
                priority: d.priority,
                entity_id: d.entity_id,
                last_adjusted: None,
                at_critical: false,
            })
            .collect();
        devices.sort_by_key(|d| d.priority);
        Self {
            api,
            notifier,
            settings,
            devices,
            limit_profile,
        }
    }

    fn antirebound(&self, kind: DeviceKind) -> Duration {
        match kind {
            DeviceKind::ElectricStorage => self.settings.antirebound_battery,
            _ => self.settings.antirebound_default,
        }
    }

    async fn tick(&mut self, now: DateTime<Utc>) -> TickOutcome {
        // A failed or slow sample skips the tick; never curtail blindly.
        let total_kw = match time::timeout(
            self.settings.tick_period,
            self.api.building_consumption(),
        )
        .await
        {
            Ok(Ok(v)) => v,
            Ok(Err(e)) => {
                warn!(error = %e, "consumption sample failed, skipping tick");
                return TickOutcome::Continue;
            }
            Err(_) => {
                warn!("consumption sample timed out, skipping tick");
                return TickOutcome::Continue;
            }
        };

        let Some(limit_kw) = self.limit_profile.value_at(now) else {
            info!("no applicable power limit, stopping real-time limiter");
            return TickOutcome::ProfileExhausted;
        };

        let threshold = if limit_kw < self.settings.safety_margin_kw {
            limit_kw
        } else {
            limit_kw - self.settings.safety_margin_kw
        };
        if total_kw <= threshold {
            debug!(total_kw, limit_kw, "consumption within limit");
            return TickOutcome::Continue;
        }
        info!(total_kw, limit_kw, threshold, "limit threatened, curtailing");

        match self.next_curtailable() {
            Some(index) => self.apply_critical_action(index).await,
            None => {
                warn!(
                    total_kw,
                    limit_kw, "no curtailable devices remain, consumption still above limit"
                );
                self.notifier
                    .notify(&format!(
                        "consumption {total_kw:.2} kW exceeds limit {limit_kw:.2} kW \
                         and no curtailable devices remain"
                    ))
                    .await;
            }
        }
        TickOutcome::Continue
    }

    /// Least-important device that is not at its critical action and not
    /// inside its anti-rebound window.
    fn next_curtailable(&self) -> Option<usize> {
        let now = Instant::now();
        self.devices.iter().position(|d| {
            if d.at_critical {
                return false;
            }
            match d.last_adjusted {
                Some(at) => now.duration_since(at) >= self.antirebound(d.kind),
                None => true,
            }
        })
    }

    async fn apply_critical_action(&mut self, index: usize) {
        let device = &mut self.devices[index];
        match self
            .api
            .post_setpoint(&device.entity_id, device.critical_action)
            .await
        {
            Ok(()) => {
                info!(
                    entity_id = %device.entity_id,
                    priority = device.priority,
                    setpoint = device.critical_action,
                    "critical action applied"
                );
                device.last_adjusted = Some(Instant::now());
                device.at_critical = true;
            }
            Err(e) => {
                // A failed write is logged and the loop moves on; the
                // adjustment timestamp still starts the rebound window so
                // the next tick tries the next device.
                warn!(entity_id = %device.entity_id, error = %e, "setpoint write failed");
                device.last_adjusted = Some(Instant::now());
            }
        }
    }
}

/// Handle owned by the dispatcher.
pub struct RtlHandle {
    cancel: watch::Sender<bool>,
    phase: watch::Receiver<RtlPhase>,
    task: tokio::task::JoinHandle<()>,
}

impl RtlHandle {
    pub fn phase(&self) -> RtlPhase {
        *self.phase.borrow()
    }

    pub fn phase_watcher(&self) -> watch::Receiver<RtlPhase> {
        self.phase.clone()
    }

    /// Request cancellation and drain the task to `Stopped`. The task
    /// honors cancellation at tick boundaries; `grace` bounds the wait
    /// (two tick periods by contract).
    pub async fn stop(self, grace: Duration) {
        let _ = self.cancel.send(true);
        let mut task = self.task;
        if time::timeout(grace, &mut task).await.is_err() {
            warn!("real-time limiter did not drain in time, aborting task");
            task.abort();
            let _ = task.await;
        }
    }
}

/// Spawn the limiter. It idles in `Stopped` until `activate_at`, then
/// runs at the configured tick period until cancelled or until the limit
/// profile no longer covers the current instant.
pub fn spawn(
    api: Arc<dyn CoreApi>,
    notifier: Arc<dyn Notifier>,
    settings: RtlSettings,
    devices: Vec<Device>,
    limit_profile: TimeSeries,
    activate_at: DateTime<Utc>,
) -> RtlHandle {
    let (cancel_tx, mut cancel_rx) = watch::channel(false);
    let (phase_tx, phase_rx) = watch::channel(RtlPhase::Stopped);

    let task = tokio::spawn(async move {
        let wait = (activate_at - Utc::now()).to_std().unwrap_or_default();
        tokio::select! {
            _ = time::sleep(wait) => {}
            _ = cancel_rx.changed() => {
                let _ = phase_tx.send(RtlPhase::Stopped);
                return;
            }
        }

        info!(devices = devices.len(), "real-time limiter running");
        let _ = phase_tx.send(RtlPhase::Running);
        let mut limiter = Limiter::new(api, notifier, settings.clone(), devices, limit_profile);
        let mut ticker = time::interval(settings.tick_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel_rx.changed() => {
                    let _ = phase_tx.send(RtlPhase::Stopping);
                    break;
                }
                _ = ticker.tick() => {
                    if matches!(limiter.tick(Utc::now()).await, TickOutcome::ProfileExhausted) {
                        break;
                    }
                }
            }
        }
        let _ = phase_tx.send(RtlPhase::Stopped);
        info!("real-time limiter stopped");
    });

    RtlHandle {
        cancel: cancel_tx,
        phase: phase_rx,
        task,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ControlError;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use std::sync::Mutex;

    struct FakeApi {
        consumption_kw: Mutex<f64>,
        setpoints: Mutex<Vec<(String, f64)>>,
        fail_sample: Mutex<bool>,
    }

    impl FakeApi {
        fn new(consumption_kw: f64) -> Self {
            Self {
                consumption_kw: Mutex::new(consumption_kw),
                setpoints: Mutex::new(Vec::new()),
                fail_sample: Mutex::new(false),
            }
        }
    }

    #[async_trait]
    impl CoreApi for FakeApi {
        async fn devices(&self) -> Result<Vec<Device>, ControlError> {
            Ok(Vec::new())
        }
        async fn device_state(&self, _: &str, _: Option<&str>) -> Result<f64, ControlError> {
            Err(ControlError::DataUnavailable("unused".into()))
        }
        async fn building_consumption(&self) -> Result<f64, ControlError> {
            if *self.fail_sample.lock().unwrap() {
                return Err(ControlError::DataUnavailable("meter offline".into()));
            }
            Ok(*self.consumption_kw.lock().unwrap())
        }
        async fn preferences(
            &self,
            _: &str,
            _: &str,
            _: DateTime<Utc>,
            _: DateTime<Utc>,
        ) -> Result<TimeSeries, ControlError> {
            Err(ControlError::DataUnavailable("unused".into()))
        }
        async fn historic(
            &self,
            _: &str,
            _: DateTime<Utc>,
            _: DateTime<Utc>,
            _: Option<&str>,
        ) -> Result<TimeSeries, ControlError> {
            Err(ControlError::DataUnavailable("unused".into()))
        }
        async fn weather(
            &self,
            _: crate::core_api::WeatherScope,
            _: &str,
            _: DateTime<Utc>,
            _: DateTime<Utc>,
        ) -> Result<TimeSeries, ControlError> {
            Err(ControlError::DataUnavailable("unused".into()))
        }
        async fn non_controllable_forecast(
            &self,
            _: &str,
            _: DateTime<Utc>,
            _: DateTime<Utc>,
        ) -> Result<TimeSeries, ControlError> {
            Err(ControlError::DataUnavailable("unused".into()))
        }
        async fn post_setpoint(&self, device_id: &str, setpoint: f64) -> Result<(), ControlError> {
            self.setpoints
                .lock()
                .unwrap()
                .push((device_id.to_string(), setpoint));
            Ok(())
        }
        async fn post_schedule(&self, _: i64, _: &serde_json::Value) -> Result<(), ControlError> {
            Ok(())
        }
    }

    struct RecordingNotifier {
        messages: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, message: &str) {
            self.messages.lock().unwrap().push(message.to_string());
        }
    }

    fn settings() -> RtlSettings {
        RtlSettings {
            tick_period: Duration::from_secs(1),
            safety_margin_kw: 0.5,
            antirebound_default: Duration::from_secs(5),
            antirebound_battery: Duration::from_secs(30),
        }
    }

    fn device(entity_id: &str, kind: &str, priority: i64) -> Device {
        serde_json::from_value(serde_json::json!({
            "entity_id": entity_id,
            "kind": kind,
            "priority": priority
        }))
        .unwrap()
    }

    fn flat_limit(now: DateTime<Utc>, limit_kw: f64) -> TimeSeries {
        TimeSeries::from_points([(now - ChronoDuration::hours(1), limit_kw)])
    }

    fn limiter(api: Arc<FakeApi>, notifier: Arc<RecordingNotifier>, limit_kw: f64) -> Limiter {
        Limiter::new(
            api,
            notifier,
            settings(),
            vec![
                device("water_heater_1", "water_heater", 1),
                device("tz_living", "space_heating", 5),
            ],
            flat_limit(Utc::now(), limit_kw),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn curtails_lowest_priority_device_first() {
        let api = Arc::new(FakeApi::new(8.0));
        let notifier = Arc::new(RecordingNotifier {
            messages: Mutex::new(Vec::new()),
        });
        let mut limiter = limiter(api.clone(), notifier, 5.0);

        limiter.tick(Utc::now()).await;

        let writes = api.setpoints.lock().unwrap().clone();
        assert_eq!(writes, vec![("water_heater_1".to_string(), 0.0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn antirebound_window_protects_recently_adjusted_devices() {
        let api = Arc::new(FakeApi::new(8.0));
        let notifier = Arc::new(RecordingNotifier {
            messages: Mutex::new(Vec::new()),
        });
        let mut limiter = limiter(api.clone(), notifier, 5.0);

        limiter.tick(Utc::now()).await;
        // Simulate the water heater no longer being at critical but still
        // inside its 5 second rebound window: it must not be re-selected.
        limiter.devices[0].at_critical = false;
        *api.consumption_kw.lock().unwrap() = 6.0;
        time::advance(Duration::from_secs(2)).await;

        limiter.tick(Utc::now()).await;

        let writes = api.setpoints.lock().unwrap().clone();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[1].0, "tz_living");
        // Space heating curtails to its minimum setpoint.
        assert!((writes[1].1 - 15.0).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn rebound_window_expires_after_its_duration() {
        let api = Arc::new(FakeApi::new(8.0));
        let notifier = Arc::new(RecordingNotifier {
            messages: Mutex::new(Vec::new()),
        });
        let mut limiter = limiter(api.clone(), notifier, 5.0);

        limiter.tick(Utc::now()).await;
        limiter.devices[0].at_critical = false;
        time::advance(Duration::from_secs(6)).await;

        limiter.tick(Utc::now()).await;
        let writes = api.setpoints.lock().unwrap().clone();
        assert_eq!(writes[1].0, "water_heater_1");
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_curtailment_emits_notification() {
        let api = Arc::new(FakeApi::new(8.0));
        let notifier = Arc::new(RecordingNotifier {
            messages: Mutex::new(Vec::new()),
        });
        let mut limiter = limiter(api.clone(), notifier.clone(), 5.0);

        limiter.tick(Utc::now()).await;
        limiter.tick(Utc::now()).await; // curtails tz_living
        limiter.tick(Utc::now()).await; // nothing left

        assert_eq!(api.setpoints.lock().unwrap().len(), 2);
        let messages = notifier.messages.lock().unwrap();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("no curtailable devices"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_sample_skips_the_tick() {
        let api = Arc::new(FakeApi::new(8.0));
        *api.fail_sample.lock().unwrap() = true;
        let notifier = Arc::new(RecordingNotifier {
            messages: Mutex::new(Vec::new()),
        });
        let mut limiter = limiter(api.clone(), notifier, 5.0);

        limiter.tick(Utc::now()).await;
        assert!(api.setpoints.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn within_limit_takes_no_action() {
        let api = Arc::new(FakeApi::new(4.0));
        let notifier = Arc::new(RecordingNotifier {
            messages: Mutex::new(Vec::new()),
        });
        let mut limiter = limiter(api.clone(), notifier, 5.0);

        limiter.tick(Utc::now()).await;
        assert!(api.setpoints.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_limiter_stops_within_two_tick_periods() {
        let api = Arc::new(FakeApi::new(1.0));
        let notifier = Arc::new(RecordingNotifier {
            messages: Mutex::new(Vec::new()),
        });
        let handle = spawn(
            api,
            notifier,
            settings(),
            vec![device("water_heater_1", "water_heater", 1)],
            flat_limit(Utc::now(), 5.0),
            Utc::now(),
        );
        let mut phase = handle.phase_watcher();
        // Let the task activate and enter the loop.
        tokio::task::yield_now().await;
        time::advance(Duration::from_millis(10)).await;

        handle.stop(Duration::from_secs(2)).await;
        assert_eq!(*phase.borrow_and_update(), RtlPhase::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_limit_profile_stops_the_loop() {
        let api = Arc::new(FakeApi::new(8.0));
        let notifier = Arc::new(RecordingNotifier {
            messages: Mutex::new(Vec::new()),
        });
        // Profile starts one hour in the future: no entry covers now.
        let future_profile =
            TimeSeries::from_points([(Utc::now() + ChronoDuration::hours(1), 5.0)]);
        let mut limiter = Limiter::new(
            api.clone(),
            notifier,
            settings(),
            vec![device("water_heater_1", "water_heater", 1)],
            future_profile,
        );
        assert!(matches!(
            limiter.tick(Utc::now()).await,
            TickOutcome::ProfileExhausted
        ));
        assert!(api.setpoints.lock().unwrap().is_empty());
    }
}
