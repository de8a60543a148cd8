//! Request dispatcher.
//!
//! Owns the mutable control state of the process: the single outstanding
//! planner job and the single real-time limiter instance. A planning
//! request replaces both; an empty request stops the limiter. Lifecycle
//! signals are explicit (watch channels and task handles), never ambient
//! globals.

use crate::bus::{Acker, Notifier, PlanningParams, PlanningRequest};
use crate::config::AppConfig;
use crate::core_api::CoreApi;
use crate::devices::EnabledKinds;
use crate::domain::{DispatchSchedule, Horizon};
use crate::error::ControlError;
use crate::planner;
use crate::rtl::{self, RtlHandle, RtlPhase, RtlSettings};
use crate::repo::ResultsSink;
use crate::thermal::store::ThermalStore;
use chrono::Utc;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

struct ControlState {
    rtl: Option<RtlHandle>,
    planner_job: Option<JoinHandle<()>>,
}

pub struct Dispatcher {
    api: Arc<dyn CoreApi>,
    sink: Arc<dyn ResultsSink>,
    acker: Arc<dyn Acker>,
    notifier: Arc<dyn Notifier>,
    thermal: Arc<ThermalStore>,
    cfg: AppConfig,
    state: Mutex<ControlState>,
}

impl Dispatcher {
    pub fn new(
        api: Arc<dyn CoreApi>,
        sink: Arc<dyn ResultsSink>,
        acker: Arc<dyn Acker>,
        notifier: Arc<dyn Notifier>,
        cfg: AppConfig,
    ) -> Self {
        let thermal = Arc::new(ThermalStore::new(
            cfg.thermal_model_path.clone(),
            cfg.thermal_ttl(),
        ));
        Self {
            api,
            sink,
            acker,
            notifier,
            thermal,
            cfg,
            state: Mutex::new(ControlState {
                rtl: None,
                planner_job: None,
            }),
        }
    }

    /// Handle one bus request. The returned bool is the admission ack:
    /// whether the request was valid and its jobs were scheduled. Later
    /// planner-cycle failures surface as a separate negative ack.
    pub async fn handle_request(self: Arc<Self>, request: PlanningRequest) -> bool {
        let Some(params) = request.params else {
            info!("empty planning request, stopping real-time limiter");
            self.stop_rtl().await;
            return true;
        };

        let horizon = match Horizon::new(params.start, params.stop, params.interval) {
            Ok(h) => h,
            Err(e) => {
                error!(kind = e.kind(), error = %e, "rejecting planning request");
                return false;
            }
        };
        info!(
            start = %params.start,
            stop = %params.stop,
            interval_minutes = params.interval,
            "planning request accepted"
        );

        let mut state = self.state.lock().await;
        if let Some(job) = state.planner_job.take() {
            info!("cancelling outstanding planner job");
            job.abort();
        }
        state.planner_job = Some(Self::spawn_planner_job(
            Arc::clone(&self),
            horizon,
            params.clone(),
        ));
        drop(state);

        // Limiter restart drains the previous instance first; a failed
        // start is reported but never blocks the planner.
        self.restart_rtl(&params).await;
        true
    }

    pub async fn rtl_phase(&self) -> RtlPhase {
        let state = self.state.lock().await;
        state
            .rtl
            .as_ref()
            .map(|h| h.phase())
            .unwrap_or(RtlPhase::Stopped)
    }

    async fn stop_rtl(&self) {
        let handle = self.state.lock().await.rtl.take();
        match handle {
            Some(handle) => {
                handle.stop(2 * self.cfg.tick_period()).await;
                info!("real-time limiter drained to stopped");
            }
            None => info!("no real-time limiter to stop"),
        }
    }

    async fn restart_rtl(&self, params: &PlanningParams) {
        self.stop_rtl().await;
        let enabled = enabled_kinds(params);
        match self.api.devices().await {
            Ok(inventory) => {
                let devices: Vec<_> = inventory
                    .into_iter()
                    .filter(|d| enabled.allows(d.kind()))
                    .collect();
                let handle = rtl::spawn(
                    self.api.clone(),
                    self.notifier.clone(),
                    RtlSettings::from_config(&self.cfg),
                    devices,
                    params.power_limit.clone(),
                    params.start,
                );
                self.state.lock().await.rtl = Some(handle);
            }
            Err(e) => {
                warn!(error = %e, "real-time limiter start failed, planner continues");
            }
        }
    }

    fn spawn_planner_job(
        dispatcher: Arc<Self>,
        horizon: Horizon,
        params: PlanningParams,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            // Run ahead of the horizon start so the schedule is in place
            // when it begins; immediately when the start is past.
            let run_at = params.start - dispatcher.cfg.planner_lead();
            let wait = (run_at - Utc::now()).to_std().unwrap_or_default();
            tokio::time::sleep(wait).await;

            match dispatcher.run_cycle(&horizon, &params).await {
                Ok(schedule) => {
                    info!(schedule_id = %schedule.id, "planning cycle complete");
                }
                Err(e) => {
                    error!(
                        kind = e.kind(),
                        error = %e,
                        inputs_hash = format!("{:016x}", inputs_hash(&params)),
                        "planning cycle failed, prior schedule left in place"
                    );
                    dispatcher
                        .acker
                        .ack(false, &format!("planning cycle failed: {}", e.kind()))
                        .await;
                }
            }
        })
    }

    async fn run_cycle(
        &self,
        horizon: &Horizon,
        params: &PlanningParams,
    ) -> Result<DispatchSchedule, ControlError> {
        let enabled = enabled_kinds(params);
        let thermal = if enabled.space_heating {
            Some(
                self.thermal
                    .validate_or_learn(
                        self.api.as_ref(),
                        chrono::Duration::days(self.cfg.thermal_lookback_days),
                        Utc::now(),
                    )
                    .await,
            )
        } else {
            None
        };

        let built = planner::build(
            self.api.as_ref(),
            horizon,
            &params.price_profile,
            &params.power_limit,
            &enabled,
            thermal.as_ref(),
        )
        .await?;

        // The solver may block for seconds; keep it off the async
        // workers so the limiter's tick period stays bounded.
        let outcome = tokio::task::spawn_blocking(move || planner::solve(built))
            .await
            .map_err(|e| ControlError::SolverError(format!("solver worker failed: {e}")))??;

        planner::publish(
            &outcome,
            self.api.as_ref(),
            self.sink.as_ref(),
            self.cfg.mpc_priority,
        )
        .await
    }
}

fn enabled_kinds(params: &PlanningParams) -> EnabledKinds {
    EnabledKinds {
        space_heating: params.space_heating,
        electric_storage: params.electric_storage,
        electric_vehicle: params.electric_vehicle,
        water_heater: params.water_heater,
    }
}

/// Stable hash of the request inputs, logged with solver failures.
fn inputs_hash(params: &PlanningParams) -> u64 {
    let mut hasher = DefaultHasher::new();
    serde_json::to_string(params)
        .unwrap_or_default()
        .hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Device, TimeSeries};
    use async_trait::async_trait;
    use chrono::{DateTime, Duration as ChronoDuration, Utc};
    use std::sync::Mutex as StdMutex;

    struct FakeApi {
        devices: Vec<Device>,
    }

    #[async_trait]
    impl CoreApi for FakeApi {
        async fn devices(&self) -> Result<Vec<Device>, ControlError> {
            Ok(self.devices.clone())
        }
        async fn device_state(&self, _: &str, _: Option<&str>) -> Result<f64, ControlError> {
            Ok(55.0)
        }
        async fn building_consumption(&self) -> Result<f64, ControlError> {
            Ok(1.0)
        }
        async fn preferences(
            &self,
            _: &str,
            _: &str,
            _: DateTime<Utc>,
            _: DateTime<Utc>,
        ) -> Result<TimeSeries, ControlError> {
            Err(ControlError::DataUnavailable("not stubbed".into()))
        }
        async fn historic(
            &self,
            _: &str,
            _: DateTime<Utc>,
            _: DateTime<Utc>,
            _: Option<&str>,
        ) -> Result<TimeSeries, ControlError> {
            Err(ControlError::DataUnavailable("not stubbed".into()))
        }
        async fn weather(
            &self,
            _: crate::core_api::WeatherScope,
            _: &str,
            _: DateTime<Utc>,
            _: DateTime<Utc>,
        ) -> Result<TimeSeries, ControlError> {
            Err(ControlError::DataUnavailable("not stubbed".into()))
        }
        async fn non_controllable_forecast(
            &self,
            _: &str,
            _: DateTime<Utc>,
            _: DateTime<Utc>,
        ) -> Result<TimeSeries, ControlError> {
            Err(ControlError::DataUnavailable("forecast down".into()))
        }
        async fn post_setpoint(&self, _: &str, _: f64) -> Result<(), ControlError> {
            Ok(())
        }
        async fn post_schedule(&self, _: i64, _: &serde_json::Value) -> Result<(), ControlError> {
            Ok(())
        }
    }

    struct RecordingAcker {
        acks: StdMutex<Vec<(bool, String)>>,
    }

    #[async_trait]
    impl Acker for RecordingAcker {
        async fn ack(&self, ok: bool, detail: &str) {
            self.acks.lock().unwrap().push((ok, detail.to_string()));
        }
    }

    fn dispatcher(tempdir: &tempfile::TempDir) -> (Arc<Dispatcher>, Arc<RecordingAcker>) {
        let device: Device = serde_json::from_value(serde_json::json!({
            "entity_id": "water_heater_1",
            "kind": "water_heater",
            "priority": 1
        }))
        .unwrap();
        let acker = Arc::new(RecordingAcker {
            acks: StdMutex::new(Vec::new()),
        });
        let cfg = AppConfig {
            thermal_model_path: tempdir.path().join("latest.json"),
            ..AppConfig::default()
        };
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(FakeApi {
                devices: vec![device],
            }),
            Arc::new(crate::repo::LogResultsSink),
            acker.clone(),
            Arc::new(crate::bus::LogNotifier),
            cfg,
        ));
        (dispatcher, acker)
    }

    fn request(start: DateTime<Utc>, minutes: i64) -> PlanningRequest {
        let stop = start + ChronoDuration::minutes(minutes);
        let grid: Vec<_> = (0..minutes / 10)
            .map(|k| start + ChronoDuration::minutes(10 * k))
            .collect();
        PlanningRequest {
            params: Some(PlanningParams {
                start,
                stop,
                interval: 10,
                price_profile: TimeSeries::from_points(grid.iter().map(|ts| (*ts, 0.1))),
                power_limit: TimeSeries::from_points(grid.iter().map(|ts| (*ts, 10.0))),
                space_heating: false,
                electric_storage: false,
                electric_vehicle: false,
                water_heater: true,
            }),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn empty_request_without_limiter_acks_true() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, _) = dispatcher(&dir);
        assert!(dispatcher.clone().handle_request(PlanningRequest::default()).await);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_horizon_is_rejected_without_state_changes() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, _) = dispatcher(&dir);
        let start = Utc::now();
        let mut bad = request(start, 20);
        bad.params.as_mut().unwrap().interval = 7; // does not divide 20
        assert!(!dispatcher.clone().handle_request(bad).await);
        assert_eq!(dispatcher.rtl_phase().await, RtlPhase::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn valid_request_starts_limiter_and_empty_request_stops_it() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, _) = dispatcher(&dir);
        let start = Utc::now();
        assert!(dispatcher.clone().handle_request(request(start, 20)).await);

        // Let the limiter task activate.
        tokio::task::yield_now().await;
        tokio::time::advance(std::time::Duration::from_millis(50)).await;
        tokio::task::yield_now().await;
        assert_eq!(dispatcher.rtl_phase().await, RtlPhase::Running);

        assert!(dispatcher.clone().handle_request(PlanningRequest::default()).await);
        assert_eq!(dispatcher.rtl_phase().await, RtlPhase::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_cycle_publishes_negative_ack() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, acker) = dispatcher(&dir);
        // Start in the past: the planner job runs immediately and fails
        // on the unavailable forecast.
        let start = Utc::now() - ChronoDuration::minutes(30);
        assert!(dispatcher.clone().handle_request(request(start, 20)).await);

        // Drain the spawned job.
        for _ in 0..10 {
            tokio::task::yield_now().await;
            tokio::time::advance(std::time::Duration::from_millis(100)).await;
        }
        let acks = acker.acks.lock().unwrap().clone();
        assert!(acks
            .iter()
            .any(|(ok, detail)| !ok && detail.contains("DATA_UNAVAILABLE")));
    }
}
