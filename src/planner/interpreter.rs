//! Solution interpretation and publication.
//!
//! Turns the evaluated series of a planning cycle into the dispatch
//! schedule posted to the Core API and the result rows persisted to the
//! time-series store. Values are rounded to three decimals before
//! leaving the process.

use crate::core_api::CoreApi;
use crate::domain::{DispatchSchedule, TimeSeries};
use crate::error::ControlError;
use crate::planner::solve::PlanOutcome;
use crate::repo::{ResultSeries, ResultsSink};
use tracing::{info, warn};

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// Assemble the dispatch schedule from the control series.
pub fn to_schedule(outcome: &PlanOutcome, priority: i64) -> DispatchSchedule {
    let mut schedule = DispatchSchedule::new(priority, outcome.horizon);
    for series in outcome.series.iter().filter(|s| s.is_control) {
        let rounded: Vec<f64> = series.values.iter().map(|v| round3(*v)).collect();
        schedule.add_control(
            &series.entity_id,
            TimeSeries::on_grid(&outcome.horizon, &rounded),
        );
    }
    schedule
}

/// Persist all result series and post the schedule.
///
/// A time-series store failure is logged and tolerated; a failed
/// schedule post fails the cycle (the prior schedule stays in force).
pub async fn publish(
    outcome: &PlanOutcome,
    api: &dyn CoreApi,
    sink: &dyn ResultsSink,
    priority: i64,
) -> Result<DispatchSchedule, ControlError> {
    let rows: Vec<ResultSeries> = outcome
        .series
        .iter()
        .map(|series| ResultSeries {
            entity_id: series.entity_id.clone(),
            kind: series.kind.as_str(),
            field: series.signal.field(),
            points: outcome
                .horizon
                .timestamps()
                .zip(series.values.iter().map(|v| round3(*v)))
                .collect(),
        })
        .collect();
    if let Err(e) = sink.write_series(&rows).await {
        warn!(error = %e, "failed to persist planner result series");
    }

    let schedule = to_schedule(outcome, priority);
    api.post_schedule(priority, &schedule.wire_body()).await?;
    info!(
        schedule_id = %schedule.id,
        priority,
        devices = schedule.controls.len(),
        wall_ms = outcome.wall.as_millis() as u64,
        "dispatch schedule posted"
    );
    Ok(schedule)
}
