use crate::domain::types::Horizon;
use crate::error::ControlError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A timestamped series of floats.
///
/// The planner consumes series densely aligned to the horizon grid; the
/// real-time limiter treats the same structure as a piecewise-constant
/// profile (most recent value at or before the query instant applies).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimeSeries(pub BTreeMap<DateTime<Utc>, f64>);

impl TimeSeries {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn from_points(points: impl IntoIterator<Item = (DateTime<Utc>, f64)>) -> Self {
        Self(points.into_iter().collect())
    }

    pub fn insert(&mut self, at: DateTime<Utc>, value: f64) {
        self.0.insert(at, value);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DateTime<Utc>, &f64)> {
        self.0.iter()
    }

    /// Piecewise-constant lookup: the value of the latest point at or
    /// before `at`, or `None` when the profile does not cover `at` yet.
    pub fn value_at(&self, at: DateTime<Utc>) -> Option<f64> {
        self.0.range(..=at).next_back().map(|(_, v)| *v)
    }

    /// Extract one value per horizon step, requiring an exact point on
    /// every grid timestamp. Forecast providers may return `N + 1` points
    /// (the stop edge included); extra points are ignored.
    pub fn dense(&self, horizon: &Horizon, what: &str) -> Result<Vec<f64>, ControlError> {
        let mut out = Vec::with_capacity(horizon.steps());
        for ts in horizon.timestamps() {
            match self.0.get(&ts) {
                Some(v) => out.push(*v),
                None => {
                    return Err(ControlError::DataUnavailable(format!(
                        "{what} has no value at horizon step {ts}"
                    )))
                }
            }
        }
        Ok(out)
    }

    /// Build a series on the horizon grid from per-step values.
    pub fn on_grid(horizon: &Horizon, values: &[f64]) -> Self {
        Self(horizon.timestamps().zip(values.iter().copied()).collect())
    }
}
