//! Solver hand-off and primal extraction.

use crate::devices::Signal;
use crate::domain::DeviceKind;
use crate::error::ControlError;
use crate::planner::builder::BuiltPlan;
use good_lp::{default_solver, ResolutionError, Solution, SolverModel};
use std::time::Instant;
use tracing::{info, warn};

const EXCLUSIVITY_EPSILON_KW: f64 = 1e-6;

/// One evaluated result series, in the signal's unit.
#[derive(Debug, Clone, PartialEq)]
pub struct NumericSeries {
    pub entity_id: String,
    pub kind: DeviceKind,
    pub signal: Signal,
    pub is_control: bool,
    pub values: Vec<f64>,
}

/// The numeric result of one planning cycle.
#[derive(Debug, Clone)]
pub struct PlanOutcome {
    pub horizon: crate::domain::Horizon,
    pub series: Vec<NumericSeries>,
    pub net_kw: Vec<f64>,
    pub wall: std::time::Duration,
    pub status: &'static str,
}

/// Solve the assembled program and evaluate every planned series.
///
/// CPU-bound: callers run this on a blocking worker so the real-time
/// limiter's tick period stays unaffected.
pub fn solve(plan: BuiltPlan) -> Result<PlanOutcome, ControlError> {
    let n = plan.horizon.steps();

    // With no device sub-models the program has no variables; the net
    // exchange is just the non-controllable forecast and the limit check
    // is immediate.
    if plan.model_count == 0 {
        for k in 0..n {
            if plan.non_controllable_kw[k] > plan.limit_kw[k] + 1e-9 {
                return Err(ControlError::SolverInfeasible);
            }
        }
        info!("no controllable devices, plan is the uncontrolled forecast");
        return Ok(PlanOutcome {
            horizon: plan.horizon,
            series: Vec::new(),
            net_kw: plan.non_controllable_kw.clone(),
            wall: std::time::Duration::ZERO,
            status: "OPTIMAL",
        });
    }

    let started = Instant::now();
    let mut model = plan.vars.minimise(plan.objective).using(default_solver);
    for constraint in plan.constraints {
        model = model.with(constraint);
    }
    let solution = model.solve().map_err(map_resolution_error)?;
    let wall = started.elapsed();
    info!(
        wall_ms = wall.as_millis() as u64,
        mixed_integer = plan.has_binaries,
        "solver finished"
    );

    let mut series: Vec<NumericSeries> = plan
        .series
        .iter()
        .map(|planned| NumericSeries {
            entity_id: planned.entity_id.clone(),
            kind: planned.kind,
            signal: planned.signal,
            is_control: planned.is_control,
            values: planned
                .steps
                .iter()
                .map(|expr| solution.eval(expr.clone()))
                .collect(),
        })
        .collect();
    let net_kw: Vec<f64> = plan
        .net_kw
        .iter()
        .map(|expr| solution.eval(expr.clone()))
        .collect();

    // Relaxed charge/discharge exclusivity: losses make simultaneous
    // nonzero pairs suboptimal, but degenerate prices can still produce
    // one. Zero the smaller side in the published control series.
    for guard in &plan.guards {
        for k in 0..guard.charge_kw.len() {
            let charge = solution.value(guard.charge_kw[k]);
            let discharge = solution.value(guard.discharge_kw[k]);
            if charge.min(discharge) > EXCLUSIVITY_EPSILON_KW {
                warn!(
                    entity_id = %guard.entity_id,
                    step = k,
                    charge_kw = charge,
                    discharge_kw = discharge,
                    "simultaneous charge and discharge, zeroing the smaller side"
                );
                let corrected_w = if charge >= discharge {
                    1000.0 * charge
                } else {
                    -1000.0 * discharge
                };
                if let Some(power) = series.iter_mut().find(|s| {
                    s.entity_id == guard.entity_id && s.signal == Signal::PowerW && s.is_control
                }) {
                    power.values[k] = corrected_w;
                }
            }
        }
    }

    Ok(PlanOutcome {
        horizon: plan.horizon,
        series,
        net_kw,
        wall,
        status: "OPTIMAL",
    })
}

fn map_resolution_error(error: ResolutionError) -> ControlError {
    match error {
        ResolutionError::Infeasible => ControlError::SolverInfeasible,
        ResolutionError::Unbounded => ControlError::SolverUnbounded,
        other => ControlError::SolverError(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Horizon;
    use chrono::{Duration, TimeZone, Utc};
    use good_lp::{Expression, ProblemVariables};

    fn horizon() -> Horizon {
        let start = Utc.with_ymd_and_hms(2025, 5, 26, 19, 0, 0).unwrap();
        Horizon::new(start, start + Duration::minutes(10), 10).unwrap()
    }

    fn constant_plan(su: f64, limit: f64) -> BuiltPlan {
        BuiltPlan {
            horizon: horizon(),
            vars: ProblemVariables::new(),
            objective: Expression::from_other_affine(0.0),
            constraints: Vec::new(),
            series: Vec::new(),
            guards: Vec::new(),
            net_kw: vec![Expression::from_other_affine(su)],
            price: vec![0.1],
            limit_kw: vec![limit],
            non_controllable_kw: vec![su],
            model_count: 0,
            has_binaries: false,
        }
    }

    #[test]
    fn zero_devices_solves_trivially_when_within_limit() {
        let outcome = solve(constant_plan(2.0, 10.0)).unwrap();
        assert_eq!(outcome.status, "OPTIMAL");
        assert_eq!(outcome.net_kw, vec![2.0]);
        assert!(outcome.series.is_empty());
    }

    #[test]
    fn zero_devices_over_limit_is_infeasible() {
        let err = solve(constant_plan(2.0, 0.5)).unwrap_err();
        assert_eq!(err.kind(), "SOLVER_INFEASIBLE");
    }
}
