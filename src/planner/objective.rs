//! Convex comfort penalties expressed as linear-program epigraphs.
//!
//! The comfort terms of the device sub-models are quadratic in the
//! deviation from a target. CBC accepts only linear objectives, so each
//! squared deviation enters the program as an epigraph variable bounded
//! below by supporting tangent lines of `e^2` sampled across the feasible
//! deviation range. The approximation is outer (never overestimates) and
//! leaves the feasible set untouched. The space-heating infinity-norm
//! term is the exact standard epigraph.

use good_lp::{constraint, variable, Constraint, Expression, ProblemVariables, Variable};

/// Number of supporting tangent lines per squared deviation.
const TANGENT_CUTS: usize = 9;

/// Normalized deviation `(target - x) / alpha` as a linear expression.
pub fn deviation(target: f64, x: Variable, alpha: f64) -> Expression {
    Expression::from_other_affine(target / alpha) + (-1.0 / alpha) * x
}

/// Weighted squared penalty `weight * e^2` where `|e| <= radius` over the
/// feasible set. Returns the objective contribution; cut constraints are
/// appended to `constraints`.
pub fn quadratic_penalty(
    vars: &mut ProblemVariables,
    constraints: &mut Vec<Constraint>,
    error: Expression,
    radius: f64,
    weight: f64,
) -> Expression {
    if weight <= 0.0 || radius <= 1e-12 {
        return Expression::from_other_affine(0.0);
    }
    let epigraph = vars.add(variable().min(0.0));
    for i in 0..TANGENT_CUTS {
        // Tangent of e^2 at e_i: t >= 2 e_i e - e_i^2.
        let e_i = -radius + 2.0 * radius * i as f64 / (TANGENT_CUTS - 1) as f64;
        constraints.push(constraint!(
            epigraph >= (2.0 * e_i) * error.clone() + Expression::from_other_affine(-e_i * e_i)
        ));
    }
    weight * epigraph
}

/// Exact epigraph of `max_i w_i |e_i|`. Returns the max variable as an
/// expression; pair constraints are appended to `constraints`.
pub fn weighted_max_abs(
    vars: &mut ProblemVariables,
    constraints: &mut Vec<Constraint>,
    terms: &[(f64, Expression)],
) -> Expression {
    let peak = vars.add(variable().min(0.0));
    for (weight, error) in terms {
        if *weight <= 0.0 {
            continue;
        }
        constraints.push(constraint!(peak >= *weight * error.clone()));
        constraints.push(constraint!(peak >= (-*weight) * error.clone()));
    }
    Expression::from(peak)
}
