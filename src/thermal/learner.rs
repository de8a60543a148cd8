//! Regularized least-squares fit of the zone thermal dynamics.
//!
//! Solves
//!
//! ```text
//! minimize ||X[:,1:] - (Ax X[:,:-1] + Au U[:,:-1] + Aw W[:,:-1])||_F^2
//!          + lx ||Ax||_F^2 + lu ||Au||_F^2 + lw ||Aw||_F^2
//! s.t.     Au >= 0, diag(Ax) >= 0, row sums of Ax <= 1
//! ```
//!
//! by projected gradient descent. Off-diagonal `Ax` entries and all of
//! `Aw` are free: inter-zone coupling and disturbance response may be
//! negative. The feasible set is a product of per-row sets (two affine
//! constraints for each `Ax` row, the nonnegative orthant for `Au`), so
//! the Euclidean projection is cheap and exact and the iteration
//! converges to the optimum of the convex program. Stability (spectral
//! radius of `Ax` at most one) is verified on the fitted model; an
//! unstable fit is a learn failure and the caller falls back.

use crate::domain::ThermalModel;
use crate::error::ControlError;
use chrono::Utc;
use nalgebra::{DMatrix, DVector};
use tracing::{debug, info};

const MAX_ITERATIONS: usize = 5000;
const RELATIVE_TOLERANCE: f64 = 1e-10;

/// Ridge weights `(lx, lu, lw)`.
#[derive(Debug, Clone, Copy)]
pub struct RidgeWeights {
    pub lx: f64,
    pub lu: f64,
    pub lw: f64,
}

impl Default for RidgeWeights {
    fn default() -> Self {
        Self {
            lx: 1.0,
            lu: 1.0,
            lw: 1.0,
        }
    }
}

/// Aligned historical traces, one row per channel, one column per sample.
#[derive(Debug, Clone)]
pub struct LearningData {
    /// Zone temperatures, Z x M.
    pub temperatures: DMatrix<f64>,
    /// Heater powers in kW, U x M.
    pub heater_powers: DMatrix<f64>,
    /// Disturbance channels (outdoor weather), D x M.
    pub disturbances: DMatrix<f64>,
}

impl LearningData {
    pub fn samples(&self) -> usize {
        self.temperatures.ncols()
    }

    /// Minimum sample count: one more than the number of unknowns per row.
    pub fn required_samples(&self) -> usize {
        let z = self.temperatures.nrows();
        let u = self.heater_powers.nrows();
        let d = self.disturbances.nrows();
        z * (z + u + d) + 1
    }
}

/// Fit `(Ax, Au, Aw)` from aligned traces.
pub fn fit(data: &LearningData, weights: RidgeWeights) -> Result<ThermalModel, ControlError> {
    let z = data.temperatures.nrows();
    let u = data.heater_powers.nrows();
    let d = data.disturbances.nrows();
    let m = data.samples();

    if z == 0 {
        return Err(ControlError::ModelLearnFailed("no thermal zones".into()));
    }
    if data.heater_powers.ncols() != m || data.disturbances.ncols() != m {
        return Err(ControlError::ModelLearnFailed(format!(
            "trace lengths differ: temperatures {m}, heaters {}, disturbances {}",
            data.heater_powers.ncols(),
            data.disturbances.ncols()
        )));
    }
    if m < data.required_samples() {
        return Err(ControlError::ModelLearnFailed(format!(
            "insufficient samples: have {m}, need at least {}",
            data.required_samples()
        )));
    }

    // Targets and regressors: Y = X[:,1:], Phi = [X; U; W][:, :-1].
    let y = data.temperatures.columns(1, m - 1).into_owned();
    let mut phi = DMatrix::zeros(z + u + d, m - 1);
    phi.rows_mut(0, z)
        .copy_from(&data.temperatures.columns(0, m - 1));
    phi.rows_mut(z, u)
        .copy_from(&data.heater_powers.columns(0, m - 1));
    phi.rows_mut(z + u, d)
        .copy_from(&data.disturbances.columns(0, m - 1));

    // Lipschitz constant of the gradient: 2 (sigma_max(Phi)^2 + max lambda).
    let phi_t = phi.transpose();
    let gram = &phi * &phi_t;
    let sigma_sq = largest_eigenvalue(&gram);
    let lambda_max = weights.lx.max(weights.lu).max(weights.lw);
    let step = 1.0 / (2.0 * (sigma_sq + lambda_max) * 1.01);

    // Warm start from the unconstrained ridge solution, projected; the
    // accelerated iteration then only has to absorb the constraints.
    let mut a = unconstrained_ridge(&y, &phi_t, &gram, weights)
        .unwrap_or_else(|| DMatrix::zeros(z, z + u + d));
    project(&mut a, z, u);

    let mut momentum_point = a.clone();
    let mut momentum = 1.0f64;
    let mut previous_objective = objective(&a, &phi, &y, z, u, weights);
    let mut iterations = 0;
    for iteration in 0..MAX_ITERATIONS {
        iterations = iteration + 1;
        let residual = &momentum_point * &phi - &y;
        let mut gradient = 2.0 * residual * &phi_t;
        add_ridge_gradient(&mut gradient, &momentum_point, z, u, weights);
        let mut next = &momentum_point - step * gradient;
        project(&mut next, z, u);

        let next_momentum = (1.0 + (1.0 + 4.0 * momentum * momentum).sqrt()) / 2.0;
        momentum_point = &next + ((momentum - 1.0) / next_momentum) * (&next - &a);
        momentum = next_momentum;
        a = next;

        let current = objective(&a, &phi, &y, z, u, weights);
        let change = (previous_objective - current).abs();
        if iteration > 10 && change <= RELATIVE_TOLERANCE * previous_objective.max(1.0) {
            previous_objective = current;
            break;
        }
        previous_objective = current;
    }
    debug!(iterations, objective = previous_objective, "thermal fit converged");

    let ax: Vec<Vec<f64>> = (0..z)
        .map(|i| (0..z).map(|j| a[(i, j)]).collect())
        .collect();
    let au: Vec<Vec<f64>> = (0..z)
        .map(|i| (0..u).map(|j| a[(i, z + j)]).collect())
        .collect();
    let aw: Vec<Vec<f64>> = (0..z)
        .map(|i| (0..d).map(|j| a[(i, z + u + j)]).collect())
        .collect();

    let model = ThermalModel {
        ax,
        au,
        aw,
        learned_at: Utc::now(),
    };
    model
        .validate()
        .map_err(|e| ControlError::ModelLearnFailed(e.to_string()))?;
    info!(
        zones = z,
        samples = m,
        spectral_radius = crate::thermal::spectral_radius(&model.ax),
        "thermal model learned"
    );
    Ok(model)
}

fn objective(
    a: &DMatrix<f64>,
    phi: &DMatrix<f64>,
    y: &DMatrix<f64>,
    z: usize,
    u: usize,
    weights: RidgeWeights,
) -> f64 {
    let residual = a * phi - y;
    let fit = residual.norm_squared();
    let d = a.ncols() - z - u;
    let rx = a.columns(0, z).norm_squared();
    let ru = a.columns(z, u).norm_squared();
    let rw = a.columns(z + u, d).norm_squared();
    fit + weights.lx * rx + weights.lu * ru + weights.lw * rw
}

fn add_ridge_gradient(
    gradient: &mut DMatrix<f64>,
    a: &DMatrix<f64>,
    z: usize,
    u: usize,
    weights: RidgeWeights,
) {
    let d = a.ncols() - z - u;
    for i in 0..a.nrows() {
        for j in 0..z {
            gradient[(i, j)] += 2.0 * weights.lx * a[(i, j)];
        }
        for j in 0..u {
            gradient[(i, z + j)] += 2.0 * weights.lu * a[(i, z + j)];
        }
        for j in 0..d {
            gradient[(i, z + u + j)] += 2.0 * weights.lw * a[(i, z + u + j)];
        }
    }
}

/// Project the stacked matrix `[Ax | Au | Aw]` onto the feasible set:
/// each `Ax` row keeps a nonnegative diagonal entry and a row sum of at
/// most one, `Au` is elementwise nonnegative, `Aw` is unconstrained.
fn project(a: &mut DMatrix<f64>, z: usize, u: usize) {
    for i in 0..a.nrows() {
        let mut ax_row: Vec<f64> = (0..z).map(|j| a[(i, j)]).collect();
        project_ax_row(&mut ax_row, i);
        for (j, v) in ax_row.into_iter().enumerate() {
            a[(i, j)] = v;
        }
        for j in z..z + u {
            a[(i, j)] = a[(i, j)].max(0.0);
        }
    }
}

/// Euclidean projection of one `Ax` row onto
/// `{x : x[diag] >= 0, sum(x) <= 1}`.
///
/// Two constraints, so the projection is found exactly by enumerating
/// their active sets: the row itself, the row shifted onto the
/// `sum(x) = 1` hyperplane, the row with the diagonal zeroed, and the
/// corner with both active. The closest feasible candidate wins.
fn project_ax_row(row: &mut [f64], diag: usize) {
    let z = row.len();
    if z == 1 {
        row[0] = row[0].clamp(0.0, 1.0);
        return;
    }
    let sum: f64 = row.iter().sum();
    if row[diag] >= 0.0 && sum <= 1.0 {
        return;
    }

    let shifted: Vec<f64> = {
        let shift = (1.0 - sum) / z as f64;
        row.iter().map(|v| v + shift).collect()
    };
    let zeroed: Vec<f64> = {
        let mut c = row.to_vec();
        c[diag] = 0.0;
        c
    };
    let corner: Vec<f64> = {
        let alpha = (1.0 - sum + row[diag]) / (z as f64 - 1.0);
        let mut c: Vec<f64> = row.iter().map(|v| v + alpha).collect();
        c[diag] = 0.0;
        c
    };

    let mut best: Option<Vec<f64>> = None;
    let mut best_distance = f64::INFINITY;
    for candidate in [shifted, zeroed, corner] {
        let total: f64 = candidate.iter().sum();
        if candidate[diag] < -1e-12 || total > 1.0 + 1e-12 {
            continue;
        }
        let distance: f64 = candidate
            .iter()
            .zip(row.iter())
            .map(|(c, y)| (c - y) * (c - y))
            .sum();
        if distance < best_distance {
            best_distance = distance;
            best = Some(candidate);
        }
    }
    if let Some(candidate) = best {
        row.copy_from_slice(&candidate);
    }
}

/// Minimizer of the unconstrained ridge objective (with a uniform
/// regularizer, good enough for a warm start): `A = Y Phi' (Gram + l I)^-1`.
fn unconstrained_ridge(
    y: &DMatrix<f64>,
    phi_t: &DMatrix<f64>,
    gram: &DMatrix<f64>,
    weights: RidgeWeights,
) -> Option<DMatrix<f64>> {
    let n = gram.nrows();
    let lambda = (weights.lx + weights.lu + weights.lw) / 3.0;
    let mut regularized = gram.clone();
    for i in 0..n {
        regularized[(i, i)] += lambda.max(1e-9);
    }
    let inverse = regularized.cholesky()?.inverse();
    Some(y * phi_t * inverse)
}

/// Largest eigenvalue of a symmetric positive semidefinite matrix by
/// power iteration.
fn largest_eigenvalue(matrix: &DMatrix<f64>) -> f64 {
    let n = matrix.nrows();
    if n == 0 {
        return 0.0;
    }
    let mut v = DVector::from_element(n, 1.0 / (n as f64).sqrt());
    let mut eigenvalue = 0.0;
    for _ in 0..100 {
        let next = matrix * &v;
        let norm = next.norm();
        if norm < 1e-300 {
            return 0.0;
        }
        eigenvalue = norm;
        v = next / norm;
    }
    eigenvalue
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Simulate a known stable two-zone system and check the fit recovers
    /// dynamics that satisfy the published invariants and predict well.
    fn synthetic_data(samples: usize) -> (LearningData, [[f64; 2]; 2]) {
        let ax = [[0.90, 0.05], [0.04, 0.91]];
        let au = [[0.8, 0.0], [0.0, 0.7]];
        let aw = [0.03, 0.02];

        let mut temps = vec![21.0, 19.5];
        let mut x = DMatrix::zeros(2, samples);
        let mut u = DMatrix::zeros(2, samples);
        let mut w = DMatrix::zeros(1, samples);
        for k in 0..samples {
            let p = [
                if (k / 7) % 2 == 0 { 1.5 } else { 0.0 },
                if (k / 5) % 2 == 0 { 0.0 } else { 2.0 },
            ];
            let outdoor = -5.0 + 3.0 * ((k % 24) as f64 / 24.0);
            for z in 0..2 {
                x[(z, k)] = temps[z];
                u[(z, k)] = p[z];
            }
            w[(0, k)] = outdoor;
            let next = [
                ax[0][0] * temps[0] + ax[0][1] * temps[1] + au[0][0] * p[0] + aw[0] * outdoor,
                ax[1][0] * temps[0] + ax[1][1] * temps[1] + au[1][1] * p[1] + aw[1] * outdoor,
            ];
            temps = next.to_vec();
        }
        (
            LearningData {
                temperatures: x,
                heater_powers: u,
                disturbances: w,
            },
            ax,
        )
    }

    #[test]
    fn fit_satisfies_the_learning_constraints() {
        let (data, _) = synthetic_data(120);
        let model = fit(&data, RidgeWeights::default()).unwrap();
        model.validate().unwrap();
        assert!(crate::thermal::spectral_radius(&model.ax) <= 1.0 + 1e-9);
        assert!(model.au.iter().flatten().all(|v| *v >= 0.0));
        for (z, row) in model.ax.iter().enumerate() {
            assert!(row.iter().sum::<f64>() <= 1.0 + 1e-9);
            assert!(row[z] >= 0.0);
        }
    }

    #[test]
    fn fit_predicts_one_step_transitions() {
        let (data, _) = synthetic_data(200);
        let model = fit(
            &data,
            RidgeWeights {
                lx: 1e-6,
                lu: 1e-6,
                lw: 1e-6,
            },
        )
        .unwrap();

        // One-step prediction error over the training traces stays small.
        let m = data.samples();
        let mut worst = 0.0f64;
        for k in 0..m - 1 {
            for z in 0..2 {
                let mut predicted = 0.0;
                for j in 0..2 {
                    predicted += model.ax[z][j] * data.temperatures[(j, k)];
                    predicted += model.au[z][j] * data.heater_powers[(j, k)];
                }
                predicted += model.aw[z][0] * data.disturbances[(0, k)];
                worst = worst.max((predicted - data.temperatures[(z, k + 1)]).abs());
            }
        }
        assert!(worst < 0.5, "one-step error too large: {worst}");
    }

    #[test]
    fn fit_rejects_insufficient_samples() {
        let (data, _) = synthetic_data(8);
        let err = fit(&data, RidgeWeights::default()).unwrap_err();
        assert_eq!(err.kind(), "MODEL_LEARN_FAILED");
    }

    #[test]
    fn row_projection_preserves_negative_coupling() {
        // Negative off-diagonal entries are feasible and must survive.
        let mut row = vec![0.9, -0.2, 0.1];
        project_ax_row(&mut row, 0);
        assert_eq!(row, vec![0.9, -0.2, 0.1]);
    }

    #[test]
    fn row_projection_clamps_only_the_diagonal() {
        let mut row = vec![-0.1, 0.3];
        project_ax_row(&mut row, 0);
        assert_eq!(row, vec![0.0, 0.3]);

        // A negative non-diagonal entry is untouched when the diagonal
        // violates its bound.
        let mut row = vec![-0.4, -0.1];
        project_ax_row(&mut row, 0);
        assert_eq!(row, vec![0.0, -0.1]);
    }

    #[test]
    fn row_projection_caps_the_row_sum() {
        let mut row = vec![0.9, 0.8];
        project_ax_row(&mut row, 0);
        let sum: f64 = row.iter().sum();
        assert!((sum - 1.0).abs() < 1e-9);
        assert!((row[0] - 0.55).abs() < 1e-9);
        assert!((row[1] - 0.45).abs() < 1e-9);
    }

    #[test]
    fn row_projection_handles_both_constraints_active() {
        // Large sum with a strongly negative diagonal: the projection
        // lands on the corner where sum(x) = 1 and x[diag] = 0.
        let mut row = vec![-2.0, 1.6, 1.6];
        project_ax_row(&mut row, 0);
        assert!(row[0].abs() < 1e-9);
        let sum: f64 = row.iter().sum();
        assert!(sum <= 1.0 + 1e-9);
    }

    #[test]
    fn single_zone_row_projects_to_unit_interval() {
        let mut row = vec![1.4];
        project_ax_row(&mut row, 0);
        assert_eq!(row, vec![1.0]);
        let mut row = vec![-0.2];
        project_ax_row(&mut row, 0);
        assert_eq!(row, vec![0.0]);
    }
}
