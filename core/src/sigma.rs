//! Sigma-point generation and weighted moment reconstruction.
//!
//! Given a mean $\mu$ of length $L$, a covariance $P$ and the scaling $\gamma$, the
//! $2L + 1$ sigma points are
//!
//! $$
//! \chi_0 = \mu, \qquad \chi_i = \mu + \gamma A_i, \qquad \chi_{L+i} = \mu - \gamma A_i
//! $$
//!
//! where $A_i$ is the $i$-th column of a square root $A A^T = P$
//! (see [`crate::linalg::matrix_square_root`]). Generation is a pure function of its
//! inputs, so the same mean and covariance always yield the same set.

use nalgebra::{DMatrix, DVector};

use crate::error::{FilterError, Result};
use crate::linalg::matrix_square_root;
use crate::parameters::Weights;

/// Ordered set of sigma points, indexed `0..2L+1`
#[derive(Clone, Debug, PartialEq)]
pub struct SigmaPointSet {
    points: Vec<DVector<f64>>,
}

impl SigmaPointSet {
    /// Sample `2L + 1` points around `mean` spanning `covariance`.
    pub fn generate(mean: &DVector<f64>, covariance: &DMatrix<f64>, gamma: f64) -> Result<Self> {
        let l = mean.len();
        if covariance.shape() != (l, l) {
            return Err(FilterError::configuration(format!(
                "sigma points: mean has length {l} but covariance is {}x{}",
                covariance.nrows(),
                covariance.ncols()
            )));
        }
        if !(gamma >= 0.0) || !gamma.is_finite() {
            return Err(FilterError::numerical(format!(
                "sigma points: gamma must be finite and non-negative, got {gamma}"
            )));
        }
        let sqrt_p = matrix_square_root(covariance)?;
        let mut points = Vec::with_capacity(2 * l + 1);
        points.push(mean.clone());
        for i in 0..l {
            points.push(mean + gamma * sqrt_p.column(i));
        }
        for i in 0..l {
            points.push(mean - gamma * sqrt_p.column(i));
        }
        Ok(SigmaPointSet { points })
    }

    /// Wrap already-computed points, e.g. after propagation through a model.
    pub fn from_points(points: Vec<DVector<f64>>) -> Self {
        SigmaPointSet { points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
    /// Length of every point
    pub fn dimension(&self) -> usize {
        self.points.first().map_or(0, |p| p.len())
    }
    pub fn get(&self, index: usize) -> Option<&DVector<f64>> {
        self.points.get(index)
    }
    pub fn points(&self) -> &[DVector<f64>] {
        &self.points
    }
    pub fn iter(&self) -> impl Iterator<Item = &DVector<f64>> {
        self.points.iter()
    }
    /// Stack the points as columns: `dimension × len`, column j = point j.
    pub fn to_matrix(&self) -> DMatrix<f64> {
        if self.points.is_empty() {
            return DMatrix::zeros(0, 0);
        }
        DMatrix::from_columns(&self.points)
    }
    /// Weighted mean using the mean weights
    pub fn mean(&self, weights: &Weights) -> DVector<f64> {
        weighted_mean(&self.points, &weights.mean)
    }
    /// Weighted covariance about the weighted mean using the covariance weights
    pub fn covariance(&self, weights: &Weights) -> DMatrix<f64> {
        let mean = self.mean(weights);
        weighted_covariance(&self.points, &mean, &weights.covariance)
    }
}

/// Build the augmented mean `[x; 0; 0]` and block-diagonal covariance `diag(P, Q, R)`.
pub fn augment(
    state: &DVector<f64>,
    covariance: &DMatrix<f64>,
    process_noise: &DMatrix<f64>,
    measurement_noise: &DMatrix<f64>,
) -> (DVector<f64>, DMatrix<f64>) {
    let n = state.len();
    let m = measurement_noise.nrows();
    let l = 2 * n + m;
    let mut mean = DVector::<f64>::zeros(l);
    mean.rows_mut(0, n).copy_from(state);
    let mut cov = DMatrix::<f64>::zeros(l, l);
    cov.view_mut((0, 0), (n, n)).copy_from(covariance);
    cov.view_mut((n, n), (n, n)).copy_from(process_noise);
    cov.view_mut((2 * n, 2 * n), (m, m)).copy_from(measurement_noise);
    (mean, cov)
}

/// Σ wᵢ xᵢ
pub fn weighted_mean(points: &[DVector<f64>], weights: &DVector<f64>) -> DVector<f64> {
    let dim = points.first().map_or(0, |p| p.len());
    let mut mean = DVector::<f64>::zeros(dim);
    for (i, point) in points.iter().enumerate() {
        mean += weights[i] * point;
    }
    mean
}

/// Σ wᵢ (xᵢ - r)(xᵢ - r)ᵀ
pub fn weighted_covariance(
    points: &[DVector<f64>],
    reference: &DVector<f64>,
    weights: &DVector<f64>,
) -> DMatrix<f64> {
    let dim = reference.len();
    let mut cov = DMatrix::<f64>::zeros(dim, dim);
    for (i, point) in points.iter().enumerate() {
        let diff = point - reference;
        cov += weights[i] * &diff * diff.transpose();
    }
    cov
}

/// Σ wᵢ (xᵢ - r_x)(yᵢ - r_y)ᵀ
pub fn weighted_cross_covariance(
    x_points: &[DVector<f64>],
    x_reference: &DVector<f64>,
    y_points: &[DVector<f64>],
    y_reference: &DVector<f64>,
    weights: &DVector<f64>,
) -> DMatrix<f64> {
    let mut cross = DMatrix::<f64>::zeros(x_reference.len(), y_reference.len());
    for (i, (x, y)) in x_points.iter().zip(y_points.iter()).enumerate() {
        cross += weights[i] * (x - x_reference) * (y - y_reference).transpose();
    }
    cross
}
