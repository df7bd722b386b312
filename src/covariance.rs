//! Covariance estimates for the perturbation kernel.
//!
//! Every strategy turns the weighted population of the finished iteration
//! into the jump covariance of the next one. All of them except Filippi's
//! use the factor-two scaling of Beaumont et al. (2009).

use faer::{
    linalg::triangular_solve::solve_lower_triangular_in_place, Col, ColRef, Mat, Par, Scale, Side,
};
use itertools::Itertools;
use log::warn;
use rayon::prelude::*;

use crate::{
    error::{AbcError, Result},
    math::squared_distance,
    particle::Population,
};

const LOWER_LIMIT: f64 = 1e-20f64;
const UPPER_LIMIT: f64 = 1e20f64;

const JITTER_STEPS: usize = 12;

/// Covariance estimation strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VarianceMethod {
    /// Twice the weighted sample covariance (Beaumont et al. 2009).
    #[default]
    Weighted,
    /// Optimal multivariate normal kernel of Filippi et al. (2013), built from
    /// the particles that already pass the next tolerance.
    Filippi,
    /// Twice the unweighted sample covariance (Turner & Van Zandt 2012).
    TurnerVanZandt,
    /// Twice the Ledoit-Wolf shrinkage estimate.
    LedoitWolf,
    /// One matrix per particle from its `k` nearest neighbours.
    KNearest,
}

impl VarianceMethod {
    /// Map the numeric `variance_method` option to a strategy.
    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(Self::Weighted),
            1 => Ok(Self::Filippi),
            2 => Ok(Self::TurnerVanZandt),
            3 => Ok(Self::LedoitWolf),
            4 => Ok(Self::KNearest),
            other => Err(AbcError::Configuration(format!(
                "unknown variance method {}, expected 0 to 4",
                other
            ))),
        }
    }
}

/// A symmetric positive definite covariance together with its lower
/// Cholesky factor.
#[derive(Debug, Clone)]
pub struct KernelMatrix {
    covariance: Mat<f64>,
    factor: Mat<f64>,
    log_det: f64,
}

impl KernelMatrix {
    /// Regularize and factorize `covariance`.
    ///
    /// The matrix is symmetrized and its diagonal clamped. If the
    /// factorization still fails, growing multiples of the mean variance are
    /// added to the diagonal.
    pub fn new(mut covariance: Mat<f64>) -> Result<Self> {
        let dim = covariance.nrows();
        if dim == 0 || covariance.ncols() != dim {
            return Err(AbcError::Covariance(format!(
                "expected a non-empty square matrix, got {}x{}",
                dim,
                covariance.ncols()
            )));
        }

        for i in 0..dim {
            for j in 0..i {
                let val = 0.5 * (covariance[(i, j)] + covariance[(j, i)]);
                covariance[(i, j)] = val;
                covariance[(j, i)] = val;
            }
        }
        for i in 0..dim {
            for j in 0..dim {
                if !covariance[(i, j)].is_finite() {
                    return Err(AbcError::Covariance(format!(
                        "non-finite entry at ({}, {})",
                        i, j
                    )));
                }
            }
            covariance[(i, i)] = covariance[(i, i)].clamp(LOWER_LIMIT, UPPER_LIMIT);
        }

        let scale = (0..dim).map(|i| covariance[(i, i)]).sum::<f64>() / dim as f64;
        for step in 0..=JITTER_STEPS {
            let mut candidate = covariance.clone();
            if step > 0 {
                let jitter = scale * 1e-10 * 10f64.powi(step as i32 - 1);
                for i in 0..dim {
                    candidate[(i, i)] += jitter;
                }
                warn!(
                    "Covariance matrix is not positive definite, adding {:e} to its diagonal",
                    jitter
                );
            }
            if let Ok(llt) = candidate.llt(Side::Lower) {
                let factor = llt.L().to_owned();
                let log_det = 2. * (0..dim).map(|i| factor[(i, i)].ln()).sum::<f64>();
                if log_det.is_finite() {
                    return Ok(Self {
                        covariance: candidate,
                        factor,
                        log_det,
                    });
                }
            }
        }

        Err(AbcError::Covariance(
            "matrix stays indefinite after regularization".to_string(),
        ))
    }

    pub fn dim(&self) -> usize {
        self.covariance.nrows()
    }

    pub fn covariance(&self) -> &Mat<f64> {
        &self.covariance
    }

    /// Lower triangular `L` with `L L^T = covariance`.
    pub fn factor(&self) -> &Mat<f64> {
        &self.factor
    }

    pub fn log_det(&self) -> f64 {
        self.log_det
    }

    pub fn variance(&self, i: usize) -> f64 {
        self.covariance[(i, i)]
    }

    /// `out = L z`
    pub(crate) fn correlate(&self, z: &[f64], out: &mut [f64]) {
        assert!(z.len() == self.dim() && out.len() == self.dim());
        let product = &self.factor * ColRef::from_slice(z);
        out.iter_mut()
            .zip(product.iter())
            .for_each(|(out, &val)| *out = val);
    }

    /// Squared Mahalanobis norm `delta^T covariance^-1 delta`.
    pub(crate) fn mahalanobis_sq(&self, delta: &[f64]) -> f64 {
        assert!(delta.len() == self.dim());
        let mut y = Col::from_fn(delta.len(), |i| delta[i]);
        solve_lower_triangular_in_place(self.factor.as_ref(), y.as_mat_mut(), Par::Seq);
        y.squared_norm_l2()
    }
}

/// The jump covariances of one iteration.
#[derive(Debug, Clone)]
pub enum CovarianceState {
    Global(KernelMatrix),
    /// One matrix per particle, in population order.
    Local(Vec<KernelMatrix>),
}

impl CovarianceState {
    /// The matrix used to perturb the particle at index `source`.
    pub fn matrix_for(&self, source: usize) -> &KernelMatrix {
        match self {
            CovarianceState::Global(matrix) => matrix,
            CovarianceState::Local(matrices) => &matrices[source],
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, CovarianceState::Local(_))
    }

    pub fn dim(&self) -> usize {
        match self {
            CovarianceState::Global(matrix) => matrix.dim(),
            CovarianceState::Local(matrices) => matrices.first().map_or(0, KernelMatrix::dim),
        }
    }
}

/// Computes the [`CovarianceState`] of a finished population.
#[derive(Debug, Clone, Copy)]
pub struct CovarianceEstimator {
    method: VarianceMethod,
    k_near: usize,
}

impl CovarianceEstimator {
    pub fn new(method: VarianceMethod, k_near: usize) -> Self {
        Self { method, k_near }
    }

    pub fn method(&self) -> VarianceMethod {
        self.method
    }

    /// Estimate the jump covariance from `population`.
    ///
    /// `next_tolerance` is the tolerance of the iteration the covariance will
    /// be used in. Only Filippi's strategy depends on it.
    pub fn estimate(&self, population: &Population, next_tolerance: f64) -> Result<CovarianceState> {
        let points: Vec<&[f64]> = population
            .particles()
            .iter()
            .map(|p| &p.params[..])
            .collect();
        let weights = population.weights();

        let global = match self.method {
            VarianceMethod::Weighted => scaled(weighted_covariance(&points, &weights), 2.),
            VarianceMethod::Filippi => {
                filippi_covariance(population, next_tolerance).unwrap_or_else(|| {
                    warn!(
                        "No particle passes tolerance {}, falling back to the weighted covariance",
                        next_tolerance
                    );
                    scaled(weighted_covariance(&points, &weights), 2.)
                })
            }
            VarianceMethod::TurnerVanZandt => scaled(sample_covariance(&points), 2.),
            VarianceMethod::LedoitWolf => scaled(ledoit_wolf(&points), 2.),
            VarianceMethod::KNearest => {
                let k = self.k_near;
                if k < 2 || k >= points.len() {
                    return Err(AbcError::Configuration(format!(
                        "k_near must lie in [2, {}], got {}",
                        points.len() - 1,
                        k
                    )));
                }
                let matrices = (0..points.len())
                    .into_par_iter()
                    .map(|i| {
                        let neighbours = nearest_neighbours(&points, i, k);
                        let local_points = neighbours.iter().map(|&j| points[j]).collect_vec();
                        let local_weights = neighbours.iter().map(|&j| weights[j]).collect_vec();
                        KernelMatrix::new(scaled(
                            weighted_covariance(&local_points, &local_weights),
                            2.,
                        ))
                    })
                    .collect::<Result<Vec<_>>>()?;
                return Ok(CovarianceState::Local(matrices));
            }
        };

        Ok(CovarianceState::Global(KernelMatrix::new(global)?))
    }
}

fn scaled(mut mat: Mat<f64>, factor: f64) -> Mat<f64> {
    mat *= Scale(factor);
    mat
}

fn weighted_mean(points: &[&[f64]], weights: &[f64]) -> Vec<f64> {
    let dim = points.first().map_or(0, |p| p.len());
    let total: f64 = weights.iter().sum();
    let mut mean = vec![0f64; dim];
    for (point, &w) in points.iter().zip(weights) {
        crate::math::axpy(point, &mut mean, w / total);
    }
    mean
}

/// Add `weight * (x - center)(x - center)^T` to `out`.
fn add_outer(out: &mut Mat<f64>, x: &[f64], center: &[f64], weight: f64) {
    let mut delta = vec![0f64; x.len()];
    crate::math::sub_out(x, center, &mut delta);
    let delta = ColRef::from_slice(&delta);
    let mut outer = delta * delta.transpose();
    outer *= Scale(weight);
    *out += &outer;
}

/// Weighted covariance with the unbiased correction for reliability weights,
/// `sum w (x - m)(x - m)^T / (1 - sum w^2)` for normalized weights.
///
/// Points whose weights all vanish fall back to the unweighted covariance.
pub fn weighted_covariance(points: &[&[f64]], weights: &[f64]) -> Mat<f64> {
    assert!(points.len() == weights.len());
    let dim = points.first().map_or(0, |p| p.len());
    let total: f64 = weights.iter().sum();
    if !points.is_empty() && (total <= 0. || !total.is_finite()) {
        return sample_covariance(points);
    }
    let mean = weighted_mean(points, weights);

    let mut cov = Mat::zeros(dim, dim);
    for (point, &w) in points.iter().zip(weights) {
        add_outer(&mut cov, point, &mean, w / total);
    }

    let sum_sq: f64 = weights.iter().map(|w| (w / total) * (w / total)).sum();
    let correction = 1. - sum_sq;
    if correction > 1e-12 {
        scaled(cov, correction.recip())
    } else {
        cov
    }
}

/// Unweighted sample covariance with the `n - 1` denominator.
pub fn sample_covariance(points: &[&[f64]]) -> Mat<f64> {
    let weights = vec![1f64; points.len()];
    weighted_covariance(points, &weights)
}

/// Ledoit-Wolf shrinkage of the empirical covariance towards `mu I`, with
/// `mu` the mean variance.
pub fn ledoit_wolf(points: &[&[f64]]) -> Mat<f64> {
    let n = points.len();
    let dim = points.first().map_or(0, |p| p.len());
    let nf = n as f64;
    let weights = vec![1f64; n];
    let mean = weighted_mean(points, &weights);

    let centered: Vec<Vec<f64>> = points
        .iter()
        .map(|x| x.iter().zip(&mean).map(|(x, m)| x - m).collect())
        .collect();

    let mut emp = Mat::zeros(dim, dim);
    for x in &centered {
        add_outer(&mut emp, x, &vec![0f64; dim], nf.recip());
    }

    let mu = (0..dim).map(|i| emp[(i, i)]).sum::<f64>() / dim as f64;

    // delta = ||S - mu I||_F^2 / p
    let mut delta = 0f64;
    for j in 0..dim {
        for i in 0..dim {
            let target = if i == j { mu } else { 0. };
            let diff = emp[(i, j)] - target;
            delta += diff * diff;
        }
    }
    delta /= dim as f64;

    // beta = sum_k ||x_k x_k^T - S||_F^2 / (n^2 p)
    let mut beta = 0f64;
    for x in &centered {
        for j in 0..dim {
            for i in 0..dim {
                let diff = x[i] * x[j] - emp[(i, j)];
                beta += diff * diff;
            }
        }
    }
    beta /= nf * nf * dim as f64;
    let beta = beta.min(delta);

    let shrinkage = if delta > 0. { beta / delta } else { 0. };

    let mut out = scaled(emp, 1. - shrinkage);
    for i in 0..dim {
        out[(i, i)] += shrinkage * mu;
    }
    out
}

/// Filippi et al. (2013):
/// `sum_i sum_k w_i v_k (y_k - x_i)(y_k - x_i)^T`, where `x_i` are all
/// particles and `y_k` the ones within `tolerance`, with renormalized
/// weights `v_k`.
///
/// Centering both sums on the mean of the `y_k` turns the double sum into
/// `cov_v(y) + sum_i w_i (x_i - mean_v(y))(x_i - mean_v(y))^T`.
fn filippi_covariance(population: &Population, tolerance: f64) -> Option<Mat<f64>> {
    let (passing, passing_weights): (Vec<&[f64]>, Vec<f64>) = population
        .particles()
        .iter()
        .filter(|p| p.distance <= tolerance)
        .map(|p| (&p.params[..], p.weight))
        .unzip();

    let total: f64 = passing_weights.iter().sum();
    if passing.is_empty() || total <= 0. {
        return None;
    }

    let dim = population.dim();
    let center = weighted_mean(&passing, &passing_weights);
    let mut cov = Mat::zeros(dim, dim);
    for (point, &w) in passing.iter().zip(&passing_weights) {
        add_outer(&mut cov, point, &center, w / total);
    }
    for particle in population.particles() {
        add_outer(&mut cov, &particle.params, &center, particle.weight);
    }
    Some(cov)
}

/// Indices of the `k` particles closest to particle `index`, itself excluded.
pub fn nearest_neighbours(points: &[&[f64]], index: usize, k: usize) -> Vec<usize> {
    let origin = points[index];
    points
        .iter()
        .enumerate()
        .filter(|&(j, _)| j != index)
        .map(|(j, point)| (squared_distance(origin, point), j))
        .sorted_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)))
        .take(k)
        .map(|(_, j)| j)
        .collect()
}
