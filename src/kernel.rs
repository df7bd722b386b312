use std::f64::consts::PI;

use faer::Mat;
use rand::Rng;
use rand_distr::StandardNormal;

use crate::{
    covariance::KernelMatrix,
    error::{AbcError, Result},
};

/// Perturbation kernel used to move resampled particles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PerturbationKernel {
    /// Independent normal perturbations with the diagonal of the covariance.
    #[default]
    ComponentWise,
    /// Multivariate normal perturbations with the full covariance.
    Multivariate,
}

impl PerturbationKernel {
    /// Map the numeric `pert_kernel` option (1 or 2) to a kernel.
    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            1 => Ok(Self::ComponentWise),
            2 => Ok(Self::Multivariate),
            other => Err(AbcError::Configuration(format!(
                "unknown perturbation kernel {}, expected 1 (component-wise) or 2 (multivariate)",
                other
            ))),
        }
    }

    /// Draw a candidate around `source`.
    pub fn propose<R: Rng + ?Sized>(
        &self,
        source: &[f64],
        matrix: &KernelMatrix,
        rng: &mut R,
    ) -> Box<[f64]> {
        let dim = source.len();
        assert!(matrix.dim() == dim);
        let z: Vec<f64> = (0..dim).map(|_| rng.sample(StandardNormal)).collect();

        match self {
            PerturbationKernel::ComponentWise => source
                .iter()
                .zip(&z)
                .enumerate()
                .map(|(i, (x, z))| matrix.variance(i).sqrt().mul_add(*z, *x))
                .collect(),
            PerturbationKernel::Multivariate => {
                let mut out = vec![0f64; dim];
                matrix.correlate(&z, &mut out);
                crate::math::axpy(source, &mut out, 1.);
                out.into()
            }
        }
    }

    /// Log density of moving from `source` to `candidate`.
    pub fn log_density(&self, source: &[f64], candidate: &[f64], matrix: &KernelMatrix) -> f64 {
        let dim = source.len();
        assert!(candidate.len() == dim);
        let log_norm = -0.5 * dim as f64 * (2. * PI).ln();

        match self {
            PerturbationKernel::ComponentWise => {
                let mut logp = log_norm;
                for (i, (x, y)) in source.iter().zip(candidate).enumerate() {
                    let var = matrix.variance(i);
                    let diff = y - x;
                    logp -= 0.5 * (var.ln() + diff * diff / var);
                }
                logp
            }
            PerturbationKernel::Multivariate => {
                let mut delta = vec![0f64; dim];
                crate::math::sub_out(candidate, source, &mut delta);
                log_norm - 0.5 * (matrix.log_det() + matrix.mahalanobis_sq(&delta))
            }
        }
    }

    /// The covariance the kernel actually perturbs with.
    pub fn effective_covariance(&self, matrix: &KernelMatrix) -> Mat<f64> {
        match self {
            PerturbationKernel::ComponentWise => {
                let dim = matrix.dim();
                Mat::from_fn(dim, dim, |i, j| if i == j { matrix.variance(i) } else { 0. })
            }
            PerturbationKernel::Multivariate => matrix.covariance().clone(),
        }
    }
}
