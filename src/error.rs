use std::path::PathBuf;

use thiserror::Error;

/// Errors that stop an ABC-SMC run.
///
/// Configuration and serialization problems are detected before or between
/// iterations. Errors raised by the user's simulator or distance function are
/// reported as [`AbcError::Simulation`] and end the run immediately; the last
/// checkpoint written before the failing iteration stays valid.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum AbcError {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error(
        "simulation failed in iteration {iteration} (slot {slot}, parent {parent:?}) at \
         parameters {params:?}"
    )]
    Simulation {
        iteration: usize,
        slot: usize,
        /// Index of the particle the parameters were perturbed from.
        parent: Option<usize>,
        params: Box<[f64]>,
        #[source]
        source: anyhow::Error,
    },

    #[error(
        "only {accepted} of {required} particles passed tolerance {tolerance} in iteration \
         {iteration} after {attempts} attempts per particle"
    )]
    SamplingDeadlock {
        iteration: usize,
        accepted: usize,
        required: usize,
        attempts: usize,
        tolerance: f64,
    },

    #[error("particle weights of iteration {iteration} could not be normalized")]
    DegenerateWeights { iteration: usize },

    #[error("covariance matrix could not be factorized: {0}")]
    Covariance(String),

    #[error("could not read or write checkpoint {path:?}")]
    Serialization {
        path: PathBuf,
        #[source]
        source: bincode::Error,
    },

    #[error("could not write output file {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not start worker pool")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("sampling was interrupted before the first population was complete")]
    Interrupted,
}

pub type Result<T> = std::result::Result<T, AbcError>;
