//! Snapshots of the sampler loop for resuming interrupted runs.

use std::{
    fs::{self, File},
    io::{BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use faer::{Mat, MatRef};
use serde::{Deserialize, Serialize};

use crate::{
    covariance::{CovarianceState, KernelMatrix},
    error::{AbcError, Result},
    particle::Population,
    sampler::IterationSummary,
};

pub const CHECKPOINT_VERSION: u32 = 1;

/// A dense square matrix in row-major order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMatrix {
    dim: usize,
    values: Vec<f64>,
}

impl StoredMatrix {
    fn from_mat(mat: &Mat<f64>) -> Self {
        Self {
            dim: mat.nrows(),
            values: mat
                .row_iter()
                .flat_map(|row| row.iter().copied())
                .collect(),
        }
    }

    fn to_mat(&self) -> Result<Mat<f64>> {
        if self.values.len() != self.dim * self.dim {
            return Err(AbcError::Configuration(format!(
                "stored matrix has {} values, expected {}",
                self.values.len(),
                self.dim * self.dim
            )));
        }
        Ok(MatRef::from_row_major_slice(&self.values, self.dim, self.dim).to_owned())
    }
}

/// Covariance state as stored in a checkpoint.
///
/// The regularized matrices are stored; their factorizations are recomputed
/// on load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StoredCovariance {
    Global(StoredMatrix),
    Local(Vec<StoredMatrix>),
}

impl From<&CovarianceState> for StoredCovariance {
    fn from(state: &CovarianceState) -> Self {
        match state {
            CovarianceState::Global(matrix) => {
                StoredCovariance::Global(StoredMatrix::from_mat(matrix.covariance()))
            }
            CovarianceState::Local(matrices) => StoredCovariance::Local(
                matrices
                    .iter()
                    .map(|matrix| StoredMatrix::from_mat(matrix.covariance()))
                    .collect(),
            ),
        }
    }
}

impl StoredCovariance {
    pub fn restore(&self) -> Result<CovarianceState> {
        match self {
            StoredCovariance::Global(stored) => Ok(CovarianceState::Global(KernelMatrix::new(
                stored.to_mat()?,
            )?)),
            StoredCovariance::Local(stored) => stored
                .iter()
                .map(|stored| KernelMatrix::new(stored.to_mat()?))
                .collect::<Result<Vec<_>>>()
                .map(CovarianceState::Local),
        }
    }
}

/// Everything needed to continue a run after its last finished iteration.
///
/// Random streams are derived from `seed`, the iteration and the slot, so
/// the seed and `next_iteration` fully determine the random state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub seed: u64,
    pub next_iteration: usize,
    pub population: Population,
    /// Tolerance of `next_iteration`.
    pub tolerance: f64,
    pub covariance: StoredCovariance,
    pub history: Vec<IterationSummary>,
}

impl Checkpoint {
    pub fn new(
        seed: u64,
        population: Population,
        tolerance: f64,
        covariance: &CovarianceState,
        history: Vec<IterationSummary>,
    ) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            seed,
            next_iteration: population.iteration() + 1,
            population,
            tolerance,
            covariance: covariance.into(),
            history,
        }
    }
}

/// Reads and writes a checkpoint file.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    fn io_error(&self, source: std::io::Error) -> AbcError {
        AbcError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// Write `checkpoint` to a temporary file next to the target and move it
    /// into place, so that an interrupted write never corrupts the previous
    /// checkpoint.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let mut tmp_name = self.path.clone().into_os_string();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        let file = File::create(&tmp_path).map_err(|e| self.io_error(e))?;
        let mut writer = BufWriter::new(file);
        bincode::serialize_into(&mut writer, checkpoint).map_err(|source| {
            AbcError::Serialization {
                path: tmp_path.clone(),
                source,
            }
        })?;
        writer.flush().map_err(|e| self.io_error(e))?;
        drop(writer);

        fs::rename(&tmp_path, &self.path).map_err(|e| self.io_error(e))
    }

    pub fn load(&self) -> Result<Checkpoint> {
        let file = File::open(&self.path).map_err(|e| self.io_error(e))?;
        let mut reader = BufReader::new(file);
        let checkpoint: Checkpoint =
            bincode::deserialize_from(&mut reader).map_err(|source| AbcError::Serialization {
                path: self.path.clone(),
                source,
            })?;

        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(AbcError::Configuration(format!(
                "checkpoint {:?} has format version {}, expected {}",
                self.path, checkpoint.version, CHECKPOINT_VERSION
            )));
        }
        Ok(checkpoint)
    }
}
