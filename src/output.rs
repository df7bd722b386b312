use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use crate::{
    error::{AbcError, Result},
    sampler::IterationSummary,
};

/// Writes one line per finished iteration: the iteration index, its
/// tolerance and the weighted mean of every parameter.
#[derive(Debug)]
pub struct OutputWriter {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl OutputWriter {
    /// Create or truncate `path`.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path).map_err(|source| AbcError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    /// Rewrite `path` from the summaries of a checkpointed run.
    ///
    /// Lines written after the last checkpoint are dropped, so a resumed run
    /// never repeats an iteration.
    pub fn restore<P: AsRef<Path>>(path: P, history: &[IterationSummary]) -> Result<Self> {
        let mut writer = Self::create(path)?;
        for summary in history {
            writer.write_iteration(summary)?;
        }
        Ok(writer)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_iteration(&mut self, summary: &IterationSummary) -> Result<()> {
        let mut line = format!("{}\t{:e}", summary.iteration, summary.tolerance);
        for value in summary.mean.iter() {
            line.push_str(&format!("\t{:e}", value));
        }

        writeln!(self.writer, "{}", line)
            .and_then(|_| self.writer.flush())
            .map_err(|source| AbcError::Io {
                path: self.path.clone(),
                source,
            })
    }
}
