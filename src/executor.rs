//! Fan-out of simulations.
//!
//! Every batch is a barrier: [`ParallelExecutor::map`] returns only after all
//! items are processed, and results come back in input order whatever the
//! mode.

use std::{sync::mpsc::channel, thread};

use rayon::{prelude::*, ThreadPool, ThreadPoolBuilder};

use crate::{
    error::{AbcError, Result},
    model::{Distance, DistanceEvaluator, SimContext, Simulator},
};

/// Where simulations run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    /// On the calling thread.
    #[default]
    Sequential,
    /// On a shared rayon thread pool.
    Pool { num_workers: usize },
    /// Contiguous blocks scattered to one thread per rank, gathered over a
    /// channel.
    Ranked { num_ranks: usize },
}

impl ExecutionMode {
    /// Number of workers, 1 in sequential mode.
    pub fn workers(&self) -> usize {
        match *self {
            ExecutionMode::Sequential => 1,
            ExecutionMode::Pool { num_workers } => num_workers,
            ExecutionMode::Ranked { num_ranks } => num_ranks,
        }
    }

    pub fn is_parallel(&self) -> bool {
        !matches!(self, ExecutionMode::Sequential)
    }
}

pub(crate) fn default_parallelism() -> usize {
    thread::available_parallelism().map_or(1, |n| n.get())
}

/// One simulation to run: the parameters proposed for a population slot.
#[derive(Debug)]
pub struct Proposal {
    pub slot: usize,
    /// Index of the resampled particle, `None` for prior draws.
    pub parent: Option<usize>,
    pub params: Box<[f64]>,
    pub context: SimContext,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub distance: f64,
    pub accepted: bool,
}

pub struct ParallelExecutor {
    mode: ExecutionMode,
    pool: Option<ThreadPool>,
}

impl std::fmt::Debug for ParallelExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelExecutor")
            .field("mode", &self.mode)
            .finish()
    }
}

impl ParallelExecutor {
    pub fn new(mode: ExecutionMode) -> Result<Self> {
        if mode.workers() == 0 {
            return Err(AbcError::Configuration(
                "at least one worker is required".to_string(),
            ));
        }

        let pool = match mode {
            ExecutionMode::Pool { num_workers } => Some(
                ThreadPoolBuilder::new()
                    .num_threads(num_workers)
                    .thread_name(|i| format!("abc-worker-{}", i))
                    .build()?,
            ),
            _ => None,
        };

        Ok(Self { mode, pool })
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Apply `func` to every item and return the results in input order.
    pub fn map<T, R, F>(&self, items: Vec<T>, func: F) -> Vec<R>
    where
        T: Send,
        R: Send,
        F: Fn(T) -> R + Sync + Send,
    {
        match (self.mode, &self.pool) {
            (ExecutionMode::Pool { .. }, Some(pool)) => {
                pool.install(|| items.into_par_iter().map(func).collect())
            }
            (ExecutionMode::Ranked { num_ranks }, _) if items.len() > 1 => {
                scatter_gather(items, num_ranks, func)
            }
            _ => items.into_iter().map(func).collect(),
        }
    }

    /// Simulate and score a batch of proposals against `tolerance`.
    pub fn score<S, M>(
        &self,
        proposals: Vec<Proposal>,
        evaluator: &DistanceEvaluator<'_, S, M>,
        tolerance: f64,
    ) -> Vec<(Proposal, anyhow::Result<Evaluation>)>
    where
        S: Simulator,
        S::Data: Sync,
        M: Distance<S::Data>,
    {
        self.map(proposals, |mut proposal| {
            let evaluation = evaluator
                .score(&proposal.params, &mut proposal.context)
                .map(|distance| Evaluation {
                    distance,
                    accepted: distance <= tolerance,
                });
            (proposal, evaluation)
        })
    }
}

fn scatter_gather<T, R, F>(items: Vec<T>, num_ranks: usize, func: F) -> Vec<R>
where
    T: Send,
    R: Send,
    F: Fn(T) -> R + Sync,
{
    let num_items = items.len();
    let num_ranks = num_ranks.clamp(1, num_items);
    let block_size = num_items.div_ceil(num_ranks);

    let mut results: Vec<Option<R>> = (0..num_items).map(|_| None).collect();
    let func = &func;

    thread::scope(|scope| {
        let (results_tx, results_rx) = channel();
        let mut items = items.into_iter().enumerate();
        for _ in 0..num_ranks {
            let block: Vec<(usize, T)> = items.by_ref().take(block_size).collect();
            if block.is_empty() {
                break;
            }
            let results_tx = results_tx.clone();
            scope.spawn(move || {
                for (index, item) in block {
                    if results_tx.send((index, func(item))).is_err() {
                        return;
                    }
                }
            });
        }
        drop(results_tx);

        for (index, result) in results_rx {
            results[index] = Some(result);
        }
    });

    results.into_iter().flatten().collect()
}

#[cfg(test)]
mod tests {
    use anyhow::{bail, Result};
    use pretty_assertions::assert_eq;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    use super::{ExecutionMode, ParallelExecutor, Proposal};
    use crate::model::{DistanceEvaluator, SimContext};

    fn modes() -> [ExecutionMode; 4] {
        [
            ExecutionMode::Sequential,
            ExecutionMode::Pool { num_workers: 3 },
            ExecutionMode::Ranked { num_ranks: 3 },
            ExecutionMode::Ranked { num_ranks: 64 },
        ]
    }

    #[test]
    fn map_preserves_order() -> Result<()> {
        let expected: Vec<usize> = (0..101).map(|i| i * i).collect();
        for mode in modes() {
            let executor = ParallelExecutor::new(mode)?;
            let out = executor.map((0..101).collect(), |i: usize| i * i);
            assert_eq!(out, expected);
        }
        Ok(())
    }

    #[test]
    fn zero_workers() {
        assert!(ParallelExecutor::new(ExecutionMode::Pool { num_workers: 0 }).is_err());
        assert!(ParallelExecutor::new(ExecutionMode::Ranked { num_ranks: 0 }).is_err());
    }

    #[test]
    fn score_is_deterministic() -> Result<()> {
        let simulator = |params: &[f64], ctx: &mut SimContext| -> Result<f64> {
            if params[0] < 0. {
                bail!("negative parameter");
            }
            Ok(params[0] + ctx.rng().random::<f64>())
        };
        let distance = |a: &f64, b: &f64| (a - b).abs();
        let observed = 1.;
        let evaluator = DistanceEvaluator::new(&simulator, &distance, &observed);

        let proposals = || {
            (0..20)
                .map(|slot| {
                    let mut rng = ChaCha8Rng::seed_from_u64(9);
                    rng.set_stream(slot as u64);
                    Proposal {
                        slot,
                        parent: None,
                        params: vec![slot as f64 / 10. - 0.5].into(),
                        context: SimContext::new(0, slot, 0, rng),
                    }
                })
                .collect::<Vec<_>>()
        };

        let reference: Vec<_> = ParallelExecutor::new(ExecutionMode::Sequential)?
            .score(proposals(), &evaluator, 0.5)
            .into_iter()
            .map(|(proposal, eval)| (proposal.slot, eval.ok()))
            .collect();
        assert!(reference[..5].iter().all(|(_, eval)| eval.is_none()));
        assert!(reference[5..].iter().all(|(_, eval)| eval.is_some()));
        for (_, eval) in &reference[5..] {
            let eval = eval.unwrap();
            assert_eq!(eval.accepted, eval.distance <= 0.5);
        }

        for mode in modes() {
            let out: Vec<_> = ParallelExecutor::new(mode)?
                .score(proposals(), &evaluator, 0.5)
                .into_iter()
                .map(|(proposal, eval)| (proposal.slot, eval.ok()))
                .collect();
            assert_eq!(out, reference);
        }
        Ok(())
    }
}
