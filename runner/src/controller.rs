use crate::{
    optimizer::{InvocationContext, Optimizer, OptimizerError, Optimizers, SeedSource},
    pruner::{SurvivalPolicy, SurvivalPruner},
    result::ResultSet,
    scheduler::{
        BatchHandle, PollStatus, ReplicaTask, Scheduler, SchedulerError, SubmitRequest,
    },
    util::RetryPolicy,
};
use chrono::Utc;
use itertools::Itertools;
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

#[derive(Error, Debug)]
pub enum RunError {
    #[error("Batch has not reached a terminal state yet")]
    NotFinished,
    #[error("None of the {submitted} submitted replicas produced a usable result")]
    BatchFailed { submitted: usize },
    #[error("Scheduler reported the batch as failed")]
    JobFailed,
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Optimizer(#[from] OptimizerError),
    #[error("Batch IO failed")]
    Io(#[from] std::io::Error),
    #[error("Cannot {operation} a batch in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: BatchState,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchState {
    Idle,
    Submitted,
    Polling,
    Finished,
    Failed,
}

/// What to run in one batch
#[derive(Clone, Copy, Debug)]
pub struct BatchSpec<'a> {
    pub run_id: &'a str,
    pub source: &'a Path,
    pub output_dir: &'a Path,
    pub outgroups: &'a [String],
    // replicas per start tree
    pub replicas: usize,
    // no start tree lets the optimizer build its own
    pub start_trees: &'a [PathBuf],
}

impl BatchSpec<'_> {
    // start trees are numbered from 1, runs from 0
    fn replica_id(&self, tree: usize, run: usize) -> String {
        if self.start_trees.len() > 1 {
            format!("{}.{:03}.{run:04}", self.run_id, tree + 1)
        } else {
            format!("{}.{run:04}", self.run_id)
        }
    }
}

/// Drives one batch of replicas from submission to a ranked result set
pub struct RunController<'s, S: Scheduler> {
    scheduler: &'s mut S,
    optimizer: Optimizers,
    seeds: SeedSource,
    poll_retry: RetryPolicy,
    log_retry: RetryPolicy,
    state: BatchState,
    handle: Option<BatchHandle>,
    overall_elapsed: Duration,
}

impl<'s, S: Scheduler> RunController<'s, S> {
    pub fn new(
        scheduler: &'s mut S,
        optimizer: Optimizers,
        poll_retry: RetryPolicy,
        log_retry: RetryPolicy,
    ) -> Self {
        Self {
            scheduler,
            optimizer,
            seeds: SeedSource::default(),
            poll_retry,
            log_retry,
            state: BatchState::Idle,
            handle: None,
            overall_elapsed: Duration::ZERO,
        }
    }

    pub fn with_seeds(mut self, seeds: SeedSource) -> Self {
        self.seeds = seeds;
        self
    }

    pub fn state(&self) -> BatchState {
        self.state
    }

    fn expect_state(
        &self,
        operation: &'static str,
        allowed: &[BatchState],
    ) -> Result<(), RunError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(RunError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    /// Build one invocation per replica and hand the whole batch to the scheduler.
    #[instrument(skip_all, fields(run_id = spec.run_id, replicas = spec.replicas), level = "info")]
    pub fn submit(&mut self, spec: &BatchSpec) -> Result<&BatchHandle, RunError> {
        self.expect_state("submit", &[BatchState::Idle])?;

        fs::create_dir_all(spec.output_dir)?;
        let output_dir = spec.output_dir.canonicalize()?;
        let source = spec.source.canonicalize()?;

        let start_trees = match spec.start_trees {
            [] => vec![None],
            trees => trees.iter().map(|tree| Some(tree.as_path())).collect(),
        };

        let mut argv = Vec::with_capacity(start_trees.len() * spec.replicas);
        let mut tasks = BTreeMap::new();
        for (tree_index, start_tree) in start_trees.into_iter().enumerate() {
            for run in 0..spec.replicas {
                let replica_id = spec.replica_id(tree_index, run);
                let seed = self.seeds.draw(self.optimizer.seed_max());

                argv.push(self.optimizer.build_invocation(&InvocationContext {
                    source: &source,
                    output_dir: &output_dir,
                    replica_id: &replica_id,
                    seed,
                    start_tree,
                    outgroups: spec.outgroups,
                })?);
                debug!(replica = %replica_id, seed = seed, "Prepared replica");

                tasks.insert(
                    replica_id,
                    ReplicaTask {
                        index: argv.len() - 1,
                        seed,
                        start_tree: start_tree.map(Path::to_path_buf),
                    },
                );
            }
        }

        let request = SubmitRequest {
            program: self.optimizer.program().to_path_buf(),
            argv,
            workdir: output_dir.clone(),
            description: format!("{} {}", self.optimizer.label(), spec.run_id),
        };

        let job = match self.scheduler.submit(&request) {
            Ok(job) => job,
            Err(e) => {
                self.state = BatchState::Failed;
                return Err(e.into());
            }
        };

        info!(
            job = %job,
            optimizer = self.optimizer.label(),
            tasks = tasks.len(),
            output_dir = %output_dir.to_string_lossy(),
            "Submitted batch"
        );
        self.state = BatchState::Submitted;

        Ok(&*self.handle.insert(BatchHandle {
            job,
            replica_ids: tasks.keys().cloned().collect(),
            tasks,
            output_dir,
            submitted_at: Utc::now(),
        }))
    }

    /// Take over a batch submitted by an earlier process.
    pub fn attach(&mut self, handle: BatchHandle) -> Result<(), RunError> {
        self.expect_state("attach", &[BatchState::Idle])?;

        self.seeds
            .reserve(handle.tasks.values().map(|task| task.seed));
        info!(
            job = %handle.job,
            tracked = handle.replica_ids.len(),
            "Attached to running batch"
        );
        self.handle = Some(handle);
        self.state = BatchState::Submitted;

        Ok(())
    }

    /// Wait for the batch to finish. With a survival policy the scheduler is polled every
    /// `poll_interval` and the pruner runs between polls, without one a single blocking poll is
    /// issued.
    pub fn wait(
        &mut self,
        poll_interval: Duration,
        survival: Option<SurvivalPolicy>,
    ) -> Result<(), RunError> {
        self.wait_with(poll_interval, survival, |_| {})
    }

    /// Like `wait`, `checkpoint` sees the handle after every cycle that killed replicas.
    #[instrument(skip_all, level = "info")]
    pub fn wait_with(
        &mut self,
        poll_interval: Duration,
        survival: Option<SurvivalPolicy>,
        mut checkpoint: impl FnMut(&BatchHandle),
    ) -> Result<(), RunError> {
        self.expect_state("wait for", &[BatchState::Submitted, BatchState::Polling])?;
        let Some(handle) = self.handle.as_mut() else {
            return Err(RunError::InvalidState {
                operation: "wait for",
                state: self.state,
            });
        };

        self.state = BatchState::Polling;
        let scheduler = &mut *self.scheduler;
        let pruner = survival.map(|policy| SurvivalPruner::new(policy, self.log_retry));
        let timeout = pruner.as_ref().map(|_| poll_interval);

        let outcome = loop {
            let status = self.poll_retry.run(
                "scheduler poll",
                || scheduler.poll(handle, timeout),
                SchedulerError::is_transient,
            );

            match status {
                Ok(PollStatus::Completed) => break Ok(()),
                Ok(PollStatus::Failed) => break Err(RunError::JobFailed),
                Ok(PollStatus::Running { fraction_done }) => {
                    info!(
                        job = %handle.job,
                        done = %format!("{:.1}%", fraction_done * 100.0),
                        tracked = handle.replica_ids.len(),
                        "Batch still running"
                    );
                }
                Ok(PollStatus::TimedOut) => debug!(job = %handle.job, "Poll timed out"),
                Err(e) => break Err(RunError::Scheduler(e)),
            }

            if let Some(ref pruner) = pruner {
                if !pruner.prune(handle, &self.optimizer, scheduler).is_empty() {
                    checkpoint(handle);
                }
            }
        };

        self.overall_elapsed = (Utc::now() - handle.submitted_at)
            .to_std()
            .unwrap_or_default();
        self.state = match outcome {
            Ok(()) => BatchState::Finished,
            Err(_) => BatchState::Failed,
        };
        info!(
            job = %handle.job,
            state = ?self.state,
            elapsed = %crate::util::format_duration(self.overall_elapsed),
            "Batch reached terminal state"
        );

        outcome
    }

    /// Rank every parseable result in the output directory of a finished batch.
    pub fn results(&self) -> Result<ResultSet, RunError> {
        match self.state {
            BatchState::Finished => {}
            BatchState::Failed => return Err(RunError::JobFailed),
            _ => return Err(RunError::NotFinished),
        }
        let Some(handle) = self.handle.as_ref() else {
            return Err(RunError::NotFinished);
        };

        let found = self.optimizer.discover(&handle.output_dir)?;
        for replica in handle
            .replica_ids
            .iter()
            .filter(|replica| !found.contains(replica))
        {
            let missing = OptimizerError::MissingResult {
                replica_id: replica.clone(),
                output_dir: handle.output_dir.clone(),
            };
            warn!("(excluded) {missing}");
        }

        collect_results(
            &self.optimizer,
            &handle.output_dir,
            &found,
            self.overall_elapsed,
            handle.submitted_count(),
            handle.replica_ids.len(),
        )
    }

    /// Kill every tracked replica, the batch ends up failed.
    pub fn abort(&mut self) -> Result<(), RunError> {
        let Some(handle) = self.handle.as_ref() else {
            return Err(RunError::InvalidState {
                operation: "abort",
                state: self.state,
            });
        };

        let replicas = handle.replica_ids.iter().cloned().collect_vec();
        warn!(job = %handle.job, replicas = replicas.len(), "Aborting batch");
        self.scheduler.kill(handle, &replicas);
        self.state = BatchState::Failed;

        Ok(())
    }
}

/// Parse the final results of `replicas` in `output_dir`. Unparseable replicas are logged and left
/// out, a batch without any result is failed.
pub fn collect_results<O: Optimizer>(
    optimizer: &O,
    output_dir: &Path,
    replicas: &[String],
    overall_elapsed: Duration,
    submitted_count: usize,
    survived_count: usize,
) -> Result<ResultSet, RunError> {
    let results = replicas
        .iter()
        .filter_map(
            |replica| match optimizer.parse_final_result(output_dir, replica) {
                Ok(result) => Some(result),
                Err(e) => {
                    warn!(replica = %replica, "(excluded) {e}");
                    None
                }
            },
        )
        .collect_vec();

    info!(
        parsed = results.len(),
        submitted = submitted_count,
        survived = survived_count,
        "Collected results"
    );

    ResultSet::new(results, overall_elapsed, submitted_count, survived_count).ok_or(
        RunError::BatchFailed {
            submitted: submitted_count,
        },
    )
}
