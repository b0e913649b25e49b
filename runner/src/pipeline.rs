/*
 * Stage chaining:
 * Init -> Stage1Submitted -> Stage1Done -> Stage2Submitted -> ... -> Completed
 * Every transition is stored before the next one starts, a restarted process continues from the
 * stored phase. A stage that cannot produce a result set moves the pipeline to Failed.
 */

use crate::{
    config::{PipelineConfig, SeedMode},
    controller::{BatchSpec, RunController, RunError},
    database::{ConnectionError, SharedConnection},
    optimizer::Optimizers,
    pruner::SurvivalPolicy,
    report,
    result::{ResultSet, RunResult},
    scheduler::{BatchHandle, Scheduler, SchedulerError},
    util::error_chain,
};
use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSecondsWithFrac};
use std::{
    collections::BTreeMap,
    fmt, fs,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{error, info, instrument, warn};


#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Pipeline state could not be stored")]
    Store(#[from] ConnectionError),
    #[error("No pipeline {0} in the state database")]
    UnknownRun(String),
    #[error("Pipeline {run_id} already exists ({phase})")]
    AlreadyExists { run_id: String, phase: String },
}

/// Stage indices are 0 based, they are displayed 1 based.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub enum Phase {
    Init,
    Submitted { stage: usize },
    Done { stage: usize },
    Completed,
    Failed { stage: Option<usize>, reason: String },
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed { .. })
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => write!(f, "Init"),
            Self::Submitted { stage } => write!(f, "Stage{}Submitted", stage + 1),
            Self::Done { stage } => write!(f, "Stage{}Done", stage + 1),
            Self::Completed => write!(f, "Completed"),
            Self::Failed { .. } => write!(f, "Failed"),
        }
    }
}

/// Aggregate over all stages of a completed pipeline
#[serde_as]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PipelineSummary {
    // critical path, longest replica of every stage
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub longest_elapsed: Duration,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub overall_elapsed: Duration,
    pub final_stage: String,
    pub best: RunResult,
}

impl PipelineSummary {
    /// `None` until the last configured stage has results
    pub fn aggregate(
        settings: &PipelineConfig,
        stage_results: &BTreeMap<String, ResultSet>,
    ) -> Option<Self> {
        let final_stage = settings.stages.last()?;
        let best = stage_results.get(&final_stage.name)?.best().clone();
        let sets = settings
            .stages
            .iter()
            .filter_map(|stage| stage_results.get(&stage.name))
            .collect_vec();

        Some(Self {
            longest_elapsed: sets.iter().map(|set| set.longest_elapsed).sum(),
            overall_elapsed: sets.iter().map(|set| set.overall_elapsed).sum(),
            final_stage: final_stage.name.clone(),
            best,
        })
    }
}

/// Everything needed to continue a pipeline in another process
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PipelineState {
    pub run_id: String,
    pub phase: Phase,
    pub settings: PipelineConfig,
    pub stage_results: BTreeMap<String, ResultSet>,
    // batch of the stage in phase Submitted
    pub active_batch: Option<BatchHandle>,
    pub summary: Option<PipelineSummary>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineState {
    pub fn new(settings: PipelineConfig) -> Self {
        let now = Utc::now();

        Self {
            run_id: settings.run_id.clone(),
            phase: Phase::Init,
            settings,
            stage_results: BTreeMap::new(),
            active_batch: None,
            summary: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// index of the stage the phase refers to
    pub fn current_stage(&self) -> Option<usize> {
        match self.phase {
            Phase::Submitted { stage } | Phase::Done { stage } => Some(stage),
            Phase::Failed { stage, .. } => stage,
            Phase::Init | Phase::Completed => None,
        }
    }
}

/// Move a non-empty stage directory out of the way of a fresh submission.
fn set_aside(dir: &Path) -> std::io::Result<Option<PathBuf>> {
    match fs::read_dir(dir).map(|mut entries| entries.next().is_some()) {
        Ok(true) => {
            let mut name = dir.as_os_str().to_owned();
            name.push(format!(".stale-{}", Utc::now().format("%Y%m%dT%H%M%S%.3f")));
            let stale = PathBuf::from(name);
            fs::rename(dir, &stale)?;

            Ok(Some(stale))
        }
        Ok(false) => Ok(None),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

pub struct Pipeline<'s, S: Scheduler> {
    state: PipelineState,
    store: SharedConnection,
    scheduler: &'s mut S,
    // an unknown batch is resubmitted once per process
    resubmitted: bool,
}

impl<'s, S: Scheduler> Pipeline<'s, S> {
    /// Create and store a new pipeline, a run id can only be started once.
    pub fn start(
        settings: PipelineConfig,
        store: SharedConnection,
        scheduler: &'s mut S,
    ) -> Result<Self, PipelineError> {
        if let Some(existing) = store.load(&settings.run_id)? {
            return Err(PipelineError::AlreadyExists {
                run_id: existing.run_id,
                phase: existing.phase.to_string(),
            });
        }

        let state = PipelineState::new(settings);
        store.save(&state)?;
        info!(run_id = %state.run_id, stages = state.settings.stages.len(), "Started pipeline");

        Ok(Self {
            state,
            store,
            scheduler,
            resubmitted: false,
        })
    }

    /// Continue a stored pipeline.
    pub fn resume(state: PipelineState, store: SharedConnection, scheduler: &'s mut S) -> Self {
        info!(run_id = %state.run_id, phase = %state.phase, "Resuming pipeline");

        Self {
            state,
            store,
            scheduler,
            resubmitted: false,
        }
    }

    /// load `run_id` from `store` and continue it
    pub fn load(
        run_id: &str,
        store: SharedConnection,
        scheduler: &'s mut S,
    ) -> Result<Self, PipelineError> {
        let state = store
            .load(run_id)?
            .ok_or_else(|| PipelineError::UnknownRun(run_id.to_owned()))?;

        Ok(Self::resume(state, store, scheduler))
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    fn transition(&mut self, phase: Phase) -> Result<(), PipelineError> {
        info!(
            run_id = %self.state.run_id,
            from = %self.state.phase,
            to = %phase,
            "Pipeline transition"
        );
        self.state.phase = phase;
        self.state.updated_at = Utc::now();
        if !self.store.save(&self.state)? {
            self.adopt_stored()?;
        }

        Ok(())
    }

    /// Another process finished the pipeline, its stored outcome wins over this one.
    fn adopt_stored(&mut self) -> Result<(), PipelineError> {
        let stored = self
            .store
            .load(&self.state.run_id)?
            .ok_or_else(|| PipelineError::UnknownRun(self.state.run_id.clone()))?;
        warn!(
            run_id = %stored.run_id,
            phase = %stored.phase,
            "Pipeline was finished by another process"
        );

        if let Some(ref handle) = self.state.active_batch {
            let replicas = handle.replica_ids.iter().cloned().collect_vec();
            warn!(
                job = %handle.job,
                replicas = replicas.len(),
                "Killing batch of the finished pipeline"
            );
            self.scheduler.kill(handle, &replicas);
        }
        self.state = stored;

        Ok(())
    }

    fn fail(&mut self, stage: Option<usize>, reason: String) -> Result<(), PipelineError> {
        error!(
            run_id = %self.state.run_id,
            stage = ?stage.map(|stage| stage + 1),
            "Pipeline failed: {reason}"
        );

        self.transition(Phase::Failed { stage, reason })
    }

    /// Perform one transition. Returns false once the pipeline is terminal.
    pub fn step(&mut self) -> Result<bool, PipelineError> {
        match self.state.phase {
            Phase::Init => self.submit_stage(0)?,
            Phase::Submitted { stage } => self.finish_stage(stage)?,
            Phase::Done { stage } if stage + 1 < self.state.settings.stages.len() => {
                self.submit_stage(stage + 1)?
            }
            Phase::Done { .. } => self.complete()?,
            Phase::Completed | Phase::Failed { .. } => return Ok(false),
        }

        Ok(!self.state.phase.is_terminal())
    }

    /// Step until the pipeline is terminal. Stage failures end up in the returned state.
    #[instrument(skip_all, fields(run_id = %self.state.run_id), level = "info")]
    pub fn run(&mut self) -> Result<&PipelineState, PipelineError> {
        while self.step()? {}

        Ok(&self.state)
    }

    /// start trees of stage `index` taken from the results of the stage before it
    fn start_trees(&self, index: usize) -> Result<Vec<PathBuf>, String> {
        let Some(previous) = index.checked_sub(1) else {
            return Ok(Vec::new());
        };
        let name = &self.state.settings.stages[previous].name;
        let set = self
            .state
            .stage_results
            .get(name)
            .ok_or_else(|| format!("stage {name} has no results to start from"))?;

        Ok(match self.state.settings.stages[index].seed {
            SeedMode::Best => vec![set.best().tree.clone()],
            SeedMode::All => set.results.iter().map(|result| result.tree.clone()).collect(),
        })
    }

    fn submit_stage(&mut self, index: usize) -> Result<(), PipelineError> {
        let settings = &self.state.settings;
        let stage = &settings.stages[index];
        let output_dir = settings.stage_dir(stage);

        let start_trees = match self.start_trees(index) {
            Ok(trees) => trees,
            Err(reason) => return self.fail(Some(index), reason),
        };

        match set_aside(&output_dir) {
            Ok(Some(stale)) => warn!(
                stage = %stage.name,
                moved_to = %stale.to_string_lossy(),
                "Stage directory was not empty, set it aside"
            ),
            Ok(None) => {}
            Err(e) => {
                let reason = format!("cannot clear {}: {e}", output_dir.to_string_lossy());
                return self.fail(Some(index), reason);
            }
        }

        let mut controller = RunController::new(
            &mut *self.scheduler,
            Optimizers::load(&stage.optimizer),
            settings.poll_retry.policy(),
            settings.log_retry.policy(),
        );
        let submitted = controller
            .submit(&BatchSpec {
                run_id: &settings.run_id,
                source: &settings.source,
                output_dir: &output_dir,
                outgroups: &settings.outgroups,
                replicas: stage.replicas,
                start_trees: &start_trees,
            })
            .cloned();
        drop(controller);

        match submitted {
            Ok(handle) => {
                info!(
                    stage = %stage.name,
                    job = %handle.job,
                    replicas = handle.submitted_count(),
                    start_trees = start_trees.len(),
                    "Submitted stage"
                );
                self.state.active_batch = Some(handle);
                self.transition(Phase::Submitted { stage: index })
            }
            Err(e) => self.fail(Some(index), error_chain(&e)),
        }
    }

    fn finish_stage(&mut self, index: usize) -> Result<(), PipelineError> {
        let Some(handle) = self.state.active_batch.clone() else {
            warn!(stage = index + 1, "No batch was stored for the stage, submitting it again");
            return self.submit_stage(index);
        };

        let stage = self.state.settings.stages[index].clone();
        let mut controller = RunController::new(
            &mut *self.scheduler,
            Optimizers::load(&stage.optimizer),
            self.state.settings.poll_retry.policy(),
            self.state.settings.log_retry.policy(),
        );

        let state = &mut self.state;
        let store = &self.store;
        let outcome = controller.attach(handle).and_then(|()| {
            controller.wait_with(
                Duration::from_secs(stage.wait.poll_interval),
                stage.wait.survival.as_ref().map(SurvivalPolicy::from),
                |handle| {
                    // pruned replicas stay out of the batch after a restart
                    state.active_batch = Some(handle.clone());
                    state.updated_at = Utc::now();
                    match store.save(state) {
                        Ok(true) => {}
                        Ok(false) => warn!("Pipeline is archived, pruned batch not stored"),
                        Err(e) => warn!("(ignored) failed to store pruned batch: {e}"),
                    }
                },
            )
        });
        let outcome = outcome.and_then(|()| controller.results());
        drop(controller);

        match outcome {
            Ok(set) => {
                let report_dir = &self.state.settings.working_dir;
                if let Err(e) = report::write_stage(report_dir, &stage.name, &set) {
                    warn!("(ignored) {}", error_chain(&e));
                }
                self.state.stage_results.insert(stage.name, set);
                self.state.active_batch = None;
                self.transition(Phase::Done { stage: index })
            }
            Err(RunError::Scheduler(SchedulerError::UnknownJob(job))) if !self.resubmitted => {
                warn!(job = %job, "Scheduler lost track of the batch, submitting the stage again");
                self.resubmitted = true;
                self.state.active_batch = None;
                self.submit_stage(index)
            }
            Err(e) => self.fail(Some(index), error_chain(&e)),
        }
    }

    fn complete(&mut self) -> Result<(), PipelineError> {
        let Some(summary) =
            PipelineSummary::aggregate(&self.state.settings, &self.state.stage_results)
        else {
            return self.fail(None, "final stage has no results".to_owned());
        };

        info!(
            score = summary.best.score,
            tree = %summary.best.tree.to_string_lossy(),
            "Pipeline finished"
        );
        if let Err(e) = report::write_summary(
            &self.state.settings.working_dir,
            &summary,
            &self.state.stage_results,
        ) {
            warn!("(ignored) {}", error_chain(&e));
        }
        self.state.summary = Some(summary);

        self.transition(Phase::Completed)
    }

    /// Kill every tracked replica of the active batch and fail the pipeline.
    pub fn abort(&mut self, reason: &str) -> Result<(), PipelineError> {
        if self.state.phase.is_terminal() {
            warn!(
                run_id = %self.state.run_id,
                phase = %self.state.phase,
                "Pipeline already finished, nothing to abort"
            );
            return Ok(());
        }

        if let Some(ref handle) = self.state.active_batch {
            let replicas = handle.replica_ids.iter().cloned().collect_vec();
            warn!(job = %handle.job, replicas = replicas.len(), "Killing active batch");
            self.scheduler.kill(handle, &replicas);
        }

        let stage = self.state.current_stage();
        self.fail(stage, format!("aborted: {reason}"))
    }
}
