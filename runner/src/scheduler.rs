mod htcondor;
mod local;
mod slurm;

pub use htcondor::HtCondorScheduler;
pub use local::LocalScheduler;
pub use slurm::SlurmScheduler;

use crate::config::SchedulerConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    path::{Path, PathBuf},
    process::Command,
    time::Duration,
};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Batch submission was rejected: {0}")]
    Submission(String),
    #[error("Scheduler status is unintelligible: {0}")]
    Poll(String),
    #[error("Job {0} is unknown to this scheduler")]
    UnknownJob(JobRef),
    #[error("Failed to run scheduler command {command}")]
    Command {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Scheduler IO failed")]
    Io(#[from] std::io::Error),
}

impl SchedulerError {
    /// errors that might go away by asking again later
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Poll(_) | Self::Command { .. })
    }
}

/// Opaque, scheduler specific reference to a submitted batch
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct JobRef(pub String);

impl fmt::Display for JobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One replica of a batch and everything needed to find it again on the scheduler side
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ReplicaTask {
    // position inside the batch, used as task/proc index by the schedulers
    pub index: usize,
    pub seed: u64,
    pub start_tree: Option<PathBuf>,
}

/// A live submission
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct BatchHandle {
    pub job: JobRef,
    // replicas still tracked, shrinks as replicas are pruned
    pub replica_ids: BTreeSet<String>,
    // every replica that was submitted, never mutated
    pub tasks: BTreeMap<String, ReplicaTask>,
    pub output_dir: PathBuf,
    pub submitted_at: DateTime<Utc>,
}

impl BatchHandle {
    pub fn submitted_count(&self) -> usize {
        self.tasks.len()
    }

    /// scheduler task indices of the given replicas, unknown ids are skipped
    pub fn task_indices<'a>(&'a self, replicas: &'a [String]) -> impl Iterator<Item = usize> + 'a {
        replicas
            .iter()
            .filter_map(|replica| self.tasks.get(replica).map(|task| task.index))
    }
}

/// Everything a scheduler needs to start a batch
#[derive(Clone, Debug)]
pub struct SubmitRequest {
    pub program: PathBuf,
    // one argument vector per replica, in task index order
    pub argv: Vec<Vec<String>>,
    pub workdir: PathBuf,
    pub description: String,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PollStatus {
    Running { fraction_done: f64 },
    Completed,
    TimedOut,
    Failed,
}

impl PollStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Normalized task state vocabulary shared by all schedulers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
    Removed,
}

impl TaskState {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

/// Summarize task states of a batch with `total` tasks. Tasks that left the queue count as done.
pub fn summarize(total: usize, states: impl IntoIterator<Item = TaskState>) -> PollStatus {
    let mut active = 0;

    for state in states {
        match state {
            TaskState::Failed => return PollStatus::Failed,
            state if state.is_active() => active += 1,
            _ => {}
        }
    }

    if active == 0 {
        PollStatus::Completed
    } else {
        PollStatus::Running {
            fraction_done: total.saturating_sub(active) as f64 / total.max(1) as f64,
        }
    }
}

pub trait Scheduler {
    /// submit one task per argument vector, all or nothing
    fn submit(&mut self, request: &SubmitRequest) -> Result<JobRef, SchedulerError>;

    /// Wait up to `timeout` for the batch to reach its terminal state, `None` blocks until it does.
    fn poll(
        &mut self,
        handle: &BatchHandle,
        timeout: Option<Duration>,
    ) -> Result<PollStatus, SchedulerError>;

    /// Best effort termination of the given replicas, never fails.
    fn kill(&mut self, handle: &BatchHandle, replicas: &[String]);
}

#[derive(Debug)]
pub enum Schedulers {
    HtCondor(HtCondorScheduler),
    Slurm(SlurmScheduler),
    Local(LocalScheduler),
}

impl Schedulers {
    pub fn load(config: &SchedulerConfig) -> Self {
        match config {
            SchedulerConfig::Htcondor(config) => Self::HtCondor(HtCondorScheduler::load(config)),
            SchedulerConfig::Slurm(config) => Self::Slurm(SlurmScheduler::load(config)),
            SchedulerConfig::Local(_) => Self::Local(LocalScheduler::default()),
        }
    }
}

impl Scheduler for Schedulers {
    fn submit(&mut self, request: &SubmitRequest) -> Result<JobRef, SchedulerError> {
        match self {
            Self::HtCondor(scheduler) => scheduler.submit(request),
            Self::Slurm(scheduler) => scheduler.submit(request),
            Self::Local(scheduler) => scheduler.submit(request),
        }
    }

    fn poll(
        &mut self,
        handle: &BatchHandle,
        timeout: Option<Duration>,
    ) -> Result<PollStatus, SchedulerError> {
        match self {
            Self::HtCondor(scheduler) => scheduler.poll(handle, timeout),
            Self::Slurm(scheduler) => scheduler.poll(handle, timeout),
            Self::Local(scheduler) => scheduler.poll(handle, timeout),
        }
    }

    fn kill(&mut self, handle: &BatchHandle, replicas: &[String]) {
        match self {
            Self::HtCondor(scheduler) => scheduler.kill(handle, replicas),
            Self::Slurm(scheduler) => scheduler.kill(handle, replicas),
            Self::Local(scheduler) => scheduler.kill(handle, replicas),
        }
    }
}

/// Captured result of a scheduler command line tool
#[derive(Debug)]
pub(crate) struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Run a scheduler command line tool, the exit status is the callers concern.
pub(crate) fn run_command(command: &mut Command) -> Result<CommandOutput, SchedulerError> {
    let rendered = format!("{command:?}");
    debug!(command = %rendered, "Running scheduler command");

    let output = command.output().map_err(|source| SchedulerError::Command {
        command: rendered,
        source,
    })?;

    Ok(CommandOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// per task stdout/stderr capture file inside a batch directory
pub(crate) fn stream_path(workdir: &Path, index: usize, stream: &str) -> PathBuf {
    workdir.join("output").join(format!("{index:04}.{stream}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_counts_left_tasks_as_done() {
        assert_eq!(
            summarize(4, [TaskState::Running, TaskState::Pending]),
            PollStatus::Running { fraction_done: 0.5 }
        );
        assert_eq!(
            summarize(4, [TaskState::Completed, TaskState::Removed]),
            PollStatus::Completed
        );
        assert_eq!(summarize(4, []), PollStatus::Completed);
    }

    #[test]
    fn failed_task_fails_batch() {
        assert_eq!(
            summarize(3, [TaskState::Running, TaskState::Failed]),
            PollStatus::Failed
        );
    }

    #[test]
    fn task_indices_skip_unknown() {
        let handle = BatchHandle {
            job: JobRef("12".to_owned()),
            replica_ids: ["a".to_owned(), "b".to_owned()].into_iter().collect(),
            tasks: [
                (
                    "a".to_owned(),
                    ReplicaTask {
                        index: 0,
                        seed: 1,
                        start_tree: None,
                    },
                ),
                (
                    "b".to_owned(),
                    ReplicaTask {
                        index: 1,
                        seed: 2,
                        start_tree: None,
                    },
                ),
            ]
            .into_iter()
            .collect(),
            output_dir: PathBuf::from("/tmp"),
            submitted_at: Utc::now(),
        };
        let replicas = ["b".to_owned(), "zz".to_owned()];

        assert_eq!(handle.task_indices(&replicas).collect::<Vec<_>>(), vec![1]);
        assert_eq!(handle.submitted_count(), 2);
    }
}
