//! Test doubles shared by the unit tests of the controller, the pruner and the pipeline

use crate::{
    config::{
        DatabaseConfig, LocalConfig, OptimizerConfig, PipelineConfig, RaxmlConfig, RetryConfig,
        SchedulerConfig, SeedMode, StageConfig, WaitConfig,
    },
    result::{tests::result, ResultSet},
    scheduler::{
        BatchHandle, JobRef, PollStatus, ReplicaTask, Scheduler, SchedulerError, SubmitRequest,
    },
};
use chrono::Utc;
use std::{
    collections::{HashMap, HashSet, VecDeque},
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

/// Scheduler that never runs anything. Finishing a batch writes RAxML artifacts for every replica
/// that neither crashed nor was killed, replica `i` of a batch scores `100 + i` after
/// `10 * (i + 1)` seconds.
#[derive(Debug, Default)]
pub struct FakeScheduler {
    pub submissions: Vec<SubmitRequest>,
    pub killed: Vec<String>,
    pub polls: usize,
    // polls answered with a transient error before anything else happens
    pub poll_failures: u32,
    // answers handed out before the batch finishes
    pub script: VecDeque<PollStatus>,
    // replicas that exit without leaving any artifact
    pub crash: HashSet<String>,
    pub crash_all: bool,
    pub reject: bool,
    pub(crate) batches: HashMap<JobRef, Vec<Vec<String>>>,
}

impl FakeScheduler {
    fn finish(&self, argv: &[Vec<String>]) {
        for (index, args) in argv.iter().enumerate() {
            let (Some(id), Some(dir)) = (flag_value(args, "-n"), flag_value(args, "-w")) else {
                continue;
            };
            if self.crash_all || self.crash.contains(id) || self.killed.iter().any(|k| k == id) {
                continue;
            }

            write_raxml_result(
                Path::new(dir),
                id,
                100.0 + index as f64,
                10.0 * (index + 1) as f64,
            );
        }
    }
}

impl Scheduler for FakeScheduler {
    fn submit(&mut self, request: &SubmitRequest) -> Result<JobRef, SchedulerError> {
        if self.reject {
            return Err(SchedulerError::Submission("queue is closed".to_owned()));
        }

        let job = JobRef(format!("fake-{}", self.submissions.len()));
        self.submissions.push(request.clone());
        self.batches.insert(job.clone(), request.argv.clone());

        Ok(job)
    }

    fn poll(
        &mut self,
        handle: &BatchHandle,
        _timeout: Option<Duration>,
    ) -> Result<PollStatus, SchedulerError> {
        self.polls += 1;

        if self.poll_failures > 0 {
            self.poll_failures -= 1;
            return Err(SchedulerError::Poll("garbled queue listing".to_owned()));
        }

        let argv = self
            .batches
            .get(&handle.job)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownJob(handle.job.clone()))?;

        match self.script.pop_front() {
            Some(status) => Ok(status),
            None => {
                self.finish(&argv);
                Ok(PollStatus::Completed)
            }
        }
    }

    fn kill(&mut self, _handle: &BatchHandle, replicas: &[String]) {
        self.killed.extend(replicas.iter().cloned());
    }
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|arg| arg == flag)
        .and_then(|position| args.get(position + 1))
        .map(String::as_str)
}

/// the artifacts RAxML leaves behind for a finished replica
pub fn write_raxml_result(dir: &Path, id: &str, score: f64, elapsed: f64) {
    fs::create_dir_all(dir).unwrap();
    fs::write(dir.join(format!("RAxML_bestTree.{id}")), "((a,b),c);\n").unwrap();
    fs::write(
        dir.join(format!("RAxML_log.{id}")),
        format!("{} -{}\n{elapsed} -{score}\n", elapsed / 2.0, score + 5.0),
    )
    .unwrap();
    fs::write(
        dir.join(format!("RAxML_info.{id}")),
        format!(
            "Overall execution time: {elapsed} secs or 0.1 hours\n\n\
             Final GAMMA-based Score of best tree -{score}\n"
        ),
    )
    .unwrap();
}

/// a handle over `ids` in `dir`, replica `i` has task index `i` and seed `i + 1`
pub fn handle_for(dir: &Path, ids: &[&str]) -> BatchHandle {
    BatchHandle {
        job: JobRef("fake-0".to_owned()),
        replica_ids: ids.iter().map(|id| (*id).to_owned()).collect(),
        tasks: ids
            .iter()
            .enumerate()
            .map(|(index, id)| {
                (
                    (*id).to_owned(),
                    ReplicaTask {
                        index,
                        seed: index as u64 + 1,
                        start_tree: None,
                    },
                )
            })
            .collect(),
        output_dir: dir.to_path_buf(),
        submitted_at: Utc::now(),
    }
}

/// Pipeline `h3` with `stages` RAxML stages of 4 replicas named `stage1`, `stage2`, ..., reading
/// `<working_dir>/source.fasta`.
pub fn config(working_dir: &str, stages: usize) -> PipelineConfig {
    let working_dir = PathBuf::from(working_dir);
    let retry = RetryConfig {
        attempts: 3,
        initial_delay: 0,
        max_delay: 0,
    };

    PipelineConfig {
        run_id: "h3".to_owned(),
        source: working_dir.join("source.fasta"),
        working_dir,
        outgroups: Vec::new(),
        database: DatabaseConfig::default(),
        scheduler: SchedulerConfig::Local(LocalConfig::default()),
        poll_retry: retry,
        log_retry: retry,
        stages: (1..=stages)
            .map(|number| StageConfig {
                name: format!("stage{number}"),
                replicas: 4,
                seed: SeedMode::Best,
                optimizer: OptimizerConfig::Raxml(RaxmlConfig::default()),
                wait: WaitConfig::default(),
            })
            .collect(),
    }
}

pub fn result_set(scores: &[(&str, f64)]) -> ResultSet {
    let results = scores
        .iter()
        .map(|(id, score)| result(id, *score, 100))
        .collect::<Vec<_>>();

    ResultSet::new(results, Duration::from_secs(600), scores.len(), scores.len()).unwrap()
}
