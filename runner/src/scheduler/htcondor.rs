use super::{
    run_command, stream_path, summarize, BatchHandle, JobRef, PollStatus, Scheduler, SchedulerError,
    SubmitRequest, TaskState,
};
use crate::config::HtCondorConfig;
use itertools::Itertools;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_repr::Deserialize_repr;
use std::{
    collections::BTreeMap,
    env,
    fmt::Write as _,
    fs::{self, File, Permissions},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    process::Command,
    time::Duration,
};
use tracing::{error, info, instrument, warn};

const CONDOR_LOG: &str = "condor.log";
const CONDOR_DESC: &str = "condor.desc";
const DEFAULT_REQUEST_MEMORY: u64 = 2000;

static PROC_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\*\*\s+Proc\s+(\d+)\.(\d+):").expect("valid regex"));

/// HTCondor client driving the condor_* command line tools
#[derive(Debug)]
pub struct HtCondorScheduler {
    config: HtCondorConfig,
}

/// native JobStatus codes as reported by condor_q
#[derive(Deserialize_repr, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CondorStatus {
    Idle = 1,
    Running = 2,
    Removed = 3,
    Completed = 4,
    Held = 5,
    TransferringOutput = 6,
    Suspended = 7,
}

impl CondorStatus {
    pub fn task_state(self) -> TaskState {
        match self {
            Self::Idle | Self::Suspended => TaskState::Pending,
            Self::Running | Self::TransferringOutput => TaskState::Running,
            Self::Removed => TaskState::Removed,
            Self::Completed => TaskState::Completed,
            // a held task never progresses without an operator
            Self::Held => TaskState::Failed,
        }
    }
}

#[derive(Deserialize, Debug, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct QueueEntry {
    pub cluster_id: u64,
    pub proc_id: u64,
    pub job_status: CondorStatus,
    pub hold_reason: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
enum WaitOutcome {
    Done,
    Expired,
    Unrecognized,
}

impl HtCondorScheduler {
    pub fn load(config: &HtCondorConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// render the submit description, one queue statement per replica
    fn describe(&self, request: &SubmitRequest, program: &Path, workdir: &Path) -> String {
        let mut desc = vec![
            ("universe", "vanilla".to_owned()),
            ("executable", program.to_string_lossy().into_owned()),
            ("should_transfer_files", "NO".to_owned()),
        ];

        match self.config.email {
            Some(ref email) => {
                desc.push(("notify_user", email.clone()));
                desc.push(("notification", "Error".to_owned()));
            }
            None => desc.push(("notification", "Never".to_owned())),
        }

        if !self.config.machines.is_empty() {
            desc.push((
                "Requirements",
                format!(
                    "({})",
                    self.config
                        .machines
                        .iter()
                        .map(|machine| format!("machine == \"{machine}\""))
                        .join(" || ")
                ),
            ));
        }

        desc.extend([
            (
                "request_memory",
                self.config
                    .request_memory
                    .unwrap_or(DEFAULT_REQUEST_MEMORY)
                    .to_string(),
            ),
            ("request_cpus", "1".to_owned()),
            ("initialdir", workdir.to_string_lossy().into_owned()),
            (
                "log",
                workdir.join(CONDOR_LOG).to_string_lossy().into_owned(),
            ),
            (
                "description",
                format!("{} {}", request.description, workdir.to_string_lossy()),
            ),
        ]);

        let mut rendered = String::new();
        for (key, value) in desc {
            let _ = writeln!(rendered, "{key} = {value}");
        }
        rendered.push('\n');

        for (index, args) in request.argv.iter().enumerate() {
            let _ = writeln!(rendered, "arguments = {}", condor_arguments(args));
            let _ = writeln!(
                rendered,
                "error = {}",
                stream_path(workdir, index, "stderr").to_string_lossy()
            );
            if self.config.capture_stdout {
                let _ = writeln!(
                    rendered,
                    "output = {}",
                    stream_path(workdir, index, "stdout").to_string_lossy()
                );
            }
            rendered.push_str("queue\n\n");
        }

        rendered
    }

    /// create the batch directory and the per task stream files, writable by remote processes
    fn prepare(&self, request: &SubmitRequest) -> Result<PathBuf, std::io::Error> {
        fs::create_dir_all(request.workdir.join("output"))?;
        let workdir = fs::canonicalize(&request.workdir)?;
        // remote processes may run as user nobody
        fs::set_permissions(&workdir, Permissions::from_mode(0o777))?;

        for index in 0..request.argv.len() {
            let mut streams = vec![stream_path(&workdir, index, "stderr")];
            if self.config.capture_stdout {
                streams.push(stream_path(&workdir, index, "stdout"));
            }

            for stream in streams {
                File::create(&stream)?;
                fs::set_permissions(&stream, Permissions::from_mode(0o777))?;
            }
        }

        Ok(workdir)
    }

    fn queue_status(&self, handle: &BatchHandle) -> Result<PollStatus, SchedulerError> {
        let output = run_command(
            Command::new("condor_q")
                .arg(&handle.job.0)
                .arg("-json")
                .arg("-attributes")
                .arg("ClusterId,ProcId,JobStatus,HoldReason"),
        )?;

        if !output.success {
            return Err(SchedulerError::Poll(format!(
                "condor_q failed for cluster {}: {}",
                handle.job,
                output.stderr.trim()
            )));
        }

        let entries = parse_queue(&output.stdout)?;
        for entry in entries
            .iter()
            .filter(|entry| entry.job_status == CondorStatus::Held)
        {
            warn!(
                cluster = entry.cluster_id,
                proc = entry.proc_id,
                reason = entry.hold_reason.as_deref().unwrap_or("unknown"),
                "Task is held"
            );
        }

        Ok(summarize(
            handle.submitted_count(),
            entries.iter().map(|entry| entry.job_status.task_state()),
        ))
    }
}

impl Scheduler for HtCondorScheduler {
    #[instrument(skip_all, fields(description = %request.description), level = "info")]
    fn submit(&mut self, request: &SubmitRequest) -> Result<JobRef, SchedulerError> {
        let workdir = self.prepare(request).map_err(|e| {
            SchedulerError::Submission(format!(
                "{} is not writable: {e}",
                request.workdir.to_string_lossy()
            ))
        })?;

        let desc_path = workdir.join(CONDOR_DESC);
        fs::write(
            &desc_path,
            self.describe(request, &resolve_program(&request.program), &workdir),
        )
        .map_err(|e| SchedulerError::Submission(format!("failed to write {CONDOR_DESC}: {e}")))?;
        info!(desc = %desc_path.to_string_lossy(), "HTCondor desc written");

        let output = run_command(Command::new("condor_submit").arg("-verbose").arg(&desc_path))?;

        match parse_submit_output(&output.stdout) {
            Some(clusters) => match single_cluster(&clusters, request.argv.len()) {
                Ok(cluster) => {
                    info!(cluster = %cluster, tasks = request.argv.len(), "Submitted to HTCondor");

                    Ok(JobRef(cluster))
                }
                Err(reason) => {
                    // task indices are proc ids of one complete cluster
                    remove_clusters(clusters.keys());

                    Err(SchedulerError::Submission(reason))
                }
            },
            None => {
                error!(
                    stdout = %output.stdout,
                    stderr = %output.stderr,
                    "Cluster id not found in the submission results"
                );

                Err(SchedulerError::Submission(
                    "cluster id not found in the condor_submit output".to_owned(),
                ))
            }
        }
    }

    fn poll(
        &mut self,
        handle: &BatchHandle,
        timeout: Option<Duration>,
    ) -> Result<PollStatus, SchedulerError> {
        let mut command = Command::new("condor_wait");
        if let Some(timeout) = timeout {
            command
                .arg("-wait")
                .arg(timeout.as_secs().max(1).to_string());
        }
        command.arg(handle.output_dir.join(CONDOR_LOG));

        // the exit code is ignored, condor_wait exits with 1 on timeout
        let output = run_command(&mut command)?.stdout;

        match classify_wait_output(&output) {
            WaitOutcome::Done => Ok(PollStatus::Completed),
            WaitOutcome::Expired => self.queue_status(handle),
            WaitOutcome::Unrecognized => Err(SchedulerError::Poll(format!(
                "unrecognized condor_wait output: {}",
                output.trim()
            ))),
        }
    }

    fn kill(&mut self, handle: &BatchHandle, replicas: &[String]) {
        let tasks = handle
            .task_indices(replicas)
            .map(|index| format!("{}.{index}", handle.job))
            .collect_vec();

        if tasks.is_empty() {
            return;
        }

        info!(tasks = ?tasks, "condor_rm");
        // condor_rm exits with 1 when all the tasks to remove have already completed
        match run_command(Command::new("condor_rm").args(&tasks)) {
            Ok(output) if output.success => {}
            Ok(output) => info!(
                tasks = ?tasks,
                stderr = %output.stderr.trim(),
                "(ignored) condor_rm reported failure"
            ),
            Err(e) => warn!("(ignored) condor_rm failed: {e}"),
        }
    }
}

/// render an argument vector in the condor "new" arguments syntax
pub fn condor_arguments(args: &[String]) -> String {
    let rendered = args
        .iter()
        .map(|arg| {
            let escaped = arg.replace('"', "\"\"");
            if escaped.is_empty() || escaped.contains([' ', '\t', '\'']) {
                format!("'{}'", escaped.replace('\'', "''"))
            } else {
                escaped
            }
        })
        .join(" ");

    format!("\"{rendered}\"")
}

/// map cluster id to number of procs from `condor_submit -verbose` output
fn parse_submit_output(output: &str) -> Option<BTreeMap<String, usize>> {
    let clusters = output
        .lines()
        .filter_map(|line| PROC_LINE.captures(line))
        .fold(BTreeMap::new(), |mut clusters, captures| {
            *clusters.entry(captures[1].to_owned()).or_insert(0) += 1;
            clusters
        });

    (!clusters.is_empty()).then_some(clusters)
}

/// the cluster holding every task of a submission
fn single_cluster(clusters: &BTreeMap<String, usize>, expected: usize) -> Result<String, String> {
    if clusters.len() > 1 {
        return Err(format!(
            "submission was split into clusters {}",
            clusters.keys().join(", ")
        ));
    }

    match clusters.iter().next() {
        Some((cluster, &procs)) if procs == expected => Ok(cluster.clone()),
        Some((cluster, procs)) => Err(format!(
            "cluster {cluster} queued {procs} of {expected} tasks"
        )),
        None => Err("no cluster was queued".to_owned()),
    }
}

fn remove_clusters<'a>(clusters: impl IntoIterator<Item = &'a String>) {
    let clusters = clusters.into_iter().collect_vec();
    warn!(clusters = ?clusters, "Removing incomplete submission");

    if let Err(e) = run_command(Command::new("condor_rm").args(&clusters)) {
        warn!("(ignored) condor_rm failed: {e}");
    }
}

fn classify_wait_output(output: &str) -> WaitOutcome {
    if output.contains("All jobs done.") {
        WaitOutcome::Done
    } else if output.contains("Time expired.") {
        WaitOutcome::Expired
    } else {
        WaitOutcome::Unrecognized
    }
}

/// parse `condor_q -json`, which prints nothing at all for an empty queue
pub fn parse_queue(output: &str) -> Result<Vec<QueueEntry>, SchedulerError> {
    if output.trim().is_empty() {
        return Ok(Vec::new());
    }

    serde_json::from_str(output)
        .map_err(|e| SchedulerError::Poll(format!("cannot parse condor_q output: {e}")))
}

/// condor wants an absolute executable, resolve bare program names on PATH
fn resolve_program(program: &Path) -> PathBuf {
    if program.components().count() > 1 {
        return fs::canonicalize(program).unwrap_or_else(|_| program.to_path_buf());
    }

    env::var_os("PATH")
        .and_then(|paths| {
            env::split_paths(&paths)
                .map(|dir| dir.join(program))
                .find(|candidate| candidate.is_file())
        })
        .unwrap_or_else(|| program.to_path_buf())
}
