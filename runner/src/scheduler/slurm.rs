/*
 * Slurm client:
 * 1. Render one array job script that dispatches on SLURM_ARRAY_TASK_ID
 * 2. Submit with sbatch --parsable, the job id is the batch reference
 * 3. Poll with squeue, tasks that left the queue are done
 * 4. Kill single array tasks with scancel
 */

use super::{
    run_command, summarize, BatchHandle, JobRef, PollStatus, Scheduler, SchedulerError,
    SubmitRequest, TaskState,
};
use crate::{config::SlurmConfig, util::shell_join};
use itertools::Itertools;
use std::{
    fmt::Write as _,
    fs::{self, Permissions},
    os::unix::fs::PermissionsExt,
    process::Command,
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, info, instrument, warn};

const SLURM_SCRIPT: &str = "slurm.sh";

#[derive(Debug)]
pub struct SlurmScheduler {
    config: SlurmConfig,
}

impl SlurmScheduler {
    pub fn load(config: &SlurmConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    fn script(&self, request: &SubmitRequest) -> String {
        let program = request.program.to_string_lossy();
        let mut script = String::from("#!/bin/sh\ncase \"$SLURM_ARRAY_TASK_ID\" in\n");

        for (index, args) in request.argv.iter().enumerate() {
            let _ = writeln!(
                script,
                "  {index}) exec {} ;;",
                shell_join(std::iter::once(&*program).chain(args.iter().map(String::as_str)))
            );
        }

        script.push_str("  *) echo \"unknown task $SLURM_ARRAY_TASK_ID\" >&2; exit 2 ;;\nesac\n");
        script
    }

    fn queue_status(&self, handle: &BatchHandle) -> Result<PollStatus, SchedulerError> {
        let output = run_command(
            Command::new("squeue")
                .args(["-h", "-r", "-j"])
                .arg(&handle.job.0)
                .args(["-o", "%K %T"]),
        )?;

        if !output.success {
            // squeue refuses job ids that were purged after the whole array left the queue
            if output.stderr.contains("Invalid job id") {
                debug!(job = %handle.job, "squeue does not know the job anymore");
                return Ok(PollStatus::Completed);
            }

            return Err(SchedulerError::Poll(format!(
                "squeue failed for job {}: {}",
                handle.job,
                output.stderr.trim()
            )));
        }

        let states = parse_queue(&output.stdout)?;
        Ok(summarize(handle.submitted_count(), states))
    }
}

impl Scheduler for SlurmScheduler {
    #[instrument(skip_all, fields(description = %request.description), level = "info")]
    fn submit(&mut self, request: &SubmitRequest) -> Result<JobRef, SchedulerError> {
        if request.argv.is_empty() {
            return Err(SchedulerError::Submission("empty batch".to_owned()));
        }

        let script_path = request.workdir.join(SLURM_SCRIPT);
        fs::create_dir_all(request.workdir.join("output"))
            .and_then(|_| fs::write(&script_path, self.script(request)))
            .and_then(|_| fs::set_permissions(&script_path, Permissions::from_mode(0o755)))
            .map_err(|e| {
                SchedulerError::Submission(format!(
                    "{} is not writable: {e}",
                    request.workdir.to_string_lossy()
                ))
            })?;

        let mut command = Command::new("sbatch");
        command
            .arg("--parsable")
            .arg(format!("--array=0-{}", request.argv.len() - 1))
            .arg(format!("--job-name={}", request.description.replace(' ', "_")))
            .arg("--cpus-per-task=1")
            .arg(format!("--chdir={}", request.workdir.to_string_lossy()))
            .arg(format!(
                "--output={}",
                request.workdir.join("output/%4a.stdout").to_string_lossy()
            ))
            .arg(format!(
                "--error={}",
                request.workdir.join("output/%4a.stderr").to_string_lossy()
            ));
        if let Some(ref partition) = self.config.partition {
            command.arg(format!("--partition={partition}"));
        }
        if let Some(memory) = self.config.request_memory {
            command.arg(format!("--mem={memory}M"));
        }
        if let Some(ref time_limit) = self.config.time_limit {
            command.arg(format!("--time={time_limit}"));
        }
        command.arg(&script_path);

        let output = run_command(&mut command)?;
        // --parsable prints "jobid" or "jobid;cluster"
        let job = output.stdout.trim().split(';').next().unwrap_or_default();

        if !output.success || job.is_empty() || !job.chars().all(|c| c.is_ascii_digit()) {
            return Err(SchedulerError::Submission(format!(
                "sbatch did not return a job id: {}",
                output.stderr.trim()
            )));
        }

        info!(job = job, tasks = request.argv.len(), "Submitted to Slurm");
        Ok(JobRef(job.to_owned()))
    }

    fn poll(
        &mut self,
        handle: &BatchHandle,
        timeout: Option<Duration>,
    ) -> Result<PollStatus, SchedulerError> {
        let start = Instant::now();
        let interval = Duration::from_secs(self.config.check_interval.max(1));

        loop {
            let status = self.queue_status(handle)?;
            if status.is_terminal() {
                return Ok(status);
            }

            let wait = match timeout {
                Some(timeout) => match timeout.checked_sub(start.elapsed()) {
                    Some(remaining) if !remaining.is_zero() => remaining.min(interval),
                    _ => return Ok(status),
                },
                None => interval,
            };

            thread::sleep(wait);
        }
    }

    fn kill(&mut self, handle: &BatchHandle, replicas: &[String]) {
        let tasks = handle
            .task_indices(replicas)
            .map(|index| format!("{}_{index}", handle.job))
            .collect_vec();

        if tasks.is_empty() {
            return;
        }

        info!(tasks = ?tasks, "scancel");
        match run_command(Command::new("scancel").args(&tasks)) {
            Ok(output) if output.success => {}
            Ok(output) => info!(
                tasks = ?tasks,
                stderr = %output.stderr.trim(),
                "(ignored) scancel reported failure"
            ),
            Err(e) => warn!("(ignored) scancel failed: {e}"),
        }
    }
}

/// Map slurm task states onto the shared vocabulary. Tasks that crashed on their own count as
/// completed, their missing result excludes them later on.
fn task_state(state: &str) -> Option<TaskState> {
    Some(match state {
        "PENDING" | "CONFIGURING" | "REQUEUED" | "REQUEUE_HOLD" | "REQUEUE_FED" | "RESIZING"
        | "SUSPENDED" => TaskState::Pending,
        "RUNNING" | "COMPLETING" | "STAGE_OUT" | "SIGNALING" => TaskState::Running,
        "COMPLETED" | "FAILED" | "TIMEOUT" | "OUT_OF_MEMORY" | "PREEMPTED" => {
            TaskState::Completed
        }
        "CANCELLED" | "REVOKED" => TaskState::Removed,
        "BOOT_FAIL" | "NODE_FAIL" | "DEADLINE" | "SPECIAL_EXIT" => TaskState::Failed,
        _ => return None,
    })
}

fn parse_queue(output: &str) -> Result<Vec<TaskState>, SchedulerError> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            let state = line.split_whitespace().nth(1).unwrap_or_default();
            // squeue may append a reason, e.g. "CANCELLED by 1000"
            task_state(state).ok_or_else(|| {
                SchedulerError::Poll(format!("unknown slurm task state in '{line}'"))
            })
        })
        .collect()
}
