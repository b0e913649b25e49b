use super::{
    stream_path, summarize, BatchHandle, JobRef, PollStatus, Scheduler, SchedulerError,
    SubmitRequest, TaskState,
};
use nix::{
    sys::signal::{self, Signal},
    unistd::Pid,
};
use std::{
    collections::HashMap,
    fs::{self, File},
    process::{Child, Command, ExitStatus, Stdio},
    time::{Duration, Instant},
};
use tracing::{debug, info, instrument, warn};
use wait_timeout::ChildExt;

/// Runs every replica of a batch as a child process of the current process
#[derive(Debug, Default)]
pub struct LocalScheduler {
    batches: HashMap<JobRef, Vec<LocalTask>>,
    submitted: u64,
}

#[derive(Debug)]
struct LocalTask {
    child: Child,
    status: Option<ExitStatus>,
}

impl LocalTask {
    fn state(&self) -> TaskState {
        match self.status {
            Some(_) => TaskState::Completed,
            None => TaskState::Running,
        }
    }
}

impl LocalScheduler {
    fn spawn(request: &SubmitRequest, index: usize) -> Result<Child, std::io::Error> {
        let stdout = File::create(stream_path(&request.workdir, index, "stdout"))?;
        let stderr = File::create(stream_path(&request.workdir, index, "stderr"))?;

        Command::new(&request.program)
            .args(&request.argv[index])
            .current_dir(&request.workdir)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
    }
}

impl Scheduler for LocalScheduler {
    #[instrument(skip_all, fields(description = %request.description), level = "info")]
    fn submit(&mut self, request: &SubmitRequest) -> Result<JobRef, SchedulerError> {
        fs::create_dir_all(request.workdir.join("output")).map_err(|e| {
            SchedulerError::Submission(format!(
                "{} is not writable: {e}",
                request.workdir.to_string_lossy()
            ))
        })?;

        let mut tasks = Vec::with_capacity(request.argv.len());
        for index in 0..request.argv.len() {
            match Self::spawn(request, index) {
                Ok(child) => {
                    debug!(task = index, pid = child.id(), "Spawned replica");
                    tasks.push(LocalTask {
                        child,
                        status: None,
                    });
                }
                Err(e) => {
                    // all or nothing, take down what was already started
                    for task in tasks.iter_mut() {
                        let _ = task.child.kill();
                        let _ = task.child.wait();
                    }

                    return Err(SchedulerError::Submission(format!(
                        "failed to start {}: {e}",
                        request.program.to_string_lossy()
                    )));
                }
            }
        }

        self.submitted += 1;
        let job = JobRef(format!("local-{}-{}", std::process::id(), self.submitted));
        info!(job = %job, tasks = tasks.len(), "Started local batch");
        self.batches.insert(job.clone(), tasks);

        Ok(job)
    }

    fn poll(
        &mut self,
        handle: &BatchHandle,
        timeout: Option<Duration>,
    ) -> Result<PollStatus, SchedulerError> {
        let tasks = self
            .batches
            .get_mut(&handle.job)
            .ok_or_else(|| SchedulerError::UnknownJob(handle.job.clone()))?;
        let deadline = timeout.map(|timeout| Instant::now() + timeout);

        for task in tasks.iter_mut().filter(|task| task.status.is_none()) {
            task.status = match deadline {
                None => Some(task.child.wait()?),
                Some(deadline) => task
                    .child
                    .wait_timeout(deadline.saturating_duration_since(Instant::now()))?,
            };

            if let Some(status) = task.status {
                // a crashed replica shows up as a missing result later on
                if !status.success() {
                    debug!(
                        pid = task.child.id(),
                        status = %status,
                        "Replica exited unsuccessfully"
                    );
                }
            }
        }

        let status = summarize(tasks.len(), tasks.iter().map(LocalTask::state));
        // every child has been reaped, nothing is left to poll or kill
        if status == PollStatus::Completed {
            self.batches.remove(&handle.job);
            debug!(job = %handle.job, "Released finished batch");
        }

        Ok(status)
    }

    fn kill(&mut self, handle: &BatchHandle, replicas: &[String]) {
        let Some(tasks) = self.batches.get_mut(&handle.job) else {
            warn!(job = %handle.job, "(ignored) kill for an unknown batch");
            return;
        };

        for index in handle.task_indices(replicas) {
            let Some(task) = tasks.get_mut(index) else {
                continue;
            };
            if task.status.is_some() {
                continue;
            }

            let pid = Pid::from_raw(task.child.id() as i32);
            info!(task = index, pid = %pid, "SIGTERM");
            if let Err(e) = signal::kill(pid, Signal::SIGTERM) {
                info!(task = index, "(ignored) kill failed: {e}");
            }
        }
    }
}
