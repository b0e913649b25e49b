use std::{error::Error, fmt::Display, iter, thread, time::Duration};
use tracing::debug;

/// Bounded retry with exponential backoff
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub const fn new(attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            attempts,
            initial_delay,
            max_delay,
        }
    }

    /// a policy that retries without sleeping, used by tests and dry runs
    pub const fn immediate(attempts: u32) -> Self {
        Self::new(attempts, Duration::ZERO, Duration::ZERO)
    }

    /// delay before attempt `attempt` (0 based, the first attempt never waits)
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(16));
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Run `op` until it succeeds or the attempts are used up. `retryable` decides whether an error
    /// is worth another attempt, anything else is returned immediately.
    pub fn run<T, E: Display>(
        &self,
        what: &str,
        mut op: impl FnMut() -> Result<T, E>,
        retryable: impl Fn(&E) -> bool,
    ) -> Result<T, E> {
        let attempts = self.attempts.max(1);
        let mut attempt = 0;

        loop {
            let delay = self.delay(attempt);
            if !delay.is_zero() {
                thread::sleep(delay);
            }

            match op() {
                Ok(value) => return Ok(value),
                Err(error) if retryable(&error) && attempt + 1 < attempts => {
                    debug!(
                        attempt = attempt + 1,
                        attempts = attempts,
                        "(ignored) {what} failed: {error}"
                    );
                }
                Err(error) => return Err(error),
            }

            attempt += 1;
        }
    }
}

/// render a duration as H:MM:SS, dropping fractional seconds
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();

    format!("{}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

/// an error followed by all of its sources, separated by ": "
pub fn error_chain(error: &(dyn Error + 'static)) -> String {
    iter::successors(Some(error), |&error| error.source())
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(": ")
}

/// quote a single argument for a POSIX shell
pub fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c))
    {
        arg.to_owned()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

pub fn shell_join<S: AsRef<str>>(parts: impl IntoIterator<Item = S>) -> String {
    parts
        .into_iter()
        .map(|part| shell_quote(part.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(10, Duration::from_secs(3), Duration::from_secs(30));

        assert_eq!(policy.delay(0), Duration::ZERO);
        assert_eq!(policy.delay(1), Duration::from_secs(3));
        assert_eq!(policy.delay(2), Duration::from_secs(6));
        assert_eq!(policy.delay(3), Duration::from_secs(12));
        assert_eq!(policy.delay(5), Duration::from_secs(30));
        assert_eq!(policy.delay(40), Duration::from_secs(30));
    }

    #[test]
    fn retry_stops_after_attempts() {
        let calls = Cell::new(0);
        let result: Result<(), String> = RetryPolicy::immediate(4).run(
            "op",
            || {
                calls.set(calls.get() + 1);
                Err("nope".to_owned())
            },
            |_| true,
        );

        assert!(result.is_err());
        assert_eq!(calls.get(), 4);
    }

    #[test]
    fn retry_skips_non_retryable() {
        let calls = Cell::new(0);
        let result: Result<(), String> = RetryPolicy::immediate(4).run(
            "op",
            || {
                calls.set(calls.get() + 1);
                Err("fatal".to_owned())
            },
            |_| false,
        );

        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn retry_recovers() {
        let calls = Cell::new(0);
        let result: Result<u32, String> = RetryPolicy::immediate(4).run(
            "op",
            || {
                calls.set(calls.get() + 1);
                if calls.get() < 3 {
                    Err("busy".to_owned())
                } else {
                    Ok(7)
                }
            },
            |_| true,
        );

        assert_eq!(result, Ok(7));
    }

    #[test]
    fn durations_render_like_timedelta() {
        assert_eq!(format_duration(Duration::from_secs_f64(3725.9)), "1:02:05");
        assert_eq!(format_duration(Duration::from_secs(90061)), "25:01:01");
        assert_eq!(format_duration(Duration::ZERO), "0:00:00");
    }

    #[test]
    fn error_chain_includes_sources() {
        let error = crate::report::ReportError::Write {
            path: "/data/h3/result.raxml.txt".into(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        };

        assert_eq!(
            error_chain(&error),
            "Failed to write report /data/h3/result.raxml.txt: disk full"
        );
    }

    #[test]
    fn quoting() {
        assert_eq!(shell_quote("/usr/bin/raxml"), "/usr/bin/raxml");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_join(["-n", "run 1"]), "-n 'run 1'");
    }
}
