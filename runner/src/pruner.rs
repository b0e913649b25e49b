/*
 * Survival pruning of a running batch:
 * 1. Replicas with a tree artifact are completed, the others are still running
 * 2. The best completed replica (lowest last progress score) is the reference
 * 3. Running replicas that trail the reference are candidates, by default only when they also
 *    ran longer than it
 * 4. The worst floor(kill_rate * candidates) of them are killed and no longer tracked
 */

use crate::{
    config::SurvivalConfig,
    optimizer::{Optimizer, ProgressSample},
    scheduler::{BatchHandle, Scheduler},
    util::RetryPolicy,
};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

/// predicate deciding which running replicas may be compared against the reference
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Gate {
    /// ran longer than the reference and is still worse
    #[default]
    LongerAndWorse,
    /// is worse than the reference, regardless of time
    Worse,
}

impl Gate {
    fn admits(self, reference: &ProgressSample, sample: &ProgressSample) -> bool {
        let worse = sample.score > reference.score;

        match self {
            Self::LongerAndWorse => worse && sample.elapsed > reference.elapsed,
            Self::Worse => worse,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SurvivalPolicy {
    pub kill_rate: f64,
    pub gate: Gate,
}

impl From<&SurvivalConfig> for SurvivalPolicy {
    fn from(config: &SurvivalConfig) -> Self {
        Self {
            kill_rate: config.kill_rate,
            gate: config.gate,
        }
    }
}

impl SurvivalPolicy {
    /// how many of `candidates` may go in one cycle
    pub fn quota(&self, candidates: usize) -> usize {
        let quota = (self.kill_rate.clamp(0.0, 1.0) * candidates as f64).floor() as usize;

        quota.min(candidates)
    }
}

/// Decide which running replicas to kill given the best completed sample. Replicas without any
/// progress sample are never candidates.
pub fn select_victims<'a>(
    best_completed: &ProgressSample,
    running: impl IntoIterator<Item = (&'a str, Option<ProgressSample>)>,
    policy: &SurvivalPolicy,
) -> Vec<String> {
    let candidates = running
        .into_iter()
        .filter_map(|(replica, sample)| sample.map(|sample| (replica, sample)))
        .filter(|(_, sample)| policy.gate.admits(best_completed, sample))
        .sorted_by(|(a_id, a), (b_id, b)| a.score.total_cmp(&b.score).then(a_id.cmp(b_id)))
        .collect_vec();

    let quota = policy.quota(candidates.len());
    debug!(
        candidates = candidates.len(),
        quota = quota,
        "Survival candidates"
    );

    // worst ones are at the end
    candidates[candidates.len() - quota..]
        .iter()
        .map(|(replica, _)| (*replica).to_owned())
        .collect()
}

/// Applies a survival policy to a batch once per poll cycle
#[derive(Debug, Clone)]
pub struct SurvivalPruner {
    policy: SurvivalPolicy,
    log_retry: RetryPolicy,
}

impl SurvivalPruner {
    pub fn new(policy: SurvivalPolicy, log_retry: RetryPolicy) -> Self {
        Self { policy, log_retry }
    }

    pub fn policy(&self) -> &SurvivalPolicy {
        &self.policy
    }

    /// last progress sample of a replica, unreadable logs take the replica out of this cycle
    fn last_sample<O: Optimizer>(
        &self,
        optimizer: &O,
        handle: &BatchHandle,
        replica: &str,
    ) -> Option<ProgressSample> {
        match optimizer.parse_progress(&handle.output_dir, replica, &self.log_retry) {
            Ok(samples) => samples.last().copied(),
            Err(e) => {
                warn!(replica = replica, "(ignored) {e}");
                None
            }
        }
    }

    /// Run one pruning cycle, returns the killed replica ids which are no longer tracked by the
    /// handle.
    #[instrument(skip_all, fields(job = %handle.job), level = "debug")]
    pub fn prune<O: Optimizer, S: Scheduler>(
        &self,
        handle: &mut BatchHandle,
        optimizer: &O,
        scheduler: &mut S,
    ) -> Vec<String> {
        let (completed, running): (Vec<_>, Vec<_>) = handle
            .replica_ids
            .iter()
            .cloned()
            .partition(|replica| optimizer.is_complete(&handle.output_dir, replica));

        if completed.is_empty() || running.is_empty() {
            return Vec::new();
        }

        let Some(best_completed) = completed
            .iter()
            .filter_map(|replica| self.last_sample(optimizer, handle, replica))
            .min_by(|a, b| a.score.total_cmp(&b.score))
        else {
            return Vec::new();
        };

        let samples = running
            .iter()
            .map(|replica| (replica.as_str(), self.last_sample(optimizer, handle, replica)))
            .collect_vec();
        let victims = select_victims(&best_completed, samples, &self.policy);

        if !victims.is_empty() {
            info!(
                completed = completed.len(),
                best_score = best_completed.score,
                best_elapsed = best_completed.elapsed,
                victims = ?victims,
                "Killing replicas trailing the best completed one"
            );
            scheduler.kill(handle, &victims);

            for victim in &victims {
                handle.replica_ids.remove(victim);
            }
        }

        victims
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::RaxmlConfig,
        optimizer::Raxml,
        testing::{handle_for, FakeScheduler},
    };
    use std::fs;
    use tempfile::tempdir;

    fn sample(elapsed: f64, score: f64) -> ProgressSample {
        ProgressSample { elapsed, score }
    }

    const HALF: SurvivalPolicy = SurvivalPolicy {
        kill_rate: 0.5,
        gate: Gate::LongerAndWorse,
    };

    #[test]
    fn single_candidate_at_half_rate_survives() {
        // replica 2 finished with 10 at t=100
        let best = sample(100.0, 10.0);
        let running = [
            ("r.1", Some(sample(150.0, 15.0))),
            ("r.3", Some(sample(50.0, 5.0))),
            ("r.4", None),
        ];

        assert!(select_victims(&best, running, &HALF).is_empty());
    }

    #[test]
    fn kills_the_worse_of_two_candidates() {
        let best = sample(100.0, 10.0);
        let running = [
            ("r.1", Some(sample(150.0, 15.0))),
            ("r.3", Some(sample(120.0, 20.0))),
            ("r.4", None),
        ];

        assert_eq!(select_victims(&best, running, &HALF), vec!["r.3".to_owned()]);
    }

    #[test]
    fn never_kills_replicas_that_ran_shorter() {
        let best = sample(100.0, 10.0);
        let running = [
            ("a", Some(sample(100.0, 50.0))),
            ("b", Some(sample(99.0, 40.0))),
            ("c", Some(sample(10.0, 30.0))),
        ];
        let policy = SurvivalPolicy {
            kill_rate: 1.0,
            gate: Gate::LongerAndWorse,
        };

        assert!(select_victims(&best, running, &policy).is_empty());
    }

    #[test]
    fn zero_rate_kills_nothing() {
        let best = sample(1.0, 1.0);
        let names = ["a", "b", "c", "d", "e", "f", "g", "h", "i", "j"];
        let running = (0..10)
            .map(|i| (names[i], Some(sample(5.0, 9.0 + i as f64))))
            .collect_vec();
        let policy = SurvivalPolicy {
            kill_rate: 0.0,
            gate: Gate::LongerAndWorse,
        };

        assert!(select_victims(&best, running, &policy).is_empty());
    }

    #[test]
    fn kills_at_most_quota() {
        let best = sample(1.0, 1.0);
        let names = ["a", "b", "c", "d", "e", "f", "g"];
        let running = names
            .iter()
            .enumerate()
            .map(|(i, name)| (*name, Some(sample(5.0, 2.0 + i as f64))))
            .collect_vec();
        let policy = SurvivalPolicy {
            kill_rate: 0.3,
            gate: Gate::LongerAndWorse,
        };

        // floor(0.3 * 7) = 2, the two worst ones
        assert_eq!(
            select_victims(&best, running, &policy),
            vec!["f".to_owned(), "g".to_owned()]
        );
    }

    #[test]
    fn worse_gate_ignores_time() {
        let best = sample(100.0, 10.0);
        let running = [("young", Some(sample(5.0, 30.0))), ("old", Some(sample(500.0, 12.0)))];
        let policy = SurvivalPolicy {
            kill_rate: 0.5,
            gate: Gate::Worse,
        };

        assert_eq!(select_victims(&best, running, &policy), vec!["young".to_owned()]);
    }

    #[test]
    fn gate_names() {
        assert_eq!(
            serde_yaml::from_str::<Gate>("longer-and-worse").unwrap(),
            Gate::LongerAndWorse
        );
        assert_eq!(serde_yaml::from_str::<Gate>("worse").unwrap(), Gate::Worse);
    }

    #[test]
    fn prunes_batch_through_scheduler() {
        let dir = tempdir().unwrap();
        let ids = ["h3.0000", "h3.0001", "h3.0002", "h3.0003"];
        let mut handle = handle_for(dir.path(), &ids);
        // h3.0001 is done, h3.0000 and h3.0002 trail it after a longer run, h3.0003 just started
        fs::write(dir.path().join("RAxML_bestTree.h3.0001"), "(a,b);").unwrap();
        fs::write(dir.path().join("RAxML_log.h3.0001"), "50 -200\n100 -100\n").unwrap();
        fs::write(dir.path().join("RAxML_log.h3.0000"), "150 -150\n").unwrap();
        fs::write(dir.path().join("RAxML_log.h3.0002"), "120 -400\n").unwrap();
        fs::write(dir.path().join("RAxML_log.h3.0003"), "").unwrap();

        let mut scheduler = FakeScheduler::default();
        let pruner = SurvivalPruner::new(HALF, RetryPolicy::immediate(1));
        let victims = pruner.prune(
            &mut handle,
            &Raxml::load(&RaxmlConfig::default()),
            &mut scheduler,
        );

        assert_eq!(victims, vec!["h3.0002".to_owned()]);
        assert_eq!(scheduler.killed, vec!["h3.0002".to_owned()]);
        assert!(!handle.replica_ids.contains("h3.0002"));
        assert_eq!(handle.replica_ids.len(), 3);
        // the handle still remembers every submitted replica
        assert_eq!(handle.submitted_count(), 4);
    }

    #[test]
    fn nothing_completed_nothing_pruned() {
        let dir = tempdir().unwrap();
        let mut handle = handle_for(dir.path(), &["h3.0000", "h3.0001"]);
        fs::write(dir.path().join("RAxML_log.h3.0000"), "150 -150\n").unwrap();

        let mut scheduler = FakeScheduler::default();
        let pruner = SurvivalPruner::new(
            SurvivalPolicy {
                kill_rate: 1.0,
                gate: Gate::Worse,
            },
            RetryPolicy::immediate(1),
        );

        assert!(pruner
            .prune(&mut handle, &Raxml::load(&RaxmlConfig::default()), &mut scheduler)
            .is_empty());
        assert!(scheduler.killed.is_empty());
    }
}
