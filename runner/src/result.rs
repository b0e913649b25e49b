use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSecondsWithFrac};
use std::{path::PathBuf, time::Duration};

/// One finished replica. Scores are lower-is-better for every optimizer kind.
#[serde_as]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RunResult {
    pub replica_id: String,
    pub score: f64,
    pub tree: PathBuf,
    // progress samples kept for reporting, usually first and last
    pub start_scores: Vec<f64>,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub elapsed: Duration,
}

/// Ranked results of one batch
#[serde_as]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ResultSet {
    pub results: Vec<RunResult>,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub longest_elapsed: Duration,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub overall_elapsed: Duration,
    pub submitted_count: usize,
    pub survived_count: usize,
}

impl ResultSet {
    /// Rank `results` ascending by score, `None` if there is nothing to rank.
    pub fn new(
        mut results: Vec<RunResult>,
        overall_elapsed: Duration,
        submitted_count: usize,
        survived_count: usize,
    ) -> Option<Self> {
        if results.is_empty() {
            return None;
        }

        results.sort_by(|a, b| a.score.total_cmp(&b.score));
        let longest_elapsed = results
            .iter()
            .map(|result| result.elapsed)
            .max()
            .unwrap_or_default();

        Some(Self {
            results,
            longest_elapsed,
            overall_elapsed,
            submitted_count,
            survived_count: survived_count.min(submitted_count),
        })
    }

    pub fn best(&self) -> &RunResult {
        // never empty, see `new`
        &self.results[0]
    }
}
