mod fasttree;
mod garli;
mod iqtree;
mod raxml;

pub use fasttree::Fasttree;
pub use garli::Garli;
pub use iqtree::Iqtree;
pub use raxml::Raxml;

use crate::{
    collector::{ArtifactPattern, Collector},
    config::OptimizerConfig,
    result::RunResult,
    util::RetryPolicy,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum OptimizerError {
    #[error("Progress log {} stayed unreadable: {reason}", path.to_string_lossy())]
    LogUnreadable { path: PathBuf, reason: String },
    #[error("Replica {replica_id} finished without a result in {}", output_dir.to_string_lossy())]
    MissingResult {
        replica_id: String,
        output_dir: PathBuf,
    },
    #[error("Failed to parse {}: {reason}", path.to_string_lossy())]
    Parse { path: PathBuf, reason: String },
    #[error("Optimizer IO failed")]
    Io(#[from] std::io::Error),
    #[error("Unrecognized {kind} version: {output}")]
    UnrecognizedVersion { kind: &'static str, output: String },
    #[error("Invalid artifact pattern")]
    Pattern(#[from] globset::Error),
}

impl OptimizerError {
    pub(crate) fn parse(path: &Path, reason: impl Into<String>) -> Self {
        Self::Parse {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }
}

/// One (elapsed seconds, score) point of a progress log, score is lower-is-better
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct ProgressSample {
    pub elapsed: f64,
    pub score: f64,
}

/// Everything that differs between two replicas of a batch
#[derive(Clone, Copy, Debug)]
pub struct InvocationContext<'a> {
    pub source: &'a Path,
    pub output_dir: &'a Path,
    pub replica_id: &'a str,
    pub seed: u64,
    pub start_tree: Option<&'a Path>,
    pub outgroups: &'a [String],
}

/// Per optimizer kind knowledge about arguments and output artifacts
pub trait Optimizer {
    /// human readable name used in descriptions and logs
    fn label(&self) -> &'static str;

    fn program(&self) -> &Path;

    /// largest seed the optimizer accepts, seeds start at 1
    fn seed_max(&self) -> u64;

    /// Arguments of one replica. May write per replica input files into the output directory.
    fn build_invocation(&self, context: &InvocationContext) -> Result<Vec<String>, OptimizerError>;

    fn progress_log(&self, output_dir: &Path, replica_id: &str) -> PathBuf;

    /// parse the content of a progress log, an incomplete line is a parse error
    fn parse_progress_log(
        &self,
        path: &Path,
        content: &str,
    ) -> Result<Vec<ProgressSample>, OptimizerError>;

    /// the tree artifact, its existence marks a completed replica
    fn tree_artifact(&self) -> ArtifactPattern;

    fn parse_final_result(
        &self,
        output_dir: &Path,
        replica_id: &str,
    ) -> Result<RunResult, OptimizerError>;

    /// arguments printing the version and the pattern capturing it
    fn version_probe(&self) -> (&'static [&'static str], &'static Regex);

    fn tree_path(&self, output_dir: &Path, replica_id: &str) -> PathBuf {
        self.tree_artifact().path(output_dir, replica_id)
    }

    fn is_complete(&self, output_dir: &Path, replica_id: &str) -> bool {
        self.tree_path(output_dir, replica_id).is_file()
    }

    /// Read the progress log of a replica that may still be writing it. A missing or empty log
    /// means the replica just started.
    fn parse_progress(
        &self,
        output_dir: &Path,
        replica_id: &str,
        retry: &RetryPolicy,
    ) -> Result<Vec<ProgressSample>, OptimizerError> {
        let path = self.progress_log(output_dir, replica_id);

        retry
            .run(
                "progress log read",
                || match fs::read_to_string(&path) {
                    Ok(content) => self.parse_progress_log(&path, &content),
                    Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
                    Err(e) => Err(OptimizerError::Io(e)),
                },
                |e| matches!(e, OptimizerError::Parse { .. } | OptimizerError::Io(_)),
            )
            .map_err(|e| OptimizerError::LogUnreadable {
                path: path.clone(),
                reason: e.to_string(),
            })
    }

    /// replica ids of every tree artifact in `output_dir`, including replicas never tracked
    fn discover(&self, output_dir: &Path) -> Result<Vec<String>, OptimizerError> {
        Ok(Collector::new(self.tree_artifact())?.collect(output_dir))
    }

    /// run the program and extract its version
    fn probe_version(&self) -> Result<String, OptimizerError> {
        let (args, pattern) = self.version_probe();
        let output = Command::new(self.program())
            .args(args)
            .stdin(Stdio::null())
            .output()?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));

        match pattern.captures(&text) {
            Some(captures) => {
                info!("{} {}", self.label(), &captures[1]);
                Ok(captures[1].to_owned())
            }
            None => Err(OptimizerError::UnrecognizedVersion {
                kind: self.label(),
                output: text.trim().to_owned(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Optimizers {
    Raxml(Raxml),
    Garli(Garli),
    Iqtree(Iqtree),
    Fasttree(Fasttree),
}

impl Optimizers {
    pub fn load(config: &OptimizerConfig) -> Self {
        match config {
            OptimizerConfig::Raxml(config) => Self::Raxml(Raxml::load(config)),
            OptimizerConfig::Garli(config) => Self::Garli(Garli::load(config)),
            OptimizerConfig::Iqtree(config) => Self::Iqtree(Iqtree::load(config)),
            OptimizerConfig::Fasttree(config) => Self::Fasttree(Fasttree::load(config)),
        }
    }

    fn inner(&self) -> &dyn Optimizer {
        match self {
            Self::Raxml(optimizer) => optimizer,
            Self::Garli(optimizer) => optimizer,
            Self::Iqtree(optimizer) => optimizer,
            Self::Fasttree(optimizer) => optimizer,
        }
    }
}

impl Optimizer for Optimizers {
    fn label(&self) -> &'static str {
        self.inner().label()
    }

    fn program(&self) -> &Path {
        self.inner().program()
    }

    fn seed_max(&self) -> u64 {
        self.inner().seed_max()
    }

    fn build_invocation(&self, context: &InvocationContext) -> Result<Vec<String>, OptimizerError> {
        self.inner().build_invocation(context)
    }

    fn progress_log(&self, output_dir: &Path, replica_id: &str) -> PathBuf {
        self.inner().progress_log(output_dir, replica_id)
    }

    fn parse_progress_log(
        &self,
        path: &Path,
        content: &str,
    ) -> Result<Vec<ProgressSample>, OptimizerError> {
        self.inner().parse_progress_log(path, content)
    }

    fn tree_artifact(&self) -> ArtifactPattern {
        self.inner().tree_artifact()
    }

    fn parse_final_result(
        &self,
        output_dir: &Path,
        replica_id: &str,
    ) -> Result<RunResult, OptimizerError> {
        self.inner().parse_final_result(output_dir, replica_id)
    }

    fn version_probe(&self) -> (&'static [&'static str], &'static Regex) {
        self.inner().version_probe()
    }
}

/// Hands out pseudo random seeds, never the same one twice
#[derive(Debug)]
pub struct SeedSource {
    rng: StdRng,
    issued: HashSet<u64>,
}

impl Default for SeedSource {
    fn default() -> Self {
        Self {
            rng: StdRng::from_os_rng(),
            issued: HashSet::new(),
        }
    }
}

impl SeedSource {
    /// reproducible seeds for tests
    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            issued: HashSet::new(),
        }
    }

    /// mark seeds handed out by an earlier process as taken
    pub fn reserve(&mut self, seeds: impl IntoIterator<Item = u64>) {
        self.issued.extend(seeds);
    }

    /// draw a seed within `1..=max`
    pub fn draw(&mut self, max: u64) -> u64 {
        loop {
            let seed = self.rng.random_range(1..=max.max(1));

            if self.issued.insert(seed) {
                debug!(seed = seed, "Drew seed");
                return seed;
            }
        }
    }
}

/// read a finished artifact, a missing file is a parse error of that artifact
pub(crate) fn read_artifact(path: &Path) -> Result<String, OptimizerError> {
    fs::read_to_string(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => OptimizerError::parse(path, "file not found"),
        _ => OptimizerError::Io(e),
    })
}

/// first and last score of the progress samples
pub(crate) fn start_scores(samples: &[ProgressSample]) -> Vec<f64> {
    match (samples.first(), samples.last()) {
        (Some(first), Some(last)) => vec![first.score, last.score],
        _ => Vec::new(),
    }
}

pub(crate) fn parse_number(path: &Path, value: &str, what: &str) -> Result<f64, OptimizerError> {
    let number = value
        .trim()
        .parse::<f64>()
        .map_err(|e| OptimizerError::parse(path, format!("invalid {what} '{value}': {e}")))?;

    if number.is_finite() {
        Ok(number)
    } else {
        Err(OptimizerError::parse(
            path,
            format!("{what} '{value}' is out of range"),
        ))
    }
}

/// replica run time from reported seconds, negative values count as zero
pub(crate) fn run_time(path: &Path, seconds: f64) -> Result<Duration, OptimizerError> {
    Duration::try_from_secs_f64(seconds.max(0.0))
        .map_err(|e| OptimizerError::parse(path, format!("elapsed time {seconds}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RaxmlConfig;
    use std::cell::Cell;
    use tempfile::tempdir;

    #[test]
    fn seeds_are_unique_and_in_range() {
        let mut seeds = SeedSource::from_seed(7);
        let drawn = (0..200).map(|_| seeds.draw(300)).collect::<HashSet<_>>();

        assert_eq!(drawn.len(), 200);
        assert!(drawn.iter().all(|seed| (1..=300).contains(seed)));
    }

    #[test]
    fn reserved_seeds_are_skipped() {
        let mut seeds = SeedSource::from_seed(1);
        seeds.reserve(1..=9);

        assert_eq!(seeds.draw(10), 10);
    }

    #[test]
    fn numbers_out_of_range_are_parse_errors() {
        let path = Path::new("RAxML_info.h3.0001");

        assert_eq!(parse_number(path, " 90.5", "time").unwrap(), 90.5);
        assert!(matches!(
            parse_number(path, "inf", "time"),
            Err(OptimizerError::Parse { .. })
        ));
        assert!(matches!(
            parse_number(path, &"9".repeat(400), "time"),
            Err(OptimizerError::Parse { .. })
        ));

        assert_eq!(run_time(path, -3.0).unwrap(), Duration::ZERO);
        assert_eq!(run_time(path, 90.5).unwrap(), Duration::from_secs_f64(90.5));
        assert!(matches!(
            run_time(path, 1e30),
            Err(OptimizerError::Parse { .. })
        ));
    }

    #[test]
    fn missing_log_is_just_started() {
        let dir = tempdir().unwrap();
        let optimizer = Optimizers::load(&OptimizerConfig::Raxml(RaxmlConfig::default()));

        let samples = optimizer
            .parse_progress(dir.path(), "h3.0000", &RetryPolicy::immediate(3))
            .unwrap();

        assert!(samples.is_empty());
    }

    #[test]
    fn empty_log_is_just_started() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("RAxML_log.h3.0000"), "").unwrap();
        let optimizer = Optimizers::load(&OptimizerConfig::Raxml(RaxmlConfig::default()));

        let samples = optimizer
            .parse_progress(dir.path(), "h3.0000", &RetryPolicy::immediate(3))
            .unwrap();

        assert!(samples.is_empty());
    }

    #[test]
    fn garbled_log_is_unreadable_after_retries() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("RAxML_log.h3.0000"), "12.5 -100.0\n13.0").unwrap();
        let optimizer = Optimizers::load(&OptimizerConfig::Raxml(RaxmlConfig::default()));

        let result = optimizer.parse_progress(dir.path(), "h3.0000", &RetryPolicy::immediate(3));

        assert!(matches!(
            result,
            Err(OptimizerError::LogUnreadable { .. })
        ));
    }

    /// an optimizer whose log becomes readable on the third attempt
    struct Flaky {
        inner: Raxml,
        reads: Cell<u32>,
    }

    impl Optimizer for Flaky {
        fn label(&self) -> &'static str {
            "flaky"
        }
        fn program(&self) -> &Path {
            self.inner.program()
        }
        fn seed_max(&self) -> u64 {
            self.inner.seed_max()
        }
        fn build_invocation(
            &self,
            context: &InvocationContext,
        ) -> Result<Vec<String>, OptimizerError> {
            self.inner.build_invocation(context)
        }
        fn progress_log(&self, output_dir: &Path, replica_id: &str) -> PathBuf {
            self.inner.progress_log(output_dir, replica_id)
        }
        fn parse_progress_log(
            &self,
            path: &Path,
            content: &str,
        ) -> Result<Vec<ProgressSample>, OptimizerError> {
            self.reads.set(self.reads.get() + 1);
            if self.reads.get() < 3 {
                return Err(OptimizerError::parse(path, "being written"));
            }
            self.inner.parse_progress_log(path, content)
        }
        fn tree_artifact(&self) -> ArtifactPattern {
            self.inner.tree_artifact()
        }
        fn parse_final_result(
            &self,
            output_dir: &Path,
            replica_id: &str,
        ) -> Result<RunResult, OptimizerError> {
            self.inner.parse_final_result(output_dir, replica_id)
        }
        fn version_probe(&self) -> (&'static [&'static str], &'static Regex) {
            self.inner.version_probe()
        }
    }

    #[test]
    fn log_read_is_retried() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("RAxML_log.r.0000"), "10.0 -50.0\n").unwrap();
        let optimizer = Flaky {
            inner: Raxml::load(&RaxmlConfig::default()),
            reads: Cell::new(0),
        };

        let samples = optimizer
            .parse_progress(dir.path(), "r.0000", &RetryPolicy::immediate(5))
            .unwrap();

        assert_eq!(optimizer.reads.get(), 3);
        assert_eq!(
            samples,
            vec![ProgressSample {
                elapsed: 10.0,
                score: 50.0
            }]
        );
    }

    #[test]
    fn discovers_tree_artifacts() {
        let dir = tempdir().unwrap();
        for name in [
            "RAxML_bestTree.h3.0001",
            "RAxML_bestTree.h3.0000",
            "RAxML_info.h3.0002",
            "RAxML_log.h3.0000",
        ] {
            fs::write(dir.path().join(name), "").unwrap();
        }
        let optimizer = Optimizers::load(&OptimizerConfig::Raxml(RaxmlConfig::default()));

        assert_eq!(
            optimizer.discover(dir.path()).unwrap(),
            vec!["h3.0000".to_owned(), "h3.0001".to_owned()]
        );
        assert!(optimizer.is_complete(dir.path(), "h3.0001"));
        assert!(!optimizer.is_complete(dir.path(), "h3.0002"));
    }
}
