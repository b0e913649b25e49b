use super::{
    parse_number, read_artifact, run_time, start_scores, InvocationContext, Optimizer,
    OptimizerError, ProgressSample,
};
use crate::{collector::ArtifactPattern, config::FasttreeConfig, result::RunResult};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use tracing::debug;

const TREE: ArtifactPattern = ArtifactPattern::new("", ".fasttree.tree");
const LOG: ArtifactPattern = ArtifactPattern::new("", ".fasttree.log");

static PROGRESS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"LogLk\s*=\s*(-?[\d.]+).*?Time\s+([\d.]+)").expect("valid regex")
});
static LIKELIHOOD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"LogLk\s*=\s*(-?[\d.]+)").expect("valid regex"));
static TOTAL_TIME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Total time:\s*([\d.]+)\s*seconds").expect("valid regex"));
static VERSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)FastTree\s+version\s+([\d.]+)").expect("valid regex"));

/// FastTree approximate maximum likelihood
#[derive(Debug, Clone)]
pub struct Fasttree {
    config: FasttreeConfig,
}

impl Fasttree {
    pub fn load(config: &FasttreeConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }
}

impl Optimizer for Fasttree {
    fn label(&self) -> &'static str {
        "FastTree"
    }

    fn program(&self) -> &Path {
        &self.config.program
    }

    fn seed_max(&self) -> u64 {
        0x7FFF_FFFF
    }

    fn build_invocation(&self, context: &InvocationContext) -> Result<Vec<String>, OptimizerError> {
        if !context.outgroups.is_empty() {
            debug!("FastTree has no outgroup option, trees stay unrooted");
        }

        let mut args = ["-nt", "-gtr", "-gamma", "-quiet", "-seed"]
            .map(str::to_owned)
            .to_vec();
        args.extend([
            context.seed.to_string(),
            "-log".to_owned(),
            LOG.path(context.output_dir, context.replica_id)
                .to_string_lossy()
                .into_owned(),
            "-out".to_owned(),
            TREE.path(context.output_dir, context.replica_id)
                .to_string_lossy()
                .into_owned(),
        ]);

        if let Some(start_tree) = context.start_tree {
            args.push("-intree".to_owned());
            args.push(start_tree.to_string_lossy().into_owned());
        }
        args.push(context.source.to_string_lossy().into_owned());

        Ok(args)
    }

    fn progress_log(&self, output_dir: &Path, replica_id: &str) -> PathBuf {
        LOG.path(output_dir, replica_id)
    }

    /// `... LogLk = X ... Time Y` lines
    fn parse_progress_log(
        &self,
        path: &Path,
        content: &str,
    ) -> Result<Vec<ProgressSample>, OptimizerError> {
        content
            .lines()
            .filter_map(|line| PROGRESS.captures(line))
            .map(|captures| {
                Ok(ProgressSample {
                    elapsed: parse_number(path, &captures[2], "time")?,
                    score: -parse_number(path, &captures[1], "likelihood")?,
                })
            })
            .collect()
    }

    fn tree_artifact(&self) -> ArtifactPattern {
        TREE
    }

    fn parse_final_result(
        &self,
        output_dir: &Path,
        replica_id: &str,
    ) -> Result<RunResult, OptimizerError> {
        let tree = TREE.path(output_dir, replica_id);
        if !tree.is_file() {
            return Err(OptimizerError::MissingResult {
                replica_id: replica_id.to_owned(),
                output_dir: output_dir.to_path_buf(),
            });
        }

        let log_path = LOG.path(output_dir, replica_id);
        let log = read_artifact(&log_path)?;
        let samples = self.parse_progress_log(&log_path, &log)?;

        let score = match LIKELIHOOD.captures_iter(&log).last() {
            Some(captures) => -parse_number(&log_path, &captures[1], "likelihood")?,
            None => return Err(OptimizerError::parse(&log_path, "no likelihood reported")),
        };
        let elapsed = match TOTAL_TIME.captures(&log) {
            Some(captures) => parse_number(&log_path, &captures[1], "total time")?,
            None => samples.last().map_or(0.0, |sample| sample.elapsed),
        };

        Ok(RunResult {
            replica_id: replica_id.to_owned(),
            score,
            tree,
            start_scores: start_scores(&samples),
            elapsed: run_time(&log_path, elapsed)?,
        })
    }

    fn version_probe(&self) -> (&'static [&'static str], &'static Regex) {
        (&["-expert"], &VERSION)
    }
}
