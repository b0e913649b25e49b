use super::{
    parse_number, read_artifact, run_time, start_scores, InvocationContext, Optimizer,
    OptimizerError, ProgressSample,
};
use crate::{collector::ArtifactPattern, config::IqtreeConfig, result::RunResult};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};

const TREE: ArtifactPattern = ArtifactPattern::new("", ".treefile");
const LOG: ArtifactPattern = ArtifactPattern::new("", ".log");
const REPORT: ArtifactPattern = ArtifactPattern::new("", ".iqtree");

static ITERATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?m)^Iteration\s+\d+\s*/\s*LogL:\s*(-?[\d.]+)\s*/\s*Time:\s*(\d+)h:(\d+)m:(\d+)s",
    )
    .expect("valid regex")
});
static TREE_LIKELIHOOD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Log-likelihood of the tree:\s*(-?[\d.]+)").expect("valid regex")
});
static WALL_CLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Total wall-clock time used:\s*([\d.]+)\s*sec").expect("valid regex")
});
static VERSION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)IQ-TREE\s+(?:multicore\s+)?version\s+([\d.]+(?:-beta)?)")
        .expect("valid regex")
});

/// IQ-TREE stochastic NNI search
#[derive(Debug, Clone)]
pub struct Iqtree {
    config: IqtreeConfig,
}

impl Iqtree {
    pub fn load(config: &IqtreeConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }
}

impl Optimizer for Iqtree {
    fn label(&self) -> &'static str {
        "IQ-TREE"
    }

    fn program(&self) -> &Path {
        &self.config.program
    }

    fn seed_max(&self) -> u64 {
        0x7FFF_FFFF
    }

    fn build_invocation(&self, context: &InvocationContext) -> Result<Vec<String>, OptimizerError> {
        let mut args = vec![
            "-s".to_owned(),
            context.source.to_string_lossy().into_owned(),
            "-m".to_owned(),
            self.config.model.clone(),
            "-cptime".to_owned(),
            self.config.cptime.to_string(),
            "-nt".to_owned(),
            "1".to_owned(),
        ];

        if !context.outgroups.is_empty() {
            args.push("-o".to_owned());
            args.push(context.outgroups.join(","));
        }
        if let Some(start_tree) = context.start_tree {
            args.push("-t".to_owned());
            args.push(start_tree.to_string_lossy().into_owned());
        }

        args.extend([
            "-pre".to_owned(),
            context
                .output_dir
                .join(context.replica_id)
                .to_string_lossy()
                .into_owned(),
            "-seed".to_owned(),
            context.seed.to_string(),
        ]);

        Ok(args)
    }

    fn progress_log(&self, output_dir: &Path, replica_id: &str) -> PathBuf {
        LOG.path(output_dir, replica_id)
    }

    /// `Iteration N / LogL: X / Time: Hh:MMm:SSs` lines, everything else is chatter
    fn parse_progress_log(
        &self,
        path: &Path,
        content: &str,
    ) -> Result<Vec<ProgressSample>, OptimizerError> {
        ITERATION
            .captures_iter(content)
            .map(|captures| {
                let elapsed = parse_number(path, &captures[2], "hours")? * 3600.0
                    + parse_number(path, &captures[3], "minutes")? * 60.0
                    + parse_number(path, &captures[4], "seconds")?;

                Ok(ProgressSample {
                    elapsed,
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

        let report_path = REPORT.path(output_dir, replica_id);
        let report = read_artifact(&report_path)?;
        let score = match TREE_LIKELIHOOD.captures(&report) {
            Some(captures) => -parse_number(&report_path, &captures[1], "likelihood")?,
            None => {
                return Err(OptimizerError::parse(
                    &report_path,
                    "cannot extract tree likelihood",
                ))
            }
        };

        let log_path = LOG.path(output_dir, replica_id);
        let log = read_artifact(&log_path)?;
        let samples = self.parse_progress_log(&log_path, &log)?;

        let elapsed = match WALL_CLOCK.captures(&log) {
            Some(captures) => parse_number(&log_path, &captures[1], "wall-clock time")?,
            None => samples
                .last()
                .map(|sample| sample.elapsed)
                .ok_or_else(|| OptimizerError::parse(&log_path, "cannot extract wall-clock time"))?,
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
        (&["--version"], &VERSION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::{fs, time::Duration};
    use tempfile::tempdir;

    const LOG_TEXT: &str = "\
IQ-TREE multicore version 2.2.0 COVID-edition for Linux 64-bit built Jun  1 2022
Current log-likelihood at step 1: -60123.456
Iteration 10 / LogL: -58000.5 / Time: 0h:01m:05s (0h:10m:00s left)
Iteration 20 / LogL: -57500 / Time: 1h:00m:00s (0h:05m:00s left)
BEST SCORE FOUND : -57400.125
Total wall-clock time used: 3725.312 sec (1h:2m:5s)
";

    #[test]
    fn builds_arguments() {
        let iqtree = Iqtree::load(&IqtreeConfig::default());
        let outgroups = vec!["A".to_owned(), "B".to_owned()];

        let args = iqtree
            .build_invocation(&InvocationContext {
                source: Path::new("/d/source.fasta"),
                output_dir: Path::new("/d/iqtree"),
                replica_id: "h3.0000",
                seed: 5,
                start_tree: None,
                outgroups: &outgroups,
            })
            .unwrap();

        assert_eq!(
            args.join(" "),
            "-s /d/source.fasta -m GTR+I+G4 -cptime 600 -nt 1 -o A,B -pre /d/iqtree/h3.0000 -seed 5"
        );
    }

    #[test]
    fn parses_progress() {
        let samples = Iqtree::load(&IqtreeConfig::default())
            .parse_progress_log(Path::new("log"), LOG_TEXT)
            .unwrap();

        assert_eq!(
            samples,
            vec![
                ProgressSample {
                    elapsed: 65.0,
                    score: 58000.5
                },
                ProgressSample {
                    elapsed: 3600.0,
                    score: 57500.0
                },
            ]
        );
    }

    #[test]
    fn parses_final_result() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("h3.0000.treefile"), "(a,b,c);").unwrap();
        fs::write(dir.path().join("h3.0000.log"), LOG_TEXT).unwrap();
        fs::write(
            dir.path().join("h3.0000.iqtree"),
            "MAXIMUM LIKELIHOOD TREE\n\nLog-likelihood of the tree: -57400.125 (s.e. 512.3)\n",
        )
        .unwrap();

        let result = Iqtree::load(&IqtreeConfig::default())
            .parse_final_result(dir.path(), "h3.0000")
            .unwrap();

        assert_eq!(result.score, 57400.125);
        assert_eq!(result.start_scores, vec![58000.5, 57500.0]);
        assert_eq!(result.elapsed, Duration::from_secs_f64(3725.312));
    }

    #[test]
    fn recognizes_version() {
        assert_eq!(&VERSION.captures(LOG_TEXT).unwrap()[1], "2.2.0");
    }
}
