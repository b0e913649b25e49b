use super::{
    parse_number, read_artifact, run_time, start_scores, InvocationContext, Optimizer,
    OptimizerError, ProgressSample,
};
use crate::{collector::ArtifactPattern, config::RaxmlConfig, result::RunResult};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};

const TREE: ArtifactPattern = ArtifactPattern::new("RAxML_bestTree.", "");
const LOG: ArtifactPattern = ArtifactPattern::new("RAxML_log.", "");
const INFO: ArtifactPattern = ArtifactPattern::new("RAxML_info.", "");

static BEST_SCORE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)Final GAMMA-based Score of best tree (-?[\d.]+)").expect("valid regex")
});
static EXECUTION_TIME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)Overall execution time:\s+([\d.]+) secs").expect("valid regex")
});
static VERSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"RAxML\s+version\s+([\d.]+)").expect("valid regex"));

/// RAxML gradient based tree search
#[derive(Debug, Clone)]
pub struct Raxml {
    config: RaxmlConfig,
}

impl Raxml {
    pub fn load(config: &RaxmlConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }
}

impl Optimizer for Raxml {
    fn label(&self) -> &'static str {
        "RAxML"
    }

    fn program(&self) -> &Path {
        &self.config.program
    }

    fn seed_max(&self) -> u64 {
        0xFFFF_FFFF
    }

    fn build_invocation(&self, context: &InvocationContext) -> Result<Vec<String>, OptimizerError> {
        let mut args = vec![
            "-s".to_owned(),
            context.source.to_string_lossy().into_owned(),
            "-w".to_owned(),
            context.output_dir.to_string_lossy().into_owned(),
            "-m".to_owned(),
            self.config.model.clone(),
            "-e".to_owned(),
            self.config.model_optimization_precision.to_string(),
        ];
        args.extend(
            ["-T", "1", "-N", "1", "-c", "4", "-f", "d", "--silent", "--no-seq-check"]
                .map(str::to_owned),
        );

        if !context.outgroups.is_empty() {
            args.push("-o".to_owned());
            args.push(context.outgroups.join(","));
        }
        if let Some(start_tree) = context.start_tree {
            args.push("-t".to_owned());
            args.push(start_tree.to_string_lossy().into_owned());
        }
        if !self.config.bfgs {
            args.push("--no-bfgs".to_owned());
        }

        args.extend([
            "-n".to_owned(),
            context.replica_id.to_owned(),
            "-p".to_owned(),
            context.seed.to_string(),
        ]);

        Ok(args)
    }

    fn progress_log(&self, output_dir: &Path, replica_id: &str) -> PathBuf {
        LOG.path(output_dir, replica_id)
    }

    /// one `<seconds> <log likelihood>` pair per line
    fn parse_progress_log(
        &self,
        path: &Path,
        content: &str,
    ) -> Result<Vec<ProgressSample>, OptimizerError> {
        content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(number, line)| {
                let mut fields = line.split_whitespace();

                match (fields.next(), fields.next()) {
                    (Some(elapsed), Some(likelihood)) => Ok(ProgressSample {
                        elapsed: parse_number(path, elapsed, "time")?,
                        score: -parse_number(path, likelihood, "likelihood")?,
                    }),
                    _ => Err(OptimizerError::parse(
                        path,
                        format!("line {} is incomplete", number + 1),
                    )),
                }
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

        let info_path = INFO.path(output_dir, replica_id);
        let info = read_artifact(&info_path)?;
        let score = match BEST_SCORE.captures(&info) {
            Some(captures) => -parse_number(&info_path, &captures[1], "score")?,
            None => {
                return Err(OptimizerError::parse(
                    &info_path,
                    "cannot extract best score",
                ))
            }
        };

        let log_path = LOG.path(output_dir, replica_id);
        let samples = self.parse_progress_log(&log_path, &read_artifact(&log_path)?)?;

        let elapsed = match EXECUTION_TIME.captures(&info) {
            Some(captures) => parse_number(&info_path, &captures[1], "execution time")?,
            None => samples
                .last()
                .map(|sample| sample.elapsed)
                .ok_or_else(|| OptimizerError::parse(&info_path, "cannot extract execution time"))?,
        };

        Ok(RunResult {
            replica_id: replica_id.to_owned(),
            score,
            tree,
            start_scores: start_scores(&samples),
            elapsed: run_time(&info_path, elapsed)?,
        })
    }

    fn version_probe(&self) -> (&'static [&'static str], &'static Regex) {
        (&["-v"], &VERSION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::{fs, time::Duration};
    use tempfile::tempdir;

    const INFO_TEXT: &str = "\
This is RAxML version 8.2.12 released by Alexandros Stamatakis on May 2018.

Overall execution time: 7322.417 secs or 2.033999 hours or 0.084750 days

Final GAMMA-based Score of best tree -51234.125
";

    #[test]
    fn builds_arguments() {
        let raxml = Raxml::load(&RaxmlConfig {
            bfgs: false,
            ..RaxmlConfig::default()
        });
        let outgroups = vec!["A/HONG_KONG/1/1968".to_owned()];

        let args = raxml
            .build_invocation(&InvocationContext {
                source: Path::new("/d/source.fasta"),
                output_dir: Path::new("/d/raxml"),
                replica_id: "h3.0003",
                seed: 4711,
                start_tree: Some(Path::new("/d/start.tree")),
                outgroups: &outgroups,
            })
            .unwrap();

        assert_eq!(
            args.join(" "),
            "-s /d/source.fasta -w /d/raxml -m GTRGAMMAI -e 0.001 -T 1 -N 1 -c 4 -f d --silent \
             --no-seq-check -o A/HONG_KONG/1/1968 -t /d/start.tree --no-bfgs -n h3.0003 -p 4711"
        );
    }

    #[test]
    fn parses_progress() {
        let raxml = Raxml::load(&RaxmlConfig::default());

        let samples = raxml
            .parse_progress_log(Path::new("log"), "1.5 -60000.5\n\n120.25 -52000\n")
            .unwrap();

        assert_eq!(
            samples,
            vec![
                ProgressSample {
                    elapsed: 1.5,
                    score: 60000.5
                },
                ProgressSample {
                    elapsed: 120.25,
                    score: 52000.0
                },
            ]
        );
        assert!(raxml
            .parse_progress_log(Path::new("log"), "1.5 -60000.5\n120.25 -5")
            .is_ok());
        assert!(raxml
            .parse_progress_log(Path::new("log"), "1.5 -60000.5\n120.2")
            .is_err());
    }

    #[test]
    fn parses_final_result() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("RAxML_bestTree.h3.0001"), "(a,b,c);").unwrap();
        fs::write(dir.path().join("RAxML_info.h3.0001"), INFO_TEXT).unwrap();
        fs::write(
            dir.path().join("RAxML_log.h3.0001"),
            "10.0 -60000.0\n5000.0 -51300.0\n7300.0 -51234.125\n",
        )
        .unwrap();

        let result = Raxml::load(&RaxmlConfig::default())
            .parse_final_result(dir.path(), "h3.0001")
            .unwrap();

        assert_eq!(result.replica_id, "h3.0001");
        assert_eq!(result.score, 51234.125);
        assert_eq!(result.tree, dir.path().join("RAxML_bestTree.h3.0001"));
        assert_eq!(result.start_scores, vec![60000.0, 51234.125]);
        assert_eq!(result.elapsed, Duration::from_secs_f64(7322.417));
    }

    #[test]
    fn missing_tree_is_missing_result() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("RAxML_info.h3.0001"), INFO_TEXT).unwrap();

        assert!(matches!(
            Raxml::load(&RaxmlConfig::default()).parse_final_result(dir.path(), "h3.0001"),
            Err(OptimizerError::MissingResult { .. })
        ));
    }

    #[test]
    fn out_of_range_execution_time_is_a_parse_error() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("RAxML_bestTree.h3.0001"), "(a,b,c);").unwrap();
        fs::write(dir.path().join("RAxML_log.h3.0001"), "10.0 -60000.0\n").unwrap();
        fs::write(
            dir.path().join("RAxML_info.h3.0001"),
            format!(
                "Overall execution time: {} secs\n\nFinal GAMMA-based Score of best tree -51234.125\n",
                "9".repeat(400)
            ),
        )
        .unwrap();

        assert!(matches!(
            Raxml::load(&RaxmlConfig::default()).parse_final_result(dir.path(), "h3.0001"),
            Err(OptimizerError::Parse { .. })
        ));
    }

    #[test]
    fn recognizes_version() {
        assert_eq!(
            &VERSION.captures(INFO_TEXT).unwrap()[1],
            "8.2.12"
        );
    }
}
