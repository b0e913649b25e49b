use super::{
    parse_number, read_artifact, run_time, InvocationContext, Optimizer, OptimizerError,
    ProgressSample,
};
use crate::{collector::ArtifactPattern, config::GarliConfig, result::RunResult};
use itertools::Itertools;
use once_cell::sync::Lazy;
use regex::Regex;
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::debug;

const TREE: ArtifactPattern = ArtifactPattern::new("", ".best.phy");
const LOG: ArtifactPattern = ArtifactPattern::new("", ".log00.log");
const CONF: ArtifactPattern = ArtifactPattern::new("", ".garli.conf");

static VERSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"GARLI\s+Version\s+([\d.]+)").expect("valid regex"));

/// GARLI genetic algorithm search, configured through one conf file per replica
#[derive(Debug, Clone)]
pub struct Garli {
    config: GarliConfig,
}

/// one data row of a GARLI log
#[derive(Debug, PartialEq)]
enum LogRow {
    Generation { generation: u64, sample: ProgressSample },
    Final(ProgressSample),
}

impl Garli {
    pub fn load(config: &GarliConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    fn conf(&self, context: &InvocationContext) -> String {
        let start_tree = context
            .start_tree
            .map(|tree| tree.to_string_lossy().into_owned())
            .unwrap_or_else(|| "stepwise".to_owned());

        format!(
            "\
[general]
datafname = {source}
streefname = {start_tree}
ofprefix = {prefix}
constraintfile = none
attachmentspertaxon = {attachments}
randseed = {seed}
availablememory = {memory}
logevery = 1000
writecheckpoints = 0
restart = 0
saveevery = 1000
refinestart = 1
outputcurrentbesttopology = 0
outputeachbettertopology = 0
enforcetermconditions = 1
genthreshfortopoterm = {genthresh}
scorethreshforterm = 0.05
significanttopochange = 0.01
outputphyliptree = 1
outputmostlyuselessfiles = 0
outgroup = {outgroup}
resampleproportion = 1.0
inferinternalstateprobs = 0
outputsitelikelihoods = 0
optimizeinputonly = 0
collapsebranches = 1
searchreps = {searchreps}
bootstrapreps = 0
datatype = nucleotide
ratematrix = 6rate
statefrequencies = estimate
ratehetmodel = gamma
numratecats = 4
invariantsites = estimate

[master]
nindivs = 4
holdover = 1
selectionintensity = .5
holdoverpenalty = 0
stopgen = 1000000
stoptime = {stoptime}
startoptprec = 0.5
minoptprec = 0.01
numberofprecreductions = 20
treerejectionthreshold = 50.0
topoweight = 1.0
modweight = 0.05
brlenweight = 0.2
randnniweight = 0.1
randsprweight = 0.3
limsprweight = 0.6
intervallength = 100
intervalstostore = 5
limsprrange = 6
meanbrlenmuts = 5
gammashapebrlen = 1000
gammashapemodel = 1000
uniqueswapbias = 0.1
distanceswapbias = 1.0
",
            source = context.source.to_string_lossy(),
            prefix = context.output_dir.join(context.replica_id).to_string_lossy(),
            attachments = self.config.attachmentspertaxon,
            seed = context.seed,
            memory = self.config.availablememory,
            genthresh = self.config.genthreshfortopoterm,
            outgroup = self.config.outgroup.iter().join(" "),
            searchreps = self.config.searchreps,
            stoptime = self.config.stoptime,
        )
    }
}

/// Tab separated `generation, lnL, seconds, precision` rows, the last one labelled `Final`.
/// Header and free text lines are skipped.
fn parse_row(path: &Path, number: usize, line: &str) -> Result<Option<LogRow>, OptimizerError> {
    let fields = line.split('\t').map(str::trim).collect_vec();
    let label = fields[0];
    let generation = label.parse::<u64>().ok();

    if generation.is_none() && label != "Final" {
        return Ok(None);
    }
    if fields.len() != 4 {
        return Err(OptimizerError::parse(
            path,
            format!("line {number} is incomplete"),
        ));
    }

    let sample = ProgressSample {
        elapsed: parse_number(path, fields[2], "time")?,
        score: -parse_number(path, fields[1], "likelihood")?,
    };

    Ok(Some(match generation {
        Some(generation) => LogRow::Generation { generation, sample },
        None => LogRow::Final(sample),
    }))
}

fn parse_rows(path: &Path, content: &str) -> Result<Vec<LogRow>, OptimizerError> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .filter_map(|(number, line)| parse_row(path, number + 1, line).transpose())
        .collect()
}

impl Optimizer for Garli {
    fn label(&self) -> &'static str {
        "GARLI"
    }

    fn program(&self) -> &Path {
        &self.config.program
    }

    /// GARLI only accepts 31 bit seeds
    fn seed_max(&self) -> u64 {
        0x7FFF_FFFF
    }

    fn build_invocation(&self, context: &InvocationContext) -> Result<Vec<String>, OptimizerError> {
        let conf = CONF.path(context.output_dir, context.replica_id);
        fs::write(&conf, self.conf(context))?;
        debug!(conf = %conf.to_string_lossy(), "GARLI conf written");

        Ok(vec![conf.to_string_lossy().into_owned()])
    }

    fn progress_log(&self, output_dir: &Path, replica_id: &str) -> PathBuf {
        LOG.path(output_dir, replica_id)
    }

    fn parse_progress_log(
        &self,
        path: &Path,
        content: &str,
    ) -> Result<Vec<ProgressSample>, OptimizerError> {
        Ok(parse_rows(path, content)?
            .into_iter()
            .map(|row| match row {
                LogRow::Generation { sample, .. } | LogRow::Final(sample) => sample,
            })
            .collect())
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
        let rows = parse_rows(&log_path, &read_artifact(&log_path)?)?;

        let start = rows.iter().find_map(|row| match row {
            LogRow::Generation {
                generation: 0,
                sample,
            } => Some(sample.score),
            _ => None,
        });
        let last = rows.iter().rev().find_map(|row| match row {
            LogRow::Final(sample) => Some(*sample),
            _ => None,
        });

        match (start, last) {
            (Some(start), Some(last)) => Ok(RunResult {
                replica_id: replica_id.to_owned(),
                score: last.score,
                tree,
                start_scores: vec![start],
                elapsed: run_time(&log_path, last.elapsed)?,
            }),
            _ => Err(OptimizerError::parse(
                &log_path,
                "no start generation or final row",
            )),
        }
    }

    fn version_probe(&self) -> (&'static [&'static str], &'static Regex) {
        (&["-v"], &VERSION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tempfile::tempdir;

    const LOG_TEXT: &str = "\
Random seed for this run: 123456
gen\tbest_like\ttime\toptPrecision
0\t-61234.5\t12\t0.5
1000\t-55000.25\t600\t0.5
2000\t-54000\t1200\t0.49
Final\t-53999.75\t4000\t0.01
";

    #[test]
    fn writes_conf_per_replica() {
        let dir = tempdir().unwrap();
        let garli = Garli::load(&GarliConfig {
            outgroup: vec![1, 5],
            ..GarliConfig::default()
        });

        let args = garli
            .build_invocation(&InvocationContext {
                source: Path::new("/d/source.fasta"),
                output_dir: dir.path(),
                replica_id: "h3.0002",
                seed: 99,
                start_tree: Some(Path::new("/d/raxml/RAxML_bestTree.h3.0007")),
                outgroups: &[],
            })
            .unwrap();

        let conf_path = dir.path().join("h3.0002.garli.conf");
        assert_eq!(args, vec![conf_path.to_string_lossy().into_owned()]);

        let conf = fs::read_to_string(conf_path).unwrap();
        assert!(conf.starts_with("[general]\ndatafname = /d/source.fasta\n"));
        assert!(conf.contains("\nstreefname = /d/raxml/RAxML_bestTree.h3.0007\n"));
        assert!(conf.contains(&format!(
            "\nofprefix = {}\n",
            dir.path().join("h3.0002").to_string_lossy()
        )));
        assert!(conf.contains("\nrandseed = 99\n"));
        assert!(conf.contains("\noutgroup = 1 5\n"));
        assert!(conf.contains("\nstoptime = 604800\n"));
        assert!(!conf.contains('#'));
    }

    #[test]
    fn stepwise_without_start_tree() {
        let garli = Garli::load(&GarliConfig::default());
        let conf = garli.conf(&InvocationContext {
            source: Path::new("/d/source.fasta"),
            output_dir: Path::new("/d/garli"),
            replica_id: "h3.0000",
            seed: 1,
            start_tree: None,
            outgroups: &[],
        });

        assert!(conf.contains("\nstreefname = stepwise\n"));
    }

    #[test]
    fn parses_progress() {
        let garli = Garli::load(&GarliConfig::default());

        let samples = garli
            .parse_progress_log(Path::new("log"), LOG_TEXT)
            .unwrap();

        assert_eq!(samples.len(), 4);
        assert_eq!(
            samples[1],
            ProgressSample {
                elapsed: 600.0,
                score: 55000.25
            }
        );
        assert!(garli
            .parse_progress_log(Path::new("log"), "0\t-61234.5\t12\t0.5\n1000\t-55")
            .is_err());
    }

    #[test]
    fn parses_final_result() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("h3.0002.best.phy"), "(a,b,c);").unwrap();
        fs::write(dir.path().join("h3.0002.log00.log"), LOG_TEXT).unwrap();

        let result = Garli::load(&GarliConfig::default())
            .parse_final_result(dir.path(), "h3.0002")
            .unwrap();

        assert_eq!(result.score, 53999.75);
        assert_eq!(result.start_scores, vec![61234.5]);
        assert_eq!(result.elapsed, Duration::from_secs(4000));
        assert_eq!(result.tree, dir.path().join("h3.0002.best.phy"));
    }

    #[test]
    fn unfinished_log_is_a_parse_error() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("h3.0002.best.phy"), "(a,b,c);").unwrap();
        fs::write(
            dir.path().join("h3.0002.log00.log"),
            "0\t-61234.5\t12\t0.5\n",
        )
        .unwrap();

        assert!(matches!(
            Garli::load(&GarliConfig::default()).parse_final_result(dir.path(), "h3.0002"),
            Err(OptimizerError::Parse { .. })
        ));
    }
}
