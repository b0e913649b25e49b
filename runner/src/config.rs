use crate::{pruner::Gate, util::RetryPolicy};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::Error,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{error, warn};

const RESERVED_STAGE_NAMES: [&str; 2] = ["best", "all"];

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound(path.to_path_buf()))
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::MetadataNotFound(e)),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Failed to read config")]
    ReadConfig(#[source] Error),
    #[error("Failed to parse config")]
    ParseConfig(#[from] serde_yaml::Error),
    #[error("File not found: {0}")]
    FileNotFound(PathBuf),
    #[error("Metadata not found")]
    MetadataNotFound(#[source] Error),
    #[error("Config failed preflight checks")]
    Preflight,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    // Name of the pipeline run, used as replica id prefix and as key in the state database
    pub run_id: String,
    // every stage writes into working_dir/<stage name>
    pub working_dir: PathBuf,
    // alignment handed to every optimizer
    pub source: PathBuf,
    #[serde(default)]
    pub outgroups: Vec<String>,

    #[serde(alias = "db", default)]
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,

    #[serde(default = "default_poll_retry")]
    pub poll_retry: RetryConfig,
    #[serde(default = "default_log_retry")]
    pub log_retry: RetryConfig,

    pub stages: Vec<StageConfig>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "name", rename_all = "lowercase")]
pub enum SchedulerConfig {
    Htcondor(HtCondorConfig),
    Slurm(SlurmConfig),
    Local(LocalConfig),
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct HtCondorConfig {
    // in MB, condor falls back to 2000
    pub request_memory: Option<u64>,
    pub email: Option<String>,
    #[serde(default)]
    pub machines: Vec<String>,
    #[serde(default)]
    pub capture_stdout: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SlurmConfig {
    pub partition: Option<String>,
    // in MB
    pub request_memory: Option<u64>,
    // passed verbatim to sbatch --time
    pub time_limit: Option<String>,
    // seconds between two squeue calls while waiting
    #[serde(default = "default_check_interval")]
    pub check_interval: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LocalConfig {}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    pub attempts: u32,
    // seconds
    pub initial_delay: u64,
    // seconds
    pub max_delay: u64,
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.attempts,
            Duration::from_secs(self.initial_delay),
            Duration::from_secs(self.max_delay),
        )
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct StageConfig {
    pub name: String,
    // number of replicas per start tree
    pub replicas: usize,
    #[serde(default)]
    pub seed: SeedMode,
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub wait: WaitConfig,
}

/// which results of the previous stage become start trees of a stage
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SeedMode {
    #[default]
    Best,
    All,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct WaitConfig {
    // seconds, only used in survival mode
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    pub survival: Option<SurvivalConfig>,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            survival: None,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SurvivalConfig {
    pub kill_rate: f64,
    #[serde(default)]
    pub gate: Gate,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum OptimizerConfig {
    Raxml(RaxmlConfig),
    Garli(GarliConfig),
    Iqtree(IqtreeConfig),
    Fasttree(FasttreeConfig),
}

impl OptimizerConfig {
    pub fn program(&self) -> &Path {
        match self {
            Self::Raxml(config) => &config.program,
            Self::Garli(config) => &config.program,
            Self::Iqtree(config) => &config.program,
            Self::Fasttree(config) => &config.program,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RaxmlConfig {
    #[serde(default = "default_raxml_program")]
    pub program: PathBuf,
    #[serde(default = "default_raxml_model")]
    pub model: String,
    #[serde(default = "default_true")]
    pub bfgs: bool,
    #[serde(default = "default_model_optimization_precision")]
    pub model_optimization_precision: f64,
}

impl Default for RaxmlConfig {
    fn default() -> Self {
        Self {
            program: default_raxml_program(),
            model: default_raxml_model(),
            bfgs: true,
            model_optimization_precision: default_model_optimization_precision(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct GarliConfig {
    #[serde(default = "default_garli_program")]
    pub program: PathBuf,
    // taxa indices in the source alignment, starting with 1
    #[serde(default = "default_garli_outgroup")]
    pub outgroup: Vec<u32>,
    #[serde(default = "default_attachmentspertaxon")]
    pub attachmentspertaxon: u64,
    #[serde(default = "default_genthreshfortopoterm")]
    pub genthreshfortopoterm: u64,
    // seconds
    #[serde(default = "default_stoptime")]
    pub stoptime: u64,
    #[serde(default = "default_searchreps")]
    pub searchreps: u32,
    // in MB
    #[serde(default = "default_availablememory")]
    pub availablememory: u64,
}

impl Default for GarliConfig {
    fn default() -> Self {
        Self {
            program: default_garli_program(),
            outgroup: default_garli_outgroup(),
            attachmentspertaxon: default_attachmentspertaxon(),
            genthreshfortopoterm: default_genthreshfortopoterm(),
            stoptime: default_stoptime(),
            searchreps: default_searchreps(),
            availablememory: default_availablememory(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct IqtreeConfig {
    #[serde(default = "default_iqtree_program")]
    pub program: PathBuf,
    #[serde(default = "default_iqtree_model")]
    pub model: String,
    // checkpoint interval in seconds
    #[serde(default = "default_cptime")]
    pub cptime: u64,
}

impl Default for IqtreeConfig {
    fn default() -> Self {
        Self {
            program: default_iqtree_program(),
            model: default_iqtree_model(),
            cptime: default_cptime(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FasttreeConfig {
    #[serde(default = "default_fasttree_program")]
    pub program: PathBuf,
}

impl Default for FasttreeConfig {
    fn default() -> Self {
        Self {
            program: default_fasttree_program(),
        }
    }
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let content = std::fs::read_to_string(path).map_err(ConfigErrors::ReadConfig)?;

        Ok(serde_yaml::from_str(&content)?)
    }

    /// load and run the preflight checks, failing if any of them reported an error
    pub fn load_checked(path: &Path) -> Result<Self, ConfigErrors> {
        let mut config = Self::load(path)?;

        if config.preflight_checks() {
            Err(ConfigErrors::Preflight)
        } else {
            Ok(config)
        }
    }

    /// directory of a stage batch
    pub fn stage_dir(&self, stage: &StageConfig) -> PathBuf {
        self.working_dir.join(&stage.name)
    }

    /// Normalize the config and report every problem found. Returns true if any error was found.
    pub fn preflight_checks(&mut self) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;

        // optimizers cannot handle spaces and slashes in run ids
        let sanitized = self.run_id.replace([' ', '/'], "-");
        if sanitized != self.run_id {
            warn!(
                "run_id '{}' contains spaces or slashes, using '{sanitized}'",
                self.run_id
            );
            self.run_id = sanitized;
        }

        if self.run_id.is_empty() {
            error!("run_id cannot be empty");
            contains_error = true;
        }

        if !self.source.is_file() {
            error!(
                "source {} is either not a file or not found",
                self.source.to_string_lossy()
            );
            contains_error = true;
        }

        if self.stages.is_empty() {
            error!("No stage was defined, nothing to run");
            contains_error = true;
        }

        for name in self.stages.iter().map(|stage| &stage.name).duplicates() {
            error!("Stage {name} is defined more than once");
            contains_error = true;
        }

        for retry in [("poll_retry", &self.poll_retry), ("log_retry", &self.log_retry)] {
            if retry.1.attempts == 0 {
                error!("{}.attempts must be at least 1", retry.0);
                contains_error = true;
            }
        }

        for (index, stage) in self.stages.iter().enumerate() {
            let name = &stage.name;

            if name.is_empty() || name.contains('/') {
                error!("stages[{index}].name '{name}' must be a non-empty directory name");
                contains_error = true;
            }

            // result.best.* and result.all.* belong to the pipeline summary
            if RESERVED_STAGE_NAMES.contains(&name.as_str()) {
                error!("Stage name '{name}' is reserved for the pipeline reports");
                contains_error = true;
            }

            if stage.replicas == 0 {
                error!("Stage {name}.replicas cannot be 0");
                contains_error = true;
            }

            if index == 0 && stage.seed == SeedMode::All {
                error!("Stage {name} is the first stage, there are no results to seed from");
                contains_error = true;
            }

            if let Some(ref survival) = stage.wait.survival {
                if !(0.0..=1.0).contains(&survival.kill_rate) {
                    error!(
                        "Stage {name}.wait.survival.kill_rate ({}) must be within [0, 1]",
                        survival.kill_rate
                    );
                    contains_error = true;
                }

                if stage.wait.poll_interval == 0 {
                    error!("Stage {name}.wait.poll_interval cannot be 0 in survival mode");
                    contains_error = true;
                }
            }

            if let OptimizerConfig::Garli(ref garli) = stage.optimizer {
                if garli.outgroup.is_empty() || garli.outgroup.contains(&0) {
                    error!("Stage {name}.optimizer.outgroup must be a non-empty list of taxa indices starting with 1");
                    contains_error = true;
                }
            }

            // bare program names are resolved on the execution host
            let program = stage.optimizer.program();
            if program.is_absolute() {
                match check_executable(program) {
                    Ok(true) => {}
                    Ok(false) => {
                        error!(
                            "Stage {name} optimizer {} is not executable",
                            program.to_string_lossy()
                        );
                        contains_error = true;
                    }
                    Err(e) => {
                        error!(
                            "Failed to determine if stage {name} optimizer ({}) is an executable: {e}",
                            program.to_string_lossy()
                        );
                        contains_error = true;
                    }
                }
            }
        }

        contains_error
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("treesearch.db")
}

fn default_poll_retry() -> RetryConfig {
    RetryConfig {
        attempts: 5,
        initial_delay: 30,
        max_delay: 600,
    }
}

fn default_log_retry() -> RetryConfig {
    RetryConfig {
        attempts: 10,
        initial_delay: 3,
        max_delay: 30,
    }
}

fn default_check_interval() -> u64 {
    30
}

fn default_poll_interval() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_raxml_program() -> PathBuf {
    PathBuf::from("raxml")
}

fn default_raxml_model() -> String {
    "GTRGAMMAI".to_owned()
}

fn default_model_optimization_precision() -> f64 {
    0.001
}

fn default_garli_program() -> PathBuf {
    PathBuf::from("Garli")
}

fn default_garli_outgroup() -> Vec<u32> {
    vec![1]
}

fn default_attachmentspertaxon() -> u64 {
    1_000_000
}

fn default_genthreshfortopoterm() -> u64 {
    20_000
}

fn default_stoptime() -> u64 {
    3600 * 24 * 7
}

fn default_searchreps() -> u32 {
    1
}

fn default_availablememory() -> u64 {
    4000
}

fn default_iqtree_program() -> PathBuf {
    PathBuf::from("iqtree")
}

fn default_iqtree_model() -> String {
    "GTR+I+G4".to_owned()
}

fn default_cptime() -> u64 {
    600
}

fn default_fasttree_program() -> PathBuf {
    PathBuf::from("FastTree")
}
