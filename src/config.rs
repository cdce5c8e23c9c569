use std::path::PathBuf;

use crate::{
    constants::{
        DEFAULT_MAX_CONCURRENT, DEFAULT_MEMORY_BYTES, DEFAULT_OUTPUT_LIMIT_BYTES,
        DEFAULT_TIME_BUDGET_MS,
    },
    core::{analysis::policy::SourcePolicy, domain::ExecutionLimits},
    native::sandbox::Isolation,
};

/// Limits and sandbox settings shared by every subcommand.
#[derive(Clone, Debug, clap::Args)]
pub struct RunnerConfig {
    /// Wall-clock budget for a single run.
    #[arg(long, env = "TUTOR_RUNNER_TIME_BUDGET_MS", default_value_t = DEFAULT_TIME_BUDGET_MS)]
    pub time_budget_ms: u64,

    /// Combined cap on captured stdout and stderr.
    #[arg(long, env = "TUTOR_RUNNER_OUTPUT_LIMIT_BYTES", default_value_t = DEFAULT_OUTPUT_LIMIT_BYTES)]
    pub output_limit_bytes: usize,

    #[arg(long, env = "TUTOR_RUNNER_MEMORY_BYTES", default_value_t = DEFAULT_MEMORY_BYTES)]
    pub memory_bytes: u64,

    /// Upper bound on sandboxes running at the same time.
    #[arg(long, env = "TUTOR_RUNNER_MAX_CONCURRENT", default_value_t = DEFAULT_MAX_CONCURRENT)]
    pub max_concurrent: usize,

    #[arg(long, env = "TUTOR_RUNNER_PYTHON", default_value = "python3")]
    pub python_path: PathBuf,

    /// Where per-run scratch directories are created. Defaults to the system temp dir.
    #[arg(long, env = "TUTOR_RUNNER_SCRATCH_ROOT")]
    pub scratch_root: Option<PathBuf>,

    /// Private mount and network namespaces for learner code.
    #[arg(long, env = "TUTOR_RUNNER_ISOLATION", value_enum, default_value_t = Isolation::Required)]
    pub isolation: Isolation,

    /// Skip the restricted import and builtin checks. Meant for trusted content.
    #[arg(long, env = "TUTOR_RUNNER_PERMISSIVE_SOURCE")]
    pub permissive_source: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} must be greater than zero")]
    NotPositive { name: &'static str },
    #[error("scratch root {path:?} is not a directory")]
    ScratchRoot { path: PathBuf },
}

impl RunnerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("time_budget_ms", self.time_budget_ms == 0),
            ("output_limit_bytes", self.output_limit_bytes == 0),
            ("memory_bytes", self.memory_bytes == 0),
            ("max_concurrent", self.max_concurrent == 0),
        ];
        if let Some((name, _)) = positive.into_iter().find(|(_, zero)| *zero) {
            return Err(ConfigError::NotPositive { name });
        }

        if let Some(path) = &self.scratch_root {
            if !path.is_dir() {
                return Err(ConfigError::ScratchRoot { path: path.clone() });
            }
        }
        Ok(())
    }

    pub fn execution_limits(&self) -> ExecutionLimits {
        ExecutionLimits {
            time_ms: self.time_budget_ms,
            output_limit_bytes: self.output_limit_bytes,
            memory_bytes: self.memory_bytes,
        }
    }

    pub fn scratch_root(&self) -> PathBuf {
        self.scratch_root.clone().unwrap_or_else(std::env::temp_dir)
    }

    pub fn source_policy(&self) -> SourcePolicy {
        if self.permissive_source {
            SourcePolicy::permissive()
        } else {
            SourcePolicy::default()
        }
    }
}
