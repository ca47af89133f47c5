//! Session configuration from `TMA_*` environment parameters
//!
//! Read once per arm attempt. Every required parameter is checked before
//! anything else happens, so a misconfigured session never installs a hook.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// Symbol name of the function to watch
pub const ENV_FUNCTION: &str = "TMA_FUNCTION";
/// CPU list handed to the affinity tool
pub const ENV_CORE: &str = "TMA_CORE";
/// Where the counter tool writes its metrics
pub const ENV_OUTPUT_FILE: &str = "TMA_OUTPUT_FILE";
/// Metric group / analysis level
pub const ENV_LEVEL: &str = "TMA_LEVEL";
/// Install directory of toplev; its presence selects the hierarchical backend
pub const ENV_TOPLEV: &str = "TMA_TOPLEV";
pub const ENV_TASKSET: &str = "TMA_TASKSET";
pub const ENV_PERF: &str = "TMA_PERF";
pub const ENV_PYTHON: &str = "TMA_PYTHON";

pub const DEFAULT_TASKSET: &str = "/usr/bin/taskset";
pub const DEFAULT_PERF: &str = "/usr/bin/perf";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} not set")]
    Missing(&'static str),

    #[error("{0} is set but empty")]
    Empty(&'static str),

    #[error("Invalid CPU list '{value}': {reason}")]
    InvalidCoreList { value: String, reason: String },
}

/// Source of named configuration parameters
pub trait EnvSource {
    fn var(&self, key: &str) -> Option<String>;
}

/// The real process environment
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl EnvSource for HashMap<String, String> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

impl<E: EnvSource + ?Sized> EnvSource for &E {
    fn var(&self, key: &str) -> Option<String> {
        (**self).var(key)
    }
}

/// CPU list in taskset's grammar, such as `0-3,8,10-11` or `0-7:2`
///
/// Kept verbatim for the helper tools; parsing only validates it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct CoreList(String);

impl CoreList {
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidCoreList {
            value: value.to_string(),
            reason: reason.to_string(),
        };

        if value.trim().is_empty() {
            return Err(invalid("empty"));
        }

        for item in value.split(',') {
            parse_item(item).map_err(invalid)?;
        }

        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Expand into individual CPU ids, in list order
    pub fn cpus(&self) -> Vec<u32> {
        let mut cpus = Vec::new();
        for item in self.0.split(',') {
            if let Ok((start, end, stride)) = parse_item(item) {
                cpus.extend((start..=end).step_by(stride));
            }
        }
        cpus
    }
}

/// One list item: `N`, `N-M` or `N-M:S`, as `(start, end, stride)`
fn parse_item(item: &str) -> Result<(u32, u32, usize), &'static str> {
    let Some((start, rest)) = item.split_once('-') else {
        let cpu = item.parse().map_err(|_| "bad CPU id")?;
        return Ok((cpu, cpu, 1));
    };
    let (end, stride) = match rest.split_once(':') {
        Some((end, stride)) => (end, stride.parse().map_err(|_| "bad stride")?),
        None => (rest, 1),
    };

    let start: u32 = start.parse().map_err(|_| "bad range start")?;
    let end: u32 = end.parse().map_err(|_| "bad range end")?;
    if start > end {
        return Err("range start is greater than its end");
    }
    if stride == 0 {
        return Err("stride must be at least 1");
    }
    Ok((start, end, stride))
}

/// Which counter-collection program measures the window
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterBackend {
    /// `perf stat -M <level>`
    PerfStat,
    /// `toplev.py` from the given install directory
    Toplev { dir: PathBuf },
}

/// Executables used for the helper processes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPaths {
    pub taskset: PathBuf,
    pub perf: PathBuf,
    /// Interpreter to run `toplev.py` with; executed directly when `None`
    pub python: Option<PathBuf>,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            taskset: PathBuf::from(DEFAULT_TASKSET),
            perf: PathBuf::from(DEFAULT_PERF),
            python: None,
        }
    }
}

/// Everything a profiling session needs to know
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TmaConfig {
    pub function: String,
    pub cores: CoreList,
    pub output_file: PathBuf,
    pub level: String,
    pub backend: CounterBackend,
    pub tools: ToolPaths,
}

impl TmaConfig {
    /// Load from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(&ProcessEnv)
    }

    /// Load from any parameter source
    pub fn load(env: &impl EnvSource) -> Result<Self, ConfigError> {
        let function = required(env, ENV_FUNCTION)?;
        let cores = required(env, ENV_CORE)?;
        let output_file = required(env, ENV_OUTPUT_FILE)?;
        let level = required(env, ENV_LEVEL)?;

        let cores = CoreList::parse(&cores)?;

        // Presence alone selects toplev, so an empty directory is an error
        let backend = match env.var(ENV_TOPLEV) {
            Some(dir) if dir.is_empty() => return Err(ConfigError::Empty(ENV_TOPLEV)),
            Some(dir) => CounterBackend::Toplev {
                dir: PathBuf::from(dir),
            },
            None => CounterBackend::PerfStat,
        };

        let defaults = ToolPaths::default();
        let tools = ToolPaths {
            taskset: optional(env, ENV_TASKSET).map_or(defaults.taskset, PathBuf::from),
            perf: optional(env, ENV_PERF).map_or(defaults.perf, PathBuf::from),
            python: optional(env, ENV_PYTHON).map(PathBuf::from),
        };

        Ok(Self {
            function,
            cores,
            output_file: PathBuf::from(output_file),
            level,
            backend,
            tools,
        })
    }
}

fn required(env: &impl EnvSource, key: &'static str) -> Result<String, ConfigError> {
    match env.var(key) {
        None => Err(ConfigError::Missing(key)),
        Some(value) if value.is_empty() => Err(ConfigError::Empty(key)),
        Some(value) => Ok(value),
    }
}

fn optional(env: &impl EnvSource, key: &str) -> Option<String> {
    env.var(key).filter(|value| !value.is_empty())
}
