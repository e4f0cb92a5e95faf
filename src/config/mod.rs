use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::model::{Accelerator, ArtifactFormat, LoadOptions, ModelSlot};
use crate::core::resource::BudgetPolicy;
use crate::core::sample::SampleParams;
use crate::core::session::SessionConfig;
use crate::infra::storage::DirectorySource;

pub const ENV_MODELS: &str = "ASSISTANT_RT_MODELS";
pub const ENV_CONTEXT: &str = "ASSISTANT_RT_CONTEXT";
pub const ENV_THREADS: &str = "ASSISTANT_RT_THREADS";
pub const ENV_ACCELERATOR: &str = "ASSISTANT_RT_ACCELERATOR";
pub const ENV_SEED: &str = "ASSISTANT_RT_SEED";
pub const ENV_LOG: &str = "ASSISTANT_RT_LOG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotArtifactConfig {
    /// Relative to `<models_dir>/<slot>/`, or absolute.
    pub file: PathBuf,
    #[serde(default)]
    pub format: Option<ArtifactFormat>,
    /// Expected byte size, checked by the validator when set.
    #[serde(default)]
    pub size: Option<u64>,
}

impl SlotArtifactConfig {
    pub fn new(file: impl Into<PathBuf>) -> Self {
        Self {
            file: file.into(),
            format: None,
            size: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub models_dir: PathBuf,
    pub context_limit: usize,
    pub max_new_tokens: usize,
    pub sampling: SampleParams,
    pub threads: usize,
    pub accelerator: Accelerator,
    pub memory_ceiling: f64,
    pub ai_share: f64,
    pub load_test: bool,
    pub probe_format: bool,
    pub seed: Option<u64>,
    pub slots: BTreeMap<ModelSlot, SlotArtifactConfig>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let slots = ModelSlot::ALL
            .into_iter()
            .map(|slot| {
                let file = match slot {
                    ModelSlot::Chat => "model.gguf",
                    _ => "model.tflite",
                };
                (slot, SlotArtifactConfig::new(file))
            })
            .collect();

        let policy = BudgetPolicy::default();
        let session = SessionConfig::default();

        Self {
            models_dir: DirectorySource::default_models_dir(),
            context_limit: session.context_limit,
            max_new_tokens: session.max_new_tokens,
            sampling: SampleParams::default(),
            threads: std::thread::available_parallelism().map(|n| n.get().min(8)).unwrap_or(4),
            accelerator: Accelerator::Cpu,
            memory_ceiling: policy.ceiling,
            ai_share: policy.ai_share,
            load_test: false,
            probe_format: true,
            seed: None,
            slots,
        }
    }
}

impl RuntimeConfig {
    /// Defaults, then the YAML file if given, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.models_dir = expand_home(&config.models_dir);
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Unparseable values are logged and ignored.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(ENV_MODELS) {
            self.models_dir = PathBuf::from(dir);
        }
        if let Some(v) = parse_env(&lookup, ENV_CONTEXT) {
            self.context_limit = v;
        }
        if let Some(v) = parse_env(&lookup, ENV_THREADS) {
            self.threads = v;
        }
        if let Some(v) = parse_env(&lookup, ENV_ACCELERATOR) {
            self.accelerator = v;
        }
        if let Some(v) = parse_env(&lookup, ENV_SEED) {
            self.seed = Some(v);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.context_limit < 2 {
            return invalid(format!("context_limit must be at least 2, got {}", self.context_limit));
        }
        if self.max_new_tokens == 0 || self.max_new_tokens >= self.context_limit {
            return invalid(format!(
                "max_new_tokens must be in 1..{}, got {}",
                self.context_limit, self.max_new_tokens
            ));
        }
        if self.threads == 0 {
            return invalid("threads must be at least 1".into());
        }
        for (name, value) in [("memory_ceiling", self.memory_ceiling), ("ai_share", self.ai_share)] {
            if !(value > 0.0 && value <= 1.0) {
                return invalid(format!("{} must be in (0, 1], got {}", name, value));
            }
        }
        if let Err(e) = self.sampling.validate() {
            return invalid(format!("sampling: {}", e));
        }
        Ok(())
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            context_limit: self.context_limit,
            max_new_tokens: self.max_new_tokens,
            seed: self.seed,
        }
    }

    pub fn budget_policy(&self) -> BudgetPolicy {
        BudgetPolicy {
            ceiling: self.memory_ceiling,
            ai_share: self.ai_share,
            max_threads: self.threads,
        }
    }

    pub fn load_options(&self) -> LoadOptions {
        LoadOptions {
            threads: self.threads,
            accelerator: self.accelerator,
        }
    }
}

fn parse_env<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(e) => {
            warn!("ignoring {}={:?}: {}", key, raw, e);
            None
        }
    }
}

pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir().map(|home| home.join(rest)).unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}
