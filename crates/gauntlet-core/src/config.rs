//! Engine configuration.
//!
//! Loaded from TOML, then optionally overridden from `GAUNTLET_*`
//! environment variables, then validated.
//!
//! ```toml
//! max_attempts = 3
//! judge_epsilon = 0.02
//! evaluation_mode = "full"
//!
//! [[backends]]
//! provider = "anthropic"
//! model = "claude"
//! timeout_secs = 120
//!
//! [commands]
//! anthropic = ["./bin/ask-anthropic"]
//!
//! [[evaluators]]
//! kind = "non_empty"
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::backend::{BackendConfig, BackendExecutor, DEFAULT_TIMEOUT_SECS};
use crate::emitter::EmitterConfig;
use crate::evaluator::{EvaluationMode, EvaluatorRegistry, EvaluatorSpec};
use crate::feedback::DEFAULT_MAX_ATTEMPTS;
use crate::judge::{Judge, JudgeBackend, Judges, ModelJudge, SelfReportJudge, DEFAULT_EPSILON};

pub const ENV_MAX_ATTEMPTS: &str = "GAUNTLET_MAX_ATTEMPTS";
pub const ENV_JUDGE_EPSILON: &str = "GAUNTLET_JUDGE_EPSILON";
pub const ENV_EVALUATION_MODE: &str = "GAUNTLET_EVALUATION_MODE";

/// Errors from loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("invalid value {value:?} for {var}")]
    Env { var: String, value: String },
}

/// Result type for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// How a judge scores candidates.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JudgeSpec {
    /// Candidates' own confidence reports
    #[default]
    SelfReport,
    /// A model backend grades the candidates
    Model {
        provider: String,
        model: String,
        #[serde(default = "default_timeout_secs")]
        timeout_secs: u64,
    },
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl JudgeSpec {
    pub fn build(&self, name: &str, epsilon: f64, backend: Arc<dyn BackendExecutor>) -> Judge {
        let scorer: Arc<dyn JudgeBackend> = match self {
            Self::SelfReport => Arc::new(SelfReportJudge),
            Self::Model {
                provider,
                model,
                timeout_secs,
            } => Arc::new(ModelJudge::new(
                backend,
                BackendConfig::new(provider, model).with_timeout_secs(*timeout_secs),
            )),
        };
        Judge::new(name, scorer).with_epsilon(epsilon)
    }
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_epsilon() -> f64 {
    DEFAULT_EPSILON
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_epsilon")]
    pub judge_epsilon: f64,
    #[serde(default)]
    pub evaluation_mode: EvaluationMode,
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub events: EmitterConfig,
    #[serde(default)]
    pub evaluators: Vec<EvaluatorSpec>,
    /// provider -> argv for the process backend
    #[serde(default)]
    pub commands: BTreeMap<String, Vec<String>>,
    /// Default judge
    #[serde(default)]
    pub judge: JudgeSpec,
    /// Judges a branch may select by name
    #[serde(default)]
    pub judges: BTreeMap<String, JudgeSpec>,
    #[serde(default)]
    pub workspace_root: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            judge_epsilon: DEFAULT_EPSILON,
            evaluation_mode: EvaluationMode::default(),
            backends: Vec::new(),
            events: EmitterConfig::default(),
            evaluators: Vec::new(),
            commands: BTreeMap::new(),
            judge: JudgeSpec::default(),
            judges: BTreeMap::new(),
            workspace_root: None,
        }
    }
}

impl EngineConfig {
    /// Read and parse a TOML file. Does not apply overrides or validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `GAUNTLET_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|var| std::env::var(var).ok())
    }

    /// Apply overrides from an arbitrary lookup.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let invalid = |var: &str, value: &str| ConfigError::Env {
            var: var.to_string(),
            value: value.to_string(),
        };

        if let Some(value) = lookup(ENV_MAX_ATTEMPTS) {
            self.max_attempts = value
                .trim()
                .parse()
                .map_err(|_| invalid(ENV_MAX_ATTEMPTS, &value))?;
        }
        if let Some(value) = lookup(ENV_JUDGE_EPSILON) {
            self.judge_epsilon = value
                .trim()
                .parse()
                .map_err(|_| invalid(ENV_JUDGE_EPSILON, &value))?;
        }
        if let Some(value) = lookup(ENV_EVALUATION_MODE) {
            self.evaluation_mode = value
                .trim()
                .parse()
                .map_err(|_| invalid(ENV_EVALUATION_MODE, &value))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.judge_epsilon) {
            return Err(ConfigError::Invalid(format!(
                "judge_epsilon {} is outside [0, 1]",
                self.judge_epsilon
            )));
        }
        if self.backends.is_empty() {
            return Err(ConfigError::Invalid("at least one backend is required".into()));
        }

        let mut seen = HashSet::new();
        for backend in &self.backends {
            if !seen.insert(backend.key()) {
                return Err(ConfigError::Invalid(format!("duplicate backend {}", backend.key())));
            }
            if backend.timeout_secs == 0 {
                return Err(ConfigError::Invalid(format!(
                    "backend {} has a zero timeout",
                    backend.key()
                )));
            }
        }

        if self.events.max_buffered_events == 0 || self.events.channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "events.max_buffered_events and events.channel_capacity must be positive".into(),
            ));
        }
        Ok(())
    }

    /// The default judge plus every named judge.
    pub fn build_judges(&self, backend: Arc<dyn BackendExecutor>) -> Judges {
        let mut judges = Judges::new(self.judge.build("default", self.judge_epsilon, Arc::clone(&backend)));
        for (name, spec) in &self.judges {
            judges = judges.with_named(spec.build(name, self.judge_epsilon, Arc::clone(&backend)));
        }
        judges
    }

    /// Instantiate every configured evaluator in declaration order.
    pub fn build_evaluators(&self, backend: Arc<dyn BackendExecutor>) -> Result<EvaluatorRegistry> {
        let mut registry = EvaluatorRegistry::new();
        for spec in &self.evaluators {
            registry.register(spec.build(Arc::clone(&backend))?, spec.scope());
        }
        Ok(registry)
    }
}
