//! Backend seam: how one candidate is produced.
//!
//! The engine never talks to a model directly. It hands a
//! [`CandidateRequest`] to a [`BackendExecutor`] and gets a
//! [`BackendResponse`] back. `options` on the config are opaque policy data
//! (role prompts, tool restrictions) that only the executor interprets.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::TokenUsage;

/// Default per-candidate timeout.
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

/// One backend configuration competing in a phase.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendConfig {
    pub provider: String,
    pub model: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Passed through to the executor untouched
    #[serde(default)]
    pub options: serde_json::Value,
}

impl BackendConfig {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            options: serde_json::Value::Null,
        }
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_options(mut self, options: serde_json::Value) -> Self {
        self.options = options;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// `provider/model`
    pub fn key(&self) -> String {
        format!("{}/{}", self.provider, self.model)
    }
}

/// Everything a backend needs to produce one candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateRequest {
    pub sprint_id: String,
    pub phase: String,
    pub attempt: u32,
    pub prompt: String,
    pub config: BackendConfig,
    /// Opaque workspace reference, if a workspace was provisioned
    pub workspace_ref: Option<String>,
    /// Branch-level parameter overrides
    #[serde(default)]
    pub parameters: serde_json::Value,
}

/// What a backend returns for a successful invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BackendResponse {
    pub output: String,
    #[serde(default)]
    pub tokens: TokenUsage,
    /// Backend-measured duration; the executor measures wall time otherwise
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub trace_ref: Option<String>,
    #[serde(default)]
    pub tool_calls: u32,
    #[serde(default)]
    pub self_confidence: Option<f64>,
}

impl BackendResponse {
    pub fn text(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            ..Self::default()
        }
    }
}

/// Produces candidate output for a request.
///
/// Errors are arbitrary external failures; the candidate executor records
/// them as failed candidates.
#[async_trait]
pub trait BackendExecutor: Send + Sync {
    async fn run(&self, request: &CandidateRequest) -> anyhow::Result<BackendResponse>;
}
