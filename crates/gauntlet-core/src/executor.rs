//! Parallel candidate execution.
//!
//! Every backend configuration gets its own task and its own timeout. A
//! timeout, error or panic turns into a failed [`Candidate`]; siblings keep
//! running. Results come back in configuration order.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::future::join_all;
use tokio::task::AbortHandle;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::backend::{BackendConfig, BackendExecutor, CandidateRequest};
use crate::domain::{Candidate, CandidateStatus};

/// Attempt-level inputs shared by every candidate.
#[derive(Debug, Clone)]
pub struct PromptJob {
    pub sprint_id: String,
    pub phase: String,
    pub attempt: u32,
    pub prompt: String,
    pub workspace_ref: Option<String>,
    pub parameters: serde_json::Value,
}

impl PromptJob {
    fn request(&self, config: &BackendConfig) -> CandidateRequest {
        CandidateRequest {
            sprint_id: self.sprint_id.clone(),
            phase: self.phase.clone(),
            attempt: self.attempt,
            prompt: self.prompt.clone(),
            config: config.clone(),
            workspace_ref: self.workspace_ref.clone(),
            parameters: self.parameters.clone(),
        }
    }
}

/// Runs one attempt's candidates concurrently against a backend executor.
#[derive(Clone)]
pub struct CandidateExecutor {
    backend: Arc<dyn BackendExecutor>,
}

impl CandidateExecutor {
    pub fn new(backend: Arc<dyn BackendExecutor>) -> Self {
        Self { backend }
    }

    /// Run every config and wait for all of them to finish or time out.
    ///
    /// Dropping the returned future aborts candidates still in flight.
    #[instrument(skip(self, job, configs), fields(phase = %job.phase, attempt = job.attempt, n = configs.len()))]
    pub async fn run_all(&self, job: &PromptJob, configs: &[BackendConfig]) -> Vec<Candidate> {
        let tasks: Vec<_> = configs
            .iter()
            .map(|config| {
                let backend = Arc::clone(&self.backend);
                let request = job.request(config);
                tokio::spawn(async move { run_one(backend, request).await })
            })
            .collect();
        let _abort = AbortOnDrop(tasks.iter().map(|t| t.abort_handle()).collect());

        join_all(tasks)
            .await
            .into_iter()
            .zip(configs)
            .map(|(joined, config)| {
                joined.unwrap_or_else(|e| {
                    warn!(backend = %config.key(), error = %e, "candidate task panicked");
                    Candidate::failed(
                        &config.provider,
                        &config.model,
                        CandidateStatus::Error,
                        format!("candidate task panicked: {e}"),
                    )
                })
            })
            .collect()
    }
}

/// Aborts the held tasks when the owning future is dropped.
pub(crate) struct AbortOnDrop(pub(crate) Vec<AbortHandle>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

async fn run_one(backend: Arc<dyn BackendExecutor>, request: CandidateRequest) -> Candidate {
    let config = &request.config;
    let start = Instant::now();
    let result = tokio::time::timeout(config.timeout(), backend.run(&request)).await;
    let elapsed_ms = start.elapsed().as_millis() as u64;

    match result {
        Ok(Ok(response)) => Candidate {
            id: Uuid::new_v4(),
            provider: config.provider.clone(),
            model: config.model.clone(),
            status: CandidateStatus::Ok,
            output: response.output,
            tool_calls: response.tool_calls,
            duration_ms: response.duration_ms.unwrap_or(elapsed_ms),
            tokens: response.tokens,
            trace_ref: response.trace_ref,
            self_confidence: response.self_confidence,
            error: None,
            completed_at: Utc::now(),
        },
        Ok(Err(e)) => {
            warn!(backend = %config.key(), error = %e, "candidate failed");
            let mut c = Candidate::failed(
                &config.provider,
                &config.model,
                CandidateStatus::Error,
                format!("{e:#}"),
            );
            c.duration_ms = elapsed_ms;
            c
        }
        Err(_) => {
            warn!(backend = %config.key(), timeout_secs = config.timeout_secs, "candidate timed out");
            let mut c = Candidate::failed(
                &config.provider,
                &config.model,
                CandidateStatus::TimedOut,
                format!("timed out after {}s", config.timeout_secs),
            );
            c.duration_ms = elapsed_ms;
            c
        }
    }
}
