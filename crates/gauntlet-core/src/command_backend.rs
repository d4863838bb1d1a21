//! Process-backed model backends.
//!
//! Each provider maps to an argv. The prompt is written to the child's
//! stdin; stdout is either plain text or a JSON [`BackendResponse`]
//! envelope. The child is killed if the invocation is dropped, so the
//! executor's timeout also stops the process.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Instant;

use anyhow::{bail, Context};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::backend::{BackendExecutor, BackendResponse, CandidateRequest};

/// Runs a configured command per provider.
#[derive(Debug, Clone, Default)]
pub struct CommandBackend {
    commands: BTreeMap<String, Vec<String>>,
}

impl CommandBackend {
    pub fn new(commands: BTreeMap<String, Vec<String>>) -> Self {
        Self { commands }
    }

    pub fn with_command(mut self, provider: impl Into<String>, argv: Vec<String>) -> Self {
        self.commands.insert(provider.into(), argv);
        self
    }

    pub fn providers(&self) -> impl Iterator<Item = &str> {
        self.commands.keys().map(String::as_str)
    }
}

/// Interpret stdout as an envelope when it looks like one, else as text.
pub fn parse_output(stdout: &str) -> BackendResponse {
    let trimmed = stdout.trim();
    if trimmed.starts_with('{') {
        if let Ok(envelope) = serde_json::from_str::<BackendResponse>(trimmed) {
            return envelope;
        }
    }
    BackendResponse::text(trimmed)
}

#[async_trait]
impl BackendExecutor for CommandBackend {
    async fn run(&self, request: &CandidateRequest) -> anyhow::Result<BackendResponse> {
        let provider = &request.config.provider;
        let argv = self
            .commands
            .get(provider)
            .with_context(|| format!("no command configured for provider {provider}"))?;
        let Some((exe, args)) = argv.split_first() else {
            bail!("command for provider {provider} is empty");
        };

        let start = Instant::now();
        let mut cmd = Command::new(exe);
        cmd.args(args)
            .env("GAUNTLET_PROVIDER", provider)
            .env("GAUNTLET_MODEL", &request.config.model)
            .env("GAUNTLET_PHASE", &request.phase)
            .env("GAUNTLET_ATTEMPT", request.attempt.to_string())
            .env("GAUNTLET_OPTIONS", request.config.options.to_string())
            .env("GAUNTLET_PARAMETERS", request.parameters.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = request.workspace_ref.as_deref().map(Path::new) {
            if dir.is_dir() {
                cmd.current_dir(dir);
            }
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn {exe} for provider {provider}"))?;
        // Feed stdin while draining stdout; a child that echoes would
        // otherwise block on a full pipe.
        let stdin = child.stdin.take();
        let feed = async {
            if let Some(mut stdin) = stdin {
                // The exit status below is the better error if the child quit early.
                if let Err(e) = stdin.write_all(request.prompt.as_bytes()).await {
                    debug!(provider = %provider, error = %e, "backend closed stdin early");
                }
            }
        };
        let ((), output) = tokio::join!(feed, child.wait_with_output());
        let output = output?;

        let duration_ms = start.elapsed().as_millis() as u64;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "{exe} exited with {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut response = parse_output(&stdout);
        response.duration_ms.get_or_insert(duration_ms);
        debug!(provider = %provider, duration_ms, bytes = response.output.len(), "backend command finished");
        Ok(response)
    }
}
