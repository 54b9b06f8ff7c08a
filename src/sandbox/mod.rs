mod docker;
mod process;
pub mod runtime;

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    config::{EngineConfig, SandboxBackendKind},
    models::{InputResult, InputResults},
};

pub use docker::DockerSandbox;
pub use process::ProcessSandbox;
pub use runtime::{Runtime, RuntimeRegistry, RuntimeSpec};

const INPUTS_FILE: &str = "inputs.json";
const STDERR_EXCERPT_CHARS: usize = 500;

/// Whole-batch sandbox failure. Per-input faults never show up here.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("sandbox unavailable: {0}")]
    Transport(String),
    #[error("sandbox output could not be parsed: {0}")]
    Output(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub name: String,
    pub contents: String,
}

impl SourceFile {
    pub fn new(name: impl Into<String>, contents: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            contents: contents.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunSpec {
    pub exec_id: Uuid,
    pub runtime: RuntimeSpec,
    pub files: Vec<SourceFile>,
    pub inputs: Vec<String>,
    pub timeout: Duration,
    pub max_output_bytes: usize,
}

#[async_trait]
pub trait SandboxBackend: Send + Sync {
    fn name(&self) -> &'static str;
    async fn execute(&self, spec: RunSpec) -> Result<InputResults, SandboxError>;
}

pub struct SandboxFactory;

impl SandboxFactory {
    pub fn from_config(config: &EngineConfig) -> anyhow::Result<Arc<dyn SandboxBackend>> {
        match config.sandbox_backend {
            SandboxBackendKind::Docker => {
                Ok(Arc::new(DockerSandbox::new(&config.docker_memory)?))
            }
            SandboxBackendKind::Process => Ok(Arc::new(ProcessSandbox::new())),
        }
    }
}

/// Per-execution scratch directory holding the source bundle and inputs.
pub(crate) struct Workspace {
    dir: PathBuf,
}

impl Workspace {
    pub(crate) async fn materialize(spec: &RunSpec) -> Result<Self, SandboxError> {
        let dir = std::env::temp_dir().join(format!(
            "coderun-{}-{}",
            spec.exec_id.as_simple(),
            now_nanos()
        ));
        let workspace = Self { dir };
        if let Err(err) = workspace.write_all(spec).await {
            workspace.cleanup().await;
            return Err(SandboxError::Transport(format!(
                "failed to prepare workspace: {err}"
            )));
        }
        Ok(workspace)
    }

    async fn write_all(&self, spec: &RunSpec) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        for file in &spec.files {
            tokio::fs::write(self.dir.join(&file.name), file.contents.as_bytes()).await?;
        }
        let inputs = serde_json::to_vec(&spec.inputs)?;
        tokio::fs::write(self.dir.join(INPUTS_FILE), inputs).await
    }

    pub(crate) fn path(&self) -> &Path {
        &self.dir
    }

    pub(crate) async fn cleanup(self) {
        match tokio::fs::remove_dir_all(&self.dir).await {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    dir = %self.dir.display(),
                    error = %err,
                    "failed to remove sandbox workspace"
                );
            }
            _ => {}
        }
    }
}

/// Parses the driver's stdout into per-input results.
///
/// The driver prints its mapping last, so when the whole stream is not a JSON
/// object (user code printed something) the last non-empty line is tried.
pub fn parse_driver_output(stdout: &str, stderr: &str) -> Result<InputResults, SandboxError> {
    let map = match serde_json::from_str::<Map<String, Value>>(stdout.trim()) {
        Ok(map) => map,
        Err(err) => {
            let last_line = stdout.lines().rev().map(str::trim).find(|l| !l.is_empty());
            match last_line.map(|line| serde_json::from_str::<Map<String, Value>>(line)) {
                Some(Ok(map)) => map,
                _ => return Err(SandboxError::Output(describe_parse_failure(&err, stderr))),
            }
        }
    };

    Ok(map
        .into_iter()
        .map(|(input, value)| (input, normalize_entry(value)))
        .collect())
}

/// Bare scalars become `{output: value}` so every entry has the same shape.
fn normalize_entry(value: Value) -> InputResult {
    match value {
        Value::Object(mut obj) => InputResult {
            output: obj.remove("output").map(scalar_text).unwrap_or_default(),
            error: obj
                .remove("error")
                .filter(|e| !e.is_null())
                .map(scalar_text),
        },
        other => InputResult::ok(scalar_text(other)),
    }
}

fn scalar_text(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn describe_parse_failure(err: &serde_json::Error, stderr: &str) -> String {
    let stderr = stderr.trim();
    if stderr.is_empty() {
        return err.to_string();
    }
    let excerpt: String = stderr.chars().take(STDERR_EXCERPT_CHARS).collect();
    format!("{err}; stderr: {excerpt}")
}

fn now_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}
