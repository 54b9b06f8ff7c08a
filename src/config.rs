use std::{env, net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{Context, Result, anyhow};

use crate::sandbox::{Runtime, RuntimeRegistry, RuntimeSpec};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub bind_addr: SocketAddr,
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub sandbox_backend: SandboxBackendKind,
    pub sandbox_timeout: Duration,
    pub max_output_bytes: usize,
    pub docker_memory: String,
    pub default_language: String,
    pub runtimes: Vec<RuntimeSpec>,
    pub api_tokens: Vec<String>,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub max_wait: Duration,
    pub limits: RequestLimits,
}

#[derive(Debug, Clone, Copy)]
pub struct RequestLimits {
    pub max_code_bytes: usize,
    pub max_inputs: usize,
    pub max_input_bytes: usize,
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self {
            max_code_bytes: 250_000,
            max_inputs: 1024,
            max_input_bytes: 64_000,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bind_addr = lookup("BIND_ADDR")
            .unwrap_or_else(|| "0.0.0.0:5000".to_string())
            .parse::<SocketAddr>()
            .context("invalid BIND_ADDR")?;

        let sandbox_backend = lookup("SANDBOX_BACKEND")
            .map(|raw| raw.parse::<SandboxBackendKind>())
            .transpose()
            .map_err(|err| anyhow!(err))?
            .unwrap_or_default();

        let runtimes = parse_runtimes(&lookup)?;

        let defaults = RequestLimits::default();
        let limits = RequestLimits {
            max_code_bytes: env_parse(&lookup, "MAX_CODE_BYTES", defaults.max_code_bytes),
            max_inputs: env_parse(&lookup, "MAX_INPUTS", defaults.max_inputs),
            max_input_bytes: env_parse(&lookup, "MAX_INPUT_BYTES", defaults.max_input_bytes),
        };

        Ok(Self {
            bind_addr,
            worker_count: env_parse(&lookup, "WORKER_COUNT", 4usize).max(1),
            queue_capacity: env_parse(&lookup, "QUEUE_CAPACITY", 1024usize).max(1),
            sandbox_backend,
            sandbox_timeout: Duration::from_millis(env_parse(
                &lookup,
                "SANDBOX_TIMEOUT_MS",
                30_000u64,
            )),
            max_output_bytes: env_parse(&lookup, "MAX_OUTPUT_BYTES", 1024 * 1024usize),
            docker_memory: lookup("DOCKER_MEMORY").unwrap_or_else(|| "256m".to_string()),
            default_language: lookup("CODE_LANGUAGE").unwrap_or_else(|| "python".to_string()),
            runtimes,
            api_tokens: parse_csv(lookup("API_TOKEN"), "my-default-token"),
            log_dir: PathBuf::from(lookup("LOG_DIR").unwrap_or_else(|| "logs".to_string())),
            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            max_wait: Duration::from_millis(env_parse(&lookup, "MAX_WAIT_MS", 30_000u64)),
            limits,
        })
    }

    pub fn runtime_registry(&self) -> RuntimeRegistry {
        RuntimeRegistry::new(self.runtimes.iter().cloned())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SandboxBackendKind {
    #[default]
    Docker,
    Process,
}

impl FromStr for SandboxBackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "process" => Ok(Self::Process),
            _ => Err(format!("unsupported sandbox backend: {s}")),
        }
    }
}

fn parse_runtimes<F>(lookup: &F) -> Result<Vec<RuntimeSpec>>
where
    F: Fn(&str) -> Option<String>,
{
    let enabled = parse_csv(lookup("ENABLED_LANGUAGES"), "python,java,javascript");
    let mut specs: Vec<RuntimeSpec> = Vec::with_capacity(enabled.len());
    for name in enabled {
        let runtime = name
            .parse::<Runtime>()
            .map_err(|err| anyhow!("invalid ENABLED_LANGUAGES: {err}"))?;
        if specs.iter().any(|s| s.runtime == runtime) {
            continue;
        }
        let mut spec = RuntimeSpec::with_defaults(runtime);
        let image_key = format!("{}_IMAGE", runtime.name().to_ascii_uppercase());
        if let Some(image) = lookup(&image_key).filter(|s| !s.trim().is_empty()) {
            spec.image = image;
        }
        specs.push(spec);
    }
    Ok(specs)
}

fn parse_csv(raw: Option<String>, default: &str) -> Vec<String> {
    let parsed: Vec<String> = raw
        .unwrap_or_else(|| default.to_string())
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect();
    if parsed.is_empty() {
        return vec![default.to_string()];
    }
    parsed
}

fn env_parse<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    lookup(key)
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}
