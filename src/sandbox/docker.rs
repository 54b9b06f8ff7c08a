use anyhow::Context;
use async_trait::async_trait;
use bollard::{
    Docker,
    container::{
        Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
        StartContainerOptions, WaitContainerOptions,
    },
    errors::Error as DockerError,
    image::CreateImageOptions,
    models::HostConfig,
};
use futures_util::StreamExt;

use crate::{
    models::InputResults,
    sandbox::{RunSpec, SandboxBackend, SandboxError, Workspace, parse_driver_output},
};

const CONTAINER_WORKDIR: &str = "/src";

/// Runs each execution in a throwaway container on the local docker daemon.
///
/// The workspace is bind-mounted read-only, so nothing the container does can
/// leave files behind that the service user cannot remove.
pub struct DockerSandbox {
    docker: Docker,
    memory_bytes: i64,
}

#[derive(Debug, Default)]
struct ContainerOutput {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl DockerSandbox {
    /// Connects with the daemon defaults (`DOCKER_HOST` or the local socket).
    /// No request is made until the first execution.
    pub fn new(memory_limit: &str) -> anyhow::Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("failed to configure docker client")?;
        Self::with_client(docker, memory_limit)
    }

    pub fn with_client(docker: Docker, memory_limit: &str) -> anyhow::Result<Self> {
        let memory_bytes = parse_memory_limit(memory_limit)
            .with_context(|| format!("invalid DOCKER_MEMORY: {memory_limit}"))?;
        Ok(Self {
            docker,
            memory_bytes,
        })
    }

    fn container_name(spec: &RunSpec) -> String {
        format!("coderun-{}", spec.exec_id.as_simple())
    }

    fn container_config(&self, spec: &RunSpec, workspace: &Workspace) -> Config<String> {
        Config {
            image: Some(spec.runtime.image.clone()),
            cmd: Some(spec.runtime.command.clone()),
            working_dir: Some(CONTAINER_WORKDIR.to_string()),
            env: Some(vec!["PYTHONDONTWRITEBYTECODE=1".to_string()]),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            network_disabled: Some(true),
            host_config: Some(HostConfig {
                binds: Some(vec![format!(
                    "{}:{CONTAINER_WORKDIR}:ro",
                    workspace.path().display()
                )]),
                memory: Some(self.memory_bytes),
                network_mode: Some("none".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }
        tracing::info!(image, "pulling sandbox image");
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });
        let mut progress = self.docker.create_image(options, None, None);
        while let Some(step) = progress.next().await {
            step.map_err(|err| transport(&format!("failed to pull image {image}"), err))?;
        }
        Ok(())
    }

    /// Starts the container and collects its logs until it stops or the
    /// timeout elapses. The caller always removes the container.
    async fn run_container(
        &self,
        id: &str,
        spec: &RunSpec,
    ) -> Result<ContainerOutput, SandboxError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|err| transport("failed to start container", err))?;

        let limit = spec.max_output_bytes;
        let mut output = ContainerOutput::default();
        let collect = async {
            let mut logs = self.docker.logs(
                id,
                Some(LogsOptions::<String> {
                    follow: true,
                    stdout: true,
                    stderr: true,
                    ..Default::default()
                }),
            );
            while let Some(chunk) = logs.next().await {
                match chunk {
                    Ok(LogOutput::StdOut { message }) => {
                        push_limited(&mut output.stdout, &message, limit)
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        push_limited(&mut output.stderr, &message, limit)
                    }
                    Ok(_) => {}
                    Err(err) => return Err(transport("failed to read container logs", err)),
                }
            }
            Ok(())
        };

        match tokio::time::timeout(spec.timeout, collect).await {
            Ok(collected) => collected?,
            Err(_) => {
                return Err(SandboxError::Transport(format!(
                    "container timed out after {} ms",
                    spec.timeout.as_millis()
                )));
            }
        }

        let exit_code = self.exit_code(id).await;
        tracing::debug!(
            exec_id = %spec.exec_id,
            image = %spec.runtime.image,
            exit_code,
            "container exited"
        );
        Ok(output)
    }

    async fn exit_code(&self, id: &str) -> Option<i64> {
        let mut waits = self.docker.wait_container(
            id,
            Some(WaitContainerOptions {
                condition: "not-running",
            }),
        );
        match waits.next().await? {
            Ok(response) => Some(response.status_code),
            Err(DockerError::DockerContainerWaitError { code, .. }) => Some(code),
            Err(_) => None,
        }
    }

    async fn remove(&self, id: &str) {
        let options = Some(RemoveContainerOptions {
            force: true,
            ..Default::default()
        });
        if let Err(err) = self.docker.remove_container(id, options).await {
            tracing::warn!(container = id, error = %err, "failed to remove container");
        }
    }
}

#[async_trait]
impl SandboxBackend for DockerSandbox {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn execute(&self, spec: RunSpec) -> Result<InputResults, SandboxError> {
        self.ensure_image(&spec.runtime.image).await?;
        let workspace = Workspace::materialize(&spec).await?;

        let name = Self::container_name(&spec);
        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.as_str(),
                    platform: None,
                }),
                self.container_config(&spec, &workspace),
            )
            .await;
        let result = match created {
            Ok(container) => {
                let result = self.run_container(&container.id, &spec).await;
                self.remove(&container.id).await;
                result
            }
            Err(err) => Err(transport("failed to create container", err)),
        };
        workspace.cleanup().await;

        let output = result?;
        parse_driver_output(
            &String::from_utf8_lossy(&output.stdout),
            &String::from_utf8_lossy(&output.stderr),
        )
    }
}

fn transport(action: &str, err: DockerError) -> SandboxError {
    SandboxError::Transport(format!("{action}: {err}"))
}

fn push_limited(buf: &mut Vec<u8>, chunk: &[u8], limit: usize) {
    let remaining = limit.saturating_sub(buf.len());
    buf.extend_from_slice(&chunk[..remaining.min(chunk.len())]);
}

/// Parses docker-style sizes such as `256m`, `1g` or `1048576`.
fn parse_memory_limit(raw: &str) -> anyhow::Result<i64> {
    let raw = raw.trim().to_ascii_lowercase();
    let (digits, unit) = match raw.char_indices().find(|(_, c)| !c.is_ascii_digit()) {
        Some((idx, _)) => raw.split_at(idx),
        None => (raw.as_str(), ""),
    };
    let multiplier: i64 = match unit {
        "" | "b" => 1,
        "k" | "kb" => 1024,
        "m" | "mb" => 1024 * 1024,
        "g" | "gb" => 1024 * 1024 * 1024,
        other => anyhow::bail!("unknown size unit {other:?}"),
    };
    let value: i64 = digits.parse().context("size must start with a number")?;
    value
        .checked_mul(multiplier)
        .filter(|bytes| *bytes > 0)
        .context("size must be positive")
}
