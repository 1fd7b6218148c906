//! Docker CLI runtime
//!
//! Implements `ContainerRuntime` by shelling out to the `docker` binary.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::env::constants::{DOCKER_COMMAND_TIMEOUT_SECS, DOCKER_PULL_TIMEOUT_SECS};
use crate::domain::container::{ContainerState, InstanceSpec};
use crate::domain::deploy::LogLine;

use super::command::{CommandError, CommandRunner};
use super::runtime::{ContainerRuntime, RuntimeError};

/// Container runtime backed by the docker CLI
#[derive(Clone)]
pub struct DockerCli {
    bin: String,
    build_timeout: Duration,
    /// Cancelled on process shutdown; kills in-flight builds
    shutdown: CancellationToken,
}

impl DockerCli {
    pub fn new(bin: impl Into<String>, build_timeout: Duration, shutdown: CancellationToken) -> Self {
        Self {
            bin: bin.into(),
            build_timeout,
            shutdown,
        }
    }

    fn short_timeout() -> Duration {
        Duration::from_secs(DOCKER_COMMAND_TIMEOUT_SECS)
    }

    async fn docker(&self, args: &[&str]) -> Result<String, RuntimeError> {
        debug!(args = ?args, "docker");
        Ok(CommandRunner::run_checked(&self.bin, args, Self::short_timeout()).await?)
    }
}

/// `docker` reports missing objects with "No such image/container/object"
fn is_not_found(err: &CommandError) -> bool {
    matches!(err, CommandError::Failed { stderr, .. } if stderr.contains("No such"))
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn image_exists(&self, reference: &str) -> Result<bool, RuntimeError> {
        match CommandRunner::run_checked(
            &self.bin,
            ["image", "inspect", "--format", "{{.Id}}", reference],
            Self::short_timeout(),
        )
        .await
        {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn pull_image(&self, reference: &str) -> Result<(), RuntimeError> {
        info!(image = %reference, "Pulling image");
        CommandRunner::run_checked(
            &self.bin,
            ["pull", reference],
            Duration::from_secs(DOCKER_PULL_TIMEOUT_SECS),
        )
        .await?;
        Ok(())
    }

    async fn build_image(
        &self,
        context_dir: &Path,
        tag: &str,
        log_tx: broadcast::Sender<LogLine>,
    ) -> Result<(), RuntimeError> {
        let result = CommandRunner::run_with_streaming(
            &self.bin,
            &["build", "--progress=plain", "-t", tag, "."],
            context_dir,
            log_tx,
            self.shutdown.clone(),
            self.build_timeout,
        )
        .await?;

        if result.status.success() {
            Ok(())
        } else {
            Err(RuntimeError::Command(CommandError::Failed {
                program: format!("{} build", self.bin),
                status: result.status,
                stderr: result.stderr_tail.join("\n"),
            }))
        }
    }

    async fn remove_image(&self, reference: &str) -> Result<(), RuntimeError> {
        match self.docker(&["rmi", "-f", reference]).await {
            Err(RuntimeError::Command(e)) if is_not_found(&e) => Ok(()),
            other => other.map(|_| ()),
        }
    }

    async fn create_container(&self, spec: &InstanceSpec) -> Result<String, RuntimeError> {
        let mut args: Vec<String> = vec![
            "create".into(),
            "--name".into(),
            spec.name.clone(),
            "--restart".into(),
            "unless-stopped".into(),
        ];
        for binding in &spec.port_bindings {
            args.push("-p".into());
            args.push(binding.to_publish_arg());
        }
        for (key, value) in &spec.env {
            args.push("-e".into());
            args.push(format!("{}={}", key, value));
        }
        for host in &spec.extra_hosts {
            args.push("--add-host".into());
            args.push(host.clone());
        }
        for (key, value) in &spec.labels {
            args.push("--label".into());
            args.push(format!("{}={}", key, value));
        }
        args.push(spec.image.clone());

        let stdout =
            CommandRunner::run_checked(&self.bin, &args, Self::short_timeout()).await?;
        let id = stdout.trim().to_string();
        if id.is_empty() {
            return Err(RuntimeError::Parse("docker create returned no id".into()));
        }
        Ok(id)
    }

    async fn start_container(&self, name: &str) -> Result<(), RuntimeError> {
        self.docker(&["start", name]).await.map(|_| ())
    }

    async fn inspect_container(&self, name: &str) -> Result<Option<ContainerState>, RuntimeError> {
        let result = CommandRunner::run_checked(
            &self.bin,
            [
                "inspect",
                "--type",
                "container",
                "--format",
                STATE_FORMAT,
                name,
            ],
            Self::short_timeout(),
        )
        .await;

        match result {
            Ok(stdout) => parse_state(&stdout).map(Some),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn stop_container(&self, name: &str, grace: Duration) -> Result<(), RuntimeError> {
        let secs = grace.as_secs().to_string();
        let timeout = Self::short_timeout() + grace;
        CommandRunner::run_checked(&self.bin, ["stop", "-t", secs.as_str(), name], timeout).await?;
        Ok(())
    }

    async fn remove_container(&self, name: &str) -> Result<(), RuntimeError> {
        self.docker(&["rm", "-f", name]).await.map(|_| ())
    }

    async fn used_host_ports(&self) -> Result<Vec<u16>, RuntimeError> {
        let stdout = self.docker(&["ps", "--format", "{{.Ports}}"]).await?;
        let mut ports: Vec<u16> = stdout.lines().flat_map(parse_host_ports).collect();
        ports.sort_unstable();
        ports.dedup();
        Ok(ports)
    }
}

/// 解析 `{{.State.Running}}|{{.State.Status}}|{{.State.ExitCode}}`
/// inspect 输出格式；标签 JSON 放最后，其中可能含有 `|`
const STATE_FORMAT: &str =
    "{{.State.Running}}|{{.State.Restarting}}|{{.State.Status}}|{{.State.ExitCode}}|{{json .Config.Labels}}";

fn parse_state(stdout: &str) -> Result<ContainerState, RuntimeError> {
    let line = stdout.trim();
    let invalid = || RuntimeError::Parse(format!("container state: {}", line));
    let mut parts = line.splitn(5, '|');
    let running = parse_flag(parts.next()).ok_or_else(invalid)?;
    let restarting = parse_flag(parts.next()).ok_or_else(invalid)?;
    let status = parts.next().unwrap_or("").to_string();
    let exit_code = parts.next().and_then(|c| c.parse().ok());
    let labels = match parts.next().map(str::trim) {
        None | Some("") | Some("null") => BTreeMap::new(),
        Some(raw) => serde_json::from_str::<Option<BTreeMap<String, String>>>(raw)
            .map_err(|e| RuntimeError::Parse(format!("container labels: {}", e)))?
            .unwrap_or_default(),
    };
    Ok(ContainerState {
        running,
        restarting,
        status,
        exit_code,
        labels,
    })
}

fn parse_flag(value: Option<&str>) -> Option<bool> {
    match value {
        Some("true") => Some(true),
        Some("false") => Some(false),
        _ => None,
    }
}

/// 从 `docker ps` 的 Ports 列中提取主机端口
///
/// 例如 `0.0.0.0:30001->3000/tcp, :::30001->3000/tcp, 5432/tcp` -> [30001]
pub fn parse_host_ports(line: &str) -> Vec<u16> {
    let mut ports = Vec::new();
    for entry in line.split(',') {
        let Some((host, _container)) = entry.trim().split_once("->") else {
            continue;
        };
        let Some((_ip, port)) = host.rsplit_once(':') else {
            continue;
        };
        match port.split_once('-') {
            Some((start, end)) => {
                if let (Ok(start), Ok(end)) = (start.parse::<u16>(), end.parse::<u16>()) {
                    ports.extend(start..=end);
                }
            }
            None => {
                if let Ok(port) = port.parse() {
                    ports.push(port);
                }
            }
        }
    }
    ports
}
