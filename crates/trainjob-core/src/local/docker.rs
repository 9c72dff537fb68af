//! Docker CLI implementation of [`ContainerEngine`].

use super::engine::{
    ContainerEngine, EngineError, EngineResult, LabelFilter, Labels, NetworkInfo, NetworkSpec,
    UnitInfo, UnitSpec, UnitState,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Deserialize;
use std::process::Stdio;
use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;
use tokio::process::Command;
use tokio_stream::wrappers::LinesStream;
use tracing::debug;
use trainjob_abstraction::{ApiError, LogStream};

/// Drives the `docker` binary.
#[derive(Debug, Clone)]
pub struct DockerEngine {
    binary: String,
}

impl DockerEngine {
    /// Creates an engine using `docker` from `PATH`.
    ///
    /// # Errors
    /// Returns error if Docker is not available
    pub fn new() -> EngineResult<Self> {
        Self::with_binary("docker")
    }

    /// Creates an engine using a docker-compatible binary (e.g. `podman`).
    pub fn with_binary(binary: impl Into<String>) -> EngineResult<Self> {
        let binary = binary.into();
        let output = std::process::Command::new(&binary)
            .arg("--version")
            .output()
            .map_err(|e| EngineError::Unavailable(format!("{binary} not found: {e}")))?;
        if !output.status.success() {
            return Err(EngineError::Unavailable(format!("{binary} --version failed")));
        }

        Ok(Self { binary })
    }

    /// Labels come from `inspect` as a JSON map; the `ps` label column is
    /// comma-joined and ambiguous for values containing commas.
    async fn inspect_unit(&self, name: &str) -> EngineResult<UnitInfo> {
        let raw = self
            .run(&strings(&["container", "inspect", name]))
            .await
            .map_err(|e| not_found(e, || EngineError::UnitNotFound(name.to_string())))?;
        parse_container_inspect(&raw)
    }

    async fn run(&self, args: &[String]) -> EngineResult<String> {
        debug!(binary = %self.binary, command = %args.first().map_or("", String::as_str), "Running engine command");
        let output = Command::new(&self.binary).args(args).output().await?;

        if !output.status.success() {
            return Err(EngineError::CommandFailed {
                command: format!("{} {}", self.binary, args.iter().take(2).cloned().collect::<Vec<_>>().join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn create_network(&self, spec: &NetworkSpec) -> EngineResult<()> {
        self.run(&network_create_args(spec)).await.map(|_| ())
    }

    async fn inspect_network(&self, name: &str) -> EngineResult<NetworkInfo> {
        let raw = self
            .run(&strings(&["network", "inspect", name]))
            .await
            .map_err(|e| not_found(e, || EngineError::NetworkNotFound(name.to_string())))?;
        parse_network_inspect(&raw)
    }

    async fn list_networks(&self, filters: &[LabelFilter]) -> EngineResult<Vec<NetworkInfo>> {
        let mut args = strings(&["network", "ls"]);
        args.extend(filter_args(filters));
        args.extend(strings(&["--format", "{{.Name}}"]));

        let raw = self.run(&args).await?;
        let mut networks = Vec::new();
        for name in raw.lines().map(str::trim).filter(|line| !line.is_empty()) {
            match self.inspect_network(name).await {
                Ok(network) => networks.push(network),
                // Removed between the listing and the inspection.
                Err(EngineError::NetworkNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(networks)
    }

    async fn remove_network(&self, name: &str) -> EngineResult<()> {
        self.run(&strings(&["network", "rm", name]))
            .await
            .map(|_| ())
            .map_err(|e| not_found(e, || EngineError::NetworkNotFound(name.to_string())))
    }

    async fn run_unit(&self, spec: &UnitSpec) -> EngineResult<()> {
        self.run(&run_args(spec)).await.map(|_| ())
    }

    async fn list_units(&self, filters: &[LabelFilter]) -> EngineResult<Vec<UnitInfo>> {
        let mut args = strings(&["ps", "--all", "--no-trunc"]);
        args.extend(filter_args(filters));
        args.extend(strings(&["--format", "{{.Names}}"]));

        let raw = self.run(&args).await?;
        let mut units = Vec::new();
        for name in raw.lines().map(str::trim).filter(|line| !line.is_empty()) {
            match self.inspect_unit(name).await {
                Ok(unit) => units.push(unit),
                Err(EngineError::UnitNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(units)
    }

    async fn remove_unit(&self, name: &str) -> EngineResult<()> {
        self.run(&strings(&["rm", "--force", name]))
            .await
            .map(|_| ())
            .map_err(|e| not_found(e, || EngineError::UnitNotFound(name.to_string())))
    }

    async fn unit_logs(&self, name: &str) -> EngineResult<String> {
        let output = Command::new(&self.binary).args(["logs", name]).output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(not_found(
                EngineError::CommandFailed { command: format!("{} logs", self.binary), stderr },
                || EngineError::UnitNotFound(name.to_string()),
            ));
        }

        // The unit's stderr comes back on our stderr.
        let mut logs = String::from_utf8_lossy(&output.stdout).into_owned();
        logs.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(logs)
    }

    async fn follow_unit_logs(&self, name: &str) -> EngineResult<LogStream> {
        let mut child = Command::new(&self.binary)
            .args(["logs", "--follow", name])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(EngineError::Parse("log process has no output pipes".to_string()));
        };

        let lines = futures::stream::select(
            LinesStream::new(BufReader::new(stdout).lines()),
            LinesStream::new(BufReader::new(stderr).lines()),
        );

        // The child lives as long as the stream; dropping the stream kills it.
        let stream = futures::stream::unfold((child, lines), |(child, mut lines)| async move {
            let next = lines.next().await?;
            Some((next.map_err(|e| ApiError::Request(e.to_string())), (child, lines)))
        });

        Ok(stream.boxed())
    }
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|arg| (*arg).to_string()).collect()
}

fn not_found(error: EngineError, missing: impl FnOnce() -> EngineError) -> EngineError {
    match &error {
        EngineError::CommandFailed { stderr, .. }
            if stderr.contains("No such") || stderr.contains("not found") =>
        {
            missing()
        }
        _ => error,
    }
}

fn label_args(labels: &Labels) -> impl Iterator<Item = String> + '_ {
    labels.iter().flat_map(|(key, value)| ["--label".to_string(), format!("{key}={value}")])
}

fn filter_args(filters: &[LabelFilter]) -> Vec<String> {
    filters.iter().flat_map(|filter| ["--filter".to_string(), format!("label={filter}")]).collect()
}

fn network_create_args(spec: &NetworkSpec) -> Vec<String> {
    let mut args = strings(&["network", "create", "--driver", "bridge"]);
    args.extend(label_args(&spec.labels));
    args.push(spec.name.clone());
    args
}

fn run_args(spec: &UnitSpec) -> Vec<String> {
    let mut args = strings(&["run", "--detach", "--name", &spec.name, "--network", &spec.network]);
    args.extend(label_args(&spec.labels));
    for (key, value) in &spec.env {
        args.push("-e".to_string());
        args.push(format!("{key}={value}"));
    }

    // docker takes a single entrypoint binary; the rest leads the command.
    let mut entrypoint = spec.entrypoint.iter();
    if let Some(binary) = entrypoint.next() {
        args.push("--entrypoint".to_string());
        args.push(binary.clone());
    }
    args.push(spec.image.clone());
    args.extend(entrypoint.cloned());
    args.extend(spec.command.iter().cloned());
    args
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NetworkInspect {
    name: String,
    created: String,
    #[serde(default)]
    labels: Option<Labels>,
}

fn parse_network_inspect(raw: &str) -> EngineResult<NetworkInfo> {
    let mut networks: Vec<NetworkInspect> =
        serde_json::from_str(raw).map_err(|e| EngineError::Parse(e.to_string()))?;
    if networks.is_empty() {
        return Err(EngineError::Parse("empty network inspect output".to_string()));
    }
    let network = networks.swap_remove(0);

    let created = DateTime::parse_from_rfc3339(&network.created)
        .map_err(|e| EngineError::Parse(format!("network created time '{}': {e}", network.created)))?
        .with_timezone(&Utc);

    Ok(NetworkInfo { name: network.name, labels: network.labels.unwrap_or_default(), created })
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerInspect {
    name: String,
    #[serde(default)]
    config: Option<ContainerConfig>,
    state: ContainerState,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerConfig {
    #[serde(default)]
    labels: Option<Labels>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerState {
    status: String,
    #[serde(default)]
    exit_code: Option<i32>,
}

fn parse_container_inspect(raw: &str) -> EngineResult<UnitInfo> {
    let mut containers: Vec<ContainerInspect> =
        serde_json::from_str(raw).map_err(|e| EngineError::Parse(e.to_string()))?;
    if containers.is_empty() {
        return Err(EngineError::Parse("empty container inspect output".to_string()));
    }
    let container = containers.swap_remove(0);

    let state = match UnitState::parse(&container.state.status, "") {
        UnitState::Exited(_) => UnitState::Exited(container.state.exit_code),
        state => state,
    };

    Ok(UnitInfo {
        name: container.name.trim_start_matches('/').to_string(),
        labels: container.config.and_then(|config| config.labels).unwrap_or_default(),
        state,
    })
}
