//! Container engine abstraction used by the local job runner.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use thiserror::Error;
use trainjob_abstraction::LogStream;

/// Errors from the container engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine binary is missing or not responding.
    #[error("container engine not available: {0}")]
    Unavailable(String),

    /// An engine command exited unsuccessfully.
    #[error("`{command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    /// Engine output could not be parsed.
    #[error("unexpected engine output: {0}")]
    Parse(String),

    #[error("network not found: {0}")]
    NetworkNotFound(String),

    #[error("unit not found: {0}")]
    UnitNotFound(String),

    #[error("engine I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

pub type Labels = BTreeMap<String, String>;

/// Matches objects carrying a label, optionally with a given value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelFilter {
    pub key: String,
    pub value: Option<String>,
}

impl LabelFilter {
    #[must_use]
    pub fn exists(key: impl Into<String>) -> Self {
        Self { key: key.into(), value: None }
    }

    #[must_use]
    pub fn equals(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self { key: key.into(), value: Some(value.into()) }
    }

    #[must_use]
    pub fn matches(&self, labels: &Labels) -> bool {
        match (&self.value, labels.get(&self.key)) {
            (None, Some(_)) => true,
            (Some(expected), Some(actual)) => expected == actual,
            (_, None) => false,
        }
    }
}

impl std::fmt::Display for LabelFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.value {
            Some(value) => write!(f, "{}={value}", self.key),
            None => f.write_str(&self.key),
        }
    }
}

/// True if every filter matches.
#[must_use]
pub fn matches_all(filters: &[LabelFilter], labels: &Labels) -> bool {
    filters.iter().all(|filter| filter.matches(labels))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSpec {
    pub name: String,
    pub labels: Labels,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInfo {
    pub name: String,
    pub labels: Labels,
    pub created: DateTime<Utc>,
}

/// One execution unit (container) to start detached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitSpec {
    pub name: String,
    pub image: String,
    pub network: String,
    pub entrypoint: Vec<String>,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub labels: Labels,
}

/// Lifecycle state of a unit as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitState {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    /// Exited with the given code; `None` when the engine did not report one.
    Exited(Option<i32>),
    Dead,
    Other(String),
}

impl UnitState {
    /// Parses the engine's state word and, for exited units, the exit code
    /// from its status text (`Exited (1) 3 seconds ago`).
    #[must_use]
    pub fn parse(state: &str, status: &str) -> Self {
        match state.trim().to_ascii_lowercase().as_str() {
            "created" => Self::Created,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "restarting" => Self::Restarting,
            "removing" => Self::Removing,
            "exited" => Self::Exited(parse_exit_code(status)),
            "dead" => Self::Dead,
            other => Self::Other(other.to_string()),
        }
    }

    /// Short state name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Restarting => "restarting",
            Self::Removing => "removing",
            Self::Exited(_) => "exited",
            Self::Dead => "dead",
            Self::Other(state) => state,
        }
    }
}

fn parse_exit_code(status: &str) -> Option<i32> {
    let open = status.find('(')?;
    let close = status[open..].find(')')? + open;
    status[open + 1..close].trim().parse().ok()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitInfo {
    pub name: String,
    pub labels: Labels,
    pub state: UnitState,
}

/// Networks and units of an isolated local execution substrate.
///
/// Labels are the only index: jobs are found by filtering networks and units
/// on their labels, never through state kept by the caller.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn create_network(&self, spec: &NetworkSpec) -> EngineResult<()>;

    async fn inspect_network(&self, name: &str) -> EngineResult<NetworkInfo>;

    async fn list_networks(&self, filters: &[LabelFilter]) -> EngineResult<Vec<NetworkInfo>>;

    async fn remove_network(&self, name: &str) -> EngineResult<()>;

    async fn run_unit(&self, spec: &UnitSpec) -> EngineResult<()>;

    /// Lists units in any state.
    async fn list_units(&self, filters: &[LabelFilter]) -> EngineResult<Vec<UnitInfo>>;

    /// Force-removes a unit, running or not.
    async fn remove_unit(&self, name: &str) -> EngineResult<()>;

    async fn unit_logs(&self, name: &str) -> EngineResult<String>;

    /// Streams a unit's log lines until it exits.
    async fn follow_unit_logs(&self, name: &str) -> EngineResult<LogStream>;
}
