//! Logical view of runtimes and train jobs.
//!
//! These types are projections of cluster (or local engine) state. They are
//! rebuilt on every call and never cached.

use crate::constants;
use crate::script::TrainFunction;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainerType {
    /// Runs a user-supplied training function.
    CustomTrainer,
    /// Runs a trainer shipped with the runtime image.
    BuiltinTrainer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framework {
    Torch,
    Deepspeed,
    Mlx,
    Torchtune,
}

impl std::fmt::Display for Framework {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Torch => "torch",
            Self::Deepspeed => "deepspeed",
            Self::Mlx => "mlx",
            Self::Torchtune => "torchtune",
        };
        f.write_str(name)
    }
}

/// Accelerator family of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Cpu,
    Gpu,
    Tpu,
    #[default]
    Unknown,
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Cpu => "cpu",
            Self::Gpu => "gpu",
            Self::Tpu => "tpu",
            Self::Unknown => constants::UNKNOWN,
        };
        f.write_str(name)
    }
}

/// Number of devices, or unknown when nothing declares it.
///
/// Counts are fractional because CPU limits can be (`500m`).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DeviceCount {
    #[default]
    Unknown,
    Count(f64),
}

impl DeviceCount {
    #[must_use]
    pub fn count(value: u32) -> Self {
        Self::Count(f64::from(value))
    }

    /// Scales a known count; unknown stays unknown.
    #[must_use]
    pub fn scaled(self, factor: f64) -> Self {
        match self {
            Self::Count(value) => Self::Count(value * factor),
            Self::Unknown => Self::Unknown,
        }
    }
}

impl std::fmt::Display for DeviceCount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => f.write_str(constants::UNKNOWN),
            Self::Count(value) if value.fract().abs() < f64::EPSILON => write!(f, "{value:.0}"),
            Self::Count(value) => write!(f, "{value}"),
        }
    }
}

/// Trainer profile of a runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trainer {
    pub trainer_type: TrainerType,
    pub framework: Framework,
    /// Command template the training script is handed to (e.g. `torchrun`).
    pub entrypoint: String,
    /// Accelerator type from the runtime labels.
    #[serde(default = "unknown_string")]
    pub accelerator: String,
    /// Total accelerators across all nodes.
    #[serde(default)]
    pub accelerator_count: DeviceCount,
}

fn unknown_string() -> String {
    constants::UNKNOWN.to_string()
}

impl Trainer {
    #[must_use]
    pub fn new(trainer_type: TrainerType, framework: Framework, entrypoint: impl Into<String>) -> Self {
        Self {
            trainer_type,
            framework,
            entrypoint: entrypoint.into(),
            accelerator: unknown_string(),
            accelerator_count: DeviceCount::Unknown,
        }
    }
}

/// A training runtime available to train jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Runtime {
    pub name: String,
    pub trainer: Trainer,
    /// Declared node count of the runtime.
    pub num_nodes: u32,
    /// Image of the trainer container.
    pub image: Option<String>,
}

/// Lifecycle status of a job as surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum JobStatus {
    Created,
    Succeeded,
    Failed,
    #[default]
    Unknown,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Created => "Created",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Unknown => constants::UNKNOWN,
        };
        f.write_str(name)
    }
}

/// One physical unit of execution inside a train job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// `dataset-initializer`, `model-initializer` or `trainer-node-<index>`.
    pub name: String,
    /// Raw pod phase or engine state; `None` when not reported yet.
    pub status: Option<String>,
    /// Owning pod name or container name.
    pub pod_name: String,
    pub device: DeviceKind,
    pub device_count: DeviceCount,
}

/// Externally visible handle of a train job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainJob {
    pub name: String,
    pub creation_timestamp: DateTime<Utc>,
    pub runtime_ref: String,
    pub steps: Vec<Step>,
    pub status: JobStatus,
}

impl TrainJob {
    /// Finds a step by name.
    #[must_use]
    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|step| step.name == name)
    }
}

/// Hugging Face storage location for a dataset or model initializer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HuggingFaceInitializer {
    pub storage_uri: String,
}

impl HuggingFaceInitializer {
    #[must_use]
    pub fn new(storage_uri: impl Into<String>) -> Self {
        Self { storage_uri: storage_uri.into() }
    }

    /// Storage URI with the `hf://` scheme.
    #[must_use]
    pub fn normalized_uri(&self) -> String {
        if self.storage_uri.starts_with("hf://") {
            self.storage_uri.clone()
        } else {
            format!("hf://{}", self.storage_uri)
        }
    }
}

/// Dataset and model initialization for a train job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Initializer {
    pub dataset: Option<HuggingFaceInitializer>,
    pub model: Option<HuggingFaceInitializer>,
}

/// User overrides for the trainer of a train job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomTrainer {
    /// Training function to run through the runtime's entrypoint.
    pub func: Option<TrainFunction>,
    #[serde(default)]
    pub packages_to_install: Vec<String>,
    #[serde(default = "default_pip_index_url")]
    pub pip_index_url: String,
    pub num_nodes: Option<u32>,
    /// Resources per node, keyed by resource name (`gpu`, `cpu`, `memory`).
    #[serde(default)]
    pub resources_per_node: BTreeMap<String, String>,
}

fn default_pip_index_url() -> String {
    constants::DEFAULT_PIP_INDEX_URL.to_string()
}

impl Default for CustomTrainer {
    fn default() -> Self {
        Self {
            func: None,
            packages_to_install: Vec::new(),
            pip_index_url: default_pip_index_url(),
            num_nodes: None,
            resources_per_node: BTreeMap::new(),
        }
    }
}

impl CustomTrainer {
    #[must_use]
    pub fn with_func(mut self, func: TrainFunction) -> Self {
        self.func = Some(func);
        self
    }

    #[must_use]
    pub fn with_num_nodes(mut self, num_nodes: u32) -> Self {
        self.num_nodes = Some(num_nodes);
        self
    }

    #[must_use]
    pub fn with_packages(mut self, packages: Vec<String>) -> Self {
        self.packages_to_install = packages;
        self
    }

    #[must_use]
    pub fn with_resource(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.resources_per_node.insert(key.into(), value.into());
        self
    }
}
