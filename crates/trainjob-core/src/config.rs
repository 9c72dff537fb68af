//! Client configuration.

use crate::constants;
use crate::error::{Result, TrainerError};
use crate::logs::LogMultiplexConfig;
use crate::registry::TrainerRegistry;
use crate::types::{Framework, Trainer, TrainerType};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// An extra image profile for the trainer registry.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TrainerProfileConfig {
    /// Image name; any tag is ignored.
    pub image: String,
    #[serde(default = "default_trainer_type")]
    pub trainer_type: TrainerType,
    pub framework: Framework,
    pub entrypoint: String,
}

fn default_trainer_type() -> TrainerType {
    TrainerType::CustomTrainer
}

/// Configuration shared by the cluster and local clients.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ClientConfig {
    /// Namespace for train jobs and pods.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Time budget of each cluster API call, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Directory of runtime manifests for the local client.
    #[serde(default = "default_local_runtimes_path")]
    pub local_runtimes_path: PathBuf,
    #[serde(default)]
    pub logs: LogMultiplexConfig,
    /// Profiles merged over the built-in registry.
    #[serde(default)]
    pub trainers: Vec<TrainerProfileConfig>,
}

/// Namespace of the service account when running in a pod, else `default`.
#[must_use]
pub fn default_namespace() -> String {
    std::fs::read_to_string(constants::SERVICE_ACCOUNT_NAMESPACE_PATH)
        .ok()
        .map(|ns| ns.trim().to_string())
        .filter(|ns| !ns.is_empty())
        .unwrap_or_else(|| constants::DEFAULT_NAMESPACE.to_string())
}

fn default_timeout_secs() -> u64 {
    constants::DEFAULT_TIMEOUT.as_secs()
}

fn default_local_runtimes_path() -> PathBuf {
    PathBuf::from(constants::LOCAL_RUNTIMES_PATH)
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            timeout_secs: default_timeout_secs(),
            local_runtimes_path: default_local_runtimes_path(),
            logs: LogMultiplexConfig::default(),
            trainers: Vec::new(),
        }
    }
}

impl ClientConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    #[must_use]
    pub fn with_local_runtimes_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.local_runtimes_path = path.into();
        self
    }

    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is malformed or a value is out of range.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a TOML configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(TrainerError::InvalidConfig("namespace must not be empty".to_string()));
        }
        if self.timeout_secs == 0 {
            return Err(TrainerError::InvalidConfig("timeout_secs must be positive".to_string()));
        }
        if let Some(profile) = self.trainers.iter().find(|p| p.image.is_empty() || p.entrypoint.is_empty()) {
            return Err(TrainerError::InvalidConfig(format!(
                "trainer profile '{}' needs an image and an entrypoint",
                profile.image
            )));
        }
        self.logs.validate()
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Built-in registry with the configured profiles applied.
    #[must_use]
    pub fn registry(&self) -> TrainerRegistry {
        self.trainers.iter().fold(TrainerRegistry::builtin(), |registry, profile| {
            registry.with_profile(
                &profile.image,
                Trainer::new(profile.trainer_type, profile.framework, profile.entrypoint.clone()),
            )
        })
    }
}
