//! Trainjob Core
//!
//! Client-side view of distributed train jobs:
//! - Resolving runtimes and job pods into trainers and steps (`topology`, `device`)
//! - Following the logs of several pods at once (`logs`)
//! - Running jobs on a local container engine (`local`)
//! - Cluster and local clients behind one [`TrainerBackend`] trait
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use trainjob_core::{ClientConfig, DockerEngine, LocalTrainerClient, TrainerBackend};
//!
//! #[tokio::main]
//! async fn main() -> trainjob_core::Result<()> {
//!     let config = ClientConfig::load("trainjob.toml")?;
//!     let client = LocalTrainerClient::new(Arc::new(DockerEngine::new()?), &config)?;
//!     for runtime in client.list_runtimes().await? {
//!         println!("{} ({})", runtime.name, runtime.trainer.framework);
//!     }
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod client;
pub mod config;
pub mod constants;
pub mod device;
pub mod error;
pub mod local;
pub mod logs;
pub mod naming;
pub mod registry;
pub mod script;
pub mod topology;
pub mod types;

pub use backend::TrainerBackend;
pub use client::TrainerClient;
pub use config::{ClientConfig, TrainerProfileConfig};
pub use device::resolve_devices;
pub use error::{Result, TrainerError};
pub use local::{ContainerEngine, ContainerJob, DockerEngine, JobRunner, LocalJobRequest, LocalTrainerClient};
pub use logs::{LogMultiplexConfig, LogMultiplexer, LogRequest, LogSink, LogSource, NullLogSink, StdoutLogSink};
pub use registry::TrainerRegistry;
pub use script::{LauncherScript, TrainFunction};
pub use topology::{resolve_runtime, resolve_steps, resolve_trainer};
pub use types::{
    CustomTrainer, DeviceCount, DeviceKind, Framework, HuggingFaceInitializer, Initializer, JobStatus,
    Runtime, Step, TrainJob, Trainer, TrainerType,
};
