//! Running train jobs without a cluster.
//!
//! [`JobRunner`] emulates a runtime's node topology on a [`ContainerEngine`]:
//! one network per job, one unit per node, and the rendezvous environment a
//! cluster would inject. [`LocalTrainerClient`] exposes it as a
//! [`TrainerBackend`](crate::backend::TrainerBackend).

pub mod client;
pub mod docker;
pub mod engine;
pub mod runner;

pub use client::{LocalTrainerClient, to_train_job};
pub use docker::DockerEngine;
pub use engine::{
    ContainerEngine, EngineError, EngineResult, LabelFilter, NetworkInfo, NetworkSpec, UnitInfo, UnitSpec,
    UnitState,
};
pub use runner::{ContainerJob, ContainerUnit, JobRunner, LocalJobRequest, aggregate_status};
