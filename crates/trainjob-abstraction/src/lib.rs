//! Cluster abstraction layer for the trainjob client.
//!
//! This crate defines the object model of the cluster resources the client
//! interprets and the [`ClusterApi`] trait through which they are fetched.
//! Implementations wrap a concrete API client; the core crate only ever talks
//! to this trait.

pub mod models;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

pub use models::{
    ClusterTrainingRuntime, Condition, Container, EnvVar, InitializerSpec, IntOrString, JobSetSpec,
    JobSetTemplateSpec, JobSpec, JobTemplateSpec, Labels, MlPolicy, MpiMlPolicySource, ObjectMeta,
    Pod, PodSpec, PodStatus, PodTemplateSpec, Quantity, ReplicatedJob, ResourceRequirements,
    RuntimeRef, StorageInitializer, TorchMlPolicySource, TrainJobResource, TrainJobSpec,
    TrainJobStatus, TrainerSpec, TrainingRuntimeSpec,
};

/// Failure reported by a cluster API implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// The request did not complete within the allowed time.
    #[error("request timed out: {0}")]
    Timeout(String),

    /// Any other request failure (transport, status code, decoding).
    #[error("request failed: {0}")]
    Request(String),
}

/// Result type for cluster API calls.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// A live, possibly unbounded, stream of log lines.
pub type LogStream = BoxStream<'static, ApiResult<String>>;

/// Operations the trainer client needs from the cluster control plane.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Lists all cluster-scoped training runtimes.
    async fn list_cluster_training_runtimes(&self) -> ApiResult<Vec<ClusterTrainingRuntime>>;

    /// Creates a train job in the namespace.
    async fn create_train_job(&self, namespace: &str, job: &TrainJobResource) -> ApiResult<()>;

    /// Lists train jobs in the namespace.
    async fn list_train_jobs(&self, namespace: &str) -> ApiResult<Vec<TrainJobResource>>;

    /// Fetches one train job.
    async fn get_train_job(&self, namespace: &str, name: &str) -> ApiResult<TrainJobResource>;

    /// Deletes one train job.
    async fn delete_train_job(&self, namespace: &str, name: &str) -> ApiResult<()>;

    /// Lists pods matching a label selector.
    async fn list_pods(&self, namespace: &str, label_selector: &str) -> ApiResult<Vec<Pod>>;

    /// Reads the current log of a pod container.
    async fn read_pod_log(&self, namespace: &str, pod: &str, container: &str)
    -> ApiResult<String>;

    /// Opens a follow stream over a pod container log.
    async fn stream_pod_log(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
    ) -> ApiResult<LogStream>;
}
