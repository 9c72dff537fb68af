//! Operations shared by the cluster and local trainer clients.

use crate::error::Result;
use crate::logs::{LogRequest, LogSink};
use crate::types::{CustomTrainer, Initializer, Runtime, TrainJob};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;

/// A place train jobs run: a cluster or the local container engine.
#[async_trait]
pub trait TrainerBackend: Send + Sync {
    /// Lists the runtimes train jobs can use.
    async fn list_runtimes(&self) -> Result<Vec<Runtime>>;

    /// Fetches one runtime by name.
    async fn get_runtime(&self, name: &str) -> Result<Runtime>;

    /// Submits a train job against a runtime and returns the job name.
    async fn train(
        &self,
        runtime: &str,
        initializer: Option<&Initializer>,
        trainer: Option<&CustomTrainer>,
    ) -> Result<String>;

    /// Lists train jobs, optionally only those of one runtime.
    async fn list_jobs(&self, runtime: Option<&str>) -> Result<Vec<TrainJob>>;

    async fn get_job(&self, name: &str) -> Result<TrainJob>;

    /// Reads, or follows, the logs of one step.
    ///
    /// Lines are handed to `sink` as they arrive; the result maps step names
    /// to their collected output.
    async fn get_job_logs(
        &self,
        name: &str,
        request: &LogRequest,
        sink: &dyn LogSink,
        cancel: &CancellationToken,
    ) -> Result<BTreeMap<String, String>>;

    async fn delete_job(&self, name: &str) -> Result<()>;
}
