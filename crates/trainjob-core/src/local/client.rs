//! Trainer backend running jobs on the local container engine.

use super::engine::ContainerEngine;
use super::runner::{ContainerJob, JobRunner, LocalJobRequest};
use crate::backend::TrainerBackend;
use crate::config::ClientConfig;
use crate::constants;
use crate::error::{Result, TrainerError};
use crate::logs::{LogMultiplexer, LogRequest, LogSink};
use crate::registry::TrainerRegistry;
use crate::script::LauncherScript;
use crate::topology::resolve_runtime;
use crate::types::{CustomTrainer, DeviceCount, DeviceKind, Initializer, Runtime, Step, TrainJob};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use trainjob_abstraction::ClusterTrainingRuntime;

/// Runs train jobs without a cluster.
///
/// Runtimes come from YAML manifests in a directory; jobs are emulated by a
/// [`JobRunner`].
#[derive(Debug, Clone)]
pub struct LocalTrainerClient {
    runner: JobRunner,
    registry: TrainerRegistry,
    runtimes_path: PathBuf,
}

impl LocalTrainerClient {
    pub fn new(engine: Arc<dyn ContainerEngine>, config: &ClientConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            runner: JobRunner::new(engine).with_multiplexer(LogMultiplexer::new(config.logs.clone())),
            registry: config.registry(),
            runtimes_path: config.local_runtimes_path.clone(),
        })
    }

    #[must_use]
    pub fn with_registry(mut self, registry: TrainerRegistry) -> Self {
        self.registry = registry;
        self
    }

    #[must_use]
    pub fn runner(&self) -> &JobRunner {
        &self.runner
    }

    #[must_use]
    pub fn runtimes_path(&self) -> &Path {
        &self.runtimes_path
    }

    async fn load_runtimes(&self) -> Result<Vec<Runtime>> {
        let mut entries = tokio::fs::read_dir(&self.runtimes_path).await?;
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if is_manifest(&path) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut runtimes = Vec::with_capacity(paths.len());
        for path in paths {
            let raw = tokio::fs::read_to_string(&path).await?;
            let manifest: ClusterTrainingRuntime = serde_yaml::from_str(&raw)?;
            match resolve_runtime(&self.registry, &manifest)? {
                Some(runtime) => runtimes.push(runtime),
                None => warn!(path = %path.display(), "Skipping runtime manifest without required fields"),
            }
        }

        debug!(path = %self.runtimes_path.display(), count = runtimes.len(), "Loaded local runtimes");
        Ok(runtimes)
    }
}

fn is_manifest(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"))
}

/// Translates a local job into the backend-neutral view.
#[must_use]
pub fn to_train_job(job: ContainerJob) -> TrainJob {
    let steps = job
        .units
        .into_iter()
        .map(|unit| Step {
            name: unit.rank.map_or_else(|| unit.name.clone(), |rank| format!("{}-{rank}", constants::NODE)),
            status: Some(unit.state.as_str().to_string()),
            pod_name: unit.name,
            device: DeviceKind::Cpu,
            device_count: DeviceCount::count(1),
        })
        .collect();

    TrainJob {
        name: job.name,
        creation_timestamp: job.creation_timestamp,
        runtime_ref: job.runtime_name,
        steps,
        status: job.status,
    }
}

#[async_trait]
impl TrainerBackend for LocalTrainerClient {
    async fn list_runtimes(&self) -> Result<Vec<Runtime>> {
        self.load_runtimes().await
    }

    async fn get_runtime(&self, name: &str) -> Result<Runtime> {
        self.load_runtimes()
            .await?
            .into_iter()
            .find(|runtime| runtime.name == name)
            .ok_or_else(|| TrainerError::RuntimeNotFound(name.to_string()))
    }

    async fn train(
        &self,
        runtime: &str,
        initializer: Option<&Initializer>,
        trainer: Option<&CustomTrainer>,
    ) -> Result<String> {
        let runtime = self.get_runtime(runtime).await?;

        if initializer.is_some_and(|init| init.dataset.is_some() || init.model.is_some()) {
            return Err(TrainerError::InvalidJobSpec(
                "initializers are not supported by the local backend".to_string(),
            ));
        }

        let image = runtime
            .image
            .clone()
            .ok_or_else(|| TrainerError::InvalidRuntime(format!("runtime '{}' has no trainer image", runtime.name)))?;

        let (entrypoint, command) = match trainer.and_then(|t| t.func.as_ref().map(|func| (t, func))) {
            Some((custom, func)) => (
                constants::DEFAULT_COMMAND.iter().map(|arg| (*arg).to_string()).collect(),
                LauncherScript::new(func, &runtime.trainer.entrypoint)
                    .with_packages(&custom.packages_to_install, &custom.pip_index_url)
                    .args()?,
            ),
            None => (Vec::new(), Vec::new()),
        };

        let request = LocalJobRequest {
            image,
            entrypoint,
            command,
            num_nodes: trainer.and_then(|t| t.num_nodes).unwrap_or(runtime.num_nodes),
            framework: runtime.trainer.framework,
            runtime_name: runtime.name,
        };
        self.runner.create_job(&request).await
    }

    async fn list_jobs(&self, runtime: Option<&str>) -> Result<Vec<TrainJob>> {
        Ok(self.runner.list_jobs(runtime).await?.into_iter().map(to_train_job).collect())
    }

    async fn get_job(&self, name: &str) -> Result<TrainJob> {
        self.runner.get_job(name).await.map(to_train_job)
    }

    async fn get_job_logs(
        &self,
        name: &str,
        request: &LogRequest,
        sink: &dyn LogSink,
        cancel: &CancellationToken,
    ) -> Result<BTreeMap<String, String>> {
        self.runner.get_job_logs(name, request, sink, cancel).await
    }

    async fn delete_job(&self, name: &str) -> Result<()> {
        self.runner.delete_job(name).await
    }
}
