//! Trainer backend for train jobs on a cluster.
//!
//! Every call to the cluster API is bounded by the configured timeout and
//! reported as either [`TrainerError::Timeout`] or [`TrainerError::Operation`],
//! with the target object in the message. Nothing is retried.

use crate::backend::TrainerBackend;
use crate::config::ClientConfig;
use crate::constants;
use crate::error::{Result, TrainerError};
use crate::logs::{LogMultiplexer, LogRequest, LogSink, LogSource};
use crate::naming::generate_job_name;
use crate::registry::TrainerRegistry;
use crate::script::LauncherScript;
use crate::topology::{resolve_runtime, resolve_steps};
use crate::types::{CustomTrainer, Initializer, JobStatus, Runtime, Step, TrainJob};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use trainjob_abstraction::{
    ApiError, ApiResult, ClusterApi, Condition, InitializerSpec, ObjectMeta, Quantity,
    ResourceRequirements, RuntimeRef, StorageInitializer, TrainJobResource, TrainJobSpec,
    TrainerSpec,
};

/// Trainer client over a cluster API.
pub struct TrainerClient<A: ClusterApi> {
    api: A,
    namespace: String,
    timeout: Duration,
    registry: TrainerRegistry,
    multiplexer: LogMultiplexer,
}

impl<A: ClusterApi> std::fmt::Debug for TrainerClient<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrainerClient")
            .field("namespace", &self.namespace)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl<A: ClusterApi> TrainerClient<A> {
    pub fn new(api: A, config: &ClientConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            api,
            namespace: config.namespace.clone(),
            timeout: config.timeout(),
            registry: config.registry(),
            multiplexer: LogMultiplexer::new(config.logs.clone()),
        })
    }

    /// Replaces the trainer registry built from the configuration.
    #[must_use]
    pub fn with_registry(mut self, registry: TrainerRegistry) -> Self {
        self.registry = registry;
        self
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    #[must_use]
    pub fn api(&self) -> &A {
        &self.api
    }

    /// Runs one cluster call under the timeout. `what` completes the messages
    /// "Timeout to ..." and "Failed to ...".
    async fn remote<T, F>(&self, what: String, call: F) -> Result<T>
    where
        F: Future<Output = ApiResult<T>> + Send,
        T: Send,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(ApiError::Timeout(cause))) => {
                debug!(%cause, "Cluster call timed out");
                Err(TrainerError::Timeout(format!("Timeout to {what}")))
            }
            Err(_) => Err(TrainerError::Timeout(format!("Timeout to {what}"))),
            Ok(Err(e)) => {
                debug!(error = %e, "Cluster call failed");
                Err(TrainerError::Operation(format!("Failed to {what} ({e})")))
            }
        }
    }

    async fn to_train_job(&self, resource: &TrainJobResource) -> Result<TrainJob> {
        let metadata = resource.metadata.as_ref();
        let (Some(name), Some(spec), Some(creation_timestamp)) = (
            metadata.and_then(|meta| meta.name.as_deref()),
            resource.spec.as_ref(),
            metadata.and_then(|meta| meta.creation_timestamp),
        ) else {
            return Err(TrainerError::InvalidTrainJob(
                "train job without name, spec or creation timestamp".to_string(),
            ));
        };
        let namespace = metadata.and_then(|meta| meta.namespace.as_deref()).unwrap_or(&self.namespace);

        let pods = self
            .remote(
                format!("list {}'s steps: {namespace}/{name}", constants::TRAINJOB_KIND),
                self.api.list_pods(namespace, &pod_label_selector(name)),
            )
            .await?;
        let steps = resolve_steps(&pods)?;

        Ok(TrainJob {
            name: name.to_string(),
            creation_timestamp,
            runtime_ref: spec.runtime_ref.name.clone(),
            steps,
            status: job_status(
                resource.status.as_ref().and_then(|s| s.conditions.as_deref()).unwrap_or_default(),
            ),
        })
    }
}

/// Selects the pods of a train job's initializer and node groups.
#[must_use]
pub fn pod_label_selector(job_name: &str) -> String {
    format!(
        "{}={job_name},{} in ({}, {}, {}, {})",
        constants::JOBSET_NAME_KEY,
        constants::REPLICATED_JOB_KEY,
        constants::DATASET_INITIALIZER,
        constants::MODEL_INITIALIZER,
        constants::MPI_LAUNCHER,
        constants::NODE,
    )
}

/// Job status from its conditions; the last true condition wins.
#[must_use]
pub fn job_status(conditions: &[Condition]) -> JobStatus {
    conditions
        .iter()
        .filter(|condition| condition.status == "True")
        .fold(JobStatus::Unknown, |status, condition| match condition.type_.as_str() {
            "Created" => JobStatus::Created,
            "Complete" => JobStatus::Succeeded,
            "Failed" => JobStatus::Failed,
            _ => status,
        })
}

/// Resource requests and limits for each node. Keys are lowercased and `gpu`
/// maps to the GPU resource name.
#[must_use]
pub fn resources_per_node(resources: &BTreeMap<String, String>) -> ResourceRequirements {
    let quantities: BTreeMap<String, Quantity> = resources
        .iter()
        .map(|(key, value)| {
            let key = key.to_lowercase();
            let key = if key == "gpu" { constants::GPU_LABEL.to_string() } else { key };
            (key, Quantity::Str(value.clone()))
        })
        .collect();

    ResourceRequirements { limits: Some(quantities.clone()), requests: Some(quantities) }
}

fn trainer_spec(runtime: &Runtime, trainer: &CustomTrainer) -> Result<TrainerSpec> {
    let mut spec = TrainerSpec::default();

    if let Some(num_nodes) = trainer.num_nodes {
        if num_nodes == 0 {
            return Err(TrainerError::InvalidJobSpec("num_nodes must be at least 1".to_string()));
        }
        spec.num_nodes = Some(i64::from(num_nodes));
    }
    if !trainer.resources_per_node.is_empty() {
        spec.resources_per_node = Some(resources_per_node(&trainer.resources_per_node));
    }
    if let Some(func) = &trainer.func {
        spec.command = Some(constants::DEFAULT_COMMAND.iter().map(|arg| (*arg).to_string()).collect());
        spec.args = Some(
            LauncherScript::new(func, &runtime.trainer.entrypoint)
                .with_packages(&trainer.packages_to_install, &trainer.pip_index_url)
                .args()?,
        );
    }

    Ok(spec)
}

fn initializer_spec(initializer: &Initializer) -> InitializerSpec {
    InitializerSpec {
        dataset: initializer
            .dataset
            .as_ref()
            .map(|dataset| StorageInitializer { storage_uri: dataset.normalized_uri() }),
        model: initializer
            .model
            .as_ref()
            .map(|model| StorageInitializer { storage_uri: model.normalized_uri() }),
    }
}

/// The step whose logs a request targets; pending steps have no logs yet.
fn log_target<'a>(steps: &'a [Step], request: &LogRequest) -> Option<&'a Step> {
    steps
        .iter()
        .rev()
        .find(|step| step.status.as_deref() != Some(constants::POD_PENDING) && request.matches(&step.name))
}

#[async_trait]
impl<A: ClusterApi> TrainerBackend for TrainerClient<A> {
    async fn list_runtimes(&self) -> Result<Vec<Runtime>> {
        let objects = self
            .remote(
                format!(
                    "list {}s in namespace: {}",
                    constants::CLUSTER_TRAINING_RUNTIME_KIND,
                    self.namespace
                ),
                self.api.list_cluster_training_runtimes(),
            )
            .await?;

        let mut runtimes = Vec::with_capacity(objects.len());
        for object in &objects {
            match resolve_runtime(&self.registry, object)? {
                Some(runtime) => runtimes.push(runtime),
                None => {
                    let name = object.metadata.as_ref().and_then(|meta| meta.name.as_deref());
                    warn!(runtime = ?name, "Skipping runtime without required fields");
                }
            }
        }
        Ok(runtimes)
    }

    async fn get_runtime(&self, name: &str) -> Result<Runtime> {
        self.list_runtimes()
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
        let trainer = trainer.map(|trainer| trainer_spec(&runtime, trainer)).transpose()?;
        let name = generate_job_name();

        let resource = TrainJobResource {
            api_version: Some(constants::API_VERSION.to_string()),
            kind: Some(constants::TRAINJOB_KIND.to_string()),
            metadata: Some(ObjectMeta::named(&name)),
            spec: Some(TrainJobSpec {
                runtime_ref: RuntimeRef { name: runtime.name.clone(), ..RuntimeRef::default() },
                trainer: trainer.filter(|spec| !spec.is_empty()),
                initializer: initializer.map(initializer_spec),
            }),
            status: None,
        };

        self.remote(
            format!("create {}: {}/{name}", constants::TRAINJOB_KIND, self.namespace),
            self.api.create_train_job(&self.namespace, &resource),
        )
        .await?;

        info!(job = %name, namespace = %self.namespace, runtime = %runtime.name, "Created train job");
        Ok(name)
    }

    async fn list_jobs(&self, runtime: Option<&str>) -> Result<Vec<TrainJob>> {
        let resources = self
            .remote(
                format!("list {}s in namespace: {}", constants::TRAINJOB_KIND, self.namespace),
                self.api.list_train_jobs(&self.namespace),
            )
            .await?;

        let mut jobs = Vec::with_capacity(resources.len());
        for resource in &resources {
            let runtime_ref = resource.spec.as_ref().map(|spec| spec.runtime_ref.name.as_str());
            if runtime.is_some() && runtime_ref.is_some() && runtime != runtime_ref {
                continue;
            }
            jobs.push(self.to_train_job(resource).await?);
        }
        Ok(jobs)
    }

    async fn get_job(&self, name: &str) -> Result<TrainJob> {
        let resource = self
            .remote(
                format!("get {}: {}/{name}", constants::TRAINJOB_KIND, self.namespace),
                self.api.get_train_job(&self.namespace, name),
            )
            .await?;
        self.to_train_job(&resource).await
    }

    async fn get_job_logs(
        &self,
        name: &str,
        request: &LogRequest,
        sink: &dyn LogSink,
        cancel: &CancellationToken,
    ) -> Result<BTreeMap<String, String>> {
        let job = self.get_job(name).await?;
        let Some(target) = log_target(&job.steps, request) else {
            debug!(job = %name, step = %request.step, "No running step matches the log request");
            return Ok(BTreeMap::new());
        };
        let pod = target.pod_name.as_str();
        let what = format!("read logs for the pod {}/{pod}", self.namespace);

        if request.follows_trainer() {
            let stream = self
                .remote(what, self.api.stream_pod_log(&self.namespace, pod, constants::TRAINER))
                .await?;
            return self
                .multiplexer
                .run(vec![LogSource::new(request.ranked_step(), stream)], sink, cancel)
                .await;
        }

        let (container, key) = match request.step.as_str() {
            constants::DATASET_INITIALIZER | constants::MODEL_INITIALIZER => {
                (request.step.as_str(), request.step.clone())
            }
            _ => (constants::TRAINER, request.ranked_step()),
        };
        let logs = self.remote(what, self.api.read_pod_log(&self.namespace, pod, container)).await?;
        Ok(BTreeMap::from([(key, logs)]))
    }

    async fn delete_job(&self, name: &str) -> Result<()> {
        self.remote(
            format!("delete {}: {}/{name}", constants::TRAINJOB_KIND, self.namespace),
            self.api.delete_train_job(&self.namespace, name),
        )
        .await?;

        info!(job = %name, namespace = %self.namespace, "Deleted train job");
        Ok(())
    }
}
