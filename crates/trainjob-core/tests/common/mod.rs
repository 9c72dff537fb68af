//! Shared test utilities for trainjob core integration tests.
//!
//! In-memory stand-ins for the cluster API and the container engine, plus
//! builders for the cluster objects the resolvers read.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use trainjob_abstraction::{
    ApiError, ApiResult, ClusterApi, ClusterTrainingRuntime, Container, EnvVar, IntOrString, JobSetSpec,
    JobSetTemplateSpec, JobSpec, JobTemplateSpec, LogStream, MlPolicy, ObjectMeta, Pod, PodSpec, PodStatus,
    PodTemplateSpec, Quantity, ReplicatedJob, ResourceRequirements, TorchMlPolicySource, TrainJobResource,
    TrainingRuntimeSpec,
};
use trainjob_core::constants;
use trainjob_core::LogSink;
use trainjob_core::local::engine::{matches_all, EngineResult, Labels};
use trainjob_core::local::{ContainerEngine, EngineError, LabelFilter, NetworkInfo, NetworkSpec, UnitInfo, UnitSpec, UnitState};

/// Installs a test-writer tracing subscriber once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("trainjob_core=debug")),
        )
        .with_test_writer()
        .try_init();
}

fn labels(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
    entries.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect()
}

/// A runtime with one trainer-node job using the given image.
pub fn runtime_object(name: &str, image: &str, ml_policy: MlPolicy) -> ClusterTrainingRuntime {
    let trainer = Container {
        name: constants::TRAINER.to_string(),
        image: Some(image.to_string()),
        ..Container::default()
    };
    ClusterTrainingRuntime {
        api_version: Some(constants::API_VERSION.to_string()),
        kind: Some(constants::CLUSTER_TRAINING_RUNTIME_KIND.to_string()),
        metadata: Some(ObjectMeta {
            labels: Some(labels(&[(constants::ACCELERATOR_LABEL, "GPU-Tesla-V100-16GB")])),
            ..ObjectMeta::named(name)
        }),
        spec: Some(TrainingRuntimeSpec {
            ml_policy: Some(ml_policy),
            template: JobSetTemplateSpec {
                metadata: None,
                spec: Some(JobSetSpec {
                    replicated_jobs: Some(vec![ReplicatedJob {
                        name: constants::NODE.to_string(),
                        replicas: Some(1),
                        template: JobTemplateSpec {
                            metadata: Some(ObjectMeta {
                                labels: Some(labels(&[(constants::TRAINJOB_ANCESTOR_LABEL, constants::TRAINER)])),
                                ..ObjectMeta::default()
                            }),
                            spec: Some(JobSpec {
                                template: PodTemplateSpec {
                                    metadata: None,
                                    spec: Some(PodSpec { containers: vec![trainer] }),
                                },
                            }),
                        },
                    }]),
                }),
            },
        }),
    }
}

/// Torch policy with a fixed per-node process count.
pub fn torch_policy(num_nodes: i64, per_node: i64) -> MlPolicy {
    MlPolicy {
        num_nodes: Some(num_nodes),
        torch: Some(TorchMlPolicySource { num_proc_per_node: Some(IntOrString::Int(per_node)) }),
        mpi: None,
    }
}

/// A pod of a train job.
pub fn job_pod(
    job: &str,
    group: &str,
    index: Option<u32>,
    container: &str,
    env: &[(&str, &str)],
    phase: Option<&str>,
) -> Pod {
    let mut pod_labels = labels(&[(constants::JOBSET_NAME_KEY, job), (constants::REPLICATED_JOB_KEY, group)]);
    if let Some(index) = index {
        pod_labels.insert(constants::JOB_INDEX_KEY.to_string(), index.to_string());
    }
    let suffix = index.map_or_else(String::new, |i| format!("-0-{i}"));
    let env: Vec<EnvVar> =
        env.iter().map(|(name, value)| EnvVar { name: (*name).to_string(), value: Some((*value).to_string()) }).collect();

    Pod {
        metadata: Some(ObjectMeta { labels: Some(pod_labels), ..ObjectMeta::named(format!("{job}-{group}{suffix}")) }),
        spec: Some(PodSpec {
            containers: vec![Container {
                name: container.to_string(),
                image: Some("img".to_string()),
                env: (!env.is_empty()).then_some(env),
                resources: Some(ResourceRequirements {
                    limits: Some(BTreeMap::from([(constants::CPU_LABEL.to_string(), Quantity::from("2"))])),
                    requests: None,
                }),
                ..Container::default()
            }],
        }),
        status: phase.map(|phase| PodStatus { phase: Some(phase.to_string()) }),
    }
}

#[derive(Default)]
struct ClusterState {
    runtimes: Vec<ClusterTrainingRuntime>,
    jobs: BTreeMap<String, TrainJobResource>,
    pods: BTreeMap<String, Vec<Pod>>,
    logs: BTreeMap<String, Vec<String>>,
    log_reads: Vec<(String, String)>,
}

/// In-memory cluster API.
#[derive(Default)]
pub struct FakeClusterApi {
    state: Mutex<ClusterState>,
    failure: Mutex<Option<ApiError>>,
    hang: AtomicBool,
}

impl FakeClusterApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_runtime(self, runtime: ClusterTrainingRuntime) -> Self {
        self.state.lock().unwrap().runtimes.push(runtime);
        self
    }

    pub fn add_pods(&self, job: &str, pods: Vec<Pod>) {
        self.state.lock().unwrap().pods.entry(job.to_string()).or_default().extend(pods);
    }

    pub fn set_logs(&self, pod: &str, lines: &[&str]) {
        let lines = lines.iter().map(|line| (*line).to_string()).collect();
        self.state.lock().unwrap().logs.insert(pod.to_string(), lines);
    }

    pub fn set_job(&self, job: TrainJobResource) {
        let name = job.metadata.as_ref().and_then(|m| m.name.clone()).unwrap_or_default();
        self.state.lock().unwrap().jobs.insert(name, job);
    }

    pub fn job(&self, name: &str) -> Option<TrainJobResource> {
        self.state.lock().unwrap().jobs.get(name).cloned()
    }

    pub fn job_count(&self) -> usize {
        self.state.lock().unwrap().jobs.len()
    }

    /// (pod, container) pairs read so far.
    pub fn log_reads(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().log_reads.clone()
    }

    /// Makes every call fail with the error.
    pub fn fail_with(&self, error: ApiError) {
        *self.failure.lock().unwrap() = Some(error);
    }

    /// Makes every call wait forever.
    pub fn hang(&self) {
        self.hang.store(true, Ordering::SeqCst);
    }

    async fn check(&self) -> ApiResult<()> {
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        match self.failure.lock().unwrap().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

fn selected_job(label_selector: &str) -> Option<&str> {
    let prefix = format!("{}=", constants::JOBSET_NAME_KEY);
    label_selector.strip_prefix(&prefix)?.split(',').next()
}

#[async_trait]
impl ClusterApi for FakeClusterApi {
    async fn list_cluster_training_runtimes(&self) -> ApiResult<Vec<ClusterTrainingRuntime>> {
        self.check().await?;
        Ok(self.state.lock().unwrap().runtimes.clone())
    }

    async fn create_train_job(&self, namespace: &str, job: &TrainJobResource) -> ApiResult<()> {
        self.check().await?;
        let mut job = job.clone();
        let metadata = job.metadata.get_or_insert_with(ObjectMeta::default);
        metadata.namespace = Some(namespace.to_string());
        metadata.creation_timestamp = Some(Utc::now());
        let name = metadata.name.clone().unwrap_or_default();
        self.state.lock().unwrap().jobs.insert(name, job);
        Ok(())
    }

    async fn list_train_jobs(&self, _namespace: &str) -> ApiResult<Vec<TrainJobResource>> {
        self.check().await?;
        Ok(self.state.lock().unwrap().jobs.values().cloned().collect())
    }

    async fn get_train_job(&self, namespace: &str, name: &str) -> ApiResult<TrainJobResource> {
        self.check().await?;
        self.state
            .lock()
            .unwrap()
            .jobs
            .get(name)
            .cloned()
            .ok_or_else(|| ApiError::Request(format!("trainjobs {namespace}/{name} not found")))
    }

    async fn delete_train_job(&self, namespace: &str, name: &str) -> ApiResult<()> {
        self.check().await?;
        self.state
            .lock()
            .unwrap()
            .jobs
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| ApiError::Request(format!("trainjobs {namespace}/{name} not found")))
    }

    async fn list_pods(&self, _namespace: &str, label_selector: &str) -> ApiResult<Vec<Pod>> {
        self.check().await?;
        let state = self.state.lock().unwrap();
        Ok(selected_job(label_selector).and_then(|job| state.pods.get(job)).cloned().unwrap_or_default())
    }

    async fn read_pod_log(&self, _namespace: &str, pod: &str, container: &str) -> ApiResult<String> {
        self.check().await?;
        let mut state = self.state.lock().unwrap();
        state.log_reads.push((pod.to_string(), container.to_string()));
        state
            .logs
            .get(pod)
            .map(|lines| lines.join("\n"))
            .ok_or_else(|| ApiError::Request(format!("pod {pod} has no logs")))
    }

    async fn stream_pod_log(&self, _namespace: &str, pod: &str, container: &str) -> ApiResult<LogStream> {
        self.check().await?;
        let mut state = self.state.lock().unwrap();
        state.log_reads.push((pod.to_string(), container.to_string()));
        let lines: Vec<ApiResult<String>> =
            state.logs.get(pod).cloned().unwrap_or_default().into_iter().map(Ok).collect();
        Ok(futures::stream::iter(lines).boxed())
    }
}

#[derive(Default)]
struct EngineState {
    networks: BTreeMap<String, NetworkInfo>,
    units: BTreeMap<String, (UnitSpec, UnitState)>,
    logs: BTreeMap<String, Vec<String>>,
    calls: usize,
}

/// In-memory container engine.
#[derive(Default)]
pub struct MemoryEngine {
    state: Mutex<EngineState>,
    fail_run_at: Mutex<Option<usize>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the n-th `run_unit` call (0-based) fail.
    pub fn fail_run_at(&self, n: usize) {
        *self.fail_run_at.lock().unwrap() = Some(n);
    }

    /// Number of engine calls made so far.
    pub fn calls(&self) -> usize {
        self.state.lock().unwrap().calls
    }

    pub fn network_count(&self) -> usize {
        self.state.lock().unwrap().networks.len()
    }

    pub fn unit_count(&self) -> usize {
        self.state.lock().unwrap().units.len()
    }

    pub fn unit(&self, name: &str) -> Option<UnitSpec> {
        self.state.lock().unwrap().units.get(name).map(|(spec, _)| spec.clone())
    }

    pub fn set_state(&self, unit: &str, state: UnitState) {
        if let Some(entry) = self.state.lock().unwrap().units.get_mut(unit) {
            entry.1 = state;
        }
    }

    pub fn set_logs(&self, unit: &str, lines: &[&str]) {
        let lines = lines.iter().map(|line| (*line).to_string()).collect();
        self.state.lock().unwrap().logs.insert(unit.to_string(), lines);
    }

    /// Removes a unit behind the runner's back.
    pub fn drop_unit(&self, unit: &str) {
        self.state.lock().unwrap().units.remove(unit);
    }

    fn record_call(&self) {
        self.state.lock().unwrap().calls += 1;
    }
}

#[async_trait]
impl ContainerEngine for MemoryEngine {
    async fn create_network(&self, spec: &NetworkSpec) -> EngineResult<()> {
        self.record_call();
        let mut state = self.state.lock().unwrap();
        if state.networks.contains_key(&spec.name) {
            return Err(EngineError::CommandFailed {
                command: "network create".to_string(),
                stderr: format!("network with name {} already exists", spec.name),
            });
        }
        state.networks.insert(
            spec.name.clone(),
            NetworkInfo { name: spec.name.clone(), labels: spec.labels.clone(), created: Utc::now() },
        );
        Ok(())
    }

    async fn inspect_network(&self, name: &str) -> EngineResult<NetworkInfo> {
        self.record_call();
        self.state
            .lock()
            .unwrap()
            .networks
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::NetworkNotFound(name.to_string()))
    }

    async fn list_networks(&self, filters: &[LabelFilter]) -> EngineResult<Vec<NetworkInfo>> {
        self.record_call();
        Ok(self
            .state
            .lock()
            .unwrap()
            .networks
            .values()
            .filter(|network| matches_all(filters, &network.labels))
            .cloned()
            .collect())
    }

    async fn remove_network(&self, name: &str) -> EngineResult<()> {
        self.record_call();
        self.state
            .lock()
            .unwrap()
            .networks
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| EngineError::NetworkNotFound(name.to_string()))
    }

    async fn run_unit(&self, spec: &UnitSpec) -> EngineResult<()> {
        self.record_call();
        let mut state = self.state.lock().unwrap();
        let started = state.units.len();
        if *self.fail_run_at.lock().unwrap() == Some(started) {
            return Err(EngineError::CommandFailed { command: "run".to_string(), stderr: "image not found".to_string() });
        }
        if !state.networks.contains_key(&spec.network) {
            return Err(EngineError::NetworkNotFound(spec.network.clone()));
        }
        state.units.insert(spec.name.clone(), (spec.clone(), UnitState::Running));
        Ok(())
    }

    async fn list_units(&self, filters: &[LabelFilter]) -> EngineResult<Vec<UnitInfo>> {
        self.record_call();
        Ok(self
            .state
            .lock()
            .unwrap()
            .units
            .values()
            .filter(|(spec, _)| matches_all(filters, &spec.labels))
            .map(|(spec, state)| UnitInfo { name: spec.name.clone(), labels: spec.labels.clone(), state: state.clone() })
            .collect())
    }

    async fn remove_unit(&self, name: &str) -> EngineResult<()> {
        self.record_call();
        self.state
            .lock()
            .unwrap()
            .units
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| EngineError::UnitNotFound(name.to_string()))
    }

    async fn unit_logs(&self, name: &str) -> EngineResult<String> {
        self.record_call();
        let state = self.state.lock().unwrap();
        if !state.units.contains_key(name) {
            return Err(EngineError::UnitNotFound(name.to_string()));
        }
        Ok(state.logs.get(name).map(|lines| lines.join("\n")).unwrap_or_default())
    }

    async fn follow_unit_logs(&self, name: &str) -> EngineResult<LogStream> {
        self.record_call();
        let lines: Vec<ApiResult<String>> =
            self.state.lock().unwrap().logs.get(name).cloned().unwrap_or_default().into_iter().map(Ok).collect();
        Ok(futures::stream::iter(lines).boxed())
    }
}

/// Labels of a unit spec, for assertions.
pub fn unit_labels(spec: &UnitSpec) -> &Labels {
    &spec.labels
}

/// Sink remembering every line it was handed.
#[derive(Default)]
pub struct RecordingSink {
    lines: Mutex<Vec<(String, String)>>,
}

impl RecordingSink {
    pub fn lines(&self) -> Vec<(String, String)> {
        self.lines.lock().unwrap().clone()
    }
}

impl LogSink for RecordingSink {
    fn on_line(&self, step: &str, line: &str) {
        self.lines.lock().unwrap().push((step.to_string(), line.to_string()));
    }
}
