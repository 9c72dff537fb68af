//! Label keys, object names and defaults shared with the cluster controller.
//!
//! The string values are part of the wire contract and must not change.

use std::time::Duration;

/// How long to wait for a request to the cluster API.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

pub const API_VERSION: &str = "trainer.kubeflow.org/v1alpha1";

pub const DEFAULT_NAMESPACE: &str = "default";

/// Namespace file mounted into pods running inside the cluster.
pub const SERVICE_ACCOUNT_NAMESPACE_PATH: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

pub const CLUSTER_TRAINING_RUNTIME_KIND: &str = "ClusterTrainingRuntime";
pub const TRAINJOB_KIND: &str = "TrainJob";

/// Identifies which template in a runtime the train job's trainer overrides.
pub const TRAINJOB_ANCESTOR_LABEL: &str = "trainer.kubeflow.org/trainjob-ancestor-step";

/// Runtime label carrying the accelerator type (e.g. `GPU-Tesla-V100-16GB`).
pub const ACCELERATOR_LABEL: &str = "trainer.kubeflow.org/accelerator";

/// Value used when a device or status cannot be identified.
pub const UNKNOWN: &str = "Unknown";

pub const CPU_LABEL: &str = "cpu";
pub const GPU_LABEL: &str = "nvidia.com/gpu";
pub const TPU_LABEL: &str = "google.com/tpu";

/// Pod label holding the owning job set name.
pub const JOBSET_NAME_KEY: &str = "jobset.sigs.k8s.io/jobset-name";

/// Pod label holding the replicated job name.
pub const REPLICATED_JOB_KEY: &str = "jobset.sigs.k8s.io/replicatedjob-name";

/// Pod label holding the job completion index.
pub const JOB_INDEX_KEY: &str = "batch.kubernetes.io/job-completion-index";

pub const DATASET_INITIALIZER: &str = "dataset-initializer";
pub const MODEL_INITIALIZER: &str = "model-initializer";

/// Replicated job name of the training nodes and prefix of node step names.
pub const NODE: &str = "trainer-node";

/// Container name of the trainer.
pub const TRAINER: &str = "trainer";

/// Replicated job and container name of the MPI launcher.
pub const MPI_LAUNCHER: &str = "launcher";

pub const POD_PENDING: &str = "Pending";

pub const DEFAULT_PIP_INDEX_URL: &str = "https://pypi.org/simple";

/// Container command used with a generated launcher script.
pub const DEFAULT_COMMAND: [&str; 2] = ["bash", "-c"];

/// Torch variable for the number of processes per node.
pub const TORCH_ENV_NUM_PROC_PER_NODE: &str = "PET_NPROC_PER_NODE";
pub const TORCH_ENV_NUM_NODES: &str = "PET_NNODES";
pub const TORCH_ENV_NODE_RANK: &str = "PET_NODE_RANK";
pub const TORCH_ENV_MASTER_ADDR: &str = "PET_MASTER_ADDR";
pub const TORCH_ENV_MASTER_PORT: &str = "PET_MASTER_PORT";

/// OpenMPI variable for the number of slots per node.
pub const MPI_ENV_NUM_SLOTS_PER_NODE: &str = "OMPI_MCA_orte_set_default_slots";

/// Rendezvous port of rank 0 in local jobs.
pub const TORCH_HEAD_NODE_PORT: u16 = 29500;

/// Prefix of locally created job names.
pub const LOCAL_TRAIN_JOB_NAME_PREFIX: &str = "local-";

/// Label on local networks and units holding the job name.
pub const CONTAINER_TRAIN_JOB_NAME_LABEL: &str = "trainer.kubeflow.org/train-job-name";

/// Label on local units holding the node rank.
pub const LOCAL_NODE_RANK_LABEL: &str = "trainer.kubeflow.org/node-rank";

/// Label on local networks and units holding the runtime name.
pub const CONTAINER_RUNTIME_LABEL: &str = "trainer.kubeflow.org/runtime";

/// Default directory of runtime manifests for the local client.
pub const LOCAL_RUNTIMES_PATH: &str = "runtimes";
