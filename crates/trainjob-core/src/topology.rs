//! Recovers the logical topology of a runtime or train job from flat object lists.
//!
//! Runtimes yield a [`Trainer`] profile; a job's pods yield its [`Step`]s.
//! Both are recomputed on every call from the current cluster state.

use crate::constants;
use crate::device::resolve_container_devices;
use crate::error::{Result, TrainerError};
use crate::registry::TrainerRegistry;
use crate::types::{DeviceCount, Runtime, Step, Trainer};
use std::collections::HashSet;
use tracing::{debug, warn};
use trainjob_abstraction::{
    ClusterTrainingRuntime, Container, IntOrString, MlPolicy, ObjectMeta, Pod, ReplicatedJob,
};

/// Resolves a runtime object into a [`Runtime`].
///
/// Returns `Ok(None)` when the object lacks the structural fields a runtime
/// needs (name, ml policy, replicated jobs); callers skip those. A runtime that
/// has them but is internally inconsistent is an error.
pub fn resolve_runtime(
    registry: &TrainerRegistry,
    runtime: &ClusterTrainingRuntime,
) -> Result<Option<Runtime>> {
    let Some(metadata) = runtime.metadata.as_ref().filter(|meta| meta.name.is_some()) else {
        return Ok(None);
    };
    let Some(spec) = runtime.spec.as_ref() else {
        return Ok(None);
    };
    let Some(ml_policy) = spec.ml_policy.as_ref() else {
        return Ok(None);
    };
    let Some(replicated_jobs) = spec
        .template
        .spec
        .as_ref()
        .and_then(|jobset| jobset.replicated_jobs.as_deref())
        .filter(|jobs| !jobs.is_empty())
    else {
        return Ok(None);
    };

    let name = metadata.name.clone().unwrap_or_default();
    let trainer = resolve_trainer(registry, replicated_jobs, ml_policy, metadata)?;
    let image = find_trainer_container(replicated_jobs)?.and_then(|c| c.image.clone());

    debug!(
        runtime = %name,
        framework = %trainer.framework,
        accelerator = %trainer.accelerator,
        accelerator_count = %trainer.accelerator_count,
        "Resolved runtime trainer"
    );

    Ok(Some(Runtime {
        name,
        trainer,
        num_nodes: declared_num_nodes(ml_policy).unwrap_or(1),
        image,
    }))
}

/// Resolves the trainer profile of a runtime.
///
/// The per-node accelerator count comes from the trainer container limits,
/// overridden by the Torch policy's integer `numProcPerNode` or, failing that,
/// the MPI policy's `numProcPerNode`. The Torch policy wins when both are set.
/// The result is multiplied by the declared node count.
pub fn resolve_trainer(
    registry: &TrainerRegistry,
    replicated_jobs: &[ReplicatedJob],
    ml_policy: &MlPolicy,
    metadata: &ObjectMeta,
) -> Result<Trainer> {
    let runtime_name = metadata.name.as_deref().unwrap_or("<unnamed>");
    let container = find_trainer_container(replicated_jobs)?
        .ok_or_else(|| TrainerError::MissingTrainerContainer(runtime_name.to_string()))?;
    let image = container
        .image
        .as_deref()
        .ok_or_else(|| TrainerError::MissingTrainerContainer(runtime_name.to_string()))?;

    let mut trainer = registry.lookup(image);

    let (_, mut count) = resolve_container_devices(container.resources.as_ref())?;

    let torch_override = ml_policy
        .torch
        .as_ref()
        .and_then(|torch| torch.num_proc_per_node.as_ref())
        .and_then(|num_proc| match num_proc {
            IntOrString::Int(value) => Some(*value),
            IntOrString::String(_) => None,
        });
    let mpi_override = ml_policy.mpi.as_ref().and_then(|mpi| mpi.num_proc_per_node);

    if torch_override.is_some() && mpi_override.is_some() {
        debug!(runtime = %runtime_name, "Both torch and mpi policies set, torch takes precedence");
    }

    if let Some(per_node) = torch_override.or(mpi_override) {
        count = per_node_count(per_node);
    }

    if let Some(num_nodes) = declared_num_nodes(ml_policy) {
        count = count.scaled(f64::from(num_nodes));
    }
    trainer.accelerator_count = count;

    if let Some(accelerator) = metadata.label(constants::ACCELERATOR_LABEL) {
        trainer.accelerator = accelerator.to_string();
    }

    Ok(trainer)
}

/// Finds the trainer (or launcher) container in the job template carrying the
/// ancestor label.
///
/// A replicated job without a pod template is malformed and fails the lookup.
pub fn find_trainer_container(replicated_jobs: &[ReplicatedJob]) -> Result<Option<&Container>> {
    for job in replicated_jobs {
        let pod_spec = job.pod_spec().ok_or_else(|| {
            TrainerError::InvalidRuntime(format!("invalid replicated job template: {}", job.name))
        })?;

        if job.template_label(constants::TRAINJOB_ANCESTOR_LABEL).is_none() {
            continue;
        }

        if let Some(container) = pod_spec
            .containers
            .iter()
            .find(|c| c.name == constants::TRAINER || c.name == constants::MPI_LAUNCHER)
        {
            return Ok(Some(container));
        }
    }

    Ok(None)
}

#[allow(clippy::cast_precision_loss)]
fn per_node_count(per_node: i64) -> DeviceCount {
    DeviceCount::Count(per_node as f64)
}

fn declared_num_nodes(ml_policy: &MlPolicy) -> Option<u32> {
    ml_policy.num_nodes.and_then(|n| u32::try_from(n).ok())
}

/// Resolves the steps of a train job from its pods.
///
/// Steps come back ordered: dataset initializer, model initializer, then
/// trainer nodes by logical index. Step names are unique.
pub fn resolve_steps(pods: &[Pod]) -> Result<Vec<Step>> {
    let mut ordered = pods.iter().map(resolve_step).collect::<Result<Vec<_>>>()?;
    ordered.sort_by(|(a, _), (b, _)| a.cmp(b));

    let mut seen = HashSet::new();
    for (_, step) in &ordered {
        if !seen.insert(step.name.as_str()) {
            return Err(TrainerError::InvalidPod(format!(
                "duplicate step '{}' (pod {})",
                step.name, step.pod_name
            )));
        }
    }

    Ok(ordered.into_iter().map(|(_, step)| step).collect())
}

/// Sort key: step class, then logical index.
type StepKey = (u8, u64);

fn resolve_step(pod: &Pod) -> Result<(StepKey, Step)> {
    let (Some(metadata), Some(spec)) = (pod.metadata.as_ref(), pod.spec.as_ref()) else {
        return Err(TrainerError::InvalidPod("pod without metadata or spec".to_string()));
    };
    let Some(pod_name) = metadata.name.as_deref() else {
        return Err(TrainerError::InvalidPod("pod without name".to_string()));
    };
    let group = metadata.label(constants::REPLICATED_JOB_KEY).ok_or_else(|| {
        TrainerError::InvalidPod(format!("pod {pod_name} has no {} label", constants::REPLICATED_JOB_KEY))
    })?;
    let status = pod.status.as_ref().and_then(|s| s.phase.clone());

    match group {
        constants::DATASET_INITIALIZER | constants::MODEL_INITIALIZER => {
            let container = find_container(&spec.containers, &[
                constants::DATASET_INITIALIZER,
                constants::MODEL_INITIALIZER,
            ])
            .ok_or_else(|| missing_container(pod_name))?;
            let (device, device_count) = resolve_container_devices(container.resources.as_ref())?;
            let class = if container.name == constants::DATASET_INITIALIZER { 0 } else { 1 };

            Ok((
                (class, 0),
                Step {
                    name: container.name.clone(),
                    status,
                    pod_name: pod_name.to_string(),
                    device,
                    device_count,
                },
            ))
        }
        constants::MPI_LAUNCHER | constants::NODE => {
            let index = metadata
                .label(constants::JOB_INDEX_KEY)
                .and_then(|raw| raw.parse::<u64>().ok())
                .ok_or_else(|| {
                    TrainerError::InvalidPod(format!(
                        "pod {pod_name} has no numeric {} label",
                        constants::JOB_INDEX_KEY
                    ))
                })?;
            let container = find_container(&spec.containers, &[
                constants::MPI_LAUNCHER,
                constants::TRAINER,
            ])
            .ok_or_else(|| missing_container(pod_name))?;
            let (device, mut device_count) =
                resolve_container_devices(container.resources.as_ref())?;
            let mut index = index;

            for env in container.env.iter().flatten() {
                if env.name != constants::TORCH_ENV_NUM_PROC_PER_NODE
                    && env.name != constants::MPI_ENV_NUM_SLOTS_PER_NODE
                {
                    continue;
                }
                let Some(per_node) = env.value.as_deref().and_then(parse_decimal) else {
                    warn!(pod = %pod_name, env = %env.name, "Ignoring non-numeric override");
                    continue;
                };
                device_count = DeviceCount::count(per_node);

                // The launcher holds rank 0, so node ranks start at 1.
                if env.name == constants::MPI_ENV_NUM_SLOTS_PER_NODE && group != constants::MPI_LAUNCHER {
                    index += 1;
                }
            }

            Ok((
                (2, index),
                Step {
                    name: format!("{}-{index}", constants::NODE),
                    status,
                    pod_name: pod_name.to_string(),
                    device,
                    device_count,
                },
            ))
        }
        other => Err(TrainerError::InvalidPod(format!(
            "pod {pod_name} belongs to unrecognized replicated job '{other}'"
        ))),
    }
}

fn find_container<'a>(containers: &'a [Container], names: &[&str]) -> Option<&'a Container> {
    containers.iter().find(|c| names.contains(&c.name.as_str()))
}

fn missing_container(pod_name: &str) -> TrainerError {
    TrainerError::InvalidPod(format!("pod {pod_name} has no recognized container"))
}

fn parse_decimal(raw: &str) -> Option<u32> {
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    raw.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DeviceKind, Framework};
    use std::collections::BTreeMap;
    use trainjob_abstraction::{
        EnvVar, JobSetSpec, JobSetTemplateSpec, JobSpec, JobTemplateSpec, MpiMlPolicySource,
        PodSpec, PodStatus, PodTemplateSpec, Quantity, ResourceRequirements, TorchMlPolicySource,
        TrainingRuntimeSpec,
    };

    fn labels(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect()
    }

    fn container(name: &str, image: &str) -> Container {
        Container { name: name.to_string(), image: Some(image.to_string()), ..Container::default() }
    }

    fn with_limits(mut c: Container, entries: &[(&str, Quantity)]) -> Container {
        let limits = entries.iter().map(|(k, v)| ((*k).to_string(), v.clone())).collect();
        c.resources = Some(ResourceRequirements { limits: Some(limits), requests: None });
        c
    }

    fn with_env(mut c: Container, name: &str, value: &str) -> Container {
        c.env.get_or_insert_with(Vec::new).push(EnvVar {
            name: name.to_string(),
            value: Some(value.to_string()),
        });
        c
    }

    fn replicated_job(name: &str, ancestor: Option<&str>, containers: Vec<Container>) -> ReplicatedJob {
        ReplicatedJob {
            name: name.to_string(),
            replicas: Some(1),
            template: JobTemplateSpec {
                metadata: ancestor.map(|step| ObjectMeta {
                    labels: Some(labels(&[(constants::TRAINJOB_ANCESTOR_LABEL, step)])),
                    ..ObjectMeta::default()
                }),
                spec: Some(JobSpec {
                    template: PodTemplateSpec { metadata: None, spec: Some(PodSpec { containers }) },
                }),
            },
        }
    }

    fn runtime(name: &str, ml_policy: MlPolicy, jobs: Vec<ReplicatedJob>) -> ClusterTrainingRuntime {
        ClusterTrainingRuntime {
            api_version: Some(constants::API_VERSION.to_string()),
            kind: Some(constants::CLUSTER_TRAINING_RUNTIME_KIND.to_string()),
            metadata: Some(ObjectMeta::named(name)),
            spec: Some(TrainingRuntimeSpec {
                ml_policy: Some(ml_policy),
                template: JobSetTemplateSpec {
                    metadata: None,
                    spec: Some(JobSetSpec { replicated_jobs: Some(jobs) }),
                },
            }),
        }
    }

    fn pod(name: &str, group: &str, index: Option<&str>, containers: Vec<Container>) -> Pod {
        let mut pod_labels = labels(&[(constants::REPLICATED_JOB_KEY, group)]);
        if let Some(index) = index {
            pod_labels.insert(constants::JOB_INDEX_KEY.to_string(), index.to_string());
        }
        Pod {
            metadata: Some(ObjectMeta { labels: Some(pod_labels), ..ObjectMeta::named(name) }),
            spec: Some(PodSpec { containers }),
            status: Some(PodStatus { phase: Some("Running".to_string()) }),
        }
    }

    #[test]
    fn test_torch_policy_multiplied_by_nodes() {
        let policy = MlPolicy {
            num_nodes: Some(2),
            torch: Some(TorchMlPolicySource { num_proc_per_node: Some(IntOrString::Int(4)) }),
            mpi: None,
        };
        let jobs = vec![replicated_job(
            constants::NODE,
            Some(constants::TRAINER),
            vec![container(constants::TRAINER, "pytorch/pytorch:2.5.0")],
        )];
        let runtime = resolve_runtime(&TrainerRegistry::builtin(), &runtime("torch", policy, jobs))
            .unwrap()
            .unwrap();

        assert_eq!(runtime.trainer.accelerator_count, DeviceCount::count(8));
        assert_eq!(runtime.trainer.framework, Framework::Torch);
        assert_eq!(runtime.num_nodes, 2);
        assert_eq!(runtime.image.as_deref(), Some("pytorch/pytorch:2.5.0"));
    }

    #[test]
    fn test_resource_limits_used_without_policy_override() {
        let policy = MlPolicy {
            num_nodes: Some(3),
            torch: Some(TorchMlPolicySource {
                num_proc_per_node: Some(IntOrString::String("auto".to_string())),
            }),
            mpi: None,
        };
        let trainer = with_limits(container(constants::TRAINER, "pytorch/pytorch"), &[(
            constants::GPU_LABEL,
            Quantity::Int(2),
        )]);
        let jobs = vec![replicated_job(constants::NODE, Some(constants::TRAINER), vec![trainer])];
        let resolved = resolve_trainer(&TrainerRegistry::builtin(), &jobs, &policy, &ObjectMeta::named("rt"))
            .unwrap();
        assert_eq!(resolved.accelerator_count, DeviceCount::count(6));
    }

    #[test]
    fn test_mpi_policy_overrides_limits() {
        let policy = MlPolicy {
            num_nodes: Some(2),
            torch: None,
            mpi: Some(MpiMlPolicySource { num_proc_per_node: Some(3), mpi_implementation: None }),
        };
        let launcher = with_limits(
            container(constants::MPI_LAUNCHER, "ghcr.io/kubeflow/trainer/deepspeed-runtime:latest"),
            &[(constants::CPU_LABEL, Quantity::from("1"))],
        );
        let jobs = vec![replicated_job(constants::MPI_LAUNCHER, Some(constants::TRAINER), vec![launcher])];
        let resolved = resolve_trainer(&TrainerRegistry::builtin(), &jobs, &policy, &ObjectMeta::named("mpi"))
            .unwrap();
        assert_eq!(resolved.framework, Framework::Deepspeed);
        assert_eq!(resolved.accelerator_count, DeviceCount::count(6));
    }

    #[test]
    fn test_torch_policy_wins_over_mpi() {
        let policy = MlPolicy {
            num_nodes: Some(1),
            torch: Some(TorchMlPolicySource { num_proc_per_node: Some(IntOrString::Int(4)) }),
            mpi: Some(MpiMlPolicySource { num_proc_per_node: Some(2), mpi_implementation: None }),
        };
        let jobs = vec![replicated_job(
            constants::NODE,
            Some(constants::TRAINER),
            vec![container(constants::TRAINER, "pytorch/pytorch")],
        )];
        let resolved = resolve_trainer(&TrainerRegistry::builtin(), &jobs, &policy, &ObjectMeta::named("rt"))
            .unwrap();
        assert_eq!(resolved.accelerator_count, DeviceCount::count(4));
    }

    #[test]
    fn test_accelerator_type_from_runtime_label() {
        let jobs = vec![replicated_job(
            constants::NODE,
            Some(constants::TRAINER),
            vec![container(constants::TRAINER, "pytorch/pytorch")],
        )];
        let metadata = ObjectMeta {
            labels: Some(labels(&[(constants::ACCELERATOR_LABEL, "GPU-Tesla-V100-16GB")])),
            ..ObjectMeta::named("rt")
        };
        let resolved =
            resolve_trainer(&TrainerRegistry::builtin(), &jobs, &MlPolicy::default(), &metadata).unwrap();
        assert_eq!(resolved.accelerator, "GPU-Tesla-V100-16GB");
        assert_eq!(resolved.accelerator_count, DeviceCount::Unknown);

        let resolved =
            resolve_trainer(&TrainerRegistry::builtin(), &jobs, &MlPolicy::default(), &ObjectMeta::named("rt"))
                .unwrap();
        assert_eq!(resolved.accelerator, "Unknown");
    }

    #[test]
    fn test_missing_trainer_container_is_an_error() {
        let jobs = vec![
            replicated_job(constants::NODE, None, vec![container(constants::TRAINER, "pytorch/pytorch")]),
            replicated_job("sidecar", Some(constants::TRAINER), vec![container("helper", "busybox")]),
        ];
        let err = resolve_trainer(&TrainerRegistry::builtin(), &jobs, &MlPolicy::default(), &ObjectMeta::named("rt"))
            .unwrap_err();
        assert!(matches!(err, TrainerError::MissingTrainerContainer(name) if name == "rt"));
    }

    #[test]
    fn test_replicated_job_without_template_is_malformed() {
        let mut job = replicated_job(constants::NODE, Some(constants::TRAINER), vec![]);
        job.template.spec = None;
        let err = find_trainer_container(&[job]).unwrap_err();
        assert!(matches!(err, TrainerError::InvalidRuntime(_)));
    }

    #[test]
    fn test_runtime_without_structure_is_skipped() {
        let mut incomplete = runtime("rt", MlPolicy::default(), vec![]);
        assert!(resolve_runtime(&TrainerRegistry::builtin(), &incomplete).unwrap().is_none());

        incomplete.metadata = None;
        assert!(resolve_runtime(&TrainerRegistry::builtin(), &incomplete).unwrap().is_none());

        assert!(
            resolve_runtime(&TrainerRegistry::builtin(), &ClusterTrainingRuntime::default())
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_initializer_and_torch_node_steps() {
        let pods = vec![
            pod("job-node-0-1", constants::NODE, Some("1"), vec![with_env(
                container(constants::TRAINER, "pytorch/pytorch"),
                constants::TORCH_ENV_NUM_PROC_PER_NODE,
                "2",
            )]),
            pod("job-model", constants::MODEL_INITIALIZER, None, vec![container(
                constants::MODEL_INITIALIZER,
                "model-init",
            )]),
            pod("job-node-0-0", constants::NODE, Some("0"), vec![with_limits(
                container(constants::TRAINER, "pytorch/pytorch"),
                &[(constants::GPU_LABEL, Quantity::Int(4))],
            )]),
            pod("job-dataset", constants::DATASET_INITIALIZER, None, vec![container(
                constants::DATASET_INITIALIZER,
                "dataset-init",
            )]),
        ];

        let steps = resolve_steps(&pods).unwrap();
        let names: Vec<&str> = steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, [
            "dataset-initializer",
            "model-initializer",
            "trainer-node-0",
            "trainer-node-1"
        ]);

        assert_eq!(steps[2].device, DeviceKind::Gpu);
        assert_eq!(steps[2].device_count, DeviceCount::count(4));
        assert_eq!(steps[3].device_count, DeviceCount::count(2));
        assert_eq!(steps[3].pod_name, "job-node-0-1");
        assert_eq!(steps[0].status.as_deref(), Some("Running"));
    }

    #[test]
    fn test_mpi_nodes_shift_behind_launcher() {
        let pods = vec![
            pod("job-node-0-0", constants::NODE, Some("0"), vec![with_env(
                container(constants::TRAINER, "mpi"),
                constants::MPI_ENV_NUM_SLOTS_PER_NODE,
                "4",
            )]),
            pod("job-launcher-0-0", constants::MPI_LAUNCHER, Some("0"), vec![container(
                constants::MPI_LAUNCHER,
                "mpi",
            )]),
            pod("job-node-0-1", constants::NODE, Some("1"), vec![with_env(
                container(constants::TRAINER, "mpi"),
                constants::MPI_ENV_NUM_SLOTS_PER_NODE,
                "4",
            )]),
        ];

        let steps = resolve_steps(&pods).unwrap();
        let by_name: Vec<(&str, &str)> =
            steps.iter().map(|s| (s.name.as_str(), s.pod_name.as_str())).collect();
        assert_eq!(by_name, [
            ("trainer-node-0", "job-launcher-0-0"),
            ("trainer-node-1", "job-node-0-0"),
            ("trainer-node-2", "job-node-0-1"),
        ]);
        assert_eq!(steps[1].device_count, DeviceCount::count(4));
        assert_eq!(steps[0].device_count, DeviceCount::Unknown);
    }

    #[test]
    fn test_launcher_with_slots_keeps_rank_zero() {
        let pods = vec![pod("job-launcher-0-0", constants::MPI_LAUNCHER, Some("0"), vec![with_env(
            container(constants::MPI_LAUNCHER, "mpi"),
            constants::MPI_ENV_NUM_SLOTS_PER_NODE,
            "2",
        )])];
        let steps = resolve_steps(&pods).unwrap();
        assert_eq!(steps[0].name, "trainer-node-0");
        assert_eq!(steps[0].device_count, DeviceCount::count(2));
    }

    #[test]
    fn test_non_numeric_override_is_ignored() {
        let trainer = with_env(
            with_limits(container(constants::TRAINER, "pytorch/pytorch"), &[(
                constants::GPU_LABEL,
                Quantity::Int(1),
            )]),
            constants::TORCH_ENV_NUM_PROC_PER_NODE,
            "auto",
        );
        let steps = resolve_steps(&[pod("p", constants::NODE, Some("0"), vec![trainer])]).unwrap();
        assert_eq!(steps[0].device_count, DeviceCount::count(1));
    }

    #[test]
    fn test_pod_without_phase_has_no_status() {
        let mut p = pod("p", constants::NODE, Some("0"), vec![container(constants::TRAINER, "img")]);
        p.status = None;
        let steps = resolve_steps(&[p]).unwrap();
        assert_eq!(steps[0].status, None);
    }

    #[test]
    fn test_unrecognized_container_is_an_error() {
        let pods = vec![pod("p", constants::NODE, Some("0"), vec![container("node", "img")])];
        assert!(matches!(resolve_steps(&pods), Err(TrainerError::InvalidPod(_))));
    }

    #[test]
    fn test_missing_job_index_is_an_error() {
        let pods = vec![pod("p", constants::NODE, None, vec![container(constants::TRAINER, "img")])];
        assert!(matches!(resolve_steps(&pods), Err(TrainerError::InvalidPod(_))));
    }

    #[test]
    fn test_duplicate_step_names_are_rejected() {
        let pods = vec![
            pod("a", constants::NODE, Some("0"), vec![container(constants::TRAINER, "img")]),
            pod("b", constants::NODE, Some("0"), vec![container(constants::TRAINER, "img")]),
        ];
        assert!(matches!(resolve_steps(&pods), Err(TrainerError::InvalidPod(_))));
    }

    #[test]
    fn test_step_resolution_is_idempotent() {
        let pods = vec![
            pod("n1", constants::NODE, Some("1"), vec![container(constants::TRAINER, "img")]),
            pod("n0", constants::NODE, Some("0"), vec![container(constants::TRAINER, "img")]),
        ];
        let first = resolve_steps(&pods).unwrap();
        let second = resolve_steps(&pods).unwrap();
        assert_eq!(first, second);

        let mut reversed = pods.clone();
        reversed.reverse();
        assert_eq!(resolve_steps(&reversed).unwrap(), first);
    }
}
