//! Local emulation of a runtime's node topology.
//!
//! A job is one network plus one unit per node, all labelled with the job
//! name. The labels are the job table: every query goes back to the engine, so
//! a unit or network removed behind the runner's back silently drops out of
//! its listings.

use super::engine::{ContainerEngine, EngineError, LabelFilter, NetworkSpec, UnitInfo, UnitSpec, UnitState};
use crate::constants;
use crate::error::{Result, TrainerError};
use crate::logs::{LogMultiplexer, LogRequest, LogSink, LogSource};
use crate::naming::generate_job_name;
use crate::types::{Framework, JobStatus};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What to run for a local job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalJobRequest {
    pub image: String,
    /// Overrides the image entrypoint when non-empty.
    pub entrypoint: Vec<String>,
    pub command: Vec<String>,
    pub num_nodes: u32,
    pub framework: Framework,
    pub runtime_name: String,
}

/// One node of a local job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerUnit {
    pub name: String,
    /// Rank from the unit label; `None` if the label is missing or malformed.
    pub rank: Option<u32>,
    pub state: UnitState,
}

/// A local job as seen through the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerJob {
    pub name: String,
    pub creation_timestamp: DateTime<Utc>,
    pub runtime_name: String,
    /// Units ordered by rank.
    pub units: Vec<ContainerUnit>,
    pub status: JobStatus,
}

/// Rolls unit states up into a job status.
///
/// No units is `Unknown`. Any unit that died or exited non-zero fails the
/// job. The job succeeds once every unit exited zero; until then it is
/// `Created`.
#[must_use]
pub fn aggregate_status<'a>(states: impl IntoIterator<Item = &'a UnitState>) -> JobStatus {
    let mut seen = false;
    let mut all_succeeded = true;

    for state in states {
        seen = true;
        match state {
            UnitState::Dead | UnitState::Exited(None) => return JobStatus::Failed,
            UnitState::Exited(Some(code)) if *code != 0 => return JobStatus::Failed,
            UnitState::Exited(Some(_)) => {}
            _ => all_succeeded = false,
        }
    }

    match (seen, all_succeeded) {
        (false, _) => JobStatus::Unknown,
        (true, true) => JobStatus::Succeeded,
        (true, false) => JobStatus::Created,
    }
}

/// Creates and inspects local jobs on a container engine.
#[derive(Clone)]
pub struct JobRunner {
    engine: Arc<dyn ContainerEngine>,
    multiplexer: LogMultiplexer,
}

impl std::fmt::Debug for JobRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRunner").field("multiplexer", &self.multiplexer).finish_non_exhaustive()
    }
}

impl JobRunner {
    #[must_use]
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self { engine, multiplexer: LogMultiplexer::default() }
    }

    #[must_use]
    pub fn with_multiplexer(mut self, multiplexer: LogMultiplexer) -> Self {
        self.multiplexer = multiplexer;
        self
    }

    /// Starts a job and returns its name.
    ///
    /// The request is validated before anything is created. If a unit fails
    /// to start, the units and network created so far are removed.
    pub async fn create_job(&self, request: &LocalJobRequest) -> Result<String> {
        if request.framework != Framework::Torch {
            return Err(TrainerError::UnsupportedFramework(request.framework));
        }
        if request.num_nodes == 0 {
            return Err(TrainerError::InvalidJobSpec("num_nodes must be at least 1".to_string()));
        }
        if request.image.is_empty() {
            return Err(TrainerError::InvalidJobSpec("image must not be empty".to_string()));
        }

        let job_name = format!("{}{}", constants::LOCAL_TRAIN_JOB_NAME_PREFIX, generate_job_name());
        let job_labels = BTreeMap::from([
            (constants::CONTAINER_TRAIN_JOB_NAME_LABEL.to_string(), job_name.clone()),
            (constants::CONTAINER_RUNTIME_LABEL.to_string(), request.runtime_name.clone()),
        ]);

        self.engine
            .create_network(&NetworkSpec { name: job_name.clone(), labels: job_labels.clone() })
            .await?;

        for rank in 0..request.num_nodes {
            let mut labels = job_labels.clone();
            labels.insert(constants::LOCAL_NODE_RANK_LABEL.to_string(), rank.to_string());

            let unit = UnitSpec {
                name: unit_name(&job_name, rank),
                image: request.image.clone(),
                network: job_name.clone(),
                entrypoint: request.entrypoint.clone(),
                command: request.command.clone(),
                env: rendezvous_env(&job_name, request.num_nodes, rank),
                labels,
            };

            if let Err(e) = self.engine.run_unit(&unit).await {
                warn!(job = %job_name, rank, error = %e, "Failed to start unit, cleaning up");
                self.remove_resources(&job_name).await;
                return Err(e.into());
            }
            debug!(job = %job_name, unit = %unit.name, "Started unit");
        }

        info!(
            job = %job_name,
            runtime = %request.runtime_name,
            num_nodes = request.num_nodes,
            "Created local train job"
        );
        Ok(job_name)
    }

    pub async fn get_job(&self, name: &str) -> Result<ContainerJob> {
        let network = match self.engine.inspect_network(name).await {
            Ok(network) => network,
            Err(EngineError::NetworkNotFound(_)) => return Err(TrainerError::JobNotFound(name.to_string())),
            Err(e) => return Err(e.into()),
        };
        if network.labels.get(constants::CONTAINER_TRAIN_JOB_NAME_LABEL).map(String::as_str) != Some(name) {
            return Err(TrainerError::JobNotFound(name.to_string()));
        }

        let mut units: Vec<ContainerUnit> = self
            .engine
            .list_units(&[job_filter(name)])
            .await?
            .into_iter()
            .map(to_container_unit)
            .collect();
        units.sort_by(|a, b| a.rank.cmp(&b.rank).then_with(|| a.name.cmp(&b.name)));

        Ok(ContainerJob {
            name: name.to_string(),
            creation_timestamp: network.created,
            runtime_name: network
                .labels
                .get(constants::CONTAINER_RUNTIME_LABEL)
                .cloned()
                .unwrap_or_else(|| constants::UNKNOWN.to_string()),
            status: aggregate_status(units.iter().map(|unit| &unit.state)),
            units,
        })
    }

    /// Lists jobs, optionally only those of one runtime.
    pub async fn list_jobs(&self, runtime_name: Option<&str>) -> Result<Vec<ContainerJob>> {
        let mut filters = vec![LabelFilter::exists(constants::CONTAINER_TRAIN_JOB_NAME_LABEL)];
        if let Some(runtime_name) = runtime_name {
            filters.push(LabelFilter::equals(constants::CONTAINER_RUNTIME_LABEL, runtime_name));
        }

        let mut jobs = Vec::new();
        for network in self.engine.list_networks(&filters).await? {
            match self.get_job(&network.name).await {
                Ok(job) => jobs.push(job),
                Err(TrainerError::JobNotFound(name)) => debug!(job = %name, "Job disappeared while listing"),
                Err(e) => return Err(e),
            }
        }
        jobs.sort_by(|a, b| a.creation_timestamp.cmp(&b.creation_timestamp).then_with(|| a.name.cmp(&b.name)));
        Ok(jobs)
    }

    /// Reads the logs of one node, following them if requested.
    ///
    /// The result is keyed by `<step>-<node_rank>`.
    pub async fn get_job_logs(
        &self,
        name: &str,
        request: &LogRequest,
        sink: &dyn LogSink,
        cancel: &CancellationToken,
    ) -> Result<BTreeMap<String, String>> {
        let units = self
            .engine
            .list_units(&[
                job_filter(name),
                LabelFilter::equals(constants::LOCAL_NODE_RANK_LABEL, request.node_rank.to_string()),
            ])
            .await?;
        let Some(unit) = units.first() else {
            return Err(TrainerError::JobNotFound(name.to_string()));
        };
        let key = request.ranked_step();

        if request.follow {
            let stream = self.engine.follow_unit_logs(&unit.name).await?;
            return self.multiplexer.run(vec![LogSource::new(key, stream)], sink, cancel).await;
        }

        let logs = self.engine.unit_logs(&unit.name).await?;
        Ok(BTreeMap::from([(key, logs)]))
    }

    /// Removes every unit of the job and then its network.
    pub async fn delete_job(&self, name: &str) -> Result<()> {
        match self.engine.inspect_network(name).await {
            Ok(_) => {}
            Err(EngineError::NetworkNotFound(_)) => return Err(TrainerError::JobNotFound(name.to_string())),
            Err(e) => return Err(e.into()),
        }

        for unit in self.engine.list_units(&[job_filter(name)]).await? {
            match self.engine.remove_unit(&unit.name).await {
                Ok(()) | Err(EngineError::UnitNotFound(_)) => info!(job = %name, unit = %unit.name, "Removed unit"),
                Err(e) => return Err(e.into()),
            }
        }

        self.engine.remove_network(name).await?;
        info!(job = %name, "Removed network");
        Ok(())
    }

    async fn remove_resources(&self, job_name: &str) {
        if let Ok(units) = self.engine.list_units(&[job_filter(job_name)]).await {
            for unit in units {
                if let Err(e) = self.engine.remove_unit(&unit.name).await {
                    warn!(job = %job_name, unit = %unit.name, error = %e, "Failed to remove unit");
                }
            }
        }
        if let Err(e) = self.engine.remove_network(job_name).await {
            warn!(job = %job_name, error = %e, "Failed to remove network");
        }
    }
}

fn unit_name(job_name: &str, rank: u32) -> String {
    format!("{job_name}-{rank}")
}

fn job_filter(name: &str) -> LabelFilter {
    LabelFilter::equals(constants::CONTAINER_TRAIN_JOB_NAME_LABEL, name)
}

fn to_container_unit(unit: UnitInfo) -> ContainerUnit {
    let rank = unit.labels.get(constants::LOCAL_NODE_RANK_LABEL).and_then(|rank| rank.parse().ok());
    ContainerUnit { name: unit.name, rank, state: unit.state }
}

/// Torch rendezvous variables for one node; rank 0 is the master.
fn rendezvous_env(job_name: &str, num_nodes: u32, rank: u32) -> BTreeMap<String, String> {
    BTreeMap::from([
        (constants::TORCH_ENV_NUM_NODES.to_string(), num_nodes.to_string()),
        (constants::TORCH_ENV_NUM_PROC_PER_NODE.to_string(), "1".to_string()),
        (constants::TORCH_ENV_NODE_RANK.to_string(), rank.to_string()),
        (constants::TORCH_ENV_MASTER_ADDR.to_string(), unit_name(job_name, 0)),
        (constants::TORCH_ENV_MASTER_PORT.to_string(), constants::TORCH_HEAD_NODE_PORT.to_string()),
    ])
}
