//! Fan-in of live log streams.
//!
//! Each source gets a worker task that drains it into a private bounded queue.
//! The consumer visits the queues round-robin, taking a bounded batch from each
//! per round, so a noisy source cannot starve a quiet one. A full queue blocks
//! its worker and therefore its source read.

use crate::constants;
use crate::error::{Result, TrainerError};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use trainjob_abstraction::LogStream;

/// Receives every log line as soon as the multiplexer reads it.
pub trait LogSink: Send + Sync {
    fn on_line(&self, step: &str, line: &str);
}

/// Prints lines as `[step]: line`.
#[derive(Debug, Default)]
pub struct StdoutLogSink;

impl LogSink for StdoutLogSink {
    fn on_line(&self, step: &str, line: &str) {
        println!("[{step}]: {line}");
    }
}

/// Discards lines; only the aggregated result is used.
#[derive(Debug, Default)]
pub struct NullLogSink;

impl LogSink for NullLogSink {
    fn on_line(&self, _step: &str, _line: &str) {}
}

/// A named, independently terminating line stream.
pub struct LogSource {
    pub step: String,
    pub stream: LogStream,
}

impl LogSource {
    #[must_use]
    pub fn new(step: impl Into<String>, stream: LogStream) -> Self {
        Self { step: step.into(), stream }
    }
}

impl std::fmt::Debug for LogSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSource").field("step", &self.step).finish_non_exhaustive()
    }
}

/// Which step's logs to fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRequest {
    /// Keep reading until the sources end or the caller cancels.
    #[serde(default)]
    pub follow: bool,
    /// Step name, or the node step prefix combined with `node_rank`.
    #[serde(default = "default_step")]
    pub step: String,
    #[serde(default)]
    pub node_rank: u32,
}

fn default_step() -> String {
    constants::NODE.to_string()
}

impl Default for LogRequest {
    fn default() -> Self {
        Self { follow: false, step: default_step(), node_rank: 0 }
    }
}

impl LogRequest {
    #[must_use]
    pub fn step(step: impl Into<String>) -> Self {
        Self { step: step.into(), ..Self::default() }
    }

    #[must_use]
    pub fn follow(mut self) -> Self {
        self.follow = true;
        self
    }

    #[must_use]
    pub fn with_node_rank(mut self, node_rank: u32) -> Self {
        self.node_rank = node_rank;
        self
    }

    /// Name of the node step this request targets (`trainer-node-<rank>`).
    #[must_use]
    pub fn ranked_step(&self) -> String {
        format!("{}-{}", self.step, self.node_rank)
    }

    /// True if a step name satisfies this request.
    #[must_use]
    pub fn matches(&self, step_name: &str) -> bool {
        step_name == self.step || step_name == self.ranked_step()
    }

    /// True for a follow request on the trainer nodes.
    #[must_use]
    pub fn follows_trainer(&self) -> bool {
        self.follow && self.step == constants::NODE
    }
}

/// Queue and polling limits of the multiplexer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogMultiplexConfig {
    /// Capacity of each source's queue.
    pub queue_capacity: usize,
    /// Records taken from one queue per round.
    pub batch_size: usize,
    /// How long to wait on an empty queue before moving on.
    pub poll_timeout_ms: u64,
}

impl Default for LogMultiplexConfig {
    fn default() -> Self {
        Self { queue_capacity: 100, batch_size: 50, poll_timeout_ms: 1000 }
    }
}

impl LogMultiplexConfig {
    #[must_use]
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(TrainerError::InvalidConfig("logs.queue_capacity must be positive".to_string()));
        }
        if self.batch_size == 0 {
            return Err(TrainerError::InvalidConfig("logs.batch_size must be positive".to_string()));
        }
        if self.poll_timeout_ms == 0 {
            return Err(TrainerError::InvalidConfig("logs.poll_timeout_ms must be positive".to_string()));
        }
        Ok(())
    }
}

enum Record {
    Line(String),
    Failed(String),
    Finished,
}

struct SourceQueue {
    step: String,
    rx: mpsc::Receiver<Record>,
    finished: bool,
}

/// Interleaves log sources into a sink and a per-step aggregate.
#[derive(Debug, Clone, Default)]
pub struct LogMultiplexer {
    config: LogMultiplexConfig,
}

impl LogMultiplexer {
    #[must_use]
    pub fn new(config: LogMultiplexConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &LogMultiplexConfig {
        &self.config
    }

    /// Drains every source until all of them end.
    ///
    /// Lines reach `sink` in per-source order and are collected per step,
    /// newline-terminated. Returns `Cancelled` once `cancel` fires and
    /// `LogStream` on the first source error; in both cases every worker is
    /// stopped before returning.
    pub async fn run(
        &self,
        sources: Vec<LogSource>,
        sink: &dyn LogSink,
        cancel: &CancellationToken,
    ) -> Result<BTreeMap<String, String>> {
        let workers = cancel.child_token();
        let _stop_workers = workers.clone().drop_guard();

        let capacity = self.config.queue_capacity.max(1);
        let mut queues = Vec::with_capacity(sources.len());
        for source in sources {
            let (tx, rx) = mpsc::channel(capacity);
            tokio::spawn(pump(source.stream, tx, workers.clone()));
            queues.push(SourceQueue { step: source.step, rx, finished: false });
        }
        debug!(sources = queues.len(), "Multiplexing log sources");

        let poll_timeout = self.config.poll_timeout();
        let batch_size = self.config.batch_size.max(1);
        let mut output: BTreeMap<String, String> = BTreeMap::new();

        while queues.iter().any(|queue| !queue.finished) {
            for queue in queues.iter_mut().filter(|queue| !queue.finished) {
                for _ in 0..batch_size {
                    // Checked first: cancelling also closes every worker queue.
                    let polled = tokio::select! {
                        biased;
                        () = cancel.cancelled() => return Err(TrainerError::Cancelled),
                        polled = tokio::time::timeout(poll_timeout, queue.rx.recv()) => polled,
                    };

                    match polled {
                        Err(_) => break,
                        Ok(Some(Record::Line(line))) => {
                            sink.on_line(&queue.step, &line);
                            let entry = output.entry(queue.step.clone()).or_default();
                            entry.push_str(&line);
                            entry.push('\n');
                        }
                        Ok(Some(Record::Finished)) => {
                            queue.finished = true;
                            break;
                        }
                        Ok(Some(Record::Failed(reason))) => {
                            return Err(TrainerError::LogStream { step: queue.step.clone(), reason });
                        }
                        Ok(None) if cancel.is_cancelled() => return Err(TrainerError::Cancelled),
                        Ok(None) => {
                            warn!(step = %queue.step, "Log worker stopped without end of stream");
                            queue.finished = true;
                            break;
                        }
                    }
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(TrainerError::Cancelled);
        }
        Ok(output)
    }
}

async fn pump(mut stream: LogStream, tx: mpsc::Sender<Record>, cancel: CancellationToken) {
    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => return,
            next = stream.next() => next,
        };

        let record = match next {
            Some(Ok(line)) => Record::Line(line),
            Some(Err(err)) => Record::Failed(err.to_string()),
            None => Record::Finished,
        };
        let last = !matches!(record, Record::Line(_));

        tokio::select! {
            () = cancel.cancelled() => return,
            sent = tx.send(record) => {
                if sent.is_err() {
                    return;
                }
            }
        }

        if last {
            return;
        }
    }
}
