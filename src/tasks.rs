//! Task-queue metrics
//!
//! Producers call [`TaskMetrics::published`] after a task is handed to the
//! broker; workers bracket execution with [`TaskMetrics::started`] and
//! [`TaskMetrics::finished`]. Workers that are too short-lived to be scraped
//! can [`TaskMetrics::push`] to a gateway instead.

use crate::clock::TimingToken;
use crate::error::PushError;
use crate::metrics::MetricsRegistry;
use crate::pushgateway::PushGateway;
use prometheus::{HistogramVec, IntCounterVec};

/// Final state of a task execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Success,
    Failure,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Success => "success",
            TaskState::Failure => "failure",
        }
    }
}

/// One running task, returned by [`TaskMetrics::started`]
#[derive(Debug, Clone)]
pub struct TaskRun {
    task: String,
    started: TimingToken,
}

impl TaskRun {
    pub fn task(&self) -> &str {
        &self.task
    }
}

#[derive(Clone)]
pub struct TaskMetrics {
    registry: MetricsRegistry,
    queued: IntCounterVec,
    started: IntCounterVec,
    finished: IntCounterVec,
    retried: IntCounterVec,
    runtime: HistogramVec,
}

impl TaskMetrics {
    pub fn new(registry: &MetricsRegistry) -> Result<Self, prometheus::Error> {
        Ok(Self {
            queued: registry.counter_vec(
                "tasks_queued_total",
                "Tasks submitted to the queue",
                &["exchange", "routing_key", "task"],
            )?,
            started: registry.counter_vec(
                "tasks_started_total",
                "Tasks picked up by a worker",
                &["task"],
            )?,
            finished: registry.counter_vec(
                "tasks_finished_total",
                "Tasks finished by final state",
                &["task", "state"],
            )?,
            retried: registry.counter_vec(
                "tasks_retried_total",
                "Tasks scheduled for retry",
                &["task"],
            )?,
            runtime: registry.histogram_vec(
                "task_runtime_seconds",
                "Histogram of task execution time",
                &["task"],
                None,
            )?,
            registry: registry.clone(),
        })
    }

    pub fn registry(&self) -> &MetricsRegistry {
        &self.registry
    }

    /// A task was published to `exchange` with `routing_key`
    pub fn published(&self, exchange: &str, routing_key: &str, task: &str) {
        if let Some(c) = self.registry.labeled(
            "tasks_queued",
            &self.queued,
            &[exchange, routing_key, task],
        ) {
            c.inc();
        }
    }

    /// A worker started executing `task`
    pub fn started(&self, task: &str) -> TaskRun {
        if let Some(c) = self.registry.labeled("tasks_started", &self.started, &[task]) {
            c.inc();
        }
        TaskRun {
            task: task.to_string(),
            started: TimingToken::now(),
        }
    }

    /// The run finished in `state`; its runtime is observed
    pub fn finished(&self, run: TaskRun, state: TaskState) -> f64 {
        if let Some(c) = self.registry.labeled(
            "tasks_finished",
            &self.finished,
            &[&run.task, state.as_str()],
        ) {
            c.inc();
        }
        let elapsed = run.started.elapsed_secs();
        if let Some(h) = self
            .registry
            .labeled("task_runtime", &self.runtime, &[&run.task])
        {
            h.observe(elapsed);
        }
        elapsed
    }

    /// The task failed and was scheduled for another attempt
    pub fn retried(&self, task: &str) {
        if let Some(c) = self.registry.labeled("tasks_retried", &self.retried, &[task]) {
            c.inc();
        }
    }

    /// Push the registry holding these metrics under `job`
    pub async fn push(&self, gateway: &PushGateway, job: &str) -> Result<(), PushError> {
        gateway.push(job, &self.registry).await
    }
}
