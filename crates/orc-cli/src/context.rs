//! `CliContext` — the explicit dependency-registry a compiled pipeline
//! looks services up from at execute-time.
//!
//! `TaskHandler` installs a `CommandExecutor` that runs pipelines through
//! this same context, which is how `ExecuteCommand` steps close the loop
//! without `orc-engine` depending on `orc-cli` at compile time.

use crate::graph::Graph;
use orc_engine::task_handler::CommandExecutor;
use orc_engine::{MessageBus, SubscriptionHandler, TaskHandler, WorkerTaskQueue};
use orc_shared::model::TaskDescription;
use orc_shared::{TaskerError, TaskerResult};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A stored job template.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct JobRecord {
    pub descriptor: TaskDescription,
    pub active: bool,
}

/// In-memory job/template/config CRUD stores.
#[derive(Default)]
pub struct JobStore {
    jobs: RwLock<BTreeMap<String, JobRecord>>,
}

impl JobStore {
    pub async fn add(&self, record: JobRecord) {
        self.jobs.write().await.insert(record.descriptor.id().to_string(), record);
    }

    pub async fn get(&self, id: &str) -> Option<JobRecord> {
        self.jobs.read().await.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<JobRecord> {
        self.jobs.read().await.values().cloned().collect()
    }

    pub async fn remove(&self, id: &str) -> TaskerResult<()> {
        self.jobs
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| TaskerError::NotFound(format!("job '{id}'")))
    }

    pub async fn set_active(&self, id: &str, active: bool) -> TaskerResult<()> {
        let mut jobs = self.jobs.write().await;
        let record = jobs.get_mut(id).ok_or_else(|| TaskerError::NotFound(format!("job '{id}'")))?;
        record.active = active;
        Ok(())
    }
}

#[derive(Default)]
pub struct TemplateStore {
    templates: RwLock<BTreeMap<String, String>>,
}

impl TemplateStore {
    pub async fn add(&self, name: impl Into<String>, body: impl Into<String>) {
        self.templates.write().await.insert(name.into(), body.into());
    }

    pub async fn get(&self, name: &str) -> Option<String> {
        self.templates.read().await.get(name).cloned()
    }

    pub async fn list(&self) -> Vec<String> {
        self.templates.read().await.keys().cloned().collect()
    }

    pub async fn remove(&self, name: &str) -> TaskerResult<()> {
        self.templates
            .write()
            .await
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| TaskerError::NotFound(format!("template '{name}'")))
    }
}

#[derive(Default)]
pub struct ConfigStore {
    configs: RwLock<BTreeMap<String, Value>>,
}

impl ConfigStore {
    pub async fn set(&self, name: impl Into<String>, value: Value) {
        self.configs.write().await.insert(name.into(), value);
    }

    pub async fn get(&self, name: &str) -> Option<Value> {
        self.configs.read().await.get(name).cloned()
    }

    pub async fn list(&self) -> Vec<String> {
        self.configs.read().await.keys().cloned().collect()
    }
}

/// One recorded node mutation, queried by the `history` stage.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ChangeRecord {
    pub node_id: String,
    pub change: String,
    pub at: chrono::DateTime<chrono::Utc>,
}

/// `--before`/`--after`/`--change` as parsed from `workflows history`/
/// `history`.
#[derive(Default, Clone)]
pub struct ChangeLogFilter {
    pub change: Option<String>,
    pub after: Option<chrono::DateTime<chrono::Utc>>,
    pub before: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Default)]
pub struct ChangeLog {
    records: RwLock<Vec<ChangeRecord>>,
}

impl ChangeLog {
    pub async fn record(&self, node_id: impl Into<String>, change: impl Into<String>, at: chrono::DateTime<chrono::Utc>) {
        self.records.write().await.push(ChangeRecord {
            node_id: node_id.into(),
            change: change.into(),
            at,
        });
    }

    pub async fn query(&self, filter: &ChangeLogFilter) -> Vec<ChangeRecord> {
        self.records
            .read()
            .await
            .iter()
            .filter(|r| filter.change.as_deref().is_none_or(|k| r.change == k))
            .filter(|r| filter.after.is_none_or(|a| r.at >= a))
            .filter(|r| filter.before.is_none_or(|b| r.at <= b))
            .cloned()
            .collect()
    }
}

/// The registry every stage resolves its collaborators from at
/// execute-time, breaking the would-be cycle between the CLI and the
/// engine it drives.
#[derive(Clone)]
pub struct CliContext {
    pub bus: MessageBus,
    pub subscriptions: SubscriptionHandler,
    pub task_handler: TaskHandler,
    pub worker_queue: WorkerTaskQueue,
    pub graph: Graph,
    pub jobs: Arc<JobStore>,
    pub templates: Arc<TemplateStore>,
    pub configs: Arc<ConfigStore>,
    pub history: Arc<ChangeLog>,
    pub http_client: reqwest::Client,
    /// The section a bare `jq`/graph-predicate path resolves against
    /// when not absolute; defaults to "reported".
    pub section: String,
    /// Colour is disabled for `write` sink output regardless of this flag
    ///; it governs interactive stdout rendering only.
    pub colour: bool,
}

impl CliContext {
    pub fn new(bus: MessageBus, subscriptions: SubscriptionHandler, task_handler: TaskHandler, worker_queue: WorkerTaskQueue) -> Self {
        Self {
            bus,
            subscriptions,
            task_handler,
            worker_queue,
            graph: Graph::new(),
            jobs: Arc::new(JobStore::default()),
            templates: Arc::new(TemplateStore::default()),
            configs: Arc::new(ConfigStore::default()),
            history: Arc::new(ChangeLog::default()),
            http_client: reqwest::Client::new(),
            section: "reported".to_string(),
            colour: true,
        }
    }
}

/// Installed on `TaskHandler` so `ExecuteCommand` steps run back through
/// the same pipeline machinery.
pub struct PipelineExecutor {
    ctx: CliContext,
}

impl PipelineExecutor {
    pub fn new(ctx: CliContext) -> Self {
        Self { ctx }
    }
}

#[async_trait::async_trait]
impl CommandExecutor for PipelineExecutor {
    async fn execute(&self, command_line: &str) -> TaskerResult<()> {
        crate::stage::run_line(command_line, self.ctx.clone()).await?;
        Ok(())
    }
}
