//! WorkerTaskQueue — attribute-routed work dispatch with ack/nack/retry and
//! TTL.

use orc_shared::ids::{WorkerId, WorkerTaskId};
use orc_shared::retry::Backoff;
use orc_shared::{TaskerError, TaskerResult};
use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex, Notify};
use tracing::{debug, info, warn};

/// A discrete unit of work routed to workers via attribute filters.
#[derive(Debug, Clone)]
pub struct WorkerTask {
    pub id: WorkerTaskId,
    pub name: String,
    pub attributes: BTreeMap<String, String>,
    pub data: Value,
    pub timeout: Duration,
}

impl WorkerTask {
    pub fn new(name: impl Into<String>, attributes: BTreeMap<String, String>, data: Value, timeout: Duration) -> Self {
        Self {
            id: WorkerTaskId::fresh(),
            name: name.into(),
            attributes,
            data,
            timeout,
        }
    }
}

/// A worker's declared interests: which task names it handles and which
/// attribute patterns it requires a match against.
#[derive(Debug, Clone)]
pub struct WorkerSession {
    pub worker_id: WorkerId,
    pub task_names: HashSet<String>,
    pub attribute_filters: BTreeMap<String, Regex>,
}

impl WorkerSession {
    pub fn new(worker_id: WorkerId, task_names: Vec<String>, attribute_filters: BTreeMap<String, String>) -> TaskerResult<Self> {
        let mut compiled = BTreeMap::new();
        for (k, pattern) in attribute_filters {
            let re = Regex::new(&pattern).map_err(|e| TaskerError::ParseError(format!("invalid attribute pattern '{pattern}': {e}")))?;
            compiled.insert(k, re);
        }
        Ok(Self {
            worker_id,
            task_names: task_names.into_iter().collect(),
            attribute_filters: compiled,
        })
    }

    /// A task matches a worker iff every attribute required by the worker is
    /// present in the task with a value matching the pattern, and the
    /// task's `name` is in the worker's `task_names`.
    fn matches(&self, task: &WorkerTask) -> bool {
        if !self.task_names.contains(&task.name) {
            return false;
        }
        self.attribute_filters.iter().all(|(k, re)| {
            task.attributes
                .get(k)
                .map(|v| re.is_match(v))
                .unwrap_or(false)
        })
    }
}

struct PendingTask {
    task: WorkerTask,
    attempt: u32,
    excluded_workers: HashSet<WorkerId>,
    result_tx: Option<oneshot::Sender<TaskerResult<Value>>>,
}

struct Claimed {
    task: WorkerTask,
    attempt: u32,
    excluded_workers: HashSet<WorkerId>,
    result_tx: Option<oneshot::Sender<TaskerResult<Value>>>,
    deadline: Instant,
}

struct Inner {
    sessions: HashMap<WorkerId, WorkerSession>,
    queue: VecDeque<PendingTask>,
    claimed: HashMap<(WorkerId, WorkerTaskId), Claimed>,
}

/// Routes `WorkerTask`s to workers that declared matching capabilities, with
/// at-least-once, retried delivery.
#[derive(Clone)]
pub struct WorkerTaskQueue {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
    backoff: Backoff,
}

impl WorkerTaskQueue {
    pub fn new(backoff: Backoff) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                sessions: HashMap::new(),
                queue: VecDeque::new(),
                claimed: HashMap::new(),
            })),
            notify: Arc::new(Notify::new()),
            backoff,
        }
    }

    /// Attach a worker session; scoped cleanup happens via `detach`.
    pub async fn attach(&self, session: WorkerSession) {
        let worker_id = session.worker_id.clone();
        self.inner.lock().await.sessions.insert(worker_id, session);
        self.notify.notify_waiters();
    }

    pub async fn detach(&self, worker_id: &WorkerId) {
        self.inner.lock().await.sessions.remove(worker_id);
    }

    /// Enqueues; completes when a worker returns success or the task
    /// permanently fails.
    pub async fn add_task(&self, task: WorkerTask) -> oneshot::Receiver<TaskerResult<Value>> {
        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock().await;
            inner.queue.push_back(PendingTask {
                task,
                attempt: 0,
                excluded_workers: HashSet::new(),
                result_tx: Some(tx),
            });
        }
        self.notify.notify_waiters();
        rx
    }

    /// Cooperative pull: a worker asks for its next matching task.
    /// Waits until a match arrives.
    pub async fn next(&self, worker_id: &WorkerId) -> TaskerResult<WorkerTask> {
        loop {
            {
                let mut inner = self.inner.lock().await;
                let session = inner
                    .sessions
                    .get(worker_id)
                    .cloned()
                    .ok_or_else(|| TaskerError::NotFound(format!("worker '{worker_id}' is not attached")))?;

                let names: Vec<String> = session.task_names.iter().cloned().collect();
                for name in names {
                    let pos = inner.queue.iter().position(|p| {
                        p.task.name == name && !p.excluded_workers.contains(worker_id) && session.matches(&p.task)
                    });
                    if let Some(idx) = pos {
                        let pending = inner.queue.remove(idx).expect("index just found");
                        let deadline = Instant::now() + pending.task.timeout;
                        let claim_key = (worker_id.clone(), pending.task.id.clone());
                        let task = pending.task.clone();
                        inner.claimed.insert(
                            claim_key,
                            Claimed {
                                task: pending.task,
                                attempt: pending.attempt,
                                excluded_workers: pending.excluded_workers,
                                result_tx: pending.result_tx,
                                deadline,
                            },
                        );
                        return Ok(task);
                    }
                }
            }
            self.notify.notified().await;
        }
    }

    /// Positive completion. Duplicate acknowledgements are ignored.
    pub async fn acknowledge_task(&self, worker_id: &WorkerId, task_id: &WorkerTaskId, result: Value) {
        let claimed = {
            let mut inner = self.inner.lock().await;
            inner.claimed.remove(&(worker_id.clone(), task_id.clone()))
        };
        if let Some(claimed) = claimed {
            info!(worker_id = %worker_id, task_id = %task_id, "worker task acknowledged");
            if let Some(tx) = claimed.result_tx {
                let _ = tx.send(Ok(result));
            }
        } else {
            debug!(worker_id = %worker_id, task_id = %task_id, "ignoring duplicate acknowledgement");
        }
    }

    /// Negative completion; retried up to 3 attempts with exponential
    /// backoff.
    pub async fn error_task(&self, worker_id: &WorkerId, task_id: &WorkerTaskId, error: String) {
        let claimed = {
            let mut inner = self.inner.lock().await;
            inner.claimed.remove(&(worker_id.clone(), task_id.clone()))
        };
        let Some(claimed) = claimed else {
            debug!(worker_id = %worker_id, task_id = %task_id, "ignoring duplicate error for unknown claim");
            return;
        };
        // An explicit nack retries on the same worker; only a TTL timeout
        // (reap_overdue) excludes the worker, since that worker may be gone.
        self.retry_or_fail(None, claimed, error).await;
    }

    async fn retry_or_fail(&self, failed_worker: Option<WorkerId>, mut claimed: Claimed, error: String) {
        claimed.attempt += 1;
        if let Some(failed_worker) = failed_worker {
            claimed.excluded_workers.insert(failed_worker);
        }
        if claimed.attempt < self.backoff.total_attempts() {
            warn!(
                task_id = %claimed.task.id,
                attempt = claimed.attempt,
                error = %error,
                "worker task failed, re-queuing with backoff"
            );
            let delay = self.backoff.delay(claimed.attempt - 1);
            let inner = self.inner.clone();
            let notify = self.notify.clone();
            let task = claimed.task.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let mut inner = inner.lock().await;
                inner.queue.push_back(PendingTask {
                    task,
                    attempt: claimed.attempt,
                    excluded_workers: claimed.excluded_workers,
                    result_tx: claimed.result_tx,
                });
                drop(inner);
                notify.notify_waiters();
            });
        } else {
            warn!(task_id = %claimed.task.id, attempts = claimed.attempt, "worker task permanently failed");
            if let Some(tx) = claimed.result_tx {
                let _ = tx.send(Err(TaskerError::WorkerFailure(error)));
            }
        }
    }

    /// Reaps claims whose TTL elapsed without an ack/nack, re-queuing them to
    /// another worker or reporting failure after retry exhaustion.
    pub async fn reap_overdue(&self) {
        let overdue: Vec<((WorkerId, WorkerTaskId), Claimed)> = {
            let mut inner = self.inner.lock().await;
            let now = Instant::now();
            let keys: Vec<(WorkerId, WorkerTaskId)> = inner
                .claimed
                .iter()
                .filter(|(_, c)| c.deadline <= now)
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter().filter_map(|k| inner.claimed.remove(&k).map(|c| (k, c))).collect()
        };
        for ((worker_id, task_id), claimed) in overdue {
            warn!(worker_id = %worker_id, task_id = %task_id, "worker task TTL expired");
            self.retry_or_fail(Some(worker_id), claimed, "timeout".to_string()).await;
        }
    }

    pub async fn queue_depth(&self) -> usize {
        self.inner.lock().await.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(worker: &str, names: &[&str], filters: &[(&str, &str)]) -> WorkerSession {
        WorkerSession::new(
            WorkerId::new(worker),
            names.iter().map(|s| s.to_string()).collect(),
            filters.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn task_routes_only_to_workers_with_matching_attributes() {
        let queue = WorkerTaskQueue::new(Backoff::new(Duration::from_millis(1), 3));
        queue.attach(session("w1", &["tag"], &[("cloud", "^aws$")])).await;
        queue.attach(session("w2", &["tag"], &[("cloud", "^gcp$")])).await;

        let mut attrs = BTreeMap::new();
        attrs.insert("cloud".to_string(), "aws".to_string());
        let task = WorkerTask::new("tag", attrs, Value::Null, Duration::from_secs(5));
        let task_id = task.id.clone();
        let _rx = queue.add_task(task).await;

        let pulled = tokio::time::timeout(Duration::from_millis(200), queue.next(&WorkerId::new("w1")))
            .await
            .expect("w1 should receive the matching task")
            .unwrap();
        assert_eq!(pulled.id, task_id);
    }

    #[tokio::test]
    async fn acknowledge_resolves_the_add_task_future() {
        let queue = WorkerTaskQueue::new(Backoff::new(Duration::from_millis(1), 3));
        queue.attach(session("w1", &["execute-task"], &[])).await;
        let task = WorkerTask::new("execute-task", BTreeMap::new(), Value::Null, Duration::from_secs(5));
        let task_id = task.id.clone();
        let rx = queue.add_task(task).await;

        let pulled = queue.next(&WorkerId::new("w1")).await.unwrap();
        assert_eq!(pulled.id, task_id);
        queue.acknowledge_task(&WorkerId::new("w1"), &task_id, serde_json::json!({"ok": true})).await;

        let result = rx.await.unwrap().unwrap();
        assert_eq!(result, serde_json::json!({"ok": true}));
    }

    #[tokio::test]
    async fn duplicate_acknowledgement_is_ignored() {
        let queue = WorkerTaskQueue::new(Backoff::new(Duration::from_millis(1), 3));
        queue.attach(session("w1", &["x"], &[])).await;
        let task = WorkerTask::new("x", BTreeMap::new(), Value::Null, Duration::from_secs(5));
        let task_id = task.id.clone();
        let _rx = queue.add_task(task).await;
        let _ = queue.next(&WorkerId::new("w1")).await.unwrap();
        queue.acknowledge_task(&WorkerId::new("w1"), &task_id, Value::Null).await;
        // Second ack must not panic and has nothing left to resolve.
        queue.acknowledge_task(&WorkerId::new("w1"), &task_id, Value::Null).await;
    }

    #[tokio::test]
    async fn permanently_failing_task_is_attempted_exactly_four_times() {
        let queue = WorkerTaskQueue::new(Backoff::new(Duration::from_millis(1), 3));
        queue.attach(session("w1", &["x"], &[])).await;
        let task = WorkerTask::new("x", BTreeMap::new(), Value::Null, Duration::from_secs(5));
        let rx = queue.add_task(task).await;

        let mut attempts = 0;
        loop {
            let pulled = tokio::time::timeout(Duration::from_secs(1), queue.next(&WorkerId::new("w1")))
                .await
                .expect("should keep getting retried")
                .unwrap();
            attempts += 1;
            queue.error_task(&WorkerId::new("w1"), &pulled.id, "boom".to_string()).await;
            if attempts >= 4 {
                break;
            }
        }
        let result = rx.await.unwrap();
        assert!(result.is_err());
        assert_eq!(attempts, 4);
    }

    #[tokio::test]
    async fn overdue_claim_is_reaped_and_requeued() {
        let queue = WorkerTaskQueue::new(Backoff::new(Duration::from_millis(1), 3));
        queue.attach(session("w1", &["x"], &[])).await;
        queue.attach(session("w2", &["x"], &[])).await;
        let task = WorkerTask::new("x", BTreeMap::new(), Value::Null, Duration::from_millis(1));
        let _rx = queue.add_task(task).await;
        let _ = queue.next(&WorkerId::new("w1")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        queue.reap_overdue().await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        // Requeued away from w1 (excluded), so w2 should be able to claim it.
        let pulled = tokio::time::timeout(Duration::from_millis(200), queue.next(&WorkerId::new("w2")))
            .await
            .expect("w2 should receive the reaped task");
        assert!(pulled.is_ok());
    }
}
