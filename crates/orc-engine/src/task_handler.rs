//! TaskHandler — the workflow/job engine.
//!
//! Materializes task descriptors, drives each instance through its step
//! state machine, fans actions out to eligible subscribers, collects
//! acknowledgements, enforces timeouts, persists in-flight tasks, and
//! recovers them on restart.

use crate::bus::MessageBus;
use crate::running_task_db::{RunningTask, SharedRunningTaskDb};
use crate::scheduler::Scheduler;
use crate::subscriptions::SubscriptionHandler;
use orc_shared::ids::{SubscriberId, TaskDescriptorId, TaskId};
use orc_shared::message::Message;
use orc_shared::model::{CronExpr, Step, StepAction, StepErrorBehaviour, TaskDescription, TaskSurpassBehaviour, TaskState, Trigger};
use orc_shared::{TaskerError, TaskerResult};
use serde_json::json;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

/// Commands cross into the external CLI pipeline engine here, resolved at
/// execute-time through this trait rather than a direct dependency — the
/// same "dependency-registry" pattern the Design Notes prescribe to break
/// the TaskHandler <-> CLI cycle.
#[async_trait::async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, command_line: &str) -> TaskerResult<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct TaskHandlerConfig {
    pub default_step_timeout: Duration,
}

impl Default for TaskHandlerConfig {
    fn default() -> Self {
        Self {
            default_step_timeout: Duration::from_secs(30),
        }
    }
}

/// Outcome of a `start_task` request, reflecting the `on_surpass` policy
/// applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started(TaskId),
    AlreadyRunning(TaskId),
    Queued,
}

struct TaskHandle {
    cancel: watch::Sender<bool>,
}

struct Registered {
    descriptor: TaskDescription,
    steps: Vec<Step>,
}

struct Inner {
    bus: MessageBus,
    subscriptions: SubscriptionHandler,
    db: SharedRunningTaskDb,
    config: TaskHandlerConfig,
    descriptors: RwLock<HashMap<TaskDescriptorId, Registered>>,
    tasks: RwLock<HashMap<TaskId, TaskHandle>>,
    running_snapshot: RwLock<HashMap<TaskId, RunningTask>>,
    pending_waits: Mutex<HashMap<TaskDescriptorId, VecDeque<()>>>,
    scheduler: Mutex<Scheduler>,
    command_executor: RwLock<Option<Arc<dyn CommandExecutor>>>,
    /// Non-awaited handoff so a terminating task's `Wait`-queue pop doesn't
    /// call back into `start_task` on the same (recursive) future chain —
    /// `drive` just sends here; a separate top-level loop does the starting.
    wake_waiters: tokio::sync::mpsc::UnboundedSender<TaskDescriptorId>,
}

/// The workflow/job engine.
#[derive(Clone)]
pub struct TaskHandler {
    inner: Arc<Inner>,
}

impl TaskHandler {
    pub fn new(bus: MessageBus, subscriptions: SubscriptionHandler, db: SharedRunningTaskDb, config: TaskHandlerConfig) -> Self {
        let (wake_tx, mut wake_rx) = tokio::sync::mpsc::unbounded_channel::<TaskDescriptorId>();
        let inner = Arc::new(Inner {
            bus,
            subscriptions,
            db,
            config,
            descriptors: RwLock::new(HashMap::new()),
            tasks: RwLock::new(HashMap::new()),
            running_snapshot: RwLock::new(HashMap::new()),
            pending_waits: Mutex::new(HashMap::new()),
            scheduler: Mutex::new(Scheduler::new()),
            command_executor: RwLock::new(None),
            wake_waiters: wake_tx,
        });
        let handler = Self { inner: inner.clone() };
        tokio::spawn(async move {
            while let Some(descriptor_id) = wake_rx.recv().await {
                let _ = handler.start_task(&descriptor_id).await;
            }
        });
        Self { inner }
    }

    /// Installed after construction, resolving the TaskHandler<->CLI cycle.
    pub async fn install_command_executor(&self, executor: Arc<dyn CommandExecutor>) {
        *self.inner.command_executor.write().await = Some(executor);
    }

    pub async fn register_descriptor(&self, descriptor: TaskDescription) -> TaskerResult<()> {
        let steps = descriptor.steps()?;
        let id = descriptor.id().clone();
        for trigger in descriptor.triggers() {
            if let Trigger::TimeTrigger { cron } = trigger {
                self.inner.scheduler.lock().await.register(id.as_str(), &cron);
            }
        }
        self.inner
            .descriptors
            .write()
            .await
            .insert(id, Registered { descriptor, steps });
        Ok(())
    }

    pub async fn descriptor(&self, id: &TaskDescriptorId) -> Option<TaskDescription> {
        self.inner.descriptors.read().await.get(id).map(|r| r.descriptor.clone())
    }

    pub async fn list_descriptors(&self) -> Vec<TaskDescription> {
        self.inner.descriptors.read().await.values().map(|r| r.descriptor.clone()).collect()
    }

    pub async fn running_instances_for(&self, id: &TaskDescriptorId) -> Vec<TaskId> {
        self.inner
            .running_snapshot
            .read()
            .await
            .values()
            .filter(|t| &t.descriptor_id == id)
            .map(|t| t.id)
            .collect()
    }

    pub async fn running_tasks(&self) -> Vec<RunningTask> {
        self.inner.running_snapshot.read().await.values().cloned().collect()
    }

    pub async fn task_count(&self) -> usize {
        self.inner.tasks.read().await.len()
    }

    /// Stops driving every in-flight task without touching persisted state,
    /// simulating a process exit ahead of `recover()` on the next process
    /// start.
    pub async fn shutdown(&self) {
        for (_, handle) in self.inner.tasks.write().await.drain() {
            let _ = handle.cancel.send(true);
        }
    }

    /// For each descriptor with a matching `EventTrigger`, evaluates
    /// `on_surpass` and starts instances accordingly.
    #[instrument(skip(self))]
    pub async fn handle_event(&self, message_type: &str) -> Vec<StartOutcome> {
        let matching: Vec<TaskDescriptorId> = {
            let descriptors = self.inner.descriptors.read().await;
            descriptors
                .values()
                .filter(|r| {
                    r.descriptor
                        .triggers()
                        .iter()
                        .any(|t| matches!(t, Trigger::EventTrigger { message_type: m } if m == message_type))
                })
                .map(|r| r.descriptor.id().clone())
                .collect()
        };
        let mut outcomes = Vec::new();
        for id in matching {
            if let Ok(outcome) = self.start_task(&id).await {
                outcomes.push(outcome);
            }
        }
        outcomes
    }

    /// Evaluate `on_surpass` against existing running instances and start
    /// a new instance of `descriptor_id`.
    #[instrument(skip(self))]
    pub async fn start_task(&self, descriptor_id: &TaskDescriptorId) -> TaskerResult<StartOutcome> {
        let registered = self
            .inner
            .descriptors
            .read()
            .await
            .get(descriptor_id)
            .map(|r| (r.descriptor.clone(), r.steps.clone()))
            .ok_or_else(|| TaskerError::NotFound(format!("no such task descriptor '{descriptor_id}'")))?;
        let (descriptor, steps) = registered;

        let running = self.running_instances_for(descriptor_id).await;
        match descriptor.on_surpass() {
            TaskSurpassBehaviour::Skip => {
                if let Some(existing) = running.first() {
                    return Ok(StartOutcome::AlreadyRunning(*existing));
                }
            }
            TaskSurpassBehaviour::Replace => {
                for id in running {
                    self.delete_running_task(&id).await?;
                }
            }
            TaskSurpassBehaviour::Wait => {
                if !running.is_empty() {
                    let mut pending_waits = self.inner.pending_waits.lock().await;
                    let queue = pending_waits.entry(descriptor_id.clone()).or_default();
                    if queue.is_empty() {
                        queue.push_back(());
                    }
                    return Ok(StartOutcome::Queued);
                }
            }
            TaskSurpassBehaviour::Parallel => {}
        }

        Ok(StartOutcome::Started(self.spawn_instance(descriptor.id().clone(), steps, RunningTask::new(descriptor.id().clone())).await?))
    }

    async fn spawn_instance(&self, descriptor_id: TaskDescriptorId, steps: Vec<Step>, running: RunningTask) -> TaskerResult<TaskId> {
        let task_id = running.id;
        self.inner.db.upsert(&running).await?;
        self.inner.running_snapshot.write().await.insert(task_id, running.clone());
        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.inner.tasks.write().await.insert(task_id, TaskHandle { cancel: cancel_tx });

        info!(task_id = %task_id, descriptor_id = %descriptor_id, "task started");
        self.inner
            .bus
            .emit_event(
                "task_started",
                json!({"task": descriptor_id.to_string(), "task_id": task_id.to_string()}),
            )
            .await;

        let inner = self.inner.clone();
        tokio::spawn(async move {
            drive(inner, steps, running, cancel_rx).await;
        });
        Ok(task_id)
    }

    /// Sets state `TaskFailed`, cancels the current step's update task,
    /// removes from memory, and persists.
    #[instrument(skip(self))]
    pub async fn delete_running_task(&self, task_id: &TaskId) -> TaskerResult<()> {
        let handle = self.inner.tasks.write().await.remove(task_id);
        let Some(handle) = handle else {
            return Err(TaskerError::NotFound(format!("no running task '{task_id}'")));
        };
        let _ = handle.cancel.send(true);
        if let Some(mut snap) = self.inner.running_snapshot.write().await.remove(task_id) {
            snap.task_state = TaskState::TaskFailed;
            self.inner.db.upsert(&snap).await?;
        }
        self.inner.db.remove(task_id).await?;
        Ok(())
    }

    /// Dispatches an `ActionDone`/`ActionError`/`ActionInfo`/`ActionProgress`
    /// arriving out-of-band (e.g. replayed during tests); in normal
    /// operation each task's own bus subscription handles this directly.
    pub async fn handle_message(&self, message: &Message) {
        if let Message::ActionInfo { level, message: m, .. } = message {
            debug!(level = %level, message = %m, "action info");
        }
    }

    /// `Action`s still pending for `subscriber_id` across all running tasks,
    /// used by recovery tests to assert the pending set survived a restart.
    pub async fn list_all_pending_actions_for(&self, subscriber_id: &SubscriberId) -> Vec<(TaskId, String)> {
        let snapshot = self.inner.running_snapshot.read().await;
        let descriptors = self.inner.descriptors.read().await;
        snapshot
            .values()
            .filter(|t| t.pending_action_for.contains(subscriber_id))
            .filter_map(|t| {
                let reg = descriptors.get(&t.descriptor_id)?;
                let step = reg.steps.get(t.current_step_index)?;
                Some((t.id, step.name.clone()))
            })
            .collect()
    }

    /// Loads all non-terminal RunningTasks from RunningTaskDb, reconstructs
    /// `current_step`, and resumes the state machine. Idempotent: running
    /// recovery twice against the same database state yields the same
    /// in-memory state.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> TaskerResult<usize> {
        let to_recover = self.inner.db.load_non_terminal().await?;
        let mut recovered = 0;
        for running in to_recover {
            if self.inner.tasks.read().await.contains_key(&running.id) {
                continue; // already running in-memory; recovery is idempotent.
            }
            let Some(reg) = self.inner.descriptors.read().await.get(&running.descriptor_id).map(|r| r.steps.clone()) else {
                warn!(task_id = %running.id, descriptor_id = %running.descriptor_id, "cannot recover task: descriptor unknown");
                continue;
            };
            self.inner.running_snapshot.write().await.insert(running.id, running.clone());
            let (cancel_tx, cancel_rx) = watch::channel(false);
            self.inner.tasks.write().await.insert(running.id, TaskHandle { cancel: cancel_tx });
            let inner = self.inner.clone();
            tokio::spawn(async move {
                drive(inner, reg, running, cancel_rx).await;
            });
            recovered += 1;
        }
        info!(recovered, "task recovery complete");
        Ok(recovered)
    }

    /// Periodic tick: advances due `TimeTrigger` descriptors.
    pub async fn tick(&self, now: chrono::DateTime<chrono::Utc>) {
        let crons: HashMap<String, CronExpr> = {
            let descriptors = self.inner.descriptors.read().await;
            descriptors
                .values()
                .flat_map(|r| {
                    r.descriptor.triggers().into_iter().filter_map(move |t| match t {
                        Trigger::TimeTrigger { cron } => Some((r.descriptor.id().to_string(), cron)),
                        Trigger::EventTrigger { .. } => None,
                    })
                })
                .collect()
        };
        let due = self.inner.scheduler.lock().await.due(now, &crons);
        for descriptor_id in due {
            let _ = self.start_task(&TaskDescriptorId::new(descriptor_id)).await;
        }
    }

    async fn on_task_terminal(&self, descriptor_id: &TaskDescriptorId) {
        let mut waits = self.inner.pending_waits.lock().await;
        if let Some(queue) = waits.get_mut(descriptor_id) {
            if queue.pop_front().is_some() {
                let _ = self.inner.wake_waiters.send(descriptor_id.clone());
            }
        }
    }
}

enum StepOutcome {
    Completed,
    TimedOut,
    Errored(String),
    Cancelled,
}

async fn drive(inner: Arc<Inner>, steps: Vec<Step>, mut running: RunningTask, mut cancel: watch::Receiver<bool>) {
    let handler_like = TaskHandler { inner: inner.clone() };
    let descriptor_id = running.descriptor_id.clone();

    let start = running.current_step_index;
    for (idx, step) in steps.iter().enumerate().skip(start) {
        running.current_step_index = idx;
        let outcome = execute_step(&inner, &mut running, step, &mut cancel).await;

        match outcome {
            StepOutcome::Completed => {
                running.pending_action_for.clear();
                running.action_emitted = false;
                let _ = inner.db.upsert(&running).await;
            }
            StepOutcome::Cancelled => {
                return;
            }
            StepOutcome::TimedOut | StepOutcome::Errored(_) => {
                if let StepOutcome::Errored(e) = &outcome {
                    warn!(task_id = %running.id, step = %step.name, error = %e, "step errored");
                } else {
                    warn!(task_id = %running.id, step = %step.name, "step timed out");
                }
                match step.on_error {
                    StepErrorBehaviour::Continue => {
                        running.pending_action_for.clear();
                        running.action_emitted = false;
                        let _ = inner.db.upsert(&running).await;
                    }
                    StepErrorBehaviour::Stop => {
                        running.task_state = TaskState::TaskFailed;
                        finish(&inner, &handler_like, &descriptor_id, running).await;
                        return;
                    }
                }
            }
        }
        inner.running_snapshot.write().await.insert(running.id, running.clone());
    }

    running.task_state = TaskState::TaskSucceeded;
    finish(&inner, &handler_like, &descriptor_id, running).await;
}

async fn finish(inner: &Arc<Inner>, handler: &TaskHandler, descriptor_id: &TaskDescriptorId, running: RunningTask) {
    let duration = chrono::Utc::now().signed_duration_since(running.started_at);
    let _ = inner.db.upsert(&running).await;
    inner.tasks.write().await.remove(&running.id);
    inner.running_snapshot.write().await.remove(&running.id);
    let _ = inner.db.remove(&running.id).await;
    inner
        .bus
        .emit_event(
            "task_end",
            json!({
                "task": descriptor_id.to_string(),
                "task_id": running.id.to_string(),
                "duration_ms": duration.num_milliseconds(),
            }),
        )
        .await;
    handler.on_task_terminal(descriptor_id).await;
}

async fn execute_step(inner: &Arc<Inner>, running: &mut RunningTask, step: &Step, cancel: &mut watch::Receiver<bool>) -> StepOutcome {
    // A zero timeout (e.g. a descriptor built programmatically without one)
    // falls back to the configured default rather than firing instantly.
    let step_timeout = if step.timeout.is_zero() { inner.config.default_step_timeout } else { step.timeout };
    match &step.action {
        StepAction::PerformAction { message_type } => perform_action(inner, running, step, message_type, step_timeout, cancel).await,
        StepAction::WaitForEvent { message_type, timeout } => {
            let timeout = if timeout.is_zero() { inner.config.default_step_timeout } else { *timeout };
            wait_for_event(inner, message_type, timeout, cancel).await
        }
        StepAction::EmitEvent { message_type, data } => {
            inner.bus.emit_event(message_type.clone(), data.clone()).await;
            StepOutcome::Completed
        }
        StepAction::ExecuteCommand { command_line } => execute_command(inner, command_line, step_timeout).await,
    }
}

async fn perform_action(
    inner: &Arc<Inner>,
    running: &mut RunningTask,
    step: &Step,
    message_type: &str,
    timeout: Duration,
    cancel: &mut watch::Receiver<bool>,
) -> StepOutcome {
    // Snapshot of subscribers taken exactly once, at emit time. If this step's Action was already emitted before a crash,
    // recovery resumes on the persisted `pending_action_for` instead of
    // re-snapshotting (which would pick up subscribers that registered
    // after the original emit, e.g. during crash-recovery).
    if !running.action_emitted {
        let pending: BTreeSet<SubscriberId> = inner
            .subscriptions
            .list_subscriber_for(message_type)
            .into_iter()
            .filter(|s| s.wait_for_completion)
            .map(|s| s.subscriber_id)
            .collect();
        running.pending_action_for = pending;
        running.action_emitted = true;
        let _ = inner.db.upsert(running).await;
        inner
            .bus
            .emit(Message::action(message_type, running.id, step.name.clone(), json!({})))
            .await;
    }

    if running.pending_action_for.is_empty() {
        return StepOutcome::Completed;
    }

    let mut sub = inner
        .bus
        .subscribe(SubscriberId::new(format!("task-handler-{}", running.id)), Some(vec![message_type.to_string()]))
        .await;
    let mut had_stop_error = None;

    let result = tokio::time::timeout(timeout, async {
        loop {
            tokio::select! {
                msg = sub.recv() => {
                    match msg {
                        Some(Message::ActionDone { task, step: s, subscriber_id, .. }) if task == running.id && s == step.name => {
                            running.pending_action_for.remove(&subscriber_id);
                            let _ = inner.db.upsert(running).await;
                            if running.pending_action_for.is_empty() {
                                return true;
                            }
                        }
                        Some(Message::ActionError { task, step: s, subscriber_id, error, .. }) if task == running.id && s == step.name => {
                            running.pending_action_for.remove(&subscriber_id);
                            if step.on_error == StepErrorBehaviour::Stop {
                                had_stop_error = Some(error);
                            }
                            let _ = inner.db.upsert(running).await;
                            if running.pending_action_for.is_empty() {
                                return true;
                            }
                        }
                        None => return false,
                        _ => {}
                    }
                }
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        return false;
                    }
                }
            }
        }
    })
    .await;

    if *cancel.borrow() {
        return StepOutcome::Cancelled;
    }
    match result {
        Ok(true) => {
            if let Some(error) = had_stop_error {
                StepOutcome::Errored(error)
            } else {
                StepOutcome::Completed
            }
        }
        Ok(false) => StepOutcome::Cancelled,
        Err(_elapsed) => StepOutcome::TimedOut,
    }
}

async fn wait_for_event(inner: &Arc<Inner>, message_type: &str, timeout: Duration, cancel: &mut watch::Receiver<bool>) -> StepOutcome {
    let mut sub = inner
        .bus
        .subscribe(SubscriberId::new("task-handler-wait"), Some(vec![message_type.to_string()]))
        .await;
    let result = tokio::time::timeout(timeout, async {
        loop {
            tokio::select! {
                msg = sub.recv() => {
                    if matches!(msg, Some(Message::Event { .. })) {
                        return true;
                    }
                    if msg.is_none() {
                        return false;
                    }
                }
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        return false;
                    }
                }
            }
        }
    })
    .await;
    if *cancel.borrow() {
        return StepOutcome::Cancelled;
    }
    match result {
        Ok(true) => StepOutcome::Completed,
        Ok(false) => StepOutcome::Cancelled,
        Err(_) => StepOutcome::TimedOut,
    }
}

async fn execute_command(inner: &Arc<Inner>, command_line: &str, timeout: Duration) -> StepOutcome {
    let executor = inner.command_executor.read().await.clone();
    let Some(executor) = executor else {
        return StepOutcome::Errored("no command executor installed".to_string());
    };
    match tokio::time::timeout(timeout, executor.execute(command_line)).await {
        Ok(Ok(())) => StepOutcome::Completed,
        Ok(Err(e)) => StepOutcome::Errored(e.to_string()),
        Err(_) => StepOutcome::TimedOut,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::running_task_db::FileRunningTaskDb;
    use orc_shared::model::{StepErrorBehaviour, Workflow};

    fn handler() -> (TaskHandler, MessageBus) {
        let bus = MessageBus::new(64);
        let subs = SubscriptionHandler::new(bus.clone());
        let db: SharedRunningTaskDb = Arc::new(FileRunningTaskDb::in_memory());
        (TaskHandler::new(bus.clone(), subs, db, TaskHandlerConfig::default()), bus)
    }

    fn test_workflow() -> TaskDescription {
        TaskDescription::Workflow(
            Workflow::new(
                "test_workflow",
                "Speakable name of workflow",
                vec![
                    Step::new("start", StepAction::PerformAction { message_type: "start_collect".into() }, Duration::from_secs(10)),
                    Step::new("act", StepAction::PerformAction { message_type: "collect".into() }, Duration::from_secs(10)),
                    Step::new("done", StepAction::PerformAction { message_type: "collect_done".into() }, Duration::from_secs(10))
                        .with_on_error(StepErrorBehaviour::Stop),
                ],
                vec![Trigger::EventTrigger { message_type: "start me up".into() }],
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn task_with_no_subscribers_runs_to_completion() {
        let (handler, bus) = handler();
        handler.register_descriptor(test_workflow()).await.unwrap();
        let mut events = bus.subscribe(SubscriberId::new("test"), None).await;

        let outcomes = handler.handle_event("start me up").await;
        assert_eq!(outcomes.len(), 1);

        let mut saw_started = false;
        let mut saw_end = false;
        for _ in 0..10 {
            match tokio::time::timeout(Duration::from_millis(200), events.recv()).await {
                Ok(Some(Message::Event { message_type, .. })) if message_type == "task_started" => saw_started = true,
                Ok(Some(Message::Event { message_type, .. })) if message_type == "task_end" => {
                    saw_end = true;
                    break;
                }
                _ => {}
            }
        }
        assert!(saw_started);
        assert!(saw_end);
    }

    #[tokio::test]
    async fn skip_surpass_reports_already_running() {
        let (handler, _bus) = handler();
        let wf = TaskDescription::Workflow(
            Workflow::new(
                "skip_wf",
                "Skip workflow",
                vec![Step::new(
                    "wait",
                    StepAction::WaitForEvent { message_type: "never".into(), timeout: Duration::from_secs(30) },
                    Duration::from_secs(30),
                )],
                vec![],
            )
            .unwrap()
            .with_on_surpass(TaskSurpassBehaviour::Skip),
        );
        handler.register_descriptor(wf).await.unwrap();
        let id = TaskDescriptorId::new("skip_wf");
        let first = handler.start_task(&id).await.unwrap();
        assert!(matches!(first, StartOutcome::Started(_)));
        let second = handler.start_task(&id).await.unwrap();
        assert!(matches!(second, StartOutcome::AlreadyRunning(_)));
    }

    #[tokio::test]
    async fn wait_surpass_queues_at_most_one_pending_start() {
        let (handler, _bus) = handler();
        let wf = TaskDescription::Workflow(
            Workflow::new(
                "wait_wf",
                "Wait workflow",
                vec![Step::new(
                    "wait",
                    StepAction::WaitForEvent { message_type: "never".into(), timeout: Duration::from_secs(30) },
                    Duration::from_secs(30),
                )],
                vec![],
            )
            .unwrap()
            .with_on_surpass(TaskSurpassBehaviour::Wait),
        );
        handler.register_descriptor(wf).await.unwrap();
        let id = TaskDescriptorId::new("wait_wf");
        let first = handler.start_task(&id).await.unwrap();
        assert!(matches!(first, StartOutcome::Started(_)));
        let second = handler.start_task(&id).await.unwrap();
        assert!(matches!(second, StartOutcome::Queued));
        let third = handler.start_task(&id).await.unwrap();
        assert!(matches!(third, StartOutcome::Queued));
        assert_eq!(handler.inner.pending_waits.lock().await.get(&id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn recovery_resumes_pending_actions_without_new_subscribers() {
        let bus = MessageBus::new(64);
        let subs = SubscriptionHandler::new(bus.clone());
        let db: SharedRunningTaskDb = Arc::new(FileRunningTaskDb::in_memory());

        subs.add_subscription(SubscriberId::new("sub_1"), "start_collect", true, Duration::from_secs(30))
            .await
            .unwrap();
        let sub1_collect = subs
            .add_subscription(SubscriberId::new("sub_1"), "collect", true, Duration::from_secs(30))
            .await
            .unwrap();
        let sub2_collect = subs
            .add_subscription(SubscriberId::new("sub_2"), "collect", true, Duration::from_secs(30))
            .await
            .unwrap();

        let handler1 = TaskHandler::new(bus.clone(), subs.clone(), db.clone(), TaskHandlerConfig::default());
        handler1.register_descriptor(test_workflow()).await.unwrap();
        let mut events = bus.subscribe(SubscriberId::new("watcher"), None).await;

        handler1.handle_event("start me up").await;

        // Ack `start_collect` from sub_1 so the task advances into `act`.
        let start_action = wait_for_action(&mut events, "start_collect").await;
        bus.emit(Message::action_done(
            "start_collect",
            start_action.0,
            start_action.1,
            sub1_collect.subscriber_id.clone(),
            json!({}),
        ))
        .await;

        // Reach the `collect` step and ack it from sub_1 only, then "crash".
        let collect_action = wait_for_action(&mut events, "collect").await;
        bus.emit(Message::action_done(
            "collect",
            collect_action.0,
            collect_action.1,
            sub1_collect.subscriber_id.clone(),
            json!({}),
        ))
        .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        handler1.shutdown().await;

        // sub_3 registers after the crash; it must not join the in-flight step.
        subs.add_subscription(SubscriberId::new("sub_3"), "collect", true, Duration::from_secs(30))
            .await
            .unwrap();

        let handler2 = TaskHandler::new(bus.clone(), subs.clone(), db.clone(), TaskHandlerConfig::default());
        handler2.register_descriptor(test_workflow()).await.unwrap();
        let recovered = handler2.recover().await.unwrap();
        assert_eq!(recovered, 1);
        // Let the respawned driving task reach its bus subscription before
        // the test emits the ack below (the bus has no redelivery).
        tokio::time::sleep(Duration::from_millis(20)).await;

        let pending_sub1 = handler2.list_all_pending_actions_for(&SubscriberId::new("sub_1")).await;
        assert!(pending_sub1.is_empty());
        let pending_sub2 = handler2.list_all_pending_actions_for(&sub2_collect.subscriber_id).await;
        assert_eq!(pending_sub2.len(), 1);
        let pending_sub3 = handler2.list_all_pending_actions_for(&SubscriberId::new("sub_3")).await;
        assert!(pending_sub3.is_empty());

        bus.emit(Message::action_done("collect", pending_sub2[0].0, pending_sub2[0].1.clone(), sub2_collect.subscriber_id.clone(), json!({})))
            .await;
        wait_for_task_end(&mut events).await;
        assert_eq!(handler2.task_count().await, 0);
    }

    async fn wait_for_action(events: &mut crate::bus::Subscription, message_type: &str) -> (TaskId, String) {
        loop {
            match tokio::time::timeout(Duration::from_secs(1), events.recv()).await {
                Ok(Some(Message::Action { message_type: mt, task, step, .. })) if mt == message_type => {
                    return (task, step);
                }
                Ok(Some(_)) => continue,
                _ => panic!("timed out waiting for action {message_type}"),
            }
        }
    }

    async fn wait_for_task_end(events: &mut crate::bus::Subscription) {
        loop {
            match tokio::time::timeout(Duration::from_secs(1), events.recv()).await {
                Ok(Some(Message::Event { message_type, .. })) if message_type == "task_end" => return,
                Ok(Some(_)) => continue,
                _ => panic!("timed out waiting for task_end"),
            }
        }
    }
}
