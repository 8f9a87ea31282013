//! Builds a fully wired `CliContext` for unit tests elsewhere in this
//! crate — no network, no real worker processes, just the in-memory
//! collaborators every stage needs to resolve at execute-time.

use crate::context::CliContext;
use orc_engine::running_task_db::FileRunningTaskDb;
use orc_engine::{MessageBus, SubscriptionHandler, TaskHandler, TaskHandlerConfig, WorkerTaskQueue};
use orc_shared::retry::Backoff;
use std::sync::Arc;
use std::time::Duration;

pub fn test_context() -> CliContext {
    let bus = MessageBus::new(64);
    let subscriptions = SubscriptionHandler::new(bus.clone());
    let db = Arc::new(FileRunningTaskDb::in_memory());
    let task_handler = TaskHandler::new(bus.clone(), subscriptions.clone(), db, TaskHandlerConfig::default());
    let worker_queue = WorkerTaskQueue::new(Backoff::new(Duration::from_millis(1), 3));
    CliContext::new(bus, subscriptions, task_handler, worker_queue)
}
