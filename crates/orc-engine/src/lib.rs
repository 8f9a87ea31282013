//! MessageBus, SubscriptionHandler, WorkerTaskQueue, TaskHandler, and the
//! cron Scheduler — the workflow/job engine.

pub mod bus;
pub mod running_task_db;
pub mod scheduler;
pub mod subscriptions;
pub mod task_handler;
pub mod worker_queue;

pub use bus::MessageBus;
pub use subscriptions::SubscriptionHandler;
pub use task_handler::{TaskHandler, TaskHandlerConfig};
pub use worker_queue::{WorkerSession, WorkerTask, WorkerTaskQueue};
