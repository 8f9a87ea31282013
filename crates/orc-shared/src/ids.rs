//! Opaque, comparable, stringly-printable handles.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

macro_rules! string_id {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(SubscriberId, "Identifies an external subscriber registered with the SubscriptionHandler.");
string_id!(TaskDescriptorId, "Identifies a static Workflow or Job descriptor.");
string_id!(WorkerId, "Identifies an attached worker session on the WorkerTaskQueue.");

/// Identifies one running task instance. Freshly minted for every start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Generate a fresh, time-sortable task id.
    pub fn fresh() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

static WORKER_TASK_SEQ: AtomicU64 = AtomicU64::new(0);

/// Identifies one discrete unit of WorkerTaskQueue work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct WorkerTaskId(pub String);

impl WorkerTaskId {
    pub fn fresh() -> Self {
        let n = WORKER_TASK_SEQ.fetch_add(1, Ordering::Relaxed);
        Self(format!("wt-{}-{}", Uuid::new_v4(), n))
    }
}

impl fmt::Display for WorkerTaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscriber_id_displays_inner_string() {
        let id = SubscriberId::new("sub_1");
        assert_eq!(id.to_string(), "sub_1");
        assert_eq!(id.as_str(), "sub_1");
    }

    #[test]
    fn task_id_fresh_ids_are_unique() {
        assert_ne!(TaskId::fresh(), TaskId::fresh());
    }

    #[test]
    fn ids_round_trip_through_json() {
        let id = WorkerId::new("worker-a");
        let js = serde_json::to_value(&id).unwrap();
        assert_eq!(js, serde_json::json!("worker-a"));
        let back: WorkerId = serde_json::from_value(js).unwrap();
        assert_eq!(back, id);
    }
}
