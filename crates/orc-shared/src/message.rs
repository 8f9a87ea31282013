//! The MessageBus wire model.
//!
//! `Message` is a tagged variant that round-trips through `serde_json`
//! without loss, including the recursive `Progress` tree carried by
//! `ActionProgress`.

use crate::ids::{SubscriberId, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A node in the recursive progress tree reported by `ActionProgress`.
///
/// Mirrors the Design Notes' `Leaf{name,done,total}` / `Node{name,parts[]}`
/// shape: a leaf reports concrete counts, a node aggregates its children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Progress {
    Leaf {
        name: String,
        done: u64,
        total: u64,
    },
    Node {
        name: String,
        parts: Vec<Progress>,
    },
}

impl Progress {
    pub fn leaf(name: impl Into<String>, done: u64, total: u64) -> Self {
        Progress::Leaf {
            name: name.into(),
            done,
            total,
        }
    }

    pub fn node(name: impl Into<String>, parts: Vec<Progress>) -> Self {
        Progress::Node {
            name: name.into(),
            parts,
        }
    }

    /// Bottom-up aggregate `(done, total)` for this node and all descendants.
    pub fn totals(&self) -> (u64, u64) {
        match self {
            Progress::Leaf { done, total, .. } => (*done, *total),
            Progress::Node { parts, .. } => parts.iter().fold((0, 0), |(d, t), p| {
                let (pd, pt) = p.totals();
                (d + pd, t + pt)
            }),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Progress::Leaf { name, .. } | Progress::Node { name, .. } => name,
        }
    }
}

/// A message flowing over the MessageBus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    Event {
        message_type: String,
        #[serde(default)]
        data: Value,
    },
    Action {
        message_type: String,
        task: TaskId,
        step: String,
        #[serde(default)]
        data: Value,
    },
    ActionDone {
        message_type: String,
        task: TaskId,
        step: String,
        subscriber_id: SubscriberId,
        #[serde(default)]
        data: Value,
    },
    ActionError {
        message_type: String,
        task: TaskId,
        step: String,
        subscriber_id: SubscriberId,
        error: String,
        #[serde(default)]
        data: Value,
    },
    ActionInfo {
        message_type: String,
        task: TaskId,
        step: String,
        subscriber_id: SubscriberId,
        level: String,
        message: String,
    },
    ActionProgress {
        message_type: String,
        task: TaskId,
        step: String,
        subscriber_id: SubscriberId,
        progress: Progress,
        at: DateTime<Utc>,
    },
}

impl Message {
    pub fn event(message_type: impl Into<String>, data: Value) -> Self {
        Message::Event {
            message_type: message_type.into(),
            data,
        }
    }

    pub fn action(message_type: impl Into<String>, task: TaskId, step: impl Into<String>, data: Value) -> Self {
        Message::Action {
            message_type: message_type.into(),
            task,
            step: step.into(),
            data,
        }
    }

    pub fn action_done(
        message_type: impl Into<String>,
        task: TaskId,
        step: impl Into<String>,
        subscriber_id: SubscriberId,
        data: Value,
    ) -> Self {
        Message::ActionDone {
            message_type: message_type.into(),
            task,
            step: step.into(),
            subscriber_id,
            data,
        }
    }

    pub fn action_error(
        message_type: impl Into<String>,
        task: TaskId,
        step: impl Into<String>,
        subscriber_id: SubscriberId,
        error: impl Into<String>,
        data: Value,
    ) -> Self {
        Message::ActionError {
            message_type: message_type.into(),
            task,
            step: step.into(),
            subscriber_id,
            error: error.into(),
            data,
        }
    }

    /// The `message_type` discriminant every variant carries; used by the
    /// bus for per-subscriber filtering and by TaskHandler to match acks to steps.
    pub fn message_type(&self) -> &str {
        match self {
            Message::Event { message_type, .. }
            | Message::Action { message_type, .. }
            | Message::ActionDone { message_type, .. }
            | Message::ActionError { message_type, .. }
            | Message::ActionInfo { message_type, .. }
            | Message::ActionProgress { message_type, .. } => message_type,
        }
    }

    /// `(task_id, step_name)` for messages that belong to a running step;
    /// `None` for bare Events, which carry no task affinity.
    pub fn task_step(&self) -> Option<(TaskId, &str)> {
        match self {
            Message::Action { task, step, .. }
            | Message::ActionDone { task, step, .. }
            | Message::ActionError { task, step, .. }
            | Message::ActionInfo { task, step, .. }
            | Message::ActionProgress { task, step, .. } => Some((*task, step.as_str())),
            Message::Event { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn roundtrip(m: &Message) {
        let js = serde_json::to_value(m).unwrap();
        let back: Message = serde_json::from_value(js).unwrap();
        assert_eq!(serde_json::to_value(&back).unwrap(), serde_json::to_value(m).unwrap());
    }

    #[test]
    fn every_variant_round_trips() {
        let task = TaskId::fresh();
        let sub = SubscriberId::new("sub");
        roundtrip(&Message::event("test", json!({"a": "b", "c": 1})));
        roundtrip(&Message::action("test", task, "step_name", json!({})));
        roundtrip(&Message::action("test", task, "step_name", json!({"test": 1})));
        roundtrip(&Message::action_done("test", task, "step_name", sub.clone(), json!({})));
        roundtrip(&Message::action_error(
            "test",
            task,
            "step_name",
            sub.clone(),
            "oops",
            json!({"test": 23}),
        ));
        roundtrip(&Message::ActionInfo {
            message_type: "test".into(),
            task,
            step: "step_name".into(),
            subscriber_id: sub.clone(),
            level: "error".into(),
            message: "Error message".into(),
        });
    }

    #[test]
    fn nested_progress_tree_round_trips() {
        let task = TaskId::fresh();
        let sub = SubscriberId::new("sub");
        let nested = Progress::node("account1", vec![Progress::leaf("region", 1, 2)]);
        let pg = Message::ActionProgress {
            message_type: "test".into(),
            task,
            step: "step_name".into(),
            subscriber_id: sub,
            progress: nested,
            at: Utc::now(),
        };
        roundtrip(&pg);
    }

    #[test]
    fn progress_totals_aggregate_bottom_up() {
        let tree = Progress::node(
            "root",
            vec![
                Progress::leaf("a", 1, 2),
                Progress::node("b", vec![Progress::leaf("c", 3, 5), Progress::leaf("d", 0, 1)]),
            ],
        );
        assert_eq!(tree.totals(), (4, 8));
    }

    #[test]
    fn wire_shape_matches_spec() {
        let task = TaskId::fresh();
        let m = Message::event("subscriber-changed", json!({}));
        let js = serde_json::to_value(&m).unwrap();
        assert_eq!(js["kind"], json!("event"));
        assert_eq!(js["message_type"], json!("subscriber-changed"));

        let m = Message::action("collect", task, "act", json!({}));
        let js = serde_json::to_value(&m).unwrap();
        assert_eq!(js["kind"], json!("action"));
        assert_eq!(js["step"], json!("act"));
    }

    #[test]
    fn message_type_accessor_covers_every_variant() {
        let task = TaskId::fresh();
        let sub = SubscriberId::new("sub");
        assert_eq!(Message::event("foo", json!(null)).message_type(), "foo");
        assert_eq!(Message::action("foo", task, "s", json!(null)).message_type(), "foo");
        assert_eq!(
            Message::action_done("foo", task, "s", sub.clone(), json!(null)).message_type(),
            "foo"
        );
    }

    #[test]
    fn task_step_is_none_for_events() {
        assert!(Message::event("foo", json!(null)).task_step().is_none());
        let task = TaskId::fresh();
        assert!(Message::action("foo", task, "s", json!(null)).task_step().is_some());
    }
}
