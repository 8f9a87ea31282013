//! The static task-description model: Subscription, Step, Trigger,
//! TaskDescription (Workflow/Job), and the RunningTask state machine.

use crate::error::{TaskerError, TaskerResult};
use crate::ids::{SubscriberId, TaskDescriptorId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use std::time::Duration;

/// `(subscriber_id, message_type, wait_for_completion, timeout)`.
/// Invariant: `timeout > 0`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub subscriber_id: SubscriberId,
    pub message_type: String,
    pub wait_for_completion: bool,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
}

impl Subscription {
    pub fn new(
        subscriber_id: SubscriberId,
        message_type: impl Into<String>,
        wait_for_completion: bool,
        timeout: Duration,
    ) -> TaskerResult<Self> {
        if timeout.is_zero() {
            return Err(TaskerError::Internal(
                "subscription timeout must be > 0".into(),
            ));
        }
        Ok(Self {
            subscriber_id,
            message_type: message_type.into(),
            wait_for_completion,
            timeout,
        })
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        d.as_secs_f64().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs))
    }
}

/// An external agent with an ordered set of Subscriptions keyed by
/// `message_type` (unique per subscriber).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: SubscriberId,
    /// Insertion-ordered; iteration order is the registration order.
    subscriptions: BTreeMap<String, Subscription>,
    /// Secondary counter so `list_subscriber_for` can return registration order.
    order: Vec<String>,
    /// Position of this subscriber's first registration among all
    /// subscribers ever seen by its `SubscriptionHandler`; used to order
    /// `list_subscriber_for` results across subscribers, not just within one.
    registration_seq: u64,
}

impl Subscriber {
    pub fn new(id: SubscriberId, registration_seq: u64) -> Self {
        Self {
            id,
            subscriptions: BTreeMap::new(),
            order: Vec::new(),
            registration_seq,
        }
    }

    pub fn registration_seq(&self) -> u64 {
        self.registration_seq
    }

    pub fn upsert(&mut self, sub: Subscription) {
        if !self.subscriptions.contains_key(&sub.message_type) {
            self.order.push(sub.message_type.clone());
        }
        self.subscriptions.insert(sub.message_type.clone(), sub);
    }

    pub fn remove(&mut self, message_type: &str) {
        if self.subscriptions.remove(message_type).is_some() {
            self.order.retain(|m| m != message_type);
        }
    }

    pub fn get(&self, message_type: &str) -> Option<&Subscription> {
        self.subscriptions.get(message_type)
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}

/// What to do when a step's acknowledgement fails or times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepErrorBehaviour {
    Continue,
    Stop,
}

/// The demand a Step issues.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepAction {
    PerformAction { message_type: String },
    ExecuteCommand { command_line: String },
    WaitForEvent { message_type: String, #[serde(with = "duration_secs")] timeout: Duration },
    EmitEvent { message_type: String, #[serde(default)] data: Value },
}

/// One phase of a workflow. Invariant: step names unique
/// per descriptor (enforced by `Workflow::new`/`Job::new`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub action: StepAction,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    pub on_error: StepErrorBehaviour,
}

impl Step {
    pub fn new(name: impl Into<String>, action: StepAction, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            action,
            timeout,
            on_error: StepErrorBehaviour::Continue,
        }
    }

    pub fn with_on_error(mut self, on_error: StepErrorBehaviour) -> Self {
        self.on_error = on_error;
        self
    }
}

/// A wrapped, pre-validated cron expression.
///
/// Accepts both the 5-field POSIX form (`"23 1 * * *"`, as used by `jobs add
/// --schedule`) and the 6-field seconds-first form the underlying `cron`
/// crate expects natively; a 5-field expression is widened by prefixing a
/// `"0"` seconds field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronExpr {
    pub raw: String,
    #[serde(skip)]
    normalized: String,
}

impl CronExpr {
    pub fn parse(raw: impl Into<String>) -> TaskerResult<Self> {
        let raw = raw.into();
        let normalized = Self::normalize(&raw);
        cron::Schedule::from_str(&normalized)
            .map_err(|e| TaskerError::ParseError(format!("invalid cron expression '{raw}': {e}")))?;
        Ok(Self { raw, normalized })
    }

    fn normalize(raw: &str) -> String {
        let fields = raw.split_whitespace().count();
        if fields == 5 {
            format!("0 {raw}")
        } else {
            raw.to_string()
        }
    }

    pub fn schedule(&self) -> cron::Schedule {
        cron::Schedule::from_str(&self.normalized).expect("validated at construction")
    }
}

impl PartialEq for CronExpr {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

/// Trigger variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    EventTrigger { message_type: String },
    TimeTrigger { cron: CronExpr },
}

/// What to do when a descriptor is triggered while already running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TaskSurpassBehaviour {
    Skip,
    #[default]
    Replace,
    Wait,
    Parallel,
}

/// A Workflow descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: TaskDescriptorId,
    pub name: String,
    pub steps: Vec<Step>,
    pub triggers: Vec<Trigger>,
    pub on_surpass: TaskSurpassBehaviour,
}

impl Workflow {
    pub fn new(
        id: impl Into<TaskDescriptorId>,
        name: impl Into<String>,
        steps: Vec<Step>,
        triggers: Vec<Trigger>,
    ) -> TaskerResult<Self> {
        let wf = Self {
            id: id.into(),
            name: name.into(),
            steps,
            triggers,
            on_surpass: TaskSurpassBehaviour::default(),
        };
        wf.validate()?;
        Ok(wf)
    }

    pub fn with_on_surpass(mut self, on_surpass: TaskSurpassBehaviour) -> Self {
        self.on_surpass = on_surpass;
        self
    }

    fn validate(&self) -> TaskerResult<()> {
        validate_step_names(&self.steps)?;
        if self.steps.is_empty() {
            return Err(TaskerError::ParseError(format!(
                "workflow '{}' must have at least one terminal step",
                self.id
            )));
        }
        Ok(())
    }
}

fn validate_step_names(steps: &[Step]) -> TaskerResult<()> {
    let mut seen = BTreeSet::new();
    for s in steps {
        if !seen.insert(s.name.clone()) {
            return Err(TaskerError::ParseError(format!(
                "duplicate step name '{}'",
                s.name
            )));
        }
    }
    Ok(())
}

/// A one-shot Job descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: TaskDescriptorId,
    pub command: String,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    pub trigger: Option<Trigger>,
    #[serde(default)]
    pub wait_for_event: Option<(String, Duration)>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

impl Job {
    pub fn new(id: impl Into<TaskDescriptorId>, command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            timeout,
            trigger: None,
            wait_for_event: None,
            environment: BTreeMap::new(),
            active: true,
        }
    }

    /// The Job re-expressed as a single-step Workflow, since TaskHandler
    /// drives both through the same step state machine.
    pub fn as_single_step(&self) -> TaskerResult<Workflow> {
        let step = Step::new(
            "run",
            StepAction::ExecuteCommand {
                command_line: self.command.clone(),
            },
            self.timeout,
        )
        .with_on_error(StepErrorBehaviour::Stop);
        let triggers = self.trigger.clone().into_iter().collect();
        Workflow::new(self.id.clone(), self.id.to_string(), vec![step], triggers)
    }
}

/// Either form of TaskDescription.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskDescription {
    Workflow(Workflow),
    Job(Job),
}

impl TaskDescription {
    pub fn id(&self) -> &TaskDescriptorId {
        match self {
            TaskDescription::Workflow(w) => &w.id,
            TaskDescription::Job(j) => &j.id,
        }
    }

    pub fn name(&self) -> String {
        match self {
            TaskDescription::Workflow(w) => w.name.clone(),
            TaskDescription::Job(j) => j.id.to_string(),
        }
    }

    pub fn on_surpass(&self) -> TaskSurpassBehaviour {
        match self {
            TaskDescription::Workflow(w) => w.on_surpass,
            TaskDescription::Job(_) => TaskSurpassBehaviour::Parallel,
        }
    }

    /// Expand to the step sequence TaskHandler actually drives.
    pub fn steps(&self) -> TaskerResult<Vec<Step>> {
        match self {
            TaskDescription::Workflow(w) => Ok(w.steps.clone()),
            TaskDescription::Job(j) => Ok(j.as_single_step()?.steps),
        }
    }

    pub fn triggers(&self) -> Vec<Trigger> {
        match self {
            TaskDescription::Workflow(w) => w.triggers.clone(),
            TaskDescription::Job(j) => j.trigger.clone().into_iter().collect(),
        }
    }
}

/// Per-step state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepState {
    Waiting,
    Active,
    Done,
    Errored,
}

/// Terminal task state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Running,
    TaskSucceeded,
    TaskFailed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_rejects_zero_timeout() {
        let res = Subscription::new(SubscriberId::new("s"), "m", true, Duration::ZERO);
        assert!(res.is_err());
    }

    #[test]
    fn subscriber_preserves_insertion_order() {
        let mut sub = Subscriber::new(SubscriberId::new("s"), 0);
        sub.upsert(Subscription::new(SubscriberId::new("s"), "b", true, Duration::from_secs(1)).unwrap());
        sub.upsert(Subscription::new(SubscriberId::new("s"), "a", true, Duration::from_secs(1)).unwrap());
        assert_eq!(sub.order, vec!["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn workflow_rejects_duplicate_step_names() {
        let steps = vec![
            Step::new("s", StepAction::EmitEvent { message_type: "x".into(), data: Value::Null }, Duration::from_secs(1)),
            Step::new("s", StepAction::EmitEvent { message_type: "y".into(), data: Value::Null }, Duration::from_secs(1)),
        ];
        let res = Workflow::new("wf", "Workflow", steps, vec![]);
        assert!(res.is_err());
    }

    #[test]
    fn workflow_requires_at_least_one_step() {
        let res = Workflow::new("wf", "Workflow", vec![], vec![]);
        assert!(res.is_err());
    }

    #[test]
    fn cron_expr_parses_five_and_six_field_forms() {
        assert!(CronExpr::parse("23 1 * * *").is_ok());
        assert!(CronExpr::parse("1 1 1 1 1").is_ok());
        assert!(CronExpr::parse("not a cron").is_err());
    }

    #[test]
    fn job_expands_to_single_stop_on_error_step() {
        let job = Job::new("hello", "echo Hello World", Duration::from_secs(30));
        let wf = job.as_single_step().unwrap();
        assert_eq!(wf.steps.len(), 1);
        assert_eq!(wf.steps[0].on_error, StepErrorBehaviour::Stop);
    }
}
