//! Source stages: produce the initial stream, no upstream input.

use crate::context::{ChangeLogFilter, CliContext};
use crate::lexer::StageTokens;
use crate::stage::{SourceStage, ValueSender};
use crate::stages::emit_all;
use orc_engine::task_handler::StartOutcome;
use orc_shared::ids::TaskDescriptorId;
use orc_shared::model::{CronExpr, Job, TaskDescription, Trigger};
use orc_shared::{TaskerError, TaskerResult};
use serde_json::{json, Value};
use std::time::Duration;

pub struct Echo {
    pub text: String,
}

#[async_trait::async_trait]
impl SourceStage for Echo {
    async fn produce(&self, tx: ValueSender, _ctx: &CliContext) -> TaskerResult<()> {
        let _ = tx.send(Value::String(self.text.clone())).await;
        Ok(())
    }
}

/// `json <literal>`: parses a JSON literal and streams it — an array is
/// unrolled element-by-element, anything else is a single item.
pub struct Json {
    pub literal: String,
}

impl Json {
    pub fn compile(args: &[String]) -> TaskerResult<Self> {
        if args.is_empty() {
            return Err(TaskerError::ParseError("json requires a JSON literal argument".into()));
        }
        Ok(Self { literal: args.join(" ") })
    }
}

#[async_trait::async_trait]
impl SourceStage for Json {
    async fn produce(&self, tx: ValueSender, _ctx: &CliContext) -> TaskerResult<()> {
        let value: Value = serde_json::from_str(&self.literal)
            .map_err(|e| TaskerError::ParseError(format!("json: invalid literal '{}': {e}", self.literal)))?;
        match value {
            Value::Array(items) => emit_all(&tx, items).await,
            other => emit_all(&tx, [other]).await,
        }
        Ok(())
    }
}

/// `search <query>`: streams matching nodes from the graph collaborator.
pub struct Search {
    pub query: String,
}

impl Search {
    pub fn compile(args: &[String]) -> TaskerResult<Self> {
        if args.is_empty() {
            return Err(TaskerError::ParseError("search requires a query".into()));
        }
        Ok(Self { query: args.join(" ") })
    }
}

#[async_trait::async_trait]
impl SourceStage for Search {
    async fn produce(&self, tx: ValueSender, ctx: &CliContext) -> TaskerResult<()> {
        let results = ctx.graph.search(&self.query).await?;
        emit_all(&tx, results).await;
        Ok(())
    }
}

/// `sleep <seconds>`: emits nothing, just delays the pipeline (useful for
/// exercising the worker queue's TTL reaping from the REPL).
pub struct Sleep {
    pub duration: Duration,
}

impl Sleep {
    pub fn compile(args: &[String]) -> TaskerResult<Self> {
        let secs: f64 = args
            .first()
            .ok_or_else(|| TaskerError::ParseError("sleep requires a duration in seconds".into()))?
            .parse()
            .map_err(|_| TaskerError::ParseError("sleep: duration must be a number".into()))?;
        Ok(Self { duration: Duration::from_secs_f64(secs.max(0.0)) })
    }
}

#[async_trait::async_trait]
impl SourceStage for Sleep {
    async fn produce(&self, _tx: ValueSender, _ctx: &CliContext) -> TaskerResult<()> {
        tokio::time::sleep(self.duration).await;
        Ok(())
    }
}

fn task_to_value(descriptor: &TaskDescription) -> Value {
    serde_json::to_value(descriptor).unwrap_or(Value::Null)
}

/// Renders a `start_task` outcome as the user-facing line, not `StartOutcome`'s
/// `Debug` form.
fn render_start_outcome(descriptor_id: &TaskDescriptorId, outcome: &StartOutcome) -> String {
    match outcome {
        StartOutcome::Started(task_id) => format!("Workflow {descriptor_id} started with id {task_id}"),
        StartOutcome::AlreadyRunning(task_id) => format!("Workflow {descriptor_id} already running with id {task_id}"),
        StartOutcome::Queued => format!("Workflow {descriptor_id} queued behind a running instance"),
    }
}

/// `workflows list|show|run|running|history|log`.
pub struct Workflows {
    pub subcommand: String,
    pub args: Vec<String>,
}

impl Workflows {
    pub fn compile(tokens: &StageTokens) -> TaskerResult<Self> {
        let Some((sub, rest)) = tokens.args.split_first() else {
            return Err(TaskerError::ParseError("workflows requires a subcommand".into()));
        };
        const VALID: &[&str] = &["list", "show", "run", "running", "history", "log"];
        if !VALID.contains(&sub.as_str()) {
            return Err(TaskerError::ParseError(format!("workflows: unknown subcommand '{sub}'")));
        }
        Ok(Self { subcommand: sub.clone(), args: rest.to_vec() })
    }
}

#[async_trait::async_trait]
impl SourceStage for Workflows {
    async fn produce(&self, tx: ValueSender, ctx: &CliContext) -> TaskerResult<()> {
        match self.subcommand.as_str() {
            "list" => {
                let items = ctx.task_handler.list_descriptors().await;
                let values: Vec<Value> = items.iter().map(task_to_value).collect();
                emit_all(&tx, values).await;
            }
            "show" => {
                let id = arg_id(&self.args, "workflows show")?;
                let descriptor = ctx
                    .task_handler
                    .descriptor(&id)
                    .await
                    .ok_or_else(|| TaskerError::NotFound(format!("workflow '{id}'")))?;
                let _ = tx.send(task_to_value(&descriptor)).await;
            }
            "run" => {
                let id = arg_id(&self.args, "workflows run")?;
                let outcome = ctx.task_handler.start_task(&id).await?;
                let _ = tx.send(Value::String(render_start_outcome(&id, &outcome))).await;
            }
            "running" => {
                let id = arg_id(&self.args, "workflows running")?;
                let instances = ctx.task_handler.running_instances_for(&id).await;
                let values: Vec<Value> = instances.iter().map(|i| json!({ "task_id": i.to_string() })).collect();
                emit_all(&tx, values).await;
            }
            "history" => {
                let filter = parse_history_filter(&self.args)?;
                let records = ctx.history.query(&filter).await;
                let values: Vec<Value> = records.iter().map(|r| serde_json::to_value(r).unwrap_or(Value::Null)).collect();
                emit_all(&tx, values).await;
            }
            "log" => {
                let tasks = ctx.task_handler.running_tasks().await;
                let values: Vec<Value> = tasks.iter().map(|t| json!({
                    "task_id": t.id.to_string(),
                    "descriptor_id": t.descriptor_id.to_string(),
                    "started_at": t.started_at,
                    "state": format!("{:?}", t.task_state),
                })).collect();
                emit_all(&tx, values).await;
            }
            other => return Err(TaskerError::Internal(format!("workflows: unhandled subcommand '{other}'"))),
        }
        Ok(())
    }
}

fn arg_id(args: &[String], context: &str) -> TaskerResult<TaskDescriptorId> {
    args.first()
        .map(TaskDescriptorId::new)
        .ok_or_else(|| TaskerError::ParseError(format!("{context} requires a workflow id")))
}

/// `jobs add|list|show|activate|deactivate|delete|run|running`.
pub struct Jobs {
    pub subcommand: String,
    pub args: Vec<String>,
}

impl Jobs {
    pub fn compile(tokens: &StageTokens) -> TaskerResult<Self> {
        let Some((sub, rest)) = tokens.args.split_first() else {
            return Err(TaskerError::ParseError("jobs requires a subcommand".into()));
        };
        const VALID: &[&str] = &["add", "list", "show", "activate", "deactivate", "delete", "run", "running"];
        if !VALID.contains(&sub.as_str()) {
            return Err(TaskerError::ParseError(format!("jobs: unknown subcommand '{sub}'")));
        }
        Ok(Self { subcommand: sub.clone(), args: rest.to_vec() })
    }
}

/// Accepts both `jobs add <id> <command...>` and `jobs add --id <id>
/// [--schedule <cron>] <command...>`; the id may come from either the
/// first positional or `--id`, never both.
fn parse_jobs_add_args(args: &[String]) -> TaskerResult<(String, Option<String>, String)> {
    let mut id: Option<String> = None;
    let mut schedule: Option<String> = None;
    let mut rest: Vec<String> = Vec::new();
    let mut iter = args.iter().cloned();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--id" => id = Some(iter.next().ok_or_else(|| TaskerError::ParseError("jobs add --id requires a value".into()))?),
            "--schedule" => {
                schedule = Some(iter.next().ok_or_else(|| TaskerError::ParseError("jobs add --schedule requires a value".into()))?)
            }
            _ => rest.push(arg),
        }
    }
    let id = match id {
        Some(id) => id,
        None if !rest.is_empty() => rest.remove(0),
        None => return Err(TaskerError::ParseError("jobs add requires an id".into())),
    };
    let command = rest.join(" ");
    if command.is_empty() {
        return Err(TaskerError::ParseError("jobs add requires a command line".into()));
    }
    Ok((id, schedule, command))
}

#[async_trait::async_trait]
impl SourceStage for Jobs {
    async fn produce(&self, tx: ValueSender, ctx: &CliContext) -> TaskerResult<()> {
        match self.subcommand.as_str() {
            "add" => {
                let (id, schedule, command) = parse_jobs_add_args(&self.args)?;
                let mut job = Job::new(TaskDescriptorId::new(&id), command, Duration::from_secs(30));
                if let Some(cron) = schedule {
                    job.trigger = Some(Trigger::TimeTrigger { cron: CronExpr::parse(cron)? });
                }
                job.environment.insert("graph".to_string(), "ns".to_string());
                job.environment.insert("section".to_string(), ctx.section.clone());
                let descriptor = TaskDescription::Job(job);
                ctx.task_handler.register_descriptor(descriptor.clone()).await?;
                ctx.jobs.add(crate::context::JobRecord { descriptor: descriptor.clone(), active: true }).await;
                let _ = tx.send(Value::String(format!("Job {id} added."))).await;
            }
            "list" => {
                let records = ctx.jobs.list().await;
                let values: Vec<Value> = records.iter().map(|r| json!({ "descriptor": task_to_value(&r.descriptor), "active": r.active })).collect();
                emit_all(&tx, values).await;
            }
            "show" => {
                let id = self.args.first().cloned().ok_or_else(|| TaskerError::ParseError("jobs show requires an id".into()))?;
                let record = ctx.jobs.get(&id).await.ok_or_else(|| TaskerError::NotFound(format!("job '{id}'")))?;
                let _ = tx.send(json!({ "descriptor": task_to_value(&record.descriptor), "active": record.active })).await;
            }
            "activate" => {
                set_job_active(ctx, &self.args, true).await?;
            }
            "deactivate" => {
                set_job_active(ctx, &self.args, false).await?;
            }
            "delete" => {
                let id = self.args.first().ok_or_else(|| TaskerError::ParseError("jobs delete requires an id".into()))?;
                ctx.jobs.remove(id).await?;
            }
            "run" => {
                let id = self.args.first().ok_or_else(|| TaskerError::ParseError("jobs run requires an id".into()))?;
                let descriptor_id = TaskDescriptorId::new(id);
                let outcome = ctx.task_handler.start_task(&descriptor_id).await?;
                let _ = tx.send(Value::String(render_start_outcome(&descriptor_id, &outcome))).await;
            }
            "running" => {
                let id = self.args.first().ok_or_else(|| TaskerError::ParseError("jobs running requires an id".into()))?;
                let instances = ctx.task_handler.running_instances_for(&TaskDescriptorId::new(id)).await;
                let values: Vec<Value> = instances.iter().map(|i| json!({ "task_id": i.to_string() })).collect();
                emit_all(&tx, values).await;
            }
            other => return Err(TaskerError::Internal(format!("jobs: unhandled subcommand '{other}'"))),
        }
        Ok(())
    }
}

async fn set_job_active(ctx: &CliContext, args: &[String], active: bool) -> TaskerResult<()> {
    let id = args.first().ok_or_else(|| TaskerError::ParseError("jobs activate/deactivate requires an id".into()))?;
    ctx.jobs.set_active(id, active).await
}

/// `templates test|add|list|show|delete`.
pub struct Templates {
    pub subcommand: String,
    pub args: Vec<String>,
}

impl Templates {
    pub fn compile(tokens: &StageTokens) -> TaskerResult<Self> {
        let Some((sub, rest)) = tokens.args.split_first() else {
            return Err(TaskerError::ParseError("templates requires a subcommand".into()));
        };
        const VALID: &[&str] = &["test", "add", "list", "show", "delete"];
        if !VALID.contains(&sub.as_str()) {
            return Err(TaskerError::ParseError(format!("templates: unknown subcommand '{sub}'")));
        }
        Ok(Self { subcommand: sub.clone(), args: rest.to_vec() })
    }
}

#[async_trait::async_trait]
impl SourceStage for Templates {
    async fn produce(&self, tx: ValueSender, ctx: &CliContext) -> TaskerResult<()> {
        match self.subcommand.as_str() {
            "add" => {
                let name = self.args.first().cloned().ok_or_else(|| TaskerError::ParseError("templates add requires a name".into()))?;
                let body = self.args.get(1..).map(|s| s.join(" ")).unwrap_or_default();
                ctx.templates.add(&name, &body).await;
                let _ = tx.send(json!({ "name": name })).await;
            }
            "test" => {
                let body = self.args.join(" ");
                let rendered = orc_grammar::format_template(&body, &Value::Null);
                let _ = tx.send(Value::String(rendered)).await;
            }
            "list" => {
                let names = ctx.templates.list().await;
                emit_all(&tx, names.into_iter().map(Value::String)).await;
            }
            "show" => {
                let name = self.args.first().ok_or_else(|| TaskerError::ParseError("templates show requires a name".into()))?;
                let body = ctx.templates.get(name).await.ok_or_else(|| TaskerError::NotFound(format!("template '{name}'")))?;
                let _ = tx.send(Value::String(body)).await;
            }
            "delete" => {
                let name = self.args.first().ok_or_else(|| TaskerError::ParseError("templates delete requires a name".into()))?;
                ctx.templates.remove(name).await?;
            }
            other => return Err(TaskerError::Internal(format!("templates: unhandled subcommand '{other}'"))),
        }
        Ok(())
    }
}

/// `configs set|show|list|edit|update`.
pub struct Configs {
    pub subcommand: String,
    pub args: Vec<String>,
}

impl Configs {
    pub fn compile(tokens: &StageTokens) -> TaskerResult<Self> {
        let Some((sub, rest)) = tokens.args.split_first() else {
            return Err(TaskerError::ParseError("configs requires a subcommand".into()));
        };
        const VALID: &[&str] = &["set", "show", "list", "edit", "update"];
        if !VALID.contains(&sub.as_str()) {
            return Err(TaskerError::ParseError(format!("configs: unknown subcommand '{sub}'")));
        }
        Ok(Self { subcommand: sub.clone(), args: rest.to_vec() })
    }
}

#[async_trait::async_trait]
impl SourceStage for Configs {
    async fn produce(&self, tx: ValueSender, ctx: &CliContext) -> TaskerResult<()> {
        match self.subcommand.as_str() {
            "set" | "edit" | "update" => {
                let name = self.args.first().cloned().ok_or_else(|| TaskerError::ParseError("configs requires a name".into()))?;
                let raw = self.args.get(1..).map(|s| s.join(" ")).unwrap_or_default();
                let value: Value = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
                ctx.configs.set(&name, value.clone()).await;
                let _ = tx.send(json!({ "name": name, "value": value })).await;
            }
            "list" => {
                let names = ctx.configs.list().await;
                emit_all(&tx, names.into_iter().map(Value::String)).await;
            }
            "show" => {
                let name = self.args.first().ok_or_else(|| TaskerError::ParseError("configs show requires a name".into()))?;
                let value = ctx.configs.get(name).await.ok_or_else(|| TaskerError::NotFound(format!("config '{name}'")))?;
                let _ = tx.send(value).await;
            }
            other => return Err(TaskerError::Internal(format!("configs: unhandled subcommand '{other}'"))),
        }
        Ok(())
    }
}

/// `system backup create|restore`, `system info`.
pub struct System {
    pub subcommand: String,
    pub args: Vec<String>,
}

impl System {
    pub fn compile(tokens: &StageTokens) -> TaskerResult<Self> {
        let Some((sub, rest)) = tokens.args.split_first() else {
            return Err(TaskerError::ParseError("system requires a subcommand".into()));
        };
        if sub != "backup" && sub != "info" {
            return Err(TaskerError::ParseError(format!("system: unknown subcommand '{sub}'")));
        }
        Ok(Self { subcommand: sub.clone(), args: rest.to_vec() })
    }
}

#[async_trait::async_trait]
impl SourceStage for System {
    async fn produce(&self, tx: ValueSender, ctx: &CliContext) -> TaskerResult<()> {
        match self.subcommand.as_str() {
            "info" => {
                let _ = tx
                    .send(json!({
                        "descriptors": ctx.task_handler.list_descriptors().await.len(),
                        "running_tasks": ctx.task_handler.task_count().await,
                        "worker_queue_depth": ctx.worker_queue.queue_depth().await,
                    }))
                    .await;
            }
            "backup" => {
                let action = self.args.first().map(String::as_str).unwrap_or("");
                match action {
                    "create" => {
                        let descriptors = ctx.task_handler.list_descriptors().await;
                        let _ = tx.send(json!({ "backup": descriptors.iter().map(task_to_value).collect::<Vec<_>>() })).await;
                    }
                    "restore" => {
                        let path = self.args.get(1).ok_or_else(|| TaskerError::ParseError("system backup restore requires a snapshot".into()))?;
                        let entries: Vec<TaskDescription> = serde_json::from_str(path)
                            .map_err(|e| TaskerError::ParseError(format!("system backup restore: invalid snapshot: {e}")))?;
                        for descriptor in entries {
                            ctx.task_handler.register_descriptor(descriptor).await?;
                        }
                    }
                    other => return Err(TaskerError::ParseError(format!("system backup: unknown action '{other}'"))),
                }
            }
            other => return Err(TaskerError::Internal(format!("system: unhandled subcommand '{other}'"))),
        }
        Ok(())
    }
}

/// `certificate create`: a placeholder collaborator call, not a real CA —
/// emits the shape a real implementation's response would have so
/// downstream `write`/`http` stages have something to pipe.
pub struct Certificate {
    pub common_name: String,
}

impl Certificate {
    pub fn compile(args: &[String]) -> TaskerResult<Self> {
        let common_name = args.first().cloned().ok_or_else(|| TaskerError::ParseError("certificate create requires a common name".into()))?;
        Ok(Self { common_name })
    }
}

#[async_trait::async_trait]
impl SourceStage for Certificate {
    async fn produce(&self, tx: ValueSender, _ctx: &CliContext) -> TaskerResult<()> {
        let _ = tx
            .send(json!({
                "common_name": self.common_name,
                "certificate": format!("-----BEGIN CERTIFICATE-----\n{}\n-----END CERTIFICATE-----", self.common_name),
            }))
            .await;
        Ok(())
    }
}

/// `execute-task` as the head of a pipeline: runs a one-off `Job`
/// synchronously and streams its outcome.
pub struct ExecuteTaskSource {
    pub command_line: String,
}

impl ExecuteTaskSource {
    pub fn compile(args: &[String]) -> TaskerResult<Self> {
        if args.is_empty() {
            return Err(TaskerError::ParseError("execute-task requires a command line".into()));
        }
        Ok(Self { command_line: args.join(" ") })
    }
}

#[async_trait::async_trait]
impl SourceStage for ExecuteTaskSource {
    async fn produce(&self, tx: ValueSender, ctx: &CliContext) -> TaskerResult<()> {
        let id = TaskDescriptorId::new(format!("execute-task-{}", orc_shared::ids::TaskId::fresh()));
        let job = Job::new(id.clone(), self.command_line.clone(), Duration::from_secs(30));
        let workflow = job.as_single_step()?;
        ctx.task_handler.register_descriptor(TaskDescription::Workflow(workflow)).await?;
        let outcome = ctx.task_handler.start_task(&id).await?;
        let _ = tx.send(Value::String(render_start_outcome(&id, &outcome))).await;
        Ok(())
    }
}

/// `history [--before <rel|iso>] [--after <rel|iso>] [--change <kind>]` as
/// a source: lists recorded node mutations.
pub struct History {
    pub filter: ChangeLogFilter,
}

impl History {
    pub fn compile(args: &[String]) -> TaskerResult<Self> {
        Ok(Self { filter: parse_history_filter(args)? })
    }
}

#[async_trait::async_trait]
impl SourceStage for History {
    async fn produce(&self, tx: ValueSender, ctx: &CliContext) -> TaskerResult<()> {
        let records = ctx.history.query(&self.filter).await;
        let values: Vec<Value> = records.iter().map(|r| serde_json::to_value(r).unwrap_or(Value::Null)).collect();
        emit_all(&tx, values).await;
        Ok(())
    }
}

/// `--before`/`--after` accept a relative offset from now (`"30m"`, `"2h"`,
/// `"1d"`, `"45s"`) or an RFC3339 timestamp; `--change` is matched exactly.
fn parse_history_filter(args: &[String]) -> TaskerResult<ChangeLogFilter> {
    let mut filter = ChangeLogFilter::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--before" => {
                let raw = iter.next().ok_or_else(|| TaskerError::ParseError("history --before requires a value".into()))?;
                filter.before = Some(parse_history_time(raw)?);
            }
            "--after" => {
                let raw = iter.next().ok_or_else(|| TaskerError::ParseError("history --after requires a value".into()))?;
                filter.after = Some(parse_history_time(raw)?);
            }
            "--change" => {
                let raw = iter.next().ok_or_else(|| TaskerError::ParseError("history --change requires a value".into()))?;
                filter.change = Some(raw.clone());
            }
            // Back-compat: a bare positional is treated as `--change`.
            other => filter.change = Some(other.to_string()),
        }
    }
    Ok(filter)
}

fn parse_history_time(raw: &str) -> TaskerResult<chrono::DateTime<chrono::Utc>> {
    if let Some(amount) = raw.strip_suffix('s').and_then(|s| s.parse::<i64>().ok()) {
        return Ok(chrono::Utc::now() - chrono::Duration::seconds(amount));
    }
    if let Some(amount) = raw.strip_suffix('m').and_then(|s| s.parse::<i64>().ok()) {
        return Ok(chrono::Utc::now() - chrono::Duration::minutes(amount));
    }
    if let Some(amount) = raw.strip_suffix('h').and_then(|s| s.parse::<i64>().ok()) {
        return Ok(chrono::Utc::now() - chrono::Duration::hours(amount));
    }
    if let Some(amount) = raw.strip_suffix('d').and_then(|s| s.parse::<i64>().ok()) {
        return Ok(chrono::Utc::now() - chrono::Duration::days(amount));
    }
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .map_err(|e| TaskerError::ParseError(format!("history: invalid timestamp '{raw}': {e}")))
}

#[cfg(test)]
mod tests {
    use crate::test_support::test_context;
    use crate::stage::run_line;

    #[tokio::test]
    async fn json_unrolls_arrays_element_by_element() {
        let ctx = test_context();
        let result = run_line("json [1,2,3]", ctx).await.unwrap();
        assert_eq!(result, vec![vec!["1".to_string(), "2".to_string(), "3".to_string()]]);
    }

    #[tokio::test]
    async fn jobs_add_then_list_round_trips() {
        let ctx = test_context();
        run_line("jobs add my-job echo hi", ctx.clone()).await.unwrap();
        let result = run_line("jobs list", ctx).await.unwrap();
        assert_eq!(result[0].len(), 1);
    }

    #[tokio::test]
    async fn system_info_reports_queue_depth() {
        let ctx = test_context();
        let result = run_line("system info", ctx).await.unwrap();
        assert!(result[0][0].contains("worker_queue_depth"));
    }

    #[tokio::test]
    async fn workflows_run_reports_started_then_already_running_literally() {
        use orc_shared::model::{Step, StepAction, TaskDescription, TaskSurpassBehaviour, Workflow};
        use std::time::Duration;

        let ctx = test_context();
        let wf = Workflow::new(
            "slow_wf",
            "Slow workflow",
            vec![Step::new(
                "wait",
                StepAction::WaitForEvent { message_type: "never".into(), timeout: Duration::from_secs(30) },
                Duration::from_secs(30),
            )],
            vec![],
        )
        .unwrap()
        .with_on_surpass(TaskSurpassBehaviour::Skip);
        ctx.task_handler.register_descriptor(TaskDescription::Workflow(wf)).await.unwrap();

        let first = run_line("workflows run slow_wf", ctx.clone()).await.unwrap();
        assert!(first[0][0].contains("started with id"), "{}", first[0][0]);

        let second = run_line("workflows run slow_wf", ctx).await.unwrap();
        assert!(second[0][0].contains("already running with id"), "{}", second[0][0]);
    }

    #[tokio::test]
    async fn jobs_add_with_flags_sets_schedule_and_environment() {
        let ctx = test_context();
        let result = run_line(r#"jobs add --id hello --schedule "23 1 * * *" echo Hello World"#, ctx.clone()).await.unwrap();
        assert_eq!(result[0], vec!["Job hello added.".to_string()]);

        let record = ctx.jobs.get("hello").await.unwrap();
        let orc_shared::model::TaskDescription::Job(job) = &record.descriptor else {
            panic!("expected a job descriptor");
        };
        assert!(matches!(job.trigger, Some(orc_shared::model::Trigger::TimeTrigger { .. })));
        assert_eq!(job.environment.get("graph"), Some(&"ns".to_string()));
        assert_eq!(job.environment.get("section"), Some(&"reported".to_string()));
        assert_eq!(job.command, "echo Hello World");
    }

    #[tokio::test]
    async fn history_change_flag_filters_records() {
        let ctx = test_context();
        ctx.history.record("node_a", "tag.update", chrono::Utc::now()).await;
        ctx.history.record("node_b", "tag.delete", chrono::Utc::now()).await;

        let result = run_line("history --change tag.update", ctx).await.unwrap();
        assert_eq!(result[0].len(), 1);
    }
}
