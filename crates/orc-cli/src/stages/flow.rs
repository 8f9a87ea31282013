//! Flow stages: transform the stream in place.

use crate::context::CliContext;
use crate::graph::Direction;
use crate::lexer::StageTokens;
use crate::stage::{FlowStage, ValueReceiver, ValueSender};
use crate::stages::{collect_all, emit_all};
use crate::value::{get_path, render_scalar, set_path};
use async_trait::async_trait;
use orc_shared::{TaskerError, TaskerResult};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::warn;

pub struct Head {
    pub n: i64,
}

#[async_trait]
impl FlowStage for Head {
    async fn run(&self, rx: ValueReceiver, tx: ValueSender, _ctx: &CliContext) -> TaskerResult<()> {
        let items = collect_all(rx).await;
        emit_all(&tx, slice_n(items, self.n, true)).await;
        Ok(())
    }
}

pub struct Tail {
    pub n: i64,
}

#[async_trait]
impl FlowStage for Tail {
    async fn run(&self, rx: ValueReceiver, tx: ValueSender, _ctx: &CliContext) -> TaskerResult<()> {
        let items = collect_all(rx).await;
        emit_all(&tx, slice_n(items, self.n, false)).await;
        Ok(())
    }
}

/// `n <= 0` yields nothing; `n >= len` yields everything.
fn slice_n(items: Vec<Value>, n: i64, from_head: bool) -> Vec<Value> {
    if n <= 0 {
        return Vec::new();
    }
    let n = n as usize;
    if n >= items.len() {
        return items;
    }
    if from_head {
        items.into_iter().take(n).collect()
    } else {
        let skip = items.len() - n;
        items.into_iter().skip(skip).collect()
    }
}

pub struct Chunk {
    pub n: usize,
}

#[async_trait]
impl FlowStage for Chunk {
    async fn run(&self, rx: ValueReceiver, tx: ValueSender, _ctx: &CliContext) -> TaskerResult<()> {
        let items = collect_all(rx).await;
        let chunks: Vec<Value> = items.chunks(self.n.max(1)).map(|c| Value::Array(c.to_vec())).collect();
        emit_all(&tx, chunks).await;
        Ok(())
    }
}

pub struct Flatten;

#[async_trait]
impl FlowStage for Flatten {
    async fn run(&self, mut rx: ValueReceiver, tx: ValueSender, _ctx: &CliContext) -> TaskerResult<()> {
        while let Some(v) = rx.recv().await {
            match v {
                Value::Array(items) => emit_all(&tx, items).await,
                other => emit_all(&tx, [other]).await,
            }
        }
        Ok(())
    }
}

pub struct Uniq;

#[async_trait]
impl FlowStage for Uniq {
    async fn run(&self, rx: ValueReceiver, tx: ValueSender, _ctx: &CliContext) -> TaskerResult<()> {
        let items = collect_all(rx).await;
        let mut seen: Vec<Value> = Vec::new();
        let mut out = Vec::new();
        for item in items {
            if !seen.contains(&item) {
                seen.push(item.clone());
                out.push(item);
            }
        }
        emit_all(&tx, out).await;
        Ok(())
    }
}

pub struct Sort {
    pub field: String,
    pub descending: bool,
}

#[async_trait]
impl FlowStage for Sort {
    async fn run(&self, rx: ValueReceiver, tx: ValueSender, _ctx: &CliContext) -> TaskerResult<()> {
        let mut items = collect_all(rx).await;
        // `sort` is stable; repeated `sort` stages apply outermost last
        // simply by virtue of each running after the previous one settles.
        items.sort_by(|a, b| {
            let av = resolve_sort_key(a, &self.field);
            let bv = resolve_sort_key(b, &self.field);
            let ord = render_scalar(av.as_ref()).cmp(&render_scalar(bv.as_ref()));
            if self.descending {
                ord.reverse()
            } else {
                ord
            }
        });
        emit_all(&tx, items).await;
        Ok(())
    }
}

fn resolve_sort_key(value: &Value, field: &str) -> Option<Value> {
    get_path(value, field)
        .or_else(|| get_path(value, &format!("reported.{field}")))
        .cloned()
}

pub struct Limit {
    pub start: usize,
    pub count: usize,
}

#[async_trait]
impl FlowStage for Limit {
    async fn run(&self, rx: ValueReceiver, tx: ValueSender, _ctx: &CliContext) -> TaskerResult<()> {
        let items = collect_all(rx).await;
        let out = items.into_iter().skip(self.start).take(self.count).collect::<Vec<_>>();
        emit_all(&tx, out).await;
        Ok(())
    }
}

pub struct Count {
    pub attribute: Option<String>,
}

#[async_trait]
impl FlowStage for Count {
    async fn run(&self, rx: ValueReceiver, tx: ValueSender, _ctx: &CliContext) -> TaskerResult<()> {
        let items = collect_all(rx).await;
        let mut lines = Vec::new();
        match &self.attribute {
            None => {
                lines.push(format!("total matched: {}", items.len()));
                lines.push("total unmatched: 0".to_string());
            }
            Some(attr) => {
                let mut groups: BTreeMap<String, usize> = BTreeMap::new();
                let mut unmatched = 0usize;
                for item in &items {
                    match get_path(item, attr).or_else(|| get_path(item, &format!("reported.{attr}"))) {
                        Some(v) => *groups.entry(render_scalar(Some(v))).or_insert(0) += 1,
                        None => unmatched += 1,
                    }
                }
                for (k, v) in &groups {
                    lines.push(format!("{k}: {v}"));
                }
                lines.push(format!("total matched: {}", items.len() - unmatched));
                lines.push(format!("total unmatched: {unmatched}"));
            }
        }
        emit_all(&tx, lines.into_iter().map(Value::String)).await;
        Ok(())
    }
}

pub struct AggregateToCount;

#[async_trait]
impl FlowStage for AggregateToCount {
    async fn run(&self, rx: ValueReceiver, tx: ValueSender, _ctx: &CliContext) -> TaskerResult<()> {
        let items = collect_all(rx).await;
        let mut lines = Vec::new();
        let mut total = 0i64;
        for item in &items {
            let name = get_path(item, "name")
                .or_else(|| get_path(item, "group.name"))
                .map(|v| render_scalar(Some(v)))
                .unwrap_or_else(|| "unknown".to_string());
            let count = get_path(item, "count").and_then(Value::as_i64).unwrap_or(0);
            total += count;
            lines.push(format!("{name}: {count}"));
        }
        lines.push(format!("total matched: {total}"));
        lines.push("total unmatched: 0".to_string());
        emit_all(&tx, lines.into_iter().map(Value::String)).await;
        Ok(())
    }
}

/// A single field reference in a `list` stage: `x` or `x as y`.
struct ListField {
    path: String,
    label: String,
}

fn parse_fields(args: &[String]) -> Vec<ListField> {
    let joined = args.join(" ");
    joined
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|field| {
            if let Some((path, label)) = field.split_once(" as ") {
                ListField { path: path.trim().to_string(), label: label.trim().to_string() }
            } else {
                ListField { path: field.to_string(), label: field.to_string() }
            }
        })
        .collect()
}

const DEFAULT_LIST_FIELDS: &[&str] = &["kind", "identifier", "name", "age"];

pub enum ListOutput {
    Plain,
    Csv,
    Markdown,
}

pub struct List {
    pub fields: Vec<String>,
    pub output: ListOutput,
}

impl List {
    pub fn compile(args: &[String]) -> TaskerResult<Self> {
        let mut output = ListOutput::Plain;
        let mut rest = Vec::new();
        for arg in args {
            match arg.as_str() {
                "--csv" if matches!(output, ListOutput::Markdown) => {
                    return Err(TaskerError::ParseError("list supports only one of --csv/--markdown".into()))
                }
                "--csv" => output = ListOutput::Csv,
                "--markdown" if matches!(output, ListOutput::Csv) => {
                    return Err(TaskerError::ParseError("list supports only one of --csv/--markdown".into()))
                }
                "--markdown" => output = ListOutput::Markdown,
                other => rest.push(other.to_string()),
            }
        }
        Ok(Self { fields: rest, output })
    }
}

#[async_trait]
impl FlowStage for List {
    async fn run(&self, rx: ValueReceiver, tx: ValueSender, _ctx: &CliContext) -> TaskerResult<()> {
        let items = collect_all(rx).await;
        let explicit = !self.fields.is_empty();
        let fields = if explicit {
            parse_fields(&self.fields)
        } else {
            DEFAULT_LIST_FIELDS
                .iter()
                .map(|f| ListField { path: f.to_string(), label: f.to_string() })
                .collect()
        };

        let lines = match self.output {
            ListOutput::Plain => items.iter().map(|item| render_plain_row(item, &fields, explicit)).collect(),
            ListOutput::Csv => render_table(&items, &fields, render_csv_row),
            ListOutput::Markdown => render_markdown(&items, &fields),
        };
        emit_all(&tx, lines.into_iter().map(Value::String)).await;
        Ok(())
    }
}

fn resolve_field<'a>(item: &'a Value, path: &str) -> Option<&'a Value> {
    get_path(item, path).or_else(|| get_path(item, &format!("reported.{path}")))
}

/// Default (non-csv/markdown) rendering omits properties that resolve to
/// `null`.
fn render_plain_row(item: &Value, fields: &[ListField], omit_null: bool) -> String {
    fields
        .iter()
        .filter_map(|f| {
            let resolved = resolve_field(item, &f.path);
            if omit_null && matches!(resolved, None | Some(Value::Null)) {
                None
            } else {
                Some(format!("{}={}", f.label, render_scalar(resolved)))
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn render_table(items: &[Value], fields: &[ListField], row: fn(&[String]) -> String) -> Vec<String> {
    let header: Vec<String> = fields.iter().map(|f| f.label.clone()).collect();
    let mut lines = vec![row(&header)];
    for item in items {
        let cells: Vec<String> = fields.iter().map(|f| render_scalar(resolve_field(item, &f.path))).collect();
        lines.push(row(&cells));
    }
    lines
}

fn render_csv_row(cells: &[String]) -> String {
    cells.iter().map(|c| format!("\"{c}\"")).collect::<Vec<_>>().join(",")
}

fn render_markdown(items: &[Value], fields: &[ListField]) -> Vec<String> {
    let header: Vec<String> = fields.iter().map(|f| f.label.clone()).collect();
    let rows: Vec<Vec<String>> = items
        .iter()
        .map(|item| fields.iter().map(|f| render_scalar(resolve_field(item, &f.path))).collect())
        .collect();

    let widths: Vec<usize> = header
        .iter()
        .enumerate()
        .map(|(i, h)| rows.iter().map(|r| r[i].len()).chain([h.len()]).max().unwrap_or(h.len()))
        .collect();

    let pad_row = |cells: &[String]| -> String {
        let padded: Vec<String> = cells.iter().zip(&widths).map(|(c, w)| format!("{c:<w$}")).collect();
        format!("|{}|", padded.join("|"))
    };
    let separator: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();

    let mut lines = vec![pad_row(&header), format!("|{}|", separator.join("|"))];
    lines.extend(rows.iter().map(|r| pad_row(r)));
    lines
}

pub struct Format {
    pub template: String,
}

#[async_trait]
impl FlowStage for Format {
    async fn run(&self, mut rx: ValueReceiver, tx: ValueSender, _ctx: &CliContext) -> TaskerResult<()> {
        while let Some(v) = rx.recv().await {
            let rendered = orc_grammar::format_template(&self.template, &v);
            if tx.send(Value::String(rendered)).await.is_err() {
                return Ok(());
            }
        }
        Ok(())
    }
}

pub struct Jq {
    pub expr: String,
}

#[async_trait]
impl FlowStage for Jq {
    async fn run(&self, mut rx: ValueReceiver, tx: ValueSender, ctx: &CliContext) -> TaskerResult<()> {
        let expr = orc_grammar::rewrite_props(&self.expr, Some(&ctx.section));
        while let Some(v) = rx.recv().await {
            let results = orc_grammar::eval_jq(&expr, v).map_err(|e| TaskerError::ParseError(e.to_string()))?;
            emit_all(&tx, results).await;
        }
        Ok(())
    }
}

/// `set_desired`/`set_metadata k=v …`.
pub struct SetSection {
    pub section: &'static str,
    pub assignments: Vec<(String, String)>,
}

#[async_trait]
impl FlowStage for SetSection {
    async fn run(&self, mut rx: ValueReceiver, tx: ValueSender, ctx: &CliContext) -> TaskerResult<()> {
        while let Some(mut v) = rx.recv().await {
            for (k, raw) in &self.assignments {
                let rendered = orc_grammar::format_template(raw, &v);
                let parsed: Value = serde_json::from_str(&rendered).unwrap_or(Value::String(rendered));
                if let Some(section) = v.get_mut(self.section) {
                    set_path(section, k, parsed.clone());
                } else if let Some(obj) = v.as_object_mut() {
                    let mut section = json!({});
                    set_path(&mut section, k, parsed.clone());
                    obj.insert(self.section.to_string(), section);
                }
                if let Some(id) = v.get("id").and_then(Value::as_str) {
                    let _ = ctx.graph.set_path(id, self.section, k, parsed).await;
                    ctx.history
                        .record(id.to_string(), format!("{}.{}", self.section, k), chrono::Utc::now())
                        .await;
                }
            }
            if tx.send(v).await.is_err() {
                return Ok(());
            }
        }
        Ok(())
    }
}

/// `clean` / `protect`: sugar over `set_desired`/`set_metadata`.
pub fn clean_stage() -> SetSection {
    SetSection { section: "desired", assignments: vec![("clean".to_string(), "true".to_string())] }
}

pub fn protect_stage() -> SetSection {
    SetSection { section: "metadata", assignments: vec![("protected".to_string(), "true".to_string())] }
}

/// `tag update|delete …`.
pub struct Tag {
    pub action: String,
    pub key: String,
    pub value_template: Option<String>,
    pub nowait: bool,
}

impl Tag {
    pub fn compile(tokens: &StageTokens) -> TaskerResult<Self> {
        let mut args: Vec<String> = tokens.args.clone();
        let nowait = args.iter().any(|a| a == "--nowait");
        args.retain(|a| a != "--nowait");
        let Some(action) = args.first().cloned() else {
            return Err(TaskerError::ParseError("tag requires 'update' or 'delete'".into()));
        };
        if action != "update" && action != "delete" {
            return Err(TaskerError::ParseError(format!("tag: unknown action '{action}'")));
        }
        let Some(key) = args.get(1).cloned() else {
            return Err(TaskerError::ParseError("tag requires a key".into()));
        };
        let value_template = args.get(2).cloned();
        Ok(Self { action, key, value_template, nowait })
    }
}

#[async_trait]
impl FlowStage for Tag {
    async fn run(&self, mut rx: ValueReceiver, tx: ValueSender, ctx: &CliContext) -> TaskerResult<()> {
        while let Some(v) = rx.recv().await {
            let node_id = v.get("id").and_then(Value::as_str).unwrap_or("unknown").to_string();
            let kind = get_path(&v, "reported.kind").and_then(Value::as_str).unwrap_or("unknown").to_string();
            let rendered_value = self.value_template.as_deref().map(|t| orc_grammar::format_template(t, &v));

            let mut attributes = BTreeMap::new();
            attributes.insert("id".to_string(), node_id.clone());
            attributes.insert("kind".to_string(), kind);
            let data = json!({
                "action": self.action,
                "key": self.key,
                "value": rendered_value,
            });
            let task = orc_engine::WorkerTask::new("tag", attributes, data, Duration::from_secs(30));
            let task_id = task.id.clone();
            let rx_result = ctx.worker_queue.add_task(task).await;

            let out = if self.nowait {
                json!({ "task": task_id.to_string() })
            } else {
                match rx_result.await {
                    Ok(Ok(_)) => {
                        ctx.history
                            .record(node_id.clone(), format!("tag.{}", self.action), chrono::Utc::now())
                            .await;
                        warn!(node_id = %node_id, "Update not reflected in db. Wait until next collector run.");
                        let mut updated = v.clone();
                        if let Some(value) = &rendered_value {
                            if let Some(obj) = updated.as_object_mut() {
                                let mut update = json!({});
                                set_path(&mut update, &self.key, Value::String(value.clone()));
                                obj.insert("update".to_string(), update);
                            }
                        }
                        updated
                    }
                    Ok(Err(e)) => json!({ "error": e.to_string() }),
                    Err(_) => json!({ "error": "worker task channel closed" }),
                }
            };
            if tx.send(out).await.is_err() {
                return Ok(());
            }
        }
        Ok(())
    }
}

/// `predecessors|successors|ancestors|descendants [--with-origin] [edge_type]`.
pub struct Traversal {
    pub direction: Direction,
    pub transitive: bool,
    pub with_origin: bool,
    pub edge_type: String,
}

#[async_trait]
impl FlowStage for Traversal {
    async fn run(&self, rx: ValueReceiver, tx: ValueSender, ctx: &CliContext) -> TaskerResult<()> {
        let seeds = collect_all(rx).await;
        let mut frontier = seeds.clone();
        let mut seen: Vec<Value> = Vec::new();
        loop {
            let next = ctx.graph.traverse(&frontier, &self.edge_type, self.direction, false).await;
            let fresh: Vec<Value> = next.into_iter().filter(|n| !seen.contains(n)).collect();
            if fresh.is_empty() {
                break;
            }
            seen.extend(fresh.iter().cloned());
            frontier = fresh;
            if !self.transitive {
                break;
            }
        }
        let out = if self.with_origin {
            seeds.into_iter().chain(seen).collect::<Vec<_>>()
        } else {
            seen
        };
        emit_all(&tx, out).await;
        Ok(())
    }
}
