//! In-memory stand-in for the graph database collaborator the CLI's
//! `search`/traversal/`tag` stages query.

use crate::value::get_path;
use orc_shared::{TaskerError, TaskerResult};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// One graph node: `reported` is the collector-observed section, `desired`
/// and `metadata` are user/system-writable sections.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: String,
    pub reported: Value,
    pub desired: Value,
    pub metadata: Value,
}

impl Node {
    pub fn new(id: impl Into<String>, reported: Value) -> Self {
        Self {
            id: id.into(),
            reported,
            desired: json!({}),
            metadata: json!({}),
        }
    }

    /// The JSON shape `search`/`list`/`format`/`jq` operate on: `{id,
    /// reported, desired, metadata}`.
    pub fn to_value(&self) -> Value {
        json!({
            "id": self.id,
            "reported": self.reported,
            "desired": self.desired,
            "metadata": self.metadata,
        })
    }
}

#[derive(Default)]
struct Inner {
    nodes: HashMap<String, Node>,
    /// `(edge_type, from, to)`.
    edges: Vec<(String, String, String)>,
}

/// A minimal, in-process graph. Not persisted, not a query-language
/// implementation — just enough shape for the CLI pipeline's graph-backed
/// stages to have something real to operate on.
#[derive(Clone, Default)]
pub struct Graph {
    inner: Arc<RwLock<Inner>>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert_node(&self, node: Node) {
        self.inner.write().await.nodes.insert(node.id.clone(), node);
    }

    pub async fn add_edge(&self, edge_type: impl Into<String>, from: impl Into<String>, to: impl Into<String>) {
        self.inner.write().await.edges.push((edge_type.into(), from.into(), to.into()));
    }

    pub async fn node(&self, id: &str) -> Option<Node> {
        self.inner.read().await.nodes.get(id).cloned()
    }

    pub async fn set_path(&self, id: &str, section: &str, path: &str, value: Value) -> TaskerResult<()> {
        let mut inner = self.inner.write().await;
        let node = inner
            .nodes
            .get_mut(id)
            .ok_or_else(|| TaskerError::NotFound(format!("node '{id}'")))?;
        let target = match section {
            "desired" => &mut node.desired,
            "metadata" => &mut node.metadata,
            other => return Err(TaskerError::Internal(format!("unknown section '{other}'"))),
        };
        crate::value::set_path(target, path, value);
        Ok(())
    }

    /// Supports the subset of the query language exercised by the CLI
    /// tests: `is(kind)` and `<path>==<literal>` predicates, ANDed
    /// together, with an optional trailing `sort <path> [asc|desc]`.
    pub async fn search(&self, query: &str) -> TaskerResult<Vec<Value>> {
        let (predicate, sort) = split_sort_clause(query);
        let inner = self.inner.read().await;
        let mut matched: Vec<Value> = inner
            .nodes
            .values()
            .map(Node::to_value)
            .filter(|v| matches_predicate(v, predicate))
            .collect();
        if let Some((field, desc)) = sort {
            matched.sort_by(|a, b| {
                let av = get_path(a, &field).or_else(|| get_path(a, &format!("reported.{field}"))).cloned().unwrap_or(Value::Null);
                let bv = get_path(b, &field).or_else(|| get_path(b, &format!("reported.{field}"))).cloned().unwrap_or(Value::Null);
                let ord = compare_values(&av, &bv);
                if desc {
                    ord.reverse()
                } else {
                    ord
                }
            });
        }
        Ok(matched)
    }

    /// Traverses one hop in `direction` along `edge_type` from the seed
    /// node ids present in `seeds` (by `id` field).
    pub async fn traverse(&self, seeds: &[Value], edge_type: &str, direction: Direction, with_origin: bool) -> Vec<Value> {
        let inner = self.inner.read().await;
        let mut out = Vec::new();
        for seed in seeds {
            let Some(id) = seed.get("id").and_then(Value::as_str) else { continue };
            if with_origin {
                out.push(seed.clone());
            }
            for (et, from, to) in &inner.edges {
                if et != edge_type {
                    continue;
                }
                let neighbour = match direction {
                    Direction::Successors if from == id => Some(to),
                    Direction::Predecessors if to == id => Some(from),
                    _ => None,
                };
                if let Some(n) = neighbour {
                    if let Some(node) = inner.nodes.get(n) {
                        out.push(node.to_value());
                    }
                }
            }
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Successors,
    Predecessors,
}

fn split_sort_clause(query: &str) -> (&str, Option<(String, bool)>) {
    if let Some(pos) = query.find(" sort ") {
        let (predicate, rest) = query.split_at(pos);
        let rest = rest.trim_start_matches(" sort ").trim();
        let mut parts = rest.split_whitespace();
        let field = parts.next().unwrap_or("id").to_string();
        let desc = matches!(parts.next(), Some("desc"));
        (predicate.trim(), Some((field, desc)))
    } else {
        (query.trim(), None)
    }
}

fn matches_predicate(node: &Value, predicate: &str) -> bool {
    predicate
        .split(" and ")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .all(|clause| matches_clause(node, clause))
}

fn matches_clause(node: &Value, clause: &str) -> bool {
    if clause == "all" {
        return true;
    }
    if let Some(kind) = clause.strip_prefix("is(").and_then(|c| c.strip_suffix(')')) {
        return get_path(node, "reported.kind").and_then(Value::as_str) == Some(kind);
    }
    if let Some((path, literal)) = clause.split_once("==") {
        let path = path.trim();
        let literal = literal.trim().trim_matches('"');
        let resolved = get_path(node, path).or_else(|| get_path(node, &format!("reported.{path}")));
        return resolved.map(|v| crate::value::render_scalar(Some(v)) == literal).unwrap_or(false);
    }
    true
}

fn compare_values(a: &Value, b: &Value) -> std::cmp::Ordering {
    match (a, b) {
        (Value::String(a), Value::String(b)) => a.cmp(b),
        (Value::Number(a), Value::Number(b)) => a.as_f64().partial_cmp(&b.as_f64()).unwrap_or(std::cmp::Ordering::Equal),
        _ => a.to_string().cmp(&b.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded_graph() -> Graph {
        let graph = Graph::new();
        for i in 0..5 {
            graph
                .upsert_node(Node::new(format!("bla_{i}"), json!({"kind": "bla", "identifier": format!("0_{i}")})))
                .await;
        }
        graph
    }

    #[tokio::test]
    async fn search_filters_by_kind_and_sorts() {
        let graph = seeded_graph().await;
        // `identifier` (no `reported.` prefix) must resolve the same way a
        // bare equality-predicate path does.
        let results = graph.search("is(bla) sort identifier").await.unwrap();
        let ids: Vec<&str> = results.iter().map(|v| get_path(v, "reported.identifier").unwrap().as_str().unwrap()).collect();
        assert_eq!(ids, vec!["0_0", "0_1", "0_2", "0_3", "0_4"]);
    }

    #[tokio::test]
    async fn set_path_updates_desired_section() {
        let graph = seeded_graph().await;
        graph.set_path("bla_0", "desired", "clean", json!(true)).await.unwrap();
        let node = graph.node("bla_0").await.unwrap();
        assert_eq!(node.desired, json!({"clean": true}));
    }

    #[tokio::test]
    async fn traverse_successors_follows_matching_edge_type() {
        let graph = seeded_graph().await;
        graph.add_edge("default", "bla_0", "bla_1").await;
        let seeds = vec![graph.node("bla_0").await.unwrap().to_value()];
        let out = graph.traverse(&seeds, "default", Direction::Successors, false).await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["id"], json!("bla_1"));
    }
}
