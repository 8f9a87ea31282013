//! Stage implementations, grouped by position.

pub mod flow;
pub mod sink;
pub mod source;

use crate::stage::{ValueReceiver, ValueSender};
use serde_json::Value;

/// Drains `rx` fully. Most flow/sink stages need the whole upstream
/// sequence before they can produce (`sort`, `uniq`, `list --csv`, …);
/// truly streaming stages (`head`, `jq`) read `rx` directly instead.
pub(crate) async fn collect_all(mut rx: ValueReceiver) -> Vec<Value> {
    let mut out = Vec::new();
    while let Some(v) = rx.recv().await {
        out.push(v);
    }
    out
}

/// Sends every item downstream in order, ignoring a closed receiver (the
/// downstream stage stopped consuming early, e.g. after `limit`).
pub(crate) async fn emit_all(tx: &ValueSender, items: impl IntoIterator<Item = Value>) {
    for item in items {
        if tx.send(item).await.is_err() {
            return;
        }
    }
}
