//! The pipeline execution engine: a compiled stage is a consumer/producer
//! loop connected to its neighbours by bounded channels, with each stage
//! running as its own spawned task.

use crate::context::CliContext;
use crate::lexer::split_pipelines;
use crate::registry::compile_stage;
use async_trait::async_trait;
use orc_shared::{TaskerError, TaskerResult};
use serde_json::Value;
use tokio::sync::mpsc;

/// Buffer depth for the channels between adjacent stages. Small enough
/// that a slow sink applies real backpressure to a fast source.
const CHANNEL_CAPACITY: usize = 64;

pub type ValueSender = mpsc::Sender<Value>;
pub type ValueReceiver = mpsc::Receiver<Value>;

/// Where a stage may appear in a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    Source,
    Flow,
    Sink,
}

/// A source produces values with no upstream input.
#[async_trait]
pub trait SourceStage: Send + Sync {
    async fn produce(&self, tx: ValueSender, ctx: &CliContext) -> TaskerResult<()>;
}

/// A flow stage consumes upstream values and produces downstream ones.
#[async_trait]
pub trait FlowStage: Send + Sync {
    async fn run(&self, rx: ValueReceiver, tx: ValueSender, ctx: &CliContext) -> TaskerResult<()>;
}

/// A sink consumes the stream to completion and returns the pipeline's
/// human-facing text lines.
#[async_trait]
pub trait SinkStage: Send + Sync {
    async fn consume(&self, rx: ValueReceiver, ctx: &CliContext) -> TaskerResult<Vec<String>>;
}

pub enum CompiledStage {
    Source(Box<dyn SourceStage>),
    Flow(Box<dyn FlowStage>),
    Sink(Box<dyn SinkStage>),
}

impl CompiledStage {
    pub fn position(&self) -> Position {
        match self {
            CompiledStage::Source(_) => Position::Source,
            CompiledStage::Flow(_) => Position::Flow,
            CompiledStage::Sink(_) => Position::Sink,
        }
    }
}

/// The default sink: collect everything into a list of JSON values,
/// rendered as their `to_string()` for line-oriented output").
struct CollectSink;

#[async_trait]
impl SinkStage for CollectSink {
    async fn consume(&self, mut rx: ValueReceiver, _ctx: &CliContext) -> TaskerResult<Vec<String>> {
        let mut lines = Vec::new();
        while let Some(v) = rx.recv().await {
            lines.push(match v {
                Value::String(s) => s,
                other => other.to_string(),
            });
        }
        Ok(lines)
    }
}

/// A fully compiled pipeline: exactly one source, zero or more flows, and
/// a sink (defaulted if the author omitted one).
pub struct Pipeline {
    source: Box<dyn SourceStage>,
    flows: Vec<Box<dyn FlowStage>>,
    sink: Box<dyn SinkStage>,
}

impl Pipeline {
    pub fn compile(stages: Vec<CompiledStage>) -> TaskerResult<Self> {
        let mut iter = stages.into_iter().peekable();
        let Some(first) = iter.next() else {
            return Err(TaskerError::ParseError("empty pipeline".into()));
        };
        let source = match first {
            CompiledStage::Source(s) => s,
            other => {
                return Err(TaskerError::ParseError(format!(
                    "pipeline must start with a source stage, found a {:?} stage",
                    other.position()
                )))
            }
        };

        let mut flows = Vec::new();
        let mut sink: Option<Box<dyn SinkStage>> = None;
        while let Some(stage) = iter.next() {
            match stage {
                CompiledStage::Flow(f) => {
                    if sink.is_some() {
                        return Err(TaskerError::ParseError("flow stage after sink".into()));
                    }
                    flows.push(f);
                }
                CompiledStage::Sink(s) => {
                    if iter.peek().is_some() {
                        return Err(TaskerError::ParseError("sink stage must be last".into()));
                    }
                    sink = Some(s);
                }
                CompiledStage::Source(_) => {
                    return Err(TaskerError::ParseError("only one source stage is allowed, at the head".into()));
                }
            }
        }

        Ok(Self {
            source,
            flows,
            sink: sink.unwrap_or_else(|| Box::new(CollectSink)),
        })
    }

    /// Runs every stage concurrently, wired front-to-back with bounded
    /// channels, and returns the sink's text lines.
    pub async fn execute(self, ctx: CliContext) -> TaskerResult<Vec<String>> {
        let Pipeline { source, flows, sink } = self;

        let (first_tx, mut rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut handles = Vec::new();

        let source_ctx = ctx.clone();
        handles.push(tokio::spawn(async move { source.produce(first_tx, &source_ctx).await }));

        for flow in flows {
            let (tx, next_rx) = mpsc::channel(CHANNEL_CAPACITY);
            let flow_ctx = ctx.clone();
            let prev_rx = std::mem::replace(&mut rx, next_rx);
            handles.push(tokio::spawn(async move { flow.run(prev_rx, tx, &flow_ctx).await }));
        }

        let sink_ctx = ctx.clone();
        let sink_handle = tokio::spawn(async move { sink.consume(rx, &sink_ctx).await });

        for handle in handles {
            handle
                .await
                .map_err(|e| TaskerError::Internal(format!("pipeline stage panicked: {e}")))??;
        }

        sink_handle
            .await
            .map_err(|e| TaskerError::Internal(format!("sink stage panicked: {e}")))?
    }
}

/// Parses, compiles, and executes one `;`-separated command line,
/// returning each pipeline's text lines in order.
pub async fn run_line(line: &str, ctx: CliContext) -> TaskerResult<Vec<Vec<String>>> {
    let pipelines = split_pipelines(line)?;
    let mut results = Vec::new();
    for stages in pipelines {
        let compiled: Vec<CompiledStage> = stages
            .into_iter()
            .map(|tokens| compile_stage(&tokens, &ctx))
            .collect::<TaskerResult<_>>()?;
        let pipeline = Pipeline::compile(compiled)?;
        results.push(pipeline.execute(ctx.clone()).await?);
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_context;

    #[tokio::test]
    async fn echo_with_no_argument_yields_empty_string() {
        let ctx = test_context();
        let result = run_line("echo", ctx).await.unwrap();
        assert_eq!(result, vec![vec!["".to_string()]]);
    }

    #[tokio::test]
    async fn echo_with_argument_joins_remaining_tokens() {
        let ctx = test_context();
        let result = run_line("echo this is a string", ctx).await.unwrap();
        assert_eq!(result, vec![vec!["this is a string".to_string()]]);
    }

    #[tokio::test]
    async fn head_and_tail_slice_a_json_array() {
        let ctx = test_context();
        let result = run_line("json [1,2,3,4,5] | head 2", ctx.clone()).await.unwrap();
        assert_eq!(result, vec![vec!["1".to_string(), "2".to_string()]]);

        let result = run_line("json [1,2,3,4,5] | tail 2", ctx).await.unwrap();
        assert_eq!(result, vec![vec!["4".to_string(), "5".to_string()]]);
    }

    #[tokio::test]
    async fn multiple_statements_each_produce_their_own_result() {
        let ctx = test_context();
        let result = run_line("json [1,2,3]; json [4,5,6]", ctx).await.unwrap();
        assert_eq!(result.len(), 2);
    }

    #[tokio::test]
    async fn a_flow_stage_head_of_pipeline_is_a_parse_error() {
        let ctx = test_context();
        let err = run_line("head 2", ctx).await.unwrap_err();
        assert_eq!(err.kind(), "ParseError");
    }
}
