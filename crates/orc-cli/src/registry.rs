//! Stage-name dispatch: maps a tokenized stage to a compiled variant,
//! rejecting unknown names and malformed arguments at compile time, never
//! at execution.

use crate::context::CliContext;
use crate::graph::Direction;
use crate::lexer::StageTokens;
use crate::stage::CompiledStage;
use crate::stages::{flow, sink, source};
use orc_shared::{TaskerError, TaskerResult};

pub fn compile_stage(tokens: &StageTokens, _ctx: &CliContext) -> TaskerResult<CompiledStage> {
    let args = &tokens.args;
    match tokens.name.as_str() {
        "echo" => Ok(CompiledStage::Source(Box::new(source::Echo { text: args.join(" ") }))),
        "json" => Ok(CompiledStage::Source(Box::new(source::Json::compile(args)?))),
        "search" => Ok(CompiledStage::Source(Box::new(source::Search::compile(args)?))),
        "sleep" => Ok(CompiledStage::Source(Box::new(source::Sleep::compile(args)?))),
        "workflows" => Ok(CompiledStage::Source(Box::new(source::Workflows::compile(tokens)?))),
        "jobs" => Ok(CompiledStage::Source(Box::new(source::Jobs::compile(tokens)?))),
        "templates" => Ok(CompiledStage::Source(Box::new(source::Templates::compile(tokens)?))),
        "configs" => Ok(CompiledStage::Source(Box::new(source::Configs::compile(tokens)?))),
        "system" => Ok(CompiledStage::Source(Box::new(source::System::compile(tokens)?))),
        "certificate" => compile_certificate(args),
        "execute-task" => Ok(CompiledStage::Source(Box::new(source::ExecuteTaskSource::compile(args)?))),
        "history" => Ok(CompiledStage::Source(Box::new(source::History::compile(args)?))),

        "head" => Ok(CompiledStage::Flow(Box::new(flow::Head { n: parse_n(args, "head", 10)? }))),
        "tail" => Ok(CompiledStage::Flow(Box::new(flow::Tail { n: parse_n(args, "tail", 10)? }))),
        "chunk" => Ok(CompiledStage::Flow(Box::new(flow::Chunk { n: parse_usize(args, "chunk")? }))),
        "flatten" => Ok(CompiledStage::Flow(Box::new(flow::Flatten))),
        "uniq" => Ok(CompiledStage::Flow(Box::new(flow::Uniq))),
        "sort" => Ok(CompiledStage::Flow(Box::new(compile_sort(args)?))),
        "limit" => Ok(CompiledStage::Flow(Box::new(compile_limit(args)?))),
        "count" => Ok(CompiledStage::Flow(Box::new(flow::Count { attribute: args.first().cloned() }))),
        "aggregate_to_count" => Ok(CompiledStage::Flow(Box::new(flow::AggregateToCount))),
        "list" => Ok(CompiledStage::Flow(Box::new(flow::List::compile(args)?))),
        "format" => Ok(CompiledStage::Flow(Box::new(flow::Format { template: args.join(" ") }))),
        "jq" => Ok(CompiledStage::Flow(Box::new(flow::Jq { expr: args.join(" ") }))),
        "set_desired" => Ok(CompiledStage::Flow(Box::new(flow::SetSection { section: "desired", assignments: parse_assignments(args)? }))),
        "set_metadata" => Ok(CompiledStage::Flow(Box::new(flow::SetSection { section: "metadata", assignments: parse_assignments(args)? }))),
        "clean" => Ok(CompiledStage::Flow(Box::new(flow::clean_stage()))),
        "protect" => Ok(CompiledStage::Flow(Box::new(flow::protect_stage()))),
        "tag" => Ok(CompiledStage::Flow(Box::new(flow::Tag::compile(tokens)?))),
        "predecessors" => compile_traversal(args, Direction::Predecessors, false),
        "successors" => compile_traversal(args, Direction::Successors, false),
        "ancestors" => compile_traversal(args, Direction::Predecessors, true),
        "descendants" => compile_traversal(args, Direction::Successors, true),

        "http" => Ok(CompiledStage::Sink(Box::new(sink::Http::compile(args)?))),
        "discord" => Ok(CompiledStage::Sink(Box::new(sink::Discord::compile(args)?))),
        "slack" => Ok(CompiledStage::Sink(Box::new(sink::Slack::compile(args)?))),
        "jira" => Ok(CompiledStage::Sink(Box::new(sink::Jira::compile(args)?))),
        "write" => Ok(CompiledStage::Sink(Box::new(sink::Write::compile(args)?))),

        other => Err(TaskerError::ParseError(format!("unknown stage '{other}'"))),
    }
}

fn compile_certificate(args: &[String]) -> TaskerResult<CompiledStage> {
    Ok(CompiledStage::Source(Box::new(source::Certificate::compile(args)?)))
}

fn parse_n(args: &[String], stage: &str, default: i64) -> TaskerResult<i64> {
    match args.first() {
        None => Ok(default),
        Some(s) => s.parse().map_err(|_| TaskerError::ParseError(format!("{stage}: argument must be an integer"))),
    }
}

fn parse_usize(args: &[String], stage: &str) -> TaskerResult<usize> {
    let raw = args.first().ok_or_else(|| TaskerError::ParseError(format!("{stage} requires a count")))?;
    raw.parse().map_err(|_| TaskerError::ParseError(format!("{stage}: argument must be a positive integer")))
}

fn compile_sort(args: &[String]) -> TaskerResult<flow::Sort> {
    let field = args.first().cloned().ok_or_else(|| TaskerError::ParseError("sort requires a field".into()))?;
    let descending = match args.get(1).map(String::as_str) {
        None | Some("asc") => false,
        Some("desc") => true,
        Some(other) => return Err(TaskerError::ParseError(format!("sort: unknown direction '{other}'"))),
    };
    Ok(flow::Sort { field, descending })
}

fn compile_limit(args: &[String]) -> TaskerResult<flow::Limit> {
    let joined = args.join(" ");
    let parts: Vec<&str> = joined.split(',').map(str::trim).collect();
    let (start, count) = match parts.as_slice() {
        [count] => (0, count.parse().map_err(|_| TaskerError::ParseError("limit: count must be an integer".into()))?),
        [start, count] => (
            start.parse().map_err(|_| TaskerError::ParseError("limit: start must be an integer".into()))?,
            count.parse().map_err(|_| TaskerError::ParseError("limit: count must be an integer".into()))?,
        ),
        _ => return Err(TaskerError::ParseError("limit takes '[start,] count'".into())),
    };
    Ok(flow::Limit { start, count })
}

fn parse_assignments(args: &[String]) -> TaskerResult<Vec<(String, String)>> {
    if args.is_empty() {
        return Err(TaskerError::ParseError("expected at least one key=value assignment".into()));
    }
    args.iter()
        .map(|a| {
            a.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| TaskerError::ParseError(format!("expected 'key=value', found '{a}'")))
        })
        .collect()
}

fn compile_traversal(args: &[String], direction: Direction, transitive: bool) -> TaskerResult<CompiledStage> {
    let mut with_origin = false;
    let mut rest = Vec::new();
    for arg in args {
        if arg == "--with-origin" {
            with_origin = true;
        } else {
            rest.push(arg.clone());
        }
    }
    let edge_type = rest.first().cloned().unwrap_or_else(|| "default".to_string());
    Ok(CompiledStage::Flow(Box::new(flow::Traversal { direction, transitive, with_origin, edge_type })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_context;

    #[tokio::test]
    async fn unknown_stage_name_is_a_parse_error() {
        let ctx = test_context();
        let tokens = StageTokens { name: "not-a-stage".to_string(), args: vec![] };
        match compile_stage(&tokens, &ctx) {
            Err(e) => assert_eq!(e.kind(), "ParseError"),
            Ok(_) => panic!("expected a ParseError"),
        }
    }

    #[tokio::test]
    async fn list_rejects_csv_and_markdown_together() {
        let ctx = test_context();
        let tokens = StageTokens {
            name: "list".to_string(),
            args: vec!["--csv".to_string(), "--markdown".to_string()],
        };
        match compile_stage(&tokens, &ctx) {
            Err(e) => assert_eq!(e.kind(), "ParseError"),
            Ok(_) => panic!("expected a ParseError"),
        }
    }

    #[test]
    fn limit_parses_optional_start() {
        let limit = compile_limit(&["2,".to_string(), "2".to_string()]).unwrap();
        assert_eq!((limit.start, limit.count), (2, 2));
        let limit = compile_limit(&["3".to_string()]).unwrap();
        assert_eq!((limit.start, limit.count), (0, 3));
    }
}
