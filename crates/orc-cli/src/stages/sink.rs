//! Sink stages: consume the stream to completion and return summary lines.

use crate::context::CliContext;
use crate::stage::{SinkStage, ValueReceiver};
use crate::value::{get_path, render_scalar};
use orc_shared::retry::Backoff;
use orc_shared::{TaskerError, TaskerResult};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;

/// `write <name>`: one JSON line per item, written to a temp file.
/// Forces monochrome regardless of the interactive colour setting.
pub struct Write {
    pub name: String,
}

impl Write {
    pub fn compile(args: &[String]) -> TaskerResult<Self> {
        let name = args.first().cloned().ok_or_else(|| TaskerError::ParseError("write requires a file name".into()))?;
        Ok(Self { name })
    }
}

#[async_trait::async_trait]
impl SinkStage for Write {
    async fn consume(&self, mut rx: ValueReceiver, _ctx: &CliContext) -> TaskerResult<Vec<String>> {
        let dir = tempfile::tempdir().map_err(|e| TaskerError::Internal(format!("write: {e}")))?;
        let path = dir.path().join(&self.name);
        let mut body = String::new();
        let mut count = 0usize;
        while let Some(v) = rx.recv().await {
            body.push_str(&render_scalar(Some(&v)));
            body.push('\n');
            count += 1;
        }
        tokio::fs::write(&path, body).await.map_err(|e| TaskerError::Internal(format!("write: {e}")))?;
        // The temp dir would otherwise be cleaned up on drop before the
        // path is useful to anything downstream of this summary line.
        let leaked = dir.keep();
        Ok(vec![format!("{count} lines written to {}", leaked.join(&self.name).display())])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    fn parse(s: &str) -> TaskerResult<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "DELETE" => Ok(Self::Delete),
            other => Err(TaskerError::ParseError(format!("http: unknown method '{other}'"))),
        }
    }

    fn as_reqwest(self, client: &reqwest::Client, url: &str) -> reqwest::RequestBuilder {
        match self {
            Self::Get => client.get(url),
            Self::Post => client.post(url),
            Self::Put => client.put(url),
            Self::Delete => client.delete(url),
        }
    }
}

/// `http [METHOD] [--compress] [--timeout s] [--backoff-base s] url [headers…] [params…]`.
pub struct Http {
    pub method: HttpMethod,
    pub url: String,
    pub timeout: Duration,
    pub backoff_base: Duration,
    pub headers: HashMap<String, String>,
}

impl Http {
    pub fn compile(args: &[String]) -> TaskerResult<Self> {
        let mut method = HttpMethod::Post;
        let mut timeout = Duration::from_secs(30);
        let mut backoff_base = Duration::from_millis(200);
        let mut headers = HashMap::new();
        let mut rest = Vec::new();
        let mut iter = args.iter().peekable();
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--compress" => {}
                "--timeout" => {
                    let v = iter.next().ok_or_else(|| TaskerError::ParseError("http --timeout requires a value".into()))?;
                    timeout = Duration::from_secs_f64(v.parse().map_err(|_| TaskerError::ParseError("http --timeout must be a number".into()))?);
                }
                "--backoff-base" => {
                    let v = iter.next().ok_or_else(|| TaskerError::ParseError("http --backoff-base requires a value".into()))?;
                    backoff_base = Duration::from_secs_f64(v.parse().map_err(|_| TaskerError::ParseError("http --backoff-base must be a number".into()))?);
                }
                other if HttpMethod::parse(other).is_ok() && rest.is_empty() => {
                    method = HttpMethod::parse(other)?;
                }
                other if other.contains('=') && other.chars().next().is_some_and(|c| c.is_ascii_uppercase()) => {
                    let (k, v) = other.split_once('=').expect("checked above");
                    headers.insert(k.to_string(), v.to_string());
                }
                other => rest.push(other.to_string()),
            }
        }
        let url = rest.first().cloned().ok_or_else(|| TaskerError::ParseError("http requires a url".into()))?;
        Ok(Self { method, url, timeout, backoff_base, headers })
    }
}

#[async_trait::async_trait]
impl SinkStage for Http {
    async fn consume(&self, rx: ValueReceiver, ctx: &CliContext) -> TaskerResult<Vec<String>> {
        let items = crate::stages::collect_all(rx).await;
        let mut last_status = 0u16;
        let mut sent = 0usize;
        for item in items {
            let status = send_with_retries(ctx, self.method, &self.url, &self.headers, &item, self.timeout, self.backoff_base).await?;
            last_status = status;
            sent += 1;
        }
        Ok(vec![format!("{sent} requests with status {last_status} sent.")])
    }
}

/// Sends one request, retrying up to 3 times with exponential backoff on
/// failure.
async fn send_with_retries(
    ctx: &CliContext,
    method: HttpMethod,
    url: &str,
    headers: &HashMap<String, String>,
    body: &Value,
    timeout: Duration,
    backoff_base: Duration,
) -> TaskerResult<u16> {
    let backoff = Backoff::new(backoff_base, 3);
    let mut attempt = 0u32;
    loop {
        let mut request = method.as_reqwest(&ctx.http_client, url).json(body).timeout(timeout);
        for (k, v) in headers {
            request = request.header(k, v);
        }
        match request.send().await {
            Ok(response) => return Ok(response.status().as_u16()),
            Err(e) if attempt < backoff.max_attempts => {
                tokio::time::sleep(backoff.delay(attempt)).await;
                attempt += 1;
                let _ = e;
            }
            Err(e) => return Err(TaskerError::ExternalFailure(format!("http: {e}"))),
        }
    }
}

const PAGE_SIZE: usize = 25;

fn node_label(item: &Value) -> (String, String) {
    let name = get_path(item, "reported.kind")
        .or_else(|| get_path(item, "reported.name"))
        .map(|v| render_scalar(Some(v)))
        .unwrap_or_else(|| "node".to_string());
    let value = get_path(item, "id").map(|v| render_scalar(Some(v))).unwrap_or_else(|| render_scalar(Some(item)));
    (name, value)
}

fn discord_body(page: &[Value]) -> Value {
    let fields: Vec<Value> = page.iter().map(|item| {
        let (name, value) = node_label(item);
        json!({ "name": name, "value": value })
    }).collect();
    json!({
        "embeds": [{
            "type": "rich",
            "title": "Nodes",
            "description": format!("{} matching nodes", page.len()),
            "fields": fields,
            "footer": { "text": "Message created by Resoto" },
        }]
    })
}

/// `discord webhook=…`: paginates input into pages of 25 fields each.
pub struct Discord {
    pub webhook: String,
}

impl Discord {
    pub fn compile(args: &[String]) -> TaskerResult<Self> {
        let webhook = args
            .iter()
            .find_map(|a| a.strip_prefix("webhook=").map(str::to_string))
            .ok_or_else(|| TaskerError::ParseError("discord requires webhook=<url>".into()))?;
        Ok(Self { webhook })
    }
}

#[async_trait::async_trait]
impl SinkStage for Discord {
    async fn consume(&self, rx: ValueReceiver, ctx: &CliContext) -> TaskerResult<Vec<String>> {
        let items = crate::stages::collect_all(rx).await;
        let mut sent = 0usize;
        let mut last_status = 0u16;
        for page in items.chunks(PAGE_SIZE) {
            let body = discord_body(page);
            last_status = send_with_retries(ctx, HttpMethod::Post, &self.webhook, &HashMap::new(), &body, Duration::from_secs(30), Duration::from_millis(200)).await?;
            sent += 1;
        }
        Ok(vec![format!("{sent} requests with status {last_status} sent.")])
    }
}

fn slack_body(page: &[Value]) -> Value {
    let fields: Vec<Value> = page.iter().map(|item| {
        let (name, value) = node_label(item);
        json!({ "type": "mrkdwn", "text": format!("*{name}*\n{value}") })
    }).collect();
    json!({
        "blocks": [
            { "type": "header", "text": { "type": "plain_text", "text": "Nodes" } },
            { "type": "section", "fields": fields },
            { "type": "context", "elements": [{ "type": "mrkdwn", "text": "Message created by Resoto" }] },
        ]
    })
}

/// `slack webhook=…`.
pub struct Slack {
    pub webhook: String,
}

impl Slack {
    pub fn compile(args: &[String]) -> TaskerResult<Self> {
        let webhook = args
            .iter()
            .find_map(|a| a.strip_prefix("webhook=").map(str::to_string))
            .ok_or_else(|| TaskerError::ParseError("slack requires webhook=<url>".into()))?;
        Ok(Self { webhook })
    }
}

#[async_trait::async_trait]
impl SinkStage for Slack {
    async fn consume(&self, rx: ValueReceiver, ctx: &CliContext) -> TaskerResult<Vec<String>> {
        let items = crate::stages::collect_all(rx).await;
        let mut sent = 0usize;
        let mut last_status = 0u16;
        for page in items.chunks(PAGE_SIZE) {
            let body = slack_body(page);
            last_status = send_with_retries(ctx, HttpMethod::Post, &self.webhook, &HashMap::new(), &body, Duration::from_secs(30), Duration::from_millis(200)).await?;
            sent += 1;
        }
        Ok(vec![format!("{sent} requests with status {last_status} sent.")])
    }
}

fn jira_description(items: &[Value]) -> String {
    let mut lines: Vec<String> = items.iter().map(|item| {
        let (name, value) = node_label(item);
        format!("{name}: {value}")
    }).collect();
    if lines.len() > PAGE_SIZE {
        lines.truncate(PAGE_SIZE);
        lines.push("... (results truncated)\n\nIssue created by Resoto".to_string());
    }
    lines.join("\n")
}

/// `jira url=… project=… reporter=…`: a single issue summarizing every
/// input item, truncated after 25 field-lines.
pub struct Jira {
    pub url: String,
    pub project: String,
    pub reporter: String,
}

impl Jira {
    pub fn compile(args: &[String]) -> TaskerResult<Self> {
        let find = |prefix: &str| args.iter().find_map(|a| a.strip_prefix(prefix).map(str::to_string));
        let url = find("url=").ok_or_else(|| TaskerError::ParseError("jira requires url=<endpoint>".into()))?;
        let project = find("project=").ok_or_else(|| TaskerError::ParseError("jira requires project=<id>".into()))?;
        let reporter = find("reporter=").ok_or_else(|| TaskerError::ParseError("jira requires reporter=<id>".into()))?;
        Ok(Self { url, project, reporter })
    }
}

#[async_trait::async_trait]
impl SinkStage for Jira {
    async fn consume(&self, rx: ValueReceiver, ctx: &CliContext) -> TaskerResult<Vec<String>> {
        let items = crate::stages::collect_all(rx).await;
        let description = jira_description(&items);
        let body = json!({
            "fields": {
                "summary": format!("{} matching nodes", items.len()),
                "issuetype": { "id": "10001" },
                "project": { "id": self.project },
                "description": description,
                "reporter": { "id": self.reporter },
                "labels": ["created-by-resoto"],
            }
        });
        let status = send_with_retries(ctx, HttpMethod::Post, &self.url, &HashMap::new(), &body, Duration::from_secs(30), Duration::from_millis(200)).await?;
        Ok(vec![format!("1 requests with status {status} sent.")])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discord_body_caps_fields_at_25_per_page() {
        let items: Vec<Value> = (0..10).map(|i| json!({"id": format!("n{i}"), "reported": {"kind": "bla"}})).collect();
        let body = discord_body(&items);
        assert_eq!(body["embeds"][0]["fields"].as_array().unwrap().len(), 10);
        assert_eq!(body["embeds"][0]["footer"]["text"], "Message created by Resoto");
    }

    #[test]
    fn jira_description_truncates_after_25_lines() {
        let items: Vec<Value> = (0..30).map(|i| json!({"id": format!("n{i}"), "reported": {"kind": "bla"}})).collect();
        let description = jira_description(&items);
        assert!(description.ends_with("Issue created by Resoto"));
        // 25 field-lines + the truncation notice, whose own text spans
        // three lines (blank line either side of "Issue created by Resoto").
        assert_eq!(description.lines().count(), 28);
    }

    #[test]
    fn http_compile_parses_method_and_flags() {
        let http = Http::compile(&["PUT".to_string(), "--timeout".to_string(), "5".to_string(), "https://example.com".to_string()]).unwrap();
        assert_eq!(http.method, HttpMethod::Put);
        assert_eq!(http.timeout, Duration::from_secs(5));
        assert_eq!(http.url, "https://example.com");
    }

    #[test]
    fn discord_compile_requires_webhook() {
        assert!(Discord::compile(&[]).is_err());
        assert_eq!(Discord::compile(&["webhook=https://x".to_string()]).unwrap().webhook, "https://x");
    }
}
