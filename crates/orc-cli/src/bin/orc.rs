//! `orc` — the interactive shell over the task orchestration core's
//! command pipeline.

use clap::Parser;
use orc_cli::context::{CliContext, PipelineExecutor};
use orc_cli::output;
use orc_engine::running_task_db::FileRunningTaskDb;
use orc_engine::{MessageBus, SubscriptionHandler, TaskHandler, TaskHandlerConfig, WorkerTaskQueue};
use orc_shared::config::OrcConfig;
use orc_shared::retry::Backoff;
use std::io::{BufRead, Write};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "orc", about = "Task orchestration core shell")]
struct Args {
    /// Run a single command line and exit instead of starting the REPL.
    #[arg(short = 'c', long)]
    command: Option<String>,

    /// Active section bare paths resolve against.
    #[arg(long, default_value = "reported")]
    section: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::try_init().ok();
    let args = Args::parse();

    let config = OrcConfig::load().unwrap_or_else(|e| {
        tracing::warn!("failed to load orc.toml, using defaults: {e}");
        OrcConfig::default()
    });

    let bus = MessageBus::new(config.bus.queue_capacity);
    let subscriptions = SubscriptionHandler::new(bus.clone());
    let db = Arc::new(FileRunningTaskDb::at_path(&config.persistence.running_task_db_path));
    let task_handler = TaskHandler::new(bus.clone(), subscriptions.clone(), db, TaskHandlerConfig::default());
    let worker_queue = WorkerTaskQueue::new(Backoff::new(
        Duration::from_millis(config.worker_queue.retry_base_ms),
        config.worker_queue.max_retries,
    ));

    let mut ctx = CliContext::new(bus, subscriptions, task_handler.clone(), worker_queue);
    ctx.section = args.section;
    task_handler.install_command_executor(Arc::new(PipelineExecutor::new(ctx.clone()))).await;

    if let Some(line) = args.command {
        run_and_report(&line, ctx).await;
        return;
    }

    output::header("orc — task orchestration core shell");
    output::dim("type 'quit' to exit");
    let stdin = std::io::stdin();
    loop {
        print!("orc> ");
        std::io::stdout().flush().ok();
        let mut line = String::new();
        if stdin.lock().read_line(&mut line).unwrap_or(0) == 0 {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "quit" {
            break;
        }
        run_and_report(line, ctx.clone()).await;
    }
}

async fn run_and_report(line: &str, ctx: CliContext) {
    match orc_cli::run_line(line, ctx).await {
        Ok(pipelines) => {
            for lines in pipelines {
                for entry in lines {
                    output::plain(entry);
                }
            }
        }
        Err(e) => output::error(format!("{}: {e}", e.kind())),
    }
}
