use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use relay_core::observability::init_logging;
use relay_core::{RelayConfig, RelayKernel, StoreBackend};
use relay_ledger::{tail, MemorySink};
use relay_store::MemoryStore;
use relay_tools::{EchoTool, FlakyTool, ToolRegistry};
use relay_types::{SystemClock, ToolRequest};
use serde_json::Value;
use tokio::sync::watch;

#[derive(Parser)]
#[command(name = "relay")]
struct Cli {
    /// SQLite database shared with the server and other workers.
    #[arg(long, global = true, default_value = "./relay.db")]
    store: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// In-memory walkthrough: inline call, idempotent replay, streamed call.
    Demo,
    Queue {
        #[command(subcommand)]
        action: QueueCommand,
    },
    Breaker {
        #[command(subcommand)]
        action: BreakerCommand,
    },
    Telemetry {
        #[command(subcommand)]
        action: TelemetryCommand,
    },
}

#[derive(Subcommand)]
enum QueueCommand {
    Push {
        queue: String,
        tool: String,
        /// JSON object passed to the tool.
        #[arg(long, default_value = "{}")]
        args: String,
        #[arg(long)]
        priority: Option<f64>,
    },
    Stats {
        queue: String,
    },
    Work {
        queue: String,
        /// Settle at most one job and exit.
        #[arg(long)]
        once: bool,
    },
}

#[derive(Subcommand)]
enum BreakerCommand {
    Status { service: String },
    Reset { service: String },
}

#[derive(Subcommand)]
enum TelemetryCommand {
    Tail {
        #[arg(long, default_value = "./telemetry.jsonl")]
        path: PathBuf,
        #[arg(long, default_value_t = 10)]
        lines: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = RelayConfig::load()?;
    init_logging(config.log_format);

    match cli.command {
        Command::Demo => demo(config).await?,
        Command::Queue { action } => {
            config.store.backend = StoreBackend::Sqlite;
            config.store.path = cli.store;
            let kernel = Arc::new(RelayKernel::from_config(config)?);
            match action {
                QueueCommand::Push {
                    queue,
                    tool,
                    args,
                    priority,
                } => {
                    let args: Value = serde_json::from_str(&args)?;
                    let opts = kernel.config().push_options(priority);
                    let id = kernel.enqueue(&queue, ToolRequest::new(tool, args), opts).await?;
                    println!("{id}");
                }
                QueueCommand::Stats { queue } => {
                    let stats = kernel.queue_stats(&queue).await?;
                    println!("{}", serde_json::to_string_pretty(&stats)?);
                }
                QueueCommand::Work { queue, once } => {
                    if once {
                        match kernel.process_next(&queue).await? {
                            Some(job) => println!("{}", serde_json::to_string_pretty(&job)?),
                            None => println!("queue {queue} is empty"),
                        }
                    } else {
                        let (tx, rx) = watch::channel(false);
                        let worker = {
                            let kernel = Arc::clone(&kernel);
                            tokio::spawn(async move { kernel.run_worker(&queue, rx).await })
                        };
                        tokio::signal::ctrl_c().await?;
                        let _ = tx.send(true);
                        worker.await?;
                    }
                }
            }
        }
        Command::Breaker { action } => {
            config.store.backend = StoreBackend::Sqlite;
            config.store.path = cli.store;
            let kernel = RelayKernel::from_config(config)?;
            let metrics = match action {
                BreakerCommand::Status { service } => kernel.circuit(&service).await,
                BreakerCommand::Reset { service } => kernel.reset_circuit(&service).await?,
            };
            println!("{}", serde_json::to_string_pretty(&metrics)?);
        }
        Command::Telemetry { action } => match action {
            TelemetryCommand::Tail { path, lines } => {
                for entry in tail(&path, lines)? {
                    println!("{}", serde_json::to_string(&entry)?);
                }
            }
        },
    }

    Ok(())
}

async fn demo(mut config: RelayConfig) -> anyhow::Result<()> {
    config.retry.initial_delay_ms = 50;
    config.retry.max_delay_ms = 200;
    let clock = Arc::new(SystemClock);
    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(EchoTool));
    tools.register(Arc::new(FlakyTool::new("flaky", 2)));
    let kernel = Arc::new(RelayKernel::new(
        config,
        Arc::new(MemoryStore::with_clock(clock.clone())),
        clock,
        Arc::new(MemorySink::new()),
        tools,
    ));

    let mut request = ToolRequest::new("flaky", serde_json::json!({"invoice": 1042}));
    request.idempotency_key = Some("demo-invoice-1042".into());

    let first = kernel.invoke(request.clone()).await?;
    println!("inline call (after retries): {}", serde_json::to_string(&first)?);
    let replay = kernel.invoke(request).await?;
    println!("idempotent replay:           {}", serde_json::to_string(&replay)?);

    let mut streamed = ToolRequest::new("echo", serde_json::json!({"report": "weekly"}));
    streamed.stream = true;
    let issued = kernel.issue_ticket(streamed).await?;
    println!("ticket issued: {}", serde_json::to_string_pretty(&issued)?);

    let mut events = kernel.stream(issued.ticket.clone());
    while let Some(event) = events.next().await {
        print!("{}", event.to_frame());
    }

    println!("replaying the same ticket:");
    let mut events = kernel.stream(issued.ticket);
    while let Some(event) = events.next().await {
        print!("{}", event.to_frame());
    }
    Ok(())
}
