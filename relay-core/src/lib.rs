//! The relay kernel: wires the shared store, policies, queue, tickets, telemetry
//! and tools together behind one API used by the HTTP server and the CLI.

use std::sync::Arc;
use std::time::Instant;

use relay_context::{Message, MessageId, Role, ThreadArena, ThreadView};
use relay_ledger::{IdempotencyCache, JsonlSink, NullSink, Outcome, Telemetry, TelemetrySink};
use relay_policy::{BreakerError, CircuitBreaker, CircuitMetrics, RetryPolicy};
use relay_queue::{AsyncQueue, JobQueue, PushOptions, QueueStats, Worker};
use relay_store::{MemoryStore, SharedStore, SqliteStore};
use relay_stream::{IssueResponse, StreamEvent, TicketStore};
use relay_tools::{EchoTool, HttpTool, Tool, ToolContext, ToolRegistry};
use relay_types::{new_request_id, Clock, ErrorCode, Job, SystemClock, ToolRequest};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{watch, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

pub mod config;
pub mod error;
pub mod observability;
mod session;
mod worker;

pub use config::{ConfigError, RelayConfig, StoreBackend};
pub use error::KernelError;

/// Events of one redeemed ticket, ending with exactly one `done`.
pub type EventStream = ReceiverStream<StreamEvent>;

/// Settled inline invocation.
#[derive(Clone, Debug, Serialize)]
pub struct Invocation {
    pub tool: String,
    pub request_id: String,
    pub result: Value,
    pub latency_ms: u64,
    /// True when the result was replayed from the idempotency cache.
    pub cached: bool,
}

pub struct RelayKernel {
    config: RelayConfig,
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    queue: Arc<AsyncQueue>,
    tickets: TicketStore,
    telemetry: Telemetry,
    idempotency: IdempotencyCache,
    tools: ToolRegistry,
    threads: Mutex<ThreadArena>,
}

impl RelayKernel {
    pub fn new(
        config: RelayConfig,
        store: Arc<dyn SharedStore>,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn TelemetrySink>,
        tools: ToolRegistry,
    ) -> Self {
        Self {
            breaker: CircuitBreaker::new(store.clone(), clock.clone(), config.breaker_config()),
            retry: config.retry_policy(),
            queue: Arc::new(AsyncQueue::new(store.clone(), clock.clone())),
            tickets: TicketStore::new(store.clone(), clock.clone(), config.ticket_config()),
            telemetry: Telemetry::new(sink),
            idempotency: IdempotencyCache::new(store.clone(), clock.clone(), config.idempotency_window()),
            threads: Mutex::new(ThreadArena::new(clock.clone())),
            tools,
            store,
            clock,
            config,
        }
    }

    /// Build store, telemetry sink and tool registry from configuration.
    pub fn from_config(config: RelayConfig) -> Result<Self, KernelError> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store: Arc<dyn SharedStore> = match config.store.backend {
            StoreBackend::Memory => Arc::new(MemoryStore::with_clock(clock.clone())),
            StoreBackend::Sqlite => Arc::new(SqliteStore::open_with_clock(&config.store.path, clock.clone())?),
        };
        let sink: Arc<dyn TelemetrySink> = match &config.telemetry.path {
            Some(path) => Arc::new(JsonlSink::open(path)?),
            None => {
                info!("no telemetry file configured, ledger entries are discarded");
                Arc::new(NullSink)
            }
        };
        let tools = default_tools(&config)?;
        info!(
            backend = ?config.store.backend,
            tools = ?tools.names(),
            "relay kernel configured"
        );
        Ok(Self::new(config, store, clock, sink, tools))
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn SharedStore> {
        self.store.clone()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.names()
    }

    /// Run a tool call inline: idempotency lookup, then breaker around retry
    /// around the tool, then telemetry and idempotency store on success.
    pub async fn invoke(&self, request: ToolRequest) -> Result<Invocation, KernelError> {
        request.validate()?;
        let tool = self.tool(&request.tool)?;
        let request_id = request.request_id.clone().unwrap_or_else(new_request_id);
        self.execute(
            tool,
            &request_id,
            &request.args,
            request.idempotency_key.as_deref(),
            request.thread_id.as_deref(),
        )
        .await
    }

    /// Mint a stream ticket for `request` without running it.
    pub async fn issue_ticket(&self, request: ToolRequest) -> Result<IssueResponse, KernelError> {
        request.validate()?;
        self.tool(&request.tool)?;
        if let Some(thread) = &request.thread_id {
            self.threads.lock().await.get(thread)?;
        }
        let ticket = self.tickets.issue(&request).await?;
        Ok(IssueResponse::new(&ticket, &self.config.tickets.events_path))
    }

    /// Redeem `ticket` and stream the phased events of its invocation.
    pub fn stream(self: &Arc<Self>, ticket: impl Into<String>) -> EventStream {
        session::spawn(self.clone(), ticket.into())
    }

    pub async fn enqueue(
        &self,
        queue: &str,
        request: ToolRequest,
        opts: PushOptions,
    ) -> Result<String, KernelError> {
        request.validate()?;
        self.tool(&request.tool)?;
        let payload =
            serde_json::to_value(&request).map_err(|e| KernelError::InvalidInput(e.to_string()))?;
        Ok(self.queue.push(queue, payload, opts).await?)
    }

    /// Claim and settle one job from `queue`, if any is pending.
    pub async fn process_next(self: &Arc<Self>, queue: &str) -> Result<Option<Job>, KernelError> {
        Ok(self.worker(queue).run_once().await?)
    }

    /// Drain `queue` until `shutdown` flips.
    pub async fn run_worker(self: &Arc<Self>, queue: &str, shutdown: watch::Receiver<bool>) {
        self.worker(queue)
            .with_idle_wait(self.config.poll_interval())
            .run(shutdown)
            .await
    }

    fn worker(self: &Arc<Self>, queue: &str) -> Worker {
        Worker::new(
            self.queue.clone(),
            queue,
            Arc::new(worker::ToolJobs::new(self.clone())),
        )
    }

    pub async fn queue_stats(&self, queue: &str) -> Result<QueueStats, KernelError> {
        Ok(self.queue.stats(queue).await?)
    }

    pub async fn list_queues(&self) -> Result<Vec<String>, KernelError> {
        Ok(self.queue.list_queues().await?)
    }

    pub async fn job(&self, id: &str) -> Result<Job, KernelError> {
        self.queue
            .get(id)
            .await?
            .ok_or_else(|| KernelError::Queue(relay_queue::QueueError::NotFound(id.to_string())))
    }

    pub async fn circuit(&self, service: &str) -> CircuitMetrics {
        self.breaker.metrics(service).await
    }

    pub async fn reset_circuit(&self, service: &str) -> Result<CircuitMetrics, KernelError> {
        self.breaker.reset(service).await?;
        Ok(self.breaker.metrics(service).await)
    }

    pub async fn create_thread(&self, tags: Vec<String>) -> Result<ThreadView, KernelError> {
        let mut threads = self.threads.lock().await;
        let id = threads.create(tags);
        Ok(threads.get(&id)?)
    }

    pub async fn append_message(
        &self,
        thread: &str,
        role: Role,
        content: String,
        meta: Value,
    ) -> Result<MessageId, KernelError> {
        Ok(self.threads.lock().await.append(thread, role, content, meta)?)
    }

    pub async fn fork_thread(&self, thread: &str, message_id: &str) -> Result<ThreadView, KernelError> {
        let mut threads = self.threads.lock().await;
        let id = threads.fork_from_message(thread, message_id)?;
        Ok(threads.get(&id)?)
    }

    pub async fn thread(&self, thread: &str) -> Result<ThreadView, KernelError> {
        Ok(self.threads.lock().await.get(thread)?)
    }

    fn tool(&self, name: &str) -> Result<Arc<dyn Tool>, KernelError> {
        self.tools
            .get(name)
            .ok_or_else(|| KernelError::UnknownTool(name.to_string()))
    }

    async fn thread_context(&self, thread: Option<&str>) -> Result<Vec<Arc<Message>>, KernelError> {
        match thread {
            Some(id) => Ok(self.threads.lock().await.messages(id)?),
            None => Ok(Vec::new()),
        }
    }

    pub(crate) async fn execute(
        &self,
        tool: Arc<dyn Tool>,
        request_id: &str,
        args: &Value,
        idempotency_key: Option<&str>,
        thread: Option<&str>,
    ) -> Result<Invocation, KernelError> {
        if let Some(key) = idempotency_key {
            if let Some(hit) = self.cached(key, tool.name(), request_id, args).await {
                return Ok(hit);
            }
        }
        let context = self.thread_context(thread).await?;

        let span = self.telemetry.tool_start(request_id, tool.name(), args);
        let started = Instant::now();
        let result = self
            .breaker
            .call(tool.service(), || {
                self.retry.run(|attempt| {
                    let ctx = ToolContext {
                        request_id: request_id.to_string(),
                        attempt: attempt.number,
                        thread: context.clone(),
                    };
                    let tool = tool.clone();
                    let args = args.clone();
                    async move { tool.invoke(&ctx, &args).await }
                })
            })
            .await;

        match (&result, tool.provider()) {
            // The provider was never contacted.
            (Err(BreakerError::Open { .. }), _) | (_, None) => {}
            (outcome, Some(provider)) => {
                let error = outcome.as_ref().err().map(|e| e.to_string());
                let elapsed = started.elapsed().as_millis() as u64;
                self.telemetry
                    .provider_request(request_id, provider, tool.name(), elapsed, error);
            }
        }

        match result {
            Ok(value) => {
                let latency_ms = self.telemetry.tool_finish(span, Outcome::Success(value.clone()));
                if let Some(key) = idempotency_key {
                    if let Err(e) = self
                        .idempotency
                        .store(key, tool.name(), request_id, &value)
                        .await
                    {
                        warn!(request_id, error = %e, "idempotency record not stored");
                    }
                }
                Ok(Invocation {
                    tool: tool.name().to_string(),
                    request_id: request_id.to_string(),
                    result: value,
                    latency_ms,
                    cached: false,
                })
            }
            Err(BreakerError::Open {
                service,
                retry_after_ms,
            }) => {
                self.telemetry.tool_finish(
                    span,
                    Outcome::Failed {
                        code: ErrorCode::CircuitOpen,
                        message: format!("circuit open for {service}"),
                    },
                );
                Err(KernelError::CircuitOpen {
                    service,
                    retry_after_ms,
                })
            }
            Err(BreakerError::Inner(e)) => {
                self.telemetry.tool_finish(
                    span,
                    Outcome::Failed {
                        code: e.code,
                        message: e.message.clone(),
                    },
                );
                Err(e.into())
            }
        }
    }

    async fn cached(&self, key: &str, tool: &str, request_id: &str, args: &Value) -> Option<Invocation> {
        let record = match self.idempotency.lookup(key).await {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(e) => {
                warn!(request_id, error = %e, "idempotency lookup failed, executing");
                return None;
            }
        };
        if record.tool != tool {
            warn!(request_id, cached_tool = %record.tool, tool, "idempotency key reused across tools, executing");
            return None;
        }
        let span = self.telemetry.tool_start(request_id, tool, args);
        let latency_ms = self.telemetry.tool_finish(span, Outcome::Cached(record.result.clone()));
        info!(request_id, original_request_id = %record.request_id, tool, "idempotent replay");
        Some(Invocation {
            tool: tool.to_string(),
            request_id: request_id.to_string(),
            result: record.result,
            latency_ms,
            cached: true,
        })
    }
}

/// `echo` plus every configured HTTP tool.
pub fn default_tools(config: &RelayConfig) -> Result<ToolRegistry, KernelError> {
    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(EchoTool));
    let matcher = config.transient_matcher();
    for http in &config.tools.http {
        tools.register(Arc::new(HttpTool::new(http.clone(), matcher.clone())?));
    }
    Ok(tools)
}
