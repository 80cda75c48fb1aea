use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use relay_context::Role;
use relay_core::{KernelError, RelayConfig, RelayKernel};
use relay_ledger::{tail, CallStatus, LedgerEntry, MemorySink};
use relay_queue::PushOptions;
use relay_store::MemoryStore;
use relay_stream::{DoneStatus, StreamEvent};
use relay_tools::{EchoTool, Tool, ToolContext, ToolRegistry};
use relay_types::{ErrorCode, ErrorKind, JobStatus, ManualClock, ToolError, ToolRequest};
use serde_json::{json, Value};
use tokio_stream::StreamExt;

struct Counting {
    name: &'static str,
    fail: Option<ErrorKind>,
    provider: Option<&'static str>,
    calls: AtomicU32,
}

impl Counting {
    fn ok(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            fail: None,
            provider: None,
            calls: AtomicU32::new(0),
        })
    }

    fn failing(name: &'static str, kind: ErrorKind) -> Arc<Self> {
        Arc::new(Self {
            name,
            fail: Some(kind),
            provider: None,
            calls: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Tool for Counting {
    fn name(&self) -> &str {
        self.name
    }

    fn provider(&self) -> Option<&str> {
        self.provider
    }

    async fn invoke(&self, ctx: &ToolContext, args: &Value) -> Result<Value, ToolError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        match self.fail {
            Some(ErrorKind::Transient) => Err(ToolError::transient("upstream timeout")),
            Some(ErrorKind::Permanent) => Err(ToolError::permanent("record rejected")),
            None => Ok(json!({ "call": n, "args": args, "attempt": ctx.attempt })),
        }
    }
}

struct Harness {
    kernel: Arc<RelayKernel>,
    clock: Arc<ManualClock>,
    sink: Arc<MemorySink>,
}

fn harness(tools: Vec<Arc<dyn Tool>>) -> Harness {
    let mut config = RelayConfig::default();
    config.retry.max_attempts = 1;
    config.breaker.threshold = 2;
    harness_with(config, tools)
}

fn harness_with(config: RelayConfig, tools: Vec<Arc<dyn Tool>>) -> Harness {
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));
    let sink = Arc::new(MemorySink::new());
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(EchoTool));
    for tool in tools {
        registry.register(tool);
    }
    let kernel = RelayKernel::new(config, store, clock.clone(), sink.clone(), registry);
    Harness {
        kernel: Arc::new(kernel),
        clock,
        sink,
    }
}

fn names(events: &[StreamEvent]) -> Vec<&'static str> {
    events.iter().map(StreamEvent::name).collect()
}

#[tokio::test]
async fn inline_call_records_telemetry() {
    let h = harness(vec![]);
    let mut req = ToolRequest::new("echo", json!({"q": 1}));
    req.request_id = Some("req-1".into());
    let inv = h.kernel.invoke(req).await.unwrap();
    assert_eq!(inv.result["echo"], json!({"q": 1}));
    assert!(!inv.cached);

    let entries = h.sink.entries();
    assert!(entries.iter().any(|e| matches!(e,
        LedgerEntry::ToolCall(r) if r.request_id == "req-1" && r.status == CallStatus::Success)));
}

#[tokio::test]
async fn invalid_and_unknown_requests() {
    let h = harness(vec![]);
    let err = h.kernel.invoke(ToolRequest::new("", json!({}))).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidInput);

    let err = h.kernel.invoke(ToolRequest::new("echo", json!([1, 2]))).await.unwrap_err();
    assert_eq!(err.code().status(), 400);

    let err = h.kernel.invoke(ToolRequest::new("nope", json!({}))).await.unwrap_err();
    assert!(matches!(err, KernelError::UnknownTool(_)));
}

#[tokio::test]
async fn idempotent_replay_skips_execution() {
    let tool = Counting::ok("ledger");
    let h = harness(vec![tool.clone()]);
    let mut req = ToolRequest::new("ledger", json!({"amount": 10}));
    req.idempotency_key = Some("pay-123".into());

    let first = h.kernel.invoke(req.clone()).await.unwrap();
    let second = h.kernel.invoke(req.clone()).await.unwrap();
    assert!(!first.cached);
    assert!(second.cached);
    assert_eq!(first.result, second.result);
    assert_eq!(tool.calls(), 1);

    h.clock.advance(Duration::from_secs(30 * 60));
    let third = h.kernel.invoke(req).await.unwrap();
    assert!(!third.cached);
    assert_eq!(tool.calls(), 2);
}

#[tokio::test]
async fn failures_are_not_cached() {
    let tool = Counting::failing("ledger", ErrorKind::Permanent);
    let h = harness(vec![tool.clone()]);
    let mut req = ToolRequest::new("ledger", json!({}));
    req.idempotency_key = Some("k".into());
    assert!(h.kernel.invoke(req.clone()).await.is_err());
    assert!(h.kernel.invoke(req).await.is_err());
    assert_eq!(tool.calls(), 2);
}

#[tokio::test]
async fn breaker_opens_after_transient_failures() {
    let tool = Counting::failing("crm", ErrorKind::Transient);
    let h = harness(vec![tool.clone()]);
    let req = ToolRequest::new("crm", json!({}));

    for _ in 0..2 {
        let err = h.kernel.invoke(req.clone()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ToolFailed);
    }
    let err = h.kernel.invoke(req.clone()).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::CircuitOpen);
    assert_eq!(err.retry_after_ms(), Some(60_000));
    assert_eq!(tool.calls(), 2);

    let metrics = h.kernel.circuit("crm").await;
    assert_eq!(metrics.failure_count, 2);
    h.kernel.reset_circuit("crm").await.unwrap();
    assert_eq!(h.kernel.invoke(req).await.unwrap_err().code(), ErrorCode::ToolFailed);
}

#[tokio::test]
async fn retry_runs_inside_one_breaker_call() {
    let mut config = RelayConfig::default();
    config.retry.max_attempts = 3;
    config.retry.initial_delay_ms = 1;
    config.retry.max_delay_ms = 2;
    config.breaker.threshold = 2;
    let tool = Counting::failing("crm", ErrorKind::Transient);
    let h = harness_with(config, vec![tool.clone()]);

    h.kernel.invoke(ToolRequest::new("crm", json!({}))).await.unwrap_err();
    assert_eq!(tool.calls(), 3);
    assert_eq!(h.kernel.circuit("crm").await.failure_count, 1);
}

#[tokio::test]
async fn provider_tools_record_provider_requests() {
    let tool = Arc::new(Counting {
        name: "chat",
        fail: None,
        provider: Some("llm-vendor"),
        calls: AtomicU32::new(0),
    });
    let h = harness(vec![tool]);
    h.kernel.invoke(ToolRequest::new("chat", json!({}))).await.unwrap();
    assert!(h.sink.entries().iter().any(|e| matches!(e,
        LedgerEntry::ProviderRequest(r) if r.provider == "llm-vendor" && r.error.is_none())));
}

#[tokio::test]
async fn ticket_streams_once() {
    let h = harness(vec![]);
    let mut req = ToolRequest::new("echo", json!({"q": "stream me"}));
    req.stream = true;
    let issued = h.kernel.issue_ticket(req).await.unwrap();
    assert!(issued.streaming);
    assert!(issued.sse_url.ends_with(&issued.ticket));

    let events: Vec<StreamEvent> = h.kernel.stream(issued.ticket.clone()).collect().await;
    assert_eq!(
        names(&events),
        vec!["start", "heartbeat", "phase", "phase", "result", "done"]
    );
    match &events[4] {
        StreamEvent::Result { success, data, .. } => {
            assert!(success);
            assert_eq!(data["echo"], json!({"q": "stream me"}));
        }
        other => panic!("expected result, got {other:?}"),
    }
    assert_eq!(events[5], StreamEvent::Done { status: DoneStatus::Ok });

    let replay: Vec<StreamEvent> = h.kernel.stream(issued.ticket).collect().await;
    assert_eq!(names(&replay), vec!["error", "done"]);
    assert!(matches!(&replay[0], StreamEvent::Error { code: ErrorCode::TicketUsed, .. }));
    assert_eq!(replay[1], StreamEvent::Done { status: DoneStatus::Error });
}

#[tokio::test]
async fn streamed_replay_with_same_key_uses_cached_result() {
    let tool = Counting::ok("ledger");
    let h = harness(vec![tool.clone()]);
    let mut req = ToolRequest::new("ledger", json!({"amount": 10}));
    req.stream = true;
    req.idempotency_key = Some("pay-stream-1".into());

    let first = h.kernel.issue_ticket(req.clone()).await.unwrap();
    let first: Vec<StreamEvent> = h.kernel.stream(first.ticket).collect().await;
    let second = h.kernel.issue_ticket(req.clone()).await.unwrap();
    let second: Vec<StreamEvent> = h.kernel.stream(second.ticket).collect().await;

    assert_eq!(names(&second), names(&first));
    let result_of = |events: &[StreamEvent]| match &events[4] {
        StreamEvent::Result { success: true, data, .. } => data.clone(),
        other => panic!("expected result, got {other:?}"),
    };
    assert_eq!(result_of(&second), result_of(&first));
    assert_eq!(result_of(&second)["call"], json!(1));
    assert_eq!(tool.calls(), 1);
    assert!(h.sink.entries().iter().any(|e| matches!(e,
        LedgerEntry::ToolCall(r) if r.tool == "ledger" && r.status == CallStatus::Cached)));

    req.stream = false;
    assert!(h.kernel.invoke(req).await.unwrap().cached);
    assert_eq!(tool.calls(), 1);
}

#[tokio::test]
async fn expired_and_unknown_tickets_end_with_done() {
    let h = harness(vec![]);
    let issued = h.kernel.issue_ticket(ToolRequest::new("echo", json!({}))).await.unwrap();
    h.clock.advance(Duration::from_secs(301));

    let events: Vec<StreamEvent> = h.kernel.stream(issued.ticket).collect().await;
    assert!(matches!(&events[0], StreamEvent::Error { code: ErrorCode::TicketExpired, .. }));
    assert_eq!(events.iter().filter(|e| e.is_done()).count(), 1);

    let events: Vec<StreamEvent> = h.kernel.stream("0000").collect().await;
    assert!(matches!(&events[0], StreamEvent::Error { code: ErrorCode::TicketNotFound, .. }));
    assert!(events.last().unwrap().is_done());
}

#[tokio::test]
async fn tool_failure_mid_stream() {
    let tool = Counting::failing("crm", ErrorKind::Permanent);
    let h = harness(vec![tool]);
    let issued = h.kernel.issue_ticket(ToolRequest::new("crm", json!({}))).await.unwrap();
    let events: Vec<StreamEvent> = h.kernel.stream(issued.ticket).collect().await;
    assert_eq!(names(&events), vec!["start", "heartbeat", "phase", "error", "done"]);
    assert!(matches!(&events[3], StreamEvent::Error { code: ErrorCode::ToolFailed, .. }));
}

#[tokio::test]
async fn issue_rejects_unknown_tool() {
    let h = harness(vec![]);
    let err = h.kernel.issue_ticket(ToolRequest::new("nope", json!({}))).await.unwrap_err();
    assert_eq!(err.code().status(), 404);
}

#[tokio::test]
async fn queued_jobs_run_through_the_kernel() {
    let failing = Counting::failing("crm", ErrorKind::Permanent);
    let h = harness(vec![failing]);

    let ok_id = h
        .kernel
        .enqueue("reports", ToolRequest::new("echo", json!({"n": 1})), PushOptions::default())
        .await
        .unwrap();
    let job = h.kernel.process_next("reports").await.unwrap().unwrap();
    assert_eq!(job.id, ok_id);
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result.unwrap()["echo"], json!({"n": 1}));

    h.kernel
        .enqueue(
            "reports",
            ToolRequest::new("crm", json!({})),
            PushOptions { priority: 1.0, max_attempts: 1 },
        )
        .await
        .unwrap();
    let job = h.kernel.process_next("reports").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(h.kernel.process_next("reports").await.unwrap().is_none());

    assert_eq!(h.kernel.list_queues().await.unwrap(), vec!["reports"]);
    assert_eq!(h.kernel.job(&ok_id).await.unwrap().status, JobStatus::Completed);
    assert_eq!(h.kernel.job("missing").await.unwrap_err().code(), ErrorCode::NotFound);
}

#[tokio::test]
async fn thread_context_reaches_the_tool() {
    let h = harness(vec![]);
    let thread = h.kernel.create_thread(vec!["support".into()]).await.unwrap();
    let first = h
        .kernel
        .append_message(&thread.id, Role::User, "hello".into(), Value::Null)
        .await
        .unwrap();
    h.kernel
        .append_message(&thread.id, Role::Assistant, "hi there".into(), Value::Null)
        .await
        .unwrap();

    let fork = h.kernel.fork_thread(&thread.id, &first).await.unwrap();
    assert_eq!(fork.messages.len(), 1);
    assert_eq!(fork.parent_id.as_deref(), Some(thread.id.as_str()));

    let mut req = ToolRequest::new("echo", json!({}));
    req.thread_id = Some(thread.id.clone());
    let inv = h.kernel.invoke(req).await.unwrap();
    assert_eq!(inv.result["context_messages"], json!(2));

    let mut req = ToolRequest::new("echo", json!({}));
    req.thread_id = Some("ghost".into());
    assert_eq!(h.kernel.invoke(req).await.unwrap_err().code(), ErrorCode::NotFound);
}

#[tokio::test]
async fn configured_kernel_writes_the_ledger_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.jsonl");
    let mut config = RelayConfig::default();
    config.telemetry.path = Some(path.clone());
    let kernel = RelayKernel::from_config(config).unwrap();
    kernel.invoke(ToolRequest::new("echo", json!({"n": 1}))).await.unwrap();

    let entries = tail(&path, 10).unwrap();
    assert_eq!(entries.len(), 2);
    assert!(matches!(&entries[0], LedgerEntry::ToolCall(r) if r.tool == "echo"));
    assert!(matches!(&entries[1], LedgerEntry::Usage(_)));

    let quiet = RelayKernel::from_config(RelayConfig::default()).unwrap();
    let inv = quiet.invoke(ToolRequest::new("echo", json!({}))).await.unwrap();
    assert_eq!(inv.tool, "echo");
}
