use std::sync::Arc;
use std::time::Instant;

use relay_stream::{DoneStatus, Phase, StreamEvent};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::{EventStream, KernelError, RelayKernel};

pub(crate) fn spawn(kernel: Arc<RelayKernel>, ticket: String) -> EventStream {
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        let session = Session { tx };
        let status = match run(&kernel, &session, &ticket).await {
            Ok(()) => DoneStatus::Ok,
            Err(e) => {
                session.emit(StreamEvent::error(e.code(), e.to_string())).await;
                DoneStatus::Error
            }
        };
        session.emit(StreamEvent::Done { status }).await;
    });
    ReceiverStream::new(rx)
}

struct Session {
    tx: mpsc::Sender<StreamEvent>,
}

impl Session {
    /// A closed receiver means the client went away; emission stops silently.
    async fn emit(&self, event: StreamEvent) {
        if self.tx.send(event).await.is_err() {
            debug!("stream client disconnected");
        }
    }
}

async fn run(kernel: &RelayKernel, session: &Session, ticket: &str) -> Result<(), KernelError> {
    // The claim happens before any event, so a replayed ticket never starts work.
    let ticket = kernel.tickets.redeem(ticket).await?;
    let tool = kernel.tool(&ticket.tool_name)?;

    session
        .emit(StreamEvent::Start {
            request_id: ticket.request_id.clone(),
            tool: ticket.tool_name.clone(),
        })
        .await;
    session
        .emit(StreamEvent::Heartbeat {
            ts: kernel.clock.now_ms(),
        })
        .await;
    session
        .emit(StreamEvent::Phase {
            phase: Phase::Invoking,
        })
        .await;

    if session.tx.is_closed() {
        debug!(request_id = %ticket.request_id, "client gone before invocation, skipping");
        return Ok(());
    }

    let started = Instant::now();
    let outcome = kernel
        .execute(
            tool,
            &ticket.request_id,
            &ticket.arguments,
            ticket.idempotency_key.as_deref(),
            ticket.thread_id.as_deref(),
        )
        .await?;

    session
        .emit(StreamEvent::Phase {
            phase: Phase::Processing,
        })
        .await;
    session
        .emit(StreamEvent::Result {
            success: true,
            data: outcome.result,
            duration_ms: started.elapsed().as_millis() as u64,
        })
        .await;
    Ok(())
}
