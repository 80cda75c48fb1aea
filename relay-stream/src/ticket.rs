use std::sync::Arc;
use std::time::Duration;

use rand::rngs::OsRng;
use rand::RngCore;
use relay_store::{keys, SharedStore, StoreError};
use relay_types::{new_request_id, Clock, ErrorCode, StreamTicket, ToolRequest};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const TICKET_BYTES: usize = 32;

#[derive(Debug, Error)]
pub enum TicketError {
    #[error("ticket not found")]
    NotFound,
    #[error("ticket already used")]
    AlreadyUsed,
    #[error("ticket expired")]
    Expired,
    #[error("ticket record corrupt: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TicketError {
    pub fn code(&self) -> ErrorCode {
        match self {
            TicketError::NotFound => ErrorCode::TicketNotFound,
            TicketError::AlreadyUsed => ErrorCode::TicketUsed,
            TicketError::Expired => ErrorCode::TicketExpired,
            TicketError::Corrupt(_) | TicketError::Store(_) => ErrorCode::Internal,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct TicketConfig {
    /// How long a ticket stays redeemable.
    pub ttl: Duration,
    /// How long the record outlives its expiry, so late redemptions still
    /// report `Expired` instead of `NotFound`.
    pub retention: Duration,
}

impl Default for TicketConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5 * 60),
            retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Ticket issuance body returned in place of a result.
#[derive(Clone, Debug, Serialize)]
pub struct IssueResponse {
    pub streaming: bool,
    pub ticket: String,
    pub sse_url: String,
    pub expires_at: u64,
    pub instructions: String,
}

impl IssueResponse {
    pub fn new(ticket: &StreamTicket, events_path: &str) -> Self {
        Self {
            streaming: true,
            ticket: ticket.ticket.clone(),
            sse_url: format!("{events_path}?ticket={}", ticket.ticket),
            expires_at: ticket.expires_at,
            instructions: format!(
                "Open {events_path}?ticket=<ticket> with Accept: text/event-stream. \
                 The ticket is single-use and expires at {} (epoch ms).",
                ticket.expires_at
            ),
        }
    }
}

/// Issues and redeems stream tickets against the shared store.
pub struct TicketStore {
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    config: TicketConfig,
}

impl TicketStore {
    pub fn new(store: Arc<dyn SharedStore>, clock: Arc<dyn Clock>, config: TicketConfig) -> Self {
        Self { store, clock, config }
    }

    pub fn config(&self) -> &TicketConfig {
        &self.config
    }

    /// Mint a ticket for `request` without performing any work.
    pub async fn issue(&self, request: &ToolRequest) -> Result<StreamTicket, TicketError> {
        let mut bytes = [0u8; TICKET_BYTES];
        OsRng.fill_bytes(&mut bytes);

        let now = self.clock.now_ms();
        let ticket = StreamTicket {
            ticket: hex::encode(bytes),
            tool_name: request.tool.clone(),
            arguments: request.args.clone(),
            request_id: request.request_id.clone().unwrap_or_else(new_request_id),
            idempotency_key: request.idempotency_key.clone(),
            thread_id: request.thread_id.clone(),
            created_at: now,
            expires_at: now + self.config.ttl.as_millis() as u64,
            used_at: None,
        };
        self.save(&ticket, self.config.ttl + self.config.retention).await?;
        info!(request_id = %ticket.request_id, tool = %ticket.tool_name, "stream ticket issued");
        Ok(ticket)
    }

    /// Claim a ticket. Only the first caller succeeds; expiry wins over prior use.
    pub async fn redeem(&self, ticket: &str) -> Result<StreamTicket, TicketError> {
        let mut record = self.load(ticket).await?.ok_or(TicketError::NotFound)?;
        let now = self.clock.now_ms();
        if record.is_expired(now) {
            debug!(request_id = %record.request_id, "expired ticket presented");
            return Err(TicketError::Expired);
        }

        let keep = self.remaining_retention(&record, now);
        let claimed = self
            .store
            .set_if_absent(&keys::stream_ticket_used(ticket), &now.to_string(), Some(keep))
            .await?;
        if !claimed {
            warn!(request_id = %record.request_id, "ticket replay rejected");
            return Err(TicketError::AlreadyUsed);
        }

        record.used_at = Some(now);
        self.save(&record, keep).await?;
        info!(request_id = %record.request_id, tool = %record.tool_name, "stream ticket redeemed");
        Ok(record)
    }

    /// Read a ticket record without claiming it.
    pub async fn peek(&self, ticket: &str) -> Result<Option<StreamTicket>, TicketError> {
        self.load(ticket).await
    }

    fn remaining_retention(&self, record: &StreamTicket, now: u64) -> Duration {
        let until = record.expires_at + self.config.retention.as_millis() as u64;
        Duration::from_millis(until.saturating_sub(now).max(1))
    }

    async fn load(&self, ticket: &str) -> Result<Option<StreamTicket>, TicketError> {
        if ticket.is_empty() {
            return Ok(None);
        }
        let Some(raw) = self.store.get(&keys::stream_ticket(ticket)).await? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| TicketError::Corrupt(e.to_string()))
    }

    async fn save(&self, ticket: &StreamTicket, ttl: Duration) -> Result<(), TicketError> {
        let raw = serde_json::to_string(ticket).map_err(|e| TicketError::Corrupt(e.to_string()))?;
        self.store
            .set(&keys::stream_ticket(&ticket.ticket), &raw, Some(ttl))
            .await?;
        Ok(())
    }
}
