//! One-time stream tickets and the server-sent event vocabulary.
//!
//! A caller asks for a streamed invocation and gets a ticket back instead of
//! a result. A second request redeems the ticket exactly once and receives the
//! phased event sequence for that invocation.

pub mod event;
pub mod ticket;

pub use event::{DoneStatus, Phase, SseDecoder, StreamEvent};
pub use ticket::{IssueResponse, TicketConfig, TicketError, TicketStore};
