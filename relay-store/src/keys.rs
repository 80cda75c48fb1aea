//! Persisted key layout.
//!
//! ```text
//! circuit:{service}:state | :failures | :opened_at
//! queue:{name}            sorted set of pending job ids, scored by priority
//! processing:{name}       set of claimed job ids
//! job:{id}                job record
//! queues                  set of queue names seen by push
//! stream_ticket:{ticket}  ticket record (TTL)
//! stream_ticket:{ticket}:used
//! idempotency:{sha256(key)}
//! ```

use sha2::{Digest, Sha256};

pub const QUEUES: &str = "queues";

pub fn circuit_state(service: &str) -> String {
    format!("circuit:{service}:state")
}

pub fn circuit_failures(service: &str) -> String {
    format!("circuit:{service}:failures")
}

pub fn circuit_opened_at(service: &str) -> String {
    format!("circuit:{service}:opened_at")
}

pub fn queue(name: &str) -> String {
    format!("queue:{name}")
}

pub fn processing(name: &str) -> String {
    format!("processing:{name}")
}

pub fn job(id: &str) -> String {
    format!("job:{id}")
}

pub fn stream_ticket(ticket: &str) -> String {
    format!("stream_ticket:{ticket}")
}

pub fn stream_ticket_used(ticket: &str) -> String {
    format!("stream_ticket:{ticket}:used")
}

/// Client-supplied keys are hashed so arbitrary input never shapes the key space.
pub fn idempotency(key: &str) -> String {
    let mut h = Sha256::new();
    h.update(key.as_bytes());
    format!("idempotency:{}", hex::encode(h.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_keys_are_hashed() {
        let k = idempotency("order-42 / retry");
        assert!(k.starts_with("idempotency:"));
        assert_eq!(k.len(), "idempotency:".len() + 64);
        assert_eq!(k, idempotency("order-42 / retry"));
    }

    #[test]
    fn circuit_keys_follow_layout() {
        assert_eq!(circuit_state("vend"), "circuit:vend:state");
        assert_eq!(circuit_failures("vend"), "circuit:vend:failures");
        assert_eq!(circuit_opened_at("vend"), "circuit:vend:opened_at");
    }
}
