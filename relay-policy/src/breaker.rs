use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use relay_store::{keys, SharedStore, StoreError};
use relay_types::{CircuitState, Classify, Clock, ErrorKind};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug)]
pub struct BreakerConfig {
    /// Consecutive transient failures that open the circuit.
    pub threshold: u32,
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Error)]
pub enum BreakerError<E> {
    #[error("circuit open for {service}, retry in {retry_after_ms}ms")]
    Open { service: String, retry_after_ms: u64 },
    #[error("{0}")]
    Inner(E),
}

impl<E: Classify> Classify for BreakerError<E> {
    fn kind(&self) -> ErrorKind {
        match self {
            // Retryable by the caller once the cooldown passes.
            BreakerError::Open { .. } => ErrorKind::Transient,
            BreakerError::Inner(e) => e.kind(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CircuitMetrics {
    pub service: String,
    pub state: CircuitState,
    pub failure_count: u32,
    /// Zero unless the circuit is open.
    pub time_until_reset_ms: u64,
}

#[derive(Clone, Copy, Debug)]
struct Snapshot {
    state: CircuitState,
    failures: u32,
    opened_at: Option<u64>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            opened_at: None,
        }
    }
}

/// Per-service circuit breaker whose state lives entirely in the shared store.
///
/// Nothing is cached between calls: each `call` reads the current state, runs
/// (or refuses) the operation and writes the transition back. Callers racing on
/// the same service may both probe while `half_open`.
///
/// Store failures never fail the wrapped call; the breaker then behaves as closed.
pub struct CircuitBreaker {
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    config: BreakerConfig,
}

impl CircuitBreaker {
    pub fn new(store: Arc<dyn SharedStore>, clock: Arc<dyn Clock>, config: BreakerConfig) -> Self {
        Self {
            store,
            clock,
            config: BreakerConfig {
                threshold: config.threshold.max(1),
                ..config
            },
        }
    }

    pub fn config(&self) -> BreakerConfig {
        self.config
    }

    pub async fn call<T, E, F, Fut>(&self, service: &str, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify,
    {
        let now = self.clock.now_ms();
        let snap = self.load(service).await;
        let mut state = snap.state;

        if state == CircuitState::Open {
            let reopen_at = snap
                .opened_at
                .unwrap_or(0)
                .saturating_add(self.reset_ms());
            if now < reopen_at {
                debug!(service, retry_after_ms = reopen_at - now, "circuit open, failing fast");
                return Err(BreakerError::Open {
                    service: service.to_string(),
                    retry_after_ms: reopen_at - now,
                });
            }
            self.enter_half_open(service).await;
            state = CircuitState::HalfOpen;
        }

        match op().await {
            Ok(value) => {
                if state != CircuitState::Closed || snap.failures > 0 {
                    self.close(service, state).await;
                }
                Ok(value)
            }
            Err(e) => {
                // Caller errors say nothing about the service's health.
                if e.is_transient() {
                    self.record_failure(service, state).await;
                }
                Err(BreakerError::Inner(e))
            }
        }
    }

    pub async fn metrics(&self, service: &str) -> CircuitMetrics {
        let now = self.clock.now_ms();
        let snap = self.load(service).await;
        let time_until_reset_ms = match (snap.state, snap.opened_at) {
            (CircuitState::Open, Some(at)) => at.saturating_add(self.reset_ms()).saturating_sub(now),
            _ => 0,
        };
        CircuitMetrics {
            service: service.to_string(),
            state: snap.state,
            failure_count: snap.failures,
            time_until_reset_ms,
        }
    }

    /// Force the circuit closed regardless of its current state.
    pub async fn reset(&self, service: &str) -> Result<(), StoreError> {
        self.store
            .set(&keys::circuit_state(service), CircuitState::Closed.as_str(), None)
            .await?;
        self.store.set(&keys::circuit_failures(service), "0", None).await?;
        self.store.delete(&keys::circuit_opened_at(service)).await?;
        info!(service, "circuit reset");
        Ok(())
    }

    fn reset_ms(&self) -> u64 {
        self.config.reset_timeout.as_millis() as u64
    }

    async fn load(&self, service: &str) -> Snapshot {
        match self.try_load(service).await {
            Ok(snap) => snap,
            Err(e) => {
                warn!(service, error = %e, "circuit state unreadable, treating as closed");
                Snapshot::default()
            }
        }
    }

    async fn try_load(&self, service: &str) -> Result<Snapshot, StoreError> {
        let state = self
            .store
            .get(&keys::circuit_state(service))
            .await?
            .and_then(|s| CircuitState::parse(&s))
            .unwrap_or(CircuitState::Closed);
        let failures = self
            .store
            .get(&keys::circuit_failures(service))
            .await?
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let opened_at = self
            .store
            .get(&keys::circuit_opened_at(service))
            .await?
            .and_then(|s| s.parse().ok());
        Ok(Snapshot {
            state,
            failures,
            opened_at,
        })
    }

    async fn enter_half_open(&self, service: &str) {
        let res = async {
            self.store
                .set(&keys::circuit_state(service), CircuitState::HalfOpen.as_str(), None)
                .await?;
            self.store.delete(&keys::circuit_opened_at(service)).await?;
            Ok::<_, StoreError>(())
        }
        .await;
        log_write(service, res);
        info!(service, "circuit half-open, probing");
    }

    async fn open(&self, service: &str, now: u64) {
        // opened_at first so anyone who sees `open` can compute the cooldown.
        let res = async {
            self.store
                .set(&keys::circuit_opened_at(service), &now.to_string(), None)
                .await?;
            self.store
                .set(&keys::circuit_state(service), CircuitState::Open.as_str(), None)
                .await?;
            Ok::<_, StoreError>(())
        }
        .await;
        log_write(service, res);
    }

    async fn close(&self, service: &str, from: CircuitState) {
        let res = async {
            self.store
                .set(&keys::circuit_state(service), CircuitState::Closed.as_str(), None)
                .await?;
            self.store.set(&keys::circuit_failures(service), "0", None).await?;
            self.store.delete(&keys::circuit_opened_at(service)).await?;
            Ok::<_, StoreError>(())
        }
        .await;
        log_write(service, res);
        if from != CircuitState::Closed {
            info!(service, from = %from, "circuit closed");
        }
    }

    async fn record_failure(&self, service: &str, state: CircuitState) {
        let now = self.clock.now_ms();
        let failures = match self.store.incr(&keys::circuit_failures(service)).await {
            Ok(n) => n.max(0) as u32,
            Err(e) => {
                warn!(service, error = %e, "failed to record circuit failure");
                return;
            }
        };
        match state {
            CircuitState::HalfOpen => {
                self.open(service, now).await;
                warn!(service, failures, "probe failed, circuit re-opened");
            }
            _ if failures >= self.config.threshold => {
                self.open(service, now).await;
                warn!(service, failures, threshold = self.config.threshold, "circuit opened");
            }
            _ => debug!(service, failures, "circuit failure recorded"),
        }
    }
}

fn log_write(service: &str, res: Result<(), StoreError>) {
    if let Err(e) = res {
        warn!(service, error = %e, "failed to persist circuit transition");
    }
}
