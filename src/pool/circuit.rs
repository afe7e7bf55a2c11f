//! Circuit breaker implementation for fault tolerance
//!
//! This module implements a circuit breaker pattern with three states:
//! - Closed: Normal operation, calls are allowed
//! - Open: The protected operation has failed, calls are rejected
//! - HalfOpen: Testing recovery, a single probe call is allowed
//!
//! Circuits are keyed by operation (the client uses the downstream authority)
//! and created on first use. A circuit opens when consecutive failures reach
//! the threshold, or when the failure ratio over the rolling window exceeds
//! the configured rate once enough calls were observed.

use dashmap::DashMap;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Circuit breaker error types
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    #[error("Circuit breaker is open for: {0}")]
    CircuitOpen(String),

    #[error(transparent)]
    Inner(E),
}

/// Circuit breaker states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - calls are allowed
    Closed,

    /// Calls are rejected until `retry_at`
    Open {
        /// When the circuit should transition to HalfOpen
        retry_at: Instant,

        /// Number of consecutive failures that caused the circuit to open
        failure_count: u32,
    },

    /// Testing recovery - one probe at a time
    HalfOpen {
        /// Whether a probe call is currently running
        probe_in_flight: bool,

        /// Number of successful probes so far
        success_count: u32,
    },
}

impl CircuitState {
    /// Check if the circuit would admit a call right now
    pub fn is_request_allowed(&self) -> bool {
        match self {
            CircuitState::Closed => true,
            CircuitState::Open { retry_at, .. } => Instant::now() >= *retry_at,
            CircuitState::HalfOpen {
                probe_in_flight, ..
            } => !probe_in_flight,
        }
    }

    /// Get a human-readable state name
    pub fn name(&self) -> &str {
        match self {
            CircuitState::Closed => "Closed",
            CircuitState::Open { .. } => "Open",
            CircuitState::HalfOpen { .. } => "HalfOpen",
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit
    pub failure_threshold: u32,

    /// Number of successful probes to close the circuit from half-open
    pub success_threshold: u32,

    /// How long to wait before transitioning from open to half-open
    pub timeout: Duration,

    /// Failure ratio above which the circuit opens
    pub failure_rate_threshold: f64,

    /// Calls needed in the window before the ratio is considered
    pub minimum_calls: u32,

    /// Time window for tracking outcomes
    pub failure_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            timeout: Duration::from_secs(7),
            failure_rate_threshold: 0.5,
            minimum_calls: 10,
            failure_window: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn from_request(request: &crate::config::RequestConfig) -> Self {
        Self {
            failure_threshold: request.error_threshold.max(1),
            timeout: request.reset_timeout(),
            failure_rate_threshold: request.failure_rate_threshold,
            minimum_calls: request.minimum_calls,
            failure_window: request.rolling_window(),
            ..Self::default()
        }
    }
}

/// How a call was admitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Probe,
}

/// What a finished call reports back to its circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
    /// The call failed for a reason unrelated to the protected operation
    Neutral,
}

/// An admitted call, stamped with the state generation it was admitted in
#[derive(Debug, Clone, Copy)]
struct Ticket {
    kind: Admission,
    generation: u64,
}

/// Per-key circuit breaker state and statistics
struct KeyCircuit {
    /// Current circuit state
    state: CircuitState,

    /// Configuration
    config: CircuitBreakerConfig,

    /// Consecutive failure count (in Closed state)
    consecutive_failures: u32,

    /// Total number of admitted calls
    total_requests: u64,

    /// Total successful calls
    total_successes: u64,

    /// Total failed calls
    total_failures: u64,

    /// Calls rejected while open
    total_rejected: u64,

    /// Last state transition time
    last_transition: Instant,

    /// Number of times the circuit has opened
    open_count: u64,

    /// Recent outcomes (for sliding window); `true` is a failure
    recent: VecDeque<(Instant, bool)>,

    /// Bumped on every state transition
    generation: u64,
}

impl KeyCircuit {
    fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            config,
            consecutive_failures: 0,
            total_requests: 0,
            total_successes: 0,
            total_failures: 0,
            total_rejected: 0,
            last_transition: Instant::now(),
            open_count: 0,
            recent: VecDeque::new(),
            generation: 0,
        }
    }

    /// Check if a call is allowed
    fn admit(&mut self, key: &str) -> Option<Ticket> {
        let admission = match &self.state {
            CircuitState::Closed => Some(Admission::Normal),

            CircuitState::Open { retry_at, .. } => {
                if Instant::now() >= *retry_at {
                    info!(key = %key, "Circuit transitioning from Open to HalfOpen");
                    self.transition_to_half_open();
                    self.state = CircuitState::HalfOpen {
                        probe_in_flight: true,
                        success_count: 0,
                    };
                    Some(Admission::Probe)
                } else {
                    None
                }
            }

            CircuitState::HalfOpen {
                probe_in_flight,
                success_count,
            } => {
                if *probe_in_flight {
                    None
                } else {
                    self.state = CircuitState::HalfOpen {
                        probe_in_flight: true,
                        success_count: *success_count,
                    };
                    Some(Admission::Probe)
                }
            }
        };

        match admission {
            Some(_) => self.total_requests += 1,
            None => self.total_rejected += 1,
        }
        admission.map(|kind| Ticket {
            kind,
            generation: self.generation,
        })
    }

    /// Apply the outcome of a call admitted through [`KeyCircuit::admit`].
    ///
    /// Only calls admitted in the current generation drive state changes.
    /// Older calls still count toward the totals.
    fn settle(&mut self, key: &str, ticket: Ticket, outcome: Outcome) {
        if ticket.generation != self.generation {
            match outcome {
                Outcome::Success => self.total_successes += 1,
                Outcome::Failure => self.total_failures += 1,
                Outcome::Neutral => {}
            }
            debug!(
                key = %key,
                state = self.state.name(),
                outcome = ?outcome,
                "Outcome of a call admitted before the last transition"
            );
            return;
        }

        match outcome {
            Outcome::Success => self.record_success(key),
            Outcome::Failure => self.record_failure(key),
            Outcome::Neutral => {
                if ticket.kind == Admission::Probe {
                    self.release_probe(ticket.generation);
                }
            }
        }
    }

    /// Record a successful call
    fn record_success(&mut self, key: &str) {
        self.total_successes += 1;
        self.consecutive_failures = 0;
        self.push_outcome(false);

        match &self.state {
            CircuitState::Closed => {
                debug!(key = %key, "Call succeeded in Closed state");
            }

            CircuitState::Open { .. } => {
                // A call admitted before the circuit opened finished late
                debug!(key = %key, "Recorded success in Open state");
            }

            CircuitState::HalfOpen { success_count, .. } => {
                let new_success_count = success_count + 1;
                if new_success_count >= self.config.success_threshold {
                    info!(
                        key = %key,
                        success_count = new_success_count,
                        "Circuit transitioning from HalfOpen to Closed"
                    );
                    self.transition_to_closed();
                } else {
                    self.state = CircuitState::HalfOpen {
                        probe_in_flight: false,
                        success_count: new_success_count,
                    };
                }
            }
        }
    }

    /// Record a failed call
    fn record_failure(&mut self, key: &str) {
        self.total_failures += 1;
        self.consecutive_failures += 1;
        self.push_outcome(true);

        match &self.state {
            CircuitState::Closed => {
                let rate = self.recent_error_rate();
                debug!(
                    key = %key,
                    consecutive_failures = self.consecutive_failures,
                    threshold = self.config.failure_threshold,
                    recent_error_rate = rate,
                    "Call failed in Closed state"
                );

                let rate_tripped = self.recent.len() >= self.config.minimum_calls.max(1) as usize
                    && rate > self.config.failure_rate_threshold;

                if self.consecutive_failures >= self.config.failure_threshold || rate_tripped {
                    warn!(
                        key = %key,
                        consecutive_failures = self.consecutive_failures,
                        recent_error_rate = rate,
                        "Circuit transitioning from Closed to Open"
                    );
                    self.transition_to_open();
                }
            }

            CircuitState::Open { .. } => {
                debug!(key = %key, "Call failed in Open state");
            }

            CircuitState::HalfOpen { .. } => {
                warn!(key = %key, "Probe failed in HalfOpen state - reopening circuit");
                self.transition_to_open();
            }
        }
    }

    /// A probe finished without an outcome; let the next call probe instead
    fn release_probe(&mut self, generation: u64) {
        if generation != self.generation {
            return;
        }
        if let CircuitState::HalfOpen { success_count, .. } = self.state {
            self.state = CircuitState::HalfOpen {
                probe_in_flight: false,
                success_count,
            };
        }
    }

    fn push_outcome(&mut self, failed: bool) {
        let now = Instant::now();
        self.recent.push_back((now, failed));

        // Clean up old outcomes outside the window
        while let Some(&(at, _)) = self.recent.front() {
            if now.duration_since(at) >= self.config.failure_window {
                self.recent.pop_front();
            } else {
                break;
            }
        }
    }

    /// Transition to Closed state
    fn transition_to_closed(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.last_transition = Instant::now();
        self.recent.clear();
        self.generation += 1;
    }

    /// Transition to Open state
    fn transition_to_open(&mut self) {
        let retry_at = Instant::now() + self.config.timeout;
        self.state = CircuitState::Open {
            retry_at,
            failure_count: self.consecutive_failures,
        };
        self.open_count += 1;
        self.last_transition = Instant::now();
        self.generation += 1;
    }

    /// Transition to HalfOpen state
    fn transition_to_half_open(&mut self) {
        self.state = CircuitState::HalfOpen {
            probe_in_flight: false,
            success_count: 0,
        };
        self.last_transition = Instant::now();
        self.generation += 1;
    }

    /// Get error rate over the circuit's lifetime
    fn error_rate(&self) -> f64 {
        let settled = self.total_successes + self.total_failures;
        if settled == 0 {
            return 0.0;
        }
        self.total_failures as f64 / settled as f64
    }

    /// Get recent error rate (within failure window)
    fn recent_error_rate(&self) -> f64 {
        if self.recent.is_empty() {
            return 0.0;
        }
        let failures = self.recent.iter().filter(|(_, failed)| *failed).count();
        failures as f64 / self.recent.len() as f64
    }

    fn stats(&self) -> CircuitStats {
        CircuitStats {
            state: self.state.clone(),
            total_requests: self.total_requests,
            total_successes: self.total_successes,
            total_failures: self.total_failures,
            total_rejected: self.total_rejected,
            error_rate: self.error_rate(),
            recent_error_rate: self.recent_error_rate(),
            open_count: self.open_count,
            time_in_state: self.last_transition.elapsed(),
        }
    }
}

/// Circuit breaker statistics
#[derive(Debug, Clone)]
pub struct CircuitStats {
    /// Current state
    pub state: CircuitState,

    /// Total admitted calls
    pub total_requests: u64,

    /// Total successes
    pub total_successes: u64,

    /// Total failures
    pub total_failures: u64,

    /// Calls rejected without running
    pub total_rejected: u64,

    /// Overall error rate
    pub error_rate: f64,

    /// Recent error rate
    pub recent_error_rate: f64,

    /// Number of times circuit has opened
    pub open_count: u64,

    /// Time since last state transition
    pub time_in_state: Duration,
}

type SharedCircuit = Arc<Mutex<KeyCircuit>>;

fn lock(circuit: &SharedCircuit) -> MutexGuard<'_, KeyCircuit> {
    circuit.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Releases a half-open probe slot if the call never reported an outcome
struct ProbeGuard {
    circuit: SharedCircuit,
    generation: u64,
    armed: bool,
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        if self.armed {
            debug!("Probe call abandoned; releasing half-open slot");
            lock(&self.circuit).release_probe(self.generation);
        }
    }
}

/// Circuit breaker manager for all keys
pub struct CircuitBreaker {
    /// Per-key circuit breakers
    circuits: DashMap<String, SharedCircuit>,

    /// Configuration
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    /// Create a new circuit breaker manager
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            circuits: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn circuit_for(&self, key: &str) -> SharedCircuit {
        if let Some(circuit) = self.circuits.get(key) {
            return Arc::clone(circuit.value());
        }
        let circuit = self.circuits.entry(key.to_string()).or_insert_with(|| {
            debug!(key = %key, "Creating circuit");
            Arc::new(Mutex::new(KeyCircuit::new(self.config.clone())))
        });
        Arc::clone(circuit.value())
    }

    /// Run `operation` under the circuit for `key`.
    ///
    /// While open, the operation is not invoked and the call fails with
    /// [`CircuitError::CircuitOpen`]. In half-open state only one probe runs
    /// at a time; a probe whose future is dropped before completing frees the
    /// slot without counting as success or failure. A call that finishes
    /// after the circuit changed state since it was admitted only updates the
    /// totals; it never closes, reopens or frees the probe slot.
    pub async fn call<F, Fut, T, E>(&self, key: &str, operation: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_counting(key, operation, |_| true).await
    }

    /// Like [`CircuitBreaker::call`], but only errors for which `counts`
    /// returns `true` are recorded as failures. Other errors leave the
    /// circuit untouched and free a half-open probe slot.
    pub async fn call_counting<F, Fut, T, E, C>(
        &self,
        key: &str,
        operation: F,
        counts: C,
    ) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: FnOnce(&E) -> bool,
    {
        let circuit = self.circuit_for(key);
        let admission = lock(&circuit).admit(key);
        let Some(ticket) = admission else {
            debug!(key = %key, "Circuit open, rejecting call");
            return Err(CircuitError::CircuitOpen(key.to_string()));
        };

        let mut guard = ProbeGuard {
            circuit: Arc::clone(&circuit),
            generation: ticket.generation,
            armed: ticket.kind == Admission::Probe,
        };

        let result = operation().await;
        guard.armed = false;

        let mut state = lock(&circuit);
        match result {
            Ok(value) => {
                state.settle(key, ticket, Outcome::Success);
                Ok(value)
            }
            Err(e) => {
                let outcome = if counts(&e) {
                    Outcome::Failure
                } else {
                    Outcome::Neutral
                };
                state.settle(key, ticket, outcome);
                Err(CircuitError::Inner(e))
            }
        }
    }

    /// Check if a call is allowed for a key, claiming the probe slot when half-open
    pub fn check_request(&self, key: &str) -> Result<(), CircuitError<std::convert::Infallible>> {
        let circuit = self.circuit_for(key);
        let admitted = lock(&circuit).admit(key);
        admitted
            .map(|_| ())
            .ok_or_else(|| CircuitError::CircuitOpen(key.to_string()))
    }

    /// Record a successful call for a key
    pub fn record_success(&self, key: &str) {
        lock(&self.circuit_for(key)).record_success(key);
    }

    /// Record a failed call for a key
    pub fn record_failure(&self, key: &str) {
        lock(&self.circuit_for(key)).record_failure(key);
    }

    /// Get the current state of a key's circuit
    pub fn get_state(&self, key: &str) -> Option<CircuitState> {
        self.circuits.get(key).map(|c| lock(c.value()).state.clone())
    }

    /// Get statistics for a key's circuit
    pub fn get_stats(&self, key: &str) -> Option<CircuitStats> {
        self.circuits.get(key).map(|c| lock(c.value()).stats())
    }

    /// Get statistics for all keys
    pub fn get_all_stats(&self) -> HashMap<String, CircuitStats> {
        self.circuits
            .iter()
            .map(|entry| (entry.key().clone(), lock(entry.value()).stats()))
            .collect()
    }

    /// Manually reset a circuit to closed state
    pub fn reset_circuit(&self, key: &str) {
        if let Some(circuit) = self.circuits.get(key) {
            info!(key = %key, "Manually resetting circuit to Closed");
            lock(circuit.value()).transition_to_closed();
        }
    }

    /// Check if a key is healthy (circuit is closed). Unknown keys are healthy.
    pub fn is_healthy(&self, key: &str) -> bool {
        self.circuits
            .get(key)
            .map(|c| matches!(lock(c.value()).state, CircuitState::Closed))
            .unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(failure_threshold: u32, timeout: Duration) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold,
            success_threshold: 1,
            timeout,
            failure_rate_threshold: 1.0,
            minimum_calls: 100,
            failure_window: Duration::from_secs(10),
        }
    }

    async fn fail(breaker: &CircuitBreaker, key: &str) -> Result<(), CircuitError<&'static str>> {
        breaker.call(key, || async { Err::<(), _>("boom") }).await
    }

    async fn succeed(breaker: &CircuitBreaker, key: &str) -> Result<(), CircuitError<&'static str>> {
        breaker.call(key, || async { Ok(()) }).await
    }

    #[tokio::test]
    async fn test_circuit_closed_to_open() {
        let breaker = CircuitBreaker::new(config(3, Duration::from_secs(30)));

        // Circuit should start closed
        assert!(breaker.is_healthy("orders"));

        for _ in 0..3 {
            assert!(matches!(fail(&breaker, "orders").await, Err(CircuitError::Inner("boom"))));
        }

        // Circuit should now be open and the operation must not run
        assert!(!breaker.is_healthy("orders"));
        let mut invoked = false;
        let result = breaker
            .call("orders", || {
                invoked = true;
                async { Ok::<_, &str>(()) }
            })
            .await;
        assert!(matches!(result, Err(CircuitError::CircuitOpen(_))));
        assert!(!invoked);
        assert_eq!(breaker.get_stats("orders").unwrap().total_rejected, 1);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let breaker = CircuitBreaker::new(config(1, Duration::from_secs(30)));
        let _ = fail(&breaker, "orders").await;
        assert!(!breaker.is_healthy("orders"));
        assert!(succeed(&breaker, "payments").await.is_ok());
    }

    #[tokio::test]
    async fn test_circuit_half_open_to_closed() {
        let breaker = CircuitBreaker::new(config(2, Duration::from_millis(100)));

        let _ = fail(&breaker, "orders").await;
        let _ = fail(&breaker, "orders").await;
        assert!(matches!(
            succeed(&breaker, "orders").await,
            Err(CircuitError::CircuitOpen(_))
        ));

        // Wait for timeout
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(succeed(&breaker, "orders").await.is_ok());
        assert!(breaker.is_healthy("orders"));
    }

    #[tokio::test]
    async fn test_circuit_half_open_to_open() {
        let breaker = CircuitBreaker::new(config(2, Duration::from_millis(100)));

        let _ = fail(&breaker, "orders").await;
        let _ = fail(&breaker, "orders").await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        // The probe fails and the circuit reopens
        assert!(matches!(fail(&breaker, "orders").await, Err(CircuitError::Inner(_))));
        assert!(matches!(
            breaker.get_state("orders"),
            Some(CircuitState::Open { .. })
        ));
        assert_eq!(breaker.get_stats("orders").unwrap().open_count, 2);
    }

    #[tokio::test]
    async fn test_single_probe_in_half_open() {
        let breaker = Arc::new(CircuitBreaker::new(config(1, Duration::from_millis(50))));
        let _ = fail(&breaker, "orders").await;
        tokio::time::sleep(Duration::from_millis(80)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let probe = {
            let breaker = Arc::clone(&breaker);
            tokio::spawn(async move {
                breaker
                    .call("orders", || async move {
                        let _ = release_rx.await;
                        Ok::<_, &str>(())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // A second call while the probe runs is rejected
        assert!(matches!(
            succeed(&breaker, "orders").await,
            Err(CircuitError::CircuitOpen(_))
        ));

        release_tx.send(()).unwrap();
        assert!(probe.await.unwrap().is_ok());
        assert!(breaker.is_healthy("orders"));
    }

    #[tokio::test]
    async fn test_abandoned_probe_releases_slot() {
        let breaker = Arc::new(CircuitBreaker::new(config(1, Duration::from_millis(50))));
        let _ = fail(&breaker, "orders").await;
        tokio::time::sleep(Duration::from_millis(80)).await;

        let probe = {
            let breaker = Arc::clone(&breaker);
            tokio::spawn(async move {
                breaker
                    .call("orders", || std::future::pending::<Result<(), &str>>())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        probe.abort();
        let _ = probe.await;

        assert!(matches!(
            breaker.get_state("orders"),
            Some(CircuitState::HalfOpen {
                probe_in_flight: false,
                ..
            })
        ));
        assert!(succeed(&breaker, "orders").await.is_ok());
        assert!(breaker.is_healthy("orders"));
    }

    #[tokio::test]
    async fn test_late_call_does_not_settle_half_open() {
        let breaker = Arc::new(CircuitBreaker::new(config(1, Duration::from_millis(50))));

        // Slow call admitted while Closed
        let (slow_tx, slow_rx) = tokio::sync::oneshot::channel::<()>();
        let slow = {
            let breaker = Arc::clone(&breaker);
            tokio::spawn(async move {
                breaker
                    .call("orders", || async move {
                        let _ = slow_rx.await;
                        Err::<(), _>("slow failure")
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let _ = fail(&breaker, "orders").await;
        assert!(!breaker.is_healthy("orders"));
        tokio::time::sleep(Duration::from_millis(80)).await;

        let (probe_tx, probe_rx) = tokio::sync::oneshot::channel::<()>();
        let probe = {
            let breaker = Arc::clone(&breaker);
            tokio::spawn(async move {
                breaker
                    .call("orders", || async move {
                        let _ = probe_rx.await;
                        Ok::<_, &str>(())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(
            breaker.get_state("orders"),
            Some(CircuitState::HalfOpen {
                probe_in_flight: true,
                ..
            })
        ));

        // The earlier call fails late; the probe is still the one in charge
        slow_tx.send(()).unwrap();
        assert!(matches!(slow.await.unwrap(), Err(CircuitError::Inner("slow failure"))));
        assert!(matches!(
            breaker.get_state("orders"),
            Some(CircuitState::HalfOpen {
                probe_in_flight: true,
                ..
            })
        ));
        assert!(matches!(
            succeed(&breaker, "orders").await,
            Err(CircuitError::CircuitOpen(_))
        ));

        probe_tx.send(()).unwrap();
        assert!(probe.await.unwrap().is_ok());
        assert!(breaker.is_healthy("orders"));

        let stats = breaker.get_stats("orders").unwrap();
        assert_eq!(stats.total_failures, 2);
        assert_eq!(stats.open_count, 1);
    }

    #[tokio::test]
    async fn test_late_success_does_not_free_probe_slot() {
        let breaker = Arc::new(CircuitBreaker::new(config(1, Duration::from_millis(50))));

        let (slow_tx, slow_rx) = tokio::sync::oneshot::channel::<()>();
        let slow = {
            let breaker = Arc::clone(&breaker);
            tokio::spawn(async move {
                breaker
                    .call("orders", || async move {
                        let _ = slow_rx.await;
                        Ok::<_, &str>(())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let _ = fail(&breaker, "orders").await;
        tokio::time::sleep(Duration::from_millis(80)).await;

        let (probe_tx, probe_rx) = tokio::sync::oneshot::channel::<()>();
        let probe = {
            let breaker = Arc::clone(&breaker);
            tokio::spawn(async move {
                breaker
                    .call("orders", || async move {
                        let _ = probe_rx.await;
                        Err::<(), _>("still down")
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        slow_tx.send(()).unwrap();
        assert!(slow.await.unwrap().is_ok());
        assert!(!breaker.is_healthy("orders"));
        assert!(matches!(
            succeed(&breaker, "orders").await,
            Err(CircuitError::CircuitOpen(_))
        ));

        probe_tx.send(()).unwrap();
        assert!(probe.await.unwrap().is_err());
        assert!(matches!(
            breaker.get_state("orders"),
            Some(CircuitState::Open { .. })
        ));
    }

    #[tokio::test]
    async fn test_uncounted_errors_leave_circuit_closed() {
        let breaker = CircuitBreaker::new(config(1, Duration::from_secs(30)));

        let result = breaker
            .call_counting("orders", || async { Err::<(), _>("bad request") }, |_| false)
            .await;
        assert!(matches!(result, Err(CircuitError::Inner("bad request"))));
        assert!(breaker.is_healthy("orders"));
        assert_eq!(breaker.get_stats("orders").unwrap().total_failures, 0);

        let result = breaker
            .call_counting("orders", || async { Err::<(), _>("reset") }, |_| true)
            .await;
        assert!(matches!(result, Err(CircuitError::Inner("reset"))));
        assert!(!breaker.is_healthy("orders"));
    }

    #[tokio::test]
    async fn test_uncounted_probe_error_frees_slot() {
        let breaker = CircuitBreaker::new(config(1, Duration::from_millis(50)));
        let _ = fail(&breaker, "orders").await;
        tokio::time::sleep(Duration::from_millis(80)).await;

        let _ = breaker
            .call_counting("orders", || async { Err::<(), _>("bad request") }, |_| false)
            .await;
        assert!(matches!(
            breaker.get_state("orders"),
            Some(CircuitState::HalfOpen {
                probe_in_flight: false,
                ..
            })
        ));
        assert!(succeed(&breaker, "orders").await.is_ok());
        assert!(breaker.is_healthy("orders"));
    }

    #[tokio::test]
    async fn test_failure_rate_opens_circuit() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 100,
            success_threshold: 1,
            timeout: Duration::from_secs(30),
            failure_rate_threshold: 0.5,
            minimum_calls: 4,
            failure_window: Duration::from_secs(10),
        });

        // Alternating outcomes: ratio reaches 0.5 but never exceeds it
        for _ in 0..3 {
            let _ = succeed(&breaker, "orders").await;
            let _ = fail(&breaker, "orders").await;
        }
        assert!(breaker.is_healthy("orders"));

        let _ = fail(&breaker, "orders").await;
        assert!(!breaker.is_healthy("orders"));
    }

    #[test]
    fn test_circuit_state_names() {
        assert_eq!(CircuitState::Closed.name(), "Closed");
        assert_eq!(
            CircuitState::Open {
                retry_at: Instant::now(),
                failure_count: 5
            }
            .name(),
            "Open"
        );
        assert_eq!(
            CircuitState::HalfOpen {
                probe_in_flight: false,
                success_count: 0
            }
            .name(),
            "HalfOpen"
        );
    }
}
