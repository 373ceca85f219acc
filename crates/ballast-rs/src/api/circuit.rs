//! Per-upstream circuit breaker.
//!
//! A [`CircuitBreaker`] stops calls to an upstream after `threshold`
//! consecutive failures, rejects everything for `reset_after`, then lets a
//! single trial request through. The trial's outcome either closes the
//! circuit or re-opens it for another cooldown.
//!
//! ```text
//!  Closed ──(threshold failures)──▶ Open ──(reset_after elapsed, allow)──▶ HalfOpen
//!    ▲                               ▲                                       │
//!    └──────────(trial success)──────┼───────────────────────────────────────┤
//!                                    └──────────(trial failure)──────────────┘
//! ```
//!
//! All state lives behind one `std::sync::Mutex`, so a transition and its
//! timestamp update are atomic with respect to every other call.
//!
//! Callers either pair [`allow`](CircuitBreaker::allow) with
//! [`record_success`](CircuitBreaker::record_success) /
//! [`record_failure`](CircuitBreaker::record_failure) by hand, or take a
//! [`CallPermit`] from [`acquire`](CircuitBreaker::acquire), which releases
//! an unresolved half-open trial when dropped. [`GuardedModel`] does the
//! latter for any [`ChatModel`].

use crate::api::classify::{CallSite, ProviderError, ProviderErrorKind};
use crate::api::model::{ChatModel, DeltaStream, ModelFuture};
use crate::{ChatCompletion, ChatRequest};
use futures::StreamExt;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

// ── Configuration ──────────────────────────────────────────────────

/// Thresholds for a [`CircuitBreaker`].
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit. Default: 5. Minimum: 1.
    pub threshold: u32,
    /// Cooldown before a half-open trial is allowed. Default: 30 s.
    pub reset_after: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            reset_after: Duration::from_secs(30),
        }
    }
}

impl BreakerConfig {
    pub fn with_threshold(mut self, threshold: u32) -> Self {
        self.threshold = threshold.max(1);
        self
    }

    pub fn with_reset_after(mut self, reset_after: Duration) -> Self {
        self.reset_after = reset_after;
        self
    }
}

// ── State ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests flow normally.
    Closed,
    /// Requests are rejected until the cooldown elapses.
    Open,
    /// One trial request is in flight.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Why [`CircuitBreaker::allow`] refused a call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CircuitError {
    #[error(
        "circuit breaker for {name} is open after {failures} consecutive failures \
         (last failure {elapsed:?} ago, retry in {remaining:?})"
    )]
    Open {
        name: String,
        failures: u32,
        elapsed: Duration,
        remaining: Duration,
    },
    #[error("circuit breaker for {name} is half-open and a trial request is already in flight")]
    HalfOpen { name: String },
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
}

/// A three-state health gate for one upstream.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        let config = BreakerConfig {
            threshold: config.threshold.max(1),
            ..config
        };
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> BreakerConfig {
        self.config
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Ask whether a call may proceed.
    ///
    /// In the Open state, the first call after `reset_after` moves the
    /// breaker to HalfOpen and is allowed; it is the only trial until an
    /// outcome is recorded.
    pub fn allow(&self) -> Result<(), CircuitError> {
        self.admit().map(|_| ())
    }

    /// Admit a call, returning `true` when this call is the half-open trial.
    fn admit(&self) -> Result<bool, CircuitError> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(false),
            CircuitState::HalfOpen => Err(CircuitError::HalfOpen {
                name: self.name.clone(),
            }),
            CircuitState::Open => {
                let elapsed = inner.last_failure.map_or(Duration::MAX, |t| t.elapsed());
                if elapsed >= self.config.reset_after {
                    inner.state = CircuitState::HalfOpen;
                    info!(
                        "Circuit breaker {}: cooldown elapsed, allowing trial request",
                        self.name
                    );
                    Ok(true)
                } else {
                    Err(CircuitError::Open {
                        name: self.name.clone(),
                        failures: inner.consecutive_failures,
                        elapsed,
                        remaining: self.config.reset_after - elapsed,
                    })
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        self.apply_success(&mut inner);
    }

    fn apply_success(&self, inner: &mut Inner) {
        match inner.state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                info!("Circuit breaker {}: trial succeeded, circuit closed", self.name);
            }
            CircuitState::Open => {
                debug!(
                    "Circuit breaker {}: success from a call started before the trip, ignoring",
                    self.name
                );
            }
        }
    }

    /// Record a failed call. Cancellations should not be reported.
    pub fn record_failure(&self) {
        let mut inner = self.lock();
        self.apply_failure(&mut inner);
    }

    fn apply_failure(&self, inner: &mut Inner) {
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                if inner.consecutive_failures >= self.config.threshold {
                    inner.state = CircuitState::Open;
                    inner.last_failure = Some(Instant::now());
                    warn!(
                        "Circuit breaker {}: opened after {} consecutive failures (cooldown {:?})",
                        self.name, inner.consecutive_failures, self.config.reset_after
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                inner.state = CircuitState::Open;
                inner.last_failure = Some(Instant::now());
                warn!(
                    "Circuit breaker {}: trial failed, re-opened for {:?}",
                    self.name, self.config.reset_after
                );
            }
            CircuitState::Open => {
                debug!(
                    "Circuit breaker {}: failure while already open, ignoring",
                    self.name
                );
            }
        }
    }

    /// Force the breaker Closed with zero failures, from any state.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.last_failure = None;
        info!("Circuit breaker {}: reset", self.name);
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Current consecutive failure count.
    pub fn failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// Like [`allow`](Self::allow), but returns a permit that must be
    /// settled with the call's outcome.
    pub fn acquire(self: &Arc<Self>) -> Result<CallPermit, CircuitError> {
        let trial = self.admit()?;
        Ok(CallPermit {
            breaker: Arc::clone(self),
            trial,
            settled: false,
        })
    }

    /// Apply an outcome from a call admitted before the current trial.
    /// Only the trial may resolve HalfOpen.
    fn record_stale(&self, success: bool) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            debug!(
                "Circuit breaker {}: outcome from a call admitted before the trial, ignoring",
                self.name
            );
        } else if success {
            self.apply_success(&mut inner);
        } else {
            self.apply_failure(&mut inner);
        }
    }

    /// Give back a half-open trial without an outcome. The breaker returns
    /// to Open with its original failure time, so the next `allow` may
    /// start a new trial immediately.
    fn release_trial(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Open;
            debug!("Circuit breaker {}: trial abandoned", self.name);
        }
    }
}

/// Outcome handle for one allowed call.
///
/// Dropping a trial permit without settling it (for example when the
/// caller's future is cancelled) releases the half-open trial without
/// counting a failure. Permits admitted while Closed never touch a
/// half-open trial.
#[derive(Debug)]
pub struct CallPermit {
    breaker: Arc<CircuitBreaker>,
    trial: bool,
    settled: bool,
}

impl CallPermit {
    /// Whether this permit is the half-open trial.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.settled = true;
        if self.trial {
            self.breaker.record_success();
        } else {
            self.breaker.record_stale(true);
        }
    }

    pub fn failure(mut self) {
        self.settled = true;
        if self.trial {
            self.breaker.record_failure();
        } else {
            self.breaker.record_stale(false);
        }
    }

    /// Settle from a provider error: cancellations release the permit,
    /// everything else counts as a failure.
    pub fn settle_error(self, err: &ProviderError) {
        if err.is_cancelled() {
            drop(self);
        } else {
            self.failure();
        }
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            self.breaker.release_trial();
        }
    }
}

// ── Registry ───────────────────────────────────────────────────────

/// Lazily creates one breaker per upstream key, so every client talking to
/// the same endpoint shares its health state.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// The breaker for `key`, created on first use.
    pub fn get(&self, key: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            breakers
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(key, self.config))),
        )
    }

    /// Snapshot of every known upstream and its state, sorted by key.
    pub fn states(&self) -> Vec<(String, CircuitState)> {
        let breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<_> = breakers
            .iter()
            .map(|(k, b)| (k.clone(), b.state()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Reset every breaker.
    pub fn reset_all(&self) {
        let breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        for breaker in breakers.values() {
            breaker.reset();
        }
    }
}

// ── Guarded model ──────────────────────────────────────────────────

/// A [`ChatModel`] that consults a breaker before every request.
///
/// An open circuit fails immediately with a retryable `Endpoint` error and
/// no network attempt. Every non-cancelled failure, including rate limits,
/// counts toward the threshold. A stream's outcome is recorded when it ends
/// or yields its first error.
pub struct GuardedModel<M> {
    inner: M,
    breaker: Arc<CircuitBreaker>,
}

impl<M: ChatModel> GuardedModel<M> {
    pub fn new(inner: M, breaker: Arc<CircuitBreaker>) -> Self {
        Self { inner, breaker }
    }

    /// Guard `inner` with the registry's breaker for its endpoint.
    pub fn from_registry(inner: M, registry: &BreakerRegistry) -> Self {
        let breaker = registry.get(inner.endpoint());
        Self { inner, breaker }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn inner(&self) -> &M {
        &self.inner
    }

    fn permit(&self, request: &ChatRequest) -> Result<CallPermit, ProviderError> {
        self.breaker.acquire().map_err(|e| {
            let site = CallSite::new(&request.model, self.inner.endpoint());
            ProviderError::local(ProviderErrorKind::Endpoint, e.to_string(), true, &site)
        })
    }
}

impl<M: ChatModel> ChatModel for GuardedModel<M> {
    fn endpoint(&self) -> &str {
        self.inner.endpoint()
    }

    fn chat<'a>(&'a self, request: &'a ChatRequest) -> ModelFuture<'a, ChatCompletion> {
        Box::pin(async move {
            let permit = self.permit(request)?;
            match self.inner.chat(request).await {
                Ok(completion) => {
                    permit.success();
                    Ok(completion)
                }
                Err(e) => {
                    permit.settle_error(&e);
                    Err(e)
                }
            }
        })
    }

    fn chat_stream<'a>(&'a self, request: &'a ChatRequest) -> ModelFuture<'a, DeltaStream> {
        Box::pin(async move {
            let permit = self.permit(request)?;
            let deltas = match self.inner.chat_stream(request).await {
                Ok(deltas) => deltas,
                Err(e) => {
                    permit.settle_error(&e);
                    return Err(e);
                }
            };
            let guarded = futures::stream::unfold(
                (deltas, Some(permit)),
                |(mut deltas, mut permit)| async move {
                    match deltas.next().await {
                        Some(Ok(delta)) => Some((Ok(delta), (deltas, permit))),
                        Some(Err(e)) => {
                            if let Some(p) = permit.take() {
                                p.settle_error(&e);
                            }
                            Some((Err(e), (deltas, permit)))
                        }
                        None => {
                            if let Some(p) = permit.take() {
                                p.success();
                            }
                            None
                        }
                    }
                },
            );
            Ok(Box::pin(guarded) as DeltaStream)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::classify::classify_message;
    use crate::api::streaming::StreamDelta;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn breaker(threshold: u32, reset_after: Duration) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(
            "test",
            BreakerConfig::default()
                .with_threshold(threshold)
                .with_reset_after(reset_after),
        ))
    }

    #[test]
    fn stays_closed_below_threshold() {
        let b = breaker(3, Duration::from_secs(60));
        for n in 1..3 {
            b.record_failure();
            assert_eq!(b.state(), CircuitState::Closed);
            assert_eq!(b.failures(), n);
            assert!(b.allow().is_ok());
        }
    }

    #[test]
    fn opens_at_threshold() {
        let b = breaker(3, Duration::from_secs(60));
        for _ in 0..3 {
            b.record_failure();
        }
        assert_eq!(b.state(), CircuitState::Open);
        match b.allow() {
            Err(CircuitError::Open { failures, .. }) => assert_eq!(failures, 3),
            other => panic!("expected open error, got {other:?}"),
        }
        let msg = b.allow().unwrap_err().to_string();
        assert!(msg.contains("3 consecutive failures"), "{msg}");
    }

    #[test]
    fn success_resets_consecutive_count() {
        let b = breaker(3, Duration::from_secs(60));
        b.record_failure();
        b.record_failure();
        b.record_success();
        assert_eq!(b.failures(), 0);
        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn single_half_open_trial_after_cooldown() {
        let b = breaker(1, Duration::from_millis(20));
        b.record_failure();
        assert!(b.allow().is_err());
        std::thread::sleep(Duration::from_millis(40));

        assert!(b.allow().is_ok());
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert!(matches!(b.allow(), Err(CircuitError::HalfOpen { .. })));
    }

    #[test]
    fn half_open_success_closes() {
        let b = breaker(2, Duration::from_millis(10));
        b.record_failure();
        b.record_failure();
        std::thread::sleep(Duration::from_millis(30));
        assert!(b.allow().is_ok());
        b.record_success();
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.failures(), 0);
        assert!(b.allow().is_ok());
    }

    #[test]
    fn half_open_failure_reopens() {
        let b = breaker(1, Duration::from_millis(10));
        b.record_failure();
        std::thread::sleep(Duration::from_millis(30));
        assert!(b.allow().is_ok());
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Open);
        assert!(matches!(b.allow(), Err(CircuitError::Open { .. })));
    }

    #[test]
    fn reset_from_open() {
        let b = breaker(1, Duration::from_secs(60));
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Open);
        b.reset();
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.failures(), 0);
        assert!(b.allow().is_ok());
    }

    #[test]
    fn concurrent_allow_grants_exactly_one_trial() {
        let b = breaker(1, Duration::from_millis(10));
        b.record_failure();
        std::thread::sleep(Duration::from_millis(30));

        let granted = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let b = Arc::clone(&b);
                let granted = Arc::clone(&granted);
                std::thread::spawn(move || {
                    if b.allow().is_ok() {
                        granted.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(granted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropped_permit_releases_trial() {
        let b = breaker(1, Duration::from_millis(10));
        b.record_failure();
        std::thread::sleep(Duration::from_millis(30));
        let permit = b.acquire().unwrap();
        assert_eq!(b.state(), CircuitState::HalfOpen);
        drop(permit);
        assert_eq!(b.state(), CircuitState::Open);
        // Cooldown already elapsed, so a new trial is granted at once.
        assert!(b.acquire().is_ok());
    }

    #[test]
    fn dropping_pre_trip_permit_keeps_trial_exclusive() {
        let b = breaker(1, Duration::from_millis(10));
        let stale = b.acquire().unwrap();
        assert!(!stale.is_trial());
        b.record_failure();
        std::thread::sleep(Duration::from_millis(30));
        let trial = b.acquire().unwrap();
        assert!(trial.is_trial());

        drop(stale);
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert!(matches!(b.acquire(), Err(CircuitError::HalfOpen { .. })));

        trial.failure();
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[test]
    fn pre_trip_outcomes_do_not_resolve_trial() {
        let b = breaker(1, Duration::from_millis(10));
        let early_ok = b.acquire().unwrap();
        let early_err = b.acquire().unwrap();
        b.record_failure();
        std::thread::sleep(Duration::from_millis(30));
        let trial = b.acquire().unwrap();

        early_ok.success();
        assert_eq!(b.state(), CircuitState::HalfOpen);
        early_err.failure();
        assert_eq!(b.state(), CircuitState::HalfOpen);

        trial.success();
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.failures(), 0);
    }

    #[test]
    fn registry_shares_breaker_per_key() {
        let reg = BreakerRegistry::new(BreakerConfig::default().with_threshold(1));
        let a = reg.get("http://a");
        let a2 = reg.get("http://a");
        let b = reg.get("http://b");
        assert!(Arc::ptr_eq(&a, &a2));
        a.record_failure();
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(
            reg.states(),
            vec![
                ("http://a".to_string(), CircuitState::Open),
                ("http://b".to_string(), CircuitState::Closed),
            ]
        );
        reg.reset_all();
        assert_eq!(a.state(), CircuitState::Closed);
    }

    // ── GuardedModel ──

    struct FailingModel {
        calls: AtomicUsize,
        cancelled: bool,
    }

    impl ChatModel for FailingModel {
        fn endpoint(&self) -> &str {
            "http://upstream"
        }

        fn chat<'a>(&'a self, request: &'a ChatRequest) -> ModelFuture<'a, ChatCompletion> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let site = CallSite::new(&request.model, "http://upstream");
            let err = if self.cancelled {
                ProviderError::cancelled(&site)
            } else {
                classify_message("HTTP 503 Service Unavailable", None, &site)
            };
            Box::pin(async move { Err(err) })
        }

        fn chat_stream<'a>(&'a self, _request: &'a ChatRequest) -> ModelFuture<'a, DeltaStream> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                let items: Vec<Result<StreamDelta, ProviderError>> =
                    vec![Ok(StreamDelta::Text("hi".into()))];
                Ok(Box::pin(futures::stream::iter(items)) as DeltaStream)
            })
        }
    }

    #[tokio::test]
    async fn guarded_model_short_circuits_when_open() {
        let model = FailingModel {
            calls: AtomicUsize::new(0),
            cancelled: false,
        };
        let guarded = GuardedModel::new(model, breaker(2, Duration::from_secs(60)));
        let req = ChatRequest {
            model: "m".into(),
            ..Default::default()
        };

        for _ in 0..2 {
            let err = guarded.chat(&req).await.unwrap_err();
            assert_eq!(err.status_code(), 503);
        }
        assert_eq!(guarded.breaker().state(), CircuitState::Open);

        let err = guarded.chat(&req).await.unwrap_err();
        assert!(err.message().contains("circuit breaker"), "{err}");
        assert_eq!(err.kind(), ProviderErrorKind::Endpoint);
        assert_eq!(err.status_code(), 0);
        assert_eq!(guarded.inner().calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn guarded_model_ignores_cancellations() {
        let model = FailingModel {
            calls: AtomicUsize::new(0),
            cancelled: true,
        };
        let guarded = GuardedModel::new(model, breaker(1, Duration::from_secs(60)));
        let req = ChatRequest::default();
        for _ in 0..3 {
            assert!(guarded.chat(&req).await.unwrap_err().is_cancelled());
        }
        assert_eq!(guarded.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn guarded_stream_records_success_at_end() {
        let model = FailingModel {
            calls: AtomicUsize::new(0),
            cancelled: false,
        };
        let b = breaker(1, Duration::from_millis(10));
        b.record_failure();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let guarded = GuardedModel::new(model, Arc::clone(&b));
        let req = ChatRequest::default();
        let stream = guarded.chat_stream(&req).await.unwrap();
        assert_eq!(b.state(), CircuitState::HalfOpen);
        let items: Vec<_> = stream.collect().await;
        assert_eq!(items.len(), 1);
        assert_eq!(b.state(), CircuitState::Closed);
    }
}
