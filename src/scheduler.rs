//! Periodic fetch driver. One tick fans out over every registered
//! (exchange, account) key; each key runs its READY -> FETCHING ->
//! (READY | BACKOFF) state machine independently.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::aggregator::AccountClient;
use crate::aggregator::traits::ExchangeClient;
use crate::aggregator::types::{ExchangeData, FetchState};
use crate::cache::SnapshotCache;
use crate::error::AggregatorError;

/// Consecutive failures before backoff kicks in.
pub const ERROR_THRESHOLD: u32 = 5;
/// First backoff delay once the threshold is reached.
pub const BASE_BACKOFF_SECS: i64 = 60;
/// Growth stops at 60s * 2^4 = 960s.
pub const MAX_BACKOFF_EXPONENT: u32 = 4;

/// Bound on how long `stop` waits for in-flight fetches.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub type ClientKey = (String, String);

pub struct RegisteredClient {
    pub exchange: String,
    pub account: String,
    pub client: AccountClient,
}

/// Backoff delay for a given consecutive-error count, or `None` while still
/// under the threshold (retry on the next tick without delay).
pub fn backoff_delay_secs(consecutive_errors: u32) -> Option<i64> {
    if consecutive_errors < ERROR_THRESHOLD {
        return None;
    }
    let excess = consecutive_errors - ERROR_THRESHOLD;
    Some(BASE_BACKOFF_SECS << excess.min(MAX_BACKOFF_EXPONENT))
}

/// A successful fetch resets the error counter and clears any backoff.
pub fn apply_success(state: &mut FetchState, now_ms: i64) {
    state.last_fetch_ms = now_ms;
    state.consecutive_errors = 0;
    state.backoff_until_ms = 0;
    state.in_flight = false;
}

/// A failed fetch bumps the counter and, once the threshold is reached,
/// schedules the exponential backoff window.
pub fn apply_failure(state: &mut FetchState, now_ms: i64) {
    state.consecutive_errors += 1;
    state.in_flight = false;
    if let Some(delay_secs) = backoff_delay_secs(state.consecutive_errors) {
        state.backoff_until_ms = now_ms + delay_secs * 1_000;
    }
}

pub struct FetchScheduler {
    clients: Arc<Vec<RegisteredClient>>,
    states: Arc<RwLock<HashMap<ClientKey, FetchState>>>,
    cache: Arc<SnapshotCache>,
    interval: Duration,
    shutdown: Option<watch::Sender<bool>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl FetchScheduler {
    pub fn new(
        clients: Vec<RegisteredClient>,
        cache: Arc<SnapshotCache>,
        interval: Duration,
    ) -> Self {
        let states = clients
            .iter()
            .map(|c| ((c.exchange.clone(), c.account.clone()), FetchState::default()))
            .collect();
        Self {
            clients: Arc::new(clients),
            states: Arc::new(RwLock::new(states)),
            cache,
            interval,
            shutdown: None,
            handle: None,
        }
    }

    /// Shared fetch-state map, read by the health monitor.
    pub fn states(&self) -> Arc<RwLock<HashMap<ClientKey, FetchState>>> {
        self.states.clone()
    }

    /// Spawn the tick loop. Calling `start` twice is a no-op.
    pub fn start(&mut self) {
        if self.handle.is_some() {
            return;
        }
        let (tx, rx) = watch::channel(false);
        let clients = self.clients.clone();
        let states = self.states.clone();
        let cache = self.cache.clone();
        let interval = self.interval;
        self.shutdown = Some(tx);
        self.handle = Some(tokio::spawn(run_loop(clients, states, cache, interval, rx)));
        info!(
            interval_secs = self.interval.as_secs(),
            clients = self.clients.len(),
            "fetch scheduler started"
        );
    }

    /// Stop scheduling new cycles and wait (bounded) for in-flight fetches.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(true);
        }
        if let Some(handle) = self.handle.take() {
            if !join_with_grace(handle, SHUTDOWN_GRACE).await {
                warn!("fetch scheduler did not drain within the shutdown grace period, aborted in-flight fetches");
            }
        }
        info!("fetch scheduler stopped");
    }
}

/// Wait for the loop task up to `grace`, then abort it. Aborting the loop
/// task drops its `JoinSet`, which cancels any fetches still in flight.
/// Returns whether the task drained on its own.
async fn join_with_grace(mut handle: tokio::task::JoinHandle<()>, grace: Duration) -> bool {
    if tokio::time::timeout(grace, &mut handle).await.is_ok() {
        return true;
    }
    handle.abort();
    let _ = handle.await;
    false
}

/// Runs one fetch, converting a panic in the client into an ordinary failed
/// attempt so the key's FETCHING state is always released.
async fn fetch_guarding_panics<F>(fut: F) -> Result<ExchangeData, AggregatorError>
where
    F: Future<Output = Result<ExchangeData, AggregatorError>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(_) => Err(AggregatorError::Network("fetch task panicked".to_string())),
    }
}

async fn run_loop(
    clients: Arc<Vec<RegisteredClient>>,
    states: Arc<RwLock<HashMap<ClientKey, FetchState>>>,
    cache: Arc<SnapshotCache>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    let mut in_flight = JoinSet::new();
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                run_cycle(&clients, &states, &cache, &mut in_flight).await;
                // Reap finished fetch tasks; results were already applied.
                while in_flight.try_join_next().is_some() {}
            }
            _ = shutdown.changed() => {
                break;
            }
        }
    }
    while in_flight.join_next().await.is_some() {}
}

/// One cycle: decide skip/attempt per key and spawn the attempts. Keys run
/// concurrently; a key still FETCHING from a previous cycle is skipped, which
/// serializes cache writes per key.
async fn run_cycle(
    clients: &Arc<Vec<RegisteredClient>>,
    states: &Arc<RwLock<HashMap<ClientKey, FetchState>>>,
    cache: &Arc<SnapshotCache>,
    in_flight: &mut JoinSet<()>,
) {
    let now_ms = Utc::now().timestamp_millis();
    for (index, registered) in clients.iter().enumerate() {
        let key = (registered.exchange.clone(), registered.account.clone());
        {
            let mut guard = states.write().await;
            let state = guard.entry(key.clone()).or_default();
            if state.in_flight {
                debug!(exchange = %key.0, account = %key.1, "previous fetch still running, skipping");
                continue;
            }
            if now_ms < state.backoff_until_ms {
                debug!(
                    exchange = %key.0,
                    account = %key.1,
                    remaining_secs = (state.backoff_until_ms - now_ms) / 1_000,
                    "in backoff, skipping"
                );
                continue;
            }
            state.in_flight = true;
        }

        let clients = clients.clone();
        let states = states.clone();
        let cache = cache.clone();
        in_flight.spawn(async move {
            let registered = &clients[index];
            let started = std::time::Instant::now();
            let result = fetch_guarding_panics(registered.client.fetch_snapshot()).await;
            let now_ms = Utc::now().timestamp_millis();
            let mut guard = states.write().await;
            let state = guard.entry(key.clone()).or_default();
            match result {
                Ok(data) => {
                    apply_success(state, now_ms);
                    drop(guard);
                    info!(
                        exchange = %key.0,
                        account = %key.1,
                        positions = data.positions.len(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "snapshot refreshed"
                    );
                    cache.write(&key.0, &key.1, data).await;
                }
                Err(err) => {
                    apply_failure(state, now_ms);
                    let errors = state.consecutive_errors;
                    let backoff_until_ms = state.backoff_until_ms;
                    drop(guard);
                    // Cache untouched: the previous snapshot keeps serving.
                    warn!(
                        exchange = %key.0,
                        account = %key.1,
                        consecutive_errors = errors,
                        backing_off = backoff_until_ms > now_ms,
                        error = %err,
                        "fetch failed"
                    );
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_backoff_below_threshold() {
        for errors in 0..ERROR_THRESHOLD {
            assert_eq!(backoff_delay_secs(errors), None);
        }
    }

    #[test]
    fn backoff_schedule_doubles_then_caps() {
        assert_eq!(backoff_delay_secs(5), Some(60));
        assert_eq!(backoff_delay_secs(6), Some(120));
        assert_eq!(backoff_delay_secs(7), Some(240));
        assert_eq!(backoff_delay_secs(8), Some(480));
        assert_eq!(backoff_delay_secs(9), Some(960));
        assert_eq!(backoff_delay_secs(10), Some(960));
        assert_eq!(backoff_delay_secs(50), Some(960));
    }

    #[test]
    fn failures_then_success_reset_the_counter() {
        let mut state = FetchState::default();
        let now_ms = 1_000_000;

        for _ in 0..4 {
            apply_failure(&mut state, now_ms);
        }
        assert_eq!(state.consecutive_errors, 4);
        assert_eq!(state.backoff_until_ms, 0, "below threshold retries freely");

        apply_failure(&mut state, now_ms);
        assert_eq!(state.consecutive_errors, 5);
        assert_eq!(state.backoff_until_ms, now_ms + 60_000);

        apply_failure(&mut state, now_ms);
        assert_eq!(state.backoff_until_ms, now_ms + 120_000);

        for _ in 0..4 {
            apply_failure(&mut state, now_ms);
        }
        assert_eq!(state.consecutive_errors, 10);
        assert_eq!(state.backoff_until_ms, now_ms + 960_000, "cap reached");

        apply_success(&mut state, now_ms + 1);
        assert_eq!(state.consecutive_errors, 0);
        assert_eq!(state.backoff_until_ms, 0);
        assert_eq!(state.last_fetch_ms, now_ms + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn grace_period_expiry_aborts_a_stuck_loop() {
        let handle = tokio::spawn(std::future::pending::<()>());
        let drained = join_with_grace(handle, Duration::from_secs(10)).await;
        assert!(!drained, "a never-finishing task must be aborted, not awaited forever");
    }

    #[tokio::test(start_paused = true)]
    async fn drained_loop_joins_within_the_grace_period() {
        let handle = tokio::spawn(async {});
        assert!(join_with_grace(handle, Duration::from_secs(10)).await);
    }

    #[tokio::test]
    async fn panicking_fetch_counts_as_an_ordinary_failure() {
        let err = fetch_guarding_panics(async { panic!("client bug") })
            .await
            .unwrap_err();
        assert!(matches!(err, AggregatorError::Network(_)));

        // The failure then flows through the normal state update, releasing
        // the key for the next tick.
        let mut state = FetchState {
            in_flight: true,
            ..Default::default()
        };
        apply_failure(&mut state, 1_000_000);
        assert!(!state.in_flight);
        assert_eq!(state.consecutive_errors, 1);
    }
}
