//! Read-only liveness view derived from the scheduler's fetch states.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;

use crate::aggregator::types::{FetchState, HealthEntry, HealthReport};
use crate::scheduler::ClientKey;

/// A key with no successful fetch in this window is reported unhealthy.
pub const STALE_AFTER_SECS: i64 = 300;

pub struct HealthMonitor {
    states: Arc<RwLock<HashMap<ClientKey, FetchState>>>,
}

impl HealthMonitor {
    pub fn new(states: Arc<RwLock<HashMap<ClientKey, FetchState>>>) -> Self {
        Self { states }
    }

    pub async fn report(&self) -> HealthReport {
        let now_ms = Utc::now().timestamp_millis();
        let states = self.states.read().await;
        let mut entries: Vec<HealthEntry> = states
            .iter()
            .map(|((exchange, account), state)| evaluate(exchange, account, state, now_ms))
            .collect();
        entries.sort_by(|a, b| (&a.exchange, &a.account).cmp(&(&b.exchange, &b.account)));
        HealthReport { entries }
    }
}

/// healthy = at least one success ever, and the last one within the window.
pub fn evaluate(exchange: &str, account: &str, state: &FetchState, now_ms: i64) -> HealthEntry {
    let seconds_since = if state.last_fetch_ms > 0 {
        (now_ms - state.last_fetch_ms) / 1_000
    } else {
        -1
    };
    HealthEntry {
        exchange: exchange.to_string(),
        account: account.to_string(),
        healthy: state.last_fetch_ms > 0 && seconds_since < STALE_AFTER_SECS,
        last_fetch_ms: state.last_fetch_ms,
        seconds_since_last_fetch: seconds_since,
        in_backoff: now_ms < state.backoff_until_ms,
        backoff_until_ms: state.backoff_until_ms,
        consecutive_errors: state.consecutive_errors,
    }
}
