//! In-memory snapshot cache. Owns the [`CombinedSnapshot`]; every other
//! component sees clones. Writes replace exactly one (exchange, account)
//! entry, so readers never observe a torn update.

use tokio::sync::RwLock;

use crate::aggregator::types::{CombinedSnapshot, ExchangeData};
use crate::error::AggregatorError;

pub struct SnapshotCache {
    inner: RwLock<CombinedSnapshot>,
}

impl SnapshotCache {
    pub fn new(available_exchanges: Vec<String>, available_accounts: Vec<String>) -> Self {
        let current_exchange = available_exchanges.first().cloned();
        let current_account = available_accounts.first().cloned();
        Self {
            inner: RwLock::new(CombinedSnapshot {
                exchanges: Default::default(),
                current_exchange,
                current_account,
                available_exchanges,
                available_accounts,
            }),
        }
    }

    /// Atomically replace the entry for one (exchange, account) pair.
    pub async fn write(&self, exchange: &str, account: &str, data: ExchangeData) {
        let mut snapshot = self.inner.write().await;
        snapshot
            .exchanges
            .entry(exchange.to_string())
            .or_default()
            .insert(account.to_string(), data);
    }

    /// Update the current-selection pointers. Both the exchange and the
    /// account must be members of the configured available sets; on failure
    /// nothing is mutated.
    pub async fn set_current(&self, exchange: &str, account: &str) -> Result<(), AggregatorError> {
        let mut snapshot = self.inner.write().await;
        let known = snapshot.available_exchanges.iter().any(|e| e == exchange)
            && snapshot.available_accounts.iter().any(|a| a == account);
        if !known {
            return Err(AggregatorError::InvalidSelection {
                exchange: exchange.to_string(),
                account: account.to_string(),
            });
        }
        snapshot.current_exchange = Some(exchange.to_string());
        snapshot.current_account = Some(account.to_string());
        Ok(())
    }

    pub async fn snapshot(&self) -> CombinedSnapshot {
        self.inner.read().await.clone()
    }
}
