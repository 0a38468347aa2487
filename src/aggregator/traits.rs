use async_trait::async_trait;

use crate::aggregator::types::ExchangeData;
use crate::error::AggregatorError;

/// Capability set shared by every exchange/account-mode client.
#[async_trait]
pub trait ExchangeClient {
    /// One authenticated round trip validating credentials. Clients that are
    /// sensitive to timestamp skew also record a server-clock offset here,
    /// reused on every later signed request.
    async fn initialize(&mut self) -> Result<(), AggregatorError>;

    /// Fetch and normalize one complete snapshot. Independent sub-requests
    /// fan out concurrently; any failure fails the snapshot as a unit, no
    /// partial data is returned. Does not touch the cache.
    async fn fetch_snapshot(&self) -> Result<ExchangeData, AggregatorError>;
}
