//! Operational knobs for the sync service.
//!
//! Everything here is a plain value consumed at construction time. How
//! these get populated (config files, environment, flags) is the host
//! application's concern, not this crate's.

use std::time::Duration;

use nodepulse_api::StreamConfig;
use url::Url;

/// Per-key cache TTLs for the typed accessors and the push path.
#[derive(Debug, Clone)]
pub struct CacheTtls {
    /// `chain.status`. Default: 5s -- height moves fast.
    pub chain_status: Duration,

    /// `chain.throughput`. Default: 10s.
    pub chain_throughput: Duration,

    /// `net.peers`. Default: 15s.
    pub net_peers: Duration,

    /// `market.ticker`. Default: 30s.
    pub market_ticker: Duration,

    /// TTL stamped on values arriving over the push stream. Push data is
    /// authoritative while the stream lives, and this bound makes it go
    /// stale (and thus refetchable) once the stream dies. Default: 60s.
    pub pushed: Duration,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            chain_status: Duration::from_secs(5),
            chain_throughput: Duration::from_secs(10),
            net_peers: Duration::from_secs(15),
            market_ticker: Duration::from_secs(30),
            pushed: Duration::from_secs(60),
        }
    }
}

/// Configuration for [`SyncService`](crate::service::SyncService).
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Stream endpoint. `None` disables the push path entirely; the
    /// service then works purely cache-aside over RPC.
    pub stream_url: Option<Url>,

    /// Connection manager knobs for the push stream.
    pub stream: StreamConfig,

    /// Method name used in subscription envelopes.
    /// Default: `"metrics.subscribe"`.
    pub subscribe_method: String,

    /// Market pair the dashboard tracks. Default: `"PULSE-USD"`.
    pub market_pair: String,

    /// Cache TTLs per key.
    pub ttl: CacheTtls,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            stream_url: None,
            stream: StreamConfig::default(),
            subscribe_method: "metrics.subscribe".to_owned(),
            market_pair: "PULSE-USD".to_owned(),
            ttl: CacheTtls::default(),
        }
    }
}
