//! Typed convenience wrappers over [`RpcClient`], one per logical
//! namespace of the node's RPC surface.
//!
//! These return domain structs instead of raw JSON; anything the node
//! sends beyond the typed fields is preserved in `extra` so nothing is
//! silently dropped.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::Error;
use crate::rpc::RpcClient;

// ── chain.* ──────────────────────────────────────────────────────────

/// Result of `chain.getStatus`: where the chain tip is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainStatus {
    /// Current best block height.
    pub height: u64,

    /// Hash of the best block.
    pub best_hash: String,

    /// Height of the latest finalized block, if the node tracks finality.
    #[serde(default)]
    pub finalized_height: Option<u64>,

    #[serde(flatten)]
    pub extra: Value,
}

/// Result of `chain.getThroughput`: how fast the chain is moving.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Throughput {
    /// Transactions per second over the node's sampling window.
    pub tps: f64,

    /// Average seconds between recent blocks.
    pub block_interval_secs: f64,

    /// Transactions currently waiting in the mempool.
    #[serde(default)]
    pub mempool_size: u64,

    #[serde(flatten)]
    pub extra: Value,
}

// ── net.* ────────────────────────────────────────────────────────────

/// One peer entry within [`PeerSummary`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub id: String,

    #[serde(default)]
    pub address: Option<String>,

    #[serde(default)]
    pub latency_ms: Option<u64>,
}

/// Result of `net.getPeers`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSummary {
    pub connected: u32,

    #[serde(default)]
    pub inbound: u32,

    #[serde(default)]
    pub outbound: u32,

    #[serde(default)]
    pub peers: Vec<PeerInfo>,
}

// ── market.* ─────────────────────────────────────────────────────────

/// Result of `market.getTicker`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketTicker {
    /// Trading pair, e.g. `"PULSE-USD"`.
    pub pair: String,

    pub price: f64,

    #[serde(default)]
    pub change_24h_pct: f64,

    #[serde(default)]
    pub volume_24h: f64,
}

// ── Typed call surface ───────────────────────────────────────────────

impl RpcClient {
    pub async fn chain_status(&self) -> Result<ChainStatus, Error> {
        self.call_typed("chain.getStatus", json!([])).await
    }

    pub async fn chain_throughput(&self) -> Result<Throughput, Error> {
        self.call_typed("chain.getThroughput", json!([])).await
    }

    pub async fn net_peers(&self) -> Result<PeerSummary, Error> {
        self.call_typed("net.getPeers", json!([])).await
    }

    pub async fn market_ticker(&self, pair: &str) -> Result<MarketTicker, Error> {
        self.call_typed("market.getTicker", json!([pair])).await
    }

    async fn call_typed<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, Error> {
        let raw = self.call(method, params).await?;
        serde_json::from_value(raw)
            .map_err(|e| Error::Protocol(format!("unexpected {method} result shape: {e}")))
    }
}
