//! Wire protocol and transport for the nodepulse dashboard.
//!
//! Two independent transport surfaces, composed by `nodepulse-core`:
//!
//! - **[`ws`]** — the connection manager: one persistent WebSocket to the
//!   node's metrics stream, with heartbeat, exponential-backoff
//!   reconnection, and a bounded offline send queue. Lifecycle decisions
//!   live in a pure state machine so they are testable without timers.
//!
//! - **[`rpc`]** — the request/response client: JSON-RPC 2.0 with
//!   in-flight deduplication, window batching, per-call timeout, and
//!   bounded retry. Typed wrappers per namespace live in [`methods`].
//!
//! Plus the shared pieces: [`protocol`] wire types, [`transport`] HTTP
//! client construction, [`report`] best-effort error forwarding, and the
//! crate-wide [`Error`] taxonomy.

pub mod error;
pub mod methods;
pub mod protocol;
pub mod report;
pub mod rpc;
pub mod transport;
pub mod ws;

// ── Primary re-exports ──────────────────────────────────────────────
pub use error::Error;
pub use methods::{ChainStatus, MarketTicker, PeerInfo, PeerSummary, Throughput};
pub use report::{ErrorReport, ErrorReporter};
pub use rpc::{CallConfig, RpcClient};
pub use transport::TransportConfig;
pub use ws::{
    ConnEvent, ConnectionHandle, ConnectionState, MetricsSnapshot, ReconnectPolicy, StreamConfig,
};
