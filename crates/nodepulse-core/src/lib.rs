//! Reactive data layer between `nodepulse-api` and the render layer.
//!
//! This crate owns the pieces the dashboard's UI consumes:
//!
//! - **[`Store`]** — keyed reactive cache: TTL staleness on read, per-key
//!   subscriptions with idempotent unsubscribe handles, deep-equality
//!   change suppression, and computed values memoized on dependency
//!   versions.
//!
//! - **[`ErrorBoundary`]** — the single sink for every failure:
//!   classification, a bounded record log, `(kind, message)` dedup with
//!   throttled user notification, suppression rules, and optional
//!   forwarding to a remote log endpoint. The only place user-facing
//!   error copy is produced.
//!
//! - **[`SyncService`]** — the facade composing an
//!   [`RpcClient`](nodepulse_api::RpcClient) and the push stream with the
//!   store: typed cache-aside accessors, the stream bridge writing push
//!   updates into store keys, and a degraded-connectivity indicator.
//!
//! Everything is constructed explicitly and passed by reference -- no
//! global singletons, so tests build isolated instances.
//!
//! ```rust,no_run
//! use nodepulse_api::{CallConfig, RpcClient, TransportConfig};
//! use nodepulse_core::boundary::{BoundaryConfig, ErrorBoundary};
//! use nodepulse_core::config::SyncConfig;
//! use nodepulse_core::service::SyncService;
//! use nodepulse_core::store::{Store, StoreConfig};
//! use url::Url;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let rpc = RpcClient::new(
//!     Url::parse("https://node.example/rpc")?,
//!     &TransportConfig::default(),
//!     CallConfig::default(),
//! )?;
//! let store = Store::new(StoreConfig::default());
//! let boundary = ErrorBoundary::new(BoundaryConfig::default(), None);
//!
//! let service = SyncService::new(SyncConfig::default(), rpc, store, boundary);
//! service.start();
//! # Ok(())
//! # }
//! ```

pub mod boundary;
pub mod config;
pub mod error;
pub mod service;
pub mod store;

// ── Primary re-exports ──────────────────────────────────────────────
pub use boundary::{
    BoundaryConfig, BoundaryStats, ErrorBoundary, ErrorKind, ErrorRecord, UserNotice,
};
pub use config::{CacheTtls, SyncConfig};
pub use error::CoreError;
pub use service::SyncService;
pub use store::{CacheRead, Store, StoreConfig, SubscriptionHandle};
