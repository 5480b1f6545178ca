//! duet-core - Core library for Duet
//!
//! Keeps a high-availability primary store and a disconnected-capable local
//! store converged: change detection through per-store cursors, conflict
//! resolution, an offline write queue with ordered replay, and a per-store
//! schema migration ledger.

pub mod config;
pub mod control;
pub mod db;
pub mod error;
pub mod migrate;
pub mod models;
pub mod offline;
pub mod state;
pub mod store;
pub mod sync;
pub mod util;

pub use control::ControlSurface;
pub use error::{Error, Result};
pub use models::{Record, RecordKey, StoreId, TenantId};
