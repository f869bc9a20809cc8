//! vaultsync: an end-to-end encrypted synchronization fabric for Markdown
//! vaults.
//!
//! Each device runs a local change engine (watcher + scanner + journal), a
//! sync engine speaking a JSON frame protocol over WebSocket, and keeps its
//! own SQLite state store. A relay groups devices by vault identity and
//! routes (but never reads) their deltas. Conflicts preserve both copies.
//!
//! The crate splits along those seams:
//! - [`store`]: journal, versions, cursors, advisory locks
//! - [`detect`]: watcher, scanner, suppression set
//! - [`bus`]: semantic event classification and fan-out
//! - [`crypto`]: key derivation, sealing, identities, tokens
//! - [`protocol`]: the wire message union and envelope rules
//! - [`relay`]: the server
//! - [`engine`]: the client sync engine
//! - [`conflict`]: divergence resolution and loser preservation

pub mod bus;
pub mod config;
pub mod conflict;
pub mod crypto;
pub mod detect;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod relay;
pub mod store;
pub mod types;

pub use config::DaemonConfig;
pub use engine::{EngineConfig, SyncEngine};
pub use error::{Result, SyncError};
pub use relay::{RelayConfig, RelayServer};
