//! Peer lifecycle for a WireGuard server: a SQLite record of every peer, the
//! daemon's live table kept in step with it, and client profiles to hand out.

pub mod alloc;
pub mod error;
pub mod reconciler;
pub mod settings;
pub mod store;
pub mod wg;

pub use error::{Error, Result};
pub use reconciler::Reconciler;
pub use settings::Settings;
