//! Storage interfaces for sessions and signing-key blocks.
//!
//! The backend is selected once at startup and shared behind
//! [`SharedStore`]:
//!
//! - [`MemoryStore`] - in-process, for tests and single instances
//! - `keygate-auth-redis` - shared Redis backend

pub mod kv;
pub mod memory;
pub mod session;

pub use kv::{KeyValueStore, SharedStore};
pub use memory::MemoryStore;
pub use session::{KvSessionStore, RecentIssue, Session, SessionStore, SharedSessionStore};
