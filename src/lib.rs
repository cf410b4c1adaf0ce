//! Authenticated-session synchronization core.
//!
//! Keeps one tab's view of the signed-in user consistent with the identity
//! provider and with every other tab sharing the same storage:
//! - [`auth`]: session model, provider boundary, store and public API
//! - [`billing`]: subscription status with stale-while-revalidate caching
//! - [`sync`]: cross-tab reconciliation, sign-out verification, sync guard
//! - [`storage`] / [`cache`]: shared tab storage and TTL artifacts on top
//! - [`integrations`]: the Supabase Auth backend

pub mod auth;
pub mod billing;
pub mod cache;
pub mod config;
pub mod integrations;
pub mod storage;
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;

pub use auth::{AuthError, SessionManager, SessionSnapshot};
pub use config::SessionConfig;
