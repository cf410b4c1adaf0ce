//! Authenticated session state for one tab.
//!
//! Provides:
//! - The session data model and the provider event vocabulary
//! - The [`IdentityProvider`] boundary the provider SDK is reached through
//! - [`SessionStore`], the observable `{user, session, loading}` state
//! - [`SessionManager`], the public session API
//!
//! ## Design Decisions
//! - The provider is the only authority on whether a session exists; local
//!   state is a cache of its answer and is reconciled, never invented
//! - Sign-out is optimistic: local state is cleared before the network call
//! - Every failure path ends in either "authenticated" or "anonymous"

pub mod error;
pub mod manager;
pub mod provider;
pub mod store;
pub mod types;

pub use error::AuthError;
pub use manager::{RemoteSignOut, SessionManager, SignOutOutcome};
pub use provider::IdentityProvider;
pub use store::{SessionSnapshot, SessionStore};
pub use types::{
    AuthChangeEvent, AuthEvent, OAuthProvider, Session, SignOutScope, SignUpOutcome, User,
};
