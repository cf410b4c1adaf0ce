//! Local artifact cache with TTL-based expiry.
//!
//! Derived data (subscription status, avatars, app lists) is stored in the
//! shared tab storage as `{data, timestamp}` envelopes under namespaced
//! keys, so every tab can read what another tab fetched.

pub mod artifact;

pub use artifact::{ArtifactCache, CachedArtifact, Clock, Freshness, SystemClock};
