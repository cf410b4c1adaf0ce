//! Browser-style persistent key/value storage shared between tabs.
//!
//! One [`SharedStorage`] stands for the browser profile's storage area; every
//! tab talks to it through its own [`TabStorage`] handle. Writes fan out as
//! [`StorageEvent`]s to every *other* tab, matching the semantics of the
//! DOM `storage` event: a tab is never notified of its own writes, and
//! writes that leave a value unchanged notify nobody.
//!
//! ## Design
//! - In-memory map behind a `parking_lot::Mutex`, optionally mirrored to a
//!   JSON file so sessions survive process restarts
//! - `tokio::sync::broadcast` fan-out; a lagging receiver is told how many
//!   events it missed
//! - Persistence failures are logged and never fail the caller

pub mod shared;

pub use shared::{SharedStorage, StorageEvent, StorageEvents, StorageNotice, TabStorage};
