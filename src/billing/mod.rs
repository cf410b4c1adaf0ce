//! Entitlement state derived from the signed-in user.
//!
//! ## Design
//! - One HTTP endpoint reports the subscription status for a user id
//! - Results are cached per user for 5 minutes in tab storage
//! - Cached reads are served immediately and revalidated in the background

pub mod subscription;

pub use subscription::{
    subscription_cache_key, EntitlementApi, HttpEntitlementApi, SubscriptionFetcher,
    SubscriptionStatus,
};
