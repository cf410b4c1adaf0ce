//! Boundary to the identity provider SDK.
//!
//! The provider owns session issuance, OAuth redirects and password flows.
//! The session core only reads its session and listens to its auth event
//! stream; it never writes the provider's persisted session itself.

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::error::AuthError;
use super::types::{AuthEvent, OAuthProvider, Session, SignOutScope, SignUpOutcome};

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Current live session, refreshing it first if it is about to expire.
    ///
    /// `Ok(None)` means the provider has no session for this client.
    async fn get_session(&self) -> Result<Option<Session>, AuthError>;

    /// Auth state change stream (`onAuthStateChange`).
    fn subscribe(&self) -> broadcast::Receiver<AuthEvent>;

    /// Build the URL that starts the OAuth redirect flow.
    async fn sign_in_with_oauth(
        &self,
        provider: OAuthProvider,
        redirect_to: Option<&str>,
    ) -> Result<String, AuthError>;

    async fn sign_in_with_password(&self, email: &str, password: &str)
        -> Result<Session, AuthError>;

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: serde_json::Value,
    ) -> Result<SignUpOutcome, AuthError>;

    async fn sign_out(&self, scope: SignOutScope) -> Result<(), AuthError>;

    fn name(&self) -> &'static str;
}
