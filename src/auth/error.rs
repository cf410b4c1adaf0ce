//! Error type shared by the session core.

/// Failures surfaced to callers of the session API.
///
/// Only provider errors from explicit sign-in/sign-up reach the UI; sync and
/// refresh paths log these and fall back to the next-best known state.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The identity provider rejected the request (bad credentials, etc.).
    #[error("provider rejected request ({status}): {message}")]
    Provider { status: u16, message: String },

    /// Transport-level failure talking to the provider or the API.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// A response or stored value could not be decoded.
    #[error("invalid response: {0}")]
    InvalidResponse(#[from] serde_json::Error),

    /// The entitlement endpoint answered with a non-success status.
    #[error("entitlement request failed ({status}): {message}")]
    Entitlement { status: u16, message: String },

    /// Local persistence failure.
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl AuthError {
    /// Whether the provider authoritatively refused the credentials, as
    /// opposed to a transient failure worth retrying.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Provider { status, .. } if (400..500).contains(status))
    }
}
