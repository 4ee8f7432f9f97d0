//! Error types for console adapter operations

/// Errors from console adapter operations.
#[derive(Debug, thiserror::Error)]
pub enum ConsoleError {
    #[error("session setup failed: {0}")]
    Session(String),

    /// The sign-in callback landed on the reset-password page, which the
    /// console serves when the account has two-factor authentication turned
    /// on. A browser-style session cannot proceed past it.
    #[error("two-factor authentication required to sign in")]
    TwoFactorRequired,

    #[error("could not parse console page: {0}")]
    Parse(String),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("console returned {status} for {context}")]
    Upstream { status: u16, context: String },
}

/// Result alias for console operations.
pub type Result<T> = std::result::Result<T, ConsoleError>;
