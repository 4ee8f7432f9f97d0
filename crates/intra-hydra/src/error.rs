//! Error types for engine operations

/// Errors from engine operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("fleet is empty, nothing to dispatch to")]
    EmptyFleet,

    #[error("request submitted without a url")]
    EmptyUrl,

    #[error("fleet size {0} is out of range (0..=200)")]
    FleetSize(usize),

    #[error("no console adapter configured, cannot {0}")]
    NoConsole(&'static str),

    #[error("could not build http client: {0}")]
    Client(String),

    #[error("credential store error: {0}")]
    Store(String),

    #[error("console error: {0}")]
    Console(#[from] intra_console::ConsoleError),

    #[error("response serialization failed: {0}")]
    Serialize(String),
}

/// Result alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
