use std::sync::Arc;

/// Result type used throughout the SDK, with [`Error`] as the error variant.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors surfaced by the SDK.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The environment secret is empty or not a hex string.
    #[error("invalid env secret")]
    InvalidSecret,

    /// The streaming or event URL cannot be parsed.
    #[error("invalid streaming url or event url")]
    InvalidUrl(#[source] url::ParseError),

    /// The client was constructed but the first data sync did not complete
    /// within the start-wait window. The synchronizer keeps running in the
    /// background.
    #[error("timeout encountered waiting for client initialization")]
    InitializationTimeout,

    /// The synchronizer concluded it will never succeed (unrecoverable
    /// close, DNS failure, invalid payload).
    #[error("client initialization failed")]
    InitializationFailed,

    /// An evaluation was requested before the client reached the OK state.
    #[error("evaluation is called before client is initialized")]
    ClientNotReady,

    /// The requested flag key is not present in the snapshot.
    #[error("feature flag not found")]
    FlagNotFound,

    /// The user is missing its key or name.
    #[error("invalid user")]
    UserInvalid,

    /// The flag value cannot be coerced to the requested type.
    #[error("flag type doesn't match the request")]
    WrongType,

    /// The evaluation pipeline produced no result. Unreachable with a
    /// well-formed fallthrough; treated as recoverable.
    #[error("evaluation failed")]
    EvalFailed,

    /// A JSON flag value failed to decode into the requested shape.
    #[error("json value cannot be decoded")]
    Json(Arc<serde_json::Error>),

    /// Network error while sending events.
    #[error(transparent)]
    // reqwest::Error is not clonable, so we're wrapping it in an Arc.
    Network(Arc<reqwest::Error>),

    /// All delivery attempts for one events batch were exhausted.
    #[error("events sending failed")]
    SendFailed,
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Json(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}

impl From<url::ParseError> for Error {
    fn from(value: url::ParseError) -> Self {
        Error::InvalidUrl(value)
    }
}
