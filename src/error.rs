//! Error types for REITTI

use thiserror::Error;

/// Result type alias for REITTI operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for REITTI
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Cluster unreachable or initial namespace sync timed out
    #[error("initialization failed: {0}")]
    Initialization(String),

    /// Host template substitution produced an unparseable URL
    #[error("malformed destination for namespace '{namespace}': {source}")]
    MalformedDestination {
        namespace: String,
        #[source]
        source: url::ParseError,
    },

    /// A dynamic destination matched the name pattern but no client is registered
    #[error("no client found for destination '{0}'")]
    DestinationNotFound(String),

    /// Line encoding failed
    #[error("error creating line: {0}")]
    Encode(String),

    /// No `kubernetes` sub-mapping in the record during automatic labeling
    #[error("kubernetes labels not found, no labels will be added")]
    LabelExtraction,

    /// Backend client error
    #[error("client '{client}' error: {message}")]
    Client { client: String, message: String },

    /// Metrics error
    #[error("metrics error: {0}")]
    Metrics(String),
}

/// Error type for backend client operations
#[derive(Error, Debug)]
pub enum ClientError {
    /// Client construction failed
    #[error("initialization failed: {0}")]
    Init(String),

    /// Send failed
    #[error("send failed: {0}")]
    Send(String),

    /// Connection error
    #[error("connection error: {0}")]
    Connection(String),

    /// Shutdown error
    #[error("shutdown error: {0}")]
    Shutdown(String),
}

impl From<ClientError> for Error {
    fn from(err: ClientError) -> Self {
        Error::Client {
            client: "unknown".to_string(),
            message: err.to_string(),
        }
    }
}
