use thiserror::Error;

/// Result type for connector operations
pub type Result<T> = std::result::Result<T, ConnectorError>;

/// Broad classification of a [`ConnectorError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Socket, HTTP or WebSocket level failure
    Transport,
    /// The peer answered, but not the way the protocol expects
    Protocol,
    /// Payload failed structural or type validation
    Validation,
    /// A required connector or device setting is missing
    Configuration,
}

/// Errors that can occur when talking to Shelly devices
#[derive(Error, Debug)]
pub enum ConnectorError {
    /// WebSocket connection error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Device answered an HTTP call with a non-success status
    #[error("HTTP call {path} failed with status {status}")]
    HttpStatus {
        /// Requested path
        path: String,
        /// Returned status code
        status: u16,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Connection was closed unexpectedly
    #[error("Connection closed")]
    ConnectionClosed,

    /// mDNS daemon error
    #[error("mDNS error: {0}")]
    Mdns(String),

    /// RPC call timed out waiting for response
    #[error("Call timeout")]
    Timeout,

    /// Session is closing, outstanding calls are rejected
    #[error("Connection is closing")]
    Closing,

    /// Frame could not be processed
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Device answered an RPC call with an error object
    #[error("RPC error {code}: {message}")]
    Rpc {
        /// Error code reported by the device
        code: i64,
        /// Error message reported by the device
        message: String,
    },

    /// Digest authentication was rejected or could not be performed
    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid or unexpected payload
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Required setting is missing
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Device is not known to the connector
    #[error("Unknown device: {0}")]
    UnknownDevice(String),
}

impl ConnectorError {
    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::WebSocket(_)
            | Self::Http(_)
            | Self::HttpStatus { .. }
            | Self::Io(_)
            | Self::ConnectionClosed
            | Self::Mdns(_) => ErrorKind::Transport,
            Self::Timeout
            | Self::Closing
            | Self::Protocol(_)
            | Self::Rpc { .. }
            | Self::AuthRejected(_) => ErrorKind::Protocol,
            Self::Json(_) | Self::InvalidPayload(_) => ErrorKind::Validation,
            Self::Configuration(_) | Self::UnknownDevice(_) => ErrorKind::Configuration,
        }
    }

    /// Whether the failed operation may succeed on a later attempt
    pub fn is_recoverable(&self) -> bool {
        self.kind() != ErrorKind::Configuration
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(ConnectorError::Timeout.kind(), ErrorKind::Protocol);
        assert_eq!(ConnectorError::ConnectionClosed.kind(), ErrorKind::Transport);
        assert_eq!(
            ConnectorError::InvalidPayload("x".into()).kind(),
            ErrorKind::Validation
        );
        assert!(!ConnectorError::Configuration("generation".into()).is_recoverable());
        assert!(ConnectorError::HttpStatus { path: "/status".into(), status: 500 }.is_recoverable());
    }
}
