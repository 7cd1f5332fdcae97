//! Error types for the warren client library

use warren::protocol::{CodecError, MaxChannels};

/// Main error type for warren client operations
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed frame from the broker
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Timeout errors
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The broker refused the protocol header, mechanism or `connection.open`
    #[error("Handshake rejected: {message}")]
    HandshakeRejected { message: String },

    /// Every channel id on this connection has been handed out
    #[error("No channel ids left on this connection (max {max})")]
    MaxChannels { max: u16 },

    /// The channel was closed, by the broker (soft error) or locally
    #[error("Channel closed ({code}): {text}")]
    ChannelClosed { code: u16, text: String },

    /// The connection was closed, by the broker (hard error) or locally
    #[error("Connection closed ({code}): {text}")]
    ConnectionClosed { code: u16, text: String },

    /// The broker answered with a method the request does not expect
    #[error("Unexpected reply: expected {expected}, got {got}")]
    UnexpectedReply {
        expected: &'static str,
        got: &'static str,
    },
}

impl ClientError {
    /// Create a timeout error
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    /// Create a handshake error
    pub fn handshake<S: Into<String>>(message: S) -> Self {
        Self::HandshakeRejected {
            message: message.into(),
        }
    }

    /// Reply code carried by a broker-initiated close, if any.
    pub fn reply_code(&self) -> Option<u16> {
        match self {
            Self::ChannelClosed { code, .. } | Self::ConnectionClosed { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Check if this error closed only the channel
    pub fn is_channel_closed(&self) -> bool {
        matches!(self, Self::ChannelClosed { .. })
    }

    /// Check if this error closed the whole connection
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, Self::ConnectionClosed { .. } | Self::Io(_))
    }

    /// Check if this error is a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<MaxChannels> for ClientError {
    fn from(err: MaxChannels) -> Self {
        Self::MaxChannels { max: err.max }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = ClientError::timeout(5000);
        assert!(err.is_timeout());
        assert!(!err.is_connection_closed());

        let err = ClientError::handshake("bad header");
        assert_eq!(err.to_string(), "Handshake rejected: bad header");
    }

    #[test]
    fn test_reply_code() {
        let err = ClientError::ChannelClosed {
            code: 404,
            text: "no queue 'jobs'".to_string(),
        };
        assert!(err.is_channel_closed());
        assert_eq!(err.reply_code(), Some(404));

        let err = ClientError::ConnectionClosed {
            code: 540,
            text: "headers exchange".to_string(),
        };
        assert!(err.is_connection_closed());
        assert_eq!(err.reply_code(), Some(540));
        assert_eq!(ClientError::timeout(1).reply_code(), None);
    }

    #[test]
    fn test_max_channels_conversion() {
        let err: ClientError = MaxChannels { max: 7 }.into();
        assert!(matches!(err, ClientError::MaxChannels { max: 7 }));
    }
}
