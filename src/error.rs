use std::fmt;
use serde::{Deserialize, Serialize};

/// Outcome taxonomy shared by every adapter operation and carried
/// on the wire in the `error` field of terminal envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind
{   Success
  , /// Unclassified backend failure
    Unexpected
  , /// Credential rejected by the backend
    Authorization
  , InvalidPrompt
  , /// Unknown backend name at load time
    InvalidProvider
  , /// Model id not recognized by the loaded backend
    InvalidModel
  , /// Adapter-side generation timeout
    Timeout
  , /// Stopped by an interrupt request
    Interrupt
}

impl ErrorKind
{   pub fn is_error(self) -> bool
    {   self != ErrorKind::Success
    }

    pub fn as_str(self) -> &'static str
    {   match self
        {   ErrorKind::Success => "SUCCESS"
          , ErrorKind::Unexpected => "UNEXPECTED"
          , ErrorKind::Authorization => "AUTHORIZATION"
          , ErrorKind::InvalidPrompt => "INVALID_PROMPT"
          , ErrorKind::InvalidProvider => "INVALID_PROVIDER"
          , ErrorKind::InvalidModel => "INVALID_MODEL"
          , ErrorKind::Timeout => "TIMEOUT"
          , ErrorKind::Interrupt => "INTERRUPT"
        }
    }

    /// Collapse a sync result into its kind.
    pub fn of<T>(result: &Result<T, ErrorKind>) -> ErrorKind
    {   match result
        {   Ok(_) => ErrorKind::Success
          , Err(kind) => *kind
        }
    }
}

impl fmt::Display for ErrorKind
{   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {   f.write_str(self.as_str())
    }
}

/// Custom error type for gateway and client operations
/// Implements Clone for sending through channels
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error
{   /// The gateway did not acknowledge a request in time
    AckTimeout(String)
  , /// A terminal envelope reported a failure
    Generation(ErrorKind)
  , /// The socket connection is gone
    ConnectionClosed
  , /// WebSocket or socket-level failure
    Transport(String)
  , /// Failed to parse a frame or file
    ParseError(String)
  , /// Invalid configuration
    InvalidConfiguration(String)
  , /// Generic error
    Other(String)
}

impl fmt::Display for Error
{   fn fmt(&self, f: &mut fmt::Formatter<'_>)
      -> fmt::Result
    {   match self
        {   Error::AckTimeout(operation) => {
              write!(f,
                "{} timed out, gateway may be closed",
                operation
              )
            }
          , Error::Generation(kind) => {
              write!(f, "Gateway reported error: {}", kind)
            }
          , Error::ConnectionClosed => {
              write!(f, "Connection to gateway closed")
            }
          , Error::Transport(msg) => {
              write!(f, "Transport error: {}", msg)
            }
          , Error::ParseError(msg) => {
              write!(f, "Parse error: {}", msg)
            }
          , Error::InvalidConfiguration(msg) => {
              write!(f, "Invalid configuration: {}", msg)
            }
          , Error::Other(msg) => {
              write!(f, "Error: {}", msg)
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<String> for Error
{   fn from(s: String) -> Self
    {   Error::Other(s)
    }
}

impl From<&str> for Error
{   fn from(s: &str) -> Self
    {   Error::Other(s.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error
{   fn from(e: tokio_tungstenite::tungstenite::Error) -> Self
    {   match e
        {   tokio_tungstenite::tungstenite::Error::ConnectionClosed
          | tokio_tungstenite::tungstenite::Error::AlreadyClosed => {
              Error::ConnectionClosed
            }
          , other => Error::Transport(other.to_string())
        }
    }
}

impl From<serde_json::Error> for Error
{   fn from(e: serde_json::Error) -> Self
    {   Error::ParseError(e.to_string())
    }
}
