//! Error types for xcc-rs.
//!
//! Errors are organized by functional area and unified in [`XccError`].
//! Every fallible public operation returns [`Result`].

use crate::query::request::RequestSummary;
use serde::Deserialize;
use std::fmt;
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T, E = XccError> = std::result::Result<T, E>;

/// Top-level error type encompassing all possible errors.
#[derive(Error, Debug)]
pub enum XccError {
    /// Connection-related errors
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Transport and framing errors
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Well-formed error response from the server evaluator
    #[error(transparent)]
    Server(#[from] Box<ServerException>),

    /// Missing or rejected credentials
    #[error("Permission denied: {message}")]
    Permission {
        message: String,
        /// Retrying with corrected credentials is expected to succeed
        retry_advised: bool,
    },

    /// Local misuse (closed session, cursor misuse, transaction-mode violations)
    #[error(transparent)]
    Usage(#[from] UsageError),

    /// I/O fault encountered while iterating a streaming result
    #[error("Streaming result failed: {0}")]
    StreamingResult(String),

    /// Value conversion errors
    #[error(transparent)]
    Conversion(#[from] ConversionError),
}

/// Errors related to establishing connections.
#[derive(Error, Debug, Clone)]
pub enum ConnectionError {
    /// Failed to establish connection to the server
    #[error("Failed to connect to {host}:{port}: {message}")]
    ConnectionFailed {
        host: String,
        port: u16,
        message: String,
    },

    /// Invalid connection parameters
    #[error("Invalid connection parameter '{parameter}': {message}")]
    InvalidParameter { parameter: String, message: String },

    /// Connection URI parsing error
    #[error("Failed to parse connection URI: {0}")]
    ParseError(String),

    /// Connection timeout
    #[error("Connection timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Connection is closed
    #[error("Connection is closed")]
    ConnectionClosed,

    /// TLS configuration or handshake error
    #[error("TLS error: {0}")]
    TlsError(String),
}

/// Errors related to the wire protocol.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// Network I/O error
    #[error("Network I/O error: {0}")]
    IoError(String),

    /// Unexpected or garbled response framing
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Invalid response from server
    #[error("Invalid server response: {0}")]
    InvalidResponse(String),

    /// Message send error
    #[error("Failed to send request: {0}")]
    SendError(String),

    /// Message receive error
    #[error("Failed to receive response: {0}")]
    ReceiveError(String),

    /// Error body could not be decoded
    #[error("Deserialization error: {0}")]
    SerializationError(String),

    /// Socket read timeout
    #[error("Read timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// TLS/SSL error
    #[error("TLS error: {0}")]
    TlsError(String),
}

/// Local misuse of the API. Never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UsageError {
    /// The session has been closed
    #[error("Session is closed")]
    SessionClosed,

    /// The result sequence has been closed
    #[error("Result sequence is closed")]
    SequenceClosed,

    /// Operation is not legal in the current state
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// Request was created by a different session
    #[error("Request does not belong to this session")]
    ForeignRequest,

    /// Operation is not supported by this object
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Iterator was invalidated by a newer iteration of its sequence
    #[error("Iterator has been invalidated by a newer iteration")]
    StaleIterator,

    /// Item body has already been consumed
    #[error("Result item {index} is no longer fetchable")]
    NotFetchable { index: usize },

    /// Invalid argument
    #[error("Invalid argument '{parameter}': {message}")]
    InvalidArgument { parameter: String, message: String },
}

/// Errors related to value conversion.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConversionError {
    /// Unknown primitive type name
    #[error("Unsupported value type: {type_name}")]
    UnsupportedType { type_name: String },

    /// Lexical form does not match the value type
    #[error("Invalid lexical value '{value}' for {type_name}")]
    InvalidLexical { type_name: String, value: String },

    /// Malformed packed sequence or item body
    #[error("Invalid data format: {0}")]
    InvalidFormat(String),

    /// Invalid UTF-8 in a textual item
    #[error("Invalid UTF-8 in result item {index}")]
    InvalidUtf8 { index: usize },
}

/// One evaluator stack frame reported with a server fault.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackFrame {
    pub uri: Option<String>,
    pub line: Option<u32>,
    pub column: Option<u32>,
    pub operation: Option<String>,
    pub context: Option<String>,
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "in {} line {}",
            self.uri.as_deref().unwrap_or("<anonymous>"),
            self.line.unwrap_or(0)
        )?;
        if let Some(op) = &self.operation {
            write!(f, ": {}", op)?;
        }
        Ok(())
    }
}

/// Structured server fault.
#[derive(Error, Debug, Clone)]
#[error("{code}: {message}")]
pub struct ServerException {
    /// Server error code, e.g. `XDMP-NOTXN`
    pub code: String,
    /// Optional W3C-style code, e.g. `err:XPTY0004`
    pub w3c_code: Option<String>,
    pub message: String,
    pub format_string: Option<String>,
    pub data: Vec<String>,
    /// Set by the server for transient conditions
    pub retryable: bool,
    pub stack: Vec<StackFrame>,
    /// HTTP status of the response that carried the fault
    pub http_status: u16,
    /// Request that produced the fault
    pub request: Option<RequestSummary>,
}

impl ServerException {
    /// Create a fault with just a code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            w3c_code: None,
            message: message.into(),
            format_string: None,
            data: Vec::new(),
            retryable: false,
            stack: Vec::new(),
            http_status: 500,
            request: None,
        }
    }

    /// Attach the originating request.
    pub fn with_request(mut self, request: RequestSummary) -> Self {
        self.request = Some(request);
        self
    }

    /// Decode an error response body.
    ///
    /// Bodies that are not a JSON `errorResponse` yield a fault coded
    /// `HTTP-<status>` carrying the body text. Status 503 is retryable unless
    /// the body says otherwise.
    pub fn from_response(status: u16, reason: &str, body: &[u8]) -> Self {
        let default_retryable = status == 503;
        match serde_json::from_slice::<ErrorEnvelope>(body) {
            Ok(ErrorEnvelope { error_response: e }) => Self {
                code: e
                    .code
                    .or(e.message_code)
                    .unwrap_or_else(|| format!("HTTP-{}", status)),
                w3c_code: e.w3c_code.filter(|c| !c.is_empty()),
                message: e.message.unwrap_or_else(|| reason.to_string()),
                format_string: e.format_string,
                data: e.data,
                retryable: e.retryable.unwrap_or(default_retryable),
                stack: e.stack.into_iter().map(StackFrame::from).collect(),
                http_status: status,
                request: None,
            },
            Err(_) => {
                let text = String::from_utf8_lossy(body).trim().to_string();
                let mut fault = Self::new(
                    format!("HTTP-{}", status),
                    if text.is_empty() { reason.to_string() } else { text },
                );
                fault.retryable = default_retryable;
                fault.http_status = status;
                fault
            }
        }
    }
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    #[serde(rename = "errorResponse")]
    error_response: ErrorBody,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    code: Option<String>,
    message_code: Option<String>,
    w3c_code: Option<String>,
    message: Option<String>,
    format_string: Option<String>,
    #[serde(default)]
    data: Vec<String>,
    retryable: Option<bool>,
    #[serde(default)]
    stack: Vec<FrameBody>,
}

#[derive(Deserialize)]
struct FrameBody {
    uri: Option<String>,
    line: Option<u32>,
    column: Option<u32>,
    operation: Option<String>,
    context: Option<String>,
}

impl From<FrameBody> for StackFrame {
    fn from(frame: FrameBody) -> Self {
        Self {
            uri: frame.uri,
            line: frame.line,
            column: frame.column,
            operation: frame.operation,
            context: frame.context,
        }
    }
}

/// Broad error class used by retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transport-level failure
    Connection,
    /// Error reported by the evaluator
    Server,
    /// Credentials problem
    Permission,
    /// Local API misuse
    Usage,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::Connection => write!(f, "CONNECTION"),
            ErrorClass::Server => write!(f, "SERVER"),
            ErrorClass::Permission => write!(f, "PERMISSION"),
            ErrorClass::Usage => write!(f, "USAGE"),
        }
    }
}

impl XccError {
    /// Map to the broad error class.
    pub fn class(&self) -> ErrorClass {
        match self {
            XccError::Connection(_) | XccError::Transport(_) | XccError::StreamingResult(_) => {
                ErrorClass::Connection
            }
            XccError::Server(_) => ErrorClass::Server,
            XccError::Permission { .. } => ErrorClass::Permission,
            XccError::Usage(_) | XccError::Conversion(_) => ErrorClass::Usage,
        }
    }

    /// Whether a caller may reasonably retry the failed operation unchanged.
    pub fn is_retryable(&self) -> bool {
        match self {
            XccError::Connection(e) => e.is_transient(),
            XccError::Transport(e) => e.is_transient(),
            XccError::Server(e) => e.retryable,
            _ => false,
        }
    }

    /// Server error code, if this is a server fault.
    pub fn server_code(&self) -> Option<&str> {
        match self {
            XccError::Server(e) => Some(e.code.as_str()),
            _ => None,
        }
    }

    /// Shorthand for an illegal-state usage error.
    pub(crate) fn illegal_state(message: impl Into<String>) -> Self {
        XccError::Usage(UsageError::IllegalState(message.into()))
    }

    /// Shorthand for an invalid-argument usage error.
    pub(crate) fn invalid_argument(parameter: &str, message: impl Into<String>) -> Self {
        XccError::Usage(UsageError::InvalidArgument {
            parameter: parameter.to_string(),
            message: message.into(),
        })
    }
}

impl From<ServerException> for XccError {
    fn from(err: ServerException) -> Self {
        XccError::Server(Box::new(err))
    }
}

impl ConnectionError {
    /// Transient faults that a fresh attempt may overcome.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ConnectionError::ConnectionFailed { .. }
                | ConnectionError::Timeout { .. }
                | ConnectionError::ConnectionClosed
        )
    }
}

impl TransportError {
    /// Transient faults that a fresh attempt may overcome.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            TransportError::SerializationError(_) | TransportError::TlsError(_)
        )
    }
}

// Conversions from external error types
impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::SerializationError(err.to_string())
    }
}

impl From<rustls::Error> for ConnectionError {
    fn from(err: rustls::Error) -> Self {
        ConnectionError::TlsError(err.to_string())
    }
}
