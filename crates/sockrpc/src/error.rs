//! Error types for the protocol, the codec and the call surface.

use core::fmt;

use serde_json::Value;

/// Transport-level errors.
#[derive(Debug)]
pub enum TransportError {
    Closed,
    Io(std::io::Error),
    Handshake(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "transport closed"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Handshake(msg) => write!(f, "handshake failed: {msg}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// A frame that could not be understood.
///
/// Protocol errors are logged and the offending frame dropped; they never
/// close the connection.
#[derive(Debug)]
pub enum ProtocolError {
    Json(serde_json::Error),
    NotAnObject,
    InvalidId(Value),
    InvalidMethod(Value),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json(e) => write!(f, "invalid JSON: {e}"),
            Self::NotAnObject => write!(f, "frame payload is not a JSON object"),
            Self::InvalidId(v) => write!(f, "call identifier is not an unsigned integer: {v}"),
            Self::InvalidMethod(v) => write!(f, "method is not a string: {v}"),
        }
    }
}

impl std::error::Error for ProtocolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}

/// Encoding errors from the codec and the serializer registry.
#[derive(Debug)]
pub enum EncodeError {
    Json(serde_json::Error),
    /// No serializer registered for the value's type.
    Unsupported(&'static str),
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json(e) => write!(f, "encode failed: {e}"),
            Self::Unsupported(ty) => write!(f, "no serializer registered for {ty}"),
        }
    }
}

impl std::error::Error for EncodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for EncodeError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}

/// Route resolution errors.
///
/// These become `{type, message}` error frames sent back to the caller; they
/// never crash the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    /// No registration matches the call path.
    Unresolvable(String),
    /// The method is explicitly masked or private by convention.
    Masked(String),
    /// The route exists but does not implement the method.
    NotImplemented(String),
    /// `remove_route(name, fail=true)` on an absent name.
    NotFound(String),
    /// A route with this name is already registered.
    Duplicate(String),
}

impl fmt::Display for RouteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unresolvable(path) => write!(f, "callback {path:?} is not registered"),
            Self::Masked(_) => write!(f, "Method masked"),
            Self::NotImplemented(_) => write!(f, "Method not implemented"),
            Self::NotFound(name) => write!(f, "route {name:?} is not registered"),
            Self::Duplicate(name) => write!(f, "route {name:?} is already registered"),
        }
    }
}

impl std::error::Error for RouteError {}

/// Failure produced while servicing an inbound call.
///
/// Formatted on the wire as `{"type": kind, "message": message}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    pub kind: String,
    pub message: String,
}

impl HandlerError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for HandlerError {}

impl From<RouteError> for HandlerError {
    fn from(e: RouteError) -> Self {
        let kind = match &e {
            RouteError::Unresolvable(_) | RouteError::NotFound(_) => "Unresolvable",
            _ => "NotImplemented",
        };
        Self::new(kind, e.to_string())
    }
}

impl From<EncodeError> for HandlerError {
    fn from(e: EncodeError) -> Self {
        Self::new("EncodeError", e.to_string())
    }
}

/// Error reported by the remote peer in an error frame.
///
/// `kind` and `message` are extracted from the conventional
/// `{type, message}` shape; `raw` keeps the payload as received for callers
/// that need more.
#[derive(Debug, Clone)]
pub struct RemoteError {
    pub kind: Option<String>,
    pub message: Option<String>,
    pub raw: Value,
}

impl RemoteError {
    pub fn from_value(raw: Value) -> Self {
        let kind = raw
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_owned);
        let message = raw
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_owned);
        Self { kind, message, raw }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.kind, &self.message) {
            (Some(kind), Some(message)) => write!(f, "{kind}: {message}"),
            (Some(kind), None) => write!(f, "{kind}"),
            (None, Some(message)) => write!(f, "{message}"),
            (None, None) => write!(f, "remote error: {}", self.raw),
        }
    }
}

impl std::error::Error for RemoteError {}

/// Caller-observed outcome of an outbound call.
#[derive(Debug)]
pub enum CallError {
    /// The peer answered with an error frame.
    Remote(RemoteError),
    /// No response arrived within the deadline. The remote execution is not
    /// cancelled; no message is sent to the peer.
    TimedOut,
    /// The connection closed while the call was outstanding.
    ConnectionClosed,
    /// The outstanding-call cap was reached; the call was refused.
    TooManyPending,
    Transport(TransportError),
    Encode(EncodeError),
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remote(e) => write!(f, "remote error: {e}"),
            Self::TimedOut => write!(f, "call timed out"),
            Self::ConnectionClosed => write!(f, "connection closed"),
            Self::TooManyPending => write!(f, "too many pending calls"),
            Self::Transport(e) => write!(f, "transport error: {e}"),
            Self::Encode(e) => write!(f, "encode error: {e}"),
        }
    }
}

impl std::error::Error for CallError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Remote(e) => Some(e),
            Self::Transport(e) => Some(e),
            Self::Encode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for CallError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl From<EncodeError> for CallError {
    fn from(e: EncodeError) -> Self {
        Self::Encode(e)
    }
}

impl From<RemoteError> for CallError {
    fn from(e: RemoteError) -> Self {
        Self::Remote(e)
    }
}

/// Errors surfaced while accepting an inbound connection.
#[derive(Debug)]
pub enum AcceptError {
    /// The authorize hook declined the connection.
    Rejected,
    Transport(TransportError),
}

impl fmt::Display for AcceptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected => write!(f, "connection rejected by authorize hook"),
            Self::Transport(e) => write!(f, "transport error: {e}"),
        }
    }
}

impl std::error::Error for AcceptError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for AcceptError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}
