//! # Error Definitions
//!
//! The central ledger of failures surfaced by the proxy engine.

/// Failures of the proxy engine itself, or of the remote call it forwarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A WireValue tag is not registered on the receiving side.
    UnknownWireType(String),
    /// The exposed call threw. Carries the description and trace as one string.
    RemoteThrow(String),
    /// The endpoint cannot send or cannot listen, rejected before any message is sent.
    EndpointContractViolation(String),
    /// A message contained something the channel cannot structurally clone.
    DataClone(String),
    /// A message was malformed or did not match the expected shape.
    Protocol(String),
    /// APPLY, CONSTRUCT and SET need at least one path segment.
    EmptyCallPath,
    /// A traversal went deeper than the configured limit.
    DepthLimitExceeded(usize),
    /// The endpoint shut down before a response arrived.
    ChannelClosed,
    /// No async runtime was available to drive the endpoint.
    Runtime(String),
    /// A worker context failed to start or stop.
    Worker(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownWireType(kind) => write!(f, "Unknown wire type: {}", kind),
            Self::RemoteThrow(msg) => write!(f, "Remote threw: {}", msg),
            Self::EndpointContractViolation(msg) => write!(f, "Endpoint contract violation: {}", msg),
            Self::DataClone(msg) => write!(f, "Data clone error: {}", msg),
            Self::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            Self::EmptyCallPath => write!(f, "Call path is empty"),
            Self::DepthLimitExceeded(limit) => write!(f, "Value nesting exceeds depth limit of {}", limit),
            Self::ChannelClosed => write!(f, "Endpoint closed before a response arrived"),
            Self::Runtime(msg) => write!(f, "Runtime error: {}", msg),
            Self::Worker(msg) => write!(f, "Worker error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;
