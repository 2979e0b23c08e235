use std::io;

/// Everything that can go wrong between `create` and `destroy`.
///
/// Argument contract violations are reported synchronously by the entry
/// points; failures of asynchronous work (resolution, binding, connecting,
/// the allocation exchange itself) surface through an `on_state` transition
/// to a non-ready terminal state, with the reason logged.
#[derive(Debug)]
pub enum Error {
    /// An argument contract was violated.
    Invalid(&'static str),
    /// The operation needs a live session in the right state, and the
    /// session is gone or not there yet.
    InvalidState,
    /// Every port in the configured bind range was already taken.
    BindExhausted,
    /// The transport-level connect to the server failed.
    ConnectFailed(io::Error),
    /// Malformed STUN/TURN traffic from the server.
    ProtocolError,
    /// The server demands credentials and none were configured.
    AuthRequired,
    /// The server rejected the configured credentials.
    AuthFailed,
    /// The allocation was refused with a final error response.
    AllocRejected(u16),
    /// The stream transport was closed by the server.
    ClosedByPeer,
    /// A stun transaction ran out of retransmits.
    TimedOut,
    Io(io::Error),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Invalid(it) => write!(f, "invalid argument: {}", it),
            Self::InvalidState => write!(f, "invalid state"),
            Self::BindExhausted => write!(f, "bind port range exhausted"),
            Self::ConnectFailed(it) => write!(f, "connect failed: {}", it),
            Self::ProtocolError => write!(f, "protocol error"),
            Self::AuthRequired => write!(f, "authentication required"),
            Self::AuthFailed => write!(f, "authentication failed"),
            Self::AllocRejected(code) => write!(f, "allocation rejected: {}", code),
            Self::ClosedByPeer => write!(f, "closed by peer"),
            Self::TimedOut => write!(f, "transaction timed out"),
            Self::Io(it) => write!(f, "{}", it),
        }
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}
