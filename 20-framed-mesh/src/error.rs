use std::{io, net::SocketAddr};

use thiserror::Error;

/// Protocol-format failures raised while encoding or decoding a frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame of {len} bytes exceeds the limit of {max} bytes")]
    TooLarge { len: u64, max: u64 },
    #[error("declared frame length {declared} is smaller than the 4-byte header")]
    MalformedHeader { declared: u32 },
}

/// Failure reported by an evaluator. Carried as text so it can be routed to
/// peers like any other result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct EvalError {
    message: String,
}

impl EvalError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("failed to bind {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to dial {addr} after {attempts} attempts")]
    Dial {
        addr: SocketAddr,
        attempts: u32,
        #[source]
        source: io::Error,
    },
    #[error("connection is closed")]
    Closed,
    #[error("no upstream peer is connected")]
    NotConnected,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Outcome of evaluating and routing one line of local input.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("evaluation failed: {0}")]
    Eval(#[from] EvalError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Why a connection stopped. Carried by the disconnect notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` was called locally.
    Shutdown,
    /// The peer closed the stream at a frame boundary.
    PeerClosed,
    Frame(FrameError),
    /// Socket error; holds the rendered `io::Error`.
    Io(String),
    /// The bounded write queue overflowed under the `Disconnect` policy.
    QueueOverflow,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Shutdown => f.write_str("closed locally"),
            CloseReason::PeerClosed => f.write_str("peer closed the connection"),
            CloseReason::Frame(err) => write!(f, "protocol error: {err}"),
            CloseReason::Io(err) => write!(f, "i/o error: {err}"),
            CloseReason::QueueOverflow => f.write_str("write queue overflow"),
        }
    }
}
