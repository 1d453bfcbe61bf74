//! # Error Types
//!
//! Every failure in the node is scoped to a single connection or a single
//! in-flight request. The enums below mirror those boundaries:
//!
//! | Error | Boundary | Effect |
//! |-------|----------|--------|
//! | [`IdentityError`] | identity generation / verification | fatal to the handshake |
//! | [`HandshakeError`] | one new connection | connection closed, never reaches services |
//! | [`TransportError`] | one connection | connection `Closed`, routed requests lost |
//! | [`DispatchError`] | one envelope | logged and dropped |
//! | [`NodeError`] | one API call | returned to the caller |

use std::io;

use crate::identity::PeerId;
use crate::messages::ServiceId;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("invalid puzzle difficulty (static={static_difficulty}, dynamic={dynamic_difficulty})")]
    InvalidDifficulty {
        static_difficulty: u32,
        dynamic_difficulty: u32,
    },
    #[error("puzzle search exhausted after {attempts} attempts (static={static_difficulty}, dynamic={dynamic_difficulty})")]
    PuzzleExhausted {
        attempts: u64,
        static_difficulty: u32,
        dynamic_difficulty: u32,
    },
    #[error("identity does not satisfy the puzzle")]
    VerificationFailed,
    #[error("invalid secret key material")]
    InvalidKey,
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("handshake timed out")]
    Timeout,
    #[error("malformed handshake: {0}")]
    Malformed(&'static str),
    #[error("identity rejected: {0}")]
    Identity(#[from] IdentityError),
    #[error("signature over challenge is invalid")]
    BadSignature,
    #[error("expected peer {expected} but remote presented {actual}")]
    UnexpectedPeer { expected: PeerId, actual: PeerId },
    #[error("remote presented our own identity")]
    SelfConnection,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to listen on {addr}: {source}")]
    Listen {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("connection closed")]
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("no service registered under id {0}")]
    UnknownService(ServiceId),
    #[error("unknown opcode {0}")]
    UnknownOpcode(u32),
    #[error("opcode {0} already registered")]
    DuplicateOpcode(u32),
    #[error("payload rejected: {0}")]
    InvalidPayload(String),
    #[error("handler failed: {0}")]
    Handler(String),
}

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("no route to peer {0}")]
    NoRoute(PeerId),
    #[error("request timed out")]
    RequestTimeout,
    #[error("request cancelled")]
    RequestCancelled,
    #[error("connection lost before a reply arrived")]
    ConnectionLost,
    #[error("node is shut down")]
    Shutdown,
}

impl NodeError {
    /// True for failures that only concern the caller of `request`.
    pub fn is_request_local(&self) -> bool {
        matches!(self, NodeError::RequestTimeout | NodeError::RequestCancelled)
    }
}
