//! # Wire Protocol Messages
//!
//! Everything that crosses a connection is a [`Frame`]:
//!
//! | Frame | Phase | Purpose |
//! |-------|-------|---------|
//! | `Hello` | handshake | present a [`PublicIdentity`] and a fresh challenge |
//! | `Proof` | handshake | signature over the peer's challenge |
//! | `Envelope` | active | application or discovery traffic for one service |
//!
//! Service payloads that carry more than one message type are wrapped in an
//! [`OpcodeFrame`] and decoded through an [`OpcodeRegistry`]. The opcode
//! table is explicit: a message type is decodable only after it has been
//! registered, and registering the same opcode twice is an error.
//!
//! ## Security Limits
//!
//! - `MAX_PAYLOAD_SIZE`: largest envelope payload (1 MiB)
//! - `MAX_FRAME_SIZE`: largest encoded frame, payload plus envelope overhead
//! - All decoding goes through [`deserialize_bounded`]
//!
//! Decoding allows trailing bytes, so a field appended to a message by a
//! newer peer is ignored by an older one.

use std::collections::HashMap;

use bincode::Options;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::DispatchError;
use crate::identity::{PeerId, PublicIdentity};

/// Identifies a service multiplexed over a connection.
pub type ServiceId = u16;

/// Identifies a message type inside one service's payloads.
pub type Opcode = u32;

/// Maximum size of an envelope payload (1 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Maximum encoded frame size, payload plus framing overhead.
pub const MAX_FRAME_SIZE: usize = MAX_PAYLOAD_SIZE + 4096;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_FRAME_SIZE as u64)
        .with_fixint_encoding()
        .allow_trailing_bytes()
}

/// Encoding is unbounded; size limits are enforced where frames are written.
pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .serialize(value)
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

// ============================================================================
// Envelope
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeKind {
    OneWay,
    Request,
    Reply,
}

/// A unit of service traffic.
///
/// `nonce` is set on requests and copied onto their replies; one-way
/// messages carry none.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub sender: PeerId,
    pub recipient: PeerId,
    pub service: ServiceId,
    pub nonce: Option<u64>,
    pub kind: EnvelopeKind,
    pub payload: Vec<u8>,
}

impl MessageEnvelope {
    pub fn one_way(sender: PeerId, recipient: PeerId, service: ServiceId, payload: Vec<u8>) -> Self {
        Self {
            sender,
            recipient,
            service,
            nonce: None,
            kind: EnvelopeKind::OneWay,
            payload,
        }
    }

    pub fn request(
        sender: PeerId,
        recipient: PeerId,
        service: ServiceId,
        nonce: u64,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            sender,
            recipient,
            service,
            nonce: Some(nonce),
            kind: EnvelopeKind::Request,
            payload,
        }
    }

    /// Build the reply to this envelope: same service and nonce, endpoints swapped.
    pub fn reply(&self, payload: Vec<u8>) -> Self {
        Self {
            sender: self.recipient,
            recipient: self.sender,
            service: self.service,
            nonce: self.nonce,
            kind: EnvelopeKind::Reply,
            payload,
        }
    }

    #[inline]
    pub fn is_reply(&self) -> bool {
        self.kind == EnvelopeKind::Reply
    }

    #[inline]
    pub fn expects_reply(&self) -> bool {
        self.kind == EnvelopeKind::Request && self.nonce.is_some()
    }
}

// ============================================================================
// Handshake Frames
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub identity: PublicIdentity,
    /// Where the sender accepts connections, if it listens at all.
    pub listen_addr: Option<String>,
    pub challenge: [u8; 32],
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    pub signature: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    Hello(Hello),
    Proof(Proof),
    Envelope(MessageEnvelope),
}

impl Frame {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        deserialize_bounded(bytes)
    }
}

// ============================================================================
// Opcode Registry
// ============================================================================

/// A message type with a fixed opcode.
pub trait WireMessage: Serialize + DeserializeOwned + Send + 'static {
    const OPCODE: Opcode;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpcodeFrame {
    pub opcode: Opcode,
    pub body: Vec<u8>,
}

impl OpcodeFrame {
    pub fn encode<M: WireMessage>(message: &M) -> Result<Vec<u8>, bincode::Error> {
        serialize(&OpcodeFrame {
            opcode: M::OPCODE,
            body: serialize(message)?,
        })
    }
}

type Decoder<T> = Box<dyn Fn(&[u8]) -> Result<T, bincode::Error> + Send + Sync>;

/// Maps opcodes to decoders producing a common message type `T`.
pub struct OpcodeRegistry<T> {
    decoders: HashMap<Opcode, Decoder<T>>,
}

impl<T: 'static> OpcodeRegistry<T> {
    pub fn new() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Register `M` under its opcode, mapping decoded values through `wrap`.
    pub fn register<M: WireMessage>(&mut self, wrap: fn(M) -> T) -> Result<(), DispatchError> {
        if self.decoders.contains_key(&M::OPCODE) {
            return Err(DispatchError::DuplicateOpcode(M::OPCODE));
        }
        self.decoders.insert(
            M::OPCODE,
            Box::new(move |body| deserialize_bounded::<M>(body).map(wrap)),
        );
        Ok(())
    }

    pub fn contains(&self, opcode: Opcode) -> bool {
        self.decoders.contains_key(&opcode)
    }

    pub fn decode(&self, payload: &[u8]) -> Result<T, DispatchError> {
        let frame: OpcodeFrame = deserialize_bounded(payload)
            .map_err(|e| DispatchError::InvalidPayload(e.to_string()))?;
        let decoder = self
            .decoders
            .get(&frame.opcode)
            .ok_or(DispatchError::UnknownOpcode(frame.opcode))?;
        decoder(&frame.body).map_err(|e| DispatchError::InvalidPayload(e.to_string()))
    }
}

impl<T: 'static> Default for OpcodeRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for OpcodeRegistry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut opcodes: Vec<_> = self.decoders.keys().copied().collect();
        opcodes.sort_unstable();
        f.debug_struct("OpcodeRegistry").field("opcodes", &opcodes).finish()
    }
}
