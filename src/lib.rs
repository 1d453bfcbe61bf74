//! # skadnode - S/Kademlia Peer-to-Peer Node Runtime
//!
//! skadnode runs one peer of a Kademlia-style overlay:
//!
//! - **Identity**: Ed25519 keys whose peer id must pass a two-stage
//!   S/Kademlia puzzle (static leading-zero check plus a dynamic nonce search)
//! - **Routing**: 256 XOR-distance buckets of capacity k behind an actor
//! - **Transport**: length-prefixed frames over TCP, one reader, writer and
//!   dispatch task per connection
//! - **Handshake**: pluggable; the puzzle handshake proves key possession and
//!   checks the remote identity against the network's puzzle parameters
//! - **Services**: handlers keyed by service id, with request/reply
//!   correlation by nonce
//! - **Discovery**: ping/pong and iterative lookup on a reserved service id
//!
//! ## Architecture
//!
//! Shared state lives either behind an actor (the routing table) or behind a
//! short critical section (pending requests, address book). Handles are
//! cheap to clone; [`Node`] is one.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | Runtime tying everything together |
//! | `identity` | Keypairs, peer ids, puzzle generation and verification |
//! | `crypto` | Domain-separated hashing, puzzle predicates, signatures |
//! | `routing` | XOR routing table and its actor handle |
//! | `transport` | Framing, connections, the connection adapter |
//! | `handshake` | Handshake trait plus no-op and puzzle implementations |
//! | `rpc` | Pending-request registry and request contexts |
//! | `discovery` | Discovery service and lookup client |
//! | `protocols` | Trait seams (`Service`, `LivenessProbe`) |
//! | `messages` | Wire types and the opcode registry |
//! | `config` | `NodeConfig` |
//! | `error` | Error enums |

mod config;
mod crypto;
mod discovery;
mod error;
mod handshake;
mod identity;
mod messages;
mod node;
mod protocols;
mod routing;
mod rpc;
mod transport;

pub use config::{DEFAULT_ALPHA, NodeConfig};
pub use discovery::{
    DISCOVERY_SERVICE_ID, DiscoveryMessage, LookupRequest, LookupResponse, MAX_PEERS_PER_RESPONSE,
    Ping, Pong, RESERVED_SERVICE_IDS, is_reserved,
};
pub use error::{DispatchError, HandshakeError, IdentityError, NodeError, TransportError};
pub use handshake::{
    HandshakeKind, HandshakeProcessor, HandshakeState, NoOpHandshake, PuzzleHandshake, Verified,
};
pub use identity::{
    DEFAULT_DYNAMIC_DIFFICULTY, DEFAULT_STATIC_DIFFICULTY, Identity, Keypair, PeerId, PublicIdentity,
    PuzzleParams, verify,
};
pub use messages::{
    EnvelopeKind, MAX_PAYLOAD_SIZE, MessageEnvelope, Opcode, OpcodeFrame, OpcodeRegistry, ServiceId,
    WireMessage,
};
pub use node::Node;
pub use protocols::{LivenessProbe, Service};
pub use routing::{DEFAULT_K, InsertOutcome, PeerRecord, RecordSource, bucket_index};
pub use rpc::{DEFAULT_REQUEST_TIMEOUT, RequestContext};
pub use transport::{ConnectionState, Dialer, Direction, RawConnection, TcpDialer};
