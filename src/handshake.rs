//! # Handshake Processors
//!
//! Every new connection runs exactly one handshake before any envelope is
//! read or written. The processor is chosen at construction time through
//! [`HandshakeKind`] and shared by all connections of a node.
//!
//! ## Puzzle Handshake
//!
//! Symmetric; both sides run the same four steps:
//!
//! ```text
//! A                                   B
//! ├── Hello{identity, addr, cA} ─────►│
//! │◄──── Hello{identity, addr, cB} ───┤
//! │  verify B's puzzle                │  verify A's puzzle
//! ├── Proof{sig_A(cB || id_A)} ──────►│
//! │◄──── Proof{sig_B(cA || id_B)} ────┤
//! │  verify sig_B                     │  verify sig_A
//! ```
//!
//! The puzzle check proves the remote identity was expensive to mint; the
//! signature over our fresh challenge proves the remote holds its key.
//!
//! ## States
//!
//! `AwaitingLocalSend → AwaitingRemoteResponse → Verified | Failed`

use std::sync::Arc;

use async_trait::async_trait;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::crypto::{HANDSHAKE_SIGNATURE_DOMAIN, sign_with_domain, verify_with_domain};
use crate::error::HandshakeError;
use crate::identity::{Identity, PeerId, PublicIdentity, PuzzleParams};
use crate::messages::{Frame, Hello, Proof};
use crate::transport::RawConnection;

/// Which processor a node runs on its connections.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeKind {
    NoOp,
    #[default]
    Puzzle,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeState {
    AwaitingLocalSend,
    AwaitingRemoteResponse,
    Verified,
    Failed,
}

/// Result of a successful handshake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Verified {
    /// The remote id, if the handshake established one.
    pub peer_id: Option<PeerId>,
    /// The remote's advertised listen address.
    pub listen_addr: Option<String>,
    /// Whether the remote proved its identity cryptographically.
    pub authenticated: bool,
}

#[async_trait]
pub trait HandshakeProcessor: Send + Sync + 'static {
    /// Run the handshake on `conn`. `expected` is set when we dialed a known peer.
    async fn process(
        &self,
        conn: &mut RawConnection,
        expected: Option<PeerId>,
    ) -> Result<Verified, HandshakeError>;
}

/// Accepts every connection without exchanging anything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoOpHandshake;

#[async_trait]
impl HandshakeProcessor for NoOpHandshake {
    async fn process(
        &self,
        conn: &mut RawConnection,
        expected: Option<PeerId>,
    ) -> Result<Verified, HandshakeError> {
        trace!(addr = %conn.remote_addr(), "no-op handshake");
        Ok(Verified {
            peer_id: expected,
            listen_addr: None,
            authenticated: false,
        })
    }
}

/// S/Kademlia puzzle verification plus a signed challenge exchange.
#[derive(Clone)]
pub struct PuzzleHandshake {
    identity: Arc<Identity>,
    params: PuzzleParams,
    listen_addr: Option<String>,
}

impl PuzzleHandshake {
    pub fn new(identity: Arc<Identity>, params: PuzzleParams, listen_addr: Option<String>) -> Self {
        Self {
            identity,
            params,
            listen_addr,
        }
    }

    fn check_remote(
        &self,
        remote: &PublicIdentity,
        expected: Option<PeerId>,
    ) -> Result<(), HandshakeError> {
        if remote.id == self.identity.id() {
            return Err(HandshakeError::SelfConnection);
        }
        if let Some(expected) = expected
            && expected != remote.id
        {
            return Err(HandshakeError::UnexpectedPeer {
                expected,
                actual: remote.id,
            });
        }
        remote.check(&self.params)?;
        Ok(())
    }

    async fn run(
        &self,
        conn: &mut RawConnection,
        expected: Option<PeerId>,
        state: &mut HandshakeState,
    ) -> Result<Verified, HandshakeError> {
        let mut challenge = [0u8; 32];
        OsRng.fill_bytes(&mut challenge);

        conn.send_frame(&Frame::Hello(Hello {
            identity: self.identity.public(),
            listen_addr: self.listen_addr.clone(),
            challenge,
        }))
        .await?;
        *state = HandshakeState::AwaitingRemoteResponse;

        let Frame::Hello(remote) = conn.recv_frame().await? else {
            return Err(HandshakeError::Malformed("expected hello"));
        };
        self.check_remote(&remote.identity, expected)?;

        let signature = sign_with_domain(
            self.identity.keypair(),
            HANDSHAKE_SIGNATURE_DOMAIN,
            &proof_message(&remote.challenge, &self.identity.id()),
        );
        conn.send_frame(&Frame::Proof(Proof { signature })).await?;

        let Frame::Proof(proof) = conn.recv_frame().await? else {
            return Err(HandshakeError::Malformed("expected proof"));
        };
        verify_with_domain(
            &remote.identity.public_key,
            HANDSHAKE_SIGNATURE_DOMAIN,
            &proof_message(&challenge, &remote.identity.id),
            &proof.signature,
        )
        .map_err(|_| HandshakeError::BadSignature)?;

        Ok(Verified {
            peer_id: Some(remote.identity.id),
            listen_addr: remote.listen_addr,
            authenticated: true,
        })
    }
}

#[async_trait]
impl HandshakeProcessor for PuzzleHandshake {
    async fn process(
        &self,
        conn: &mut RawConnection,
        expected: Option<PeerId>,
    ) -> Result<Verified, HandshakeError> {
        let mut state = HandshakeState::AwaitingLocalSend;
        let result = self.run(conn, expected, &mut state).await;
        match &result {
            Ok(verified) => {
                trace!(
                    addr = %conn.remote_addr(),
                    peer = ?verified.peer_id.map(|p| p.short()),
                    from = ?state,
                    to = ?HandshakeState::Verified,
                    "handshake verified"
                );
            }
            Err(e) => {
                debug!(
                    addr = %conn.remote_addr(),
                    from = ?state,
                    to = ?HandshakeState::Failed,
                    error = %e,
                    "handshake failed"
                );
            }
        }
        result
    }
}

impl std::fmt::Debug for PuzzleHandshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PuzzleHandshake")
            .field("id", &self.identity.id())
            .field("params", &self.params)
            .finish()
    }
}

/// `challenge || signer id`, binding the proof to both ends.
fn proof_message(challenge: &[u8; 32], signer: &PeerId) -> [u8; 64] {
    let mut out = [0u8; 64];
    out[..32].copy_from_slice(challenge);
    out[32..].copy_from_slice(signer.as_bytes());
    out
}

pub fn processor_for(
    kind: HandshakeKind,
    identity: Arc<Identity>,
    params: PuzzleParams,
    listen_addr: Option<String>,
) -> Arc<dyn HandshakeProcessor> {
    match kind {
        HandshakeKind::NoOp => Arc::new(NoOpHandshake),
        HandshakeKind::Puzzle => Arc::new(PuzzleHandshake::new(identity, params, listen_addr)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::MessageEnvelope;
    use crate::transport::Direction;

    fn params() -> PuzzleParams {
        PuzzleParams::new(4, 4).unwrap()
    }

    fn identity() -> Arc<Identity> {
        Arc::new(Identity::generate(params()).unwrap())
    }

    fn pipe() -> (RawConnection, RawConnection) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (
            RawConnection::new(Box::new(a), "mem:a", Direction::Outbound),
            RawConnection::new(Box::new(b), "mem:b", Direction::Inbound),
        )
    }

    #[tokio::test]
    async fn puzzle_handshake_authenticates_both_sides() {
        let (alice, bob) = (identity(), identity());
        let a = PuzzleHandshake::new(alice.clone(), params(), Some("127.0.0.1:1000".into()));
        let b = PuzzleHandshake::new(bob.clone(), params(), Some("127.0.0.1:2000".into()));
        let (mut conn_a, mut conn_b) = pipe();

        let (ra, rb) = tokio::join!(
            a.process(&mut conn_a, Some(bob.id())),
            b.process(&mut conn_b, None)
        );
        let (ra, rb) = (ra.unwrap(), rb.unwrap());

        assert_eq!(ra.peer_id, Some(bob.id()));
        assert_eq!(ra.listen_addr.as_deref(), Some("127.0.0.1:2000"));
        assert!(ra.authenticated);
        assert_eq!(rb.peer_id, Some(alice.id()));
        assert_eq!(rb.listen_addr.as_deref(), Some("127.0.0.1:1000"));
    }

    #[tokio::test]
    async fn unexpected_peer_rejected() {
        let (alice, bob) = (identity(), identity());
        let a = PuzzleHandshake::new(alice, params(), None);
        let b = PuzzleHandshake::new(bob.clone(), params(), None);
        let (mut conn_a, mut conn_b) = pipe();

        let someone_else = identity().id();
        let (ra, rb) = tokio::join!(
            async {
                let r = a.process(&mut conn_a, Some(someone_else)).await;
                drop(conn_a);
                r
            },
            b.process(&mut conn_b, None)
        );
        assert!(matches!(ra, Err(HandshakeError::UnexpectedPeer { actual, .. }) if actual == bob.id()));
        assert!(rb.is_err());
    }

    #[tokio::test]
    async fn insufficient_puzzle_rejected() {
        let strict = PuzzleParams::new(24, 24).unwrap();
        let (alice, bob) = (identity(), identity());
        // Alice demands far more work than Bob's identity carries.
        let a = PuzzleHandshake::new(alice, strict, None);
        let b = PuzzleHandshake::new(bob, params(), None);
        let (mut conn_a, mut conn_b) = pipe();

        let (ra, rb) = tokio::join!(
            async {
                let r = a.process(&mut conn_a, None).await;
                drop(conn_a);
                r
            },
            b.process(&mut conn_b, None)
        );
        assert!(matches!(ra, Err(HandshakeError::Identity(_))));
        assert!(rb.is_err());
    }

    #[tokio::test]
    async fn self_connection_rejected() {
        let alice = identity();
        let a1 = PuzzleHandshake::new(alice.clone(), params(), None);
        let a2 = PuzzleHandshake::new(alice, params(), None);
        let (mut conn_a, mut conn_b) = pipe();

        let (r1, r2) = tokio::join!(a1.process(&mut conn_a, None), a2.process(&mut conn_b, None));
        assert!(matches!(r1, Err(HandshakeError::SelfConnection)));
        assert!(matches!(r2, Err(HandshakeError::SelfConnection)));
    }

    #[tokio::test]
    async fn non_hello_first_frame_is_malformed() {
        let a = PuzzleHandshake::new(identity(), params(), None);
        let (mut conn_a, mut conn_b) = pipe();

        let rogue = Frame::Envelope(MessageEnvelope::one_way(
            PeerId::from_bytes([1; 32]),
            PeerId::from_bytes([2; 32]),
            20,
            vec![],
        ));
        conn_b.send_frame(&rogue).await.unwrap();

        assert!(matches!(
            a.process(&mut conn_a, None).await,
            Err(HandshakeError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn forged_proof_rejected() {
        let (alice, mallory) = (identity(), identity());
        let a = PuzzleHandshake::new(alice, params(), None);
        let (mut conn_a, mut conn_m) = pipe();

        let forger = async {
            let Frame::Hello(_) = conn_m.recv_frame().await.unwrap() else {
                panic!("expected hello");
            };
            conn_m
                .send_frame(&Frame::Hello(Hello {
                    identity: mallory.public(),
                    listen_addr: None,
                    challenge: [0; 32],
                }))
                .await
                .unwrap();
            conn_m
                .send_frame(&Frame::Proof(Proof { signature: vec![0u8; 64] }))
                .await
                .unwrap();
            conn_m
        };

        let (ra, _conn_m) = tokio::join!(a.process(&mut conn_a, None), forger);
        assert!(matches!(ra, Err(HandshakeError::BadSignature)));
    }

    #[tokio::test]
    async fn noop_binds_expected_only() {
        let (mut conn, _other) = pipe();
        let expected = PeerId::from_bytes([7; 32]);
        let verified = NoOpHandshake.process(&mut conn, Some(expected)).await.unwrap();
        assert_eq!(verified.peer_id, Some(expected));
        assert!(!verified.authenticated);

        let verified = NoOpHandshake.process(&mut conn, None).await.unwrap();
        assert_eq!(verified.peer_id, None);
    }

    #[test]
    fn kind_selects_processor() {
        assert_eq!(HandshakeKind::default(), HandshakeKind::Puzzle);
        let _noop = processor_for(HandshakeKind::NoOp, identity(), params(), None);
        let _puzzle = processor_for(HandshakeKind::Puzzle, identity(), params(), None);
    }
}
