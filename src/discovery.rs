//! # Discovery Protocol
//!
//! Peer discovery runs as an ordinary service on the reserved id
//! [`DISCOVERY_SERVICE_ID`]. Its payloads are [`OpcodeFrame`]s:
//!
//! | Opcode | Message | Answer |
//! |--------|---------|--------|
//! | 1 | [`Ping`] | [`Pong`] |
//! | 2 | [`Pong`] | refreshes the sender when unsolicited |
//! | 3 | [`LookupRequest`] | [`LookupResponse`] with the closest known peers |
//! | 4 | [`LookupResponse`] | none |
//!
//! The client side lives on [`Node`]: single-peer [`Node::ping`] and
//! [`Node::lookup_peer`], the α-parallel [`Node::iterative_lookup`],
//! [`Node::bootstrap`], and a periodic refresh of stale buckets.

use std::collections::HashSet;
use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

use crate::error::{DispatchError, NodeError};
use crate::identity::{PeerId, distance_cmp};
use crate::messages::{MessageEnvelope, Opcode, OpcodeFrame, OpcodeRegistry, ServiceId, WireMessage};
use crate::node::Node;
use crate::protocols::{LivenessProbe, Service};
use crate::routing::{PeerRecord, Routing, random_id_for_bucket};
use crate::rpc::RequestContext;

pub const DISCOVERY_SERVICE_ID: ServiceId = 5;

/// Service ids kept for the node's own protocols.
pub const RESERVED_SERVICE_IDS: Range<ServiceId> = 0..16;

/// Cap on peers returned in one [`LookupResponse`], whatever the bucket size.
pub const MAX_PEERS_PER_RESPONSE: usize = 32;

/// Wall-clock cap on one iterative lookup.
const LOOKUP_TOTAL_TIMEOUT: Duration = Duration::from_secs(30);

pub fn is_reserved(id: ServiceId) -> bool {
    RESERVED_SERVICE_IDS.contains(&id)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupRequest {
    pub target: PeerId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupResponse {
    pub peers: Vec<PeerRecord>,
}

impl WireMessage for Ping {
    const OPCODE: Opcode = 1;
}

impl WireMessage for Pong {
    const OPCODE: Opcode = 2;
}

impl WireMessage for LookupRequest {
    const OPCODE: Opcode = 3;
}

impl WireMessage for LookupResponse {
    const OPCODE: Opcode = 4;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DiscoveryMessage {
    Ping(Ping),
    Pong(Pong),
    LookupRequest(LookupRequest),
    LookupResponse(LookupResponse),
}

/// Opcode table for discovery payloads.
pub fn codec() -> Result<OpcodeRegistry<DiscoveryMessage>, DispatchError> {
    let mut registry = OpcodeRegistry::new();
    registry.register::<Ping>(DiscoveryMessage::Ping)?;
    registry.register::<Pong>(DiscoveryMessage::Pong)?;
    registry.register::<LookupRequest>(DiscoveryMessage::LookupRequest)?;
    registry.register::<LookupResponse>(DiscoveryMessage::LookupResponse)?;
    Ok(registry)
}

fn encode<M: WireMessage>(message: &M) -> Result<Vec<u8>, DispatchError> {
    OpcodeFrame::encode(message).map_err(|e| DispatchError::Handler(e.to_string()))
}

// ============================================================================
// Server Side
// ============================================================================

/// Answers discovery traffic from the local routing table.
pub struct DiscoveryService {
    routing: Routing,
    codec: Arc<OpcodeRegistry<DiscoveryMessage>>,
    k: usize,
}

impl DiscoveryService {
    pub fn new(routing: Routing, codec: Arc<OpcodeRegistry<DiscoveryMessage>>, k: usize) -> Self {
        Self { routing, codec, k }
    }
}

#[async_trait]
impl Service for DiscoveryService {
    async fn handle(&self, envelope: MessageEnvelope) -> Result<Option<Vec<u8>>, DispatchError> {
        match self.codec.decode(&envelope.payload)? {
            DiscoveryMessage::Ping(_) => encode(&Pong).map(Some),
            DiscoveryMessage::Pong(_) => {
                self.routing.refresh(envelope.sender).await;
                Ok(None)
            }
            DiscoveryMessage::LookupRequest(request) => {
                let limit = self.k.min(MAX_PEERS_PER_RESPONSE);
                let peers: Vec<PeerRecord> = self
                    .routing
                    .find_closest(request.target, limit + 1)
                    .await
                    .into_iter()
                    .filter(|p| p.id != envelope.sender)
                    .take(limit)
                    .collect();
                trace!(
                    from = %envelope.sender.short(),
                    target = %request.target.short(),
                    returned = peers.len(),
                    "answering lookup"
                );
                encode(&LookupResponse { peers }).map(Some)
            }
            DiscoveryMessage::LookupResponse(_) => {
                trace!(from = %envelope.sender.short(), "ignoring unsolicited lookup response");
                Ok(None)
            }
        }
    }
}

// ============================================================================
// Client Side
// ============================================================================

impl Node {
    async fn discovery_request(
        &self,
        ctx: RequestContext,
        peer: PeerId,
        payload: Vec<u8>,
    ) -> Result<DiscoveryMessage, NodeError> {
        let reply = self.request(ctx, peer, DISCOVERY_SERVICE_ID, payload).await?;
        Ok(self.discovery_codec().decode(&reply.payload)?)
    }

    /// Ping `peer`; an answering peer is refreshed in the routing table.
    pub async fn ping(&self, peer: PeerId) -> Result<(), NodeError> {
        let ctx = RequestContext::with_timeout(self.config().probe_timeout());
        match self.discovery_request(ctx, peer, encode(&Ping)?).await? {
            DiscoveryMessage::Pong(_) => {
                self.routing().refresh(peer).await;
                Ok(())
            }
            _ => Err(DispatchError::InvalidPayload("expected pong".into()).into()),
        }
    }

    /// Ask `peer` for the peers it knows closest to `target`.
    ///
    /// Every returned peer is remembered for dialing and offered to the
    /// routing table. Peers already known keep the address their own
    /// handshake announced.
    pub async fn lookup_peer(&self, peer: PeerId, target: PeerId) -> Result<Vec<PeerRecord>, NodeError> {
        let ctx = RequestContext::with_timeout(self.config().lookup_query_timeout());
        let payload = encode(&LookupRequest { target })?;
        let DiscoveryMessage::LookupResponse(response) = self.discovery_request(ctx, peer, payload).await? else {
            return Err(DispatchError::InvalidPayload("expected lookup response".into()).into());
        };

        let local = self.id();
        let peers: Vec<PeerRecord> = response
            .peers
            .into_iter()
            .filter(|p| p.id != local)
            .take(MAX_PEERS_PER_RESPONSE)
            .collect();

        for record in &peers {
            self.add_peer(record.id, record.address.clone());
            let node = self.clone();
            let record = record.clone();
            tokio::spawn(async move {
                node.routing().insert_learned(record, &node).await;
            });
        }
        Ok(peers)
    }

    /// Iterative Kademlia lookup for the `count` peers closest to `target`.
    ///
    /// Each round queries up to α unqueried peers from the shortlist in
    /// parallel. A round that brings no closer peer is followed by one sweep
    /// over every unqueried shortlist entry; if that finds nothing closer
    /// either, the lookup stops. It also stops when nothing is left to query
    /// or after `max_lookup_rounds`.
    pub async fn iterative_lookup(&self, target: PeerId, count: usize) -> Vec<PeerRecord> {
        self.lookup_from(target, count, Vec::new()).await
    }

    /// Iterative lookup whose shortlist also starts with `seeds`.
    async fn lookup_from(&self, target: PeerId, count: usize, seeds: Vec<PeerRecord>) -> Vec<PeerRecord> {
        let config = self.config();
        let k = config.bucket_size.max(count);
        let alpha = config.alpha;
        let max_rounds = config.max_lookup_rounds;
        let local = self.id();
        let started = Instant::now();

        let mut shortlist = self.routing().find_closest(target, k).await;
        let mut seen: HashSet<PeerId> = shortlist.iter().map(|p| p.id).collect();
        for seed in seeds {
            if seed.id != local && seen.insert(seed.id) {
                shortlist.push(seed);
            }
        }
        sort_by_distance(&mut shortlist, &target);

        let mut queried: HashSet<PeerId> = HashSet::new();
        let mut best_distance = shortlist
            .first()
            .map(|p| p.id.xor_distance(&target))
            .unwrap_or([0xff; 32]);
        let mut stalled = false;
        let mut round = 0;

        loop {
            round += 1;
            if round > max_rounds {
                warn!(
                    target = %target.short(),
                    rounds = max_rounds,
                    "iterative lookup hit round limit"
                );
                break;
            }
            if started.elapsed() > LOOKUP_TOTAL_TIMEOUT {
                debug!(
                    target = %target.short(),
                    elapsed_ms = started.elapsed().as_millis(),
                    found = shortlist.len(),
                    "iterative lookup timeout, returning current results"
                );
                break;
            }

            let width = if stalled { k } else { alpha };
            let candidates: Vec<PeerRecord> = shortlist
                .iter()
                .filter(|p| !queried.contains(&p.id) && p.id != local)
                .take(width)
                .cloned()
                .collect();
            if candidates.is_empty() {
                break;
            }

            let mut join_set = JoinSet::new();
            for candidate in candidates {
                queried.insert(candidate.id);
                let node = self.clone();
                join_set.spawn(async move {
                    let result = node.lookup_peer(candidate.id, target).await;
                    (candidate, result)
                });
            }

            let mut failed: HashSet<PeerId> = HashSet::new();
            while let Some(joined) = join_set.join_next().await {
                let Ok((candidate, result)) = joined else {
                    continue;
                };
                match result {
                    Ok(peers) => {
                        for record in peers {
                            if record.id != local && seen.insert(record.id) {
                                shortlist.push(record);
                            }
                        }
                    }
                    Err(e) => {
                        if e.is_request_local() {
                            trace!(peer = %candidate.id.short(), error = %e, "lookup query timed out");
                        } else {
                            debug!(peer = %candidate.id.short(), error = %e, "lookup query failed");
                        }
                        failed.insert(candidate.id);
                    }
                }
            }

            shortlist.retain(|p| !failed.contains(&p.id));
            sort_by_distance(&mut shortlist, &target);
            shortlist.truncate(k);

            let mut any_closer = false;
            if let Some(first) = shortlist.first() {
                let new_best = first.id.xor_distance(&target);
                if distance_cmp(&new_best, &best_distance) == std::cmp::Ordering::Less {
                    best_distance = new_best;
                    any_closer = true;
                }
            }
            if any_closer {
                stalled = false;
            } else if stalled {
                break;
            } else {
                stalled = true;
            }
        }

        shortlist.truncate(count);
        debug!(
            target = %target.short(),
            found = shortlist.len(),
            queried = queried.len(),
            rounds = round,
            "iterative lookup completed"
        );
        shortlist
    }

    /// Connect to each of `addrs`, then look up our own id to fill the table.
    ///
    /// Returns the number of bootstrap peers reached. Fails only when every
    /// address fails.
    pub async fn bootstrap(&self, addrs: &[String]) -> Result<usize, NodeError> {
        let mut seeds = Vec::new();
        let mut last_error = None;
        for addr in addrs {
            match self.connect(addr).await {
                Ok(peer) => {
                    info!(addr = %addr, peer = %peer.short(), "connected to bootstrap peer");
                    seeds.push(PeerRecord::new(peer, addr.clone()));
                }
                Err(e) => {
                    warn!(addr = %addr, error = %e, "bootstrap peer unreachable");
                    last_error = Some(e);
                }
            }
        }
        let connected = seeds.len();
        if connected == 0
            && let Some(e) = last_error
        {
            return Err(e);
        }

        // Seeded explicitly: routing inserts from the handshakes may still be in flight.
        let found = self.lookup_from(self.id(), self.config().bucket_size, seeds).await;
        info!(connected, found = found.len(), "bootstrap complete");
        Ok(connected)
    }

    pub(crate) fn spawn_bucket_refresh(&self, every: Duration) {
        let node = self.clone();
        let shutdown = self.shutdown_token().clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }

                let stale = node
                    .routing()
                    .stale_buckets(node.config().bucket_stale_threshold())
                    .await;
                if stale.is_empty() {
                    continue;
                }
                debug!(count = stale.len(), "refreshing stale routing buckets");

                for bucket_idx in stale {
                    if shutdown.is_cancelled() {
                        return;
                    }
                    let target = random_id_for_bucket(&node.id(), bucket_idx);
                    let found = node.iterative_lookup(target, node.config().bucket_size).await;
                    trace!(bucket = bucket_idx, found = found.len(), "bucket refreshed");
                    node.routing().mark_bucket_refreshed(bucket_idx).await;
                }
            }
        });
    }
}

fn sort_by_distance(peers: &mut [PeerRecord], target: &PeerId) {
    peers.sort_by(|a, b| distance_cmp(&a.id.xor_distance(target), &b.id.xor_distance(target)));
}

#[async_trait]
impl LivenessProbe for Node {
    async fn probe(&self, peer: &PeerRecord) -> bool {
        self.add_peer(peer.id, peer.address.clone());
        match self.ping(peer.id).await {
            Ok(()) => true,
            Err(e) => {
                trace!(peer = %peer.id.short(), error = %e, "liveness probe failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(byte: u8) -> PeerId {
        PeerId::from_bytes([byte; 32])
    }

    fn request_from(sender: PeerId, payload: Vec<u8>) -> MessageEnvelope {
        MessageEnvelope::request(sender, peer(0), DISCOVERY_SERVICE_ID, 1, payload)
    }

    fn service(local: PeerId) -> (DiscoveryService, Routing) {
        let routing = Routing::spawn(local, 20);
        let codec = Arc::new(codec().unwrap());
        (DiscoveryService::new(routing.clone(), codec, 20), routing)
    }

    struct AlwaysAlive;

    #[async_trait]
    impl LivenessProbe for AlwaysAlive {
        async fn probe(&self, _peer: &PeerRecord) -> bool {
            true
        }
    }

    #[test]
    fn reserved_range() {
        assert!(is_reserved(DISCOVERY_SERVICE_ID));
        assert!(is_reserved(0));
        assert!(is_reserved(15));
        assert!(!is_reserved(16));
        assert!(!is_reserved(1000));
    }

    #[test]
    fn opcodes_match_wire_values() {
        let codec = codec().unwrap();
        for opcode in 1..=4 {
            assert!(codec.contains(opcode));
        }
        let bytes = OpcodeFrame::encode(&LookupRequest { target: peer(7) }).unwrap();
        assert_eq!(
            codec.decode(&bytes).unwrap(),
            DiscoveryMessage::LookupRequest(LookupRequest { target: peer(7) })
        );
    }

    #[tokio::test]
    async fn ping_answered_with_pong() {
        let (service, _routing) = service(peer(0));
        let reply = service
            .handle(request_from(peer(1), encode(&Ping).unwrap()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(codec().unwrap().decode(&reply).unwrap(), DiscoveryMessage::Pong(Pong));
    }

    #[tokio::test]
    async fn lookup_excludes_requester() {
        let (service, routing) = service(peer(0));
        for byte in 1..=5 {
            routing
                .insert_or_refresh(PeerRecord::new(peer(byte), format!("10.0.0.{byte}:4000")), &AlwaysAlive)
                .await;
        }

        let payload = encode(&LookupRequest { target: peer(2) }).unwrap();
        let reply = service.handle(request_from(peer(2), payload)).await.unwrap().unwrap();
        let DiscoveryMessage::LookupResponse(response) = codec().unwrap().decode(&reply).unwrap() else {
            panic!("expected lookup response");
        };
        assert_eq!(response.peers.len(), 4);
        assert!(response.peers.iter().all(|p| p.id != peer(2)));
        // Closest to the target first.
        assert_eq!(response.peers[0].id, peer(3));
    }

    #[tokio::test]
    async fn garbage_payload_rejected() {
        let (service, _routing) = service(peer(0));
        let result = service.handle(request_from(peer(1), vec![0xde, 0xad])).await;
        assert!(matches!(result, Err(DispatchError::InvalidPayload(_))));
    }
}
