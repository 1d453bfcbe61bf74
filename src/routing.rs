//! # XOR Routing Table
//!
//! Kademlia-style routing state: 256 buckets keyed by the position of the
//! highest differing bit between the local id and a peer's id.
//!
//! ```text
//! bucket_index(local, peer) = bit_length(local XOR peer) - 1     (LSB = 0)
//! ```
//!
//! Bucket 255 holds the half of the id space furthest from us; bucket 0
//! holds the single id that differs only in the last bit.
//!
//! ## Bucket Policy
//!
//! Each bucket keeps at most `k` entries ordered most-recently-seen first.
//! When a new peer maps to a full bucket the least-recently-seen entry is
//! probed:
//!
//! | Probe | Effect |
//! |-------|--------|
//! | alive | oldest moves to the front, newcomer dropped |
//! | dead  | oldest evicted, newcomer admitted |
//!
//! Long-lived peers are never displaced by a flood of fresh ids.
//!
//! A known peer's address only moves on a [`RecordSource::Handshake`];
//! records relayed by other peers refresh recency and nothing else.
//!
//! ## Concurrency
//!
//! [`RoutingTable`] is plain data. [`Routing`] is a cloneable handle to a
//! task that owns the table and serves commands over a channel; the probe
//! for a full bucket runs outside that task so slow peers never block
//! routing queries.

use std::collections::{BinaryHeap, VecDeque};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::identity::{PeerId, distance_cmp};
use crate::protocols::LivenessProbe;

/// Default bucket capacity.
pub const DEFAULT_K: usize = 20;

/// Number of buckets, one per bit of the id.
pub const NUM_BUCKETS: usize = 256;

/// A peer as the routing table knows it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerRecord {
    pub id: PeerId,
    /// The peer's listen address, `host:port`.
    pub address: String,
}

impl PeerRecord {
    pub fn new(id: PeerId, address: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
        }
    }
}

/// Where a record was learned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordSource {
    /// Verified by our own handshake with the peer.
    Handshake,
    /// Relayed by another peer in a lookup response.
    Discovery,
}

#[derive(Clone, Debug)]
struct BucketEntry {
    record: PeerRecord,
    last_seen: Instant,
}

#[derive(Debug, Clone)]
struct RoutingBucket {
    /// Most-recently-seen first.
    entries: VecDeque<BucketEntry>,
    last_refresh: Instant,
}

impl RoutingBucket {
    fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            last_refresh: Instant::now(),
        }
    }

    fn mark_refreshed(&mut self) {
        self.last_refresh = Instant::now();
    }

    fn is_stale(&self, threshold: Duration) -> bool {
        self.last_refresh.elapsed() > threshold
    }

    fn position(&self, id: &PeerId) -> Option<usize> {
        self.entries.iter().position(|e| &e.record.id == id)
    }

    fn touch(&mut self, record: PeerRecord, source: RecordSource, k: usize) -> BucketTouch {
        if let Some(pos) = self.position(&record.id) {
            if let Some(mut entry) = self.entries.remove(pos) {
                if source == RecordSource::Handshake {
                    entry.record.address = record.address;
                }
                entry.last_seen = Instant::now();
                self.entries.push_front(entry);
            }
            self.mark_refreshed();
            return BucketTouch::Refreshed;
        }

        if self.entries.len() < k {
            self.entries.push_front(BucketEntry {
                record,
                last_seen: Instant::now(),
            });
            self.mark_refreshed();
            return BucketTouch::Inserted;
        }

        match self.entries.back() {
            Some(oldest) => BucketTouch::Full {
                oldest: oldest.record.clone(),
                newcomer: record,
            },
            // k == 0: nothing can ever be stored.
            None => BucketTouch::Rejected,
        }
    }

    fn refresh(&mut self, id: &PeerId) -> bool {
        match self.position(id).and_then(|pos| self.entries.remove(pos)) {
            Some(mut entry) => {
                entry.last_seen = Instant::now();
                self.entries.push_front(entry);
                true
            }
            None => false,
        }
    }

    fn remove(&mut self, id: &PeerId) -> Option<PeerRecord> {
        self.position(id)
            .and_then(|pos| self.entries.remove(pos))
            .map(|e| e.record)
    }
}

enum BucketTouch {
    Inserted,
    Refreshed,
    Full { oldest: PeerRecord, newcomer: PeerRecord },
    Rejected,
}

/// Outcome of [`RoutingTable::touch`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TouchOutcome {
    Inserted,
    Refreshed,
    /// Bucket is full; probe `pending.oldest` and report back.
    Full(PendingInsert),
    /// The local id, or a table with `k == 0`.
    Ignored,
}

/// A newcomer waiting on the liveness of the oldest entry in its bucket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingInsert {
    pub bucket: usize,
    pub oldest: PeerRecord,
    pub newcomer: PeerRecord,
}

/// Final outcome of an insert-or-refresh.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Refreshed,
    /// The probed entry was dead and has been replaced by the newcomer.
    Replaced { evicted: PeerRecord },
    /// The newcomer was not admitted.
    Dropped,
}

/// Index of the bucket `other` falls into, or `None` for `local` itself.
pub fn bucket_index(local: &PeerId, other: &PeerId) -> Option<usize> {
    let dist = local.xor_distance(other);
    for (byte_idx, byte) in dist.iter().enumerate() {
        if *byte != 0 {
            let msb_index = byte_idx * 8 + byte.leading_zeros() as usize;
            return Some(NUM_BUCKETS - 1 - msb_index);
        }
    }
    None
}

/// A random id that lands in `bucket_idx` relative to `local`.
pub fn random_id_for_bucket(local: &PeerId, bucket_idx: usize) -> PeerId {
    let bucket_idx = bucket_idx.min(NUM_BUCKETS - 1);
    let local_bytes = local.as_bytes();

    let mut distance = [0u8; 32];
    if getrandom::getrandom(&mut distance).is_err() {
        distance = rand::random();
    }

    let msb_index = NUM_BUCKETS - 1 - bucket_idx;
    let byte_idx = msb_index / 8;
    let bit_pos = msb_index % 8;

    for byte in distance.iter_mut().take(byte_idx) {
        *byte = 0;
    }

    let target_bit = 0x80u8 >> bit_pos;
    let random_mask = target_bit.wrapping_sub(1);
    distance[byte_idx] = target_bit | (distance[byte_idx] & random_mask);

    let mut target = [0u8; 32];
    for i in 0..32 {
        target[i] = local_bytes[i] ^ distance[i];
    }
    PeerId::from_bytes(target)
}

#[derive(Debug)]
pub struct RoutingTable {
    local_id: PeerId,
    k: usize,
    buckets: Vec<RoutingBucket>,
}

impl RoutingTable {
    pub fn new(local_id: PeerId, k: usize) -> Self {
        let buckets = (0..NUM_BUCKETS).map(|_| RoutingBucket::new()).collect();
        Self {
            local_id,
            k,
            buckets,
        }
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    pub fn k(&self) -> usize {
        self.k
    }

    /// Insert or refresh a handshake-verified `record` without resolving a
    /// full bucket.
    pub fn touch(&mut self, record: PeerRecord) -> TouchOutcome {
        self.touch_from(record, RecordSource::Handshake)
    }

    /// Like [`RoutingTable::touch`], but a [`RecordSource::Discovery`] record
    /// never overwrites the address of a peer already in the table.
    pub fn touch_from(&mut self, record: PeerRecord, source: RecordSource) -> TouchOutcome {
        let Some(idx) = bucket_index(&self.local_id, &record.id) else {
            return TouchOutcome::Ignored;
        };
        match self.buckets[idx].touch(record, source, self.k) {
            BucketTouch::Inserted => TouchOutcome::Inserted,
            BucketTouch::Refreshed => TouchOutcome::Refreshed,
            BucketTouch::Full { oldest, newcomer } => TouchOutcome::Full(PendingInsert {
                bucket: idx,
                oldest,
                newcomer,
            }),
            BucketTouch::Rejected => TouchOutcome::Ignored,
        }
    }

    /// Resolve a full bucket once the oldest entry has been probed.
    pub fn apply_probe_result(&mut self, pending: PendingInsert, oldest_alive: bool) -> InsertOutcome {
        let k = self.k;
        let Some(bucket) = self.buckets.get_mut(pending.bucket) else {
            return InsertOutcome::Dropped;
        };

        if bucket.position(&pending.newcomer.id).is_some() {
            // Admitted by a concurrent insert while we were probing.
            bucket.refresh(&pending.newcomer.id);
            return InsertOutcome::Refreshed;
        }

        if oldest_alive {
            bucket.refresh(&pending.oldest.id);
            return InsertOutcome::Dropped;
        }

        let evicted = bucket.remove(&pending.oldest.id);
        if bucket.entries.len() >= k {
            return InsertOutcome::Dropped;
        }
        bucket.entries.push_front(BucketEntry {
            record: pending.newcomer,
            last_seen: Instant::now(),
        });
        bucket.mark_refreshed();
        match evicted {
            Some(evicted) => InsertOutcome::Replaced { evicted },
            None => InsertOutcome::Inserted,
        }
    }

    /// Move `id` to the front of its bucket.
    pub fn refresh(&mut self, id: &PeerId) -> bool {
        match bucket_index(&self.local_id, id) {
            Some(idx) => self.buckets[idx].refresh(id),
            None => false,
        }
    }

    pub fn remove(&mut self, id: &PeerId) -> Option<PeerRecord> {
        let idx = bucket_index(&self.local_id, id)?;
        self.buckets[idx].remove(id)
    }

    pub fn get(&self, id: &PeerId) -> Option<PeerRecord> {
        let idx = bucket_index(&self.local_id, id)?;
        self.buckets[idx]
            .entries
            .iter()
            .find(|e| &e.record.id == id)
            .map(|e| e.record.clone())
    }

    /// Up to `count` records sorted by non-decreasing XOR distance to `target`.
    pub fn closest(&self, target: &PeerId, count: usize) -> Vec<PeerRecord> {
        if count == 0 {
            return Vec::new();
        }

        #[derive(Eq, PartialEq)]
        struct Candidate {
            dist: [u8; 32],
            last_seen: Instant,
            record: PeerRecord,
        }

        impl Ord for Candidate {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                // Most recently seen wins a distance tie.
                distance_cmp(&self.dist, &other.dist).then(other.last_seen.cmp(&self.last_seen))
            }
        }

        impl PartialOrd for Candidate {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }

        let mut heap: BinaryHeap<Candidate> = BinaryHeap::with_capacity(count + 1);
        for entry in self.buckets.iter().flat_map(|b| b.entries.iter()) {
            let candidate = Candidate {
                dist: entry.record.id.xor_distance(target),
                last_seen: entry.last_seen,
                record: entry.record.clone(),
            };
            if heap.len() < count {
                heap.push(candidate);
            } else if let Some(worst) = heap.peek()
                && candidate < *worst
            {
                heap.push(candidate);
                heap.pop();
            }
        }

        heap.into_sorted_vec().into_iter().map(|c| c.record).collect()
    }

    pub fn all_peers(&self) -> Vec<PeerRecord> {
        self.buckets
            .iter()
            .flat_map(|b| b.entries.iter().map(|e| e.record.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.entries.is_empty())
    }

    /// Non-empty buckets untouched for longer than `threshold`.
    pub fn stale_buckets(&self, threshold: Duration) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, bucket)| !bucket.entries.is_empty() && bucket.is_stale(threshold))
            .map(|(idx, _)| idx)
            .collect()
    }

    pub fn mark_bucket_refreshed(&mut self, bucket_idx: usize) {
        if let Some(bucket) = self.buckets.get_mut(bucket_idx) {
            bucket.mark_refreshed();
        }
    }
}

// ============================================================================
// Routing Actor
// ============================================================================

enum Command {
    Touch(PeerRecord, RecordSource, oneshot::Sender<TouchOutcome>),
    ApplyProbeResult(PendingInsert, bool, oneshot::Sender<InsertOutcome>),
    Refresh(PeerId, oneshot::Sender<bool>),
    Remove(PeerId, oneshot::Sender<Option<PeerRecord>>),
    Lookup(PeerId, oneshot::Sender<Option<PeerRecord>>),
    Closest(PeerId, usize, oneshot::Sender<Vec<PeerRecord>>),
    AllPeers(oneshot::Sender<Vec<PeerRecord>>),
    StaleBuckets(Duration, oneshot::Sender<Vec<usize>>),
    MarkBucketRefreshed(usize),
    Quit,
}

/// Handle to the task owning the [`RoutingTable`].
#[derive(Clone)]
pub struct Routing {
    cmd_tx: mpsc::Sender<Command>,
    local_id: PeerId,
    k: usize,
}

struct RoutingActor {
    table: RoutingTable,
    cmd_rx: mpsc::Receiver<Command>,
}

impl Routing {
    /// Spawn the routing task. Must be called inside a Tokio runtime.
    pub fn spawn(local_id: PeerId, k: usize) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let actor = RoutingActor {
            table: RoutingTable::new(local_id, k),
            cmd_rx,
        };
        tokio::spawn(actor.run());
        Self { cmd_tx, local_id, k }
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    pub fn k(&self) -> usize {
        self.k
    }

    /// Insert a handshake-verified `record` or refresh it if known.
    ///
    /// On a full bucket the least-recently-seen entry is probed through
    /// `probe`; the table is not locked while the probe runs.
    pub async fn insert_or_refresh<P>(&self, record: PeerRecord, probe: &P) -> InsertOutcome
    where
        P: LivenessProbe + ?Sized,
    {
        self.insert_from(record, RecordSource::Handshake, probe).await
    }

    /// Insert a record relayed by another peer. A peer we already know
    /// keeps its address.
    pub async fn insert_learned<P>(&self, record: PeerRecord, probe: &P) -> InsertOutcome
    where
        P: LivenessProbe + ?Sized,
    {
        self.insert_from(record, RecordSource::Discovery, probe).await
    }

    async fn insert_from<P>(&self, record: PeerRecord, source: RecordSource, probe: &P) -> InsertOutcome
    where
        P: LivenessProbe + ?Sized,
    {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Touch(record, source, tx)).await.is_err() {
            return InsertOutcome::Dropped;
        }
        let pending = match rx.await {
            Ok(TouchOutcome::Inserted) => return InsertOutcome::Inserted,
            Ok(TouchOutcome::Refreshed) => return InsertOutcome::Refreshed,
            Ok(TouchOutcome::Ignored) | Err(_) => return InsertOutcome::Dropped,
            Ok(TouchOutcome::Full(pending)) => pending,
        };

        trace!(
            bucket = pending.bucket,
            oldest = %pending.oldest.id.short(),
            newcomer = %pending.newcomer.id.short(),
            "bucket full, probing oldest entry"
        );
        let alive = probe.probe(&pending.oldest).await;

        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::ApplyProbeResult(pending, alive, tx))
            .await
            .is_err()
        {
            return InsertOutcome::Dropped;
        }
        let outcome = rx.await.unwrap_or(InsertOutcome::Dropped);
        if let InsertOutcome::Replaced { evicted } = &outcome {
            debug!(evicted = %evicted.id.short(), "evicted unresponsive peer from routing table");
        }
        outcome
    }

    pub async fn refresh(&self, id: PeerId) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Refresh(id, tx)).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn remove(&self, id: PeerId) -> Option<PeerRecord> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::Remove(id, tx)).await.ok()?;
        rx.await.ok().flatten()
    }

    pub async fn lookup(&self, id: PeerId) -> Option<PeerRecord> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::Lookup(id, tx)).await.ok()?;
        rx.await.ok().flatten()
    }

    pub async fn find_closest(&self, target: PeerId, count: usize) -> Vec<PeerRecord> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Closest(target, count, tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn all_peers(&self) -> Vec<PeerRecord> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::AllPeers(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn stale_buckets(&self, threshold: Duration) -> Vec<usize> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::StaleBuckets(threshold, tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn mark_bucket_refreshed(&self, bucket_idx: usize) {
        let _ = self.cmd_tx.send(Command::MarkBucketRefreshed(bucket_idx)).await;
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

impl RoutingActor {
    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Command::Touch(record, source, reply) => {
                    let _ = reply.send(self.table.touch_from(record, source));
                }
                Command::ApplyProbeResult(pending, alive, reply) => {
                    let _ = reply.send(self.table.apply_probe_result(pending, alive));
                }
                Command::Refresh(id, reply) => {
                    let _ = reply.send(self.table.refresh(&id));
                }
                Command::Remove(id, reply) => {
                    let _ = reply.send(self.table.remove(&id));
                }
                Command::Lookup(id, reply) => {
                    let _ = reply.send(self.table.get(&id));
                }
                Command::Closest(target, count, reply) => {
                    let _ = reply.send(self.table.closest(&target, count));
                }
                Command::AllPeers(reply) => {
                    let _ = reply.send(self.table.all_peers());
                }
                Command::StaleBuckets(threshold, reply) => {
                    let _ = reply.send(self.table.stale_buckets(threshold));
                }
                Command::MarkBucketRefreshed(idx) => {
                    self.table.mark_bucket_refreshed(idx);
                }
                Command::Quit => break,
            }
        }
        trace!(peers = self.table.len(), "routing task stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedProbe {
        alive: bool,
        calls: AtomicUsize,
    }

    impl FixedProbe {
        fn new(alive: bool) -> Self {
            Self {
                alive,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl LivenessProbe for FixedProbe {
        async fn probe(&self, _peer: &PeerRecord) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.alive
        }
    }

    fn local() -> PeerId {
        PeerId::from_bytes([0u8; 32])
    }

    /// Ids in bucket 255 relative to the all-zero local id.
    fn far_peer(n: u8) -> PeerRecord {
        let mut bytes = [0u8; 32];
        bytes[0] = 0x80;
        bytes[31] = n;
        PeerRecord::new(PeerId::from_bytes(bytes), format!("127.0.0.1:{}", 10_000 + n as u16))
    }

    fn random_peer() -> PeerRecord {
        PeerRecord::new(PeerId::from_bytes(rand::random()), "127.0.0.1:1")
    }

    #[test]
    fn bucket_index_uses_highest_differing_bit() {
        let local = local();
        let mut other = [0u8; 32];
        other[31] = 0x01;
        assert_eq!(bucket_index(&local, &PeerId::from_bytes(other)), Some(0));

        other[31] = 0x80;
        assert_eq!(bucket_index(&local, &PeerId::from_bytes(other)), Some(7));

        let mut other = [0u8; 32];
        other[0] = 0x80;
        assert_eq!(bucket_index(&local, &PeerId::from_bytes(other)), Some(255));

        assert_eq!(bucket_index(&local, &local), None);
    }

    #[test]
    fn random_id_for_bucket_lands_in_correct_bucket() {
        let local = PeerId::from_bytes(rand::random());
        for idx in [0usize, 1, 7, 8, 100, 254, 255] {
            let target = random_id_for_bucket(&local, idx);
            assert_eq!(bucket_index(&local, &target), Some(idx));
        }
    }

    #[test]
    fn local_id_never_inserted() {
        let mut table = RoutingTable::new(local(), DEFAULT_K);
        assert_eq!(table.touch(PeerRecord::new(local(), "127.0.0.1:1")), TouchOutcome::Ignored);
        assert!(table.is_empty());
    }

    #[test]
    fn touch_refreshes_and_updates_address() {
        let mut table = RoutingTable::new(local(), DEFAULT_K);
        let peer = far_peer(1);
        assert_eq!(table.touch(peer.clone()), TouchOutcome::Inserted);

        let moved = PeerRecord::new(peer.id, "127.0.0.1:9999");
        assert_eq!(table.touch(moved.clone()), TouchOutcome::Refreshed);
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(&peer.id), Some(moved));
    }

    #[test]
    fn relayed_record_keeps_verified_address() {
        let mut table = RoutingTable::new(local(), DEFAULT_K);
        let peer = far_peer(1);
        table.touch(peer.clone());

        let forged = PeerRecord::new(peer.id, "10.9.9.9:1");
        assert_eq!(table.touch_from(forged, RecordSource::Discovery), TouchOutcome::Refreshed);
        assert_eq!(table.get(&peer.id), Some(peer));

        let fresh = far_peer(2);
        assert_eq!(table.touch_from(fresh.clone(), RecordSource::Discovery), TouchOutcome::Inserted);
        assert_eq!(table.get(&fresh.id), Some(fresh));
    }

    #[test]
    fn closest_is_sorted_and_bounded() {
        let target = PeerId::from_bytes(rand::random());
        let mut table = RoutingTable::new(PeerId::from_bytes(rand::random()), DEFAULT_K);
        for _ in 0..60 {
            table.touch(random_peer());
        }
        let n = table.len();

        for count in [0usize, 1, 5, n, n + 10] {
            let closest = table.closest(&target, count);
            assert_eq!(closest.len(), count.min(n));
            for pair in closest.windows(2) {
                let a = pair[0].id.xor_distance(&target);
                let b = pair[1].id.xor_distance(&target);
                assert_ne!(distance_cmp(&a, &b), std::cmp::Ordering::Greater);
            }
        }

        // The nearest record overall is first.
        let all = table.all_peers();
        let nearest = all
            .iter()
            .min_by(|a, b| distance_cmp(&a.id.xor_distance(&target), &b.id.xor_distance(&target)))
            .unwrap();
        assert_eq!(&table.closest(&target, 1)[0], nearest);
    }

    #[test]
    fn full_bucket_reports_oldest() {
        let mut table = RoutingTable::new(local(), 3);
        for n in 1..=3 {
            assert_eq!(table.touch(far_peer(n)), TouchOutcome::Inserted);
        }
        match table.touch(far_peer(4)) {
            TouchOutcome::Full(pending) => {
                assert_eq!(pending.bucket, 255);
                assert_eq!(pending.oldest, far_peer(1));
                assert_eq!(pending.newcomer, far_peer(4));
            }
            other => panic!("expected full bucket, got {other:?}"),
        }
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn alive_oldest_keeps_slot() {
        let mut table = RoutingTable::new(local(), 2);
        table.touch(far_peer(1));
        table.touch(far_peer(2));
        let TouchOutcome::Full(pending) = table.touch(far_peer(3)) else {
            panic!("expected full bucket");
        };

        assert_eq!(table.apply_probe_result(pending, true), InsertOutcome::Dropped);
        assert!(table.get(&far_peer(3).id).is_none());

        // Peer 1 was moved to the front, so peer 2 is now the oldest.
        let TouchOutcome::Full(pending) = table.touch(far_peer(3)) else {
            panic!("expected full bucket");
        };
        assert_eq!(pending.oldest, far_peer(2));
    }

    #[test]
    fn dead_oldest_is_replaced() {
        let mut table = RoutingTable::new(local(), 2);
        table.touch(far_peer(1));
        table.touch(far_peer(2));
        let TouchOutcome::Full(pending) = table.touch(far_peer(3)) else {
            panic!("expected full bucket");
        };

        assert_eq!(
            table.apply_probe_result(pending, false),
            InsertOutcome::Replaced { evicted: far_peer(1) }
        );
        assert!(table.get(&far_peer(1).id).is_none());
        assert!(table.get(&far_peer(3).id).is_some());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn stale_buckets_only_lists_populated_ones() {
        let mut table = RoutingTable::new(local(), DEFAULT_K);
        table.touch(far_peer(1));
        assert_eq!(table.stale_buckets(Duration::ZERO), vec![255]);
        assert!(table.stale_buckets(Duration::from_secs(3600)).is_empty());
        table.mark_bucket_refreshed(255);
        table.mark_bucket_refreshed(9999);
    }

    #[tokio::test]
    async fn actor_probes_only_on_full_bucket() {
        let routing = Routing::spawn(local(), 2);
        let probe = FixedProbe::new(true);

        assert_eq!(routing.insert_or_refresh(far_peer(1), &probe).await, InsertOutcome::Inserted);
        assert_eq!(routing.insert_or_refresh(far_peer(2), &probe).await, InsertOutcome::Inserted);
        assert_eq!(routing.insert_or_refresh(far_peer(1), &probe).await, InsertOutcome::Refreshed);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);

        assert_eq!(routing.insert_or_refresh(far_peer(3), &probe).await, InsertOutcome::Dropped);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
        assert_eq!(routing.all_peers().await.len(), 2);
    }

    #[tokio::test]
    async fn actor_learned_insert_does_not_move_known_peer() {
        let routing = Routing::spawn(local(), DEFAULT_K);
        let probe = FixedProbe::new(true);
        routing.insert_or_refresh(far_peer(1), &probe).await;

        let forged = PeerRecord::new(far_peer(1).id, "10.9.9.9:1");
        assert_eq!(routing.insert_learned(forged, &probe).await, InsertOutcome::Refreshed);
        assert_eq!(routing.lookup(far_peer(1).id).await, Some(far_peer(1)));
        assert_eq!(routing.find_closest(far_peer(1).id, 1).await, vec![far_peer(1)]);
    }

    #[tokio::test]
    async fn actor_evicts_dead_peer() {
        let routing = Routing::spawn(local(), 1);
        let probe = FixedProbe::new(false);

        routing.insert_or_refresh(far_peer(1), &probe).await;
        let outcome = routing.insert_or_refresh(far_peer(2), &probe).await;
        assert_eq!(outcome, InsertOutcome::Replaced { evicted: far_peer(1) });
        assert_eq!(routing.lookup(far_peer(2).id).await, Some(far_peer(2)));
        assert_eq!(routing.lookup(far_peer(1).id).await, None);

        assert_eq!(routing.remove(far_peer(2).id).await, Some(far_peer(2)));
        assert!(routing.all_peers().await.is_empty());
    }

    #[tokio::test]
    async fn actor_closest_matches_table() {
        let routing = Routing::spawn(local(), DEFAULT_K);
        let probe = FixedProbe::new(true);
        for n in 1..=10 {
            routing.insert_or_refresh(far_peer(n), &probe).await;
        }
        let target = far_peer(4).id;
        let closest = routing.find_closest(target, 3).await;
        assert_eq!(closest.len(), 3);
        assert_eq!(closest[0], far_peer(4));

        routing.quit().await;
        tokio::task::yield_now().await;
    }
}
