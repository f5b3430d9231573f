//! # Routing table
//!
//! A k-bucket tree over 256-bit routing keys. Leaves hold up to `k` contacts
//! ordered oldest to newest; a full leaf splits into two children when it
//! lies on the local node's identifier path or hangs within `k` levels of
//! the deepest local bucket, and otherwise arbitrates the insertion by
//! pinging the oldest resident.
//!
//! ## Eviction arbitration
//!
//! Long-lived peers are favored: a full, unsplittable bucket never evicts a
//! resident that still answers a ping. Arbitration jobs run on the
//! [`PingQueue`], a bounded single-worker FIFO, so at most one probe is in
//! flight at a time and concurrent insertions contending for the same bucket
//! coalesce onto one probe (keyed by the oldest resident under test).
//!
//! The queue pings through an injected [`Prober`] so tests can substitute a
//! stub; production uses the stream-open probe in [`crate::network`].

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::error::DhtError;
use crate::keys::{distance_cmp, PeerId, RoutingKey};

/// Contacts per bucket.
pub const DEFAULT_K: usize = 20;

/// How long an arbitration probe may take before the oldest peer is
/// considered dead.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(10);

/// Pending arbitration jobs the queue will hold before shedding new ones.
const PING_QUEUE_DEPTH: usize = 64;

/// Hard ceiling on tree depth. Routing keys are hashes, so collisions this
/// deep do not occur in practice.
const MAX_DEPTH: usize = 255;

/// Capacity of the table event channel.
const EVENT_CHANNEL_SIZE: usize = 256;

// ============================================================================
// Entries and buckets
// ============================================================================

/// A routing-table resident.
#[derive(Clone, Debug)]
struct Entry {
    peer: PeerId,
    key: RoutingKey,
    /// Updated whenever the peer answers anything.
    last_seen: Instant,
}

/// Leaf bucket: residents oldest first, newest last.
#[derive(Debug)]
struct Bucket {
    entries: Vec<Entry>,
    last_refreshed: Instant,
}

impl Bucket {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            last_refreshed: Instant::now(),
        }
    }

    fn position(&self, peer: &PeerId) -> Option<usize> {
        self.entries.iter().position(|e| &e.peer == peer)
    }

    /// Move a resident to the newest slot and stamp its liveness.
    fn refresh(&mut self, peer: &PeerId) -> bool {
        if let Some(pos) = self.position(peer) {
            let mut entry = self.entries.remove(pos);
            entry.last_seen = Instant::now();
            self.entries.push(entry);
            true
        } else {
            false
        }
    }

    fn remove(&mut self, peer: &PeerId) -> bool {
        if let Some(pos) = self.position(peer) {
            self.entries.remove(pos);
            true
        } else {
            false
        }
    }
}

enum Node {
    Leaf(Bucket),
    Branch(Box<Branch>),
}

/// Children split on the next bit: `zero` for a clear bit, `one` for set.
struct Branch {
    zero: Node,
    one: Node,
}

// ============================================================================
// Events
// ============================================================================

/// Emitted on membership changes for subscribers (refresh loop, hosts).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableEvent {
    PeerAdded(PeerId),
    PeerRemoved(PeerId),
}

/// Outcome of an insertion attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddOutcome {
    /// New resident.
    Added,
    /// Already present; moved to newest.
    Refreshed,
    /// Bucket full and unsplittable; `oldest` must be arbitrated against the
    /// new peer.
    Full { oldest: PeerId },
    /// The local node never inserts itself.
    SelfEntry,
}

/// Descriptor of one leaf bucket, for refresh scheduling and telemetry.
#[derive(Clone, Debug)]
pub struct BucketInfo {
    /// Bits of prefix this bucket covers.
    pub depth: usize,
    /// A key inside the bucket's range (the prefix padded with zeros).
    pub prefix: RoutingKey,
    pub len: usize,
    pub last_refreshed: Instant,
}

// ============================================================================
// The table
// ============================================================================

/// The k-bucket tree. Exclusively owns its buckets; all mutation goes
/// through these methods, which callers serialize behind a single lock.
pub struct RoutingTable {
    local_key: RoutingKey,
    k: usize,
    root: Node,
    /// Depth of the leaf whose range contains the local key.
    local_depth: usize,
    size: usize,
    events: broadcast::Sender<TableEvent>,
}

impl RoutingTable {
    pub fn new(local_key: RoutingKey, k: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Self {
            local_key,
            k,
            root: Node::Leaf(Bucket::new()),
            local_depth: 0,
            size: 0,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TableEvent> {
        self.events.subscribe()
    }

    /// Total resident count.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        let bucket = leaf(&self.root, &peer.routing_key());
        bucket.position(peer).is_some()
    }

    /// Insert or refresh a contact. On [`AddOutcome::Full`] the caller is
    /// expected to run ping arbitration for the returned oldest resident.
    pub fn add(&mut self, peer: PeerId) -> AddOutcome {
        let key = peer.routing_key();
        if key == self.local_key {
            return AddOutcome::SelfEntry;
        }

        loop {
            let local_depth = self.local_depth;
            let k = self.k;
            let local_key = self.local_key;
            let (bucket, depth, on_local_path) = leaf_mut(&mut self.root, &key, &local_key);

            if bucket.refresh(&peer) {
                return AddOutcome::Refreshed;
            }
            if bucket.entries.len() < k {
                bucket.entries.push(Entry {
                    peer,
                    key,
                    last_seen: Instant::now(),
                });
                self.size += 1;
                let _ = self.events.send(TableEvent::PeerAdded(peer));
                trace!(peer = %peer, depth, "routing table added peer");
                return AddOutcome::Added;
            }

            let splittable =
                depth < MAX_DEPTH && (on_local_path || depth + k > local_depth);
            if !splittable {
                let oldest = bucket.entries[0].peer;
                return AddOutcome::Full { oldest };
            }
            self.split_at(&key);
            // Retry in the now-deeper tree.
        }
    }

    /// Remove a contact. Returns whether it was present.
    pub fn remove(&mut self, peer: &PeerId) -> bool {
        let bucket = leaf_mut_for_read(&mut self.root, &peer.routing_key());
        if bucket.remove(peer) {
            self.size -= 1;
            let _ = self.events.send(TableEvent::PeerRemoved(*peer));
            debug!(peer = %peer, "routing table removed peer");
            true
        } else {
            false
        }
    }

    /// Stamp a peer as alive and move it to the newest slot.
    pub fn mark_alive(&mut self, peer: &PeerId) -> bool {
        let bucket = leaf_mut_for_read(&mut self.root, &peer.routing_key());
        bucket.refresh(peer)
    }

    /// Up to `count` residents nearest to `target`, ascending by XOR
    /// distance. The stable sort keeps insertion order on (theoretical) ties.
    pub fn closest_peers(&self, target: &RoutingKey, count: usize) -> Vec<PeerId> {
        if count == 0 {
            return Vec::new();
        }
        let mut all: Vec<(PeerId, RoutingKey)> = Vec::with_capacity(self.size);
        collect_entries(&self.root, &mut all);
        all.sort_by(|a, b| distance_cmp(&a.1.distance(target), &b.1.distance(target)));
        all.truncate(count);
        all.into_iter().map(|(peer, _)| peer).collect()
    }

    /// Resolve a completed arbitration.
    ///
    /// A live oldest resident is refreshed and the newcomer is dropped; a
    /// dead one is evicted and the newcomer takes the slot if it is still
    /// free by the time the probe resolves.
    pub fn apply_arbitration(&mut self, oldest: PeerId, new_peer: PeerId, oldest_alive: bool) {
        if oldest_alive {
            self.mark_alive(&oldest);
            trace!(oldest = %oldest, dropped = %new_peer, "arbitration kept oldest resident");
            return;
        }

        self.remove(&oldest);
        let key = new_peer.routing_key();
        let k = self.k;
        let local_key = self.local_key;
        let (bucket, _, _) = leaf_mut(&mut self.root, &key, &local_key);
        if bucket.position(&new_peer).is_none() && bucket.entries.len() < k {
            bucket.entries.push(Entry {
                peer: new_peer,
                key,
                last_seen: Instant::now(),
            });
            self.size += 1;
            let _ = self.events.send(TableEvent::PeerAdded(new_peer));
            debug!(evicted = %oldest, added = %new_peer, "arbitration evicted dead resident");
        }
    }

    /// All leaf buckets in key order.
    pub fn buckets(&self) -> Vec<BucketInfo> {
        let mut out = Vec::new();
        collect_buckets(&self.root, 0, [0u8; 32], &mut out);
        out
    }

    /// Buckets idle past `threshold`, candidates for a refresh lookup.
    pub fn stale_buckets(&self, threshold: Duration, now: Instant) -> Vec<BucketInfo> {
        self.buckets()
            .into_iter()
            .filter(|b| now.duration_since(b.last_refreshed) > threshold)
            .collect()
    }

    /// Stamp the bucket covering `key` as refreshed now.
    pub fn mark_refreshed(&mut self, key: &RoutingKey) {
        let bucket = leaf_mut_for_read(&mut self.root, key);
        bucket.last_refreshed = Instant::now();
    }

    /// Split the leaf covering `key` into two children on its next bit.
    fn split_at(&mut self, key: &RoutingKey) {
        fn descend(node: &mut Node, key: &RoutingKey, depth: usize) -> usize {
            match node {
                Node::Branch(branch) => {
                    let child = if key.bit(depth) {
                        &mut branch.one
                    } else {
                        &mut branch.zero
                    };
                    descend(child, key, depth + 1)
                }
                Node::Leaf(_) => {
                    let Node::Leaf(bucket) =
                        std::mem::replace(node, Node::Leaf(Bucket::new()))
                    else {
                        unreachable!("descent ends at a leaf");
                    };
                    let mut zero = Bucket::new();
                    let mut one = Bucket::new();
                    zero.last_refreshed = bucket.last_refreshed;
                    one.last_refreshed = bucket.last_refreshed;
                    for entry in bucket.entries {
                        if entry.key.bit(depth) {
                            one.entries.push(entry);
                        } else {
                            zero.entries.push(entry);
                        }
                    }
                    *node = Node::Branch(Box::new(Branch {
                        zero: Node::Leaf(zero),
                        one: Node::Leaf(one),
                    }));
                    depth
                }
            }
        }

        let depth = descend(&mut self.root, key, 0);
        // The local leaf sits one level deeper after a split along its path.
        if self.local_key.common_prefix_len(key) >= depth {
            self.local_depth = depth + 1;
        }
        trace!(depth, "split routing bucket");
    }
}

/// Descend to the leaf covering `key` (read-only).
fn leaf<'a>(node: &'a Node, key: &RoutingKey) -> &'a Bucket {
    let mut node = node;
    let mut depth = 0usize;
    loop {
        match node {
            Node::Leaf(bucket) => return bucket,
            Node::Branch(branch) => {
                node = if key.bit(depth) { &branch.one } else { &branch.zero };
                depth += 1;
            }
        }
    }
}

/// Descend to the leaf covering `key`, tracking depth and whether every
/// branch taken matched the local key's bits.
fn leaf_mut<'a>(
    node: &'a mut Node,
    key: &RoutingKey,
    local_key: &RoutingKey,
) -> (&'a mut Bucket, usize, bool) {
    fn descend<'a>(
        node: &'a mut Node,
        key: &RoutingKey,
        local_key: &RoutingKey,
        depth: usize,
        on_local_path: bool,
    ) -> (&'a mut Bucket, usize, bool) {
        match node {
            Node::Leaf(bucket) => (bucket, depth, on_local_path),
            Node::Branch(branch) => {
                let bit = key.bit(depth);
                let still_local = on_local_path && bit == local_key.bit(depth);
                let child = if bit { &mut branch.one } else { &mut branch.zero };
                descend(child, key, local_key, depth + 1, still_local)
            }
        }
    }
    descend(node, key, local_key, 0, true)
}

fn leaf_mut_for_read<'a>(node: &'a mut Node, key: &RoutingKey) -> &'a mut Bucket {
    fn descend<'a>(node: &'a mut Node, key: &RoutingKey, depth: usize) -> &'a mut Bucket {
        match node {
            Node::Leaf(bucket) => bucket,
            Node::Branch(branch) => {
                let child = if key.bit(depth) { &mut branch.one } else { &mut branch.zero };
                descend(child, key, depth + 1)
            }
        }
    }
    descend(node, key, 0)
}

fn collect_entries(node: &Node, out: &mut Vec<(PeerId, RoutingKey)>) {
    match node {
        Node::Leaf(bucket) => {
            out.extend(bucket.entries.iter().map(|e| (e.peer, e.key)));
        }
        Node::Branch(branch) => {
            collect_entries(&branch.zero, out);
            collect_entries(&branch.one, out);
        }
    }
}

fn collect_buckets(node: &Node, depth: usize, prefix: [u8; 32], out: &mut Vec<BucketInfo>) {
    match node {
        Node::Leaf(bucket) => out.push(BucketInfo {
            depth,
            prefix: RoutingKey::from_bytes(prefix),
            len: bucket.entries.len(),
            last_refreshed: bucket.last_refreshed,
        }),
        Node::Branch(branch) => {
            collect_buckets(&branch.zero, depth + 1, prefix, out);
            let mut one_prefix = prefix;
            one_prefix[depth / 8] |= 0x80u8 >> (depth % 8);
            collect_buckets(&branch.one, depth + 1, one_prefix, out);
        }
    }
}

/// A random key inside a bucket's range: the bucket prefix with random
/// lower bits. Used by the refresh loop so its lookup lands in the bucket it
/// is refreshing.
pub fn random_key_in_bucket(info: &BucketInfo) -> RoutingKey {
    let mut bytes = [0u8; 32];
    if getrandom::getrandom(&mut bytes).is_err() {
        bytes = *info.prefix.as_bytes();
    }
    let prefix = info.prefix.as_bytes();
    let full_bytes = info.depth / 8;
    let rem_bits = info.depth % 8;
    bytes[..full_bytes].copy_from_slice(&prefix[..full_bytes]);
    if rem_bits > 0 {
        let mask = 0xffu8 << (8 - rem_bits);
        bytes[full_bytes] = (prefix[full_bytes] & mask) | (bytes[full_bytes] & !mask);
    }
    RoutingKey::from_bytes(bytes)
}

// ============================================================================
// Ping arbitration queue
// ============================================================================

/// Liveness probe used by arbitration. Production opens a kad protocol
/// stream and closes it; tests inject stubs.
#[async_trait]
pub trait Prober: Send + Sync + 'static {
    async fn ping(&self, peer: &PeerId) -> Result<(), DhtError>;
}

struct ArbitrationJob {
    oldest: PeerId,
    new_peer: PeerId,
}

/// Bounded single-worker FIFO running eviction probes.
#[derive(Clone)]
pub struct PingQueue {
    tx: mpsc::Sender<ArbitrationJob>,
    in_flight: Arc<StdMutex<HashSet<PeerId>>>,
}

impl PingQueue {
    fn start(
        table: Arc<Mutex<RoutingTable>>,
        prober: Arc<dyn Prober>,
        ping_timeout: Duration,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<ArbitrationJob>(PING_QUEUE_DEPTH);
        let in_flight: Arc<StdMutex<HashSet<PeerId>>> = Arc::default();

        let worker_in_flight = in_flight.clone();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let alive = match tokio::time::timeout(ping_timeout, prober.ping(&job.oldest)).await
                {
                    Ok(Ok(())) => true,
                    Ok(Err(e)) => {
                        debug!(peer = %job.oldest, error = %e, "arbitration ping failed");
                        false
                    }
                    Err(_) => {
                        debug!(peer = %job.oldest, "arbitration ping timed out");
                        false
                    }
                };
                let mut table = table.lock().await;
                table.apply_arbitration(job.oldest, job.new_peer, alive);
                worker_in_flight
                    .lock()
                    .expect("ping queue set lock")
                    .remove(&job.oldest);
            }
        });

        Self { tx, in_flight }
    }

    /// Enqueue an arbitration unless one is already in flight for the same
    /// oldest resident (one per bucket: a full bucket's oldest is stable
    /// until its arbitration resolves).
    fn submit(&self, oldest: PeerId, new_peer: PeerId) {
        {
            let mut in_flight = self.in_flight.lock().expect("ping queue set lock");
            if !in_flight.insert(oldest) {
                trace!(oldest = %oldest, "arbitration already pending, coalescing");
                return;
            }
        }
        if let Err(e) = self.tx.try_send(ArbitrationJob { oldest, new_peer }) {
            // Queue saturated: shed the newcomer, which is the same outcome
            // as a live oldest resident.
            warn!(oldest = %oldest, "ping queue full, dropping arbitration: {e}");
            self.in_flight
                .lock()
                .expect("ping queue set lock")
                .remove(&oldest);
        }
    }

    fn is_idle(&self) -> bool {
        self.in_flight.lock().expect("ping queue set lock").is_empty()
    }
}

// ============================================================================
// Shared handle
// ============================================================================

/// Clonable handle coupling the table's lock with its ping queue.
#[derive(Clone)]
pub struct RoutingHandle {
    table: Arc<Mutex<RoutingTable>>,
    queue: PingQueue,
}

impl RoutingHandle {
    pub fn new(
        local_key: RoutingKey,
        k: usize,
        prober: Arc<dyn Prober>,
        ping_timeout: Duration,
    ) -> Self {
        let table = Arc::new(Mutex::new(RoutingTable::new(local_key, k)));
        let queue = PingQueue::start(table.clone(), prober, ping_timeout);
        Self { table, queue }
    }

    /// Insert or refresh; full buckets arbitrate in the background.
    pub async fn add(&self, peer: PeerId) -> AddOutcome {
        let outcome = self.table.lock().await.add(peer);
        if let AddOutcome::Full { oldest } = outcome {
            self.queue.submit(oldest, peer);
        }
        outcome
    }

    pub async fn remove(&self, peer: &PeerId) -> bool {
        self.table.lock().await.remove(peer)
    }

    pub async fn closest_peers(&self, target: &RoutingKey, count: usize) -> Vec<PeerId> {
        self.table.lock().await.closest_peers(target, count)
    }

    pub async fn size(&self) -> usize {
        self.table.lock().await.size()
    }

    pub async fn contains(&self, peer: &PeerId) -> bool {
        self.table.lock().await.contains(peer)
    }

    pub async fn mark_alive(&self, peer: &PeerId) {
        self.table.lock().await.mark_alive(peer);
    }

    pub async fn subscribe(&self) -> broadcast::Receiver<TableEvent> {
        self.table.lock().await.subscribe()
    }

    pub async fn buckets(&self) -> Vec<BucketInfo> {
        self.table.lock().await.buckets()
    }

    pub async fn stale_buckets(&self, threshold: Duration) -> Vec<BucketInfo> {
        self.table
            .lock()
            .await
            .stale_buckets(threshold, Instant::now())
    }

    pub async fn mark_refreshed(&self, key: &RoutingKey) {
        self.table.lock().await.mark_refreshed(key);
    }

    /// Whether no arbitration probe is pending.
    pub fn arbitration_idle(&self) -> bool {
        self.queue.is_idle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn peer(seed: u16) -> PeerId {
        let mut bytes = [0u8; 32];
        bytes[..2].copy_from_slice(&seed.to_be_bytes());
        PeerId::from_bytes(bytes)
    }

    fn local_key() -> RoutingKey {
        RoutingKey::for_bytes(b"the local node")
    }

    struct AliveProber;
    #[async_trait]
    impl Prober for AliveProber {
        async fn ping(&self, _peer: &PeerId) -> Result<(), DhtError> {
            Ok(())
        }
    }

    struct DeadProber;
    #[async_trait]
    impl Prober for DeadProber {
        async fn ping(&self, _peer: &PeerId) -> Result<(), DhtError> {
            Err(DhtError::DialFailed("unreachable".into()))
        }
    }

    struct CountingProber {
        calls: AtomicUsize,
        delay: Duration,
    }
    #[async_trait]
    impl Prober for CountingProber {
        async fn ping(&self, _peer: &PeerId) -> Result<(), DhtError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(())
        }
    }

    async fn wait_idle(handle: &RoutingHandle) {
        for _ in 0..200 {
            if handle.arbitration_idle() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("arbitration never settled");
    }

    /// Drive adds until one reports a full bucket, returning (new, oldest).
    async fn add_until_full(handle: &RoutingHandle, start: u16) -> (PeerId, PeerId) {
        for seed in start..start + 2000 {
            let candidate = peer(seed);
            if let AddOutcome::Full { oldest } = handle.add(candidate).await {
                return (candidate, oldest);
            }
        }
        panic!("no bucket filled up");
    }

    #[test]
    fn repeated_adds_from_few_peers_bound_the_table() {
        let mut table = RoutingTable::new(local_key(), DEFAULT_K);
        for i in 0..1000u32 {
            let outcome = table.add(peer((i % 20) as u16));
            assert!(!matches!(outcome, AddOutcome::Full { .. }));
        }
        assert!(table.size() <= 20);
        for i in 0..20u16 {
            let closest = table.closest_peers(&peer(i).routing_key(), 5);
            assert!(!closest.is_empty());
            assert!(closest.len() <= 5);
        }
    }

    #[test]
    fn remove_shrinks_closest_set() {
        let mut table = RoutingTable::new(local_key(), DEFAULT_K);
        for i in 0..10u16 {
            table.add(peer(i));
        }
        assert!(table.remove(&peer(5)));
        assert!(!table.remove(&peer(5)));
        assert_eq!(table.size(), 9);
        assert_eq!(table.closest_peers(&peer(2).routing_key(), 10).len(), 9);
    }

    #[test]
    fn closest_peer_to_own_key_is_the_peer() {
        let mut table = RoutingTable::new(local_key(), DEFAULT_K);
        for i in 0..4u16 {
            table.add(peer(i));
        }
        let closest = table.closest_peers(&peer(2).routing_key(), 1);
        assert_eq!(closest, vec![peer(2)]);
    }

    #[test]
    fn closest_is_sorted_ascending_and_capped() {
        let mut table = RoutingTable::new(local_key(), DEFAULT_K);
        for i in 0..200u16 {
            table.add(peer(i));
        }
        let target = RoutingKey::for_bytes(b"somewhere");
        let closest = table.closest_peers(&target, 7);
        assert_eq!(closest.len(), 7);
        for pair in closest.windows(2) {
            let da = pair[0].routing_key().distance(&target);
            let db = pair[1].routing_key().distance(&target);
            assert_ne!(distance_cmp(&da, &db), std::cmp::Ordering::Greater);
        }

        let small = RoutingTable::new(local_key(), DEFAULT_K);
        assert!(small.closest_peers(&target, 7).is_empty());
    }

    #[test]
    fn buckets_never_exceed_k_and_peers_are_unique() {
        let mut table = RoutingTable::new(local_key(), 4);
        for i in 0..500u16 {
            table.add(peer(i % 120));
        }
        let buckets = table.buckets();
        assert!(buckets.iter().all(|b| b.len <= 4));
        let total: usize = buckets.iter().map(|b| b.len).sum();
        assert_eq!(total, table.size());

        let mut seen = HashSet::new();
        let mut all = Vec::new();
        collect_entries(&table.root, &mut all);
        for (p, _) in all {
            assert!(seen.insert(p), "peer {p} appears twice");
        }
    }

    #[test]
    fn self_key_is_never_inserted() {
        let me = peer(42);
        let mut table = RoutingTable::new(me.routing_key(), DEFAULT_K);
        assert_eq!(table.add(me), AddOutcome::SelfEntry);
        assert_eq!(table.size(), 0);
        assert_eq!(table.add(peer(1)), AddOutcome::Added);
    }

    #[test]
    fn random_key_in_bucket_stays_in_range() {
        let mut table = RoutingTable::new(local_key(), 2);
        for i in 0..100u16 {
            table.add(peer(i));
        }
        for info in table.buckets() {
            let key = random_key_in_bucket(&info);
            assert!(info.prefix.common_prefix_len(&key) >= info.depth);
        }
    }

    #[tokio::test]
    async fn arbitration_keeps_responsive_oldest() {
        let handle = RoutingHandle::new(
            local_key(),
            2,
            Arc::new(AliveProber),
            Duration::from_secs(1),
        );
        let (newcomer, oldest) = add_until_full(&handle, 0).await;
        wait_idle(&handle).await;

        assert!(!handle.contains(&newcomer).await, "newcomer must be dropped");
        assert!(handle.contains(&oldest).await, "live oldest must survive");
    }

    #[tokio::test]
    async fn arbitration_evicts_dead_oldest() {
        let handle = RoutingHandle::new(
            local_key(),
            2,
            Arc::new(DeadProber),
            Duration::from_secs(1),
        );
        let (newcomer, oldest) = add_until_full(&handle, 0).await;
        wait_idle(&handle).await;

        assert!(handle.contains(&newcomer).await, "newcomer must be inserted");
        assert!(!handle.contains(&oldest).await, "dead oldest must be evicted");
    }

    #[tokio::test]
    async fn concurrent_arbitrations_for_one_bucket_coalesce() {
        let prober = Arc::new(CountingProber {
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(100),
        });
        let handle = RoutingHandle::new(local_key(), 2, prober.clone(), Duration::from_secs(1));

        let (newcomer, _) = add_until_full(&handle, 0).await;
        // Contending insert against the same bucket while the probe runs.
        handle.add(newcomer).await;
        wait_idle(&handle).await;

        assert_eq!(prober.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn table_events_report_membership_changes() {
        let handle = RoutingHandle::new(
            local_key(),
            DEFAULT_K,
            Arc::new(AliveProber),
            Duration::from_secs(1),
        );
        let mut events = handle.subscribe().await;

        handle.add(peer(1)).await;
        handle.remove(&peer(1)).await;

        assert_eq!(events.recv().await.unwrap(), TableEvent::PeerAdded(peer(1)));
        assert_eq!(
            events.recv().await.unwrap(),
            TableEvent::PeerRemoved(peer(1))
        );
    }
}
