//! # Iterative query engine
//!
//! Disjoint-path iterative lookups: a query runs `d` independent paths, each
//! keeping up to `alpha` requests in flight against its own frontier of
//! candidates ordered by XOR distance to the target. A shared first-claim-
//! wins set keeps the paths disjoint (no peer is contacted by two paths),
//! which bounds what an adversary on one path can poison.
//!
//! The engine is operation-agnostic: it sends one request template to every
//! peer it visits and emits the network's [`QueryEvent`]s plus `FinishPath`
//! markers. Operations (get/put/provide) are layered on top by consuming the
//! event stream and cancelling the query token once satisfied; dropping the
//! stream has the same effect.
//!
//! Per-peer failures never fail a query. The only terminal events are the
//! caller's abort and the query deadline.

use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::DhtError;
use crate::keys::{distance_cmp, Distance, PeerId, RoutingKey};
use crate::network::{Network, QueryEvent};
use crate::records::Record;
use crate::routing::RoutingHandle;
use crate::wire::{self, Message};

/// Requests in flight per path.
pub const DEFAULT_ALPHA: usize = 3;

/// Size of the terminal closest set.
pub const DEFAULT_QUERY_K: usize = 20;

/// Whole-query deadline.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(60);

/// Consecutive no-progress responses a path tolerates before finishing.
pub const DEFAULT_BETA: usize = 1;

/// Capacity of a query's event channel.
const QUERY_EVENT_BUFFER: usize = 64;

#[derive(Clone, Debug)]
pub struct QueryConfig {
    pub alpha: usize,
    pub k: usize,
    /// Number of disjoint paths; `None` derives ceil(k / 2).
    pub disjoint_paths: Option<usize>,
    pub beta: usize,
    pub timeout: Duration,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            alpha: DEFAULT_ALPHA,
            k: DEFAULT_QUERY_K,
            disjoint_paths: None,
            beta: DEFAULT_BETA,
            timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }
}

impl QueryConfig {
    pub fn paths(&self) -> usize {
        self.disjoint_paths.unwrap_or_else(|| self.k.div_ceil(2)).max(1)
    }
}

/// A running query: its event stream and the token that stops it early.
///
/// The stream is finite and non-restartable; it closes once every path has
/// finished or the query was aborted. Dropping it aborts the query.
pub struct QueryRun {
    pub events: mpsc::Receiver<QueryEvent>,
    stop: CancellationToken,
    _stop_on_drop: tokio_util::sync::DropGuard,
}

impl QueryRun {
    /// Signal early termination; in-flight streams are torn down.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub async fn next_event(&mut self) -> Option<QueryEvent> {
        self.events.recv().await
    }

    /// Drive the query to completion, discarding events. Used by maintenance
    /// lookups that only care about the table traffic they generate.
    pub async fn drain(mut self) {
        while self.events.recv().await.is_some() {}
    }
}

pub struct QueryEngine {
    network: Arc<Network>,
    routing: RoutingHandle,
    local_peer: PeerId,
    config: QueryConfig,
}

impl QueryEngine {
    pub fn new(
        network: Arc<Network>,
        routing: RoutingHandle,
        local_peer: PeerId,
        config: QueryConfig,
    ) -> Self {
        Self {
            network,
            routing,
            local_peer,
            config,
        }
    }

    /// Start an iterative lookup toward `target`, sending `request` to every
    /// visited peer.
    pub async fn run(
        &self,
        target: RoutingKey,
        request: Message,
        abort: &CancellationToken,
    ) -> QueryRun {
        let (events_tx, events_rx) = mpsc::channel(QUERY_EVENT_BUFFER);
        let stop = abort.child_token();

        let seeds = self
            .routing
            .closest_peers(&target, self.config.k)
            .await;

        if seeds.is_empty() {
            let _ = events_tx
                .send(QueryEvent::QueryError {
                    from: self.local_peer,
                    error: DhtError::TableNotInitialized,
                })
                .await;
            return QueryRun {
                events: events_rx,
                stop: stop.clone(),
                _stop_on_drop: stop.drop_guard(),
            };
        }

        let claims = Arc::new(ClaimSet::default());
        let paths = self.config.paths().min(seeds.len()).max(1);

        // Round-robin the seeds across paths; every seed is claimed by the
        // path it lands on.
        let mut frontiers: Vec<Vec<PeerId>> = vec![Vec::new(); paths];
        for (idx, seed) in seeds.into_iter().enumerate() {
            if claims.claim(seed) {
                frontiers[idx % paths].push(seed);
            }
        }

        let mut workers = JoinSet::new();
        for (index, seeds) in frontiers.into_iter().enumerate() {
            let path = PathWorker {
                index,
                target,
                request: request.clone(),
                network: self.network.clone(),
                routing: self.routing.clone(),
                local_peer: self.local_peer,
                claims: claims.clone(),
                alpha: self.config.alpha.max(1),
                k: self.config.k,
                beta: self.config.beta.max(1),
                stop: stop.clone(),
                events: events_tx.clone(),
            };
            workers.spawn(path.run(seeds));
        }

        // Supervisor: enforce the deadline, wait out the paths, then close
        // the stream. The events sender it holds is the last one alive.
        let deadline = self.config.timeout;
        let stop_for_worker = stop.clone();
        let local_peer = self.local_peer;
        tokio::spawn(async move {
            let timed_out = tokio::select! {
                _ = tokio::time::sleep(deadline) => true,
                _ = stop_for_worker.cancelled() => false,
                _ = async { while workers.join_next().await.is_some() {} } => false,
            };
            if timed_out {
                stop_for_worker.cancel();
                let _ = events_tx
                    .send(QueryEvent::QueryError {
                        from: local_peer,
                        error: DhtError::Timeout,
                    })
                    .await;
            } else if stop_for_worker.is_cancelled() {
                let _ = events_tx
                    .send(QueryEvent::QueryError {
                        from: local_peer,
                        error: DhtError::Aborted,
                    })
                    .await;
            }
            // Let any still-running path wind down before the channel closes.
            while workers.join_next().await.is_some() {}
        });

        QueryRun {
            events: events_rx,
            stop: stop.clone(),
            _stop_on_drop: stop.drop_guard(),
        }
    }
}

/// First-claim-wins peer ownership across paths. Claims last for the whole
/// query so a peer dropped by one path is never re-tried by another. Also
/// deduplicates provider sightings so `ProviderFound` fires once per peer.
#[derive(Default)]
struct ClaimSet {
    claimed: StdMutex<HashSet<PeerId>>,
    providers_seen: StdMutex<HashSet<PeerId>>,
}

impl ClaimSet {
    fn claim(&self, peer: PeerId) -> bool {
        self.claimed.lock().expect("claim set lock").insert(peer)
    }

    fn first_provider_sighting(&self, peer: PeerId) -> bool {
        self.providers_seen
            .lock()
            .expect("provider set lock")
            .insert(peer)
    }
}

/// Frontier entry ordered by distance to the target (then peer id, to make
/// the order total).
struct Candidate {
    distance: Distance,
    peer: PeerId,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.distance == other.distance && self.peer == other.peer
    }
}
impl Eq for Candidate {}
impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed so the BinaryHeap pops the nearest candidate first.
        distance_cmp(&other.distance, &self.distance)
            .then_with(|| other.peer.cmp(&self.peer))
    }
}

struct PathWorker {
    index: usize,
    target: RoutingKey,
    request: Message,
    network: Arc<Network>,
    routing: RoutingHandle,
    local_peer: PeerId,
    claims: Arc<ClaimSet>,
    alpha: usize,
    k: usize,
    beta: usize,
    stop: CancellationToken,
    events: mpsc::Sender<QueryEvent>,
}

impl PathWorker {
    async fn run(self, seeds: Vec<PeerId>) {
        let mut candidates: BinaryHeap<Candidate> = BinaryHeap::new();
        for peer in seeds {
            candidates.push(Candidate {
                distance: peer.routing_key().distance(&self.target),
                peer,
            });
        }

        // K nearest distances this path has observed, ascending.
        let mut best: Vec<Distance> = Vec::with_capacity(self.k + 1);
        let mut no_progress = 0usize;
        let mut saturated = false;
        let mut in_flight: JoinSet<(PeerId, Result<Message, DhtError>)> = JoinSet::new();

        loop {
            if self.stop.is_cancelled() {
                break;
            }

            while !saturated && in_flight.len() < self.alpha {
                let Some(next) = candidates.pop() else { break };
                let network = self.network.clone();
                let request = self.request.clone();
                let stop = self.stop.clone();
                let events = self.events.clone();
                trace!(path = self.index, peer = %next.peer, "querying candidate");
                in_flight.spawn(async move {
                    let result = network.send_request(next.peer, &request, &stop, &events).await;
                    (next.peer, result)
                });
            }

            if in_flight.is_empty() {
                break;
            }

            let joined = tokio::select! {
                _ = self.stop.cancelled() => break,
                joined = in_flight.join_next() => joined,
            };
            let Some(Ok((peer, result))) = joined else {
                continue;
            };

            match result {
                Ok(reply) => {
                    // The responder answered; it belongs in the table.
                    self.routing.add(peer).await;
                    self.surface_findings(peer, &reply).await;
                    let progressed = self.integrate(&reply, &mut candidates, &mut best);
                    if progressed {
                        no_progress = 0;
                    } else {
                        no_progress += 1;
                        if no_progress >= self.beta {
                            // No closer peer found: stop widening, let the
                            // in-flight requests drain.
                            saturated = true;
                        }
                    }
                }
                Err(error) => {
                    // Already surfaced as a QueryError event by the network
                    // layer; a dead candidate just stops being a candidate.
                    trace!(path = self.index, peer = %peer, error = %error, "candidate failed");
                }
            }
        }

        debug!(path = self.index, "path finished");
        let _ = self
            .events
            .send(QueryEvent::FinishPath { path: self.index })
            .await;
    }

    /// Surface records and providers carried in a reply as typed events.
    /// Validation stays with the operation consuming the stream.
    async fn surface_findings(&self, from: PeerId, reply: &Message) {
        if let Some(ref wire_record) = reply.record {
            let _ = self
                .events
                .send(QueryEvent::ValueFound {
                    from,
                    record: Record::from_wire(wire_record),
                })
                .await;
        }
        for provider in wire::peers_to_contacts(&reply.provider_peers) {
            if self.claims.first_provider_sighting(provider.peer) {
                let _ = self
                    .events
                    .send(QueryEvent::ProviderFound { provider })
                    .await;
            }
        }
    }

    /// Merge a reply's closer peers into this path's frontier. Returns
    /// whether the frontier gained a candidate closer than the K-best seen.
    fn integrate(
        &self,
        reply: &Message,
        candidates: &mut BinaryHeap<Candidate>,
        best: &mut Vec<Distance>,
    ) -> bool {
        let kth_before = best.get(self.k - 1).copied();
        let mut progressed = false;

        for contact in wire::peers_to_contacts(&reply.closer_peers) {
            if contact.peer == self.local_peer {
                continue;
            }
            // First-claim-wins: peers already owned by any path (this one
            // included) are not re-queued.
            if !self.claims.claim(contact.peer) {
                continue;
            }
            let distance = contact.peer.routing_key().distance(&self.target);

            let closer_than_kth = match kth_before {
                Some(kth) => distance_cmp(&distance, &kth) == std::cmp::Ordering::Less,
                None => true,
            };
            if closer_than_kth {
                progressed = true;
            }

            match best.binary_search_by(|d| distance_cmp(d, &distance)) {
                Ok(pos) | Err(pos) => best.insert(pos, distance),
            }
            best.truncate(self.k);

            candidates.push(Candidate {
                distance,
                peer: contact.peer,
            });
        }
        progressed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{
        AddressBook, ConnectionManager, MemoryAddressBook, MessageStream,
    };
    use crate::keys::Contact;
    use crate::routing::{Prober, RoutingHandle, DEFAULT_PING_TIMEOUT};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn peer(seed: u8) -> PeerId {
        PeerId::from_bytes([seed; 32])
    }

    struct NoopProber;
    #[async_trait]
    impl Prober for NoopProber {
        async fn ping(&self, _peer: &PeerId) -> Result<(), DhtError> {
            Ok(())
        }
    }

    /// Simulated overlay: each peer answers FIND_NODE-style requests with a
    /// scripted closer list. Streams opened are counted.
    struct SimOverlay {
        topology: HashMap<PeerId, Vec<Contact>>,
        opened: AtomicUsize,
    }

    struct SimStream {
        reply: Option<Message>,
    }

    #[async_trait]
    impl MessageStream for SimStream {
        async fn send(&mut self, _msg: &Message) -> Result<(), DhtError> {
            Ok(())
        }
        async fn recv(&mut self) -> Result<Option<Message>, DhtError> {
            Ok(self.reply.take())
        }
        async fn finish(&mut self) -> Result<(), DhtError> {
            Ok(())
        }
    }

    #[async_trait]
    impl ConnectionManager for SimOverlay {
        async fn open_stream(
            &self,
            to: &Contact,
            _protocol: &str,
        ) -> Result<Box<dyn MessageStream>, DhtError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            let Some(closer) = self.topology.get(&to.peer) else {
                return Err(DhtError::DialFailed("unknown sim peer".into()));
            };
            let mut reply = Message::find_node(Vec::new());
            reply.closer_peers = wire::contacts_to_peers(closer);
            Ok(Box::new(SimStream { reply: Some(reply) }))
        }
    }

    struct Harness {
        engine: QueryEngine,
        overlay: Arc<SimOverlay>,
    }

    async fn harness(
        local: PeerId,
        seeds: &[PeerId],
        topology: HashMap<PeerId, Vec<Contact>>,
        config: QueryConfig,
    ) -> Harness {
        let overlay = Arc::new(SimOverlay {
            topology,
            opened: AtomicUsize::new(0),
        });
        let book = Arc::new(MemoryAddressBook::new());
        // Every simulated peer is "dialable".
        for seed in 0u8..64 {
            book.add_addresses(&peer(seed), vec![format!("127.0.0.1:{}", 7000 + seed as u16)])
                .await;
        }

        let routing = RoutingHandle::new(
            local.routing_key(),
            config.k,
            Arc::new(NoopProber),
            DEFAULT_PING_TIMEOUT,
        );
        for s in seeds {
            routing.add(*s).await;
        }

        let (discovered_tx, _discovered_rx) = mpsc::channel(256);
        let network = Arc::new(Network::new(
            overlay.clone(),
            book,
            "/ipfs/kad/1.0.0".into(),
            local,
            discovered_tx,
        ));
        Harness {
            engine: QueryEngine::new(network, routing, local, config),
            overlay,
        }
    }

    fn contacts(ids: &[u8]) -> Vec<Contact> {
        ids.iter()
            .map(|i| Contact::single(peer(*i), format!("127.0.0.1:{}", 7000 + *i as u16)))
            .collect()
    }

    async fn drain(mut run: QueryRun) -> Vec<QueryEvent> {
        let mut events = Vec::new();
        while let Some(event) = run.next_event().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn empty_table_reports_uninitialized() {
        let h = harness(peer(0), &[], HashMap::new(), QueryConfig::default()).await;
        let run = h
            .engine
            .run(
                peer(9).routing_key(),
                Message::find_node(vec![]),
                &CancellationToken::new(),
            )
            .await;
        let events = drain(run).await;
        assert!(events.iter().any(|e| matches!(
            e,
            QueryEvent::QueryError {
                error: DhtError::TableNotInitialized,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn multi_hop_lookup_reaches_target() {
        // 1 knows 2, 2 knows 3, 3 knows the target 9.
        let mut topology = HashMap::new();
        topology.insert(peer(1), contacts(&[2]));
        topology.insert(peer(2), contacts(&[3]));
        topology.insert(peer(3), contacts(&[9]));
        topology.insert(peer(9), contacts(&[]));

        let h = harness(peer(0), &[peer(1)], topology, QueryConfig::default()).await;
        let run = h
            .engine
            .run(
                peer(9).routing_key(),
                Message::find_node(peer(9).routing_key().as_bytes().to_vec()),
                &CancellationToken::new(),
            )
            .await;
        let events = drain(run).await;

        let saw_target_in_closer = events.iter().any(|e| match e {
            QueryEvent::PeerResponse { message, .. } => {
                wire::peers_to_contacts(&message.closer_peers)
                    .iter()
                    .any(|c| c.peer == peer(9))
            }
            _ => false,
        });
        assert!(saw_target_in_closer, "target never surfaced: {events:?}");

        // Hop bound: far fewer streams than alpha * d * hops.
        let config = QueryConfig::default();
        let bound = config.alpha * config.paths() * 3;
        let opened = h.overlay.opened.load(Ordering::SeqCst);
        assert!(opened < bound, "{opened} streams, bound {bound}");
    }

    #[tokio::test]
    async fn no_peer_is_queried_twice_across_paths() {
        // Dense topology where everyone advertises everyone.
        let all: Vec<u8> = (1..=12).collect();
        let mut topology = HashMap::new();
        for i in &all {
            topology.insert(peer(*i), contacts(&all));
        }

        let seeds: Vec<PeerId> = all.iter().take(6).map(|i| peer(*i)).collect();
        let h = harness(peer(0), &seeds, topology, QueryConfig::default()).await;
        let run = h
            .engine
            .run(
                peer(42).routing_key(),
                Message::find_node(vec![]),
                &CancellationToken::new(),
            )
            .await;
        let events = drain(run).await;

        let mut queried = HashSet::new();
        for event in &events {
            if let QueryEvent::SendingQuery { peer } = event {
                assert!(queried.insert(*peer), "peer {peer} queried twice");
            }
        }
        assert!(!queried.is_empty());
    }

    #[tokio::test]
    async fn per_peer_failures_do_not_end_the_query() {
        // Seed 1 answers, seed 5 is not in the topology and fails to dial.
        let mut topology = HashMap::new();
        topology.insert(peer(1), contacts(&[2]));
        topology.insert(peer(2), contacts(&[]));

        let h = harness(
            peer(0),
            &[peer(1), peer(5)],
            topology,
            QueryConfig::default(),
        )
        .await;
        let run = h
            .engine
            .run(
                peer(2).routing_key(),
                Message::find_node(vec![]),
                &CancellationToken::new(),
            )
            .await;
        let events = drain(run).await;

        assert!(events
            .iter()
            .any(|e| matches!(e, QueryEvent::QueryError { from, .. } if *from == peer(5))));
        assert!(events
            .iter()
            .any(|e| matches!(e, QueryEvent::PeerResponse { from, .. } if *from == peer(2))));
        // All paths still report finishing.
        let finished = events
            .iter()
            .filter(|e| matches!(e, QueryEvent::FinishPath { .. }))
            .count();
        assert!(finished >= 1);
    }

    #[tokio::test]
    async fn abort_emits_terminal_aborted_event() {
        /// A peer that never answers keeps the query running until abort.
        struct StuckOverlay;
        #[async_trait]
        impl ConnectionManager for StuckOverlay {
            async fn open_stream(
                &self,
                _to: &Contact,
                _protocol: &str,
            ) -> Result<Box<dyn MessageStream>, DhtError> {
                std::future::pending().await
            }
        }

        let book = Arc::new(MemoryAddressBook::new());
        book.add_addresses(&peer(1), vec!["127.0.0.1:7001".into()])
            .await;
        let routing = RoutingHandle::new(
            peer(0).routing_key(),
            20,
            Arc::new(NoopProber),
            DEFAULT_PING_TIMEOUT,
        );
        routing.add(peer(1)).await;
        let (tx, _rx) = mpsc::channel(16);
        let network = Arc::new(Network::new(
            Arc::new(StuckOverlay),
            book,
            "/ipfs/kad/1.0.0".into(),
            peer(0),
            tx,
        ));
        let engine = QueryEngine::new(network, routing, peer(0), QueryConfig::default());

        let abort = CancellationToken::new();
        let run = engine
            .run(peer(9).routing_key(), Message::find_node(vec![]), &abort)
            .await;
        let abort_clone = abort.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            abort_clone.cancel();
        });

        let events = drain(run).await;
        assert!(events.iter().any(|e| matches!(
            e,
            QueryEvent::QueryError {
                error: DhtError::Aborted,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn deadline_emits_timeout() {
        struct StuckOverlay;
        #[async_trait]
        impl ConnectionManager for StuckOverlay {
            async fn open_stream(
                &self,
                _to: &Contact,
                _protocol: &str,
            ) -> Result<Box<dyn MessageStream>, DhtError> {
                std::future::pending().await
            }
        }

        let book = Arc::new(MemoryAddressBook::new());
        book.add_addresses(&peer(1), vec!["127.0.0.1:7001".into()])
            .await;
        let routing = RoutingHandle::new(
            peer(0).routing_key(),
            20,
            Arc::new(NoopProber),
            DEFAULT_PING_TIMEOUT,
        );
        routing.add(peer(1)).await;
        let (tx, _rx) = mpsc::channel(16);
        let network = Arc::new(Network::new(
            Arc::new(StuckOverlay),
            book,
            "/ipfs/kad/1.0.0".into(),
            peer(0),
            tx,
        ));
        let config = QueryConfig {
            timeout: Duration::from_millis(100),
            ..QueryConfig::default()
        };
        let engine = QueryEngine::new(network, routing, peer(0), config);

        let run = engine
            .run(
                peer(9).routing_key(),
                Message::find_node(vec![]),
                &CancellationToken::new(),
            )
            .await;
        let events = drain(run).await;
        assert!(events.iter().any(|e| matches!(
            e,
            QueryEvent::QueryError {
                error: DhtError::Timeout,
                ..
            }
        )));
    }
}
