//! # DHT root
//!
//! Wires the routing table, stores, network layer, query engine, inbound
//! handler, and maintenance loops into one [`Dht`] handle and exposes the
//! public operations: `put_value`, `get_value`, `provide`, `find_providers`,
//! `find_peer`, `refresh`.
//!
//! A node runs the DHT in *client* mode (issuing queries only, the default)
//! or *server* mode (also answering them); the switch registers or
//! unregisters the kad protocol with the host. LAN and WAN deployments are
//! two `Dht` instances built over the same transport with different `lan`
//! flags; the flag picks the protocol id and the address scope, and is
//! construction state, never global.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::DhtError;
use crate::handler::{AddressScope, RpcHandler};
use crate::host::{
    AddressBook, ConnectionManager, Datastore, MemoryAddressBook, MemoryDatastore, Registrar,
};
use crate::keys::{distance_cmp, Contact, Distance, Keypair, PeerId, RoutingKey};
use crate::maintenance::{
    self, DEFAULT_QUERY_SELF_INTERVAL, DEFAULT_REFRESH_INTERVAL, DEFAULT_REFRESH_THRESHOLD,
};
use crate::network::{Network, QueryEvent, StreamProber};
use crate::providers::{ProviderStore, DEFAULT_PROVIDER_TTL, SWEEP_INTERVAL};
use crate::query::{QueryConfig, QueryEngine, DEFAULT_ALPHA, DEFAULT_BETA, DEFAULT_QUERY_TIMEOUT};
use crate::records::{
    default_selectors, default_validators, Record, RecordStore, Selectors, Validators,
};
use crate::routing::{RoutingHandle, DEFAULT_K, DEFAULT_PING_TIMEOUT};
use crate::wire::{self, Message};

/// Buffer for peers discovered opportunistically from responses.
const DISCOVERED_PEER_BUFFER: usize = 256;

/// Whether this node answers queries or only issues them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Client,
    Server,
}

#[derive(Clone)]
pub struct DhtConfig {
    pub k_bucket_size: usize,
    pub client_mode: bool,
    pub protocol_prefix: String,
    pub lan: bool,
    pub query_self_interval: Duration,
    pub refresh_interval: Duration,
    pub refresh_threshold: Duration,
    pub provider_ttl: Duration,
    pub provider_sweep_interval: Duration,
    pub ping_timeout: Duration,
    pub query_timeout: Duration,
    pub alpha: usize,
    /// `None` derives ceil(k / 2).
    pub disjoint_paths: Option<usize>,
    pub beta: usize,
    /// Valid records to collect before a `get_value` settles; `None`
    /// derives ceil(k / 4).
    pub quorum: Option<usize>,
    pub validators: Validators,
    pub selectors: Selectors,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            k_bucket_size: DEFAULT_K,
            client_mode: true,
            protocol_prefix: "/ipfs".to_string(),
            lan: false,
            query_self_interval: DEFAULT_QUERY_SELF_INTERVAL,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            refresh_threshold: DEFAULT_REFRESH_THRESHOLD,
            provider_ttl: DEFAULT_PROVIDER_TTL,
            provider_sweep_interval: SWEEP_INTERVAL,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            alpha: DEFAULT_ALPHA,
            disjoint_paths: None,
            beta: DEFAULT_BETA,
            quorum: None,
            validators: default_validators(),
            selectors: default_selectors(),
        }
    }
}

impl DhtConfig {
    /// The protocol id this instance speaks.
    pub fn protocol(&self) -> String {
        if self.lan {
            format!("{}/lan/kad/1.0.0", self.protocol_prefix)
        } else {
            format!("{}/kad/1.0.0", self.protocol_prefix)
        }
    }

    fn quorum_value(&self) -> usize {
        self.quorum
            .unwrap_or_else(|| self.k_bucket_size.div_ceil(4))
            .max(1)
    }
}

/// Point-in-time view of the node for logs and diagnostics.
#[derive(Clone, Debug, Default)]
pub struct TelemetrySnapshot {
    pub peers: usize,
    pub buckets: usize,
    pub server_mode: bool,
}

pub struct DhtBuilder {
    config: DhtConfig,
    keypair: Option<Keypair>,
    conn: Option<Arc<dyn ConnectionManager>>,
    registrar: Option<Arc<dyn Registrar>>,
    address_book: Option<Arc<dyn AddressBook>>,
    datastore: Option<Arc<dyn Datastore>>,
    external_addresses: Vec<String>,
}

impl DhtBuilder {
    pub fn config(mut self, config: DhtConfig) -> Self {
        self.config = config;
        self
    }

    pub fn keypair(mut self, keypair: Keypair) -> Self {
        self.keypair = Some(keypair);
        self
    }

    pub fn connection_manager(mut self, conn: Arc<dyn ConnectionManager>) -> Self {
        self.conn = Some(conn);
        self
    }

    pub fn registrar(mut self, registrar: Arc<dyn Registrar>) -> Self {
        self.registrar = Some(registrar);
        self
    }

    pub fn address_book(mut self, address_book: Arc<dyn AddressBook>) -> Self {
        self.address_book = Some(address_book);
        self
    }

    pub fn datastore(mut self, datastore: Arc<dyn Datastore>) -> Self {
        self.datastore = Some(datastore);
        self
    }

    /// Addresses other peers can dial us on; advertised in provider records.
    pub fn external_addresses(mut self, addrs: Vec<String>) -> Self {
        self.external_addresses = addrs;
        self
    }

    pub fn build(self) -> Result<Dht, DhtError> {
        let conn = self
            .conn
            .ok_or_else(|| DhtError::Config("no connection manager configured".into()))?;
        let keypair = self.keypair.unwrap_or_else(Keypair::generate);
        let address_book: Arc<dyn AddressBook> = self
            .address_book
            .unwrap_or_else(|| Arc::new(MemoryAddressBook::new()));
        let datastore: Arc<dyn Datastore> = self
            .datastore
            .unwrap_or_else(|| Arc::new(MemoryDatastore::new()));

        let config = self.config;
        let local_peer = keypair.peer_id();
        let protocol = config.protocol();
        let scope = AddressScope::from_lan_flag(config.lan);

        let (discovered_tx, discovered_rx) = mpsc::channel(DISCOVERED_PEER_BUFFER);
        let network = Arc::new(Network::new(
            conn.clone(),
            address_book.clone(),
            protocol.clone(),
            local_peer,
            discovered_tx,
        ));

        let prober = Arc::new(StreamProber::new(
            conn.clone(),
            address_book.clone(),
            protocol.clone(),
        ));
        let routing = RoutingHandle::new(
            local_peer.routing_key(),
            config.k_bucket_size,
            prober,
            config.ping_timeout,
        );

        let providers = Arc::new(ProviderStore::new(datastore.clone(), config.provider_ttl));
        let records = Arc::new(RecordStore::new(datastore.clone()));

        let engine = Arc::new(QueryEngine::new(
            network.clone(),
            routing.clone(),
            local_peer,
            QueryConfig {
                alpha: config.alpha,
                k: config.k_bucket_size,
                disjoint_paths: config.disjoint_paths,
                beta: config.beta,
                timeout: config.query_timeout,
            },
        ));

        let handler = Arc::new(RpcHandler::new(
            local_peer,
            routing.clone(),
            providers.clone(),
            records.clone(),
            config.validators.clone(),
            config.selectors.clone(),
            address_book.clone(),
            scope,
            config.k_bucket_size,
        ));

        Ok(Dht {
            inner: Arc::new(DhtInner {
                config,
                protocol,
                scope,
                local_peer,
                routing,
                providers,
                records,
                network,
                engine,
                handler,
                registrar: self.registrar,
                address_book,
                external_addresses: self.external_addresses,
                server_mode: AtomicBool::new(false),
                started: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
                discovered_rx: Mutex::new(Some(discovered_rx)),
            }),
        })
    }
}

struct DhtInner {
    config: DhtConfig,
    protocol: String,
    scope: AddressScope,
    local_peer: PeerId,
    routing: RoutingHandle,
    providers: Arc<ProviderStore>,
    records: Arc<RecordStore>,
    network: Arc<Network>,
    engine: Arc<QueryEngine>,
    handler: Arc<RpcHandler>,
    registrar: Option<Arc<dyn Registrar>>,
    address_book: Arc<dyn AddressBook>,
    external_addresses: Vec<String>,
    server_mode: AtomicBool,
    started: AtomicBool,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    discovered_rx: Mutex<Option<mpsc::Receiver<Contact>>>,
}

/// The DHT handle. Cheap to clone; all clones drive the same node.
#[derive(Clone)]
pub struct Dht {
    inner: Arc<DhtInner>,
}

impl Dht {
    pub fn builder() -> DhtBuilder {
        DhtBuilder {
            config: DhtConfig::default(),
            keypair: None,
            conn: None,
            registrar: None,
            address_book: None,
            datastore: None,
            external_addresses: Vec::new(),
        }
    }

    pub fn local_peer(&self) -> PeerId {
        self.inner.local_peer
    }

    pub fn protocol(&self) -> &str {
        &self.inner.protocol
    }

    pub fn mode(&self) -> Mode {
        if self.inner.server_mode.load(Ordering::SeqCst) {
            Mode::Server
        } else {
            Mode::Client
        }
    }

    /// Start maintenance loops and, unless configured as a client, begin
    /// serving.
    pub async fn start(&self) -> Result<(), DhtError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let inner = &self.inner;
        let mut tasks = inner.tasks.lock().await;

        // Topology listener: peers surfacing in responses or from external
        // discovery sources flow into the routing table.
        let discovered_rx = inner
            .discovered_rx
            .lock()
            .await
            .take()
            .ok_or(DhtError::TableNotInitialized)?;
        tasks.push(spawn_topology_listener(
            discovered_rx,
            inner.routing.clone(),
            inner.cancel.clone(),
        ));

        tasks.push(
            inner
                .providers
                .spawn_sweep(inner.config.provider_sweep_interval, inner.cancel.clone()),
        );
        tasks.push(maintenance::spawn_refresh_loop(
            inner.engine.clone(),
            inner.routing.clone(),
            inner.config.refresh_interval,
            inner.config.refresh_threshold,
            inner.cancel.clone(),
        ));
        tasks.push(maintenance::spawn_query_self_loop(
            inner.engine.clone(),
            inner.local_peer,
            inner.config.query_self_interval,
            inner.cancel.clone(),
        ));
        drop(tasks);

        if !inner.config.client_mode {
            self.set_mode(Mode::Server).await?;
        }
        info!(
            peer = %inner.local_peer,
            protocol = %inner.protocol,
            lan = inner.config.lan,
            "dht started"
        );
        Ok(())
    }

    /// Stop serving and cancel all background work.
    pub async fn stop(&self) {
        let inner = &self.inner;
        if self.mode() == Mode::Server {
            let _ = self.set_mode(Mode::Client).await;
        }
        inner.cancel.cancel();
        let mut tasks = inner.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
        debug!(peer = %inner.local_peer, "dht stopped");
    }

    /// Switch between answering queries and only issuing them.
    pub async fn set_mode(&self, mode: Mode) -> Result<(), DhtError> {
        let inner = &self.inner;
        let registrar = inner
            .registrar
            .as_ref()
            .ok_or_else(|| DhtError::Config("no registrar configured".into()))?;
        match mode {
            Mode::Server => {
                registrar
                    .register(&inner.protocol, inner.handler.clone())
                    .await?;
                inner.server_mode.store(true, Ordering::SeqCst);
            }
            Mode::Client => {
                registrar.unregister(&inner.protocol).await;
                inner.server_mode.store(false, Ordering::SeqCst);
            }
        }
        debug!(peer = %inner.local_peer, mode = ?mode, "mode changed");
        Ok(())
    }

    /// Feed an externally discovered peer into the routing table.
    pub async fn add_peer(&self, contact: Contact) {
        if contact.peer == self.inner.local_peer {
            return;
        }
        if !contact.addrs.is_empty() {
            self.inner
                .address_book
                .add_addresses(&contact.peer, contact.addrs.clone())
                .await;
        }
        self.inner.routing.add(contact.peer).await;
    }

    /// Join the overlay through a known peer, then look ourselves up to
    /// populate nearby buckets.
    pub async fn bootstrap(
        &self,
        seed: Contact,
        abort: &CancellationToken,
    ) -> Result<(), DhtError> {
        self.add_peer(seed).await;
        let run = self
            .inner
            .engine
            .run(
                self.inner.local_peer.routing_key(),
                Message::find_node(self.inner.local_peer.as_bytes().to_vec()),
                abort,
            )
            .await;
        run.drain().await;
        Ok(())
    }

    /// Refresh stale buckets, or every bucket when `force` is set.
    pub async fn refresh(&self, force: bool) {
        maintenance::refresh_buckets(
            &self.inner.engine,
            &self.inner.routing,
            self.inner.config.refresh_threshold,
            force,
        )
        .await;
    }

    pub async fn telemetry(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            peers: self.inner.routing.size().await,
            buckets: self.inner.routing.buckets().await.len(),
            server_mode: self.mode() == Mode::Server,
        }
    }

    // ========================================================================
    // Lookups
    // ========================================================================

    /// Locate a peer's addresses.
    pub async fn find_peer(
        &self,
        target: PeerId,
        abort: &CancellationToken,
    ) -> Result<Option<Contact>, DhtError> {
        // Already known?
        let known = self.inner.address_book.addresses(&target).await;
        if !known.is_empty() {
            return Ok(Some(Contact::new(target, known)));
        }

        let mut run = self
            .inner
            .engine
            .run(
                target.routing_key(),
                Message::find_node(target.as_bytes().to_vec()),
                abort,
            )
            .await;

        let mut found: Option<Contact> = None;
        while let Some(event) = run.next_event().await {
            match event {
                QueryEvent::PeerResponse { message, .. } => {
                    let hit = wire::peers_to_contacts(&message.closer_peers)
                        .into_iter()
                        .find(|c| c.peer == target && !c.addrs.is_empty());
                    if let Some(contact) = hit {
                        found = Some(contact);
                        run.stop();
                    }
                }
                QueryEvent::QueryError { error, .. } if error.is_aborted() => break,
                _ => {}
            }
        }
        Ok(found)
    }

    /// Store a signed record on the K peers closest to its key. Returns how
    /// many peers acknowledged the write.
    pub async fn put_value(
        &self,
        key: Vec<u8>,
        value: Vec<u8>,
        abort: &CancellationToken,
    ) -> Result<usize, DhtError> {
        self.inner.config.validators.validate(&key, &value)?;

        let record = Record::stamped(key.clone(), value.clone(), SystemTime::now());
        self.inner.records.put(&record).await?;

        let targets = self.lookup_closest(&key, abort).await;
        let request = Message::put_value(key.clone(), Record::new(key.clone(), value).to_wire());

        let mut writes = JoinSet::new();
        for peer in targets {
            let network = self.inner.network.clone();
            let request = request.clone();
            let abort = abort.clone();
            writes.spawn(async move {
                let (tx, _rx) = mpsc::channel(8);
                network.send_request(peer, &request, &abort, &tx).await
            });
        }

        let mut stored = 0usize;
        while let Some(joined) = writes.join_next().await {
            if matches!(joined, Ok(Ok(_))) {
                stored += 1;
            }
        }
        debug!(key = %hex::encode(&key[..key.len().min(8)]), stored, "put_value fanned out");
        Ok(stored)
    }

    /// Fetch the best record for `key`.
    ///
    /// Collects up to the quorum of valid records, picks the winner with the
    /// namespace selector, and asynchronously pushes the winner back to
    /// peers that served nothing or something worse.
    pub async fn get_value(
        &self,
        key: &[u8],
        abort: &CancellationToken,
    ) -> Result<Record, DhtError> {
        let validators = &self.inner.config.validators;
        let quorum = self.inner.config.quorum_value();

        let mut candidates: Vec<Record> = Vec::new();
        // Everyone who answered, and the valid value they served, if any.
        // Peers that served nothing, garbage, or a loser get the correction.
        let mut responded: Vec<PeerId> = Vec::new();
        let mut served: HashMap<PeerId, Vec<u8>> = HashMap::new();

        if let Some(local) = self.inner.records.get(key).await? {
            if validators.validate(&local.key, &local.value).is_ok() {
                candidates.push(local);
            } else {
                self.inner.records.remove(key).await?;
            }
        }

        let mut run = self
            .inner
            .engine
            .run(
                RoutingKey::for_bytes(key),
                Message::get_value(key.to_vec()),
                abort,
            )
            .await;

        while let Some(event) = run.next_event().await {
            match event {
                QueryEvent::PeerResponse { from, .. } => responded.push(from),
                QueryEvent::ValueFound { from, record } if record.key.as_slice() == key => {
                    if validators.validate(&record.key, &record.value).is_ok() {
                        served.insert(from, record.value.clone());
                        candidates.push(record);
                        if candidates.len() >= quorum {
                            run.stop();
                        }
                    } else {
                        trace!(peer = %from, "peer served an invalid record");
                    }
                }
                QueryEvent::QueryError { error, .. } if error.is_aborted() => break,
                _ => {}
            }
        }

        if candidates.is_empty() {
            return Err(DhtError::NotFound);
        }

        let responders: Vec<(PeerId, Option<Vec<u8>>)> = responded
            .into_iter()
            .map(|peer| {
                let value = served.get(&peer).cloned();
                (peer, value)
            })
            .collect();

        let values: Vec<&[u8]> = candidates.iter().map(|r| r.value.as_slice()).collect();
        let best_idx = self.inner.config.selectors.select(key, &values);
        let best = candidates[best_idx].clone();

        self.correct_stale_peers(&best, &responders).await;
        Ok(best)
    }

    /// Advertise that this node can serve `cid`. Returns how many peers were
    /// notified.
    pub async fn provide(&self, cid: &[u8], abort: &CancellationToken) -> Result<usize, DhtError> {
        self.inner
            .providers
            .add_provider(cid, self.inner.local_peer, SystemTime::now())
            .await?;

        let targets = self.lookup_closest(cid, abort).await;
        let self_peer = wire::Peer {
            id: self.inner.local_peer.as_bytes().to_vec(),
            addrs: self
                .inner
                .scope
                .filter(self.inner.external_addresses.clone())
                .into_iter()
                .map(String::into_bytes)
                .collect(),
            connection: wire::ConnectionType::Connected as i32,
        };
        let request = Message::add_provider(cid.to_vec(), self_peer);

        let mut notified = 0usize;
        let mut writes = JoinSet::new();
        for peer in targets {
            let network = self.inner.network.clone();
            let request = request.clone();
            let abort = abort.clone();
            writes.spawn(async move {
                let (tx, _rx) = mpsc::channel(8);
                network.send_message(peer, &request, &abort, &tx).await
            });
        }
        while let Some(joined) = writes.join_next().await {
            if matches!(joined, Ok(Ok(()))) {
                notified += 1;
            }
        }
        debug!(cid = %hex::encode(&cid[..cid.len().min(8)]), notified, "provide fanned out");
        Ok(notified)
    }

    /// Locate up to `limit` distinct peers that advertised `cid`.
    pub async fn find_providers(
        &self,
        cid: &[u8],
        limit: usize,
        abort: &CancellationToken,
    ) -> Result<Vec<Contact>, DhtError> {
        let mut unique: HashMap<PeerId, Contact> = HashMap::new();

        // Locally known providers count toward the limit.
        for peer in self
            .inner
            .providers
            .get_providers(cid, SystemTime::now())
            .await?
        {
            let addrs = self.inner.address_book.addresses(&peer).await;
            unique.insert(peer, Contact::new(peer, addrs));
        }

        if unique.len() < limit {
            let mut run = self
                .inner
                .engine
                .run(
                    RoutingKey::for_bytes(cid),
                    Message::get_providers(cid.to_vec()),
                    abort,
                )
                .await;

            while let Some(event) = run.next_event().await {
                match event {
                    QueryEvent::ProviderFound { provider } => {
                        unique.entry(provider.peer).or_insert(provider);
                        if unique.len() >= limit {
                            run.stop();
                        }
                    }
                    QueryEvent::QueryError { error, .. } if error.is_aborted() => break,
                    _ => {}
                }
            }
        }

        let mut providers: Vec<Contact> = unique.into_values().collect();
        providers.truncate(limit);
        Ok(providers)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Iterative lookup for the K peers closest to `key`, merging what the
    /// query visited with what the table already knows.
    async fn lookup_closest(&self, key: &[u8], abort: &CancellationToken) -> Vec<PeerId> {
        let target = RoutingKey::for_bytes(key);
        let k = self.inner.config.k_bucket_size;

        let mut seen: HashMap<PeerId, Distance> = HashMap::new();
        let mut run = self
            .inner
            .engine
            .run(target, Message::find_node(key.to_vec()), abort)
            .await;

        while let Some(event) = run.next_event().await {
            match event {
                QueryEvent::PeerResponse { from, message } => {
                    seen.entry(from)
                        .or_insert_with(|| from.routing_key().distance(&target));
                    for contact in wire::peers_to_contacts(&message.closer_peers) {
                        if contact.peer == self.inner.local_peer {
                            continue;
                        }
                        seen.entry(contact.peer)
                            .or_insert_with(|| contact.peer.routing_key().distance(&target));
                    }
                }
                QueryEvent::QueryError { error, .. } if error.is_aborted() => break,
                _ => {}
            }
        }

        for peer in self.inner.routing.closest_peers(&target, k).await {
            seen.entry(peer)
                .or_insert_with(|| peer.routing_key().distance(&target));
        }

        let mut ranked: Vec<(PeerId, Distance)> = seen.into_iter().collect();
        ranked.sort_by(|a, b| distance_cmp(&a.1, &b.1));
        ranked.truncate(k);
        ranked.into_iter().map(|(peer, _)| peer).collect()
    }

    /// Push the winning record to peers that served nothing or a loser, and
    /// fix our own copy. Fire-and-forget.
    async fn correct_stale_peers(&self, best: &Record, responders: &[(PeerId, Option<Vec<u8>>)]) {
        match self.inner.records.get(&best.key).await {
            Ok(Some(local)) if local.value == best.value => {}
            _ => {
                let stamped =
                    Record::stamped(best.key.clone(), best.value.clone(), SystemTime::now());
                if let Err(e) = self.inner.records.put(&stamped).await {
                    warn!(error = %e, "failed to store corrected record");
                }
            }
        }

        let stale: Vec<PeerId> = responders
            .iter()
            .filter(|(_, value)| value.as_deref() != Some(best.value.as_slice()))
            .map(|(peer, _)| *peer)
            .collect();
        if stale.is_empty() {
            return;
        }

        let request = Message::put_value(best.key.clone(), best.to_wire());
        let network = self.inner.network.clone();
        let cancel = self.inner.cancel.clone();
        tokio::spawn(async move {
            for peer in stale {
                let (tx, _rx) = mpsc::channel(8);
                if let Err(e) = network.send_message(peer, &request, &cancel, &tx).await {
                    trace!(peer = %peer, error = %e, "record correction failed");
                }
            }
        });
    }
}

fn spawn_topology_listener(
    mut discovered: mpsc::Receiver<Contact>,
    routing: RoutingHandle,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let contact = tokio::select! {
                _ = cancel.cancelled() => break,
                contact = discovered.recv() => contact,
            };
            let Some(contact) = contact else { break };
            routing.add(contact.peer).await;
        }
    })
}
