//! # Inbound request handler
//!
//! Serves the six wire message kinds on streams the host hands us in server
//! mode. One request, at most one reply, then the stream is done.
//!
//! Malformed or oversized requests close the stream without a reply; an
//! empty reply would look like a valid-but-vacant answer and poison the
//! querier's view. A stream that opens and closes without a request is a
//! liveness probe and is equally silent.
//!
//! Every inbound sender is fed to the routing table, which makes serving
//! traffic double as passive table maintenance.

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use tracing::{debug, trace, warn};

use crate::host::{AddressBook, InboundHandler, MessageStream};
use crate::keys::{Contact, PeerId, RoutingKey};
use crate::providers::ProviderStore;
use crate::records::{Record, RecordStore, Selectors, Validators};
use crate::routing::RoutingHandle;
use crate::wire::{self, Message, MessageType};

/// Which addresses a node shares with queriers.
///
/// The LAN instance of the DHT only speaks about private addresses, the WAN
/// instance only about public ones; a construction-time choice, never global
/// state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressScope {
    Lan,
    Wan,
}

impl AddressScope {
    pub fn from_lan_flag(lan: bool) -> Self {
        if lan {
            AddressScope::Lan
        } else {
            AddressScope::Wan
        }
    }

    /// Whether an address belongs in this scope. Unparseable addresses are
    /// dropped from both scopes.
    pub fn allows(&self, addr: &str) -> bool {
        let Ok(socket) = addr.parse::<std::net::SocketAddr>() else {
            return false;
        };
        let private = match socket.ip() {
            std::net::IpAddr::V4(ip) => {
                ip.is_private() || ip.is_loopback() || ip.is_link_local() || ip.is_unspecified()
            }
            std::net::IpAddr::V6(ip) => {
                ip.is_loopback()
                    || ip.is_unspecified()
                    || (ip.segments()[0] & 0xfe00) == 0xfc00
                    || (ip.segments()[0] & 0xffc0) == 0xfe80
            }
        };
        match self {
            AddressScope::Lan => private,
            AddressScope::Wan => !private,
        }
    }

    pub fn filter(&self, addrs: Vec<String>) -> Vec<String> {
        addrs.into_iter().filter(|a| self.allows(a)).collect()
    }
}

/// Inbound dispatch for one DHT instance.
pub struct RpcHandler {
    local_peer: PeerId,
    routing: RoutingHandle,
    providers: Arc<ProviderStore>,
    records: Arc<RecordStore>,
    validators: Validators,
    selectors: Selectors,
    address_book: Arc<dyn AddressBook>,
    scope: AddressScope,
    k: usize,
}

impl RpcHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local_peer: PeerId,
        routing: RoutingHandle,
        providers: Arc<ProviderStore>,
        records: Arc<RecordStore>,
        validators: Validators,
        selectors: Selectors,
        address_book: Arc<dyn AddressBook>,
        scope: AddressScope,
        k: usize,
    ) -> Self {
        Self {
            local_peer,
            routing,
            providers,
            records,
            validators,
            selectors,
            address_book,
            scope,
            k,
        }
    }

    /// Closest peers to `key` as wire peers with scoped addresses, the
    /// requester and ourselves excluded.
    async fn closer_peers(&self, key: &[u8], exclude: &PeerId) -> Vec<wire::Peer> {
        let target = RoutingKey::for_bytes(key);
        // Fetch one extra so excluding the requester still yields k.
        let peers = self.routing.closest_peers(&target, self.k + 1).await;
        let mut out = Vec::with_capacity(self.k);
        for peer in peers {
            if &peer == exclude || peer == self.local_peer {
                continue;
            }
            let addrs = self.scope.filter(self.address_book.addresses(&peer).await);
            out.push(wire::Peer {
                id: peer.as_bytes().to_vec(),
                addrs: addrs.into_iter().map(String::into_bytes).collect(),
                connection: wire::ConnectionType::NotConnected as i32,
            });
            if out.len() == self.k {
                break;
            }
        }
        out
    }

    async fn handle_find_node(&self, from: &Contact, msg: &Message) -> Message {
        let mut reply = Message::new(MessageType::FindNode, msg.key.clone());
        reply.closer_peers = self.closer_peers(&msg.key, &from.peer).await;
        trace!(
            from = %from.peer,
            returned = reply.closer_peers.len(),
            "served FIND_NODE"
        );
        reply
    }

    async fn handle_get_value(&self, from: &Contact, msg: &Message) -> Message {
        let mut reply = Message::new(MessageType::GetValue, msg.key.clone());
        reply.closer_peers = self.closer_peers(&msg.key, &from.peer).await;

        match self.records.get(&msg.key).await {
            Ok(Some(record)) => {
                if self.validators.validate(&record.key, &record.value).is_ok() {
                    reply.record = Some(record.to_wire());
                } else {
                    // The record aged out of validity; drop it so it is not
                    // served again.
                    debug!(from = %from.peer, "dropping local record that no longer validates");
                    let _ = self.records.remove(&msg.key).await;
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "record store read failed"),
        }
        reply
    }

    /// Persist an inbound record if it validates and beats what we hold.
    async fn handle_put_value(&self, from: &Contact, msg: &Message) -> Option<Message> {
        let wire_record = msg.record.as_ref()?;
        if wire_record.key != msg.key {
            debug!(from = %from.peer, "PUT_VALUE record key mismatch, closing");
            return None;
        }
        if let Err(e) = self.validators.validate(&wire_record.key, &wire_record.value) {
            debug!(from = %from.peer, error = %e, "rejected invalid record");
            return None;
        }

        let keep_new = match self.records.get(&msg.key).await {
            Ok(Some(existing)) => {
                let values: Vec<&[u8]> = vec![&existing.value, &wire_record.value];
                self.selectors.select(&msg.key, &values) == 1
            }
            Ok(None) => true,
            Err(e) => {
                warn!(error = %e, "record store read failed");
                true
            }
        };

        if keep_new {
            let record = Record::stamped(
                wire_record.key.clone(),
                wire_record.value.clone(),
                SystemTime::now(),
            );
            if let Err(e) = self.records.put(&record).await {
                warn!(error = %e, "record store write failed");
            }
            debug!(from = %from.peer, "stored record");
        }

        // Echo the record as stored (or the better one we kept).
        let mut reply = Message::new(MessageType::PutValue, msg.key.clone());
        match self.records.get(&msg.key).await {
            Ok(Some(stored)) => reply.record = Some(stored.to_wire()),
            _ => reply.record = msg.record.clone(),
        }
        Some(reply)
    }

    async fn handle_get_providers(&self, from: &Contact, msg: &Message) -> Message {
        let mut reply = Message::new(MessageType::GetProviders, msg.key.clone());
        reply.closer_peers = self.closer_peers(&msg.key, &from.peer).await;

        match self.providers.get_providers(&msg.key, SystemTime::now()).await {
            Ok(providers) => {
                for peer in providers {
                    let addrs = self.scope.filter(self.address_book.addresses(&peer).await);
                    reply.provider_peers.push(wire::Peer {
                        id: peer.as_bytes().to_vec(),
                        addrs: addrs.into_iter().map(String::into_bytes).collect(),
                        connection: wire::ConnectionType::NotConnected as i32,
                    });
                }
            }
            Err(e) => warn!(error = %e, "provider store read failed"),
        }
        trace!(
            from = %from.peer,
            providers = reply.provider_peers.len(),
            "served GET_PROVIDERS"
        );
        reply
    }

    /// Record advertisements, but only the sender's own: a peer cannot
    /// announce third parties as providers.
    async fn handle_add_provider(&self, from: &Contact, msg: &Message) {
        if msg.key.is_empty() {
            return;
        }
        for peer in &msg.provider_peers {
            let Some(contact) = peer.to_contact() else {
                continue;
            };
            if contact.peer != from.peer {
                trace!(
                    from = %from.peer,
                    claimed = %contact.peer,
                    "ignoring third-party provider advertisement"
                );
                continue;
            }
            if !contact.addrs.is_empty() {
                self.address_book
                    .add_addresses(&contact.peer, contact.addrs.clone())
                    .await;
            }
            if let Err(e) = self
                .providers
                .add_provider(&msg.key, contact.peer, SystemTime::now())
                .await
            {
                warn!(error = %e, "provider store write failed");
            } else {
                debug!(provider = %contact.peer, "recorded provider");
            }
        }
    }
}

#[async_trait]
impl InboundHandler for RpcHandler {
    async fn handle(&self, from: Contact, mut stream: Box<dyn MessageStream>) {
        let msg = match stream.recv().await {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                // Bare stream open: a liveness probe. Nothing to say.
                trace!(from = %from.peer, "liveness probe");
                return;
            }
            Err(e) => {
                debug!(from = %from.peer, error = %e, "closing stream on malformed request");
                return;
            }
        };

        // Whoever talks to us belongs in the table (arbitrated as usual).
        if !from.addrs.is_empty() {
            self.address_book
                .add_addresses(&from.peer, from.addrs.clone())
                .await;
        }
        self.routing.add(from.peer).await;

        let reply = match msg.message_type() {
            Some(MessageType::Ping) => Some(msg.clone()),
            Some(MessageType::FindNode) => Some(self.handle_find_node(&from, &msg).await),
            Some(MessageType::GetValue) => Some(self.handle_get_value(&from, &msg).await),
            Some(MessageType::PutValue) => self.handle_put_value(&from, &msg).await,
            Some(MessageType::GetProviders) => Some(self.handle_get_providers(&from, &msg).await),
            Some(MessageType::AddProvider) => {
                self.handle_add_provider(&from, &msg).await;
                None
            }
            None => {
                debug!(from = %from.peer, raw = msg.r#type, "unknown message type, closing");
                None
            }
        };

        if let Some(reply) = reply {
            if let Err(e) = stream.send(&reply).await {
                debug!(from = %from.peer, error = %e, "failed to write reply");
                return;
            }
            let _ = stream.finish().await;
        }
    }
}
