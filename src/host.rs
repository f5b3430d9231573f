//! # Host collaborator interfaces
//!
//! The DHT core borrows everything environment-shaped from the host overlay:
//! connections, inbound protocol registration, peer addresses, and blob
//! persistence. Each concern is a trait so tests can substitute in-memory
//! fakes and hosts can plug their own stacks. The bundled QUIC transport in
//! [`crate::quic`] implements [`ConnectionManager`] and [`Registrar`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::DhtError;
use crate::keys::{Contact, PeerId};
use crate::wire::Message;

/// One protocol stream: framed messages in both directions.
///
/// Implementations apply the wire framing ([`crate::wire`]) to whatever byte
/// stream the host provides. Dropping the stream closes it.
#[async_trait]
pub trait MessageStream: Send {
    /// Write one framed message.
    async fn send(&mut self, msg: &Message) -> Result<(), DhtError>;

    /// Read one framed message; `None` on clean end-of-stream.
    async fn recv(&mut self) -> Result<Option<Message>, DhtError>;

    /// Flush and signal no more writes. Reading may continue.
    async fn finish(&mut self) -> Result<(), DhtError>;
}

/// Opens protocol streams to remote peers.
///
/// Connections themselves are owned by the host; the core opens one stream
/// per request and drops it before returning.
#[async_trait]
pub trait ConnectionManager: Send + Sync + 'static {
    async fn open_stream(
        &self,
        to: &Contact,
        protocol: &str,
    ) -> Result<Box<dyn MessageStream>, DhtError>;
}

/// Callback for inbound streams on a registered protocol.
#[async_trait]
pub trait InboundHandler: Send + Sync + 'static {
    async fn handle(&self, from: Contact, stream: Box<dyn MessageStream>);
}

/// Registers inbound protocol handlers with the host.
///
/// Server mode registers the kad protocol; switching to client mode
/// unregisters it.
#[async_trait]
pub trait Registrar: Send + Sync + 'static {
    async fn register(
        &self,
        protocol: &str,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<(), DhtError>;

    async fn unregister(&self, protocol: &str);
}

/// The host's address book.
#[async_trait]
pub trait AddressBook: Send + Sync + 'static {
    async fn addresses(&self, peer: &PeerId) -> Vec<String>;

    async fn add_addresses(&self, peer: &PeerId, addrs: Vec<String>);
}

/// Key/value blob store backing providers and local records.
///
/// Keys are path-like strings (`/providers/<hex>`, `/records/<hex>`) so
/// `list` can enumerate a namespace for sweeping.
#[async_trait]
pub trait Datastore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, DhtError>;

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), DhtError>;

    async fn delete(&self, key: &str) -> Result<(), DhtError>;

    /// Keys starting with `prefix`, in lexicographic order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, DhtError>;
}

// ============================================================================
// In-memory implementations
// ============================================================================

/// Address book backed by a process-local map.
#[derive(Default)]
pub struct MemoryAddressBook {
    addrs: Mutex<HashMap<PeerId, Vec<String>>>,
}

impl MemoryAddressBook {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AddressBook for MemoryAddressBook {
    async fn addresses(&self, peer: &PeerId) -> Vec<String> {
        self.addrs.lock().await.get(peer).cloned().unwrap_or_default()
    }

    async fn add_addresses(&self, peer: &PeerId, addrs: Vec<String>) {
        let mut book = self.addrs.lock().await;
        let known = book.entry(*peer).or_default();
        for addr in addrs {
            if !known.contains(&addr) {
                known.push(addr);
            }
        }
    }
}

/// Datastore backed by a process-local ordered map. The default backend for
/// nodes that do not configure persistence.
#[derive(Default)]
pub struct MemoryDatastore {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Datastore for MemoryDatastore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, DhtError> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), DhtError> {
        self.entries.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), DhtError> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, DhtError> {
        let entries = self.entries.lock().await;
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn address_book_merges_without_duplicates() {
        let book = MemoryAddressBook::new();
        let peer = PeerId::from_bytes([1; 32]);

        book.add_addresses(&peer, vec!["127.0.0.1:1000".into()]).await;
        book.add_addresses(
            &peer,
            vec!["127.0.0.1:1000".into(), "127.0.0.1:2000".into()],
        )
        .await;

        let addrs = book.addresses(&peer).await;
        assert_eq!(addrs, vec!["127.0.0.1:1000", "127.0.0.1:2000"]);
        assert!(book.addresses(&PeerId::from_bytes([2; 32])).await.is_empty());
    }

    #[tokio::test]
    async fn datastore_list_respects_prefix() {
        let store = MemoryDatastore::new();
        store.put("/providers/aa", vec![1]).await.unwrap();
        store.put("/providers/bb", vec![2]).await.unwrap();
        store.put("/records/aa", vec![3]).await.unwrap();

        let keys = store.list("/providers/").await.unwrap();
        assert_eq!(keys, vec!["/providers/aa", "/providers/bb"]);

        store.delete("/providers/aa").await.unwrap();
        assert_eq!(store.get("/providers/aa").await.unwrap(), None);
        assert_eq!(store.get("/providers/bb").await.unwrap(), Some(vec![2]));
    }
}
