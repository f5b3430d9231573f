//! # Outbound network layer
//!
//! A thin wrapper over the host's connection manager: one protocol stream
//! per call, write one framed request, optionally read one framed reply,
//! close. Lifecycle is reported as [`QueryEvent`]s so the query engine can
//! surface per-peer progress without the network layer knowing anything
//! about queries.
//!
//! Every peer mentioned in a reply's closer or provider lists is forwarded
//! on the discovered-peer channel for opportunistic routing-table
//! population.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::DhtError;
use crate::host::{AddressBook, ConnectionManager};
use crate::keys::{Contact, PeerId};
use crate::records::Record;
use crate::routing::Prober;
use crate::wire::{self, Message};

/// Ceiling on one request/response exchange, independent of any query-level
/// deadline the caller composes on top.
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(30);

/// Typed progress events for queries. The network layer emits the first
/// four; the query engine adds the operation-level ones.
#[derive(Debug)]
pub enum QueryEvent {
    /// Opening a stream to the peer.
    DialingPeer { peer: PeerId },
    /// Stream open, request going out.
    SendingQuery { peer: PeerId },
    /// One reply, exactly as received.
    PeerResponse { from: PeerId, message: Box<Message> },
    /// The exchange with one peer failed. Queries continue past these.
    QueryError { from: PeerId, error: DhtError },
    /// A valid record was collected.
    ValueFound { from: PeerId, record: Record },
    /// A new provider surfaced.
    ProviderFound { provider: Contact },
    /// One disjoint path ran out of work.
    FinishPath { path: usize },
}

/// Sink for peers learned from responses.
pub type DiscoveredPeerSender = mpsc::Sender<Contact>;

pub struct Network {
    conn: Arc<dyn ConnectionManager>,
    address_book: Arc<dyn AddressBook>,
    protocol: String,
    local_peer: PeerId,
    discovered: DiscoveredPeerSender,
}

impl Network {
    pub fn new(
        conn: Arc<dyn ConnectionManager>,
        address_book: Arc<dyn AddressBook>,
        protocol: String,
        local_peer: PeerId,
        discovered: DiscoveredPeerSender,
    ) -> Self {
        Self {
            conn,
            address_book,
            protocol,
            local_peer,
            discovered,
        }
    }

    /// Send one request and read exactly one reply.
    ///
    /// Emits `DialingPeer`, `SendingQuery`, then either `PeerResponse` or
    /// `QueryError` on `events`; the reply also comes back as the return
    /// value for callers driving control flow. Cancelling `abort` tears the
    /// stream down and yields [`DhtError::Aborted`].
    pub async fn send_request(
        &self,
        to: PeerId,
        msg: &Message,
        abort: &CancellationToken,
        events: &mpsc::Sender<QueryEvent>,
    ) -> Result<Message, DhtError> {
        let result = tokio::select! {
            _ = abort.cancelled() => Err(DhtError::Aborted),
            res = self.exchange(to, msg, true, events) => res,
        };
        match result {
            Ok(Some(reply)) => {
                self.surface_discovered(&reply).await;
                let _ = events
                    .send(QueryEvent::PeerResponse {
                        from: to,
                        message: Box::new(reply.clone()),
                    })
                    .await;
                Ok(reply)
            }
            Ok(None) => {
                let error = DhtError::NoMessageReceived;
                let _ = events
                    .send(QueryEvent::QueryError {
                        from: to,
                        error: error.clone(),
                    })
                    .await;
                Err(error)
            }
            Err(error) => {
                trace!(peer = %to, error = %error, "request failed");
                let _ = events
                    .send(QueryEvent::QueryError {
                        from: to,
                        error: error.clone(),
                    })
                    .await;
                Err(error)
            }
        }
    }

    /// Fire-and-forget variant: write the request, read nothing.
    pub async fn send_message(
        &self,
        to: PeerId,
        msg: &Message,
        abort: &CancellationToken,
        events: &mpsc::Sender<QueryEvent>,
    ) -> Result<(), DhtError> {
        let result = tokio::select! {
            _ = abort.cancelled() => Err(DhtError::Aborted),
            res = self.exchange(to, msg, false, events) => res,
        };
        match result {
            Ok(_) => Ok(()),
            Err(error) => {
                let _ = events
                    .send(QueryEvent::QueryError {
                        from: to,
                        error: error.clone(),
                    })
                    .await;
                Err(error)
            }
        }
    }

    async fn exchange(
        &self,
        to: PeerId,
        msg: &Message,
        want_reply: bool,
        events: &mpsc::Sender<QueryEvent>,
    ) -> Result<Option<Message>, DhtError> {
        let contact = self.contact_for(&to).await?;

        let _ = events.send(QueryEvent::DialingPeer { peer: to }).await;
        let exchange = async {
            let mut stream = self.conn.open_stream(&contact, &self.protocol).await?;

            let _ = events.send(QueryEvent::SendingQuery { peer: to }).await;
            stream.send(msg).await?;
            stream.finish().await?;

            if !want_reply {
                return Ok(None);
            }
            let reply = stream.recv().await?;
            match reply {
                Some(reply) => Ok(Some(reply)),
                None => Ok(None),
            }
        };
        tokio::time::timeout(EXCHANGE_TIMEOUT, exchange)
            .await
            .map_err(|_| DhtError::Timeout)?
    }

    async fn contact_for(&self, peer: &PeerId) -> Result<Contact, DhtError> {
        let addrs = self.address_book.addresses(peer).await;
        if addrs.is_empty() {
            return Err(DhtError::DialFailed(format!("no known addresses for {peer}")));
        }
        Ok(Contact::new(*peer, addrs))
    }

    /// Forward every peer a reply mentions for opportunistic table
    /// population, and remember their addresses.
    async fn surface_discovered(&self, reply: &Message) {
        let mut contacts = wire::peers_to_contacts(&reply.closer_peers);
        contacts.extend(wire::peers_to_contacts(&reply.provider_peers));
        contacts.sort_by(|a, b| a.peer.cmp(&b.peer));
        contacts.dedup_by(|a, b| a.peer == b.peer);

        for contact in contacts {
            if contact.peer == self.local_peer {
                continue;
            }
            if !contact.addrs.is_empty() {
                self.address_book
                    .add_addresses(&contact.peer, contact.addrs.clone())
                    .await;
            }
            if self.discovered.try_send(contact).is_err() {
                // Channel saturated; discovery is best-effort.
                debug!("discovered-peer channel full, dropping");
                break;
            }
        }
    }
}

// ============================================================================
// Liveness probe
// ============================================================================

/// Arbitration probe: open the kad protocol stream, write nothing, close.
/// A peer that completes the stream handshake counts as alive.
pub struct StreamProber {
    conn: Arc<dyn ConnectionManager>,
    address_book: Arc<dyn AddressBook>,
    protocol: String,
}

impl StreamProber {
    pub fn new(
        conn: Arc<dyn ConnectionManager>,
        address_book: Arc<dyn AddressBook>,
        protocol: String,
    ) -> Self {
        Self {
            conn,
            address_book,
            protocol,
        }
    }
}

#[async_trait]
impl Prober for StreamProber {
    async fn ping(&self, peer: &PeerId) -> Result<(), DhtError> {
        let addrs = self.address_book.addresses(peer).await;
        if addrs.is_empty() {
            return Err(DhtError::DialFailed(format!("no known addresses for {peer}")));
        }
        let contact = Contact::new(*peer, addrs);
        let mut stream = self.conn.open_stream(&contact, &self.protocol).await?;
        stream.finish().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{MemoryAddressBook, MessageStream};
    use std::sync::Mutex as StdMutex;

    /// Stream stub that records sent messages and replays queued replies.
    struct ScriptedStream {
        sent: Arc<StdMutex<Vec<Message>>>,
        replies: Vec<Message>,
    }

    #[async_trait]
    impl MessageStream for ScriptedStream {
        async fn send(&mut self, msg: &Message) -> Result<(), DhtError> {
            self.sent.lock().unwrap().push(msg.clone());
            Ok(())
        }

        async fn recv(&mut self) -> Result<Option<Message>, DhtError> {
            Ok(self.replies.pop())
        }

        async fn finish(&mut self) -> Result<(), DhtError> {
            Ok(())
        }
    }

    struct ScriptedManager {
        sent: Arc<StdMutex<Vec<Message>>>,
        reply: Option<Message>,
    }

    #[async_trait]
    impl ConnectionManager for ScriptedManager {
        async fn open_stream(
            &self,
            _to: &Contact,
            _protocol: &str,
        ) -> Result<Box<dyn MessageStream>, DhtError> {
            Ok(Box::new(ScriptedStream {
                sent: self.sent.clone(),
                replies: self.reply.clone().into_iter().collect(),
            }))
        }
    }

    struct FailingManager;

    #[async_trait]
    impl ConnectionManager for FailingManager {
        async fn open_stream(
            &self,
            to: &Contact,
            _protocol: &str,
        ) -> Result<Box<dyn MessageStream>, DhtError> {
            Err(DhtError::DialFailed(format!("refused by {}", to.peer)))
        }
    }

    fn peer(seed: u8) -> PeerId {
        PeerId::from_bytes([seed; 32])
    }

    async fn network_with(
        conn: Arc<dyn ConnectionManager>,
        remote: PeerId,
    ) -> (Network, mpsc::Receiver<Contact>) {
        let book = Arc::new(MemoryAddressBook::new());
        book.add_addresses(&remote, vec!["127.0.0.1:9999".into()]).await;
        let (tx, rx) = mpsc::channel(16);
        let network = Network::new(conn, book, "/ipfs/kad/1.0.0".into(), peer(0), tx);
        (network, rx)
    }

    #[tokio::test]
    async fn request_emits_lifecycle_events_and_returns_reply() {
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let mut reply = Message::find_node(b"t".to_vec());
        reply.closer_peers = wire::contacts_to_peers(&[Contact::single(
            peer(3),
            "127.0.0.1:1234",
        )]);
        let conn = Arc::new(ScriptedManager {
            sent: sent.clone(),
            reply: Some(reply),
        });
        let (network, mut discovered) = network_with(conn, peer(1)).await;

        let (events_tx, mut events_rx) = mpsc::channel(16);
        let abort = CancellationToken::new();
        let request = Message::find_node(b"t".to_vec());
        let got = network
            .send_request(peer(1), &request, &abort, &events_tx)
            .await
            .unwrap();
        assert_eq!(got.closer_peers.len(), 1);
        assert_eq!(sent.lock().unwrap().len(), 1);

        assert!(matches!(
            events_rx.recv().await,
            Some(QueryEvent::DialingPeer { .. })
        ));
        assert!(matches!(
            events_rx.recv().await,
            Some(QueryEvent::SendingQuery { .. })
        ));
        assert!(matches!(
            events_rx.recv().await,
            Some(QueryEvent::PeerResponse { from, .. }) if from == peer(1)
        ));

        // The closer peer surfaced on the discovery channel.
        let contact = discovered.recv().await.unwrap();
        assert_eq!(contact.peer, peer(3));
    }

    #[tokio::test]
    async fn dial_failure_becomes_query_error_event() {
        let (network, _discovered) = network_with(Arc::new(FailingManager), peer(1)).await;

        let (events_tx, mut events_rx) = mpsc::channel(16);
        let abort = CancellationToken::new();
        let err = network
            .send_request(peer(1), &Message::ping(), &abort, &events_tx)
            .await
            .unwrap_err();
        assert!(matches!(err, DhtError::DialFailed(_)));

        // Dialing is attempted, then the error surfaces as an event.
        assert!(matches!(
            events_rx.recv().await,
            Some(QueryEvent::DialingPeer { .. })
        ));
        assert!(matches!(
            events_rx.recv().await,
            Some(QueryEvent::QueryError { error: DhtError::DialFailed(_), .. })
        ));
    }

    #[tokio::test]
    async fn unknown_peer_fails_without_dialing() {
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let conn = Arc::new(ScriptedManager {
            sent: sent.clone(),
            reply: None,
        });
        let book = Arc::new(MemoryAddressBook::new());
        let (tx, _rx) = mpsc::channel(4);
        let network = Network::new(conn, book, "/ipfs/kad/1.0.0".into(), peer(0), tx);

        let (events_tx, _events_rx) = mpsc::channel(16);
        let err = network
            .send_request(peer(9), &Message::ping(), &CancellationToken::new(), &events_tx)
            .await
            .unwrap_err();
        assert!(matches!(err, DhtError::DialFailed(_)));
        assert!(sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn abort_cancels_with_aborted_error() {
        /// Never-completing connection manager.
        struct StuckManager;
        #[async_trait]
        impl ConnectionManager for StuckManager {
            async fn open_stream(
                &self,
                _to: &Contact,
                _protocol: &str,
            ) -> Result<Box<dyn MessageStream>, DhtError> {
                std::future::pending().await
            }
        }

        let (network, _discovered) = network_with(Arc::new(StuckManager), peer(1)).await;
        let (events_tx, _events_rx) = mpsc::channel(16);
        let abort = CancellationToken::new();
        let abort_clone = abort.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            abort_clone.cancel();
        });

        let err = network
            .send_request(peer(1), &Message::ping(), &abort, &events_tx)
            .await
            .unwrap_err();
        assert!(err.is_aborted());
    }

    #[tokio::test]
    async fn send_message_reads_no_reply() {
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let conn = Arc::new(ScriptedManager {
            sent: sent.clone(),
            reply: Some(Message::ping()),
        });
        let (network, mut discovered) = network_with(conn, peer(1)).await;

        let (events_tx, _events_rx) = mpsc::channel(16);
        network
            .send_message(peer(1), &Message::ping(), &CancellationToken::new(), &events_tx)
            .await
            .unwrap();
        assert_eq!(sent.lock().unwrap().len(), 1);
        // No reply was read, so nothing was discovered.
        assert!(discovered.try_recv().is_err());
    }
}
