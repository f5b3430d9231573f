//! # QUIC transport
//!
//! The bundled [`ConnectionManager`]/[`Registrar`] implementation: one QUIC
//! endpoint per node, mutually-authenticated TLS bound to peer ids
//! ([`crate::tls`]), one bidirectional stream per request. Each stream opens
//! with a protocol id header so several protocols (WAN kad, LAN kad) can
//! share the endpoint; inbound streams are dispatched to whichever handler
//! is registered for the id, and silently closed otherwise.
//!
//! Connections are cached in a bounded LRU and redialed when closed.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use lru::LruCache;
use quinn::{ClientConfig, Connection, Endpoint};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::DhtError;
use crate::host::{ConnectionManager, InboundHandler, MessageStream, Registrar};
use crate::keys::{Contact, Keypair, PeerId};
use crate::tls;
use crate::wire::{self, Message, MAX_MESSAGE_SIZE};

/// Cached outbound connections.
const MAX_CACHED_CONNECTIONS: usize = 256;

type HandlerMap = Arc<Mutex<HashMap<String, Arc<dyn InboundHandler>>>>;

/// QUIC endpoint shared by all DHT instances of one node.
pub struct QuicTransport {
    endpoint: Endpoint,
    client_config: ClientConfig,
    local_peer: PeerId,
    connections: Mutex<LruCache<PeerId, Connection>>,
    handlers: HandlerMap,
    cancel: CancellationToken,
}

impl QuicTransport {
    /// Bind a QUIC endpoint on `addr` with the node's identity and start
    /// accepting connections.
    pub async fn bind(addr: SocketAddr, keypair: &Keypair) -> Result<Arc<Self>> {
        let (certs, key) = tls::generate_cert(keypair)?;
        let server_config = tls::server_config(certs.clone(), key.clone_key())?;
        let client_config = tls::client_config(certs, key)?;

        let endpoint = Endpoint::server(server_config, addr)
            .with_context(|| format!("failed to bind QUIC endpoint on {addr}"))?;

        let transport = Arc::new(Self {
            endpoint,
            client_config,
            local_peer: keypair.peer_id(),
            connections: Mutex::new(LruCache::new(
                NonZeroUsize::new(MAX_CACHED_CONNECTIONS).expect("cache bound is non-zero"),
            )),
            handlers: Arc::default(),
            cancel: CancellationToken::new(),
        });

        let accept = transport.clone();
        tokio::spawn(async move { accept.accept_loop().await });
        Ok(transport)
    }

    pub fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.endpoint.local_addr().context("endpoint has no local address")
    }

    /// Stop accepting and drop all connections.
    pub fn close(&self) {
        self.cancel.cancel();
        self.endpoint.close(0u32.into(), b"shutdown");
    }

    async fn accept_loop(self: Arc<Self>) {
        loop {
            let incoming = tokio::select! {
                _ = self.cancel.cancelled() => break,
                incoming = self.endpoint.accept() => incoming,
            };
            let Some(incoming) = incoming else { break };

            let transport = self.clone();
            tokio::spawn(async move {
                if let Err(e) = transport.handle_incoming(incoming).await {
                    debug!(error = %e, "inbound connection ended with error");
                }
            });
        }
        debug!("accept loop stopped");
    }

    async fn handle_incoming(self: Arc<Self>, incoming: quinn::Incoming) -> Result<()> {
        let connection = incoming.await.context("failed to accept connection")?;
        let remote = connection.remote_address();

        let Some(peer) = tls::connection_peer_id(&connection) else {
            warn!(remote = %remote, "rejecting connection without verifiable peer identity");
            connection.close(1u32.into(), b"unverified");
            return Ok(());
        };
        trace!(peer = %peer, remote = %remote, "inbound connection");

        loop {
            let stream = tokio::select! {
                _ = self.cancel.cancelled() => break,
                stream = connection.accept_bi() => stream,
            };
            let (send, recv) = match stream {
                Ok(s) => s,
                Err(quinn::ConnectionError::ApplicationClosed(_))
                | Err(quinn::ConnectionError::TimedOut) => break,
                Err(e) => return Err(e.into()),
            };

            let handlers = self.handlers.clone();
            let from = Contact::single(peer, remote.to_string());
            tokio::spawn(async move {
                let mut stream = QuicMessageStream { send, recv };
                let protocol = match wire::read_protocol(&mut stream.recv).await {
                    Ok(Some(protocol)) => protocol,
                    // EOF before a header or garbage: close without a word.
                    Ok(None) | Err(_) => return,
                };
                let handler = handlers.lock().await.get(&protocol).cloned();
                match handler {
                    Some(handler) => handler.handle(from, Box::new(stream)).await,
                    None => {
                        trace!(protocol = %protocol, "no handler registered, closing stream");
                    }
                }
            });
        }
        Ok(())
    }

    async fn get_or_connect(&self, contact: &Contact) -> Result<Connection, DhtError> {
        {
            let mut cache = self.connections.lock().await;
            if let Some(conn) = cache.get(&contact.peer) {
                if conn.close_reason().is_none() {
                    return Ok(conn.clone());
                }
                cache.pop(&contact.peer);
            }
        }

        let sni = tls::peer_id_to_sni(&contact.peer);
        let mut last_error = DhtError::DialFailed("peer has no addresses".into());
        for addr_str in &contact.addrs {
            let addr: SocketAddr = match addr_str.parse() {
                Ok(addr) => addr,
                Err(e) => {
                    last_error = DhtError::DialFailed(format!("invalid address {addr_str}: {e}"));
                    continue;
                }
            };
            let connecting = match self
                .endpoint
                .connect_with(self.client_config.clone(), addr, &sni)
            {
                Ok(connecting) => connecting,
                Err(e) => {
                    last_error = DhtError::DialFailed(e.to_string());
                    continue;
                }
            };
            match connecting.await {
                Ok(conn) => {
                    self.connections.lock().await.put(contact.peer, conn.clone());
                    return Ok(conn);
                }
                Err(e) => {
                    last_error = DhtError::DialFailed(e.to_string());
                }
            }
        }
        Err(last_error)
    }
}

#[async_trait]
impl ConnectionManager for QuicTransport {
    async fn open_stream(
        &self,
        to: &Contact,
        protocol: &str,
    ) -> Result<Box<dyn MessageStream>, DhtError> {
        let conn = self.get_or_connect(to).await?;
        let (mut send, recv) = conn.open_bi().await.map_err(map_connection_error)?;
        wire::write_protocol(&mut send, protocol).await?;
        Ok(Box::new(QuicMessageStream { send, recv }))
    }
}

#[async_trait]
impl Registrar for QuicTransport {
    async fn register(
        &self,
        protocol: &str,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<(), DhtError> {
        debug!(protocol = %protocol, "registering inbound handler");
        self.handlers
            .lock()
            .await
            .insert(protocol.to_string(), handler);
        Ok(())
    }

    async fn unregister(&self, protocol: &str) {
        debug!(protocol = %protocol, "unregistering inbound handler");
        self.handlers.lock().await.remove(protocol);
    }
}

struct QuicMessageStream {
    send: quinn::SendStream,
    recv: quinn::RecvStream,
}

#[async_trait]
impl MessageStream for QuicMessageStream {
    async fn send(&mut self, msg: &Message) -> Result<(), DhtError> {
        wire::write_message(&mut self.send, msg).await
    }

    async fn recv(&mut self) -> Result<Option<Message>, DhtError> {
        wire::read_message(&mut self.recv, MAX_MESSAGE_SIZE).await
    }

    async fn finish(&mut self) -> Result<(), DhtError> {
        // Already-finished is fine; the write side is done either way.
        let _ = self.send.finish();
        Ok(())
    }
}

fn map_connection_error(e: quinn::ConnectionError) -> DhtError {
    match e {
        quinn::ConnectionError::Reset => DhtError::StreamReset,
        other => DhtError::Io(other.to_string()),
    }
}
