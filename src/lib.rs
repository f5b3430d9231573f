//! # Kadmos: Kademlia DHT for peer-to-peer overlays
//!
//! A decentralized key/value and content-routing service. Peers organize by
//! XOR distance over hashed identifiers; the crate provides the
//! overlay-visible operations (storing a signed record, retrieving one,
//! advertising a content key, locating its providers, and peer lookup) on
//! top of a host-supplied transport.
//!
//! ## Architecture
//!
//! The [`Dht`] handle fronts a set of components that each own their state
//! and communicate through channels and small shared locks:
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `keys` | peer ids, routing keys, XOR distance, node keypairs |
//! | `wire` | protobuf wire messages and varint framing |
//! | `routing` | k-bucket tree, eviction arbitration via the ping queue |
//! | `providers` | bounded, TTL-expiring provider records |
//! | `records` | records, per-namespace validators and selectors |
//! | `query` | α-parallel, disjoint-path iterative lookups |
//! | `handler` | inbound request dispatch (server mode) |
//! | `network` | one-stream-per-request outbound layer |
//! | `maintenance` | bucket refresh and query-self loops |
//! | `host` | traits the host overlay implements |
//! | `quic` / `tls` | bundled QUIC transport with peer-id-bound certificates |
//!
//! ## Client and server mode
//!
//! Every node issues queries; only servers answer them. The mode is a
//! runtime switch ([`Dht::set_mode`]) that registers or unregisters the kad
//! protocol with the host. A LAN and a WAN instance can share one transport;
//! they differ in protocol id and in which addresses they are willing to
//! speak about.

mod dht;
mod error;
mod handler;
pub mod host;
mod keys;
mod maintenance;
mod network;
mod providers;
mod query;
mod quic;
mod records;
mod routing;
mod tls;
pub mod wire;

pub use dht::{Dht, DhtBuilder, DhtConfig, Mode, TelemetrySnapshot};
pub use error::DhtError;
pub use handler::AddressScope;
pub use keys::{
    distance_cmp, random_key_with_cpl, sort_by_distance, Contact, Distance, Keypair, PeerId,
    RoutingKey,
};
pub use network::QueryEvent;
pub use providers::{ProviderStore, DEFAULT_PROVIDER_TTL, MAX_PROVIDERS_PER_KEY, MAX_PROVIDER_KEYS};
pub use query::{QueryConfig, DEFAULT_ALPHA, DEFAULT_BETA, DEFAULT_QUERY_TIMEOUT};
pub use quic::QuicTransport;
pub use records::{
    default_selectors, default_validators, sign_pk_record, PkSelector, PkValidator, Record,
    Selector, Selectors, Validator, Validators,
};
pub use routing::{
    AddOutcome, BucketInfo, Prober, RoutingHandle, RoutingTable, TableEvent, DEFAULT_K,
    DEFAULT_PING_TIMEOUT,
};
