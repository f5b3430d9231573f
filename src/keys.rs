//! # Identifiers and distance metric
//!
//! Everything in the overlay is addressed by XOR distance over 256-bit
//! routing keys:
//!
//! - [`PeerId`]: opaque 32-byte peer identifier, the SHA-256 digest of the
//!   peer's Ed25519 public key.
//! - [`RoutingKey`]: SHA-256 of an identifier (or of an external record key),
//!   the coordinate used for all distance math.
//! - [`Keypair`]: the Ed25519 signing keypair a node derives its identity
//!   from, also used to mint the node's TLS certificate.
//!
//! Hashing identifiers before routing gives a uniform keyspace regardless of
//! how peer ids or record keys are chosen.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Raw XOR distance between two routing keys, big-endian.
pub type Distance = [u8; 32];

// ============================================================================
// Peer identifiers
// ============================================================================

/// Opaque 32-byte peer identifier: SHA-256 of the peer's public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId([u8; 32]);

impl PeerId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Derive a peer id from raw Ed25519 public key bytes.
    pub fn from_public_key(public_key: &[u8]) -> Self {
        Self(sha256(public_key))
    }

    /// Parse from the slice form carried on the wire.
    ///
    /// Returns `None` unless the slice is exactly 32 bytes.
    pub fn try_from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// The routing-table coordinate for this peer.
    pub fn routing_key(&self) -> RoutingKey {
        RoutingKey::for_bytes(&self.0)
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self(arr))
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({})", hex::encode(&self.0[..8]))
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

// ============================================================================
// Routing keys
// ============================================================================

/// A 256-bit coordinate in the XOR keyspace.
///
/// Peers and record keys are both mapped here through SHA-256, so a lookup
/// for a record key and a lookup for a peer use the same metric.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoutingKey([u8; 32]);

impl RoutingKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// SHA-256 of arbitrary input bytes.
    pub fn for_bytes(bytes: &[u8]) -> Self {
        Self(sha256(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Big-endian XOR distance to another key.
    pub fn distance(&self, other: &RoutingKey) -> Distance {
        let mut out = [0u8; 32];
        for i in 0..32 {
            out[i] = self.0[i] ^ other.0[i];
        }
        out
    }

    /// Common prefix length in bits, in `0..=256`.
    ///
    /// Equal keys agree on all 256 bits.
    pub fn common_prefix_len(&self, other: &RoutingKey) -> usize {
        let dist = self.distance(other);
        for (byte_idx, byte) in dist.iter().enumerate() {
            if *byte != 0 {
                return byte_idx * 8 + byte.leading_zeros() as usize;
            }
        }
        256
    }

    /// Whether bit `index` (0 = most significant) is set.
    pub fn bit(&self, index: usize) -> bool {
        let byte = index / 8;
        let mask = 0x80u8 >> (index % 8);
        self.0[byte] & mask != 0
    }
}

impl std::fmt::Debug for RoutingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RoutingKey({})", hex::encode(&self.0[..8]))
    }
}

impl std::fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

fn sha256(bytes: &[u8]) -> [u8; 32] {
    let digest = Sha256::digest(bytes);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// Compare two distances as big-endian integers.
pub fn distance_cmp(a: &Distance, b: &Distance) -> std::cmp::Ordering {
    for i in 0..32 {
        match a[i].cmp(&b[i]) {
            std::cmp::Ordering::Equal => continue,
            other => return other,
        }
    }
    std::cmp::Ordering::Equal
}

/// Stable ascending sort of contacts by XOR distance to `target`.
///
/// Stability makes the ordering total and deterministic: contacts at equal
/// distance keep their original (insertion) order.
pub fn sort_by_distance(contacts: &mut [Contact], target: &RoutingKey) {
    contacts.sort_by(|a, b| {
        let da = a.peer.routing_key().distance(target);
        let db = b.peer.routing_key().distance(target);
        distance_cmp(&da, &db)
    });
}

/// Generate a random routing key whose common prefix length with `local` is
/// exactly `cpl`. Used by the refresh loop to probe a specific bucket depth.
///
/// `cpl` must be below 256; depth-255 buckets are probed with a key differing
/// only in the last bit.
pub fn random_key_with_cpl(local: &RoutingKey, cpl: usize) -> RoutingKey {
    let cpl = cpl.min(255);
    let mut distance = [0u8; 32];
    if getrandom::getrandom(&mut distance).is_err() {
        // Degraded fallback: deterministic but still bucket-targeted.
        for (i, byte) in distance.iter_mut().enumerate() {
            *byte = local.0[i].wrapping_add((cpl.wrapping_mul(i + 1)) as u8);
        }
    }

    let byte_idx = cpl / 8;
    let bit_pos = cpl % 8;

    // Zero everything above the differing bit, then force that bit set so the
    // prefix length is exact; bits below stay random.
    for byte in distance.iter_mut().take(byte_idx) {
        *byte = 0;
    }
    let target_bit = 0x80u8 >> bit_pos;
    let random_mask = target_bit.wrapping_sub(1);
    distance[byte_idx] = target_bit | (distance[byte_idx] & random_mask);

    let mut out = [0u8; 32];
    for i in 0..32 {
        out[i] = local.0[i] ^ distance[i];
    }
    RoutingKey(out)
}

// ============================================================================
// Contacts
// ============================================================================

/// A dialable peer: identifier plus the addresses we know for it.
///
/// Addresses are `host:port` strings supplied by the host overlay's address
/// book or carried in wire messages.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Contact {
    pub peer: PeerId,
    pub addrs: Vec<String>,
}

impl Contact {
    pub fn new(peer: PeerId, addrs: Vec<String>) -> Self {
        Self { peer, addrs }
    }

    pub fn single(peer: PeerId, addr: impl Into<String>) -> Self {
        Self {
            peer,
            addrs: vec![addr.into()],
        }
    }

    pub fn primary_addr(&self) -> Option<&str> {
        self.addrs.first().map(String::as_str)
    }
}

// ============================================================================
// Keypairs
// ============================================================================

/// Ed25519 signing keypair. The node's [`PeerId`] is derived from the public
/// half; the TLS layer reuses the same key for its certificate.
#[derive(Clone)]
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(bytes),
        }
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId::from_public_key(&self.public_key_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing.sign(message)
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }
}

/// Verify an Ed25519 signature against raw public key bytes.
pub fn verify_signature(public_key: &[u8; 32], message: &[u8], signature: &[u8]) -> bool {
    let Ok(key) = VerifyingKey::from_bytes(public_key) else {
        return false;
    };
    let Ok(sig) = Signature::from_slice(signature) else {
        return false;
    };
    key.verify(message, &sig).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering;

    fn key_from_byte(first: u8) -> RoutingKey {
        let mut bytes = [0u8; 32];
        bytes[0] = first;
        RoutingKey::from_bytes(bytes)
    }

    #[test]
    fn routing_key_is_sha256() {
        let key = RoutingKey::for_bytes(b"hello world");
        let expected = Sha256::digest(b"hello world");
        assert_eq!(key.as_bytes().as_slice(), expected.as_slice());
    }

    #[test]
    fn equal_keys_have_zero_distance_and_full_cpl() {
        let key = RoutingKey::for_bytes(b"same");
        assert_eq!(key.distance(&key), [0u8; 32]);
        assert_eq!(key.common_prefix_len(&key), 256);
    }

    #[test]
    fn cpl_counts_leading_equal_bits() {
        let a = key_from_byte(0b0000_0000);
        let b = key_from_byte(0b1000_0000);
        assert_eq!(a.common_prefix_len(&b), 0);

        let c = key_from_byte(0b0001_0000);
        assert_eq!(a.common_prefix_len(&c), 3);

        let mut bytes = [0u8; 32];
        bytes[2] = 0b0100_0000;
        let d = RoutingKey::from_bytes(bytes);
        assert_eq!(a.common_prefix_len(&d), 17);
    }

    #[test]
    fn distance_cmp_orders_big_endian() {
        let mut smaller = [0u8; 32];
        smaller[1] = 1;
        let mut larger = [0u8; 32];
        larger[1] = 2;

        assert_eq!(distance_cmp(&smaller, &larger), Ordering::Less);
        assert_eq!(distance_cmp(&larger, &smaller), Ordering::Greater);
        assert_eq!(distance_cmp(&smaller, &smaller), Ordering::Equal);
    }

    #[test]
    fn sort_by_distance_is_stable_and_ascending() {
        let target = RoutingKey::for_bytes(b"target");
        let mut contacts: Vec<Contact> = (0u8..8)
            .map(|i| Contact::single(PeerId::from_bytes([i; 32]), format!("127.0.0.1:{}", 9000 + i as u16)))
            .collect();
        sort_by_distance(&mut contacts, &target);

        for pair in contacts.windows(2) {
            let da = pair[0].peer.routing_key().distance(&target);
            let db = pair[1].peer.routing_key().distance(&target);
            assert_ne!(distance_cmp(&da, &db), Ordering::Greater);
        }
    }

    #[test]
    fn random_key_hits_requested_cpl() {
        let local = RoutingKey::for_bytes(b"local node");
        for cpl in [0usize, 1, 7, 8, 63, 200, 255] {
            let key = random_key_with_cpl(&local, cpl);
            assert_eq!(local.common_prefix_len(&key), cpl, "cpl {cpl}");
        }
    }

    #[test]
    fn peer_id_from_public_key_is_hash() {
        let keypair = Keypair::generate();
        let id = keypair.peer_id();
        assert_eq!(
            id.as_bytes().as_slice(),
            Sha256::digest(keypair.public_key_bytes()).as_slice()
        );
    }

    #[test]
    fn signature_roundtrip() {
        let keypair = Keypair::generate();
        let sig = keypair.sign(b"message");
        assert!(verify_signature(
            &keypair.public_key_bytes(),
            b"message",
            &sig.to_bytes()
        ));
        assert!(!verify_signature(
            &keypair.public_key_bytes(),
            b"other message",
            &sig.to_bytes()
        ));
    }

    #[test]
    fn peer_id_hex_roundtrip() {
        let id = PeerId::from_bytes([0xab; 32]);
        let hex = id.to_hex();
        assert_eq!(PeerId::from_hex(&hex).unwrap(), id);
        assert!(PeerId::from_hex("abcd").is_err());
    }
}
