//! # Records, validators, and selectors
//!
//! A record is an opaque `(key, value)` pair. Keys are path-like
//! (`/<namespace>/<suffix>`); the namespace picks which [`Validator`] accepts
//! or rejects a record and which [`Selector`] chooses the best among
//! competing valid ones. Both registries are construction-time configuration;
//! the core never prescribes a record schema.
//!
//! The built-in `pk` namespace stores self-certifying signed records:
//! the key suffix is the hex peer id of the signer, and the value carries
//! the public key, a sequence number, and an Ed25519 signature. It is both a
//! usable default and the reference for writing custom validators.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::error::DhtError;
use crate::keys::{verify_signature, Keypair, PeerId};
use crate::wire;

/// Domain separation prefix for `pk` record signatures.
const PK_RECORD_SIGNATURE_DOMAIN: &[u8] = b"kadmos-pk-record-v1:";

/// Layout of a `pk` value: public key, sequence number, signature, payload.
const PK_PUBKEY_LEN: usize = 32;
const PK_SEQ_LEN: usize = 8;
const PK_SIG_LEN: usize = 64;
const PK_HEADER_LEN: usize = PK_PUBKEY_LEN + PK_SEQ_LEN + PK_SIG_LEN;

// ============================================================================
// Records
// ============================================================================

/// A stored or in-flight record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    /// When the local node received this record; stamped on arrival, absent
    /// on records we are about to publish.
    pub time_received: Option<SystemTime>,
}

impl Record {
    pub fn new(key: Vec<u8>, value: Vec<u8>) -> Self {
        Self {
            key,
            value,
            time_received: None,
        }
    }

    pub fn stamped(key: Vec<u8>, value: Vec<u8>, now: SystemTime) -> Self {
        Self {
            key,
            value,
            time_received: Some(now),
        }
    }

    pub fn to_wire(&self) -> wire::Record {
        wire::Record {
            key: self.key.clone(),
            value: self.value.clone(),
            time_received: self
                .time_received
                .map(|t| humantime::format_rfc3339(t).to_string())
                .unwrap_or_default(),
        }
    }

    pub fn from_wire(record: &wire::Record) -> Self {
        Self {
            key: record.key.clone(),
            value: record.value.clone(),
            time_received: humantime::parse_rfc3339(&record.time_received).ok(),
        }
    }
}

/// Extract the namespace from a `/<namespace>/<suffix>` key.
pub fn namespace(key: &[u8]) -> Option<&str> {
    let text = std::str::from_utf8(key).ok()?;
    let rest = text.strip_prefix('/')?;
    let (ns, suffix) = rest.split_once('/')?;
    if ns.is_empty() || suffix.is_empty() {
        return None;
    }
    Some(ns)
}

// ============================================================================
// Validators and selectors
// ============================================================================

/// Accepts or rejects a record for a namespace.
pub trait Validator: Send + Sync {
    fn validate(&self, key: &[u8], value: &[u8]) -> Result<(), DhtError>;
}

/// Chooses the best among competing valid records for a namespace.
/// Returns the index of the winner.
pub trait Selector: Send + Sync {
    fn select(&self, key: &[u8], values: &[&[u8]]) -> usize;
}

/// Per-namespace validator registry. Records in an unregistered namespace are
/// invalid.
#[derive(Clone, Default)]
pub struct Validators {
    map: HashMap<String, Arc<dyn Validator>>,
}

impl Validators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, ns: impl Into<String>, validator: Arc<dyn Validator>) {
        self.map.insert(ns.into(), validator);
    }

    pub fn validate(&self, key: &[u8], value: &[u8]) -> Result<(), DhtError> {
        let ns = namespace(key)
            .ok_or_else(|| DhtError::InvalidRecord("key has no namespace".into()))?;
        let validator = self
            .map
            .get(ns)
            .ok_or_else(|| DhtError::InvalidRecord(format!("no validator for namespace {ns:?}")))?;
        validator.validate(key, value)
    }
}

/// Per-namespace selector registry. Falls back to first-wins when a
/// namespace has no registered selector.
#[derive(Clone, Default)]
pub struct Selectors {
    map: HashMap<String, Arc<dyn Selector>>,
}

impl Selectors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, ns: impl Into<String>, selector: Arc<dyn Selector>) {
        self.map.insert(ns.into(), selector);
    }

    pub fn select(&self, key: &[u8], values: &[&[u8]]) -> usize {
        if values.len() < 2 {
            return 0;
        }
        match namespace(key).and_then(|ns| self.map.get(ns)) {
            Some(selector) => selector.select(key, values).min(values.len() - 1),
            None => 0,
        }
    }
}

// ============================================================================
// Built-in `pk` namespace
// ============================================================================

/// Parsed view of a `pk` record value.
struct PkRecord<'a> {
    public_key: &'a [u8; 32],
    seq: u64,
    signature: &'a [u8],
    payload: &'a [u8],
}

fn parse_pk_value(value: &[u8]) -> Result<PkRecord<'_>, DhtError> {
    if value.len() < PK_HEADER_LEN {
        return Err(DhtError::InvalidRecord("pk value too short".into()));
    }
    let public_key: &[u8; 32] = value[..PK_PUBKEY_LEN].try_into().expect("length checked");
    let seq_bytes: [u8; PK_SEQ_LEN] = value[PK_PUBKEY_LEN..PK_PUBKEY_LEN + PK_SEQ_LEN]
        .try_into()
        .expect("length checked");
    Ok(PkRecord {
        public_key,
        seq: u64::from_be_bytes(seq_bytes),
        signature: &value[PK_PUBKEY_LEN + PK_SEQ_LEN..PK_HEADER_LEN],
        payload: &value[PK_HEADER_LEN..],
    })
}

fn pk_signed_bytes(key: &[u8], seq: u64, payload: &[u8]) -> Vec<u8> {
    let mut out =
        Vec::with_capacity(PK_RECORD_SIGNATURE_DOMAIN.len() + key.len() + PK_SEQ_LEN + payload.len());
    out.extend_from_slice(PK_RECORD_SIGNATURE_DOMAIN);
    out.extend_from_slice(key);
    out.extend_from_slice(&seq.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Build a signed `pk` record for `payload`, keyed by the signer's peer id.
pub fn sign_pk_record(keypair: &Keypair, seq: u64, payload: &[u8]) -> Record {
    let key = format!("/pk/{}", keypair.peer_id().to_hex()).into_bytes();
    let signature = keypair.sign(&pk_signed_bytes(&key, seq, payload));

    let mut value = Vec::with_capacity(PK_HEADER_LEN + payload.len());
    value.extend_from_slice(&keypair.public_key_bytes());
    value.extend_from_slice(&seq.to_be_bytes());
    value.extend_from_slice(&signature.to_bytes());
    value.extend_from_slice(payload);
    Record::new(key, value)
}

/// Validator for the `pk` namespace: the key suffix must be the hex peer id
/// of the embedded public key, and the signature must cover key, sequence
/// number, and payload.
pub struct PkValidator;

impl Validator for PkValidator {
    fn validate(&self, key: &[u8], value: &[u8]) -> Result<(), DhtError> {
        let parsed = parse_pk_value(value)?;

        let text = std::str::from_utf8(key)
            .map_err(|_| DhtError::InvalidRecord("pk key is not UTF-8".into()))?;
        let suffix = text
            .strip_prefix("/pk/")
            .ok_or_else(|| DhtError::InvalidRecord("pk key has wrong prefix".into()))?;
        let expected = PeerId::from_public_key(parsed.public_key);
        if suffix != expected.to_hex() {
            return Err(DhtError::InvalidRecord(
                "pk key does not match embedded public key".into(),
            ));
        }

        let signed = pk_signed_bytes(key, parsed.seq, parsed.payload);
        if !verify_signature(parsed.public_key, &signed, parsed.signature) {
            return Err(DhtError::InvalidRecord("pk signature invalid".into()));
        }
        Ok(())
    }
}

/// Selector for the `pk` namespace: highest sequence number wins; ties keep
/// the earliest candidate.
pub struct PkSelector;

impl Selector for PkSelector {
    fn select(&self, _key: &[u8], values: &[&[u8]]) -> usize {
        let mut best = 0;
        let mut best_seq = parse_pk_value(values[0]).map(|r| r.seq).unwrap_or(0);
        for (idx, value) in values.iter().enumerate().skip(1) {
            let seq = parse_pk_value(value).map(|r| r.seq).unwrap_or(0);
            if seq > best_seq {
                best = idx;
                best_seq = seq;
            }
        }
        best
    }
}

/// Registries with the built-in `pk` namespace installed.
pub fn default_validators() -> Validators {
    let mut validators = Validators::new();
    validators.register("pk", Arc::new(PkValidator));
    validators
}

pub fn default_selectors() -> Selectors {
    let mut selectors = Selectors::new();
    selectors.register("pk", Arc::new(PkSelector));
    selectors
}

// ============================================================================
// Persisted form
// ============================================================================

/// Datastore encoding of a local record.
#[derive(Serialize, Deserialize)]
pub struct StoredRecord {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    /// Seconds since the Unix epoch at receipt time.
    pub received_unix_secs: Option<u64>,
}

impl StoredRecord {
    pub fn from_record(record: &Record) -> Self {
        Self {
            key: record.key.clone(),
            value: record.value.clone(),
            received_unix_secs: record.time_received.and_then(|t| {
                t.duration_since(SystemTime::UNIX_EPOCH).ok().map(|d| d.as_secs())
            }),
        }
    }

    pub fn into_record(self) -> Record {
        Record {
            key: self.key,
            value: self.value,
            time_received: self
                .received_unix_secs
                .map(|s| SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(s)),
        }
    }
}

/// Datastore key for a local record.
pub fn record_datastore_key(key: &[u8]) -> String {
    format!("/records/{}", hex::encode(key))
}

/// Local record storage on the host datastore.
pub struct RecordStore {
    datastore: Arc<dyn crate::host::Datastore>,
}

impl RecordStore {
    pub fn new(datastore: Arc<dyn crate::host::Datastore>) -> Self {
        Self { datastore }
    }

    pub async fn get(&self, key: &[u8]) -> Result<Option<Record>, DhtError> {
        let Some(blob) = self.datastore.get(&record_datastore_key(key)).await? else {
            return Ok(None);
        };
        let stored: StoredRecord =
            bincode::deserialize(&blob).map_err(|e| DhtError::Datastore(e.to_string()))?;
        Ok(Some(stored.into_record()))
    }

    pub async fn put(&self, record: &Record) -> Result<(), DhtError> {
        let blob = bincode::serialize(&StoredRecord::from_record(record))
            .map_err(|e| DhtError::Datastore(e.to_string()))?;
        self.datastore.put(&record_datastore_key(&record.key), blob).await
    }

    pub async fn remove(&self, key: &[u8]) -> Result<(), DhtError> {
        self.datastore.delete(&record_datastore_key(key)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_extraction() {
        assert_eq!(namespace(b"/pk/abcd"), Some("pk"));
        assert_eq!(namespace(b"/ipns/some/long/path"), Some("ipns"));
        assert_eq!(namespace(b"pk/abcd"), None);
        assert_eq!(namespace(b"/pk"), None);
        assert_eq!(namespace(b"//x"), None);
        assert_eq!(namespace(&[0xff, 0xfe]), None);
    }

    #[test]
    fn pk_record_roundtrip_validates() {
        let keypair = Keypair::generate();
        let record = sign_pk_record(&keypair, 1, b"payload");

        let validators = default_validators();
        validators.validate(&record.key, &record.value).unwrap();
    }

    #[test]
    fn pk_record_tampering_is_rejected() {
        let keypair = Keypair::generate();
        let record = sign_pk_record(&keypair, 1, b"payload");
        let validators = default_validators();

        let mut tampered = record.value.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 0xff;
        assert!(validators.validate(&record.key, &tampered).is_err());

        // Key re-pointed at a different signer.
        let other = Keypair::generate();
        let wrong_key = format!("/pk/{}", other.peer_id().to_hex()).into_bytes();
        assert!(validators.validate(&wrong_key, &record.value).is_err());
    }

    #[test]
    fn unregistered_namespace_is_invalid() {
        let validators = default_validators();
        let err = validators.validate(b"/mystery/x", b"value").unwrap_err();
        assert!(matches!(err, DhtError::InvalidRecord(_)));
    }

    #[test]
    fn pk_selector_prefers_highest_seq() {
        let keypair = Keypair::generate();
        let old = sign_pk_record(&keypair, 3, b"old");
        let new = sign_pk_record(&keypair, 7, b"new");

        let selectors = default_selectors();
        let values: Vec<&[u8]> = vec![&old.value, &new.value];
        assert_eq!(selectors.select(&old.key, &values), 1);

        let reversed: Vec<&[u8]> = vec![&new.value, &old.value];
        assert_eq!(selectors.select(&old.key, &reversed), 0);
    }

    #[test]
    fn selector_falls_back_to_first() {
        let selectors = Selectors::new();
        let values: Vec<&[u8]> = vec![b"a", b"b"];
        assert_eq!(selectors.select(b"/unknown/k", &values), 0);
    }

    #[test]
    fn wire_record_conversion_preserves_timestamp() {
        let now = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_770_000_000);
        let record = Record::stamped(b"/pk/k".to_vec(), b"v".to_vec(), now);
        let wire = record.to_wire();
        assert!(!wire.time_received.is_empty());
        let back = Record::from_wire(&wire);
        assert_eq!(back.time_received, Some(now));
    }
}
