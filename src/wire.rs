//! # Wire protocol
//!
//! Protobuf-encoded messages exchanged on `/<prefix>/kad/1.0.0` streams.
//! Field numbers are fixed; they are shared with other implementations of
//! the protocol and must never be renumbered. Each message on a stream is
//! preceded by an unsigned-varint byte length.
//!
//! | Type | Meaning |
//! |------|---------|
//! | `PUT_VALUE` | store a record on the receiver |
//! | `GET_VALUE` | fetch a record and/or closer peers |
//! | `ADD_PROVIDER` | advertise the sender serves a content key |
//! | `GET_PROVIDERS` | fetch providers and/or closer peers |
//! | `FIND_NODE` | fetch the receiver's closest peers to a key |
//! | `PING` | liveness echo |
//!
//! Inbound frames larger than [`MAX_MESSAGE_SIZE`] are refused before the
//! body is read.

use prost::Message as _;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::DhtError;
use crate::keys::{Contact, PeerId};

/// Upper bound on a single wire message, framing excluded.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024;

/// Request/response kind. Values are wire-fixed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum MessageType {
    PutValue = 0,
    GetValue = 1,
    AddProvider = 2,
    GetProviders = 3,
    FindNode = 4,
    Ping = 5,
}

/// Connection state hint attached to peers in responses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ConnectionType {
    NotConnected = 0,
    Connected = 1,
    CanConnect = 2,
    CannotConnect = 3,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Message {
    #[prost(enumeration = "MessageType", tag = "1")]
    pub r#type: i32,
    #[prost(bytes = "vec", tag = "2")]
    pub key: Vec<u8>,
    #[prost(message, optional, tag = "3")]
    pub record: Option<Record>,
    #[prost(int32, tag = "8")]
    pub cluster_level_raw: i32,
    #[prost(message, repeated, tag = "9")]
    pub closer_peers: Vec<Peer>,
    #[prost(message, repeated, tag = "10")]
    pub provider_peers: Vec<Peer>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Peer {
    #[prost(bytes = "vec", tag = "1")]
    pub id: Vec<u8>,
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub addrs: Vec<Vec<u8>>,
    #[prost(enumeration = "ConnectionType", tag = "3")]
    pub connection: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Record {
    #[prost(bytes = "vec", tag = "1")]
    pub key: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub value: Vec<u8>,
    #[prost(string, tag = "5")]
    pub time_received: String,
}

impl Message {
    pub fn new(r#type: MessageType, key: Vec<u8>) -> Self {
        Self {
            r#type: r#type as i32,
            key,
            record: None,
            cluster_level_raw: 0,
            closer_peers: Vec::new(),
            provider_peers: Vec::new(),
        }
    }

    pub fn ping() -> Self {
        Self::new(MessageType::Ping, Vec::new())
    }

    pub fn find_node(key: Vec<u8>) -> Self {
        Self::new(MessageType::FindNode, key)
    }

    pub fn get_value(key: Vec<u8>) -> Self {
        Self::new(MessageType::GetValue, key)
    }

    pub fn put_value(key: Vec<u8>, record: Record) -> Self {
        let mut msg = Self::new(MessageType::PutValue, key);
        msg.record = Some(record);
        msg
    }

    pub fn get_providers(key: Vec<u8>) -> Self {
        Self::new(MessageType::GetProviders, key)
    }

    pub fn add_provider(key: Vec<u8>, provider: Peer) -> Self {
        let mut msg = Self::new(MessageType::AddProvider, key);
        msg.provider_peers = vec![provider];
        msg
    }

    /// The message type, or `None` for an unknown enum value.
    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::try_from(self.r#type).ok()
    }

    /// Body encoding without the length prefix.
    pub fn encode_to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    /// Decode a body (no length prefix). Size must already be bounded.
    pub fn decode_bytes(bytes: &[u8]) -> Result<Self, DhtError> {
        Ok(Message::decode(bytes)?)
    }
}

impl Peer {
    pub fn from_contact(contact: &Contact) -> Self {
        Self {
            id: contact.peer.as_bytes().to_vec(),
            addrs: contact.addrs.iter().map(|a| a.as_bytes().to_vec()).collect(),
            connection: ConnectionType::NotConnected as i32,
        }
    }

    /// Convert back to a [`Contact`], dropping addresses that are not valid
    /// UTF-8. Returns `None` for a malformed peer id.
    pub fn to_contact(&self) -> Option<Contact> {
        let peer = PeerId::try_from_slice(&self.id)?;
        let addrs = self
            .addrs
            .iter()
            .filter_map(|a| String::from_utf8(a.clone()).ok())
            .collect();
        Some(Contact { peer, addrs })
    }
}

/// Convert a batch of wire peers, silently skipping malformed entries.
pub fn peers_to_contacts(peers: &[Peer]) -> Vec<Contact> {
    peers.iter().filter_map(Peer::to_contact).collect()
}

pub fn contacts_to_peers(contacts: &[Contact]) -> Vec<Peer> {
    contacts.iter().map(Peer::from_contact).collect()
}

// ============================================================================
// Framing
// ============================================================================

/// Write one length-prefixed message to a stream.
pub async fn write_message<W>(writer: &mut W, msg: &Message) -> Result<(), DhtError>
where
    W: AsyncWrite + Unpin,
{
    let body = msg.encode_to_vec();
    let mut prefix = Vec::with_capacity(4);
    prost::encoding::encode_varint(body.len() as u64, &mut prefix);
    writer.write_all(&prefix).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed message from a stream.
///
/// Returns `Ok(None)` on a clean end-of-stream before the first length byte
/// (the peer closed without sending, e.g. a bare liveness probe). A frame
/// announcing more than `max_len` bytes is refused without reading the body.
pub async fn read_message<R>(reader: &mut R, max_len: usize) -> Result<Option<Message>, DhtError>
where
    R: AsyncRead + Unpin,
{
    let len = match read_uvarint(reader).await? {
        Some(len) => len,
        None => return Ok(None),
    };
    if len as usize > max_len {
        return Err(DhtError::MalformedMessage(format!(
            "frame of {} bytes exceeds limit of {}",
            len, max_len
        )));
    }

    let mut body = vec![0u8; len as usize];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => DhtError::NoMessageReceived,
            _ => DhtError::Io(e.to_string()),
        })?;
    Message::decode_bytes(&body).map(Some)
}

/// Longest protocol id accepted on a stream header.
pub const MAX_PROTOCOL_LEN: usize = 256;

/// Write the stream's protocol id header (uvarint length + UTF-8 bytes).
pub async fn write_protocol<W>(writer: &mut W, protocol: &str) -> Result<(), DhtError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = protocol.as_bytes();
    let mut prefix = Vec::with_capacity(2);
    prost::encoding::encode_varint(bytes.len() as u64, &mut prefix);
    writer.write_all(&prefix).await?;
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the stream's protocol id header; `None` on clean EOF.
pub async fn read_protocol<R>(reader: &mut R) -> Result<Option<String>, DhtError>
where
    R: AsyncRead + Unpin,
{
    let len = match read_uvarint(reader).await? {
        Some(len) => len,
        None => return Ok(None),
    };
    if len as usize > MAX_PROTOCOL_LEN {
        return Err(DhtError::MalformedMessage("protocol id too long".into()));
    }
    let mut bytes = vec![0u8; len as usize];
    reader
        .read_exact(&mut bytes)
        .await
        .map_err(|e| DhtError::Io(e.to_string()))?;
    String::from_utf8(bytes)
        .map(Some)
        .map_err(|_| DhtError::MalformedMessage("protocol id is not UTF-8".into()))
}

/// Read an unsigned varint, `None` on clean EOF before the first byte.
async fn read_uvarint<R>(reader: &mut R) -> Result<Option<u64>, DhtError>
where
    R: AsyncRead + Unpin,
{
    let mut value = 0u64;
    let mut shift = 0u32;
    for i in 0..10 {
        let byte = match reader.read_u8().await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                if i == 0 {
                    return Ok(None);
                }
                return Err(DhtError::NoMessageReceived);
            }
            Err(e) => return Err(DhtError::Io(e.to_string())),
        };
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(Some(value));
        }
        shift += 7;
    }
    Err(DhtError::MalformedMessage("varint too long".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_contact(seed: u8) -> Contact {
        Contact::single(
            PeerId::from_bytes([seed; 32]),
            format!("127.0.0.1:{}", 9000 + seed as u16),
        )
    }

    #[test]
    fn find_node_matches_hand_encoded_bytes() {
        let msg = Message::find_node(b"abc".to_vec());
        // field 1 (varint) = 4, field 2 (bytes) = "abc"
        let expected = [0x08, 0x04, 0x12, 0x03, 0x61, 0x62, 0x63];
        assert_eq!(msg.encode_to_bytes(), expected);
    }

    #[test]
    fn put_value_defaults_are_omitted() {
        // PUT_VALUE = 0 is the enum default, so an empty message encodes to
        // nothing at all.
        let msg = Message::new(MessageType::PutValue, Vec::new());
        assert!(msg.encode_to_bytes().is_empty());
        let decoded = Message::decode_bytes(&[]).unwrap();
        assert_eq!(decoded.message_type(), Some(MessageType::PutValue));
    }

    #[test]
    fn roundtrip_all_message_types() {
        let record = Record {
            key: b"/ns/key".to_vec(),
            value: b"value".to_vec(),
            time_received: "2026-08-02T00:00:00Z".to_string(),
        };
        let messages = vec![
            Message::ping(),
            Message::find_node(b"target".to_vec()),
            Message::get_value(b"/ns/key".to_vec()),
            Message::put_value(b"/ns/key".to_vec(), record),
            Message::get_providers(b"cid".to_vec()),
            Message::add_provider(b"cid".to_vec(), Peer::from_contact(&sample_contact(3))),
        ];
        for msg in messages {
            let bytes = msg.encode_to_bytes();
            let decoded = Message::decode_bytes(&bytes).unwrap();
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn peer_contact_conversion() {
        let contact = sample_contact(7);
        let peer = Peer::from_contact(&contact);
        assert_eq!(peer.to_contact().unwrap(), contact);

        let bogus = Peer {
            id: vec![1, 2, 3],
            addrs: vec![],
            connection: 0,
        };
        assert!(bogus.to_contact().is_none());
    }

    #[test]
    fn malformed_bytes_rejected() {
        assert!(Message::decode_bytes(&[0xff, 0xff, 0xff]).is_err());
    }

    #[tokio::test]
    async fn framing_roundtrip() {
        let mut msg = Message::find_node(b"key".to_vec());
        msg.closer_peers = contacts_to_peers(&[sample_contact(1), sample_contact(2)]);

        let mut buf = Vec::new();
        write_message(&mut buf, &msg).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let decoded = read_message(&mut cursor, MAX_MESSAGE_SIZE).await.unwrap();
        assert_eq!(decoded, Some(msg));

        // A second read on the drained stream is a clean EOF.
        let eof = read_message(&mut cursor, MAX_MESSAGE_SIZE).await.unwrap();
        assert_eq!(eof, None);
    }

    #[tokio::test]
    async fn oversized_frame_refused_before_body() {
        let mut buf = Vec::new();
        prost::encoding::encode_varint((MAX_MESSAGE_SIZE + 1) as u64, &mut buf);
        buf.extend_from_slice(&[0u8; 64]);

        let mut cursor = std::io::Cursor::new(buf);
        let err = read_message(&mut cursor, MAX_MESSAGE_SIZE).await.unwrap_err();
        assert!(matches!(err, DhtError::MalformedMessage(_)));
    }

    #[tokio::test]
    async fn truncated_body_is_no_message() {
        let msg = Message::find_node(b"0123456789".to_vec());
        let mut buf = Vec::new();
        write_message(&mut buf, &msg).await.unwrap();
        buf.truncate(buf.len() - 4);

        let mut cursor = std::io::Cursor::new(buf);
        let err = read_message(&mut cursor, MAX_MESSAGE_SIZE).await.unwrap_err();
        assert!(matches!(err, DhtError::NoMessageReceived));
    }
}
