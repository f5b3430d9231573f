//! # Transport identity
//!
//! Self-signed Ed25519 certificates bound to peer ids, plus the custom
//! rustls verifiers that accept them. There is no CA: a connection is
//! authentic when the SHA-256 of the certificate's public key equals the
//! peer id the dialer asked for (carried in the SNI), and inbound peers are
//! identified the same way from their client certificate.
//!
//! The `dangerous()` rustls APIs are used deliberately; identity lives in
//! the key itself, not in a certificate chain.

use std::sync::Arc;

use anyhow::{Context, Result};
use quinn::ClientConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

use crate::keys::{Keypair, PeerId};

static CRYPTO_PROVIDER: std::sync::LazyLock<Arc<rustls::crypto::CryptoProvider>> =
    std::sync::LazyLock::new(|| Arc::new(rustls::crypto::ring::default_provider()));

/// QUIC ALPN for all kad connections.
pub const ALPN: &[u8] = b"kadmos";

/// Hex peer id split into two DNS labels (a label caps at 63 octets).
pub fn peer_id_to_sni(peer: &PeerId) -> String {
    let hex = peer.to_hex();
    format!("{}.{}", &hex[..32], &hex[32..])
}

fn peer_id_from_sni(sni: &str) -> Option<PeerId> {
    let hex_str: String = sni.split('.').collect();
    PeerId::from_hex(&hex_str).ok()
}

/// Self-signed certificate carrying the node's Ed25519 key.
pub fn generate_cert(
    keypair: &Keypair,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let secret_key = keypair.secret_bytes();

    // Minimal PKCS#8 wrapping of a raw Ed25519 secret key.
    const ED25519_OID: [u8; 5] = [0x06, 0x03, 0x2b, 0x65, 0x70];
    const PKCS8_VERSION: [u8; 3] = [0x02, 0x01, 0x00];
    let mut pkcs8 = Vec::with_capacity(48);
    pkcs8.extend_from_slice(&[0x30, 0x2e]);
    pkcs8.extend_from_slice(&PKCS8_VERSION);
    pkcs8.extend_from_slice(&[0x30, 0x05]);
    pkcs8.extend_from_slice(&ED25519_OID);
    pkcs8.extend_from_slice(&[0x04, 0x22, 0x04, 0x20]);
    pkcs8.extend_from_slice(&secret_key);

    let pkcs8_der = PrivatePkcs8KeyDer::from(pkcs8.clone());
    let key_pair = rcgen::KeyPair::try_from(&pkcs8_der)
        .context("failed to build Ed25519 key pair for certificate")?;

    let mut params = rcgen::CertificateParams::new(vec!["kadmos".to_string()])
        .context("failed to create certificate params")?;
    params.distinguished_name.push(
        rcgen::DnType::CommonName,
        rcgen::DnValue::Utf8String(keypair.peer_id().to_hex()),
    );

    let cert = params
        .self_signed(&key_pair)
        .context("failed to self-sign certificate")?;

    let key = PrivateKeyDer::Pkcs8(pkcs8.into());
    let cert_der = CertificateDer::from(cert.der().to_vec());
    Ok((vec![cert_der], key))
}

pub fn server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<quinn::ServerConfig> {
    let mut server_crypto = rustls::ServerConfig::builder()
        .with_client_cert_verifier(Arc::new(PeerClientCertVerifier))
        .with_single_cert(certs, key)
        .context("failed to create server TLS config")?;
    server_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut config = quinn::ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
            .context("failed to create QUIC server config")?,
    ));
    let transport = Arc::get_mut(&mut config.transport)
        .expect("transport config is exclusively owned after creation");
    transport.max_idle_timeout(Some(
        std::time::Duration::from_secs(60)
            .try_into()
            .expect("60 seconds fits a VarInt"),
    ));
    transport.max_concurrent_bidi_streams(64u32.into());

    Ok(config)
}

pub fn client_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<ClientConfig> {
    let mut client_crypto = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(PeerCertVerifier))
        .with_client_auth_cert(certs, key)
        .context("failed to create client TLS config")?;
    client_crypto.alpn_protocols = vec![ALPN.to_vec()];

    Ok(ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)
            .context("failed to create QUIC client config")?,
    )))
}

/// Raw public key bytes from a certificate's SubjectPublicKeyInfo.
fn public_key_from_cert(cert_der: &[u8]) -> Option<[u8; 32]> {
    use x509_parser::prelude::*;

    let (_, cert) = X509Certificate::from_der(cert_der).ok()?;
    let key_bytes = &cert.public_key().subject_public_key.data;
    if key_bytes.len() == 32 {
        let mut key = [0u8; 32];
        key.copy_from_slice(key_bytes);
        Some(key)
    } else {
        None
    }
}

/// The authenticated peer id of a live connection, from its certificate.
pub fn connection_peer_id(connection: &quinn::Connection) -> Option<PeerId> {
    let identity = connection.peer_identity()?;
    let certs: &Vec<rustls::pki_types::CertificateDer> = identity.downcast_ref()?;
    let cert_der = certs.first()?.as_ref();
    let public_key = public_key_from_cert(cert_der)?;
    Some(PeerId::from_public_key(&public_key))
}

/// Server-side verifier: any well-formed Ed25519 client certificate is
/// accepted; the peer id is derived from it after the handshake.
#[derive(Debug)]
struct PeerClientCertVerifier;

impl rustls::server::danger::ClientCertVerifier for PeerClientCertVerifier {
    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::server::danger::ClientCertVerified, rustls::Error> {
        public_key_from_cert(end_entity.as_ref())
            .map(|_| rustls::server::danger::ClientCertVerified::assertion())
            .ok_or(rustls::Error::InvalidCertificate(
                rustls::CertificateError::BadEncoding,
            ))
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![rustls::SignatureScheme::ED25519]
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }
}

/// Client-side verifier: the certificate's key must hash to the peer id the
/// dial asked for.
#[derive(Debug)]
struct PeerCertVerifier;

impl rustls::client::danger::ServerCertVerifier for PeerCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        let sni = match server_name {
            rustls::pki_types::ServerName::DnsName(name) => name.as_ref(),
            _ => {
                return Err(rustls::Error::InvalidCertificate(
                    rustls::CertificateError::ApplicationVerificationFailure,
                ));
            }
        };
        let expected = peer_id_from_sni(sni).ok_or(rustls::Error::InvalidCertificate(
            rustls::CertificateError::BadEncoding,
        ))?;

        let public_key = public_key_from_cert(end_entity.as_ref()).ok_or(
            rustls::Error::InvalidCertificate(rustls::CertificateError::BadEncoding),
        )?;
        if PeerId::from_public_key(&public_key) != expected {
            return Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::NotValidForName,
            ));
        }
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![rustls::SignatureScheme::ED25519]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn certificate_key_hashes_to_peer_id() {
        let keypair = Keypair::generate();
        let (certs, _key) = generate_cert(&keypair).expect("cert generation");
        let public_key = public_key_from_cert(certs[0].as_ref()).expect("key extraction");
        assert_eq!(PeerId::from_public_key(&public_key), keypair.peer_id());
    }

    #[test]
    fn sni_roundtrip() {
        let peer = Keypair::generate().peer_id();
        let sni = peer_id_to_sni(&peer);
        // Both labels fit DNS limits.
        assert!(sni.split('.').all(|label| label.len() <= 63));
        assert_eq!(peer_id_from_sni(&sni), Some(peer));
        assert_eq!(peer_id_from_sni("not-hex.either"), None);
    }

    #[test]
    fn configs_build() {
        let keypair = Keypair::generate();
        let (certs, key) = generate_cert(&keypair).expect("cert generation");
        server_config(certs.clone(), key.clone_key()).expect("server config");
        client_config(certs, key).expect("client config");
    }
}
