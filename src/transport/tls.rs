//! TLS for the framed control transport
//!
//! The server generates a fresh self-signed certificate on every start;
//! clients never verify it. A connection that wants TLS announces itself to
//! the connection muxer with a single sentinel byte before the handshake.

use std::io;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio::io::AsyncWriteExt;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use super::{boxed, AsyncStream, BoxedStream};

/// Sentinel byte written before a TLS ClientHello on the shared bind port
pub const TLS_SENTINEL: u8 = 0x17;

/// First byte of a plain TLS handshake record
pub const TLS_HANDSHAKE_BYTE: u8 = 0x16;

/// Build a server TLS config around a throwaway self-signed certificate.
/// Regenerated on each start; peers must not pin it.
pub fn self_signed_server_config() -> anyhow::Result<Arc<rustls::ServerConfig>> {
    let cert = rcgen::generate_simple_self_signed(vec!["portway".to_string()])?;
    let cert_der = CertificateDer::from(cert.serialize_der()?);
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.serialize_private_key_der()));

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)?;
    Ok(Arc::new(config))
}

/// Certificate verifier that accepts anything. The transport cert is
/// self-signed and rotates every server start, so there is nothing to check;
/// authentication happens at login with the shared token.
#[derive(Debug)]
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

fn insecure_client_config() -> Arc<rustls::ClientConfig> {
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
        .with_no_client_auth();
    Arc::new(config)
}

/// Server side: accept a TLS session on a stream whose sentinel byte has
/// already been consumed by the muxer.
pub async fn accept_tls<S>(config: Arc<rustls::ServerConfig>, stream: S) -> io::Result<BoxedStream>
where
    S: AsyncStream + 'static,
{
    let acceptor = TlsAcceptor::from(config);
    let tls = acceptor.accept(stream).await?;
    Ok(boxed(tls))
}

/// Client side: write the sentinel byte, then run the TLS handshake with
/// verification disabled.
pub async fn connect_tls<S>(stream: S) -> io::Result<BoxedStream>
where
    S: AsyncStream + 'static,
{
    let mut stream = stream;
    stream.write_all(&[TLS_SENTINEL]).await?;
    stream.flush().await?;

    let connector = TlsConnector::from(insecure_client_config());
    let name = ServerName::try_from("portway")
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?
        .to_owned();
    let tls = connector.connect(name, stream).await?;
    Ok(boxed(tls))
}
