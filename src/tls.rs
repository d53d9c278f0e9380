use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore, StreamOwned};

use crate::TlsConfiguration;

use std::io::{BufReader, Cursor};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid server name: {0}")]
    DnsName(#[from] rustls::pki_types::InvalidDnsNameError),
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("No valid cert in chain")]
    NoValidCertInChain,
}

fn client_config(tls_config: &TlsConfiguration) -> Result<Arc<ClientConfig>, Error> {
    let config = match tls_config {
        TlsConfiguration::Simple {
            ca,
            alpn,
            danger_accept_invalid_certs,
        } => {
            let builder = ClientConfig::builder();

            let mut config = if *danger_accept_invalid_certs {
                // Certificate validation is off. Anyone on the path can
                // impersonate the broker, which is why this is opt in
                // and loud.
                warn!("Server certificate verification is disabled");
                builder
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(AcceptAnyCert::new()))
                    .with_no_client_auth()
            } else {
                let mut root_cert_store = RootCertStore::empty();
                match ca {
                    Some(ca) => {
                        let certs = rustls_pemfile::certs(&mut BufReader::new(Cursor::new(ca)))
                            .collect::<Result<Vec<_>, _>>()?;
                        for cert in certs {
                            root_cert_store
                                .add(cert)
                                .map_err(|_| Error::NoValidCertInChain)?;
                        }
                    }
                    None => {
                        let roots = rustls_native_certs::load_native_certs();
                        for cert in roots.certs {
                            // Platform stores routinely carry a few stale
                            // entries. Skip them instead of failing.
                            let _ = root_cert_store.add(cert);
                        }
                    }
                }

                if root_cert_store.is_empty() {
                    return Err(Error::NoValidCertInChain);
                }

                builder
                    .with_root_certificates(root_cert_store)
                    .with_no_client_auth()
            };

            if let Some(alpn) = alpn.as_ref() {
                config.alpn_protocols.extend_from_slice(alpn);
            }

            Arc::new(config)
        }
        TlsConfiguration::Rustls(tls_client_config) => tls_client_config.clone(),
    };

    Ok(config)
}

/// Wraps the connected TCP stream in TLS and drives the handshake to
/// completion. The stream's read and write timeouts bound each handshake
/// round trip.
pub fn tls_connect(
    host: &str,
    tls_config: &TlsConfiguration,
    tcp: TcpStream,
    timeout: Duration,
) -> Result<StreamOwned<ClientConnection, TcpStream>, Error> {
    let config = client_config(tls_config)?;
    let server_name = ServerName::try_from(host.to_owned())?;

    tcp.set_read_timeout(Some(timeout))?;
    tcp.set_write_timeout(Some(timeout))?;

    let conn = ClientConnection::new(config, server_name)?;
    let mut stream = StreamOwned::new(conn, tcp);

    while stream.conn.is_handshaking() {
        stream.conn.complete_io(&mut stream.sock)?;
    }

    Ok(stream)
}

/// Verifier that accepts any server certificate. Signatures are still
/// checked so the session is encrypted, just not authenticated.
#[derive(Debug)]
struct AcceptAnyCert {
    provider: CryptoProvider,
}

impl AcceptAnyCert {
    fn new() -> AcceptAnyCert {
        AcceptAnyCert {
            provider: rustls::crypto::ring::default_provider(),
        }
    }
}

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
