// Devices present certificates issued by the pairing record's own root, signed with SHA-1 and
// without a server name. None of that survives webpki validation, so the verifier accepts
// whatever the device sends; trust comes from the pairing exchange instead.
// See https://github.com/rustls/rustls/issues/578

use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use rustls::{
    ClientConfig, DigitallySignedStruct,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::CryptoProvider,
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime, pem::PemObject},
};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_rustls::{TlsConnector, client::TlsStream};
use tracing::{debug, warn};

use crate::{IdeviceError, IdeviceSocket, pairing_file::PairingFile};

#[cfg(not(any(feature = "aws-lc", feature = "ring")))]
compile_error!("enable either the `aws-lc` or the `ring` feature for a rustls crypto provider");

/// The transport currently held by a channel: the raw stream, or TLS layered over it
pub(crate) enum MaybeTlsStream {
    Plain(IdeviceSocket),
    Tls(Box<TlsStream<IdeviceSocket>>),
}

impl MaybeTlsStream {
    /// Sends close_notify and hands back the raw stream so plaintext can resume on it
    pub(crate) async fn downgrade(self) -> Result<IdeviceSocket, IdeviceError> {
        match self {
            Self::Plain(s) => Ok(s),
            Self::Tls(tls) => {
                let (mut inner, mut conn) = (*tls).into_inner();
                conn.send_close_notify();

                let mut pending = Vec::new();
                while conn.wants_write() {
                    conn.write_tls(&mut pending)?;
                }
                inner.write_all(&pending).await?;
                inner.flush().await?;
                // Only our close_notify is sent. The peer's reply is never read, and anything
                // rustls already buffered from it is dropped with `conn`.
                Ok(inner)
            }
        }
    }
}

impl std::fmt::Debug for MaybeTlsStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Plain(s) => f.debug_tuple("Plain").field(s).finish(),
            Self::Tls(tls) => f.debug_tuple("Tls").field(tls.get_ref().0).finish(),
        }
    }
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_flush(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Accepts any server certificate and signature
#[derive(Debug)]
struct AcceptDeviceCertificate {
    schemes: Vec<rustls::SignatureScheme>,
}

impl ServerCertVerifier for AcceptDeviceCertificate {
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

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.schemes.clone()
    }
}

pub(crate) fn crypto_provider() -> Arc<CryptoProvider> {
    if let Some(p) = CryptoProvider::get_default() {
        return p.clone();
    }

    #[cfg(feature = "aws-lc")]
    let provider = rustls::crypto::aws_lc_rs::default_provider();
    #[cfg(all(feature = "ring", not(feature = "aws-lc")))]
    let provider = rustls::crypto::ring::default_provider();

    if let Err(e) = CryptoProvider::install_default(provider.clone()) {
        // Another thread won the race, which is fine
        warn!("Failed to install the default crypto provider: {e:?}");
    }
    Arc::new(provider)
}

/// Builds a client config that authenticates with the pairing record's host certificate
fn client_config(pairing_file: &PairingFile) -> Result<ClientConfig, IdeviceError> {
    let host_key = pairing_file
        .host_private_key
        .as_deref()
        .ok_or(IdeviceError::InvalidArgument(
            "pairing record has no host private key",
        ))?;
    let private_key = PrivateKeyDer::from_pem_slice(host_key)?;

    let provider = crypto_provider();
    let verifier = AcceptDeviceCertificate {
        schemes: provider
            .signature_verification_algorithms
            .supported_schemes(),
    };

    let mut config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_client_auth_cert(vec![pairing_file.host_certificate.clone()], private_key)?;
    config.resumption = rustls::client::Resumption::disabled();

    debug!("Built TLS client config from pairing record");
    Ok(config)
}

pub(crate) fn connector(pairing_file: &PairingFile) -> Result<TlsConnector, IdeviceError> {
    Ok(TlsConnector::from(Arc::new(client_config(pairing_file)?)))
}

/// Lockdown never checks SNI; this is the name every client sends
pub(crate) fn server_name() -> Result<ServerName<'static>, IdeviceError> {
    Ok(ServerName::try_from("Device")?)
}
