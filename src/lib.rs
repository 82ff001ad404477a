#![doc = include_str!("../README.md")]

pub mod ca;
pub mod pairing_file;
pub mod provider;
pub mod services;
mod tls;
pub mod usbmuxd;
mod util;

#[cfg(test)]
mod test_util;

pub use services::*;
pub use util::{pretty_print_dictionary, pretty_print_plist};

use std::io;

use provider::IdeviceProvider;
use thiserror::Error;
use tls::MaybeTlsStream;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

/// A trait combining all required characteristics for a device communication socket
///
/// Any asynchronous duplex byte stream qualifies: tokio's `TcpStream`, `UnixStream` and
/// `DuplexStream` all implement it.
pub trait ReadWrite: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug> ReadWrite for T {}

/// Type alias for boxed device connection sockets
pub type IdeviceSocket = Box<dyn ReadWrite>;

/// Interface for services that are started through lockdown and reached over a new muxer
/// connection
pub trait IdeviceService: Sized {
    /// Returns the service name as advertised by the device
    fn service_name() -> &'static str;

    /// Whether lockdown needs an authenticated session before it will start this service
    fn requires_session() -> bool {
        true
    }

    /// Wraps an already established (and, if requested, TLS-upgraded) connection
    fn from_stream(idevice: Idevice) -> impl Future<Output = Result<Self, IdeviceError>> + Send;

    /// Starts the service through lockdown and connects to it
    fn connect(
        provider: &dyn IdeviceProvider,
    ) -> impl Future<Output = Result<Self, IdeviceError>> + Send {
        async move {
            let idevice = provider::connect_service(
                provider,
                Self::service_name(),
                Self::requires_session(),
            )
            .await?;
            Self::from_stream(idevice).await
        }
    }
}

/// A plist channel to a lockdown-style service on the device
///
/// Messages are framed as a 4 byte big-endian length followed by the plist document. The
/// underlying stream lives in a single slot that is swapped in place when TLS is enabled or
/// disabled, so every later read and write goes through whatever transport is current.
///
/// Each operation takes the stream out of the slot for the duration of its I/O. If the
/// operation fails or its future is dropped, the stream is closed and the channel stays
/// unusable.
#[derive(Debug)]
pub struct Idevice {
    socket: Option<MaybeTlsStream>,
    label: String,
}

impl Idevice {
    /// Creates a new channel that owns `socket`
    ///
    /// # Arguments
    /// * `socket` - The established connection socket
    /// * `label` - Sent as the `Label` of every lockdown request
    pub fn new(socket: IdeviceSocket, label: impl Into<String>) -> Self {
        Self {
            socket: Some(MaybeTlsStream::Plain(socket)),
            label: label.into(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Whether a stream is still attached to this channel
    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    /// Whether TLS currently wraps the stream
    pub fn is_tls_active(&self) -> bool {
        matches!(self.socket, Some(MaybeTlsStream::Tls(_)))
    }

    fn take_socket(&mut self) -> Result<MaybeTlsStream, IdeviceError> {
        self.socket.take().ok_or(IdeviceError::NoEstablishedConnection)
    }

    /// Sends a plist dictionary as a single length-prefixed XML frame
    ///
    /// # Errors
    /// Returns `IdeviceError` if serialization or transmission fails
    pub async fn send_plist(&mut self, message: &plist::Dictionary) -> Result<(), IdeviceError> {
        debug!("Sending plist: {}", pretty_print_dictionary(message));

        let payload = util::plist_to_xml_bytes(message)?;
        let len =
            u32::try_from(payload.len()).map_err(|_| IdeviceError::FrameTooLarge(payload.len()))?;

        let mut frame = Vec::with_capacity(4 + payload.len());
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(&payload);

        let mut socket = self.take_socket()?;
        socket.write_all(&frame).await?;
        socket.flush().await?;
        self.socket = Some(socket);
        Ok(())
    }

    /// Reads one plist frame
    ///
    /// # Returns
    /// `None` if the peer closed the stream before a whole frame arrived. No partial message is
    /// ever returned.
    ///
    /// # Errors
    /// Returns `IdeviceError` if reading fails or the payload isn't a plist dictionary
    pub async fn read_plist(&mut self) -> Result<Option<plist::Dictionary>, IdeviceError> {
        let mut socket = self.take_socket()?;

        let mut len_buf = [0u8; 4];
        if !util::read_exact_or_eof(&mut socket, &mut len_buf).await? {
            debug!("Peer closed the connection before sending a frame header");
            return Ok(None);
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        trace!("Reading {len} byte plist frame");

        let mut body = vec![0; len];
        if !util::read_exact_or_eof(&mut socket, &mut body).await? {
            debug!("Peer closed the connection mid-frame");
            return Ok(None);
        }
        self.socket = Some(socket);

        let res: plist::Dictionary = plist::from_bytes(&body)?;
        debug!("Received plist: {}", pretty_print_dictionary(&res));
        Ok(Some(res))
    }

    /// Sends raw bytes to the device
    pub async fn send_raw(&mut self, message: &[u8]) -> Result<(), IdeviceError> {
        let mut socket = self.take_socket()?;
        socket.write_all(message).await?;
        socket.flush().await?;
        self.socket = Some(socket);
        Ok(())
    }

    /// Reads exactly `len` bytes from the device
    ///
    /// # Returns
    /// `None` if the stream closed first
    pub async fn read_raw(&mut self, len: usize) -> Result<Option<Vec<u8>>, IdeviceError> {
        let mut socket = self.take_socket()?;
        let mut buf = vec![0; len];
        if !util::read_exact_or_eof(&mut socket, &mut buf).await? {
            return Ok(None);
        }
        self.socket = Some(socket);
        Ok(Some(buf))
    }

    /// Upgrades the connection to TLS in place using the pairing record's host identity
    ///
    /// # Errors
    /// Returns `IdeviceError` if TLS is already active, the credentials are invalid, or the
    /// handshake fails. A failed handshake leaves the channel unusable.
    pub async fn start_tls(
        &mut self,
        pairing_file: &pairing_file::PairingFile,
    ) -> Result<(), IdeviceError> {
        if self.is_tls_active() {
            return Err(IdeviceError::TlsAlreadyActive);
        }
        let connector = tls::connector(pairing_file)?;

        let socket = match self.take_socket()? {
            MaybeTlsStream::Plain(s) => s,
            tls @ MaybeTlsStream::Tls(_) => {
                self.socket = Some(tls);
                return Err(IdeviceError::TlsAlreadyActive);
            }
        };

        debug!("Starting TLS handshake");
        let stream = connector.connect(tls::server_name()?, socket).await?;
        self.socket = Some(MaybeTlsStream::Tls(Box::new(stream)));
        debug!("TLS is active");
        Ok(())
    }

    /// Ends TLS and resumes plaintext on the same stream
    ///
    /// Does nothing if TLS isn't active. Sends close_notify without waiting for the peer's, so the
    /// peer must not send TLS records after the exchange that ended the session.
    pub async fn stop_tls(&mut self) -> Result<(), IdeviceError> {
        if !self.is_tls_active() {
            return Ok(());
        }
        let socket = self.take_socket()?;
        let plain = socket.downgrade().await?;
        self.socket = Some(MaybeTlsStream::Plain(plain));
        debug!("TLS disabled, continuing in plaintext");
        Ok(())
    }

    /// Releases the stream without closing it, transferring ownership to the caller
    ///
    /// If TLS is active the returned stream is the TLS stream.
    pub fn into_inner(self) -> Result<IdeviceSocket, IdeviceError> {
        match self.socket {
            Some(MaybeTlsStream::Plain(s)) => Ok(s),
            Some(tls @ MaybeTlsStream::Tls(_)) => Ok(Box::new(tls)),
            None => Err(IdeviceError::NoEstablishedConnection),
        }
    }
}

/// Comprehensive error type for all device communication failures
#[derive(Error, Debug)]
#[repr(i32)]
#[non_exhaustive]
pub enum IdeviceError {
    #[error("device socket io failed")]
    Socket(#[from] io::Error) = -1,
    #[error("PEM parse failed")]
    PemParseFailed(#[from] rustls::pki_types::pem::Error) = -2,
    #[error("TLS error")]
    Rustls(#[from] rustls::Error) = -3,
    #[error("invalid TLS server name")]
    InvalidDnsName(#[from] rustls::pki_types::InvalidDnsNameError) = -4,
    #[error("io on plist")]
    Plist(#[from] plist::Error) = -5,
    #[error("can't convert bytes to utf8")]
    Utf8(#[from] std::string::FromUtf8Error) = -6,
    #[error("unexpected response from device")]
    UnexpectedResponse = -7,
    #[error("lockdown returned {0}")]
    Lockdown(#[from] services::lockdown::LockdownError) = -8,
    #[error("usbmuxd returned {0}")]
    Muxer(usbmuxd::MuxerResultCode) = -9,
    #[error("expected lockdown but the service identified as `{0}`")]
    InvalidServiceType(String) = -10,
    #[error("no established connection")]
    NoEstablishedConnection = -11,
    #[error("the device closed the connection")]
    ConnectionClosed = -12,
    #[error("usbmuxd is not running")]
    UsbmuxdUnavailable = -13,
    #[error("not found")]
    NotFound = -14,
    #[error("service not found")]
    ServiceNotFound = -15,
    #[error("TLS is already active on this connection")]
    TlsAlreadyActive = -16,
    #[error("frame of {0} bytes is too large")]
    FrameTooLarge(usize) = -17,
    #[error("unsupported usbmuxd message type {0}")]
    UnsupportedMuxerMessage(u32) = -18,
    #[error("malformed usbmuxd message")]
    MalformedMuxerMessage = -19,
    #[error("device not found")]
    DeviceNotFound = -20,
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str) = -21,
    #[error("cannot parse usbmuxd address")]
    AddrParseError(#[from] std::net::AddrParseError) = -22,
    #[error("RSA error")]
    Rsa(#[from] rsa::Error) = -23,
    #[error("PKCS#1 encoding error")]
    Pkcs1(#[from] rsa::pkcs1::Error) = -24,
    #[error("public key info error")]
    Spki(#[from] x509_cert::spki::Error) = -25,
    #[error("DER encoding error")]
    Der(#[from] x509_cert::der::Error) = -26,
    #[error("certificate builder error")]
    CertificateBuilder(#[from] x509_cert::builder::Error) = -27,
}

impl IdeviceError {
    /// A stable numeric code for the error kind
    pub fn code(&self) -> i32 {
        match self {
            IdeviceError::Socket(_) => -1,
            IdeviceError::PemParseFailed(_) => -2,
            IdeviceError::Rustls(_) => -3,
            IdeviceError::InvalidDnsName(_) => -4,
            IdeviceError::Plist(_) => -5,
            IdeviceError::Utf8(_) => -6,
            IdeviceError::UnexpectedResponse => -7,
            IdeviceError::Lockdown(_) => -8,
            IdeviceError::Muxer(_) => -9,
            IdeviceError::InvalidServiceType(_) => -10,
            IdeviceError::NoEstablishedConnection => -11,
            IdeviceError::ConnectionClosed => -12,
            IdeviceError::UsbmuxdUnavailable => -13,
            IdeviceError::NotFound => -14,
            IdeviceError::ServiceNotFound => -15,
            IdeviceError::TlsAlreadyActive => -16,
            IdeviceError::FrameTooLarge(_) => -17,
            IdeviceError::UnsupportedMuxerMessage(_) => -18,
            IdeviceError::MalformedMuxerMessage => -19,
            IdeviceError::DeviceNotFound => -20,
            IdeviceError::InvalidArgument(_) => -21,
            IdeviceError::AddrParseError(_) => -22,
            IdeviceError::Rsa(_) => -23,
            IdeviceError::Pkcs1(_) => -24,
            IdeviceError::Spki(_) => -25,
            IdeviceError::Der(_) => -26,
            IdeviceError::CertificateBuilder(_) => -27,
        }
    }
}
