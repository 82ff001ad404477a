//! USB Multiplexing Daemon (usbmuxd) client
//!
//! usbmuxd owns the physical USB and network links to devices. Clients ask it for the list of
//! attached devices, subscribe to attach/detach notifications, read and store pairing records,
//! and open byte streams to TCP ports on a device.

use std::{
    io,
    net::{IpAddr, SocketAddr},
    ops::ControlFlow,
    pin::Pin,
    str::FromStr,
};

#[cfg(not(unix))]
use std::net::{Ipv4Addr, SocketAddrV4};

use futures::{Stream, TryStreamExt};
use tracing::{debug, error, warn};

use crate::{
    Idevice, IdeviceError, IdeviceSocket, pairing_file::PairingFile, provider::UsbmuxdProvider,
};

pub mod des;
mod message;
mod raw_packet;

pub use message::{MuxerMessage, MuxerResultCode, wire_port};
pub use raw_packet::{MuxerHeader, MuxerMessageType, RawPacket};

/// How a device is attached
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Connection {
    Usb,
    /// Attached over the network. The address is `None` if usbmuxd reported one we can't decode.
    Network(Option<IpAddr>),
    Unknown(String),
}

/// A device known to usbmuxd
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbmuxdDevice {
    pub connection_type: Connection,
    /// Canonical UDID, with the dash restored for 24 character serials
    pub udid: String,
    /// The serial number exactly as usbmuxd reported it
    pub serial_number: String,
    /// usbmuxd's handle for the device, only valid while it stays attached
    pub device_id: u32,
    /// USB only
    pub location_id: Option<u32>,
    /// USB only
    pub product_id: Option<u32>,
}

impl UsbmuxdDevice {
    /// Creates a provider for connecting to services on this device
    pub fn to_provider(&self, addr: UsbmuxdAddr, label: impl Into<String>) -> UsbmuxdProvider {
        UsbmuxdProvider {
            addr,
            tag: 0,
            udid: self.udid.clone(),
            device_id: self.device_id,
            label: label.into(),
            pairing_file: None,
        }
    }
}

/// Notifications delivered after a successful `Listen`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsbmuxdListenEvent {
    Attached(UsbmuxdDevice),
    /// The usbmuxd device ID
    Detached(u32),
    /// The usbmuxd device ID
    Paired(u32),
}

/// Address of the usbmuxd service
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UsbmuxdAddr {
    #[cfg(unix)]
    UnixSocket(String),
    TcpSocket(SocketAddr),
    /// `<host>:<port>`, resolved each time a connection is opened
    TcpHost(String),
}

impl UsbmuxdAddr {
    pub const DEFAULT_PORT: u16 = 27015;
    pub const SOCKET_FILE: &'static str = "/var/run/usbmuxd";
    pub const ENV_VAR: &'static str = "USBMUXD_SOCKET_ADDRESS";

    /// Opens a stream to usbmuxd
    ///
    /// # Returns
    /// `None` if nothing is listening at the address, which is normal when no device has ever
    /// been attached
    ///
    /// # Errors
    /// Any other I/O failure
    pub async fn to_socket(&self) -> Result<Option<IdeviceSocket>, IdeviceError> {
        let res: io::Result<IdeviceSocket> = match self {
            #[cfg(unix)]
            Self::UnixSocket(path) => tokio::net::UnixStream::connect(path)
                .await
                .map(|s| Box::new(s) as IdeviceSocket),
            Self::TcpSocket(addr) => tokio::net::TcpStream::connect(addr)
                .await
                .map(|s| Box::new(s) as IdeviceSocket),
            Self::TcpHost(host) => tokio::net::TcpStream::connect(host.as_str())
                .await
                .map(|s| Box::new(s) as IdeviceSocket),
        };
        match res {
            Ok(s) => Ok(Some(s)),
            Err(e) if is_absent(&e) => {
                debug!("usbmuxd is not listening at {self:?}: {e}");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Opens a new muxer conversation
    ///
    /// # Arguments
    /// * `tag` - Starting tag; the first message is sent with `tag + 1`
    /// * `label` - Sent as the client name
    pub async fn connect(
        &self,
        tag: u32,
        label: impl Into<String>,
    ) -> Result<Option<UsbmuxdConnection>, IdeviceError> {
        Ok(self
            .to_socket()
            .await?
            .map(|socket| UsbmuxdConnection::new(socket, tag, label)))
    }

    /// Reads the address from `USBMUXD_SOCKET_ADDRESS`, falling back to the platform default
    ///
    /// # Errors
    /// The variable is set but can't be parsed
    pub fn from_env_var() -> Result<Self, IdeviceError> {
        match std::env::var(Self::ENV_VAR) {
            Ok(var) => var.parse(),
            Err(_) => Ok(Self::default()),
        }
    }
}

fn is_absent(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::NotFound
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::AddrNotAvailable
    )
}

impl FromStr for UsbmuxdAddr {
    type Err = IdeviceError;

    /// Accepts `unix:<path>`, a bare socket path on unix, or `<host>:<port>`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(path) = s.strip_prefix("unix:") {
            #[cfg(unix)]
            return Ok(Self::UnixSocket(path.to_string()));
            #[cfg(not(unix))]
            {
                let _ = path;
                return Err(IdeviceError::InvalidArgument(
                    "unix sockets are not supported on this platform",
                ));
            }
        }

        #[cfg(unix)]
        if !s.contains(':') {
            return Ok(Self::UnixSocket(s.to_string()));
        }

        match SocketAddr::from_str(s) {
            Ok(addr) => Ok(Self::TcpSocket(addr)),
            Err(parse_error) => match s.rsplit_once(':') {
                Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                    Ok(Self::TcpHost(s.to_string()))
                }
                _ => Err(parse_error.into()),
            },
        }
    }
}

impl Default for UsbmuxdAddr {
    /// The unix socket on unix, `127.0.0.1:27015` elsewhere
    fn default() -> Self {
        #[cfg(not(unix))]
        {
            Self::TcpSocket(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::new(127, 0, 0, 1),
                Self::DEFAULT_PORT,
            )))
        }
        #[cfg(unix)]
        Self::UnixSocket(Self::SOCKET_FILE.to_string())
    }
}

/// A single conversation with usbmuxd
///
/// Requests and replies strictly alternate. The tag is incremented for every message written
/// but replies are never matched against it.
#[derive(Debug)]
pub struct UsbmuxdConnection {
    socket: Option<IdeviceSocket>,
    tag: u32,
    label: String,
}

impl UsbmuxdConnection {
    pub const BINARY_PLIST_VERSION: u32 = 0;
    pub const XML_PLIST_VERSION: u32 = 1;

    pub fn new(socket: IdeviceSocket, tag: u32, label: impl Into<String>) -> Self {
        Self {
            socket: Some(socket),
            tag,
            label: label.into(),
        }
    }

    /// The tag of the most recently written message
    pub fn tag(&self) -> u32 {
        self.tag
    }

    /// Writes one message with the next tag
    pub async fn write_message(&mut self, message: &MuxerMessage) -> Result<(), IdeviceError> {
        self.tag = self.tag.wrapping_add(1);
        let dict = message.to_dictionary(&self.label)?;
        debug!(
            "Sending muxer message (tag {}): {}",
            self.tag,
            crate::pretty_print_dictionary(&dict)
        );
        let packet = RawPacket::new(
            &dict,
            Self::XML_PLIST_VERSION,
            MuxerMessageType::Plist,
            self.tag,
        )?;

        let mut socket = self
            .socket
            .take()
            .ok_or(IdeviceError::NoEstablishedConnection)?;
        packet.write_to(&mut socket).await?;

        self.socket = Some(socket);
        Ok(())
    }

    /// Reads one message
    ///
    /// # Returns
    /// `None` if usbmuxd closed the connection
    pub async fn read_message(&mut self) -> Result<Option<MuxerMessage>, IdeviceError> {
        let mut socket = self
            .socket
            .take()
            .ok_or(IdeviceError::NoEstablishedConnection)?;

        let packet = match RawPacket::read_from(&mut socket).await? {
            Some(p) => p,
            None => {
                debug!("usbmuxd closed the connection");
                return Ok(None);
            }
        };
        self.socket = Some(socket);

        let dict = packet.dictionary()?;
        debug!(
            "Received muxer message (tag {}): {}",
            packet.header.tag,
            crate::pretty_print_dictionary(&dict)
        );
        MuxerMessage::from_dictionary(dict).map(Some)
    }

    async fn request(&mut self, message: MuxerMessage) -> Result<MuxerMessage, IdeviceError> {
        self.write_message(&message).await?;
        self.read_message()
            .await?
            .ok_or(IdeviceError::ConnectionClosed)
    }

    async fn request_result(
        &mut self,
        message: MuxerMessage,
    ) -> Result<MuxerResultCode, IdeviceError> {
        match self.request(message).await? {
            MuxerMessage::Result(code) => Ok(code),
            other => {
                error!("Expected a result from usbmuxd, got {other:?}");
                Err(IdeviceError::UnexpectedResponse)
            }
        }
    }

    /// Lists attached devices
    pub async fn get_devices(&mut self) -> Result<Vec<UsbmuxdDevice>, IdeviceError> {
        match self.request(MuxerMessage::ListDevices).await? {
            MuxerMessage::DeviceList(devs) => Ok(devs.into_iter().map(Into::into).collect()),
            MuxerMessage::Result(code) => Err(IdeviceError::Muxer(code)),
            _ => Err(IdeviceError::UnexpectedResponse),
        }
    }

    /// Finds an attached device by UDID
    pub async fn get_device(&mut self, udid: &str) -> Result<UsbmuxdDevice, IdeviceError> {
        self.get_devices()
            .await?
            .into_iter()
            .find(|d| d.udid == udid || d.serial_number == udid)
            .ok_or(IdeviceError::DeviceNotFound)
    }

    /// Reads the host's system BUID
    pub async fn get_buid(&mut self) -> Result<String, IdeviceError> {
        match self.request(MuxerMessage::ReadBuid).await? {
            MuxerMessage::Buid(buid) => Ok(buid),
            MuxerMessage::Result(code) => Err(IdeviceError::Muxer(code)),
            _ => Err(IdeviceError::UnexpectedResponse),
        }
    }

    /// Reads the serialized pairing record stored for `udid`
    ///
    /// # Returns
    /// `None` if usbmuxd has no record for the device
    pub async fn get_pair_record_data(
        &mut self,
        udid: &str,
    ) -> Result<Option<Vec<u8>>, IdeviceError> {
        debug!("Getting pair record for {udid}");
        let res = self
            .request(MuxerMessage::ReadPairRecord {
                pair_record_id: udid.to_string(),
            })
            .await?;
        match res {
            MuxerMessage::PairRecordData(data) => Ok(Some(data)),
            MuxerMessage::Result(MuxerResultCode::BadDevice) => Ok(None),
            MuxerMessage::Result(code) => Err(IdeviceError::Muxer(code)),
            _ => Err(IdeviceError::UnexpectedResponse),
        }
    }

    /// Reads and parses the pairing record stored for `udid`
    pub async fn get_pair_record(
        &mut self,
        udid: &str,
    ) -> Result<Option<PairingFile>, IdeviceError> {
        self.get_pair_record_data(udid)
            .await?
            .map(|data| PairingFile::from_bytes(&data))
            .transpose()
    }

    /// Stores a serialized pairing record for `udid`
    pub async fn save_pair_record(
        &mut self,
        udid: &str,
        device_id: Option<u32>,
        pair_record: Vec<u8>,
    ) -> Result<(), IdeviceError> {
        let code = self
            .request_result(MuxerMessage::SavePairRecord {
                pair_record_id: udid.to_string(),
                pair_record_data: pair_record,
                device_id,
            })
            .await?;
        check(code)
    }

    pub async fn delete_pair_record(&mut self, udid: &str) -> Result<(), IdeviceError> {
        let code = self
            .request_result(MuxerMessage::DeletePairRecord {
                pair_record_id: udid.to_string(),
            })
            .await?;
        check(code)
    }

    /// Asks usbmuxd to proxy this connection to `port` on the device
    ///
    /// On success usbmuxd stops speaking its own protocol on the stream and forwards bytes
    /// verbatim, so the stream is returned to the caller.
    ///
    /// # Arguments
    /// * `device_id` - usbmuxd device ID
    /// * `port` - Device port in host byte order
    pub async fn connect(mut self, device_id: u32, port: u16) -> Result<IdeviceSocket, IdeviceError> {
        debug!("Connecting to device {device_id} on port {port}");
        let code = self
            .request_result(MuxerMessage::Connect {
                device_id,
                port_number: port,
            })
            .await?;
        check(code)?;
        self.socket.take().ok_or(IdeviceError::NoEstablishedConnection)
    }

    /// Like [`UsbmuxdConnection::connect`], wrapping the stream in a lockdown-framed channel
    pub async fn connect_to_device(
        self,
        device_id: u32,
        port: u16,
        label: impl Into<String>,
    ) -> Result<Idevice, IdeviceError> {
        Ok(Idevice::new(self.connect(device_id, port).await?, label))
    }

    /// Subscribes to device notifications
    ///
    /// The stream ends when usbmuxd closes the connection. Any message other than an attach,
    /// detach or paired notification is a fatal error.
    pub async fn listen(
        mut self,
    ) -> Result<
        Pin<Box<dyn Stream<Item = Result<UsbmuxdListenEvent, IdeviceError>> + Send>>,
        IdeviceError,
    > {
        check(self.request_result(MuxerMessage::Listen).await?)?;

        let stream = futures::stream::try_unfold(self, |mut conn| async move {
            let event = match conn.read_message().await? {
                None => return Ok(None),
                Some(MuxerMessage::DeviceAttached(dev)) => {
                    UsbmuxdListenEvent::Attached(dev.into())
                }
                Some(MuxerMessage::DeviceDetached { device_id }) => {
                    UsbmuxdListenEvent::Detached(device_id)
                }
                Some(MuxerMessage::DevicePaired { device_id }) => {
                    UsbmuxdListenEvent::Paired(device_id)
                }
                Some(other) => {
                    error!("Unexpected message while listening: {other:?}");
                    return Err(IdeviceError::UnexpectedResponse);
                }
            };
            Ok(Some((event, conn)))
        });
        Ok(Box::pin(stream))
    }

    /// Delivers notifications to `on_event` until it breaks or usbmuxd hangs up
    ///
    /// # Returns
    /// `true` if the callback asked to stop, `false` if usbmuxd closed the connection first
    pub async fn listen_with<F>(self, mut on_event: F) -> Result<bool, IdeviceError>
    where
        F: FnMut(UsbmuxdListenEvent) -> ControlFlow<()>,
    {
        let mut events = self.listen().await?;
        while let Some(event) = events.try_next().await? {
            if on_event(event).is_break() {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

fn check(code: MuxerResultCode) -> Result<(), IdeviceError> {
    match code {
        MuxerResultCode::Success => Ok(()),
        code => {
            error!("usbmuxd returned {code}");
            Err(IdeviceError::Muxer(code))
        }
    }
}

/// Muxer client that opens a fresh conversation per operation
///
/// If usbmuxd isn't running, reads return empty results and operations that need the daemon
/// fail with [`IdeviceError::UsbmuxdUnavailable`].
#[derive(Debug, Clone)]
pub struct UsbmuxdClient {
    addr: UsbmuxdAddr,
    label: String,
}

impl UsbmuxdClient {
    pub fn new(addr: UsbmuxdAddr, label: impl Into<String>) -> Self {
        Self {
            addr,
            label: label.into(),
        }
    }

    /// Uses the address from `USBMUXD_SOCKET_ADDRESS` or the platform default
    pub fn from_env(label: impl Into<String>) -> Result<Self, IdeviceError> {
        Ok(Self::new(UsbmuxdAddr::from_env_var()?, label))
    }

    pub fn addr(&self) -> &UsbmuxdAddr {
        &self.addr
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    async fn open(&self) -> Result<Option<UsbmuxdConnection>, IdeviceError> {
        self.addr.connect(0, self.label.as_str()).await
    }

    async fn open_required(&self) -> Result<UsbmuxdConnection, IdeviceError> {
        self.open().await?.ok_or_else(|| {
            warn!("usbmuxd is not available at {:?}", self.addr);
            IdeviceError::UsbmuxdUnavailable
        })
    }

    /// Lists attached devices, or nothing if usbmuxd isn't running
    pub async fn list_devices(&self) -> Result<Vec<UsbmuxdDevice>, IdeviceError> {
        match self.open().await? {
            Some(mut conn) => conn.get_devices().await,
            None => Ok(Vec::new()),
        }
    }

    /// Finds an attached device by UDID
    pub async fn get_device(&self, udid: &str) -> Result<Option<UsbmuxdDevice>, IdeviceError> {
        Ok(self
            .list_devices()
            .await?
            .into_iter()
            .find(|d| d.udid == udid || d.serial_number == udid))
    }

    /// Opens a byte stream to `port` on the device
    pub async fn connect(&self, device_id: u32, port: u16) -> Result<IdeviceSocket, IdeviceError> {
        self.open_required().await?.connect(device_id, port).await
    }

    /// Subscribes to device notifications
    pub async fn listen(
        &self,
    ) -> Result<
        Pin<Box<dyn Stream<Item = Result<UsbmuxdListenEvent, IdeviceError>> + Send>>,
        IdeviceError,
    > {
        self.open_required().await?.listen().await
    }

    /// Callback form of [`UsbmuxdClient::listen`]
    ///
    /// # Returns
    /// `true` if the callback asked to stop, `false` if usbmuxd closed the connection first or
    /// isn't running at all
    pub async fn listen_with<F>(&self, on_event: F) -> Result<bool, IdeviceError>
    where
        F: FnMut(UsbmuxdListenEvent) -> ControlFlow<()>,
    {
        match self.open().await? {
            Some(conn) => conn.listen_with(on_event).await,
            None => Ok(false),
        }
    }

    pub async fn read_buid(&self) -> Result<Option<String>, IdeviceError> {
        match self.open().await? {
            Some(mut conn) => conn.get_buid().await.map(Some),
            None => Ok(None),
        }
    }

    /// Reads the pairing record usbmuxd stores for `udid`
    pub async fn read_pair_record(&self, udid: &str) -> Result<Option<PairingFile>, IdeviceError> {
        match self.open().await? {
            Some(mut conn) => conn.get_pair_record(udid).await,
            None => Ok(None),
        }
    }

    /// Stores a pairing record, private keys included, in the system pairing store
    pub async fn save_pair_record(
        &self,
        udid: &str,
        device_id: Option<u32>,
        pairing_file: &PairingFile,
    ) -> Result<(), IdeviceError> {
        let data = pairing_file.serialize()?;
        self.open_required()
            .await?
            .save_pair_record(udid, device_id, data)
            .await
    }

    pub async fn delete_pair_record(&self, udid: &str) -> Result<(), IdeviceError> {
        self.open_required().await?.delete_pair_record(udid).await
    }
}
