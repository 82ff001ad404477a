//! usbmuxd wire framing
//!
//! Every message is a 16 byte little-endian header followed by an XML plist payload.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::{IdeviceError, util};

/// Header-level message kinds
///
/// Modern usbmuxd always sends `Plist` and keeps the logical type inside the payload. The
/// others belong to the legacy binary protocol and are not decoded.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxerMessageType {
    Result = 1,
    Connect = 2,
    Listen = 3,
    DeviceAdd = 4,
    DeviceRemove = 5,
    DevicePaired = 6,
    Plist = 8,
}

impl TryFrom<u32> for MuxerMessageType {
    type Error = IdeviceError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::Result,
            2 => Self::Connect,
            3 => Self::Listen,
            4 => Self::DeviceAdd,
            5 => Self::DeviceRemove,
            6 => Self::DevicePaired,
            8 => Self::Plist,
            v => return Err(IdeviceError::UnsupportedMuxerMessage(v)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MuxerHeader {
    /// Total message length, header included
    pub length: u32,
    pub version: u32,
    pub message_type: u32,
    /// Incremented per request, echoed by usbmuxd, never used for matching
    pub tag: u32,
}

impl MuxerHeader {
    pub const SIZE: usize = 16;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.length.to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.message_type.to_le_bytes());
        buf[12..16].copy_from_slice(&self.tag.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; Self::SIZE]) -> Self {
        let word = |i: usize| u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        Self {
            length: word(0),
            version: word(4),
            message_type: word(8),
            tag: word(12),
        }
    }

    /// Bytes following the header, or `None` if the declared length can't even hold the header
    pub fn payload_len(&self) -> Option<usize> {
        (self.length as usize).checked_sub(Self::SIZE)
    }
}

/// A complete muxer message ready to be written
#[derive(Debug, Clone)]
pub struct RawPacket {
    pub header: MuxerHeader,
    pub payload: Vec<u8>,
}

impl RawPacket {
    pub fn new(
        payload: &plist::Dictionary,
        version: u32,
        message_type: MuxerMessageType,
        tag: u32,
    ) -> Result<Self, IdeviceError> {
        let payload = util::plist_to_xml_bytes(payload)?;
        let length = u32::try_from(payload.len() + MuxerHeader::SIZE)
            .map_err(|_| IdeviceError::FrameTooLarge(payload.len()))?;
        Ok(Self {
            header: MuxerHeader {
                length,
                version,
                message_type: message_type as u32,
                tag,
            },
            payload,
        })
    }

    pub async fn write_to<W: AsyncWrite + Unpin + ?Sized>(
        &self,
        writer: &mut W,
    ) -> Result<(), IdeviceError> {
        let raw: Vec<u8> = self.clone().into();
        writer.write_all(&raw).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Reads one message
    ///
    /// # Returns
    /// `None` when the stream ends before a complete header or payload arrives
    ///
    /// # Errors
    /// A header declaring anything other than a plist payload, or a length shorter than the
    /// header itself, is a hard error
    pub async fn read_from<R: AsyncRead + Unpin + ?Sized>(
        reader: &mut R,
    ) -> Result<Option<Self>, IdeviceError> {
        let mut header_buf = [0u8; MuxerHeader::SIZE];
        if !util::read_exact_or_eof(reader, &mut header_buf).await? {
            return Ok(None);
        }
        let header = MuxerHeader::from_bytes(&header_buf);

        if MuxerMessageType::try_from(header.message_type)? != MuxerMessageType::Plist {
            return Err(IdeviceError::UnsupportedMuxerMessage(header.message_type));
        }
        let len = header
            .payload_len()
            .ok_or(IdeviceError::MalformedMuxerMessage)?;
        trace!("Reading {len} bytes from muxer (tag {})", header.tag);

        let mut payload = vec![0; len];
        if !util::read_exact_or_eof(reader, &mut payload).await? {
            return Ok(None);
        }
        Ok(Some(Self { header, payload }))
    }

    pub fn dictionary(&self) -> Result<plist::Dictionary, IdeviceError> {
        Ok(plist::from_bytes(&self.payload)?)
    }
}

impl From<RawPacket> for Vec<u8> {
    fn from(packet: RawPacket) -> Self {
        let mut buf = Vec::with_capacity(MuxerHeader::SIZE + packet.payload.len());
        buf.extend_from_slice(&packet.header.to_bytes());
        buf.extend_from_slice(&packet.payload);
        buf
    }
}
