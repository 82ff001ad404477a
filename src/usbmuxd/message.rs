//! Logical usbmuxd messages
//!
//! The header never says what a payload is. Replies are recognised by which keys the decoded
//! dictionary carries, checked in a fixed order; the first match wins.

use plist::{Dictionary, Value};

use crate::{IdeviceError, usbmuxd::des::DeviceListResponse};

/// Result codes carried in `Result` messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum MuxerResultCode {
    Success,
    BadCommand,
    BadDevice,
    ConnectionRefused,
    BadVersion,
    /// Any code usbmuxd doesn't document
    Unknown(u64),
}

impl From<u64> for MuxerResultCode {
    fn from(value: u64) -> Self {
        match value {
            0 => Self::Success,
            1 => Self::BadCommand,
            2 => Self::BadDevice,
            3 => Self::ConnectionRefused,
            6 => Self::BadVersion,
            v => Self::Unknown(v),
        }
    }
}

impl MuxerResultCode {
    pub fn code(&self) -> u64 {
        match self {
            Self::Success => 0,
            Self::BadCommand => 1,
            Self::BadDevice => 2,
            Self::ConnectionRefused => 3,
            Self::BadVersion => 6,
            Self::Unknown(v) => *v,
        }
    }
}

impl std::fmt::Display for MuxerResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::BadCommand => write!(f, "bad command"),
            Self::BadDevice => write!(f, "bad device"),
            Self::ConnectionRefused => write!(f, "connection refused"),
            Self::BadVersion => write!(f, "bad version"),
            Self::Unknown(v) => write!(f, "unknown error {v}"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum MuxerMessage {
    Result(MuxerResultCode),
    /// `port_number` is the port as the device sees it, not as it goes on the wire
    Connect {
        device_id: u32,
        port_number: u16,
    },
    Listen,
    ListDevices,
    ReadBuid,
    ReadPairRecord {
        pair_record_id: String,
    },
    SavePairRecord {
        pair_record_id: String,
        pair_record_data: Vec<u8>,
        device_id: Option<u32>,
    },
    DeletePairRecord {
        pair_record_id: String,
    },
    DeviceAttached(DeviceListResponse),
    DeviceDetached {
        device_id: u32,
    },
    DevicePaired {
        device_id: u32,
    },
    DeviceList(Vec<DeviceListResponse>),
    Buid(String),
    PairRecordData(Vec<u8>),
}

type Matcher = fn(&Dictionary) -> bool;
type Decoder = fn(Dictionary) -> Result<MuxerMessage, IdeviceError>;

const DISPATCH: &[(Matcher, Decoder)] = &[
    (has_device_list, decode_device_list),
    (has_pair_record_data, decode_pair_record_data),
    (has_buid, decode_buid),
    (has_number, decode_result),
    (has_properties, decode_attached),
    (is_detached, decode_detached),
    (is_paired, decode_paired),
];

fn has_device_list(d: &Dictionary) -> bool {
    d.contains_key("DeviceList")
}

fn has_pair_record_data(d: &Dictionary) -> bool {
    d.contains_key("PairRecordData")
}

fn has_buid(d: &Dictionary) -> bool {
    d.contains_key("BUID")
}

fn has_number(d: &Dictionary) -> bool {
    d.contains_key("Number")
}

fn has_properties(d: &Dictionary) -> bool {
    d.contains_key("Properties")
}

fn message_type_is(d: &Dictionary, expected: &str) -> bool {
    d.get("MessageType").and_then(Value::as_string) == Some(expected)
}

fn is_detached(d: &Dictionary) -> bool {
    message_type_is(d, "Detached")
}

fn is_paired(d: &Dictionary) -> bool {
    message_type_is(d, "Paired")
}

fn decode_device_list(d: Dictionary) -> Result<MuxerMessage, IdeviceError> {
    #[derive(serde::Deserialize)]
    struct ListDevicesResponse {
        #[serde(rename = "DeviceList")]
        device_list: Vec<DeviceListResponse>,
    }
    let res: ListDevicesResponse = plist::from_value(&Value::Dictionary(d))?;
    Ok(MuxerMessage::DeviceList(res.device_list))
}

fn decode_pair_record_data(mut d: Dictionary) -> Result<MuxerMessage, IdeviceError> {
    match d.remove("PairRecordData") {
        Some(Value::Data(data)) => Ok(MuxerMessage::PairRecordData(data)),
        _ => Err(IdeviceError::MalformedMuxerMessage),
    }
}

fn decode_buid(mut d: Dictionary) -> Result<MuxerMessage, IdeviceError> {
    match d.remove("BUID") {
        Some(Value::String(s)) => Ok(MuxerMessage::Buid(s)),
        _ => Err(IdeviceError::MalformedMuxerMessage),
    }
}

fn decode_result(d: Dictionary) -> Result<MuxerMessage, IdeviceError> {
    d.get("Number")
        .and_then(Value::as_unsigned_integer)
        .map(|n| MuxerMessage::Result(n.into()))
        .ok_or(IdeviceError::MalformedMuxerMessage)
}

fn decode_attached(d: Dictionary) -> Result<MuxerMessage, IdeviceError> {
    Ok(MuxerMessage::DeviceAttached(plist::from_value(
        &Value::Dictionary(d),
    )?))
}

fn device_id(d: &Dictionary) -> Result<u32, IdeviceError> {
    d.get("DeviceID")
        .and_then(Value::as_unsigned_integer)
        .and_then(|id| u32::try_from(id).ok())
        .ok_or(IdeviceError::MalformedMuxerMessage)
}

fn decode_detached(d: Dictionary) -> Result<MuxerMessage, IdeviceError> {
    Ok(MuxerMessage::DeviceDetached {
        device_id: device_id(&d)?,
    })
}

fn decode_paired(d: Dictionary) -> Result<MuxerMessage, IdeviceError> {
    Ok(MuxerMessage::DevicePaired {
        device_id: device_id(&d)?,
    })
}

impl MuxerMessage {
    /// Decodes a reply or notification from its payload dictionary
    ///
    /// # Errors
    /// `MalformedMuxerMessage` if no known shape matches
    pub fn from_dictionary(d: Dictionary) -> Result<Self, IdeviceError> {
        for (matches, decode) in DISPATCH {
            if matches(&d) {
                return decode(d);
            }
        }
        Err(IdeviceError::MalformedMuxerMessage)
    }

    /// Encodes the message as a payload dictionary
    ///
    /// `label` fills in the client identification keys requests carry.
    pub fn to_dictionary(&self, label: &str) -> Result<Dictionary, IdeviceError> {
        let mut d = Dictionary::new();
        let request = |d: &mut Dictionary, message_type: &str| {
            d.insert("MessageType".into(), message_type.into());
            d.insert("ClientVersionString".into(), label.into());
            d.insert("ProgName".into(), label.into());
            d.insert("kLibUSBMuxVersion".into(), 3.into());
        };

        match self {
            Self::Result(code) => {
                d.insert("MessageType".into(), "Result".into());
                d.insert("Number".into(), code.code().into());
            }
            Self::Connect {
                device_id,
                port_number,
            } => {
                request(&mut d, "Connect");
                d.insert("DeviceID".into(), (*device_id).into());
                d.insert(
                    "PortNumber".into(),
                    u64::from(wire_port(*port_number)).into(),
                );
            }
            Self::Listen => request(&mut d, "Listen"),
            Self::ListDevices => request(&mut d, "ListDevices"),
            Self::ReadBuid => request(&mut d, "ReadBUID"),
            Self::ReadPairRecord { pair_record_id } => {
                request(&mut d, "ReadPairRecord");
                d.insert("PairRecordID".into(), pair_record_id.as_str().into());
            }
            Self::SavePairRecord {
                pair_record_id,
                pair_record_data,
                device_id,
            } => {
                request(&mut d, "SavePairRecord");
                d.insert("PairRecordID".into(), pair_record_id.as_str().into());
                d.insert(
                    "PairRecordData".into(),
                    Value::Data(pair_record_data.clone()),
                );
                if let Some(id) = device_id {
                    d.insert("DeviceID".into(), (*id).into());
                }
            }
            Self::DeletePairRecord { pair_record_id } => {
                request(&mut d, "DeletePairRecord");
                d.insert("PairRecordID".into(), pair_record_id.as_str().into());
            }
            Self::DeviceAttached(dev) => {
                d = match plist::to_value(dev)? {
                    Value::Dictionary(d) => d,
                    _ => return Err(IdeviceError::MalformedMuxerMessage),
                };
                d.insert("MessageType".into(), "Attached".into());
            }
            Self::DeviceDetached { device_id } => {
                d.insert("MessageType".into(), "Detached".into());
                d.insert("DeviceID".into(), (*device_id).into());
            }
            Self::DevicePaired { device_id } => {
                d.insert("MessageType".into(), "Paired".into());
                d.insert("DeviceID".into(), (*device_id).into());
            }
            Self::DeviceList(devs) => {
                let devs = devs
                    .iter()
                    .map(plist::to_value)
                    .collect::<Result<Vec<_>, _>>()?;
                d.insert("DeviceList".into(), Value::Array(devs));
            }
            Self::Buid(buid) => {
                d.insert("BUID".into(), buid.as_str().into());
            }
            Self::PairRecordData(data) => {
                d.insert("PairRecordData".into(), Value::Data(data.clone()));
            }
        }
        Ok(d)
    }
}

/// usbmuxd expects the port in network byte order even though every other integer in the
/// protocol is little-endian
pub fn wire_port(port: u16) -> u16 {
    u16::from_le_bytes(port.to_be_bytes())
}
