use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::usbmuxd::{Connection, UsbmuxdDevice};

const AF_INET: u8 = 0x02;
const AF_INET6: u8 = 0x1E;

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DeviceListResponse {
    #[serde(rename = "DeviceID")]
    pub device_id: u32,
    #[serde(rename = "Properties")]
    pub properties: DevicePropertiesResponse,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct DevicePropertiesResponse {
    #[serde(rename = "ConnectionType")]
    pub connection_type: String,
    #[serde(rename = "SerialNumber")]
    pub serial_number: String,
    #[serde(rename = "NetworkAddress", skip_serializing_if = "Option::is_none")]
    pub network_address: Option<plist::Data>,
    #[serde(rename = "LocationID", skip_serializing_if = "Option::is_none")]
    pub location_id: Option<u32>,
    #[serde(rename = "ProductID", skip_serializing_if = "Option::is_none")]
    pub product_id: Option<u32>,
    #[serde(rename = "ConnectionSpeed", skip_serializing_if = "Option::is_none")]
    pub connection_speed: Option<u64>,
}

/// Converts a muxer serial number into the canonical UDID
///
/// USB serials of modern devices come through as 24 characters; the UDID has a dash after the
/// eighth. Anything else is already a UDID.
pub fn patch_udid(serial: &str) -> String {
    if serial.chars().count() != 24 {
        return serial.to_string();
    }
    let (head, tail) = serial.split_at(serial.char_indices().nth(8).map_or(8, |(i, _)| i));
    format!("{head}-{tail}")
}

/// Decodes the sockaddr bytes usbmuxd reports for network devices
///
/// Byte 0 is the address family. IPv4 addresses sit at bytes 4..8, IPv6 at bytes 4..20.
pub fn decode_network_address(addr: &[u8]) -> Option<IpAddr> {
    match addr.first() {
        Some(&AF_INET) if addr.len() >= 8 => {
            Some(IpAddr::V4(Ipv4Addr::new(addr[4], addr[5], addr[6], addr[7])))
        }
        Some(&AF_INET6) if addr.len() >= 20 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&addr[4..20]);
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        Some(family) => {
            warn!(
                "Unable to decode network address (family {family:02X}, {} bytes)",
                addr.len()
            );
            None
        }
        None => None,
    }
}

impl From<DeviceListResponse> for UsbmuxdDevice {
    fn from(dev: DeviceListResponse) -> Self {
        let props = dev.properties;
        let connection_type = match props.connection_type.as_str() {
            "USB" => Connection::Usb,
            "Network" => Connection::Network(
                props
                    .network_address
                    .as_ref()
                    .and_then(|a| decode_network_address(a.as_ref())),
            ),
            _ => Connection::Unknown(props.connection_type.clone()),
        };
        debug!("Connection type: {connection_type:?}");

        let is_usb = connection_type == Connection::Usb;
        UsbmuxdDevice {
            udid: patch_udid(&props.serial_number),
            serial_number: props.serial_number,
            device_id: dev.device_id,
            location_id: props.location_id.filter(|_| is_usb),
            product_id: props.product_id.filter(|_| is_usb),
            connection_type,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn udid_gets_dash_after_eighth_char() {
        assert_eq!(
            patch_udid("AAAAAAAABBBBBBBBBBBBBBBB"),
            "AAAAAAAA-BBBBBBBBBBBBBBBB"
        );
    }

    #[test]
    fn other_serial_lengths_are_untouched() {
        let classic = "0123456789abcdef0123456789abcdef01234567";
        assert_eq!(patch_udid(classic), classic);
        assert_eq!(
            patch_udid("AAAAAAAA-BBBBBBBBBBBBBBBB"),
            "AAAAAAAA-BBBBBBBBBBBBBBBB"
        );
        assert_eq!(patch_udid(""), "");
    }

    #[test]
    fn ipv4_address() {
        let raw = [0x02, 0x00, 0x00, 0x00, 192, 168, 1, 20];
        assert_eq!(
            decode_network_address(&raw),
            Some(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)))
        );
    }

    #[test]
    fn ipv6_address() {
        let mut raw = vec![0x1E, 0x00, 0x00, 0x00];
        raw.extend_from_slice(&[0xfe, 0x80, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);
        assert_eq!(
            decode_network_address(&raw),
            Some(IpAddr::V6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1)))
        );
    }

    #[test]
    fn undecodable_addresses() {
        assert_eq!(decode_network_address(&[]), None);
        assert_eq!(decode_network_address(&[0x02, 0, 0, 0, 10, 0]), None);
        assert_eq!(decode_network_address(&[0x1E; 19]), None);
        assert_eq!(decode_network_address(&[0x1C; 28]), None);
    }

    #[test]
    fn usb_device_conversion() {
        let dev = DeviceListResponse {
            device_id: 3,
            properties: DevicePropertiesResponse {
                connection_type: "USB".into(),
                serial_number: "00008030001A2B3C4D5E6F70".into(),
                location_id: Some(0x1410_0000),
                product_id: Some(0x12a8),
                ..Default::default()
            },
        };
        let dev = UsbmuxdDevice::from(dev);
        assert_eq!(dev.connection_type, Connection::Usb);
        assert_eq!(dev.udid, "00008030-001A2B3C4D5E6F70");
        assert_eq!(dev.serial_number, "00008030001A2B3C4D5E6F70");
        assert_eq!(dev.product_id, Some(0x12a8));
    }

    #[test]
    fn network_device_drops_usb_fields() {
        let dev = DeviceListResponse {
            device_id: 9,
            properties: DevicePropertiesResponse {
                connection_type: "Network".into(),
                serial_number: "abc".into(),
                network_address: Some(vec![0x02, 0, 0, 0, 10, 0, 0, 5].into()),
                location_id: Some(1),
                ..Default::default()
            },
        };
        let dev = UsbmuxdDevice::from(dev);
        assert_eq!(
            dev.connection_type,
            Connection::Network(Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5))))
        );
        assert_eq!(dev.location_id, None);
    }
}
