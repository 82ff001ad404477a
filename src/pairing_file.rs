//! Pairing records
//!
//! A pairing record is the trust bundle a host and device exchange: a root certificate, a host
//! certificate and a device certificate issued by that root, the host's private keys, and the
//! identifiers lockdownd checks when a session starts. usbmuxd stores them as XML plists with
//! every certificate and key as PEM text inside a data blob.

use std::{
    hash::{Hash, Hasher},
    path::Path,
};

use plist::{Data, Dictionary, Value};
use rustls::pki_types::{CertificateDer, pem::PemObject};
use serde::{Deserialize, Serialize};
use tracing::warn;
use x509_cert::der::pem::{self, LineEnding};

use crate::IdeviceError;

#[derive(Clone, Debug)]
pub struct PairingFile {
    /// Device certificate, DER
    pub device_certificate: CertificateDer<'static>,
    /// Host private key as PKCS#1 PEM. Stripped from records stored on the device.
    pub host_private_key: Option<Vec<u8>>,
    /// Host certificate, DER
    pub host_certificate: CertificateDer<'static>,
    /// Root private key as PKCS#1 PEM
    pub root_private_key: Option<Vec<u8>>,
    /// Root certificate, DER
    pub root_certificate: CertificateDer<'static>,
    pub system_buid: Option<String>,
    /// Uppercase GUID identifying this host
    pub host_id: Option<String>,
    /// Issued by the device when pairing succeeds
    pub escrow_bag: Option<Vec<u8>>,
    pub wifi_mac_address: Option<String>,
    pub udid: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
struct RawPairingFile {
    device_certificate: Data,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    escrow_bag: Option<Data>,
    host_certificate: Data,
    #[serde(rename = "HostID", default, skip_serializing_if = "Option::is_none")]
    host_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    host_private_key: Option<Data>,
    root_certificate: Data,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    root_private_key: Option<Data>,
    #[serde(rename = "SystemBUID", default, skip_serializing_if = "Option::is_none")]
    system_buid: Option<String>,
    #[serde(
        rename = "WiFiMACAddress",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    wifi_mac_address: Option<String>,
    #[serde(rename = "UDID", default, skip_serializing_if = "Option::is_none")]
    udid: Option<String>,
}

impl PairingFile {
    /// Reads a pairing record from disk
    pub fn read_from_file(path: impl AsRef<Path>) -> Result<Self, IdeviceError> {
        let f = std::fs::read(path)?;
        Self::from_bytes(&f)
    }

    /// Writes the record, private keys included, as an XML plist
    pub fn write_to_file(&self, path: impl AsRef<Path>) -> Result<(), IdeviceError> {
        std::fs::write(path, self.serialize()?)?;
        Ok(())
    }

    /// Parses a pairing record from plist bytes (XML or binary)
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdeviceError> {
        let raw: RawPairingFile = plist::from_bytes(bytes).inspect_err(|e| {
            warn!("Unable to parse pairing record: {e:?}");
        })?;
        raw.try_into()
    }

    pub fn from_value(v: &Value) -> Result<Self, IdeviceError> {
        let raw: RawPairingFile = plist::from_value(v)?;
        raw.try_into()
    }

    /// Serializes the record, private keys included, as an XML plist
    pub fn serialize(&self) -> Result<Vec<u8>, IdeviceError> {
        self.serialize_with(true)
    }

    /// Serializes the record as an XML plist, optionally leaving out both private keys
    pub fn serialize_with(&self, include_private_keys: bool) -> Result<Vec<u8>, IdeviceError> {
        let mut buf = Vec::new();
        plist::to_writer_xml(&mut buf, &self.to_raw(include_private_keys)?)?;
        Ok(buf)
    }

    /// The persisted dictionary form of the record
    pub fn to_value(&self, include_private_keys: bool) -> Result<Value, IdeviceError> {
        Ok(plist::to_value(&self.to_raw(include_private_keys)?)?)
    }

    /// A copy without the host and root private keys
    pub fn without_private_keys(&self) -> Self {
        Self {
            host_private_key: None,
            root_private_key: None,
            ..self.clone()
        }
    }

    /// The `PairRecord` dictionary sent in `Pair` and `Unpair` requests
    ///
    /// Holds the certificates and identifiers only: no private keys, escrow bag or UDID.
    pub fn to_pair_record(&self) -> Result<Dictionary, IdeviceError> {
        let mut record = match self.to_value(false)? {
            Value::Dictionary(d) => d,
            _ => return Err(IdeviceError::UnexpectedResponse),
        };
        record.remove("EscrowBag");
        record.remove("UDID");
        Ok(record)
    }

    fn to_raw(&self, include_private_keys: bool) -> Result<RawPairingFile, IdeviceError> {
        let key = |k: &Option<Vec<u8>>| {
            k.as_ref()
                .filter(|_| include_private_keys)
                .map(|k| Data::new(k.clone()))
        };
        Ok(RawPairingFile {
            device_certificate: Data::new(pem_encode("CERTIFICATE", &self.device_certificate)?),
            escrow_bag: self.escrow_bag.clone().map(Data::new),
            host_certificate: Data::new(pem_encode("CERTIFICATE", &self.host_certificate)?),
            host_id: self.host_id.clone(),
            host_private_key: key(&self.host_private_key),
            root_certificate: Data::new(pem_encode("CERTIFICATE", &self.root_certificate)?),
            root_private_key: key(&self.root_private_key),
            system_buid: self.system_buid.clone(),
            wifi_mac_address: self.wifi_mac_address.clone(),
            udid: self.udid.clone(),
        })
    }
}

impl TryFrom<RawPairingFile> for PairingFile {
    type Error = IdeviceError;

    fn try_from(value: RawPairingFile) -> Result<Self, Self::Error> {
        let cert = |d: Data| -> Result<CertificateDer<'static>, IdeviceError> {
            Ok(CertificateDer::from_pem_slice(d.as_ref())?)
        };
        Ok(Self {
            device_certificate: cert(value.device_certificate)?,
            host_private_key: value.host_private_key.map(Into::into),
            host_certificate: cert(value.host_certificate)?,
            root_private_key: value.root_private_key.map(Into::into),
            root_certificate: cert(value.root_certificate)?,
            system_buid: value.system_buid,
            host_id: value.host_id,
            escrow_bag: value.escrow_bag.map(Into::into),
            wifi_mac_address: value.wifi_mac_address,
            udid: value.udid,
        })
    }
}

/// PEM armor with 64 column lines and a trailing newline
pub(crate) fn pem_encode(label: &str, der: &[u8]) -> Result<Vec<u8>, IdeviceError> {
    let mut out =
        pem::encode_string(label, LineEnding::LF, der).map_err(x509_cert::der::Error::from)?;
    if !out.ends_with('\n') {
        out.push('\n');
    }
    Ok(out.into_bytes())
}

/// Records are equal when both carry the same `SystemBUID` and `HostID`
///
/// A record missing either identifier equals nothing, itself included.
impl PartialEq for PairingFile {
    fn eq(&self, other: &Self) -> bool {
        match (
            &self.system_buid,
            &self.host_id,
            &other.system_buid,
            &other.host_id,
        ) {
            (Some(a_buid), Some(a_host), Some(b_buid), Some(b_host)) => {
                a_buid == b_buid && a_host == b_host
            }
            _ => false,
        }
    }
}

impl Hash for PairingFile {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.system_buid.hash(state);
        self.host_id.hash(state);
    }
}
