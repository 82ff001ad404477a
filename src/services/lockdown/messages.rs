//! Lockdown request bodies and typed responses

use plist::{Dictionary, Value};
use serde::Serialize;
use tracing::warn;

use super::LockdownError;
use crate::IdeviceError;

pub const PROTOCOL_VERSION: &str = "2";

/// Builds a request dictionary: `Label`, `ProtocolVersion` and `Request` plus the fields of `body`
pub(crate) fn request<B: Serialize>(
    label: &str,
    verb: &str,
    body: &B,
) -> Result<Dictionary, IdeviceError> {
    let mut req = Dictionary::new();
    req.insert("Label".into(), label.into());
    req.insert("ProtocolVersion".into(), PROTOCOL_VERSION.into());
    req.insert("Request".into(), verb.into());
    match plist::to_value(body)? {
        Value::Dictionary(fields) => req.extend(fields),
        other => {
            warn!("Request body for {verb} isn't a dictionary: {other:?}");
            return Err(IdeviceError::InvalidArgument("request body must be a struct"));
        }
    }
    Ok(req)
}

#[derive(Serialize)]
pub(crate) struct NoBody {}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct ValueBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

#[derive(Serialize)]
pub(crate) struct StartSessionBody<'a> {
    #[serde(rename = "HostID")]
    pub host_id: &'a str,
    #[serde(rename = "SystemBUID")]
    pub system_buid: &'a str,
}

#[derive(Serialize)]
pub(crate) struct StopSessionBody<'a> {
    #[serde(rename = "SessionID")]
    pub session_id: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct StartServiceBody<'a> {
    pub service: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct PairBody {
    pub pair_record: Dictionary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pairing_options: Option<PairingOptions>,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct PairingOptions {
    /// Ask for `PairingDialogResponsePending` instead of a generic failure while the trust
    /// dialog is up
    pub extended_pairing_errors: bool,
}

impl Default for PairingOptions {
    fn default() -> Self {
        Self {
            extended_pairing_errors: true,
        }
    }
}

/// Common shape of every lockdown response
#[derive(Debug, Clone, PartialEq)]
pub struct LockdownResponse {
    pub request: Option<String>,
    pub result: Option<String>,
    /// Parsed from the `Error` key; unknown strings become [`LockdownError::Unknown`]
    pub error: Option<LockdownError>,
    /// Every other key
    pub fields: Dictionary,
}

impl LockdownResponse {
    pub fn from_dictionary(mut d: Dictionary) -> Self {
        let mut take_string = |key: &str| match d.remove(key) {
            Some(Value::String(s)) => Some(s),
            Some(other) => {
                warn!("Lockdown response key {key} isn't a string: {other:?}");
                None
            }
            None => None,
        };
        let request = take_string("Request");
        let result = take_string("Result");
        let error = take_string("Error").map(LockdownError::from);
        Self {
            request,
            result,
            error,
            fields: d,
        }
    }

    /// Turns a device error into `Err`
    pub fn into_result(self) -> Result<Self, IdeviceError> {
        match self.error {
            Some(e) => Err(IdeviceError::Lockdown(e)),
            None => Ok(self),
        }
    }

    pub fn string(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_string)
    }

    pub fn boolean(&self, key: &str) -> Option<bool> {
        self.fields.get(key).and_then(Value::as_boolean)
    }

    pub fn data(&self, key: &str) -> Option<&[u8]> {
        self.fields.get(key).and_then(Value::as_data)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartSessionResponse {
    pub session_id: String,
    pub enable_session_ssl: bool,
}

impl TryFrom<&LockdownResponse> for StartSessionResponse {
    type Error = IdeviceError;

    fn try_from(res: &LockdownResponse) -> Result<Self, Self::Error> {
        let session_id = res
            .string("SessionID")
            .ok_or(IdeviceError::UnexpectedResponse)?
            .to_string();
        Ok(Self {
            session_id,
            enable_session_ssl: res.boolean("EnableSessionSSL").unwrap_or(false),
        })
    }
}

/// Where lockdownd started a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub port: u16,
    /// The service connection must be upgraded to TLS right after connecting
    pub enable_service_ssl: bool,
    pub service_name: String,
}

impl TryFrom<&LockdownResponse> for ServiceDescriptor {
    type Error = IdeviceError;

    fn try_from(res: &LockdownResponse) -> Result<Self, Self::Error> {
        let port = res
            .fields
            .get("Port")
            .and_then(Value::as_unsigned_integer)
            .and_then(|p| u16::try_from(p).ok())
            .ok_or(IdeviceError::UnexpectedResponse)?;
        Ok(Self {
            port,
            // Over USB the key is often left out
            enable_service_ssl: res.boolean("EnableServiceSSL").unwrap_or(false),
            service_name: res.string("Service").unwrap_or_default().to_string(),
        })
    }
}

/// Outcome of a `Pair` request the caller is expected to handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingStatus {
    Success,
    UserDeniedPairing,
    PairingDialogResponsePending,
    InvalidPairRecord,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingResult {
    pub status: PairingStatus,
    /// Issued on success
    pub escrow_bag: Option<Vec<u8>>,
}

impl TryFrom<LockdownResponse> for PairingResult {
    type Error = IdeviceError;

    /// Negotiation outcomes become a status, every other device error is an `Err`
    fn try_from(res: LockdownResponse) -> Result<Self, Self::Error> {
        let status = match res.error {
            None => PairingStatus::Success,
            Some(LockdownError::UserDeniedPairing) => PairingStatus::UserDeniedPairing,
            Some(LockdownError::PairingDialogResponsePending) => {
                PairingStatus::PairingDialogResponsePending
            }
            Some(LockdownError::InvalidPairRecord) => PairingStatus::InvalidPairRecord,
            Some(e) => return Err(IdeviceError::Lockdown(e)),
        };
        let escrow_bag = match status {
            PairingStatus::Success => res.data("EscrowBag").map(<[u8]>::to_vec),
            _ => None,
        };
        Ok(Self { status, escrow_bag })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_has_common_keys_and_skips_none() {
        let req = request(
            "label",
            "GetValue",
            &ValueBody {
                domain: None,
                key: Some("DeviceName"),
                value: None,
            },
        )
        .unwrap();
        assert_eq!(req.get("Label").and_then(Value::as_string), Some("label"));
        assert_eq!(
            req.get("ProtocolVersion").and_then(Value::as_string),
            Some("2")
        );
        assert_eq!(
            req.get("Request").and_then(Value::as_string),
            Some("GetValue")
        );
        assert_eq!(
            req.get("Key").and_then(Value::as_string),
            Some("DeviceName")
        );
        assert!(!req.contains_key("Domain"));
        assert!(!req.contains_key("Value"));
    }

    #[test]
    fn renamed_body_keys() {
        let req = request(
            "l",
            "StartSession",
            &StartSessionBody {
                host_id: "HOST",
                system_buid: "BUID",
            },
        )
        .unwrap();
        assert_eq!(req.get("HostID").and_then(Value::as_string), Some("HOST"));
        assert_eq!(
            req.get("SystemBUID").and_then(Value::as_string),
            Some("BUID")
        );

        let mut record = Dictionary::new();
        record.insert("HostID".into(), "HOST".into());
        let req = request(
            "l",
            "Pair",
            &PairBody {
                pair_record: record,
                pairing_options: Some(PairingOptions::default()),
            },
        )
        .unwrap();
        let options = req
            .get("PairingOptions")
            .and_then(Value::as_dictionary)
            .unwrap();
        assert_eq!(
            options
                .get("ExtendedPairingErrors")
                .and_then(Value::as_boolean),
            Some(true)
        );
        assert!(req.get("PairRecord").and_then(Value::as_dictionary).is_some());
    }

    #[test]
    fn unknown_error_strings_parse() {
        let mut d = Dictionary::new();
        d.insert("Request".into(), "GetValue".into());
        d.insert("Error".into(), "BrandNewError".into());
        d.insert("Value".into(), 5u64.into());
        let res = LockdownResponse::from_dictionary(d);
        assert_eq!(res.request.as_deref(), Some("GetValue"));
        assert_eq!(
            res.error,
            Some(LockdownError::Unknown("BrandNewError".into()))
        );
        assert!(res.fields.contains_key("Value"));
        assert!(!res.fields.contains_key("Error"));
    }

    fn response(error: Option<&str>) -> LockdownResponse {
        let mut d = Dictionary::new();
        d.insert("Request".into(), "Pair".into());
        if let Some(e) = error {
            d.insert("Error".into(), e.into());
        }
        d.insert("EscrowBag".into(), Value::Data(vec![1, 2, 3]));
        LockdownResponse::from_dictionary(d)
    }

    #[test]
    fn pairing_outcomes() {
        let ok = PairingResult::try_from(response(None)).unwrap();
        assert_eq!(ok.status, PairingStatus::Success);
        assert_eq!(ok.escrow_bag, Some(vec![1, 2, 3]));

        let pending =
            PairingResult::try_from(response(Some("PairingDialogResponsePending"))).unwrap();
        assert_eq!(pending.status, PairingStatus::PairingDialogResponsePending);
        assert_eq!(pending.escrow_bag, None);

        assert!(matches!(
            PairingResult::try_from(response(Some("SessionInactive"))),
            Err(IdeviceError::Lockdown(LockdownError::SessionInactive))
        ));
    }

    #[test]
    fn service_descriptor_needs_a_port() {
        let mut d = Dictionary::new();
        d.insert("Service".into(), "com.apple.afc".into());
        let res = LockdownResponse::from_dictionary(d.clone());
        assert!(ServiceDescriptor::try_from(&res).is_err());

        d.insert("Port".into(), 49152u64.into());
        let res = LockdownResponse::from_dictionary(d);
        let desc = ServiceDescriptor::try_from(&res).unwrap();
        assert_eq!(desc.port, 49152);
        assert!(!desc.enable_service_ssl);
        assert_eq!(desc.service_name, "com.apple.afc");
    }
}
