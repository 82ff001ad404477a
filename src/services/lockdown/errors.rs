/// Error strings lockdownd puts in the `Error` key of a response
///
/// Parsing never fails: strings without a dedicated variant land in `Unknown`.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum LockdownError {
    #[error("session is inactive")]
    SessionInactive,
    #[error("device prohibited getting this value")]
    GetProhibited,
    #[error("device prohibited setting this value")]
    SetProhibited,
    #[error("missing value")]
    MissingValue,
    #[error("host ID is not paired with the device")]
    InvalidHostID,
    #[error("user denied the pairing request")]
    UserDeniedPairing,
    #[error("waiting for the user to respond to the trust dialog")]
    PairingDialogResponsePending,
    #[error("invalid pair record")]
    InvalidPairRecord,
    #[error("device is locked with a passcode")]
    PasswordProtected,
    #[error("invalid service")]
    InvalidService,
    #[error("{0}")]
    Unknown(String),
}

impl LockdownError {
    /// The string lockdownd uses for this error
    pub fn as_str(&self) -> &str {
        match self {
            Self::SessionInactive => "SessionInactive",
            Self::GetProhibited => "GetProhibited",
            Self::SetProhibited => "SetProhibited",
            Self::MissingValue => "MissingValue",
            Self::InvalidHostID => "InvalidHostID",
            Self::UserDeniedPairing => "UserDeniedPairing",
            Self::PairingDialogResponsePending => "PairingDialogResponsePending",
            Self::InvalidPairRecord => "InvalidPairRecord",
            Self::PasswordProtected => "PasswordProtected",
            Self::InvalidService => "InvalidService",
            Self::Unknown(s) => s,
        }
    }
}

impl From<&str> for LockdownError {
    fn from(value: &str) -> Self {
        match value {
            "SessionInactive" => Self::SessionInactive,
            "GetProhibited" => Self::GetProhibited,
            "SetProhibited" => Self::SetProhibited,
            "MissingValue" => Self::MissingValue,
            "InvalidHostID" => Self::InvalidHostID,
            "UserDeniedPairing" => Self::UserDeniedPairing,
            "PairingDialogResponsePending" => Self::PairingDialogResponsePending,
            "InvalidPairRecord" => Self::InvalidPairRecord,
            "PasswordProtected" => Self::PasswordProtected,
            "InvalidService" => Self::InvalidService,
            other => Self::Unknown(other.to_string()),
        }
    }
}

impl From<String> for LockdownError {
    fn from(value: String) -> Self {
        value.as_str().into()
    }
}

impl<'de> serde::Deserialize<'de> for LockdownError {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Into::into)
    }
}

impl serde::Serialize for LockdownError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}
