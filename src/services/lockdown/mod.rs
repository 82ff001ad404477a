//! Lockdown service client
//!
//! lockdownd listens on port 62078 of every device. It brokers trust (pairing), hands out
//! device values, and starts other services on demand, returning the port they listen on.
//!
//! A connection moves through three states: connected, session active, and optionally TLS
//! active. Once TLS is on, every later read and write on the same connection is encrypted
//! until the session is stopped.

use std::time::Duration;

use plist::{Dictionary, Value};
use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, error, warn};

use crate::{Idevice, IdeviceError, pairing_file::PairingFile, provider::IdeviceProvider};

mod errors;
mod messages;

pub use errors::LockdownError;
pub use messages::{
    LockdownResponse, PROTOCOL_VERSION, PairingOptions, PairingResult, PairingStatus,
    ServiceDescriptor, StartSessionResponse,
};
use messages::{
    NoBody, PairBody, StartServiceBody, StartSessionBody, StopSessionBody, ValueBody,
};

/// Client for the lockdown service
#[derive(Debug)]
pub struct LockdownClient {
    /// The underlying lockdown-framed connection
    pub idevice: Idevice,
}

impl LockdownClient {
    /// The TCP port lockdownd listens on
    pub const LOCKDOWND_PORT: u16 = 62078;
    /// What `QueryType` must return for a genuine lockdownd
    pub const SERVICE_TYPE: &'static str = "com.apple.mobile.lockdown";
    /// Delay between attempts in [`LockdownClient::pair_until_accepted`]
    pub const PAIR_RETRY_DELAY: Duration = Duration::from_secs(1);

    /// Connects to lockdownd through `provider` and checks it identifies itself as lockdown
    ///
    /// # Errors
    /// `InvalidServiceType` if something else answered on the port
    pub async fn connect(provider: &dyn IdeviceProvider) -> Result<Self, IdeviceError> {
        let idevice = provider.connect(Self::LOCKDOWND_PORT).await?;
        let mut client = Self::new(idevice);

        let service_type = client.query_type().await?;
        if service_type != Self::SERVICE_TYPE {
            error!("Expected {} but the service is {service_type}", Self::SERVICE_TYPE);
            return Err(IdeviceError::InvalidServiceType(service_type));
        }
        Ok(client)
    }

    /// Wraps an already connected channel without any identity check
    pub fn new(idevice: Idevice) -> Self {
        Self { idevice }
    }

    async fn request<B: Serialize>(
        &mut self,
        verb: &str,
        body: &B,
    ) -> Result<Option<LockdownResponse>, IdeviceError> {
        let req = messages::request(self.idevice.label(), verb, body)?;
        self.idevice.send_plist(&req).await?;
        let res = self.idevice.read_plist().await?;
        if res.is_none() {
            debug!("Device closed the connection instead of answering {verb}");
        }
        Ok(res.map(LockdownResponse::from_dictionary))
    }

    /// Sends a request whose response must be present and error free
    async fn checked_request<B: Serialize>(
        &mut self,
        verb: &str,
        body: &B,
    ) -> Result<LockdownResponse, IdeviceError> {
        let res = self
            .request(verb, body)
            .await?
            .ok_or(IdeviceError::ConnectionClosed)?;
        if let Some(e) = &res.error {
            error!("{verb} failed: {e}");
        }
        res.into_result()
    }

    /// Asks the service to identify itself
    pub async fn query_type(&mut self) -> Result<String, IdeviceError> {
        let res = self.checked_request("QueryType", &NoBody {}).await?;
        res.string("Type")
            .map(ToString::to_string)
            .ok_or(IdeviceError::UnexpectedResponse)
    }

    /// Retrieves a value from the device
    ///
    /// # Arguments
    /// * `domain` - Optional domain such as `com.apple.disk_usage`
    /// * `key` - The value to retrieve, e.g. `DeviceName`. `None` returns the whole domain.
    ///
    /// # Returns
    /// `None` if the device didn't answer or answered without a value
    ///
    /// # Errors
    /// The device reported an error, or the connection failed
    pub async fn get_value(
        &mut self,
        domain: Option<&str>,
        key: Option<&str>,
    ) -> Result<Option<Value>, IdeviceError> {
        let body = ValueBody {
            domain,
            key,
            value: None,
        };
        let Some(res) = self.request("GetValue", &body).await? else {
            return Ok(None);
        };
        let mut res = res.into_result()?;
        Ok(res.fields.remove("Value"))
    }

    /// Retrieves a value and converts it to `T`
    ///
    /// An absent value yields `T::default()`.
    pub async fn get_value_as<T: DeserializeOwned + Default>(
        &mut self,
        domain: Option<&str>,
        key: &str,
    ) -> Result<T, IdeviceError> {
        match self.get_value(domain, Some(key)).await? {
            Some(v) => Ok(plist::from_value(&v)?),
            None => Ok(T::default()),
        }
    }

    /// Retrieves every value in a domain, or the global domain if `None`
    pub async fn get_all_values(
        &mut self,
        domain: Option<&str>,
    ) -> Result<Dictionary, IdeviceError> {
        match self.get_value(domain, None).await? {
            Some(Value::Dictionary(d)) => Ok(d),
            Some(other) => {
                warn!("GetValue without a key returned a non-dictionary: {other:?}");
                Err(IdeviceError::UnexpectedResponse)
            }
            None => Ok(Dictionary::new()),
        }
    }

    /// Sets a value on the device
    pub async fn set_value(
        &mut self,
        domain: Option<&str>,
        key: &str,
        value: Value,
    ) -> Result<(), IdeviceError> {
        let body = ValueBody {
            domain,
            key: Some(key),
            value: Some(value),
        };
        self.checked_request("SetValue", &body).await?;
        Ok(())
    }

    pub async fn remove_value(
        &mut self,
        domain: Option<&str>,
        key: &str,
    ) -> Result<(), IdeviceError> {
        let body = ValueBody {
            domain,
            key: Some(key),
            value: None,
        };
        self.checked_request("RemoveValue", &body).await?;
        Ok(())
    }

    /// Sends `StartSession` and returns the raw response without acting on it
    ///
    /// Device errors are left in the response.
    pub async fn start_session_unchecked(
        &mut self,
        pairing_file: &PairingFile,
    ) -> Result<Option<LockdownResponse>, IdeviceError> {
        let (host_id, system_buid) = session_identity(pairing_file)?;
        let body = StartSessionBody {
            host_id,
            system_buid,
        };
        self.request("StartSession", &body).await
    }

    /// Starts an authenticated session
    ///
    /// If the device asks for it, the connection is upgraded to TLS in place with the pairing
    /// record's host certificate before this returns.
    ///
    /// # Errors
    /// The pairing record lacks `HostID` or `SystemBUID`, the device rejected the session, or
    /// the TLS handshake failed
    pub async fn start_session(
        &mut self,
        pairing_file: &PairingFile,
    ) -> Result<StartSessionResponse, IdeviceError> {
        let res = self
            .start_session_unchecked(pairing_file)
            .await?
            .ok_or(IdeviceError::ConnectionClosed)?;
        if let Some(e) = &res.error {
            error!("StartSession failed: {e}");
        }
        let res = res.into_result()?;
        let session = StartSessionResponse::try_from(&res)?;
        self.enable_session_ssl(&session, pairing_file).await?;
        Ok(session)
    }

    async fn enable_session_ssl(
        &mut self,
        session: &StartSessionResponse,
        pairing_file: &PairingFile,
    ) -> Result<(), IdeviceError> {
        if session.enable_session_ssl {
            self.idevice.start_tls(pairing_file).await?;
        }
        Ok(())
    }

    /// Stops a session, dropping back to plaintext if TLS was active
    pub async fn stop_session(&mut self, session_id: &str) -> Result<(), IdeviceError> {
        self.checked_request("StopSession", &StopSessionBody { session_id })
            .await?;
        self.idevice.stop_tls().await
    }

    /// Asks lockdownd to start a service
    ///
    /// # Returns
    /// `None` if the device closed the connection instead of answering, which it does for
    /// services that don't exist on some iOS versions
    ///
    /// # Errors
    /// The device reported an error, or the response carried no port
    pub async fn start_service(
        &mut self,
        service_name: &str,
    ) -> Result<Option<ServiceDescriptor>, IdeviceError> {
        if service_name.is_empty() {
            return Err(IdeviceError::InvalidArgument("service name is empty"));
        }
        let body = StartServiceBody {
            service: service_name,
        };
        let Some(res) = self.request("StartService", &body).await? else {
            warn!("Device hung up instead of starting {service_name}");
            return Ok(None);
        };
        if let Some(e) = &res.error {
            error!("Failed to start {service_name}: {e}");
        }
        let res = res.into_result()?;

        let mut descriptor = ServiceDescriptor::try_from(&res)?;
        if descriptor.service_name.is_empty() {
            descriptor.service_name = service_name.to_string();
        }
        debug!(
            "{service_name} is listening on port {} (ssl: {})",
            descriptor.port, descriptor.enable_service_ssl
        );
        Ok(Some(descriptor))
    }

    /// Sends a pairing record for the device to trust
    ///
    /// Private keys are stripped from the record before it is sent. This does not store the
    /// record in usbmuxd; that's up to the caller.
    ///
    /// # Returns
    /// `None` if the device hung up, e.g. because the user dismissed the dialog by unplugging
    ///
    /// # Errors
    /// Any device error other than the expected negotiation outcomes in [`PairingStatus`]
    pub async fn pair(
        &mut self,
        pairing_file: &PairingFile,
    ) -> Result<Option<PairingResult>, IdeviceError> {
        self.pair_with_options(pairing_file, Some(PairingOptions::default()))
            .await
    }

    pub async fn pair_with_options(
        &mut self,
        pairing_file: &PairingFile,
        options: Option<PairingOptions>,
    ) -> Result<Option<PairingResult>, IdeviceError> {
        session_identity(pairing_file)?;
        let body = PairBody {
            pair_record: pairing_file.to_pair_record()?,
            pairing_options: options,
        };
        let Some(res) = self.request("Pair", &body).await? else {
            return Ok(None);
        };
        let result = PairingResult::try_from(res)?;
        debug!("Pair finished with {:?}", result.status);
        Ok(Some(result))
    }

    /// Repeats `Pair` while the trust dialog is pending
    ///
    /// # Arguments
    /// * `attempts` - Upper bound on `Pair` requests; the last pending result is returned once
    ///   it is reached
    pub async fn pair_until_accepted(
        &mut self,
        pairing_file: &PairingFile,
        attempts: usize,
    ) -> Result<Option<PairingResult>, IdeviceError> {
        let mut last = None;
        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(Self::PAIR_RETRY_DELAY).await;
            }
            match self.pair(pairing_file).await? {
                Some(res) if res.status == PairingStatus::PairingDialogResponsePending => {
                    debug!("Waiting for the user to trust this host ({attempt})");
                    last = Some(res);
                }
                other => return Ok(other),
            }
        }
        Ok(last)
    }

    /// Removes this host's pairing from the device
    pub async fn unpair(&mut self, pairing_file: &PairingFile) -> Result<(), IdeviceError> {
        session_identity(pairing_file)?;
        let body = PairBody {
            pair_record: pairing_file.to_pair_record()?,
            pairing_options: None,
        };
        self.checked_request("Unpair", &body).await?;
        Ok(())
    }

    /// Checks that the device still trusts `pairing_file` by starting and stopping a session
    ///
    /// Any failure to start the session means `false`. The session is always stopped again if
    /// one was started.
    pub async fn validate_pair(&mut self, pairing_file: &PairingFile) -> Result<bool, IdeviceError> {
        let res = match self.start_session_unchecked(pairing_file).await {
            Ok(Some(res)) => res,
            Ok(None) => return Ok(false),
            Err(e) => {
                debug!("StartSession failed while validating: {e}");
                return Ok(false);
            }
        };
        if let Some(e) = &res.error {
            debug!("Pair record is not valid: {e}");
            return Ok(false);
        }
        let session = match StartSessionResponse::try_from(&res) {
            Ok(s) => s,
            Err(_) => return Ok(false),
        };

        let valid = match self.enable_session_ssl(&session, pairing_file).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Session TLS failed while validating: {e}");
                false
            }
        };

        match self.stop_session(&session.session_id).await {
            Ok(()) => Ok(valid),
            Err(e) if !valid => {
                debug!("Ignoring StopSession failure on an invalid session: {e}");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Generates a fresh pairing record for this device
    ///
    /// Fetches the device's public key, Wi-Fi address and UDID, then builds the certificate
    /// chain. Heavy in debug builds because of RSA key generation.
    pub async fn create_pairing_record(
        &mut self,
        system_buid: &str,
    ) -> Result<PairingFile, IdeviceError> {
        let public_key = match self.get_value(None, Some("DevicePublicKey")).await? {
            Some(Value::Data(d)) => d,
            other => {
                warn!("Did not get public key data: {other:?}");
                return Err(IdeviceError::UnexpectedResponse);
            }
        };
        let wifi_mac: Option<String> = match self.get_value(None, Some("WiFiAddress")).await? {
            Some(Value::String(s)) => Some(s),
            _ => None,
        };
        let udid: Option<String> = match self.get_value(None, Some("UniqueDeviceID")).await? {
            Some(Value::String(s)) => Some(s),
            _ => None,
        };

        let mut pairing_file =
            crate::ca::generate_pairing_file(&public_key, system_buid, udid.as_deref())?;
        pairing_file.wifi_mac_address = wifi_mac;
        pairing_file.udid = udid;
        Ok(pairing_file)
    }
}

impl From<Idevice> for LockdownClient {
    fn from(value: Idevice) -> Self {
        Self::new(value)
    }
}

fn session_identity(pairing_file: &PairingFile) -> Result<(&str, &str), IdeviceError> {
    let host_id = pairing_file
        .host_id
        .as_deref()
        .ok_or(IdeviceError::InvalidArgument("pairing record has no HostID"))?;
    let system_buid = pairing_file
        .system_buid
        .as_deref()
        .ok_or(IdeviceError::InvalidArgument("pairing record has no SystemBUID"))?;
    Ok((host_id, system_buid))
}
