//! Device connection providers and service orchestration
//!
//! A provider knows how to open a fresh connection to a port on one device and where that
//! device's pairing record lives. [`connect_service`] uses one to walk the whole sequence from
//! lockdown to a ready-to-use service stream.

use std::{future::Future, pin::Pin};

use tracing::{debug, error};

use crate::{
    Idevice, IdeviceError, lockdown::LockdownClient, pairing_file::PairingFile,
    usbmuxd::UsbmuxdAddr,
};

/// Future type returned by [`IdeviceProvider`] methods
pub type ProviderFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, IdeviceError>> + Send + 'a>>;

/// A source of connections to one device
pub trait IdeviceProvider: Unpin + Send + Sync + std::fmt::Debug {
    /// Opens a new connection to `port` on the device
    fn connect(&self, port: u16) -> ProviderFuture<'_, Idevice>;

    /// Sent as the `Label` of lockdown requests
    fn label(&self) -> &str;

    /// The pairing record used to start sessions and TLS
    fn get_pairing_file(&self) -> ProviderFuture<'_, PairingFile>;
}

/// Reaches a device through usbmuxd
#[derive(Debug, Clone)]
pub struct UsbmuxdProvider {
    pub addr: UsbmuxdAddr,
    pub tag: u32,
    pub udid: String,
    pub device_id: u32,
    pub label: String,
    /// Overrides the record usbmuxd keeps for the device
    pub pairing_file: Option<PairingFile>,
}

impl UsbmuxdProvider {
    /// Uses `pairing_file` instead of asking usbmuxd for the stored record
    pub fn with_pairing_file(mut self, pairing_file: PairingFile) -> Self {
        self.pairing_file = Some(pairing_file);
        self
    }
}

impl IdeviceProvider for UsbmuxdProvider {
    fn connect(&self, port: u16) -> ProviderFuture<'_, Idevice> {
        Box::pin(async move {
            let usbmuxd = self
                .addr
                .connect(self.tag, self.label.as_str())
                .await?
                .ok_or(IdeviceError::UsbmuxdUnavailable)?;
            usbmuxd
                .connect_to_device(self.device_id, port, self.label.as_str())
                .await
        })
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn get_pairing_file(&self) -> ProviderFuture<'_, PairingFile> {
        Box::pin(async move {
            if let Some(p) = &self.pairing_file {
                return Ok(p.clone());
            }
            let mut usbmuxd = self
                .addr
                .connect(self.tag, self.label.as_str())
                .await?
                .ok_or(IdeviceError::UsbmuxdUnavailable)?;
            usbmuxd
                .get_pair_record(&self.udid)
                .await?
                .ok_or(IdeviceError::NotFound)
        })
    }
}

/// Starts `service_name` through lockdown and connects to it
///
/// Opens lockdown and checks its identity, optionally starts a session with the provider's
/// pairing record, asks for the service, stops the session, and drops the lockdown connection.
/// A second connection is then opened to the port lockdown returned, and upgraded to TLS with
/// the same pairing record if the service asks for it. Nothing is retried.
///
/// # Errors
/// `ServiceNotFound` if lockdown hung up instead of starting the service; every other failure
/// is passed through unchanged
pub async fn connect_service(
    provider: &dyn IdeviceProvider,
    service_name: &str,
    start_session: bool,
) -> Result<Idevice, IdeviceError> {
    if service_name.is_empty() {
        return Err(IdeviceError::InvalidArgument("service name is empty"));
    }

    let mut lockdown = LockdownClient::connect(provider).await?;

    let mut pairing_file = None;
    let session = if start_session {
        let pf = provider.get_pairing_file().await?;
        let session = lockdown.start_session(&pf).await?;
        pairing_file = Some(pf);
        Some(session)
    } else {
        None
    };

    // A hang-up here also took the lockdown connection, so there is no session left to stop
    let Some(descriptor) = lockdown.start_service(service_name).await? else {
        error!("Lockdown didn't start {service_name}");
        return Err(IdeviceError::ServiceNotFound);
    };
    if let Some(session) = &session {
        lockdown.stop_session(&session.session_id).await?;
    }
    drop(lockdown);

    let mut idevice = provider.connect(descriptor.port).await?;
    if descriptor.enable_service_ssl {
        let pf = match pairing_file {
            Some(pf) => pf,
            None => provider.get_pairing_file().await?,
        };
        idevice.start_tls(&pf).await?;
    }
    debug!("Connected to {service_name} on port {}", descriptor.port);
    Ok(idevice)
}

#[cfg(test)]
mod tests {
    use plist::Value;

    use super::*;
    use crate::{
        IdeviceService,
        test_util::{FakeLockdown, FakeMuxd, fake_muxd},
    };

    fn provider(addr: UsbmuxdAddr) -> UsbmuxdProvider {
        UsbmuxdProvider {
            addr,
            tag: 0,
            udid: "udid".into(),
            device_id: 7,
            label: "provider-test".into(),
            pairing_file: Some(crate::pairing_file::tests::sample()),
        }
    }

    async fn answer_query_type(device: &mut FakeLockdown) {
        device.expect_request("QueryType").await;
        device
            .respond("QueryType", &[("Type", LockdownClient::SERVICE_TYPE.into())])
            .await;
    }

    #[derive(Debug)]
    struct EchoService {
        idevice: Idevice,
    }

    impl IdeviceService for EchoService {
        fn service_name() -> &'static str {
            "com.example.echo"
        }

        fn requires_session() -> bool {
            false
        }

        async fn from_stream(idevice: Idevice) -> Result<Self, IdeviceError> {
            Ok(Self { idevice })
        }
    }

    #[tokio::test]
    async fn orchestrates_session_and_second_connection() {
        let (addr, listener) = fake_muxd().await;
        let server = tokio::spawn(async move {
            let mut device = FakeMuxd::accept(&listener)
                .await
                .accept_connect(LockdownClient::LOCKDOWND_PORT)
                .await;
            answer_query_type(&mut device).await;

            device.expect_request("StartSession").await;
            device
                .respond(
                    "StartSession",
                    &[
                        ("SessionID", "s1".into()),
                        ("EnableSessionSSL", false.into()),
                    ],
                )
                .await;

            let req = device.expect_request("StartService").await;
            assert_eq!(
                req.get("Service").and_then(Value::as_string),
                Some("com.example.svc")
            );
            device
                .respond("StartService", &[("Port", 50000u64.into())])
                .await;

            let req = device.expect_request("StopSession").await;
            assert_eq!(
                req.get("SessionID").and_then(Value::as_string),
                Some("s1")
            );
            device.respond("StopSession", &[]).await;
            // The lockdown connection is dropped before the service connection is made
            assert!(device.try_recv().await.is_none());

            let mut service = FakeMuxd::accept(&listener).await.accept_connect(50000).await;
            let req = service.recv().await;
            assert_eq!(req.get("Hello").and_then(Value::as_string), Some("svc"));
        });

        let provider = provider(addr);
        let mut idevice = connect_service(&provider, "com.example.svc", true)
            .await
            .unwrap();
        assert!(!idevice.is_tls_active());

        let mut hello = plist::Dictionary::new();
        hello.insert("Hello".into(), "svc".into());
        idevice.send_plist(&hello).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn lockdown_identity_is_checked() {
        let (addr, listener) = fake_muxd().await;
        let server = tokio::spawn(async move {
            let mut device = FakeMuxd::accept(&listener)
                .await
                .accept_connect(LockdownClient::LOCKDOWND_PORT)
                .await;
            device.expect_request("QueryType").await;
            device
                .respond("QueryType", &[("Type", "com.apple.afc".into())])
                .await;
        });
        let res = connect_service(&provider(addr), "com.example.svc", false).await;
        match res {
            Err(IdeviceError::InvalidServiceType(t)) => assert_eq!(t, "com.apple.afc"),
            other => panic!("unexpected {other:?}"),
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn missing_service_and_errors_pass_through() {
        let (addr, listener) = fake_muxd().await;
        let server = tokio::spawn(async move {
            let mut device = FakeMuxd::accept(&listener)
                .await
                .accept_connect(LockdownClient::LOCKDOWND_PORT)
                .await;
            answer_query_type(&mut device).await;
            device.expect_request("StartService").await;
            drop(device);

            let mut device = FakeMuxd::accept(&listener)
                .await
                .accept_connect(LockdownClient::LOCKDOWND_PORT)
                .await;
            answer_query_type(&mut device).await;
            device.expect_request("StartService").await;
            device
                .respond_error("StartService", "InvalidService")
                .await;
        });

        let provider = provider(addr);
        assert!(matches!(
            connect_service(&provider, "com.example.gone", false).await,
            Err(IdeviceError::ServiceNotFound)
        ));
        assert!(matches!(
            connect_service(&provider, "com.example.bad", false).await,
            Err(IdeviceError::Lockdown(crate::lockdown::LockdownError::InvalidService))
        ));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn hang_up_inside_a_session_is_service_not_found() {
        let (addr, listener) = fake_muxd().await;
        let server = tokio::spawn(async move {
            let mut device = FakeMuxd::accept(&listener)
                .await
                .accept_connect(LockdownClient::LOCKDOWND_PORT)
                .await;
            answer_query_type(&mut device).await;
            device.expect_request("StartSession").await;
            device
                .respond(
                    "StartSession",
                    &[
                        ("SessionID", "s1".into()),
                        ("EnableSessionSSL", false.into()),
                    ],
                )
                .await;
            device.expect_request("StartService").await;
        });

        assert!(matches!(
            connect_service(&provider(addr), "com.example.gone", true).await,
            Err(IdeviceError::ServiceNotFound)
        ));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn service_ssl_upgrades_the_second_connection() {
        let fixture = crate::test_util::tls_fixture();
        let (addr, listener) = fake_muxd().await;
        let server = tokio::spawn(async move {
            let mut device = FakeMuxd::accept(&listener)
                .await
                .accept_connect(LockdownClient::LOCKDOWND_PORT)
                .await;
            answer_query_type(&mut device).await;
            device.expect_request("StartService").await;
            device
                .respond(
                    "StartService",
                    &[
                        ("Port", 50002u64.into()),
                        ("EnableServiceSSL", true.into()),
                    ],
                )
                .await;
            drop(device);

            let mut service = FakeMuxd::accept(&listener).await.accept_connect(50002).await;
            service.accept_tls(&fixture.acceptor).await;
            let req = service.recv().await;
            assert_eq!(req.get("Hello").and_then(Value::as_string), Some("tls"));
        });

        let provider = provider(addr).with_pairing_file(fixture.pairing_file.clone());
        let mut idevice = connect_service(&provider, "com.example.secure", false)
            .await
            .unwrap();
        assert!(idevice.is_tls_active());

        let mut hello = plist::Dictionary::new();
        hello.insert("Hello".into(), "tls".into());
        idevice.send_plist(&hello).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn service_trait_connects_by_name() {
        let (addr, listener) = fake_muxd().await;
        let server = tokio::spawn(async move {
            let mut device = FakeMuxd::accept(&listener)
                .await
                .accept_connect(LockdownClient::LOCKDOWND_PORT)
                .await;
            answer_query_type(&mut device).await;
            let req = device.expect_request("StartService").await;
            assert_eq!(
                req.get("Service").and_then(Value::as_string),
                Some("com.example.echo")
            );
            device
                .respond("StartService", &[("Port", 50001u64.into())])
                .await;
            let _service = FakeMuxd::accept(&listener).await.accept_connect(50001).await;
        });

        let service = EchoService::connect(&provider(addr)).await.unwrap();
        assert!(service.idevice.is_connected());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn muxer_refusal_surfaces_its_code() {
        let (addr, listener) = fake_muxd().await;
        let server = tokio::spawn(async move {
            let mut muxd = FakeMuxd::accept(&listener).await;
            muxd.recv().await;
            let mut res = plist::Dictionary::new();
            res.insert("MessageType".into(), "Result".into());
            res.insert("Number".into(), 3u64.into());
            muxd.reply(res).await;
        });
        assert!(matches!(
            connect_service(&provider(addr), "com.example.svc", false).await,
            Err(IdeviceError::Muxer(
                crate::usbmuxd::MuxerResultCode::ConnectionRefused
            ))
        ));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn empty_service_name_fails_before_io() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = UsbmuxdAddr::TcpSocket(listener.local_addr().unwrap());
        drop(listener);
        assert!(matches!(
            connect_service(&provider(addr), "", true).await,
            Err(IdeviceError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn absent_muxer_is_unavailable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = UsbmuxdAddr::TcpSocket(listener.local_addr().unwrap());
        drop(listener);
        assert!(matches!(
            connect_service(&provider(addr), "com.example.svc", false).await,
            Err(IdeviceError::UsbmuxdUnavailable)
        ));
    }
}
