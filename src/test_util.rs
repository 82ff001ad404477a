//! In-process stand-ins for usbmuxd and lockdownd used by unit tests

use std::sync::{Arc, OnceLock};

use plist::{Dictionary, Value};
use rsa::{
    RsaPrivateKey, RsaPublicKey,
    pkcs1::{EncodeRsaPrivateKey, EncodeRsaPublicKey},
    pkcs8::LineEnding,
};
use rustls::{
    ServerConfig,
    pki_types::{PrivateKeyDer, PrivatePkcs1KeyDer},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
};
use tokio_rustls::{TlsAcceptor, server::TlsStream};

use crate::{
    Idevice, IdeviceSocket, ReadWrite, ca,
    pairing_file::PairingFile,
    usbmuxd::{MuxerHeader, MuxerMessageType, RawPacket, UsbmuxdAddr},
    util,
};

/// A real pairing record and a TLS acceptor presenting its device certificate
pub(crate) struct TlsFixture {
    pub(crate) pairing_file: PairingFile,
    pub(crate) acceptor: TlsAcceptor,
}

/// Generated once per test binary; RSA key generation is slow in debug builds
pub(crate) fn tls_fixture() -> &'static TlsFixture {
    static FIXTURE: OnceLock<TlsFixture> = OnceLock::new();
    FIXTURE.get_or_init(|| {
        let key = || RsaPrivateKey::new(&mut rsa::rand_core::OsRng, ca::KEY_BITS).unwrap();
        let device_key = key();
        let device_public = RsaPublicKey::from(&device_key)
            .to_pkcs1_pem(LineEnding::LF)
            .unwrap();
        let pairing_file = ca::generate_pairing_file_with_keys(
            device_public.as_bytes(),
            "AAAAAAAA-BBBB-CCCC-DDDD-EEEEEEEEEEEE",
            Some("00008030-001A2B3C4D5E6F70"),
            key(),
            key(),
        )
        .unwrap();

        let device_key_der = device_key.to_pkcs1_der().unwrap().as_bytes().to_vec();
        let mut config = ServerConfig::builder_with_provider(crate::tls::crypto_provider())
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(
                vec![pairing_file.device_certificate.clone()],
                PrivateKeyDer::Pkcs1(PrivatePkcs1KeyDer::from(device_key_der)),
            )
            .unwrap();
        // Tickets would be left unread in the client's buffer when it drops back to plaintext
        config.send_tls13_tickets = 0;

        TlsFixture {
            pairing_file,
            acceptor: TlsAcceptor::from(Arc::new(config)),
        }
    })
}

/// The device end of a lockdown-framed connection
pub(crate) struct FakeLockdown {
    stream: Option<IdeviceSocket>,
    tls: Option<Box<TlsStream<IdeviceSocket>>>,
}

impl FakeLockdown {
    /// Creates a connected channel and the fake device behind it
    pub(crate) fn pair(label: &str) -> (Idevice, FakeLockdown) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        (Idevice::new(Box::new(client), label), Self::new(Box::new(server)))
    }

    pub(crate) fn new(stream: IdeviceSocket) -> Self {
        Self {
            stream: Some(stream),
            tls: None,
        }
    }

    fn io(&mut self) -> &mut dyn ReadWrite {
        match (&mut self.tls, &mut self.stream) {
            (Some(tls), _) => tls.as_mut() as &mut dyn ReadWrite,
            (None, Some(stream)) => stream.as_mut(),
            (None, None) => panic!("fake device has no stream"),
        }
    }

    /// Completes the server side of the client's TLS handshake
    pub(crate) async fn accept_tls(&mut self, acceptor: &TlsAcceptor) {
        let stream = self.stream.take().expect("TLS is already active");
        self.tls = Some(Box::new(acceptor.accept(stream).await.unwrap()));
    }

    /// Consumes the client's close_notify and resumes plaintext
    ///
    /// The alert is read as a single raw record so nothing the client writes afterwards ends
    /// up in the TLS buffers.
    pub(crate) async fn stop_tls(&mut self) {
        let tls = self.tls.take().expect("TLS is not active");
        let (mut stream, conn) = (*tls).into_inner();
        assert!(!conn.wants_write());

        let mut header = [0u8; 5];
        stream.read_exact(&mut header).await.unwrap();
        // Alert in TLS 1.2, encrypted application data in TLS 1.3
        assert!(matches!(header[0], 0x15 | 0x17), "not a TLS record: {header:?}");
        let mut record = vec![0; u16::from_be_bytes([header[3], header[4]]) as usize];
        stream.read_exact(&mut record).await.unwrap();

        self.stream = Some(stream);
    }

    pub(crate) fn is_tls_active(&self) -> bool {
        self.tls.is_some()
    }

    /// Reads one frame body, `None` once the client hung up
    pub(crate) async fn read_raw_frame(&mut self) -> Option<Vec<u8>> {
        let io = self.io();
        let mut len = [0u8; 4];
        if !util::read_exact_or_eof(&mut *io, &mut len).await.ok()? {
            return None;
        }
        let mut body = vec![0; u32::from_be_bytes(len) as usize];
        if !util::read_exact_or_eof(&mut *io, &mut body).await.ok()? {
            return None;
        }
        Some(body)
    }

    pub(crate) async fn try_recv(&mut self) -> Option<Dictionary> {
        let body = self.read_raw_frame().await?;
        Some(plist::from_bytes(&body).expect("client sent an invalid plist"))
    }

    /// Reads the next request, panicking if the client hung up
    pub(crate) async fn recv(&mut self) -> Dictionary {
        self.try_recv().await.expect("client closed the connection")
    }

    /// Reads the next request and checks its verb
    pub(crate) async fn expect_request(&mut self, verb: &str) -> Dictionary {
        let req = self.recv().await;
        assert_eq!(
            req.get("Request").and_then(Value::as_string),
            Some(verb),
            "unexpected request {req:?}"
        );
        req
    }

    pub(crate) async fn send(&mut self, message: Dictionary) {
        let payload = util::plist_to_xml_bytes(&message).unwrap();
        self.write_bytes(&(payload.len() as u32).to_be_bytes())
            .await;
        self.write_bytes(&payload).await;
    }

    /// Sends a response to `verb` with extra fields
    pub(crate) async fn respond(&mut self, verb: &str, fields: &[(&str, Value)]) {
        let mut res = Dictionary::new();
        res.insert("Request".into(), verb.into());
        for (k, v) in fields {
            res.insert(k.to_string(), v.clone());
        }
        self.send(res).await;
    }

    /// Sends an error response to `verb`
    pub(crate) async fn respond_error(&mut self, verb: &str, error: &str) {
        self.respond(verb, &[("Error", error.into())]).await;
    }

    pub(crate) async fn write_bytes(&mut self, bytes: &[u8]) {
        let io = self.io();
        io.write_all(bytes).await.unwrap();
        io.flush().await.unwrap();
    }

    /// Waits until the client closes its end
    pub(crate) async fn wait_for_close(&mut self) {
        let io = self.io();
        let mut buf = [0u8; 256];
        while io.read(&mut buf).await.map(|n| n > 0).unwrap_or(false) {}
    }
}

/// The daemon end of a usbmuxd conversation
pub(crate) struct FakeMuxd {
    stream: IdeviceSocket,
}

/// Binds a loopback listener standing in for usbmuxd
pub(crate) async fn fake_muxd() -> (UsbmuxdAddr, TcpListener) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = UsbmuxdAddr::TcpSocket(listener.local_addr().unwrap());
    (addr, listener)
}

impl FakeMuxd {
    pub(crate) fn new(stream: IdeviceSocket) -> Self {
        Self { stream }
    }

    pub(crate) async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = listener.accept().await.unwrap();
        Self::new(Box::new(stream))
    }

    pub(crate) async fn recv_with_header(&mut self) -> (MuxerHeader, Dictionary) {
        let packet = RawPacket::read_from(&mut self.stream)
            .await
            .unwrap()
            .expect("client closed the connection");
        let dict = packet.dictionary().unwrap();
        (packet.header, dict)
    }

    pub(crate) async fn recv(&mut self) -> Dictionary {
        self.recv_with_header().await.1
    }

    pub(crate) async fn reply(&mut self, message: Dictionary) {
        RawPacket::new(&message, 1, MuxerMessageType::Plist, 0)
            .unwrap()
            .write_to(&mut self.stream)
            .await
            .unwrap();
    }

    /// Answers a `Connect` request with success and becomes the device end of the proxied stream
    pub(crate) async fn accept_connect(mut self, expected_port: u16) -> FakeLockdown {
        let req = self.recv().await;
        assert_eq!(
            req.get("MessageType").and_then(Value::as_string),
            Some("Connect")
        );
        assert_eq!(
            req.get("PortNumber").and_then(Value::as_unsigned_integer),
            Some(u64::from(crate::usbmuxd::wire_port(expected_port)))
        );
        let mut res = Dictionary::new();
        res.insert("MessageType".into(), "Result".into());
        res.insert("Number".into(), 0u64.into());
        self.reply(res).await;
        FakeLockdown::new(self.stream)
    }

    pub(crate) async fn wait_for_close(&mut self) {
        let mut buf = [0u8; 256];
        while self.stream.read(&mut buf).await.map(|n| n > 0).unwrap_or(false) {}
    }

    pub(crate) fn into_inner(self) -> IdeviceSocket {
        self.stream
    }
}
