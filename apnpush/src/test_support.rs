//! Self signed identities and loopback TLS servers for tests
use std::io::Read;
use std::net::{TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, Private};
use openssl::ssl::{SslAcceptor, SslMethod, SslStream, SslVerifyMode};
use openssl::x509::{X509Builder, X509NameBuilder, X509};

use apnpush_common::logging::init_test_logging;

use crate::codec::{self, FRAME_HEADER_LEN};
use crate::credential::Credential;
use crate::settings::ApnsSettings;

pub const DEV_SUBJECT: &str = "Apple Development IOS Push Services: com.example.app";

/// A fresh P-256 key and a self signed certificate for `common_name`
pub fn make_identity(common_name: &str) -> (X509, PKey<Private>) {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    let key = PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap();

    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_nid(Nid::COMMONNAME, common_name)
        .unwrap();
    let name = name.build();

    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    let serial = BigNum::from_u32(1).unwrap().to_asn1_integer().unwrap();
    builder.set_serial_number(&serial).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(365).unwrap())
        .unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();
    (builder.build(), key)
}

pub fn make_credential(common_name: &str) -> Credential {
    let (cert, key) = make_identity(common_name);
    Credential::new(cert).with_private_key(key)
}

pub fn make_pkcs12(common_name: &str, password: &str) -> Vec<u8> {
    let (cert, key) = make_identity(common_name);
    Pkcs12::builder()
        .name("apnpush test")
        .pkey(&key)
        .cert(&cert)
        .build2(password)
        .unwrap()
        .to_der()
        .unwrap()
}

/// Settings pointing both gateway and feedback at a loopback port
pub fn local_settings(port: u16) -> ApnsSettings {
    ApnsSettings {
        gateway_host: "localhost".to_owned(),
        gateway_sandbox_host: "localhost".to_owned(),
        gateway_port: port,
        feedback_host: "localhost".to_owned(),
        feedback_sandbox_host: "localhost".to_owned(),
        feedback_port: port,
        handshake_timeout: Duration::from_secs(10),
        write_timeout: Duration::from_secs(2),
        read_timeout: Duration::from_secs(2),
        verify_peer: false,
        ca_file: None,
    }
}

/// A TLS server that accepts a single client and hands it to a handler
pub struct MockServer {
    pub port: u16,
    handle: JoinHandle<()>,
}

impl MockServer {
    pub fn serve<F>(handler: F) -> Self
    where
        F: FnOnce(SslStream<TcpStream>) + Send + 'static,
    {
        init_test_logging();
        let (cert, key) = make_identity("localhost");
        let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls()).unwrap();
        builder.set_certificate(&cert).unwrap();
        builder.set_private_key(&key).unwrap();
        // ask for the client certificate but take whatever is offered
        builder.set_verify_callback(SslVerifyMode::PEER, |_, _| true);
        let acceptor = builder.build();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (socket, _) = listener.accept().unwrap();
            let stream = acceptor.accept(socket).unwrap();
            handler(stream);
        });
        Self { port, handle }
    }

    /// Wait for the handler to finish, surfacing its panics
    pub fn join(self) {
        self.handle.join().unwrap();
    }
}

/// Read one push frame off a server side stream
pub fn read_frame(stream: &mut SslStream<TcpStream>) -> Vec<u8> {
    let mut frame = vec![0u8; FRAME_HEADER_LEN];
    stream.read_exact(&mut frame).unwrap();
    let len = codec::frame_len(&frame).unwrap();
    frame.resize(len, 0);
    stream.read_exact(&mut frame[FRAME_HEADER_LEN..]).unwrap();
    frame
}

/// Call `f` until it yields something, sleeping between tries
pub fn poll<T>(mut f: impl FnMut() -> Option<T>) -> T {
    for _ in 0..200 {
        if let Some(value) = f() {
            return value;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("nothing arrived in time");
}
