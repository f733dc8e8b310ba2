//! Sending notifications to the APNs gateway
use apnpush_common::errors::{ApnsError, ApnsErrorKind, Result};
use apnpush_common::notification::Notification;

use crate::channel::{ChannelOptions, TlsChannel};
use crate::codec::{self, ERROR_RESPONSE_LEN};
use crate::credential::{self, Credential};
use crate::environment::Environment;
use crate::settings::ApnsSettings;
use crate::store::CertificateStore;

/// What the hub needs from a gateway connection
#[cfg_attr(test, mockall::automock)]
pub trait PushTransport {
    fn connect(&mut self, credential: &Credential, environment: Environment) -> Result<()>;

    fn reconnect(&mut self) -> Result<()>;

    fn disconnect(&mut self);

    fn push_notification(&mut self, notification: &Notification) -> Result<()>;

    /// Poll for an error response: `(0, None)` when there is none
    fn read_failed_identifier(&mut self) -> Result<(u32, Option<ApnsError>)>;
}

/// A connection to the push gateway
pub struct Pusher {
    settings: ApnsSettings,
    channel: Option<TlsChannel>,
}

impl Pusher {
    pub fn new(settings: ApnsSettings) -> Self {
        Self {
            settings,
            channel: None,
        }
    }

    /// Build a pusher and connect it in one go
    pub fn connected(
        settings: ApnsSettings,
        credential: &Credential,
        environment: Environment,
    ) -> Result<Self> {
        let mut pusher = Self::new(settings);
        pusher.connect(credential, environment)?;
        Ok(pusher)
    }

    pub fn settings(&self) -> &ApnsSettings {
        &self.settings
    }

    pub fn is_connected(&self) -> bool {
        self.channel
            .as_ref()
            .map_or(false, TlsChannel::is_connected)
    }

    /// Connect using the single push identity inside a PKCS#12 bundle
    pub fn connect_pkcs12(
        &mut self,
        store: &dyn CertificateStore,
        data: &[u8],
        password: &str,
        environment: Environment,
    ) -> Result<()> {
        let credential = credential::load_single_from_pkcs12(store, data, password)?;
        self.connect(&credential, environment)
    }

    pub fn push_payload(&mut self, payload: &str, token: &str, identifier: u32) -> Result<()> {
        self.push_notification(&Notification::new(payload, token).with_identifier(identifier))
    }
}

impl PushTransport for Pusher {
    fn connect(&mut self, credential: &Credential, environment: Environment) -> Result<()> {
        self.disconnect();
        let environment = credential::resolve_environment(credential, environment)?;
        let (host, port) = self.settings.gateway(environment);
        info!("Connecting to push gateway"; "host" => host, "environment" => %environment);
        // keep the channel even when this attempt fails so reconnect can retry
        let channel = self.channel.insert(TlsChannel::new(
            host,
            port,
            credential.clone(),
            ChannelOptions::from(&self.settings),
        ));
        channel.connect()
    }

    fn reconnect(&mut self) -> Result<()> {
        let channel = self
            .channel
            .as_mut()
            .ok_or(ApnsErrorKind::PushNotConnected)?;
        info!("Reconnecting to push gateway"; "host" => channel.host());
        channel.connect()
    }

    fn disconnect(&mut self) {
        if let Some(channel) = self.channel.as_mut() {
            channel.disconnect();
        }
    }

    fn push_notification(&mut self, notification: &Notification) -> Result<()> {
        let channel = self
            .channel
            .as_mut()
            .filter(|channel| channel.is_connected())
            .ok_or(ApnsErrorKind::PushNotConnected)?;
        let frame = codec::encode_notification(notification);
        let written = channel.write(&frame)?;
        if written != frame.len() {
            return Err(ApnsErrorKind::PushWriteFail {
                written,
                expected: frame.len(),
            }
            .into());
        }
        trace!("Pushed notification"; "identifier" => notification.identifier, "bytes" => written);
        Ok(())
    }

    fn read_failed_identifier(&mut self) -> Result<(u32, Option<ApnsError>)> {
        let read_timeout = self.settings.read_timeout;
        let channel = self
            .channel
            .as_mut()
            .ok_or(ApnsErrorKind::PushNotConnected)?;
        let mut data = [0u8; ERROR_RESPONSE_LEN];
        let mut read = channel.read(&mut data)?;
        if read == 0 {
            return Ok((0, None));
        }
        if read < ERROR_RESPONSE_LEN {
            read += channel.read_within(&mut data[read..], read_timeout)?;
        }
        let response = codec::decode_error_response(&data[..read])?;
        let error: ApnsError = response.error_kind().into();
        info!("Gateway rejected notification";
              "identifier" => response.identifier, "status" => response.status);
        Ok((response.identifier, Some(error)))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::time::Duration;

    use super::*;
    use crate::codec::{decode_frame, encode_error_response, encode_notification, ErrorResponse};
    use crate::store::OpensslStore;
    use crate::test_support::{
        local_settings, make_credential, make_pkcs12, poll, read_frame, MockServer, DEV_SUBJECT,
    };

    const TOKEN: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

    #[test]
    fn not_connected() {
        let mut pusher = Pusher::new(ApnsSettings::default());
        assert!(!pusher.is_connected());
        assert_eq!(
            pusher.reconnect().unwrap_err().kind,
            ApnsErrorKind::PushNotConnected
        );
        assert_eq!(
            pusher
                .push_payload("{}", TOKEN, 1)
                .unwrap_err()
                .kind,
            ApnsErrorKind::PushNotConnected
        );
        assert_eq!(
            pusher.read_failed_identifier().unwrap_err().kind,
            ApnsErrorKind::PushNotConnected
        );
        pusher.disconnect();
    }

    #[test]
    fn rejects_non_push_certificate() {
        let mut pusher = Pusher::new(local_settings(1));
        let err = pusher
            .connect(&make_credential("localhost"), Environment::Auto)
            .unwrap_err();
        assert!(matches!(
            err.kind,
            ApnsErrorKind::CertificateNotPushCapable(_)
        ));
        assert!(!pusher.is_connected());
    }

    #[test]
    fn push_and_read_error_response() {
        let server = MockServer::serve(|mut stream| {
            let frame = decode_frame(&read_frame(&mut stream)).unwrap();
            assert_eq!(frame.identifier(), Some(1));
            assert_eq!(frame.token(), Some(&[0xaa; 32][..]));
            assert_eq!(frame.payload(), Some(&br#"{"aps":{"alert":"hi"}}"#[..]));
            let response = ErrorResponse {
                status: 2,
                identifier: 1,
            };
            stream.write_all(&encode_error_response(&response)).unwrap();
            stream.shutdown().unwrap();
        });

        let mut pusher = Pusher::connected(
            local_settings(server.port),
            &make_credential(DEV_SUBJECT),
            Environment::Auto,
        )
        .unwrap();
        assert!(pusher.is_connected());
        pusher
            .push_payload(r#"{"aps":{"alert":"hi"}}"#, TOKEN, 1)
            .unwrap();

        let (identifier, error) = poll(|| match pusher.read_failed_identifier().unwrap() {
            (0, None) => None,
            found => Some(found),
        });
        assert_eq!(identifier, 1);
        assert_eq!(error.unwrap().kind, ApnsErrorKind::ApnMissingDeviceToken);
        server.join();
    }

    #[test]
    fn connect_from_pkcs12() {
        let server = MockServer::serve(|mut stream| {
            let frame = decode_frame(&read_frame(&mut stream)).unwrap();
            assert_eq!(frame.identifier(), Some(9));
        });
        let data = make_pkcs12(DEV_SUBJECT, "secret");
        let mut pusher = Pusher::new(local_settings(server.port));
        pusher
            .connect_pkcs12(&OpensslStore::new(), &data, "secret", Environment::Sandbox)
            .unwrap();
        pusher.push_payload("{}", TOKEN, 9).unwrap();
        server.join();
        pusher.disconnect();
        assert!(!pusher.is_connected());
    }

    #[test]
    fn server_reads_exactly_one_frame() {
        let notification = Notification::new(r#"{"aps":{"badge":3}}"#, TOKEN)
            .with_identifier(7)
            .with_priority(10);
        let expected = encode_notification(&notification);
        let server = MockServer::serve(move |mut stream| {
            assert_eq!(read_frame(&mut stream), expected);
            // the second frame starts right where the first ended
            let second = decode_frame(&read_frame(&mut stream)).unwrap();
            assert_eq!(second.identifier(), Some(8));
        });
        let mut pusher = Pusher::connected(
            local_settings(server.port),
            &make_credential(DEV_SUBJECT),
            Environment::Sandbox,
        )
        .unwrap();
        pusher.push_notification(&notification).unwrap();
        pusher.push_payload("{}", TOKEN, 8).unwrap();
        server.join();
    }

    #[test]
    fn short_write_is_push_write_fail() {
        let (done, finished) = crossbeam_channel::bounded::<()>(1);
        // hold the connection open without ever reading from it
        let server = MockServer::serve(move |_stream| {
            let _ = finished.recv();
        });
        let mut settings = local_settings(server.port);
        settings.write_timeout = Duration::from_millis(100);
        let mut pusher =
            Pusher::connected(settings, &make_credential(DEV_SUBJECT), Environment::Auto).unwrap();

        let payload = "x".repeat(60_000);
        let err = (0..2000)
            .find_map(|id| pusher.push_payload(&payload, TOKEN, id + 1).err())
            .expect("the socket buffers never filled");
        match err.kind {
            ApnsErrorKind::PushWriteFail { written, expected } => {
                assert!(written < expected);
                assert!(expected > payload.len());
            }
            other => panic!("unexpected error: {}", other),
        }
        done.send(()).unwrap();
        server.join();
    }
}
