//! Reading the feedback service: tokens the gateway found to be inactive
use apnpush_common::errors::{ApnsErrorKind, Result};

use crate::channel::{ChannelOptions, TlsChannel};
use crate::codec::{self, FeedbackRecord, FEEDBACK_RECORD_LEN};
use crate::credential::{self, Credential};
use crate::environment::Environment;
use crate::settings::ApnsSettings;
use crate::store::CertificateStore;

pub struct FeedbackClient {
    settings: ApnsSettings,
    channel: Option<TlsChannel>,
}

impl FeedbackClient {
    pub fn new(settings: ApnsSettings) -> Self {
        Self {
            settings,
            channel: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.channel
            .as_ref()
            .map_or(false, TlsChannel::is_connected)
    }

    pub fn connect(&mut self, credential: &Credential, environment: Environment) -> Result<()> {
        self.disconnect();
        let environment = credential::resolve_environment(credential, environment)?;
        let (host, port) = self.settings.feedback(environment);
        info!("Connecting to feedback service"; "host" => host, "environment" => %environment);
        let mut channel = TlsChannel::new(
            host,
            port,
            credential.clone(),
            ChannelOptions::from(&self.settings),
        );
        channel.connect()?;
        self.channel = Some(channel);
        Ok(())
    }

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

    pub fn disconnect(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            channel.disconnect();
        }
    }

    /// Read the next record. `None` once the service has nothing more to
    /// say: no data within `read_timeout`, or the connection was closed.
    pub fn read_record(&mut self) -> Result<Option<FeedbackRecord>> {
        let read_timeout = self.settings.read_timeout;
        let channel = self
            .channel
            .as_mut()
            .ok_or(ApnsErrorKind::PushNotConnected)?;
        let mut data = [0u8; FEEDBACK_RECORD_LEN];
        let read = match channel.read_within(&mut data, read_timeout) {
            Ok(read) => read,
            Err(e) if e.kind.is_connection_lost() => {
                debug!("Feedback connection closed: {}", e.kind);
                0
            }
            Err(e) => return Err(e),
        };
        if read == 0 {
            return Ok(None);
        }
        codec::decode_feedback_record(&data[..read]).map(Some)
    }

    /// Read up to `max` records, stopping early at the end of the feed
    pub fn read_token_date_pairs(&mut self, max: usize) -> Result<Vec<FeedbackRecord>> {
        let mut records = Vec::with_capacity(max.min(1024));
        while records.len() < max {
            match self.read_record()? {
                Some(record) => records.push(record),
                None => break,
            }
        }
        debug!("Read {} feedback records", records.len());
        Ok(records)
    }
}
