use std::path::PathBuf;
use std::time::Duration;

use serde_derive::Deserialize;

use apnpush_common::util::deserialize_u64_ms_to_duration;

use crate::environment::Environment;

pub const GATEWAY_HOST: &str = "gateway.push.apple.com";
pub const GATEWAY_SANDBOX_HOST: &str = "gateway.sandbox.push.apple.com";
pub const GATEWAY_PORT: u16 = 2195;
pub const FEEDBACK_HOST: &str = "feedback.push.apple.com";
pub const FEEDBACK_SANDBOX_HOST: &str = "feedback.sandbox.push.apple.com";
pub const FEEDBACK_PORT: u16 = 2196;

/// Settings for the APNs gateway and feedback connections
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
#[serde(deny_unknown_fields)]
pub struct ApnsSettings {
    pub gateway_host: String,
    pub gateway_sandbox_host: String,
    pub gateway_port: u16,
    pub feedback_host: String,
    pub feedback_sandbox_host: String,
    pub feedback_port: u16,
    /// Wall clock budget for the TCP connect and the TLS handshake (ms)
    #[serde(deserialize_with = "deserialize_u64_ms_to_duration")]
    pub handshake_timeout: Duration,
    /// How long a write may keep retrying a would-block transport (ms)
    #[serde(deserialize_with = "deserialize_u64_ms_to_duration")]
    pub write_timeout: Duration,
    /// How long the feedback reader waits for the rest of a record (ms)
    #[serde(deserialize_with = "deserialize_u64_ms_to_duration")]
    pub read_timeout: Duration,
    /// Verify the server certificate chain and host name
    pub verify_peer: bool,
    /// Extra trust anchors (PEM) for the server certificate
    pub ca_file: Option<PathBuf>,
}

impl Default for ApnsSettings {
    fn default() -> Self {
        Self {
            gateway_host: GATEWAY_HOST.to_owned(),
            gateway_sandbox_host: GATEWAY_SANDBOX_HOST.to_owned(),
            gateway_port: GATEWAY_PORT,
            feedback_host: FEEDBACK_HOST.to_owned(),
            feedback_sandbox_host: FEEDBACK_SANDBOX_HOST.to_owned(),
            feedback_port: FEEDBACK_PORT,
            handshake_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(1),
            verify_peer: true,
            ca_file: None,
        }
    }
}

impl ApnsSettings {
    /// Gateway host and port for a resolved environment
    pub fn gateway(&self, environment: Environment) -> (&str, u16) {
        match environment {
            Environment::Sandbox => (&self.gateway_sandbox_host, self.gateway_port),
            _ => (&self.gateway_host, self.gateway_port),
        }
    }

    /// Feedback host and port for a resolved environment
    pub fn feedback(&self, environment: Environment) -> (&str, u16) {
        match environment {
            Environment::Sandbox => (&self.feedback_sandbox_host, self.feedback_port),
            _ => (&self.feedback_host, self.feedback_port),
        }
    }
}
