//! Command line settings, layered from a config file and the environment
use std::path::PathBuf;
use std::time::Duration;

use config::{Config, ConfigError, Environment as EnvSource, File};
use serde_derive::Deserialize;

use apnpush::environment::Environment;
use apnpush::settings::ApnsSettings;
use apnpush_common::util::{deserialize_u32_to_duration, deserialize_u64_ms_to_duration};

pub const ENV_PREFIX: &str = "apnpush";

/// Priorities the gateway understands; 0 leaves the item out of the frame
const PRIORITIES: [u8; 3] = [0, 5, 10];

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// PKCS#12 bundle holding the push identity
    pub pkcs12: Option<PathBuf>,
    pub password: String,
    pub environment: Environment,
    pub payload: String,
    pub tokens: Vec<String>,
    pub priority: u8,
    /// Expire notifications this many seconds after sending
    pub expiry_seconds: Option<u64>,
    /// How long sent notifications are kept for matching error responses
    #[serde(deserialize_with = "deserialize_u32_to_duration")]
    pub feedback_span: Duration,
    /// Pause between the last push and reading error responses (ms)
    #[serde(deserialize_with = "deserialize_u64_ms_to_duration")]
    pub read_failed_delay: Duration,
    /// Most feedback records, or error responses, read in one go
    pub feedback_max: usize,
    /// Directory of PEM certificates and keys
    pub certificate_dir: Option<PathBuf>,
    /// Append info and warning messages to this file
    pub log_file: Option<PathBuf>,
    pub human_logs: bool,
    pub apns: ApnsSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            pkcs12: None,
            password: "".to_owned(),
            environment: Environment::Auto,
            payload: r#"{"aps":{"alert":"Testing.. (0)","badge":1,"sound":"default"}}"#.to_owned(),
            tokens: vec![],
            priority: 0,
            expiry_seconds: None,
            feedback_span: Duration::from_secs(30),
            read_failed_delay: Duration::from_millis(1000),
            feedback_max: 1000,
            certificate_dir: None,
            log_file: None,
            human_logs: false,
            apns: ApnsSettings::default(),
        }
    }
}

impl Settings {
    /// Load the settings from the config file if supplied, then the environment.
    pub fn with_env_and_config_file(filename: &Option<String>) -> Result<Self, ConfigError> {
        let mut s = Config::builder();

        // Merge the config file if supplied
        if let Some(config_filename) = filename {
            s = s.add_source(File::with_name(config_filename));
        }

        // Merge the environment overrides, e.g. `APNPUSH__APNS__VERIFY_PEER`.
        // `tokens` may be given as a comma separated list.
        s = s.add_source(
            EnvSource::with_prefix(&ENV_PREFIX.to_uppercase())
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("tokens"),
        );

        let built = s.build()?;
        let s = built.try_deserialize::<Settings>()?;
        s.validate()?;
        Ok(s)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = |val: Duration, name| {
            if val.is_zero() {
                return Err(ConfigError::Message(format!(
                    "Invalid {}_{}: cannot be 0",
                    ENV_PREFIX.to_uppercase(),
                    name
                )));
            }
            Ok(())
        };
        non_zero(self.feedback_span, "FEEDBACK_SPAN")?;
        non_zero(self.apns.handshake_timeout, "APNS__HANDSHAKE_TIMEOUT")?;
        non_zero(self.apns.write_timeout, "APNS__WRITE_TIMEOUT")?;
        non_zero(self.apns.read_timeout, "APNS__READ_TIMEOUT")?;
        if !PRIORITIES.contains(&self.priority) {
            return Err(ConfigError::Message(format!(
                "Invalid {}_PRIORITY: {} is not one of 5 or 10",
                ENV_PREFIX.to_uppercase(),
                self.priority
            )));
        }
        if self.feedback_max == 0 {
            return Err(ConfigError::Message(format!(
                "Invalid {}_FEEDBACK_MAX: cannot be 0",
                ENV_PREFIX.to_uppercase()
            )));
        }
        Ok(())
    }
}
