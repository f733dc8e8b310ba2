//! Notification record
use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};

use crate::util::token::{normalize_token, token_data, TOKEN_HEX_LEN};

/// Binary size of a device token
pub const DEVICE_TOKEN_SIZE: usize = 32;
/// Largest payload the legacy gateway accepts. Not enforced when encoding.
pub const PAYLOAD_MAX_SIZE: usize = 256;

#[derive(Serialize, Default, Deserialize, Clone, Debug, PartialEq, Eq)]
/// An outbound push request.
///
/// An `identifier` of 0 means "unassigned"; the hub assigns one before the
/// notification is sent. A `priority` of 0 and a missing `expiration` are left
/// out of the frame entirely.
pub struct Notification {
    pub payload: String,
    pub token: String,
    #[serde(default)]
    pub identifier: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<DateTime<Utc>>,
    #[serde(default)]
    pub priority: u8,
}

impl Notification {
    pub fn new(payload: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            token: token.into(),
            ..Default::default()
        }
    }

    pub fn with_identifier(mut self, identifier: u32) -> Self {
        self.identifier = identifier;
        self
    }

    pub fn with_expiration(mut self, expiration: DateTime<Utc>) -> Self {
        self.expiration = Some(expiration);
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Binary device token, empty if the token has fewer than 64 hex digits
    pub fn token_data(&self) -> Vec<u8> {
        token_data(&self.token)
    }

    pub fn payload_data(&self) -> &[u8] {
        self.payload.as_bytes()
    }

    /// Expiration as whole seconds since the epoch, clamped into a `u32`
    pub fn expiration_stamp(&self) -> Option<u32> {
        self.expiration
            .map(|at| u32::try_from(at.timestamp().max(0)).unwrap_or(u32::MAX))
    }

    /// True when the token holds exactly 64 hex digits once separators are
    /// stripped.
    pub fn token_is_valid(&self) -> bool {
        normalize_token(&self.token).len() == TOKEN_HEX_LEN
    }

    pub fn payload_exceeds_limit(&self) -> bool {
        self.payload.len() > PAYLOAD_MAX_SIZE
    }

    /// Is the payload well formed JSON?
    pub fn payload_is_json(&self) -> bool {
        serde_json::from_str::<serde_json::Value>(&self.payload).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    const TOKEN: &str = "00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff";

    #[test]
    fn builder() {
        let at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let notif = Notification::new(r#"{"aps":{}}"#, TOKEN)
            .with_identifier(7)
            .with_expiration(at)
            .with_priority(10);
        assert_eq!(notif.identifier, 7);
        assert_eq!(notif.expiration_stamp(), Some(1_700_000_000));
        assert_eq!(notif.priority, 10);
        assert_eq!(notif.token_data().len(), DEVICE_TOKEN_SIZE);
        assert!(notif.token_is_valid());
        assert!(notif.payload_is_json());
        assert!(!notif.payload_exceeds_limit());
    }

    #[test]
    fn expiration_before_epoch_clamps() {
        let notif = Notification::new("{}", TOKEN).with_expiration(Utc.timestamp_opt(-5, 0).unwrap());
        assert_eq!(notif.expiration_stamp(), Some(0));
        assert_eq!(Notification::new("{}", TOKEN).expiration_stamp(), None);
    }

    #[test]
    fn invalid_inputs() {
        let notif = Notification::new("{not json", "abc");
        assert!(!notif.token_is_valid());
        assert!(notif.token_data().is_empty());
        assert!(!notif.payload_is_json());
        let long = Notification::new("x".repeat(PAYLOAD_MAX_SIZE + 1), TOKEN);
        assert!(long.payload_exceeds_limit());
    }

    #[test]
    fn serde_defaults() {
        let notif: Notification =
            serde_json::from_str(&format!(r#"{{"payload":"{{}}","token":"{TOKEN}"}}"#)).unwrap();
        assert_eq!(notif, Notification::new("{}", TOKEN));
        let out = serde_json::to_value(&notif).unwrap();
        assert!(out.get("expiration").is_none());
    }
}
