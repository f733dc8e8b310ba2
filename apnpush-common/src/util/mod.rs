//! Various small utilities shared by the transport and its front ends
use std::time::Duration;

use serde::{Deserialize, Deserializer};

pub mod token;

pub use self::token::{hex_token, normalize_token, token_data};

/// Deserialize a number of whole seconds into a [Duration]
pub fn deserialize_u32_to_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let seconds: u32 = Deserialize::deserialize(deserializer)?;
    Ok(Duration::from_secs(seconds.into()))
}

/// Deserialize a number of milliseconds into a [Duration]
pub fn deserialize_u64_ms_to_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let millis: u64 = Deserialize::deserialize(deserializer)?;
    Ok(Duration::from_millis(millis))
}
