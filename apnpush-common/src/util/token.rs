//! Device token hex handling

/// Length of a device token once hex encoded
pub const TOKEN_HEX_LEN: usize = 64;

/// Lowercase the token and drop anything that is not a hex digit, so that
/// `"AB:cd ef"` and `"abcdef"` are the same token.
pub fn normalize_token(token: &str) -> String {
    token
        .chars()
        .map(|c| c.to_ascii_lowercase())
        .filter(char::is_ascii_hexdigit)
        .collect()
}

/// The binary form of a device token.
///
/// Anything past the first 64 hex digits is ignored; fewer than 64 yields
/// an empty token.
pub fn token_data(token: &str) -> Vec<u8> {
    let normal = normalize_token(token);
    if normal.len() < TOKEN_HEX_LEN {
        return vec![];
    }
    // normalized input is pure ascii hex of even length here
    hex::decode(&normal[..TOKEN_HEX_LEN]).unwrap_or_default()
}

/// The lowercase hex form of a binary device token
pub fn hex_token(data: &[u8]) -> String {
    hex::encode(data)
}
