//! Utility functions shared across the stratum server crates.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum UtilError {
    #[error("Hex decoding error: {0}")]
    HexError(#[from] hex::FromHexError),

    #[error("Base58 decoding error: {0}")]
    Base58Error(#[from] bs58::decode::Error),

    #[error("Invalid format: {0}")]
    InvalidFormat(String),
}

/// Converts a hex string to bytes.
pub fn hex_to_bytes(hex: &str) -> Result<Vec<u8>, UtilError> {
    Ok(hex::decode(hex)?)
}

/// Converts bytes to a hex string.
pub fn bytes_to_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

/// Converts a base58 string to bytes.
pub fn base58_to_bytes(b58: &str) -> Result<Vec<u8>, UtilError> {
    Ok(bs58::decode(b58).into_vec()?)
}

/// Converts bytes to a base58 string.
pub fn bytes_to_base58(bytes: &[u8]) -> String {
    bs58::encode(bytes).into_string()
}

/// Formats a unix timestamp as an ISO 8601 string, for log output.
pub fn format_timestamp(timestamp: i64) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp(timestamp, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| "invalid timestamp".to_string())
}

/// Fixes the non-standard `nan`/`-nan` literals some daemons emit in JSON-RPC
/// responses (e.g. in `getmininginfo`'s `networkhashps`). Textually replaces
/// `:nan` / `:-nan` immediately before a `,` or `}` with `:0`, leaving the
/// rest of the document untouched.
pub fn fix_json_nan(body: &str) -> String {
    let mut out = String::with_capacity(body.len());
    let chars: Vec<char> = body.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == ':' {
            let remainder: String = chars[i + 1..].iter().collect();
            let (matched_len, is_nan) = if remainder.starts_with("-nan") {
                (4, true)
            } else if remainder.starts_with("nan") {
                (3, true)
            } else {
                (0, false)
            };
            if is_nan {
                let next_char = chars.get(i + 1 + matched_len);
                if matches!(next_char, Some(',') | Some('}')) {
                    out.push_str(":0");
                    i += 1 + matched_len;
                    continue;
                }
            }
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}
