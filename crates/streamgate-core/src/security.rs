//! Shared-secret handling for the auxiliary server

use crate::error::{GatewayError, Result};

/// Header every auxiliary server request must carry
pub const SECRET_HEADER: &str = "x-proxy-secret";

const SECRET_BYTES: usize = 32;

/// Generate a fresh 256-bit secret, hex encoded
///
/// Fails rather than falling back to a weaker source when the OS RNG is
/// unavailable.
pub fn generate_shared_secret() -> Result<String> {
    let mut bytes = [0u8; SECRET_BYTES];
    getrandom::getrandom(&mut bytes)
        .map_err(|e| GatewayError::transport(format!("OS random source unavailable: {e}")))?;
    Ok(hex::encode(bytes))
}

/// Compare a presented secret without short-circuiting on the first mismatch
pub fn secrets_match(expected: &str, presented: &str) -> bool {
    let expected = expected.as_bytes();
    let presented = presented.as_bytes();
    if expected.len() != presented.len() {
        return false;
    }
    expected
        .iter()
        .zip(presented)
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}
