//! Random identifier and token generation.

use rand::rngs::OsRng;
use rand::RngCore;

/// The OS random source was unavailable.
#[derive(Debug, thiserror::Error)]
#[error("operating system random source unavailable")]
pub struct RandomSourceError;

/// Generates `len` cryptographically random bytes.
///
/// Fails only if the operating system random source is unavailable. Callers
/// that need secret material (CSRF tokens) must propagate the error rather
/// than fall back to a predictable source.
pub fn random_token(len: usize) -> Result<Vec<u8>, RandomSourceError> {
    let mut buf = vec![0u8; len];
    OsRng
        .try_fill_bytes(&mut buf)
        .map_err(|_| RandomSourceError)?;
    Ok(buf)
}

/// Generates a job identifier: 12 random bytes encoded as 24 hex characters.
///
/// If the OS random source fails, a time-based identifier of the same shape
/// is produced instead. Job identifiers are not secrets, so the degraded
/// source is acceptable there.
pub fn job_id() -> String {
    match random_token(12) {
        Ok(bytes) => hex::encode(bytes),
        Err(_) => time_based_id(),
    }
}

fn time_based_id() -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{nanos:024x}")
}
