//! Token generation, masking, and constant-time verification.
//!
//! The cookie holds the base token. In masked mode every response surfaces a
//! one-time-pad encoding `mask || (token XOR mask)`, so the header value
//! changes per response while still verifying against the same cookie.

use gatehouse_core::{random_token, RandomSourceError};
use subtle::ConstantTimeEq;

/// Generates a fresh base token of `len` bytes, hex-encoded.
pub fn generate(len: usize) -> Result<String, RandomSourceError> {
    Ok(hex::encode(random_token(len)?))
}

/// Masks `token_hex` with a fresh one-time pad for surfacing in a response.
pub fn mask(token_hex: &str) -> Result<String, RandomSourceError> {
    let token = match hex::decode(token_hex) {
        Ok(t) => t,
        Err(_) => return generate(token_hex.len() / 2),
    };
    let pad = random_token(token.len())?;
    let mut out = Vec::with_capacity(token.len() * 2);
    out.extend_from_slice(&pad);
    out.extend(token.iter().zip(pad.iter()).map(|(t, p)| t ^ p));
    Ok(hex::encode(out))
}

/// Recovers the base token bytes from a masked value, if well-formed.
fn unmask(masked: &[u8]) -> Option<Vec<u8>> {
    if masked.is_empty() || masked.len() % 2 != 0 {
        return None;
    }
    let (pad, xored) = masked.split_at(masked.len() / 2);
    Some(xored.iter().zip(pad.iter()).map(|(x, p)| x ^ p).collect())
}

/// Verifies a presented value against the cookie token.
///
/// Accepts either the masked encoding (twice the token length) or the bare
/// token. Comparison is constant-time in the token bytes.
pub fn verify(cookie_hex: &str, presented_hex: &str) -> bool {
    let Ok(cookie) = hex::decode(cookie_hex) else {
        return false;
    };
    let Ok(presented) = hex::decode(presented_hex) else {
        return false;
    };

    if presented.len() == cookie.len() * 2 {
        match unmask(&presented) {
            Some(unmasked) => unmasked.ct_eq(&cookie).into(),
            None => false,
        }
    } else if presented.len() == cookie.len() {
        presented.ct_eq(&cookie).into()
    } else {
        false
    }
}

/// Verifies an exact double-submit match (no masking).
pub fn verify_exact(cookie: &str, presented: &str) -> bool {
    cookie.as_bytes().ct_eq(presented.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masked_values_differ_but_verify() {
        let token = generate(32).unwrap();
        let a = mask(&token).unwrap();
        let b = mask(&token).unwrap();

        assert_ne!(a, b);
        assert!(verify(&token, &a));
        assert!(verify(&token, &b));
    }

    #[test]
    fn bare_token_also_verifies() {
        let token = generate(32).unwrap();
        assert!(verify(&token, &token));
    }

    #[test]
    fn wrong_token_fails() {
        let token = generate(32).unwrap();
        let other = generate(32).unwrap();
        assert!(!verify(&token, &other));
        assert!(!verify(&token, &mask(&other).unwrap()));
    }

    #[test]
    fn malformed_values_fail_closed() {
        let token = generate(32).unwrap();
        assert!(!verify(&token, ""));
        assert!(!verify(&token, "zz-not-hex"));
        assert!(!verify(&token, &token[..10]));
        assert!(!verify("zz-not-hex", &token));
    }

    #[test]
    fn exact_match_is_strict() {
        assert!(verify_exact("abc123", "abc123"));
        assert!(!verify_exact("abc123", "abc124"));
        assert!(!verify_exact("abc123", "abc12"));
    }
}
