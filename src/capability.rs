//! HMAC-signed URL capabilities and service-secret authentication.
//!
//! A capability is the tuple `(streamId, expires, signature)`. Possession of
//! a valid signature is the only authorization a reader needs — there is no
//! revocation list. Write-side operations (create/connect/delete) instead
//! authenticate with a shared service secret.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Outcome of verifying a signed URL. Expiry is checked separately from the
/// HMAC so callers can distinguish a forged capability (`Invalid`) from a
/// stale-but-genuine one (`Expired`) — write paths tolerate the latter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    Ok,
    Expired,
    Invalid,
}

/// Outcome of verifying the service secret presented on write-side requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretOutcome {
    Ok,
    Missing,
    Invalid,
}

fn sign(secret: &str, stream_id: &str, expires: i64) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(stream_id.as_bytes());
    mac.update(b":");
    mac.update(expires.to_string().as_bytes());
    URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
}

/// Constant-time byte comparison. Always walks the full length of the
/// longer input so execution time does not leak how many leading bytes
/// matched.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let mut diff = (a.len() ^ b.len()) as u8;
    for i in 0..a.len().max(b.len()) {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= x ^ y;
    }
    diff == 0
}

/// Mint `{origin}/v1/proxy/{streamId}?expires={expires}&signature={sig}`.
pub fn mint_signed_url(origin: &str, secret: &str, stream_id: &str, expires: i64) -> String {
    let sig = sign(secret, stream_id, expires);
    format!(
        "{}/v1/proxy/{}?expires={}&signature={}",
        origin.trim_end_matches('/'),
        urlencoding_segment(stream_id),
        expires,
        sig
    )
}

/// Minimal path-segment percent-encoding; stream ids are UUIDs so in
/// practice this is a no-op, but callers should not have to know that.
fn urlencoding_segment(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

/// Verify a signed URL's signature and, if requested, its expiry.
///
/// `check_expiry = false` is used by write paths (renew) that accept an
/// expired-but-HMAC-valid capability.
pub fn verify_signed_url(
    secret: &str,
    stream_id: &str,
    expires: &str,
    signature: &str,
    now: i64,
    check_expiry: bool,
) -> VerifyOutcome {
    let Ok(expires_i) = expires.parse::<i64>() else {
        return VerifyOutcome::Invalid;
    };
    let expected = sign(secret, stream_id, expires_i);
    if !constant_time_eq(expected.as_bytes(), signature.as_bytes()) {
        return VerifyOutcome::Invalid;
    }
    if check_expiry && now > expires_i {
        return VerifyOutcome::Expired;
    }
    VerifyOutcome::Ok
}

/// Verify a service secret presented via `?secret=` or `Authorization: Bearer`.
pub fn verify_service_secret(presented: Option<&str>, expected: &str) -> SecretOutcome {
    match presented {
        None => SecretOutcome::Missing,
        Some(p) if p.is_empty() => SecretOutcome::Missing,
        Some(p) => {
            if constant_time_eq(p.as_bytes(), expected.as_bytes()) {
                SecretOutcome::Ok
            } else {
                SecretOutcome::Invalid
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mint_then_verify_ok() {
        let url = mint_signed_url("https://proxy.example.com", "sekret", "stream-1", 2_000_000_000);
        let query = url.split('?').nth(1).unwrap();
        let mut expires = "";
        let mut sig = "";
        for pair in query.split('&') {
            let (k, v) = pair.split_once('=').unwrap();
            match k {
                "expires" => expires = v,
                "signature" => sig = v,
                _ => {}
            }
        }
        assert_eq!(
            verify_signed_url("sekret", "stream-1", expires, sig, 1_000_000_000, true),
            VerifyOutcome::Ok
        );
    }

    #[test]
    fn test_expired_but_valid_signature() {
        let sig = sign("sekret", "stream-1", 100);
        assert_eq!(
            verify_signed_url("sekret", "stream-1", "100", &sig, 200, true),
            VerifyOutcome::Expired
        );
        assert_eq!(
            verify_signed_url("sekret", "stream-1", "100", &sig, 200, false),
            VerifyOutcome::Ok
        );
    }

    #[test]
    fn test_tampered_signature_is_invalid_not_expired() {
        let sig = sign("sekret", "stream-1", 100);
        let tampered = format!("{}x", &sig[..sig.len() - 1]);
        assert_eq!(
            verify_signed_url("sekret", "stream-1", "100", &tampered, 1, true),
            VerifyOutcome::Invalid
        );
    }

    #[test]
    fn test_non_numeric_expires_is_invalid() {
        assert_eq!(
            verify_signed_url("sekret", "stream-1", "not-a-number", "whatever", 1, true),
            VerifyOutcome::Invalid
        );
    }

    #[test]
    fn test_wrong_secret_is_invalid() {
        let sig = sign("sekret", "stream-1", 2_000_000_000);
        assert_eq!(
            verify_signed_url("other-secret", "stream-1", "2000000000", &sig, 1, true),
            VerifyOutcome::Invalid
        );
    }

    #[test]
    fn test_service_secret_missing_vs_invalid_vs_ok() {
        assert_eq!(verify_service_secret(None, "abc"), SecretOutcome::Missing);
        assert_eq!(verify_service_secret(Some(""), "abc"), SecretOutcome::Missing);
        assert_eq!(verify_service_secret(Some("wrong"), "abc"), SecretOutcome::Invalid);
        assert_eq!(verify_service_secret(Some("abc"), "abc"), SecretOutcome::Ok);
    }

    #[test]
    fn test_constant_time_eq_rejects_different_lengths() {
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(constant_time_eq(b"abc", b"abc"));
    }
}
