//! HMAC-SHA256 verification of inbound webhook payloads
//!
//! The platform signs every notification body with the application's client
//! secret and sends the lowercase hex digest in the `X-Nylas-Signature` header.
//! Verification never fails loudly: a missing, malformed or mismatched
//! signature simply yields `false`.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the hex digest of the raw request body
pub const SIGNATURE_HEADER: &str = "X-Nylas-Signature";

/// Compute the lowercase hex HMAC-SHA256 of `body` keyed by `secret`.
pub fn compute_signature(secret: &[u8], body: &[u8]) -> String {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify `provided_signature_hex` against the digest of `raw_body`.
///
/// The comparison is constant-time over the hex text, so a length mismatch or
/// any differing character (including letter case) fails verification.
pub fn verify_signature(secret: &[u8], raw_body: &[u8], provided_signature_hex: &str) -> bool {
    let expected = compute_signature(secret, raw_body);
    expected
        .as_bytes()
        .ct_eq(provided_signature_hex.as_bytes())
        .into()
}
