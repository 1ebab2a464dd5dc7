//! Webhook signature verification using HMAC-SHA256.
//!
//! Gitea signs each delivery with the hook's secret and sends the hex digest
//! in `X-Gitea-Signature`. Newer servers also send `X-Hub-Signature-256` as
//! `sha256=<hex>`; both forms are accepted here.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Parses a signature header into raw bytes.
///
/// Accepts a bare hex digest or one prefixed with `sha256=`. Returns `None`
/// for anything else. Never panics.
///
/// # Examples
///
/// ```
/// use branch_warden::webhooks::parse_signature_header;
///
/// assert_eq!(parse_signature_header("abcd"), Some(vec![0xab, 0xcd]));
/// assert_eq!(parse_signature_header("sha256=abcd"), Some(vec![0xab, 0xcd]));
/// assert!(parse_signature_header("sha1=abcd").is_none());
/// assert!(parse_signature_header("xyz").is_none());
/// ```
pub fn parse_signature_header(header: &str) -> Option<Vec<u8>> {
    let header = header.trim();
    let hex_sig = header.strip_prefix("sha256=").unwrap_or(header);
    if hex_sig.is_empty() {
        return None;
    }
    hex::decode(hex_sig).ok()
}

/// Hex HMAC-SHA256 of `payload`, in the form Gitea sends it.
pub fn sign_payload(payload: &[u8], secret: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret).ok()?;
    mac.update(payload);
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Verifies a delivery signature in constant time.
pub fn verify_signature(payload: &[u8], signature_header: &str, secret: &[u8]) -> bool {
    let Some(expected) = parse_signature_header(signature_header) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}
