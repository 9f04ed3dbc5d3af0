use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use russh::keys::PublicKey;
use sha1::{Digest, Sha1};

/// Character count of the colon-separated hex form of an MD5 digest.
pub const MD5_FINGERPRINT_LENGTH: usize = 47;
/// Character count of the base64 form of a SHA-1 digest.
pub const SHA1_FINGERPRINT_LENGTH: usize = 28;

// The wire encoding of the key, i.e. what the fingerprint digests cover.
fn key_wire_bytes(key: &PublicKey) -> Vec<u8> {
    key.to_bytes().unwrap_or_default()
}

/// Colon-separated lowercase hex MD5 fingerprint of a public key.
pub fn md5_fingerprint(key: &PublicKey) -> String {
    let digest = md5::compute(key_wire_bytes(key));
    digest
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Standard-base64 SHA-1 fingerprint of a public key.
pub fn sha1_fingerprint(key: &PublicKey) -> String {
    BASE64.encode(Sha1::digest(key_wire_bytes(key)))
}

/// Compare a presented host key against an expected fingerprint.
///
/// The digest algorithm is chosen by the character count of the expected
/// value, never inferred from the key itself. A length matching neither known
/// form always fails.
pub fn verify_host_key(expected_fingerprint: &str, key: &PublicKey) -> bool {
    let actual_fingerprint = match expected_fingerprint.chars().count() {
        MD5_FINGERPRINT_LENGTH => md5_fingerprint(key),
        SHA1_FINGERPRINT_LENGTH => sha1_fingerprint(key),
        _ => String::new(),
    };
    expected_fingerprint == actual_fingerprint
}
