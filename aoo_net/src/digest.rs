//! Password digest for the login and group-join requests.
//!
//! Passwords never travel in the clear, but this is *not* a secure
//! channel: the digest is a plain MD5 and serves only as a session-level
//! gate.

use md5::{Digest, Md5};

/// Hashes a password into the uppercase-hex digest form used on the
/// wire. Empty passwords pass through unchanged.
pub fn encrypt_password(password: &str) -> String {
    if password.is_empty() {
        return String::new();
    }
    let digest = Md5::digest(password.as_bytes());
    let mut out = String::with_capacity(32);
    for byte in digest {
        use core::fmt::Write;
        let _ = write!(out, "{byte:02X}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_digest() {
        // md5("abc") = 900150983CD24FB0D6963F7D28E17F72
        assert_eq!(encrypt_password("abc"), "900150983CD24FB0D6963F7D28E17F72");
        assert_eq!(encrypt_password(""), "");
    }
}
