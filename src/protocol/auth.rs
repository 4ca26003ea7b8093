//! Backend password authentication
//!
//! Only the MD5 challenge is answered. Every other mechanism the backend may
//! ask for is rejected by the backend leg before this module is reached.
//!
//! Reference: <https://www.postgresql.org/docs/current/auth-password.html>

use md5::{Digest, Md5};

use super::codec::encode_message;
use super::constants::MSG_PASSWORD;

/// Compute the MD5 password string PostgreSQL expects.
///
/// The format is `"md5" + md5(md5(password + user) + salt)`, lowercase hex,
/// 35 characters in total.
///
/// ```
/// use pgaudit_proxy::protocol::auth::compute_md5_password;
///
/// let hash = compute_md5_password("user", "password", &[0x01, 0x02, 0x03, 0x04]);
/// assert!(hash.starts_with("md5"));
/// assert_eq!(hash.len(), 35);
/// ```
pub fn compute_md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let mut hasher = Md5::new();
    hasher.update(password.as_bytes());
    hasher.update(user.as_bytes());
    let inner = hex_encode(&hasher.finalize());

    let mut hasher = Md5::new();
    hasher.update(inner.as_bytes());
    hasher.update(salt);

    format!("md5{}", hex_encode(&hasher.finalize()))
}

/// Build the complete PasswordMessage answering an MD5 challenge.
///
/// The result is `'p'`, a length of 40, then the 35-byte hash string and a NUL.
pub fn compute_md5_response(password: &str, username: &str, salt: &[u8; 4]) -> Vec<u8> {
    let hash = compute_md5_password(username, password, salt);
    let mut payload = Vec::with_capacity(hash.len() + 1);
    payload.extend_from_slice(hash.as_bytes());
    payload.push(0);
    encode_message(MSG_PASSWORD, &payload)
}

/// Lowercase hex encoding.
pub fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_md5_password_known_value() {
        let hash = compute_md5_password("alice", "secret", &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(hash, "md598a0412b9c31436fc53776e863350083");

        let hash = compute_md5_password("user", "pw", &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(hash, "md546eacb7412409e1444bde22e56e70744");
    }

    #[test]
    fn test_md5_password_format() {
        let hash = compute_md5_password("user", "password", &[0xab, 0xcd, 0xef, 0x12]);
        assert_eq!(hash.len(), 35);
        let hex_part = &hash[3..];
        assert!(hex_part.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hex_part, hex_part.to_lowercase());
    }

    #[test]
    fn test_md5_password_sensitive_to_every_input() {
        let salt = [0x01, 0x02, 0x03, 0x04];
        let base = compute_md5_password("user", "pw", &salt);

        assert_ne!(base, compute_md5_password("usex", "pw", &salt));
        assert_ne!(base, compute_md5_password("user", "px", &salt));
        assert_ne!(base, compute_md5_password("user", "pw", &[0x01, 0x02, 0x03, 0x05]));
    }

    #[test]
    fn test_md5_response_layout() {
        let msg = compute_md5_response("pw", "user", &[0x01, 0x02, 0x03, 0x04]);

        // 'p' + len(4) + "md5" + 32 hex + NUL
        assert_eq!(msg.len(), 1 + 4 + 3 + 32 + 1);
        assert_eq!(msg[0], b'p');
        assert_eq!(u32::from_be_bytes([msg[1], msg[2], msg[3], msg[4]]), 40);
        assert_eq!(&msg[5..8], b"md5");
        assert_eq!(msg[msg.len() - 1], 0);
        assert_eq!(
            std::str::from_utf8(&msg[5..40]).unwrap(),
            "md546eacb7412409e1444bde22e56e70744"
        );
    }

    #[test]
    fn test_md5_response_deterministic() {
        let salt = [0x10, 0x20, 0x30, 0x40];
        assert_eq!(
            compute_md5_response("pw", "user", &salt),
            compute_md5_response("pw", "user", &salt)
        );
    }

    #[test]
    fn test_hex_encode() {
        assert_eq!(hex_encode(&[0x00, 0x0f, 0xab, 0xff]), "000fabff");
        assert_eq!(hex_encode(&[]), "");
    }
}
