//! Password hashing for the users file
//!
//! Stored form: `hmac-sha256$<salt hex>$<mac hex>`, where the MAC is
//! HMAC-SHA256 keyed by the salt over the password.

use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;

/// Type alias for HMAC-SHA256
type HmacSha256 = Hmac<Sha256>;

const SCHEME: &str = "hmac-sha256";
const SALT_LEN: usize = 16;

fn mac_for(password: &str, salt: &[u8]) -> HmacSha256 {
    let mut mac = HmacSha256::new_from_slice(salt).expect("HMAC can take key of any size");
    mac.update(password.as_bytes());
    mac
}

/// Hash a password under a fresh random salt
pub fn hash_password(password: &str) -> String {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill(&mut salt[..]);
    hash_password_with_salt(password, &salt)
}

/// Hash a password under a given salt
pub fn hash_password_with_salt(password: &str, salt: &[u8]) -> String {
    let digest = mac_for(password, salt).finalize().into_bytes();
    format!("{SCHEME}${}${}", hex::encode(salt), hex::encode(digest))
}

/// Check a password against its stored hash in constant time.
/// Malformed hashes never verify.
pub fn verify_password(password: &str, stored: &str) -> bool {
    let mut parts = stored.split('$');
    let (Some(SCHEME), Some(salt), Some(digest), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    let (Ok(salt), Ok(digest)) = (hex::decode(salt), hex::decode(digest)) else {
        return false;
    };
    mac_for(password, &salt).verify_slice(&digest).is_ok()
}

/// Generate a random secret
pub fn generate_secret() -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ\
                            abcdefghijklmnopqrstuvwxyz\
                            0123456789";
    let mut rng = rand::thread_rng();
    let secret: String = (0..24)
        .map(|_| {
            let idx = rng.gen_range(0..CHARSET.len());
            CHARSET[idx] as char
        })
        .collect();
    secret
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_verify() {
        let stored = hash_password("correct horse");
        assert!(stored.starts_with("hmac-sha256$"));
        assert!(verify_password("correct horse", &stored));
        assert!(!verify_password("wrong horse", &stored));
    }

    #[test]
    fn test_salt_changes_hash() {
        let a = hash_password_with_salt("secret", b"salt-one");
        let b = hash_password_with_salt("secret", b"salt-two");
        assert_ne!(a, b);
        assert_eq!(a, hash_password_with_salt("secret", b"salt-one"));
    }

    #[test]
    fn test_malformed_hash_never_verifies() {
        for stored in ["", "secret", "md5$00$00", "hmac-sha256$zz$00", "hmac-sha256$00$00$00"] {
            assert!(!verify_password("secret", stored), "{stored}");
        }
    }

    #[test]
    fn test_generate_secret() {
        let secret = generate_secret();
        assert_eq!(secret.len(), 24);
        assert!(secret.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(secret, generate_secret());
    }
}
