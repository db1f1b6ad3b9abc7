use base64::{Engine, engine::general_purpose::STANDARD};
use rand::Rng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, StaticSecret};

const KEY_LEN: usize = 32;

fn random_from(charset: &[u8], len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| {
            let idx = rng.random_range(0..charset.len());
            charset[idx] as char
        })
        .collect()
}

/// Random device key: 32 lowercase hex characters.
pub fn generate_key() -> String {
    random_from(b"0123456789abcdef", KEY_LEN)
}

/// Short random suffix used to keep certificate common names unique.
pub fn random_slug(len: usize) -> String {
    random_from(
        b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789",
        len,
    )
}

/// Key derived from the device identity and the organization secret, so a
/// device registering again gets the same key back.
pub fn consistent_key(identity: &str, shared_secret: &str) -> String {
    let digest = Sha256::digest(format!("{identity}+{shared_secret}").as_bytes());
    let mut hex = String::with_capacity(KEY_LEN);
    for byte in digest.iter().take(KEY_LEN / 2) {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

/// Base64 encoded X25519 key pair for a WireGuard peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireguardKeys {
    pub private_key: String,
    pub public_key: String,
}

pub fn generate_wireguard_keys() -> WireguardKeys {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    let secret = StaticSecret::from(bytes);
    let public = PublicKey::from(&secret);
    WireguardKeys {
        private_key: STANDARD.encode(secret.to_bytes()),
        public_key: STANDARD.encode(public.as_bytes()),
    }
}

/// Constant-time comparison of a stored secret against a candidate.
pub fn secrets_match(expected: &str, candidate: &str) -> bool {
    if expected.len() != candidate.len() {
        return false;
    }
    expected.as_bytes().ct_eq(candidate.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_are_hex() {
        let key = generate_key();
        assert_eq!(key.len(), 32);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(key, generate_key());
    }

    #[test]
    fn consistent_key_is_stable_per_identity_and_secret() {
        let first = consistent_key("00:11:22:33:44:55", "secret");
        assert_eq!(first, consistent_key("00:11:22:33:44:55", "secret"));
        assert_eq!(first.len(), 32);
        assert_ne!(first, consistent_key("00:11:22:33:44:55", "other"));
        assert_ne!(first, consistent_key("00:11:22:33:44:56", "secret"));
    }

    #[test]
    fn wireguard_public_key_derives_from_private_key() {
        let keys = generate_wireguard_keys();
        assert_eq!(keys.private_key.len(), 44);
        assert_eq!(keys.public_key.len(), 44);

        let raw = STANDARD.decode(&keys.private_key).expect("base64");
        let raw: [u8; 32] = raw.try_into().expect("32 bytes");
        let public = PublicKey::from(&StaticSecret::from(raw));
        assert_eq!(STANDARD.encode(public.as_bytes()), keys.public_key);
        assert_ne!(keys, generate_wireguard_keys());
    }

    #[test]
    fn secrets_match_requires_exact_value() {
        assert!(secrets_match("abc", "abc"));
        assert!(!secrets_match("abc", "abd"));
        assert!(!secrets_match("abc", "abcd"));
    }
}
