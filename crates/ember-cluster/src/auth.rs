use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const CHALLENGE_LEN: usize = 16;
pub const MAC_LEN: usize = 32;

/// Symmetric cluster secret authenticating workers (and cross-host peers)
/// to the master. Sourced from the CLI / `SECRET` env var; a process group
/// without one gets a random per-run secret, which still keeps strangers
/// out because workers inherit it through fork.
#[derive(Clone)]
pub struct ClusterSecret {
    key: Vec<u8>,
}

impl ClusterSecret {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }

    pub fn random() -> Self {
        let mut key = vec![0u8; 32];
        rand::rng().fill_bytes(&mut key);
        Self { key }
    }

    /// Derives from `SECRET` / `SECRET_LENGTH`, or generates one.
    pub fn from_env() -> Self {
        match std::env::var("SECRET") {
            Ok(secret) if !secret.is_empty() => {
                let mut key = secret.into_bytes();
                if let Ok(len) = std::env::var("SECRET_LENGTH")
                    && let Ok(len) = len.parse::<usize>()
                    && len > 0
                    && len < key.len()
                {
                    key.truncate(len);
                }
                Self::new(key)
            }
            _ => Self::random(),
        }
    }

    pub fn fresh_challenge() -> [u8; CHALLENGE_LEN] {
        let mut challenge = [0u8; CHALLENGE_LEN];
        rand::rng().fill_bytes(&mut challenge);
        challenge
    }

    pub fn sign(&self, challenge: &[u8]) -> [u8; MAC_LEN] {
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("hmac accepts any key length");
        mac.update(challenge);
        mac.finalize().into_bytes().into()
    }

    /// Constant-time verification.
    pub fn verify(&self, challenge: &[u8], tag: &[u8]) -> bool {
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("hmac accepts any key length");
        mac.update(challenge);
        mac.verify_slice(tag).is_ok()
    }
}

impl std::fmt::Debug for ClusterSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never log key material.
        write!(f, "ClusterSecret({} bytes)", self.key.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let secret = ClusterSecret::new(b"swordfish".to_vec());
        let challenge = ClusterSecret::fresh_challenge();
        let tag = secret.sign(&challenge);
        assert!(secret.verify(&challenge, &tag));
    }

    #[test]
    fn wrong_secret_fails() {
        let good = ClusterSecret::new(b"right".to_vec());
        let bad = ClusterSecret::new(b"wrong".to_vec());
        let challenge = ClusterSecret::fresh_challenge();
        let tag = bad.sign(&challenge);
        assert!(!good.verify(&challenge, &tag));
    }

    #[test]
    fn truncated_tag_fails() {
        let secret = ClusterSecret::new(b"key".to_vec());
        let challenge = ClusterSecret::fresh_challenge();
        let tag = secret.sign(&challenge);
        assert!(!secret.verify(&challenge, &tag[..16]));
    }
}
