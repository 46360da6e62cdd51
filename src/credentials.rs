use std::collections::HashMap;

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use thiserror::Error;

const NONCE_SIZE: usize = 12;
const KEY_LENGTH: &str = "key must be 32 bytes (64 hex characters)";

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("Invalid credential key: {0}")]
    InvalidKey(String),
    #[error("No credentials configured for user '{0}'")]
    UnknownUser(String),
    #[error("Sealing failed: {0}")]
    Seal(String),
    #[error("Cannot unseal password for '{user}': {reason}")]
    Unseal { user: String, reason: String },
}

/// Supplies the password of a database user on demand.
pub trait CredentialProvider: Send + Sync {
    fn password(&self, user: &str) -> Result<String, CredentialError>;
}

fn cipher_from_hex(key_hex: &str) -> Result<Aes256Gcm, CredentialError> {
    let key_bytes = hex::decode(key_hex.trim())
        .map_err(|e| CredentialError::InvalidKey(e.to_string()))?;
    Aes256Gcm::new_from_slice(&key_bytes)
        .map_err(|_| CredentialError::InvalidKey(KEY_LENGTH.to_string()))
}

/// Seals `plain` under `key_hex`. The result is hex of the nonce followed by
/// the ciphertext.
pub fn seal(plain: &str, key_hex: &str) -> Result<String, CredentialError> {
    let cipher = cipher_from_hex(key_hex)?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plain.as_bytes())
        .map_err(|e| CredentialError::Seal(e.to_string()))?;

    let mut sealed = nonce.to_vec();
    sealed.extend_from_slice(&ciphertext);
    Ok(hex::encode(sealed))
}

/// Per-user sealed passwords plus the key that opens them.
pub struct SealedCredentials {
    cipher: Aes256Gcm,
    sealed: HashMap<String, String>,
}

impl SealedCredentials {
    pub fn new(key_hex: &str, sealed: HashMap<String, String>) -> Result<Self, CredentialError> {
        Ok(Self {
            cipher: cipher_from_hex(key_hex)?,
            sealed,
        })
    }

    fn unseal(&self, user: &str, sealed_hex: &str) -> Result<String, CredentialError> {
        let unseal_err = |reason: String| CredentialError::Unseal {
            user: user.to_string(),
            reason,
        };
        let data = hex::decode(sealed_hex.trim())
            .map_err(|e| unseal_err(e.to_string()))?;
        if data.len() < NONCE_SIZE {
            return Err(unseal_err("too short to contain a nonce".to_string()));
        }
        let (nonce, ciphertext) = data.split_at(NONCE_SIZE);
        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| unseal_err(e.to_string()))?;
        String::from_utf8(plain).map_err(|e| unseal_err(e.to_string()))
    }
}

impl CredentialProvider for SealedCredentials {
    fn password(&self, user: &str) -> Result<String, CredentialError> {
        let sealed = self
            .sealed
            .get(user)
            .ok_or_else(|| CredentialError::UnknownUser(user.to_string()))?;
        self.unseal(user, sealed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";
    const OTHER_KEY: &str = "f1e1d1c1b1a191817161514131211101f0e0d0c0b0a090807060504030201000";

    fn provider(key: &str, user: &str, sealed: String) -> SealedCredentials {
        SealedCredentials::new(key, HashMap::from([(user.to_string(), sealed)]))
            .unwrap()
    }

    #[test]
    fn test_seal_then_password() {
        let sealed = seal("s3cret:@/", KEY).unwrap();
        assert!(!sealed.contains("s3cret"));
        let creds = provider(KEY, "collector", sealed);
        assert_eq!(creds.password("collector").unwrap(), "s3cret:@/");
    }

    #[test]
    fn test_sealing_uses_a_fresh_nonce() {
        assert_ne!(seal("same", KEY).unwrap(), seal("same", KEY).unwrap());
    }

    #[test]
    fn test_wrong_key_fails_to_unseal() {
        let sealed = seal("s3cret", KEY).unwrap();
        let creds = provider(OTHER_KEY, "collector", sealed);
        let err = creds.password("collector").unwrap_err();
        assert!(matches!(err, CredentialError::Unseal { .. }));
    }

    #[test]
    fn test_unknown_user_and_bad_input() {
        let creds = provider(KEY, "collector", "abcd".to_string());
        assert!(matches!(
            creds.password("nobody"),
            Err(CredentialError::UnknownUser(_))
        ));
        assert!(matches!(
            creds.password("collector"),
            Err(CredentialError::Unseal { .. })
        ));
        assert!(matches!(seal("x", "abcd"), Err(CredentialError::InvalidKey(_))));
        assert!(matches!(seal("x", "not hex"), Err(CredentialError::InvalidKey(_))));
    }
}
