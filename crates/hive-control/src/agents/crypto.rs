use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha256};

use crate::error::{HiveError, HiveResult};

const ENVELOPE_PREFIX: &str = "enc:v1:";
const KEY_DOMAIN: &[u8] = b"hive-agent-credentials:v1\0";
const NONCE_LEN: usize = 12;

/// AES-256-GCM over agent credentials. The key is derived from the master
/// secret at construction and only ever lives in memory.
#[derive(Clone)]
pub struct CredentialCipher {
    key: [u8; 32],
}

impl std::fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialCipher").finish_non_exhaustive()
    }
}

impl CredentialCipher {
    pub fn from_master_secret(secret: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(KEY_DOMAIN);
        hasher.update(secret.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&hasher.finalize());
        Self { key }
    }

    fn aead(&self) -> HiveResult<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.key).map_err(|e| HiveError::Crypto(e.to_string()))
    }

    /// `enc:v1:<nonce>:<ciphertext>`, both URL-safe base64. Fresh nonce per call.
    pub fn seal(&self, plaintext: &str) -> HiveResult<String> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let ciphertext = self
            .aead()?
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|_| HiveError::Crypto("encryption failed".to_string()))?;
        Ok(format!(
            "{ENVELOPE_PREFIX}{}:{}",
            URL_SAFE_NO_PAD.encode(nonce_bytes),
            URL_SAFE_NO_PAD.encode(ciphertext)
        ))
    }

    pub fn open(&self, envelope: &str) -> HiveResult<String> {
        let rest = envelope
            .strip_prefix(ENVELOPE_PREFIX)
            .ok_or_else(|| HiveError::Crypto("credential envelope is invalid".to_string()))?;
        let (nonce_b64, ct_b64) = rest
            .split_once(':')
            .ok_or_else(|| HiveError::Crypto("credential envelope is invalid".to_string()))?;
        let nonce = URL_SAFE_NO_PAD
            .decode(nonce_b64)
            .map_err(|_| HiveError::Crypto("credential nonce is invalid".to_string()))?;
        if nonce.len() != NONCE_LEN {
            return Err(HiveError::Crypto("credential nonce is invalid".to_string()));
        }
        let ciphertext = URL_SAFE_NO_PAD
            .decode(ct_b64)
            .map_err(|_| HiveError::Crypto("credential ciphertext is invalid".to_string()))?;

        let plaintext = self
            .aead()?
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
            .map_err(|_| {
                HiveError::Crypto("decryption failed (wrong master secret?)".to_string())
            })?;
        String::from_utf8(plaintext)
            .map_err(|_| HiveError::Crypto("credential is not valid utf-8".to_string()))
    }
}

/// Short, non-reversible identifier of a key, safe to log and display.
pub fn fingerprint(plaintext: &str) -> String {
    let digest = Sha256::digest(plaintext.as_bytes());
    hex::encode(&digest[..6])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_then_open_returns_plaintext() {
        let c = CredentialCipher::from_master_secret("master");
        let key = "sk-ant-api03-very-secret";
        let sealed = c.seal(key).unwrap();
        assert!(sealed.starts_with(ENVELOPE_PREFIX));
        assert!(!sealed.contains(key));
        assert_eq!(c.open(&sealed).unwrap(), key);
    }

    #[test]
    fn nonces_are_fresh() {
        let c = CredentialCipher::from_master_secret("master");
        assert_ne!(c.seal("k").unwrap(), c.seal("k").unwrap());
    }

    #[test]
    fn wrong_master_secret_fails() {
        let sealed = CredentialCipher::from_master_secret("a").seal("k").unwrap();
        let err = CredentialCipher::from_master_secret("b")
            .open(&sealed)
            .unwrap_err();
        assert!(matches!(err, HiveError::Crypto(_)));
    }

    #[test]
    fn rejects_malformed_envelopes() {
        let c = CredentialCipher::from_master_secret("m");
        for bad in ["plaintext", "enc:v1:", "enc:v1:AAAA:BBBB", "enc:v2:a:b"] {
            assert!(c.open(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn fingerprint_is_short_and_stable() {
        assert_eq!(fingerprint("abc"), fingerprint("abc"));
        assert_eq!(fingerprint("abc").len(), 12);
        assert_ne!(fingerprint("abc"), fingerprint("abd"));
    }
}
