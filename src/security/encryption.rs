// src/security/encryption.rs
use crate::error::{MixerError, MixerResult};
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Encrypted private-key container persisted with each deposit address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedKey {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; 12],
    pub version: u8,
}

/// Vault for deposit-address private keys. The production deployment backs
/// this with the HSM; in-process it is AES-256-GCM under a single master key.
#[derive(Clone)]
pub struct KeyVault {
    cipher: Aes256Gcm,
}

/// Hex private key that wipes itself when dropped.
#[derive(Debug, Clone, ZeroizeOnDrop)]
pub struct SecretKeyMaterial {
    inner: String,
}

impl SecretKeyMaterial {
    pub fn new(inner: String) -> Self {
        Self { inner }
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }
}

impl KeyVault {
    pub fn new(master_key: [u8; 32]) -> MixerResult<Self> {
        if master_key.iter().all(|b| *b == 0) {
            log::warn!("key vault initialised with an all-zero master key");
        }
        let key = Key::<Aes256Gcm>::from_slice(&master_key);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    /// Encrypts a hex private key; returns the base64 envelope stored in the
    /// deposit address row.
    pub fn encrypt_private_key(&self, private_key: &SecretKeyMaterial) -> MixerResult<String> {
        let encrypted = self.encrypt(private_key.as_str().as_bytes())?;
        let json = serde_json::to_vec(&encrypted)
            .map_err(|e| MixerError::EncryptionFailed(e.to_string()))?;
        Ok(general_purpose::STANDARD.encode(json))
    }

    /// Inverse of `encrypt_private_key`; byte-for-byte recovery.
    pub fn decrypt_private_key(&self, envelope: &str) -> MixerResult<SecretKeyMaterial> {
        let json = general_purpose::STANDARD
            .decode(envelope)
            .map_err(|e| MixerError::DecryptionFailed(e.to_string()))?;
        let encrypted: EncryptedKey = serde_json::from_slice(&json)
            .map_err(|e| MixerError::DecryptionFailed(e.to_string()))?;
        let mut plaintext = self.decrypt(&encrypted)?;
        let key = String::from_utf8(plaintext.clone())
            .map_err(|e| MixerError::DecryptionFailed(e.to_string()))?;
        plaintext.zeroize();
        Ok(SecretKeyMaterial::new(key))
    }

    fn encrypt(&self, data: &[u8]) -> MixerResult<EncryptedKey> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, data)
            .map_err(|e| MixerError::EncryptionFailed(e.to_string()))?;
        Ok(EncryptedKey {
            ciphertext,
            nonce: nonce.into(),
            version: 1,
        })
    }

    fn decrypt(&self, encrypted: &EncryptedKey) -> MixerResult<Vec<u8>> {
        if encrypted.version != 1 {
            return Err(MixerError::DecryptionFailed(format!(
                "unsupported envelope version {}",
                encrypted.version
            )));
        }
        let nonce = Nonce::from_slice(&encrypted.nonce);
        self.cipher
            .decrypt(nonce, encrypted.ciphertext.as_ref())
            .map_err(|e| MixerError::DecryptionFailed(e.to_string()))
    }

    /// Encrypt-then-decrypt self test used by the coordinator health check.
    pub fn verify_integrity(&self) -> MixerResult<()> {
        let probe = SecretKeyMaterial::new("00".repeat(32));
        let envelope = self.encrypt_private_key(&probe)?;
        let recovered = self.decrypt_private_key(&envelope)?;
        if recovered.as_str() != probe.as_str() {
            return Err(MixerError::HealthCheck(
                "key vault round-trip mismatch".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault() -> KeyVault {
        KeyVault::new([7u8; 32]).unwrap()
    }

    #[test]
    fn test_private_key_roundtrip() {
        let vault = vault();
        let key = SecretKeyMaterial::new(
            "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef".into(),
        );
        let envelope = vault.encrypt_private_key(&key).unwrap();
        let recovered = vault.decrypt_private_key(&envelope).unwrap();
        assert_eq!(key.as_str(), recovered.as_str());
    }

    #[test]
    fn test_envelopes_are_nonce_randomised() {
        let vault = vault();
        let key = SecretKeyMaterial::new("aa".repeat(32));
        let e1 = vault.encrypt_private_key(&key).unwrap();
        let e2 = vault.encrypt_private_key(&key).unwrap();
        assert_ne!(e1, e2);
    }

    #[test]
    fn test_wrong_master_key_fails() {
        let vault = vault();
        let other = KeyVault::new([9u8; 32]).unwrap();
        let key = SecretKeyMaterial::new("bb".repeat(32));
        let envelope = vault.encrypt_private_key(&key).unwrap();
        assert!(other.decrypt_private_key(&envelope).is_err());
    }

    #[test]
    fn test_tampered_envelope_fails() {
        let vault = vault();
        let key = SecretKeyMaterial::new("cc".repeat(32));
        let envelope = vault.encrypt_private_key(&key).unwrap();
        let mut bytes = general_purpose::STANDARD.decode(&envelope).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let tampered = general_purpose::STANDARD.encode(bytes);
        assert!(vault.decrypt_private_key(&tampered).is_err());
    }

    #[test]
    fn test_integrity_check() {
        assert!(vault().verify_integrity().is_ok());
    }
}
