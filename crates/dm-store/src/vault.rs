//! At-rest encryption for registry, SMTP and OIDC secrets.
//!
//! AES-256-GCM with a random 96-bit nonce prepended to the ciphertext, the
//! whole blob base64-encoded for storage in TEXT columns.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use dm_common::DmError;
use ring::aead::{AES_256_GCM, Aad, LessSafeKey, NONCE_LEN, Nonce, UnboundKey};
use ring::rand::{SecureRandom, SystemRandom};

pub struct Vault {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl Vault {
    /// Build a vault from a 32-byte key.
    pub fn new(key_bytes: &[u8]) -> Result<Self, DmError> {
        let unbound = UnboundKey::new(&AES_256_GCM, key_bytes)
            .map_err(|_| DmError::Validation("Vault key must be 32 bytes".into()))?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    /// Build a vault from a hex-encoded key string.
    pub fn from_hex(key_hex: &str) -> Result<Self, DmError> {
        let bytes = hex::decode(key_hex)
            .map_err(|_| DmError::Validation("Vault key must be hex".into()))?;
        Self::new(&bytes)
    }

    /// Generate a fresh key, hex-encoded for persistence.
    pub fn generate_key_hex() -> String {
        use rand::Rng;
        let mut bytes = [0u8; 32];
        rand::rng().fill(&mut bytes);
        hex::encode(bytes)
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, DmError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| DmError::Other(anyhow::anyhow!("RNG failure")))?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut buf = plaintext.as_bytes().to_vec();
        self.key
            .seal_in_place_append_tag(nonce, Aad::empty(), &mut buf)
            .map_err(|_| DmError::Other(anyhow::anyhow!("Encryption failure")))?;

        let mut blob = nonce_bytes.to_vec();
        blob.extend_from_slice(&buf);
        Ok(B64.encode(blob))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String, DmError> {
        let blob = B64
            .decode(encoded)
            .map_err(|_| DmError::Validation("Invalid encrypted blob".into()))?;
        if blob.len() < NONCE_LEN {
            return Err(DmError::Validation("Encrypted blob too short".into()));
        }
        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| DmError::Validation("Invalid nonce".into()))?;

        let mut buf = ciphertext.to_vec();
        let plain = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut buf)
            .map_err(|_| DmError::Auth("Decryption failed (wrong key?)".into()))?;
        String::from_utf8(plain.to_vec())
            .map_err(|_| DmError::Validation("Decrypted payload is not UTF-8".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let vault = Vault::from_hex(&Vault::generate_key_hex()).unwrap();
        let secret = "registry-password-123";
        let blob = vault.encrypt(secret).unwrap();
        assert_ne!(blob, secret);
        assert_eq!(vault.decrypt(&blob).unwrap(), secret);
    }

    #[test]
    fn test_nonce_uniqueness() {
        let vault = Vault::from_hex(&Vault::generate_key_hex()).unwrap();
        let a = vault.encrypt("same").unwrap();
        let b = vault.encrypt("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_fails() {
        let vault_a = Vault::from_hex(&Vault::generate_key_hex()).unwrap();
        let vault_b = Vault::from_hex(&Vault::generate_key_hex()).unwrap();
        let blob = vault_a.encrypt("secret").unwrap();
        assert!(vault_b.decrypt(&blob).is_err());
    }
}
