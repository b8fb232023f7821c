//! Vault encryption
//!
//! The vault is a single JSON envelope: the KDF header (salt + Argon2id cost),
//! an encrypted canary and the encrypted document. Both ciphertexts are
//! AES-256-GCM with the serialized header as associated data, so changing any
//! header byte makes decryption fail.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::engine::error::{EngineError, EngineResult};

pub const ENVELOPE_VERSION: u32 = 1;
pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;
pub const SALT_SIZE: usize = 16;
const KDF_ALGORITHM: &str = "argon2id";
const CANARY: &[u8] = b"rmount-vault-canary-v1";

/// Argon2id cost parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 19_456,
            iterations: 2,
            parallelism: 1,
        }
    }
}

impl KdfParams {
    /// Cheapest accepted profile; only suitable for tests.
    pub fn minimal() -> Self {
        Self {
            memory_kib: 64,
            iterations: 1,
            parallelism: 1,
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        if !(1..=16).contains(&self.parallelism) {
            return Err(EngineError::corrupt(format!(
                "KDF parallelism out of range: {}",
                self.parallelism
            )));
        }
        if self.memory_kib < 8 * self.parallelism || self.memory_kib > 4 * 1024 * 1024 {
            return Err(EngineError::corrupt(format!(
                "KDF memory out of range: {} KiB",
                self.memory_kib
            )));
        }
        if !(1..=64).contains(&self.iterations) {
            return Err(EngineError::corrupt(format!(
                "KDF iterations out of range: {}",
                self.iterations
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfHeader {
    pub algorithm: String,
    #[serde(flatten)]
    pub params: KdfParams,
    #[serde(with = "base64_bytes")]
    pub salt: Vec<u8>,
}

impl KdfHeader {
    pub fn generate(params: KdfParams) -> Self {
        let mut salt = vec![0u8; SALT_SIZE];
        OsRng.fill_bytes(&mut salt);
        Self {
            algorithm: KDF_ALGORITHM.to_string(),
            params,
            salt,
        }
    }

    fn validate(&self) -> EngineResult<()> {
        if self.algorithm != KDF_ALGORITHM {
            return Err(EngineError::corrupt(format!(
                "Unsupported KDF: {}",
                self.algorithm
            )));
        }
        if self.salt.len() < 8 || self.salt.len() > 64 {
            return Err(EngineError::corrupt("KDF salt has an invalid length"));
        }
        self.params.validate()
    }

    /// Canonical bytes bound into every ciphertext as associated data
    fn aad(&self) -> EngineResult<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| EngineError::internal(format!("Header serialization failed: {}", e)))
    }
}

/// Master-password-derived key together with the header it was derived under
pub struct VaultKey {
    header: KdfHeader,
    key: Zeroizing<[u8; KEY_SIZE]>,
}

impl std::fmt::Debug for VaultKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultKey")
            .field("header", &self.header)
            .field("key", &"[redacted]")
            .finish()
    }
}

impl VaultKey {
    /// Runs Argon2id. This is deliberately slow; call it off the async runtime.
    pub fn derive(password: &str, header: KdfHeader) -> EngineResult<Self> {
        header.validate()?;
        let params = Params::new(
            header.params.memory_kib,
            header.params.iterations,
            header.params.parallelism,
            Some(KEY_SIZE),
        )
        .map_err(|e| EngineError::corrupt(format!("Invalid KDF parameters: {}", e)))?;

        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        argon2
            .hash_password_into(password.as_bytes(), &header.salt, key.as_mut())
            .map_err(|e| EngineError::internal(format!("Key derivation failed: {}", e)))?;

        Ok(Self { header, key })
    }

    pub fn header(&self) -> &KdfHeader {
        &self.header
    }

    fn cipher(&self) -> EngineResult<Aes256Gcm> {
        Aes256Gcm::new_from_slice(self.key.as_ref())
            .map_err(|_| EngineError::internal("Invalid key length"))
    }

    /// Encrypts `plaintext` into a complete envelope with fresh nonces.
    pub fn seal(&self, plaintext: &[u8]) -> EngineResult<Vec<u8>> {
        let cipher = self.cipher()?;
        let aad = self.header.aad()?;

        let canary = seal_with(&cipher, CANARY, &aad)?;
        let payload = seal_with(&cipher, plaintext, &aad)?;

        let envelope = Envelope {
            version: ENVELOPE_VERSION,
            kdf: self.header.clone(),
            canary,
            nonce: payload.nonce,
            ciphertext: payload.ciphertext,
        };

        serde_json::to_vec_pretty(&envelope)
            .map_err(|e| EngineError::internal(format!("Envelope serialization failed: {}", e)))
    }

    /// Opens an envelope previously sealed under this key's header.
    pub fn open(&self, envelope: &Envelope) -> EngineResult<Zeroizing<Vec<u8>>> {
        let cipher = self.cipher()?;
        let aad = envelope.kdf.aad()?;

        let canary = open_with(&cipher, &envelope.canary.nonce, &envelope.canary.ciphertext, &aad)
            .map_err(|_| EngineError::InvalidPassword)?;
        if canary.as_slice() != CANARY {
            return Err(EngineError::InvalidPassword);
        }

        open_with(&cipher, &envelope.nonce, &envelope.ciphertext, &aad)
            .map_err(|_| EngineError::corrupt("Vault ciphertext failed authentication"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedBox {
    #[serde(with = "base64_bytes")]
    pub nonce: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
}

/// On-disk / on-wire representation of the encrypted vault
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u32,
    pub kdf: KdfHeader,
    pub canary: SealedBox,
    #[serde(with = "base64_bytes")]
    pub nonce: Vec<u8>,
    /// AES-GCM ciphertext with the 16-byte tag appended
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
}

impl Envelope {
    pub fn parse(bytes: &[u8]) -> EngineResult<Self> {
        let envelope: Envelope = serde_json::from_slice(bytes)
            .map_err(|e| EngineError::corrupt(format!("Unreadable vault envelope: {}", e)))?;
        if envelope.version != ENVELOPE_VERSION {
            return Err(EngineError::corrupt(format!(
                "Unsupported vault version: {}",
                envelope.version
            )));
        }
        if envelope.nonce.len() != NONCE_SIZE || envelope.canary.nonce.len() != NONCE_SIZE {
            return Err(EngineError::corrupt("Vault nonce has an invalid length"));
        }
        envelope.kdf.validate()?;
        Ok(envelope)
    }
}

/// Derives the key for `envelope` from `password` and decrypts it.
pub fn unseal(password: &str, envelope: &Envelope) -> EngineResult<(VaultKey, Zeroizing<Vec<u8>>)> {
    let key = VaultKey::derive(password, envelope.kdf.clone())?;
    let plaintext = key.open(envelope)?;
    Ok((key, plaintext))
}

fn seal_with(cipher: &Aes256Gcm, plaintext: &[u8], aad: &[u8]) -> EngineResult<SealedBox> {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad })
        .map_err(|_| EngineError::internal("Encryption failed"))?;
    Ok(SealedBox {
        nonce: nonce.to_vec(),
        ciphertext,
    })
}

fn open_with(
    cipher: &Aes256Gcm,
    nonce: &[u8],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, aes_gcm::Error> {
    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map(Zeroizing::new)
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Short fingerprint of an encoded envelope, safe to log
pub fn fingerprint(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(bytes);
    hex::encode(&digest[..8])
}
