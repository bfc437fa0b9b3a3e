//! Field-level encryption for privacy-protected transaction rows.
//!
//! The sensitive fields (amount, counterparty, metadata) of a privacy wallet
//! are stored only as an AES-256-GCM blob. The key is derived
//! deterministically from (wallet address || configured salt) via SHA-256;
//! deployments that need managed keys swap the derivation behind the same
//! functions. The stored blob carries a hash of the derived key so a decrypt
//! attempt with the wrong wallet is rejected before touching the cipher; the
//! GCM tag handles tamper detection.

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::AesGcm;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::CoreError;

/// AES-256-GCM with a 128-bit IV (32 hex chars on the wire).
type Cipher = AesGcm<Aes256, U16>;

pub const ALGORITHM: &str = "aes-256-gcm";
pub const BLOB_VERSION: u32 = 1;

const IV_LEN: usize = 16;
const TAG_LEN: usize = 16;

/// Stored ciphertext envelope; all binary fields are lower-case hex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedBlob {
    pub ciphertext: String,
    pub iv: String,
    #[serde(rename = "authTag")]
    pub auth_tag: String,
    #[serde(rename = "agentKeyHash")]
    pub agent_key_hash: String,
    pub algorithm: String,
    pub version: u32,
}

/// The plaintext that goes into the blob for a privacy row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrivatePayload {
    pub amount: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counterparty: Option<String>,
    #[serde(rename = "tokenMint")]
    pub token_mint: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
}

/// SHA-256 over (wallet address || salt). 32 bytes, used directly as the
/// AES-256 key.
fn derive_key(wallet: &str, salt: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(wallet.as_bytes());
    hasher.update(salt.as_bytes());
    hasher.finalize().into()
}

/// Hex SHA-256 of the derived key, stored alongside the ciphertext.
fn key_hash(key: &[u8; 32]) -> String {
    hex::encode(Sha256::digest(key))
}

/// Encrypt a privacy payload for a wallet. The IV is fresh random per call,
/// so re-encrypting identical plaintext yields a different blob with the
/// same key hash.
pub fn encrypt_payload(
    payload: &PrivatePayload,
    wallet: &str,
    salt: &str,
) -> Result<EncryptedBlob, CoreError> {
    let key = derive_key(wallet, salt);
    let cipher = Cipher::new(GenericArray::from_slice(&key));

    let mut iv = [0u8; IV_LEN];
    rand::rngs::OsRng.fill_bytes(&mut iv);

    let plaintext = serde_json::to_vec(payload)?;
    let mut sealed = cipher
        .encrypt(GenericArray::from_slice(&iv), plaintext.as_ref())
        .map_err(|_| CoreError::EncryptionFailed("cipher rejected payload".to_string()))?;

    // The aead crate appends the 16-byte tag; the wire format stores it
    // separately.
    let tag = sealed.split_off(sealed.len() - TAG_LEN);

    Ok(EncryptedBlob {
        ciphertext: hex::encode(&sealed),
        iv: hex::encode(iv),
        auth_tag: hex::encode(&tag),
        agent_key_hash: key_hash(&key),
        algorithm: ALGORITHM.to_string(),
        version: BLOB_VERSION,
    })
}

/// Decrypt a stored blob for a wallet. Version, algorithm and key hash are
/// checked before the cipher runs; any mismatch or tag failure surfaces as
/// `DecryptionFailed` with no partial data.
pub fn decrypt_payload(
    blob: &EncryptedBlob,
    wallet: &str,
    salt: &str,
) -> Result<PrivatePayload, CoreError> {
    if blob.version != BLOB_VERSION {
        return Err(CoreError::DecryptionFailed(format!(
            "unsupported blob version {}",
            blob.version
        )));
    }
    if blob.algorithm != ALGORITHM {
        return Err(CoreError::DecryptionFailed(format!(
            "unexpected algorithm '{}'",
            blob.algorithm
        )));
    }

    let key = derive_key(wallet, salt);
    if key_hash(&key) != blob.agent_key_hash {
        return Err(CoreError::DecryptionFailed(
            "key hash mismatch for this wallet".to_string(),
        ));
    }

    let iv = hex::decode(&blob.iv)
        .map_err(|_| CoreError::DecryptionFailed("iv is not valid hex".to_string()))?;
    if iv.len() != IV_LEN {
        return Err(CoreError::DecryptionFailed(format!(
            "iv must be {} bytes, got {}",
            IV_LEN,
            iv.len()
        )));
    }

    let mut sealed = hex::decode(&blob.ciphertext)
        .map_err(|_| CoreError::DecryptionFailed("ciphertext is not valid hex".to_string()))?;
    let tag = hex::decode(&blob.auth_tag)
        .map_err(|_| CoreError::DecryptionFailed("auth tag is not valid hex".to_string()))?;
    if tag.len() != TAG_LEN {
        return Err(CoreError::DecryptionFailed(format!(
            "auth tag must be {} bytes, got {}",
            TAG_LEN,
            tag.len()
        )));
    }
    sealed.extend_from_slice(&tag);

    let cipher = Cipher::new(GenericArray::from_slice(&key));
    let plaintext = cipher
        .decrypt(GenericArray::from_slice(&iv), sealed.as_ref())
        .map_err(|_| CoreError::DecryptionFailed("authentication failed".to_string()))?;

    serde_json::from_slice(&plaintext)
        .map_err(|_| CoreError::DecryptionFailed("plaintext is not a valid payload".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const WALLET_A: &str = "9WzDXwBbmkg8ZTbNMqUxvQRAyrZzDsGYdLVL9zYtAWWM";
    const WALLET_B: &str = "JUPyiwrYJFskUPiHa7hkeR8VUtAeFoSYDWvJh4dQpump";
    const SALT: &str = "unit-test-salt-not-for-production";

    fn sample_payload() -> PrivatePayload {
        let mut metadata = serde_json::Map::new();
        metadata.insert("fee".to_string(), serde_json::json!(0.000005));
        PrivatePayload {
            amount: 100.5,
            counterparty: Some("Cpty".to_string()),
            token_mint: "So11111111111111111111111111111111111111112".to_string(),
            metadata,
        }
    }

    #[test]
    fn test_round_trip() {
        let payload = sample_payload();
        let blob = encrypt_payload(&payload, WALLET_A, SALT).unwrap();

        assert_eq!(blob.algorithm, "aes-256-gcm");
        assert_eq!(blob.version, 1);
        assert_eq!(blob.iv.len(), 32);
        assert_eq!(blob.auth_tag.len(), 32);
        assert_eq!(blob.agent_key_hash.len(), 64);

        let decrypted = decrypt_payload(&blob, WALLET_A, SALT).unwrap();
        assert_eq!(decrypted, payload);
    }

    #[test]
    fn test_wrong_wallet_rejected_before_cipher() {
        let blob = encrypt_payload(&sample_payload(), WALLET_A, SALT).unwrap();
        let err = decrypt_payload(&blob, WALLET_B, SALT).unwrap_err();
        match err {
            CoreError::DecryptionFailed(msg) => assert!(msg.contains("key hash")),
            other => panic!("expected DecryptionFailed, got {:?}", other),
        }
    }

    #[test]
    fn test_fresh_iv_same_key_hash() {
        let payload = sample_payload();
        let a = encrypt_payload(&payload, WALLET_A, SALT).unwrap();
        let b = encrypt_payload(&payload, WALLET_A, SALT).unwrap();

        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
        assert_eq!(a.agent_key_hash, b.agent_key_hash);
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let mut blob = encrypt_payload(&sample_payload(), WALLET_A, SALT).unwrap();
        let mut raw = hex::decode(&blob.ciphertext).unwrap();
        raw[0] ^= 0x01;
        blob.ciphertext = hex::encode(raw);

        assert!(matches!(
            decrypt_payload(&blob, WALLET_A, SALT),
            Err(CoreError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn test_tampered_tag_fails() {
        let mut blob = encrypt_payload(&sample_payload(), WALLET_A, SALT).unwrap();
        let mut tag = hex::decode(&blob.auth_tag).unwrap();
        tag[0] ^= 0x80;
        blob.auth_tag = hex::encode(tag);

        assert!(matches!(
            decrypt_payload(&blob, WALLET_A, SALT),
            Err(CoreError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn test_version_and_algorithm_checked() {
        let blob = encrypt_payload(&sample_payload(), WALLET_A, SALT).unwrap();

        let mut wrong_version = blob.clone();
        wrong_version.version = 2;
        assert!(matches!(
            decrypt_payload(&wrong_version, WALLET_A, SALT),
            Err(CoreError::DecryptionFailed(_))
        ));

        let mut wrong_algo = blob;
        wrong_algo.algorithm = "aes-128-gcm".to_string();
        assert!(matches!(
            decrypt_payload(&wrong_algo, WALLET_A, SALT),
            Err(CoreError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn test_different_salt_changes_key() {
        let blob = encrypt_payload(&sample_payload(), WALLET_A, SALT).unwrap();
        let err = decrypt_payload(&blob, WALLET_A, "another-salt-value").unwrap_err();
        assert!(matches!(err, CoreError::DecryptionFailed(_)));
    }

    #[test]
    fn test_blob_wire_format() {
        let blob = encrypt_payload(&sample_payload(), WALLET_A, SALT).unwrap();
        let json = serde_json::to_value(&blob).unwrap();
        assert!(json.get("authTag").is_some());
        assert!(json.get("agentKeyHash").is_some());
        assert_eq!(json["algorithm"], "aes-256-gcm");
        assert_eq!(json["version"], 1);
    }
}
