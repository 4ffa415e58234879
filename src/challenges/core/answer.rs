//! Answer encoding.
//!
//! The verifier expects the click sequence as compact JSON, AES-ECB encrypted
//! under the per-challenge secret key with PKCS#7 padding, then base64
//! encoded. The key length picks the AES variant.

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockCipher, BlockDecryptMut, BlockEncryptMut, KeyInit};
use aes::{Aes128, Aes192, Aes256};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use thiserror::Error;

use super::types::{CandidatePoint, PointSet};

#[derive(Debug, Error)]
pub enum AnswerError {
    #[error("secret key must be 16, 24 or 32 bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("answer serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("answer is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("answer ciphertext has invalid padding")]
    Padding,
    #[error("answer does not contain exactly four points")]
    PointCount,
}

/// Encrypts `points` under `secret_key` into the `pointJson` field value.
pub fn encode_answer(points: &PointSet, secret_key: &str) -> Result<String, AnswerError> {
    let plaintext = serde_json::to_vec(points)?;
    let key = secret_key.as_bytes();
    let ciphertext = match key.len() {
        16 => ecb_encrypt::<Aes128>(key, &plaintext)?,
        24 => ecb_encrypt::<Aes192>(key, &plaintext)?,
        32 => ecb_encrypt::<Aes256>(key, &plaintext)?,
        other => return Err(AnswerError::InvalidKeyLength(other)),
    };
    Ok(STANDARD.encode(ciphertext))
}

/// Inverse of [`encode_answer`].
pub fn decode_answer(encoded: &str, secret_key: &str) -> Result<PointSet, AnswerError> {
    let ciphertext = STANDARD.decode(encoded)?;
    let key = secret_key.as_bytes();
    let plaintext = match key.len() {
        16 => ecb_decrypt::<Aes128>(key, &ciphertext)?,
        24 => ecb_decrypt::<Aes192>(key, &ciphertext)?,
        32 => ecb_decrypt::<Aes256>(key, &ciphertext)?,
        other => return Err(AnswerError::InvalidKeyLength(other)),
    };
    let points: Vec<CandidatePoint> = serde_json::from_slice(&plaintext)?;
    PointSet::new(points).ok_or(AnswerError::PointCount)
}

fn ecb_encrypt<C>(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, AnswerError>
where
    C: BlockCipher + BlockEncryptMut + KeyInit,
{
    let cipher = ecb::Encryptor::<C>::new_from_slice(key)
        .map_err(|_| AnswerError::InvalidKeyLength(key.len()))?;
    Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

fn ecb_decrypt<C>(key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, AnswerError>
where
    C: BlockCipher + BlockDecryptMut + KeyInit,
{
    let cipher = ecb::Decryptor::<C>::new_from_slice(key)
        .map_err(|_| AnswerError::InvalidKeyLength(key.len()))?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| AnswerError::Padding)
}
