use aes_gcm::{
    aead::{consts::U16, Aead, KeyInit, OsRng},
    aes::Aes256,
    AesGcm, Key, Nonce,
};
use anyhow::Result;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::RngCore;

/// AES-256-GCM with a 16-byte IV. The on-disk blob fixes both the IV and the
/// authentication tag at 16 bytes, so the cipher is parameterized accordingly.
type Aes256Gcm16 = AesGcm<Aes256, U16>;

pub const IV_LEN: usize = 16;
pub const TAG_LEN: usize = 16;

/// Encrypt `plaintext` under `key`, returning base64 of `IV ‖ ciphertext ‖ tag`.
/// A fresh IV is sampled on every call.
pub fn encrypt(key: &[u8; 32], plaintext: &[u8]) -> Result<String> {
    let cipher = Aes256Gcm16::new(Key::<Aes256Gcm16>::from_slice(key));

    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);
    let nonce = Nonce::<U16>::from_slice(&iv);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| anyhow::anyhow!("encrypt: {e}"))?;

    let mut blob = Vec::with_capacity(IV_LEN + ciphertext.len());
    blob.extend_from_slice(&iv);
    blob.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(blob))
}

/// Decrypt a blob produced by [`encrypt`]. Fails if the key is wrong or any
/// byte of the IV, ciphertext, or tag has been altered.
pub fn decrypt(key: &[u8; 32], blob: &str) -> Result<Vec<u8>> {
    let bytes = BASE64
        .decode(blob)
        .map_err(|e| anyhow::anyhow!("decode blob: {e}"))?;
    if bytes.len() < IV_LEN + TAG_LEN {
        anyhow::bail!(
            "blob too short: expected at least {} bytes, got {}",
            IV_LEN + TAG_LEN,
            bytes.len()
        );
    }

    let (iv, ciphertext) = bytes.split_at(IV_LEN);
    let cipher = Aes256Gcm16::new(Key::<Aes256Gcm16>::from_slice(key));
    let nonce = Nonce::<U16>::from_slice(iv);

    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|e| anyhow::anyhow!("decrypt: {e}"))?;

    Ok(plaintext)
}
