//! Content cipher: ChaCha20-Poly1305 with a random 96-bit nonce, serialized
//! as base64url(nonce || ciphertext).

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::{rngs::OsRng, RngCore};

use crate::{KmsError, SymmetricKey};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

pub fn seal_bytes(key: &SymmetricKey, plaintext: &[u8]) -> Result<Vec<u8>, KmsError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| KmsError::Seal)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

pub fn open_bytes(key: &SymmetricKey, sealed: &[u8]) -> Result<Vec<u8>, KmsError> {
    if sealed.len() < NONCE_LEN + TAG_LEN {
        return Err(KmsError::Truncated { len: sealed.len() });
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| KmsError::Open)
}

pub fn seal(key: &SymmetricKey, plaintext: &[u8]) -> Result<String, KmsError> {
    Ok(URL_SAFE_NO_PAD.encode(seal_bytes(key, plaintext)?))
}

pub fn open(key: &SymmetricKey, token: &str) -> Result<Vec<u8>, KmsError> {
    let sealed = URL_SAFE_NO_PAD.decode(token.trim())?;
    open_bytes(key, &sealed)
}

pub fn seal_str(key: &SymmetricKey, plaintext: &str) -> Result<String, KmsError> {
    seal(key, plaintext.as_bytes())
}

pub fn open_str(key: &SymmetricKey, token: &str) -> Result<String, KmsError> {
    String::from_utf8(open(key, token)?).map_err(|_| KmsError::Utf8)
}
