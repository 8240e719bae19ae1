use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::RngCore;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

pub const SECRET_KEY_LEN: usize = 32;
pub const XNONCE_LEN: usize = 24;

pub fn encrypt(key: &[u8], nonce: &[u8; XNONCE_LEN], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = XNonce::from_slice(nonce);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| anyhow!("encrypt: {e}"))?;
    Ok(ciphertext)
}

pub fn decrypt(key: &[u8], nonce: &[u8; XNONCE_LEN], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = XNonce::from_slice(nonce);
    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|e| anyhow!("decrypt: {e}"))?;
    Ok(plaintext)
}

pub fn generate_nonce() -> [u8; XNONCE_LEN] {
    let mut nonce = [0u8; XNONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

pub fn generate_secret() -> Zeroizing<[u8; SECRET_KEY_LEN]> {
    let mut secret = Zeroizing::new([0u8; SECRET_KEY_LEN]);
    OsRng.fill_bytes(&mut secret[..]);
    secret
}

pub fn generate_signing_key() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

pub fn sign_bytes(key: &SigningKey, bytes: &[u8]) -> Signature {
    key.sign(bytes)
}

pub fn verify_signature(public: &VerifyingKey, bytes: &[u8], sig: &Signature) -> Result<()> {
    public
        .verify_strict(bytes, sig)
        .map_err(|e| anyhow!("signature verify failed: {e}"))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// RFC 8037 public JWK for an Ed25519 key.
pub fn public_jwk(key: &VerifyingKey) -> Map<String, Value> {
    let mut jwk = Map::new();
    jwk.insert("kty".into(), json!("OKP"));
    jwk.insert("crv".into(), json!("Ed25519"));
    jwk.insert("x".into(), json!(URL_SAFE_NO_PAD.encode(key.to_bytes())));
    jwk
}

/// Decodes 32 bytes of hex key material without leaving copies behind.
pub fn secret_from_hex(material: &str) -> Result<Zeroizing<[u8; SECRET_KEY_LEN]>> {
    let bytes = Zeroizing::new(hex::decode(material.trim()).map_err(|e| anyhow!("key hex: {e}"))?);
    if bytes.len() != SECRET_KEY_LEN {
        return Err(anyhow!(
            "key material must be {SECRET_KEY_LEN} bytes, got {}",
            bytes.len()
        ));
    }
    let mut out = Zeroizing::new([0u8; SECRET_KEY_LEN]);
    out.copy_from_slice(&bytes);
    Ok(out)
}
