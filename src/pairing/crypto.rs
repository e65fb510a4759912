// Jackson Coxson

use chacha20poly1305::{
    aead::{Aead, Payload},
    ChaCha20Poly1305, KeyInit as _, Nonce,
};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha512;

use crate::RemoteXpcError;

/// Largest output HKDF-SHA512 can produce: 255 · 64 bytes
pub const HKDF_MAX_OUTPUT: usize = 255 * 64;

const CHACHA_KEY_LENGTH: usize = 32;
const CHACHA_NONCE_LENGTH: usize = 12;
const POLY1305_TAG_LENGTH: usize = 16;
const ED25519_KEY_LENGTH: usize = 32;
pub const ED25519_SIGNATURE_LENGTH: usize = 64;

fn crypto_err(msg: impl Into<String>) -> RemoteXpcError {
    RemoteXpcError::Cryptography(msg.into())
}

/// RFC 5869 HKDF with SHA-512
///
/// A missing salt extracts with a zero block; the info parameter is
/// required by every derivation this crate performs, so its absence is an
/// error rather than a default.
pub fn hkdf_sha512(
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: Option<&[u8]>,
    length: usize,
) -> Result<Vec<u8>, RemoteXpcError> {
    if ikm.is_empty() {
        return Err(crypto_err("Input key material (IKM) cannot be empty"));
    }
    let info = info.ok_or_else(|| crypto_err("Info parameter is required"))?;
    if length == 0 {
        return Err(crypto_err("Output length must be greater than zero"));
    }
    if length > HKDF_MAX_OUTPUT {
        return Err(crypto_err(format!(
            "Output length cannot exceed {HKDF_MAX_OUTPUT} bytes"
        )));
    }

    let hkdf = Hkdf::<Sha512>::new(salt, ikm);
    let mut okm = vec![0u8; length];
    hkdf.expand(info, &mut okm)
        .map_err(|_| crypto_err("HKDF expansion failed"))?;
    Ok(okm)
}

/// An Ed25519 signing identity
pub struct Ed25519KeyPair {
    signing_key: SigningKey,
}

impl Ed25519KeyPair {
    /// Generates a fresh keypair from 32 random seed bytes
    pub fn generate() -> Self {
        let mut seed = [0u8; ED25519_KEY_LENGTH];
        rand::thread_rng().fill_bytes(&mut seed);
        Self {
            signing_key: SigningKey::from_bytes(&seed),
        }
    }

    /// Restores a keypair from a 32-byte seed
    pub fn from_seed(seed: &[u8]) -> Result<Self, RemoteXpcError> {
        let seed: [u8; ED25519_KEY_LENGTH] = seed
            .try_into()
            .map_err(|_| crypto_err("Private key must be 32 bytes"))?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&seed),
        })
    }

    /// The 32-byte public key
    pub fn public_key(&self) -> [u8; ED25519_KEY_LENGTH] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// The 32-byte private seed
    pub fn seed(&self) -> [u8; ED25519_KEY_LENGTH] {
        self.signing_key.to_bytes()
    }

    /// Signs a message, producing a 64-byte signature
    ///
    /// # Errors
    /// Signing an empty message is rejected; every pair-setup signature
    /// covers concatenated key material, so emptiness is a caller bug.
    pub fn sign(&self, data: &[u8]) -> Result<[u8; ED25519_SIGNATURE_LENGTH], RemoteXpcError> {
        if data.is_empty() {
            return Err(crypto_err("Cannot sign empty data"));
        }
        Ok(self.signing_key.sign(data).to_bytes())
    }
}

/// Verifies an Ed25519 signature
pub fn ed25519_verify(
    public_key: &[u8],
    data: &[u8],
    signature: &[u8],
) -> Result<bool, RemoteXpcError> {
    let public_key: [u8; ED25519_KEY_LENGTH] = public_key
        .try_into()
        .map_err(|_| crypto_err("Public key must be 32 bytes"))?;
    let signature: [u8; ED25519_SIGNATURE_LENGTH] = signature
        .try_into()
        .map_err(|_| crypto_err("Signature must be 64 bytes"))?;
    let key =
        VerifyingKey::from_bytes(&public_key).map_err(|_| crypto_err("Invalid public key"))?;
    Ok(key
        .verify(data, &ed25519_dalek::Signature::from_bytes(&signature))
        .is_ok())
}

/// ChaCha20-Poly1305 seal: returns `encrypted || 16-byte tag`
pub fn chacha20_poly1305_encrypt(
    key: &[u8],
    nonce: &[u8],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, RemoteXpcError> {
    let cipher = chacha_cipher(key)?;
    let nonce = chacha_nonce(nonce)?;
    cipher
        .encrypt(
            &nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| crypto_err("Encryption failed"))
}

/// ChaCha20-Poly1305 open
///
/// # Errors
/// Fails on undersized ciphertext, wrong key or nonce sizes, and
/// authentication failure.
pub fn chacha20_poly1305_decrypt(
    key: &[u8],
    nonce: &[u8],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, RemoteXpcError> {
    if ciphertext.len() < POLY1305_TAG_LENGTH {
        return Err(crypto_err("Ciphertext is too short"));
    }
    let cipher = chacha_cipher(key)?;
    let nonce = chacha_nonce(nonce)?;
    cipher
        .decrypt(
            &nonce,
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| crypto_err("Authentication failed"))
}

fn chacha_cipher(key: &[u8]) -> Result<ChaCha20Poly1305, RemoteXpcError> {
    if key.len() != CHACHA_KEY_LENGTH {
        return Err(crypto_err("Key must be 32 bytes"));
    }
    Ok(ChaCha20Poly1305::new(chacha20poly1305::Key::from_slice(
        key,
    )))
}

fn chacha_nonce(nonce: &[u8]) -> Result<Nonce, RemoteXpcError> {
    if nonce.len() != CHACHA_NONCE_LENGTH {
        return Err(crypto_err("Nonce must be 12 bytes"));
    }
    Ok(*Nonce::from_slice(nonce))
}
