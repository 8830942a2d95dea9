//! ADB RSA authentication.
//!
//! The device sends a 20-byte token in `AUTH(TOKEN)`. The host answers
//! with `AUTH(SIGNATURE)` carrying a PKCS#1 v1.5 signature that treats the
//! token as a SHA-1 digest. A device that doesn't know the key yet gets
//! `AUTH(RSAPUBLICKEY)` instead, which triggers the "Allow USB debugging?"
//! prompt on screen.

use std::fs;
use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha1::{Digest, Sha1};
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::protocol::constants::AUTH_TOKEN_SIZE;

/// Modulus size of ADB keys.
pub const KEY_BITS: usize = 2048;

/// Words in the Android public key modulus.
const ANDROID_KEY_WORDS: usize = KEY_BITS / 32;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Key generation unavailable: {0}")]
    UnsupportedPlatform(String),
    #[error("Signing failed: {0}")]
    SigningFailed(String),
    #[error("Key store {path}: {message}")]
    KeyStore { path: String, message: String },
}

/// RSA key pair used to answer ADB challenges.
#[derive(Clone)]
pub struct KeyPair {
    private: RsaPrivateKey,
    public: RsaPublicKey,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("bits", &(self.public.size() * 8))
            .finish_non_exhaustive()
    }
}

impl KeyPair {
    /// Generate a fresh RSA-2048 key pair.
    #[instrument(level = "info")]
    pub fn generate() -> Result<Self, AuthError> {
        Self::generate_with_bits(KEY_BITS)
    }

    pub(crate) fn generate_with_bits(bits: usize) -> Result<Self, AuthError> {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, bits)
            .map_err(|e| AuthError::UnsupportedPlatform(e.to_string()))?;
        info!(bits, "Generated ADB key pair");
        Ok(Self::from_private_key(private))
    }

    pub fn from_private_key(private: RsaPrivateKey) -> Self {
        let public = private.to_public_key();
        Self { private, public }
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public
    }

    /// Sign a device challenge.
    ///
    /// A 20-byte token is signed as-is (it already has digest length);
    /// anything else is hashed with SHA-1 first.
    pub fn sign_token(&self, token: &[u8]) -> Result<Vec<u8>, AuthError> {
        let digest: Vec<u8> = if token.len() == AUTH_TOKEN_SIZE {
            token.to_vec()
        } else {
            debug!(len = token.len(), "Non-standard token length, hashing");
            Sha1::digest(token).to_vec()
        };

        self.private
            .sign(Pkcs1v15Sign::new::<Sha1>(), &digest)
            .map_err(|e| AuthError::SigningFailed(e.to_string()))
    }

    /// Public key in the format adbd expects in `AUTH(RSAPUBLICKEY)`:
    /// base64 of the packed key struct, a space, a comment and a NUL.
    pub fn android_public_key(&self, comment: &str) -> Result<Vec<u8>, AuthError> {
        let packed = pack_android_key(&self.public)?;
        let mut out = STANDARD.encode(packed).into_bytes();
        out.push(b' ');
        out.extend_from_slice(comment.as_bytes());
        out.push(0);
        Ok(out)
    }

    /// Load a PKCS#8 PEM private key.
    pub fn load_pem(path: &Path) -> Result<Self, AuthError> {
        let store_err = |message: String| AuthError::KeyStore {
            path: path.display().to_string(),
            message,
        };
        let pem = fs::read_to_string(path).map_err(|e| store_err(e.to_string()))?;
        let private = RsaPrivateKey::from_pkcs8_pem(&pem).map_err(|e| store_err(e.to_string()))?;
        info!(path = %path.display(), "Loaded ADB key");
        Ok(Self::from_private_key(private))
    }

    /// Write the private key as PKCS#8 PEM.
    pub fn save_pem(&self, path: &Path) -> Result<(), AuthError> {
        let store_err = |message: String| AuthError::KeyStore {
            path: path.display().to_string(),
            message,
        };
        let pem = self
            .private
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| store_err(e.to_string()))?;
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|e| store_err(e.to_string()))?;
        }
        fs::write(path, pem.as_bytes()).map_err(|e| store_err(e.to_string()))?;
        info!(path = %path.display(), "Saved ADB key");
        Ok(())
    }

    /// Load the key at `path`, or generate one and store it there.
    pub fn load_or_generate(path: &Path) -> Result<Self, AuthError> {
        if path.exists() {
            return Self::load_pem(path);
        }
        let key = Self::generate()?;
        key.save_pem(path)?;
        Ok(key)
    }
}

/// `user@host` comment appended to the public key.
pub fn key_comment() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "user".into());
    let host = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "droidlink".into());
    format!("{user}@{host}")
}

/// Pack `{len, n0inv, n[64], rr[64], exponent}` as little-endian words.
fn pack_android_key(public: &RsaPublicKey) -> Result<Vec<u8>, AuthError> {
    let n = public.n();
    let modulus_bytes = ANDROID_KEY_WORDS * 4;
    if public.size() > modulus_bytes {
        return Err(AuthError::SigningFailed(format!(
            "modulus of {} bits does not fit the Android key format",
            public.size() * 8
        )));
    }

    let n_le = n.to_bytes_le();
    let n0 = le_word(&n_le);
    let n0inv = inverse_mod_2_32(n0).wrapping_neg();

    // R^2 mod n, with R = 2^(32 * words).
    let rr = (BigUint::from(1u32) << (2 * 32 * ANDROID_KEY_WORDS)) % n;
    let exponent = le_word(&public.e().to_bytes_le());

    let mut out = Vec::with_capacity(4 + 4 + 2 * modulus_bytes + 4);
    out.extend_from_slice(&(ANDROID_KEY_WORDS as u32).to_le_bytes());
    out.extend_from_slice(&n0inv.to_le_bytes());
    out.extend_from_slice(&padded(n_le, modulus_bytes));
    out.extend_from_slice(&padded(rr.to_bytes_le(), modulus_bytes));
    out.extend_from_slice(&exponent.to_le_bytes());
    Ok(out)
}

fn le_word(bytes: &[u8]) -> u32 {
    let mut word = [0u8; 4];
    for (dst, src) in word.iter_mut().zip(bytes) {
        *dst = *src;
    }
    u32::from_le_bytes(word)
}

fn padded(mut bytes: Vec<u8>, len: usize) -> Vec<u8> {
    bytes.resize(len, 0);
    bytes
}

/// Multiplicative inverse of an odd `x` modulo 2^32 (Newton iteration).
fn inverse_mod_2_32(x: u32) -> u32 {
    let mut inv = x;
    for _ in 0..5 {
        inv = inv.wrapping_mul(2u32.wrapping_sub(x.wrapping_mul(inv)));
    }
    inv
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::OnceLock;

    /// Small key shared by tests; 2048-bit generation is slow in debug.
    pub(crate) fn test_key() -> KeyPair {
        static KEY: OnceLock<KeyPair> = OnceLock::new();
        KEY.get_or_init(|| KeyPair::generate_with_bits(1024).unwrap())
            .clone()
    }

    #[test]
    fn test_sign_token_verifies() {
        let key = test_key();
        let token = [0x5Au8; AUTH_TOKEN_SIZE];
        let sig = key.sign_token(&token).unwrap();
        assert_eq!(sig.len(), 128);
        key.public_key()
            .verify(Pkcs1v15Sign::new::<Sha1>(), &token, &sig)
            .unwrap();
    }

    #[test]
    fn test_sign_is_deterministic() {
        let key = test_key();
        let a = key.sign_token(b"01234567890123456789").unwrap();
        let b = key.sign_token(b"01234567890123456789").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_sign_arbitrary_length() {
        let key = test_key();
        let sig = key.sign_token(b"short").unwrap();
        let digest = Sha1::digest(b"short");
        key.public_key()
            .verify(Pkcs1v15Sign::new::<Sha1>(), &digest, &sig)
            .unwrap();
    }

    #[test]
    fn test_inverse() {
        for x in [1u32, 3, 0x1234_5677, 0xFFFF_FFFF] {
            assert_eq!(x.wrapping_mul(inverse_mod_2_32(x)), 1);
        }
    }

    #[test]
    fn test_android_public_key_layout() {
        let key = test_key();
        let blob = key.android_public_key("tester@bench").unwrap();
        assert_eq!(blob.last(), Some(&0));

        let text = std::str::from_utf8(&blob[..blob.len() - 1]).unwrap();
        let (b64, comment) = text.split_once(' ').unwrap();
        assert_eq!(comment, "tester@bench");

        let packed = STANDARD.decode(b64).unwrap();
        assert_eq!(packed.len(), 524);
        assert_eq!(le_word(&packed[0..4]), 64);

        let n0 = le_word(&packed[8..12]);
        let n0inv = le_word(&packed[4..8]);
        assert_eq!(n0.wrapping_mul(n0inv), u32::MAX);
        assert_eq!(le_word(&packed[520..524]), 65537);
    }

    #[test]
    fn test_pem_roundtrip() {
        let key = test_key();
        let path = std::env::temp_dir().join(format!("droidlink-key-{}.pem", std::process::id()));
        key.save_pem(&path).unwrap();
        let loaded = KeyPair::load_or_generate(&path).unwrap();
        assert_eq!(loaded.public_key(), key.public_key());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_missing_pem() {
        let err = KeyPair::load_pem(Path::new("/nonexistent/droidlink/adbkey")).unwrap_err();
        assert!(matches!(err, AuthError::KeyStore { .. }));
    }
}
