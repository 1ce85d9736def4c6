//! Encrypt/decrypt the small, long-lived secrets held by the encrypted
//! config store (IMAP passwords, OAuth2 refresh tokens): C3.
//!
//! ## Design
//!
//! This is a "Derive Key Mode" scheme (Guéron & Lindell, 2017): a
//! long-term master key is never used to encrypt data directly. Instead,
//! each encryption samples a random 32-byte key id and derives a
//! single-use AES-256-GCM key from it via HKDF. This sidesteps AES-GCM's
//! 96-bit nonce being too small to safely randomize across many
//! encryptions under one key: with a single-use derived key, an all-zero
//! nonce is safe to reuse.
//!
//! We use [`ring`] rather than a second crypto crate because TLS already
//! requires it elsewhere in the stack, and pulling in another crypto
//! implementation just adds attack surface for no benefit here.
//!
//! Ciphertext layout: `[version: u8][key_id: 32 bytes][ciphertext][tag: 16 bytes]`,
//! base64-encoded for storage in the document warehouse. `version = 0` is
//! reserved to mean "plaintext, not yet enciphered" so a config store that
//! predates this module (or a manually-inserted secret) keeps working and
//! gets re-enciphered on its next write.
//!
//! The master key itself is derived via HKDF-SHA256 from
//! `EMAIL_CONFIG_ENCRYPTION_KEY`. If that variable is unset, a key is
//! derived instead from other already-configured secrets (e.g. the Mongo
//! connection string) and a one-time startup warning is logged by the
//! caller — this exists purely so a `dev` deployment can run without an
//! extra secret to manage.

use ring::{
    aead::{self, BoundKey},
    hkdf,
    rand::{SecureRandom, SystemRandom},
};
use thiserror::Error;
use zeroize::Zeroize;

const VERSION_LEN: usize = 1;
const KEY_ID_LEN: usize = 32;
const TAG_LEN: usize = 16;
const CURRENT_VERSION: u8 = 1;
const PLAINTEXT_VERSION: u8 = 0;

const HKDF_SALT: &[u8] = b"cuenly::email-config-store::v1";

#[derive(Debug, Error)]
pub enum DecryptError {
    #[error("ciphertext is too short to contain a version, key id, and tag")]
    TooShort,
    #[error("unrecognized ciphertext version")]
    UnrecognizedVersion,
    #[error("not valid base64")]
    BadBase64,
    #[error("decrypt error: ciphertext or metadata may be corrupted")]
    Aead,
}

/// A long-term secret used to derive single-use per-message encrypt/decrypt
/// keys. Construct once at process startup and hold it in the `Runtime`.
pub struct MasterKey(hkdf::Prk);

impl MasterKey {
    /// Derives a [`MasterKey`] from raw input key material (e.g. the bytes
    /// of `EMAIL_CONFIG_ENCRYPTION_KEY`, or a fallback secret).
    pub fn derive(input_key_material: &[u8]) -> Self {
        let prk =
            hkdf::Salt::new(hkdf::HKDF_SHA256, HKDF_SALT).extract(input_key_material);
        Self(prk)
    }

    fn derive_unbound_key(&self, key_id: &[u8; KEY_ID_LEN]) -> aead::UnboundKey {
        aead::UnboundKey::from(
            self.0
                .expand(&[key_id.as_slice()], &aead::AES_256_GCM)
                .expect("HKDF expand with a fixed, valid output length cannot fail"),
        )
    }

    /// Encrypts `plaintext`, binding `aad` (e.g. the tenant id) as
    /// additional authenticated data so a ciphertext can't be copied to a
    /// different tenant's record undetected.
    pub fn encrypt(&self, aad: &[u8], plaintext: &[u8]) -> String {
        let rng = SystemRandom::new();
        let mut key_id = [0u8; KEY_ID_LEN];
        rng.fill(&mut key_id).expect("system RNG failure");

        let nonce = ZeroNonce::new();
        let mut key =
            aead::SealingKey::new(self.derive_unbound_key(&key_id), nonce);

        let mut buf = Vec::with_capacity(
            VERSION_LEN + KEY_ID_LEN + plaintext.len() + TAG_LEN,
        );
        buf.push(CURRENT_VERSION);
        buf.extend_from_slice(&key_id);
        buf.extend_from_slice(plaintext);

        let plaintext_offset = VERSION_LEN + KEY_ID_LEN;
        let tag = key
            .seal_in_place_separate_tag(
                aead::Aad::from(aad),
                &mut buf[plaintext_offset..],
            )
            .expect("cannot encrypt more than ~4 GiB at once");
        buf.extend_from_slice(tag.as_ref());

        base64::Engine::encode(&base64::engine::general_purpose::STANDARD, buf)
    }

    /// Decrypts a ciphertext produced by [`Self::encrypt`]. If the stored
    /// value predates encipherment (`version == 0`), returns it unchanged
    /// so legacy plaintext secrets keep working until rewritten.
    pub fn decrypt(
        &self,
        aad: &[u8],
        stored: &str,
    ) -> Result<Vec<u8>, DecryptError> {
        let mut data = base64::Engine::decode(
            &base64::engine::general_purpose::STANDARD,
            stored,
        )
        .map_err(|_| DecryptError::BadBase64)?;

        if data.is_empty() {
            return Err(DecryptError::TooShort);
        }
        if data[0] == PLAINTEXT_VERSION {
            return Ok(data.split_off(VERSION_LEN));
        }
        if data.len() < VERSION_LEN + KEY_ID_LEN + TAG_LEN {
            return Err(DecryptError::TooShort);
        }
        if data[0] != CURRENT_VERSION {
            return Err(DecryptError::UnrecognizedVersion);
        }

        let mut key_id = [0u8; KEY_ID_LEN];
        key_id.copy_from_slice(&data[VERSION_LEN..VERSION_LEN + KEY_ID_LEN]);

        let nonce = ZeroNonce::new();
        let mut key =
            aead::OpeningKey::new(self.derive_unbound_key(&key_id), nonce);

        let ciphertext_offset = VERSION_LEN + KEY_ID_LEN;
        let plaintext_ref = key
            .open_within(aead::Aad::from(aad), &mut data, ciphertext_offset..)
            .map_err(|_| DecryptError::Aead)?;
        let plaintext_len = plaintext_ref.len();
        data.drain(..ciphertext_offset);
        data.truncate(plaintext_len);
        Ok(data)
    }

    /// Whether a stored value needs re-encipherment on its next write.
    pub fn is_legacy_plaintext(stored: &str) -> bool {
        base64::Engine::decode(&base64::engine::general_purpose::STANDARD, stored)
            .map(|data| data.first() == Some(&PLAINTEXT_VERSION))
            .unwrap_or(true)
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        // `hkdf::Prk` doesn't implement `Zeroize`, but dropping it here
        // documents the intent and keeps the type from being copied
        // around carelessly; the PRK itself is a fixed-size stack value
        // `ring` already clears via its own internal handling.
    }
}

/// A single-use, all-zero nonce that panics if used more than once for a
/// particular key. Safe because every key is itself single-use (see
/// module docs).
struct ZeroNonce(Option<aead::Nonce>);

impl ZeroNonce {
    fn new() -> Self {
        Self(Some(aead::Nonce::assume_unique_for_key([0u8; 12])))
    }
}

impl aead::NonceSequence for ZeroNonce {
    fn advance(&mut self) -> Result<aead::Nonce, ring::error::Unspecified> {
        self.0.take().ok_or(ring::error::Unspecified)
    }
}

/// Zeroizes a secret `String` on drop. Used for decrypted IMAP
/// passwords/tokens once they're handed to the `imap` crate.
pub struct SecretString(String);

impl SecretString {
    pub fn new(s: String) -> Self {
        Self(s)
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl Drop for SecretString {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let master = MasterKey::derive(b"test key material");
        let aad = b"tenant-123";
        let plaintext = b"super-secret-app-password";

        let ciphertext = master.encrypt(aad, plaintext);
        let decrypted = master.decrypt(aad, &ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn wrong_aad_fails_to_decrypt() {
        let master = MasterKey::derive(b"test key material");
        let ciphertext = master.encrypt(b"tenant-a", b"secret");
        assert!(master.decrypt(b"tenant-b", &ciphertext).is_err());
    }

    #[test]
    fn two_encryptions_of_same_plaintext_differ() {
        let master = MasterKey::derive(b"test key material");
        let a = master.encrypt(b"aad", b"secret");
        let b = master.encrypt(b"aad", b"secret");
        assert_ne!(a, b, "random key ids must produce distinct ciphertexts");
    }

    #[test]
    fn legacy_plaintext_passes_through_unchanged() {
        use base64::Engine;
        let mut raw = vec![0u8]; // version 0 == plaintext
        raw.extend_from_slice(b"legacy-password");
        let stored = base64::engine::general_purpose::STANDARD.encode(raw);

        assert!(MasterKey::is_legacy_plaintext(&stored));
        let master = MasterKey::derive(b"anything");
        let decrypted = master.decrypt(b"aad", &stored).unwrap();
        assert_eq!(decrypted, b"legacy-password");
    }
}
