//! AES-256-CBC content encryption for clip payloads
//!
//! Clips are encrypted end-to-end with a key derived from a pre-shared
//! passphrase. The key is the SHA-256 digest of the passphrase, so every peer
//! holding the same passphrase derives the same key without any exchange.
//!
//! Two framings are supported:
//!
//! * [`CipherMode::FixedIv`] uses the constant IV already deployed peers use.
//!   Identical plaintexts produce identical ciphertexts under the same key and
//!   the IV reuse leaks prefix equality. It is kept for wire compatibility.
//! * [`CipherMode::RandomIv`] draws a fresh IV per message and prepends it to
//!   the ciphertext before base64 encoding.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};
use zeroize::Zeroizing;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// IV used by every peer running in [`CipherMode::FixedIv`]
pub const LEGACY_IV: [u8; IV_LEN] = *b"9859102938491658";

const IV_LEN: usize = 16;

/// How the initialization vector is chosen and framed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CipherMode {
    /// Constant IV, ciphertext := base64(encrypted-bytes)
    #[default]
    FixedIv,

    /// Random IV per message, ciphertext := base64(IV || encrypted-bytes)
    RandomIv,
}

/// Failures inside the cipher. Never surfaced past [`ContentCipher`].
#[derive(Debug, Error)]
pub enum CipherError {
    #[error("ciphertext is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("ciphertext is shorter than its IV")]
    Truncated,

    #[error("decryption failed, wrong key or corrupt ciphertext")]
    Padding,

    #[error("decrypted clip is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("invalid key or IV length")]
    KeyLength,

    #[error("key derivation did not complete: {0}")]
    Derivation(String),
}

/// Passphrase-derived symmetric cipher for clip contents
pub struct ContentCipher {
    key: Zeroizing<[u8; 32]>,
    mode: CipherMode,
}

impl fmt::Debug for ContentCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentCipher")
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl ContentCipher {
    /// Derive the cipher off the async executor.
    ///
    /// The returned future only resolves once the key is ready, so callers
    /// that await it before wiring up a transport can never encrypt or
    /// decrypt with a missing key.
    pub async fn derive(passphrase: &str, mode: CipherMode) -> Result<Self, CipherError> {
        let passphrase = Zeroizing::new(passphrase.to_owned());
        let key = tokio::task::spawn_blocking(move || derive_key(&passphrase))
            .await
            .map_err(|e| CipherError::Derivation(e.to_string()))?;

        debug!("Derived content key ({:?})", mode);
        Ok(Self { key, mode })
    }

    /// Synchronous derivation for callers already off the executor
    pub fn from_passphrase(passphrase: &str, mode: CipherMode) -> Self {
        Self {
            key: derive_key(passphrase),
            mode,
        }
    }

    pub fn mode(&self) -> CipherMode {
        self.mode
    }

    /// Encrypt to base64. Returns an empty string on failure.
    pub fn encrypt(&self, plaintext: &str) -> String {
        match self.try_encrypt(plaintext) {
            Ok(ciphertext) => ciphertext,
            Err(e) => {
                warn!("Failed to encrypt clip: {}", e);
                String::new()
            }
        }
    }

    /// Decrypt from base64. Returns an empty string on failure.
    pub fn decrypt(&self, ciphertext: &str) -> String {
        match self.try_decrypt(ciphertext) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                warn!("Failed to decrypt clip: {}", e);
                String::new()
            }
        }
    }

    pub fn try_encrypt(&self, plaintext: &str) -> Result<String, CipherError> {
        let framed = match self.mode {
            CipherMode::FixedIv => self.seal(&LEGACY_IV, plaintext.as_bytes())?,
            CipherMode::RandomIv => {
                let iv: [u8; IV_LEN] = rand::random();
                let body = self.seal(&iv, plaintext.as_bytes())?;
                let mut framed = Vec::with_capacity(IV_LEN + body.len());
                framed.extend_from_slice(&iv);
                framed.extend_from_slice(&body);
                framed
            }
        };

        Ok(BASE64.encode(framed))
    }

    pub fn try_decrypt(&self, ciphertext: &str) -> Result<String, CipherError> {
        let raw = BASE64.decode(ciphertext.trim())?;

        let plaintext = match self.mode {
            CipherMode::FixedIv => self.open(&LEGACY_IV, &raw)?,
            CipherMode::RandomIv => {
                if raw.len() < IV_LEN {
                    return Err(CipherError::Truncated);
                }
                let (iv, body) = raw.split_at(IV_LEN);
                self.open(iv, body)?
            }
        };

        Ok(String::from_utf8(plaintext)?)
    }

    fn seal(&self, iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let encryptor =
            Aes256CbcEnc::new_from_slices(&self.key[..], iv).map_err(|_| CipherError::KeyLength)?;
        Ok(encryptor.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
    }

    fn open(&self, iv: &[u8], body: &[u8]) -> Result<Vec<u8>, CipherError> {
        let decryptor =
            Aes256CbcDec::new_from_slices(&self.key[..], iv).map_err(|_| CipherError::KeyLength)?;
        decryptor
            .decrypt_padded_vec_mut::<Pkcs7>(body)
            .map_err(|_| CipherError::Padding)
    }
}

fn derive_key(passphrase: &str) -> Zeroizing<[u8; 32]> {
    let digest = Sha256::digest(passphrase.as_bytes());
    let mut key = Zeroizing::new([0u8; 32]);
    key.copy_from_slice(&digest);
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn test_fixed_iv_matches_deployed_peers() {
        let cipher = ContentCipher::from_passphrase("secret", CipherMode::FixedIv);

        assert_eq!(cipher.encrypt("hello"), "OyecWm0cLtnxitZ70wi9bw==");
        assert_eq!(cipher.decrypt("D0zfha3sshUSKYq/AHtUEQ=="), "ping");
    }

    #[test]
    fn test_fixed_iv_is_deterministic() {
        let cipher = ContentCipher::from_passphrase("secret", CipherMode::FixedIv);
        assert_eq!(cipher.encrypt("same"), cipher.encrypt("same"));
    }

    #[test]
    fn test_random_iv_varies_per_message() {
        let cipher = ContentCipher::from_passphrase("secret", CipherMode::RandomIv);
        let first = cipher.encrypt("same");
        let second = cipher.encrypt("same");

        assert_ne!(first, second);
        assert_eq!(cipher.decrypt(&first), "same");
        assert_eq!(cipher.decrypt(&second), "same");
    }

    #[test]
    fn test_wrong_key_yields_empty() {
        let alice = ContentCipher::from_passphrase("secret", CipherMode::FixedIv);
        let mallory = ContentCipher::from_passphrase("not-secret", CipherMode::FixedIv);

        let ciphertext = alice.encrypt("a longer clip that spans several blocks");
        // A wrong key almost always breaks padding; if it happens to parse the
        // result is garbage, never the original text.
        assert_ne!(mallory.decrypt(&ciphertext), "a longer clip that spans several blocks");
    }

    #[test]
    fn test_corrupt_input_yields_empty() {
        let cipher = ContentCipher::from_passphrase("secret", CipherMode::FixedIv);

        assert_eq!(cipher.decrypt("not base64 at all!"), "");
        assert_eq!(cipher.decrypt("AAAA"), "");
        assert!(matches!(
            cipher.try_decrypt("not base64 at all!"),
            Err(CipherError::Encoding(_))
        ));
    }

    #[test]
    fn test_random_iv_rejects_truncated_frame() {
        let cipher = ContentCipher::from_passphrase("secret", CipherMode::RandomIv);
        let short = BASE64.encode([0u8; 8]);

        assert!(matches!(cipher.try_decrypt(&short), Err(CipherError::Truncated)));
        assert_eq!(cipher.decrypt(&short), "");
    }

    #[test]
    fn test_modes_do_not_interoperate() {
        let fixed = ContentCipher::from_passphrase("secret", CipherMode::FixedIv);
        let random = ContentCipher::from_passphrase("secret", CipherMode::RandomIv);

        assert_ne!(random.decrypt(&fixed.encrypt("sixteen byte msg")), "sixteen byte msg");
    }

    #[tokio::test]
    async fn test_async_derivation_matches_sync() {
        let derived = ContentCipher::derive("secret", CipherMode::FixedIv).await.unwrap();
        let direct = ContentCipher::from_passphrase("secret", CipherMode::FixedIv);

        assert_eq!(derived.encrypt("hello"), direct.encrypt("hello"));
        assert_eq!(derived.mode(), CipherMode::FixedIv);
    }

    #[test]
    fn test_debug_hides_key() {
        let cipher = ContentCipher::from_passphrase("secret", CipherMode::FixedIv);
        let rendered = format!("{:?}", cipher);
        assert!(rendered.contains("FixedIv"));
        assert!(!rendered.contains("key"));
    }

    proptest! {
        #[test]
        fn prop_roundtrip_fixed(passphrase in ".{0,32}", plaintext in ".{0,256}") {
            let cipher = ContentCipher::from_passphrase(&passphrase, CipherMode::FixedIv);
            prop_assert_eq!(cipher.decrypt(&cipher.encrypt(&plaintext)), plaintext);
        }

        #[test]
        fn prop_roundtrip_random(passphrase in ".{0,32}", plaintext in ".{0,256}") {
            let cipher = ContentCipher::from_passphrase(&passphrase, CipherMode::RandomIv);
            prop_assert_eq!(cipher.decrypt(&cipher.encrypt(&plaintext)), plaintext);
        }
    }
}
