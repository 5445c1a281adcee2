//! Wire protocol for the social relay transport
//!
//! Frames are JSON arrays exchanged over a WebSocket (NIP-01). Clips travel
//! as kind-4 direct-message events whose content is NIP-04 encrypted to the
//! sender's own public key, so every device holding the shared secret key can
//! read them. The decrypted content is an envelope of the form
//! `<client_id>---<contents>`.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use secp256k1::{ecdh, schnorr, Keypair, Message, PublicKey, SecretKey, XOnlyPublicKey, SECP256K1};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;
use zeroize::Zeroizing;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Separates the origin client id from the clip inside an envelope
pub const ENVELOPE_DELIMITER: &str = "---";

/// Event kind of an encrypted direct message
pub const DIRECT_MESSAGE_KIND: u16 = 4;

/// Social relay protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid secret key: {0}")]
    InvalidKey(#[from] secp256k1::Error),

    #[error("invalid JSON frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("direct message could not be decrypted: {0}")]
    Decrypt(String),

    #[error("event signature does not verify")]
    Signature,
}

/// Keypair shared by every device on the same social relay account
#[derive(Clone)]
pub struct Keys {
    secret: SecretKey,
    keypair: Keypair,
    public: PublicKey,
    xonly: XOnlyPublicKey,
}

impl fmt::Debug for Keys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keys")
            .field("public_key", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}

impl Keys {
    /// Parse a 64 character hex secret key
    pub fn parse(secret_hex: &str) -> Result<Self, ProtocolError> {
        let secret = SecretKey::from_str(secret_hex.trim())?;
        Ok(Self::from_secret(secret))
    }

    pub fn generate() -> Self {
        Self::from_secret(SecretKey::new(&mut secp256k1::rand::thread_rng()))
    }

    fn from_secret(secret: SecretKey) -> Self {
        let keypair = Keypair::from_secret_key(SECP256K1, &secret);
        let public = PublicKey::from_secret_key(SECP256K1, &secret);
        let (xonly, _parity) = keypair.x_only_public_key();
        Self {
            secret,
            keypair,
            public,
            xonly,
        }
    }

    /// X-only public key as 64 hex chars
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.xonly.serialize())
    }

    pub fn secret_key_hex(&self) -> String {
        self.secret.display_secret().to_string()
    }

    /// AES key for NIP-04 messages addressed to ourselves
    fn shared_key(&self) -> Zeroizing<[u8; 32]> {
        let point = Zeroizing::new(ecdh::shared_secret_point(&self.public, &self.secret));
        let mut key = Zeroizing::new([0u8; 32]);
        key.copy_from_slice(&point[..32]);
        key
    }

    /// NIP-04 encrypt: `base64(ciphertext)?iv=base64(iv)`
    pub fn nip04_encrypt(&self, plaintext: &str) -> String {
        let key = self.shared_key();
        let iv: [u8; 16] = rand::random();
        // Key and IV lengths are fixed by the types above
        let ciphertext = Aes256CbcEnc::new(&(*key).into(), &iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
        format!("{}?iv={}", BASE64.encode(ciphertext), BASE64.encode(iv))
    }

    pub fn nip04_decrypt(&self, content: &str) -> Result<String, ProtocolError> {
        let (body, iv) = content
            .split_once("?iv=")
            .ok_or_else(|| ProtocolError::Decrypt("missing iv".to_string()))?;
        let body = BASE64
            .decode(body)
            .map_err(|e| ProtocolError::Decrypt(e.to_string()))?;
        let iv = BASE64
            .decode(iv)
            .map_err(|e| ProtocolError::Decrypt(e.to_string()))?;

        let key = self.shared_key();
        let plaintext = Aes256CbcDec::new_from_slices(&key[..], &iv)
            .map_err(|_| ProtocolError::Decrypt("invalid iv length".to_string()))?
            .decrypt_padded_vec_mut::<Pkcs7>(&body)
            .map_err(|_| ProtocolError::Decrypt("bad padding".to_string()))?;

        String::from_utf8(plaintext).map_err(|e| ProtocolError::Decrypt(e.to_string()))
    }
}

/// A signed relay event (NIP-01)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    #[serde(default)]
    pub id: String,
    pub pubkey: String,
    pub created_at: i64,
    pub kind: u16,
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    pub content: String,
    #[serde(default)]
    pub sig: String,
}

impl Event {
    /// Build and sign a direct message addressed to our own public key
    pub fn direct_message(keys: &Keys, content: String, created_at: i64) -> Self {
        let pubkey = keys.public_key_hex();
        let tags = vec![vec!["p".to_string(), pubkey.clone()]];
        let id = event_hash(&pubkey, created_at, DIRECT_MESSAGE_KIND, &tags, &content);

        let aux: [u8; 32] = rand::random();
        let signature = SECP256K1.sign_schnorr_with_aux_rand(
            &Message::from_digest(id),
            &keys.keypair,
            &aux,
        );

        Self {
            id: hex::encode(id),
            pubkey,
            created_at,
            kind: DIRECT_MESSAGE_KIND,
            tags,
            content,
            sig: signature.to_string(),
        }
    }

    /// Check both the id and the Schnorr signature
    pub fn verify(&self) -> Result<(), ProtocolError> {
        let id = event_hash(&self.pubkey, self.created_at, self.kind, &self.tags, &self.content);
        if hex::encode(id) != self.id {
            return Err(ProtocolError::Signature);
        }

        let pubkey = hex::decode(&self.pubkey).map_err(|_| ProtocolError::Signature)?;
        let pubkey = XOnlyPublicKey::from_slice(&pubkey).map_err(|_| ProtocolError::Signature)?;
        let sig = hex::decode(&self.sig).map_err(|_| ProtocolError::Signature)?;
        let sig = schnorr::Signature::from_slice(&sig).map_err(|_| ProtocolError::Signature)?;

        SECP256K1
            .verify_schnorr(&sig, &Message::from_digest(id), &pubkey)
            .map_err(|_| ProtocolError::Signature)
    }
}

/// SHA-256 over the canonical `[0, pubkey, created_at, kind, tags, content]`
fn event_hash(
    pubkey: &str,
    created_at: i64,
    kind: u16,
    tags: &[Vec<String>],
    content: &str,
) -> [u8; 32] {
    let canonical = json!([0, pubkey, created_at, kind, tags, content]).to_string();
    Sha256::digest(canonical.as_bytes()).into()
}

/// Subscription filter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    pub limit: u32,
    pub kinds: Vec<u16>,
    pub authors: Vec<String>,
}

impl Filter {
    /// Latest direct message authored by `pubkey`
    pub fn direct_messages_from(pubkey: String) -> Self {
        Self {
            limit: 1,
            kinds: vec![DIRECT_MESSAGE_KIND],
            authors: vec![pubkey],
        }
    }
}

/// Frames we send to the relay
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Req {
        subscription_id: String,
        filter: Filter,
    },
    Event(Event),
    Close(String),
}

impl ClientMessage {
    pub fn to_json(&self) -> String {
        match self {
            ClientMessage::Req {
                subscription_id,
                filter,
            } => json!(["REQ", subscription_id, filter]),
            ClientMessage::Event(event) => json!(["EVENT", event]),
            ClientMessage::Close(subscription_id) => json!(["CLOSE", subscription_id]),
        }
        .to_string()
    }
}

/// Frames the relay sends us
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    Event {
        subscription_id: String,
        event: Event,
    },
    EndOfStoredEvents(String),
    Notice(String),
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    Closed {
        subscription_id: String,
        message: String,
    },
    Unknown(String),
}

impl RelayMessage {
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)?;
        let frame = value
            .as_array()
            .ok_or_else(|| ProtocolError::Malformed("frame is not an array".to_string()))?;
        let label = frame
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::Malformed("frame has no label".to_string()))?;

        let text_at = |index: usize| -> String {
            frame
                .get(index)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };

        let message = match label {
            "EVENT" => {
                let event = frame
                    .get(2)
                    .cloned()
                    .ok_or_else(|| ProtocolError::Malformed("EVENT without payload".to_string()))?;
                RelayMessage::Event {
                    subscription_id: text_at(1),
                    event: serde_json::from_value(event)?,
                }
            }
            "EOSE" => RelayMessage::EndOfStoredEvents(text_at(1)),
            "NOTICE" => RelayMessage::Notice(text_at(1)),
            "OK" => RelayMessage::Ok {
                event_id: text_at(1),
                accepted: frame.get(2).and_then(Value::as_bool).unwrap_or(false),
                message: text_at(3),
            },
            "CLOSED" => RelayMessage::Closed {
                subscription_id: text_at(1),
                message: text_at(2),
            },
            other => RelayMessage::Unknown(other.to_string()),
        };

        Ok(message)
    }
}

/// Random 32 hex char subscription id
pub fn new_subscription_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// `<client_id>---<contents>`
pub fn seal_envelope(client_id: &str, contents: &str) -> String {
    format!("{}{}{}", client_id, ENVELOPE_DELIMITER, contents)
}

/// Split on the first delimiter; `None` if absent or the clip is empty
pub fn open_envelope(decrypted: &str) -> Option<(&str, &str)> {
    match decrypted.split_once(ENVELOPE_DELIMITER) {
        Some((client, contents)) if !contents.is_empty() => Some((client, contents)),
        _ => None,
    }
}
