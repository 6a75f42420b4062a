//! Hybrid encryption envelope (protocol id 1).
//!
//! For each call the client draws a fresh 32-byte session key and a 12-byte
//! nonce, encrypts the serialized call with AES-256-CTR and ships the session
//! key wrapped under the server's RSA public key (OAEP, SHA-256):
//!
//! ```text
//! request:  [1, [b64(rsa_oaep(key)), b64(nonce)], b64(aes_ctr(key, nonce, call))]
//! response: [1, [b64(nonce')],                    b64(aes_ctr(key, nonce', result))]
//! ```
//!
//! The response reuses the session key under a different nonce. The server
//! remembers every request nonce it has accepted in a [`NonceLedger`].

use crate::message::AuthLayer;
use aes::Aes256;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use ctr::cipher::{KeyIvInit, StreamCipher};
use dashmap::DashSet;
use hookwire_types::protocol::EncryptionProtocol;
use rand::RngCore;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

type Aes256Ctr = ctr::Ctr32BE<Aes256>;

/// Length of the per-call symmetric key.
pub const SESSION_KEY_LEN: usize = 32;
/// Length of the nonce accompanying every symmetric-cipher use.
pub const NONCE_LEN: usize = 12;

pub type Nonce = [u8; NONCE_LEN];

/// Errors from sealing or opening an encrypted envelope.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("RSA error: {0}")]
    Rsa(String),
    #[error("cipher error: {0}")]
    Cipher(String),
    #[error("invalid base64 in {field}: {source}")]
    Base64 {
        field: &'static str,
        #[source]
        source: base64::DecodeError,
    },
    #[error("{field} has length {actual}, expected {expected}")]
    BadLength {
        field: &'static str,
        actual: usize,
        expected: usize,
    },
    #[error("expected {expected} protocol arguments, got {actual}")]
    ProtocolArgs { expected: usize, actual: usize },
    #[error("encrypted payload must be a base64 string")]
    PayloadNotString,
    #[error("response nonce repeats the request nonce")]
    NonceReuse,
}

/// One-time symmetric key. Wiped from memory when dropped.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; SESSION_KEY_LEN]);

impl SessionKey {
    pub fn generate() -> Self {
        let mut key = [0u8; SESSION_KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        Self(key)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let key: [u8; SESSION_KEY_LEN] = bytes.try_into().map_err(|_| EnvelopeError::BadLength {
            field: "session key",
            actual: bytes.len(),
            expected: SESSION_KEY_LEN,
        })?;
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

pub fn random_nonce() -> Nonce {
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// A random nonce guaranteed to differ from `previous`.
pub fn fresh_nonce_except(previous: &Nonce) -> Nonce {
    loop {
        let nonce = random_nonce();
        if &nonce != previous {
            return nonce;
        }
    }
}

/// AES-256-CTR in place. The 16-byte IV is the nonce followed by a 32-bit
/// big-endian block counter starting at zero.
pub fn apply_keystream(key: &SessionKey, nonce: &Nonce, data: &mut [u8]) -> Result<(), EnvelopeError> {
    let mut iv = [0u8; 16];
    iv[..NONCE_LEN].copy_from_slice(nonce);
    let mut cipher = Aes256Ctr::new_from_slices(key.as_bytes(), &iv)
        .map_err(|e| EnvelopeError::Cipher(e.to_string()))?;
    cipher
        .try_apply_keystream(data)
        .map_err(|e| EnvelopeError::Cipher(e.to_string()))
}

/// The server's RSA keypair. One per process.
pub struct ServerKeys {
    private: RsaPrivateKey,
    public_pem: String,
}

impl ServerKeys {
    pub fn generate(bits: usize) -> Result<Self, EnvelopeError> {
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), bits)
            .map_err(|e| EnvelopeError::Rsa(e.to_string()))?;
        let public_pem = RsaPublicKey::from(&private)
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| EnvelopeError::Rsa(e.to_string()))?;
        Ok(Self { private, public_pem })
    }

    /// SubjectPublicKeyInfo PEM handed out at handshake.
    pub fn public_pem(&self) -> &str {
        &self.public_pem
    }

    pub fn unwrap_session_key(&self, wrapped: &[u8]) -> Result<SessionKey, EnvelopeError> {
        let mut raw = self
            .private
            .decrypt(Oaep::new::<Sha256>(), wrapped)
            .map_err(|e| EnvelopeError::Rsa(e.to_string()))?;
        let key = SessionKey::from_slice(&raw);
        raw.zeroize();
        key
    }
}

/// The server's public key as seen by a client after handshake.
#[derive(Debug, Clone)]
pub struct ServerPublicKey(RsaPublicKey);

impl ServerPublicKey {
    pub fn from_pem(pem: &str) -> Result<Self, EnvelopeError> {
        RsaPublicKey::from_public_key_pem(pem)
            .map(Self)
            .map_err(|e| EnvelopeError::Rsa(e.to_string()))
    }

    pub fn wrap_session_key(&self, key: &SessionKey) -> Result<Vec<u8>, EnvelopeError> {
        self.0
            .encrypt(&mut rand::thread_rng(), Oaep::new::<Sha256>(), key.as_bytes())
            .map_err(|e| EnvelopeError::Rsa(e.to_string()))
    }
}

/// Whether the hybrid protocol can be served. Fixed at startup.
#[derive(Clone)]
pub enum HybridCapability {
    Available(std::sync::Arc<ServerKeys>),
    Unavailable,
}

impl HybridCapability {
    /// Handshake answer for a desired protocol id: `(supported, public_key)`.
    pub fn negotiate(&self, desired: u64) -> (bool, Option<&str>) {
        let protocol = u8::try_from(desired).ok().and_then(EncryptionProtocol::from_id);
        match (protocol, self) {
            (Some(EncryptionProtocol::None), _) => (true, None),
            (Some(EncryptionProtocol::Hybrid), HybridCapability::Available(keys)) => {
                (true, Some(keys.public_pem()))
            }
            _ => (false, None),
        }
    }
}

/// Process-lifetime set of request nonces the server has accepted.
#[derive(Debug, Default)]
pub struct NonceLedger {
    seen: DashSet<Nonce>,
}

impl NonceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `nonce`. Returns `false` if it was already present.
    pub fn record(&self, nonce: Nonce) -> bool {
        self.seen.insert(nonce)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Client-side state kept between sealing a request and opening its reply.
#[derive(Debug)]
pub struct RequestSecrets {
    key: SessionKey,
    nonce: Nonce,
}

/// Seal a serialized call envelope for `server`.
pub fn seal_request(
    server: &ServerPublicKey,
    plaintext: &[u8],
) -> Result<(AuthLayer, RequestSecrets), EnvelopeError> {
    let key = SessionKey::generate();
    let nonce = random_nonce();
    let mut body = plaintext.to_vec();
    apply_keystream(&key, &nonce, &mut body)?;
    let wrapped = server.wrap_session_key(&key)?;
    let layer = AuthLayer {
        protocol: EncryptionProtocol::Hybrid.id(),
        protocol_args: vec![STANDARD.encode(wrapped), STANDARD.encode(nonce)],
        payload: Value::String(STANDARD.encode(body)),
    };
    Ok((layer, RequestSecrets { key, nonce }))
}

/// A request opened by the server.
#[derive(Debug)]
pub struct OpenedRequest {
    pub plaintext: Vec<u8>,
    pub key: SessionKey,
    pub nonce: Nonce,
}

/// Decrypt a hybrid request. Replay checking is left to the caller.
pub fn open_request(keys: &ServerKeys, layer: &AuthLayer) -> Result<OpenedRequest, EnvelopeError> {
    let [wrapped_b64, nonce_b64] = layer.protocol_args.as_slice() else {
        return Err(EnvelopeError::ProtocolArgs {
            expected: 2,
            actual: layer.protocol_args.len(),
        });
    };
    let wrapped = decode_b64("encrypted key", wrapped_b64)?;
    let nonce = decode_nonce(nonce_b64)?;
    let key = keys.unwrap_session_key(&wrapped)?;
    let mut plaintext = decode_payload(&layer.payload)?;
    apply_keystream(&key, &nonce, &mut plaintext)?;
    Ok(OpenedRequest { plaintext, key, nonce })
}

/// Seal a serialized result under the request's session key and a new nonce.
pub fn seal_response(
    key: &SessionKey,
    request_nonce: &Nonce,
    plaintext: &[u8],
) -> Result<AuthLayer, EnvelopeError> {
    let nonce = fresh_nonce_except(request_nonce);
    let mut body = plaintext.to_vec();
    apply_keystream(key, &nonce, &mut body)?;
    Ok(AuthLayer {
        protocol: EncryptionProtocol::Hybrid.id(),
        protocol_args: vec![STANDARD.encode(nonce)],
        payload: Value::String(STANDARD.encode(body)),
    })
}

/// Decrypt a hybrid response to a request sealed with `secrets`.
pub fn open_response(secrets: &RequestSecrets, layer: &AuthLayer) -> Result<Vec<u8>, EnvelopeError> {
    let [nonce_b64] = layer.protocol_args.as_slice() else {
        return Err(EnvelopeError::ProtocolArgs {
            expected: 1,
            actual: layer.protocol_args.len(),
        });
    };
    let nonce = decode_nonce(nonce_b64)?;
    if nonce == secrets.nonce {
        return Err(EnvelopeError::NonceReuse);
    }
    let mut plaintext = decode_payload(&layer.payload)?;
    apply_keystream(&secrets.key, &nonce, &mut plaintext)?;
    Ok(plaintext)
}

fn decode_b64(field: &'static str, text: &str) -> Result<Vec<u8>, EnvelopeError> {
    STANDARD
        .decode(text)
        .map_err(|source| EnvelopeError::Base64 { field, source })
}

fn decode_nonce(text: &str) -> Result<Nonce, EnvelopeError> {
    let raw = decode_b64("nonce", text)?;
    raw.as_slice().try_into().map_err(|_| EnvelopeError::BadLength {
        field: "nonce",
        actual: raw.len(),
        expected: NONCE_LEN,
    })
}

fn decode_payload(payload: &Value) -> Result<Vec<u8>, EnvelopeError> {
    match payload {
        Value::String(text) => decode_b64("payload", text),
        _ => Err(EnvelopeError::PayloadNotString),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn test_keys() -> ServerKeys {
        ServerKeys::generate(1024).unwrap()
    }

    #[test]
    fn test_keystream_is_symmetric() {
        let key = SessionKey::generate();
        let nonce = random_nonce();
        let original = b"[\"add\",[4,5],{}]".to_vec();
        let mut data = original.clone();
        apply_keystream(&key, &nonce, &mut data).unwrap();
        assert_ne!(data, original);
        apply_keystream(&key, &nonce, &mut data).unwrap();
        assert_eq!(data, original);
    }

    #[test]
    fn test_session_key_length_checked() {
        assert!(SessionKey::from_slice(&[0u8; 16]).is_err());
        assert!(SessionKey::from_slice(&[0u8; SESSION_KEY_LEN]).is_ok());
    }

    #[test]
    fn test_request_response_round_trip() {
        let keys = test_keys();
        let public = ServerPublicKey::from_pem(keys.public_pem()).unwrap();

        let (layer, secrets) = seal_request(&public, b"[\"ping\",[],{}]").unwrap();
        assert_eq!(layer.protocol, 1);
        assert_eq!(layer.protocol_args.len(), 2);

        let opened = open_request(&keys, &layer).unwrap();
        assert_eq!(opened.plaintext, b"[\"ping\",[],{}]");
        assert_eq!(opened.nonce, secrets.nonce);

        let reply = seal_response(&opened.key, &opened.nonce, b"[0,\"pong\"]").unwrap();
        assert_ne!(reply.protocol_args[0], layer.protocol_args[1]);
        assert_eq!(open_response(&secrets, &reply).unwrap(), b"[0,\"pong\"]");
    }

    #[test]
    fn test_response_reusing_request_nonce_rejected() {
        let keys = test_keys();
        let public = ServerPublicKey::from_pem(keys.public_pem()).unwrap();
        let (layer, secrets) = seal_request(&public, b"{}").unwrap();
        let mut reply = seal_response(&secrets.key, &secrets.nonce, b"[0,null]").unwrap();
        reply.protocol_args = vec![layer.protocol_args[1].clone()];
        assert!(matches!(open_response(&secrets, &reply), Err(EnvelopeError::NonceReuse)));
    }

    #[test]
    fn test_tampered_key_fails() {
        let keys = test_keys();
        let public = ServerPublicKey::from_pem(keys.public_pem()).unwrap();
        let (mut layer, _) = seal_request(&public, b"{}").unwrap();
        layer.protocol_args[0] = STANDARD.encode([7u8; 128]);
        assert!(matches!(open_request(&keys, &layer), Err(EnvelopeError::Rsa(_))));
        layer.protocol_args.pop();
        assert!(matches!(
            open_request(&keys, &layer),
            Err(EnvelopeError::ProtocolArgs { expected: 2, actual: 1 })
        ));
    }

    #[test]
    fn test_nonce_ledger_rejects_repeats() {
        let ledger = NonceLedger::new();
        let nonce = random_nonce();
        assert!(ledger.record(nonce));
        assert!(!ledger.record(nonce));
        assert!(ledger.record(fresh_nonce_except(&nonce)));
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn test_nonce_ledger_racing_inserts() {
        let ledger = NonceLedger::new();
        let nonce = random_nonce();
        let accepted = std::thread::scope(|s| {
            let workers: Vec<_> = (0..8).map(|_| s.spawn(|| ledger.record(nonce))).collect();
            workers.into_iter().map(|w| w.join().unwrap()).filter(|&won| won).count()
        });
        assert_eq!(accepted, 1);
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_negotiation_table() {
        let available = HybridCapability::Available(Arc::new(test_keys()));
        assert_eq!(available.negotiate(0), (true, None));
        let (supported, pem) = available.negotiate(1);
        assert!(supported);
        assert!(pem.unwrap().starts_with("-----BEGIN PUBLIC KEY-----"));
        assert_eq!(available.negotiate(42), (false, None));

        let unavailable = HybridCapability::Unavailable;
        assert_eq!(unavailable.negotiate(1), (false, None));
        assert_eq!(unavailable.negotiate(0), (true, None));
    }
}
