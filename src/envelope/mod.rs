//! The envelope protocol — wire framing, canonical sign-string, dual
//! signatures, and AEAD body encryption.
//!
//! Grounded on the teacher's `ipc::mod` `RpcRequest`/`RpcResponse` wire
//! structs (short JSON field names, `Option` fields skipped when absent)
//! and `relay::crypto` for the AEAD body-encryption shape.

use crate::error::{code, RpcError};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Selects how the envelope body is encoded on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    Cleartext = 0,
    Encrypted = 1,
}

impl Plan {
    pub fn from_i32(v: i32) -> Result<Self, RpcError> {
        match v {
            0 => Ok(Plan::Cleartext),
            1 => Ok(Plan::Encrypted),
            other => Err(RpcError::Structural(format!("invalid plan value: {other}"))),
        }
    }

    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

/// The decoded envelope — request and response share this shape.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub router: String,
    pub body: Vec<u8>,
    pub nonce: Vec<u8>,
    pub timestamp: i64,
    pub plan: Plan,
    pub user: i64,
    /// Absent on error responses — receivers must tolerate a missing
    /// signature whenever `code` is not 200.
    pub mac: Option<Vec<u8>>,
    pub esig: Option<Vec<u8>>,
    /// Response-only; `None` on requests.
    pub code: Option<i32>,
    pub message: Option<String>,
    /// WebSocket-only alternative outer signature (`ECDSA(mac, peer_private)`),
    /// meant for bidirectional signing when both sides hold each other's
    /// public keys. Never produced or checked by this binding: requests are
    /// already signed client→server via `esig`, and responses are now signed
    /// server→client via `esig` too (see [`crate::dispatcher::Dispatcher`]),
    /// so both directions already carry an outer ECDSA signature under `e`
    /// — a distinct `valid` signature would duplicate it rather than cover a
    /// gap. Kept on the wire struct for protocol compatibility with peers
    /// that do populate it; such frames decode fine and simply ignore it.
    pub valid: Option<Vec<u8>>,
}

/// Wire representation: short field tags, byte fields base64-encoded.
#[derive(Debug, Serialize, Deserialize)]
pub struct WireEnvelope {
    pub d: String,
    pub n: String,
    pub t: i64,
    pub r: String,
    pub p: i32,
    pub u: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub c: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub m: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid: Option<String>,
}

fn b64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

fn unb64(s: &str) -> Result<Vec<u8>, RpcError> {
    STANDARD
        .decode(s)
        .map_err(|e| RpcError::Structural(format!("invalid base64: {e}")))
}

impl Envelope {
    pub fn to_wire(&self) -> WireEnvelope {
        WireEnvelope {
            d: b64(&self.body),
            n: b64(&self.nonce),
            t: self.timestamp,
            r: self.router.clone(),
            p: self.plan.as_i32(),
            u: self.user,
            s: self.mac.as_deref().map(b64),
            e: self.esig.as_deref().map(b64),
            c: self.code,
            m: self.message.clone(),
            valid: self.valid.as_deref().map(b64),
        }
    }

    pub fn from_wire(w: WireEnvelope) -> Result<Self, RpcError> {
        Ok(Self {
            router: w.r,
            body: unb64(&w.d)?,
            nonce: unb64(&w.n)?,
            timestamp: w.t,
            plan: Plan::from_i32(w.p)?,
            user: w.u,
            mac: w.s.as_deref().map(unb64).transpose()?,
            esig: w.e.as_deref().map(unb64).transpose()?,
            code: w.c,
            message: w.m,
            valid: w.valid.as_deref().map(unb64).transpose()?,
        })
    }

    pub fn to_json(&self) -> Result<String, RpcError> {
        serde_json::to_string(&self.to_wire()).map_err(|e| RpcError::Structural(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self, RpcError> {
        let wire: WireEnvelope =
            serde_json::from_str(text).map_err(|e| RpcError::Structural(e.to_string()))?;
        Self::from_wire(wire)
    }

    /// Build a success (`code=200`) response envelope carrying `body`. The
    /// caller must set `mac`/`esig` before sending — every `code=200`
    /// envelope must carry a verifying signature pair.
    pub fn success_response(router: &str, user: i64, body: Vec<u8>, plan: Plan, nonce: Vec<u8>) -> Self {
        Self {
            router: router.to_string(),
            body,
            nonce,
            timestamp: chrono::Utc::now().timestamp(),
            plan,
            user,
            mac: None,
            esig: None,
            code: Some(code::OK),
            message: Some(String::new()),
            valid: None,
        }
    }

    /// Build an error response envelope. Signatures are omitted — error
    /// responses never carry `s`/`e`.
    pub fn error_response(router: &str, user: i64, code: i32, message: impl Into<String>) -> Self {
        Self {
            router: router.to_string(),
            body: Vec::new(),
            nonce: Vec::new(),
            timestamp: chrono::Utc::now().timestamp(),
            plan: Plan::Cleartext,
            user,
            mac: None,
            esig: None,
            code: Some(code),
            message: Some(message.into()),
            valid: None,
        }
    }
}

/// The canonical sign-string:
/// `router | base64(body) | base64(nonce) | timestamp | plan | user`
pub fn canonical_sign_string(
    router: &str,
    body: &[u8],
    nonce: &[u8],
    timestamp: i64,
    plan: Plan,
    user: i64,
) -> String {
    format!(
        "{router}|{}|{}|{timestamp}|{}|{user}",
        b64(body),
        b64(nonce),
        plan.as_i32(),
    )
}

/// `mac = HMAC-SHA256(sign_string, shared_secret)`.
pub fn compute_mac(sign_string: &str, shared_secret: &[u8]) -> Vec<u8> {
    use hmac::{Hmac, Mac};
    type HmacSha256 = Hmac<Sha256>;
    let mut mac = HmacSha256::new_from_slice(shared_secret).expect("HMAC accepts any key length");
    mac.update(sign_string.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

/// Constant-time MAC comparison.
pub fn macs_equal(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

// ─── Encrypted-body structure ──────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct EncryptedBody {
    d: String,
    n: String,
}

fn aead_key(shared_secret: &[u8]) -> [u8; 32] {
    let digest = Sha256::digest(shared_secret);
    let mut key = [0u8; 32];
    key.copy_from_slice(&digest);
    key
}

/// Encrypt `plaintext` under `shared_secret`, returning a serialized
/// `{d, n}` structure as the envelope body bytes.
///
/// The 32-byte `aad_nonce` is freshly generated, independent of the
/// envelope's own `nonce` field, and serves double duty: its SHA-256 prefix
/// is the AES-GCM nonce, and the full 32 bytes are the AEAD associated data,
/// binding the ciphertext to the exact nonce value used.
pub fn encrypt_body(plaintext: &[u8], shared_secret: &[u8]) -> Result<Vec<u8>, RpcError> {
    use aes_gcm::{aead::Aead, aead::Payload, Aes256Gcm, Key, KeyInit, Nonce};
    use rand_core::RngCore;

    let mut aad_nonce = [0u8; 32];
    rand_core::OsRng.fill_bytes(&mut aad_nonce);

    let key_bytes = aead_key(shared_secret);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
    let nonce_bytes = &Sha256::digest(aad_nonce)[..12];
    let nonce = Nonce::from_slice(nonce_bytes);

    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad: &aad_nonce,
            },
        )
        .map_err(|_| RpcError::CryptoFailure("AEAD encrypt failed".into()))?;

    let wrapped = EncryptedBody {
        d: b64(&ciphertext),
        n: b64(&aad_nonce),
    };
    serde_json::to_vec(&wrapped).map_err(|e| RpcError::CryptoFailure(e.to_string()))
}

/// Decrypt an envelope body produced by [`encrypt_body`].
pub fn decrypt_body(body: &[u8], shared_secret: &[u8]) -> Result<Vec<u8>, RpcError> {
    use aes_gcm::{aead::Aead, aead::Payload, Aes256Gcm, Key, KeyInit, Nonce};

    let wrapped: EncryptedBody =
        serde_json::from_slice(body).map_err(|e| RpcError::Structural(e.to_string()))?;
    let ciphertext = unb64(&wrapped.d)?;
    let aad_nonce = unb64(&wrapped.n)?;

    let key_bytes = aead_key(shared_secret);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
    let nonce_bytes = &Sha256::digest(&aad_nonce)[..12];
    let nonce = Nonce::from_slice(nonce_bytes);

    cipher
        .decrypt(
            nonce,
            Payload {
                msg: &ciphertext,
                aad: &aad_nonce,
            },
        )
        .map_err(|_| RpcError::CryptoFailure("AEAD decrypt failed".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_round_trip_preserves_fields() {
        let env = Envelope {
            router: "test.hello".into(),
            body: b"hello".to_vec(),
            nonce: vec![1, 2, 3, 4, 5, 6, 7, 8],
            timestamp: 1_700_000_000,
            plan: Plan::Cleartext,
            user: 1,
            mac: Some(vec![9u8; 32]),
            esig: Some(vec![7u8; 70]),
            code: None,
            message: None,
            valid: None,
        };
        let json = env.to_json().unwrap();
        let back = Envelope::from_json(&json).unwrap();
        assert_eq!(back.router, env.router);
        assert_eq!(back.body, env.body);
        assert_eq!(back.nonce, env.nonce);
        assert_eq!(back.mac, env.mac);
        assert_eq!(back.esig, env.esig);
    }

    #[test]
    fn error_response_omits_signatures() {
        let env = Envelope::error_response("test.hello", 1, code::INVALID_ARGUMENT, "nope");
        assert!(env.mac.is_none());
        assert!(env.esig.is_none());
        let wire = env.to_wire();
        assert!(wire.s.is_none());
        assert!(wire.e.is_none());
    }

    #[test]
    fn mac_tamper_detection() {
        let secret = b"shared-secret-bytes";
        let sign_string = canonical_sign_string("r", b"body", b"nonce1234", 1700, Plan::Cleartext, 1);
        let mac = compute_mac(&sign_string, secret);

        let tampered = canonical_sign_string("r", b"bodx", b"nonce1234", 1700, Plan::Cleartext, 1);
        let tampered_mac = compute_mac(&tampered, secret);
        assert!(!macs_equal(&mac, &tampered_mac));
    }

    #[test]
    fn encrypted_body_round_trip() {
        let secret = b"0123456789abcdef0123456789abcdef";
        let ct = encrypt_body(b"payload", secret).unwrap();
        let pt = decrypt_body(&ct, secret).unwrap();
        assert_eq!(pt, b"payload");
    }

    #[test]
    fn encrypted_body_tamper_fails() {
        let secret = b"0123456789abcdef0123456789abcdef";
        let mut ct = encrypt_body(b"payload", secret).unwrap();
        let last = ct.len() - 2;
        ct[last] ^= 0xFF;
        assert!(decrypt_body(&ct, secret).is_err());
    }
}
