//! The `Cipher` capability — polymorphic over {generate/load key pair, sign,
//! verify, encrypt/decrypt, derive shared secret} over P-256. Three closed
//! variants: [`EcdsaP256`] (sign/verify/derive), [`EcdhP256`] (derive only),
//! [`EciesHybrid`] (encrypt/decrypt only, for first-contact bootstrap).
//!
//! Grounded on the teacher's `relay::crypto::RelayE2e` (ECDH → HKDF → AEAD
//! pipeline) and its key-agreement shape, reworked from Curve25519 to P-256,
//! and on its `license` module's `Hmac<Sha256>` usage for the signing
//! primitive. Operations a variant does not support return
//! [`CipherError::Unsupported`] rather than panicking, which is safer than
//! runtime type-asserting at the call site.

use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use rand_core::OsRng;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("{0} is not supported by this cipher variant")]
    Unsupported(&'static str),
    #[error("invalid key encoding: {0}")]
    InvalidKey(String),
    #[error("signature verification failed")]
    VerifyFailed,
    #[error("AEAD operation failed")]
    AeadFailed,
}

/// Capability set shared by every cipher variant.
pub trait Cipher: Send + Sync {
    /// Uncompressed SEC1 point of this cipher's public key, if it has one.
    fn public_key_bytes(&self) -> Result<Vec<u8>, CipherError> {
        Err(CipherError::Unsupported("public key"))
    }

    fn sign(&self, _msg: &[u8]) -> Result<Vec<u8>, CipherError> {
        Err(CipherError::Unsupported("sign"))
    }

    fn verify(&self, _msg: &[u8], _sig: &[u8], _peer_public: &[u8]) -> Result<(), CipherError> {
        Err(CipherError::Unsupported("verify"))
    }

    fn derive_shared(&self, _peer_public: &[u8]) -> Result<Vec<u8>, CipherError> {
        Err(CipherError::Unsupported("derive_shared"))
    }

    fn encrypt(&self, _msg: &[u8], _aad: &[u8]) -> Result<Vec<u8>, CipherError> {
        Err(CipherError::Unsupported("encrypt"))
    }

    fn decrypt(&self, _ciphertext: &[u8], _aad: &[u8]) -> Result<Vec<u8>, CipherError> {
        Err(CipherError::Unsupported("decrypt"))
    }
}

fn decode_public_key(bytes: &[u8]) -> Result<PublicKey, CipherError> {
    PublicKey::from_sec1_bytes(bytes).map_err(|e| CipherError::InvalidKey(e.to_string()))
}

// ─── ECDSA-P256: sign, verify, derive ─────────────────────────────────────────

/// Supports sign/verify/derive-shared. A single P-256 key pair is reused
/// both for ECDSA signatures and as the local ECDH scalar — the same
/// pattern the teacher's license module uses a single HMAC key for more
/// than one purpose, here applied to a single asymmetric key pair.
pub struct EcdsaP256 {
    secret: SecretKey,
}

impl EcdsaP256 {
    pub fn generate() -> Self {
        Self {
            secret: SecretKey::random(&mut OsRng),
        }
    }

    /// Load a private key from a base64-encoded raw scalar.
    pub fn load_private_key(b64: &str) -> Result<Self, CipherError> {
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        let raw = STANDARD
            .decode(b64)
            .map_err(|e| CipherError::InvalidKey(e.to_string()))?;
        let secret = SecretKey::from_slice(&raw).map_err(|e| CipherError::InvalidKey(e.to_string()))?;
        Ok(Self { secret })
    }

    /// Raw scalar bytes of the private key.
    pub fn private_key_bytes(&self) -> Vec<u8> {
        self.secret.to_bytes().to_vec()
    }

    fn signing_key(&self) -> SigningKey {
        SigningKey::from(self.secret.clone())
    }
}

impl Cipher for EcdsaP256 {
    fn public_key_bytes(&self) -> Result<Vec<u8>, CipherError> {
        Ok(self
            .secret
            .public_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec())
    }

    fn sign(&self, msg: &[u8]) -> Result<Vec<u8>, CipherError> {
        let sig: Signature = self.signing_key().sign(msg);
        Ok(sig.to_der().as_bytes().to_vec())
    }

    fn verify(&self, msg: &[u8], sig: &[u8], peer_public: &[u8]) -> Result<(), CipherError> {
        let public = decode_public_key(peer_public)?;
        let verifying_key = VerifyingKey::from(public);
        let signature =
            Signature::from_der(sig).map_err(|_| CipherError::InvalidKey("malformed signature".into()))?;
        verifying_key
            .verify(msg, &signature)
            .map_err(|_| CipherError::VerifyFailed)
    }

    fn derive_shared(&self, peer_public: &[u8]) -> Result<Vec<u8>, CipherError> {
        let public = decode_public_key(peer_public)?;
        let shared = p256::ecdh::diffie_hellman(self.secret.to_nonzero_scalar(), public.as_affine());
        Ok(shared.raw_secret_bytes().to_vec())
    }
}

// ─── ECDH-P256: derive only ───────────────────────────────────────────────────

/// Supports only derive-shared — a key-agreement-only identity with no
/// signing capability.
pub struct EcdhP256 {
    secret: SecretKey,
}

impl EcdhP256 {
    pub fn generate() -> Self {
        Self {
            secret: SecretKey::random(&mut OsRng),
        }
    }

    pub fn load_private_key(b64: &str) -> Result<Self, CipherError> {
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        let raw = STANDARD
            .decode(b64)
            .map_err(|e| CipherError::InvalidKey(e.to_string()))?;
        let secret = SecretKey::from_slice(&raw).map_err(|e| CipherError::InvalidKey(e.to_string()))?;
        Ok(Self { secret })
    }
}

impl Cipher for EcdhP256 {
    fn public_key_bytes(&self) -> Result<Vec<u8>, CipherError> {
        Ok(self
            .secret
            .public_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec())
    }

    fn derive_shared(&self, peer_public: &[u8]) -> Result<Vec<u8>, CipherError> {
        let public = decode_public_key(peer_public)?;
        let shared = p256::ecdh::diffie_hellman(self.secret.to_nonzero_scalar(), public.as_affine());
        Ok(shared.raw_secret_bytes().to_vec())
    }
}

// ─── ECIES hybrid: encrypt/decrypt only, first-contact bootstrap ─────────────

/// Supports only `Encrypt`/`Decrypt`, implemented as ECIES: an ephemeral
/// P-256 key pair performs ECDH against the recipient's static public key,
/// HKDF-SHA256 derives a ChaCha20-Poly1305 key, and the ephemeral public key
/// travels alongside the ciphertext so the recipient can redo the same ECDH.
///
/// A given instance plays exactly one role: configured `for_recipient` it can
/// only `encrypt`; configured `for_local` (holding the static secret) it can
/// only `decrypt`. This matches how the asymmetric path is only ever used for
/// first-contact bootstrap — a client only ever encrypts to the server's
/// known public key, the server only ever decrypts with its own secret.
pub struct EciesHybrid {
    recipient_public: Option<PublicKey>,
    local_secret: Option<SecretKey>,
}

impl EciesHybrid {
    pub fn for_recipient(peer_public: &[u8]) -> Result<Self, CipherError> {
        Ok(Self {
            recipient_public: Some(decode_public_key(peer_public)?),
            local_secret: None,
        })
    }

    pub fn for_local(secret: SecretKey) -> Self {
        Self {
            recipient_public: None,
            local_secret: Some(secret),
        }
    }
}

impl Cipher for EciesHybrid {
    fn encrypt(&self, msg: &[u8], aad: &[u8]) -> Result<Vec<u8>, CipherError> {
        use chacha20poly1305::{aead::Aead, aead::Payload, ChaCha20Poly1305, Key, KeyInit, Nonce};
        use hkdf::Hkdf;
        use sha2::Sha256;

        let recipient = self
            .recipient_public
            .as_ref()
            .ok_or(CipherError::Unsupported("encrypt (no recipient configured)"))?;

        let ephemeral = SecretKey::random(&mut OsRng);
        let shared = p256::ecdh::diffie_hellman(ephemeral.to_nonzero_scalar(), recipient.as_affine());

        let hk = Hkdf::<Sha256>::new(None, shared.raw_secret_bytes());
        let mut okm = [0u8; 32];
        hk.expand(b"securerpc-ecies-v1", &mut okm)
            .map_err(|_| CipherError::AeadFailed)?;

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&okm));
        let nonce = Nonce::default(); // single-use ephemeral key ⇒ fixed all-zero nonce is safe
        let ct = cipher
            .encrypt(&nonce, Payload { msg, aad })
            .map_err(|_| CipherError::AeadFailed)?;

        let ephemeral_pub = ephemeral.public_key().to_encoded_point(false);
        let mut out = Vec::with_capacity(1 + ephemeral_pub.as_bytes().len() + ct.len());
        out.push(ephemeral_pub.as_bytes().len() as u8);
        out.extend_from_slice(ephemeral_pub.as_bytes());
        out.extend_from_slice(&ct);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CipherError> {
        use chacha20poly1305::{aead::Aead, aead::Payload, ChaCha20Poly1305, Key, KeyInit, Nonce};
        use hkdf::Hkdf;
        use sha2::Sha256;

        let secret = self
            .local_secret
            .as_ref()
            .ok_or(CipherError::Unsupported("decrypt (no local secret configured)"))?;

        if ciphertext.is_empty() {
            return Err(CipherError::AeadFailed);
        }
        let pub_len = ciphertext[0] as usize;
        if ciphertext.len() < 1 + pub_len {
            return Err(CipherError::AeadFailed);
        }
        let ephemeral_pub_bytes = &ciphertext[1..1 + pub_len];
        let ct = &ciphertext[1 + pub_len..];

        let ephemeral_pub = decode_public_key(ephemeral_pub_bytes)?;
        let shared = p256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), ephemeral_pub.as_affine());

        let hk = Hkdf::<Sha256>::new(None, shared.raw_secret_bytes());
        let mut okm = [0u8; 32];
        hk.expand(b"securerpc-ecies-v1", &mut okm)
            .map_err(|_| CipherError::AeadFailed)?;

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&okm));
        let nonce = Nonce::default();
        cipher
            .decrypt(&nonce, Payload { msg: ct, aad })
            .map_err(|_| CipherError::AeadFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ecdsa_sign_verify_round_trip() {
        let a = EcdsaP256::generate();
        let b = EcdsaP256::generate();
        let msg = b"hello world";
        let sig = a.sign(msg).unwrap();
        b.verify(msg, &sig, &a.public_key_bytes().unwrap())
            .expect("verification should succeed");
    }

    #[test]
    fn ecdsa_tamper_detection() {
        let a = EcdsaP256::generate();
        let b = EcdsaP256::generate();
        let msg = b"hello world";
        let sig = a.sign(msg).unwrap();
        assert!(b.verify(b"hello WORLD", &sig, &a.public_key_bytes().unwrap()).is_err());
    }

    #[test]
    fn ecdh_derive_shared_matches_both_sides() {
        let a = EcdhP256::generate();
        let b = EcdhP256::generate();
        let s1 = a.derive_shared(&b.public_key_bytes().unwrap()).unwrap();
        let s2 = b.derive_shared(&a.public_key_bytes().unwrap()).unwrap();
        assert_eq!(s1, s2);
    }

    #[test]
    fn ecdh_cannot_sign() {
        let a = EcdhP256::generate();
        assert!(matches!(a.sign(b"x"), Err(CipherError::Unsupported(_))));
    }

    #[test]
    fn ecies_hybrid_round_trip() {
        let server_secret = SecretKey::random(&mut OsRng);
        let server_pub = server_secret.public_key().to_encoded_point(false).as_bytes().to_vec();

        let client = EciesHybrid::for_recipient(&server_pub).unwrap();
        let server = EciesHybrid::for_local(server_secret);

        let ct = client.encrypt(b"bootstrap hello", b"aad").unwrap();
        let pt = server.decrypt(&ct, b"aad").unwrap();
        assert_eq!(pt, b"bootstrap hello");
    }

    #[test]
    fn ecies_tampered_ciphertext_fails() {
        let server_secret = SecretKey::random(&mut OsRng);
        let server_pub = server_secret.public_key().to_encoded_point(false).as_bytes().to_vec();

        let client = EciesHybrid::for_recipient(&server_pub).unwrap();
        let server = EciesHybrid::for_local(server_secret);

        let mut ct = client.encrypt(b"bootstrap hello", b"aad").unwrap();
        let last = ct.len() - 1;
        ct[last] ^= 0xFF;
        assert!(server.decrypt(&ct, b"aad").is_err());
    }

    #[test]
    fn ecies_encrypt_only_configured_for_encrypt() {
        let server_secret = SecretKey::random(&mut OsRng);
        let server_pub = server_secret.public_key().to_encoded_point(false).as_bytes().to_vec();
        let client = EciesHybrid::for_recipient(&server_pub).unwrap();
        assert!(client.decrypt(b"anything", b"aad").is_err());
    }
}
