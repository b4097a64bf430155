//! Bearer-token auth subject — issues and verifies opaque tokens carrying a
//! claims payload, and derives a per-token MAC secret so the envelope layer
//! never signs with the issuer's own static key directly.
//!
//! Grounded on the teacher's `ipc::auth` (`get_or_create_token`,
//! `validate_bearer`, constant-time comparison) generalized from a single
//! shared daemon token into per-subject claims, and on `pairing::model` for
//! the claims shape (subject id, issued-at, expiry, device id).

use crate::cache::TtlMap;
use crate::error::RpcError;
use base64::{engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD}, Engine as _};
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use std::time::Duration;

type HmacSha256 = Hmac<sha2::Sha256>;
type HmacSha512 = Hmac<Sha512>;

/// PBKDF2-HMAC-SHA512 iteration count for `GetTokenSecret` — matches the
/// derivation this auth subject's per-token MAC secret is built from.
const TOKEN_SECRET_ITERATIONS: u32 = 10_000;

/// `{sub, exp}` — the minimal claims cached by [`AuthSubject::verify`],
/// avoiding a second signature check on the hot path.
#[derive(Debug, Clone)]
struct CachedClaims {
    #[allow(dead_code)]
    sub: String,
    exp: i64,
}

/// Claims carried inside a token (base64url JSON, second segment).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dev: Option<String>,
    pub jti: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext: Option<serde_json::Value>,
}

/// Clock-skew tolerance applied to token expiry, matching the envelope
/// layer's `timestamp` window.
const EXP_SKEW_SECS: i64 = 300;

/// Issues and verifies tokens of the shape `header.claims.sig`, each segment
/// base64url-encoded, `sig = HMAC-SHA256(header || "." || claims, local_secret ∥ issuer_key)`.
///
/// `local_secret` is a process-local value distinct from any caller-supplied
/// `issuer_key`; it is what keeps a stolen bearer token from being enough on
/// its own to recompute [`Self::get_token_secret`]'s output.
pub struct AuthSubject {
    local_secret: Vec<u8>,
    token_secret_cache: TtlMap<String, Vec<u8>>,
    verified_cache: TtlMap<String, CachedClaims>,
    cache_ttl: Duration,
}

impl AuthSubject {
    pub fn new(cache_ttl: Duration) -> Self {
        Self::with_local_secret(random_local_secret(), cache_ttl)
    }

    /// Construct with an explicit process-local secret rather than a
    /// randomly generated one — useful when the secret must survive a
    /// process restart (e.g. injected from the embedding application's own
    /// key material).
    pub fn with_local_secret(local_secret: Vec<u8>, cache_ttl: Duration) -> Self {
        Self {
            local_secret,
            token_secret_cache: TtlMap::new(100_000),
            verified_cache: TtlMap::new(100_000),
            cache_ttl,
        }
    }

    /// Build and sign a new token for `claims` under `issuer_key`. When
    /// `claims.iat` is zero, `iat` is floored to `now` and `exp` to
    /// `now + exp_seconds`. An empty `jti` is filled with a fresh UUIDv4,
    /// matching the teacher's own `uuid::Uuid::new_v4()` id-minting idiom.
    pub fn generate(&self, mut claims: Claims, exp_seconds: i64, issuer_key: &[u8], now: i64) -> Result<String, RpcError> {
        if claims.iat == 0 {
            claims.iat = now;
            claims.exp = now + exp_seconds;
        }
        if claims.jti.is_empty() {
            claims.jti = uuid::Uuid::new_v4().to_string();
        }
        let header = URL_SAFE_NO_PAD.encode(b"{\"alg\":\"HS256\"}");
        let body = serde_json::to_vec(&claims).map_err(|e| RpcError::Structural(e.to_string()))?;
        let claims_seg = URL_SAFE_NO_PAD.encode(body);
        let signing_input = format!("{header}.{claims_seg}");
        let sig = URL_SAFE_NO_PAD.encode(self.token_signature(&signing_input, issuer_key));
        Ok(format!("{signing_input}.{sig}"))
    }

    fn token_signature(&self, signing_input: &str, issuer_key: &[u8]) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.local_secret.len() + issuer_key.len());
        key.extend_from_slice(&self.local_secret);
        key.extend_from_slice(issuer_key);
        let mut mac = HmacSha256::new_from_slice(&key).expect("HMAC accepts any key length");
        mac.update(signing_input.as_bytes());
        mac.finalize().into_bytes().to_vec()
    }

    /// `cache_key ← SHA256("GetTokenSecretEnhanced" | token | local_secret | issuer_key)`,
    /// shared by [`Self::get_token_secret`]'s secret cache and [`Self::verify`]'s
    /// claims cache — both are keyed on the same deterministic `(token, issuer_key)` identity.
    fn cache_key(&self, token: &str, issuer_key: &[u8]) -> String {
        let password = self.password(token, issuer_key);
        hex::encode(Sha256::digest(password.as_bytes()))
    }

    fn password(&self, token: &str, issuer_key: &[u8]) -> String {
        format!(
            "GetTokenSecretEnhanced|{token}|{}|{}",
            STANDARD.encode(&self.local_secret),
            STANDARD.encode(issuer_key)
        )
    }

    /// `salt ← SHA256(token | issuer_key | local_secret)` — deliberately a
    /// different field ordering than [`Self::password`] so the cache key and
    /// the KDF salt are not trivially related.
    fn salt(&self, token: &str, issuer_key: &[u8]) -> Vec<u8> {
        let input = format!(
            "{token}|{}|{}",
            STANDARD.encode(issuer_key),
            STANDARD.encode(&self.local_secret)
        );
        Sha256::digest(input.as_bytes()).to_vec()
    }

    /// Derive (and cache) the per-token MAC secret used to sign/verify
    /// envelope bodies for requests presenting this token. Deterministic per
    /// `(token, issuer_key)` tuple; never stored at rest beyond the
    /// one-hour cache.
    pub fn get_token_secret(&self, token: &str, issuer_key: &[u8]) -> Result<Vec<u8>, RpcError> {
        let cache_key = self.cache_key(token, issuer_key);
        if let Some(cached) = self.token_secret_cache.get(&cache_key) {
            return Ok(cached);
        }

        let password = self.password(token, issuer_key);
        let salt = self.salt(token, issuer_key);

        let mut dk = [0u8; 64];
        pbkdf2_hmac::<Sha512>(password.as_bytes(), &salt, TOKEN_SECRET_ITERATIONS, &mut dk);

        let mut out_mac = HmacSha512::new_from_slice(&dk).expect("HMAC accepts any key length");
        out_mac.update(&self.local_secret);
        let out = STANDARD.encode(out_mac.finalize().into_bytes()).into_bytes();

        self.token_secret_cache
            .put(cache_key, out.clone(), self.cache_ttl);
        Ok(out)
    }

    /// Verify `token`'s signature and freshness, returning its claims.
    /// Freshness (`exp`) is checked before recomputing the signature so an
    /// expired-but-validly-signed token fails fast without doing crypto work.
    pub fn verify(&self, token: &str, issuer_key: &[u8], now: i64) -> Result<Claims, RpcError> {
        let cache_key = self.cache_key(token, issuer_key);
        if let Some(cached) = self.verified_cache.get(&cache_key) {
            if cached.exp > now - EXP_SKEW_SECS {
                return self.decode_claims(token);
            }
            self.verified_cache.delete(&cache_key);
            return Err(RpcError::UnknownPrincipal);
        }

        let mut parts = token.split('.');
        let header = parts.next().ok_or_else(|| RpcError::Structural("malformed token".into()))?;
        let claims_seg = parts.next().ok_or_else(|| RpcError::Structural("malformed token".into()))?;
        let sig_seg = parts.next().ok_or_else(|| RpcError::Structural("malformed token".into()))?;
        if parts.next().is_some() {
            return Err(RpcError::Structural("malformed token: too many segments".into()));
        }

        let claims_bytes = URL_SAFE_NO_PAD
            .decode(claims_seg)
            .map_err(|e| RpcError::Structural(format!("invalid claims encoding: {e}")))?;
        let claims: Claims =
            serde_json::from_slice(&claims_bytes).map_err(|e| RpcError::Structural(e.to_string()))?;

        if claims.exp <= now - EXP_SKEW_SECS {
            return Err(RpcError::UnknownPrincipal);
        }

        let signing_input = format!("{header}.{claims_seg}");
        let expected = self.token_signature(&signing_input, issuer_key);

        let actual = URL_SAFE_NO_PAD
            .decode(sig_seg)
            .map_err(|e| RpcError::Structural(format!("invalid token signature encoding: {e}")))?;
        if !crate::envelope::macs_equal(&expected, &actual) {
            return Err(RpcError::SignatureInvalid);
        }

        self.verified_cache.put(
            cache_key,
            CachedClaims { sub: claims.sub.clone(), exp: claims.exp },
            self.cache_ttl,
        );
        Ok(claims)
    }

    fn decode_claims(&self, token: &str) -> Result<Claims, RpcError> {
        let claims_seg = token
            .split('.')
            .nth(1)
            .ok_or_else(|| RpcError::Structural("malformed token".into()))?;
        let claims_bytes = URL_SAFE_NO_PAD
            .decode(claims_seg)
            .map_err(|e| RpcError::Structural(format!("invalid claims encoding: {e}")))?;
        serde_json::from_slice(&claims_bytes).map_err(|e| RpcError::Structural(e.to_string()))
    }
}

fn random_local_secret() -> Vec<u8> {
    use rand_core::RngCore;
    let mut bytes = vec![0u8; 32];
    rand_core::OsRng.fill_bytes(&mut bytes);
    bytes
}
