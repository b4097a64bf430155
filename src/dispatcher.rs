//! Request verification pipeline: parse, bound-check, look up the caller's
//! public key, verify the outer signature, recompute and compare the MAC,
//! reject replays, decode the body, and hand off to the registered handler.
//!
//! Grounded on the teacher's `ipc::handle_connection` + `dispatch_text` flow
//! (auth challenge, JSON decode, per-method dispatch, `classify_error`
//! mapping to a response), generalized from the teacher's fixed match arms
//! into a lookup against [`HandlerRegistry`].

use crate::auth::AuthSubject;
use crate::cache::{ReplayCache, SharedKeyCache};
use crate::cipher::Cipher;
use crate::config::SecureRpcConfig;
use crate::envelope::{self, Envelope, Plan};
use crate::error::RpcError;
use crate::registry::{HandlerRegistry, RequestContext};
use serde_json::Value;
use std::sync::Arc;

/// Upper bound on an envelope's decoded body size, rejecting oversized
/// requests before any crypto work is spent on them.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Resolves a `user` principal id to the public key bytes used to verify
/// its outer signature. Implementations back this with whatever store
/// holds registered peers (e.g. paired devices, provisioned clients).
pub trait PrincipalStore: Send + Sync {
    fn public_key_for(&self, user: i64) -> Option<Vec<u8>>;
}

pub struct Dispatcher {
    pub registry: HandlerRegistry,
    pub principals: Arc<dyn PrincipalStore>,
    pub local_cipher: Arc<dyn Cipher>,
    pub shared_keys: SharedKeyCache,
    pub replay: ReplayCache,
    pub auth: AuthSubject,
    pub config: SecureRpcConfig,
}

impl Dispatcher {
    pub fn new(
        registry: HandlerRegistry,
        principals: Arc<dyn PrincipalStore>,
        local_cipher: Arc<dyn Cipher>,
        config: SecureRpcConfig,
    ) -> Self {
        Self {
            registry,
            principals,
            local_cipher,
            shared_keys: SharedKeyCache::new(config.shared_key_ttl),
            replay: ReplayCache::new(config.replay_ttl),
            auth: AuthSubject::new(config.token_cache_ttl),
            config,
        }
    }

    /// Run the full verification pipeline over a parsed request envelope,
    /// returning a fully-formed response envelope either way — callers
    /// never need to translate an `Err` into wire bytes themselves.
    pub async fn dispatch(&self, request: Envelope) -> Envelope {
        match self.dispatch_inner(&request).await {
            Ok(response) => response,
            Err(err) => {
                let (code, message) = err.rpc_code();
                Envelope::error_response(&request.router, request.user, code, message)
            }
        }
    }

    async fn dispatch_inner(&self, request: &Envelope) -> Result<Envelope, RpcError> {
        if request.body.len() > MAX_BODY_BYTES {
            return Err(RpcError::Structural("body exceeds maximum size".into()));
        }

        // Step 2: bounds-check every scalar before any crypto work is spent
        // on the request — cheapest checks first, per §4.3's ordering
        // rationale.
        if request.router.is_empty() || request.router.len() > 100 {
            return Err(RpcError::Structural("router must be 1-100 chars".into()));
        }
        if !(8..=32).contains(&request.nonce.len()) {
            return Err(RpcError::Structural("nonce must be 8-32 bytes".into()));
        }
        if request.timestamp <= 0 {
            return Err(RpcError::TemporalWindow);
        }
        if let Some(mac) = &request.mac {
            if !(32..=64).contains(&mac.len()) {
                return Err(RpcError::Structural("mac must be 32-64 bytes".into()));
            }
        }
        if let Some(esig) = &request.esig {
            if !(64..=96).contains(&esig.len()) {
                return Err(RpcError::Structural("esig must be 64-96 bytes".into()));
            }
        }

        let now = chrono::Utc::now().timestamp();
        let skew = (now - request.timestamp).abs();
        if skew > self.config.clock_skew.num_seconds() {
            return Err(RpcError::TemporalWindow);
        }

        let peer_public = self
            .principals
            .public_key_for(request.user)
            .ok_or(RpcError::UnknownPrincipal)?;

        // Step 4: verify the outer signature against the wire-received MAC —
        // `esig = ECDSA(mac, peer_private)`, not a signature over the
        // sign-string itself.
        let mac = request.mac.as_ref().ok_or(RpcError::SignatureInvalid)?;
        let esig = request.esig.as_ref().ok_or(RpcError::SignatureInvalid)?;
        self.local_cipher
            .verify(mac, esig, &peer_public)
            .map_err(|_| RpcError::SignatureInvalid)?;

        // Step 5: derive the shared secret and recompute the MAC from the
        // sign-string, then byte-compare against what was received.
        let shared_secret = self
            .shared_keys
            .get_shared_key(self.local_cipher.as_ref(), &peer_public)
            .map_err(|e| RpcError::CryptoFailure(e.to_string()))?;

        let sign_string = envelope::canonical_sign_string(
            &request.router,
            &request.body,
            &request.nonce,
            request.timestamp,
            request.plan,
            request.user,
        );
        let expected_mac = envelope::compute_mac(&sign_string, &shared_secret);
        if !envelope::macs_equal(mac, &expected_mac) {
            return Err(RpcError::SignatureInvalid);
        }

        if self.replay.check_and_record(mac) {
            return Err(RpcError::Replay);
        }

        let plaintext = match request.plan {
            Plan::Cleartext => request.body.clone(),
            Plan::Encrypted => envelope::decrypt_body(&request.body, &shared_secret)?,
        };

        let (factory, handler) = self
            .registry
            .get(&request.router)
            .ok_or_else(|| RpcError::RouteMissing(request.router.clone()))?;
        let _ = factory();

        let req_value: Value = if plaintext.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&plaintext).map_err(|e| RpcError::Structural(e.to_string()))?
        };

        let ctx = RequestContext {
            user: request.user,
            route: request.router.clone(),
        };
        let resp_value = handler(ctx, req_value)
            .await
            .map_err(|e| RpcError::HandlerError(e.to_string()))?;

        let resp_bytes = serde_json::to_vec(&resp_value).map_err(|e| RpcError::Structural(e.to_string()))?;
        let (resp_body, resp_plan) = match request.plan {
            Plan::Cleartext => (resp_bytes, Plan::Cleartext),
            Plan::Encrypted => (envelope::encrypt_body(&resp_bytes, &shared_secret)?, Plan::Encrypted),
        };

        // §3.6 invariant #1: every code=200 envelope carries a mac/esig pair
        // that verifies against the peer's public key — the reverse path
        // signs exactly the same way the forward path does.
        let mut response = Envelope::success_response(
            &request.router,
            request.user,
            resp_body,
            resp_plan,
            request.nonce.clone(),
        );
        let resp_sign_string = envelope::canonical_sign_string(
            &response.router,
            &response.body,
            &response.nonce,
            response.timestamp,
            response.plan,
            response.user,
        );
        let resp_mac = envelope::compute_mac(&resp_sign_string, &shared_secret);
        let resp_esig = self
            .local_cipher
            .sign(&resp_mac)
            .map_err(|e| RpcError::CryptoFailure(e.to_string()))?;
        response.mac = Some(resp_mac);
        response.esig = Some(resp_esig);
        Ok(response)
    }
}
