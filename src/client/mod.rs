//! RPC client SDK surface — connect, authenticate, add a cipher, and call
//! registered routes. Generalizes the teacher's `cli::client::DaemonClient`
//! (connect-once/auth/`call_once`/`read_response` over a short-lived
//! WebSocket) from a single hard-coded JSON-RPC shape into the signed
//! envelope protocol, with a configurable cipher and an optional local
//! shared-key cache.

use crate::cache::SharedKeyCache;
use crate::cipher::Cipher;
use crate::config::SecureRpcConfig;
use crate::envelope::{self, Envelope, Plan};
use crate::ws::{Session, SessionError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("not connected — call connect() first")]
    NotConnected,
    #[error("already connected")]
    AlreadyConnected,
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("server returned error {code}: {message}")]
    Remote { code: i32, message: String },
    #[error("cipher error: {0}")]
    Cipher(String),
    #[error("encode/decode error: {0}")]
    Codec(String),
    #[error("response signature verification failed")]
    SignatureInvalid,
}

/// Builder/handle for a single logical RPC client connection.
///
/// Mirrors the teacher's small, chainable configuration surface
/// (`DaemonClient::new(port, token)` then `call_once`), generalized into
/// `new` + setter methods + `connect`/`call`/`close`, since this client's
/// connection is long-lived and reused across many calls rather than
/// reopened per call.
pub struct RpcClient {
    url: String,
    user: i64,
    local_cipher: Arc<dyn Cipher>,
    server_public_key: Vec<u8>,
    local_cache: Option<SharedKeyCache>,
    timeout: Duration,
    session: Option<Session>,
    /// Held for the lifetime of the connection; dropping (or sending on) it
    /// is what tells the session's `run` loop to stop reconnecting. Must
    /// NOT be dropped right after spawning — the session task would then
    /// observe an already-closed shutdown channel on its very first poll
    /// and tear down before ever dialing.
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
    config: SecureRpcConfig,
}

impl RpcClient {
    pub fn new(url: impl Into<String>, user: i64, local_cipher: Arc<dyn Cipher>, server_public_key: Vec<u8>) -> Self {
        Self {
            url: url.into(),
            user,
            local_cipher,
            server_public_key,
            local_cache: None,
            timeout: Duration::from_secs(10),
            session: None,
            shutdown: None,
            config: SecureRpcConfig::default(),
        }
    }

    pub fn set_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Install a process-local shared-key cache so repeated calls skip
    /// re-deriving the ECDH shared secret on every connection.
    pub fn add_local_cache(mut self, ttl: Duration) -> Self {
        self.local_cache = Some(SharedKeyCache::new(ttl));
        self
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    pub async fn connect(&mut self) -> Result<(), ClientError> {
        if self.session.is_some() {
            return Err(ClientError::AlreadyConnected);
        }
        let session = Session::new(self.url.clone(), self.config.clone());
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        let run_session = session.clone();
        tokio::spawn(async move { run_session.run(shutdown_rx).await });
        self.session = Some(session);
        self.shutdown = Some(shutdown_tx);
        Ok(())
    }

    /// Disable reconnection and drop the session. Sending (rather than just
    /// dropping) the shutdown signal lets the session distinguish an
    /// explicit `Close` from an incidental channel drop, per the CLOSING
    /// state transition.
    pub fn close(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.session = None;
    }

    fn shared_secret(&self) -> Result<Vec<u8>, ClientError> {
        if let Some(cache) = &self.local_cache {
            cache
                .get_shared_key(self.local_cipher.as_ref(), &self.server_public_key)
                .map_err(|e| ClientError::Cipher(e.to_string()))
        } else {
            self.local_cipher
                .derive_shared(&self.server_public_key)
                .map_err(|e| ClientError::Cipher(e.to_string()))
        }
    }

    /// Call `route` with a JSON-serializable request, returning the decoded
    /// JSON response on success or a [`ClientError::Remote`] for a non-200
    /// envelope.
    pub async fn call<T, R>(&self, route: &str, request: &T, plan: Plan) -> Result<R, ClientError>
    where
        T: serde::Serialize,
        R: serde::de::DeserializeOwned,
    {
        let session = self.session.as_ref().ok_or(ClientError::NotConnected)?;

        let body = serde_json::to_vec(request).map_err(|e| ClientError::Codec(e.to_string()))?;
        let shared_secret = self.shared_secret()?;

        let nonce = *uuid::Uuid::new_v4().as_bytes();
        let timestamp = chrono::Utc::now().timestamp();

        let wire_body = match plan {
            Plan::Cleartext => body,
            Plan::Encrypted => envelope::encrypt_body(&body, &shared_secret).map_err(|e| ClientError::Codec(e.to_string()))?,
        };

        let sign_string = envelope::canonical_sign_string(route, &wire_body, &nonce, timestamp, plan, self.user);
        let mac = envelope::compute_mac(&sign_string, &shared_secret);
        let esig = self
            .local_cipher
            .sign(&mac)
            .map_err(|e| ClientError::Cipher(e.to_string()))?;

        let request_envelope = Envelope {
            router: route.to_string(),
            body: wire_body,
            nonce: nonce.to_vec(),
            timestamp,
            plan,
            user: self.user,
            mac: Some(mac),
            esig: Some(esig),
            code: None,
            message: None,
            valid: None,
        };

        let response = session.call(request_envelope, self.timeout).await?;

        match response.code {
            Some(200) => {
                // §3.6 invariant #1: a code=200 response must carry a mac/esig
                // pair that verifies against the server's public key before
                // its body is trusted.
                let resp_mac = response.mac.as_ref().ok_or(ClientError::SignatureInvalid)?;
                let resp_esig = response.esig.as_ref().ok_or(ClientError::SignatureInvalid)?;
                self.local_cipher
                    .verify(resp_mac, resp_esig, &self.server_public_key)
                    .map_err(|_| ClientError::SignatureInvalid)?;

                let resp_sign_string = envelope::canonical_sign_string(
                    &response.router,
                    &response.body,
                    &response.nonce,
                    response.timestamp,
                    response.plan,
                    response.user,
                );
                let expected_mac = envelope::compute_mac(&resp_sign_string, &shared_secret);
                if !envelope::macs_equal(resp_mac, &expected_mac) {
                    return Err(ClientError::SignatureInvalid);
                }

                let plaintext = match response.plan {
                    Plan::Cleartext => response.body,
                    Plan::Encrypted => envelope::decrypt_body(&response.body, &shared_secret)
                        .map_err(|e| ClientError::Codec(e.to_string()))?,
                };
                serde_json::from_slice(&plaintext).map_err(|e| ClientError::Codec(e.to_string()))
            }
            other => Err(ClientError::Remote {
                code: other.unwrap_or(-1),
                message: response.message.unwrap_or_default(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::EcdsaP256;

    #[test]
    fn builder_chains_without_connecting() {
        let cipher: Arc<dyn Cipher> = Arc::new(EcdsaP256::generate());
        let client = RpcClient::new("ws://127.0.0.1:7300", 1, cipher, vec![0u8; 65])
            .set_timeout(Duration::from_secs(3))
            .add_local_cache(Duration::from_secs(60));
        assert!(!client.is_connected());
    }
}
