//! WebSocket session state machine — dial, handshake, heartbeat, reconnect
//! with exponential backoff, and response correlation for a multiplexed
//! request/response + server-push connection.
//!
//! Grounded on the teacher's `relay::relay_loop` (`connect_async`, a
//! `tokio::select!` over inbound/outbound/broadcast tasks, and exponential
//! backoff via `sleep_backoff`), generalized from a single fixed relay URL
//! into a reusable client session, plus a correlation map (keyed on the
//! envelope `nonce`) so concurrent in-flight calls can be answered
//! out of order.

use crate::cipher::Cipher;
use crate::config::SecureRpcConfig;
use crate::envelope::{self, Envelope, Plan};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Dialing,
    Handshaking,
    Open,
    ReconnectWait,
    Closing,
    Closed,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionState::Init,
            1 => SessionState::Dialing,
            2 => SessionState::Handshaking,
            3 => SessionState::Open,
            4 => SessionState::ReconnectWait,
            5 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Status code carried on unsolicited server push frames.
pub const PUSH_CODE: i32 = 300;

/// Reconnect attempts are capped here purely to keep `2^attempts` from
/// overflowing; it does not itself bound the number of reconnect attempts
/// (see [`SecureRpcConfig::max_reconnect_attempts`] for that).
const MAX_BACKOFF_EXPONENT: u32 = 30;

/// Identity presented during the handshake and heartbeat: the bearer token
/// and its derived per-token MAC secret (see [`crate::auth::AuthSubject`]),
/// the local signing cipher, and the principal id to place in `user`.
#[derive(Clone)]
pub struct HandshakeAuth {
    pub user: i64,
    pub local_cipher: Arc<dyn Cipher>,
    /// Per-token secret from `AuthSubject::get_token_secret`, used as both
    /// the AEAD key and the MAC key for the handshake and heartbeat frames.
    pub mac_secret: Vec<u8>,
    /// The server's signing public key, used to verify the dual signature
    /// (MAC + ECDSA) on handshake acks and heartbeat pongs before trusting
    /// them — see §4.7's HANDSHAKING → OPEN transition.
    pub server_public_key: Vec<u8>,
}

type PushHandler = Arc<dyn Fn(Envelope) + Send + Sync>;

/// Pending-call correlation map, response cache, subscription registry, and
/// reconnect/backoff state for one logical session. Cloneable — cheap `Arc`
/// handles shared between the reader task, writer task, heartbeat task, and
/// the caller-facing [`Session::call`].
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

struct Inner {
    url: String,
    config: SecureRpcConfig,
    auth: Option<HandshakeAuth>,
    state: AtomicU8,
    /// Keyed on the envelope `nonce`; a plain map rather than [`crate::cache::TtlMap`]
    /// since a `oneshot::Sender` isn't `Clone` and the correlation entry
    /// must be consumed exactly once by whichever side removes it first —
    /// the incoming response, or a caller timing out.
    waiters: Mutex<HashMap<Vec<u8>, oneshot::Sender<Envelope>>>,
    outbound: Mutex<Option<mpsc::Sender<Message>>>,
    push_tx: broadcast::Sender<Envelope>,
    /// Route → subscriber callbacks, accessed without a registry-wide lock
    /// held across dispatch (each lookup only briefly locks to clone the
    /// handler list, mirroring the concurrent-safe map the spec calls for).
    subscriptions: Mutex<HashMap<String, Vec<PushHandler>>>,
}

impl Session {
    pub fn new(url: impl Into<String>, config: SecureRpcConfig) -> Self {
        Self::with_auth(url, config, None)
    }

    pub fn with_auth(url: impl Into<String>, config: SecureRpcConfig, auth: Option<HandshakeAuth>) -> Self {
        let (push_tx, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                url: url.into(),
                config,
                auth,
                state: AtomicU8::new(SessionState::Init.as_u8()),
                waiters: Mutex::new(HashMap::new()),
                outbound: Mutex::new(None),
                push_tx,
                subscriptions: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, s: SessionState) {
        self.inner.state.store(s.as_u8(), Ordering::SeqCst);
    }

    pub fn subscribe_pushes(&self) -> broadcast::Receiver<Envelope> {
        self.inner.push_tx.subscribe()
    }

    /// Register a callback invoked (on its own task) for every push envelope
    /// whose `router` matches `route`. Re-subscribing after a reconnect is a
    /// handler-level responsibility; the registry itself survives
    /// reconnects unmodified.
    pub async fn subscribe_route(&self, route: impl Into<String>, handler: PushHandler) {
        let mut subs = self.inner.subscriptions.lock().await;
        subs.entry(route.into()).or_default().push(handler);
    }

    /// Drive the dial/handshake/open/reconnect loop until `shutdown` resolves.
    /// Runs forever otherwise, reconnecting with exponential backoff and
    /// cryptographically-randomized jitter between attempts.
    pub async fn run(&self, mut shutdown: oneshot::Receiver<()>) {
        let mut attempt: u32 = 0;
        loop {
            if let Ok(()) | Err(oneshot::error::TryRecvError::Closed) = shutdown.try_recv() {
                self.set_state(SessionState::Closed);
                return;
            }

            self.set_state(SessionState::Dialing);
            match tokio_tungstenite::connect_async(&self.inner.url).await {
                Ok((stream, _)) => {
                    info!(url = %self.inner.url, "ws: connected");
                    let (mut sink, source) = stream.split();
                    let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
                    *self.inner.outbound.lock().await = Some(out_tx.clone());

                    let writer = async move {
                        while let Some(msg) = out_rx.recv().await {
                            if sink.send(msg).await.is_err() {
                                break;
                            }
                        }
                    };
                    let writer_handle = tokio::spawn(writer);

                    let reader_session = self.clone();
                    let reader = async move {
                        let mut source = source;
                        while let Some(msg) = source.next().await {
                            match msg {
                                Ok(Message::Text(text)) => reader_session.handle_frame(&text).await,
                                Ok(Message::Close(_)) | Err(_) => break,
                                _ => {}
                            }
                        }
                    };
                    let mut reader_handle = tokio::spawn(reader);

                    self.set_state(SessionState::Handshaking);
                    let handshake_ok = self.handshake().await.is_ok();

                    if handshake_ok {
                        attempt = 0;
                        self.set_state(SessionState::Open);
                        let heartbeat = self.heartbeat_loop();

                        tokio::select! {
                            _ = heartbeat => { warn!("ws: heartbeat failed"); }
                            _ = &mut reader_handle => { warn!("ws: reader closed"); }
                            _ = &mut shutdown => {
                                self.set_state(SessionState::Closing);
                                *self.inner.outbound.lock().await = None;
                                writer_handle.abort();
                                reader_handle.abort();
                                self.drain_waiters().await;
                                self.set_state(SessionState::Closed);
                                return;
                            }
                        }
                    } else {
                        warn!("ws: handshake failed");
                    }

                    *self.inner.outbound.lock().await = None;
                    writer_handle.abort();
                    reader_handle.abort();
                    self.drain_waiters().await;
                }
                Err(e) => {
                    warn!("ws: connect failed: {e:#}");
                }
            }

            if let Some(max) = self.inner.config.max_reconnect_attempts {
                if attempt >= max {
                    self.set_state(SessionState::Closed);
                    return;
                }
            }
            self.set_state(SessionState::ReconnectWait);
            attempt += 1;
            self.sleep_backoff(attempt).await;
        }
    }

    /// Fail every in-flight waiter with `connection closed while waiting
    /// response` rather than leaving it to time out — no ordering is
    /// preserved across a reconnect.
    async fn drain_waiters(&self) {
        let mut waiters = self.inner.waiters.lock().await;
        for (_, sender) in waiters.drain() {
            drop(sender); // receiver observes SessionError::Closed
        }
    }

    async fn sleep_backoff(&self, attempt: u32) {
        let base = self.inner.config.reconnect_base;
        let max = self.inner.config.reconnect_max;
        let exp = base.saturating_mul(1u32 << attempt.min(MAX_BACKOFF_EXPONENT).min(30));
        let exp = exp.min(max);
        let jitter_frac: f64 = rand::thread_rng().gen_range(0.0..1.0);
        let jitter = Duration::from_secs_f64(jitter_frac);
        let delay = exp.saturating_add(jitter).min(max + Duration::from_secs(1));
        tokio::time::sleep(delay).await;
    }

    /// `DIALING → HANDSHAKING → OPEN`: send the auth handshake envelope and
    /// require a `code=200` response, dual-signature verified (MAC + ECDSA)
    /// against the server's public key, whose body decrypts to a non-empty
    /// acknowledgement. Sessions with no [`HandshakeAuth`] configured skip
    /// straight to `OPEN` — used for anonymous/push-only connections.
    async fn handshake(&self) -> Result<(), SessionError> {
        let auth = match &self.inner.auth {
            Some(a) => a.clone(),
            None => return Ok(()),
        };

        let plaintext = b"auth_handshake";
        let nonce = *uuid::Uuid::new_v4().as_bytes();
        let timestamp = chrono::Utc::now().timestamp();
        let plan = Plan::Encrypted;

        let wire_body = envelope::encrypt_body(plaintext, &auth.mac_secret)
            .map_err(|_| SessionError::HandshakeFailed)?;
        let sign_string = envelope::canonical_sign_string(
            &self.inner.config.connect_path,
            &wire_body,
            &nonce,
            timestamp,
            plan,
            auth.user,
        );
        let mac = envelope::compute_mac(&sign_string, &auth.mac_secret);
        let esig = auth
            .local_cipher
            .sign(&mac)
            .map_err(|_| SessionError::HandshakeFailed)?;

        let request = Envelope {
            router: self.inner.config.connect_path.clone(),
            body: wire_body,
            nonce: nonce.to_vec(),
            timestamp,
            plan,
            user: auth.user,
            mac: Some(mac),
            esig: Some(esig),
            code: None,
            message: None,
            valid: None,
        };

        let response = self
            .call(request, self.inner.config.ping_timeout.max(Duration::from_secs(5)))
            .await
            .map_err(|_| SessionError::HandshakeFailed)?;

        if response.code != Some(200) {
            return Err(SessionError::HandshakeFailed);
        }
        self.verify_response_signature(&response, &auth)?;
        let ack = match response.plan {
            Plan::Cleartext => response.body,
            Plan::Encrypted => envelope::decrypt_body(&response.body, &auth.mac_secret)
                .map_err(|_| SessionError::HandshakeFailed)?,
        };
        if ack.is_empty() {
            return Err(SessionError::HandshakeFailed);
        }
        Ok(())
    }

    /// Runs while the session is `OPEN`: every `ping_interval`, send a ping
    /// envelope to `"{connect_path}/ping"` and require a pong within
    /// `ping_timeout`. Returns (ending the `OPEN` select) on the first
    /// missed pong, which drives the session into `RECONNECT_WAIT`.
    async fn heartbeat_loop(&self) {
        if self.inner.auth.is_none() {
            // No identity to sign pings with — this session never
            // heartbeats (e.g. an anonymous push-only subscriber), so this
            // future simply never resolves, leaving OPEN driven only by
            // the reader/shutdown arms of the outer `select!`.
            std::future::pending::<()>().await;
        }

        let mut interval = tokio::time::interval(self.inner.config.ping_interval);
        interval.tick().await; // first tick fires immediately; skip it
        loop {
            interval.tick().await;
            if self.ping_once().await.is_err() {
                return;
            }
        }
    }

    async fn ping_once(&self) -> Result<(), SessionError> {
        let auth = self.inner.auth.as_ref().ok_or(SessionError::NotConnected)?;

        let plaintext = b"ping";
        let nonce = *uuid::Uuid::new_v4().as_bytes();
        let timestamp = chrono::Utc::now().timestamp();
        let plan = Plan::Cleartext;
        let route = format!("{}/ping", self.inner.config.connect_path);

        let sign_string = envelope::canonical_sign_string(&route, plaintext, &nonce, timestamp, plan, auth.user);
        let mac = envelope::compute_mac(&sign_string, &auth.mac_secret);
        let esig = auth
            .local_cipher
            .sign(&mac)
            .map_err(|_| SessionError::Encode)?;

        let request = Envelope {
            router: route,
            body: plaintext.to_vec(),
            nonce: nonce.to_vec(),
            timestamp,
            plan,
            user: auth.user,
            mac: Some(mac),
            esig: Some(esig),
            code: None,
            message: None,
            valid: None,
        };

        let response = self.call(request, self.inner.config.ping_timeout).await?;
        if response.code != Some(200) {
            return Err(SessionError::Closed);
        }
        self.verify_response_signature(&response, auth)
    }

    /// Verify a `code=200` response's dual signature (MAC + ECDSA) against
    /// this session's negotiated MAC secret and the server's public key —
    /// required before the handshake ack or any heartbeat pong is trusted.
    fn verify_response_signature(&self, response: &Envelope, auth: &HandshakeAuth) -> Result<(), SessionError> {
        let mac = response.mac.as_ref().ok_or(SessionError::SignatureInvalid)?;
        let esig = response.esig.as_ref().ok_or(SessionError::SignatureInvalid)?;

        auth.local_cipher
            .verify(mac, esig, &auth.server_public_key)
            .map_err(|_| SessionError::SignatureInvalid)?;

        let sign_string = envelope::canonical_sign_string(
            &response.router,
            &response.body,
            &response.nonce,
            response.timestamp,
            response.plan,
            response.user,
        );
        let expected_mac = envelope::compute_mac(&sign_string, &auth.mac_secret);
        if !envelope::macs_equal(mac, &expected_mac) {
            return Err(SessionError::SignatureInvalid);
        }
        Ok(())
    }

    async fn handle_frame(&self, text: &str) {
        let envelope = match Envelope::from_json(text) {
            Ok(e) => e,
            Err(e) => {
                debug!("ws: unparseable frame: {e}");
                return;
            }
        };

        match envelope.code {
            Some(PUSH_CODE) => self.dispatch_push(envelope).await,
            Some(200) | None => {
                let mut waiters = self.inner.waiters.lock().await;
                if let Some(sender) = waiters.remove(&envelope.nonce) {
                    let _ = sender.send(envelope);
                } else {
                    debug!("ws: response for unknown or already-closed correlation id");
                }
            }
            Some(other) => {
                debug!(code = other, "ws: unexpected response code, dropping");
            }
        }
    }

    /// Verify a push envelope's MAC under the configured
    /// `push_signing_key` (distinct from any per-connection shared secret),
    /// then fan it out to the broadcast subscribers and any per-route
    /// subscribers, each on its own task.
    async fn dispatch_push(&self, envelope: Envelope) {
        let key = self.inner.config.push_signing_key.as_bytes();
        let sign_string = envelope::canonical_sign_string(
            &envelope.router,
            &envelope.body,
            &envelope.nonce,
            envelope.timestamp,
            envelope.plan,
            envelope.user,
        );
        let expected = envelope::compute_mac(&sign_string, key);
        let verified = envelope
            .mac
            .as_ref()
            .map(|mac| envelope::macs_equal(mac, &expected))
            .unwrap_or(false);
        if !verified {
            warn!(route = %envelope.router, "ws: push signature verification failed, dropping");
            return;
        }

        let _ = self.inner.push_tx.send(envelope.clone());

        let subs = self.inner.subscriptions.lock().await;
        if let Some(handlers) = subs.get(&envelope.router) {
            for handler in handlers.clone() {
                let env = envelope.clone();
                tokio::spawn(async move { handler(env) });
            }
        }
    }

    /// Send `request` and await its correlated response, or a timeout.
    pub async fn call(&self, request: Envelope, timeout: Duration) -> Result<Envelope, SessionError> {
        let outbound = self
            .inner
            .outbound
            .lock()
            .await
            .clone()
            .ok_or(SessionError::NotConnected)?;

        let (tx, rx) = oneshot::channel();
        {
            let mut waiters = self.inner.waiters.lock().await;
            waiters.insert(request.nonce.clone(), tx);
        }

        let json = request.to_json().map_err(|_| SessionError::Encode)?;
        if outbound.send(Message::Text(json)).await.is_err() {
            self.inner.waiters.lock().await.remove(&request.nonce);
            return Err(SessionError::NotConnected);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(SessionError::Closed),
            Err(_) => {
                self.inner.waiters.lock().await.remove(&request.nonce);
                Err(SessionError::Timeout)
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session is not connected")]
    NotConnected,
    #[error("failed to encode request")]
    Encode,
    #[error("session closed before a response arrived")]
    Closed,
    #[error("timed out waiting for a response")]
    Timeout,
    #[error("handshake failed")]
    HandshakeFailed,
    #[error("response signature verification failed")]
    SignatureInvalid,
}
