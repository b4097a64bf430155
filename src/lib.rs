//! Secure RPC transport core: a signed/encrypted envelope protocol, a
//! handler registry and verification pipeline, shared-key and replay
//! caches, bearer-token auth, a WebSocket session state machine, an
//! outbound connection pool, and a client SDK.
//!
//! There is no process-wide singleton here — every component is
//! constructed with its dependencies passed in explicitly (see
//! [`dispatcher::Dispatcher::new`]), unlike the teacher's `AppContext`
//! global. Callers assemble the pieces they need in `main` or in their own
//! embedding application.

pub mod auth;
pub mod cache;
pub mod cipher;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod pool;
pub mod registry;
pub mod server;
pub mod ws;

pub use dispatcher::{Dispatcher, PrincipalStore};
pub use envelope::Envelope;
pub use error::RpcError;
pub use registry::HandlerRegistry;
