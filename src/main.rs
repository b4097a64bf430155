use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use clap::Parser;
use securerpc::cipher::{Cipher, EcdsaP256};
use securerpc::config::{Args, SecureRpcConfig};
use securerpc::dispatcher::{Dispatcher, PrincipalStore};
use securerpc::registry::HandlerRegistry;
use securerpc::server::Server;
use serde_json::json;
use tracing::info;

/// In-memory principal directory keyed on caller id, populated from
/// whatever provisioning flow an embedding application uses (device
/// pairing, operator-issued certificates, etc.). A production deployment
/// would back this with the same kind of store the teacher's daemon uses
/// for paired devices rather than an in-memory map.
struct StaticPrincipals(Mutex<HashMap<i64, Vec<u8>>>);

impl PrincipalStore for StaticPrincipals {
    fn public_key_for(&self, user: i64) -> Option<Vec<u8>> {
        self.0.lock().expect("principal map mutex poisoned").get(&user).cloned()
    }
}

fn setup_logging(log_level: &str) {
    tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = SecureRpcConfig::from_args(args);
    setup_logging(&config.log);

    let server_cipher = EcdsaP256::generate();
    info!(
        public_key = %hex::encode(server_cipher.public_key_bytes().expect("ecdsa cipher always has a public key")),
        "securerpc: generated ephemeral server identity"
    );

    let mut registry = HandlerRegistry::new();
    registry
        .register(
            "health.ping",
            Arc::new(|| json!({})),
            Arc::new(|_ctx, _req| Box::pin(async move { Ok(json!({"status": "ok"})) })),
        )
        .expect("health.ping is the first registration and cannot collide");
    let principals: Arc<dyn PrincipalStore> = Arc::new(StaticPrincipals(Mutex::new(HashMap::new())));
    let dispatcher = Dispatcher::new(registry, principals, Arc::new(server_cipher), config);

    let server = Server::new(dispatcher)?;
    let (_shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    server.run(shutdown_rx).await?;

    Ok(())
}
