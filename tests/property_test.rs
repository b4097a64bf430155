//! Property-based tests for the envelope protocol's core invariants:
//! sign/verify round-trip, single-bit tamper detection, and the temporal
//! window. Driven directly against the dispatcher rather than over a real
//! socket, so each case runs the exact verification pipeline with no
//! network flakiness.

use proptest::prelude::*;
use securerpc::cipher::{Cipher, EcdsaP256};
use securerpc::config::SecureRpcConfig;
use securerpc::dispatcher::{Dispatcher, PrincipalStore};
use securerpc::envelope::{self, Envelope, Plan};
use securerpc::registry::HandlerRegistry;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

struct StaticPrincipals(Mutex<HashMap<i64, Vec<u8>>>);

impl PrincipalStore for StaticPrincipals {
    fn public_key_for(&self, user: i64) -> Option<Vec<u8>> {
        self.0.lock().unwrap().get(&user).cloned()
    }
}

fn build_dispatcher(client_pub: Vec<u8>, server: EcdsaP256, user: i64) -> Dispatcher {
    let mut principals_map = HashMap::new();
    principals_map.insert(user, client_pub);
    let principals: Arc<dyn PrincipalStore> = Arc::new(StaticPrincipals(Mutex::new(principals_map)));

    let mut registry = HandlerRegistry::new();
    registry
        .register(
            "echo.test",
            Arc::new(|| json!({})),
            Arc::new(|_ctx, req| Box::pin(async move { Ok(json!({"echo": req})) })),
        )
        .unwrap();

    Dispatcher::new(registry, principals, Arc::new(server), SecureRpcConfig::default())
}

fn sign(client: &EcdsaP256, server_pub: &[u8], router: &str, user: i64, body: &[u8], nonce: &[u8], timestamp: i64) -> Envelope {
    let plan = Plan::Cleartext;
    let sign_string = envelope::canonical_sign_string(router, body, nonce, timestamp, plan, user);
    let shared = client.derive_shared(server_pub).unwrap();
    let mac = envelope::compute_mac(&sign_string, &shared);
    let esig = client.sign(&mac).unwrap();
    Envelope {
        router: router.to_string(),
        body: body.to_vec(),
        nonce: nonce.to_vec(),
        timestamp,
        plan,
        user,
        mac: Some(mac),
        esig: Some(esig),
        code: None,
        message: None,
        valid: None,
    }
}

fn rt() -> tokio::runtime::Runtime {
    tokio::runtime::Runtime::new().unwrap()
}

proptest! {
    /// Property 1 — an envelope produced by the signing step is accepted
    /// by the verification pipeline for arbitrary body/nonce/user/route.
    #[test]
    fn sign_verify_round_trip(
        body in prop::collection::vec(any::<u8>(), 0..256),
        nonce in prop::collection::vec(any::<u8>(), 8..32),
        user in 1i64..1000,
        route in "[a-z]{1,10}\\.[a-z]{1,10}",
    ) {
        let client = EcdsaP256::generate();
        let server = EcdsaP256::generate();
        let client_pub = client.public_key_bytes().unwrap();
        let server_pub = server.public_key_bytes().unwrap();

        let mut principals_map = HashMap::new();
        principals_map.insert(user, client_pub);
        let principals: Arc<dyn PrincipalStore> = Arc::new(StaticPrincipals(Mutex::new(principals_map)));
        let mut registry = HandlerRegistry::new();
        registry
            .register(&route, Arc::new(|| json!({})), Arc::new(|_ctx, req| Box::pin(async move { Ok(json!({"echo": req})) })))
            .unwrap();
        let dispatcher = Dispatcher::new(registry, principals, Arc::new(server), SecureRpcConfig::default());

        let timestamp = chrono::Utc::now().timestamp();
        let json_body = serde_json::to_vec(&json!({"b": body})).unwrap();
        let req = sign(&client, &server_pub, &route, user, &json_body, &nonce, timestamp);

        let resp = rt().block_on(dispatcher.dispatch(req));
        prop_assert_eq!(resp.code, Some(200));
    }

    /// Property 2 — flipping a single bit of any signed field after the
    /// signature was computed causes verification to fail.
    #[test]
    fn single_bit_tamper_is_detected(
        field in 0u8..5,
        bit in 0u8..8,
    ) {
        let client = EcdsaP256::generate();
        let server = EcdsaP256::generate();
        let client_pub = client.public_key_bytes().unwrap();
        let server_pub = server.public_key_bytes().unwrap();
        let dispatcher = build_dispatcher(client_pub, server, 1);

        let body = br#"{"x":1}"#.to_vec();
        let nonce = b"0123456789abcdef".to_vec();
        let timestamp = chrono::Utc::now().timestamp();
        let mut req = sign(&client, &server_pub, "echo.test", 1, &body, &nonce, timestamp);

        match field {
            0 => { let i = bit as usize % req.body.len().max(1); if !req.body.is_empty() { req.body[i] ^= 1 << (bit % 8); } }
            1 => { let i = bit as usize % req.nonce.len(); req.nonce[i] ^= 1 << (bit % 8); }
            2 => { req.timestamp ^= 1 << (bit % 31); }
            3 => { req.user ^= 1 << (bit % 31); }
            _ => { req.router.push('x'); }
        }

        let resp = rt().block_on(dispatcher.dispatch(req));
        prop_assert_ne!(resp.code, Some(200));
    }

    /// Property 4 — the temporal window: envelopes with |now - timestamp|
    /// over the 300s default skew are rejected; those within are accepted.
    #[test]
    fn temporal_window_boundary(offset in -1000i64..1000) {
        let client = EcdsaP256::generate();
        let server = EcdsaP256::generate();
        let client_pub = client.public_key_bytes().unwrap();
        let server_pub = server.public_key_bytes().unwrap();
        let dispatcher = build_dispatcher(client_pub, server, 1);

        let now = chrono::Utc::now().timestamp();
        let timestamp = now + offset;
        let req = sign(&client, &server_pub, "echo.test", 1, b"{}", b"0123456789abcdef", timestamp);

        let resp = rt().block_on(dispatcher.dispatch(req));
        if offset.abs() > 300 {
            prop_assert_ne!(resp.code, Some(200));
        } else {
            prop_assert_eq!(resp.code, Some(200));
        }
    }
}
