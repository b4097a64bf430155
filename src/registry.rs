//! Handler registry — maps a route string to a `(factory, handler)` pair,
//! generalizing the teacher's compiled `match method { ... }` dispatch table
//! into data so routes can be registered at runtime instead of at compile
//! time.

use crate::error::RpcError;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Per-call context handed to every handler.
#[derive(Clone)]
pub struct RequestContext {
    /// The `user` principal id the request was verified against.
    pub user: i64,
    /// The route that was dispatched.
    pub route: String,
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, RpcError>> + Send>>;

/// A typed handler, erased to operate on `serde_json::Value` at the
/// registry boundary; the factory+decode step upstream (see
/// [`crate::dispatcher`]) is what gives the handler a concrete typed value.
pub type HandlerFn = Arc<dyn Fn(RequestContext, Value) -> HandlerFuture + Send + Sync>;

/// Produces a zero-value typed request target for a route. Factories must
/// return a usable instance — the registry rejects routes whose factory
/// returns `Value::Null`, checked eagerly at registration time since the
/// factory output shape is route-invariant.
pub type FactoryFn = Arc<dyn Fn() -> Value + Send + Sync>;

struct Route {
    factory: FactoryFn,
    handler: HandlerFn,
}

/// Routes are registered once at startup and never mutated afterward —
/// registration is atomic and the registry is written only during
/// initialization in production.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    routes: HashMap<String, Arc<Route>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `route`. Errors if the route already
    /// exists or the factory produces a nil value.
    pub fn register(&mut self, route: impl Into<String>, factory: FactoryFn, handler: HandlerFn) -> Result<(), RpcError> {
        let route = route.into();
        if self.routes.contains_key(&route) {
            return Err(RpcError::Structural(format!("route already registered: {route}")));
        }
        if factory().is_null() {
            return Err(RpcError::Structural(format!(
                "factory for route {route} must not return a nil value"
            )));
        }
        self.routes.insert(route, Arc::new(Route { factory, handler }));
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn contains(&self, route: &str) -> bool {
        self.routes.contains_key(route)
    }

    /// Look up a route's factory/handler pair.
    pub(crate) fn get(&self, route: &str) -> Option<(FactoryFn, HandlerFn)> {
        self.routes
            .get(route)
            .map(|r| (r.factory.clone(), r.handler.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop_handler() -> HandlerFn {
        Arc::new(|_ctx, req| Box::pin(async move { Ok(req) }))
    }

    #[test]
    fn duplicate_route_registration_fails() {
        let mut registry = HandlerRegistry::new();
        registry
            .register("a.b", Arc::new(|| json!({})), noop_handler())
            .unwrap();
        let err = registry.register("a.b", Arc::new(|| json!({})), noop_handler());
        assert!(err.is_err());
    }

    #[test]
    fn nil_factory_is_rejected() {
        let mut registry = HandlerRegistry::new();
        let err = registry.register("a.b", Arc::new(|| Value::Null), noop_handler());
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn registered_routes_are_isolated() {
        let mut registry = HandlerRegistry::new();
        registry
            .register(
                "route.a",
                Arc::new(|| json!({"kind": "a"})),
                Arc::new(|_ctx, _req| Box::pin(async move { Ok(json!({"from": "a"})) })),
            )
            .unwrap();
        registry
            .register(
                "route.b",
                Arc::new(|| json!({"kind": "b"})),
                Arc::new(|_ctx, _req| Box::pin(async move { Ok(json!({"from": "b"})) })),
            )
            .unwrap();

        let (factory_a, handler_a) = registry.get("route.a").unwrap();
        let (factory_b, handler_b) = registry.get("route.b").unwrap();
        assert_eq!(factory_a(), json!({"kind": "a"}));
        assert_eq!(factory_b(), json!({"kind": "b"}));

        let ctx = RequestContext { user: 1, route: "route.a".into() };
        let resp_a = handler_a(ctx.clone(), json!(null)).await.unwrap();
        let resp_b = handler_b(ctx, json!(null)).await.unwrap();
        assert_eq!(resp_a, json!({"from": "a"}));
        assert_eq!(resp_b, json!({"from": "b"}));
    }
}
