use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::protocol::routing::normalize_method;
use crate::{RemoteError, RequestEnvelope};

/// What a handler returns: a serializable result or a remote error.
pub type HandlerResult<T> = std::result::Result<T, RemoteError>;

pub(super) type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult<Value>> + Send>>;

/// Type-erased async handler function
///
/// Takes the decoded request and resolves to the JSON result. Wrapped in
/// Arc so the registry can be cloned into the serve loop cheaply.
type BoxedHandler = Arc<dyn Fn(RequestEnvelope) -> HandlerFuture + Send + Sync>;

/// Wrap a typed handler function into a type-erased handler
fn wrap_handler<F, Fut, Resp>(handler: F) -> BoxedHandler
where
    F: Fn(RequestEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult<Resp>> + Send + 'static,
    Resp: Serialize + Send + 'static,
{
    // ---
    Arc::new(move |request: RequestEnvelope| {
        let fut = handler(request);
        let fut = Box::pin(async move {
            let resp = fut.await?;
            serde_json::to_value(resp)
                .map_err(|e| RemoteError::new("SerializationError", e.to_string()))
        });

        fut as HandlerFuture
    })
}

/// Methods a service exposes, keyed by normalized method name.
///
/// `get_foo`, `GetFoo` and `getFoo` all name the same entry, both when
/// registering and when a request is dispatched.
///
/// # Example
///
/// ```
/// use nameko_rpc::{json, HandlerRegistry, RemoteError, RequestEnvelope};
///
/// let handlers = HandlerRegistry::new()
///     .register("HealthCheck", |_req: RequestEnvelope| async {
///         Ok(json!({"git_sha": "dev"}))
///     })
///     .register("echo", |req: RequestEnvelope| async move {
///         req.arg(0)
///             .cloned()
///             .ok_or_else(|| RemoteError::new("ValueError", "echo needs one argument"))
///     });
///
/// assert!(handlers.contains("health_check"));
/// assert_eq!(handlers.methods(), vec!["echo", "health_check"]);
/// ```
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    // ---
    handlers: HashMap<String, BoxedHandler>,
}

impl HandlerRegistry {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler and return the registry, for chaining.
    pub fn register<F, Fut, Resp>(mut self, method: &str, handler: F) -> Self
    where
        F: Fn(RequestEnvelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<Resp>> + Send + 'static,
        Resp: Serialize + Send + 'static,
    {
        // ---
        self.insert(method, handler);
        self
    }

    /// Add a handler in place.
    ///
    /// Returns `true` if it replaced an earlier handler for the same name.
    pub fn insert<F, Fut, Resp>(&mut self, method: &str, handler: F) -> bool
    where
        F: Fn(RequestEnvelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<Resp>> + Send + 'static,
        Resp: Serialize + Send + 'static,
    {
        // ---
        self.handlers
            .insert(normalize_method(method), wrap_handler(handler))
            .is_some()
    }

    pub fn contains(&self, method: &str) -> bool {
        self.handlers.contains_key(&normalize_method(method))
    }

    /// Registered method names, normalized and sorted.
    pub fn methods(&self) -> Vec<&str> {
        // ---
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Start the handler for `method`.
    ///
    /// An unknown method resolves to a `MethodNotFound` error.
    pub(super) fn dispatch(&self, method: &str, request: RequestEnvelope) -> HandlerFuture {
        // ---
        match self.handlers.get(&normalize_method(method)) {
            Some(handler) => handler(request),
            None => {
                let err = RemoteError::method_not_found(method);
                Box::pin(async move { Err(err) })
            }
        }
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("methods", &self.methods())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde_json::json;

    #[derive(Serialize)]
    struct Sum {
        total: i64,
    }

    fn registry() -> HandlerRegistry {
        HandlerRegistry::new()
            .register("get_foo", |_req: RequestEnvelope| async { Ok("foo") })
            .register("addAll", |req: RequestEnvelope| async move {
                let total = req.args.iter().filter_map(Value::as_i64).sum();
                Ok(Sum { total })
            })
            .register("fail", |_req: RequestEnvelope| async {
                Err::<(), _>(RemoteError::new("ValueError", "bad input"))
            })
    }

    #[tokio::test]
    async fn test_dispatch_by_normalized_name() {
        // ---
        let handlers = registry();

        let foo = handlers.dispatch("GetFoo", RequestEnvelope::new()).await;
        assert_eq!(foo.unwrap(), json!("foo"));

        let request = RequestEnvelope::new().with_arg(2).with_arg(3);
        let sum = handlers.dispatch("add_all", request).await;
        assert_eq!(sum.unwrap(), json!({"total": 5}));
    }

    #[tokio::test]
    async fn test_handler_error_passes_through() {
        // ---
        let err = registry()
            .dispatch("fail", RequestEnvelope::new())
            .await
            .unwrap_err();
        assert_eq!(err.exc_type, "ValueError");
        assert_eq!(err.value, "bad input");
    }

    #[tokio::test]
    async fn test_unknown_method() {
        // ---
        let err = registry()
            .dispatch("missing", RequestEnvelope::new())
            .await
            .unwrap_err();
        assert_eq!(err.exc_type, "MethodNotFound");
    }

    #[test]
    fn test_insert_reports_replacement() {
        // ---
        let mut handlers = registry();
        assert_eq!(handlers.len(), 3);
        assert!(handlers.insert("getFoo", |_req: RequestEnvelope| async { Ok("bar") }));
        assert!(!handlers.insert("new_one", |_req: RequestEnvelope| async { Ok(()) }));
        assert_eq!(handlers.methods(), vec!["add_all", "fail", "get_foo", "new_one"]);
    }
}
