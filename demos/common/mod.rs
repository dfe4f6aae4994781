//! Handlers shared by the demos.
//!
//! The base service every Nameko-style service in the demos exposes.

use nameko_rpc::{json, HandlerRegistry, RemoteError, RequestEnvelope, Value};

/// `health_check`, `get_foo` and `get_article`.
pub fn base_service() -> HandlerRegistry {
    // ---
    HandlerRegistry::new()
        .register("health_check", |_req: RequestEnvelope| async {
            Ok(json!({ "git_sha": git_sha() }))
        })
        .register("get_foo", |_req: RequestEnvelope| async { Ok("foo") })
        .register("get_article", |req: RequestEnvelope| async move {
            let Some(id) = req.arg(0).or_else(|| req.kwarg("id")).and_then(Value::as_u64) else {
                return Err(RemoteError::new("ValueError", "get_article needs an id"));
            };
            Ok(json!({ "id": id, "title": format!("article {id}") }))
        })
}

fn git_sha() -> String {
    std::env::var("GIT_SHA").unwrap_or_else(|_| "dev".to_string())
}
