//! Nameko-compatible RPC over an AMQP topic exchange.
//!
//! A client publishes `{"args": [...], "kwargs": {...}}` to the `nameko-rpc`
//! exchange with routing key `<service>.<method>`, tagged with a fresh
//! correlation id and the name of its private reply queue. A server consumes
//! `rpc-<service>`, dispatches to the registered handler and publishes
//! `{"result": ..., "error": ...}` back to the reply queue under the same
//! correlation id. Any number of calls may be in flight on one client; replies
//! are routed to their callers by correlation id.
//!
//! ```no_run
//! use nameko_rpc::{json, HandlerRegistry, RequestEnvelope, RpcClient, RpcConfig, RpcServer};
//!
//! # async fn demo() -> nameko_rpc::Result<()> {
//! let server = RpcServer::connect(&RpcConfig::from_env("articles")?).await?;
//! let handlers = HandlerRegistry::new()
//!     .register("get_foo", |_req: RequestEnvelope| async { Ok("foo") });
//! tokio::spawn(async move { server.serve(handlers).await });
//!
//! let client = RpcClient::connect(&RpcConfig::from_env("web")?).await?;
//! let foo = client
//!     .call("articles", "get_foo", RequestEnvelope::new().with_arg(json!("abc123")))
//!     .await?;
//! assert_eq!(foo, json!("foo"));
//! # Ok(())
//! # }
//! ```

use std::sync::{Mutex, MutexGuard};

mod client;
mod connection;
mod domain;
mod error;
mod macros;
mod protocol;
mod rpc_config;
mod server;
mod transport;

pub(crate) use macros::{log_debug, log_error, log_info, log_warn};

pub use client::RpcClient;
pub use connection::{Connection, Role};
pub use error::{Result, RpcError};
pub use protocol::routing;
pub use protocol::{CorrelationId, RemoteError, RequestEnvelope, ResponseEnvelope};
pub use rpc_config::RpcConfig;
pub use server::{HandlerRegistry, HandlerResult, RpcServer};

/// Self-describing value carried in arguments and results.
pub use serde_json::{json, Map, Value};

pub use transport::{
    //
    create_lapin_transport,
    create_memory_transport,
    create_memory_transport_with_hub,
    create_transport,
    MemoryHub,
};

// --- public re-exports
pub use domain::{
    //
    Acker,
    Acknowledge,
    Address,
    Binding,
    ConsumeOptions,
    Delivery,
    Envelope,
    ExchangeKind,
    ExchangeSpec,
    QueueSpec,
    SubscriptionHandle,
    Transport,
    TransportPtr,
};

/// Lock a std mutex, recovering the data if a holder panicked.
///
/// The guarded maps stay structurally valid across a panic, so a poisoned
/// lock is not a reason to stop routing.
pub(crate) fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
