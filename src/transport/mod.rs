//! Transport implementations.
//!
//! This module provides concrete implementations of the domain-level
//! `Transport` trait. Broker-backed transports are hidden behind feature
//! flags and exposed only through constructor functions.
//!
//! Domain code must not depend on transport-specific types.

mod amqp;
mod memory;

pub use amqp::create_lapin_transport;
pub use memory::{create_memory_transport, create_memory_transport_with_hub, MemoryHub};

use crate::{Result, RpcConfig, RpcError, TransportPtr};

/// Create the transport selected by the configured broker URI.
///
/// - no URI or `memory://...` selects the process-global in-memory broker
/// - `amqp://...` or `amqps://...` connects with lapin
///
/// # Errors
///
/// Returns [`RpcError::Config`] for an unrecognized scheme or a disabled
/// transport feature, and [`RpcError::Setup`] if the broker is unreachable.
pub async fn create_transport(config: &RpcConfig) -> Result<TransportPtr> {
    // ---
    match config.broker_uri.as_deref() {
        None => Ok(create_memory_transport(config)),
        Some(uri) if uri.starts_with("memory://") => Ok(create_memory_transport(config)),
        Some(uri) if uri.starts_with("amqp://") || uri.starts_with("amqps://") => {
            create_lapin_transport(config).await
        }
        Some(uri) => Err(RpcError::Config(format!(
            "unrecognized broker uri scheme: {}, valid schemes: memory, amqp, amqps",
            crate::rpc_config::redact_uri(uri)
        ))),
    }
}
