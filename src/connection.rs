//! Broker connection shared by the client and server roles.
//!
//! A [`Connection`] owns one transport (one broker channel) and the queue
//! topology of exactly one role:
//!
//! | role   | queue                         | flags                          | binding          | QoS       |
//! |--------|-------------------------------|--------------------------------|------------------|-----------|
//! | client | `rpc.reply-<identity>-<uuid>` | exclusive, auto-delete         | its own name     | unbounded |
//! | server | `rpc-<service>`               | shared by all service replicas | `<service>.*`    | prefetch  |
//!
//! Both roles declare the durable topic exchange first. A single failed
//! declaration fails [`Connection::open`] as a whole; nothing is retried.

use std::sync::Arc;

use crate::protocol::routing;
use crate::{
    // ---
    log_debug,
    log_info,
    Address,
    Binding,
    ConsumeOptions,
    Envelope,
    ExchangeSpec,
    QueueSpec,
    Result,
    RpcConfig,
    RpcError,
    SubscriptionHandle,
    TransportPtr,
};

/// Which side of the protocol a connection serves.
///
/// The two roles bind their queues differently, so one connection never
/// plays both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Publishes requests, consumes replies on a private queue.
    Client,

    /// Consumes requests on the service queue, publishes replies.
    Server,
}

/// A transport with the RPC topology of one role declared on it.
#[derive(Clone)]
pub struct Connection {
    // ---
    transport: TransportPtr,
    role: Role,
    identity: String,
    exchange: Arc<str>,
    queue: Address,
    content_type: Arc<str>,
}

impl Connection {
    /// Declare the topology for `role` and return the ready connection.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Setup`] if any declaration, binding or QoS
    /// request fails, including redeclaration with conflicting parameters.
    pub async fn open(transport: TransportPtr, config: &RpcConfig, role: Role) -> Result<Self> {
        // ---
        transport
            .declare_exchange(&ExchangeSpec::topic(config.exchange.as_str()))
            .await
            .map_err(into_setup)?;

        let (queue, binding_key) = match role {
            Role::Client => {
                let queue = routing::reply_queue(&config.identity);
                let spec = QueueSpec {
                    name: queue.clone(),
                    durable: false,
                    exclusive: true,
                    auto_delete: true,
                };
                transport.declare_queue(&spec).await.map_err(into_setup)?;
                (queue.clone(), queue)
            }
            Role::Server => {
                let queue = routing::service_queue(&config.identity);
                let spec = QueueSpec {
                    name: queue.clone(),
                    durable: false,
                    exclusive: false,
                    auto_delete: false,
                };
                transport.declare_queue(&spec).await.map_err(into_setup)?;
                transport
                    .set_prefetch(config.prefetch_count)
                    .await
                    .map_err(into_setup)?;
                (queue, routing::service_binding(&config.identity))
            }
        };

        transport
            .bind_queue(&Binding {
                queue: queue.clone(),
                exchange: config.exchange.clone(),
                routing_key: binding_key.clone(),
            })
            .await
            .map_err(into_setup)?;

        log_info!(
            "[{}] {role:?} topology ready: queue {queue} bound to {} with {binding_key}",
            config.identity,
            config.exchange
        );

        Ok(Self {
            transport,
            role,
            identity: config.identity.clone(),
            exchange: Arc::from(config.exchange.as_str()),
            queue: Address::from(queue),
            content_type: Arc::from(config.content_type.as_str()),
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Service name (server) or client name (client).
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn exchange(&self) -> &Arc<str> {
        &self.exchange
    }

    /// Reply queue (client) or service queue (server).
    pub fn queue(&self) -> &Address {
        &self.queue
    }

    pub fn content_type(&self) -> &Arc<str> {
        &self.content_type
    }

    /// Publish through the connection's channel.
    pub async fn publish(&self, env: Envelope) -> Result<()> {
        self.transport.publish(env).await
    }

    /// Start consuming this role's queue with manual acknowledgment.
    ///
    /// The client consumes its reply queue exclusively.
    pub async fn consume(&self) -> Result<SubscriptionHandle> {
        // ---
        let opts = ConsumeOptions {
            exclusive: self.role == Role::Client,
        };
        log_debug!("[{}] consuming {}", self.identity, self.queue);
        self.transport.consume(self.queue.as_str(), opts).await
    }

    /// Close the underlying transport.
    pub async fn close(&self) -> Result<()> {
        self.transport.close().await
    }

    pub(crate) fn expect_role(&self, role: Role) -> Result<()> {
        // ---
        if self.role != role {
            return Err(RpcError::InvalidRole(format!(
                "{:?} connection '{}' cannot act as {role:?}",
                self.role, self.identity
            )));
        }
        Ok(())
    }
}

fn into_setup(err: RpcError) -> RpcError {
    match err {
        RpcError::Transport(msg) => RpcError::Setup(msg),
        other => other,
    }
}
