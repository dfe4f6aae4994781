//! Server role: consume a service queue, run handlers, publish replies.
mod handler;

pub use handler::{HandlerRegistry, HandlerResult};

use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::{oneshot, Semaphore};

use crate::protocol::routing;
use crate::{
    // ---
    create_transport,
    lock_ignore_poison,
    log_debug,
    log_error,
    log_info,
    log_warn,
    Address,
    Connection,
    Delivery,
    Envelope,
    RemoteError,
    RequestEnvelope,
    ResponseEnvelope,
    Result,
    Role,
    RpcConfig,
    RpcError,
    TransportPtr,
};

/// RPC server for one Nameko-style service.
///
/// All replicas of a service consume the same `rpc-<service>` queue, so the
/// broker spreads requests across them. Within one replica at most
/// `prefetch_count` handlers run at a time; each request is acknowledged
/// after its reply has been published.
///
/// # Example
///
/// ```no_run
/// use nameko_rpc::{json, HandlerRegistry, RequestEnvelope, RpcConfig, RpcServer};
///
/// # async fn example() -> nameko_rpc::Result<()> {
/// let server = RpcServer::connect(&RpcConfig::from_env("articles")?).await?;
///
/// let handlers = HandlerRegistry::new()
///     .register("health_check", |_req: RequestEnvelope| async {
///         Ok(json!({"git_sha": "dev"}))
///     });
///
/// let stopper = server.clone();
/// tokio::spawn(async move {
///     tokio::signal::ctrl_c().await.ok();
///     stopper.shutdown().await.ok();
/// });
///
/// server.serve(handlers).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RpcServer {
    // ---
    inner: Arc<ServerInner>,
}

struct ServerInner {
    // ---
    connection: Connection,
    prefetch_count: u16,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    shutdown_rx: Mutex<Option<oneshot::Receiver<()>>>,
}

impl RpcServer {
    // ---

    /// Connect to the broker named by `config` and declare the service queue.
    ///
    /// `config.identity` is the service name.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Setup`] if the broker is unreachable or the
    /// topology cannot be declared, and [`RpcError::Config`] for an
    /// unsupported broker URI.
    pub async fn connect(config: &RpcConfig) -> Result<Self> {
        // ---
        let transport = create_transport(config).await?;
        Self::with_transport(transport, config).await
    }

    /// Build a server on an existing transport.
    pub async fn with_transport(transport: TransportPtr, config: &RpcConfig) -> Result<Self> {
        // ---
        let connection = Connection::open(transport, config, Role::Server).await?;
        Self::from_connection(connection, config.prefetch_count)
    }

    /// Build a server on an already opened connection.
    ///
    /// `prefetch_count` bounds concurrently running handlers; 0 leaves them
    /// bounded only by what the broker delivers.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::InvalidRole`] for a client connection.
    pub fn from_connection(connection: Connection, prefetch_count: u16) -> Result<Self> {
        // ---
        connection.expect_role(Role::Server)?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        Ok(Self {
            inner: Arc::new(ServerInner {
                connection,
                prefetch_count,
                shutdown_tx: Mutex::new(Some(shutdown_tx)),
                shutdown_rx: Mutex::new(Some(shutdown_rx)),
            }),
        })
    }

    /// Name of the service this server answers for.
    pub fn service(&self) -> &str {
        self.inner.connection.identity()
    }

    /// Name of the shared service queue.
    pub fn queue(&self) -> &str {
        self.inner.connection.queue().as_str()
    }

    /// Consume requests and answer them until [`shutdown`](Self::shutdown).
    ///
    /// Every consumed request gets exactly one reply on its `reply_to` queue,
    /// carrying the request's correlation id: the handler's result, the
    /// handler's error, or `MethodNotFound` / `MalformedRequest`. Requests
    /// without `reply_to` are acknowledged and dropped.
    ///
    /// After shutdown the loop stops taking requests, waits for running
    /// handlers to finish and closes the connection. Requests that were
    /// delivered but not started go back to the queue.
    ///
    /// # Errors
    ///
    /// - [`RpcError::NotIdle`] if called twice or after shutdown
    /// - [`RpcError::Transport`] if the consumer could not start, or the
    ///   broker stopped delivering before shutdown was requested
    pub async fn serve(&self, handlers: HandlerRegistry) -> Result<()> {
        // ---
        let mut shutdown_rx = lock_ignore_poison(&self.inner.shutdown_rx)
            .take()
            .ok_or(RpcError::NotIdle)?;

        let connection = &self.inner.connection;
        let service = connection.identity();
        let limit = permit_limit(self.inner.prefetch_count);
        let permits = Arc::new(Semaphore::new(limit as usize));
        let handlers = Arc::new(handlers);

        let mut subscription = connection.consume().await?;
        log_info!(
            "[{service}] serving {} on {} (max {limit} in flight)",
            handlers.methods().join(", "),
            connection.queue()
        );

        let outcome = loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    log_info!("[{service}] shutdown requested");
                    break Ok(());
                }
                delivery = subscription.inbox.recv() => {
                    let Some(delivery) = delivery else {
                        break Err(RpcError::Transport(format!(
                            "request consumer on {} stopped",
                            connection.queue()
                        )));
                    };
                    let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                        break Ok(());
                    };

                    let connection = connection.clone();
                    let handlers = Arc::clone(&handlers);
                    tokio::spawn(async move {
                        handle_request(&connection, &handlers, delivery).await;
                        drop(permit);
                    });
                }
            }
        };

        if permits.acquire_many(limit).await.is_err() {
            log_warn!("[{service}] stopped without waiting for running handlers");
        }

        // Deliveries still buffered in the inbox are unacked and go back to
        // the queue when the connection closes.
        if let Err(err) = connection.close().await {
            log_warn!("[{service}] close failed: {err}");
        }
        drop(subscription);
        log_info!("[{service}] stopped");
        outcome
    }

    /// Ask a running [`serve`](Self::serve) to stop.
    ///
    /// Returns once the request is made; the `serve` future completes after
    /// running handlers finish. A server that never served is closed right
    /// away.
    pub async fn shutdown(&self) -> Result<()> {
        // ---
        let idle = lock_ignore_poison(&self.inner.shutdown_rx).take();
        let signal = lock_ignore_poison(&self.inner.shutdown_tx).take();

        if idle.is_some() {
            return self.inner.connection.close().await;
        }
        match signal.map(|tx| tx.send(())) {
            Some(Ok(())) => Ok(()),
            // serve already returned on its own
            _ => self.inner.connection.close().await,
        }
    }
}

fn permit_limit(prefetch_count: u16) -> u32 {
    match prefetch_count {
        0 => u32::from(u16::MAX),
        n => u32::from(n),
    }
}

/// Answer one request, then acknowledge it.
///
/// The ack follows the reply publish even when that publish fails, so a
/// request is never redelivered once its handler ran.
async fn handle_request(connection: &Connection, handlers: &HandlerRegistry, delivery: Delivery) {
    // ---
    let Delivery { envelope, acker } = delivery;
    let service = connection.identity();

    match envelope.reply_to.clone() {
        Some(reply_to) => {
            let outcome = dispatch(service, handlers, &envelope).await;
            if let Err(err) = publish_reply(connection, &envelope, reply_to, outcome).await {
                log_error!(
                    "[{service}] failed to reply to {}: {err}",
                    envelope.routing_key
                );
            }
        }
        None => {
            log_warn!(
                "[{service}] request {} has no reply_to, dropping",
                envelope.routing_key
            );
        }
    }

    if let Err(err) = acker.ack().await {
        log_error!("[{service}] failed to ack {}: {err}", envelope.routing_key);
    }
}

async fn dispatch(service: &str, handlers: &HandlerRegistry, envelope: &Envelope) -> HandlerResult<Value> {
    // ---
    let routing_key = envelope.routing_key.as_str();
    let Some(method) = routing::method_of(service, routing_key) else {
        return Err(RemoteError::method_not_found(routing_key));
    };

    let request = RequestEnvelope::from_slice(&envelope.payload).map_err(|err| {
        log_warn!("[{service}] malformed request for {method}: {err}");
        RemoteError::malformed_request(err.to_string())
    })?;

    log_debug!(
        "[{service}] {method} ({})",
        envelope.correlation_id.as_deref().unwrap_or("-")
    );

    // Run in a separate task so a panicking handler still gets a reply.
    match tokio::spawn(handlers.dispatch(method, request)).await {
        Ok(outcome) => outcome,
        Err(err) => {
            log_error!("[{service}] handler {method} failed: {err}");
            Err(RemoteError::new("UnexpectedError", format!("{method}: {err}")))
        }
    }
}

async fn publish_reply(
    connection: &Connection,
    request: &Envelope,
    reply_to: Address,
    outcome: HandlerResult<Value>,
) -> Result<()> {
    // ---
    let body = ResponseEnvelope::from(outcome).to_bytes()?;
    let content_type = request
        .content_type
        .clone()
        .unwrap_or_else(|| Arc::clone(connection.content_type()));

    let env = Envelope::response(
        Arc::clone(connection.exchange()),
        reply_to,
        body,
        request.correlation_id.clone(),
        Some(content_type),
    );
    connection.publish(env).await
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{create_memory_transport_with_hub, MemoryHub};
    use std::time::Duration;

    async fn server_on(hub: &Arc<MemoryHub>) -> RpcServer {
        let config = RpcConfig::memory("articles");
        let transport = create_memory_transport_with_hub(&config, Arc::clone(hub));
        RpcServer::with_transport(transport, &config).await.unwrap()
    }

    #[test]
    fn test_permit_limit() {
        assert_eq!(permit_limit(10), 10);
        assert_eq!(permit_limit(0), 65535);
    }

    #[tokio::test]
    async fn test_serve_twice_is_rejected() {
        // ---
        let hub = MemoryHub::new();
        let server = server_on(&hub).await;

        let running = server.clone();
        let serve = tokio::spawn(async move { running.serve(HandlerRegistry::new()).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let second = server.serve(HandlerRegistry::new()).await;
        assert!(matches!(second, Err(RpcError::NotIdle)));

        server.shutdown().await.unwrap();
        serve.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_before_serve() {
        // ---
        let hub = MemoryHub::new();
        let server = server_on(&hub).await;

        server.shutdown().await.unwrap();
        let result = server.serve(HandlerRegistry::new()).await;
        assert!(matches!(result, Err(RpcError::NotIdle)));
    }

    #[tokio::test]
    async fn test_request_without_reply_to_is_acked() {
        // ---
        let hub = MemoryHub::new();
        let server = server_on(&hub).await;
        let running = server.clone();
        let serve = tokio::spawn(async move { running.serve(HandlerRegistry::new()).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let config = RpcConfig::memory("publisher");
        let transport = create_memory_transport_with_hub(&config, Arc::clone(&hub));
        let mut env = Envelope::request(
            Arc::from("nameko-rpc"),
            Address::from("articles.get_foo"),
            RequestEnvelope::new().to_bytes().unwrap(),
            Arc::from("corr-1"),
            Address::from("nowhere"),
            Arc::from("application/json"),
        );
        env.reply_to = None;
        transport.publish(env).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(hub.queue_depth("rpc-articles"), Some(0));
        assert_eq!(hub.unacked_count("rpc-articles"), Some(0));

        server.shutdown().await.unwrap();
        serve.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_client_connection_rejected() {
        // ---
        let hub = MemoryHub::new();
        let config = RpcConfig::memory("web");
        let connection = Connection::open(
            create_memory_transport_with_hub(&config, hub),
            &config,
            Role::Client,
        )
        .await
        .unwrap();

        let result = RpcServer::from_connection(connection, 10);
        assert!(matches!(result, Err(RpcError::InvalidRole(_))));
    }
}
