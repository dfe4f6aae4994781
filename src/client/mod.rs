//! Client role: publish requests, route replies back to their callers.
mod pending;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::task::JoinHandle;

use pending::{PendingCalls, PendingGuard};

use crate::protocol::routing;
use crate::{
    // ---
    create_transport,
    lock_ignore_poison,
    log_debug,
    log_warn,
    Address,
    Connection,
    CorrelationId,
    Delivery,
    Envelope,
    RequestEnvelope,
    ResponseEnvelope,
    Result,
    Role,
    RpcConfig,
    RpcError,
    SubscriptionHandle,
    TransportPtr,
};

/// RPC client for calling Nameko-style services.
///
/// Owns a private reply queue and one background task that consumes it. Any
/// number of calls may be outstanding at once; each reply is handed to the
/// caller whose correlation id it carries. Cloning is cheap and clones share
/// the reply queue.
///
/// # Example
///
/// ```no_run
/// use nameko_rpc::{json, RequestEnvelope, RpcClient, RpcConfig};
///
/// # async fn example() -> nameko_rpc::Result<()> {
/// let client = RpcClient::connect(&RpcConfig::from_env("web")?).await?;
///
/// let health = client
///     .call("articles", "health_check", RequestEnvelope::new())
///     .await?;
/// assert_eq!(health, json!({"git_sha": "dev"}));
///
/// client.close().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RpcClient {
    // ---
    inner: Arc<ClientInner>,
}

struct ClientInner {
    // ---
    connection: Connection,
    pending: Arc<PendingCalls>,
    request_timeout: Option<Duration>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl RpcClient {
    // ---

    /// Connect to the broker named by `config` and set up a reply queue.
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

    /// Build a client on an existing transport.
    pub async fn with_transport(transport: TransportPtr, config: &RpcConfig) -> Result<Self> {
        // ---
        let connection = Connection::open(transport, config, Role::Client).await?;
        Self::from_connection(connection, config.request_timeout).await
    }

    /// Build a client on an already opened connection.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::InvalidRole`] for a server connection.
    pub async fn from_connection(
        connection: Connection,
        request_timeout: Option<Duration>,
    ) -> Result<Self> {
        // ---
        connection.expect_role(Role::Client)?;

        let pending = Arc::new(PendingCalls::new());
        let subscription = connection.consume().await?;
        let dispatcher = start_reply_dispatcher(
            connection.identity().to_string(),
            subscription,
            Arc::clone(&pending),
        );

        Ok(Self {
            inner: Arc::new(ClientInner {
                connection,
                pending,
                request_timeout,
                dispatcher: Mutex::new(Some(dispatcher)),
            }),
        })
    }

    /// Call `service.method` and wait for its result.
    ///
    /// Waits at most the configured request timeout. Dropping the returned
    /// future abandons the call; a reply arriving afterwards is discarded.
    ///
    /// # Errors
    ///
    /// - [`RpcError::Remote`] if the handler reported an error
    /// - [`RpcError::Timeout`] if no reply arrived in time
    /// - [`RpcError::Protocol`] if the reply was not a valid response
    /// - [`RpcError::Transport`] if publishing failed or the reply queue
    ///   stopped before the reply arrived
    pub async fn call(&self, service: &str, method: &str, request: RequestEnvelope) -> Result<Value> {
        // ---
        self.call_with_timeout(service, method, request, self.inner.request_timeout)
            .await
    }

    /// Like [`call`](Self::call), with an explicit wait bound.
    ///
    /// `None` waits until the reply arrives or the client closes.
    pub async fn call_with_timeout(
        &self,
        service: &str,
        method: &str,
        request: RequestEnvelope,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        // ---
        let reply = self.round_trip(service, method, &request, timeout).await?;
        ResponseEnvelope::from_slice(&reply.payload)?.into_result()
    }

    /// Call and deserialize the result into `T`.
    pub async fn call_as<T>(&self, service: &str, method: &str, request: RequestEnvelope) -> Result<T>
    where
        T: DeserializeOwned,
    {
        // ---
        let value = self.call(service, method, request).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Name of this client's reply queue.
    pub fn reply_queue(&self) -> &str {
        self.inner.connection.queue().as_str()
    }

    /// Number of calls still waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    /// Stop the reply consumer and close the connection.
    ///
    /// Outstanding calls fail with [`RpcError::Transport`].
    pub async fn close(&self) -> Result<()> {
        // ---
        let result = self.inner.connection.close().await;

        let dispatcher = lock_ignore_poison(&self.inner.dispatcher).take();
        if let Some(handle) = dispatcher {
            handle.abort();
        }
        self.inner.pending.close();
        result
    }

    async fn round_trip(
        &self,
        service: &str,
        method: &str,
        request: &RequestEnvelope,
        timeout: Option<Duration>,
    ) -> Result<Envelope> {
        // ---
        let connection = &self.inner.connection;
        let body = request.to_bytes()?;
        let correlation_id = CorrelationId::generate();
        let routing_key = routing::routing_key(service, method);

        let rx = self.inner.pending.register(correlation_id.clone())?;
        let _guard = PendingGuard::new(&self.inner.pending, correlation_id.clone());

        let env = Envelope::request(
            Arc::clone(connection.exchange()),
            Address::from(routing_key.as_str()),
            body,
            (&correlation_id).into(),
            connection.queue().clone(),
            Arc::clone(connection.content_type()),
        );
        connection.publish(env).await?;
        log_debug!("[{}] sent {routing_key} ({correlation_id})", connection.identity());

        let reply = match timeout {
            Some(duration) => tokio::time::timeout(duration, rx)
                .await
                .map_err(|_| RpcError::Timeout)?,
            None => rx.await,
        }
        .map_err(|_| RpcError::Transport("reply queue closed before the reply arrived".into()))?;

        let received = reply.correlation_id.as_deref().unwrap_or_default();
        if received != correlation_id.as_str() {
            return Err(RpcError::InvalidCorrelationId {
                expected: correlation_id.to_string(),
                received: received.to_string(),
            });
        }
        Ok(reply)
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Some(handle) = lock_ignore_poison(&self.dispatcher).take() {
            handle.abort();
        }
    }
}

fn start_reply_dispatcher(
    identity: String,
    mut subscription: SubscriptionHandle,
    pending: Arc<PendingCalls>,
) -> JoinHandle<()> {
    // ---
    tokio::spawn(async move {
        // ---
        log_debug!("[{identity}] reply dispatcher started");

        while let Some(Delivery { envelope, acker }) = subscription.inbox.recv().await {
            route_reply(&identity, &pending, envelope);
            if let Err(err) = acker.ack().await {
                log_warn!("[{identity}] failed to ack reply: {err}");
            }
        }

        // Later calls fail fast instead of waiting on a reply nobody routes.
        let abandoned = pending.close();
        if abandoned > 0 {
            log_warn!("[{identity}] reply queue closed with {abandoned} calls outstanding");
        }
        log_debug!("[{identity}] reply dispatcher stopped");
    })
}

fn route_reply(identity: &str, pending: &PendingCalls, envelope: Envelope) {
    // ---
    let Some(correlation_id) = envelope.correlation_id.as_deref() else {
        log_warn!("[{identity}] dropping reply without correlation id");
        return;
    };
    let correlation_id = CorrelationId::from(correlation_id);

    match pending.complete(&correlation_id, envelope) {
        Some(elapsed) => log_debug!("[{identity}] reply {correlation_id} after {elapsed:?}"),
        None => log_warn!("[{identity}] no pending call for {correlation_id}, discarding reply"),
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{create_memory_transport_with_hub, MemoryHub};
    use bytes::Bytes;

    async fn client_on(hub: &Arc<MemoryHub>) -> RpcClient {
        let config = RpcConfig::memory("web").with_request_timeout(Duration::from_millis(200));
        let transport = create_memory_transport_with_hub(&config, Arc::clone(hub));
        RpcClient::with_transport(transport, &config).await.unwrap()
    }

    /// Publish a raw reply onto the client's reply queue.
    async fn inject_reply(hub: &Arc<MemoryHub>, client: &RpcClient, corr: Option<&str>, body: &str) {
        let config = RpcConfig::memory("injector");
        let transport = create_memory_transport_with_hub(&config, Arc::clone(hub));
        let env = Envelope::response(
            Arc::from("nameko-rpc"),
            Address::from(client.reply_queue()),
            Bytes::from(body.to_string()),
            corr.map(Arc::from),
            None,
        );
        transport.publish(env).await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_releases_pending_entry() {
        // ---
        let hub = MemoryHub::new();
        let client = client_on(&hub).await;

        let result = client
            .call("nobody", "listens", RequestEnvelope::new())
            .await;
        assert!(matches!(result, Err(RpcError::Timeout)));
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_stray_replies_are_acked_and_dropped() {
        // ---
        let hub = MemoryHub::new();
        let client = client_on(&hub).await;

        inject_reply(&hub, &client, Some("not-a-pending-call"), r#"{"result":1}"#).await;
        inject_reply(&hub, &client, None, r#"{"result":2}"#).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(hub.queue_depth(client.reply_queue()), Some(0));
        assert_eq!(hub.unacked_count(client.reply_queue()), Some(0));
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_close_fails_outstanding_calls() {
        // ---
        let hub = MemoryHub::new();
        let client = client_on(&hub).await;

        let caller = client.clone();
        let call = tokio::spawn(async move {
            caller
                .call_with_timeout("nobody", "listens", RequestEnvelope::new(), None)
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(client.pending_calls(), 1);

        client.close().await.unwrap();
        let result = call.await.unwrap();
        assert!(matches!(result, Err(RpcError::Transport(_))));
        assert!(!hub.queue_exists(client.reply_queue()));
    }

    #[tokio::test]
    async fn test_calls_fail_fast_once_reply_consumer_ends() {
        // ---
        let hub = MemoryHub::new();
        let config = RpcConfig::memory("web").with_request_timeout(Duration::from_secs(30));
        let transport = create_memory_transport_with_hub(&config, Arc::clone(&hub));
        let connection = Connection::open(transport, &config, Role::Client)
            .await
            .unwrap();

        // A consumer the broker cancelled: the inbox ends while the
        // connection itself stays open.
        let (cancel, inbox) = tokio::sync::mpsc::unbounded_channel();
        let pending = Arc::new(PendingCalls::new());
        let dispatcher = start_reply_dispatcher(
            "web".to_string(),
            SubscriptionHandle { inbox },
            Arc::clone(&pending),
        );
        drop(cancel);
        dispatcher.await.unwrap();

        let client = RpcClient {
            inner: Arc::new(ClientInner {
                connection,
                pending,
                request_timeout: config.request_timeout,
                dispatcher: Mutex::new(None),
            }),
        };

        let result = tokio::time::timeout(
            Duration::from_secs(1),
            client.call("articles", "get_foo", RequestEnvelope::new()),
        )
        .await
        .expect("call waited for a reply that cannot arrive");
        assert!(matches!(result, Err(RpcError::Transport(_))));
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_server_connection_rejected() {
        // ---
        let hub = MemoryHub::new();
        let config = RpcConfig::memory("articles");
        let connection = Connection::open(
            create_memory_transport_with_hub(&config, hub),
            &config,
            Role::Server,
        )
        .await
        .unwrap();

        let result = RpcClient::from_connection(connection, None).await;
        assert!(matches!(result, Err(RpcError::InvalidRole(_))));
    }
}
