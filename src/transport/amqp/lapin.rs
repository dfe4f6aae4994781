//! AMQP transport implementation using `lapin`.
//!
//! This module provides an implementation of the `Transport` trait backed by
//! an AMQP 0-9-1 broker connection. It follows an **actor-based concurrency
//! model** to safely integrate with the underlying AMQP client.
//!
//! ## Concurrency model
//!
//! - A single background **actor task** owns the AMQP connection and channel.
//! - The actor is responsible for:
//!   - declaring exchanges and queues, binding them, setting QoS,
//!   - publishing outbound messages,
//!   - starting consumers,
//!   - clean shutdown of the connection.
//! - All interaction with the AMQP channel is serialized through this actor;
//!   no other task ever touches the channel directly, so publishes issued by
//!   concurrent calls never interleave on the wire.
//!
//! ## Message delivery semantics
//!
//! Each `consume()` starts one broker consumer with manual acknowledgment.
//! A forwarding task converts every `lapin` delivery into a [`Delivery`]
//! whose [`Acker`] acknowledges on the broker. Deliveries that are never
//! acknowledged are redelivered by the broker once the channel closes.
//!
//! Message properties map one-to-one onto [`Envelope`] fields:
//! `content-type`, `correlation-id` and `reply-to`; the body is the payload.

use lapin::{
    //
    options::{
        //
        BasicAckOptions,
        BasicConsumeOptions,
        BasicPublishOptions,
        BasicQosOptions,
        ExchangeDeclareOptions,
        QueueBindOptions,
        QueueDeclareOptions,
    },
    types::{FieldTable, ShortString},
    BasicProperties,
    Channel,
    Connection,
    ConnectionProperties,
};

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::{
    //
    log_debug,
    log_error,
    log_info,
    log_warn,
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
    Result,
    RpcConfig,
    RpcError,
    SubscriptionHandle,
    Transport,
    TransportPtr,
};

type TaskList = Arc<Mutex<Vec<JoinHandle<()>>>>;

//
// Actor commands
//

enum Cmd {
    //
    DeclareExchange {
        spec: ExchangeSpec,
        resp: oneshot::Sender<Result<()>>,
    },
    DeclareQueue {
        spec: QueueSpec,
        resp: oneshot::Sender<Result<()>>,
    },
    Bind {
        binding: Binding,
        resp: oneshot::Sender<Result<()>>,
    },
    Qos {
        count: u16,
        resp: oneshot::Sender<Result<()>>,
    },
    Publish {
        env: Envelope,
        resp: oneshot::Sender<Result<()>>,
    },
    Consume {
        queue: String,
        opts: ConsumeOptions,
        resp: oneshot::Sender<Result<SubscriptionHandle>>,
    },
    Close {
        resp: oneshot::Sender<Result<()>>,
    },
}

enum ActorStep {
    //
    Cmd(Cmd),
    Closed,
}

/// AMQP transport implementation using lapin.
///
/// Implements `Send + Sync` for use across async boundaries; every operation
/// is a message to the actor that owns the channel.
pub struct AmqpTransport {
    // ---
    transport_id: String,
    cmd_tx: mpsc::Sender<Cmd>,
    tasks: TaskList,
}

impl AmqpTransport {
    /// Creates a new AMQP transport with the given connection and channel.
    ///
    /// Spawns a background actor task to handle AMQP operations.
    fn create(transport_id: &str, connection: Connection, channel: Channel) -> TransportPtr {
        // ---
        let transport_id = transport_id.to_string();

        let (cmd_tx, cmd_rx) = mpsc::channel(16);

        let actor = Actor {
            transport_id: transport_id.clone(),
            connection,
            channel,
            cmd_rx,
            consumer_handles: HashMap::new(),
        };

        let handle = tokio::spawn(async move {
            actor.run().await;
        });

        Arc::new(Self {
            transport_id,
            cmd_tx,
            tasks: Arc::new(Mutex::new(vec![handle])),
        })
    }

    async fn request<T>(&self, cmd: Cmd, rx: oneshot::Receiver<Result<T>>) -> Result<T> {
        // ---
        self.cmd_tx.send(cmd).await.map_err(|e| {
            let msg = format!("actor command channel closed:{e}");
            RpcError::Transport(msg)
        })?;

        rx.await.map_err(|e| {
            let msg = format!("actor responder channel read failed:{e}");
            RpcError::Transport(msg)
        })?
    }
}

/// Background actor task that owns the AMQP connection and channel.
struct Actor {
    // ---
    transport_id: String,
    connection: Connection,
    channel: Channel,
    cmd_rx: mpsc::Receiver<Cmd>,
    consumer_handles: HashMap<String, JoinHandle<()>>,
}

impl Actor {
    async fn run(mut self) {
        // ---
        log_info!("[{}] AMQP actor started", self.transport_id);

        loop {
            match self.next_step().await {
                ActorStep::Cmd(cmd) => {
                    self.handle_cmd(cmd).await;
                }
                ActorStep::Closed => {
                    log_info!("[{}] AMQP actor shutting down", self.transport_id);
                    break;
                }
            }
        }

        // Clean up consumer tasks
        for (_, handle) in self.consumer_handles.drain() {
            handle.abort();
        }

        // Close channel and connection; unacked deliveries go back to their queues.
        let _ = self.channel.close(200, "Normal shutdown").await;
        let _ = self.connection.close(200, "Normal shutdown").await;

        log_info!("[{}] AMQP actor stopped", self.transport_id);
    }

    async fn next_step(&mut self) -> ActorStep {
        // ---
        match self.cmd_rx.recv().await {
            Some(cmd) => ActorStep::Cmd(cmd),
            None => ActorStep::Closed,
        }
    }

    async fn handle_cmd(&mut self, cmd: Cmd) {
        // ---
        match cmd {
            Cmd::DeclareExchange { spec, resp } => {
                let _ = resp.send(self.do_declare_exchange(spec).await);
            }
            Cmd::DeclareQueue { spec, resp } => {
                let _ = resp.send(self.do_declare_queue(spec).await);
            }
            Cmd::Bind { binding, resp } => {
                let _ = resp.send(self.do_bind(binding).await);
            }
            Cmd::Qos { count, resp } => {
                let _ = resp.send(self.do_qos(count).await);
            }
            Cmd::Publish { env, resp } => {
                let _ = resp.send(self.do_publish(env).await);
            }
            Cmd::Consume { queue, opts, resp } => {
                let _ = resp.send(self.do_consume(queue, opts).await);
            }
            Cmd::Close { resp } => {
                let _ = resp.send(Ok(()));
                self.cmd_rx.close();
            }
        }
    }

    async fn do_declare_exchange(&mut self, spec: ExchangeSpec) -> Result<()> {
        // ---
        let kind = match spec.kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        };
        let opts = ExchangeDeclareOptions {
            passive: false,
            durable: spec.durable,
            auto_delete: spec.auto_delete,
            internal: false,
            nowait: false,
        };

        self.channel
            .exchange_declare(&spec.name, kind, opts, FieldTable::default())
            .await
            .map_err(|e| {
                RpcError::Setup(format!("amqp: exchange declare '{}' failed: {e}", spec.name))
            })?;

        log_info!("[{}] Declared exchange: {}", self.transport_id, spec.name);
        Ok(())
    }

    async fn do_declare_queue(&mut self, spec: QueueSpec) -> Result<()> {
        // ---
        let opts = QueueDeclareOptions {
            passive: false,
            durable: spec.durable,
            exclusive: spec.exclusive,
            auto_delete: spec.auto_delete,
            nowait: false,
        };

        self.channel
            .queue_declare(&spec.name, opts, FieldTable::default())
            .await
            .map_err(|e| RpcError::Setup(format!("amqp: queue declare '{}' failed: {e}", spec.name)))?;

        log_info!("[{}] Declared queue: {}", self.transport_id, spec.name);
        Ok(())
    }

    async fn do_bind(&mut self, binding: Binding) -> Result<()> {
        // ---
        self.channel
            .queue_bind(
                &binding.queue,
                &binding.exchange,
                &binding.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                RpcError::Setup(format!(
                    "amqp: bind '{}' -> '{}' ({}) failed: {e}",
                    binding.queue, binding.exchange, binding.routing_key
                ))
            })?;

        log_debug!(
            "[{}] Bound {} to {} with {}",
            self.transport_id,
            binding.queue,
            binding.exchange,
            binding.routing_key
        );
        Ok(())
    }

    async fn do_qos(&mut self, count: u16) -> Result<()> {
        // ---
        self.channel
            .basic_qos(count, BasicQosOptions { global: false })
            .await
            .map_err(|e| RpcError::Setup(format!("amqp: qos failed: {e}")))?;

        log_debug!("[{}] Prefetch set to {count}", self.transport_id);
        Ok(())
    }

    async fn do_publish(&mut self, env: Envelope) -> Result<()> {
        // ---
        let mut properties = BasicProperties::default();
        if let Some(content_type) = env.content_type.as_deref() {
            properties = properties.with_content_type(ShortString::from(content_type));
        }
        if let Some(correlation_id) = env.correlation_id.as_deref() {
            properties = properties.with_correlation_id(ShortString::from(correlation_id));
        }
        if let Some(reply_to) = env.reply_to.as_ref() {
            properties = properties.with_reply_to(ShortString::from(reply_to.as_str()));
        }

        // Publisher confirms are not enabled; the returned confirm is dropped.
        self.channel
            .basic_publish(
                &env.exchange,
                env.routing_key.as_str(),
                BasicPublishOptions::default(),
                &env.payload,
                properties,
            )
            .await
            .map_err(|e| RpcError::Transport(format!("amqp: publish failed: {e}")))?;

        log_debug!(
            "[{}] Published to {}/{}",
            self.transport_id,
            env.exchange,
            env.routing_key
        );
        Ok(())
    }

    async fn do_consume(&mut self, queue: String, opts: ConsumeOptions) -> Result<SubscriptionHandle> {
        // ---
        let consumer = self
            .channel
            .basic_consume(
                &queue,
                &format!("{}-{queue}", self.transport_id),
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: opts.exclusive,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| RpcError::Transport(format!("amqp: consume failed: {e}")))?;

        log_info!("[{}] Started consuming queue: {queue}", self.transport_id);

        let (tx, rx) = mpsc::unbounded_channel();
        let queue_clone = queue.clone();
        let transport_id = self.transport_id.clone();

        let handle = tokio::spawn(async move {
            use futures_lite::stream::StreamExt;

            let mut consumer = consumer;
            while let Some(delivery_result) = consumer.next().await {
                match delivery_result {
                    Ok(delivery) => {
                        log_debug!("[{transport_id}] Received message on queue: {queue_clone}");

                        let props = &delivery.properties;
                        let envelope = Envelope {
                            exchange: Arc::from(delivery.exchange.as_str()),
                            routing_key: Address::from(delivery.routing_key.as_str()),
                            payload: delivery.data.clone().into(),
                            correlation_id: props.correlation_id().as_ref().map(|v| Arc::from(v.as_str())),
                            reply_to: props.reply_to().as_ref().map(|v| Address::from(v.as_str())),
                            content_type: props.content_type().as_ref().map(|v| Arc::from(v.as_str())),
                        };
                        let acker = Acker::new(Arc::new(LapinAcker(delivery.acker.clone())));

                        if tx.send(Delivery { envelope, acker }).is_err() {
                            log_warn!("[{transport_id}] Inbox for {queue_clone} dropped, stopping consumer");
                            break;
                        }
                    }
                    Err(e) => {
                        log_error!("[{transport_id}] Consumer error on {queue_clone}: {e}");
                        break;
                    }
                }
            }

            log_info!("[{transport_id}] Consumer task ended for queue: {queue_clone}");
        });

        if let Some(previous) = self.consumer_handles.insert(queue, handle) {
            previous.abort();
        }

        Ok(SubscriptionHandle { inbox: rx })
    }
}

struct LapinAcker(lapin::acker::Acker);

#[async_trait::async_trait]
impl Acknowledge for LapinAcker {
    async fn ack(&self) -> Result<()> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| RpcError::Transport(format!("amqp: ack failed: {e}")))
    }
}

#[async_trait::async_trait]
impl Transport for AmqpTransport {
    // ---
    fn transport_id(&self) -> &str {
        &self.transport_id
    }

    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        let spec = spec.clone();
        self.request(Cmd::DeclareExchange { spec, resp }, rx).await
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        let spec = spec.clone();
        self.request(Cmd::DeclareQueue { spec, resp }, rx).await
    }

    async fn bind_queue(&self, binding: &Binding) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        let binding = binding.clone();
        self.request(Cmd::Bind { binding, resp }, rx).await
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        self.request(Cmd::Qos { count, resp }, rx).await
    }

    async fn publish(&self, env: Envelope) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        self.request(Cmd::Publish { env, resp }, rx).await
    }

    async fn consume(&self, queue: &str, opts: ConsumeOptions) -> Result<SubscriptionHandle> {
        // ---
        let (resp, rx) = oneshot::channel();
        let queue = queue.to_string();
        self.request(Cmd::Consume { queue, opts, resp }, rx).await
    }

    async fn close(&self) -> Result<()> {
        // ---
        let (tx, rx) = oneshot::channel();

        let _ = self.cmd_tx.send(Cmd::Close { resp: tx }).await;
        let _ = rx.await;

        let mut tasks = self.tasks.lock().await;
        while let Some(handle) = tasks.pop() {
            let _ = handle.await;
        }

        Ok(())
    }
}

/// Creates a lapin-based AMQP transport from the given configuration.
///
/// # Errors
///
/// Returns [`RpcError::Setup`] if:
/// - The broker URI is missing or cannot be parsed
/// - Connection to the broker fails
///
/// # Connection Behavior
///
/// The connection to the broker happens immediately during transport creation.
pub async fn create_transport(config: &RpcConfig) -> Result<TransportPtr> {
    // ---

    let (connection, channel) = create_amqp_connection(config).await?;
    Ok(AmqpTransport::create(&config.identity, connection, channel))
}

/// Creates an AMQP connection and channel from the given configuration.
async fn create_amqp_connection(config: &RpcConfig) -> Result<(Connection, Channel)> {
    // ---

    let uri = config
        .broker_uri
        .as_deref()
        .ok_or_else(|| RpcError::Config("AMQP transport requires broker_uri".to_string()))?;

    log_info!("Connecting to AMQP broker: {}", crate::rpc_config::redact_uri(uri));

    let connection = Connection::connect(uri, ConnectionProperties::default())
        .await
        .map_err(|e| {
            let msg = format!("amqp: connection failed: {e}");
            log_error!("{msg}");
            RpcError::Setup(msg)
        })?;

    log_info!("Connected to AMQP broker");

    let channel = connection.create_channel().await.map_err(|e| {
        let msg = format!("amqp: channel creation failed: {e}");
        log_error!("{msg}");
        RpcError::Setup(msg)
    })?;

    log_info!("Created AMQP channel");

    Ok((connection, channel))
}
