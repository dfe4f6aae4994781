//! In-memory transport implementation.
//!
//! This module provides a pure in-process implementation of the domain-level
//! `Transport` trait. It is intended primarily for testing, local execution,
//! and as a reference for transport semantics.
//!
//! ## Reference Semantics
//!
//! The in-memory transport defines the **reference behavior** for the transport
//! layer. The AMQP transport delegates the same rules to the broker.
//!
//! - Exchange and queue declarations are idempotent for identical parameters
//!   and fail for conflicting ones; exclusive queues are locked to the
//!   transport that declared them.
//! - Topic exchanges route with `*` (one word) and `#` (zero or more words);
//!   the default exchange `""` routes to the queue named by the routing key.
//! - A queue with several consumers distributes round-robin among the
//!   consumers that still have prefetch credit.
//! - Deliveries stay unacknowledged until acked. When their consumer goes
//!   away (transport closed, inbox dropped) they are requeued at the front.
//! - Unroutable messages are dropped.
//!
//! ## Non-Goals
//!
//! Persistence, durability across restarts, publisher confirms and the
//! `redelivered` flag are not modelled.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use tokio::sync::mpsc;

use crate::protocol::routing::topic_matches;
use crate::{
    // ---
    lock_ignore_poison,
    log_debug,
    Acker,
    Acknowledge,
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

/// Shared message bus for the in-memory transport.
///
/// Simulates a message broker within a single process. All memory transports
/// that share a `MemoryHub` can publish and receive each other's messages,
/// exactly as connections to one real broker would.
///
/// For integration tests that need isolation between parallel test cases,
/// construct a hub explicitly and pass it to [`create_memory_transport_with_hub`]:
///
/// ```
/// # use nameko_rpc::{MemoryHub, RpcConfig};
/// # async fn example() -> nameko_rpc::Result<()> {
/// let hub = MemoryHub::new();
///
/// let server = nameko_rpc::create_memory_transport_with_hub(&RpcConfig::memory("articles"), hub.clone());
/// let client = nameko_rpc::create_memory_transport_with_hub(&RpcConfig::memory("web"), hub.clone());
/// # Ok(())
/// # }
/// ```
pub struct MemoryHub {
    // ---
    state: Mutex<HubState>,
    next_instance: AtomicU64,
}

#[derive(Default)]
struct HubState {
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    next_consumer: u64,
    next_tag: u64,
}

struct QueueState {
    spec: QueueSpec,
    owner: u64,
    ready: VecDeque<Envelope>,
    consumers: Vec<ConsumerState>,
    cursor: usize,
    had_consumer: bool,
}

struct ConsumerState {
    id: u64,
    owner: u64,
    exclusive: bool,
    prefetch: u16,
    tx: mpsc::UnboundedSender<Delivery>,
    unacked: Vec<(u64, Envelope)>,
}

impl ConsumerState {
    fn has_credit(&self) -> bool {
        self.prefetch == 0 || self.unacked.len() < self.prefetch as usize
    }
}

impl QueueState {
    // ---

    /// Remove consumer `index`, returning its unacked deliveries to the
    /// front of the queue in delivery order.
    fn cancel_consumer(&mut self, index: usize) {
        // ---
        let consumer = self.consumers.remove(index);
        for (_, env) in consumer.unacked.into_iter().rev() {
            self.ready.push_front(env);
        }
        if self.cursor > index {
            self.cursor -= 1;
        }
    }

    fn should_auto_delete(&self) -> bool {
        self.spec.auto_delete && self.had_consumer && self.consumers.is_empty()
    }
}

impl MemoryHub {
    /// Create a new, empty hub.
    pub fn new() -> Arc<Self> {
        // ---
        Arc::new(Self::default())
    }

    /// Number of messages waiting for a consumer, or `None` if the queue
    /// does not exist.
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        let state = lock_ignore_poison(&self.state);
        state.queues.get(queue).map(|q| q.ready.len())
    }

    /// Number of delivered but unacknowledged messages on a queue.
    pub fn unacked_count(&self, queue: &str) -> Option<usize> {
        let state = lock_ignore_poison(&self.state);
        state
            .queues
            .get(queue)
            .map(|q| q.consumers.iter().map(|c| c.unacked.len()).sum())
    }

    /// Whether a queue currently exists.
    pub fn queue_exists(&self, queue: &str) -> bool {
        lock_ignore_poison(&self.state).queues.contains_key(queue)
    }

    fn register_instance(&self) -> u64 {
        self.next_instance.fetch_add(1, Ordering::Relaxed)
    }

    fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<()> {
        // ---
        let mut state = lock_ignore_poison(&self.state);

        match state.exchanges.get(&spec.name) {
            Some(existing) if existing == spec => Ok(()),
            Some(existing) => Err(RpcError::Setup(format!(
                "PRECONDITION_FAILED - exchange '{}' redeclared with {:?}, existing {:?}",
                spec.name, spec, existing
            ))),
            None => {
                state.exchanges.insert(spec.name.clone(), spec.clone());
                Ok(())
            }
        }
    }

    fn declare_queue(&self, instance: u64, spec: &QueueSpec) -> Result<()> {
        // ---
        let mut state = lock_ignore_poison(&self.state);

        if let Some(existing) = state.queues.get(&spec.name) {
            if existing.spec.exclusive && existing.owner != instance {
                return Err(RpcError::Setup(format!(
                    "RESOURCE_LOCKED - queue '{}' is exclusive to another connection",
                    spec.name
                )));
            }
            if existing.spec != *spec {
                return Err(RpcError::Setup(format!(
                    "PRECONDITION_FAILED - queue '{}' redeclared with {:?}, existing {:?}",
                    spec.name, spec, existing.spec
                )));
            }
            return Ok(());
        }

        state.queues.insert(
            spec.name.clone(),
            QueueState {
                spec: spec.clone(),
                owner: instance,
                ready: VecDeque::new(),
                consumers: Vec::new(),
                cursor: 0,
                had_consumer: false,
            },
        );
        Ok(())
    }

    fn bind_queue(&self, binding: &Binding) -> Result<()> {
        // ---
        let mut state = lock_ignore_poison(&self.state);

        if !state.queues.contains_key(&binding.queue) {
            return Err(RpcError::Setup(format!(
                "NOT_FOUND - no queue '{}'",
                binding.queue
            )));
        }
        if !state.exchanges.contains_key(&binding.exchange) {
            return Err(RpcError::Setup(format!(
                "NOT_FOUND - no exchange '{}'",
                binding.exchange
            )));
        }
        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }
        Ok(())
    }

    fn publish(hub: &Arc<MemoryHub>, transport_id: &str, env: Envelope) -> Result<()> {
        // ---
        let mut state = lock_ignore_poison(&hub.state);

        let targets: Vec<String> = if env.exchange.is_empty() {
            vec![env.routing_key.as_str().to_string()]
        } else {
            let kind = match state.exchanges.get(env.exchange.as_ref()) {
                Some(exchange) => exchange.kind,
                None => {
                    return Err(RpcError::Transport(format!(
                        "NOT_FOUND - no exchange '{}'",
                        env.exchange
                    )))
                }
            };

            let mut targets: Vec<String> = Vec::new();
            for binding in state.bindings.iter() {
                if binding.exchange != env.exchange.as_ref() {
                    continue;
                }
                let matched = match kind {
                    ExchangeKind::Topic => topic_matches(&binding.routing_key, env.routing_key.as_str()),
                    ExchangeKind::Direct => binding.routing_key == env.routing_key.as_str(),
                };
                if matched && !targets.contains(&binding.queue) {
                    targets.push(binding.queue.clone());
                }
            }
            targets
        };

        let mut routed = false;
        for queue in targets {
            if let Some(q) = state.queues.get_mut(&queue) {
                q.ready.push_back(env.clone());
                routed = true;
                Self::pump(hub, &mut state, &queue);
            }
        }

        if !routed {
            log_debug!(
                "{transport_id}: unroutable message to {}/{} dropped",
                env.exchange,
                env.routing_key
            );
        }
        Ok(())
    }

    fn consume(
        hub: &Arc<MemoryHub>,
        instance: u64,
        queue: &str,
        prefetch: u16,
        opts: ConsumeOptions,
    ) -> Result<SubscriptionHandle> {
        // ---
        let mut state = lock_ignore_poison(&hub.state);

        let next_consumer = state.next_consumer;
        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| RpcError::Transport(format!("NOT_FOUND - no queue '{queue}'")))?;

        if q.spec.exclusive && q.owner != instance {
            return Err(RpcError::Transport(format!(
                "RESOURCE_LOCKED - queue '{queue}' is exclusive to another connection"
            )));
        }
        q.consumers.retain(|c| !c.tx.is_closed());
        if q.consumers.iter().any(|c| c.exclusive) || (opts.exclusive && !q.consumers.is_empty()) {
            return Err(RpcError::Transport(format!(
                "ACCESS_REFUSED - queue '{queue}' has an exclusive consumer"
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        q.consumers.push(ConsumerState {
            id: next_consumer,
            owner: instance,
            exclusive: opts.exclusive,
            prefetch,
            tx,
            unacked: Vec::new(),
        });
        q.had_consumer = true;
        state.next_consumer += 1;

        Self::pump(hub, &mut state, queue);

        Ok(SubscriptionHandle { inbox: rx })
    }

    fn ack(hub: &Arc<MemoryHub>, queue: &str, consumer: u64, tag: u64) -> Result<()> {
        // ---
        let mut state = lock_ignore_poison(&hub.state);

        let acked = state
            .queues
            .get_mut(queue)
            .and_then(|q| q.consumers.iter_mut().find(|c| c.id == consumer))
            .and_then(|c| {
                let pos = c.unacked.iter().position(|(t, _)| *t == tag)?;
                c.unacked.remove(pos);
                Some(())
            });

        if acked.is_none() {
            return Err(RpcError::Transport(format!(
                "PRECONDITION_FAILED - unknown delivery tag {tag} on '{queue}'"
            )));
        }

        Self::pump(hub, &mut state, queue);
        Ok(())
    }

    /// Cancel every consumer of `instance`, requeue what they held and
    /// delete the queues that go away with the connection.
    fn close(hub: &Arc<MemoryHub>, transport_id: &str, instance: u64) {
        // ---
        let mut state = lock_ignore_poison(&hub.state);

        for q in state.queues.values_mut() {
            while let Some(index) = q.consumers.iter().position(|c| c.owner == instance) {
                q.cancel_consumer(index);
            }
        }

        let doomed: Vec<String> = state
            .queues
            .iter()
            .filter(|(_, q)| (q.spec.exclusive && q.owner == instance) || q.should_auto_delete())
            .map(|(name, _)| name.clone())
            .collect();

        for name in &doomed {
            log_debug!("{transport_id}: deleting queue {name}");
            state.queues.remove(name);
        }
        state.bindings.retain(|b| !doomed.contains(&b.queue));

        let remaining: Vec<String> = state.queues.keys().cloned().collect();
        for name in remaining {
            Self::pump(hub, &mut state, &name);
        }
    }

    /// Hand ready messages to consumers with credit, round-robin.
    fn pump(hub: &Arc<MemoryHub>, state: &mut HubState, queue: &str) {
        // ---
        let Some(q) = state.queues.get_mut(queue) else {
            return;
        };

        // Consumers whose inbox was dropped give their deliveries back.
        while let Some(index) = q.consumers.iter().position(|c| c.tx.is_closed()) {
            q.cancel_consumer(index);
        }

        while !q.ready.is_empty() && !q.consumers.is_empty() {
            let count = q.consumers.len();
            let Some(index) = (0..count)
                .map(|step| (q.cursor + step) % count)
                .find(|&i| q.consumers[i].has_credit())
            else {
                break;
            };
            q.cursor = (index + 1) % count;

            let Some(env) = q.ready.pop_front() else {
                break;
            };
            let tag = state.next_tag;
            state.next_tag += 1;

            let consumer = &mut q.consumers[index];
            let acker = MemoryAcker {
                hub: Arc::downgrade(hub),
                queue: queue.to_string(),
                consumer: consumer.id,
                tag,
            };
            let delivery = Delivery {
                envelope: env.clone(),
                acker: Acker::new(Arc::new(acker)),
            };

            if consumer.tx.send(delivery).is_err() {
                q.ready.push_front(env);
                q.cancel_consumer(index);
                continue;
            }
            consumer.unacked.push((tag, env));
        }

        if q.should_auto_delete() {
            state.queues.remove(queue);
            state.bindings.retain(|b| b.queue != queue);
        }
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        // ---
        Self {
            state: Mutex::new(HubState::default()),
            next_instance: AtomicU64::new(1),
        }
    }
}

struct MemoryAcker {
    hub: Weak<MemoryHub>,
    queue: String,
    consumer: u64,
    tag: u64,
}

#[async_trait::async_trait]
impl Acknowledge for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        // ---
        let hub = self
            .hub
            .upgrade()
            .ok_or_else(|| RpcError::Transport("memory hub dropped".into()))?;
        MemoryHub::ack(&hub, &self.queue, self.consumer, self.tag)
    }
}

/// Process-global hub used by [`create_memory_transport`].
static GLOBAL_HUB: OnceLock<Arc<MemoryHub>> = OnceLock::new();

fn global_hub() -> Arc<MemoryHub> {
    GLOBAL_HUB.get_or_init(MemoryHub::new).clone()
}

/// In-memory transport.
///
/// One instance plays the role of one broker connection with a single
/// channel on the shared [`MemoryHub`].
struct MemoryTransport {
    // ---
    transport_id: String,
    instance: u64,
    hub: Arc<MemoryHub>,
    prefetch: AtomicU16,
    closed: AtomicBool,
}

impl MemoryTransport {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RpcError::Transport(format!(
                "{}: transport closed",
                self.transport_id
            )));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    // ---
    fn transport_id(&self) -> &str {
        &self.transport_id
    }

    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<()> {
        self.ensure_open()?;
        self.hub.declare_exchange(spec)
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()> {
        self.ensure_open()?;
        self.hub.declare_queue(self.instance, spec)
    }

    async fn bind_queue(&self, binding: &Binding) -> Result<()> {
        self.ensure_open()?;
        self.hub.bind_queue(binding)
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.ensure_open()?;
        self.prefetch.store(count, Ordering::Release);
        Ok(())
    }

    async fn publish(&self, env: Envelope) -> Result<()> {
        self.ensure_open()?;
        MemoryHub::publish(&self.hub, &self.transport_id, env)
    }

    async fn consume(&self, queue: &str, opts: ConsumeOptions) -> Result<SubscriptionHandle> {
        // ---
        self.ensure_open()?;
        log_debug!("{}: consume {queue}", self.transport_id);
        let prefetch = self.prefetch.load(Ordering::Acquire);
        MemoryHub::consume(&self.hub, self.instance, queue, prefetch, opts)
    }

    /// Close the transport.
    ///
    /// Only this transport's consumers and exclusive queues are affected;
    /// other transports on the same hub keep working.
    async fn close(&self) -> Result<()> {
        // ---
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        log_debug!("{}: closing transport...", self.transport_id);
        MemoryHub::close(&self.hub, &self.transport_id, self.instance);
        Ok(())
    }
}

/// Create a new in-memory transport using the process-global hub.
///
/// All transports created with this function share a single message bus,
/// matching the semantics of connections to one real broker.
///
/// For isolated parallel testing, use [`create_memory_transport_with_hub`].
pub fn create_memory_transport(config: &RpcConfig) -> TransportPtr {
    // ---
    create_memory_transport_with_hub(config, global_hub())
}

/// Create a new in-memory transport on the provided hub.
pub fn create_memory_transport_with_hub(config: &RpcConfig, hub: Arc<MemoryHub>) -> TransportPtr {
    // ---
    log_debug!("{}: create memory transport", config.identity);

    let instance = hub.register_instance();
    Arc::new(MemoryTransport {
        transport_id: config.identity.clone(),
        instance,
        hub,
        prefetch: AtomicU16::new(0),
        closed: AtomicBool::new(false),
    })
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::Address;
    use bytes::Bytes;
    use tokio::time::{timeout, Duration};

    fn transport(hub: &Arc<MemoryHub>, id: &str) -> TransportPtr {
        create_memory_transport_with_hub(&RpcConfig::memory(id), hub.clone())
    }

    fn queue(name: &str, exclusive: bool, auto_delete: bool) -> QueueSpec {
        QueueSpec {
            name: name.into(),
            durable: false,
            exclusive,
            auto_delete,
        }
    }

    fn message(routing_key: &str, body: &'static [u8]) -> Envelope {
        Envelope::response(
            Arc::from("rpc"),
            Address::from(routing_key),
            Bytes::from_static(body),
            None,
            None,
        )
    }

    async fn topology(t: &TransportPtr, q: &str, key: &str) {
        t.declare_exchange(&ExchangeSpec::topic("rpc")).await.unwrap();
        t.declare_queue(&queue(q, false, false)).await.unwrap();
        t.bind_queue(&Binding {
            queue: q.into(),
            exchange: "rpc".into(),
            routing_key: key.into(),
        })
        .await
        .unwrap();
    }

    async fn recv(handle: &mut SubscriptionHandle) -> Delivery {
        timeout(Duration::from_millis(200), handle.inbox.recv())
            .await
            .expect("timed out waiting for delivery")
            .expect("inbox closed")
    }

    #[tokio::test]
    async fn test_exchange_redeclare_identical_is_noop() {
        // ---
        let hub = MemoryHub::new();
        let t = transport(&hub, "a");
        t.declare_exchange(&ExchangeSpec::topic("rpc")).await.unwrap();
        t.declare_exchange(&ExchangeSpec::topic("rpc")).await.unwrap();
    }

    #[tokio::test]
    async fn test_exchange_redeclare_conflicting_fails() {
        // ---
        let hub = MemoryHub::new();
        let t = transport(&hub, "a");
        t.declare_exchange(&ExchangeSpec::topic("rpc")).await.unwrap();

        let mut other = ExchangeSpec::topic("rpc");
        other.durable = false;
        assert!(matches!(
            t.declare_exchange(&other).await,
            Err(RpcError::Setup(_))
        ));
    }

    #[tokio::test]
    async fn test_queue_redeclare_rules() {
        // ---
        let hub = MemoryHub::new();
        let a = transport(&hub, "a");
        let b = transport(&hub, "b");

        a.declare_queue(&queue("shared", false, false)).await.unwrap();
        b.declare_queue(&queue("shared", false, false)).await.unwrap();
        assert!(matches!(
            b.declare_queue(&queue("shared", false, true)).await,
            Err(RpcError::Setup(_))
        ));

        a.declare_queue(&queue("mine", true, true)).await.unwrap();
        assert!(matches!(
            b.declare_queue(&queue("mine", true, true)).await,
            Err(RpcError::Setup(_))
        ));
    }

    #[tokio::test]
    async fn test_topic_routing_and_manual_ack() {
        // ---
        let hub = MemoryHub::new();
        let t = transport(&hub, "a");
        topology(&t, "rpc-math", "math.*").await;

        let mut handle = t.consume("rpc-math", ConsumeOptions::default()).await.unwrap();

        t.publish(message("math.add", b"1")).await.unwrap();
        t.publish(message("other.add", b"2")).await.unwrap();

        let delivery = recv(&mut handle).await;
        assert_eq!(delivery.envelope.payload, Bytes::from_static(b"1"));
        assert_eq!(hub.unacked_count("rpc-math"), Some(1));

        delivery.acker.ack().await.unwrap();
        assert_eq!(hub.unacked_count("rpc-math"), Some(0));
        assert!(delivery.acker.ack().await.is_err(), "double ack must fail");
        assert!(handle.inbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_to_missing_exchange_fails() {
        // ---
        let hub = MemoryHub::new();
        let t = transport(&hub, "a");
        assert!(matches!(
            t.publish(message("math.add", b"1")).await,
            Err(RpcError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_prefetch_bounds_unacked() {
        // ---
        let hub = MemoryHub::new();
        let t = transport(&hub, "a");
        topology(&t, "rpc-math", "math.*").await;
        t.set_prefetch(2).await.unwrap();

        let mut handle = t.consume("rpc-math", ConsumeOptions::default()).await.unwrap();
        for _ in 0..5 {
            t.publish(message("math.add", b"x")).await.unwrap();
        }

        let first = recv(&mut handle).await;
        let _second = recv(&mut handle).await;
        assert!(handle.inbox.try_recv().is_err());
        assert_eq!(hub.queue_depth("rpc-math"), Some(3));

        first.acker.ack().await.unwrap();
        let _third = recv(&mut handle).await;
        assert_eq!(hub.queue_depth("rpc-math"), Some(2));
    }

    #[tokio::test]
    async fn test_unacked_redelivered_after_close() {
        // ---
        let hub = MemoryHub::new();
        let a = transport(&hub, "a");
        let b = transport(&hub, "b");
        topology(&a, "rpc-math", "math.*").await;

        let mut first = a.consume("rpc-math", ConsumeOptions::default()).await.unwrap();
        a.publish(message("math.add", b"once")).await.unwrap();
        let _unacked = recv(&mut first).await;

        a.close().await.unwrap();

        let mut second = b.consume("rpc-math", ConsumeOptions::default()).await.unwrap();
        let redelivered = recv(&mut second).await;
        assert_eq!(redelivered.envelope.payload, Bytes::from_static(b"once"));
    }

    #[tokio::test]
    async fn test_exclusive_queue_deleted_on_close() {
        // ---
        let hub = MemoryHub::new();
        let a = transport(&hub, "a");
        a.declare_queue(&queue("rpc.reply-a-1", true, true)).await.unwrap();
        let _handle = a
            .consume("rpc.reply-a-1", ConsumeOptions { exclusive: true })
            .await
            .unwrap();

        assert!(hub.queue_exists("rpc.reply-a-1"));
        a.close().await.unwrap();
        assert!(!hub.queue_exists("rpc.reply-a-1"));
        assert!(a.publish(message("x", b"")).await.is_err());
    }

    #[tokio::test]
    async fn test_round_robin_between_consumers() {
        // ---
        let hub = MemoryHub::new();
        let a = transport(&hub, "a");
        let b = transport(&hub, "b");
        topology(&a, "rpc-math", "math.*").await;

        let mut ha = a.consume("rpc-math", ConsumeOptions::default()).await.unwrap();
        let mut hb = b.consume("rpc-math", ConsumeOptions::default()).await.unwrap();

        a.publish(message("math.add", b"1")).await.unwrap();
        a.publish(message("math.add", b"2")).await.unwrap();

        assert_eq!(recv(&mut ha).await.envelope.payload, Bytes::from_static(b"1"));
        assert_eq!(recv(&mut hb).await.envelope.payload, Bytes::from_static(b"2"));
    }
}
