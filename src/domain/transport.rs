// src/domain/transport.rs

//! Transport domain abstractions.
//!
//! This module defines the broker primitives the RPC layer relies on:
//! topology declaration, publishing, consuming and manual acknowledgment.
//! It intentionally avoids any reference to a concrete client library.
//!
//! The transport layer is responsible only for declaring what it is told to
//! declare and delivering opaque envelopes to consumers. Higher-level
//! semantics such as RPC correlation, handler dispatch or timeouts are
//! handled by the client and server layers.
//!
//! Concrete implementations of this interface live under `src/transport/`.
use crate::Result;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

/// A routing key or queue name.
///
/// Addresses are immutable, cheap to clone, and safe to share across threads.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Address(pub Arc<str>);

impl<T> From<T> for Address
where
    T: Into<Arc<str>>,
{
    fn from(value: T) -> Self {
        // ---
        Address(value.into())
    }
}

impl Address {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Exchange routing algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Exact routing key match.
    Direct,
    /// Dot-separated pattern match with `*` and `#` wildcards.
    Topic,
}

/// Parameters of an exchange declaration.
///
/// Declaring an existing exchange with identical parameters is a no-op;
/// with different parameters it fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_delete: bool,
}

impl ExchangeSpec {
    /// Durable topic exchange, the only kind the RPC layer uses.
    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Topic,
            durable: true,
            auto_delete: false,
        }
    }
}

/// Parameters of a queue declaration.
///
/// Same idempotency rule as [`ExchangeSpec`]. An exclusive queue belongs to
/// the connection that declared it and is removed when that connection
/// closes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

/// A queue-to-exchange binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

/// Options for starting a consumer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Refuse other consumers on the same queue.
    pub exclusive: bool,
}

/// An opaque message envelope.
///
/// An `Envelope` is the unit of transport between producers and consumers.
/// It carries a payload along with the AMQP message properties used by the
/// RPC layer for correlation and reply routing.
///
/// The transport layer does not interpret the payload or metadata fields;
/// it is responsible only for delivery.
///
/// # Examples
///
/// ## Creating a request envelope
///
/// ```
/// # use nameko_rpc::{Envelope, Address};
/// # use bytes::Bytes;
/// # use std::sync::Arc;
/// let envelope = Envelope::request(
///     Arc::from("nameko-rpc"),
///     Address::from("articles.health_check"),
///     Bytes::from_static(br#"{"args":[],"kwargs":{}}"#),
///     Arc::from("correlation-123"),
///     Address::from("rpc.reply-web-1"),
///     Arc::from("application/json"),
/// );
/// assert_eq!(envelope.routing_key.as_str(), "articles.health_check");
/// ```
#[derive(Clone, Debug)]
pub struct Envelope {
    // ---
    /// Exchange the message is published to.
    pub exchange: Arc<str>,

    /// Routing key matched against queue bindings.
    pub routing_key: Address,

    /// Opaque payload bytes.
    pub payload: Bytes,

    /// Correlation identifier used to associate requests with responses.
    pub correlation_id: Option<Arc<str>>,

    /// Queue the reply must be routed to.
    ///
    /// Present on request envelopes; absent on responses.
    pub reply_to: Option<Address>,

    /// Content type tag (e.g., "application/json").
    pub content_type: Option<Arc<str>>,
}

impl Envelope {
    // ---
    /// Create a request envelope.
    ///
    /// # Arguments
    ///
    /// * `exchange` - RPC exchange name
    /// * `routing_key` - `<service>.<method>`
    /// * `payload` - Serialized request envelope
    /// * `correlation_id` - Unique identifier for matching responses
    /// * `reply_to` - Reply queue of the caller
    /// * `content_type` - Payload format (typically "application/json")
    pub fn request(
        exchange: Arc<str>,
        routing_key: Address,
        payload: Bytes,
        correlation_id: Arc<str>,
        reply_to: Address,
        content_type: Arc<str>,
    ) -> Self {
        // ---
        Self {
            exchange,
            routing_key,
            payload,
            correlation_id: Some(correlation_id),
            reply_to: Some(reply_to),
            content_type: Some(content_type),
        }
    }

    /// Create a response envelope.
    ///
    /// # Arguments
    ///
    /// * `exchange` - RPC exchange name
    /// * `routing_key` - The request's `reply_to` queue
    /// * `payload` - Serialized response envelope
    /// * `correlation_id` - Correlation ID copied from the request
    /// * `content_type` - Content type copied from the request
    pub fn response(
        exchange: Arc<str>,
        routing_key: Address,
        payload: Bytes,
        correlation_id: Option<Arc<str>>,
        content_type: Option<Arc<str>>,
    ) -> Self {
        // ---
        Self {
            exchange,
            routing_key,
            payload,
            correlation_id,
            reply_to: None,
            content_type,
        }
    }
}

/// Broker-side acknowledgment of one delivery.
#[async_trait::async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self) -> Result<()>;
}

/// Handle used to acknowledge a [`Delivery`].
///
/// Unacknowledged deliveries are redelivered by the broker once their
/// consumer goes away.
#[derive(Clone)]
pub struct Acker(Arc<dyn Acknowledge>);

impl Acker {
    pub fn new(inner: Arc<dyn Acknowledge>) -> Self {
        Self(inner)
    }

    pub async fn ack(&self) -> Result<()> {
        self.0.ack().await
    }
}

impl fmt::Debug for Acker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Acker")
    }
}

/// A consumed message awaiting acknowledgment.
#[derive(Debug)]
pub struct Delivery {
    pub envelope: Envelope,
    pub acker: Acker,
}

/// Handle returned from a successful `consume()`.
///
/// The consumer remains active until either:
/// - The handle is dropped (receiver channel closes)
/// - The transport is closed
pub struct SubscriptionHandle {
    // ---
    /// Receiver channel for deliveries from the consumed queue.
    pub inbox: mpsc::UnboundedReceiver<Delivery>,
}

/// Transport abstraction.
///
/// A `Transport` owns exactly one broker channel. It defines the minimal
/// contract required by the RPC layer without committing to any specific
/// client library.
///
/// Implementations must ensure that:
/// - Declarations are idempotent for identical parameters and fail for
///   conflicting ones.
/// - Once `consume()` returns successfully, messages routed to the queue
///   are delivered to the returned inbox.
/// - Deliveries stay unacknowledged until [`Acker::ack`] is called, and
///   unacknowledged deliveries are requeued when their consumer goes away.
/// - Operations on the underlying channel are serialized.
///
/// The in-memory transport serves as the reference implementation of these
/// semantics.
///
/// # Notes
///
/// This trait uses `async_trait`; the expanded documentation may show explicit
/// lifetimes and a boxed `Future`. This is an implementation detail; consumers
/// should treat methods as normal `async fn`s.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    // ---
    /// Identifier of this transport instance, used for logging.
    fn transport_id(&self) -> &str;

    /// Declare an exchange.
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<()>;

    /// Declare a queue.
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()>;

    /// Bind a queue to an exchange.
    async fn bind_queue(&self, binding: &Binding) -> Result<()>;

    /// Limit unacknowledged deliveries per consumer created afterwards
    /// (0 = unbounded).
    async fn set_prefetch(&self, count: u16) -> Result<()>;

    /// Publish an envelope. Fire-and-forget: no publisher confirm is awaited.
    async fn publish(&self, env: Envelope) -> Result<()>;

    /// Start consuming a queue with manual acknowledgment.
    async fn consume(&self, queue: &str, opts: ConsumeOptions) -> Result<SubscriptionHandle>;

    /// Close the transport and release any associated resources.
    async fn close(&self) -> Result<()>;
}

/// Shared transport pointer.
///
/// This is an `Arc<dyn Transport>`, which means:
/// - `.clone()` is cheap (only increments a reference count)
/// - Multiple clones share the same underlying channel
/// - Used to erase concrete transport types behind a stable domain interface.
pub type TransportPtr = Arc<dyn Transport>;
