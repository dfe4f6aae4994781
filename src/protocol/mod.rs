/// Protocol types for RPC message correlation and serialization
///
/// This module defines the wire format for request/response envelopes,
/// correlation ID management and the topology naming rules.
mod correlation;
mod message;
pub mod routing;

pub use correlation::CorrelationId;
pub use message::{RemoteError, RequestEnvelope, ResponseEnvelope};
