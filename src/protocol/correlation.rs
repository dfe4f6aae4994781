use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Correlation token pairing a request with its reply.
///
/// Carried in the AMQP `correlation-id` message property. Generated tokens are
/// UUID v4 in standard 36-byte string format, so two calls in flight on the
/// same reply queue never share one. Tokens received from peers are opaque
/// and kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(String);

impl CorrelationId {
    // ---

    /// Generate a new unique correlation ID
    pub fn generate() -> Self {
        // ---
        Self(Uuid::new_v4().to_string())
    }

    /// Get the correlation ID as a string slice
    pub fn as_str(&self) -> &str {
        // ---
        &self.0
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<&CorrelationId> for Arc<str> {
    fn from(value: &CorrelationId) -> Self {
        Arc::from(value.0.as_str())
    }
}

impl fmt::Display for CorrelationId {
    // ---

    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_generate_unique() {
        // ---
        let id1 = CorrelationId::generate();
        let id2 = CorrelationId::generate();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_format() {
        // ---
        let id = CorrelationId::generate();
        assert_eq!(id.as_str().len(), 36); // Standard UUID format
    }

    #[test]
    fn test_opaque_tokens_kept_verbatim() {
        // ---
        let id = CorrelationId::from("abc123");
        assert_eq!(id.to_string(), "abc123");
        let shared: Arc<str> = (&id).into();
        assert_eq!(&*shared, "abc123");
    }
}
