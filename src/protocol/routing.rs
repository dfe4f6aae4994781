//! Naming and routing rules of the RPC topology.
//!
//! ```text
//! exchange       nameko-rpc                      (topic, durable)
//! server queue   rpc-<service>                   bound with "<service>.*"
//! reply queue    rpc.reply-<identity>-<uuid>     bound with its own name
//! routing key    <service>.<method>
//! ```

use uuid::Uuid;

/// Default topic exchange carrying all RPC traffic.
pub const DEFAULT_EXCHANGE: &str = "nameko-rpc";

/// Default content type tag attached to every published message.
pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// Default server-side prefetch bound.
pub const DEFAULT_PREFETCH_COUNT: u16 = 10;

/// Routing key of a request for `method` on `service`.
pub fn routing_key(service: &str, method: &str) -> String {
    format!("{service}.{method}")
}

/// Binding pattern routing every method of `service` to its queue.
pub fn service_binding(service: &str) -> String {
    format!("{service}.*")
}

/// Deterministic inbound queue name of `service`.
pub fn service_queue(service: &str) -> String {
    format!("rpc-{service}")
}

/// Fresh, unique reply queue name for a client called `identity`.
pub fn reply_queue(identity: &str) -> String {
    format!("rpc.reply-{identity}-{}", Uuid::new_v4())
}

/// Method segment of a request routing key addressed to `service`.
///
/// Returns `None` when the key does not start with `<service>.` or the
/// remaining segment is empty or itself dotted.
pub fn method_of<'a>(service: &str, routing_key: &'a str) -> Option<&'a str> {
    // ---
    let method = routing_key.strip_prefix(service)?.strip_prefix('.')?;
    if method.is_empty() || method.contains('.') {
        return None;
    }
    Some(method)
}

/// Normalize a method name to the handler lookup key.
///
/// `health_check`, `HealthCheck` and `healthCheck` all map to `health_check`.
pub fn normalize_method(name: &str) -> String {
    // ---
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 4);
    let mut prev_lower_or_digit = false;
    let mut prev_upper = false;

    for (i, &ch) in chars.iter().enumerate() {
        if ch == '-' || ch == '_' {
            if !out.is_empty() && !out.ends_with('_') {
                out.push('_');
            }
            prev_lower_or_digit = false;
            prev_upper = false;
            continue;
        }

        if ch.is_uppercase() {
            // `HTTPServer`: the last capital of a run starts the next word.
            let next_lower = chars.get(i + 1).is_some_and(|c| c.is_lowercase());
            let boundary = prev_lower_or_digit || (prev_upper && next_lower);
            if boundary && !out.ends_with('_') {
                out.push('_');
            }
            out.extend(ch.to_lowercase());
            prev_lower_or_digit = false;
            prev_upper = true;
        } else {
            out.push(ch);
            prev_lower_or_digit = ch.is_lowercase() || ch.is_ascii_digit();
            prev_upper = false;
        }
    }

    while out.ends_with('_') {
        out.pop();
    }
    out
}

/// AMQP topic matching: `*` matches exactly one word, `#` zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    // ---
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    // ---
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && match_words(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && match_words(rest, &key[1..]),
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_names() {
        // ---
        assert_eq!(routing_key("foo_bar", "health_check"), "foo_bar.health_check");
        assert_eq!(service_binding("foo_bar"), "foo_bar.*");
        assert_eq!(service_queue("foo_bar"), "rpc-foo_bar");

        let a = reply_queue("web");
        let b = reply_queue("web");
        assert!(a.starts_with("rpc.reply-web-"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_method_of() {
        // ---
        assert_eq!(method_of("foo_bar", "foo_bar.health_check"), Some("health_check"));
        assert_eq!(method_of("foo_bar", "foo.health_check"), None);
        assert_eq!(method_of("foo", "foo_bar.health_check"), None);
        assert_eq!(method_of("foo_bar", "foo_bar."), None);
        assert_eq!(method_of("foo_bar", "foo_bar.a.b"), None);
        assert_eq!(method_of("foo_bar", "foo_bar"), None);
    }

    #[test]
    fn test_normalize_method() {
        // ---
        assert_eq!(normalize_method("health_check"), "health_check");
        assert_eq!(normalize_method("HealthCheck"), "health_check");
        assert_eq!(normalize_method("healthCheck"), "health_check");
        assert_eq!(normalize_method("GetFoo"), "get_foo");
        assert_eq!(normalize_method("get-foo"), "get_foo");
        assert_eq!(normalize_method("v2Status"), "v2_status");
        assert_eq!(normalize_method("_private_"), "private");
    }

    #[test]
    fn test_normalize_method_uppercase_runs() {
        // ---
        assert_eq!(normalize_method("HTTPServer"), "http_server");
        assert_eq!(normalize_method("http_server"), "http_server");
        assert_eq!(normalize_method("getHTTPResponse"), "get_http_response");
        assert_eq!(normalize_method("ParseJSON"), "parse_json");
        assert_eq!(normalize_method("HTTP"), "http");
    }

    #[test]
    fn test_topic_matches() {
        // ---
        assert!(topic_matches("foo.*", "foo.bar"));
        assert!(!topic_matches("foo.*", "foo"));
        assert!(!topic_matches("foo.*", "foo.bar.baz"));
        assert!(!topic_matches("foo.*", "food.bar"));
        assert!(topic_matches("foo.#", "foo"));
        assert!(topic_matches("foo.#", "foo.bar.baz"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("rpc.reply-x-1", "rpc.reply-x-1"));
        assert!(!topic_matches("rpc.reply-x-1", "rpc.reply-x-2"));
    }
}
