//! Key generation utilities for coordination and rate limiting.

use serde_json::Value;

/// Builds operation keys for calls whose caller did not supply one.
///
/// Keys are `method:endpoint` with the canonical JSON body appended when
/// present. `serde_json` objects keep their keys sorted, so two bodies with
/// the same fields always produce the same key.
#[derive(Debug, Clone, Default)]
pub struct KeyGenerator {
    namespace: Option<String>,
}

impl KeyGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prefix every generated key, e.g. with a service name.
    pub fn with_namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
        }
    }

    pub fn generate_key(&self, method: &str, endpoint: &str, body: Option<&Value>) -> String {
        let key = request_key(method, endpoint, body);
        match &self.namespace {
            Some(namespace) => format!("{}:{}", namespace, key),
            None => key,
        }
    }

    /// Sanitize key components so they only contain key-safe characters
    pub fn sanitize_key(key: &str) -> String {
        key.chars()
            .map(|c| {
                if c.is_alphanumeric() || c == ':' || c == '-' || c == '_' || c == '/' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }
}

/// Deterministic key for `method` + `endpoint` + serialized `body`.
pub fn request_key(method: &str, endpoint: &str, body: Option<&Value>) -> String {
    let method = method.to_ascii_uppercase();
    match body {
        Some(Value::Null) | None => format!("{}:{}", method, endpoint),
        Some(body) => format!("{}:{}:{}", method, endpoint, body),
    }
}
