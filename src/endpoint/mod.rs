//! Named endpoint registry.
//!
//! Maps a symbolic name to the URL, health-check URL, and verb of a server
//! endpoint. Registration overwrites silently; lookup of an unknown name is
//! the one condition treated as programmer error and surfaced eagerly.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;

use crate::error::{Result, SyncError};
use crate::transport::{HttpMethod, Transport};

/// Immutable description of one server endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfiguration {
    pub url: String,
    pub health_url: String,
    pub method: HttpMethod,
}

pub struct EndpointRegistry {
    transport: Arc<dyn Transport>,
    endpoints: RwLock<HashMap<String, EndpointConfiguration>>,
}

impl EndpointRegistry {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            endpoints: RwLock::new(HashMap::new()),
        }
    }

    /// Store `config` under `name`, replacing any previous registration.
    pub fn register(&self, name: &str, config: EndpointConfiguration) {
        self.endpoints
            .write()
            .unwrap()
            .insert(name.to_string(), config);
    }

    /// Convenience overload building the configuration in place.
    pub fn register_url(&self, name: &str, url: &str, health_url: &str, method: HttpMethod) {
        self.register(
            name,
            EndpointConfiguration {
                url: url.to_string(),
                health_url: health_url.to_string(),
                method,
            },
        );
    }

    pub fn get(&self, name: &str) -> Result<EndpointConfiguration> {
        self.endpoints
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| SyncError::UnknownEndpoint(name.to_string()))
    }

    /// Cheap non-authoritative liveness signal. `true` only when the health
    /// body reports `healthy` truthy; every transport failure degrades to
    /// `false` instead of propagating.
    pub async fn is_healthy(&self, endpoint: &EndpointConfiguration) -> bool {
        match self.transport.get_json(&endpoint.health_url).await {
            Ok(body) => is_truthy(body.get("healthy")),
            Err(e) => {
                tracing::debug!(url = %endpoint.health_url, error = %e, "health probe failed");
                false
            }
        }
    }
}

fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ScriptedTransport;
    use serde_json::json;

    fn registry_with(transport: Arc<ScriptedTransport>) -> EndpointRegistry {
        EndpointRegistry::new(transport)
    }

    #[test]
    fn register_and_get() {
        let registry = registry_with(Arc::new(ScriptedTransport::new()));
        registry.register_url("autoupdate", "/system/autoupdate", "/health", HttpMethod::Post);

        let endpoint = registry.get("autoupdate").unwrap();
        assert_eq!(endpoint.url, "/system/autoupdate");
        assert_eq!(endpoint.method, HttpMethod::Post);
    }

    #[test]
    fn register_overwrites_silently() {
        let registry = registry_with(Arc::new(ScriptedTransport::new()));
        registry.register_url("a", "/old", "/old/health", HttpMethod::Get);
        registry.register_url("a", "/new", "/new/health", HttpMethod::Post);

        assert_eq!(registry.get("a").unwrap().url, "/new");
    }

    #[test]
    fn unknown_endpoint_carries_name() {
        let registry = registry_with(Arc::new(ScriptedTransport::new()));
        match registry.get("missing") {
            Err(SyncError::UnknownEndpoint(name)) => assert_eq!(name, "missing"),
            other => panic!("expected UnknownEndpoint, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn health_probe_checks_healthy_field() {
        let transport = Arc::new(ScriptedTransport::new());
        let registry = registry_with(transport.clone());
        registry.register_url("a", "/a", "/a/health", HttpMethod::Get);
        let endpoint = registry.get("a").unwrap();

        transport.set_health_body(json!({ "healthy": true }));
        assert!(registry.is_healthy(&endpoint).await);

        transport.set_health_body(json!({ "healthy": false }));
        assert!(!registry.is_healthy(&endpoint).await);

        transport.set_health_body(json!({ "status": "ok" }));
        assert!(!registry.is_healthy(&endpoint).await);
    }

    #[tokio::test]
    async fn health_probe_degrades_to_false_on_transport_failure() {
        let transport = Arc::new(ScriptedTransport::new());
        let registry = registry_with(transport);
        registry.register_url("a", "/a", "/a/health", HttpMethod::Get);
        let endpoint = registry.get("a").unwrap();

        assert!(!registry.is_healthy(&endpoint).await);
    }
}
