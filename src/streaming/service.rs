//! Stream construction with the default retry policy.
//!
//! Wires endpoint resolution to the connectivity and session collaborators:
//! every error first notifies the connectivity tracker that the endpoint
//! stopped responding (handing it a health probe for recovery polling), then
//! the stream keeps reconnecting only while we are considered online and the
//! session is still authenticated.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::endpoint::{EndpointConfiguration, EndpointRegistry};
use crate::error::Result;
use crate::streaming::stream::{single_shot, ReconnectPredicate, Stream, StreamConfig};
use crate::transport::{Transport, TransportRequest};

/// Re-checks an endpoint's health URL; handed to the connectivity tracker
/// when an endpoint becomes unreachable.
pub type HealthProbe = Arc<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>;

/// Connectivity state collaborator.
#[async_trait]
pub trait ConnectionStatus: Send + Sync {
    async fn is_online(&self) -> bool;

    /// Called when an endpoint stops responding.
    async fn report_unreachable(&self, endpoint: &EndpointConfiguration, probe: HealthProbe);
}

/// Session collaborator consulted before reconnecting.
#[async_trait]
pub trait AuthGate: Send + Sync {
    async fn is_authenticated(&self) -> bool;
}

pub struct StreamService {
    transport: Arc<dyn Transport>,
    endpoints: Arc<EndpointRegistry>,
    connection: Arc<dyn ConnectionStatus>,
    auth: Arc<dyn AuthGate>,
}

impl StreamService {
    pub fn new(
        transport: Arc<dyn Transport>,
        endpoints: Arc<EndpointRegistry>,
        connection: Arc<dyn ConnectionStatus>,
        auth: Arc<dyn AuthGate>,
    ) -> Self {
        Self {
            transport,
            endpoints,
            connection,
            auth,
        }
    }

    pub fn endpoints(&self) -> &Arc<EndpointRegistry> {
        &self.endpoints
    }

    /// Open a long-lived stream against a registered endpoint.
    pub fn open(
        &self,
        endpoint_name: &str,
        body: Option<String>,
        params: &[(String, String)],
    ) -> Result<Stream> {
        let endpoint = self.endpoints.get(endpoint_name)?;
        let request = TransportRequest {
            method: endpoint.method,
            url: merge_params(&endpoint.url, params),
            body,
        };
        let config = StreamConfig::new(request).should_reconnect(self.default_predicate(endpoint));
        Ok(Stream::open(self.transport.clone(), config))
    }

    /// Single-shot read against a registered endpoint.
    pub async fn fetch(&self, endpoint_name: &str, body: Option<String>) -> Result<Value> {
        let endpoint = self.endpoints.get(endpoint_name)?;
        let request = TransportRequest {
            method: endpoint.method,
            url: endpoint.url.clone(),
            body,
        };
        single_shot(self.transport.clone(), request).await
    }

    fn default_predicate(&self, endpoint: EndpointConfiguration) -> ReconnectPredicate {
        let connection = self.connection.clone();
        let auth = self.auth.clone();
        let registry = self.endpoints.clone();

        Arc::new(move |_err| {
            let connection = connection.clone();
            let auth = auth.clone();
            let registry = registry.clone();
            let endpoint = endpoint.clone();
            Box::pin(async move {
                let probe: HealthProbe = {
                    let registry = registry.clone();
                    let endpoint = endpoint.clone();
                    Arc::new(move || {
                        let registry = registry.clone();
                        let endpoint = endpoint.clone();
                        Box::pin(async move { registry.is_healthy(&endpoint).await })
                    })
                };
                connection.report_unreachable(&endpoint, probe).await;
                connection.is_online().await && auth.is_authenticated().await
            })
        })
    }
}

/// Append query parameters, respecting any query string already present.
pub fn merge_params(url: &str, params: &[(String, String)]) -> String {
    if params.is_empty() {
        return url.to_string();
    }
    let mut out = String::from(url);
    for (key, value) in params {
        out.push(if out.contains('?') { '&' } else { '?' });
        out.push_str(key);
        out.push('=');
        out.push_str(value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::stream::StreamEvent;
    use crate::transport::{HttpMethod, ScriptedTransport, TransportEvent};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct RecordingStatus {
        online: AtomicBool,
        reports: AtomicUsize,
    }

    #[async_trait]
    impl ConnectionStatus for RecordingStatus {
        async fn is_online(&self) -> bool {
            self.online.load(Ordering::SeqCst)
        }

        async fn report_unreachable(&self, _endpoint: &EndpointConfiguration, _probe: HealthProbe) {
            self.reports.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct AuthAlways;

    #[async_trait]
    impl AuthGate for AuthAlways {
        async fn is_authenticated(&self) -> bool {
            true
        }
    }

    fn service(
        transport: Arc<ScriptedTransport>,
        status: Arc<RecordingStatus>,
    ) -> StreamService {
        let registry = Arc::new(EndpointRegistry::new(transport.clone()));
        registry.register_url(
            "autoupdate",
            "/system/autoupdate",
            "/system/autoupdate/health",
            HttpMethod::Post,
        );
        StreamService::new(transport, registry, status, Arc::new(AuthAlways))
    }

    #[test]
    fn merge_params_handles_existing_query() {
        let params = vec![("compress".to_string(), "1".to_string())];
        assert_eq!(merge_params("/a", &params), "/a?compress=1");
        assert_eq!(merge_params("/a?x=1", &params), "/a?x=1&compress=1");
        assert_eq!(merge_params("/a", &[]), "/a");
    }

    #[tokio::test]
    async fn offline_status_stops_reconnecting_after_notification() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.script(vec![TransportEvent::Failed {
            reason: "connection refused".to_string(),
        }]);
        let status = Arc::new(RecordingStatus {
            online: AtomicBool::new(false),
            reports: AtomicUsize::new(0),
        });

        let service = service(transport.clone(), status.clone());
        let stream = service.open("autoupdate", None, &[]).unwrap();
        let mut events = stream.take_events().unwrap();

        assert!(matches!(events.recv().await, Some(StreamEvent::Error(_))));
        assert_eq!(status.reports.load(Ordering::SeqCst), 1);
        assert_eq!(transport.connect_count(), 1);
    }

    #[tokio::test]
    async fn unknown_endpoint_fails_eagerly() {
        let transport = Arc::new(ScriptedTransport::new());
        let status = Arc::new(RecordingStatus {
            online: AtomicBool::new(true),
            reports: AtomicUsize::new(0),
        });
        let service = service(transport, status);

        assert!(service.open("nope", None, &[]).is_err());
    }
}
