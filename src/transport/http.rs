//! HTTP transport: JSON POSTs out, an axum intake route in.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, State, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use reqwest::{Client, Url};
use serde::Serialize;
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;

use crate::config::TransportConfig;
use crate::error::{DeliveryError, TransportError};
use crate::protocol::Message;
use crate::transport::retry::{AttemptError, RetryPolicy, deliver_with_retry};
use crate::transport::{Inbound, InboundQueue, InboundReceiver, ListenerServer, Transport};

/// Maximum JSON body size accepted by the intake route (256 KB).
const MAX_BODY_BYTES: usize = 256 * 1024;

/// Path of the single message-intake route.
pub const INTAKE_PATH: &str = "/message";

/// Maximum number of response-body bytes kept in an error reason.
const MAX_ERROR_BODY: usize = 512;

/// Transport that POSTs JSON messages and receives them on an axum route.
pub struct HttpTransport {
    config: TransportConfig,
    client: Client,
    policy: RetryPolicy,
    inbound: Arc<InboundQueue>,
    advertised_url: Option<String>,
    bound_addr: RwLock<Option<SocketAddr>>,
    server: Mutex<Option<ListenerServer>>,
}

impl HttpTransport {
    /// Create a transport; the listener is not bound until `start()`.
    ///
    /// A wildcard `host` is not a reachable address, so it needs an
    /// `advertised_url` to put in `reply_to` and registrations.
    pub fn new(config: TransportConfig) -> Result<Self, TransportError> {
        let advertised_url = match config.advertised_url.as_deref() {
            Some(url) => {
                intake_endpoint(url)?;
                Some(url.trim_end_matches('/').to_string())
            }
            None if is_wildcard_host(&config.host) => {
                return Err(TransportError::InvalidUrl {
                    url: format!("http://{}:{}", config.host, config.port),
                    reason: "wildcard listener host needs an advertised URL \
                             (AGENT_ADVERTISED_URL)"
                        .to_string(),
                });
            }
            None => None,
        };

        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| TransportError::StartupFailed {
                reason: format!("failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            policy: config.retry_policy(),
            config,
            client,
            inbound: Arc::new(InboundQueue::new()),
            advertised_url,
            bound_addr: RwLock::new(None),
            server: Mutex::new(None),
        })
    }

    /// Override the retry policy derived from the config.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// The intake routes with state applied.
    ///
    /// Deliveries are buffered even before `start()`, so the router can be
    /// mounted into a larger server.
    pub fn routes(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route(INTAKE_PATH, post(intake_handler))
            .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
            .with_state(Arc::clone(&self.inbound))
    }

    /// Deliveries handed out by `receive()` but not yet acknowledged.
    pub fn unacknowledged(&self) -> Vec<String> {
        self.inbound.unacknowledged()
    }

    async fn attempt(
        &self,
        endpoint: Url,
        message: Message,
    ) -> Result<serde_json::Value, AttemptError> {
        let response = self
            .client
            .post(endpoint)
            .json(&message)
            .send()
            .await
            .map_err(|e| AttemptError {
                status: e.status().map(|s| s.as_u16()),
                reason: if e.is_timeout() {
                    format!("request timed out after {:?}", self.config.timeout)
                } else {
                    e.to_string()
                },
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| AttemptError {
            status: Some(status.as_u16()),
            reason: format!("failed to read response body: {}", e),
        })?;

        if !status.is_success() {
            return Err(AttemptError {
                status: Some(status.as_u16()),
                reason: format!("HTTP {}: {}", status, truncate(&body, MAX_ERROR_BODY)),
            });
        }

        if body.trim().is_empty() {
            return Ok(serde_json::Value::Null);
        }
        Ok(serde_json::from_str(&body).unwrap_or(serde_json::Value::String(body)))
    }
}

/// Resolve an agent address to its intake endpoint.
///
/// A bare `scheme://host:port` gets the intake path appended; a URL that
/// already names a path is used as is.
pub fn intake_endpoint(url: &str) -> Result<Url, TransportError> {
    let mut parsed = Url::parse(url).map_err(|e| TransportError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;

    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(TransportError::InvalidUrl {
            url: url.to_string(),
            reason: format!("unsupported scheme '{}'", parsed.scheme()),
        });
    }

    if parsed.path().is_empty() || parsed.path() == "/" {
        parsed.set_path(INTAKE_PATH);
    }
    Ok(parsed)
}

fn is_wildcard_host(host: &str) -> bool {
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .is_ok_and(|ip| ip.is_unspecified())
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[derive(Debug, Serialize)]
struct IntakeResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    delivery_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    pending: usize,
    unacknowledged: usize,
}

async fn health_handler(State(inbound): State<Arc<InboundQueue>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        pending: inbound.len(),
        unacknowledged: inbound.unacknowledged().len(),
    })
}

async fn intake_handler(
    State(inbound): State<Arc<InboundQueue>>,
    body: Result<Json<serde_json::Value>, JsonRejection>,
) -> (StatusCode, Json<IntakeResponse>) {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => {
            tracing::warn!("Rejected intake request: {}", rejection.body_text());
            return (
                rejection.status(),
                Json(IntakeResponse {
                    status: "error",
                    delivery_id: None,
                    message: Some(rejection.body_text()),
                }),
            );
        }
    };

    let delivery = Inbound::new(body);
    let delivery_id = delivery.delivery_id.clone();
    tracing::debug!(delivery_id = %delivery_id, "Buffered inbound delivery");
    inbound.push(delivery);

    (
        StatusCode::OK,
        Json(IntakeResponse {
            status: "ok",
            delivery_id: Some(delivery_id),
            message: None,
        }),
    )
}

#[async_trait]
impl Transport for HttpTransport {
    fn url(&self) -> String {
        if let Some(url) = &self.advertised_url {
            return url.clone();
        }
        let port = self
            .bound_addr
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .map(|addr| addr.port())
            .unwrap_or(self.config.port);
        format!("http://{}:{}", self.config.host, port)
    }

    async fn start(&self) -> Result<(), TransportError> {
        let mut server = self.server.lock().await;
        if server.is_some() {
            return Ok(());
        }

        let mut listener = ListenerServer::new(self.config.host.clone(), self.config.port);
        listener.add_routes(self.routes().layer(TraceLayer::new_for_http()));
        let addr = listener.start().await?;

        *self
            .bound_addr
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(addr);
        *server = Some(listener);

        tracing::info!("HTTP transport ready at {}", self.url());
        Ok(())
    }

    async fn send(
        &self,
        url: &str,
        message: &Message,
    ) -> Result<serde_json::Value, DeliveryError> {
        let endpoint = intake_endpoint(url).map_err(|e| DeliveryError {
            url: url.to_string(),
            last_status: None,
            attempts: 0,
            reason: e.to_string(),
        })?;

        tracing::debug!(
            url = %endpoint,
            message_type = %message.message_type(),
            "Sending message"
        );

        deliver_with_retry(&self.policy, url, message, |copy| {
            self.attempt(endpoint.clone(), copy)
        })
        .await
    }

    fn receive(&self) -> Option<Inbound> {
        self.inbound.pop()
    }

    fn register_receiver(&self, receiver: InboundReceiver) {
        self.inbound.add_receiver(receiver);
    }

    async fn acknowledge(&self, delivery_id: &str) -> Result<(), TransportError> {
        if self.inbound.acknowledge(delivery_id) {
            Ok(())
        } else {
            Err(TransportError::UnknownDelivery(delivery_id.to_string()))
        }
    }

    async fn shutdown(&self) -> Result<(), TransportError> {
        if let Some(mut server) = self.server.lock().await.take() {
            server.shutdown().await;
        }
        *self
            .bound_addr
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use pretty_assertions::assert_eq;
    use tower::ServiceExt;

    use super::*;
    use crate::protocol::{ControlCommand, TaskMessage};

    fn test_config() -> TransportConfig {
        TransportConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            retry_count: 2,
            timeout: Duration::from_secs(2),
            backoff_base: Duration::from_millis(10),
            backoff_max: Duration::from_millis(40),
            advertised_url: None,
        }
    }

    /// A port nothing listens on.
    async fn closed_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    #[test]
    fn test_intake_endpoint_resolution() {
        assert_eq!(
            intake_endpoint("http://127.0.0.1:8000").unwrap().as_str(),
            "http://127.0.0.1:8000/message"
        );
        assert_eq!(
            intake_endpoint("http://127.0.0.1:8000/").unwrap().as_str(),
            "http://127.0.0.1:8000/message"
        );
        assert_eq!(
            intake_endpoint("https://relay.example/agents/a/message")
                .unwrap()
                .as_str(),
            "https://relay.example/agents/a/message"
        );
        assert!(intake_endpoint("memory://worker").is_err());
        assert!(intake_endpoint("not a url").is_err());
    }

    #[test]
    fn test_url_uses_configured_port_before_start() {
        let transport = HttpTransport::new(TransportConfig {
            port: 8123,
            ..test_config()
        })
        .unwrap();
        assert_eq!(transport.url(), "http://127.0.0.1:8123");
    }

    #[test]
    fn test_wildcard_host_requires_advertised_url() {
        for host in ["0.0.0.0", "::", "[::]"] {
            let err = HttpTransport::new(TransportConfig {
                host: host.to_string(),
                ..test_config()
            })
            .err()
            .unwrap();
            assert!(matches!(err, TransportError::InvalidUrl { .. }), "{host}: {err:?}");
        }

        let transport = HttpTransport::new(TransportConfig {
            host: "0.0.0.0".to_string(),
            advertised_url: Some("http://relay.internal:8000/".to_string()),
            ..test_config()
        })
        .unwrap();
        assert_eq!(transport.url(), "http://relay.internal:8000");

        assert!(
            HttpTransport::new(TransportConfig {
                advertised_url: Some("relay.internal".to_string()),
                ..test_config()
            })
            .is_err()
        );
    }

    #[tokio::test]
    async fn test_advertised_url_survives_start() {
        let transport = HttpTransport::new(TransportConfig {
            host: "0.0.0.0".to_string(),
            advertised_url: Some("http://10.1.2.3:9000".to_string()),
            ..test_config()
        })
        .unwrap();
        transport.start().await.unwrap();
        assert_eq!(transport.url(), "http://10.1.2.3:9000");
        transport.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_intake_route_buffers_json() {
        let transport = HttpTransport::new(test_config()).unwrap();
        let message = Message::control("operator", ControlCommand::Pause);

        let req = Request::builder()
            .method("POST")
            .uri("/message")
            .header("Content-Type", "application/json")
            .body(Body::from(serde_json::to_vec(&message).unwrap()))
            .unwrap();

        let resp = transport.routes().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let inbound = transport.receive().unwrap();
        assert_eq!(Message::from_value(inbound.body).unwrap(), message);
        assert!(transport.receive().is_none());
        assert_eq!(transport.unacknowledged(), vec![inbound.delivery_id.clone()]);

        transport.acknowledge(&inbound.delivery_id).await.unwrap();
        assert!(transport.unacknowledged().is_empty());
        assert!(matches!(
            transport.acknowledge(&inbound.delivery_id).await,
            Err(TransportError::UnknownDelivery(_))
        ));
    }

    #[tokio::test]
    async fn test_intake_route_rejects_non_json() {
        let transport = HttpTransport::new(test_config()).unwrap();

        let req = Request::builder()
            .method("POST")
            .uri("/message")
            .header("Content-Type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();

        let resp = transport.routes().oneshot(req).await.unwrap();
        assert!(resp.status().is_client_error());
        assert!(transport.receive().is_none());
    }

    #[tokio::test]
    async fn test_health_route() {
        let transport = HttpTransport::new(test_config()).unwrap();
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();

        let resp = transport.routes().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_send_to_unreachable_url_makes_retry_count_plus_one_attempts() {
        let transport = HttpTransport::new(test_config()).unwrap();
        let url = format!("http://127.0.0.1:{}", closed_port().await);
        let message = Message::task("a", TaskMessage::new("t1", "anything"));

        let err = transport.send(&url, &message).await.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(err.url, url);
        assert!(err.last_status.is_none());
    }

    /// Whether `buf` holds a full HTTP request with a `Content-Length` body.
    fn request_complete(buf: &[u8]) -> bool {
        let text = String::from_utf8_lossy(buf);
        let Some(header_end) = text.find("\r\n\r\n") else {
            return false;
        };
        let length = text[..header_end]
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())?
            })
            .unwrap_or(0);
        buf.len() >= header_end + 4 + length
    }

    #[tokio::test]
    async fn test_truncated_response_body_is_a_failed_attempt() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let hits = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&hits);
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let mut request = Vec::new();
                let mut chunk = [0u8; 4096];
                while !request_complete(&request) {
                    match socket.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => request.extend_from_slice(&chunk[..n]),
                    }
                }
                // Promise 64 bytes, send one, hang up.
                let _ = socket
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 64\r\n\r\n{")
                    .await;
            }
        });

        let transport = HttpTransport::new(test_config()).unwrap();
        let message = Message::task("a", TaskMessage::new("t1", "anything"));
        let err = transport.send(&url, &message).await.unwrap_err();

        assert_eq!(err.attempts, 3);
        assert_eq!(err.last_status, Some(200));
        assert!(err.reason.contains("failed to read response body"), "{}", err.reason);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_send_retries_server_errors_and_reports_status() {
        let hits = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&hits);
        let app = Router::new().route(
            "/message",
            post(move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    (StatusCode::SERVICE_UNAVAILABLE, "busy")
                }
            }),
        );
        let mut server = ListenerServer::new("127.0.0.1", 0);
        server.add_routes(app);
        let addr = server.start().await.unwrap();

        let transport = HttpTransport::new(test_config()).unwrap();
        let message = Message::control("a", ControlCommand::Stop);
        let err = transport
            .send(&format!("http://{}", addr), &message)
            .await
            .unwrap_err();

        assert_eq!(err.attempts, 3);
        assert_eq!(err.last_status, Some(503));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_round_trip_between_two_transports() {
        let receiver = HttpTransport::new(test_config()).unwrap();
        receiver.start().await.unwrap();
        let sender = HttpTransport::new(test_config()).unwrap();

        let message = Message::task(
            "sender",
            TaskMessage::new("t9", "translate").with_reply_to(sender.url()),
        );
        let reply = sender.send(&receiver.url(), &message).await.unwrap();
        assert_eq!(reply["status"], "ok");

        let inbound = receiver.receive().unwrap();
        assert_eq!(reply["delivery_id"], inbound.delivery_id.as_str());
        assert_eq!(Message::from_value(inbound.body).unwrap(), message);

        receiver.shutdown().await.unwrap();
    }
}
