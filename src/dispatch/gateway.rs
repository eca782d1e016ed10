//! Send gateway clients.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, trace};

use crate::config::{GatewayConfig, GatewayMode, MockConfig, MockResponse};

/// One outbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendRequest {
    #[serde(rename = "to")]
    pub destination: String,
    pub body: String,
    #[serde(rename = "from")]
    pub source: String,
}

/// Errors returned by a send gateway.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    /// No answer within the send timeout. The provider may have accepted.
    #[error("gateway timeout")]
    Timeout,

    /// The request never reached the provider
    #[error("transport error: {0}")]
    Transport(String),

    /// Provider refused the message
    #[error("rejected by provider: {0}")]
    Rejected(String),

    #[error("rate limited by provider")]
    RateLimited,

    /// Provider answered with something we could not read
    #[error("unexpected provider response: {0}")]
    Protocol(String),
}

impl GatewayError {
    /// Errors raised before the provider could have accepted the message.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::RateLimited)
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Transport(_) => "transport",
            Self::Rejected(_) => "rejected",
            Self::RateLimited => "rate_limited",
            Self::Protocol(_) => "protocol",
        }
    }
}

/// External send gateway. Returns the provider message ID.
#[async_trait]
pub trait SendGateway: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, request: &SendRequest) -> Result<String, GatewayError>;
}

/// Shared gateway handle.
pub type SharedGateway = Arc<dyn SendGateway>;

/// Build the gateway selected by configuration.
pub fn create_gateway(config: &GatewayConfig) -> anyhow::Result<SharedGateway> {
    match config.mode {
        GatewayMode::Mock => Ok(Arc::new(MockGateway::new(&config.mock))),
        GatewayMode::Http => {
            let endpoint = config
                .endpoint
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("gateway.endpoint is required in http mode"))?;
            Ok(Arc::new(HttpGateway::new(endpoint, config.api_key.clone())?))
        }
    }
}

// =============================================================================
// Mock
// =============================================================================

/// In-process gateway that answers from configuration or a script.
#[derive(Debug)]
pub struct MockGateway {
    /// Response configuration
    response: MockResponse,
    /// Simulated latency
    latency: Duration,
    /// Scripted results, consumed before `response` applies
    script: Mutex<VecDeque<Result<(), GatewayError>>>,
    /// Requests seen, in order
    sent: Mutex<Vec<SendRequest>>,
    message_counter: AtomicU64,
}

impl MockGateway {
    pub fn new(config: &MockConfig) -> Self {
        Self {
            response: config.response.clone(),
            latency: config.latency,
            script: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            message_counter: AtomicU64::new(1),
        }
    }

    /// Gateway that accepts everything.
    pub fn success() -> Self {
        Self::new(&MockConfig::default())
    }

    /// Gateway that rejects everything.
    pub fn failing(message: impl Into<String>) -> Self {
        Self::new(&MockConfig {
            response: MockResponse::Error {
                message: message.into(),
            },
            latency: Duration::ZERO,
        })
    }

    /// Set simulated latency.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Queue results for the next calls.
    pub fn with_script(self, results: impl IntoIterator<Item = Result<(), GatewayError>>) -> Self {
        self.script.lock().unwrap().extend(results);
        self
    }

    /// Requests received so far.
    pub fn sent(&self) -> Vec<SendRequest> {
        self.sent.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    fn next_message_id(&self) -> String {
        let n = self.message_counter.fetch_add(1, Ordering::Relaxed);
        format!("MOCK{n:08}")
    }

    fn configured_result(&self) -> Result<(), GatewayError> {
        match &self.response {
            MockResponse::Success => Ok(()),
            MockResponse::Error { message } => Err(GatewayError::Rejected(message.clone())),
            MockResponse::Random { error_rate } => {
                let p = f64::from(*error_rate).clamp(0.0, 1.0);
                if rand::thread_rng().gen_bool(p) {
                    Err(GatewayError::Rejected("mock random error".to_string()))
                } else {
                    Ok(())
                }
            }
        }
    }
}

#[async_trait]
impl SendGateway for MockGateway {
    fn name(&self) -> &str {
        "mock"
    }

    async fn send(&self, request: &SendRequest) -> Result<String, GatewayError> {
        self.sent.lock().unwrap().push(request.clone());

        if !self.latency.is_zero() {
            trace!(latency_ms = self.latency.as_millis(), "simulating latency");
            sleep(self.latency).await;
        }

        let scripted = self.script.lock().unwrap().pop_front();
        match scripted.unwrap_or_else(|| self.configured_result()) {
            Ok(()) => {
                let id = self.next_message_id();
                debug!(message_id = %id, destination = %request.destination, "mock send accepted");
                Ok(id)
            }
            Err(e) => {
                debug!(error = %e, destination = %request.destination, "mock send failed");
                Err(e)
            }
        }
    }
}

// =============================================================================
// HTTP
// =============================================================================

/// JSON-over-HTTP provider client.
///
/// POSTs `{"to", "body", "from"}` and reads the provider message ID from
/// `id` or `message_id` in the response.
pub struct HttpGateway {
    endpoint: String,
    api_key: Option<String>,
    client: Client,
}

impl std::fmt::Debug for HttpGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpGateway")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct ProviderResponse {
    id: Option<String>,
    message_id: Option<String>,
}

impl HttpGateway {
    pub fn new(endpoint: &str, api_key: Option<String>) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| anyhow::anyhow!("failed to create HTTP client: {}", e))?;

        Ok(Self {
            endpoint: endpoint.to_string(),
            api_key,
            client,
        })
    }
}

#[async_trait]
impl SendGateway for HttpGateway {
    fn name(&self) -> &str {
        "http"
    }

    async fn send(&self, request: &SendRequest) -> Result<String, GatewayError> {
        let mut builder = self.client.post(&self.endpoint).json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_connect() {
                GatewayError::Transport(format!("connection failed: {}", e))
            } else if e.is_timeout() {
                GatewayError::Timeout
            } else {
                GatewayError::Protocol(format!("request failed: {}", e))
            }
        })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(GatewayError::RateLimited);
        }
        if status.is_server_error() {
            return Err(GatewayError::Transport(format!("server error: {}", status)));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(GatewayError::Rejected(format!("status {}: {}", status, text.trim())));
        }

        let body: ProviderResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Protocol(format!("failed to parse response: {}", e)))?;

        body.id
            .or(body.message_id)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| GatewayError::Protocol("response carries no message id".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req() -> SendRequest {
        SendRequest {
            destination: "+15550001111".into(),
            body: "hi".into(),
            source: "+15559990000".into(),
        }
    }

    #[tokio::test]
    async fn test_mock_success_ids_are_unique() {
        let gw = MockGateway::success();
        let a = gw.send(&req()).await.unwrap();
        let b = gw.send(&req()).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(gw.call_count(), 2);
    }

    #[tokio::test]
    async fn test_mock_script_then_config() {
        let gw = MockGateway::success().with_script([Err(GatewayError::RateLimited), Ok(())]);
        assert_eq!(gw.send(&req()).await, Err(GatewayError::RateLimited));
        assert!(gw.send(&req()).await.is_ok());
        assert!(gw.send(&req()).await.is_ok());
    }

    #[tokio::test]
    async fn test_mock_failing() {
        let gw = MockGateway::failing("invalid number");
        let err = gw.send(&req()).await.unwrap_err();
        assert_eq!(err, GatewayError::Rejected("invalid number".into()));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(GatewayError::RateLimited.is_retryable());
        assert!(GatewayError::Transport("refused".into()).is_retryable());
        assert!(!GatewayError::Timeout.is_retryable());
        assert!(!GatewayError::Protocol("?".into()).is_retryable());
    }

    #[test]
    fn test_request_wire_names() {
        let json = serde_json::to_value(req()).unwrap();
        assert_eq!(json["to"], "+15550001111");
        assert_eq!(json["from"], "+15559990000");
        assert_eq!(json["body"], "hi");
    }

    #[test]
    fn test_create_gateway_requires_endpoint_for_http() {
        let config = GatewayConfig {
            mode: GatewayMode::Http,
            ..Default::default()
        };
        assert!(create_gateway(&config).is_err());
        assert_eq!(create_gateway(&GatewayConfig::default()).unwrap().name(), "mock");
    }
}
