//! Delivery targets for events.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use shadowsync_events::Event;
use shadowsync_id::TenantId;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::integrations::Credentials;

/// Header carrying the owning tenant.
pub const TENANT_HEADER: &str = "X-Shadowsync-Tenant";

/// Header carrying the event ID. Delivery is at-least-once; receivers
/// deduplicate on this value.
pub const EVENT_ID_HEADER: &str = "X-Shadowsync-Event-Id";

/// Longest response body kept in an error message.
const MAX_ERROR_BODY: usize = 512;

/// Delivery failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SinkError {
    #[error("delivery timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("sink responded {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// A downstream consumer of events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Hands one event to the consumer. `Ok` means it was accepted.
    async fn send(&self, tenant: &TenantId, event: &Event) -> Result<(), SinkError>;
}

/// Posts events as JSON to an HTTP endpoint.
#[derive(Clone)]
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
    secret: Option<String>,
}

impl std::fmt::Debug for WebhookSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookSink")
            .field("url", &self.url)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl WebhookSink {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            secret: None,
        }
    }

    /// Sends `secret` as a bearer token with every request.
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    /// Builds a sink from webhook credentials; other credential kinds yield
    /// `None`.
    pub fn from_credentials(client: reqwest::Client, credentials: &Credentials) -> Option<Self> {
        match credentials {
            Credentials::Webhook { url, secret } => Some(Self {
                client,
                url: url.clone(),
                secret: secret.clone(),
            }),
            _ => None,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl EventSink for WebhookSink {
    async fn send(&self, tenant: &TenantId, event: &Event) -> Result<(), SinkError> {
        let mut request = self
            .client
            .post(&self.url)
            .header(TENANT_HEADER, tenant.as_str())
            .header(EVENT_ID_HEADER, event.id.to_string())
            .json(event);
        if let Some(secret) = &self.secret {
            request = request.bearer_auth(secret);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                SinkError::Timeout
            } else {
                SinkError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        if status.is_success() {
            debug!(event_id = %event.id, status = status.as_u16(), "Webhook accepted event");
            return Ok(());
        }

        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        Err(SinkError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

#[derive(Default)]
struct Recording {
    delivered: Vec<Event>,
    attempts: usize,
    failures: VecDeque<SinkError>,
    failing: bool,
}

/// Sink that keeps accepted events in memory.
///
/// Failures can be queued one at a time, or the sink can be switched to
/// reject everything.
#[derive(Clone, Default)]
pub struct RecordingSink {
    state: Arc<Mutex<Recording>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink that rejects every event.
    pub fn failing() -> Self {
        Self {
            state: Arc::new(Mutex::new(Recording {
                failing: true,
                ..Recording::default()
            })),
        }
    }

    pub async fn set_failing(&self, failing: bool) {
        self.state.lock().await.failing = failing;
    }

    /// Queues an error for the next send.
    pub async fn fail_next(&self, err: SinkError) {
        self.state.lock().await.failures.push_back(err);
    }

    /// Events accepted so far, in delivery order.
    pub async fn delivered(&self) -> Vec<Event> {
        self.state.lock().await.delivered.clone()
    }

    /// Number of send calls, including failed ones.
    pub async fn attempts(&self) -> usize {
        self.state.lock().await.attempts
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn send(&self, _tenant: &TenantId, event: &Event) -> Result<(), SinkError> {
        let mut state = self.state.lock().await;
        state.attempts += 1;
        if let Some(err) = state.failures.pop_front() {
            return Err(err);
        }
        if state.failing {
            return Err(SinkError::Transport("sink configured to fail".to_string()));
        }
        state.delivered.push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use shadowsync_events::{DeliveryState, EventData};
    use shadowsync_id::{DeviceId, EventId};
    use wiremock::matchers::{header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn tenant() -> TenantId {
        TenantId::parse("t1").unwrap()
    }

    fn event() -> Event {
        let now = Utc::now();
        Event {
            id: EventId::new(),
            tenant_id: tenant(),
            data: EventData::provisioned(DeviceId::parse("foo").unwrap()),
            event_ts: now,
            expire_ts: now + Duration::days(7),
            delivery: DeliveryState::pending(),
        }
    }

    #[tokio::test]
    async fn test_webhook_posts_event() {
        let server = MockServer::start().await;
        let event = event();

        Mock::given(method("POST"))
            .and(path("/hooks/devices"))
            .and(header(TENANT_HEADER, "t1"))
            .and(header(EVENT_ID_HEADER, event.id.to_string().as_str()))
            .and(header("authorization", "Bearer s3cret"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let sink = WebhookSink::new(
            reqwest::Client::new(),
            format!("{}/hooks/devices", server.uri()),
        )
        .with_secret("s3cret");

        sink.send(&tenant(), &event).await.unwrap();
    }

    #[tokio::test]
    async fn test_webhook_non_success_is_rejected() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(header_exists(EVENT_ID_HEADER))
            .respond_with(ResponseTemplate::new(503).set_body_string("try later"))
            .mount(&server)
            .await;

        let sink = WebhookSink::new(reqwest::Client::new(), server.uri());
        let err = sink.send(&tenant(), &event()).await.unwrap_err();
        assert_eq!(
            err,
            SinkError::Rejected {
                status: 503,
                body: "try later".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_webhook_unreachable_is_transport_error() {
        let sink = WebhookSink::new(reqwest::Client::new(), "http://127.0.0.1:1/unreachable");
        let err = sink.send(&tenant(), &event()).await.unwrap_err();
        assert!(matches!(err, SinkError::Transport(_)));
    }

    #[test]
    fn test_from_credentials() {
        let webhook = Credentials::Webhook {
            url: "http://sink.local/events".to_string(),
            secret: Some("s3cret".to_string()),
        };
        let sink = WebhookSink::from_credentials(reqwest::Client::new(), &webhook).unwrap();
        assert_eq!(sink.url(), "http://sink.local/events");
        assert!(!format!("{sink:?}").contains("s3cret"));

        let hub = Credentials::ConnectionString {
            connection_string: "HostName=h".to_string(),
        };
        assert!(WebhookSink::from_credentials(reqwest::Client::new(), &hub).is_none());
    }

    #[tokio::test]
    async fn test_recording_sink() {
        let sink = RecordingSink::new();
        sink.fail_next(SinkError::Timeout).await;

        assert_eq!(sink.send(&tenant(), &event()).await, Err(SinkError::Timeout));
        sink.send(&tenant(), &event()).await.unwrap();
        assert_eq!(sink.attempts().await, 2);
        assert_eq!(sink.delivered().await.len(), 1);

        let failing = RecordingSink::failing();
        assert!(failing.send(&tenant(), &event()).await.is_err());
    }
}
