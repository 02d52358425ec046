//! HTTP shadow bridge client.
//!
//! Speaks a small JSON protocol to a bridge service that owns the provider
//! connections. Every call is a `POST` carrying the integration credentials
//! and the device ID; the bridge answers with the normalized shapes from
//! [`super`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header::RETRY_AFTER, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use shadowsync_events::DeviceStatus;
use shadowsync_id::DeviceId;
use shadowsync_reconcile::{Fields, SyncPolicy};
use tracing::debug;

use super::{
    DeviceUpsert, ShadowClient, ShadowError, ShadowPatch, ShadowResult, ShadowSnapshot,
    UpsertedDevice,
};
use crate::integrations::Credentials;

const MAX_ERROR_BODY: usize = 512;

#[derive(Serialize)]
struct DeviceRequest<'a> {
    credentials: &'a Credentials,
    device_id: &'a DeviceId,
}

#[derive(Serialize)]
struct UpsertRequest<'a> {
    credentials: &'a Credentials,
    device_id: &'a DeviceId,
    status: DeviceStatus,
    enabled: bool,
    desired: &'a Fields,
    policy: &'a SyncPolicy,
}

#[derive(Serialize)]
struct PatchRequest<'a> {
    credentials: &'a Credentials,
    device_id: &'a DeviceId,
    #[serde(flatten)]
    patch: &'a ShadowPatch,
}

/// [`ShadowClient`] backed by an HTTP shadow bridge.
#[derive(Debug, Clone)]
pub struct HttpShadowClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpShadowClient {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post<B: Serialize>(&self, route: &str, body: &B) -> ShadowResult<Response> {
        let url = format!("{}/v1/{route}", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ShadowError::Timeout
                } else {
                    ShadowError::Unavailable(e.to_string())
                }
            })?;

        let status = response.status();
        debug!(route, status = status.as_u16(), "Shadow bridge responded");
        if status.is_success() {
            return Ok(response);
        }
        Err(error_from_response(response).await)
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        route: &str,
        body: &B,
    ) -> ShadowResult<T> {
        self.post(route, body)
            .await?
            .json()
            .await
            .map_err(|e| ShadowError::Unavailable(format!("malformed bridge response: {e}")))
    }
}

async fn error_from_response(response: Response) -> ShadowError {
    let status = response.status();
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);

    let mut body = response.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    let detail = if body.is_empty() {
        status.to_string()
    } else {
        body
    };

    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ShadowError::Timeout,
        StatusCode::TOO_MANY_REQUESTS => ShadowError::Throttled { retry_after },
        StatusCode::NOT_FOUND => ShadowError::NotFound(detail),
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => ShadowError::Conflict(detail),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ShadowError::Unauthorized(detail),
        s if s.is_server_error() => ShadowError::Unavailable(format!("{}: {detail}", s.as_u16())),
        _ => ShadowError::Rejected(detail),
    }
}

#[async_trait]
impl ShadowClient for HttpShadowClient {
    async fn upsert_device(
        &self,
        credentials: &Credentials,
        device_id: &DeviceId,
        state: &DeviceUpsert,
        policy: &SyncPolicy,
    ) -> ShadowResult<UpsertedDevice> {
        let body = UpsertRequest {
            credentials,
            device_id,
            status: state.status,
            enabled: state.status.is_enabled(),
            desired: &state.desired,
            policy,
        };
        self.post_json("devices/upsert", &body).await
    }

    async fn delete_device(
        &self,
        credentials: &Credentials,
        device_id: &DeviceId,
    ) -> ShadowResult<()> {
        let body = DeviceRequest {
            credentials,
            device_id,
        };
        self.post("devices/delete", &body).await.map(|_| ())
    }

    async fn get_device_shadow(
        &self,
        credentials: &Credentials,
        device_id: &DeviceId,
    ) -> ShadowResult<ShadowSnapshot> {
        let body = DeviceRequest {
            credentials,
            device_id,
        };
        self.post_json("shadows/get", &body).await
    }

    async fn update_device_shadow(
        &self,
        credentials: &Credentials,
        device_id: &DeviceId,
        patch: &ShadowPatch,
    ) -> ShadowResult<ShadowSnapshot> {
        let body = PatchRequest {
            credentials,
            device_id,
            patch,
        };
        self.post_json("shadows/update", &body).await
    }
}
