//! # Remote API Client
//!
//! The backend the reader reports to, behind the [`RemoteApi`] trait so the
//! sync, heartbeat and update tasks can be tested without a network.
//!
//! ## Endpoints
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Method  Path                         Used by                           │
//! │  ──────  ───────────────────────────  ──────────────────────────────    │
//! │  POST    {base}/sensor-data           SyncAgent (batches of readings)   │
//! │  POST    {base}/heartbeat             LivenessReporter                  │
//! │  GET     {base}/device/revision       UpdateAgent                       │
//! │  POST    {base}/update-status         UpdateAgent (after a trigger)     │
//! │  GET     {base}/health                startup check                     │
//! │                                                                         │
//! │  Every request: Authorization: Bearer <token>                           │
//! │                 Accept: application/json                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Acknowledgements
//! A 2xx reply to `sensor-data` acknowledges the whole batch, unless its JSON
//! body carries `accepted_ids`, in which case only those ids count. A 2xx
//! body that is not JSON is a decode error and nothing is acknowledged.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

use heitz_core::Reading;

use crate::config::{AgentConfig, ApiConfig};
use crate::error::{AgentError, AgentResult, ApiError};

/// Longest error body kept in `ApiError::Status`.
const MAX_ERROR_BODY: usize = 512;

// =============================================================================
// Trait
// =============================================================================

/// Which readings of a posted batch the backend accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckSet {
    /// Every reading in the batch.
    All,
    /// Only these ids.
    Only(BTreeSet<i64>),
}

impl AckSet {
    /// Returns the ids of `batch` that were acknowledged, in batch order.
    ///
    /// Ids the backend names that were not in the batch are ignored.
    pub fn acknowledged(&self, batch: &[i64]) -> Vec<i64> {
        match self {
            AckSet::All => batch.to_vec(),
            AckSet::Only(ids) => batch.iter().copied().filter(|id| ids.contains(id)).collect(),
        }
    }
}

/// Outcome of an update attempt, reported to the backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateStatus {
    pub success: bool,
    pub version: Option<String>,
    pub error: Option<String>,
}

impl UpdateStatus {
    pub fn succeeded(version: impl Into<String>) -> Self {
        UpdateStatus {
            success: true,
            version: Some(version.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        UpdateStatus {
            success: false,
            version: None,
            error: Some(error.into()),
        }
    }
}

/// The backend, as seen by the periodic tasks.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Submits a batch of readings.
    async fn post_readings(&self, readings: &[Reading]) -> Result<AckSet, ApiError>;

    /// Reports that this device is alive.
    async fn post_heartbeat(&self) -> Result<(), ApiError>;

    /// Returns the revision this device should be running.
    async fn latest_revision(&self) -> Result<String, ApiError>;

    /// Reports the outcome of an update attempt.
    async fn report_update_status(&self, status: &UpdateStatus) -> Result<(), ApiError>;

    /// Checks the backend is reachable.
    async fn health_check(&self) -> Result<(), ApiError>;
}

// =============================================================================
// Wire Types
// =============================================================================

#[derive(Debug, Serialize)]
struct SensorDataRequest<'a> {
    device_id: &'a str,
    batch_id: Uuid,
    readings: Vec<ReadingPayload<'a>>,
}

#[derive(Debug, Serialize)]
struct ReadingPayload<'a> {
    id: i64,
    timestamp: DateTime<Utc>,
    sensor_name: &'a str,
    value: Option<f64>,
    unit: &'a str,
    error: Option<&'a str>,
    priority_array: Option<&'a [Option<f64>]>,
    active_priority: Option<u8>,
}

impl<'a> From<&'a Reading> for ReadingPayload<'a> {
    fn from(reading: &'a Reading) -> Self {
        ReadingPayload {
            id: reading.id,
            timestamp: reading.timestamp,
            sensor_name: &reading.point_name,
            value: reading.value,
            unit: &reading.unit,
            error: reading.error.as_deref(),
            priority_array: reading.priority_array.as_deref(),
            active_priority: reading.active_priority,
        }
    }
}

#[derive(Debug, Serialize)]
struct HeartbeatRequest<'a> {
    device_id: &'a str,
    status: &'static str,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct UpdateStatusRequest<'a> {
    device_id: &'a str,
    #[serde(flatten)]
    status: &'a UpdateStatus,
}

#[derive(Debug, Deserialize)]
struct RevisionResponse {
    #[serde(default, alias = "target_version", alias = "version")]
    revision: Option<String>,
}

/// Interprets a 2xx `sensor-data` body.
fn parse_ack(body: &[u8]) -> Result<AckSet, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(AckSet::All);
    }

    let value: serde_json::Value = serde_json::from_slice(body)?;
    match value.get("accepted_ids") {
        None | Some(serde_json::Value::Null) => Ok(AckSet::All),
        Some(ids) => {
            let ids: Vec<i64> = serde_json::from_value(ids.clone())?;
            Ok(AckSet::Only(ids.into_iter().collect()))
        }
    }
}

// =============================================================================
// HTTP Client
// =============================================================================

/// [`RemoteApi`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpApiClient {
    http: reqwest::Client,
    base: Url,
    device_id: String,
}

impl HttpApiClient {
    /// Creates a client for the configured backend.
    pub fn from_config(config: &AgentConfig) -> AgentResult<Self> {
        Self::new(&config.api, config.device_id())
    }

    /// Creates a client.
    ///
    /// ## Arguments
    /// * `api` - Base URL, token and request timeout
    /// * `device_id` - Sent in every request body
    ///
    /// ## Errors
    /// An unparsable base URL, or a token that is not a valid header value.
    pub fn new(api: &ApiConfig, device_id: impl Into<String>) -> AgentResult<Self> {
        let base = api.base_url()?;

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if !api.token.is_empty() {
            let mut bearer = HeaderValue::from_str(&format!("Bearer {}", api.token))
                .map_err(|_| AgentError::InvalidConfig("api.token contains invalid characters".into()))?;
            bearer.set_sensitive(true);
            headers.insert(AUTHORIZATION, bearer);
        }

        let http = reqwest::Client::builder()
            .timeout(api.request_timeout())
            .default_headers(headers)
            .build()
            .map_err(ApiError::from)?;

        Ok(HttpApiClient {
            http,
            base,
            device_id: device_id.into(),
        })
    }

    /// Base URL every endpoint is joined onto.
    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        self.base
            .join(path)
            .map_err(|e| ApiError::Transport(format!("invalid endpoint {}: {}", path, e)))
    }
}

/// Turns a non-2xx response into `ApiError::Status`.
async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(ApiError::Status {
        status: status.as_u16(),
        body: body.chars().take(MAX_ERROR_BODY).collect(),
    })
}

#[async_trait]
impl RemoteApi for HttpApiClient {
    async fn post_readings(&self, readings: &[Reading]) -> Result<AckSet, ApiError> {
        let request = SensorDataRequest {
            device_id: &self.device_id,
            batch_id: Uuid::new_v4(),
            readings: readings.iter().map(ReadingPayload::from).collect(),
        };

        debug!(
            batch_id = %request.batch_id,
            count = readings.len(),
            "Posting readings"
        );

        let response = self
            .http
            .post(self.endpoint("sensor-data")?)
            .json(&request)
            .send()
            .await?;
        let body = ensure_success(response).await?.bytes().await?;

        parse_ack(&body)
    }

    async fn post_heartbeat(&self) -> Result<(), ApiError> {
        let request = HeartbeatRequest {
            device_id: &self.device_id,
            status: "alive",
            timestamp: Utc::now(),
        };

        let response = self
            .http
            .post(self.endpoint("heartbeat")?)
            .json(&request)
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }

    async fn latest_revision(&self) -> Result<String, ApiError> {
        let response = self
            .http
            .get(self.endpoint("device/revision")?)
            .query(&[("device_id", self.device_id.as_str())])
            .send()
            .await?;
        let body = ensure_success(response).await?.bytes().await?;

        let parsed: RevisionResponse = serde_json::from_slice(&body)?;
        parsed
            .revision
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .ok_or_else(|| ApiError::Decode("response has no revision".into()))
    }

    async fn report_update_status(&self, status: &UpdateStatus) -> Result<(), ApiError> {
        let request = UpdateStatusRequest {
            device_id: &self.device_id,
            status,
        };

        let response = self
            .http
            .post(self.endpoint("update-status")?)
            .json(&request)
            .send()
            .await?;
        ensure_success(response).await?;

        info!(success = status.success, "Reported update status");
        Ok(())
    }

    async fn health_check(&self) -> Result<(), ApiError> {
        let response = self.http.get(self.endpoint("health")?).send().await?;
        ensure_success(response).await?;
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
