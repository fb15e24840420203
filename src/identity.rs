//! Device -> Device User resolution against the core API.
//!
//! The vital records in the store are keyed by device user, not by device, so
//! every run first exchanges the emulator's device type/id for that id.

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::CoreApiConfig;
use crate::error::ReconcileError;
use crate::summary::DeviceRef;

/// Resolved backend identity (device user id) used to filter vital records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Subject(String);

impl Subject {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Subject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, device: &DeviceRef) -> Result<Subject, ReconcileError>;
}

#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Deserialize)]
struct IssuedToken {
    access_token: String,
}

#[derive(Deserialize)]
struct DeviceUser {
    device_user_id: Option<String>,
}

#[derive(Serialize)]
struct IssueRequest<'a> {
    client_id: &'a str,
    client_secret: &'a str,
}

/// Core API client: issues a client-credentials token, then looks the device up.
pub struct CoreApiResolver {
    client: Client,
    base_url: Url,
    client_id: String,
    client_secret: String,
}

impl CoreApiResolver {
    pub fn new(config: &CoreApiConfig) -> Result<Self, ReconcileError> {
        config.validate()?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| ReconcileError::Config(format!("failed to build core API client: {}", e)))?;
        let base_url = Url::parse(&config.url)
            .map_err(|e| ReconcileError::Config(format!("core API url '{}': {}", config.url, e)))?;

        Ok(Self {
            client,
            base_url,
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
        })
    }

    /// Appends `segments` to the base URL, percent-encoding each one so a
    /// value can never leave its own path segment.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, ReconcileError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                ReconcileError::Config(format!("core API url cannot be a base: {}", self.base_url))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn device_user_url(&self, device: &DeviceRef) -> Result<Url, ReconcileError> {
        for value in [&device.device_type, &device.device_id] {
            // Dot segments are dropped by the URL builder, which would shift the path.
            if matches!(value.trim(), "" | "." | "..") {
                return Err(ReconcileError::Resolution(format!(
                    "invalid device reference {}",
                    device
                )));
            }
        }
        self.endpoint(&[
            "api",
            "v1",
            "devices",
            "types",
            &device.device_type,
            "id",
            &device.device_id,
            "device-user",
        ])
    }

    async fn issue_token(&self) -> Result<String, ReconcileError> {
        let resp = self
            .client
            .post(self.endpoint(&["api", "v1", "auth", "issue"])?)
            .json(&IssueRequest {
                client_id: &self.client_id,
                client_secret: &self.client_secret,
            })
            .send()
            .await
            .map_err(|e| ReconcileError::from_request("POST /api/v1/auth/issue", e))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(status_error("POST /api/v1/auth/issue", status, &text));
        }

        let issued = resp
            .json::<Envelope<IssuedToken>>()
            .await
            .map_err(|e| ReconcileError::Transport(format!("bad token response: {}", e)))?;
        Ok(issued.data.access_token)
    }
}

#[async_trait]
impl IdentityResolver for CoreApiResolver {
    async fn resolve(&self, device: &DeviceRef) -> Result<Subject, ReconcileError> {
        let url = self.device_user_url(device)?;
        let token = self.issue_token().await?;
        debug!("Issued core API token");

        let path = format!("GET {}", url.path());
        let resp = self
            .client
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| ReconcileError::from_request(&path, e))?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ReconcileError::Resolution(format!(
                "no device user for device {}",
                device
            )));
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(status_error(&path, status, &text));
        }

        let user = resp
            .json::<Envelope<DeviceUser>>()
            .await
            .map_err(|e| ReconcileError::Transport(format!("bad device-user response: {}", e)))?;

        match user.data.device_user_id {
            Some(id) if !id.trim().is_empty() => {
                info!(device = %device, device_user_id = %id, "Resolved device user");
                Ok(Subject::new(id))
            }
            _ => Err(ReconcileError::Resolution(format!(
                "device user id missing in response for device {}",
                device
            ))),
        }
    }
}

fn status_error(context: &str, status: StatusCode, body: &str) -> ReconcileError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ReconcileError::Auth(format!("{} {}: {}", context, status, body))
        }
        _ => ReconcileError::Transport(format!("{} {}: {}", context, status, body)),
    }
}
