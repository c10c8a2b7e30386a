//! REST adapter for a hosted container platform.
//!
//! ```text
//! POST {base}/containers                  create   → 201 {containerId, metroUrl, …}
//! POST {base}/containers/{id}/start       start    → {status}
//! POST {base}/containers/{id}/stop        stop     → 204
//! GET  {base}/containers/{id}             status   → {status, resourceUsage, …}
//! GET  {base}/containers/{id}/logs        logs     → {logs, hasMore, nextCursor}
//! GET  {base}/containers?label=…          list     → {containers: […]}
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use preview_core::config::ProviderConfig;
use preview_core::container::ProvisionedIds;
use preview_core::types::ResourceUsage;
use reqwest::{RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use crate::client::ContainerClient;
use crate::error::ProviderError;
use crate::types::{
    parse_status, ContainerSpec, CreateOutcome, LogLine, LogPage, LogQuery, ProviderContainer,
    StartReport, StatusReport, TASK_LABEL,
};

/// Per-operation timeouts. Mutating calls are short and strict; reads are
/// looser.
#[derive(Debug, Clone, Copy)]
pub struct HttpTimeouts {
    pub create: Duration,
    pub request: Duration,
    pub status: Duration,
    pub logs: Duration,
}

impl HttpTimeouts {
    pub fn from_config(cfg: &ProviderConfig) -> Self {
        Self {
            create: Duration::from_secs(cfg.create_timeout_secs),
            request: Duration::from_secs(cfg.request_timeout_secs),
            status: Duration::from_secs(cfg.status_timeout_secs),
            logs: Duration::from_secs(cfg.logs_timeout_secs),
        }
    }
}

pub struct HttpContainerClient {
    http: reqwest::Client,
    base: Url,
    token: Option<String>,
    timeouts: HttpTimeouts,
}

impl HttpContainerClient {
    pub fn new(
        base_url: &str,
        token: Option<String>,
        timeouts: HttpTimeouts,
    ) -> Result<Self, ProviderError> {
        let base = Url::parse(base_url)
            .map_err(|e| ProviderError::InvalidResponse(format!("bad base URL '{base_url}': {e}")))?;
        if base.cannot_be_a_base() {
            return Err(ProviderError::InvalidResponse(format!(
                "base URL '{base_url}' cannot carry a path"
            )));
        }
        let http = reqwest::Client::builder()
            .user_agent(concat!("preview/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProviderError::Network(e.to_string()))?;
        Ok(Self {
            http,
            base,
            token,
            timeouts,
        })
    }

    pub fn from_config(cfg: &ProviderConfig) -> Result<Self, ProviderError> {
        let base = cfg.base_url.as_deref().ok_or_else(|| {
            ProviderError::InvalidResponse("provider.base_url is required for the http provider".into())
        })?;
        Self::new(base, cfg.token.clone(), HttpTimeouts::from_config(cfg))
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn authed(&self, req: RequestBuilder, timeout: Duration) -> RequestBuilder {
        let req = req.timeout(timeout);
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn send(&self, req: RequestBuilder, timeout: Duration) -> Result<Response, ProviderError> {
        let resp = req.send().await.map_err(|e| classify_send_error(e, timeout))?;
        if resp.status().is_success() {
            Ok(resp)
        } else {
            Err(error_from_response(resp).await)
        }
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedBody {
    container_id: String,
    metro_url: String,
    #[serde(default)]
    project_id: Option<String>,
    #[serde(default)]
    service_id: Option<String>,
}

#[derive(Deserialize)]
struct StartBody {
    status: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusBody {
    status: String,
    #[serde(default)]
    resource_usage: Option<ResourceUsage>,
    #[serde(default)]
    uptime_seconds: Option<u64>,
    #[serde(default)]
    last_activity_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogsBody {
    #[serde(default)]
    logs: Vec<LogLine>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Deserialize)]
struct ListBody {
    #[serde(default)]
    containers: Vec<ListedContainer>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListedContainer {
    #[serde(alias = "id")]
    container_id: String,
    status: String,
    #[serde(default)]
    labels: BTreeMap<String, String>,
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn classify_send_error(e: reqwest::Error, timeout: Duration) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout(timeout)
    } else {
        ProviderError::Network(e.to_string())
    }
}

fn map_status(status: StatusCode, message: String) -> ProviderError {
    match status.as_u16() {
        401 | 403 => ProviderError::Unauthorized(message),
        402 | 429 => ProviderError::QuotaExceeded(message),
        404 => ProviderError::NotFound(message),
        s @ 400..=499 => ProviderError::Rejected { status: s, message },
        s => ProviderError::Http { status: s, message },
    }
}

async fn error_from_response(resp: Response) -> ProviderError {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    let mut message: String = body.chars().take(200).collect();
    if message.is_empty() {
        message = status.to_string();
    }
    map_status(status, message)
}

async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T, ProviderError> {
    let bytes = resp
        .bytes()
        .await
        .map_err(|e| ProviderError::Network(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| ProviderError::InvalidResponse(e.to_string()))
}

// ---------------------------------------------------------------------------
// ContainerClient
// ---------------------------------------------------------------------------

#[async_trait]
impl ContainerClient for HttpContainerClient {
    async fn create_container(&self, spec: &ContainerSpec) -> CreateOutcome {
        let timeout = self.timeouts.create;
        let req = self.authed(self.http.post(self.endpoint(&["containers"])), timeout);
        let resp = match req.json(spec).send().await {
            Ok(resp) => resp,
            // Never reached the provider: nothing was created.
            Err(e) if e.is_connect() => {
                return CreateOutcome::Failed(ProviderError::Network(e.to_string()))
            }
            Err(e) if e.is_timeout() => {
                return CreateOutcome::Ambiguous {
                    reason: format!("create timed out after {timeout:?}"),
                }
            }
            Err(e) => {
                return CreateOutcome::Ambiguous {
                    reason: format!("connection lost after create was sent: {e}"),
                }
            }
        };

        let status = resp.status();
        if matches!(status.as_u16(), 502..=504) {
            return CreateOutcome::Ambiguous {
                reason: format!("gateway error {status} on create"),
            };
        }
        if !status.is_success() {
            return CreateOutcome::Failed(error_from_response(resp).await);
        }

        match decode::<CreatedBody>(resp).await {
            Ok(body) => {
                debug!(task_id = %spec.task_id, container_id = %body.container_id, "provider created container");
                CreateOutcome::Created(ProvisionedIds {
                    container_id: body.container_id,
                    metro_url: body.metro_url,
                    project_id: body.project_id,
                    service_id: body.service_id,
                })
            }
            // The provider accepted the request; the container may exist.
            Err(e) => CreateOutcome::Ambiguous {
                reason: format!("unreadable create response: {e}"),
            },
        }
    }

    async fn start_container(&self, container_id: &str) -> Result<StartReport, ProviderError> {
        let timeout = self.timeouts.request;
        let req = self.authed(
            self.http.post(self.endpoint(&["containers", container_id, "start"])),
            timeout,
        );
        let body: StartBody = decode(self.send(req, timeout).await?).await?;
        Ok(StartReport {
            status: parse_status(&body.status)?,
        })
    }

    async fn stop_container(&self, container_id: &str) -> Result<(), ProviderError> {
        let timeout = self.timeouts.request;
        let req = self.authed(
            self.http.post(self.endpoint(&["containers", container_id, "stop"])),
            timeout,
        );
        self.send(req, timeout).await?;
        Ok(())
    }

    async fn get_container_status(
        &self,
        container_id: &str,
    ) -> Result<StatusReport, ProviderError> {
        let timeout = self.timeouts.status;
        let req = self.authed(
            self.http.get(self.endpoint(&["containers", container_id])),
            timeout,
        );
        let body: StatusBody = decode(self.send(req, timeout).await?).await?;
        Ok(StatusReport {
            status: parse_status(&body.status)?,
            resource_usage: body.resource_usage,
            uptime_seconds: body.uptime_seconds,
            last_activity_at: body.last_activity_at,
        })
    }

    async fn get_container_logs(
        &self,
        container_id: &str,
        query: &LogQuery,
    ) -> Result<LogPage, ProviderError> {
        let timeout = self.timeouts.logs;
        let mut params: Vec<(&str, String)> = Vec::new();
        if let Some(limit) = query.limit {
            params.push(("limit", limit.to_string()));
        }
        if let Some(cursor) = &query.cursor {
            params.push(("cursor", cursor.clone()));
        }
        let req = self.authed(
            self.http
                .get(self.endpoint(&["containers", container_id, "logs"]))
                .query(&params),
            timeout,
        );
        let body: LogsBody = decode(self.send(req, timeout).await?).await?;
        Ok(LogPage {
            logs: body.logs,
            has_more: body.has_more,
            next_cursor: body.next_cursor,
        })
    }

    async fn list_containers(&self) -> Result<Vec<ProviderContainer>, ProviderError> {
        let timeout = self.timeouts.status;
        let req = self.authed(
            self.http
                .get(self.endpoint(&["containers"]))
                .query(&[("label", TASK_LABEL)]),
            timeout,
        );
        let body: ListBody = decode(self.send(req, timeout).await?).await?;
        let mut result = Vec::with_capacity(body.containers.len());
        for c in body.containers {
            let status = match parse_status(&c.status) {
                Ok(s) => Some(s),
                Err(e) => {
                    debug!(container_id = %c.container_id, error = %e, "listed container has unknown status");
                    None
                }
            };
            result.push(ProviderContainer {
                task_id: c.labels.get(TASK_LABEL).cloned(),
                container_id: c.container_id,
                status,
            });
        }
        Ok(result)
    }
}
