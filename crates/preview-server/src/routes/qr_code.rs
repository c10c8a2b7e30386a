//! QR connection artifacts for a task's Metro bundler.
//!
//! POST order: auth (middleware) → rate limit → task lookup → bundler URL →
//! cache → generate. Generation failures are answered with the plain URL so
//! the client can still show it as text, and are never cached.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use preview_core::qr::{
    generate_qr_code, CacheKey, ErrorCorrection, QrArtifact, QrFormat, QrOptions,
};
use preview_core::rate_limit::RateLimitDecision;
use serde::{Deserialize, Serialize};

use super::with_store;
use crate::auth::Session;
use crate::error::AppError;
use crate::state::AppState;

const NO_BUNDLER_URL: &str =
    "no bundler URL for this task; start the mobile preview before requesting a QR code";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QrCodeBody {
    pub size: Option<u32>,
    pub format: Option<String>,
    pub error_correction_level: Option<String>,
    pub margin: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct QrCodeParams {
    pub format: Option<String>,
    pub size: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QrCodeResponse {
    pub cached: bool,
    #[serde(flatten)]
    pub artifact: QrArtifact,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn rate_limit_headers(resp: &mut Response, d: &RateLimitDecision) {
    let headers = resp.headers_mut();
    headers.insert("x-ratelimit-limit", HeaderValue::from(d.limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(d.remaining));
    headers.insert("x-ratelimit-reset", HeaderValue::from(d.reset_in));
}

fn rate_limited(d: &RateLimitDecision) -> Response {
    let body = serde_json::json!({
        "error": "rate limit exceeded",
        "resetIn": d.reset_in,
    });
    let mut resp = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    rate_limit_headers(&mut resp, d);
    resp.headers_mut()
        .insert("retry-after", HeaderValue::from(d.reset_in));
    resp
}

/// Bundler URL for a visible task: the active container's Metro URL, else
/// the task's own sandbox URL.
async fn resolve_bundler_url(
    app: &AppState,
    task_id: String,
    session: &Session,
) -> Result<String, AppError> {
    let (user, admin) = (session.user_id.clone(), session.admin);
    let url = with_store(app, move |s| {
        let task = s.find_task(&task_id, &user, admin)?;
        let active = s.active_container_for_task(&task.id)?;
        Ok(active.map(|c| c.metro_url).or(task.sandbox_url))
    })
    .await?;
    url.filter(|u| !u.is_empty())
        .ok_or_else(|| AppError::bad_request(NO_BUNDLER_URL))
}

fn options_from(body: QrCodeBody, default_size: u32) -> Result<QrOptions, AppError> {
    let mut opts = QrOptions {
        size: body.size.unwrap_or(default_size),
        ..QrOptions::default()
    };
    if let Some(f) = body.format {
        opts.format = f.parse::<QrFormat>().map_err(AppError::bad_request)?;
    }
    if let Some(l) = body.error_correction_level {
        opts.error_correction = l.parse::<ErrorCorrection>().map_err(AppError::bad_request)?;
    }
    if let Some(m) = body.margin {
        opts.margin = m;
    }
    Ok(opts)
}

/// A hit is only usable if it encodes the current URL with the requested
/// options; the key alone does not cover them.
fn matches(hit: &QrArtifact, url: &str, opts: &QrOptions) -> bool {
    hit.is_ok()
        && hit.url == url
        && hit.error_correction_level == opts.error_correction
        && hit.margin == opts.margin
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// POST /api/tasks/:task_id/qr-code
pub async fn generate(
    State(app): State<AppState>,
    Extension(session): Extension<Session>,
    Path(task_id): Path<String>,
    body: Bytes,
) -> Result<Response, AppError> {
    let decision = app.rate_limiter.check(&session.user_id);
    if !decision.allowed {
        tracing::info!(user_id = %session.user_id, task_id = %task_id, "QR request rate limited");
        return Ok(rate_limited(&decision));
    }

    let url = resolve_bundler_url(&app, task_id.clone(), &session).await?;

    let body: QrCodeBody = if body.iter().all(u8::is_ascii_whitespace) {
        QrCodeBody::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| AppError::bad_request(format!("invalid request body: {e}")))?
    };
    let opts = options_from(body, app.config.qr.default_size)?;
    let key = CacheKey::new(&task_id, opts.format, opts.size);

    if let Some(hit) = app.qr_cache.get(&key) {
        if matches(&hit, &url, &opts) {
            let mut resp = Json(QrCodeResponse {
                cached: true,
                artifact: hit,
            })
            .into_response();
            rate_limit_headers(&mut resp, &decision);
            return Ok(resp);
        }
    }

    let artifact = generate_qr_code(&url, &opts);
    if let Some(error) = &artifact.error {
        tracing::warn!(task_id = %task_id, url = %url, error = %error, "QR generation failed");
        let body = serde_json::json!({ "error": error, "url": url });
        let mut resp = (StatusCode::UNPROCESSABLE_ENTITY, Json(body)).into_response();
        rate_limit_headers(&mut resp, &decision);
        return Ok(resp);
    }

    app.qr_cache
        .set(key, artifact.clone(), app.config.qr.cache_ttl());
    let mut resp = Json(QrCodeResponse {
        cached: false,
        artifact,
    })
    .into_response();
    rate_limit_headers(&mut resp, &decision);
    Ok(resp)
}

/// GET /api/tasks/:task_id/qr-code?format=&size=: Cached artifact only.
pub async fn get_cached(
    State(app): State<AppState>,
    Extension(session): Extension<Session>,
    Path(task_id): Path<String>,
    Query(params): Query<QrCodeParams>,
) -> Result<Json<QrCodeResponse>, AppError> {
    let (tid, user, admin) = (task_id.clone(), session.user_id.clone(), session.admin);
    with_store(&app, move |s| s.find_task(&tid, &user, admin)).await?;

    let format = match params.format {
        Some(f) => f.parse::<QrFormat>().map_err(AppError::bad_request)?,
        None => QrFormat::Svg,
    };
    let size = params.size.unwrap_or(app.config.qr.default_size);
    app.qr_cache
        .get(&CacheKey::new(&task_id, format, size))
        .map(|artifact| {
            Json(QrCodeResponse {
                cached: true,
                artifact,
            })
        })
        .ok_or_else(|| AppError::not_found(format!("no cached QR code for task {task_id}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_default_and_parse() {
        let opts = options_from(QrCodeBody::default(), 256).unwrap();
        assert_eq!(opts, QrOptions::default());

        let opts = options_from(
            QrCodeBody {
                size: Some(512),
                format: Some("png".into()),
                error_correction_level: Some("H".into()),
                margin: Some(2),
            },
            256,
        )
        .unwrap();
        assert_eq!(opts.size, 512);
        assert_eq!(opts.format, QrFormat::Png);
        assert_eq!(opts.error_correction, ErrorCorrection::H);
        assert_eq!(opts.margin, 2);
    }

    #[test]
    fn bad_format_is_rejected() {
        let body = QrCodeBody {
            format: Some("gif".into()),
            ..QrCodeBody::default()
        };
        assert!(options_from(body, 256).is_err());
    }

    #[test]
    fn hit_for_old_url_does_not_match() {
        let opts = QrOptions::default();
        let art = generate_qr_code("https://old.up.railway.app", &opts);
        assert!(matches(&art, "https://old.up.railway.app", &opts));
        assert!(!matches(&art, "https://new.up.railway.app", &opts));
        let h = QrOptions {
            error_correction: ErrorCorrection::H,
            ..QrOptions::default()
        };
        assert!(!matches(&art, "https://old.up.railway.app", &h));
    }
}
