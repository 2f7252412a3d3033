use crate::{
    error::AppError,
    models::{DownloadQuery, DownloadUrlResponse, HealthResponse, InfoQuery},
    AppState,
};
use axum::{
    extract::{ConnectInfo, Query, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use std::net::SocketAddr;

// ===================================================================
//                          HEALTH
// ===================================================================

/// # GET /health - Liveness probe.
pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { status: "ok" }))
}

// ===================================================================
//                          INFO HANDLER
// ===================================================================

/// # GET /info - Fetches normalized metadata for a video URL.
pub async fn video_info(
    State(state): State<AppState>,
    Query(params): Query<InfoQuery>,
) -> Result<impl IntoResponse, AppError> {
    let url = required(params.url).ok_or_else(|| AppError::BadRequest("URL is required".to_string()))?;

    let info = state.pipeline.video_info(&url).await?;
    Ok((StatusCode::OK, Json(info)))
}

// ===================================================================
//                          DOWNLOAD HANDLER
// ===================================================================

/// # GET /download - Resolves a format selection to a direct download URL.
///
/// Limited per client address on top of the global limit.
pub async fn download_url(
    State(state): State<AppState>,
    connect: Option<ConnectInfo<SocketAddr>>,
    Query(params): Query<DownloadQuery>,
) -> Result<impl IntoResponse, AppError> {
    let client = client_key(connect.as_ref());
    if !state.download_limiter.check_limit(&client) {
        tracing::warn!(%client, "Download limit reached");
        return Err(AppError::TooManyRequests {
            message: "Download limit reached. Please try again later.".to_string(),
            retry_after: state.download_limiter.retry_after(&client),
        });
    }

    let (Some(url), Some(format), Some(quality)) = (
        required(params.url),
        required(params.format),
        required(params.quality),
    ) else {
        return Err(AppError::BadRequest("Missing required parameters".to_string()));
    };

    tracing::info!(%client, %url, %format, %quality, "Resolving download URL");
    let resolved = state.pipeline.download_url(&url, &format, &quality).await?;
    Ok((StatusCode::OK, Json(DownloadUrlResponse { url: resolved })))
}

// ===================================================================
//                          MIDDLEWARE
// ===================================================================

/// Per-client limit applied to every route.
pub async fn global_rate_limit(
    State(state): State<AppState>,
    connect: Option<ConnectInfo<SocketAddr>>,
    request: Request,
    next: Next,
) -> Response {
    let client = client_key(connect.as_ref());
    if !state.global_limiter.check_limit(&client) {
        tracing::warn!(%client, "Global rate limit reached");
        return AppError::TooManyRequests {
            message: "Too many requests from this IP, please try again later.".to_string(),
            retry_after: state.global_limiter.retry_after(&client),
        }
        .into_response();
    }
    next.run(request).await
}

// ===================================================================
//                          HELPER FUNCTIONS
// ===================================================================

/// Treats blank query values the same as missing ones.
fn required(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn client_key(connect: Option<&ConnectInfo<SocketAddr>>) -> String {
    connect.map_or_else(|| "unknown".to_string(), |ConnectInfo(addr)| addr.ip().to_string())
}
