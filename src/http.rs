use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{ConnectInfo, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::TryStreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::{
    net::TcpListener,
    time::{sleep, timeout, Duration},
};
use url::Url;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::hls::{rebase_segment_url, rewrite_playlist};
use crate::logging::logger;

const PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";
const NO_CACHE: &str = "no-store, no-cache, must-revalidate";

type ApiResponse = Result<Response, ApiError>;

#[derive(Debug)]
enum ApiError {
    BadRequest(&'static str),
    NotFound(&'static str),
    ServiceUnavailable(&'static str),
    BadGateway(&'static str),
    GatewayTimeout(&'static str),
    Internal(anyhow::Error),
}

#[derive(Serialize)]
struct ErrorResponse<'a> {
    error: &'a str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            ApiError::ServiceUnavailable(message) => (StatusCode::SERVICE_UNAVAILABLE, message),
            ApiError::BadGateway(message) => (StatusCode::BAD_GATEWAY, message),
            ApiError::GatewayTimeout(message) => (StatusCode::GATEWAY_TIMEOUT, message),
            ApiError::Internal(error) => {
                logger().error(
                    "internal.error",
                    json!({
                        "error": {
                            "message": error.to_string(),
                            "debug": format!("{:?}", error),
                        }
                    }),
                );
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse {
                        error: "Internal Server Error",
                    }),
                )
                    .into_response();
            }
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

fn upstream_error_response(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn extract_request_id(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
        .map(|value| value.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

async fn log_requests(request: Request<Body>, next: Next) -> Response {
    let request_id = extract_request_id(request.headers());
    let method = request.method().clone();
    let raw_url = request.uri().to_string();
    let client_ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string());
    let started_at = Instant::now();

    logger().info(
        "request.received",
        json!({
            "requestId": request_id,
            "method": method.as_str(),
            "rawUrl": raw_url,
            "clientIp": client_ip,
        }),
    );

    let mut response = next.run(request).await;
    let status = response.status().as_u16();
    let duration_ms = started_at.elapsed().as_secs_f64() * 1000.0;

    logger().info(
        "request.completed",
        json!({
            "requestId": request_id,
            "method": method.as_str(),
            "rawUrl": raw_url,
            "statusCode": status,
            "durationMs": duration_ms,
            "clientIp": client_ip,
        }),
    );

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response
            .headers_mut()
            .insert(header::HeaderName::from_static("x-request-id"), value);
    }

    response
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/live/{file}", get(handle_master))
        .route("/seg", get(handle_segment))
        .route("/{file}", get(handle_segment_ext))
        .route("/clear_cache", post(handle_clear_cache))
        .with_state(state)
        .layer(middleware::from_fn(log_requests))
}

/// Bind the configured address, scanning forward through a bounded range of
/// ports when the preferred one is already taken.
pub async fn bind(config: &crate::config::Config) -> anyhow::Result<(TcpListener, SocketAddr)> {
    for offset in 0..config.port_scan_limit {
        let port = config.port.saturating_add(offset);
        match TcpListener::bind((config.host.as_str(), port)).await {
            Ok(listener) => {
                if offset > 0 {
                    logger().warn(
                        "server.port_fallback",
                        json!({
                            "configuredPort": config.port,
                            "boundPort": port,
                        }),
                    );
                }
                let addr = listener.local_addr()?;
                return Ok((listener, addr));
            }
            Err(error) if error.kind() == io::ErrorKind::AddrInUse => continue,
            Err(error) => return Err(error.into()),
        }
    }
    anyhow::bail!(
        "no free port on {} in range {}..{}",
        config.host,
        config.port,
        config.port.saturating_add(config.port_scan_limit)
    )
}

pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let (listener, addr) = bind(&state.config).await?;
    logger().info(
        "server.listening",
        json!({
            "address": addr.to_string()
        }),
    );
    serve_with_listener(state, listener, shutdown_signal()).await
}

/// Serve on an already-bound listener. Shutdown stops the accept loop and
/// lets in-flight requests drain through the closing connections.
pub async fn serve_with_listener(
    state: AppState,
    listener: TcpListener,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let router = build_router(state);
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;
    Ok(())
}

async fn healthz() -> Response {
    (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response()
}

async fn handle_master(State(state): State<AppState>, Path(file): Path<String>) -> ApiResponse {
    let Some(station) = file.strip_suffix(".m3u8") else {
        return Err(ApiError::NotFound("not found"));
    };
    let station = station.trim();
    if station.is_empty() {
        return Err(ApiError::BadRequest("station identifier is required"));
    }

    let resolved = match state.cache.get_or_resolve(station).await {
        Ok(Some(resolved)) => resolved,
        Ok(None) => return Err(ApiError::NotFound("station not found")),
        Err(error) => {
            logger().warn(
                "resolve.failed",
                json!({
                    "station": station,
                    "error": format!("{:?}", error),
                }),
            );
            return Err(ApiError::NotFound("station not found"));
        }
    };

    let request = state.http_client.get(resolved.playlist_url.clone());
    let response = match timeout(upstream_timeout(&state), request.send()).await {
        Err(_) => return Err(ApiError::GatewayTimeout("upstream timeout")),
        Ok(Err(_)) => return Err(ApiError::BadGateway("upstream error")),
        Ok(Ok(response)) => response,
    };

    let status = response.status();
    if status != StatusCode::OK {
        return Ok(upstream_error_response(
            status,
            format!("upstream returned {}", status.as_u16()),
        ));
    }

    // The send timeout only covers the header phase; the body read needs
    // its own bound or a stalled upstream hangs the request.
    let playlist = match timeout(upstream_timeout(&state), response.text()).await {
        Err(_) => return Err(ApiError::GatewayTimeout("upstream timeout")),
        Ok(Err(_)) => return Err(ApiError::BadGateway("upstream error")),
        Ok(Ok(playlist)) => playlist,
    };
    let rewritten = rewrite_playlist(
        &playlist,
        &resolved.playlist_url,
        station,
        &state.config.stream_proxy.segment_extensions,
    );

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, PLAYLIST_CONTENT_TYPE)
        .header(header::CACHE_CONTROL, NO_CACHE)
        .header(header::PRAGMA, "no-cache")
        .body(Body::from(rewritten))
        .map_err(|err| ApiError::Internal(anyhow::anyhow!(err)))
}

#[derive(Deserialize)]
struct SegmentQuery {
    u: Option<String>,
    station: Option<String>,
}

async fn handle_segment(State(state): State<AppState>, Query(query): Query<SegmentQuery>) -> ApiResponse {
    proxy_segment(state, query).await
}

async fn handle_segment_ext(
    State(state): State<AppState>,
    Path(file): Path<String>,
    Query(query): Query<SegmentQuery>,
) -> ApiResponse {
    if !file.starts_with("seg.") {
        return Err(ApiError::NotFound("not found"));
    }
    proxy_segment(state, query).await
}

async fn proxy_segment(state: AppState, query: SegmentQuery) -> ApiResponse {
    let raw_url = query
        .u
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or(ApiError::BadRequest("missing u"))?;
    let mut url = Url::parse(raw_url).map_err(|_| ApiError::BadRequest("invalid segment url"))?;
    let station = query
        .station
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty());

    let attempts = state.config.stream_proxy.retry_attempts;
    for attempt in 1..=attempts {
        let request = state.http_client.get(url.clone());
        match timeout(upstream_timeout(&state), request.send()).await {
            Ok(Ok(response)) => {
                let status = response.status();
                if status == StatusCode::OK {
                    return Ok(forward_stream_response(response));
                }
                // A 403 means the signed URL went stale, not that the
                // segment is gone; a fresh resolution yields a new one.
                if status == StatusCode::FORBIDDEN {
                    if let Some(station) = station {
                        logger().info(
                            "segment.expired",
                            json!({
                                "station": station,
                                "attempt": attempt,
                            }),
                        );
                        url = refresh_segment_url(&state, station, &url).await?;
                        continue;
                    }
                }
                return Ok(upstream_error_response(
                    status,
                    format!("upstream returned {}", status.as_u16()),
                ));
            }
            Ok(Err(error)) => {
                logger().warn(
                    "segment.transport_error",
                    json!({
                        "station": station,
                        "attempt": attempt,
                        "error": format!("{:?}", error),
                    }),
                );
            }
            Err(_) => {
                logger().warn(
                    "segment.timeout",
                    json!({
                        "station": station,
                        "attempt": attempt,
                    }),
                );
            }
        }
        if attempt < attempts {
            if let Some(station) = station {
                url = refresh_segment_url(&state, station, &url).await?;
            }
        }
    }
    Err(ApiError::BadGateway("all attempts failed"))
}

/// Invalidate and re-resolve the station, then re-point the failed segment
/// URL at the fresh playlist directory. A station that no longer resolves
/// fails fast instead of burning the remaining attempts.
async fn refresh_segment_url(
    state: &AppState,
    station: &str,
    current: &Url,
) -> Result<Url, ApiError> {
    state.cache.invalidate(station).await;
    sleep(Duration::from_millis(state.config.stream_proxy.retry_delay_ms)).await;
    let resolved = match state.cache.get_or_resolve(station).await {
        Ok(Some(resolved)) => resolved,
        Ok(None) => return Err(ApiError::ServiceUnavailable("failed to resolve stream")),
        Err(error) => {
            logger().warn(
                "resolve.failed",
                json!({
                    "station": station,
                    "error": format!("{:?}", error),
                }),
            );
            return Err(ApiError::ServiceUnavailable("failed to resolve stream"));
        }
    };
    rebase_segment_url(current, &resolved.playlist_url)
        .ok_or(ApiError::BadGateway("segment url cannot be rebased"))
}

fn forward_stream_response(response: reqwest::Response) -> Response {
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    let body = Body::from_stream(response.bytes_stream().map_err(io::Error::other));
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, "no-store")
        .body(body)
        .unwrap_or_else(|err| {
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::from(err.to_string()))
                .unwrap()
        })
}

#[derive(Deserialize, Default)]
struct ClearCacheBody {
    station: Option<String>,
}

async fn handle_clear_cache(
    State(state): State<AppState>,
    body: Option<Json<ClearCacheBody>>,
) -> ApiResponse {
    let station = body
        .map(|Json(payload)| payload)
        .unwrap_or_default()
        .station
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or(ApiError::BadRequest("invalid request"))?;

    state.cache.invalidate(&station).await;
    logger().info("cache.cleared", json!({ "station": station }));
    Ok((StatusCode::OK, Json(json!({ "status": "cache cleared" }))).into_response())
}

fn upstream_timeout(state: &AppState) -> Duration {
    Duration::from_millis(state.config.stream_proxy.timeout_ms)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::extract_request_id;
    use axum::http::{HeaderMap, HeaderValue};

    #[test]
    fn request_id_prefers_incoming_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-request-id", HeaderValue::from_static("abc-123"));
        assert_eq!(extract_request_id(&headers), "abc-123");
    }

    #[test]
    fn request_id_is_generated_when_missing() {
        let headers = HeaderMap::new();
        let id = extract_request_id(&headers);
        assert_eq!(id.len(), 36);
    }
}
