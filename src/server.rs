//! The HTTP front end: bearer auth, CORS preflight, streaming detection,
//! dispatch, and SSE relay.

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::header::{
    ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_MAX_AGE, ACCESS_CONTROL_REQUEST_HEADERS,
    ACCESS_CONTROL_REQUEST_METHOD, AUTHORIZATION, CACHE_CONTROL, CONNECTION, CONTENT_LENGTH,
    CONTENT_TYPE, ORIGIN, VARY,
};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{Stream, StreamExt, stream};
use serde::Serialize;
use serde_json::Value;
use subtle::ConstantTimeEq;
use tracing::{debug, error, info, warn};

use crate::client::ChatStream;
use crate::registry::Registry;
use crate::selector;
use crate::{Result, RouterError};

/// How much of the body is peeked to spot `"stream":true` before the request
/// is consumed.
const STREAM_SNIFF_BYTES: usize = 1024;

const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

const MODEL_OWNER: &str = "llm-router";

#[derive(Clone)]
pub struct GatewayState {
    registry: Arc<Registry>,
    api_key: Arc<str>,
}

pub fn router(registry: Arc<Registry>, api_key: &str) -> Router {
    let state = GatewayState {
        registry,
        api_key: Arc::from(api_key),
    };
    Router::new()
        .route("/health", get(health).options(preflight))
        .route(
            "/v1/chat/completions",
            post(chat_completions).options(preflight),
        )
        .route("/v1/models", get(list_models).options(preflight))
        .fallback(fallback)
        .layer(middleware::from_fn(crate::compress::compression_middleware))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    message: String,
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

fn openai_error(
    status: StatusCode,
    kind: &'static str,
    code: Option<&'static str>,
    message: impl std::fmt::Display,
) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: ErrorDetail {
                message: message.to_string(),
                kind,
                code,
            },
        }),
    )
        .into_response()
}

fn error_response(err: RouterError) -> Response {
    match &err {
        RouterError::Auth => openai_error(
            StatusCode::UNAUTHORIZED,
            "invalid_request_error",
            Some("invalid_api_key"),
            err,
        ),
        RouterError::BadRequest(_) => {
            openai_error(StatusCode::BAD_REQUEST, "invalid_request_error", None, err)
        }
        RouterError::UnknownGroup(_) => openai_error(
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            Some("model_not_found"),
            err,
        ),
        _ => openai_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "upstream_error",
            None,
            err,
        ),
    }
}

async fn health() -> &'static str {
    "OK"
}

/// CORS preflight: echo the origin and requested headers, 204.
async fn preflight(headers: HeaderMap) -> Response {
    let origin = headers
        .get(ORIGIN)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .unwrap_or("*");
    let allow_headers = headers
        .get(ACCESS_CONTROL_REQUEST_HEADERS)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|requested| !requested.is_empty())
        .unwrap_or("Authorization, Content-Type, Accept");
    if let Some(method) = headers
        .get(ACCESS_CONTROL_REQUEST_METHOD)
        .and_then(|value| value.to_str().ok())
    {
        debug!(method = %method, "preflight requested method");
    }

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::NO_CONTENT;
    let response_headers = response.headers_mut();
    response_headers.insert(
        ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_str(origin).unwrap_or(HeaderValue::from_static("*")),
    );
    response_headers.insert(
        ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS, PUT, DELETE"),
    );
    response_headers.insert(
        ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_str(allow_headers)
            .unwrap_or(HeaderValue::from_static("Authorization, Content-Type, Accept")),
    );
    response_headers.insert(ACCESS_CONTROL_ALLOW_CREDENTIALS, HeaderValue::from_static("true"));
    response_headers.insert(ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static("86400"));
    response_headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response_headers.insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
    response_headers.insert(
        VARY,
        HeaderValue::from_static(
            "Origin, Access-Control-Request-Method, Access-Control-Request-Headers",
        ),
    );
    response
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Keeps enough of the header to correlate logs without exposing the key.
fn redact_authorization(value: &str) -> String {
    if value.is_empty() {
        return "<empty>".to_string();
    }
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 14 {
        return "***".to_string();
    }
    let head: String = chars[..10].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}

fn authorize(state: &GatewayState, headers: &HeaderMap) -> Result<()> {
    let received = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    let expected = format!("Bearer {}", state.api_key);
    if !constant_time_eq(received, &expected) {
        warn!(
            authorization = %redact_authorization(received),
            "invalid or missing API key"
        );
        return Err(RouterError::Auth);
    }
    info!(
        authorization = %redact_authorization(received),
        "api key validated"
    );
    Ok(())
}

fn contains_subslice(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

/// Peeks up to the first [`STREAM_SNIFF_BYTES`] of the body for the literal
/// `"stream":true`, then re-attaches the peeked bytes so the body can still
/// be read in full.
async fn sniff_stream_flag(body: Body) -> (bool, Body) {
    let mut inner = body.into_data_stream();
    let mut peeked: Vec<std::result::Result<Bytes, axum::Error>> = Vec::new();
    let mut window = Vec::new();

    while window.len() < STREAM_SNIFF_BYTES {
        match inner.next().await {
            Some(Ok(chunk)) => {
                let take = (STREAM_SNIFF_BYTES - window.len()).min(chunk.len());
                window.extend_from_slice(&chunk[..take]);
                peeked.push(Ok(chunk));
            }
            Some(Err(err)) => {
                peeked.push(Err(err));
                break;
            }
            None => break,
        }
    }

    let hint = contains_subslice(&window, b"\"stream\":true");
    (hint, Body::from_stream(stream::iter(peeked).chain(inner)))
}

async fn chat_completions(State(state): State<GatewayState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();

    // Sniff before anything else consumes the body.
    let json_content = parts
        .headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|content_type| content_type.contains("application/json"));
    let (sniffed_streaming, body) = if json_content {
        sniff_stream_flag(body).await
    } else {
        (false, body)
    };
    debug!(
        path = %parts.uri.path(),
        method = %parts.method,
        streaming = sniffed_streaming,
        "incoming request"
    );

    if let Err(err) = authorize(&state, &parts.headers) {
        return error_response(err);
    }

    let bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(err) => {
            return error_response(RouterError::BadRequest(format!(
                "error reading request body: {err}"
            )));
        }
    };

    let mut payload: Value = match serde_json::from_slice(&bytes) {
        Ok(value @ Value::Object(_)) => value,
        Ok(_) => {
            return error_response(RouterError::BadRequest(
                "request body must be a JSON object".to_string(),
            ));
        }
        Err(err) => {
            return error_response(RouterError::BadRequest(format!("invalid json: {err}")));
        }
    };

    let group = match payload.get("model").and_then(Value::as_str) {
        Some(model) if !model.trim().is_empty() => model.to_string(),
        _ => return error_response(RouterError::BadRequest("missing field `model`".to_string())),
    };
    let streaming = payload
        .get("stream")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let route = match selector::resolve_group(&state.registry, &group) {
        Ok(route) => route,
        Err(err) => {
            error!(group = %group, error = %err, "failed to resolve group");
            return error_response(err);
        }
    };
    info!(
        group = %group,
        provider = %route.provider,
        model = %route.model,
        streaming,
        "routing request"
    );

    // The only body rewrite the gateway performs.
    if let Some(object) = payload.as_object_mut() {
        object.insert("model".to_string(), Value::String(route.model.to_string()));
    }

    if streaming {
        match Arc::clone(route.client).open_stream(&payload).await {
            Ok(stream) => sse_response(stream),
            Err(err) => {
                error!(error = %err, "failed to open upstream stream");
                error_response(err)
            }
        }
    } else {
        match route.client.complete(&payload).await {
            Ok(response) => (StatusCode::OK, Json(response)).into_response(),
            Err(err) => {
                error!(error = %err, "upstream completion failed");
                error_response(err)
            }
        }
    }
}

enum RelayState {
    Open(ChatStream),
    Done,
}

/// Relays upstream chunks as SSE frames. End-of-stream emits exactly one
/// `data: [DONE]`; an upstream error ends the stream without it.
fn relay_events(stream: ChatStream) -> impl Stream<Item = std::io::Result<Bytes>> {
    stream::unfold(RelayState::Open(stream), |state| async move {
        match state {
            RelayState::Open(mut stream) => match stream.recv().await {
                Some(Ok(chunk)) => {
                    let json = chunk.to_string();
                    let mut frame = Vec::with_capacity(json.len() + 8);
                    frame.extend_from_slice(b"data: ");
                    frame.extend_from_slice(json.as_bytes());
                    frame.extend_from_slice(b"\n\n");
                    Some((Ok(Bytes::from(frame)), RelayState::Open(stream)))
                }
                Some(Err(err)) => {
                    error!(error = %err, "error receiving stream");
                    None
                }
                None => Some((
                    Ok(Bytes::from_static(b"data: [DONE]\n\n")),
                    RelayState::Done,
                )),
            },
            RelayState::Done => None,
        }
    })
}

fn sse_response(stream: ChatStream) -> Response {
    let mut response = Response::new(Body::from_stream(relay_events(stream)));
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    response
}

#[derive(Debug, Serialize)]
struct ModelInfo {
    id: String,
    object: &'static str,
    owned_by: &'static str,
}

#[derive(Debug, Serialize)]
struct ModelsListResponse {
    object: &'static str,
    data: Vec<ModelInfo>,
}

/// One model entry per group; group names are what clients route by.
async fn list_models(State(state): State<GatewayState>, headers: HeaderMap) -> Response {
    if let Err(err) = authorize(&state, &headers) {
        return error_response(err);
    }
    let data = state
        .registry
        .groups()
        .iter()
        .map(|group| ModelInfo {
            id: group.name.clone(),
            object: "model",
            owned_by: MODEL_OWNER,
        })
        .collect();
    Json(ModelsListResponse {
        object: "list",
        data,
    })
    .into_response()
}

async fn fallback(
    State(state): State<GatewayState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    if let Err(err) = authorize(&state, &headers) {
        return error_response(err);
    }
    info!(path = %uri.path(), method = %method, "no handler for this endpoint");
    openai_error(
        StatusCode::NOT_FOUND,
        "invalid_request_error",
        None,
        "not found",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redaction_masks_the_middle() {
        let redacted = redact_authorization("Bearer sk-abcdefghijklmnop");
        assert_eq!(redacted, "Bearer sk-...mnop");
        assert!(!redacted.contains("abcdefghijkl"));
    }

    #[test]
    fn redaction_handles_short_and_empty_values() {
        assert_eq!(redact_authorization(""), "<empty>");
        assert_eq!(redact_authorization("Bearer x"), "***");
    }

    #[test]
    fn constant_time_eq_matches_exactly() {
        assert!(constant_time_eq("Bearer secret", "Bearer secret"));
        assert!(!constant_time_eq("Bearer secret", "Bearer secreT"));
        assert!(!constant_time_eq("Bearer secret", "Bearer secre"));
    }

    #[tokio::test]
    async fn sniff_detects_stream_flag_and_preserves_body() {
        let payload = format!(
            "{{\"model\":\"g\",\"stream\":true,\"padding\":\"{}\"}}",
            "x".repeat(2048)
        );
        let (hint, body) = sniff_stream_flag(Body::from(payload.clone())).await;
        assert!(hint);
        let bytes = axum::body::to_bytes(body, usize::MAX).await.expect("body");
        assert_eq!(&bytes[..], payload.as_bytes());
    }

    #[tokio::test]
    async fn sniff_misses_flag_outside_window() {
        let payload = format!(
            "{{\"padding\":\"{}\",\"stream\":true}}",
            "x".repeat(2048)
        );
        let (hint, body) = sniff_stream_flag(Body::from(payload.clone())).await;
        assert!(!hint);
        let bytes = axum::body::to_bytes(body, usize::MAX).await.expect("body");
        assert_eq!(&bytes[..], payload.as_bytes());
    }

    #[tokio::test]
    async fn sniff_handles_empty_body() {
        let (hint, body) = sniff_stream_flag(Body::empty()).await;
        assert!(!hint);
        let bytes = axum::body::to_bytes(body, usize::MAX).await.expect("body");
        assert!(bytes.is_empty());
    }
}
