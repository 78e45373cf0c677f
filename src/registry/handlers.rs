//! HTTP handlers for the registry endpoint

use super::resolver::{
    Body, ContentRequest, ContentResponse, Resolver, Source, CONTENT_DIGEST_HEADER, MIRRORED_HEADER,
};
use crate::oci::reference::DEFAULT_REGISTRY;
use crate::oci::{ObjectKind, RegistryPath};
use crate::Error;
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const API_VERSION_HEADER: &str = "Docker-Distribution-API-Version";

/// Shared registry state
#[derive(Clone)]
pub struct RegistryState {
    pub resolver: Arc<Resolver>,
}

#[derive(Debug, Default, Deserialize)]
pub struct MirrorQuery {
    /// Upstream registry the runtime is pulling from
    pub ns: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    errors: Vec<ErrorEntry>,
}

#[derive(Debug, Serialize)]
struct ErrorEntry {
    code: &'static str,
    message: String,
}

/// `GET /v2/`
pub async fn api_version() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(API_VERSION_HEADER, "registry/2.0")],
        Json(serde_json::json!({})),
    )
}

/// `GET /healthz`
pub async fn healthz(State(state): State<RegistryState>) -> StatusCode {
    if state.resolver.router().is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// `GET|HEAD /v2/<name>/(manifests|blobs)/<reference>`
pub async fn serve_content(
    State(state): State<RegistryState>,
    method: Method,
    Path(path): Path<String>,
    Query(query): Query<MirrorQuery>,
    headers: HeaderMap,
) -> Response {
    let metrics = state.resolver.metrics();
    metrics.request();

    let path = match RegistryPath::parse(&path) {
        Ok(path) => path,
        Err(e) => {
            metrics.failure(&e);
            return error_response(&e, None);
        }
    };
    let kind = path.kind;
    let request = ContentRequest {
        registry: query.ns.unwrap_or_else(|| DEFAULT_REGISTRY.to_owned()),
        path,
        head: method == Method::HEAD,
        mirrored: is_mirrored(&headers),
    };

    let result = match kind {
        ObjectKind::Manifest => state.resolver.manifest(&request).await,
        ObjectKind::Blob => state.resolver.blob(&request).await,
    };

    match result {
        Ok(response) => {
            match &response.source {
                Source::Local => tracing::debug!(
                    registry = %request.registry,
                    path = %request.path.to_path(),
                    digest = %response.digest,
                    "serving local content"
                ),
                Source::Peer(peer) => tracing::info!(
                    registry = %request.registry,
                    path = %request.path.to_path(),
                    digest = %response.digest,
                    peer = %peer,
                    "mirrored content from peer"
                ),
            }
            content_response(response)
        }
        Err(e) => {
            metrics.failure(&e);
            match &e {
                Error::NotFound(_) => tracing::debug!(
                    path = %request.path.to_path(),
                    mirrored = request.mirrored,
                    "content not found"
                ),
                _ => tracing::warn!(path = %request.path.to_path(), error = %e, "mirror request failed"),
            }
            error_response(&e, Some(kind))
        }
    }
}

fn is_mirrored(headers: &HeaderMap) -> bool {
    headers
        .get(MIRRORED_HEADER)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("true"))
}

fn content_response(response: ContentResponse) -> Response {
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_DIGEST_HEADER, response.digest.to_string());
    if let Ok(value) = HeaderValue::from_str(&response.media_type) {
        builder = builder.header(header::CONTENT_TYPE, value);
    }
    if let Some(size) = response.size {
        builder = builder.header(header::CONTENT_LENGTH, size);
    }

    let body = match response.body {
        Body::Empty => axum::body::Body::empty(),
        Body::Full(bytes) => axum::body::Body::from(bytes),
        Body::Stream(stream) => axum::body::Body::from_stream(stream),
    };
    builder
        .body(body)
        .unwrap_or_else(|e| error_response(&Error::other(e.to_string()), None))
}

/// Status and OCI error code for a failed request
pub fn error_status(err: &Error, kind: Option<ObjectKind>) -> (StatusCode, &'static str) {
    match err {
        Error::NotFound(_) => match kind {
            Some(ObjectKind::Manifest) => (StatusCode::NOT_FOUND, "MANIFEST_UNKNOWN"),
            Some(ObjectKind::Blob) => (StatusCode::NOT_FOUND, "BLOB_UNKNOWN"),
            None => (StatusCode::NOT_FOUND, "NAME_UNKNOWN"),
        },
        Error::UpstreamUnavailable { .. } | Error::DeadlineExceeded { .. } => {
            (StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE")
        }
        Error::InvalidDigest(_) | Error::DigestMismatch { .. } => {
            (StatusCode::BAD_REQUEST, "DIGEST_INVALID")
        }
        Error::InvalidReference(_) => (StatusCode::BAD_REQUEST, "NAME_INVALID"),
        Error::Unsupported(_) => (StatusCode::BAD_REQUEST, "UNSUPPORTED"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "UNKNOWN"),
    }
}

fn error_response(err: &Error, kind: Option<ObjectKind>) -> Response {
    let (status, code) = error_status(err, kind);
    let body = ErrorBody {
        errors: vec![ErrorEntry {
            code,
            message: err.to_string(),
        }],
    };
    (status, Json(body)).into_response()
}
