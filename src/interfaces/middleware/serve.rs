use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};

use crate::application::services::registry::DepotRegistry;
use crate::common::clock;
use crate::common::disposition::make_content_disposition;
use crate::common::errors::{ErrorKind, Result, StorageError};
use crate::domain::entities::stored_file::StoredFile;

/// Chunk size for streamed bodies.
pub const DEFAULT_BLOCK_SIZE: usize = 4096 * 64; // 256K

/// Cache lifetime handed to clients, one week.
pub const DEFAULT_CACHE_MAX_AGE: u64 = 3600 * 24 * 7;

/// Configuration of the depot-serving middleware.
///
/// Mounted in front of a host application, the middleware answers GET and
/// HEAD requests under `{mountpoint}/{store}/{file_id}` and forwards
/// everything else unchanged. Stores exposing a public URL are answered
/// with a permanent redirect; the rest are streamed with full caching and
/// conditional-request handling.
#[derive(Debug, Clone)]
pub struct DepotServing {
    mountpoint: String,
    cache_max_age: u64,
    block_size: usize,
}

impl DepotServing {
    /// Builds the configuration. The mountpoint must begin with `/`.
    pub fn new(mountpoint: &str) -> Result<Self> {
        if !mountpoint.starts_with('/') {
            return Err(StorageError::configuration(
                "mountpoint must be an absolute path",
            ));
        }
        Ok(Self {
            mountpoint: mountpoint.trim_end_matches('/').to_string(),
            cache_max_age: DEFAULT_CACHE_MAX_AGE,
            block_size: DEFAULT_BLOCK_SIZE,
        })
    }

    pub fn with_cache_max_age(mut self, seconds: u64) -> Self {
        self.cache_max_age = seconds;
        self
    }

    pub fn with_block_size(mut self, bytes: usize) -> Self {
        self.block_size = bytes;
        self
    }

    pub fn mountpoint(&self) -> &str {
        &self.mountpoint
    }

    /// URL path serving the given `store/file_id` path.
    pub fn url_for(&self, path: &str) -> String {
        format!("{}/{}", self.mountpoint, path)
    }

    /// Splits `{store}/{file_id}` out of a request path, or None when the
    /// request does not belong to this mountpoint.
    fn parse_path<'a>(&self, path: &'a str) -> Option<ServedPath<'a>> {
        let rest = path.strip_prefix(self.mountpoint.as_str())?;
        let rest = match rest.strip_prefix('/') {
            Some(rest) => rest,
            // mountpoint hit exactly, or a longer segment sharing the prefix
            None if rest.is_empty() => "",
            None => return None,
        };
        let mut segments = rest.splitn(3, '/');
        let depot = segments.next().unwrap_or_default();
        let file_id = segments.next().unwrap_or_default();
        Some(ServedPath { depot, file_id })
    }
}

struct ServedPath<'a> {
    depot: &'a str,
    file_id: &'a str,
}

/// Axum middleware serving depot files.
///
/// Mount it around a host router with
/// `axum::middleware::from_fn_with_state(Arc::new(serving), serve_depot)`.
pub async fn serve_depot(
    State(config): State<Arc<DepotServing>>,
    req: Request,
    next: Next,
) -> Response {
    if req.method() != Method::GET && req.method() != Method::HEAD {
        return next.run(req).await;
    }
    let path = req.uri().path().to_string();
    let Some(served) = config.parse_path(&path) else {
        return next.run(req).await;
    };

    if served.depot.is_empty() || served.file_id.is_empty() {
        return not_found();
    }
    let Ok(depot) = DepotRegistry::get(Some(served.depot)) else {
        return not_found();
    };

    let file = match depot.get(served.file_id).await {
        Ok(file) => file,
        Err(e) if matches!(e.kind, ErrorKind::InvalidId | ErrorKind::NotFound) => {
            return not_found();
        }
        Err(e) => {
            tracing::error!(depot = served.depot, file_id = served.file_id, error = %e,
                "could not load served file");
            return e.into_response();
        }
    };

    if let Some(public_url) = file.public_url() {
        return moved_permanently(public_url);
    }

    serve_stored_file(file, req.method() == Method::HEAD, req.headers(), &config)
}

fn serve_stored_file(
    mut file: StoredFile,
    is_head: bool,
    request_headers: &HeaderMap,
    config: &DepotServing,
) -> Response {
    let etag = file.etag();
    let cache_control = format!("max-age={}, public", config.cache_max_age);

    let unmodified = match check_conditionals(request_headers, &etag, file.last_modified()) {
        Ok(unmodified) => unmodified,
        Err(e) => {
            file.close();
            return e.into_response();
        }
    };

    if unmodified {
        file.close();
        return finish(
            Response::builder()
                .status(StatusCode::NOT_MODIFIED)
                .header(header::ETAG, etag.as_str())
                .header(header::CACHE_CONTROL, cache_control.as_str())
                .body(Body::empty()),
        );
    }

    let expires = clock::utc_now() + chrono::Duration::seconds(config.cache_max_age as i64);
    let builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::ETAG, etag.as_str())
        .header(header::CACHE_CONTROL, cache_control.as_str())
        .header(header::EXPIRES, clock::format_http_date(expires))
        .header(header::CONTENT_TYPE, file.content_type())
        .header(header::CONTENT_LENGTH, file.content_length().to_string())
        .header(
            header::LAST_MODIFIED,
            clock::format_http_date(file.last_modified()),
        )
        .header(
            header::CONTENT_DISPOSITION,
            make_content_disposition("inline", file.filename()),
        );

    if is_head {
        file.close();
        return finish(builder.body(Body::empty()));
    }
    let body = Body::from_stream(file.into_chunks(config.block_size));
    finish(builder.body(body))
}

/// Evaluates If-Modified-Since and If-None-Match against the file. A date
/// that fails to parse is a client error, not a cache miss.
fn check_conditionals(
    headers: &HeaderMap,
    etag: &str,
    last_modified: DateTime<Utc>,
) -> Result<bool> {
    let mut unmodified = false;

    if let Some(value) = headers.get(header::IF_MODIFIED_SINCE) {
        let since = value
            .to_str()
            .ok()
            .and_then(clock::parse_http_date)
            .ok_or_else(|| {
                StorageError::malformed_request(
                    "If-Modified-Since header was malformed in request",
                )
            })?;
        if last_modified <= since {
            unmodified = true;
        }
    }

    if let Some(value) = headers.get(header::IF_NONE_MATCH) {
        if value.to_str().ok() == Some(etag) {
            unmodified = true;
        }
    }

    Ok(unmodified)
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "File Not Found").into_response()
}

fn moved_permanently(location: &str) -> Response {
    finish(
        Response::builder()
            .status(StatusCode::MOVED_PERMANENTLY)
            .header(header::LOCATION, location)
            .body(Body::empty()),
    )
}

fn finish(result: std::result::Result<Response<Body>, axum::http::Error>) -> Response {
    match result {
        Ok(response) => response,
        Err(e) => {
            tracing::error!(error = %e, "could not build file response");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
