//! Git smart-HTTP delegate
//!
//! Every request that is not a status endpoint is handed to
//! `git http-backend` as a CGI call. The request body is buffered and
//! written to the backend's stdin; its stdout (CGI headers, blank line,
//! body) becomes the response. Receive-pack is enabled by always setting
//! `REMOTE_USER`.
//!
//! `observe_receive_pack` queues an update once a push to the managed
//! repository has been handled.

use axum::{
    body::{Body, to_bytes},
    extract::{Request, State},
    http::{self, Method, StatusCode, header},
    middleware::Next,
    response::Response,
};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::api::AppState;
use crate::api::error::{ApiError, ApiResult};
use crate::scheduler::BuildRequest;

/// Largest request body (pack file) accepted from a client
const MAX_REQUEST_BODY: usize = 1024 * 1024 * 1024;

const REMOTE_USER: &str = "hotswap";

/// Runs `git http-backend` over the repositories under `project_root`
#[derive(Debug, Clone)]
pub struct GitHttpBackend {
    project_root: PathBuf,
}

impl GitHttpBackend {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
        }
    }

    pub async fn serve(&self, request: Request) -> ApiResult<Response> {
        let (parts, body) = request.into_parts();
        let body = to_bytes(body, MAX_REQUEST_BODY)
            .await
            .map_err(|e| ApiError::BadRequest(format!("could not read request body: {}", e)))?;

        debug!("git http-backend {} {}", parts.method, parts.uri);

        let mut command = Command::new("git");
        command
            .arg("http-backend")
            .env("GIT_PROJECT_ROOT", &self.project_root)
            .env("GIT_HTTP_EXPORT_ALL", "1")
            .env("REMOTE_USER", REMOTE_USER)
            .env("REQUEST_METHOD", parts.method.as_str())
            .env("PATH_INFO", parts.uri.path())
            .env("QUERY_STRING", parts.uri.query().unwrap_or_default())
            .env("CONTENT_LENGTH", body.len().to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let forwarded = [
            (header::CONTENT_TYPE.as_str(), "CONTENT_TYPE"),
            (header::CONTENT_ENCODING.as_str(), "HTTP_CONTENT_ENCODING"),
            ("git-protocol", "GIT_PROTOCOL"),
        ];
        for (name, variable) in forwarded {
            if let Some(value) = parts.headers.get(name).and_then(|v| v.to_str().ok()) {
                command.env(variable, value);
            }
        }

        let mut child = command
            .spawn()
            .map_err(|e| ApiError::Internal(format!("could not start git http-backend: {}", e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ApiError::Internal("git http-backend has no stdin".to_string()))?;
        let writer = tokio::spawn(async move {
            let result = stdin.write_all(&body).await;
            drop(stdin);
            result
        });

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ApiError::Internal(format!("git http-backend failed: {}", e)))?;

        match writer.await {
            Ok(Err(e)) => debug!("git http-backend closed stdin early: {}", e),
            Err(e) => warn!("stdin writer panicked: {}", e),
            Ok(Ok(())) => {}
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        for line in stderr.lines() {
            debug!("[git http-backend] {}", line);
        }

        if output.stdout.is_empty() {
            return Err(ApiError::Internal(format!(
                "git http-backend exited with {} and no output",
                output.status
            )));
        }

        parse_cgi_response(&output.stdout)
    }
}

/// Splits CGI output into headers and body
fn split_headers(raw: &[u8]) -> Option<(&[u8], &[u8])> {
    let crlf = raw.windows(4).position(|w| w == b"\r\n\r\n").map(|i| (i, 4));
    let lf = raw.windows(2).position(|w| w == b"\n\n").map(|i| (i, 2));
    let (end, sep) = match (crlf, lf) {
        (Some(a), Some(b)) => {
            if a.0 <= b.0 {
                a
            } else {
                b
            }
        }
        (Some(found), None) | (None, Some(found)) => found,
        (None, None) => return None,
    };
    Some((&raw[..end], &raw[end + sep..]))
}

/// Turns CGI output into an HTTP response, honouring the `Status` header
pub fn parse_cgi_response(raw: &[u8]) -> ApiResult<Response> {
    let (head, body) = split_headers(raw)
        .ok_or_else(|| ApiError::Internal("malformed CGI response".to_string()))?;

    let mut status = StatusCode::OK;
    let mut builder = http::Response::builder();
    for line in String::from_utf8_lossy(head).lines() {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if name.eq_ignore_ascii_case("status") {
            status = value
                .split_whitespace()
                .next()
                .and_then(|code| code.parse::<u16>().ok())
                .and_then(|code| StatusCode::from_u16(code).ok())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        } else {
            builder = builder.header(name.trim(), value);
        }
    }

    builder
        .status(status)
        .body(Body::from(body.to_vec()))
        .map_err(|e| ApiError::Internal(format!("invalid CGI header: {}", e)))
}

/// Fallback handler for git smart-HTTP paths
pub async fn git_backend(State(state): State<AppState>, request: Request) -> ApiResult<Response> {
    state.git.serve(request).await
}

/// Queues an update after `POST /<repository>/git-receive-pack` completes
///
/// Other paths pass through untouched.
pub async fn observe_receive_pack(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let is_push = request.method() == Method::POST
        && request.uri().path() == format!("/{}/git-receive-pack", state.repository);

    let response = next.run(request).await;

    if is_push {
        match state.queue.submit(BuildRequest::push(&state.repository)) {
            Ok(id) => info!("Push to {} received, queued cycle {}", state.repository, id),
            Err(e) => warn!("Push to {} not queued: {}", state.repository, e),
        }
    }
    response
}
