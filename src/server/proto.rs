//!
//! Smart and dumb git HTTP protocol handlers.
//!
//! Dumb protocol requests serve files straight out of the canonical store
//! with one of two cache policies: mutable ref files are never cached,
//! content-addressed objects are cached forever. Smart protocol requests
//! run the matching git service as a subprocess: advertisement prepends the
//! pkt-line service announcement and a flush to the captured output, while
//! execution pipes the request body into the subprocess and streams its
//! stdout back one-shot (a late subprocess failure after bytes have gone out
//! is logged, not retried).
//!
//! `git-receive-pack` requires HTTP Basic credentials checked before the
//! subprocess is started.

use axum::body::Body;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::Response;
use base64::Engine;
use std::path::Path;
use tokio_util::io::ReaderStream;

use crate::config::{AUTH_REALM, AUTH_USER};
use crate::error::{AppError, AppResult};
use crate::git;
use crate::server::AppState;

/// Smart-protocol operations exposed over HTTP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitService {
    UploadPack,
    ReceivePack,
}

impl GitService {
    /// Wire name, as it appears in the `service` query parameter.
    pub fn name(&self) -> &'static str {
        match self {
            GitService::UploadPack => "git-upload-pack",
            GitService::ReceivePack => "git-receive-pack",
        }
    }

    /// git subcommand implementing the service.
    pub fn cmd(&self) -> &'static str {
        match self {
            GitService::UploadPack => "upload-pack",
            GitService::ReceivePack => "receive-pack",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "git-upload-pack" => Some(GitService::UploadPack),
            "git-receive-pack" => Some(GitService::ReceivePack),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum CachePolicy {
    /// Ref files, alternates, pack lists: content can change.
    NoCache,
    /// Loose objects, packs, pack indexes: content-addressed, immutable.
    Forever,
}

/// Frame a line as a git pkt-line: 4 hex digits of total length (counting
/// the prefix itself) followed by the payload.
pub fn pkt_line(line: &str) -> AppResult<String> {
    let total = line.len() + 4;
    if total > 0xffff {
        return Err(AppError::internal(
            "packet_too_long".to_string(),
            format!("pkt-line payload of {} bytes cannot be framed", line.len()),
        ));
    }
    Ok(format!("{:04x}{}", total, line))
}

fn apply_cache(builder: axum::http::response::Builder, policy: CachePolicy) -> axum::http::response::Builder {
    match policy {
        CachePolicy::NoCache => builder
            .header("Expires", "Fri, 01 Jan 1980 00:00:00 GMT")
            .header("Pragma", "no-cache")
            .header("Cache-Control", "no-cache, max-age=0, must-revalidate"),
        CachePolicy::Forever => {
            let now = chrono::Utc::now().timestamp();
            builder
                .header("Date", now.to_string())
                .header("Expires", (now + 31_536_000).to_string())
                .header("Cache-Control", "public, max-age=31536000")
        }
    }
}

fn http_date(t: std::time::SystemTime) -> String {
    chrono::DateTime::<chrono::Utc>::from(t)
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

fn build(builder: axum::http::response::Builder, body: Body) -> AppResult<Response> {
    builder
        .body(body)
        .map_err(|e| AppError::internal("bad_response".to_string(), e.to_string()))
}

/// Serve one static file out of a canonical store, streamed rather than
/// buffered (packfiles can be large). Missing file is 404; any other stat
/// error is internal.
pub async fn send_file(path: &Path, ctype: &str, policy: CachePolicy) -> AppResult<Response> {
    let meta = tokio::fs::metadata(path).await.map_err(AppError::from)?;
    let file = tokio::fs::File::open(path).await?;
    let mut builder = Response::builder()
        .header(CONTENT_TYPE, ctype)
        .header("Content-Length", meta.len().to_string());
    if let Ok(modified) = meta.modified() {
        builder = builder.header("Last-Modified", http_date(modified));
    }
    build(apply_cache(builder, policy), Body::from_stream(ReaderStream::new(file)))
}

/// `GET .../info/refs`: smart advertisement when a recognized `service`
/// parameter is present, dumb refresh-and-serve otherwise.
pub async fn info_refs(
    state: &AppState,
    repo: &str,
    uri: &Uri,
    file_path: &Path,
) -> AppResult<Response> {
    let service = crate::server::query_param(uri, "service");
    let Some(svc) = service.as_deref().and_then(GitService::from_name) else {
        // Dumb protocol: regenerate server info, then serve the refs file.
        let repo_dir = state.repos.repo_path(repo);
        git::git(&repo_dir, &["update-server-info"]).await?;
        return send_file(file_path, "text/plain", CachePolicy::NoCache).await;
    };

    let repo_dir = state.repos.repo_path(repo);
    let out = git::git_bytes(&repo_dir, &[svc.cmd(), "--stateless-rpc", "--advertise-refs", "."])
        .await?;

    let mut body = pkt_line(&format!("# service={}\n", svc.name()))?.into_bytes();
    body.extend_from_slice(b"0000"); // flush marker before the raw payload
    body.extend_from_slice(&out);

    let builder = Response::builder()
        .header(CONTENT_TYPE, format!("application/x-{}-advertisement", svc.name()));
    build(apply_cache(builder, CachePolicy::NoCache), Body::from(body))
}

/// `POST /<repo>/git-upload-pack` and `/<repo>/git-receive-pack`: run the
/// service with stateless-RPC framing, feed it the request body and stream
/// its stdout back.
pub async fn service_rpc(
    state: &AppState,
    repo: &str,
    svc: GitService,
    req: axum::extract::Request,
) -> AppResult<Response> {
    if svc == GitService::ReceivePack && !basic_auth_ok(req.headers(), &state.config.secret) {
        // Challenge before any subprocess is started.
        let builder = Response::builder()
            .status(StatusCode::UNAUTHORIZED)
            .header(WWW_AUTHENTICATE, format!("Basic realm=\"{}\"", AUTH_REALM));
        return build(builder, Body::from("401 Unauthorized\n"));
    }

    let body = axum::body::to_bytes(req.into_body(), usize::MAX)
        .await
        .map_err(|e| AppError::user("bad_body".to_string(), format!("could not read request body: {}", e)))?;

    let repo_dir = state.repos.repo_path(repo);
    let mut child = git::spawn_streaming(&repo_dir, &[svc.cmd(), "--stateless-rpc", "."])?;
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| AppError::internal("no_stdin".to_string(), "child stdin missing".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::internal("no_stdout".to_string(), "child stdout missing".to_string()))?;

    // Feed input concurrently with streaming output so a large pack cannot
    // deadlock both pipes.
    tokio::spawn(async move {
        use tokio::io::AsyncWriteExt;
        let _ = stdin.write_all(&body).await;
        let _ = stdin.shutdown().await;
    });
    tokio::spawn(git::finish_streaming(
        child,
        format!("git {} --stateless-rpc ({})", svc.cmd(), repo),
    ));

    let builder = Response::builder()
        .header(CONTENT_TYPE, format!("application/x-git-{}-result", svc.cmd()));
    build(builder, Body::from_stream(ReaderStream::new(stdout)))
}

/// Validate HTTP Basic credentials against the fixed username and the
/// shared secret.
pub fn basic_auth_ok(headers: &HeaderMap, secret: &str) -> bool {
    let Some(value) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded.trim()) else {
        return false;
    };
    let Ok(pair) = String::from_utf8(decoded) else {
        return false;
    };
    match pair.split_once(':') {
        Some((user, pass)) => user == AUTH_USER && pass == secret,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn pkt_line_framing() {
        // 26 payload bytes + 4 prefix bytes = 30 = 0x1e.
        assert_eq!(
            pkt_line("# service=git-upload-pack\n").unwrap(),
            "001e# service=git-upload-pack\n"
        );
        assert_eq!(pkt_line("").unwrap(), "0004");
        assert!(pkt_line(&"x".repeat(0x10000)).is_err());
    }

    fn auth_headers(user: &str, pass: &str) -> HeaderMap {
        let token = base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", user, pass));
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Basic {}", token)).unwrap(),
        );
        headers
    }

    #[test]
    fn basic_auth_checks_user_and_secret() {
        assert!(basic_auth_ok(&auth_headers(AUTH_USER, "sekrit"), "sekrit"));
        assert!(!basic_auth_ok(&auth_headers(AUTH_USER, "wrong"), "sekrit"));
        assert!(!basic_auth_ok(&auth_headers("somebody", "sekrit"), "sekrit"));
        assert!(!basic_auth_ok(&HeaderMap::new(), "sekrit"));

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer nope"));
        assert!(!basic_auth_ok(&headers, "sekrit"));
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic !!!notbase64!!!"));
        assert!(!basic_auth_ok(&headers, "sekrit"));
    }

    fn state_at(root: &Path, secret: &str) -> AppState {
        AppState::new(crate::config::Config {
            http_addr: String::new(),
            repo_root: root.join("repo"),
            review_root: root.join("review"),
            secret: secret.to_string(),
        })
    }

    fn receive_pack_request(auth: Option<&str>) -> axum::extract::Request {
        let mut builder = axum::http::Request::builder()
            .method("POST")
            .uri("/proj/git-receive-pack");
        if let Some(value) = auth {
            builder = builder.header(AUTHORIZATION, value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn receive_pack_challenges_before_any_subprocess() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_at(dir.path(), "sekrit");

        // No credentials at all.
        let resp = service_rpc(&state, "proj", GitService::ReceivePack, receive_pack_request(None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            resp.headers().get(WWW_AUTHENTICATE).unwrap(),
            "Basic realm=\"ADIT\""
        );
        assert_eq!(git::live_subprocesses(), 0);

        // Well-formed Basic credentials with the wrong secret.
        let token = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:wrong", AUTH_USER));
        let resp = service_rpc(
            &state,
            "proj",
            GitService::ReceivePack,
            receive_pack_request(Some(&format!("Basic {}", token))),
        )
        .await
        .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(git::live_subprocesses(), 0);
    }

    #[tokio::test]
    async fn send_file_streams_with_headers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("refs");
        tokio::fs::write(&path, b"abc123 refs/heads/master\n").await.unwrap();

        let resp = send_file(&path, "text/plain", CachePolicy::NoCache).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get(CONTENT_TYPE).unwrap(), "text/plain");
        assert_eq!(resp.headers().get("Content-Length").unwrap(), "25");
        assert_eq!(resp.headers().get("Pragma").unwrap(), "no-cache");
        assert!(resp.headers().contains_key("Last-Modified"));
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"abc123 refs/heads/master\n");

        let missing = send_file(&dir.path().join("gone"), "text/plain", CachePolicy::NoCache).await;
        assert!(matches!(missing, Err(AppError::NotFound { .. })));
    }

    #[test]
    fn service_names() {
        assert_eq!(GitService::from_name("git-upload-pack"), Some(GitService::UploadPack));
        assert_eq!(GitService::from_name("git-receive-pack"), Some(GitService::ReceivePack));
        assert_eq!(GitService::from_name("git-frobnicate"), None);
        assert_eq!(GitService::ReceivePack.cmd(), "receive-pack");
    }
}
