//!
//! adit HTTP gateway
//! -----------------
//! Axum-based HTTP surface of the server. Fixed routes cover the root
//! listing and the repository admin action; every repository-prefixed path
//! goes through the fallback dispatcher, which first resolves the leading
//! one or two path segments to a validated repository and then walks an
//! ordered service table of (method, path pattern) pairs. The first pattern
//! match wins; a pattern match with the wrong method is 405, no match is
//! 403.
//!
//! Responsibilities:
//! - Shared `AppState` wiring (config, lifecycle manager, review engine).
//! - Request classification and dispatch to the protocol and review
//!   handlers.
//! - Startup scan logging.

use axum::extract::{Request, State};
use axum::http::{Method, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::repos::RepoStore;
use crate::review::ReviewStore;

pub mod proto;
pub mod web;

/// Shared server state injected into all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub repos: RepoStore,
    pub reviews: ReviewStore,
}

impl AppState {
    pub fn new(cfg: Config) -> Self {
        let repos = RepoStore::new(&cfg);
        let reviews = ReviewStore::new(&cfg, repos.clone());
        AppState { config: Arc::new(cfg), repos, reviews }
    }
}

/// Start the gateway bound to the configured address.
pub async fn run(cfg: Config) -> anyhow::Result<()> {
    let state = AppState::new(cfg);

    // Startup inventory; a corrupted tree degrades to a warning here and is
    // reported per-request afterwards.
    match state.repos.scan().await {
        Ok(groups) => {
            for g in &groups {
                info!(
                    "group '{}': {}",
                    g.name,
                    g.repos.iter().map(|r| r.name.as_str()).collect::<Vec<_>>().join(", ")
                );
            }
        }
        Err(e) => warn!("initial scan failed: {}", e),
    }

    let addr = state.config.http_addr.clone();
    let app = Router::new()
        .route("/", get(web::list_repos))
        .route("/action", post(web::repo_action))
        .fallback(dispatch)
        .with_state(state);

    info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Operations reachable under a repository prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    // dumb protocol file serving
    Head,
    InfoRefs,
    TextFile,
    InfoPacks,
    LooseObject,
    PackFile,
    IdxFile,
    // smart protocol execution
    UploadPack,
    ReceivePack,
    // repository browsing data
    Overview,
    Tree,
    Blob,
    // review workflow
    ReviewsList,
    ReviewsAction,
    ReviewAction,
    ReviewDetail,
}

struct Service {
    method: Method,
    pattern: Regex,
    op: Op,
}

fn svc(method: Method, pattern: &str, op: Op) -> Service {
    Service { method, pattern: Regex::new(pattern).unwrap(), op }
}

/// Ordered dispatch table for repository-prefixed paths. Order matters:
/// the first pattern match decides the operation.
static SERVICES: Lazy<Vec<Service>> = Lazy::new(|| {
    vec![
        svc(Method::GET, r"^/HEAD$", Op::Head),
        svc(Method::GET, r"^/info/refs$", Op::InfoRefs),
        svc(Method::GET, r"^/objects/info/alternates$", Op::TextFile),
        svc(Method::GET, r"^/objects/info/http-alternates$", Op::TextFile),
        svc(Method::GET, r"^/objects/info/packs$", Op::InfoPacks),
        svc(Method::GET, r"^/objects/[0-9a-f]{2}/[0-9a-f]{38}$", Op::LooseObject),
        svc(Method::GET, r"^/objects/pack/pack-[0-9a-f]{40}\.pack$", Op::PackFile),
        svc(Method::GET, r"^/objects/pack/pack-[0-9a-f]{40}\.idx$", Op::IdxFile),
        svc(Method::POST, r"^/git-upload-pack$", Op::UploadPack),
        svc(Method::POST, r"^/git-receive-pack$", Op::ReceivePack),
        svc(Method::GET, r"^/$", Op::Overview),
        svc(Method::GET, r"^/tree/", Op::Tree),
        svc(Method::GET, r"^/blob/", Op::Blob),
        svc(Method::POST, r"^/reviews/action$", Op::ReviewsAction),
        svc(Method::GET, r"^/reviews/$", Op::ReviewsList),
        svc(Method::POST, r"^/review/action$", Op::ReviewAction),
        svc(Method::GET, r"^/review/", Op::ReviewDetail),
    ]
});

/// Fallback handler for everything that is not a fixed route.
async fn dispatch(State(state): State<AppState>, req: Request) -> Response {
    let path = req.uri().path().to_string();
    debug!("{} {}", req.method(), path);

    let Some((repo, subpath)) = state.repos.resolve(&path).await else {
        return AppError::forbidden(
            "no_repository".to_string(),
            format!("path does not denote a repository: {}", path),
        )
        .into_response();
    };

    for s in SERVICES.iter() {
        if !s.pattern.is_match(&subpath) {
            continue;
        }
        if s.method != *req.method() {
            return AppError::method_not_allowed(
                "wrong_method".to_string(),
                format!("{} not allowed for {}", req.method(), path),
            )
            .into_response();
        }
        let result = route(&state, s.op, &repo, &subpath, req).await;
        return match result {
            Ok(resp) => resp,
            Err(e) => e.into_response(),
        };
    }

    AppError::forbidden(
        "no_service".to_string(),
        format!("no service for path: {}", path),
    )
    .into_response()
}

async fn route(
    state: &AppState,
    op: Op,
    repo: &str,
    subpath: &str,
    req: Request,
) -> AppResult<Response> {
    // Dumb protocol files live inside the canonical store, addressed by the
    // request path relative to the repository root.
    let file_path = state.repos.root().join(format!("{}{}", repo, subpath));
    match op {
        Op::Head | Op::TextFile => {
            proto::send_file(&file_path, "text/plain", proto::CachePolicy::NoCache).await
        }
        Op::InfoPacks => {
            proto::send_file(&file_path, "text/plain; charset=utf-8", proto::CachePolicy::NoCache)
                .await
        }
        Op::LooseObject => {
            proto::send_file(&file_path, "x-git-loose-object", proto::CachePolicy::Forever).await
        }
        Op::PackFile => {
            proto::send_file(&file_path, "x-git-packed-objects", proto::CachePolicy::Forever).await
        }
        Op::IdxFile => {
            proto::send_file(&file_path, "x-git-packed-objects-toc", proto::CachePolicy::Forever)
                .await
        }
        Op::InfoRefs => proto::info_refs(state, repo, req.uri(), &file_path).await,
        Op::UploadPack => proto::service_rpc(state, repo, proto::GitService::UploadPack, req).await,
        Op::ReceivePack => {
            proto::service_rpc(state, repo, proto::GitService::ReceivePack, req).await
        }
        Op::Overview => web::overview(state, repo).await,
        Op::Tree => web::tree(state, repo, subpath).await,
        Op::Blob => web::blob(state, repo, subpath).await,
        Op::ReviewsList => web::reviews_list(state, repo),
        Op::ReviewsAction => web::reviews_action(state, repo, req).await,
        Op::ReviewDetail => web::review_detail(state, repo, subpath, req.uri()).await,
        Op::ReviewAction => web::review_action(state, repo, req).await,
    }
}

/// First value of a query parameter, if present. Parameters here (service
/// names, commit ids) never need percent-decoding.
pub(crate) fn query_param(uri: &Uri, name: &str) -> Option<String> {
    uri.query()?.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == name && !v.is_empty()).then(|| v.to_string())
    })
}
