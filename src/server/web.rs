//!
//! Listing, admin and review handlers.
//!
//! These endpoints carry the repository admin workflow and the review
//! workflow, plus the browsing data endpoints (overview, tree, blob) built
//! from the tree/blob reader. Responses are JSON built directly from core
//! data; rendering is left to whatever front-end consumes them. Mutating
//! actions check the shared admin secret and redirect on success, so plain
//! HTML forms keep working against them.

use axum::extract::{Form, FromRequest, Request, State};
use axum::http::Uri;
use axum::response::{IntoResponse, Redirect, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::config::PRIMARY_BRANCH;
use crate::error::{AppError, AppResult};
use crate::git::{self, Tree};
use crate::server::AppState;

/// Reviews shown on one listing.
const REVIEW_LIST_LIMIT: usize = 50;

fn check_password(state: &AppState, given: &str) -> AppResult<()> {
    if given != state.config.secret {
        return Err(AppError::forbidden(
            "bad_password".to_string(),
            "password not matched".to_string(),
        ));
    }
    Ok(())
}

async fn read_form<T: serde::de::DeserializeOwned>(req: Request) -> AppResult<T> {
    let Form(form) = Form::<T>::from_request(req, &())
        .await
        .map_err(|e| AppError::user("bad_form".to_string(), format!("could not parse form: {}", e)))?;
    Ok(form)
}

/// `GET /` — every group with its repositories, freshly scanned.
pub async fn list_repos(State(state): State<AppState>) -> AppResult<Json<serde_json::Value>> {
    let groups = state.repos.scan().await?;
    Ok(Json(json!({ "groups": groups })))
}

#[derive(Debug, Deserialize)]
pub struct RepoActionForm {
    password: String,
    #[serde(rename = "addRepo")]
    add_repo: Option<String>,
    #[serde(rename = "removeRepo")]
    remove_repo: Option<String>,
}

/// `POST /action` — create or remove a repository pair, then redirect to
/// the listing.
pub async fn repo_action(
    State(state): State<AppState>,
    Form(form): Form<RepoActionForm>,
) -> AppResult<Response> {
    check_password(&state, &form.password)?;
    if let Some(name) = form.add_repo.as_deref().filter(|n| !n.is_empty()) {
        state.repos.add_repo(name).await?;
    }
    if let Some(name) = form.remove_repo.as_deref().filter(|n| !n.is_empty()) {
        state.repos.remove_repo(name).await?;
    }
    Ok(Redirect::to("/").into_response())
}

fn files_in_tree(t: &Tree) -> usize {
    t.blobs.len() + t.trees.iter().map(files_in_tree).sum::<usize>()
}

/// `GET /<repo>/` — branches, commit counts, recent commits and README of
/// the primary branch. A repository no one has pushed to yet reports a
/// pending state instead of an error.
pub async fn overview(state: &AppState, repo: &str) -> AppResult<Response> {
    let dir = state.repos.repo_path(repo);
    let branches = git::branches(&dir).await?;
    if branches.is_empty() {
        return Ok(Json(json!({ "repo": repo, "state": "pending" })).into_response());
    }

    let count = git::git(&dir, &["rev-list", "--count", PRIMARY_BRANCH]).await?;
    let n_commits: u64 = count.trim().parse().map_err(|_| {
        AppError::internal(
            "bad_commit_count".to_string(),
            format!("unparsable commit count: {}", count.trim()),
        )
    })?;

    let log = git::git(&dir, &["log", "--pretty=oneline", "-10", PRIMARY_BRANCH]).await?;
    let recent: Vec<serde_json::Value> = log
        .lines()
        .filter_map(|l| l.split_once(' '))
        .map(|(id, title)| json!({ "id": id, "title": title }))
        .collect();

    let tree_id = git::commit_tree(&dir, PRIMARY_BRANCH).await?;
    let top = git::tree_at(&dir, &tree_id).await?;
    let n_files = files_in_tree(&top);
    let mut readme = None;
    if let Some(blob) = top.blobs.iter().find(|b| b.name == "README") {
        let bytes = git::blob_content(&dir, &blob.id).await?;
        readme = Some(String::from_utf8_lossy(&bytes).into_owned());
    }

    Ok(Json(json!({
        "repo": repo,
        "state": "ready",
        "branches": branches,
        "n_commits": n_commits,
        "recent_commits": recent,
        "n_files": n_files,
        "readme": readme,
    }))
    .into_response())
}

/// `GET /<repo>/tree/<id>` — recursive listing of a tree object; without an
/// id, the root tree of the primary branch's head commit.
pub async fn tree(state: &AppState, repo: &str, subpath: &str) -> AppResult<Response> {
    let dir = state.repos.repo_path(repo);
    let mut id = subpath.strip_prefix("/tree/").unwrap_or("").to_string();
    if id.is_empty() {
        id = git::commit_tree(&dir, PRIMARY_BRANCH).await?;
    }
    let top = git::tree_at(&dir, &id).await?;
    Ok(Json(json!({ "repo": repo, "tree": top })).into_response())
}

/// `GET /<repo>/blob/<id>` — raw blob bytes.
pub async fn blob(state: &AppState, repo: &str, subpath: &str) -> AppResult<Response> {
    let id = subpath.strip_prefix("/blob/").unwrap_or("");
    if id.is_empty() {
        return Err(AppError::user(
            "missing_blob_id".to_string(),
            "no blob id given".to_string(),
        ));
    }
    let bytes = git::blob_content(&state.repos.repo_path(repo), id).await?;
    Ok(([("Content-Type", "application/octet-stream")], bytes).into_response())
}

/// `GET /<repo>/reviews/` — newest reviews first.
pub fn reviews_list(state: &AppState, repo: &str) -> AppResult<Response> {
    let reviews = state.reviews.list_reviews(repo, REVIEW_LIST_LIMIT)?;
    Ok(Json(json!({ "repo": repo, "reviews": reviews })).into_response())
}

#[derive(Debug, Deserialize)]
struct ReviewsActionForm {
    password: String,
    title: String,
}

/// `POST /<repo>/reviews/action` — create a review, redirect to the list.
pub async fn reviews_action(state: &AppState, repo: &str, req: Request) -> AppResult<Response> {
    let form: ReviewsActionForm = read_form(req).await?;
    check_password(state, &form.password)?;
    if !form.title.is_empty() {
        state.reviews.create_review(repo, &form.title)?;
    }
    Ok(Redirect::to(&format!("/{}/reviews/", repo)).into_response())
}

/// `GET /<repo>/review/<n>` — review metadata plus its diff, or a single
/// commit's diff when `?diff=<id>` is given. A review whose branch was
/// never pushed reports a pending diff state rather than an error.
pub async fn review_detail(
    state: &AppState,
    repo: &str,
    subpath: &str,
    uri: &Uri,
) -> AppResult<Response> {
    let nstr = subpath.rsplit('/').next().unwrap_or("");
    let id: u64 = nstr.parse().map_err(|_| {
        AppError::forbidden(
            "bad_review_id".to_string(),
            format!("not a review id: {}", nstr),
        )
    })?;
    let review = state.reviews.find_review(repo, id)?;

    if let Some(commit) = crate::server::query_param(uri, "diff") {
        let detail = state.reviews.commit_detail(repo, &commit).await?;
        return Ok(Json(json!({
            "repo": repo,
            "review": review,
            "commit": commit,
            "diff": detail,
        }))
        .into_response());
    }

    let diff = state.reviews.review_diff(repo, id, PRIMARY_BRANCH).await?;
    Ok(Json(json!({ "repo": repo, "review": review, "diff": diff })).into_response())
}

#[derive(Debug, Deserialize)]
struct ReviewActionForm {
    password: String,
    n: u64,
    action: String,
}

/// `POST /<repo>/review/action` — merge or close an open review, redirect
/// to its detail page.
pub async fn review_action(state: &AppState, repo: &str, req: Request) -> AppResult<Response> {
    let form: ReviewActionForm = read_form(req).await?;
    check_password(state, &form.password)?;
    match form.action.as_str() {
        "merge" => state.reviews.merge_review(repo, form.n, PRIMARY_BRANCH).await?,
        "close" => state.reviews.close_review(repo, form.n)?,
        other => {
            return Err(AppError::user(
                "bad_action".to_string(),
                format!("unknown review action: {}", other),
            ));
        }
    }
    Ok(Redirect::to(&format!("/{}/review/{}", repo, form.n)).into_response())
}
