//!
//! adit review engine
//! ------------------
//! A review is a directory `<id>.<status>` under the review metadata root,
//! with the title in a `TITLE` file. Status is one of open/merged/closed and
//! the only mutation a review directory ever sees is a single atomic rename
//! on its terminal transition. Ids are strictly increasing per repository
//! and never reused, even after a review is merged or closed.
//!
//! Each review designates the branch `adit/review/<id>` in the canonical
//! store. Metadata and branch exist independently: a review can be created
//! before anything is pushed to its branch.
//!
//! Merging squashes the review branch into a target branch inside the shadow
//! store, so the whole checkout/merge/commit/push/restore sequence is
//! serialized by a per-repository lock registry.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::git;
use crate::repos::RepoStore;

/// Namespace prefix of review branches in the canonical store.
pub const REVIEW_BRANCH_PREFIX: &str = "adit/review/";

/// Filename of the review title inside a review directory.
const TITLE_FILE: &str = "TITLE";

/// Id of git's well-known empty tree, used to diff a history that has no
/// commit before its start.
const EMPTY_TREE_ID: &str = "4b825dc642cb6eb9a060e54bf8d69288fbee4904";

static REVIEW_DIR_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([0-9]+)\.(open|merged|closed)$").unwrap());

/// Review lifecycle state. Open may transition once, to merged or closed;
/// both are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewStatus {
    Open,
    Merged,
    Closed,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewStatus::Open => "open",
            ReviewStatus::Merged => "merged",
            ReviewStatus::Closed => "closed",
        }
    }
}

impl Display for ReviewStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One persisted review.
#[derive(Debug, Clone, Serialize)]
pub struct Review {
    pub id: u64,
    pub title: String,
    pub status: ReviewStatus,
}

/// Outcome of a diff request for a review.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum ReviewDiff {
    /// Metadata exists but nothing was pushed to the review branch yet.
    Pending { branch: String },
    /// Commit ids in range (newest first) and the unified diff text.
    Ready { commits: Vec<String>, diff: String },
}

/// Name of the branch designated by a review id.
pub fn review_branch(id: u64) -> String {
    format!("{}{}", REVIEW_BRANCH_PREFIX, id)
}

/// Encode a review directory name from id and status.
pub fn encode_dirname(id: u64, status: ReviewStatus) -> String {
    format!("{}.{}", id, status.as_str())
}

/// Decode a review directory name. A name outside the `<id>.<status>`
/// grammar is metadata corruption, reported as a structural error.
pub fn decode_dirname(name: &str) -> AppResult<(u64, ReviewStatus)> {
    let caps = REVIEW_DIR_PATTERN.captures(name).ok_or_else(|| {
        AppError::corrupt(
            "bad_review_dir".to_string(),
            format!("review directory name does not match naming rule: {}", name),
        )
    })?;
    let id: u64 = caps[1].parse().map_err(|_| {
        AppError::corrupt(
            "bad_review_dir".to_string(),
            format!("review id out of range: {}", name),
        )
    })?;
    let status = match &caps[2] {
        "open" => ReviewStatus::Open,
        "merged" => ReviewStatus::Merged,
        _ => ReviewStatus::Closed,
    };
    Ok((id, status))
}

/// Registry of per-repository merge locks.
///
/// Locks live for the life of the process and are shared across all calls
/// for the same repository, so two merges against one repository serialize
/// while merges against different repositories proceed independently.
#[derive(Clone, Default)]
pub struct MergeLocks {
    inner: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl MergeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock for one repository, created on first use.
    pub fn for_repo(&self, repo: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.inner.lock().entry(repo.to_string()).or_default().clone()
    }
}

/// Review persistence and merge operations for all repositories.
#[derive(Clone)]
pub struct ReviewStore {
    review_root: PathBuf,
    repos: RepoStore,
    locks: MergeLocks,
}

impl ReviewStore {
    pub fn new(cfg: &Config, repos: RepoStore) -> Self {
        ReviewStore { review_root: cfg.review_root.clone(), repos, locks: MergeLocks::new() }
    }

    /// Merge locks registry, exposed for tests that assert serialization.
    pub fn locks(&self) -> &MergeLocks {
        &self.locks
    }

    fn repo_dir(&self, repo: &str) -> PathBuf {
        self.review_root.join(repo)
    }

    fn review_dir(&self, repo: &str, id: u64, status: ReviewStatus) -> PathBuf {
        self.repo_dir(repo).join(encode_dirname(id, status))
    }

    /// All review directory names for a repository, decoding each one.
    fn decoded_entries(&self, repo: &str) -> AppResult<Vec<(u64, ReviewStatus)>> {
        let dir = self.repo_dir(repo);
        fs::create_dir_all(&dir)?;
        let mut entries = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            entries.push(decode_dirname(&name)?);
        }
        Ok(entries)
    }

    /// Create a new open review and return its id. The id is one past the
    /// maximum ever used for this repository, across all statuses.
    pub fn create_review(&self, repo: &str, title: &str) -> AppResult<u64> {
        let id = self
            .decoded_entries(repo)?
            .into_iter()
            .map(|(id, _)| id)
            .max()
            .map(|max| max + 1)
            .unwrap_or(1);
        let dir = self.review_dir(repo, id, ReviewStatus::Open);
        fs::create_dir(&dir)?;
        fs::write(dir.join(TITLE_FILE), title)?;
        info!("created review {}/{}: {}", repo, id, title);
        Ok(id)
    }

    /// List reviews newest-id-first, truncated to `limit`.
    pub fn list_reviews(&self, repo: &str, limit: usize) -> AppResult<Vec<Review>> {
        let mut entries = self.decoded_entries(repo)?;
        entries.sort_by(|a, b| b.0.cmp(&a.0));
        entries.truncate(limit);
        let mut reviews = Vec::with_capacity(entries.len());
        for (id, status) in entries {
            let title = self.read_title(repo, id, status)?;
            reviews.push(Review { id, title, status });
        }
        Ok(reviews)
    }

    /// Look up a single review by id, in whatever status it is in.
    pub fn find_review(&self, repo: &str, id: u64) -> AppResult<Review> {
        for (eid, status) in self.decoded_entries(repo)? {
            if eid == id {
                let title = self.read_title(repo, id, status)?;
                return Ok(Review { id, title, status });
            }
        }
        Err(AppError::not_found(
            "review_missing".to_string(),
            format!("review not found: {}/{}", repo, id),
        ))
    }

    fn read_title(&self, repo: &str, id: u64, status: ReviewStatus) -> AppResult<String> {
        let path = self.review_dir(repo, id, status).join(TITLE_FILE);
        fs::read_to_string(&path).map_err(|e| {
            AppError::corrupt(
                "missing_title".to_string(),
                format!("could not read review title {}: {}", path.display(), e),
            )
        })
    }

    /// Atomically rename the open review directory to its terminal status.
    fn transition(&self, repo: &str, id: u64, to: ReviewStatus) -> AppResult<()> {
        let from = self.review_dir(repo, id, ReviewStatus::Open);
        if !from.is_dir() {
            return Err(AppError::not_found(
                "review_not_open".to_string(),
                format!("no open review: {}/{}", repo, id),
            ));
        }
        fs::rename(&from, self.review_dir(repo, id, to))?;
        info!("review {}/{} -> {}", repo, id, to);
        Ok(())
    }

    /// Close an open review. No repository mutation.
    pub fn close_review(&self, repo: &str, id: u64) -> AppResult<()> {
        self.transition(repo, id, ReviewStatus::Closed)
    }

    /// Commits and unified diff for a review against `base`.
    ///
    /// A review whose branch was never pushed reports `Pending`, distinct
    /// from a missing review, so callers can render a setup state. The diff
    /// range starts one commit before the merge-base so the merge-base
    /// commit's own changes are included; when the merge-base is the very
    /// first commit (or the base branch has no commits at all) the range
    /// starts from the empty tree instead, since no earlier point exists.
    pub async fn review_diff(&self, repo: &str, id: u64, base: &str) -> AppResult<ReviewDiff> {
        self.find_review(repo, id)?;

        let dir = self.repos.repo_path(repo);
        let branch = review_branch(id);
        if !git::branch_exists(&dir, &branch).await? {
            return Ok(ReviewDiff::Pending { branch });
        }

        if !git::branch_exists(&dir, base).await? {
            // Base branch has no history; the review branch's full history
            // is the range.
            let out = git::git(&dir, &["rev-list", &branch]).await?;
            let commits = out.lines().map(|l| l.to_string()).collect();
            let diff = git::git(&dir, &["diff", &format!("{}..{}", EMPTY_TREE_ID, branch)]).await?;
            return Ok(ReviewDiff::Ready { commits, diff });
        }

        let out = git::git(&dir, &["merge-base", "--all", &branch, base]).await?;
        let merge_base = out.lines().next().unwrap_or("").trim().to_string();
        if merge_base.is_empty() {
            return Err(AppError::subprocess(
                "no_merge_base".to_string(),
                format!("no merge base between {} and {}", branch, base),
            ));
        }

        let out = git::git(&dir, &["rev-list", &format!("{}..{}", merge_base, branch)]).await?;
        let commits: Vec<String> = out.lines().map(|l| l.to_string()).collect();

        let initial = git::initial_commit_id(&dir).await?;
        let range_start = if initial.as_deref() == Some(merge_base.as_str()) {
            EMPTY_TREE_ID.to_string()
        } else {
            format!("{}~1", merge_base)
        };
        let diff = git::git(&dir, &["diff", &format!("{}..{}", range_start, branch)]).await?;
        Ok(ReviewDiff::Ready { commits, diff })
    }

    /// Diff of a single commit, shown with full metadata.
    pub async fn commit_detail(&self, repo: &str, commit: &str) -> AppResult<String> {
        let dir = self.repos.repo_path(repo);
        git::git(
            &dir,
            &[
                "show",
                "--pretty=format:commit %H%ntree: %T%nauthor: %an <%ae>%ndate: %ad%n%n\t%B",
                commit,
            ],
        )
        .await
    }

    /// Squash-merge an open review into `target` and transition it to
    /// merged.
    ///
    /// The sequence runs against the shadow store only, under the
    /// repository's merge lock: record the checked-out branch, checkout
    /// `target`, squash-merge the review branch, commit with the review
    /// title as message, push to the canonical store, and finally restore
    /// the recorded branch. Restoration runs on every exit path so the
    /// shadow store is never left on an unexpected branch; a failed merge
    /// leaves the review open for an operator retry.
    pub async fn merge_review(&self, repo: &str, id: u64, target: &str) -> AppResult<()> {
        let review = self.find_review(repo, id)?;
        if review.status != ReviewStatus::Open {
            return Err(AppError::not_found(
                "review_not_open".to_string(),
                format!("no open review: {}/{}", repo, id),
            ));
        }
        let branch = review_branch(id);
        if !git::branch_exists(&self.repos.repo_path(repo), &branch).await? {
            return Err(AppError::user(
                "branch_missing".to_string(),
                format!("review branch was never pushed: {}", branch),
            ));
        }

        let lock = self.locks.for_repo(repo);
        let _guard = lock.lock().await;

        let shadow = self.repos.shadow_path(repo);
        let old_branch = git::current_branch(&shadow).await?;

        let merged: AppResult<()> = async {
            git::git(&shadow, &["checkout", target]).await?;
            git::git(&shadow, &["merge", "--squash", &branch]).await?;
            git::git(&shadow, &["commit", "-m", &review.title]).await?;
            git::git(&shadow, &["push", "origin", target]).await?;
            Ok(())
        }
        .await;

        // Restore the shadow's previous branch even when the merge failed.
        let restored = git::git(&shadow, &["checkout", &old_branch]).await;
        if let Err(e) = &restored {
            warn!("could not restore shadow branch {} for {}: {}", old_branch, repo, e);
        }
        merged?;
        restored?;

        self.transition(repo, id, ReviewStatus::Merged)
    }
}
