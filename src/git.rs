//!
//! adit git plumbing
//! -----------------
//! Thin wrapper around the `git` binary. Every repository operation in the
//! crate goes through the invoker in this module: it runs git with a working
//! directory, captures stdout/stderr, and reports non-zero exits as
//! `AppError::Subprocess` with the full command line and output logged.
//!
//! Also contains the tree/blob reader: parsers that turn `cat-file` plumbing
//! output into a recursive directory/file structure and raw blob bytes.
//!
//! A process-wide counter of live git subprocesses is kept so the principal
//! scalability ceiling (one blocked worker per subprocess) stays observable.

use serde::Serialize;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::process::Command;
use tracing::debug;

use crate::error::{AppError, AppResult};

static LIVE_GIT: AtomicUsize = AtomicUsize::new(0);

/// Number of git subprocesses currently running.
pub fn live_subprocesses() -> usize {
    LIVE_GIT.load(Ordering::Relaxed)
}

async fn run(dir: &Path, args: &[&str]) -> AppResult<std::process::Output> {
    let mut cmd = Command::new("git");
    cmd.args(args).current_dir(dir).stdin(Stdio::null());
    let live = LIVE_GIT.fetch_add(1, Ordering::Relaxed) + 1;
    debug!(live, "git {} (in {})", args.join(" "), dir.display());
    let out = cmd.output().await;
    LIVE_GIT.fetch_sub(1, Ordering::Relaxed);
    out.map_err(|e| {
        AppError::subprocess(
            "git_spawn".to_string(),
            format!("could not run git {}: {}", args.join(" "), e),
        )
    })
}

/// Spawn git with piped stdin/stdout/stderr for stateless-RPC streaming.
/// The caller must hand the child to `finish_streaming` once the output has
/// been consumed, so the live counter stays accurate.
pub fn spawn_streaming(dir: &Path, args: &[&str]) -> AppResult<tokio::process::Child> {
    let mut cmd = Command::new("git");
    cmd.args(args)
        .current_dir(dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let live = LIVE_GIT.fetch_add(1, Ordering::Relaxed) + 1;
    debug!(live, "git {} (in {}, streaming)", args.join(" "), dir.display());
    cmd.spawn().map_err(|e| {
        LIVE_GIT.fetch_sub(1, Ordering::Relaxed);
        AppError::subprocess(
            "git_spawn".to_string(),
            format!("could not run git {}: {}", args.join(" "), e),
        )
    })
}

/// Wait for a streaming child and log a non-zero exit. By then the output
/// has already been sent to the client, so the failure is reported in the
/// log only and never retried.
pub async fn finish_streaming(mut child: tokio::process::Child, desc: String) {
    use tokio::io::AsyncReadExt;
    let mut stderr_text = String::new();
    if let Some(mut stderr) = child.stderr.take() {
        let _ = stderr.read_to_string(&mut stderr_text).await;
    }
    let status = child.wait().await;
    LIVE_GIT.fetch_sub(1, Ordering::Relaxed);
    match status {
        Ok(s) if s.success() => {}
        Ok(s) => tracing::error!("{} exited with {}: {}", desc, s, stderr_text.trim_end()),
        Err(e) => tracing::error!("{} wait failed: {}", desc, e),
    }
}

/// Run git in `dir` and return stdout as UTF-8 text.
///
/// A non-zero exit becomes `AppError::Subprocess`; the command and its full
/// output are logged and never retried.
pub async fn git(dir: &Path, args: &[&str]) -> AppResult<String> {
    Ok(String::from_utf8_lossy(&git_bytes(dir, args).await?).into_owned())
}

/// Run git in `dir` and return raw stdout bytes (blob content, pack data).
pub async fn git_bytes(dir: &Path, args: &[&str]) -> AppResult<Vec<u8>> {
    let out = run(dir, args).await?;
    if !out.status.success() {
        let msg = format!(
            "git {} (in {}) failed: {}{}",
            args.join(" "),
            dir.display(),
            String::from_utf8_lossy(&out.stdout),
            String::from_utf8_lossy(&out.stderr),
        );
        tracing::error!("{}", msg.trim_end());
        return Err(AppError::subprocess("git_failed".to_string(), msg));
    }
    Ok(out.stdout)
}

/// Whether `dir` is the root of a bare git repository.
///
/// Canonical stores are bare, so `rev-parse --git-dir` prints "." exactly.
/// A missing or non-git directory is simply not a repository; only the bare
/// check decides.
pub async fn is_git_dir(dir: &Path) -> bool {
    match run(dir, &["rev-parse", "--git-dir"]).await {
        Ok(out) => out.status.success() && String::from_utf8_lossy(&out.stdout).trim_end() == ".",
        Err(_) => false,
    }
}

/// Relative date of the most recent commit, empty string if there is none.
pub async fn last_update(dir: &Path) -> String {
    match git(dir, &["log", "--pretty=format:%ar", "-1"]).await {
        Ok(out) => out,
        Err(_) => String::new(),
    }
}

/// Name of the branch HEAD currently points at.
pub async fn current_branch(dir: &Path) -> AppResult<String> {
    let out = git(dir, &["rev-parse", "--abbrev-ref", "HEAD"]).await?;
    Ok(out.trim_end().to_string())
}

/// Id of the repository's very first commit, or None when the repository has
/// no commits at all.
pub async fn initial_commit_id(dir: &Path) -> AppResult<Option<String>> {
    let out = git(dir, &["rev-list", "--all", "--reverse"]).await?;
    Ok(out.lines().next().map(|l| l.to_string()))
}

/// Whether the given local branch exists.
pub async fn branch_exists(dir: &Path, branch: &str) -> AppResult<bool> {
    let out = git(dir, &["branch", "--list", branch]).await?;
    Ok(!out.trim().is_empty())
}

/// Local branch names, with the current-branch marker stripped.
pub async fn branches(dir: &Path) -> AppResult<Vec<String>> {
    let out = git(dir, &["branch"]).await?;
    Ok(out
        .lines()
        .map(|l| l.trim_start_matches(['*', ' ']).trim_end().to_string())
        .filter(|l| !l.is_empty())
        .collect())
}

/// A directory parsed from git tree plumbing output. Children are fully
/// expanded, so one `Tree` carries the whole hierarchy below it.
#[derive(Debug, Clone, Serialize)]
pub struct Tree {
    pub id: String,
    pub name: String,
    pub trees: Vec<Tree>,
    pub blobs: Vec<Blob>,
}

/// A file entry inside a `Tree`.
#[derive(Debug, Clone, Serialize)]
pub struct Blob {
    pub id: String,
    pub name: String,
}

/// Resolve a commit-ish to the id of its root tree.
pub async fn commit_tree(dir: &Path, commit: &str) -> AppResult<String> {
    let t = git(dir, &["cat-file", "-t", commit]).await?;
    if t.trim_end() != "commit" {
        return Err(AppError::not_found(
            "not_a_commit".to_string(),
            format!("{} is not a commit id", commit),
        ));
    }
    let id = git(dir, &["rev-parse", commit]).await?;
    let body = git(dir, &["cat-file", "-p", id.trim_end()]).await?;
    let first = body.lines().next().unwrap_or("");
    match first.strip_prefix("tree ") {
        Some(tid) => Ok(tid.to_string()),
        None => Err(AppError::corrupt(
            "bad_commit_object".to_string(),
            format!("commit object {} does not start with a tree line", commit),
        )),
    }
}

/// Parse the full tree hierarchy below the given tree id.
pub async fn tree_at(dir: &Path, id: &str) -> AppResult<Tree> {
    let t = git(dir, &["cat-file", "-t", id]).await?;
    if t.trim_end() != "tree" {
        return Err(AppError::not_found(
            "not_a_tree".to_string(),
            format!("{} is not a tree id", id),
        ));
    }
    parse_tree(dir, id.to_string(), String::new()).await
}

// Recursive descent over `cat-file -p <tree>` output. Boxed because async
// recursion needs an indirection.
fn parse_tree<'a>(
    dir: &'a Path,
    id: String,
    name: String,
) -> Pin<Box<dyn Future<Output = AppResult<Tree>> + Send + 'a>> {
    Box::pin(async move {
        let out = git(dir, &["cat-file", "-p", &id]).await?;
        let mut top = Tree { id, name, trees: Vec::new(), blobs: Vec::new() };
        for line in out.lines() {
            let Some((kind, child_id, child_name)) = parse_tree_entry(line) else {
                continue;
            };
            if kind == "tree" {
                top.trees.push(parse_tree(dir, child_id.to_string(), child_name.to_string()).await?);
            } else {
                top.blobs.push(Blob { id: child_id.to_string(), name: child_name.to_string() });
            }
        }
        Ok(top)
    })
}

/// Split one `cat-file -p` tree line into (kind, id, name).
///
/// Lines look like:
/// `100644 blob e6e777ec163436193a336a561cfbf57c3b06ccaa\tREADME.md`
fn parse_tree_entry(line: &str) -> Option<(&str, &str, &str)> {
    let (meta, name) = line.split_once('\t')?;
    let mut parts = meta.split(' ');
    let _mode = parts.next()?;
    let kind = parts.next()?;
    let id = parts.next()?;
    Some((kind, id, name))
}

/// Raw content of a blob object.
pub async fn blob_content(dir: &Path, id: &str) -> AppResult<Vec<u8>> {
    let t = git(dir, &["cat-file", "-t", id]).await?;
    if t.trim_end() != "blob" {
        return Err(AppError::not_found(
            "not_a_blob".to_string(),
            format!("{} is not a blob id", id),
        ));
    }
    git_bytes(dir, &["cat-file", "-p", id]).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tree_entry_parsing() {
        let line = "100644 blob e6e777ec163436193a336a561cfbf57c3b06ccaa\tREADME.md";
        assert_eq!(
            parse_tree_entry(line),
            Some(("blob", "e6e777ec163436193a336a561cfbf57c3b06ccaa", "README.md"))
        );
        let line = "040000 tree 8094086457b9e41a0c10ee3fef479056542da579\tsome dir";
        assert_eq!(
            parse_tree_entry(line),
            Some(("tree", "8094086457b9e41a0c10ee3fef479056542da579", "some dir"))
        );
        assert_eq!(parse_tree_entry(""), None);
        assert_eq!(parse_tree_entry("not a tree line"), None);
    }
}
