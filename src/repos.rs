//!
//! adit repository lifecycle
//! -------------------------
//! Scans, validates, creates and removes repository directories under the
//! repository root. Every repository is an on-disk pair: the canonical bare
//! store `<name>` that clients push to and fetch from, and the shadow
//! checkout `<name>.r` that only the merge engine touches. Creating one
//! creates the other; removing one removes the other plus the repository's
//! review metadata.
//!
//! The root obeys a strict two-level shape: a child of the root is either a
//! bare repository or a group whose every child is a bare repository. Any
//! other shape is a structural error, never a silent skip.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::{Config, PRIMARY_BRANCH};
use crate::error::{AppError, AppResult};
use crate::git;

/// Suffix marking a shadow store next to its canonical store.
pub const SHADOW_SUFFIX: &str = ".r";

/// A repository listed by `scan`.
#[derive(Debug, Clone, Serialize)]
pub struct RepoEntry {
    pub name: String,
    /// Relative date of the last commit, empty when the repository has none.
    pub updated: String,
}

/// A named group of repositories. The ungrouped bucket has an empty name and
/// always sorts last.
#[derive(Debug, Clone, Serialize)]
pub struct RepoGroup {
    pub name: String,
    pub repos: Vec<RepoEntry>,
}

/// Handle over the repository root and the mirrored review-metadata root.
#[derive(Clone)]
pub struct RepoStore {
    repo_root: PathBuf,
    review_root: PathBuf,
}

impl RepoStore {
    pub fn new(cfg: &Config) -> Self {
        RepoStore { repo_root: cfg.repo_root.clone(), review_root: cfg.review_root.clone() }
    }

    pub fn root(&self) -> &Path {
        &self.repo_root
    }

    /// Canonical store directory for a validated repository name.
    pub fn repo_path(&self, repo: &str) -> PathBuf {
        self.repo_root.join(repo)
    }

    /// Shadow store directory paired with the canonical store.
    pub fn shadow_path(&self, repo: &str) -> PathBuf {
        self.repo_root.join(format!("{}{}", repo, SHADOW_SUFFIX))
    }

    /// Resolve the repository portion of a URL path.
    ///
    /// Tests the first path segment, then the first two, against "is this a
    /// bare repository"; the first match wins. Returns the repository name
    /// and the remaining subpath (with its leading slash), or None when
    /// neither prefix denotes a repository.
    pub async fn resolve(&self, url_path: &str) -> Option<(String, String)> {
        let p = url_path.strip_prefix('/').unwrap_or(url_path);
        let segs: Vec<&str> = p.split('/').collect();
        if segs.is_empty() || segs[0].is_empty() {
            return None;
        }
        let one = segs[0].to_string();
        if git::is_git_dir(&self.repo_root.join(&one)).await {
            return Some((one.clone(), p[one.len()..].to_string()));
        }
        if segs.len() < 2 {
            return None;
        }
        let two = format!("{}/{}", segs[0], segs[1]);
        if git::is_git_dir(&self.repo_root.join(&two)).await {
            return Some((two.clone(), p[two.len()..].to_string()));
        }
        None
    }

    /// Scan the repository root, creating it when missing.
    ///
    /// Returns groups sorted by name with the ungrouped bucket appended
    /// last; entries within each group are sorted by name. Shadow stores are
    /// skipped; anything else that is not a repository at the allowed depth
    /// is a structural error.
    pub async fn scan(&self) -> AppResult<Vec<RepoGroup>> {
        fs::create_dir_all(&self.repo_root)?;

        let mut grouped: BTreeMap<String, Vec<RepoEntry>> = BTreeMap::new();
        let mut ungrouped: Vec<RepoEntry> = Vec::new();

        for entry in fs::read_dir(&self.repo_root)? {
            let entry = entry?;
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if !path.is_dir() {
                return Err(AppError::corrupt(
                    "bad_root_entry".to_string(),
                    format!("entry should be a directory: {}", path.display()),
                ));
            }
            if name.ends_with(SHADOW_SUFFIX) {
                continue;
            }
            if git::is_git_dir(&path).await {
                ungrouped.push(RepoEntry { name, updated: git::last_update(&path).await });
                continue;
            }

            // Not a repository itself, so it must be a group whose every
            // child is a repository.
            let mut repos: Vec<RepoEntry> = Vec::new();
            let mut seen_child = false;
            for child in fs::read_dir(&path)? {
                let child = child?;
                let child_path = child.path();
                let child_name = child.file_name().to_string_lossy().into_owned();
                if !child_path.is_dir() {
                    return Err(AppError::corrupt(
                        "bad_group_entry".to_string(),
                        format!("entry should be a directory: {}", child_path.display()),
                    ));
                }
                if child_name.ends_with(SHADOW_SUFFIX) {
                    seen_child = true;
                    continue;
                }
                if !git::is_git_dir(&child_path).await {
                    return Err(AppError::corrupt(
                        "bad_group_entry".to_string(),
                        format!("max depth reached, but not a repository: {}", child_path.display()),
                    ));
                }
                seen_child = true;
                repos.push(RepoEntry {
                    name: child_name,
                    updated: git::last_update(&child_path).await,
                });
            }
            if !seen_child {
                return Err(AppError::corrupt(
                    "empty_group".to_string(),
                    format!("group directory should have at least one child: {}", path.display()),
                ));
            }
            grouped.insert(name, repos);
        }

        let mut groups: Vec<RepoGroup> = grouped
            .into_iter()
            .map(|(name, mut repos)| {
                repos.sort_by(|a, b| a.name.cmp(&b.name));
                RepoGroup { name, repos }
            })
            .collect();
        ungrouped.sort_by(|a, b| a.name.cmp(&b.name));
        groups.push(RepoGroup { name: String::new(), repos: ungrouped });
        Ok(groups)
    }

    /// Create the canonical store, its paired shadow checkout and the
    /// post-receive hook that keeps the shadow a pure mirror.
    pub async fn add_repo(&self, name: &str) -> AppResult<()> {
        validate_name(name)?;

        let d = self.repo_path(name);
        if d.exists() {
            return Err(AppError::user(
                "repo_exists".to_string(),
                format!("repository already exists: {}", name),
            ));
        }
        let primary_ref = format!("refs/heads/{}", PRIMARY_BRANCH);
        fs::create_dir_all(&d)?;
        git::git(&d, &["init", "--bare"]).await?;
        git::git(&d, &["symbolic-ref", "HEAD", &primary_ref]).await?;

        let rd = self.shadow_path(name);
        if rd.exists() {
            return Err(AppError::user(
                "shadow_exists".to_string(),
                format!("shadow store already exists: {}", name),
            ));
        }
        fs::create_dir_all(&rd)?;
        git::git(&rd, &["init"]).await?;
        // Pin the unborn HEAD so the first hook-driven pull lands on the
        // primary branch regardless of the host git's init.defaultBranch.
        git::git(&rd, &["symbolic-ref", "HEAD", &primary_ref]).await?;
        let base = d
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.to_string());
        git::git(&rd, &["remote", "add", "origin", &format!("../{}", base)]).await?;

        let shadow_base = format!("{}{}", base, SHADOW_SUFFIX);
        let hook_path = d.join("hooks").join("post-receive");
        fs::write(&hook_path, post_receive_hook(&shadow_base))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&hook_path, fs::Permissions::from_mode(0o755))?;
        }

        info!("added repository: {}", name);
        Ok(())
    }

    /// Remove the canonical store, the shadow store and the review metadata
    /// for `name`; clean up the enclosing group directory when it becomes
    /// empty. A group that still contains a repository is never removed.
    pub async fn remove_repo(&self, name: &str) -> AppResult<()> {
        validate_name(name)?;

        let d = self.repo_path(name);
        if !d.exists() {
            return Err(AppError::not_found(
                "repo_missing".to_string(),
                format!("repository does not exist: {}", name),
            ));
        }

        let segs: Vec<&str> = name.split('/').collect();
        if segs.len() == 1 && !git::is_git_dir(&d).await {
            // A group directory; refuse while any child repository remains.
            for child in fs::read_dir(&d)? {
                let child = child?;
                if child.path().is_dir() && git::is_git_dir(&child.path()).await {
                    return Err(AppError::user(
                        "group_not_empty".to_string(),
                        format!("group has child repository: {}", name),
                    ));
                }
            }
        }

        fs::remove_dir_all(&d)?;
        remove_if_present(&self.shadow_path(name))?;
        remove_if_present(&self.review_root.join(name))?;

        if segs.len() == 2 {
            // If removing this repository emptied its group, drop the group
            // directory and its mirrored review-metadata directory too.
            let group_dir = self.repo_root.join(segs[0]);
            if group_dir.is_dir() && fs::read_dir(&group_dir)?.next().is_none() {
                fs::remove_dir(&group_dir)?;
                remove_if_present(&self.review_root.join(segs[0]))?;
            }
        }

        info!("removed repository: {}", name);
        Ok(())
    }
}

fn remove_if_present(path: &Path) -> AppResult<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Validate a repository name for creation and removal.
///
/// Rejects empty names, absolute paths, names deeper than the one-group
/// limit, and names containing the dot reserved for internal bookkeeping
/// (the shadow suffix and review status encoding).
pub fn validate_name(name: &str) -> AppResult<()> {
    if name.is_empty() {
        return Err(AppError::user("empty_name".to_string(), "no repository name given".to_string()));
    }
    if name.starts_with('/') {
        return Err(AppError::user(
            "absolute_name".to_string(),
            format!("repository name must be relative: {}", name),
        ));
    }
    if name.split('/').count() > 2 {
        return Err(AppError::user(
            "name_too_deep".to_string(),
            format!("repository path too deep: {}", name),
        ));
    }
    if name.split('/').any(|seg| seg.is_empty()) {
        return Err(AppError::user(
            "empty_segment".to_string(),
            format!("repository name has an empty path segment: {}", name),
        ));
    }
    if name.contains('.') {
        return Err(AppError::user(
            "reserved_char".to_string(),
            format!("repository name must not contain a dot: {}", name),
        ));
    }
    Ok(())
}

/// Post-receive hook text installed into every canonical store.
///
/// For each updated ref reported on stdin: fast-forward pull the primary
/// branch into the shadow store, or fetch and force the shadow's local
/// branch to the fetched tip for any other branch. The shadow never becomes
/// a source of truth.
pub fn post_receive_hook(shadow_dir: &str) -> String {
    format!(
        r#"#!/bin/bash
unset $(git rev-parse --local-env-vars)
while read oldrev newrev refname
do
	branch=$(git rev-parse --symbolic --abbrev-ref $refname)
	cd ../{shadow}
	if [ "$branch" == "{primary}" ]; then
		git pull origin {primary}
	else
		git fetch origin --update-head-ok $branch
		git branch -f $branch origin/$branch
	fi
	cd $OLDPWD
done
"#,
        shadow = shadow_dir,
        primary = PRIMARY_BRANCH,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_validation() {
        assert!(validate_name("proj").is_ok());
        assert!(validate_name("grp/proj").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("/abs").is_err());
        assert!(validate_name("a/b/c").is_err());
        assert!(validate_name("a//b").is_err());
        assert!(validate_name("proj.r").is_err());
        assert!(validate_name("v1.2").is_err());
    }

    #[test]
    fn hook_covers_both_branch_kinds() {
        let hook = post_receive_hook("proj.r");
        assert!(hook.starts_with("#!/bin/bash"));
        assert!(hook.contains("cd ../proj.r"));
        assert!(hook.contains("git pull origin master"));
        assert!(hook.contains("git branch -f $branch origin/$branch"));
    }
}
