//! Startup configuration.
//!
//! All ambient settings (listen address, repository root, review metadata
//! root, shared secret) are collected once at startup into a `Config` that is
//! passed by reference into the gateway, the lifecycle manager and the review
//! engine. There are no mutable globals.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};

/// Fixed username expected in HTTP Basic credentials for `git-receive-pack`.
pub const AUTH_USER: &str = "adit";

/// Realm announced in the `WWW-Authenticate` challenge.
pub const AUTH_REALM: &str = "ADIT";

/// Name of the branch the shadow store fast-forwards on push.
pub const PRIMARY_BRANCH: &str = "master";

#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address, e.g. "0.0.0.0:8080".
    pub http_addr: String,
    /// Root directory holding canonical and shadow stores.
    pub repo_root: PathBuf,
    /// Root directory holding per-repository review metadata.
    pub review_root: PathBuf,
    /// Shared admin/push secret, first line of the secret file.
    pub secret: String,
}

impl Config {
    /// Build configuration from the environment, reading the shared secret
    /// from the given file. An absent or empty secret file is a startup
    /// failure; it is never reported per-request.
    pub fn from_env() -> Result<Self> {
        let http_addr = std::env::var("ADIT_HTTP_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let repo_root = PathBuf::from(std::env::var("ADIT_REPO_ROOT").unwrap_or_else(|_| "repo".to_string()));
        let review_root = PathBuf::from(std::env::var("ADIT_REVIEW_ROOT").unwrap_or_else(|_| "review".to_string()));
        let secret_file = PathBuf::from(std::env::var("ADIT_SECRET_FILE").unwrap_or_else(|_| "password".to_string()));
        let secret = read_secret(&secret_file)?;
        Ok(Config { http_addr, repo_root, review_root, secret })
    }
}

/// Read the shared secret: first line of the file, which must be non-empty.
pub fn read_secret(path: &Path) -> Result<String> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("could not read secret file: {}", path.display()))?;
    let secret = raw.lines().next().unwrap_or("").to_string();
    if secret.is_empty() {
        bail!("secret file is empty: {}", path.display());
    }
    Ok(secret)
}
