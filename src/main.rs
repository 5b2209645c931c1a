use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Init logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    // Configuration is resolved exactly once; a missing or empty secret
    // file terminates the process here rather than surfacing per-request.
    let cfg = adit::config::Config::from_env()?;
    info!(
        target: "adit",
        "adit starting: addr={}, repo_root='{}', review_root='{}'",
        cfg.http_addr,
        cfg.repo_root.display(),
        cfg.review_root.display()
    );

    adit::server::run(cfg).await
}
