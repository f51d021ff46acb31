use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use gh_watchbot::config;
use gh_watchbot::db::{self, SqliteStore};
use gh_watchbot::github::GithubClient;
use gh_watchbot::notifier::{build_bot, TelegramNotifier};
use gh_watchbot::reconcile::Reconciler;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Run one repository discovery and one commit check, then exit"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Only check commits on existing watch links
    #[arg(long)]
    skip_discovery: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| cfg.database_url());
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let reconciler = Reconciler::new(
        Arc::new(SqliteStore::new(pool)),
        Arc::new(GithubClient::from_config(&cfg.github)?),
        Arc::new(TelegramNotifier::new(build_bot(&cfg.telegram)?)),
        cfg.app.max_concurrency,
    );

    if !args.skip_discovery {
        let discovery = reconciler.discover_repositories().await;
        info!("discovery: {}", serde_json::to_string(&discovery)?);
    }
    let commits = reconciler.check_commits().await;
    info!("commit check: {}", serde_json::to_string(&commits)?);

    Ok(())
}
