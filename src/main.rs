use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use teloxide::prelude::*;
use tokio::sync::watch;
use tracing::{error, info};

use gh_watchbot::config;
use gh_watchbot::db::{self, SqliteStore, WatchStore};
use gh_watchbot::github::{GithubClient, GithubService};
use gh_watchbot::handlers::{self, AppState};
use gh_watchbot::notifier::{self, TelegramNotifier};
use gh_watchbot::oauth::{self, OAuthState};
use gh_watchbot::reconcile::Reconciler;
use gh_watchbot::schedule;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
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
    let store: Arc<dyn WatchStore> = Arc::new(SqliteStore::new(pool));

    let github: Arc<dyn GithubService> = Arc::new(GithubClient::from_config(&cfg.github)?);

    let bot =
        notifier::build_bot(&cfg.telegram).context("failed to build the Telegram client")?;
    let me = bot
        .get_me()
        .await
        .context("failed to reach Telegram with the configured bot token")?;
    let bot_username = me.username().to_string();

    let reconciler = Reconciler::new(
        store.clone(),
        github.clone(),
        Arc::new(TelegramNotifier::new(bot.clone())),
        cfg.app.max_concurrency,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let discover = reconciler.clone();
    tokio::spawn(schedule::run_every(
        "discover_repositories",
        schedule::parse(&cfg.schedule.discover)?,
        shutdown_rx.clone(),
        move || {
            let discover = discover.clone();
            async move {
                discover.discover_repositories().await;
            }
        },
    ));

    let commits = reconciler.clone();
    tokio::spawn(schedule::run_every(
        "check_commits",
        schedule::parse(&cfg.schedule.commits)?,
        shutdown_rx.clone(),
        move || {
            let commits = commits.clone();
            async move {
                commits.check_commits().await;
            }
        },
    ));

    let bind: SocketAddr = cfg.http.bind.parse()?;
    let oauth_state = OAuthState {
        github: github.clone(),
        bot_username: bot_username.clone(),
    };
    let server = tokio::spawn(oauth::serve(bind, oauth_state, shutdown_rx));

    let state = AppState {
        store,
        github,
        reconciler,
    };

    info!(bot = %bot_username, "starting telegram bot");
    teloxide::repl(bot, move |bot: Bot, msg: Message| {
        let state = state.clone();
        async move {
            if let Err(err) = handlers::handle_update(&bot, &state, &msg).await {
                error!(?err, "failed to handle update");
            }
            respond(())
        }
    })
    .await;

    info!("shutting down");
    let _ = shutdown_tx.send(true);
    match server.await {
        Ok(Err(err)) => error!(?err, "oauth redirect server failed"),
        Err(err) => error!(?err, "oauth redirect server task aborted"),
        Ok(Ok(())) => {}
    }

    Ok(())
}
