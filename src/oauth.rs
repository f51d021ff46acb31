//! HTTP listener for the GitHub OAuth redirect.
//!
//! GitHub sends the browser to `/oauth/redirect?code=...`; the code is
//! exchanged for a token and the browser is bounced back into the chat
//! client with the token as the bot's start parameter.

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use url::Url;

use crate::github::GithubService;

pub struct OAuthState {
    pub github: Arc<dyn GithubService>,
    /// Telegram bot username, without the leading `@`.
    pub bot_username: String,
}

#[derive(Debug, Deserialize)]
struct RedirectParams {
    code: Option<String>,
}

pub fn router(state: OAuthState) -> Router {
    Router::new()
        .route("/oauth/redirect", get(redirect))
        .route("/health", get(health))
        .with_state(Arc::new(state))
}

/// Serve until `shutdown` turns true.
pub async fn serve(
    addr: SocketAddr,
    state: OAuthState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "oauth redirect server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
}

async fn health() -> &'static str {
    "ok"
}

async fn redirect(
    State(state): State<Arc<OAuthState>>,
    Query(params): Query<RedirectParams>,
) -> Response {
    let Some(code) = params.code.filter(|c| !c.trim().is_empty()) else {
        return (StatusCode::BAD_REQUEST, "missing authorization code").into_response();
    };

    let token = match state.github.exchange_code_for_token(code.trim()).await {
        Ok(token) => token,
        Err(err) => {
            warn!(?err, "oauth code exchange failed");
            return (StatusCode::BAD_GATEWAY, "could not complete GitHub authorization")
                .into_response();
        }
    };

    match start_link(&state.bot_username, &token) {
        Some(location) => (StatusCode::FOUND, [(header::LOCATION, location)]).into_response(),
        None => {
            warn!(bot = %state.bot_username, "cannot build chat link for bot username");
            (StatusCode::INTERNAL_SERVER_ERROR, "bot link unavailable").into_response()
        }
    }
}

/// `https://t.me/<bot>?start=<token>`
pub fn start_link(bot_username: &str, token: &str) -> Option<String> {
    let bot = bot_username.trim().trim_start_matches('@');
    if bot.is_empty() {
        return None;
    }
    let mut url = Url::parse("https://t.me/").ok()?.join(bot).ok()?;
    url.query_pairs_mut().append_pair("start", token);
    Some(url.to_string())
}
