use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::ParseMode;
use teloxide::utils::html;
use thiserror::Error;
use tracing::instrument;

use crate::config;
use crate::model::Commit;

/// Commit bodies are cut to this many characters so a notification stays
/// under Telegram's 4096 character message limit.
pub const MAX_BODY_CHARS: usize = 3500;

#[derive(Debug, Error)]
pub enum SendError {
    #[error("telegram request failed: {0}")]
    Telegram(#[from] teloxide::RequestError),
    #[error("{0}")]
    Other(String),
}

/// Delivers a formatted message to a chat recipient.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, chat_id: i64, text: &str) -> Result<(), SendError>;

    /// Whether `notify` renders HTML markup.
    fn supports_markup(&self) -> bool {
        false
    }
}

/// Builds the Bot API client, routed through `telegram.proxy` when configured.
pub fn build_bot(cfg: &config::Telegram) -> Result<Bot, reqwest::Error> {
    let Some(settings) = &cfg.proxy else {
        return Ok(Bot::new(cfg.bot_token.clone()));
    };
    let mut proxy = reqwest::Proxy::all(settings.url.as_str())?;
    if let Some(username) = &settings.username {
        proxy = proxy.basic_auth(username, settings.password.as_deref().unwrap_or_default());
    }
    let client = teloxide::net::default_reqwest_settings()
        .proxy(proxy)
        .build()?;
    Ok(Bot::with_client(cfg.bot_token.clone(), client))
}

#[derive(Debug, Clone)]
pub struct TelegramNotifier {
    bot: Bot,
}

impl TelegramNotifier {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    #[instrument(skip_all, fields(chat_id = chat_id))]
    async fn notify(&self, chat_id: i64, text: &str) -> Result<(), SendError> {
        self.bot
            .send_message(ChatId(chat_id), text)
            .parse_mode(ParseMode::Html)
            .disable_web_page_preview(true)
            .await?;
        Ok(())
    }

    fn supports_markup(&self) -> bool {
        true
    }
}

/// One notification per commit.
pub fn commit_message(full_name: &str, commit: &Commit, markup: bool) -> String {
    let message = commit.message.trim_end();
    if !markup {
        return format!(
            "{} was updated by {} ({}) with commit {}:\n{}",
            full_name,
            commit.author_name,
            commit.author_email,
            commit.short_sha(),
            clip(message.to_string(), false)
        );
    }

    let repo_url = format!("https://github.com/{full_name}");
    let sha_link = match commit.html_url.as_deref() {
        Some(url) => anchor(url, commit.short_sha()),
        None => format!("<code>{}</code>", html::escape(commit.short_sha())),
    };
    format!(
        "{} was updated by {} ({}) with commit {}:\n{}",
        anchor(&repo_url, full_name),
        html::escape(&commit.author_name),
        html::escape(&commit.author_email),
        sha_link,
        clip(html::escape(message), true)
    )
}

/// Sent once when a watched repository disappears.
pub fn repository_removed_message(full_name: &str, markup: bool) -> String {
    let name = if markup {
        format!("<b>{}</b>", html::escape(full_name))
    } else {
        full_name.to_string()
    };
    format!("Repository {name} was not found and has been removed from your watch list.")
}

/// Cuts a rendered body to `MAX_BODY_CHARS` and marks the cut with an ellipsis.
/// With markup the cut never lands inside an entity such as `&lt;`.
fn clip(body: String, markup: bool) -> String {
    let mut cut = match body.char_indices().nth(MAX_BODY_CHARS) {
        Some((at, _)) => at,
        None => return body,
    };
    if markup {
        if let Some(amp) = body[..cut].rfind('&') {
            if !body[amp..cut].contains(';') {
                cut = amp;
            }
        }
    }
    format!("{}…", &body[..cut])
}

fn anchor(url: &str, text: &str) -> String {
    format!("<a href=\"{}\">{}</a>", html::escape(url), html::escape(text))
}
