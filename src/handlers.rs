use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::types::ParseMode;
use teloxide::utils::html;
use tracing::{info, instrument, warn};

use crate::db::WatchStore;
use crate::github::{GithubError, GithubService};
use crate::model::{LinkSnapshot, NewUser, RepoName, User};
use crate::reconcile::Reconciler;

const HELP: &str = "Commands:\n\
/start - connect your GitHub account\n\
/me - show the connected GitHub account\n\
/repos - list watched repositories\n\
/watch owner/repo - watch a repository\n\
/unwatch owner/repo - stop watching a repository\n\
/help - show this message";

/// Shared dependencies of the command handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn WatchStore>,
    pub github: Arc<dyn GithubService>,
    pub reconciler: Reconciler,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `/start` with the token handed back by the OAuth redirect, if any.
    Start(Option<String>),
    Me,
    Repos,
    Watch(String),
    Unwatch(String),
    Help,
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub text: String,
    pub html: bool,
}

impl Reply {
    fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            html: false,
        }
    }

    fn html(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            html: true,
        }
    }
}

/// Parse `/command[@bot] [args]`. Returns `None` for text that is not a command.
pub fn parse_command(text: &str) -> Option<Command> {
    let rest = text.trim().strip_prefix('/')?;
    let (head, args) = match rest.split_once(char::is_whitespace) {
        Some((head, args)) => (head, args.trim()),
        None => (rest, ""),
    };
    let name = head.split('@').next().unwrap_or(head).to_ascii_lowercase();
    let command = match name.as_str() {
        "start" => Command::Start((!args.is_empty()).then(|| args.to_string())),
        "me" => Command::Me,
        "repos" => Command::Repos,
        "watch" => Command::Watch(args.to_string()),
        "unwatch" => Command::Unwatch(args.to_string()),
        "help" => Command::Help,
        _ => Command::Unknown(format!("/{head}")),
    };
    Some(command)
}

#[instrument(skip_all)]
pub async fn handle_update(bot: &Bot, state: &AppState, msg: &Message) -> Result<()> {
    let Some(text) = msg.text() else {
        return Ok(());
    };
    let chat_id = msg.chat.id.0.to_string();
    let username = msg.from().and_then(|u| u.username.as_deref());

    if let Err(err) = state
        .store
        .log_inbound_message(&chat_id, username, text, msg.date)
        .await
    {
        warn!(?err, "failed to log inbound message");
    }

    let reply = match parse_command(text) {
        Some(command) => dispatch(state, &chat_id, command).await,
        None => Reply::plain("Type /help to see what I can do."),
    };

    let mut request = bot.send_message(msg.chat.id, reply.text);
    if reply.html {
        request = request
            .parse_mode(ParseMode::Html)
            .disable_web_page_preview(true);
    }
    request.await?;
    Ok(())
}

/// Execute one command for the chat `chat_id`. Errors become replies.
pub async fn dispatch(state: &AppState, chat_id: &str, command: Command) -> Reply {
    match command {
        Command::Start(None) => authorize_link(state),
        Command::Start(Some(token)) => register(state, chat_id, &token).await,
        Command::Me => me(state, chat_id).await,
        Command::Repos => repos(state, chat_id).await,
        Command::Watch(arg) => watch(state, chat_id, &arg).await,
        Command::Unwatch(arg) => unwatch(state, chat_id, &arg).await,
        Command::Help => Reply::plain(HELP),
        Command::Unknown(name) => Reply::plain(format!(
            "Unknown command {name}. Type /help to see what I can do."
        )),
    }
}

fn authorize_link(state: &AppState) -> Reply {
    let url = state.github.authorize_url();
    Reply::html(format!(
        "To get started, <a href=\"{}\">authorize access to your GitHub account</a>.",
        html::escape(&url)
    ))
}

#[instrument(skip_all)]
async fn register(state: &AppState, chat_id: &str, token: &str) -> Reply {
    let identity = match state.github.fetch_identity(token).await {
        Ok(identity) => identity,
        Err(GithubError::Auth(reason)) => {
            warn!(%reason, "identity lookup rejected");
            return Reply::plain("Could not verify your GitHub authorization, please try /start again.");
        }
        Err(err) => {
            warn!(?err, "identity lookup failed");
            return github_unavailable();
        }
    };

    let new_user = NewUser {
        chat_id: chat_id.to_string(),
        login: identity.login.clone(),
        name: identity.name.clone(),
        token: token.to_string(),
    };
    let (mut user, created) = match state.store.upsert_user(&new_user).await {
        Ok(found) => found,
        Err(err) => {
            warn!(?err, "failed to register user");
            return storage_failed();
        }
    };
    if user.chat_id != chat_id {
        return Reply::plain(format!(
            "GitHub account {} is already connected to another chat.",
            identity.login
        ));
    }
    if user.login != identity.login {
        warn!(user_id = user.id, login = %identity.login, "chat bound to another login");
        return Reply::plain(format!(
            "This chat is already connected to GitHub account {}. Authorize as {} to refresh it.",
            user.login, user.login
        ));
    }
    if !created && user.token != token {
        if let Err(err) = state.store.set_user_token(user.id, token).await {
            warn!(?err, "failed to refresh user token");
            return storage_failed();
        }
        user.token = token.to_string();
    }
    info!(user_id = user.id, created, "user connected");

    if let Err(err) = state.reconciler.discover_for_user(&user).await {
        warn!(?err, user_id = user.id, "initial discovery failed");
    }

    let mut text = format!("Hello {} ({})!", user.name, user.login);
    match state.store.list_links_for_user(user.id).await {
        Ok(links) => {
            text.push_str("\n\n");
            text.push_str(&watch_list(&links));
        }
        Err(err) => warn!(?err, "failed to list watch links"),
    }
    Reply::plain(text)
}

async fn me(state: &AppState, chat_id: &str) -> Reply {
    match known_user(state, chat_id).await {
        Ok(user) => Reply::plain(format!(
            "Hello {}! You are connected as {} on GitHub.",
            user.name, user.login
        )),
        Err(reply) => reply,
    }
}

async fn repos(state: &AppState, chat_id: &str) -> Reply {
    let user = match known_user(state, chat_id).await {
        Ok(user) => user,
        Err(reply) => return reply,
    };
    match state.store.list_links_for_user(user.id).await {
        Ok(links) => Reply::plain(watch_list(&links)),
        Err(err) => {
            warn!(?err, "failed to list watch links");
            storage_failed()
        }
    }
}

#[instrument(skip_all, fields(arg = %arg))]
async fn watch(state: &AppState, chat_id: &str, arg: &str) -> Reply {
    let name = match repo_argument("watch", arg) {
        Ok(name) => name,
        Err(reply) => return reply,
    };
    let user = match known_user(state, chat_id).await {
        Ok(user) => user,
        Err(reply) => return reply,
    };

    let remote = match state.github.fetch_repository(&user.token, name.as_str()).await {
        Ok(remote) => remote,
        Err(GithubError::NotFound) => {
            return Reply::plain(format!("Repository {name} was not found on GitHub."))
        }
        Err(err) => {
            warn!(?err, "failed to look up repository");
            return github_unavailable();
        }
    };

    let linked = async {
        let (repository, _) = state
            .store
            .upsert_repository(&remote.name, &remote.full_name)
            .await?;
        state
            .store
            .link_watch(user.id, repository.id, Utc::now())
            .await
    }
    .await;
    match linked {
        Ok((_, created)) => {
            if created {
                info!(user_id = user.id, repo = %remote.full_name, "watch added");
            }
            Reply::plain(format!("Watching {}.", remote.full_name))
        }
        Err(err) => {
            warn!(?err, "failed to store watch link");
            storage_failed()
        }
    }
}

#[instrument(skip_all, fields(arg = %arg))]
async fn unwatch(state: &AppState, chat_id: &str, arg: &str) -> Reply {
    let name = match repo_argument("unwatch", arg) {
        Ok(name) => name,
        Err(reply) => return reply,
    };
    let user = match known_user(state, chat_id).await {
        Ok(user) => user,
        Err(reply) => return reply,
    };

    let removed = async {
        match state.store.find_repository_by_name(name.as_str()).await? {
            Some(repository) => state.store.remove_link(user.id, repository.id).await,
            None => Ok(false),
        }
    }
    .await;
    match removed {
        Ok(removed) => {
            if removed {
                info!(user_id = user.id, repo = %name, "watch removed");
                Reply::plain(format!("Not watching {name} anymore."))
            } else {
                Reply::plain(format!("You were not watching {name}."))
            }
        }
        Err(err) => {
            warn!(?err, "failed to remove watch link");
            storage_failed()
        }
    }
}

fn repo_argument(command: &str, arg: &str) -> Result<RepoName, Reply> {
    if arg.trim().is_empty() {
        return Err(Reply::plain(format!("Usage: /{command} owner/repo")));
    }
    RepoName::parse(arg).map_err(|_| {
        Reply::plain(format!(
            "{:?} is not a valid repository name. Use the form owner/repo.",
            arg.trim()
        ))
    })
}

async fn known_user(state: &AppState, chat_id: &str) -> Result<User, Reply> {
    match state.store.find_user_by_chat_id(chat_id).await {
        Ok(Some(user)) => Ok(user),
        Ok(None) => Err(Reply::plain(
            "I don't know you yet. Type /start to connect your GitHub account.",
        )),
        Err(err) => {
            warn!(?err, "failed to look up user");
            Err(storage_failed())
        }
    }
}

fn watch_list(links: &[LinkSnapshot]) -> String {
    if links.is_empty() {
        return "You are not watching any repositories. Use /watch owner/repo to add one.".into();
    }
    let mut text = String::from("Watched repositories:");
    for link in links {
        text.push_str("\n- ");
        text.push_str(&link.repository.full_name);
    }
    text
}

fn github_unavailable() -> Reply {
    Reply::plain("GitHub could not be reached, please try again later.")
}

fn storage_failed() -> Reply {
    Reply::plain("Something went wrong on our side, please try again later.")
}
