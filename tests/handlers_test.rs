mod common;

use std::sync::Arc;

use common::*;
use gh_watchbot::db::{SqliteStore, WatchStore};
use gh_watchbot::handlers::{dispatch, parse_command, AppState, Command};

fn state(store: &SqliteStore, github: &Arc<FakeGithub>) -> AppState {
    let notifier = RecordingNotifier::new();
    AppState {
        store: Arc::new(store.clone()),
        github: github.clone(),
        reconciler: reconciler(store, github, &notifier),
    }
}

async fn run(state: &AppState, chat_id: &str, text: &str) -> String {
    let command = parse_command(text).expect("command");
    dispatch(state, chat_id, command).await.text
}

#[tokio::test]
async fn start_without_token_links_to_github() {
    let store = setup_store().await;
    let github = FakeGithub::new();
    let reply = dispatch(&state(&store, &github), "100", Command::Start(None)).await;
    assert!(reply.html);
    assert!(reply.text.contains("https://github.com/login/oauth/authorize"));
    assert!(reply.text.contains("&amp;scope=repo"));
}

#[tokio::test]
async fn start_with_token_registers_and_discovers() {
    let store = setup_store().await;
    let github = FakeGithub::new();
    github.add_identity("gho_1", "octocat", "The Octocat").await;
    github
        .push_watched("octocat", Ok(vec![remote("octocat/hello", 5)]))
        .await;
    let state = state(&store, &github);

    let reply = run(&state, "100", "/start gho_1").await;
    assert!(reply.contains("Hello The Octocat (octocat)!"));
    assert!(reply.contains("octocat/hello"));

    let user = store.find_user_by_chat_id("100").await.unwrap().unwrap();
    assert_eq!(user.token, "gho_1");
    assert_eq!(store.list_links_for_user(user.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn repeated_start_refreshes_the_token() {
    let store = setup_store().await;
    let github = FakeGithub::new();
    github.add_identity("gho_1", "octocat", "The Octocat").await;
    github.add_identity("gho_2", "octocat", "The Octocat").await;
    let state = state(&store, &github);

    run(&state, "100", "/start gho_1").await;
    let reply = run(&state, "100", "/start gho_2").await;
    assert!(reply.starts_with("Hello"));

    let user = store.find_user_by_chat_id("100").await.unwrap().unwrap();
    assert_eq!(user.token, "gho_2");
    assert_eq!(store.list_users().await.unwrap().len(), 1);
}

#[tokio::test]
async fn start_with_rejected_token_asks_to_retry() {
    let store = setup_store().await;
    let github = FakeGithub::new();
    let reply = run(&state(&store, &github), "100", "/start bogus").await;
    assert!(reply.contains("try /start again"));
    assert!(store.find_user_by_chat_id("100").await.unwrap().is_none());
}

#[tokio::test]
async fn login_owned_by_another_chat_is_refused() {
    let store = setup_store().await;
    let github = FakeGithub::new();
    github.add_identity("gho_1", "octocat", "The Octocat").await;
    let state = state(&store, &github);

    run(&state, "100", "/start gho_1").await;
    let reply = run(&state, "200", "/start gho_1").await;
    assert!(reply.contains("already connected to another chat"));
    assert!(store.find_user_by_chat_id("200").await.unwrap().is_none());
}

#[tokio::test]
async fn start_with_another_accounts_token_keeps_the_bound_identity() {
    let store = setup_store().await;
    let github = FakeGithub::new();
    add_user(&store, "100", "alice").await;
    github.add_identity("t-bob", "bob", "Bob").await;
    let state = state(&store, &github);

    let reply = run(&state, "100", "/start t-bob").await;
    assert!(reply.contains("already connected to GitHub account alice"), "{reply}");

    let user = store.find_user_by_chat_id("100").await.unwrap().unwrap();
    assert_eq!(user.login, "alice");
    assert_eq!(user.token, "token-alice");
    assert_eq!(github.calls().await, vec!["identity t-bob".to_string()]);
    assert_eq!(store.list_users().await.unwrap().len(), 1);
}

#[tokio::test]
async fn invalid_repository_names_are_rejected_before_any_lookup() {
    let store = setup_store().await;
    let github = FakeGithub::new();
    let state = state(&store, &github);

    for input in ["/watch owner", "/watch owner/repo/extra", "/unwatch bad name"] {
        let reply = run(&state, "100", input).await;
        assert!(reply.contains("not a valid repository name"), "{input}: {reply}");
    }
    assert!(run(&state, "100", "/watch").await.starts_with("Usage: /watch"));
    assert!(github.calls().await.is_empty());
}

#[tokio::test]
async fn unknown_users_are_sent_to_start() {
    let store = setup_store().await;
    let github = FakeGithub::new();
    let state = state(&store, &github);

    for input in ["/me", "/repos", "/watch a/b", "/unwatch a/b"] {
        assert!(run(&state, "100", input).await.contains("/start"), "{input}");
    }
    assert!(github.calls().await.is_empty());
}

#[tokio::test]
async fn watch_and_unwatch_round_trip() {
    let store = setup_store().await;
    let github = FakeGithub::new();
    let alice = add_user(&store, "100", "alice").await;
    github.add_repository(remote("Owner-Name/repo_name", 0)).await;
    let state = state(&store, &github);

    let reply = run(&state, "100", "/watch owner-name/repo_name").await;
    assert_eq!(reply, "Watching Owner-Name/repo_name.");
    // Re-watching is a silent success.
    let reply = run(&state, "100", "/watch owner-name/repo_name").await;
    assert_eq!(reply, "Watching Owner-Name/repo_name.");

    let links = store.list_links_for_user(alice.id).await.unwrap();
    assert_eq!(links.len(), 1);

    let listing = run(&state, "100", "/repos").await;
    assert!(listing.contains("- Owner-Name/repo_name"));

    let reply = run(&state, "100", "/unwatch owner-name/repo_name").await;
    assert_eq!(reply, "Not watching owner-name/repo_name anymore.");
    assert!(store.list_links_for_user(alice.id).await.unwrap().is_empty());
    // Unwatching again is not an error.
    let reply = run(&state, "100", "/unwatch owner-name/repo_name").await;
    assert_eq!(reply, "You were not watching owner-name/repo_name.");
}

#[tokio::test]
async fn unwatch_matches_names_regardless_of_case() {
    let store = setup_store().await;
    let github = FakeGithub::new();
    let alice = add_user(&store, "100", "alice").await;
    github.add_repository(remote("Owner-Name/repo_name", 0)).await;
    let state = state(&store, &github);

    run(&state, "100", "/watch Owner-Name/repo_name").await;
    let reply = run(&state, "100", "/unwatch OWNER-NAME/Repo_Name").await;
    assert!(reply.starts_with("Not watching"), "{reply}");
    assert!(store.list_links_for_user(alice.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn watching_a_missing_repository_reports_not_found() {
    let store = setup_store().await;
    let github = FakeGithub::new();
    let alice = add_user(&store, "100", "alice").await;
    let state = state(&store, &github);

    let reply = run(&state, "100", "/watch nobody/nothing").await;
    assert!(reply.contains("was not found"));
    assert!(store.list_links_for_user(alice.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn me_help_and_unknown() {
    let store = setup_store().await;
    let github = FakeGithub::new();
    add_user(&store, "100", "alice").await;
    let state = state(&store, &github);

    assert!(run(&state, "100", "/me").await.contains("connected as alice"));
    assert!(run(&state, "100", "/help").await.contains("/watch owner/repo"));
    assert!(run(&state, "100", "/nope").await.contains("Unknown command /nope"));
}
