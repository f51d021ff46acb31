pub mod config;
pub mod db;
pub mod github;
pub mod handlers;
pub mod model;
pub mod notifier;
pub mod oauth;
pub mod reconcile;
pub mod schedule;
