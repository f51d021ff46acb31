//! Cron-driven periodic triggers for the reconciliation cycles.

use chrono::{DateTime, Utc};
use cron::Schedule;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
#[error("invalid cron expression {expr:?}: {reason}")]
pub struct ScheduleError {
    pub expr: String,
    pub reason: String,
}

/// Parse a cron expression. Standard 5-field expressions get a leading `0`
/// seconds field and a trailing `*` year field; 6 and 7-field expressions
/// are passed through.
pub fn parse(expr: &str) -> Result<Schedule, ScheduleError> {
    let expr = expr.trim();
    let normalized = match expr.split_whitespace().count() {
        5 => format!("0 {expr} *"),
        _ => expr.to_string(),
    };
    Schedule::from_str(&normalized).map_err(|e| ScheduleError {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

/// First fire time strictly after `after`.
pub fn next_after(schedule: &Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&after).next()
}

/// Run `job` at every fire time of `schedule` until `shutdown` turns true.
///
/// Each firing is spawned onto its own task, so a slow run may overlap the
/// next one.
pub async fn run_every<F, Fut>(
    name: &'static str,
    schedule: Schedule,
    mut shutdown: watch::Receiver<bool>,
    job: F,
) where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut last_fired: Option<DateTime<Utc>> = None;
    loop {
        if *shutdown.borrow() {
            break;
        }
        let now = Utc::now();
        // The wall clock may lag the timer slightly; never fire the same slot twice.
        let from = last_fired.map_or(now, |last| last.max(now));
        let Some(next) = next_after(&schedule, from) else {
            warn!(job = name, "schedule has no future fire times");
            break;
        };
        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
        debug!(job = name, at = %next, "next run scheduled");

        tokio::select! {
            _ = tokio::time::sleep(wait) => {
                last_fired = Some(next);
                tokio::spawn(job());
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!(job = name, "schedule stopped");
}
