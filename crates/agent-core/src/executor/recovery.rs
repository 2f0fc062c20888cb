//! Error Classification and Recovery
//!
//! Step failures are classified by message into a small set of kinds, and
//! each kind maps to a strategy deciding whether to retry, replan or abort.

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::ExecutorConfig;

static RETRY_AFTER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)retry[\s_-]*after[\s:=]*(\d+)\s*(ms|milliseconds?|s|secs?|seconds?|m|mins?|minutes?)?\b")
        .expect("retry-after pattern is valid")
});

/// Classified step failure
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    NetworkError,
    RateLimit,
    NotFound,
    AuthError,
    Generic,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 5] = [
        ErrorKind::NetworkError,
        ErrorKind::RateLimit,
        ErrorKind::NotFound,
        ErrorKind::AuthError,
        ErrorKind::Generic,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NetworkError => "NETWORK_ERROR",
            ErrorKind::RateLimit => "RATE_LIMIT",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::AuthError => "AUTH_ERROR",
            ErrorKind::Generic => "GENERIC",
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify an error by substrings of its lower-cased message.
///
/// Total: anything unrecognized, including an empty message, is `Generic`.
pub fn classify_error(error: &impl Display) -> ErrorKind {
    let msg = error.to_string().to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| msg.contains(n));

    if has(&["network", "econnrefused", "econnreset", "timeout", "timed out"]) {
        ErrorKind::NetworkError
    } else if has(&["rate limit", "ratelimit", "429", "too many requests"]) {
        ErrorKind::RateLimit
    } else if has(&["not found", "404"]) {
        ErrorKind::NotFound
    } else if has(&["unauthorized", "forbidden", "401", "403"]) {
        ErrorKind::AuthError
    } else {
        ErrorKind::Generic
    }
}

/// Parse a "retry after N <unit>" hint; a bare number means seconds
pub fn extract_wait_time(error: &impl Display) -> Option<Duration> {
    let msg = error.to_string();
    let caps = RETRY_AFTER.captures(&msg)?;
    let amount: u64 = caps.get(1)?.as_str().parse().ok()?;
    let unit = caps.get(2).map_or("s", |m| m.as_str()).to_lowercase();

    let wait = if unit.starts_with("ms") || unit.starts_with("milli") {
        Duration::from_millis(amount)
    } else if unit.starts_with('m') {
        Duration::from_secs(amount.saturating_mul(60))
    } else {
        Duration::from_secs(amount)
    };
    Some(wait)
}

/// What to do about a failed attempt
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RecoveryAction {
    Retry { wait: Option<Duration> },
    Replan,
    Abort,
}

impl RecoveryAction {
    pub fn name(&self) -> &'static str {
        match self {
            RecoveryAction::Retry { .. } => "retry",
            RecoveryAction::Replan => "replan",
            RecoveryAction::Abort => "abort",
        }
    }
}

/// Details of one failed attempt, handed to a strategy
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FailureInfo {
    pub step_id: String,
    pub kind: ErrorKind,
    pub message: String,
    /// Failed attempts so far, starting at 1
    pub attempt: u32,
    pub wait_hint: Option<Duration>,
}

/// Entry in the executor's error history
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub step_id: String,
    pub kind: ErrorKind,
    pub message: String,
    pub attempt: u32,
    pub action: String,
    pub timestamp: DateTime<Utc>,
}

impl ErrorRecord {
    pub fn new(info: &FailureInfo, action: &RecoveryAction) -> Self {
        Self {
            step_id: info.step_id.clone(),
            kind: info.kind,
            message: info.message.clone(),
            attempt: info.attempt,
            action: action.name().into(),
            timestamp: Utc::now(),
        }
    }
}

pub type RecoveryStrategy = Arc<dyn Fn(&FailureInfo) -> RecoveryAction + Send + Sync>;

/// Error kind to strategy mapping; kinds without a strategy abort
#[derive(Clone, Default)]
pub struct RecoveryStrategies {
    strategies: HashMap<ErrorKind, RecoveryStrategy>,
}

impl std::fmt::Debug for RecoveryStrategies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryStrategies")
            .field("kinds", &self.strategies.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl RecoveryStrategies {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Built-in strategies:
    /// - network errors retry with exponential backoff, then replan
    /// - rate limits wait for the hinted time, then replan (which injects a wait step)
    /// - not-found replans immediately
    /// - auth errors abort
    /// - anything else retries, then replans
    pub fn defaults(config: &ExecutorConfig) -> Self {
        let max_attempts = config.max_step_retries;
        let base = config.base_backoff();
        let max_wait = config.max_wait();
        let rate_limit_wait = config.default_rate_limit_wait();

        let mut strategies = Self::empty();

        strategies.insert(ErrorKind::NetworkError, move |info: &FailureInfo| {
            if info.attempt < max_attempts {
                let factor = 2u32.saturating_pow(info.attempt.saturating_sub(1));
                RecoveryAction::Retry {
                    wait: Some(base.saturating_mul(factor).min(max_wait)),
                }
            } else {
                RecoveryAction::Replan
            }
        });

        strategies.insert(ErrorKind::RateLimit, move |info: &FailureInfo| {
            if info.attempt < 2 {
                RecoveryAction::Retry {
                    wait: Some(info.wait_hint.unwrap_or(rate_limit_wait).min(max_wait)),
                }
            } else {
                RecoveryAction::Replan
            }
        });

        strategies.insert(ErrorKind::NotFound, |_: &FailureInfo| RecoveryAction::Replan);

        strategies.insert(ErrorKind::AuthError, |_: &FailureInfo| RecoveryAction::Abort);

        strategies.insert(ErrorKind::Generic, move |info: &FailureInfo| {
            if info.attempt < max_attempts {
                RecoveryAction::Retry { wait: Some(base) }
            } else {
                RecoveryAction::Replan
            }
        });

        strategies
    }

    /// Register or replace the strategy for `kind`
    pub fn insert<F>(&mut self, kind: ErrorKind, strategy: F)
    where
        F: Fn(&FailureInfo) -> RecoveryAction + Send + Sync + 'static,
    {
        self.strategies.insert(kind, Arc::new(strategy));
    }

    pub fn clear(&mut self) {
        self.strategies.clear();
    }

    pub fn contains(&self, kind: ErrorKind) -> bool {
        self.strategies.contains_key(&kind)
    }

    pub fn resolve(&self, info: &FailureInfo) -> RecoveryAction {
        self.strategies
            .get(&info.kind)
            .map_or(RecoveryAction::Abort, |strategy| strategy(info))
    }
}
