//! Shared configuration defaults and environment helpers.
//!
//! All tunables of the dispatch subsystem live here so that the producer,
//! executor, monitor and CLI agree on topic names and defaults.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Default topic names.
pub mod topics {
    pub const COMMANDS: &str = "commands";
    pub const RESULTS: &str = "results";
    pub const NOTIFICATIONS: &str = "notifications";
}

/// Consumer group names, one per logical role.
pub mod groups {
    pub const EXECUTORS: &str = "command-executors";
    pub const MONITOR: &str = "command-monitor";
}

/// Dispatch defaults.
pub mod defaults {
    /// Per-command deadline
    pub const COMMAND_TIMEOUT_MS: u64 = 30_000;
    /// Retries after the first attempt
    pub const MAX_RETRIES: u32 = 3;
    /// Fixed delay before a retry is published
    pub const RETRY_DELAY_MS: u64 = 5_000;
    /// Commands executed simultaneously by one executor
    pub const EXECUTOR_CONCURRENCY: usize = 16;
}

/// Environment variable names.
pub mod env_vars {
    use super::{defaults, parse_env, topics};

    pub const COMMAND_TIMEOUT_MS: &str = "BILLNET_COMMAND_TIMEOUT_MS";
    pub const MAX_RETRIES: &str = "BILLNET_MAX_RETRIES";
    pub const RETRY_DELAY_MS: &str = "BILLNET_RETRY_DELAY_MS";
    pub const EXECUTOR_CONCURRENCY: &str = "BILLNET_EXECUTOR_CONCURRENCY";
    pub const TOPIC_COMMANDS: &str = "BILLNET_TOPIC_COMMANDS";
    pub const TOPIC_RESULTS: &str = "BILLNET_TOPIC_RESULTS";
    pub const TOPIC_NOTIFICATIONS: &str = "BILLNET_TOPIC_NOTIFICATIONS";
    pub const LOG_JSON: &str = "BILLNET_LOG_JSON";

    /// Command deadline from the environment, or the default.
    pub fn command_timeout_ms() -> u64 {
        parse_env(COMMAND_TIMEOUT_MS).unwrap_or(defaults::COMMAND_TIMEOUT_MS)
    }

    /// Retry bound from the environment, or the default.
    pub fn max_retries() -> u32 {
        parse_env(MAX_RETRIES).unwrap_or(defaults::MAX_RETRIES)
    }

    /// Retry delay from the environment, or the default.
    pub fn retry_delay_ms() -> u64 {
        parse_env(RETRY_DELAY_MS).unwrap_or(defaults::RETRY_DELAY_MS)
    }

    /// Executor concurrency from the environment, or the default.
    ///
    /// Zero is treated as one.
    pub fn executor_concurrency() -> usize {
        parse_env(EXECUTOR_CONCURRENCY)
            .unwrap_or(defaults::EXECUTOR_CONCURRENCY)
            .max(1)
    }

    pub fn topic_commands() -> String {
        std::env::var(TOPIC_COMMANDS).unwrap_or_else(|_| topics::COMMANDS.to_string())
    }

    pub fn topic_results() -> String {
        std::env::var(TOPIC_RESULTS).unwrap_or_else(|_| topics::RESULTS.to_string())
    }

    pub fn topic_notifications() -> String {
        std::env::var(TOPIC_NOTIFICATIONS).unwrap_or_else(|_| topics::NOTIFICATIONS.to_string())
    }

    /// Whether logs should be emitted as JSON.
    pub fn log_json() -> bool {
        parse_env(LOG_JSON).unwrap_or(false)
    }
}

fn parse_env<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

/// Topic names used by the dispatch subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicNames {
    /// Commands for executors
    pub commands: String,
    /// Results for the monitor
    pub results: String,
    /// Terminal notifications
    pub notifications: String,
}

impl Default for TopicNames {
    fn default() -> Self {
        Self {
            commands: topics::COMMANDS.to_string(),
            results: topics::RESULTS.to_string(),
            notifications: topics::NOTIFICATIONS.to_string(),
        }
    }
}

impl TopicNames {
    /// Topic names from the environment.
    pub fn from_env() -> Self {
        Self {
            commands: env_vars::topic_commands(),
            results: env_vars::topic_results(),
            notifications: env_vars::topic_notifications(),
        }
    }
}

/// Complete dispatch configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    pub topics: TopicNames,
    pub command_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub executor_concurrency: usize,
    pub log_json: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            topics: TopicNames::default(),
            command_timeout_ms: defaults::COMMAND_TIMEOUT_MS,
            max_retries: defaults::MAX_RETRIES,
            retry_delay_ms: defaults::RETRY_DELAY_MS,
            executor_concurrency: defaults::EXECUTOR_CONCURRENCY,
            log_json: false,
        }
    }
}

impl DispatchConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        Self {
            topics: TopicNames::from_env(),
            command_timeout_ms: env_vars::command_timeout_ms(),
            max_retries: env_vars::max_retries(),
            retry_delay_ms: env_vars::retry_delay_ms(),
            executor_concurrency: env_vars::executor_concurrency(),
            log_json: env_vars::log_json(),
        }
    }
}
