// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for capsule-agent.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::message_processor::{SmtpConfig, SmtpTls};

/// Where capsule and job records are kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageConfig {
    /// In-process stores; nothing survives a restart.
    Memory,
    /// SQLite database at this URL.
    Sqlite(String),
}

/// Agent configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Capsule and message persistence
    pub storage: StorageConfig,
    /// Register the Docker driver
    pub docker_enabled: bool,
    /// Path to the docker CLI
    pub docker_bin: PathBuf,
    /// Register the LXC driver
    pub lxc_enabled: bool,
    /// `lxcpath` override passed to every `lxc-*` command
    pub lxc_path: Option<PathBuf>,
    /// Dispatcher pool size
    pub workers: usize,
    /// Pending-queue admission bound
    pub queue_capacity: usize,
    /// Default retry budget for jobs
    pub job_max_retries: u32,
    /// Stats monitor tick
    pub stats_interval: Duration,
    /// Reconciliation loop tick
    pub reconcile_interval: Duration,
    /// Upper bound for a single driver call during lifecycle operations
    pub driver_timeout: Duration,
    /// Upper bound for graceful shutdown
    pub shutdown_timeout: Duration,
    /// Per-subscriber event channel capacity
    pub event_buffer: usize,
    /// SMTP relay for `email` jobs; unset disables the email worker
    pub smtp: Option<SmtpConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: StorageConfig::Sqlite("sqlite:.data/capsule-agent.db?mode=rwc".to_string()),
            docker_enabled: true,
            docker_bin: PathBuf::from("docker"),
            lxc_enabled: true,
            lxc_path: None,
            workers: 4,
            queue_capacity: 1024,
            job_max_retries: 3,
            stats_interval: Duration::from_secs(1),
            reconcile_interval: Duration::from_secs(30),
            driver_timeout: Duration::from_secs(300),
            shutdown_timeout: Duration::from_secs(30),
            event_buffer: 256,
            smtp: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let storage = match std::env::var("CAPSULE_AGENT_DATABASE_URL") {
            Ok(url) if url.eq_ignore_ascii_case("memory") => StorageConfig::Memory,
            Ok(url) if url.starts_with("sqlite:") => StorageConfig::Sqlite(url),
            Ok(_) => {
                return Err(ConfigError::Invalid(
                    "CAPSULE_AGENT_DATABASE_URL",
                    "must be 'memory' or a sqlite: URL",
                ));
            }
            Err(_) => defaults.storage,
        };

        let workers: usize = parse_var("CAPSULE_AGENT_WORKERS", defaults.workers)?;
        if workers == 0 {
            return Err(ConfigError::Invalid(
                "CAPSULE_AGENT_WORKERS",
                "must be at least 1",
            ));
        }
        let queue_capacity: usize =
            parse_var("CAPSULE_AGENT_QUEUE_CAPACITY", defaults.queue_capacity)?;
        if queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "CAPSULE_AGENT_QUEUE_CAPACITY",
                "must be at least 1",
            ));
        }
        let event_buffer: usize = parse_var("CAPSULE_AGENT_EVENT_BUFFER", defaults.event_buffer)?;
        if event_buffer == 0 {
            return Err(ConfigError::Invalid(
                "CAPSULE_AGENT_EVENT_BUFFER",
                "must be at least 1",
            ));
        }

        Ok(Self {
            storage,
            docker_enabled: parse_bool("CAPSULE_AGENT_DOCKER_ENABLED", defaults.docker_enabled),
            docker_bin: std::env::var("CAPSULE_AGENT_DOCKER_BIN")
                .map(PathBuf::from)
                .unwrap_or(defaults.docker_bin),
            lxc_enabled: parse_bool("CAPSULE_AGENT_LXC_ENABLED", defaults.lxc_enabled),
            lxc_path: std::env::var("CAPSULE_AGENT_LXC_PATH").ok().map(PathBuf::from),
            workers,
            queue_capacity,
            job_max_retries: parse_var("CAPSULE_AGENT_JOB_MAX_RETRIES", defaults.job_max_retries)?,
            stats_interval: parse_secs("CAPSULE_AGENT_STATS_INTERVAL_SECS", defaults.stats_interval)?,
            reconcile_interval: parse_secs(
                "CAPSULE_AGENT_RECONCILE_INTERVAL_SECS",
                defaults.reconcile_interval,
            )?,
            driver_timeout: parse_secs("CAPSULE_AGENT_DRIVER_TIMEOUT_SECS", defaults.driver_timeout)?,
            shutdown_timeout: parse_secs(
                "CAPSULE_AGENT_SHUTDOWN_TIMEOUT_SECS",
                defaults.shutdown_timeout,
            )?,
            event_buffer,
            smtp: smtp_from_env()?,
        })
    }
}

fn smtp_from_env() -> Result<Option<SmtpConfig>, ConfigError> {
    let host = match std::env::var("CAPSULE_AGENT_SMTP_HOST") {
        Ok(host) if !host.trim().is_empty() => host.trim().to_string(),
        _ => return Ok(None),
    };
    let from = std::env::var("CAPSULE_AGENT_SMTP_FROM").map_err(|_| {
        ConfigError::Invalid("CAPSULE_AGENT_SMTP_FROM", "required when SMTP_HOST is set")
    })?;
    let port = match std::env::var("CAPSULE_AGENT_SMTP_PORT") {
        Ok(_) => Some(parse_var("CAPSULE_AGENT_SMTP_PORT", 0u16)?),
        Err(_) => None,
    };
    let tls = match std::env::var("CAPSULE_AGENT_SMTP_TLS") {
        Ok(raw) => raw.parse::<SmtpTls>().map_err(|_| {
            ConfigError::Invalid(
                "CAPSULE_AGENT_SMTP_TLS",
                "must be 'wrapper', 'starttls' or 'none'",
            )
        })?,
        Err(_) => SmtpTls::default(),
    };
    let username = std::env::var("CAPSULE_AGENT_SMTP_USERNAME").ok();
    let password = std::env::var("CAPSULE_AGENT_SMTP_PASSWORD").ok();
    if password.is_some() && username.is_none() {
        return Err(ConfigError::Invalid(
            "CAPSULE_AGENT_SMTP_PASSWORD",
            "set without CAPSULE_AGENT_SMTP_USERNAME",
        ));
    }

    Ok(Some(SmtpConfig {
        host,
        port,
        username,
        password,
        from,
        tls,
        timeout: parse_secs("CAPSULE_AGENT_SMTP_TIMEOUT_SECS", Duration::from_secs(30))?,
    }))
}

fn parse_bool(var: &str, default: bool) -> bool {
    std::env::var(var)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(default)
}

fn parse_var<T: FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(var, "must be a non-negative integer")),
        Err(_) => Ok(default),
    }
}

fn parse_secs(var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    let secs: u64 = parse_var(var, default.as_secs())?;
    if secs == 0 {
        return Err(ConfigError::Invalid(var, "must be at least 1 second"));
    }
    Ok(Duration::from_secs(secs))
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
