// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Docker driver.
//!
//! Drives the `docker` CLI. Capsule metadata understood at create time:
//!
//! | Key | Meaning |
//! |-----|---------|
//! | `image` | image reference (required) |
//! | `command` | whitespace-separated command override |
//! | `memory` | `--memory` limit (e.g. `256m`) |
//! | `cpus` | `--cpus` limit (e.g. `0.5`) |
//! | `restart` | `--restart` policy |
//! | `env.<NAME>` | environment variable `NAME` |

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use capsule_core::Backend;
use serde::Deserialize;
use tracing::{debug, info};

use super::command::{self, CliOutput};
use super::parse::{parse_percent, parse_size};
use super::traits::*;

/// Label attached to every container the agent creates.
pub const CAPSULE_ID_LABEL: &str = "io.capsule-agent.id";

/// Docker CLI driver.
pub struct DockerDriver {
    binary: PathBuf,
    timeout: Duration,
    stop_grace_secs: u32,
}

impl DockerDriver {
    /// Driver using `binary` as the docker CLI.
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            timeout: Duration::from_secs(120),
            stop_grace_secs: 10,
        }
    }

    /// Bound every CLI call by `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn docker(&self, args: &[&str]) -> Result<CliOutput> {
        command::run(&self.binary, args, self.timeout)
            .await
            .map_err(not_found_from_stderr)
    }
}

/// Build `docker create` arguments for a spec.
pub(crate) fn create_args(spec: &CreateSpec) -> Result<Vec<String>> {
    let image = spec.require("image")?;
    let mut args = vec![
        "create".to_string(),
        "--name".to_string(),
        spec.name.clone(),
        "--label".to_string(),
        format!("{CAPSULE_ID_LABEL}={}", spec.capsule_id),
    ];
    if let Some(memory) = spec.meta("memory") {
        args.extend(["--memory".to_string(), memory.to_string()]);
    }
    if let Some(cpus) = spec.meta("cpus") {
        args.extend(["--cpus".to_string(), cpus.to_string()]);
    }
    if let Some(restart) = spec.meta("restart") {
        args.extend(["--restart".to_string(), restart.to_string()]);
    }
    for (key, value) in &spec.metadata {
        if let Some(name) = key.strip_prefix("env.") {
            args.extend(["--env".to_string(), format!("{name}={value}")]);
        }
    }
    args.push(image.to_string());
    if let Some(command) = spec.meta("command") {
        args.extend(command.split_whitespace().map(str::to_string));
    }
    Ok(args)
}

fn not_found_from_stderr(err: DriverError) -> DriverError {
    match err {
        DriverError::ExitCode {
            ref command,
            ref stderr,
            ..
        } if stderr.contains("No such container") || stderr.contains("No such object") => {
            DriverError::NotFound(format!("{command}: {stderr}"))
        }
        other => other,
    }
}

#[derive(Debug, Deserialize)]
struct ContainerState {
    #[serde(rename = "Status")]
    status: String,
}

/// Map `docker inspect` `.State.Status` to a runtime status.
pub(crate) fn status_from_inspect(json: &str) -> Result<RuntimeStatus> {
    let state: ContainerState = serde_json::from_str(json.trim())?;
    Ok(match state.status.as_str() {
        "running" | "restarting" => RuntimeStatus::Running,
        "created" | "exited" | "dead" => RuntimeStatus::Stopped,
        "removing" => RuntimeStatus::Missing,
        _ => RuntimeStatus::Unknown,
    })
}

#[derive(Debug, Deserialize)]
struct StatsLine {
    #[serde(rename = "CPUPerc", default)]
    cpu_perc: String,
    #[serde(rename = "MemUsage", default)]
    mem_usage: String,
    #[serde(rename = "NetIO", default)]
    net_io: String,
    #[serde(rename = "PIDs", default)]
    pids: String,
}

/// Parse one `docker stats --no-stream --format '{{json .}}'` line.
pub(crate) fn metrics_from_stats(json: &str) -> Result<CapsuleMetrics> {
    let line = json
        .lines()
        .find(|l| !l.trim().is_empty())
        .ok_or_else(|| DriverError::Parse {
            command: "docker stats".to_string(),
            detail: "empty output".to_string(),
        })?;
    let stats: StatsLine = serde_json::from_str(line)?;

    let (mem, limit) = split_pair(&stats.mem_usage);
    let (rx, tx) = split_pair(&stats.net_io);
    Ok(CapsuleMetrics {
        cpu_percent: parse_percent(&stats.cpu_perc),
        memory_bytes: mem.and_then(parse_size),
        memory_limit_bytes: limit.and_then(parse_size),
        net_rx_bytes: rx.and_then(parse_size),
        net_tx_bytes: tx.and_then(parse_size),
        pids: stats.pids.trim().parse().ok(),
    })
}

/// Split docker's `"a / b"` columns.
fn split_pair(value: &str) -> (Option<&str>, Option<&str>) {
    let mut parts = value.splitn(2, '/').map(str::trim);
    (parts.next(), parts.next())
}

#[async_trait]
impl Driver for DockerDriver {
    fn backend(&self) -> Backend {
        Backend::Docker
    }

    async fn probe(&self) -> Result<()> {
        let out = self
            .docker(&["version", "--format", "{{.Server.Version}}"])
            .await?;
        info!(version = %out.stdout.trim(), "Docker daemon reachable");
        Ok(())
    }

    async fn create(&self, spec: &CreateSpec) -> Result<String> {
        let args = create_args(spec)?;
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let out = self.docker(&args).await?;
        let container_id = out.stdout.trim().to_string();
        if container_id.is_empty() {
            return Err(DriverError::Parse {
                command: "docker create".to_string(),
                detail: "no container id printed".to_string(),
            });
        }
        debug!(capsule_id = %spec.capsule_id, container_id = %container_id, "Docker container created");
        Ok(container_id)
    }

    async fn start(&self, handle: &str) -> Result<()> {
        self.docker(&["start", handle]).await.map(|_| ())
    }

    async fn stop(&self, handle: &str) -> Result<()> {
        let grace = self.stop_grace_secs.to_string();
        self.docker(&["stop", "--time", &grace, handle])
            .await
            .map(|_| ())
    }

    async fn destroy(&self, handle: &str) -> Result<()> {
        match self.docker(&["rm", "--force", handle]).await {
            Ok(_) | Err(DriverError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn inspect(&self, handle: &str) -> Result<RuntimeStatus> {
        match self
            .docker(&["inspect", "--format", "{{json .State}}", handle])
            .await
        {
            Ok(out) => status_from_inspect(&out.stdout),
            Err(DriverError::NotFound(_)) => Ok(RuntimeStatus::Missing),
            Err(e) => Err(e),
        }
    }

    async fn stats(&self, handle: &str) -> Result<CapsuleMetrics> {
        let out = self
            .docker(&["stats", "--no-stream", "--format", "{{json .}}", handle])
            .await?;
        metrics_from_stats(&out.stdout)
    }
}
