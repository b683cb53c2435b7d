// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! LXC driver.
//!
//! Drives the `lxc-*` tools. The runtime handle is the container name.
//! Capsule metadata understood at create time:
//!
//! | Key | Meaning |
//! |-----|---------|
//! | `template` | `lxc-create` template (default `download`) |
//! | `dist`, `release`, `arch` | arguments for the `download` template |
//! | `template_args` | extra whitespace-separated template arguments |

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use capsule_core::Backend;
use tracing::{debug, info};

use super::command::{self, CliOutput};
use super::parse::parse_size;
use super::traits::*;

/// LXC CLI driver.
pub struct LxcDriver {
    lxc_path: Option<PathBuf>,
    timeout: Duration,
    stop_timeout_secs: u32,
    /// Last CPU sample per container, for turning cumulative CPU time into a rate.
    cpu_samples: Mutex<HashMap<String, (Instant, u64)>>,
}

impl Default for LxcDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl LxcDriver {
    /// Driver using the system default lxcpath.
    pub fn new() -> Self {
        Self {
            lxc_path: None,
            timeout: Duration::from_secs(300),
            stop_timeout_secs: 10,
            cpu_samples: Mutex::new(HashMap::new()),
        }
    }

    /// Pass `-P <path>` to every command.
    pub fn with_lxc_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.lxc_path = Some(path.into());
        self
    }

    /// Bound every CLI call by `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn lxc(&self, tool: &str, name: &str, extra: &[String]) -> Result<CliOutput> {
        let args = container_args(name, self.lxc_path.as_deref(), extra);
        command::run(Path::new(tool), &args, self.timeout)
            .await
            .map_err(not_found_from_stderr)
    }

    fn cpu_percent(&self, handle: &str, cpu_ns: u64) -> Option<f64> {
        let now = Instant::now();
        let mut samples = self
            .cpu_samples
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let previous = samples.insert(handle.to_string(), (now, cpu_ns));
        let (at, prev_ns) = previous?;
        let wall_ns = now.duration_since(at).as_nanos() as f64;
        if wall_ns <= 0.0 || cpu_ns < prev_ns {
            return None;
        }
        Some((cpu_ns - prev_ns) as f64 / wall_ns * 100.0)
    }

    fn forget(&self, handle: &str) {
        self.cpu_samples
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(handle);
    }
}

fn container_args(name: &str, lxc_path: Option<&Path>, extra: &[String]) -> Vec<String> {
    let mut args = vec!["-n".to_string(), name.to_string()];
    if let Some(path) = lxc_path {
        args.extend(["-P".to_string(), path.display().to_string()]);
    }
    args.extend(extra.iter().cloned());
    args
}

/// Arguments following `-n <name>` for `lxc-create`.
pub(crate) fn create_args(spec: &CreateSpec) -> Vec<String> {
    let template = spec.meta("template").unwrap_or("download");
    let mut args = vec!["-t".to_string(), template.to_string()];

    let mut template_args = Vec::new();
    for key in ["dist", "release", "arch"] {
        if let Some(value) = spec.meta(key) {
            template_args.extend([format!("--{key}"), value.to_string()]);
        }
    }
    if let Some(extra) = spec.meta("template_args") {
        template_args.extend(extra.split_whitespace().map(str::to_string));
    }
    if !template_args.is_empty() {
        args.push("--".to_string());
        args.extend(template_args);
    }
    args
}

fn not_found_from_stderr(err: DriverError) -> DriverError {
    match err {
        DriverError::ExitCode {
            ref command,
            ref stderr,
            ..
        } if stderr.contains("does not exist") || stderr.contains("doesn't exist") => {
            DriverError::NotFound(format!("{command}: {stderr}"))
        }
        other => other,
    }
}

/// Key/value lines of `lxc-info -H` output.
fn info_fields(output: &str) -> HashMap<&str, &str> {
    output
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim(), v.trim()))
        .collect()
}

/// Map `lxc-info -s` output to a runtime status.
pub(crate) fn status_from_info(output: &str) -> Result<RuntimeStatus> {
    let fields = info_fields(output);
    let state = fields.get("State").ok_or_else(|| DriverError::Parse {
        command: "lxc-info".to_string(),
        detail: "no State line".to_string(),
    })?;
    Ok(match *state {
        "RUNNING" | "STARTING" => RuntimeStatus::Running,
        "STOPPED" | "STOPPING" | "ABORTING" => RuntimeStatus::Stopped,
        _ => RuntimeStatus::Unknown,
    })
}

/// Parse `lxc-info -H` output. Returns the metrics (without CPU rate) and
/// the cumulative CPU time in nanoseconds.
pub(crate) fn metrics_from_info(output: &str) -> (CapsuleMetrics, Option<u64>) {
    let fields = info_fields(output);
    let size = |key: &str| fields.get(key).and_then(|v| parse_size(v));
    let cpu_ns = fields.get("CPU use").and_then(|v| v.parse::<u64>().ok());
    let metrics = CapsuleMetrics {
        cpu_percent: None,
        memory_bytes: size("Memory use"),
        memory_limit_bytes: None,
        net_rx_bytes: size("RX bytes"),
        net_tx_bytes: size("TX bytes"),
        pids: None,
    };
    (metrics, cpu_ns)
}

#[async_trait]
impl Driver for LxcDriver {
    fn backend(&self) -> Backend {
        Backend::Lxc
    }

    async fn probe(&self) -> Result<()> {
        let out = command::run(Path::new("lxc-info"), ["--version"], self.timeout).await?;
        info!(version = %out.stdout.trim(), "LXC tools available");
        Ok(())
    }

    async fn create(&self, spec: &CreateSpec) -> Result<String> {
        self.lxc("lxc-create", &spec.name, &create_args(spec)).await?;
        debug!(capsule_id = %spec.capsule_id, container = %spec.name, "LXC container created");
        Ok(spec.name.clone())
    }

    async fn start(&self, handle: &str) -> Result<()> {
        self.lxc("lxc-start", handle, &[]).await.map(|_| ())
    }

    async fn stop(&self, handle: &str) -> Result<()> {
        let extra = ["-t".to_string(), self.stop_timeout_secs.to_string()];
        self.lxc("lxc-stop", handle, &extra).await?;
        self.forget(handle);
        Ok(())
    }

    async fn destroy(&self, handle: &str) -> Result<()> {
        self.forget(handle);
        match self.lxc("lxc-destroy", handle, &["-f".to_string()]).await {
            Ok(_) | Err(DriverError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn inspect(&self, handle: &str) -> Result<RuntimeStatus> {
        match self
            .lxc("lxc-info", handle, &["-s".to_string(), "-H".to_string()])
            .await
        {
            Ok(out) => status_from_info(&out.stdout),
            Err(DriverError::NotFound(_)) => Ok(RuntimeStatus::Missing),
            Err(e) => Err(e),
        }
    }

    async fn stats(&self, handle: &str) -> Result<CapsuleMetrics> {
        let out = self.lxc("lxc-info", handle, &["-H".to_string()]).await?;
        let (mut metrics, cpu_ns) = metrics_from_info(&out.stdout);
        metrics.cpu_percent = cpu_ns.and_then(|ns| self.cpu_percent(handle, ns));
        Ok(metrics)
    }
}
