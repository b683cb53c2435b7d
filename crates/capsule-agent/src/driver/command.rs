// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bounded invocation of container runtime CLIs.

use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use super::traits::{DriverError, Result};

/// Captured output of a successful CLI call.
#[derive(Debug, Clone)]
pub(crate) struct CliOutput {
    pub stdout: String,
}

/// Run `program args..` to completion within `timeout`.
///
/// The child is killed when the timeout elapses. A non-zero exit becomes
/// [`DriverError::ExitCode`] carrying the trimmed stderr.
pub(crate) async fn run<I, S>(program: &Path, args: I, timeout: Duration) -> Result<CliOutput>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let args: Vec<_> = args
        .into_iter()
        .map(|a| a.as_ref().to_os_string())
        .collect();
    let label = describe(program, &args);

    let mut cmd = Command::new(program);
    cmd.args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            DriverError::BinaryNotFound(program.display().to_string())
        } else {
            DriverError::Io(e)
        }
    })?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result?,
        Err(_) => return Err(DriverError::Timeout(timeout)),
    };

    debug!(command = %label, status = %output.status, "Runtime command finished");

    if !output.status.success() {
        return Err(DriverError::ExitCode {
            command: label,
            exit_code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(CliOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
    })
}

/// Short `program subcommand` label for errors and logs.
fn describe(program: &Path, args: &[std::ffi::OsString]) -> String {
    let name = program
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.display().to_string());
    match args.first() {
        Some(sub) if !sub.to_string_lossy().starts_with('-') => {
            format!("{name} {}", sub.to_string_lossy())
        }
        _ => name,
    }
}
