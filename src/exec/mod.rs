//! External tool execution.
//!
//! Every partitioning, LVM, filesystem, mount and loop-device operation goes
//! through [`CommandRunner`], so the pipeline can be exercised against a
//! scripted runner in tests and against real tools in production.

use std::process::{Output, Stdio};
use std::time::Duration;

use anyhow::{Context, Result};

use crate::error::BuildError;

#[cfg(test)]
pub(crate) mod fake;

/// Abstracts process execution so the tools can be swapped or scripted.
#[allow(async_fn_in_trait)]
pub trait CommandRunner {
    /// Run a program to completion and capture its output.
    async fn run(&self, program: &str, args: &[&str]) -> Result<Output>;

    /// Run a program, killing it if it has not finished within `timeout`.
    async fn run_with_timeout(
        &self,
        program: &str,
        args: &[&str],
        timeout: Duration,
    ) -> Result<Output>;
}

/// Production runner backed by `tokio::process`.
///
/// `run` waits for as long as the tool takes. `run_with_timeout` drops the
/// child when the deadline passes, and `kill_on_drop` terminates it.
#[derive(Debug, Default, Clone, Copy)]
pub struct ToolRunner;

impl CommandRunner for ToolRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<Output> {
        debug!("running {}", command_line(program, args));
        tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("failed to spawn {program}"))
    }

    async fn run_with_timeout(
        &self,
        program: &str,
        args: &[&str],
        timeout: Duration,
    ) -> Result<Output> {
        debug!(
            "running {} (deadline {}s)",
            command_line(program, args),
            timeout.as_secs()
        );
        let child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {program}"))?;

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => output.with_context(|| format!("waiting for {program}")),
            Err(_) => Err(BuildError::Timeout {
                command: command_line(program, args),
                timeout,
            }
            .into()),
        }
    }
}

/// Render a program and its arguments the way a shell user would type them.
pub fn command_line(program: &str, args: &[&str]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

/// Stdout followed by stderr, lossily decoded and trimmed.
pub fn combined_output(output: &Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        if !text.trim().is_empty() {
            text.push('\n');
        }
        text.push_str(&stderr);
    }
    text.trim().to_string()
}

/// Run a tool and fail with [`BuildError::ToolFailed`] on a non-zero exit.
pub async fn run_checked<R: CommandRunner>(
    runner: &R,
    program: &str,
    args: &[&str],
) -> Result<Output> {
    let output = runner.run(program, args).await?;
    ensure_success(program, args, output, &[0])
}

/// Like [`run_checked`], but also accepts the listed non-zero exit codes.
pub async fn run_accepting<R: CommandRunner>(
    runner: &R,
    program: &str,
    args: &[&str],
    accepted: &[i32],
) -> Result<Output> {
    let output = runner.run(program, args).await?;
    ensure_success(program, args, output, accepted)
}

/// Like [`run_checked`], with a deadline on the invocation.
pub async fn run_checked_with_timeout<R: CommandRunner>(
    runner: &R,
    program: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<Output> {
    let output = runner.run_with_timeout(program, args, timeout).await?;
    ensure_success(program, args, output, &[0])
}

fn ensure_success(
    program: &str,
    args: &[&str],
    output: Output,
    accepted: &[i32],
) -> Result<Output> {
    let code = output.status.code();
    if output.status.success() || code.is_some_and(|c| accepted.contains(&c)) {
        return Ok(output);
    }
    Err(BuildError::ToolFailed {
        command: command_line(program, args),
        status: output.status.to_string(),
        output: combined_output(&output),
    }
    .into())
}
