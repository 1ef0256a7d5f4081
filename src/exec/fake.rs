use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Output};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;

use super::{command_line, CommandRunner};
use crate::error::BuildError;

enum Reply {
    Output(Output),
    Timeout,
}

/// Scripted runner: records every command line and replays canned replies.
///
/// A reply is matched when its key is a prefix of the rendered command line;
/// each reply is consumed once, in registration order. Unmatched commands
/// succeed with empty output.
pub(crate) struct FakeRunner {
    calls: Mutex<Vec<String>>,
    replies: Mutex<Vec<(String, Reply)>>,
}

impl FakeRunner {
    pub(crate) fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            replies: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn respond(self, prefix: &str, stdout: &str) -> Self {
        self.push(prefix, Reply::Output(output(0, stdout, "")))
    }

    pub(crate) fn fail(self, prefix: &str, code: i32, stderr: &str) -> Self {
        self.push(prefix, Reply::Output(output(code, "", stderr)))
    }

    pub(crate) fn time_out(self, prefix: &str) -> Self {
        self.push(prefix, Reply::Timeout)
    }

    fn push(self, prefix: &str, reply: Reply) -> Self {
        self.replies
            .lock()
            .unwrap()
            .push((prefix.to_string(), reply));
        self
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Position of the first recorded call starting with `prefix`.
    pub(crate) fn position(&self, prefix: &str) -> Option<usize> {
        self.calls().iter().position(|c| c.starts_with(prefix))
    }

    fn reply(&self, program: &str, args: &[&str], timeout: Option<Duration>) -> Result<Output> {
        let line = command_line(program, args);
        self.calls.lock().unwrap().push(line.clone());
        let mut replies = self.replies.lock().unwrap();
        let Some(index) = replies.iter().position(|(key, _)| line.starts_with(key.as_str())) else {
            return Ok(output(0, "", ""));
        };
        match replies.remove(index).1 {
            Reply::Output(out) => Ok(out),
            Reply::Timeout => Err(BuildError::Timeout {
                command: line,
                timeout: timeout.unwrap_or_default(),
            }
            .into()),
        }
    }
}

impl CommandRunner for FakeRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<Output> {
        self.reply(program, args, None)
    }

    async fn run_with_timeout(
        &self,
        program: &str,
        args: &[&str],
        timeout: Duration,
    ) -> Result<Output> {
        self.reply(program, args, Some(timeout))
    }
}

fn output(code: i32, stdout: &str, stderr: &str) -> Output {
    Output {
        status: ExitStatus::from_raw(code << 8),
        stdout: stdout.as_bytes().to_vec(),
        stderr: stderr.as_bytes().to_vec(),
    }
}
