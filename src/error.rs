use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::build::Stage;

/// Failure kinds the pipeline distinguishes.
///
/// Everything is returned as `anyhow::Error`; callers that need to branch on
/// the kind use `err.downcast_ref::<BuildError>()`.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("invalid block device path '{0}': expected an absolute /dev/ path")]
    InvalidDevicePath(String),

    #[error("device {device} does not have an empty partition table ({count} partitions found)")]
    NonEmptyPartitionTable { device: String, count: usize },

    #[error("partition {number} on {device} is not the last partition, refusing to grow it")]
    PartitionNotLast { device: String, number: u32 },

    #[error("`{command}` exited with {status}: {output}")]
    ToolFailed {
        command: String,
        status: String,
        output: String,
    },

    #[error("`{command}` timed out after {}s", timeout.as_secs())]
    Timeout { command: String, timeout: Duration },

    #[error("unexpected output from `{command}`: {reason}")]
    UnexpectedToolOutput { command: String, reason: String },

    #[error("checksum mismatch for {file}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        file: String,
        expected: String,
        actual: String,
    },

    #[error("malformed checksum file at line {line}: {content:?}")]
    MalformedChecksumFile { line: usize, content: String },

    #[error("checksum file has no entry for {0}")]
    MissingChecksumEntry(String),

    #[error(
        "volume group {volume_group} does not have enough capacity for csi storage: {available} bytes available, {required} bytes required"
    )]
    InsufficientCapacity {
        volume_group: String,
        available: u64,
        required: u64,
    },

    #[error("no loop device is backed by {0}")]
    LoopDeviceNotFound(PathBuf),

    #[error("{path} is already attached to {device}")]
    BackingFileAlreadyAttached { path: PathBuf, device: String },

    #[error("guest path {0:?} escapes the mounted root")]
    UnsafeGuestPath(String),
}

/// Terminal error of a build or flash run.
///
/// Carries the stage that was being attempted, the error that triggered the
/// rollback, and every error hit while releasing resources afterwards.
#[derive(Debug)]
pub struct BuildFailure {
    pub stage: Stage,
    pub cause: anyhow::Error,
    pub cleanup: Vec<anyhow::Error>,
}

impl fmt::Display for BuildFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed while reaching stage {}: {:#}", self.stage, self.cause)?;
        if !self.cleanup.is_empty() {
            write!(f, "; {} cleanup error(s):", self.cleanup.len())?;
            for err in &self.cleanup {
                write!(f, " [{err:#}]")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for BuildFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.cause.as_ref())
    }
}
