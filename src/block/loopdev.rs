use anyhow::{Context, Result};
use serde::{de, Deserialize, Deserializer};
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::path::Path;

use crate::error::BuildError;
use crate::exec::{run_checked, CommandRunner};

#[derive(Debug, Default, Deserialize)]
struct LoopListing {
    #[serde(default)]
    loopdevices: Vec<LoopDeviceEntry>,
}

/// One row of `losetup -lJ`.
///
/// util-linux has emitted the numeric and flag columns both as JSON values
/// and as strings over the years, so they are parsed leniently.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoopDeviceEntry {
    pub name: String,
    #[serde(rename = "back-file", default)]
    pub back_file: Option<String>,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub sizelimit: u64,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub offset: u64,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub autoclear: bool,
    #[serde(rename = "ro", default, deserialize_with = "lenient_bool")]
    pub read_only: bool,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub dio: bool,
    #[serde(rename = "log-sec", default, deserialize_with = "lenient_u64")]
    pub log_sec: u64,
}

impl LoopDeviceEntry {
    fn is_backed_by(&self, path: &Path) -> bool {
        self.back_file
            .as_deref()
            .is_some_and(|f| Path::new(f) == path)
    }
}

fn lenient_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(0),
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| de::Error::custom(format!("expected unsigned integer, got {n}"))),
        Value::String(s) => s.trim().parse().map_err(de::Error::custom),
        other => Err(de::Error::custom(format!("unexpected value {other}"))),
    }
}

fn lenient_bool<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(false),
        Value::Bool(b) => Ok(b),
        Value::Number(n) => Ok(n.as_u64().unwrap_or(0) != 0),
        Value::String(s) => match s.trim() {
            "1" | "true" => Ok(true),
            "0" | "false" | "" => Ok(false),
            other => Err(de::Error::custom(format!("unexpected flag {other:?}"))),
        },
        other => Err(de::Error::custom(format!("unexpected value {other}"))),
    }
}

/// Parse `losetup -lJ` output. No active loop devices prints nothing at all.
pub fn parse_loop_listing(output: &[u8]) -> Result<Vec<LoopDeviceEntry>> {
    if output.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    let listing: LoopListing =
        serde_json::from_slice(output).context("failed to parse losetup listing")?;
    Ok(listing.loopdevices)
}

/// Binds disk images to loop devices and resolves them back by backing file.
pub struct LoopDeviceMapper<'a, R> {
    runner: &'a R,
}

impl<'a, R: CommandRunner> LoopDeviceMapper<'a, R> {
    pub fn new(runner: &'a R) -> Self {
        Self { runner }
    }

    pub async fn list(&self) -> Result<Vec<LoopDeviceEntry>> {
        let output = run_checked(self.runner, "losetup", &["-lJ"]).await?;
        parse_loop_listing(&output.stdout)
    }

    /// Entry whose backing file is `backing`, which must already be absolute.
    pub async fn find(&self, backing: &Path) -> Result<Option<LoopDeviceEntry>> {
        let entries = self.list().await?;
        Ok(entries.into_iter().find(|e| e.is_backed_by(backing)))
    }

    /// Attach `image` to the next free loop device with partition scanning on.
    ///
    /// The kernel picks the loop node, so the entry is looked up afterwards by
    /// its backing file rather than trusted from the attach call.
    pub async fn attach(&self, image: &Path) -> Result<LoopDeviceEntry> {
        let backing = fs::canonicalize(image)
            .with_context(|| format!("failed to resolve {}", image.display()))?;

        if let Some(existing) = self.find(&backing).await? {
            return Err(BuildError::BackingFileAlreadyAttached {
                path: backing,
                device: existing.name,
            }
            .into());
        }

        let backing_arg = backing.to_string_lossy();
        run_checked(self.runner, "losetup", &["-Pf", &backing_arg]).await?;

        let entry = self
            .find(&backing)
            .await?
            .ok_or(BuildError::LoopDeviceNotFound(backing))?;
        info!("attached {} to {}", image.display(), entry.name);
        Ok(entry)
    }

    pub async fn detach(&self, entry: &LoopDeviceEntry) -> Result<()> {
        run_checked(self.runner, "losetup", &["--detach", &entry.name])
            .await
            .with_context(|| format!("failed to detach loop device {}", entry.name))?;
        info!("detached loop device {}", entry.name);
        Ok(())
    }
}

/// Extend a backing file with sparse zero padding until it is at least
/// `min_size` bytes, growing by at least `step` bytes.
///
/// Files already larger than `min_size` are left alone. Returns the new
/// length when the file was grown.
pub fn grow_backing_file(path: &Path, min_size: u64, step: u64) -> Result<Option<u64>> {
    let len = fs::metadata(path)
        .with_context(|| format!("failed to stat {}", path.display()))?
        .len();
    if len > min_size {
        debug!("{} is {len} bytes, no growth needed", path.display());
        return Ok(None);
    }
    let new_len = min_size.max(len.saturating_add(step));
    let file = OpenOptions::new()
        .write(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    file.set_len(new_len)
        .with_context(|| format!("failed to extend {}", path.display()))?;
    info!("grew {} from {len} to {new_len} bytes", path.display());
    Ok(Some(new_len))
}
