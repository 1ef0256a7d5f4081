//! Partition table inspection, creation and growth through `parted`.

use anyhow::{Context, Result};
use serde::{de, Deserialize, Deserializer};
use serde_json::Value;

use crate::block::DevicePath;
use crate::error::BuildError;
use crate::exec::{combined_output, command_line, run_accepting, run_checked, CommandRunner};

/// e2fsck exit code 1 means errors were found and corrected.
const FSCK_ACCEPTED: &[i32] = &[0, 1];

#[derive(Debug, Deserialize)]
struct PartedOutput {
    disk: DiskListing,
}

/// Parsed `parted -j ... unit B print` output for one disk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DiskListing {
    #[serde(default)]
    pub path: String,
    #[serde(default, deserialize_with = "byte_value")]
    pub size: u64,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub partitions: Vec<PartitionRecord>,
}

impl DiskListing {
    /// Last addressable byte of the disk.
    pub fn end(&self) -> u64 {
        self.size.saturating_sub(1)
    }

    pub fn last_number(&self) -> Option<u32> {
        self.partitions.iter().map(|p| p.number).max()
    }
}

/// One partition. A record with `number == 0` stands for "no partition".
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PartitionRecord {
    pub number: u32,
    #[serde(default, deserialize_with = "byte_value")]
    pub start: u64,
    #[serde(default, deserialize_with = "byte_value")]
    pub end: u64,
    #[serde(default, deserialize_with = "byte_value")]
    pub size: u64,
    #[serde(default)]
    pub filesystem: Option<String>,
    #[serde(default)]
    pub flags: Vec<String>,
}

impl PartitionRecord {
    pub fn is_none(&self) -> bool {
        self.number == 0
    }
}

/// parted reports byte positions as strings like `"269484031B"`.
fn byte_value<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| de::Error::custom(format!("expected byte count, got {n}"))),
        Value::String(s) => s
            .trim()
            .trim_end_matches('B')
            .parse()
            .map_err(|_| de::Error::custom(format!("expected byte count, got {s:?}"))),
        other => Err(de::Error::custom(format!("expected byte count, got {other}"))),
    }
}

pub fn parse_disk_listing(output: &[u8]) -> Result<DiskListing> {
    let parsed: PartedOutput =
        serde_json::from_slice(output).context("failed to parse parted listing")?;
    Ok(parsed.disk)
}

/// First ext4 partition, or the empty record when the disk has none.
pub fn first_ext4(listing: &DiskListing) -> PartitionRecord {
    listing
        .partitions
        .iter()
        .find(|p| p.filesystem.as_deref() == Some("ext4"))
        .cloned()
        .unwrap_or_default()
}

pub struct PartitionPlanner<'a, R> {
    runner: &'a R,
}

impl<'a, R: CommandRunner> PartitionPlanner<'a, R> {
    pub fn new(runner: &'a R) -> Self {
        Self { runner }
    }

    async fn parted(&self, device: &DevicePath, args: &[&str]) -> Result<()> {
        let mut full = vec!["-s", device.as_str()];
        full.extend_from_slice(args);
        run_checked(self.runner, "parted", &full).await?;
        Ok(())
    }

    /// Current table of `device`. A disk without a recognised label is
    /// reported as an empty listing.
    pub async fn inspect(&self, device: &DevicePath) -> Result<DiskListing> {
        let args = ["-s", "-j", device.as_str(), "unit", "B", "print"];
        let output = self.runner.run("parted", &args).await?;
        if !output.status.success() {
            let text = combined_output(&output);
            if text.to_ascii_lowercase().contains("unrecognised disk label") {
                debug!("{device} has no disk label");
                return Ok(DiskListing {
                    path: device.to_string(),
                    ..DiskListing::default()
                });
            }
            return Err(BuildError::ToolFailed {
                command: command_line("parted", &args),
                status: output.status.to_string(),
                output: text,
            }
            .into());
        }
        parse_disk_listing(&output.stdout).map_err(|e| {
            BuildError::UnexpectedToolOutput {
                command: command_line("parted", &args),
                reason: format!("{e:#}"),
            }
            .into()
        })
    }

    pub async fn require_empty_table(&self, device: &DevicePath) -> Result<()> {
        let listing = self.inspect(device).await?;
        if !listing.partitions.is_empty() {
            return Err(BuildError::NonEmptyPartitionTable {
                device: device.to_string(),
                count: listing.partitions.len(),
            }
            .into());
        }
        Ok(())
    }

    /// Write an MBR table with a FAT32 boot partition and an LVM partition
    /// spanning the rest of the disk.
    pub async fn create_table(&self, device: &DevicePath) -> Result<()> {
        self.parted(device, &["mktable", "msdos"]).await?;
        self.parted(device, &["mkpart", "primary", "fat32", "2048s", "257MiB"])
            .await?;
        self.parted(device, &["mkpart", "primary", "ext4", "257MiB", "100%"])
            .await?;
        self.parted(device, &["set", "2", "lvm", "on"]).await?;
        info!("created boot and lvm partitions on {device}");
        Ok(())
    }

    /// Grow the ext4 root partition to the end of the disk, then check and
    /// resize its filesystem.
    ///
    /// Returns the refreshed record, or the empty record when the disk has no
    /// ext4 partition.
    pub async fn grow_last_partition(&self, device: &DevicePath) -> Result<PartitionRecord> {
        let listing = self.inspect(device).await?;
        let record = first_ext4(&listing);
        if record.is_none() {
            warn!("{device} has no ext4 partition, nothing to grow");
            return Ok(record);
        }
        if listing.last_number() != Some(record.number) {
            return Err(BuildError::PartitionNotLast {
                device: device.to_string(),
                number: record.number,
            }
            .into());
        }

        let number = record.number.to_string();
        let end = format!("{}B", listing.end());
        self.parted(device, &["unit", "B", "resizepart", &number, &end])
            .await?;

        let node = device.partition(record.number);
        run_accepting(self.runner, "e2fsck", &["-pf", &node], FSCK_ACCEPTED).await?;
        run_checked(self.runner, "resize2fs", &[&node]).await?;

        let refreshed = first_ext4(&self.inspect(device).await?);
        info!(
            "grew {node} from {} to {} bytes",
            record.size, refreshed.size
        );
        Ok(refreshed)
    }
}
