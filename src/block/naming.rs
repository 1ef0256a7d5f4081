use std::fmt;

use crate::error::BuildError;

/// Block device family, which decides how partition nodes are named.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Loop,
    Nvme,
    Mmc,
    Scsi,
    Other,
}

impl DeviceKind {
    fn of(name: &str) -> Self {
        if name.starts_with("loop") {
            DeviceKind::Loop
        } else if name.starts_with("nvme") {
            DeviceKind::Nvme
        } else if name.starts_with("mmcblk") {
            DeviceKind::Mmc
        } else if ["sd", "vd", "hd", "xvd"].iter().any(|p| name.starts_with(p)) {
            DeviceKind::Scsi
        } else {
            DeviceKind::Other
        }
    }

    fn uses_p_separator(self, name: &str) -> bool {
        match self {
            DeviceKind::Loop | DeviceKind::Nvme | DeviceKind::Mmc => true,
            DeviceKind::Scsi => false,
            // kernel rule: names ending in a digit get a "p" before the number
            DeviceKind::Other => name.ends_with(|c: char| c.is_ascii_digit()),
        }
    }
}

/// A validated whole-disk block device path such as `/dev/sdb` or `/dev/loop3`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevicePath {
    path: String,
    kind: DeviceKind,
}

impl DevicePath {
    pub fn parse(path: &str) -> Result<Self, BuildError> {
        let trimmed = path.trim();
        let name = trimmed
            .strip_prefix("/dev/")
            .filter(|n| !n.is_empty() && !n.ends_with('/'))
            .filter(|n| !n.split('/').any(|part| part.is_empty() || part == ".."))
            .ok_or_else(|| BuildError::InvalidDevicePath(path.to_string()))?;
        Ok(Self {
            path: trimmed.to_string(),
            kind: DeviceKind::of(name),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.path
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    /// Device node of partition `number` (1-based) on this disk.
    pub fn partition(&self, number: u32) -> String {
        let name = self.path.rsplit('/').next().unwrap_or_default();
        if self.kind.uses_p_separator(name) {
            format!("{}p{number}", self.path)
        } else {
            format!("{}{number}", self.path)
        }
    }
}

impl fmt::Display for DevicePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}
