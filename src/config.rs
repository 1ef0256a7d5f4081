use log::info;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::guest::GuestConfig;
use crate::volume::{SizingPolicy, VolumeLayout};

pub const CONFIG_FILE: &str = ".pi-image-builder.toml";

const GIB: u64 = 1024 * 1024 * 1024;
const MB: u64 = 1000 * 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub release_url: String,
    /// Compressed base image, relative to `release_url`.
    pub image_name: String,
    pub checksum_name: String,
    /// Backing files at or below this size are grown before attaching.
    pub min_image_size: u64,
    pub growth_step: u64,
    /// Prefix of the timestamped name a finished image is published under.
    pub output_prefix: String,
    /// Local name of a decompressed image fetched for flashing.
    pub flash_image_name: String,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            release_url: "https://cdimage.ubuntu.com/releases/20.04/release".to_string(),
            image_name: "ubuntu-20.04.5-preinstalled-server-arm64+raspi.img.xz".to_string(),
            checksum_name: "SHA256SUMS".to_string(),
            min_image_size: 4 * GIB,
            growth_step: 1000 * MB,
            output_prefix: "ubuntu-20-04-arm64".to_string(),
            flash_image_name: "image-to-be-flashed.img".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    #[serde(flatten)]
    pub volumes: VolumeLayout,
    pub sizing: SizingPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Base URL images are uploaded to and fetched from. Upload is skipped
    /// when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub compression_level: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            compression_level: 19,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub work_dir: PathBuf,
    pub media: MediaConfig,
    pub layout: LayoutConfig,
    pub guest: GuestConfig,
    pub store: StoreConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("."),
            media: MediaConfig::default(),
            layout: LayoutConfig::default(),
            guest: GuestConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn generate_config_file(path: &Path, force: bool) -> anyhow::Result<()> {
        if path.exists() && !force {
            anyhow::bail!(
                "Configuration file {} already exists. Use --force to overwrite.",
                path.display()
            );
        }

        fs::write(path, Self::generate_full_config()?)?;

        info!("Configuration file generated: {}", path.display());
        info!("Please edit this file to customize configuration");
        Ok(())
    }

    pub fn generate_full_config() -> anyhow::Result<String> {
        let toml_content = toml::to_string_pretty(&AppConfig::default())?;
        Ok(format!(
            "# pi-image-builder configuration file\n# All fields are optional, command line arguments override config file values\n\n{}",
            toml_content
        ))
    }

    /// Where the base image is mounted for configuration.
    pub fn image_mount_point(&self) -> PathBuf {
        self.work_dir.join("mnt")
    }

    /// Where a target device is mounted while it is being flashed.
    pub fn target_mount_point(&self) -> PathBuf {
        self.work_dir.join("media-mnt")
    }
}
