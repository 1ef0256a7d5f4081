//! Configuration of the mounted guest OS.
//!
//! Every file is written through [`GuestRoot::write_if_changed`], so running
//! the steps again on an already configured image changes nothing.

mod templates;

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use crate::error::BuildError;
use crate::exec::{run_checked_with_timeout, CommandRunner};
use crate::volume::VolumeLayout;

pub use templates::TemplateRepository;

pub const DEFAULT_CMDLINE: &str = "dwc_otg.lpm_enable=0 console=serial0,115200 console=tty1 root=LABEL=writable rootfstype=ext4 elevator=deadline rootwait fixrtc quiet splash cgroup_enable=memory swapaccount=1 cgroup_memory=1 cgroup_enable=cpuset";

/// One unit of guest configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConfigStep {
    Kernel,
    Modules,
    Packages,
    CloudInit,
    Fstab,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuestConfig {
    pub cmdline: String,
    pub kernel_modules: Vec<String>,
    pub packages: Vec<String>,
    /// Deadline for each command run inside the guest.
    #[serde(with = "humantime_serde")]
    pub command_timeout: Duration,
    /// Host resolver configuration copied into the guest while it is mounted.
    pub host_resolver: PathBuf,
    pub csi_mount_point: String,
    pub container_runtime_mount_point: String,
    pub steps: Vec<ConfigStep>,
    pub kubernetes_sysctls: BTreeMap<String, String>,
    pub cilium_sysctls: BTreeMap<String, String>,
}

fn settings(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

impl Default for GuestConfig {
    fn default() -> Self {
        Self {
            cmdline: DEFAULT_CMDLINE.to_string(),
            kernel_modules: vec!["br_netfilter".to_string(), "overlay".to_string()],
            kubernetes_sysctls: settings(&[
                ("net.bridge.bridge-nf-call-ip6tables", "1"),
                ("net.bridge.bridge-nf-call-iptables", "1"),
                ("net.ipv4.ip_forward", "1"),
            ]),
            cilium_sysctls: settings(&[
                ("net.ipv4.conf.lxc*.rp_filter", "0"),
                ("net.ipv4.conf.all.rp_filter", "0"),
                ("net.ipv4.conf.default.rp_filter", "0"),
            ]),
            packages: [
                "openssh-server",
                "ca-certificates",
                "curl",
                "lsb-release",
                "wget",
                "gnupg",
                "sudo",
                "lm-sensors",
                "perl",
                "htop",
                "crudini",
                "bat",
                "apt-transport-https",
                "nftables",
                "conntrack",
            ]
            .iter()
            .map(|p| p.to_string())
            .collect(),
            command_timeout: Duration::from_secs(10 * 60),
            host_resolver: PathBuf::from("/etc/resolv.conf"),
            csi_mount_point: "/var/lib/csi".to_string(),
            container_runtime_mount_point: "/var/lib/containerd".to_string(),
            steps: vec![
                ConfigStep::Kernel,
                ConfigStep::Modules,
                ConfigStep::Packages,
                ConfigStep::CloudInit,
                ConfigStep::Fstab,
            ],
        }
    }
}

/// Root directory of a mounted guest filesystem.
#[derive(Debug, Clone)]
pub struct GuestRoot {
    root: PathBuf,
}

impl GuestRoot {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Host path of guest path `path`. Absolute guest paths are taken
    /// relative to the guest root; `..` components are refused.
    pub fn resolve(&self, path: &str) -> Result<PathBuf, BuildError> {
        let mut resolved = self.root.clone();
        for component in Path::new(path).components() {
            match component {
                Component::RootDir | Component::CurDir => {}
                Component::Normal(part) => resolved.push(part),
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(BuildError::UnsafeGuestPath(path.to_string()));
                }
            }
        }
        if resolved == self.root {
            return Err(BuildError::UnsafeGuestPath(path.to_string()));
        }
        Ok(resolved)
    }

    /// Write `content` to guest path `path` with `mode`, unless the file
    /// already holds exactly these bytes. Returns whether a write happened.
    pub fn write_if_changed(&self, path: &str, content: &[u8], mode: u32) -> Result<bool> {
        let target = self.resolve(path)?;
        match fs::read(&target) {
            Ok(existing) if existing == content => {
                debug!("{path} unchanged");
                return Ok(false);
            }
            _ => {}
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::write(&target, content).with_context(|| format!("failed to write {path}"))?;
        fs::set_permissions(&target, fs::Permissions::from_mode(mode))
            .with_context(|| format!("failed to set mode of {path}"))?;
        info!("wrote {path}");
        Ok(true)
    }

    pub fn create_dir(&self, path: &str) -> Result<()> {
        let target = self.resolve(path)?;
        fs::create_dir_all(&target).with_context(|| format!("failed to create {path}"))
    }
}

#[derive(Serialize)]
struct Setting<'a> {
    key: &'a str,
    value: &'a str,
}

fn sorted_settings(map: &BTreeMap<String, String>) -> serde_json::Value {
    let settings: Vec<Setting> = map
        .iter()
        .map(|(key, value)| Setting { key, value })
        .collect();
    serde_json::json!({ "settings": settings })
}

/// Applies the configured steps to a mounted guest.
pub struct GuestConfigurator<'a, R> {
    runner: &'a R,
    templates: &'a TemplateRepository,
    config: &'a GuestConfig,
    volumes: &'a VolumeLayout,
}

impl<'a, R: CommandRunner> GuestConfigurator<'a, R> {
    pub fn new(
        runner: &'a R,
        templates: &'a TemplateRepository,
        config: &'a GuestConfig,
        volumes: &'a VolumeLayout,
    ) -> Self {
        Self {
            runner,
            templates,
            config,
            volumes,
        }
    }

    pub async fn configure(&self, guest: &GuestRoot) -> Result<()> {
        for step in &self.config.steps {
            info!("configuring guest: {step:?}");
            match step {
                ConfigStep::Kernel => self.kernel(guest),
                ConfigStep::Modules => self.modules(guest),
                ConfigStep::Packages => self.packages(guest).await,
                ConfigStep::CloudInit => self.cloud_init(guest),
                ConfigStep::Fstab => self.fstab(guest),
            }
            .with_context(|| format!("guest configuration step {step:?} failed"))?;
        }
        Ok(())
    }

    /// Boot command line, firmware config, and an uncompressed kernel the
    /// firmware can load, kept fresh across kernel upgrades by an apt hook.
    pub fn kernel(&self, guest: &GuestRoot) -> Result<()> {
        let cmdline = self
            .templates
            .render(templates::CMDLINE, &serde_json::json!({ "cmdline": self.config.cmdline }))?;
        guest.write_if_changed("/boot/firmware/cmdline.txt", &cmdline, 0o644)?;

        let script = self.templates.render_static(templates::DECOMPRESS_KERNEL)?;
        guest.write_if_changed("/boot/auto_decompress_kernel", &script, 0o544)?;

        let usercfg = self.templates.render_static(templates::USERCFG)?;
        guest.write_if_changed("/boot/firmware/usercfg.txt", &usercfg, 0o644)?;

        let compressed = guest.resolve("/boot/firmware/vmlinuz")?;
        let file = fs::File::open(&compressed)
            .with_context(|| format!("failed to open {}", compressed.display()))?;
        let mut kernel = Vec::new();
        GzDecoder::new(file)
            .read_to_end(&mut kernel)
            .context("failed to decompress kernel")?;
        guest.write_if_changed("/boot/firmware/vmlinux", &kernel, 0o600)?;

        let hook = self.templates.render_static(templates::APT_HOOK)?;
        guest.write_if_changed("/etc/apt/apt.conf.d/999_decompress_rpi_kernel", &hook, 0o644)?;
        Ok(())
    }

    pub fn modules(&self, guest: &GuestRoot) -> Result<()> {
        let modules = self.templates.render(
            templates::MODULES_LOAD,
            &serde_json::json!({ "modules": self.config.kernel_modules }),
        )?;
        guest.write_if_changed("/etc/modules-load.d/k8s.conf", &modules, 0o644)?;

        let kubernetes = self
            .templates
            .render(templates::SYSCTL, &sorted_settings(&self.config.kubernetes_sysctls))?;
        guest.write_if_changed("/etc/sysctl.d/10-kubernetes.conf", &kubernetes, 0o644)?;

        let cilium = self
            .templates
            .render(templates::SYSCTL, &sorted_settings(&self.config.cilium_sysctls))?;
        guest.write_if_changed(
            "/etc/sysctl.d/99-override_cilium_rp_filter.conf",
            &cilium,
            0o644,
        )?;
        Ok(())
    }

    /// Refresh the package index and install the package list inside a
    /// container rooted at the guest.
    pub async fn packages(&self, guest: &GuestRoot) -> Result<()> {
        if self.config.packages.is_empty() {
            return Ok(());
        }
        let root = guest.path().to_string_lossy().into_owned();
        let timeout = self.config.command_timeout;

        run_checked_with_timeout(
            self.runner,
            "systemd-nspawn",
            &["-D", &root, "apt-get", "update"],
            timeout,
        )
        .await?;

        let mut install = vec!["-D", root.as_str(), "apt-get", "install", "-y"];
        install.extend(self.config.packages.iter().map(String::as_str));
        run_checked_with_timeout(self.runner, "systemd-nspawn", &install, timeout).await?;
        info!("installed {} packages", self.config.packages.len());
        Ok(())
    }

    pub fn cloud_init(&self, guest: &GuestRoot) -> Result<()> {
        let dropin = self.templates.render_static(templates::CLOUD_INIT_NETWORK)?;
        guest.write_if_changed(
            "/etc/cloud/cloud.cfg.d/99-disable-network-config.cfg",
            &dropin,
            0o644,
        )?;
        Ok(())
    }

    pub fn fstab(&self, guest: &GuestRoot) -> Result<()> {
        let v = self.volumes;
        let fstab = self.templates.render(
            templates::FSTAB,
            &serde_json::json!({
                "root_label": v.root_label,
                "boot_label": v.boot_label,
                "csi_label": v.csi_label,
                "container_runtime_label": v.container_runtime_label,
                "csi_mount_point": self.config.csi_mount_point,
                "container_runtime_mount_point": self.config.container_runtime_mount_point,
            }),
        )?;
        guest.create_dir(&self.config.csi_mount_point)?;
        guest.create_dir(&self.config.container_runtime_mount_point)?;
        guest.write_if_changed("/etc/fstab", &fstab, 0o644)?;
        Ok(())
    }
}
