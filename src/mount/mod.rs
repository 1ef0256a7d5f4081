//! Mounting an image or target device as a working tree, with an optional
//! resolver substitution so tools inside the guest can reach the network.

use anyhow::{Context, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::block::DevicePath;
use crate::exec::{run_checked, CommandRunner};
use crate::volume::VolumeLayout;

const RESOLV_CONF: &str = "etc/resolv.conf";
const RESOLV_BACKUP: &str = "etc/resolv.conf.pi-image-builder";
const BOOT_MOUNT: &str = "boot/firmware";

/// Which block devices hold the root and boot filesystems.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountLayout {
    pub root_source: String,
    pub boot_source: String,
}

impl MountLayout {
    /// Stock image layout: boot on partition 1, root on partition 2.
    pub fn for_image(device: &DevicePath) -> Self {
        Self {
            root_source: device.partition(2),
            boot_source: device.partition(1),
        }
    }

    /// Flashed target layout: boot on partition 1, root on the root volume.
    pub fn for_lvm_target(device: &DevicePath, volumes: &VolumeLayout) -> Self {
        Self {
            root_source: volumes.root_mapper(),
            boot_source: device.partition(1),
        }
    }
}

#[derive(Debug)]
struct ActiveMount {
    source: String,
    target: PathBuf,
}

#[derive(Debug)]
enum ResolverBackup {
    /// The guest had no resolver entry; the substitute is simply removed.
    Absent,
    /// The guest entry (file or symlink) was renamed here.
    Renamed(PathBuf),
}

/// Mounted root and boot filesystems of one image or device.
///
/// Torn down in strict reverse order: resolver first, then boot, then root.
#[derive(Debug)]
pub struct MountSession {
    root: PathBuf,
    mounts: Vec<ActiveMount>,
    resolver: Option<ResolverBackup>,
}

impl MountSession {
    /// Mount `layout` at `root` and, when `host_resolver` is given, replace
    /// the guest resolver configuration with the host's.
    ///
    /// If any step fails, whatever was already mounted is released before the
    /// error is returned.
    pub async fn attach<R: CommandRunner>(
        runner: &R,
        layout: &MountLayout,
        root: &Path,
        host_resolver: Option<&Path>,
    ) -> Result<Self> {
        let mut session = MountSession {
            root: root.to_path_buf(),
            mounts: Vec::new(),
            resolver: None,
        };
        match session.mount_all(runner, layout, host_resolver).await {
            Ok(()) => Ok(session),
            Err(err) => {
                let cleanup = session.teardown(runner).await;
                for e in &cleanup {
                    error!("cleanup after failed mount: {e:#}");
                }
                if cleanup.is_empty() {
                    Err(err)
                } else {
                    Err(err.context(format!(
                        "{} cleanup error(s) while unwinding a partial mount",
                        cleanup.len()
                    )))
                }
            }
        }
    }

    async fn mount_all<R: CommandRunner>(
        &mut self,
        runner: &R,
        layout: &MountLayout,
        host_resolver: Option<&Path>,
    ) -> Result<()> {
        let root = self.root.clone();
        self.mount(runner, &layout.root_source, &root).await?;
        self.mount(runner, &layout.boot_source, &root.join(BOOT_MOUNT))
            .await?;
        if let Some(host) = host_resolver {
            self.substitute_resolver(host)?;
        }
        Ok(())
    }

    async fn mount<R: CommandRunner>(
        &mut self,
        runner: &R,
        source: &str,
        target: &Path,
    ) -> Result<()> {
        fs::create_dir_all(target)
            .with_context(|| format!("failed to create mount point {}", target.display()))?;
        let target_arg = target.to_string_lossy();
        run_checked(runner, "mount", &[source, &target_arg]).await?;
        info!("mounted {source} at {}", target.display());
        self.mounts.push(ActiveMount {
            source: source.to_string(),
            target: target.to_path_buf(),
        });
        Ok(())
    }

    fn substitute_resolver(&mut self, host: &Path) -> Result<()> {
        let guest = self.root.join(RESOLV_CONF);
        let backup = self.root.join(RESOLV_BACKUP);
        let content =
            fs::read(host).with_context(|| format!("failed to read {}", host.display()))?;

        // A backup left by an interrupted run holds the guest's own entry and
        // the current resolv.conf is a stale substitute.
        if fs::symlink_metadata(&backup).is_ok() {
            warn!("keeping existing resolver backup {}", backup.display());
            match fs::remove_file(&guest) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("failed to remove {}", guest.display()));
                }
            }
            self.resolver = Some(ResolverBackup::Renamed(backup));
        } else {
            // symlink_metadata so a dangling stub-resolv.conf link still counts as present
            match fs::symlink_metadata(&guest) {
                Ok(_) => {
                    fs::rename(&guest, &backup).with_context(|| {
                        format!("failed to back up {}", guest.display())
                    })?;
                    self.resolver = Some(ResolverBackup::Renamed(backup));
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    if let Some(parent) = guest.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    self.resolver = Some(ResolverBackup::Absent);
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("failed to stat {}", guest.display()));
                }
            }
        }

        fs::write(&guest, content)
            .with_context(|| format!("failed to write {}", guest.display()))?;
        debug!("guest resolver replaced with {}", host.display());
        Ok(())
    }

    fn restore_resolver(&mut self) -> Result<()> {
        let Some(backup) = self.resolver.take() else {
            return Ok(());
        };
        let guest = self.root.join(RESOLV_CONF);
        match fs::remove_file(&guest) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                self.resolver = Some(backup);
                return Err(e).with_context(|| format!("failed to remove {}", guest.display()));
            }
        }
        let restored = match &backup {
            ResolverBackup::Renamed(path) => fs::rename(path, &guest),
            ResolverBackup::Absent => Ok(()),
        };
        if let Err(e) = restored {
            self.resolver = Some(backup);
            return Err(e).with_context(|| format!("failed to restore {}", guest.display()));
        }
        debug!("guest resolver restored");
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn boot(&self) -> PathBuf {
        self.root.join(BOOT_MOUNT)
    }

    pub fn is_active(&self) -> bool {
        !self.mounts.is_empty() || self.resolver.is_some()
    }

    /// Restore the resolver and unmount everything in reverse order.
    ///
    /// Every step is attempted even when an earlier one fails; all failures
    /// are returned.
    pub async fn teardown<R: CommandRunner>(&mut self, runner: &R) -> Vec<anyhow::Error> {
        let mut errors = Vec::new();
        if let Err(e) = self.restore_resolver() {
            errors.push(e);
        }
        while let Some(mount) = self.mounts.pop() {
            let target = mount.target.to_string_lossy().into_owned();
            match run_checked(runner, "umount", &[&target]).await {
                Ok(_) => info!("unmounted {} from {target}", mount.source),
                Err(e) => errors.push(e.context(format!("failed to unmount {target}"))),
            }
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::fake::FakeRunner;
    use std::os::unix::fs::symlink;

    const STUB: &str = "../run/systemd/resolve/stub-resolv.conf";

    fn guest_with_stub_link() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("mnt/etc")).unwrap();
        symlink(STUB, dir.path().join("mnt").join(RESOLV_CONF)).unwrap();
        dir
    }

    #[test]
    fn layouts_pick_partition_nodes() {
        let loop8 = DevicePath::parse("/dev/loop8").unwrap();
        let image = MountLayout::for_image(&loop8);
        assert_eq!(image.root_source, "/dev/loop8p2");
        assert_eq!(image.boot_source, "/dev/loop8p1");

        let sdb = DevicePath::parse("/dev/sdb").unwrap();
        let target = MountLayout::for_lvm_target(&sdb, &VolumeLayout::default());
        assert_eq!(target.root_source, "/dev/mapper/rootvg-rootlv");
        assert_eq!(target.boot_source, "/dev/sdb1");
    }

    #[tokio::test]
    async fn round_trip_restores_resolver_and_unmounts_in_reverse() {
        let dir = guest_with_stub_link();
        let host = dir.path().join("host-resolv.conf");
        fs::write(&host, "nameserver 1.1.1.1\n").unwrap();
        let root = dir.path().join("mnt");
        let loop8 = DevicePath::parse("/dev/loop8").unwrap();
        let runner = FakeRunner::new();

        let mut session =
            MountSession::attach(&runner, &MountLayout::for_image(&loop8), &root, Some(&host))
                .await
                .unwrap();
        let guest = root.join(RESOLV_CONF);
        assert_eq!(fs::read_to_string(&guest).unwrap(), "nameserver 1.1.1.1\n");
        assert!(root.join(BOOT_MOUNT).is_dir());

        let errors = session.teardown(&runner).await;
        assert!(errors.is_empty(), "{errors:?}");
        assert!(!session.is_active());
        assert_eq!(fs::read_link(&guest).unwrap(), PathBuf::from(STUB));
        assert!(fs::symlink_metadata(root.join(RESOLV_BACKUP)).is_err());

        let root_s = root.display().to_string();
        assert_eq!(
            runner.calls(),
            vec![
                format!("mount /dev/loop8p2 {root_s}"),
                format!("mount /dev/loop8p1 {root_s}/boot/firmware"),
                format!("umount {root_s}/boot/firmware"),
                format!("umount {root_s}"),
            ]
        );
    }

    #[tokio::test]
    async fn leftover_backup_from_interrupted_run_is_restored() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("mnt");
        fs::create_dir_all(root.join("etc")).unwrap();
        fs::write(root.join(RESOLV_CONF), "nameserver 10.9.9.9\n").unwrap();
        symlink(STUB, root.join(RESOLV_BACKUP)).unwrap();
        let host = dir.path().join("host-resolv.conf");
        fs::write(&host, "nameserver 10.9.9.9\n").unwrap();
        let loop8 = DevicePath::parse("/dev/loop8").unwrap();
        let runner = FakeRunner::new();

        let mut session =
            MountSession::attach(&runner, &MountLayout::for_image(&loop8), &root, Some(&host))
                .await
                .unwrap();
        assert_eq!(fs::read_link(root.join(RESOLV_BACKUP)).unwrap(), PathBuf::from(STUB));
        assert!(session.teardown(&runner).await.is_empty());

        assert_eq!(fs::read_link(root.join(RESOLV_CONF)).unwrap(), PathBuf::from(STUB));
        assert!(fs::symlink_metadata(root.join(RESOLV_BACKUP)).is_err());
    }

    #[tokio::test]
    async fn missing_guest_resolver_is_removed_again() {
        let dir = tempfile::tempdir().unwrap();
        let host = dir.path().join("host-resolv.conf");
        fs::write(&host, "nameserver 9.9.9.9\n").unwrap();
        let root = dir.path().join("mnt");
        let loop8 = DevicePath::parse("/dev/loop8").unwrap();
        let runner = FakeRunner::new();

        let mut session =
            MountSession::attach(&runner, &MountLayout::for_image(&loop8), &root, Some(&host))
                .await
                .unwrap();
        assert!(root.join(RESOLV_CONF).exists());
        assert!(session.teardown(&runner).await.is_empty());
        assert!(fs::symlink_metadata(root.join(RESOLV_CONF)).is_err());
    }

    #[tokio::test]
    async fn failed_boot_mount_unwinds_root_mount() {
        let dir = guest_with_stub_link();
        let root = dir.path().join("mnt");
        let loop8 = DevicePath::parse("/dev/loop8").unwrap();
        let runner = FakeRunner::new().fail("mount /dev/loop8p1", 32, "wrong fs type");

        let err = MountSession::attach(&runner, &MountLayout::for_image(&loop8), &root, None)
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("wrong fs type"));
        let calls = runner.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[2], format!("umount {}", root.display()));
        assert_eq!(fs::read_link(root.join(RESOLV_CONF)).unwrap(), PathBuf::from(STUB));
    }

    #[tokio::test]
    async fn teardown_keeps_going_after_an_unmount_failure() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("mnt");
        let loop8 = DevicePath::parse("/dev/loop8").unwrap();
        let runner = FakeRunner::new().fail("umount", 32, "target is busy");

        let mut session = MountSession::attach(&runner, &MountLayout::for_image(&loop8), &root, None)
            .await
            .unwrap();
        let errors = session.teardown(&runner).await;
        assert_eq!(errors.len(), 1);
        assert!(format!("{:#}", errors[0]).contains("busy"));
        assert_eq!(runner.calls().iter().filter(|c| c.starts_with("umount")).count(), 2);
    }
}
