//! Writing a finished image onto a physical device with the LVM layout.
//!
//! The device gets a fresh table, volume group and filesystems, then the
//! image's boot and root trees are copied over with rsync.

use anyhow::Result;
use std::path::{Path, PathBuf};

use crate::block::{DevicePath, LoopDeviceMapper};
use crate::build::{release_error, BuildReporter, ImageStore, Resource, ResourceLedger, Stage};
use crate::config::AppConfig;
use crate::error::BuildFailure;
use crate::exec::{run_checked, CommandRunner};
use crate::media::decompress_zstd;
use crate::mount::{MountLayout, MountSession};
use crate::partition::PartitionPlanner;
use crate::volume::{plan_sizes, VolumeGroupSizer};

fn trailing_slash(path: &Path) -> String {
    let mut s = path.to_string_lossy().into_owned();
    if !s.ends_with('/') {
        s.push('/');
    }
    s
}

pub struct Flasher<'a, R> {
    runner: &'a R,
    config: &'a AppConfig,
}

impl<'a, R: CommandRunner> Flasher<'a, R> {
    pub fn new(runner: &'a R, config: &'a AppConfig) -> Self {
        Self { runner, config }
    }

    /// Flash `image` onto `device`, releasing every acquired resource
    /// whether or not the flash succeeds.
    pub async fn flash(
        &self,
        image: &Path,
        device: &DevicePath,
        reporter: &dyn BuildReporter,
    ) -> Result<(), BuildFailure> {
        let mut ledger = ResourceLedger::new();
        match self.flash_with(&mut ledger, image, device).await {
            Ok(()) => {
                reporter.stage(Stage::FlashedToTarget);
                Ok(())
            }
            Err(cause) => {
                let cleanup = ledger.unwind(self.runner).await;
                for e in &cleanup {
                    reporter.cleanup_error(e);
                }
                reporter.stage(Stage::Failed);
                Err(BuildFailure {
                    stage: Stage::FlashedToTarget,
                    cause,
                    cleanup,
                })
            }
        }
    }

    /// Flash while recording resources in `ledger`.
    ///
    /// On success everything this call acquired has been released again. On
    /// failure the caller owns unwinding the ledger.
    pub async fn flash_with(
        &self,
        ledger: &mut ResourceLedger,
        image: &Path,
        device: &DevicePath,
    ) -> Result<()> {
        let mark = ledger.len();
        let volumes = &self.config.layout.volumes;
        let planner = PartitionPlanner::new(self.runner);
        let sizer = VolumeGroupSizer::new(self.runner, volumes);

        planner.require_empty_table(device).await?;
        planner.create_table(device).await?;

        sizer.create_volume_group(&device.partition(2)).await?;
        ledger.push(Resource::ActiveVolumeGroup(volumes.clone()));
        let snapshot = sizer.snapshot().await?;
        let plan = plan_sizes(&snapshot, &self.config.layout.sizing)?;
        sizer.create_logical_volumes(&plan).await?;
        sizer.create_filesystems(&device.partition(1), &plan).await?;

        let entry = LoopDeviceMapper::new(self.runner).attach(image).await?;
        let name = entry.name.clone();
        ledger.push(Resource::LoopDevice(entry));
        let image_device = DevicePath::parse(&name)?;

        let source = MountSession::attach(
            self.runner,
            &MountLayout::for_image(&image_device),
            &self.config.image_mount_point(),
            None,
        )
        .await?;
        let (source_root, source_boot) = (source.root().to_path_buf(), source.boot());
        ledger.push(Resource::Mounts(source));

        let target = MountSession::attach(
            self.runner,
            &MountLayout::for_lvm_target(device, volumes),
            &self.config.target_mount_point(),
            None,
        )
        .await?;
        let (target_root, target_boot) = (target.root().to_path_buf(), target.boot());
        ledger.push(Resource::Mounts(target));

        self.sync(&source_boot, &target_boot).await?;
        self.sync(&source_root, &target_root).await?;
        info!("copied {} onto {device}", image.display());

        let errors = ledger.unwind_to(mark, self.runner).await;
        if !errors.is_empty() {
            return Err(release_error(&errors));
        }
        Ok(())
    }

    async fn sync(&self, from: &Path, to: &Path) -> Result<()> {
        let (from, to) = (trailing_slash(from), trailing_slash(to));
        info!("syncing {from} -> {to}");
        run_checked(self.runner, "rsync", &["-axv", &from, &to]).await?;
        Ok(())
    }
}

/// Make the compressed image `name` available locally and decompress it for
/// flashing. Each part is skipped when its output is already present.
pub async fn prepare_image<S: ImageStore>(
    store: Option<&S>,
    config: &AppConfig,
    name: &str,
) -> Result<PathBuf> {
    let compressed = config.work_dir.join(name);
    if compressed.exists() {
        info!("{} already present, skipping download", compressed.display());
    } else {
        let store = store.ok_or_else(|| {
            anyhow::anyhow!(
                "{} is not present locally and no image store is configured",
                compressed.display()
            )
        })?;
        store.fetch(name, &compressed).await?;
    }
    let image = config.work_dir.join(&config.media.flash_image_name);
    decompress_zstd(&compressed, &image).await?;
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::LogReporter;
    use crate::error::BuildError;
    use crate::exec::fake::FakeRunner;
    use std::fs;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn vgs(free: u64) -> String {
        format!(
            r#"{{"report":[{{"vg":[{{"vg_name":"rootvg","pv_count":"1","lv_count":"0","snap_count":"0","vg_attr":"wz--n-","vg_size":"{free}B","vg_free":"{free}B"}}]}}]}}"#
        )
    }

    fn loop_listing(device: &str, backing: &Path) -> String {
        format!(
            r#"{{"loopdevices":[{{"name":"{device}","back-file":"{}"}}]}}"#,
            backing.display()
        )
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        config: AppConfig,
        image: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig {
            work_dir: dir.path().to_path_buf(),
            ..AppConfig::default()
        };
        let image = dir.path().join("image-to-be-flashed.img");
        fs::write(&image, b"image").unwrap();
        Fixture {
            image: fs::canonicalize(&image).unwrap(),
            config,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn flashes_and_releases_everything() {
        let fx = fixture();
        let sdb = DevicePath::parse("/dev/sdb").unwrap();
        let runner = FakeRunner::new()
            .fail("parted -s -j", 1, "Error: /dev/sdb: unrecognised disk label")
            .respond("vgs", &vgs(64 * GIB))
            .respond("vgs", &vgs(64 * GIB))
            .respond("vgs", &vgs(54 * GIB))
            .respond("vgs", &vgs(30 * GIB))
            .respond("losetup -lJ", "")
            .respond("losetup -lJ", &loop_listing("/dev/loop4", &fx.image));

        Flasher::new(&runner, &fx.config)
            .flash(&fx.image, &sdb, &LogReporter)
            .await
            .unwrap();

        let calls = runner.calls();
        let at = |prefix: &str| {
            runner
                .position(prefix)
                .unwrap_or_else(|| panic!("missing {prefix}: {calls:#?}"))
        };
        assert!(at("parted -s /dev/sdb mktable msdos") < at("pvcreate /dev/sdb2"));
        assert!(at("vgcreate rootvg /dev/sdb2") < at("lvcreate"));
        assert!(at("mkfs.vfat -F 32 -n system-boot /dev/sdb1") < at("losetup -Pf"));

        let mnt = fx.config.image_mount_point().display().to_string();
        let media = fx.config.target_mount_point().display().to_string();
        let expected = vec![
            format!("mount /dev/mapper/rootvg-rootlv {media}"),
            format!("mount /dev/sdb1 {media}/boot/firmware"),
            format!("rsync -axv {mnt}/boot/firmware/ {media}/boot/firmware/"),
            format!("rsync -axv {mnt}/ {media}/"),
            format!("umount {media}/boot/firmware"),
            format!("umount {media}"),
            format!("umount {mnt}/boot/firmware"),
            format!("umount {mnt}"),
            "losetup --detach /dev/loop4".to_string(),
            "vgchange -an rootvg".to_string(),
        ];
        assert_eq!(calls[calls.len() - expected.len()..], expected[..]);
    }

    #[tokio::test]
    async fn refuses_device_with_partitions() {
        let fx = fixture();
        let sdb = DevicePath::parse("/dev/sdb").unwrap();
        let listing = r#"{"disk":{"path":"/dev/sdb","size":"32017047552B","label":"msdos",
            "partitions":[{"number":1,"start":"1048576B","end":"32017047551B","size":"32015998976B","filesystem":"ext4"}]}}"#;
        let runner = FakeRunner::new().respond("parted -s -j", listing);

        let failure = Flasher::new(&runner, &fx.config)
            .flash(&fx.image, &sdb, &LogReporter)
            .await
            .unwrap_err();
        assert!(matches!(
            failure.cause.downcast_ref::<BuildError>(),
            Some(BuildError::NonEmptyPartitionTable { .. })
        ));
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn small_device_fails_sizing_before_any_volume() {
        let fx = fixture();
        let sdb = DevicePath::parse("/dev/sdb").unwrap();
        let runner = FakeRunner::new()
            .respond("parted -s -j", r#"{"disk":{"path":"/dev/sdb","size":"31914983424B","label":"msdos"}}"#)
            .respond("vgs", &vgs(31_394_365_440));

        let failure = Flasher::new(&runner, &fx.config)
            .flash(&fx.image, &sdb, &LogReporter)
            .await
            .unwrap_err();
        assert!(matches!(
            failure.cause.downcast_ref::<BuildError>(),
            Some(BuildError::InsufficientCapacity { .. })
        ));
        assert!(failure.cleanup.is_empty());
        assert!(runner.position("lvcreate").is_none());
        assert!(runner.position("parted -s /dev/sdb set 2 lvm on").is_some());
        assert_eq!(runner.calls().last().unwrap(), "vgchange -an rootvg");
    }

    struct NoStore;

    impl ImageStore for NoStore {
        async fn upload(&self, _: &Path, _: &str) -> Result<()> {
            anyhow::bail!("upload not expected")
        }

        async fn fetch(&self, _: &str, _: &Path) -> Result<()> {
            anyhow::bail!("fetch not expected")
        }
    }

    #[tokio::test]
    async fn local_compressed_image_is_not_fetched() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig {
            work_dir: dir.path().to_path_buf(),
            ..AppConfig::default()
        };
        let compressed = zstd::stream::encode_all(&b"root filesystem"[..], 3).unwrap();
        fs::write(dir.path().join("node.img.zst"), compressed).unwrap();

        let image = prepare_image(Some(&NoStore), &config, "node.img.zst")
            .await
            .unwrap();
        assert_eq!(image, dir.path().join("image-to-be-flashed.img"));
        assert_eq!(fs::read(image).unwrap(), b"root filesystem");
    }

    #[tokio::test]
    async fn missing_image_without_store_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig {
            work_dir: dir.path().to_path_buf(),
            ..AppConfig::default()
        };
        assert!(prepare_image::<NoStore>(None, &config, "node.img.zst").await.is_err());
    }
}
