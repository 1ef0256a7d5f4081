//! The build state machine: acquire, extract, grow, attach, mount,
//! configure, release, then publish or flash.

mod ledger;
mod store;

use anyhow::Result;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::block::{grow_backing_file, DevicePath, LoopDeviceMapper};
use crate::config::AppConfig;
use crate::error::BuildFailure;
use crate::exec::CommandRunner;
use crate::flash::Flasher;
use crate::guest::{GuestConfigurator, GuestRoot, TemplateRepository};
use crate::media::{compress_image, extract_xz, release_image_name, MediaFetcher};
use crate::mount::{MountLayout, MountSession};
use crate::partition::PartitionPlanner;

pub use ledger::{release_error, Resource, ResourceLedger};
pub use store::{HttpImageStore, ImageStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    MediaAcquired,
    Extracted,
    SizeExpanded,
    DeviceAttached,
    FilesystemExpanded,
    Mounted,
    Configured,
    Unmounted,
    Compressed,
    Uploaded,
    FlashedToTarget,
    Done,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Idle => "idle",
            Stage::MediaAcquired => "media-acquired",
            Stage::Extracted => "extracted",
            Stage::SizeExpanded => "size-expanded",
            Stage::DeviceAttached => "device-attached",
            Stage::FilesystemExpanded => "filesystem-expanded",
            Stage::Mounted => "mounted",
            Stage::Configured => "configured",
            Stage::Unmounted => "unmounted",
            Stage::Compressed => "compressed",
            Stage::Uploaded => "uploaded",
            Stage::FlashedToTarget => "flashed-to-target",
            Stage::Done => "done",
            Stage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Receives progress notifications from the pipeline.
pub trait BuildReporter {
    fn stage(&self, stage: Stage);

    fn cleanup_error(&self, err: &anyhow::Error) {
        error!("cleanup failed: {err:#}");
    }
}

/// Reports through the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl BuildReporter for LogReporter {
    fn stage(&self, stage: Stage) {
        match stage {
            Stage::Failed => error!("build stage: {stage}"),
            _ => info!("build stage: {stage}"),
        }
    }
}

/// What happens to the configured image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildTarget {
    /// Compress and, when a store is configured, upload.
    Publish,
    Flash(DevicePath),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BuildOptions {
    pub force_download: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    /// Compressed image, and the name it was uploaded under if it was.
    Published {
        image: PathBuf,
        uploaded_as: Option<String>,
    },
    Flashed(DevicePath),
}

/// Drives one build from base media to a published or flashed image.
///
/// Every acquired host resource is recorded in a ledger; on failure the
/// ledger is unwound newest first and the run ends in [`Stage::Failed`].
pub struct BuildOrchestrator<'a, R, S> {
    runner: &'a R,
    store: Option<&'a S>,
    config: &'a AppConfig,
    templates: &'a TemplateRepository,
    reporter: Box<dyn BuildReporter + 'a>,
    stage: Stage,
    attempting: Stage,
    ledger: ResourceLedger,
}

impl<'a, R: CommandRunner, S: ImageStore> BuildOrchestrator<'a, R, S> {
    pub fn new(
        runner: &'a R,
        store: Option<&'a S>,
        config: &'a AppConfig,
        templates: &'a TemplateRepository,
        reporter: Box<dyn BuildReporter + 'a>,
    ) -> Self {
        Self {
            runner,
            store,
            config,
            templates,
            reporter,
            stage: Stage::Idle,
            attempting: Stage::Idle,
            ledger: ResourceLedger::new(),
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub async fn run(
        &mut self,
        target: &BuildTarget,
        options: BuildOptions,
    ) -> Result<BuildOutcome, BuildFailure> {
        match self.drive(target, options).await {
            Ok(outcome) => {
                self.attempt(Stage::Done);
                self.reach();
                Ok(outcome)
            }
            Err(cause) => {
                error!("build failed while reaching {}: {cause:#}", self.attempting);
                let cleanup = self.ledger.unwind(self.runner).await;
                for e in &cleanup {
                    self.reporter.cleanup_error(e);
                }
                self.stage = Stage::Failed;
                self.reporter.stage(Stage::Failed);
                Err(BuildFailure {
                    stage: self.attempting,
                    cause,
                    cleanup,
                })
            }
        }
    }

    fn attempt(&mut self, stage: Stage) {
        self.attempting = stage;
    }

    fn reach(&mut self) {
        self.stage = self.attempting;
        self.reporter.stage(self.stage);
    }

    async fn drive(&mut self, target: &BuildTarget, options: BuildOptions) -> Result<BuildOutcome> {
        let config = self.config;
        let runner = self.runner;

        self.attempt(Stage::MediaAcquired);
        let artifact = MediaFetcher::new(&config.media.release_url, &config.work_dir)
            .acquire(
                &config.media.image_name,
                &config.media.checksum_name,
                options.force_download,
            )
            .await?;
        self.reach();

        self.attempt(Stage::Extracted);
        let image = extract_xz(&artifact.path).await?;
        self.reach();

        self.attempt(Stage::SizeExpanded);
        grow_backing_file(&image, config.media.min_image_size, config.media.growth_step)?;
        self.reach();

        self.attempt(Stage::DeviceAttached);
        let entry = LoopDeviceMapper::new(runner).attach(&image).await?;
        let name = entry.name.clone();
        self.ledger.push(Resource::LoopDevice(entry));
        let device = DevicePath::parse(&name)?;
        self.reach();

        self.attempt(Stage::FilesystemExpanded);
        PartitionPlanner::new(runner)
            .grow_last_partition(&device)
            .await?;
        self.reach();

        self.attempt(Stage::Mounted);
        let session = MountSession::attach(
            runner,
            &MountLayout::for_image(&device),
            &config.image_mount_point(),
            Some(&config.guest.host_resolver),
        )
        .await?;
        let guest = GuestRoot::new(session.root());
        self.ledger.push(Resource::Mounts(session));
        self.reach();

        self.attempt(Stage::Configured);
        GuestConfigurator::new(
            runner,
            self.templates,
            &config.guest,
            &config.layout.volumes,
        )
        .configure(&guest)
        .await?;
        self.reach();

        self.attempt(Stage::Unmounted);
        let errors = self.ledger.unwind(runner).await;
        if !errors.is_empty() {
            return Err(release_error(&errors));
        }
        self.reach();

        match target {
            BuildTarget::Publish => self.publish(&image).await,
            BuildTarget::Flash(device) => {
                self.attempt(Stage::FlashedToTarget);
                Flasher::new(runner, config)
                    .flash_with(&mut self.ledger, &image, device)
                    .await?;
                self.reach();
                Ok(BuildOutcome::Flashed(device.clone()))
            }
        }
    }

    async fn publish(&mut self, image: &Path) -> Result<BuildOutcome> {
        self.attempt(Stage::Compressed);
        let name = release_image_name(&self.config.media.output_prefix, &chrono::Local::now());
        let compressed = compress_image(image, &name, self.config.store.compression_level).await?;
        self.reach();

        let Some(store) = self.store else {
            warn!(
                "no image store configured, leaving {} in place",
                compressed.display()
            );
            return Ok(BuildOutcome::Published {
                image: compressed,
                uploaded_as: None,
            });
        };

        self.attempt(Stage::Uploaded);
        let object = format!("{name}.zst");
        store.upload(&compressed, &object).await?;
        self.reach();
        Ok(BuildOutcome::Published {
            image: compressed,
            uploaded_as: Some(object),
        })
    }
}
