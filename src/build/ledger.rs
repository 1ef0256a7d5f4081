use crate::block::{LoopDeviceEntry, LoopDeviceMapper};
use crate::exec::CommandRunner;
use crate::mount::MountSession;
use crate::volume::{VolumeGroupSizer, VolumeLayout};

/// Something acquired on the host that must be released again.
#[derive(Debug)]
pub enum Resource {
    LoopDevice(LoopDeviceEntry),
    ActiveVolumeGroup(VolumeLayout),
    Mounts(MountSession),
}

impl Resource {
    fn describe(&self) -> String {
        match self {
            Resource::LoopDevice(entry) => format!("loop device {}", entry.name),
            Resource::ActiveVolumeGroup(layout) => format!("volume group {}", layout.volume_group),
            Resource::Mounts(session) => format!("mounts under {}", session.root().display()),
        }
    }
}

/// Acquired resources in acquisition order; released newest first.
#[derive(Debug, Default)]
pub struct ResourceLedger {
    entries: Vec<Resource>,
}

impl ResourceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, resource: Resource) {
        debug!("holding {}", resource.describe());
        self.entries.push(resource);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Release everything.
    pub async fn unwind<R: CommandRunner>(&mut self, runner: &R) -> Vec<anyhow::Error> {
        self.unwind_to(0, runner).await
    }

    /// Release resources acquired after the ledger held `mark` entries.
    ///
    /// Every release is attempted; failures are collected, not short-circuited.
    pub async fn unwind_to<R: CommandRunner>(
        &mut self,
        mark: usize,
        runner: &R,
    ) -> Vec<anyhow::Error> {
        let mut errors = Vec::new();
        while self.entries.len() > mark {
            let Some(resource) = self.entries.pop() else {
                break;
            };
            debug!("releasing {}", resource.describe());
            match resource {
                Resource::LoopDevice(entry) => {
                    if let Err(e) = LoopDeviceMapper::new(runner).detach(&entry).await {
                        errors.push(e);
                    }
                }
                Resource::ActiveVolumeGroup(layout) => {
                    if let Err(e) = VolumeGroupSizer::new(runner, &layout).deactivate().await {
                        errors.push(e);
                    }
                }
                Resource::Mounts(mut session) => errors.extend(session.teardown(runner).await),
            }
        }
        errors
    }
}

/// Collapse release failures into one error that lists each of them.
pub fn release_error(errors: &[anyhow::Error]) -> anyhow::Error {
    let detail: Vec<String> = errors.iter().map(|e| format!("{e:#}")).collect();
    anyhow::anyhow!(
        "{} resource(s) could not be released: {}",
        errors.len(),
        detail.join("; ")
    )
}
