//! LVM layout: physical volume, volume group, logical volume sizing and
//! creation, and the filesystems on top of them.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::BuildError;
use crate::exec::{command_line, run_checked, CommandRunner};

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// How the volume group's free space is divided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SizingPolicy {
    /// Left unallocated for LVM metadata and rounding.
    pub headroom: u64,
    pub root: u64,
    pub container_runtime: u64,
    /// Smallest acceptable CSI storage volume.
    pub csi_floor: u64,
}

impl Default for SizingPolicy {
    fn default() -> Self {
        Self {
            headroom: 2 * 256 * MIB,
            root: 10 * GIB,
            container_runtime: 30 * GIB,
            csi_floor: 5 * GIB,
        }
    }
}

impl SizingPolicy {
    /// Everything the policy needs before a single CSI byte is available.
    pub fn minimum_free(&self) -> u64 {
        self.headroom
            .saturating_add(self.root)
            .saturating_add(self.container_runtime)
            .saturating_add(self.csi_floor)
    }
}

/// Names and filesystem labels of the volume group and its volumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeLayout {
    pub volume_group: String,
    pub root_volume: String,
    pub csi_volume: String,
    pub container_runtime_volume: String,
    pub boot_label: String,
    pub root_label: String,
    pub csi_label: String,
    pub container_runtime_label: String,
}

impl Default for VolumeLayout {
    fn default() -> Self {
        Self {
            volume_group: "rootvg".to_string(),
            root_volume: "rootlv".to_string(),
            csi_volume: "csilv".to_string(),
            container_runtime_volume: "containerdlv".to_string(),
            boot_label: "system-boot".to_string(),
            root_label: "writable".to_string(),
            csi_label: "csi".to_string(),
            container_runtime_label: "containerd".to_string(),
        }
    }
}

impl VolumeLayout {
    /// Device-mapper node of a logical volume. LVM doubles dashes in both names.
    pub fn mapper_path(&self, volume: &str) -> String {
        format!(
            "/dev/mapper/{}-{}",
            self.volume_group.replace('-', "--"),
            volume.replace('-', "--")
        )
    }

    pub fn root_mapper(&self) -> String {
        self.mapper_path(&self.root_volume)
    }
}

#[derive(Debug, Deserialize)]
struct VgsReport {
    report: Vec<VgsSection>,
}

#[derive(Debug, Deserialize)]
struct VgsSection {
    #[serde(default)]
    vg: Vec<VgsRow>,
}

#[derive(Debug, Deserialize)]
struct VgsRow {
    vg_name: String,
    pv_count: String,
    lv_count: String,
    vg_size: String,
    vg_free: String,
}

/// Capacity of a volume group at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeGroupSnapshot {
    pub name: String,
    pub pv_count: u32,
    pub lv_count: u32,
    pub size: u64,
    pub free: u64,
}

fn lvm_number(field: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .trim_end_matches('B')
        .parse()
        .with_context(|| format!("invalid {field} value {value:?}"))
}

fn lvm_count(field: &str, value: &str) -> Result<u32> {
    let n = lvm_number(field, value)?;
    u32::try_from(n).with_context(|| format!("{field} value {n} out of range"))
}

/// Parse `vgs <vg> --reportformat json --units B`.
pub fn parse_vgs_report(output: &[u8]) -> Result<VolumeGroupSnapshot> {
    let report: VgsReport = serde_json::from_slice(output).context("failed to parse vgs report")?;
    let row = report
        .report
        .into_iter()
        .flat_map(|section| section.vg)
        .next()
        .context("vgs report lists no volume group")?;
    Ok(VolumeGroupSnapshot {
        pv_count: lvm_count("pv_count", &row.pv_count)?,
        lv_count: lvm_count("lv_count", &row.lv_count)?,
        size: lvm_number("vg_size", &row.vg_size)?,
        free: lvm_number("vg_free", &row.vg_free)?,
        name: row.vg_name,
    })
}

/// Byte sizes of the three logical volumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogicalVolumeSizing {
    pub root: u64,
    pub csi: u64,
    pub container_runtime: u64,
}

impl LogicalVolumeSizing {
    pub fn total(&self) -> u64 {
        self.root + self.csi + self.container_runtime
    }
}

/// Divide the group's free space: fixed root and container runtime volumes,
/// the remainder for CSI storage.
///
/// Fails instead of shrinking anything when the remainder is below the CSI
/// floor.
pub fn plan_sizes(
    snapshot: &VolumeGroupSnapshot,
    policy: &SizingPolicy,
) -> Result<LogicalVolumeSizing, BuildError> {
    let insufficient = || BuildError::InsufficientCapacity {
        volume_group: snapshot.name.clone(),
        available: snapshot.free,
        required: policy.minimum_free(),
    };
    let csi = snapshot
        .free
        .checked_sub(policy.headroom)
        .and_then(|v| v.checked_sub(policy.root))
        .and_then(|v| v.checked_sub(policy.container_runtime))
        .ok_or_else(insufficient)?;
    if csi < policy.csi_floor {
        return Err(insufficient());
    }
    Ok(LogicalVolumeSizing {
        root: policy.root,
        csi,
        container_runtime: policy.container_runtime,
    })
}

struct PlannedVolume<'l> {
    name: &'l str,
    label: &'l str,
    size: u64,
}

pub struct VolumeGroupSizer<'a, R> {
    runner: &'a R,
    layout: &'a VolumeLayout,
}

impl<'a, R: CommandRunner> VolumeGroupSizer<'a, R> {
    pub fn new(runner: &'a R, layout: &'a VolumeLayout) -> Self {
        Self { runner, layout }
    }

    /// Initialise `partition` as a physical volume and create the group on it.
    pub async fn create_volume_group(&self, partition: &str) -> Result<()> {
        run_checked(self.runner, "pvcreate", &[partition]).await?;
        run_checked(
            self.runner,
            "vgcreate",
            &[&self.layout.volume_group, partition],
        )
        .await?;
        info!(
            "created volume group {} on {partition}",
            self.layout.volume_group
        );
        Ok(())
    }

    pub async fn snapshot(&self) -> Result<VolumeGroupSnapshot> {
        let args = [
            self.layout.volume_group.as_str(),
            "--reportformat",
            "json",
            "--units",
            "B",
        ];
        let output = run_checked(self.runner, "vgs", &args).await?;
        parse_vgs_report(&output.stdout).map_err(|e| {
            BuildError::UnexpectedToolOutput {
                command: command_line("vgs", &args),
                reason: format!("{e:#}"),
            }
            .into()
        })
    }

    fn planned<'l>(&'l self, plan: &LogicalVolumeSizing) -> [PlannedVolume<'l>; 3] {
        let l = self.layout;
        [
            PlannedVolume {
                name: &l.root_volume,
                label: &l.root_label,
                size: plan.root,
            },
            PlannedVolume {
                name: &l.csi_volume,
                label: &l.csi_label,
                size: plan.csi,
            },
            PlannedVolume {
                name: &l.container_runtime_volume,
                label: &l.container_runtime_label,
                size: plan.container_runtime,
            },
        ]
    }

    /// Create root, CSI and container runtime volumes in that order.
    ///
    /// The group is re-queried before each creation so a volume that no
    /// longer fits fails before anything is written. Zero-sized volumes are
    /// skipped.
    pub async fn create_logical_volumes(&self, plan: &LogicalVolumeSizing) -> Result<()> {
        for volume in self.planned(plan).iter().filter(|v| v.size > 0) {
            let snapshot = self.snapshot().await?;
            if snapshot.free < volume.size {
                return Err(BuildError::InsufficientCapacity {
                    volume_group: snapshot.name,
                    available: snapshot.free,
                    required: volume.size,
                }
                .into());
            }
            let size = format!("{}B", volume.size);
            run_checked(
                self.runner,
                "lvcreate",
                &[
                    "--size",
                    &size,
                    &self.layout.volume_group,
                    "-n",
                    volume.name,
                    "--wipesignatures",
                    "y",
                ],
            )
            .await?;
            info!("created logical volume {} ({} bytes)", volume.name, volume.size);
        }
        Ok(())
    }

    /// FAT32 on the boot partition, ext4 on every created logical volume.
    pub async fn create_filesystems(
        &self,
        boot_partition: &str,
        plan: &LogicalVolumeSizing,
    ) -> Result<()> {
        run_checked(
            self.runner,
            "mkfs.vfat",
            &["-F", "32", "-n", &self.layout.boot_label, boot_partition],
        )
        .await?;
        for volume in self.planned(plan).iter().filter(|v| v.size > 0) {
            let node = self.layout.mapper_path(volume.name);
            run_checked(self.runner, "mkfs.ext4", &["-L", volume.label, &node]).await?;
        }
        info!("created filesystems on {boot_partition} and {}", self.layout.volume_group);
        Ok(())
    }

    /// Deactivate every volume in the group so the device can be released.
    pub async fn deactivate(&self) -> Result<()> {
        run_checked(self.runner, "vgchange", &["-an", &self.layout.volume_group])
            .await
            .with_context(|| format!("failed to deactivate {}", self.layout.volume_group))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::fake::FakeRunner;

    fn vgs(free: u64) -> String {
        format!(
            r#"  {{
      "report": [
          {{
              "vg": [
                  {{"vg_name":"rootvg", "pv_count":"1", "lv_count":"0", "snap_count":"0", "vg_attr":"wz--n-", "vg_size":"31394365440B", "vg_free":"{free}B"}}
              ]
          }}
      ]
  }}
"#
        )
    }

    fn snapshot(free: u64) -> VolumeGroupSnapshot {
        parse_vgs_report(vgs(free).as_bytes()).unwrap()
    }

    #[test]
    fn parses_vgs_report() {
        let snap = snapshot(31_394_365_440);
        assert_eq!(snap.name, "rootvg");
        assert_eq!(snap.pv_count, 1);
        assert_eq!(snap.lv_count, 0);
        assert_eq!(snap.free, 31_394_365_440);
    }

    #[tokio::test]
    async fn oversized_volume_count_is_unexpected_output() {
        let report = vgs(GIB).replace(r#""pv_count":"1""#, r#""pv_count":"4294967296""#);
        assert!(parse_vgs_report(report.as_bytes()).is_err());

        let runner = FakeRunner::new().respond("vgs", &report);
        let layout = VolumeLayout::default();
        let err = VolumeGroupSizer::new(&runner, &layout)
            .snapshot()
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::UnexpectedToolOutput { .. })
        ));
    }

    #[test]
    fn sizing_without_container_runtime_reservation() {
        let policy = SizingPolicy {
            container_runtime: 0,
            ..SizingPolicy::default()
        };
        let plan = plan_sizes(&snapshot(31_394_365_440), &policy).unwrap();
        assert_eq!(plan.root, 10_737_418_240);
        assert_eq!(plan.csi, 20_120_076_288);
        assert_eq!(plan.container_runtime, 0);
        assert!(plan.total() <= 31_394_365_440 - policy.headroom);
    }

    #[test]
    fn default_policy_fails_on_small_group() {
        let err = plan_sizes(&snapshot(31_394_365_440), &SizingPolicy::default()).unwrap_err();
        match err {
            BuildError::InsufficientCapacity {
                available,
                required,
                ..
            } => {
                assert_eq!(available, 31_394_365_440);
                assert_eq!(required, 512 * MIB + 45 * GIB);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn csi_floor_is_inclusive() {
        let policy = SizingPolicy::default();
        let exact = policy.minimum_free();
        assert_eq!(plan_sizes(&snapshot(exact), &policy).unwrap().csi, policy.csi_floor);
        assert!(plan_sizes(&snapshot(exact - 1), &policy).is_err());
        assert!(plan_sizes(&snapshot(0), &policy).is_err());
    }

    #[test]
    fn mapper_path_doubles_dashes() {
        let layout = VolumeLayout {
            volume_group: "pi-vg".to_string(),
            ..VolumeLayout::default()
        };
        assert_eq!(layout.mapper_path("root-lv"), "/dev/mapper/pi--vg-root--lv");
        assert_eq!(VolumeLayout::default().root_mapper(), "/dev/mapper/rootvg-rootlv");
    }

    #[tokio::test]
    async fn creates_volumes_in_order_and_requeries() {
        let free = 64 * GIB;
        let runner = FakeRunner::new()
            .respond("vgs", &vgs(free))
            .respond("vgs", &vgs(free - 10 * GIB))
            .respond("vgs", &vgs(free - 20 * GIB));
        let layout = VolumeLayout::default();
        let plan = LogicalVolumeSizing {
            root: 10 * GIB,
            csi: 10 * GIB,
            container_runtime: 30 * GIB,
        };
        VolumeGroupSizer::new(&runner, &layout)
            .create_logical_volumes(&plan)
            .await
            .unwrap();

        let lvcreates: Vec<String> = runner
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("lvcreate"))
            .collect();
        assert_eq!(
            lvcreates,
            vec![
                "lvcreate --size 10737418240B rootvg -n rootlv --wipesignatures y",
                "lvcreate --size 10737418240B rootvg -n csilv --wipesignatures y",
                "lvcreate --size 32212254720B rootvg -n containerdlv --wipesignatures y",
            ]
        );
        assert_eq!(runner.calls().iter().filter(|c| c.starts_with("vgs")).count(), 3);
    }

    #[tokio::test]
    async fn stops_when_a_volume_no_longer_fits() {
        let runner = FakeRunner::new()
            .respond("vgs", &vgs(20 * GIB))
            .respond("vgs", &vgs(GIB));
        let layout = VolumeLayout::default();
        let plan = LogicalVolumeSizing {
            root: 10 * GIB,
            csi: 5 * GIB,
            container_runtime: 0,
        };
        let err = VolumeGroupSizer::new(&runner, &layout)
            .create_logical_volumes(&plan)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::InsufficientCapacity { .. })
        ));
        assert!(runner.position("lvcreate --size 5368709120B").is_none());
    }

    #[tokio::test]
    async fn filesystems_use_labels_and_mapper_nodes() {
        let runner = FakeRunner::new();
        let layout = VolumeLayout::default();
        let plan = LogicalVolumeSizing {
            root: 10 * GIB,
            csi: 5 * GIB,
            container_runtime: 0,
        };
        VolumeGroupSizer::new(&runner, &layout)
            .create_filesystems("/dev/sdb1", &plan)
            .await
            .unwrap();
        assert_eq!(
            runner.calls(),
            vec![
                "mkfs.vfat -F 32 -n system-boot /dev/sdb1",
                "mkfs.ext4 -L writable /dev/mapper/rootvg-rootlv",
                "mkfs.ext4 -L csi /dev/mapper/rootvg-csilv",
            ]
        );
    }

    #[tokio::test]
    async fn volume_group_creation_sequence() {
        let runner = FakeRunner::new().respond("vgs", &vgs(31_394_365_440));
        let layout = VolumeLayout::default();
        let sizer = VolumeGroupSizer::new(&runner, &layout);
        sizer.create_volume_group("/dev/sdb2").await.unwrap();
        let snap = sizer.snapshot().await.unwrap();
        assert_eq!(snap.free, 31_394_365_440);
        assert_eq!(
            runner.calls(),
            vec![
                "pvcreate /dev/sdb2",
                "vgcreate rootvg /dev/sdb2",
                "vgs rootvg --reportformat json --units B",
            ]
        );
    }
}
