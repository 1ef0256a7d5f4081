//! Block device naming and loop device lifecycle.

mod loopdev;
mod naming;

pub use loopdev::{grow_backing_file, parse_loop_listing, LoopDeviceEntry, LoopDeviceMapper};
pub use naming::{DeviceKind, DevicePath};
