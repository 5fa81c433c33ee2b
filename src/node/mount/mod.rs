//! Mount Module
//!
//! Stage/publish transitions for volumes on this node and the OS capabilities
//! they are built on.

pub mod linux;
pub mod orchestrator;

pub use linux::*;
pub use orchestrator::*;

use crate::domain::ports::{DeviceScannerRef, ExecRef, FormatterRef, MountTableRef, MounterRef};
use crate::node::discovery::{LinuxDeviceScanner, ScanConfig};
use std::sync::Arc;

/// Handle to every local OS capability the node needs
///
/// Built once by the composition root and shared read-only.
#[derive(Clone)]
pub struct MountProvider {
    pub mount_table: MountTableRef,
    pub mounter: MounterRef,
    pub formatter: FormatterRef,
    pub scanner: DeviceScannerRef,
}

impl MountProvider {
    /// Provider backed by host syscalls and utilities
    pub fn linux(scan: &ScanConfig) -> Self {
        let exec: ExecRef = Arc::new(CommandExec);
        Self {
            mount_table: Arc::new(LinuxMountTable),
            mounter: Arc::new(SyscallMounter),
            formatter: Arc::new(BlkidFormatter::new(exec.clone())),
            scanner: Arc::new(LinuxDeviceScanner::new(scan.scsi_host_dir.clone(), exec)),
        }
    }
}
