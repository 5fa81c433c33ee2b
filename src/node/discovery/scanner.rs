//! Block Device Scanner
//!
//! Waits for the device node of a freshly attached volume to appear,
//! re-triggering a SCSI bus rescan and udev on every tick.

use crate::domain::ports::{DeviceScanner, ExecRef};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

// =============================================================================
// Scanner Configuration
// =============================================================================

/// Configuration for device presence scanning
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// SCSI host class directory whose `scan` files trigger a rescan
    pub scsi_host_dir: PathBuf,
    /// Delay between presence checks
    pub probe_interval: Duration,
    /// Give up after this long
    pub probe_timeout: Duration,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            scsi_host_dir: PathBuf::from("/sys/class/scsi_host"),
            probe_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(60),
        }
    }
}

// =============================================================================
// Linux Device Scanner
// =============================================================================

/// Rescans the SCSI bus through sysfs and replays udev events
pub struct LinuxDeviceScanner {
    scsi_host_dir: PathBuf,
    exec: ExecRef,
}

impl LinuxDeviceScanner {
    pub fn new(scsi_host_dir: impl Into<PathBuf>, exec: ExecRef) -> Self {
        Self {
            scsi_host_dir: scsi_host_dir.into(),
            exec,
        }
    }

    /// Write the wildcard scan request to every SCSI host
    ///
    /// Each write runs a synchronous bus scan in the kernel.
    async fn rescan_scsi_hosts(&self) {
        let Ok(mut hosts) = tokio::fs::read_dir(&self.scsi_host_dir).await else {
            return;
        };

        while let Ok(Some(host)) = hosts.next_entry().await {
            let scan = host.path().join("scan");
            if let Err(e) = tokio::fs::write(&scan, b"- - -").await {
                trace!("Failed to write {}: {}", scan.display(), e);
            }
        }
    }
}

#[async_trait]
impl DeviceScanner for LinuxDeviceScanner {
    async fn exists(&self, device: &str) -> bool {
        tokio::fs::try_exists(device).await.unwrap_or(false)
    }

    async fn rescan(&self) -> Result<()> {
        self.rescan_scsi_hosts().await;

        let output = self.exec.run("udevadm", &["trigger".to_string()]).await?;
        if !output.success() {
            return Err(Error::CommandFailed {
                command: "udevadm trigger".into(),
                reason: output.stderr.trim().to_string(),
            });
        }
        Ok(())
    }
}

// =============================================================================
// Presence Wait
// =============================================================================

/// Wait until `device` exists, rescanning on every tick
pub async fn wait_for_device(
    scanner: &dyn DeviceScanner,
    device: &str,
    config: &ScanConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    let deadline = Instant::now() + config.probe_timeout;
    let mut ticker = tokio::time::interval(config.probe_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(Error::Cancelled {
                    operation: format!("scan for {}", device),
                });
            }
            _ = tokio::time::sleep_until(deadline) => {
                return Err(Error::DeviceScanTimeout {
                    device: device.to_string(),
                    timeout: config.probe_timeout,
                });
            }
            found = check_device(scanner, device, &mut ticker) => {
                if found {
                    return Ok(());
                }
                debug!("Could not find attached Cinder disk {}", device);
            }
        }
    }
}

/// Wait for the next tick, rescan, and check for `device`
async fn check_device(
    scanner: &dyn DeviceScanner,
    device: &str,
    ticker: &mut tokio::time::Interval,
) -> bool {
    ticker.tick().await;
    debug!("Checking Cinder disk {} is attached", device);
    if let Err(e) = scanner.rescan().await {
        warn!("Device rescan failed: {}", e);
    }
    scanner.exists(device).await
}
