//! Linux OS Access
//!
//! Concrete implementations of the narrow OS capabilities: running external
//! utilities, querying mount points, mounting through syscalls, and
//! probing/creating filesystems. Each piece can be swapped independently in tests.

use crate::domain::ports::{
    CommandOutput, DiskFormat, Exec, ExecRef, Formatter, MountTable, Mounter,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use nix::mount::{umount2, MntFlags, MsFlags};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info, trace};

/// blkid exit status when no requested token was found on the device
const BLKID_NOTHING_FOUND: i32 = 2;

// =============================================================================
// Exec
// =============================================================================

/// Runs commands on the host with tokio
#[derive(Debug, Default, Clone)]
pub struct CommandExec;

#[async_trait]
impl Exec for CommandExec {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        trace!("Running {} {:?}", program, args);
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::CommandFailed {
                command: program.to_string(),
                reason: format!("failed to execute: {}", e),
            })?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

// =============================================================================
// Mount Table
// =============================================================================

/// Detects mount points by comparing the device of a path with its parent
///
/// Bind mounts of a directory onto the same filesystem are not detected,
/// which is acceptable for staging and publish targets.
#[derive(Debug, Default, Clone)]
pub struct LinuxMountTable;

#[async_trait]
impl MountTable for LinuxMountTable {
    async fn is_mount_point(&self, path: &Path) -> Result<bool> {
        let meta = tokio::fs::metadata(path).await?;
        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            // The root is always a mount point.
            _ => return Ok(true),
        };
        let parent_meta = tokio::fs::metadata(parent).await?;
        Ok(meta.dev() != parent_meta.dev() || meta.ino() == parent_meta.ino())
    }
}

// =============================================================================
// Mounter
// =============================================================================

/// One `mount(2)` call
#[derive(Debug, Clone, PartialEq)]
pub struct MountCall {
    pub source: Option<String>,
    pub target: PathBuf,
    pub fs_type: Option<String>,
    pub flags: MsFlags,
    pub data: Option<String>,
}

/// Split textual mount options into kernel flags and filesystem data
pub fn parse_mount_options(options: &[String]) -> (MsFlags, Option<String>) {
    let mut flags = MsFlags::empty();
    let mut data = Vec::new();

    for option in options {
        match option.as_str() {
            "" | "defaults" | "rw" => {}
            "ro" => flags |= MsFlags::MS_RDONLY,
            "bind" => flags |= MsFlags::MS_BIND,
            "remount" => flags |= MsFlags::MS_REMOUNT,
            "noatime" => flags |= MsFlags::MS_NOATIME,
            "nodiratime" => flags |= MsFlags::MS_NODIRATIME,
            "relatime" => flags |= MsFlags::MS_RELATIME,
            "nosuid" => flags |= MsFlags::MS_NOSUID,
            "nodev" => flags |= MsFlags::MS_NODEV,
            "noexec" => flags |= MsFlags::MS_NOEXEC,
            "sync" => flags |= MsFlags::MS_SYNCHRONOUS,
            "dirsync" => flags |= MsFlags::MS_DIRSYNC,
            other => data.push(other),
        }
    }

    let data = (!data.is_empty()).then(|| data.join(","));
    (flags, data)
}

/// Syscalls needed to mount `source` on `target` with `options`
///
/// The kernel ignores most flags on the initial bind, so a bind carrying
/// anything beyond `bind` itself is followed by a remount.
pub fn mount_plan(
    source: &str,
    target: &Path,
    fs_type: &str,
    options: &[String],
) -> Vec<MountCall> {
    let (flags, data) = parse_mount_options(options);
    let fs_type = (!fs_type.is_empty()).then(|| fs_type.to_string());

    if !flags.contains(MsFlags::MS_BIND) {
        return vec![MountCall {
            source: Some(source.to_string()),
            target: target.to_path_buf(),
            fs_type,
            flags,
            data,
        }];
    }

    let mut plan = vec![MountCall {
        source: Some(source.to_string()),
        target: target.to_path_buf(),
        fs_type: None,
        flags: MsFlags::MS_BIND,
        data: None,
    }];
    let extra = flags - MsFlags::MS_BIND;
    if !extra.is_empty() || data.is_some() {
        plan.push(MountCall {
            source: None,
            target: target.to_path_buf(),
            fs_type: None,
            flags: MsFlags::MS_BIND | MsFlags::MS_REMOUNT | extra,
            data,
        });
    }
    plan
}

/// Mounts with the `mount(2)` and `umount2(2)` syscalls
#[derive(Debug, Default, Clone)]
pub struct SyscallMounter;

impl SyscallMounter {
    async fn apply(&self, call: MountCall) -> Result<()> {
        trace!("mount({:?})", call);
        let target = call.target.display().to_string();
        tokio::task::spawn_blocking(move || {
            nix::mount::mount(
                call.source.as_deref(),
                &call.target,
                call.fs_type.as_deref(),
                call.flags,
                call.data.as_deref(),
            )
        })
        .await
        .map_err(|e| Error::Internal(format!("mount task failed: {}", e)))?
        .map_err(|e| Error::MountFailed {
            target,
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl Mounter for SyscallMounter {
    async fn mount(
        &self,
        source: &str,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<()> {
        debug!("Mounting {} on {} ({:?})", source, target.display(), options);
        for call in mount_plan(source, target, fs_type, options) {
            self.apply(call).await?;
        }
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<()> {
        debug!("Unmounting {}", target.display());
        let path = target.to_path_buf();
        tokio::task::spawn_blocking(move || umount2(&path, MntFlags::empty()))
            .await
            .map_err(|e| Error::Internal(format!("umount task failed: {}", e)))?
            .map_err(|e| Error::MountFailed {
                target: target.display().to_string(),
                reason: e.to_string(),
            })
    }
}

// =============================================================================
// Formatter
// =============================================================================

/// Probes with `blkid` and formats with `mkfs.<fs>`
pub struct BlkidFormatter {
    exec: ExecRef,
}

impl BlkidFormatter {
    pub fn new(exec: ExecRef) -> Self {
        Self { exec }
    }
}

/// Parse `blkid -o export` output into a disk format
fn parse_blkid_export(output: &str) -> DiskFormat {
    let mut fs_type = String::new();
    let mut pt_type = String::new();

    let mut lines: Vec<&str> = output.lines().collect();
    if lines.len() == 1 {
        // Busybox prints everything on one line.
        lines = output.split(' ').collect();
    }

    for line in lines {
        let Some((key, value)) = line.trim().split_once('=') else {
            continue;
        };
        match key {
            "TYPE" => fs_type = value.replace('"', ""),
            "PTTYPE" => pt_type = value.replace('"', ""),
            _ => {}
        }
    }

    if !pt_type.is_empty() {
        DiskFormat::Partitioned(pt_type)
    } else if !fs_type.is_empty() {
        DiskFormat::Filesystem(fs_type)
    } else {
        DiskFormat::Unformatted
    }
}

/// `mkfs` arguments for a filesystem type
fn mkfs_args(device: &str, fs_type: &str) -> Vec<String> {
    let mut args: Vec<String> = match fs_type {
        "ext2" | "ext3" | "ext4" => vec!["-F".into(), "-m0".into()],
        "xfs" | "btrfs" => vec!["-f".into()],
        _ => Vec::new(),
    };
    args.push(device.to_string());
    args
}

#[async_trait]
impl Formatter for BlkidFormatter {
    async fn disk_format(&self, device: &str) -> Result<DiskFormat> {
        let args: Vec<String> = ["-p", "-s", "TYPE", "-s", "PTTYPE", "-o", "export", device]
            .iter()
            .map(|s| s.to_string())
            .collect();
        debug!("Probing disk {} with blkid {:?}", device, args);

        let output = self.exec.run("blkid", &args).await?;
        match output.code {
            Some(0) => {}
            Some(BLKID_NOTHING_FOUND) => return Ok(DiskFormat::Unformatted),
            _ => {
                return Err(Error::CommandFailed {
                    command: format!("blkid {}", device),
                    reason: format!("exit {:?}: {}", output.code, output.stderr.trim()),
                });
            }
        }

        let format = parse_blkid_export(output.stdout.trim());
        if let DiskFormat::Partitioned(pt) = &format {
            debug!("Disk {} has partition table type {}", device, pt);
        }
        Ok(format)
    }

    async fn format(&self, device: &str, fs_type: &str) -> Result<()> {
        let program = format!("mkfs.{}", fs_type);
        info!("Formatting {} as {}", device, fs_type);

        let output = self.exec.run(&program, &mkfs_args(device, fs_type)).await?;
        if !output.success() {
            return Err(Error::CommandFailed {
                command: program,
                reason: output.stderr.trim().to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use tempfile::TempDir;

    /// Replays canned outputs and records invocations
    struct ScriptedExec {
        outputs: Mutex<VecDeque<CommandOutput>>,
        calls: Mutex<Vec<Vec<String>>>,
    }

    impl ScriptedExec {
        fn new(outputs: Vec<CommandOutput>) -> Arc<Self> {
            Arc::new(Self {
                outputs: Mutex::new(outputs.into()),
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Exec for ScriptedExec {
        async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
            let mut call = vec![program.to_string()];
            call.extend(args.iter().cloned());
            self.calls.lock().push(call);
            Ok(self.outputs.lock().pop_front().unwrap_or(CommandOutput {
                code: Some(0),
                ..Default::default()
            }))
        }
    }

    fn exited(code: i32, stdout: &str) -> CommandOutput {
        CommandOutput {
            code: Some(code),
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    #[test]
    fn test_parse_blkid_export() {
        assert_eq!(
            parse_blkid_export("DEVNAME=/dev/vdb\nTYPE=ext4"),
            DiskFormat::Filesystem("ext4".into())
        );
        assert_eq!(
            parse_blkid_export("DEVNAME=/dev/vdb\nPTTYPE=gpt"),
            DiskFormat::Partitioned("gpt".into())
        );
        // Busybox single-line output with quotes
        assert_eq!(
            parse_blkid_export(r#"DEVNAME=/dev/vdb TYPE="xfs""#),
            DiskFormat::Filesystem("xfs".into())
        );
        assert_eq!(parse_blkid_export(""), DiskFormat::Unformatted);
    }

    #[tokio::test]
    async fn test_disk_format_unformatted_on_exit_2() {
        let exec = ScriptedExec::new(vec![exited(2, "")]);
        let formatter = BlkidFormatter::new(exec.clone());

        let format = formatter.disk_format("/dev/vdb").await.unwrap();
        assert_eq!(format, DiskFormat::Unformatted);
        assert_eq!(exec.calls.lock()[0][0], "blkid");
    }

    #[tokio::test]
    async fn test_disk_format_partition_table_is_sentinel() {
        let exec = ScriptedExec::new(vec![exited(0, "DEVNAME=/dev/vdb\nPTTYPE=dos\n")]);
        let formatter = BlkidFormatter::new(exec);

        let format = formatter.disk_format("/dev/vdb").await.unwrap();
        assert_eq!(format, DiskFormat::Partitioned("dos".into()));
    }

    #[tokio::test]
    async fn test_disk_format_other_failure_is_error() {
        let exec = ScriptedExec::new(vec![exited(4, "")]);
        let formatter = BlkidFormatter::new(exec);

        let err = formatter.disk_format("/dev/vdb").await.unwrap_err();
        assert_matches!(err, Error::CommandFailed { .. });
    }

    #[tokio::test]
    async fn test_format_ext4_arguments() {
        let exec = ScriptedExec::new(vec![]);
        let formatter = BlkidFormatter::new(exec.clone());

        formatter.format("/dev/vdb", "ext4").await.unwrap();
        assert_eq!(
            exec.calls.lock()[0],
            vec!["mkfs.ext4", "-F", "-m0", "/dev/vdb"]
        );
    }

    fn opts(options: &[&str]) -> Vec<String> {
        options.iter().map(|o| o.to_string()).collect()
    }

    #[test]
    fn test_parse_mount_options() {
        let (flags, data) = parse_mount_options(&opts(&["noatime", "ro", "discard", "nouuid"]));
        assert_eq!(flags, MsFlags::MS_NOATIME | MsFlags::MS_RDONLY);
        assert_eq!(data.as_deref(), Some("discard,nouuid"));

        let (flags, data) = parse_mount_options(&opts(&["defaults", "rw"]));
        assert!(flags.is_empty());
        assert_eq!(data, None);
    }

    #[test]
    fn test_filesystem_mount_is_single_call() {
        let plan = mount_plan("/dev/vdb", Path::new("/mnt/stage"), "ext4", &opts(&["noatime"]));
        assert_eq!(
            plan,
            vec![MountCall {
                source: Some("/dev/vdb".into()),
                target: PathBuf::from("/mnt/stage"),
                fs_type: Some("ext4".into()),
                flags: MsFlags::MS_NOATIME,
                data: None,
            }]
        );
    }

    #[test]
    fn test_read_only_bind_remounts() {
        let plan = mount_plan("/mnt/stage", Path::new("/mnt/pub"), "", &opts(&["bind", "ro"]));
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].source.as_deref(), Some("/mnt/stage"));
        assert_eq!(plan[0].flags, MsFlags::MS_BIND);
        assert_eq!(plan[1].source, None);
        assert_eq!(
            plan[1].flags,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY
        );
    }

    #[test]
    fn test_read_write_bind_is_single_call() {
        let plan = mount_plan("/mnt/stage", Path::new("/mnt/pub"), "", &opts(&["bind", "rw"]));
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].flags, MsFlags::MS_BIND);
        assert_eq!(plan[0].fs_type, None);
    }

    #[tokio::test]
    async fn test_unmount_of_plain_directory_fails() {
        let tmp = TempDir::new().unwrap();

        let err = SyscallMounter.unmount(tmp.path()).await.unwrap_err();
        assert_matches!(
            err,
            Error::MountFailed { target, .. } if target == tmp.path().display().to_string()
        );
    }

    #[tokio::test]
    async fn test_plain_directory_is_not_mount_point() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("stage");
        std::fs::create_dir(&dir).unwrap();

        assert!(!LinuxMountTable.is_mount_point(&dir).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_path_is_io_not_found() {
        let err = LinuxMountTable
            .is_mount_point(Path::new("/nonexistent/stage"))
            .await
            .unwrap_err();
        assert_matches!(err, Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound);
    }
}
