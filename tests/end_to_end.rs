//! End-to-end volume lifecycle against the in-memory registry and a fake host

use assert_matches::assert_matches;
use async_trait::async_trait;
use cinder_csi_node::domain::ports::{DeviceMetadata, InstanceMetadataDocument};
use cinder_csi_node::{
    CinderDriver, CreateVolumeRequest, DeviceScanner, DiskFormat, DriverConfig, Error,
    ErrorKind, Formatter, InMemoryRegistry, InstanceMetadata, MountProvider, MountTable,
    Mounter, NodeConfig, PublishRequest, ResolverConfig, Result, StageRequest,
    VolumeCapability, VolumeStatus,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const INSTANCE: &str = "5f1c2a9e-instance";

// =============================================================================
// Fakes
// =============================================================================

/// Host whose devices are plain files and whose mount table is a set
#[derive(Default)]
struct FakeHost {
    mounts: Mutex<HashSet<PathBuf>>,
    filesystems: Mutex<HashMap<String, String>>,
    mount_log: Mutex<Vec<(String, PathBuf, String, Vec<String>)>>,
    unmounts: Mutex<Vec<PathBuf>>,
}

#[async_trait]
impl MountTable for FakeHost {
    async fn is_mount_point(&self, path: &Path) -> Result<bool> {
        tokio::fs::metadata(path).await?;
        Ok(self.mounts.lock().contains(path))
    }
}

#[async_trait]
impl Mounter for FakeHost {
    async fn mount(
        &self,
        source: &str,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<()> {
        self.mount_log.lock().push((
            source.to_string(),
            target.to_path_buf(),
            fs_type.to_string(),
            options.to_vec(),
        ));
        self.mounts.lock().insert(target.to_path_buf());
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<()> {
        self.unmounts.lock().push(target.to_path_buf());
        self.mounts.lock().remove(target);
        Ok(())
    }
}

#[async_trait]
impl Formatter for FakeHost {
    async fn disk_format(&self, device: &str) -> Result<DiskFormat> {
        Ok(match self.filesystems.lock().get(device) {
            Some(fs) => DiskFormat::Filesystem(fs.clone()),
            None => DiskFormat::Unformatted,
        })
    }

    async fn format(&self, device: &str, fs_type: &str) -> Result<()> {
        self.filesystems
            .lock()
            .insert(device.to_string(), fs_type.to_string());
        Ok(())
    }
}

#[async_trait]
impl DeviceScanner for FakeHost {
    async fn exists(&self, device: &str) -> bool {
        Path::new(device).exists()
    }

    async fn rescan(&self) -> Result<()> {
        Ok(())
    }
}

/// Metadata service with a mutable device list
#[derive(Default)]
struct FakeMetadata {
    devices: Mutex<Vec<DeviceMetadata>>,
}

#[async_trait]
impl InstanceMetadata for FakeMetadata {
    async fn fetch(&self) -> Result<InstanceMetadataDocument> {
        Ok(InstanceMetadataDocument {
            uuid: INSTANCE.to_string(),
            availability_zone: "nova".to_string(),
            devices: self.devices.lock().clone(),
        })
    }
}

struct Harness {
    tmp: TempDir,
    host: Arc<FakeHost>,
    metadata: Arc<FakeMetadata>,
    driver: Arc<CinderDriver>,
}

impl Harness {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        for dir in ["by-id", "by-path", "kubelet"] {
            std::fs::create_dir(tmp.path().join(dir)).unwrap();
        }
        std::fs::write(tmp.path().join("instance-id"), format!("{}\n", INSTANCE)).unwrap();

        let host = Arc::new(FakeHost::default());
        let metadata = Arc::new(FakeMetadata::default());
        let provider = MountProvider {
            mount_table: host.clone(),
            mounter: host.clone(),
            formatter: host.clone(),
            scanner: host.clone(),
        };
        let config = DriverConfig {
            resolver: ResolverConfig {
                by_id_dir: tmp.path().join("by-id"),
                by_path_dir: tmp.path().join("by-path"),
            },
            node: NodeConfig {
                instance_id_file: tmp.path().join("instance-id"),
            },
            ..Default::default()
        };
        let driver = CinderDriver::new(
            config,
            Arc::new(InMemoryRegistry::new()),
            metadata.clone(),
            provider,
        )
        .unwrap();

        Self {
            tmp,
            host,
            metadata,
            driver,
        }
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.tmp.path().join(rel)
    }

    /// What udev would create for a virtio-blk disk carrying the volume serial
    fn plug_virtio(&self, volume_id: &str) -> PathBuf {
        let serial: String = volume_id.chars().take(20).collect();
        let path = self.path("by-id").join(format!("virtio-{}", serial));
        std::fs::write(&path, "").unwrap();
        path
    }
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_full_volume_lifecycle() {
    let h = Harness::new();
    let cancel = CancellationToken::new();
    let node = h.driver.node_info().await.unwrap();
    assert_eq!(node.node_id, INSTANCE);

    // create
    let volume = h
        .driver
        .create_volume(&CreateVolumeRequest {
            name: "pvc-data".into(),
            size_gib: 10,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(volume.status, VolumeStatus::Available);
    assert_eq!(h.driver.list_volumes(Some("pvc-data")).await.unwrap().len(), 1);

    // attach + wait
    let device_id = h.driver.attach_volume(&node.node_id, &volume.id).await.unwrap();
    assert_eq!(device_id, volume.id);
    h.driver
        .wait_disk_attached(&node.node_id, &volume.id, &cancel)
        .await
        .unwrap();
    assert_eq!(
        h.driver
            .get_attachment_disk_path(&node.node_id, &volume.id)
            .await
            .unwrap(),
        "/dev/vdb"
    );

    // resolve
    let plugged = h.plug_virtio(&volume.id);
    let device = h.driver.get_device_path(&volume.id, &cancel).await.unwrap();
    assert_eq!(PathBuf::from(&device), plugged);

    // stage
    let staging = h.path("kubelet/staging");
    let mut publish_context = BTreeMap::new();
    publish_context.insert("DevicePath".to_string(), device.clone());
    h.driver
        .node_stage(
            &StageRequest {
                volume_id: volume.id.clone(),
                staging_path: staging.to_string_lossy().into_owned(),
                capability: VolumeCapability::Mount {
                    fs_type: "xfs".into(),
                    mount_flags: vec!["noatime".into()],
                },
                publish_context,
            },
            &cancel,
        )
        .await
        .unwrap();
    assert_eq!(
        h.host.filesystems.lock().get(&device).map(String::as_str),
        Some("xfs")
    );

    // publish
    let target = h.path("kubelet/pods/p1/volume");
    h.driver
        .node_publish(&PublishRequest {
            staging_path: staging.to_string_lossy().into_owned(),
            target_path: target.to_string_lossy().into_owned(),
            read_only: false,
        })
        .await
        .unwrap();

    {
        let log = h.host.mount_log.lock();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].0, device);
        assert_eq!(log[0].3, vec!["noatime".to_string()]);
        assert_eq!(log[1].1, target);
        assert_eq!(log[1].3, vec!["bind".to_string(), "rw".to_string()]);
    }

    // unpublish + unstage
    h.driver
        .node_unpublish(&target.to_string_lossy())
        .await
        .unwrap();
    h.driver
        .node_unstage(&staging.to_string_lossy())
        .await
        .unwrap();
    assert_eq!(h.host.unmounts.lock().as_slice(), [target.clone(), staging.clone()]);

    let again = h
        .driver
        .node_unstage(&staging.to_string_lossy())
        .await
        .unwrap_err();
    assert_eq!(again.kind(), ErrorKind::NotFound);
    assert_eq!(h.host.unmounts.lock().len(), 2);

    // detach + wait
    h.driver
        .detach_volume(&node.node_id, &volume.id)
        .await
        .unwrap();
    h.driver
        .wait_disk_detached(&node.node_id, &volume.id, &cancel)
        .await
        .unwrap();

    // delete
    h.driver.delete_volume(&volume.id).await.unwrap();
    assert_matches!(
        h.driver.get_volume(&volume.id).await,
        Err(Error::VolumeNotFound { .. })
    );
}

#[tokio::test(start_paused = true)]
async fn test_device_resolved_through_instance_metadata() {
    let h = Harness::new();
    let cancel = CancellationToken::new();
    let volume_id = "8a1d47f2-93c4-4e0b-b6f1-2c5d9e7a0b13";

    h.metadata.devices.lock().push(DeviceMetadata {
        device_type: "disk".into(),
        bus: "scsi".into(),
        address: "0:0:0:1".into(),
        serial: volume_id.into(),
    });
    let by_path = h.path("by-path").join("pci-0000:00:05.0-scsi-0:0:0:1");
    std::fs::write(&by_path, "").unwrap();

    let device = h.driver.get_device_path(volume_id, &cancel).await.unwrap();
    assert_eq!(PathBuf::from(device), by_path);
}

#[tokio::test(start_paused = true)]
async fn test_ambiguous_metadata_match_times_out() {
    let h = Harness::new();
    let cancel = CancellationToken::new();
    let volume_id = "8a1d47f2-93c4-4e0b-b6f1-2c5d9e7a0b13";

    h.metadata.devices.lock().push(DeviceMetadata {
        device_type: "disk".into(),
        bus: "scsi".into(),
        address: "0:0:0:1".into(),
        serial: volume_id.into(),
    });
    for controller in ["pci-0000:00:05.0", "pci-0000:00:06.0"] {
        let name = format!("{}-scsi-0:0:0:1", controller);
        std::fs::write(h.path("by-path").join(name), "").unwrap();
    }

    let err = h
        .driver
        .get_device_path(volume_id, &cancel)
        .await
        .unwrap_err();
    assert_matches!(err, Error::Timeout { attempts: 10, .. });
}

#[tokio::test]
async fn test_attach_to_second_instance_is_conflict() {
    let h = Harness::new();
    let volume = h
        .driver
        .create_volume(&CreateVolumeRequest {
            name: "shared".into(),
            size_gib: 1,
            ..Default::default()
        })
        .await
        .unwrap();

    h.driver.attach_volume(INSTANCE, &volume.id).await.unwrap();
    let err = h
        .driver
        .attach_volume("other-instance", &volume.id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let err = h.driver.delete_volume(&volume.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(
        h.driver.get_volume(&volume.id).await.unwrap().status,
        VolumeStatus::InUse
    );
}
