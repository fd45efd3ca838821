use std::ffi::OsStr;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use tracing::debug;
use udev::{Device, Enumerator};

use crate::core::device::{DiskId, DiskRef, LogicalVolume, VolumeSource};

/// Size of the unit the kernel reports in the `size` sysfs attribute.
const SYSFS_SECTOR_SIZE: u64 = 512;

/// Removable storage discovery through udev.
///
/// Volumes are partitions, plus whole disks that carry a filesystem directly
/// (superfloppy layout). A volume's physical identity is the `dev_t` of its
/// whole-disk parent.
#[derive(Debug, Default)]
pub struct UdevVolumeSource;

impl UdevVolumeSource {
    pub fn new() -> Self {
        Self
    }
}

fn devtype_is(device: &Device, devtype: &str) -> bool {
    device.devtype() == Some(OsStr::new(devtype))
}

fn text(value: Option<&OsStr>) -> Option<String> {
    value.map(|v| v.to_string_lossy().trim().to_string())
}

/// The whole-disk device for a partition, or the device itself if it is a disk.
fn whole_disk(device: &Device) -> Result<Device> {
    if devtype_is(device, "disk") {
        return Ok(device.clone());
    }
    device
        .parent_with_subsystem_devtype("block", "disk")?
        .ok_or_else(|| anyhow!("{} has no parent disk", device.syspath().display()))
}

fn disk_is_removable(disk: &Device) -> bool {
    let removable_attr = text(disk.attribute_value("removable")).as_deref() == Some("1");
    let usb_bus = text(disk.property_value("ID_BUS")).as_deref() == Some("usb");
    removable_attr || usb_bus
}

impl VolumeSource for UdevVolumeSource {
    fn list_volumes(&self) -> Result<Vec<LogicalVolume>> {
        let mut enumerator = Enumerator::new().context("Failed to create udev enumerator")?;
        enumerator.match_subsystem("block")?;

        let mut volumes = Vec::new();
        for device in enumerator.scan_devices()? {
            let is_partition = devtype_is(&device, "partition");
            let is_bare_fs = devtype_is(&device, "disk") && device.property_value("ID_FS_TYPE").is_some();
            if !is_partition && !is_bare_fs {
                continue;
            }

            let Some(node) = device.devnode() else {
                continue;
            };

            volumes.push(LogicalVolume {
                name: node.display().to_string(),
                label: text(device.property_value("ID_FS_LABEL")),
                handle: device.syspath().to_path_buf(),
            });
        }

        Ok(volumes)
    }

    fn is_removable(&self, volume: &LogicalVolume) -> bool {
        let device = match Device::from_syspath(&volume.handle) {
            Ok(device) => device,
            Err(e) => {
                debug!(volume = %volume.name, error = %e, "Volume no longer present");
                return false;
            }
        };
        whole_disk(&device).map(|d| disk_is_removable(&d)).unwrap_or(false)
    }

    fn resolve(&self, volume: &LogicalVolume) -> Result<DiskRef> {
        let device = Device::from_syspath(&volume.handle)
            .with_context(|| format!("Failed to open {}", volume.name))?;
        let disk = whole_disk(&device)?;

        let devnum = disk
            .devnum()
            .ok_or_else(|| anyhow!("{} has no device number", disk.syspath().display()))?;
        let node = disk
            .devnode()
            .map(PathBuf::from)
            .ok_or_else(|| anyhow!("{} has no device node", disk.syspath().display()))?;

        Ok(DiskRef {
            id: DiskId(devnum as u64),
            node,
            handle: disk.syspath().to_path_buf(),
        })
    }

    fn capacity(&self, disk: &DiskRef) -> Result<u64> {
        let device = Device::from_syspath(&disk.handle)?;
        let sectors: u64 = text(device.attribute_value("size"))
            .ok_or_else(|| anyhow!("{} has no size attribute", disk.node.display()))?
            .parse()
            .with_context(|| format!("Unparseable size for {}", disk.node.display()))?;
        Ok(sectors * SYSFS_SECTOR_SIZE)
    }
}
