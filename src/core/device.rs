use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// OS-level identity of one physical storage device, independent of how many
/// volumes it exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct DiskId(pub u64);

impl fmt::Display for DiskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "disk {}", self.0)
    }
}

/// One enumerated logical volume, e.g. `/dev/sdb1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalVolume {
    pub name: String,
    pub label: Option<String>,
    /// Adapter-specific handle used to re-query the volume later.
    pub handle: PathBuf,
}

/// The physical device a volume lives on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskRef {
    pub id: DiskId,
    /// Whole-device node handed to the cloning tool.
    pub node: PathBuf,
    pub handle: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhysicalDevice {
    pub id: DiskId,
    /// All volume names on this device; the first one seen is the primary.
    pub volumes: Vec<String>,
    pub label: String,
    pub capacity: u64,
    pub target: PathBuf,
    pub removable: bool,
    #[serde(skip)]
    primary_volume: LogicalVolume,
}

impl PhysicalDevice {
    pub fn primary_volume(&self) -> &LogicalVolume {
        &self.primary_volume
    }

    /// Human-readable summary, e.g. `[disk 2049] /dev/sdb1, /dev/sdb2  KINGSTON  (7.5 GB)`.
    pub fn display(&self) -> String {
        format!(
            "[{}]  {}  {}  ({})",
            self.id,
            self.volumes.join(", "),
            self.label,
            format_size(self.capacity)
        )
    }
}

pub fn format_size(bytes: u64) -> String {
    if bytes == 0 {
        return "?".to_string();
    }
    for (unit, thresh) in [("GB", 1u64 << 30), ("MB", 1 << 20), ("KB", 1 << 10)] {
        if bytes >= thresh {
            return format!("{:.1} {}", bytes as f64 / thresh as f64, unit);
        }
    }
    format!("{} B", bytes)
}

/// OS boundary for removable storage discovery.
///
/// Every method may fail transiently while disks are busy; callers treat
/// errors as "try again next tick".
pub trait VolumeSource: Send + Sync {
    fn list_volumes(&self) -> anyhow::Result<Vec<LogicalVolume>>;

    /// Re-queries the OS; the answer can change between calls.
    fn is_removable(&self, volume: &LogicalVolume) -> bool;

    fn resolve(&self, volume: &LogicalVolume) -> anyhow::Result<DiskRef>;

    /// Raw capacity of the whole device in bytes.
    fn capacity(&self, disk: &DiskRef) -> anyhow::Result<u64>;
}

/// Build one snapshot of removable physical devices, ordered by identity.
pub fn enumerate(source: &dyn VolumeSource) -> anyhow::Result<Vec<PhysicalDevice>> {
    let mut devices: BTreeMap<DiskId, PhysicalDevice> = BTreeMap::new();

    for volume in source.list_volumes()? {
        if !source.is_removable(&volume) {
            continue;
        }

        let disk = match source.resolve(&volume) {
            Ok(disk) => disk,
            Err(e) => {
                debug!(volume = %volume.name, error = %e, "Could not resolve physical device, skipping");
                continue;
            }
        };

        if let Some(existing) = devices.get_mut(&disk.id) {
            existing.volumes.push(volume.name.clone());
            continue;
        }

        let capacity = source.capacity(&disk).unwrap_or_else(|e| {
            debug!(disk = %disk.id, error = %e, "Capacity query failed");
            0
        });

        devices.insert(
            disk.id,
            PhysicalDevice {
                id: disk.id,
                volumes: vec![volume.name.clone()],
                label: volume
                    .label
                    .clone()
                    .filter(|l| !l.is_empty())
                    .unwrap_or_else(|| "Removable".to_string()),
                capacity,
                target: disk.node.clone(),
                removable: true,
                primary_volume: volume,
            },
        );
    }

    Ok(devices.into_values().collect())
}

/// Tracks the identity set between polls and reports only set changes.
#[derive(Debug, Default)]
pub struct DeviceEnumerator {
    last: Option<BTreeSet<DiskId>>,
}

impl DeviceEnumerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a fresh snapshot if the set of identities changed since the
    /// previous successful poll. The first successful poll always reports.
    pub fn poll(&mut self, source: &dyn VolumeSource) -> Option<Vec<PhysicalDevice>> {
        let snapshot = match enumerate(source) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                debug!(error = %e, "Device enumeration failed, retrying next tick");
                return None;
            }
        };

        let ids: BTreeSet<DiskId> = snapshot.iter().map(|d| d.id).collect();
        if self.last.as_ref() == Some(&ids) {
            return None;
        }
        self.last = Some(ids);
        Some(snapshot)
    }
}

/// Poll `source` every `interval`, sending each changed snapshot to `tx`
/// until `cancel` fires or the receiver is dropped.
pub fn spawn_monitor(
    source: Arc<dyn VolumeSource>,
    interval: Duration,
    tx: mpsc::Sender<Vec<PhysicalDevice>>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut enumerator = DeviceEnumerator::new();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let source = source.clone();
            let polled = tokio::task::spawn_blocking(move || {
                let changed = enumerator.poll(source.as_ref());
                (enumerator, changed)
            })
            .await;

            let changed = match polled {
                Ok((returned, changed)) => {
                    enumerator = returned;
                    changed
                }
                Err(e) => {
                    debug!(error = %e, "Enumeration task panicked");
                    enumerator = DeviceEnumerator::new();
                    None
                }
            };

            if let Some(snapshot) = changed {
                info!(count = snapshot.len(), "Removable device set changed");
                if tx.send(snapshot).await.is_err() {
                    break;
                }
            }
        }
    })
}
