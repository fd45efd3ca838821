use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Result, anyhow};

use crate::core::device::{DiskId, DiskRef, LogicalVolume, VolumeSource};

#[derive(Debug, Clone)]
struct SimVolume {
    name: String,
    label: Option<String>,
    disk: u64,
    size_gb: u64,
    removable: bool,
    unresolvable: bool,
}

#[derive(Debug, Default)]
struct SimState {
    volumes: Vec<SimVolume>,
    fail_next_list: bool,
}

/// In-memory device table driven by a [`Simulator`] handle.
pub struct SimulatedVolumeSource {
    state: Arc<Mutex<SimState>>,
}

/// Controller used by tests and `--simulation` mode to plug and pull drives.
#[derive(Clone)]
pub struct Simulator {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedVolumeSource {
    pub fn new() -> (Self, Simulator) {
        let state = Arc::new(Mutex::new(SimState::default()));
        (
            Self {
                state: state.clone(),
            },
            Simulator { state },
        )
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        lock(&self.state)
    }
}

// A poisoned lock only means a test panicked mid-update; the table is still usable.
fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

impl Simulator {
    /// Insert a single-volume removable drive.
    pub fn add_device(&self, id: u64, size_gb: u64) {
        self.add_volume(&format!("sim{}p1", id), id, size_gb);
    }

    pub fn add_volume(&self, name: &str, disk: u64, size_gb: u64) {
        lock(&self.state).volumes.push(SimVolume {
            name: name.to_string(),
            label: Some(format!("SIM_{}", disk)),
            disk,
            size_gb,
            removable: true,
            unresolvable: false,
        });
    }

    pub fn remove_disk(&self, disk: u64) {
        lock(&self.state).volumes.retain(|v| v.disk != disk);
    }

    pub fn set_removable(&self, name: &str, removable: bool) {
        self.update(name, |v| v.removable = removable);
    }

    pub fn set_label(&self, name: &str, label: &str) {
        self.update(name, |v| v.label = Some(label.to_string()));
    }

    pub fn set_unresolvable(&self, name: &str, unresolvable: bool) {
        self.update(name, |v| v.unresolvable = unresolvable);
    }

    /// Make the next `list_volumes` call fail once.
    pub fn fail_next_list(&self) {
        lock(&self.state).fail_next_list = true;
    }

    fn update(&self, name: &str, f: impl Fn(&mut SimVolume)) {
        let mut state = lock(&self.state);
        for v in state.volumes.iter_mut().filter(|v| v.name == name) {
            f(v);
        }
    }
}

impl VolumeSource for SimulatedVolumeSource {
    fn list_volumes(&self) -> Result<Vec<LogicalVolume>> {
        let mut state = self.state();
        if std::mem::take(&mut state.fail_next_list) {
            return Err(anyhow!("simulated enumeration failure"));
        }
        Ok(state
            .volumes
            .iter()
            .map(|v| LogicalVolume {
                name: v.name.clone(),
                label: v.label.clone(),
                handle: PathBuf::from(&v.name),
            })
            .collect())
    }

    fn is_removable(&self, volume: &LogicalVolume) -> bool {
        self.state()
            .volumes
            .iter()
            .any(|v| v.name == volume.name && v.removable)
    }

    fn resolve(&self, volume: &LogicalVolume) -> Result<DiskRef> {
        let state = self.state();
        let v = state
            .volumes
            .iter()
            .find(|v| v.name == volume.name)
            .ok_or_else(|| anyhow!("volume {} is gone", volume.name))?;
        if v.unresolvable {
            return Err(anyhow!("cannot open {}", volume.name));
        }
        Ok(DiskRef {
            id: DiskId(v.disk),
            node: PathBuf::from(format!("/tmp/odm_sim_disk{}", v.disk)),
            handle: PathBuf::from(format!("disk{}", v.disk)),
        })
    }

    fn capacity(&self, disk: &DiskRef) -> Result<u64> {
        self.state()
            .volumes
            .iter()
            .find(|v| v.disk == disk.id.0)
            .map(|v| v.size_gb * 1024 * 1024 * 1024)
            .ok_or_else(|| anyhow!("{} is gone", disk.id))
    }
}
