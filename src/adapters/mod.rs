use std::sync::Arc;

use crate::core::device::VolumeSource;

#[cfg(target_os = "linux")]
mod linux;
mod simulated;

#[cfg(target_os = "linux")]
pub use linux::UdevVolumeSource;
pub use simulated::{SimulatedVolumeSource, Simulator};

/// Pick the device boundary for this run. The simulator handle is returned in
/// simulation mode so the operator console can plug and pull drives.
pub fn get_source(simulation: bool) -> (Arc<dyn VolumeSource>, Option<Simulator>) {
    if simulation {
        let (source, simulator) = SimulatedVolumeSource::new();
        return (Arc::new(source), Some(simulator));
    }

    #[cfg(target_os = "linux")]
    {
        (Arc::new(UdevVolumeSource::new()), None)
    }

    #[cfg(not(target_os = "linux"))]
    {
        tracing::warn!("No hardware adapter for this platform, falling back to simulation");
        let (source, simulator) = SimulatedVolumeSource::new();
        (Arc::new(source), Some(simulator))
    }
}
