pub mod clone_worker;
pub mod device;
pub mod digest;
pub mod hash_log;
pub mod models;
pub mod notifications;
pub mod orchestrator;
pub mod partitions;
pub mod progress;
pub mod scheduler;
pub mod slots;
pub mod stall;

pub use clone_worker::{CloneRequest, CloneWorker, JobControl, WorkerEvent, WorkerMessage};
pub use device::{DeviceEnumerator, DiskId, PhysicalDevice, VolumeSource};
pub use digest::{DigestPair, DigestRequest, DigestWorker};
pub use hash_log::HashLog;
pub use models::{Direction, JobId, JobStatus};
pub use notifications::{NotificationSink, TracingSink};
pub use orchestrator::{ControlCommand, Orchestrator};
pub use scheduler::{Launcher, ProcessLauncher, Scheduler, StartError};
