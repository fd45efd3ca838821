//! Admission control for clone jobs.
//!
//! The scheduler is owned by the control loop and is the only place slot
//! bindings, job states and the admission queue are mutated. Workers report
//! back through [`WorkerMessage`]s that the control loop feeds into
//! [`Scheduler::handle_message`].
//!
//! At most `max_concurrent` jobs run at once. Further start requests wait in
//! a FIFO queue and are launched, in order, as running jobs reach a terminal
//! state.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::context::AppContext;
use crate::core::clone_worker::{
    CloneRequest, CloneWorker, Inbox, JobControl, WorkerEvent, WorkerMessage,
};
use crate::core::device::{DiskId, PhysicalDevice, VolumeSource, format_size};
use crate::core::models::{Direction, JobId, JobStatus};
use crate::core::notifications::NotificationSink;
use crate::core::slots::SlotTable;
use crate::logging::LogThrottle;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StartError {
    #[error("No image file selected.")]
    NoImage,
    #[error("Image not found: {}", .0.display())]
    ImageMissing(PathBuf),
    #[error("Slot {} does not exist.", .0 + 1)]
    NoSuchSlot(usize),
    #[error("Slot {} has no drive.", .0 + 1)]
    NoDevice(usize),
    #[error("Slot {} ({volume}) is not a removable drive, aborted.", .slot + 1)]
    NotRemovable { slot: usize, volume: String },
}

/// Starts the worker for an admitted job.
pub trait Launcher: Send {
    fn launch(&mut self, request: CloneRequest, inbox: &Inbox) -> Box<dyn JobControl>;
}

/// Launches the real cloning tool through a [`CloneWorker`].
#[derive(Debug, Default)]
pub struct ProcessLauncher;

impl Launcher for ProcessLauncher {
    fn launch(&mut self, request: CloneRequest, inbox: &Inbox) -> Box<dyn JobControl> {
        let mut worker = CloneWorker::new(request);
        worker.start(inbox);
        Box::new(worker)
    }
}

struct ActiveJob {
    id: JobId,
    disk: DiskId,
    capacity: u64,
    started: Instant,
    started_at: DateTime<Local>,
    control: Box<dyn JobControl>,
    stop_requested: bool,
    throttle: LogThrottle,
}

struct SlotState {
    status: JobStatus,
    progress: u8,
    job: Option<ActiveJob>,
    /// Device the slot was bound to when it was queued.
    queued_disk: Option<DiskId>,
}

impl SlotState {
    fn idle() -> Self {
        Self {
            status: JobStatus::Idle,
            progress: 0,
            job: None,
            queued_disk: None,
        }
    }
}

/// Read-only view of one slot, for status displays.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotView {
    pub slot: usize,
    pub device: Option<String>,
    pub status: JobStatus,
    pub progress: u8,
    /// Bytes per second, only while running.
    pub throughput: Option<f64>,
    pub started_at: Option<DateTime<Local>>,
}

pub struct Scheduler {
    ctx: AppContext,
    image: Option<PathBuf>,
    source: Arc<dyn VolumeSource>,
    sink: Arc<dyn NotificationSink>,
    launcher: Box<dyn Launcher>,
    inbox: Inbox,
    table: SlotTable,
    states: Vec<SlotState>,
    queue: VecDeque<usize>,
    /// Identities in the previous device snapshot.
    last_ids: BTreeSet<DiskId>,
}

impl Scheduler {
    pub fn new(
        ctx: AppContext,
        source: Arc<dyn VolumeSource>,
        sink: Arc<dyn NotificationSink>,
        launcher: Box<dyn Launcher>,
        inbox: Inbox,
    ) -> Self {
        let slots = ctx.config.slot_count;
        Self {
            image: ctx.config.image.clone(),
            ctx,
            source,
            sink,
            launcher,
            inbox,
            table: SlotTable::new(slots),
            states: (0..slots).map(|_| SlotState::idle()).collect(),
            queue: VecDeque::new(),
            last_ids: BTreeSet::new(),
        }
    }

    pub fn set_image(&mut self, image: Option<PathBuf>) {
        match &image {
            Some(path) => self.sink.log(None, &format!("[Image] {}", path.display())),
            None => self.sink.log(None, "[Image] cleared"),
        }
        self.image = image;
    }

    pub fn status(&self, slot: usize) -> Option<JobStatus> {
        self.states.get(slot).map(|s| s.status)
    }

    pub fn progress(&self, slot: usize) -> Option<u8> {
        self.states.get(slot).map(|s| s.progress)
    }

    pub fn device(&self, slot: usize) -> Option<&PhysicalDevice> {
        self.table.device(slot)
    }

    pub fn queued(&self) -> Vec<usize> {
        self.queue.iter().copied().collect()
    }

    /// Jobs whose worker has not reported a terminal state yet, including
    /// ones that were asked to stop.
    pub fn running_count(&self) -> usize {
        self.states.iter().filter(|s| s.job.is_some()).count()
    }

    pub fn has_capacity(&self) -> bool {
        self.running_count() < self.ctx.config.max_concurrent
    }

    /// Request a clone on `slot`: launch now, or queue if the concurrency cap
    /// is reached. A slot that is already queued or running is left alone.
    pub fn start(&mut self, slot: usize) -> Result<JobStatus, StartError> {
        let Some(state) = self.states.get(slot) else {
            let err = StartError::NoSuchSlot(slot);
            self.sink.log(None, &format!("[Error] {}", err));
            return Err(err);
        };
        if state.status.is_active() {
            return Ok(state.status);
        }

        if let Err(err) = self.validate(slot) {
            self.sink.log(Some(slot), &format!("[Error] {}", err));
            return Err(err);
        }

        if !self.has_capacity() {
            self.enqueue(slot);
            return Ok(JobStatus::Queued);
        }

        self.launch(slot);
        Ok(JobStatus::Running)
    }

    /// Cancel a queued request, or ask a running worker to stop.
    pub fn stop(&mut self, slot: usize) {
        let Some(state) = self.states.get_mut(slot) else {
            return;
        };

        match state.status {
            JobStatus::Queued => {
                self.queue.retain(|&s| s != slot);
                state.status = JobStatus::Idle;
                state.queued_disk = None;
                self.sink.status(slot, JobStatus::Idle);
                self.sink.log(Some(slot), "Removed from queue.");
            }
            JobStatus::Running => {
                if let Some(job) = state.job.as_mut() {
                    job.control.stop();
                    job.stop_requested = true;
                    self.sink.log(Some(slot), "Stop requested.");
                }
            }
            _ => {}
        }
    }

    /// Start every bound slot that is not already queued or running, in slot order.
    pub fn start_all(&mut self) {
        for slot in 0..self.table.len() {
            if self.table.device(slot).is_some() && !self.states[slot].status.is_active() {
                let _ = self.start(slot);
            }
        }
    }

    /// Empty the admission queue so nothing launches after running jobs end.
    pub fn clear_queue(&mut self) {
        while let Some(slot) = self.queue.pop_front() {
            let state = &mut self.states[slot];
            state.status = JobStatus::Idle;
            state.queued_disk = None;
            self.sink.status(slot, JobStatus::Idle);
        }
    }

    /// Stop every running worker. Queued requests stay queued.
    pub fn stop_all(&mut self) {
        for slot in 0..self.states.len() {
            if self.states[slot].status == JobStatus::Running {
                self.stop(slot);
            }
        }
    }

    pub fn handle_message(&mut self, msg: WorkerMessage) {
        let Some(state) = self.states.get_mut(msg.slot) else {
            return;
        };
        let Some(job) = state.job.as_mut() else {
            debug!(slot = msg.slot + 1, job = %msg.job, "Message for slot without a job, ignoring");
            return;
        };
        if job.id != msg.job {
            debug!(slot = msg.slot + 1, job = %msg.job, "Stale worker message, ignoring");
            return;
        }

        match msg.event {
            WorkerEvent::Progress(pct) => {
                state.progress = state.progress.max(pct.min(100));
                if job.throttle.should_log() {
                    debug!(slot = msg.slot + 1, percent = state.progress, "Clone progress");
                }
                self.sink.progress(msg.slot, state.progress);
            }
            WorkerEvent::Log(line) => self.sink.log(Some(msg.slot), &line),
            WorkerEvent::Finished(reported) => {
                let status = if job.stop_requested {
                    JobStatus::Stopped
                } else {
                    reported
                };
                self.finish(msg.slot, status);
            }
        }
    }

    /// Apply a changed device snapshot: rebind slots, prune the queue of
    /// vanished devices, and auto-start newly inserted ones.
    pub fn apply_devices(&mut self, snapshot: Vec<PhysicalDevice>) {
        let current: BTreeSet<DiskId> = snapshot.iter().map(|d| d.id).collect();
        let previous = std::mem::replace(&mut self.last_ids, current);
        let count = snapshot.len();

        let before: Vec<Option<DiskId>> = (0..self.table.len())
            .map(|s| self.table.device(s).map(|d| d.id))
            .collect();

        let pinned: BTreeMap<usize, DiskId> = self
            .states
            .iter()
            .enumerate()
            .filter_map(|(slot, s)| s.job.as_ref().map(|j| (slot, j.disk)))
            .collect();

        for id in self.table.rebind(snapshot, &pinned) {
            warn!(disk = %id, "No free slot for removable device");
            self.sink.log(None, &format!("[Drives] No free slot for {}", id));
        }

        self.prune_queue();

        for (slot, was) in before.into_iter().enumerate() {
            let now = self.table.device(slot).map(|d| d.id);
            let state = &mut self.states[slot];
            if was != now && state.status.is_terminal() {
                state.status = JobStatus::Idle;
                state.progress = 0;
                self.sink.status(slot, JobStatus::Idle);
            }
        }

        self.sink
            .log(None, &format!("[Drives] {} removable drive(s) detected", count));

        if !self.ctx.config.auto_clone_on_insert || !self.image_ready() {
            return;
        }

        for slot in 0..self.table.len() {
            let Some(device) = self.table.device(slot) else {
                continue;
            };
            if previous.contains(&device.id) || self.states[slot].status.is_active() {
                continue;
            }
            self.sink.log(
                Some(slot),
                &format!("[Auto] New drive in slot {}, starting clone", slot + 1),
            );
            let _ = self.start(slot);
        }
    }

    /// Average rate since launch, derived from progress and capacity.
    pub fn throughput(&self, slot: usize, now: Instant) -> Option<f64> {
        let state = self.states.get(slot)?;
        let job = state.job.as_ref()?;
        if state.status != JobStatus::Running || state.progress == 0 {
            return None;
        }
        let elapsed = now.saturating_duration_since(job.started);
        if elapsed < Duration::from_millis(1) {
            return None;
        }
        let bytes = job.capacity as f64 * f64::from(state.progress) / 100.0;
        Some(bytes / elapsed.as_secs_f64())
    }

    pub fn view(&self, now: Instant) -> Vec<SlotView> {
        (0..self.table.len())
            .map(|slot| SlotView {
                slot,
                device: self.table.device(slot).map(|d| d.display()),
                status: self.states[slot].status,
                progress: self.states[slot].progress,
                throughput: self.throughput(slot, now),
                started_at: self.states[slot].job.as_ref().map(|j| j.started_at),
            })
            .collect()
    }

    /// Write one line per slot to the sink.
    pub fn report(&self, now: Instant) {
        for view in self.view(now) {
            let device = view.device.as_deref().unwrap_or("(empty)");
            let rate = view
                .throughput
                .map(|r| format!("  {}/s", format_size(r as u64)))
                .unwrap_or_default();
            let since = view
                .started_at
                .map(|t| format!("  since {}", t.format("%H:%M:%S")))
                .unwrap_or_default();
            self.sink.log(
                Some(view.slot),
                &format!("{}  {}  {}%{}{}", device, view.status, view.progress, rate, since),
            );
        }
        if !self.queue.is_empty() {
            let queued: Vec<String> = self.queue.iter().map(|s| (s + 1).to_string()).collect();
            self.sink
                .log(None, &format!("[Queue] {}", queued.join(", ")));
        }
    }

    fn image_ready(&self) -> bool {
        self.image.as_ref().is_some_and(|p| p.is_file())
    }

    fn validate(&self, slot: usize) -> Result<(), StartError> {
        let image = self.image.as_ref().ok_or(StartError::NoImage)?;
        if !image.is_file() {
            return Err(StartError::ImageMissing(image.clone()));
        }
        let device = self.table.device(slot).ok_or(StartError::NoDevice(slot))?;
        // Media can be swapped between detection and start.
        if !self.source.is_removable(device.primary_volume()) {
            return Err(StartError::NotRemovable {
                slot,
                volume: device.primary_volume().name.clone(),
            });
        }
        Ok(())
    }

    fn enqueue(&mut self, slot: usize) {
        if !self.queue.contains(&slot) {
            self.queue.push_back(slot);
        }
        let state = &mut self.states[slot];
        state.status = JobStatus::Queued;
        state.progress = 0;
        state.queued_disk = self.table.device(slot).map(|d| d.id);
        self.sink.status(slot, JobStatus::Queued);
        self.sink.log(
            Some(slot),
            &format!("Queued (position {}).", self.queue.len()),
        );
    }

    fn launch(&mut self, slot: usize) {
        let (Some(device), Some(image)) = (self.table.device(slot), self.image.clone()) else {
            return;
        };

        let request = CloneRequest {
            slot,
            job: JobId::new(),
            tool: self.ctx.config.tool_path.clone(),
            direction: Direction::Restore,
            image,
            device: device.target.clone(),
            flags: self.ctx.config.restore_flags.clone(),
        };
        let disk = device.id;
        let capacity = device.capacity;
        let message = format!(
            "Starting clone -> {}  ({})",
            device.target.display(),
            device.display()
        );

        info!(slot = slot + 1, job = %request.job, disk = %disk, "Launching clone job");
        let job = request.job;
        let control = self.launcher.launch(request, &self.inbox);

        let state = &mut self.states[slot];
        state.status = JobStatus::Running;
        state.progress = 0;
        state.queued_disk = None;
        state.job = Some(ActiveJob {
            id: job,
            disk,
            capacity,
            started: Instant::now(),
            started_at: Local::now(),
            control,
            stop_requested: false,
            throttle: LogThrottle::new(Duration::from_secs(5)),
        });

        self.sink.status(slot, JobStatus::Running);
        self.sink.log(Some(slot), &message);
    }

    fn finish(&mut self, slot: usize, status: JobStatus) {
        let state = &mut self.states[slot];
        let disk = state.job.take().map(|j| j.disk);
        state.status = status;
        if status == JobStatus::Done {
            state.progress = 100;
        }

        info!(slot = slot + 1, status = %status, "Clone job finished");
        self.sink.status(slot, status);
        self.sink.log(Some(slot), status.as_str());

        // The drive was pulled while the job ran; free the slot.
        if self.table.device(slot).map(|d| d.id) != disk {
            let state = &mut self.states[slot];
            state.status = JobStatus::Idle;
            state.progress = 0;
            self.sink.status(slot, JobStatus::Idle);
        }

        self.drain_queue();
    }

    fn drain_queue(&mut self) {
        while self.has_capacity() {
            let Some(slot) = self.queue.pop_front() else {
                break;
            };
            let queued_disk = self.states[slot].queued_disk.take();
            let present = self.table.device(slot).map(|d| d.id);

            if present.is_none() || present != queued_disk {
                debug!(slot = slot + 1, "Queued device disappeared, discarding");
                self.states[slot].status = JobStatus::Idle;
                self.sink.status(slot, JobStatus::Idle);
                continue;
            }

            if let Err(err) = self.validate(slot) {
                self.sink.log(Some(slot), &format!("[Error] {}", err));
                self.states[slot].status = JobStatus::Idle;
                self.sink.status(slot, JobStatus::Idle);
                continue;
            }

            self.launch(slot);
        }
    }

    fn prune_queue(&mut self) {
        let table = &self.table;
        let states = &self.states;
        let (keep, dropped): (Vec<usize>, Vec<usize>) =
            self.queue.iter().copied().partition(|&slot| {
                let present = table.device(slot).map(|d| d.id);
                present.is_some() && present == states[slot].queued_disk
            });
        self.queue = keep.into();

        for slot in dropped {
            let state = &mut self.states[slot];
            state.status = JobStatus::Idle;
            state.queued_disk = None;
            self.sink.status(slot, JobStatus::Idle);
            self.sink
                .log(Some(slot), "Drive removed while queued, dropped from queue.");
        }
    }
}
