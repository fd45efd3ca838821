use std::sync::Mutex;

use tracing::{info, warn};

use crate::core::models::JobStatus;

/// Receives per-slot job events from the control loop.
///
/// Slots are 0-based here; sinks that talk to humans present them 1-based.
/// `log` with no slot is a scheduler-wide message.
pub trait NotificationSink: Send + Sync {
    fn progress(&self, slot: usize, percent: u8);
    fn log(&self, slot: Option<usize>, text: &str);
    fn status(&self, slot: usize, status: JobStatus);
}

/// Writes every event as a structured tracing event.
#[derive(Debug, Default)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn progress(&self, slot: usize, percent: u8) {
        info!(slot = slot + 1, percent, "Progress");
    }

    fn log(&self, slot: Option<usize>, text: &str) {
        match slot {
            Some(slot) => info!(slot = slot + 1, "{}", text),
            None => info!("{}", text),
        }
    }

    fn status(&self, slot: usize, status: JobStatus) {
        match status {
            JobStatus::Failed => warn!(slot = slot + 1, status = %status, "Job finished"),
            s if s.is_terminal() => info!(slot = slot + 1, status = %status, "Job finished"),
            _ => info!(slot = slot + 1, status = %status, "Job status"),
        }
    }
}

/// A single recorded sink event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    Progress(usize, u8),
    Log(Option<usize>, String),
    Status(usize, JobStatus),
}

/// Sink that keeps every event in memory, in delivery order.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<SinkEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn statuses(&self, slot: usize) -> Vec<JobStatus> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SinkEvent::Status(s, status) if s == slot => Some(status),
                _ => None,
            })
            .collect()
    }

    pub fn logs(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SinkEvent::Log(_, text) => Some(text),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: SinkEvent) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).push(event);
    }
}

impl NotificationSink for RecordingSink {
    fn progress(&self, slot: usize, percent: u8) {
        self.push(SinkEvent::Progress(slot, percent));
    }

    fn log(&self, slot: Option<usize>, text: &str) {
        self.push(SinkEvent::Log(slot, text.to_string()));
    }

    fn status(&self, slot: usize, status: JobStatus) {
        self.push(SinkEvent::Status(slot, status));
    }
}
