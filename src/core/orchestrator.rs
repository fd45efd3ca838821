use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapters::Simulator;
use crate::context::AppContext;
use crate::core::device::{VolumeSource, spawn_monitor};
use crate::core::notifications::NotificationSink;
use crate::core::scheduler::{Launcher, ProcessLauncher, Scheduler};

/// How long shutdown waits for stopped jobs to report.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Operator command for the running daemon. Slot numbers are 1-based here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Start(usize),
    Stop(usize),
    StartAll,
    StopAll,
    Status,
    /// `None` clears the selected image.
    Image(Option<PathBuf>),
    AddDevice { disk: u64, size_gb: u64 },
    RemoveDevice(u64),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("empty command")]
    Empty,
    #[error("unknown command '{0}'")]
    Unknown(String),
    #[error("'{0}' needs an argument")]
    MissingArgument(&'static str),
    #[error("invalid number '{0}'")]
    InvalidNumber(String),
    #[error("slots are numbered from 1")]
    SlotZero,
}

fn number<T: FromStr>(arg: Option<&str>, command: &'static str) -> Result<T, CommandError> {
    let arg = arg.ok_or(CommandError::MissingArgument(command))?;
    arg.parse()
        .map_err(|_| CommandError::InvalidNumber(arg.to_string()))
}

fn slot(arg: Option<&str>, command: &'static str) -> Result<usize, CommandError> {
    match number::<usize>(arg, command)? {
        0 => Err(CommandError::SlotZero),
        n => Ok(n),
    }
}

impl FromStr for ControlCommand {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let command = words.next().ok_or(CommandError::Empty)?;

        match command.to_ascii_lowercase().as_str() {
            "start" => Ok(Self::Start(slot(words.next(), "start")?)),
            "stop" => Ok(Self::Stop(slot(words.next(), "stop")?)),
            "start-all" => Ok(Self::StartAll),
            "stop-all" => Ok(Self::StopAll),
            "status" => Ok(Self::Status),
            "image" => {
                // Paths may contain spaces.
                let rest = line.trim_start()[command.len()..].trim();
                Ok(Self::Image((!rest.is_empty()).then(|| PathBuf::from(rest))))
            }
            "add" => {
                let disk = number(words.next(), "add")?;
                let size_gb = match words.next() {
                    Some(gb) => number(Some(gb), "add")?,
                    None => 8,
                };
                Ok(Self::AddDevice { disk, size_gb })
            }
            "rm" => Ok(Self::RemoveDevice(number(words.next(), "rm")?)),
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }
}

/// The control loop: owns the scheduler and serialises worker reports,
/// device snapshots and operator commands through one task.
pub struct Orchestrator {
    ctx: AppContext,
    source: Arc<dyn VolumeSource>,
    sink: Arc<dyn NotificationSink>,
    simulator: Option<Simulator>,
    launcher: Box<dyn Launcher>,
    shutdown_grace: Duration,
}

impl Orchestrator {
    pub fn new(
        ctx: AppContext,
        source: Arc<dyn VolumeSource>,
        sink: Arc<dyn NotificationSink>,
        simulator: Option<Simulator>,
    ) -> Self {
        Self {
            ctx,
            source,
            sink,
            simulator,
            launcher: Box::new(ProcessLauncher),
            shutdown_grace: SHUTDOWN_GRACE,
        }
    }

    /// Replace how admitted jobs are launched.
    pub fn with_launcher(mut self, launcher: Box<dyn Launcher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Run until `shutdown` fires. On shutdown the queue is dropped, every
    /// running job is stopped, and their terminal reports are awaited.
    pub async fn run(
        self,
        mut commands: mpsc::Receiver<ControlCommand>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        info!(
            slots = self.ctx.config.slot_count,
            max_concurrent = self.ctx.config.max_concurrent,
            "Orchestrator starting"
        );

        let (inbox, mut inbox_rx) = mpsc::unbounded_channel();
        let mut scheduler = Scheduler::new(
            self.ctx.clone(),
            self.source.clone(),
            self.sink.clone(),
            self.launcher,
            inbox,
        );

        let (device_tx, mut device_rx) = mpsc::channel(4);
        let monitor_cancel = shutdown.child_token();
        let monitor = spawn_monitor(
            self.source.clone(),
            self.ctx.config.poll_interval(),
            device_tx,
            monitor_cancel.clone(),
        );

        let mut commands_open = true;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(msg) = inbox_rx.recv() => scheduler.handle_message(msg),
                Some(snapshot) = device_rx.recv() => scheduler.apply_devices(snapshot),
                command = commands.recv(), if commands_open => match command {
                    Some(command) => dispatch(&mut scheduler, self.simulator.as_ref(), &self.sink, command),
                    None => {
                        debug!("Command channel closed");
                        commands_open = false;
                    }
                },
            }
        }

        info!("Orchestrator shutting down");
        monitor_cancel.cancel();
        scheduler.clear_queue();
        scheduler.stop_all();

        // The scheduler keeps a sender, so the inbox never closes on its own.
        let deadline = tokio::time::Instant::now() + self.shutdown_grace;
        while scheduler.running_count() > 0 {
            match tokio::time::timeout_at(deadline, inbox_rx.recv()).await {
                Ok(Some(msg)) => scheduler.handle_message(msg),
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        running = scheduler.running_count(),
                        "Jobs did not report after stop, shutting down anyway"
                    );
                    break;
                }
            }
        }

        if let Err(e) = monitor.await {
            warn!(error = %e, "Device monitor task failed");
        }

        info!("Orchestrator stopped");
        Ok(())
    }
}

fn dispatch(
    scheduler: &mut Scheduler,
    simulator: Option<&Simulator>,
    sink: &Arc<dyn NotificationSink>,
    command: ControlCommand,
) {
    debug!(?command, "Operator command");
    match command {
        ControlCommand::Start(n) => {
            let _ = scheduler.start(n - 1);
        }
        ControlCommand::Stop(n) => scheduler.stop(n - 1),
        ControlCommand::StartAll => scheduler.start_all(),
        ControlCommand::StopAll => scheduler.stop_all(),
        ControlCommand::Status => scheduler.report(Instant::now()),
        ControlCommand::Image(path) => scheduler.set_image(path),
        ControlCommand::AddDevice { disk, size_gb } => match simulator {
            Some(sim) => sim.add_device(disk, size_gb),
            None => sink.log(None, "[Error] 'add' is only available in simulation mode."),
        },
        ControlCommand::RemoveDevice(disk) => match simulator {
            Some(sim) => sim.remove_disk(disk),
            None => sink.log(None, "[Error] 'rm' is only available in simulation mode."),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_slot_commands() {
        assert_eq!("start 2".parse::<ControlCommand>(), Ok(ControlCommand::Start(2)));
        assert_eq!("  STOP 1 ".parse::<ControlCommand>(), Ok(ControlCommand::Stop(1)));
        assert_eq!("start-all".parse::<ControlCommand>(), Ok(ControlCommand::StartAll));
        assert_eq!("stop-all".parse::<ControlCommand>(), Ok(ControlCommand::StopAll));
        assert_eq!("status".parse::<ControlCommand>(), Ok(ControlCommand::Status));
    }

    #[test]
    fn test_parse_rejects_bad_slots() {
        assert_eq!("start 0".parse::<ControlCommand>(), Err(CommandError::SlotZero));
        assert_eq!(
            "start".parse::<ControlCommand>(),
            Err(CommandError::MissingArgument("start"))
        );
        assert_eq!(
            "stop x".parse::<ControlCommand>(),
            Err(CommandError::InvalidNumber("x".to_string()))
        );
        assert_eq!("".parse::<ControlCommand>(), Err(CommandError::Empty));
        assert_eq!(
            "eject 1".parse::<ControlCommand>(),
            Err(CommandError::Unknown("eject".to_string()))
        );
    }

    #[test]
    fn test_parse_image_keeps_spaces() {
        assert_eq!(
            "image /srv/images/golden master.img".parse::<ControlCommand>(),
            Ok(ControlCommand::Image(Some(PathBuf::from(
                "/srv/images/golden master.img"
            ))))
        );
        assert_eq!("image".parse::<ControlCommand>(), Ok(ControlCommand::Image(None)));
    }

    #[test]
    fn test_parse_simulation_commands() {
        assert_eq!(
            "add 3".parse::<ControlCommand>(),
            Ok(ControlCommand::AddDevice { disk: 3, size_gb: 8 })
        );
        assert_eq!(
            "add 3 32".parse::<ControlCommand>(),
            Ok(ControlCommand::AddDevice { disk: 3, size_gb: 32 })
        );
        assert_eq!("rm 3".parse::<ControlCommand>(), Ok(ControlCommand::RemoveDevice(3)));
    }
}
