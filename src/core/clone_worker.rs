//! Supervision of one cloning-tool subprocess.
//!
//! Each worker owns a dedicated OS thread that launches the tool, reads its
//! merged stdout/stderr through a [`ProgressParser`], waits for it, and posts
//! every event into the control loop's inbox. The control loop never touches
//! the child directly; it only flips the shared stop flag, which also kills
//! the tool's whole process group.

use std::ffi::OsString;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::{Signal, killpg};
use nix::sys::wait::{Id, WaitPidFlag, waitid};
use nix::unistd::{Pid, pipe2};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::core::models::{Direction, JobId, JobStatus};
use crate::core::progress::{ProgressParser, StreamEvent};

/// Read granularity. Small so a bare `NN%` is seen as soon as it is written.
const READ_CHUNK: usize = 64;

#[derive(Debug, Clone)]
pub struct CloneRequest {
    pub slot: usize,
    pub job: JobId,
    pub tool: PathBuf,
    pub direction: Direction,
    pub image: PathBuf,
    /// Whole-device node, e.g. `/dev/sdb`.
    pub device: PathBuf,
    /// Mode flags passed through verbatim.
    pub flags: Vec<String>,
}

impl CloneRequest {
    /// Arguments after the tool path.
    pub fn arguments(&self) -> Vec<OsString> {
        let mut source = OsString::from("-source=");
        let mut target = OsString::from("-target=");
        let mut args = vec![OsString::from(self.direction.flag())];

        match self.direction {
            Direction::Restore => {
                source.push(&self.image);
                target.push(&self.device);
                args.push(source);
                args.push(target);
                args.extend(self.flags.iter().map(OsString::from));
            }
            Direction::Backup => {
                source.push(&self.device);
                target.push(&self.image);
                args.extend(self.flags.iter().map(OsString::from));
                args.push(source);
                args.push(target);
            }
        }
        args
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.tool.as_os_str().to_os_string())
            .chain(self.arguments())
            .map(|a| a.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    Progress(u8),
    Log(String),
    /// Always the last event of a job.
    Finished(JobStatus),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerMessage {
    pub slot: usize,
    pub job: JobId,
    pub event: WorkerEvent,
}

pub type Inbox = mpsc::UnboundedSender<WorkerMessage>;

/// Posts one job's events into the control inbox, in production order.
#[derive(Debug, Clone)]
struct Emitter {
    slot: usize,
    job: JobId,
    inbox: Inbox,
}

impl Emitter {
    pub fn new(slot: usize, job: JobId, inbox: Inbox) -> Self {
        Self { slot, job, inbox }
    }

    pub fn emit(&self, event: WorkerEvent) {
        // A closed inbox means the control loop is gone; nothing left to tell.
        let _ = self.inbox.send(WorkerMessage {
            slot: self.slot,
            job: self.job,
            event,
        });
    }

    pub fn log(&self, text: impl Into<String>) {
        self.emit(WorkerEvent::Log(text.into()));
    }
}

#[derive(Debug, Default)]
struct StopState {
    requested: AtomicBool,
    /// Process-group id of the running tool, 0 when none.
    pid: AtomicU32,
    /// Terminal status, set by the worker thread before `Finished` is posted.
    outcome: Mutex<Option<JobStatus>>,
}

/// Cancellation flag shared between the control loop and a worker thread.
#[derive(Debug, Clone, Default)]
struct StopHandle {
    inner: Arc<StopState>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Never blocks. Kills the tool's process tree if it is already running.
    pub fn request_stop(&self) {
        self.inner.requested.store(true, Ordering::SeqCst);
        let pid = self.inner.pid.load(Ordering::SeqCst);
        if pid != 0 {
            kill_tree(pid);
        }
    }

    pub fn is_stop_requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    fn publish_pid(&self, pid: u32) {
        self.inner.pid.store(pid, Ordering::SeqCst);
        // A stop that raced the spawn saw pid 0 and could not kill anything.
        if self.is_stop_requested() {
            kill_tree(pid);
        }
    }

    fn clear_pid(&self) {
        self.inner.pid.store(0, Ordering::SeqCst);
    }

    fn set_outcome(&self, status: JobStatus) {
        if let Ok(mut outcome) = self.inner.outcome.lock() {
            *outcome = Some(status);
        }
    }

    fn outcome(&self) -> Option<JobStatus> {
        self.inner.outcome.lock().ok().and_then(|o| *o)
    }
}

/// SIGKILL the whole process group led by `pid`.
///
/// The tool spawns its own worker child and does not forward signals, so
/// killing only the direct child would leave the real copy running.
fn kill_tree(pid: u32) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) => debug!(pid, "Killed cloning tool process group"),
        Err(Errno::ESRCH) => {}
        Err(e) => warn!(pid, error = %e, "Failed to kill cloning tool process group"),
    }
}

/// Control-side view of a launched job.
pub trait JobControl: Send {
    /// Request asynchronous termination. The terminal status still arrives
    /// through the inbox.
    fn stop(&mut self);
}

/// One cloning-tool run bound to a slot.
#[derive(Debug)]
pub struct CloneWorker {
    request: CloneRequest,
    stop: StopHandle,
    status: JobStatus,
}

impl CloneWorker {
    pub fn new(request: CloneRequest) -> Self {
        Self {
            request,
            stop: StopHandle::new(),
            status: JobStatus::Idle,
        }
    }

    /// Idle before `start`, then Running (or Stopped once a stop was
    /// requested) until the worker thread settles on its terminal status.
    pub fn status(&self) -> JobStatus {
        self.stop.outcome().unwrap_or(self.status)
    }

    /// Launch the worker thread. Only the first call launches; a worker is
    /// discarded once its terminal status has been consumed.
    pub fn start(&mut self, inbox: &Inbox) {
        if self.status != JobStatus::Idle {
            return;
        }
        self.status = JobStatus::Running;

        let request = self.request.clone();
        let stop = self.stop.clone();
        let emitter = Emitter::new(request.slot, request.job, inbox.clone());
        let thread_emitter = emitter.clone();

        let spawned = std::thread::Builder::new()
            .name(format!("clone-slot-{}", request.slot + 1))
            .spawn(move || {
                let status = catch_unwind(AssertUnwindSafe(|| run(&request, &stop, &thread_emitter)))
                    .unwrap_or_else(|_| {
                        thread_emitter.log("ERROR: clone worker panicked");
                        JobStatus::Failed
                    });
                stop.set_outcome(status);
                thread_emitter.emit(WorkerEvent::Finished(status));
            });

        if let Err(e) = spawned {
            emitter.log(format!("ERROR: could not start worker thread: {}", e));
            self.stop.set_outcome(JobStatus::Failed);
            emitter.emit(WorkerEvent::Finished(JobStatus::Failed));
        }
    }

    /// Mark the job Stopped immediately and tear down the process tree.
    /// No effect once the job has finished.
    pub fn stop(&mut self) {
        if self.stop.outcome().is_some() {
            return;
        }
        self.status = JobStatus::Stopped;
        self.stop.request_stop();
    }
}

impl JobControl for CloneWorker {
    fn stop(&mut self) {
        CloneWorker::stop(self);
    }
}

fn run(request: &CloneRequest, stop: &StopHandle, emitter: &Emitter) -> JobStatus {
    if request.direction == Direction::Backup {
        remove_stale_target(request, emitter);
    }

    emitter.log(format!("CMD: {}", request.command_line()));
    info!(slot = request.slot + 1, job = %request.job, command = %request.command_line(), "Launching cloning tool");

    let (reader, writer) = match pipe2(OFlag::O_CLOEXEC) {
        Ok(pair) => pair,
        Err(e) => {
            emitter.log(format!("ERROR: could not create output pipe: {}", e));
            return JobStatus::Failed;
        }
    };
    let stderr_writer = match writer.try_clone() {
        Ok(fd) => fd,
        Err(e) => {
            emitter.log(format!("ERROR: could not create output pipe: {}", e));
            return JobStatus::Failed;
        }
    };

    // The Command owns our copies of the write end; it must be dropped right
    // after spawn or the read loop never sees end-of-stream.
    let spawned = Command::new(&request.tool)
        .args(request.arguments())
        .stdin(Stdio::null())
        .stdout(Stdio::from(writer))
        .stderr(Stdio::from(stderr_writer))
        .process_group(0)
        .spawn();

    let mut child = match spawned {
        Ok(child) => child,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            emitter.log(format!(
                "ERROR: cloning tool not found at {}",
                request.tool.display()
            ));
            return JobStatus::Failed;
        }
        Err(e) => {
            emitter.log(format!("ERROR launching cloning tool: {}", e));
            return JobStatus::Failed;
        }
    };

    stop.publish_pid(child.id());
    read_output(File::from(reader), stop, emitter);

    let waited = reap(&mut child, stop);

    match waited {
        Ok(exit) => resolve_exit(stop.is_stop_requested(), exit, emitter),
        Err(e) => {
            emitter.log(format!("ERROR waiting for cloning tool: {}", e));
            if stop.is_stop_requested() {
                JobStatus::Stopped
            } else {
                JobStatus::Failed
            }
        }
    }
}

/// Wait for the tool and unpublish its pid while it is still a zombie, so a
/// late stop can never signal a recycled process group.
fn reap(child: &mut Child, stop: &StopHandle) -> std::io::Result<ExitStatus> {
    if let Ok(raw) = i32::try_from(child.id()) {
        loop {
            match waitid(Id::Pid(Pid::from_raw(raw)), WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT) {
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    debug!(error = %e, "waitid failed, falling back to wait");
                    break;
                }
                Ok(_) => break,
            }
        }
    }
    stop.clear_pid();
    child.wait()
}

fn read_output(mut reader: File, stop: &StopHandle, emitter: &Emitter) {
    let mut parser = ProgressParser::new();
    let mut buf = [0u8; READ_CHUNK];

    loop {
        if stop.is_stop_requested() {
            break;
        }
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(error = %e, "Output pipe read failed");
                break;
            }
        };
        for event in parser.feed(&buf[..n]) {
            emitter.emit(stream_event(event));
        }
    }

    if let Some(event) = parser.finish() {
        emitter.emit(stream_event(event));
    }
}

fn stream_event(event: StreamEvent) -> WorkerEvent {
    match event {
        StreamEvent::Progress(p) => WorkerEvent::Progress(p),
        StreamEvent::Log(line) => WorkerEvent::Log(line),
    }
}

/// A stop request wins over any exit code, including success.
fn resolve_exit(stop_requested: bool, exit: ExitStatus, emitter: &Emitter) -> JobStatus {
    if stop_requested {
        return JobStatus::Stopped;
    }
    if exit.success() {
        emitter.emit(WorkerEvent::Progress(100));
        return JobStatus::Done;
    }
    match (exit.code(), exit.signal()) {
        (Some(code), _) => emitter.log(format!("Cloning tool exited with code {}", code)),
        (None, Some(signal)) => emitter.log(format!("Cloning tool terminated by signal {}", signal)),
        (None, None) => emitter.log("Cloning tool exited abnormally"),
    }
    JobStatus::Failed
}

/// The tool asks for overwrite confirmation on stdin, which the child does not
/// have, so an existing backup target would hang the job forever.
fn remove_stale_target(request: &CloneRequest, emitter: &Emitter) {
    match std::fs::remove_file(&request.image) {
        Ok(()) => emitter.log(format!(
            "Removed existing file: {}",
            request.image.display()
        )),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => {
            warn!(path = %request.image.display(), error = %e, "Could not remove existing backup target");
            emitter.log(format!("WARNING: could not remove existing file: {}", e));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(direction: Direction, flags: &[&str]) -> CloneRequest {
        CloneRequest {
            slot: 0,
            job: JobId::new(),
            tool: PathBuf::from("/opt/odinc"),
            direction,
            image: PathBuf::from("/srv/golden.img"),
            device: PathBuf::from("/dev/sdb"),
            flags: flags.iter().map(|f| f.to_string()).collect(),
        }
    }

    fn emitter() -> (Emitter, mpsc::UnboundedReceiver<WorkerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Emitter::new(0, JobId::new(), tx), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<WorkerMessage>) -> Vec<WorkerEvent> {
        let mut events = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            events.push(msg.event);
        }
        events
    }

    #[test]
    fn test_restore_command_line() {
        let req = request(Direction::Restore, &["-force"]);
        assert_eq!(
            req.command_line(),
            "/opt/odinc -restore -source=/srv/golden.img -target=/dev/sdb -force"
        );
    }

    #[test]
    fn test_backup_command_line_puts_flags_first() {
        let req = request(Direction::Backup, &["-allBlocks", "-compression=none"]);
        assert_eq!(
            req.command_line(),
            "/opt/odinc -backup -allBlocks -compression=none -source=/dev/sdb -target=/srv/golden.img"
        );
    }

    #[test]
    fn test_stop_wins_over_success() {
        let (emitter, mut rx) = emitter();
        let status = resolve_exit(true, ExitStatus::from_raw(0), &emitter);
        assert_eq!(status, JobStatus::Stopped);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_success_reports_full_progress() {
        let (emitter, mut rx) = emitter();
        let status = resolve_exit(false, ExitStatus::from_raw(0), &emitter);
        assert_eq!(status, JobStatus::Done);
        assert_eq!(drain(&mut rx), vec![WorkerEvent::Progress(100)]);
    }

    #[test]
    fn test_nonzero_exit_logs_code() {
        let (emitter, mut rx) = emitter();
        // Raw wait status: exit code lives in the second byte.
        let status = resolve_exit(false, ExitStatus::from_raw(3 << 8), &emitter);
        assert_eq!(status, JobStatus::Failed);
        assert_eq!(
            drain(&mut rx),
            vec![WorkerEvent::Log("Cloning tool exited with code 3".to_string())]
        );
    }

    #[test]
    fn test_signal_exit_is_failure() {
        let (emitter, mut rx) = emitter();
        let status = resolve_exit(false, ExitStatus::from_raw(9), &emitter);
        assert_eq!(status, JobStatus::Failed);
        assert_eq!(
            drain(&mut rx),
            vec![WorkerEvent::Log("Cloning tool terminated by signal 9".to_string())]
        );
    }

    #[test]
    fn test_status_reads_worker_outcome() {
        let mut worker = CloneWorker::new(request(Direction::Restore, &[]));
        assert_eq!(worker.status(), JobStatus::Idle);

        worker.stop.set_outcome(JobStatus::Done);
        assert_eq!(worker.status(), JobStatus::Done);

        // Stopping a finished job changes nothing.
        worker.stop();
        assert_eq!(worker.status(), JobStatus::Done);
        assert!(!worker.stop.is_stop_requested());
    }

    #[test]
    fn test_reap_unpublishes_pid() {
        let handle = StopHandle::new();
        let mut child = Command::new("sh").args(["-c", "exit 4"]).spawn().unwrap();
        handle.publish_pid(child.id());

        let exit = reap(&mut child, &handle).unwrap();
        assert_eq!(exit.code(), Some(4));
        assert_eq!(handle.inner.pid.load(Ordering::SeqCst), 0);

        // A stop after the exit has no process group left to signal.
        handle.request_stop();
        assert!(handle.is_stop_requested());
    }

    #[test]
    fn test_stop_handle_without_process() {
        let handle = StopHandle::new();
        assert!(!handle.is_stop_requested());
        handle.request_stop();
        assert!(handle.is_stop_requested());
        assert!(handle.clone().is_stop_requested());
    }
}
