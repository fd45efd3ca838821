use std::sync::Arc;
use std::time::Duration;

use odm::adapters::SimulatedVolumeSource;
use odm::config::AppConfig;
use odm::context::AppContext;
use odm::core::clone_worker::{CloneRequest, Inbox, JobControl, WorkerEvent, WorkerMessage};
use odm::core::models::JobStatus;
use odm::core::notifications::RecordingSink;
use odm::core::orchestrator::{ControlCommand, Orchestrator};
use odm::core::scheduler::Launcher;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Jobs that run until stopped, or finish at once when `instant` is set.
struct ScriptedLauncher {
    instant: bool,
}

struct ScriptedJob {
    message: Option<WorkerMessage>,
    inbox: Inbox,
}

impl JobControl for ScriptedJob {
    fn stop(&mut self) {
        if let Some(mut msg) = self.message.take() {
            msg.event = WorkerEvent::Finished(JobStatus::Stopped);
            let _ = self.inbox.send(msg);
        }
    }
}

impl Launcher for ScriptedLauncher {
    fn launch(&mut self, request: CloneRequest, inbox: &Inbox) -> Box<dyn JobControl> {
        let msg = |event| WorkerMessage {
            slot: request.slot,
            job: request.job,
            event,
        };
        let _ = inbox.send(msg(WorkerEvent::Log("CMD: fake".to_string())));
        let _ = inbox.send(msg(WorkerEvent::Progress(50)));
        if self.instant {
            let _ = inbox.send(msg(WorkerEvent::Finished(JobStatus::Done)));
        }
        Box::new(ScriptedJob {
            message: (!self.instant).then(|| msg(WorkerEvent::Progress(0))),
            inbox: inbox.clone(),
        })
    }
}

/// Jobs that never report back, even when stopped.
struct HungLauncher;

struct HungJob;

impl JobControl for HungJob {
    fn stop(&mut self) {}
}

impl Launcher for HungLauncher {
    fn launch(&mut self, request: CloneRequest, inbox: &Inbox) -> Box<dyn JobControl> {
        let _ = inbox.send(WorkerMessage {
            slot: request.slot,
            job: request.job,
            event: WorkerEvent::Progress(5),
        });
        Box::new(HungJob)
    }
}

fn context(temp: &TempDir, auto_clone_on_insert: bool) -> AppContext {
    let image = temp.path().join("golden.img");
    std::fs::write(&image, b"image").unwrap();
    AppContext::new(AppConfig {
        image: Some(image),
        auto_clone_on_insert,
        poll_interval_ms: 20,
        ..AppConfig::default()
    })
}

async fn wait_for(sink: &RecordingSink, slot: usize, status: JobStatus) {
    timeout(Duration::from_secs(5), async {
        while !sink.statuses(slot).contains(&status) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("slot {} never reached {:?}", slot, status));
}

#[tokio::test]
async fn test_auto_clone_on_insert() {
    let temp = tempfile::tempdir().unwrap();
    let (source, sim) = SimulatedVolumeSource::new();
    let sink = Arc::new(RecordingSink::new());
    let (_tx, rx) = mpsc::channel(4);
    let shutdown = CancellationToken::new();

    let orchestrator = Orchestrator::new(
        context(&temp, true),
        Arc::new(source),
        sink.clone(),
        Some(sim.clone()),
    )
    .with_launcher(Box::new(ScriptedLauncher { instant: true }));
    let run = tokio::spawn(orchestrator.run(rx, shutdown.clone()));

    sim.add_device(3, 8);
    wait_for(&sink, 0, JobStatus::Done).await;
    assert_eq!(sink.statuses(0), vec![JobStatus::Running, JobStatus::Done]);
    assert!(sink.logs().contains(&"CMD: fake".to_string()));

    shutdown.cancel();
    timeout(Duration::from_secs(5), run).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_commands_drive_the_scheduler() {
    let temp = tempfile::tempdir().unwrap();
    let (source, sim) = SimulatedVolumeSource::new();
    let sink = Arc::new(RecordingSink::new());
    let (tx, rx) = mpsc::channel(4);
    let shutdown = CancellationToken::new();

    let orchestrator = Orchestrator::new(
        context(&temp, false),
        Arc::new(source),
        sink.clone(),
        Some(sim),
    )
    .with_launcher(Box::new(ScriptedLauncher { instant: false }));
    let run = tokio::spawn(orchestrator.run(rx, shutdown.clone()));

    tx.send(ControlCommand::AddDevice { disk: 1, size_gb: 8 }).await.unwrap();
    timeout(Duration::from_secs(5), async {
        while !sink
            .logs()
            .contains(&"[Drives] 1 removable drive(s) detected".to_string())
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    tx.send(ControlCommand::Start(1)).await.unwrap();
    wait_for(&sink, 0, JobStatus::Running).await;

    tx.send(ControlCommand::Stop(1)).await.unwrap();
    wait_for(&sink, 0, JobStatus::Stopped).await;

    shutdown.cancel();
    timeout(Duration::from_secs(5), run).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_shutdown_stops_running_jobs() {
    let temp = tempfile::tempdir().unwrap();
    let (source, sim) = SimulatedVolumeSource::new();
    sim.add_device(1, 8);
    sim.add_device(2, 8);
    let sink = Arc::new(RecordingSink::new());
    let (_tx, rx) = mpsc::channel(4);
    let shutdown = CancellationToken::new();

    let mut ctx = context(&temp, true);
    let mut config = (*ctx.config).clone();
    config.max_concurrent = 1;
    ctx = AppContext::new(config);

    let orchestrator = Orchestrator::new(ctx, Arc::new(source), sink.clone(), None)
        .with_launcher(Box::new(ScriptedLauncher { instant: false }));
    let run = tokio::spawn(orchestrator.run(rx, shutdown.clone()));

    wait_for(&sink, 0, JobStatus::Running).await;
    wait_for(&sink, 1, JobStatus::Queued).await;

    shutdown.cancel();
    timeout(Duration::from_secs(5), run).await.unwrap().unwrap().unwrap();

    assert_eq!(sink.statuses(0).last(), Some(&JobStatus::Stopped));
    // The queued slot is dropped, not launched.
    assert_eq!(
        sink.statuses(1),
        vec![JobStatus::Queued, JobStatus::Idle]
    );
}

#[tokio::test]
async fn test_shutdown_does_not_wait_forever() {
    let temp = tempfile::tempdir().unwrap();
    let (source, sim) = SimulatedVolumeSource::new();
    sim.add_device(1, 8);
    let sink = Arc::new(RecordingSink::new());
    let (_tx, rx) = mpsc::channel(4);
    let shutdown = CancellationToken::new();

    let orchestrator = Orchestrator::new(context(&temp, true), Arc::new(source), sink.clone(), None)
        .with_launcher(Box::new(HungLauncher))
        .with_shutdown_grace(Duration::from_millis(100));
    let run = tokio::spawn(orchestrator.run(rx, shutdown.clone()));

    wait_for(&sink, 0, JobStatus::Running).await;

    shutdown.cancel();
    timeout(Duration::from_secs(5), run).await.unwrap().unwrap().unwrap();
}
