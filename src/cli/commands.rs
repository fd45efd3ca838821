use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::context::AppContext;
use crate::core::clone_worker::{CloneRequest, CloneWorker, WorkerEvent};
use crate::core::device::{PhysicalDevice, VolumeSource, enumerate, format_size};
use crate::core::digest::{
    ByteLength, DigestCheck, DigestEvent, DigestOutcome, DigestPair, DigestRequest, DigestWorker,
    ExpectedDigest,
};
use crate::core::hash_log::HashLog;
use crate::core::models::{Direction, JobId, JobStatus};
use crate::core::notifications::NotificationSink;
use crate::core::partitions::{PartitionInfo, read_partitions};
use crate::core::stall::{StallCheck, StallWatch};

/// List removable devices currently attached.
pub fn devices(source: &dyn VolumeSource, json: bool) -> Result<()> {
    let devices = enumerate(source).context("Failed to enumerate devices")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }

    if devices.is_empty() {
        println!("No removable drives detected.");
    }
    for device in &devices {
        println!("{}  -> {}", device.display(), device.target.display());
    }
    Ok(())
}

/// Print the primary partition table of an image.
pub fn partitions(image: &Path) -> Result<()> {
    if !image.is_file() {
        bail!("Image not found: {}", image.display());
    }
    let parts = read_partitions(image);
    if parts.is_empty() {
        println!("No MBR partition table found in {}", image.display());
    }
    for part in &parts {
        println!(
            "#{}  {:<14} offset {:>14}  size {:>14} ({}){}",
            part.number,
            part.type_name(),
            part.offset,
            part.size,
            format_size(part.size),
            if part.active { "  active" } else { "" }
        );
    }
    Ok(())
}

pub fn config(ctx: &AppContext) -> Result<()> {
    print!("{}", ctx.config.to_toml()?);
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct HashOptions {
    pub file: PathBuf,
    pub offset: Option<u64>,
    pub length: Option<u64>,
    /// 1-based MBR partition; overrides offset and length.
    pub partition: Option<u8>,
    pub expect: Option<String>,
}

impl HashOptions {
    /// Only whole-file results go into the hash log.
    fn is_whole_file(&self) -> bool {
        self.partition.is_none() && self.offset.unwrap_or(0) == 0 && self.length.is_none()
    }
}

/// Turn hash options into a concrete byte range.
pub fn resolve_range(options: &HashOptions) -> Result<DigestRequest> {
    if let Some(number) = options.partition {
        let parts = read_partitions(&options.file);
        let part: &PartitionInfo = parts
            .iter()
            .find(|p| p.number == number)
            .ok_or_else(|| anyhow!("Partition {} not found in {}", number, options.file.display()))?;
        return Ok(DigestRequest {
            path: options.file.clone(),
            offset: part.offset,
            length: ByteLength::Exactly(part.size),
        });
    }

    Ok(DigestRequest {
        path: options.file.clone(),
        offset: options.offset.unwrap_or(0),
        length: options.length.map_or(ByteLength::ToEnd, ByteLength::Exactly),
    })
}

/// Hash a file range on a worker thread, reporting progress until done.
/// Ctrl-C stops the worker at the next chunk.
///
/// Whole-file results are recorded in the hash log, and a file whose last
/// recorded hash is older than `hash_stale_days` gets a warning first.
pub async fn hash(
    ctx: &AppContext,
    options: HashOptions,
    sink: Arc<dyn NotificationSink>,
) -> Result<DigestPair> {
    let expected = options
        .expect
        .as_deref()
        .map(ExpectedDigest::parse)
        .transpose()
        .context("Invalid expected hash")?;
    let request = resolve_range(&options)?;

    let mut history = HashLog::load(&ctx.config.hash_log_path);
    let now = Utc::now();
    if let Some(days) = history.days_since(&options.file, now) {
        if history.is_stale(&options.file, now, ctx.config.hash_stale_days) {
            warn!(file = %options.file.display(), days, "Image not verified recently");
            sink.log(
                None,
                &format!("[Hash] {} was last verified {} days ago", options.file.display(), days),
            );
        } else {
            sink.log(None, &format!("[Hash] Last verified {} day(s) ago", days));
        }
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let worker = DigestWorker::spawn(request, tx).context("Failed to start digest worker")?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut stopping = false;

    let outcome = loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(DigestEvent::Progress(pct)) => sink.log(None, &format!("[Hash] {}%", pct)),
                Some(DigestEvent::Finished(outcome)) => break outcome,
                None => break DigestOutcome::Failed("digest worker vanished".to_string()),
            },
            _ = &mut ctrl_c, if !stopping => {
                stopping = true;
                worker.stop();
            }
        }
    };
    worker.join();

    let pair = match outcome {
        DigestOutcome::Done(pair) => pair,
        DigestOutcome::Stopped => bail!("Hashing stopped"),
        DigestOutcome::Failed(e) => bail!("Hashing failed: {}", e),
    };

    println!("SHA-1:   {}", pair.sha1);
    println!("SHA-256: {}", pair.sha256);
    println!("Bytes:   {}", pair.bytes);

    if options.is_whole_file() {
        if let Err(e) = history.record(&options.file, &pair, Utc::now()) {
            warn!(error = %e, "Could not update hash log");
        }
    }

    match expected.map(|e| pair.check(&e)) {
        Some(DigestCheck::Match(alg)) => println!("{} matches the expected value.", alg),
        Some(DigestCheck::Mismatch(alg)) => bail!("{} does not match the expected value", alg),
        None => {}
    }

    Ok(pair)
}

/// Pick a device by identity number, whole-device node, or volume name.
pub fn find_device<'a>(devices: &'a [PhysicalDevice], selector: &str) -> Option<&'a PhysicalDevice> {
    devices.iter().find(|d| {
        selector.parse::<u64>().is_ok_and(|n| d.id.0 == n)
            || d.target == Path::new(selector)
            || d.volumes.iter().any(|v| v == selector)
    })
}

/// Read one removable device back into an image file.
///
/// The output file size is watched every poll interval; a backup that stops
/// growing is reported but left running.
pub async fn backup(
    ctx: &AppContext,
    source: &dyn VolumeSource,
    selector: &str,
    output: &Path,
    sink: Arc<dyn NotificationSink>,
) -> Result<JobStatus> {
    let devices = enumerate(source).context("Failed to enumerate devices")?;
    let device = find_device(&devices, selector)
        .ok_or_else(|| anyhow!("No removable drive matches '{}'", selector))?;

    let request = CloneRequest {
        slot: 0,
        job: JobId::new(),
        tool: ctx.config.tool_path.clone(),
        direction: Direction::Backup,
        image: output.to_path_buf(),
        device: device.target.clone(),
        flags: ctx.config.backup_flags.clone(),
    };
    info!(device = %device.display(), output = %output.display(), "Starting backup");

    let (inbox, mut rx) = mpsc::unbounded_channel();
    let mut worker = CloneWorker::new(request);
    worker.start(&inbox);

    let mut watch = StallWatch::new(output, ctx.config.stall_ticks);
    let mut ticker = tokio::time::interval(ctx.config.poll_interval());
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut stopping = false;

    let status = loop {
        tokio::select! {
            msg = rx.recv() => match msg.map(|m| m.event) {
                Some(WorkerEvent::Progress(pct)) => sink.progress(0, pct),
                Some(WorkerEvent::Log(line)) => sink.log(Some(0), &line),
                Some(WorkerEvent::Finished(status)) => break status,
                None => break JobStatus::Failed,
            },
            _ = ticker.tick() => {
                if let StallCheck::Stalled { size, ticks } = watch.observe() {
                    warn!(size, ticks, "Backup output stopped growing");
                    sink.log(
                        Some(0),
                        &format!("[Stall] {} unchanged at {} for {} polls", output.display(), format_size(size), ticks),
                    );
                }
            }
            _ = &mut ctrl_c, if !stopping => {
                stopping = true;
                worker.stop();
            }
        }
    };

    sink.status(0, status);
    if status == JobStatus::Failed {
        bail!("Backup of {} failed", device.target.display());
    }
    Ok(status)
}
