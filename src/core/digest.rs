//! SHA-1 and SHA-256 over one byte range of a file, in a single streaming pass.

use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Read size per step. Memory use is bounded by this regardless of range length.
pub const CHUNK_SIZE: usize = 4 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteLength {
    ToEnd,
    Exactly(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestRequest {
    pub path: PathBuf,
    pub offset: u64,
    pub length: ByteLength,
}

impl DigestRequest {
    pub fn whole_file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            offset: 0,
            length: ByteLength::ToEnd,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DigestPair {
    pub sha1: String,
    pub sha256: String,
    /// Bytes actually hashed.
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DigestOutcome {
    Done(DigestPair),
    Stopped,
    Failed(String),
}

/// Hash `request`'s range, calling `on_progress` whenever the whole-percent
/// value changes. `stop` is checked before every chunk.
pub fn digest_range(
    request: &DigestRequest,
    stop: &AtomicBool,
    mut on_progress: impl FnMut(u8),
) -> DigestOutcome {
    match hash_range(request, stop, &mut on_progress) {
        Ok(Some(pair)) => {
            on_progress(100);
            DigestOutcome::Done(pair)
        }
        Ok(None) => DigestOutcome::Stopped,
        Err(e) => {
            debug!(path = %request.path.display(), error = %e, "Digest failed");
            DigestOutcome::Failed(format!("{}: {}", request.path.display(), e))
        }
    }
}

fn hash_range(
    request: &DigestRequest,
    stop: &AtomicBool,
    on_progress: &mut dyn FnMut(u8),
) -> std::io::Result<Option<DigestPair>> {
    let mut file = File::open(&request.path)?;
    let file_size = file.metadata()?.len();

    let available = file_size.saturating_sub(request.offset);
    let total = match request.length {
        ByteLength::ToEnd => available,
        ByteLength::Exactly(n) => n.min(available),
    };

    file.seek(SeekFrom::Start(request.offset))?;

    let mut sha1 = Sha1::new();
    let mut sha256 = Sha256::new();
    let mut buffer = vec![0u8; CHUNK_SIZE.min(total as usize).max(1)];
    let mut done: u64 = 0;
    let mut last_pct: Option<u8> = None;

    while done < total {
        if stop.load(Ordering::SeqCst) {
            return Ok(None);
        }

        let want = (total - done).min(buffer.len() as u64) as usize;
        let read = match file.read(&mut buffer[..want]) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };

        sha1.update(&buffer[..read]);
        sha256.update(&buffer[..read]);
        done += read as u64;

        let pct = ((done * 100 / total) as u8).min(99);
        if last_pct != Some(pct) {
            on_progress(pct);
            last_pct = Some(pct);
        }
    }

    Ok(Some(DigestPair {
        sha1: format!("{:x}", sha1.finalize()),
        sha256: format!("{:x}", sha256.finalize()),
        bytes: done,
    }))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DigestEvent {
    Progress(u8),
    Finished(DigestOutcome),
}

/// Background digest job on its own thread.
#[derive(Debug)]
pub struct DigestWorker {
    stop: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl DigestWorker {
    pub fn spawn(
        request: DigestRequest,
        tx: mpsc::UnboundedSender<DigestEvent>,
    ) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();

        let thread = std::thread::Builder::new()
            .name("digest".to_string())
            .spawn(move || {
                info!(path = %request.path.display(), offset = request.offset, "Starting digest");
                let progress_tx = tx.clone();
                let outcome = digest_range(&request, &thread_stop, |pct| {
                    let _ = progress_tx.send(DigestEvent::Progress(pct));
                });
                let _ = tx.send(DigestEvent::Finished(outcome));
            })?;

        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    /// Never blocks; the worker notices at the next chunk boundary.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Wait for the worker thread to unwind.
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExpectedDigestError {
    #[error("unrecognised hash length ({0} chars; expected 40 or 64)")]
    UnrecognisedLength(usize),
    #[error("expected hash contains non-hex characters")]
    NotHex,
}

/// A known-good digest to compare against, recognised by its length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpectedDigest {
    Sha1(String),
    Sha256(String),
}

impl ExpectedDigest {
    pub fn parse(value: &str) -> Result<Self, ExpectedDigestError> {
        let value = value.trim().to_ascii_lowercase();
        if !value.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ExpectedDigestError::NotHex);
        }
        match value.len() {
            40 => Ok(Self::Sha1(value)),
            64 => Ok(Self::Sha256(value)),
            n => Err(ExpectedDigestError::UnrecognisedLength(n)),
        }
    }

    pub fn algorithm(&self) -> &'static str {
        match self {
            Self::Sha1(_) => "SHA-1",
            Self::Sha256(_) => "SHA-256",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestCheck {
    Match(&'static str),
    Mismatch(&'static str),
}

impl DigestPair {
    pub fn check(&self, expected: &ExpectedDigest) -> DigestCheck {
        let (actual, wanted) = match expected {
            ExpectedDigest::Sha1(v) => (&self.sha1, v),
            ExpectedDigest::Sha256(v) => (&self.sha256, v),
        };
        if actual == wanted {
            DigestCheck::Match(expected.algorithm())
        } else {
            DigestCheck::Mismatch(expected.algorithm())
        }
    }
}

/// Convenience for callers that only need the final pair.
pub fn digest_file(path: &Path) -> DigestOutcome {
    digest_range(
        &DigestRequest::whole_file(path),
        &AtomicBool::new(false),
        |_| {},
    )
}
