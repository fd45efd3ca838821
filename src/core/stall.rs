use std::path::PathBuf;

/// Result of one size poll on a backup target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallCheck {
    /// File not created yet.
    Missing,
    Growing(u64),
    /// Same size as last tick, fewer than the threshold ticks in a row.
    Unchanged { size: u64, ticks: u32 },
    /// Threshold just reached. Reported once per stall.
    Stalled { size: u64, ticks: u32 },
}

/// Advisory stall detector: compares the output file size across polling
/// ticks. It only reports; it never cancels anything.
#[derive(Debug)]
pub struct StallWatch {
    path: PathBuf,
    threshold: u32,
    last_size: Option<u64>,
    ticks: u32,
}

impl StallWatch {
    pub fn new(path: impl Into<PathBuf>, threshold: u32) -> Self {
        Self {
            path: path.into(),
            threshold: threshold.max(1),
            last_size: None,
            ticks: 0,
        }
    }

    pub fn observe(&mut self) -> StallCheck {
        let Ok(size) = std::fs::metadata(&self.path).map(|m| m.len()) else {
            return StallCheck::Missing;
        };

        if self.last_size != Some(size) {
            self.last_size = Some(size);
            self.ticks = 0;
            return StallCheck::Growing(size);
        }

        self.ticks += 1;
        if self.ticks == self.threshold {
            StallCheck::Stalled {
                size,
                ticks: self.ticks,
            }
        } else {
            StallCheck::Unchanged {
                size,
                ticks: self.ticks,
            }
        }
    }
}
