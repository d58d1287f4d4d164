use super::model::ChunkStatus;
use serde::{Deserialize, Serialize};

/// Chunk progress of a chunked session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkProgress {
    pub total: u32,
    pub completed: u32,
    pub processing: u32,
    pub failed: u32,

    /// Chunks not yet picked up (including missing records)
    pub pending: u32,
}

impl ChunkProgress {
    /// Tally chunk statuses. Missing records count as pending.
    pub fn tally<I>(total: u32, statuses: I) -> Self
    where
        I: IntoIterator<Item = Option<ChunkStatus>>,
    {
        let mut progress = ChunkProgress {
            total,
            ..Default::default()
        };

        for status in statuses {
            match status {
                Some(ChunkStatus::Completed) => progress.completed += 1,
                Some(ChunkStatus::Error) => progress.failed += 1,
                Some(ChunkStatus::Processing) => progress.processing += 1,
                Some(ChunkStatus::Queued) | None => progress.pending += 1,
            }
        }

        progress
    }

    /// Every chunk reached `completed` or `error`
    pub fn is_done(&self) -> bool {
        self.total > 0 && self.completed + self.failed >= self.total
    }

    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        f64::from(self.completed + self.failed) * 100.0 / f64::from(self.total)
    }
}
