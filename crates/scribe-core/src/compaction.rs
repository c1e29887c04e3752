//! Compaction policy

use crate::error::{Error, Result};

/// Updates accumulated after the last snapshot before a new one is taken
pub const DEFAULT_COMPACTION_THRESHOLD: u64 = 200;

/// Decides whether a document's log has grown enough to be snapshotted.
///
/// Evaluated synchronously after every accepted update; the compaction itself
/// always runs in the background.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionPolicy {
    threshold: u64,
}

impl CompactionPolicy {
    pub fn new(threshold: u64) -> Result<Self> {
        if threshold == 0 {
            return Err(Error::InvalidInput(
                "compaction threshold must be at least 1".into(),
            ));
        }
        Ok(Self { threshold })
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    pub fn should_compact(&self, last_snapshot_seq: u64, current_seq: u64) -> bool {
        current_seq.saturating_sub(last_snapshot_seq) >= self.threshold
    }
}

impl Default for CompactionPolicy {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_COMPACTION_THRESHOLD,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_triggers_exactly_at_threshold() {
        let policy = CompactionPolicy::new(5).unwrap();

        let due: Vec<u64> = (1..=5).filter(|seq| policy.should_compact(0, *seq)).collect();
        assert_eq!(due, vec![5]);
    }

    #[test]
    fn test_counts_from_last_snapshot() {
        let policy = CompactionPolicy::new(200).unwrap();

        assert!(!policy.should_compact(200, 399));
        assert!(policy.should_compact(200, 400));
        // A snapshot ahead of the counter never triggers
        assert!(!policy.should_compact(500, 400));
    }

    #[test]
    fn test_zero_threshold_rejected() {
        assert!(CompactionPolicy::new(0).is_err());
        assert_eq!(CompactionPolicy::default().threshold(), DEFAULT_COMPACTION_THRESHOLD);
    }
}
