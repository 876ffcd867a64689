//! Per-segment bulk-load progress.
//!
//! A fixed-size bit array with one bit per keyspace segment. Bits only go
//! from unfinished to finished. The value is owned by the single driver of
//! a bootstrap run and is not synchronized.

use std::fmt;

use realmcache_core::BootstrapError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const WORD_BITS: usize = 64;

fn words_for(segment_count: usize) -> usize {
    segment_count.div_ceil(WORD_BITS)
}

/// Which keyspace segments a bootstrap run has finished loading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ProgressRecord", into = "ProgressRecord")]
pub struct SegmentProgress {
    segment_count: usize,
    words: Box<[u64]>,
    finished: usize,
}

/// Persisted form of [`SegmentProgress`].
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProgressRecord {
    segment_count: usize,
    segments: Vec<u64>,
}

impl SegmentProgress {
    /// Fresh progress with every segment unfinished.
    pub fn new(segment_count: usize) -> Self {
        Self {
            segment_count,
            words: vec![0u64; words_for(segment_count)].into_boxed_slice(),
            finished: 0,
        }
    }

    /// Rebuild progress from a persisted bit vector.
    ///
    /// Fails if the word count does not match `segment_count` or a bit is
    /// set past the last segment.
    pub fn from_parts(segment_count: usize, words: Vec<u64>) -> Result<Self, BootstrapError> {
        let expected = words_for(segment_count);
        if words.len() != expected {
            return Err(BootstrapError::InvalidProgress {
                reason: format!(
                    "expected {} words for {} segments, found {}",
                    expected,
                    segment_count,
                    words.len()
                ),
            });
        }
        let tail = segment_count % WORD_BITS;
        if tail != 0 {
            if let Some(last) = words.last() {
                if last >> tail != 0 {
                    return Err(BootstrapError::InvalidProgress {
                        reason: format!("bits set beyond segment count {}", segment_count),
                    });
                }
            }
        }
        let finished = words.iter().map(|w| w.count_ones() as usize).sum();
        Ok(Self {
            segment_count,
            words: words.into_boxed_slice(),
            finished,
        })
    }

    pub fn segment_count(&self) -> usize {
        self.segment_count
    }

    pub fn finished_count(&self) -> usize {
        self.finished
    }

    /// True once every segment is finished. Trivially true for zero segments.
    pub fn is_finished(&self) -> bool {
        self.finished == self.segment_count
    }

    pub fn is_segment_finished(&self, index: usize) -> bool {
        index < self.segment_count && self.words[index / WORD_BITS] & (1 << (index % WORD_BITS)) != 0
    }

    /// Change-detecting fingerprint of the bit vector.
    ///
    /// The leading eight bytes of a SHA-256 digest over the segment count
    /// and every word, so every bit feeds the value. Equal vectors give
    /// equal values on every node. Not monotonic.
    pub fn progress_indicator(&self) -> u64 {
        let mut hasher = Sha256::new();
        hasher.update((self.segment_count as u64).to_le_bytes());
        for word in self.words.iter() {
            hasher.update(word.to_le_bytes());
        }
        let digest = hasher.finalize();
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        u64::from_le_bytes(head)
    }

    /// Unfinished segments in `[start, start + window)`, ascending, clipped
    /// to the segment count.
    pub fn segments_to_load(&self, start: usize, window: usize) -> Vec<usize> {
        let end = start.saturating_add(window).min(self.segment_count);
        (start..end)
            .filter(|&i| !self.is_segment_finished(i))
            .collect()
    }

    /// Mark `index` finished. Returns whether the bit changed.
    ///
    /// Marking an already finished segment is a no-op.
    pub fn mark_segment_finished(&mut self, index: usize) -> Result<bool, BootstrapError> {
        if index >= self.segment_count {
            return Err(BootstrapError::InvalidProgress {
                reason: format!(
                    "segment {} out of range for {} segments",
                    index, self.segment_count
                ),
            });
        }
        let mask = 1u64 << (index % WORD_BITS);
        let word = &mut self.words[index / WORD_BITS];
        if *word & mask != 0 {
            return Ok(false);
        }
        *word |= mask;
        self.finished += 1;
        Ok(true)
    }
}

impl fmt::Display for SegmentProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "finished segments count: {}, non-finished segments count: {}",
            self.finished,
            self.segment_count - self.finished
        )
    }
}

impl TryFrom<ProgressRecord> for SegmentProgress {
    type Error = BootstrapError;

    fn try_from(record: ProgressRecord) -> Result<Self, Self::Error> {
        Self::from_parts(record.segment_count, record.segments)
    }
}

impl From<SegmentProgress> for ProgressRecord {
    fn from(progress: SegmentProgress) -> Self {
        ProgressRecord {
            segment_count: progress.segment_count,
            segments: progress.words.into_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_window_scenario() {
        let mut progress = SegmentProgress::new(10);
        assert_eq!(progress.segments_to_load(0, 4), vec![0, 1, 2, 3]);

        progress.mark_segment_finished(0).unwrap();
        progress.mark_segment_finished(2).unwrap();
        assert_eq!(progress.segments_to_load(0, 4), vec![1, 3]);

        for i in [1, 3, 4, 5, 6, 7, 8, 9] {
            progress.mark_segment_finished(i).unwrap();
        }
        assert!(progress.is_finished());
    }

    #[test]
    fn test_mark_is_idempotent() {
        let mut progress = SegmentProgress::new(3);
        assert!(progress.mark_segment_finished(1).unwrap());
        assert!(!progress.mark_segment_finished(1).unwrap());
        assert_eq!(progress.finished_count(), 1);
    }

    #[test]
    fn test_mark_out_of_range() {
        let mut progress = SegmentProgress::new(3);
        let err = progress.mark_segment_finished(3).unwrap_err();
        assert!(matches!(err, BootstrapError::InvalidProgress { .. }));
    }

    #[test]
    fn test_window_clipped_to_segment_count() {
        let progress = SegmentProgress::new(5);
        assert_eq!(progress.segments_to_load(3, 10), vec![3, 4]);
        assert!(progress.segments_to_load(5, 10).is_empty());
        assert!(progress.segments_to_load(usize::MAX, usize::MAX).is_empty());
    }

    #[test]
    fn test_zero_segments_is_finished() {
        let progress = SegmentProgress::new(0);
        assert!(progress.is_finished());
        assert!(progress.segments_to_load(0, 8).is_empty());
    }

    #[test]
    fn test_display() {
        let mut progress = SegmentProgress::new(4);
        progress.mark_segment_finished(2).unwrap();
        assert_eq!(
            progress.to_string(),
            "finished segments count: 1, non-finished segments count: 3"
        );
    }

    #[test]
    fn test_serde_round_trip_keeps_bits() {
        let mut progress = SegmentProgress::new(130);
        progress.mark_segment_finished(0).unwrap();
        progress.mark_segment_finished(129).unwrap();

        let json = serde_json::to_string(&progress).unwrap();
        assert!(json.contains("\"segment_count\":130"));
        let restored: SegmentProgress = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, progress);
        assert_eq!(restored.finished_count(), 2);
    }

    #[test]
    fn test_from_parts_rejects_bad_records() {
        assert!(SegmentProgress::from_parts(65, vec![0]).is_err());
        assert!(SegmentProgress::from_parts(3, vec![0b1000]).is_err());
        assert!(SegmentProgress::from_parts(3, vec![0b111]).unwrap().is_finished());

        let bad = r#"{"segment_count":2,"segments":[4]}"#;
        assert!(serde_json::from_str::<SegmentProgress>(bad).is_err());
    }

    #[test]
    fn test_indicator_changes_on_mark() {
        let mut progress = SegmentProgress::new(100);
        let before = progress.progress_indicator();
        progress.mark_segment_finished(70).unwrap();
        assert_ne!(before, progress.progress_indicator());
    }

    #[test]
    fn test_indicator_changes_for_every_segment() {
        for count in [1, 63, 64, 128, 200, crate::cache::DEFAULT_SEGMENT_COUNT] {
            let mut progress = SegmentProgress::new(count);
            let mut seen = HashSet::from([progress.progress_indicator()]);
            for index in (0..count).rev() {
                let before = progress.progress_indicator();
                progress.mark_segment_finished(index).unwrap();
                let after = progress.progress_indicator();
                assert_ne!(before, after, "segment {} of {} went unnoticed", index, count);
                assert!(seen.insert(after), "segment {} of {} repeated an indicator", index, count);
            }
        }
    }

    #[test]
    fn test_indicator_depends_on_segment_count() {
        assert_ne!(
            SegmentProgress::new(10).progress_indicator(),
            SegmentProgress::new(20).progress_indicator()
        );
    }
}
