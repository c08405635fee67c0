use chrono::{DateTime, Utc};
use serde::Serialize;
use smallvec::SmallVec;
use std::collections::VecDeque;

use crate::machine::stimulus::{Stimulus, StimulusId};
use crate::machine::task::TaskKey;

/// One processed stimulus: (sequence, kind, keys, stimulus id, timestamp).
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub seq: u64,
    pub kind: &'static str,
    pub keys: SmallVec<[TaskKey; 2]>,
    pub stimulus: StimulusId,
    pub at: DateTime<Utc>,
}

/// Append-only, strictly ordered record of every stimulus the state machine
/// has processed. Entries are never mutated; the only removal is trimming
/// from the head under the retention bound, preserving order.
#[derive(Debug)]
pub struct StimulusLog {
    entries: VecDeque<LogEntry>,
    next_seq: u64,
    retention: usize,
}

impl StimulusLog {
    pub fn new(retention: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            next_seq: 0,
            retention,
        }
    }

    /// Record a stimulus. Called before the transition is applied so a
    /// failing stimulus is still visible to postmortem tooling.
    pub fn append(&mut self, stimulus: &Stimulus) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push_back(LogEntry {
            seq,
            kind: stimulus.payload.kind(),
            keys: SmallVec::from_vec(stimulus.payload.keys()),
            stimulus: stimulus.id,
            at: stimulus.received_at,
        });
        while self.entries.len() > self.retention {
            self.entries.pop_front();
        }
        seq
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total stimuli ever appended, including trimmed ones.
    pub fn appended(&self) -> u64 {
        self.next_seq
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    /// The retained entries touching `key`, in processing order. The
    /// first tool to reach for when untangling a distributed race.
    pub fn story(&self, key: &str) -> Vec<&LogEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.keys.iter().any(|k| k == key))
            .collect()
    }

    // Validator access: sequence numbers strictly increasing, timestamps
    // non-decreasing.
    pub(crate) fn audit(&self) -> Option<String> {
        let mut previous: Option<&LogEntry> = None;
        for entry in &self.entries {
            if let Some(prev) = previous {
                if entry.seq <= prev.seq {
                    return Some(format!(
                        "sequence regressed: {} after {}",
                        entry.seq, prev.seq
                    ));
                }
                if entry.at < prev.at {
                    return Some(format!(
                        "timestamp regressed at seq {}: {} after {}",
                        entry.seq, entry.at, prev.at
                    ));
                }
            }
            previous = Some(entry);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::stimulus::StimulusPayload;

    #[test]
    fn test_append_assigns_monotonic_seq() {
        let mut log = StimulusLog::new(10);
        let a = log.append(&Stimulus::new(StimulusPayload::Pause));
        let b = log.append(&Stimulus::new(StimulusPayload::Resume));
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert!(log.audit().is_none());
    }

    #[test]
    fn test_retention_trims_from_head() {
        let mut log = StimulusLog::new(3);
        for i in 0..5 {
            log.append(&Stimulus::new(StimulusPayload::ReleaseKey {
                key: format!("t{i}"),
            }));
        }
        assert_eq!(log.len(), 3);
        assert_eq!(log.appended(), 5);
        // Oldest entries went first; order preserved.
        let seqs: Vec<u64> = log.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![2, 3, 4]);
    }

    #[test]
    fn test_story_filters_by_key() {
        let mut log = StimulusLog::new(10);
        log.append(&Stimulus::new(StimulusPayload::ReleaseKey {
            key: "a".into(),
        }));
        log.append(&Stimulus::new(StimulusPayload::ReleaseKey {
            key: "b".into(),
        }));
        log.append(&Stimulus::new(StimulusPayload::Secede { key: "a".into() }));

        let story = log.story("a");
        assert_eq!(story.len(), 2);
        assert_eq!(story[0].kind, "release-task");
        assert_eq!(story[1].kind, "secede-to-long-running");
    }
}
