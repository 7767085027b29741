//! Pipeline counters and the shutdown loss report.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

/// How many not-moderated message ids the report keeps.
pub const SAMPLE_SIZE: usize = 10;

#[derive(Debug, Default)]
pub struct PipelineStats {
    received: AtomicU64,
    moderated: AtomicU64,
    not_moderated: AtomicU64,
    flagged: AtomicU64,
    batches: AtomicU64,
    batches_dropped: AtomicU64,
    actions_sent: AtomicU64,
    actions_failed: AtomicU64,
    sample: Mutex<Vec<String>>,
}

impl PipelineStats {
    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_moderated(&self, messages: usize) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.add_moderated(messages);
    }

    /// Count messages classified as part of a batch that was otherwise lost.
    pub fn add_moderated(&self, messages: usize) {
        self.moderated.fetch_add(messages as u64, Ordering::Relaxed);
    }

    /// Count a dropped batch and remember a few of its ids.
    pub fn record_batch_dropped<'a>(&self, ids: impl IntoIterator<Item = &'a str>) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.batches_dropped.fetch_add(1, Ordering::Relaxed);
        self.record_not_moderated(ids);
    }

    pub fn record_not_moderated<'a>(&self, ids: impl IntoIterator<Item = &'a str>) {
        let mut sample = self.sample.lock();
        for id in ids {
            self.not_moderated.fetch_add(1, Ordering::Relaxed);
            if sample.len() < SAMPLE_SIZE {
                sample.push(id.to_owned());
            }
        }
    }

    pub fn record_flagged(&self) {
        self.flagged.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_action(&self, delivered: bool) {
        let counter = if delivered {
            &self.actions_sent
        } else {
            &self.actions_failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn report(&self) -> PipelineReport {
        PipelineReport {
            received: self.received.load(Ordering::Relaxed),
            moderated: self.moderated.load(Ordering::Relaxed),
            not_moderated: self.not_moderated.load(Ordering::Relaxed),
            flagged: self.flagged.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            batches_dropped: self.batches_dropped.load(Ordering::Relaxed),
            actions_sent: self.actions_sent.load(Ordering::Relaxed),
            actions_failed: self.actions_failed.load(Ordering::Relaxed),
            not_moderated_sample: self.sample.lock().clone(),
        }
    }
}

/// Snapshot of the counters, returned when the pipeline stops.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineReport {
    pub received: u64,
    pub moderated: u64,
    pub not_moderated: u64,
    pub flagged: u64,
    pub batches: u64,
    pub batches_dropped: u64,
    pub actions_sent: u64,
    pub actions_failed: u64,
    /// Up to [`SAMPLE_SIZE`] ids of messages that were never classified.
    pub not_moderated_sample: Vec<String>,
}

impl fmt::Display for PipelineReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} received, {} moderated, {} not moderated ({} of {} batches dropped), \
             {} flagged, {} actions sent, {} failed",
            self.received,
            self.moderated,
            self.not_moderated,
            self.batches_dropped,
            self.batches,
            self.flagged,
            self.actions_sent,
            self.actions_failed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_is_capped() {
        let stats = PipelineStats::default();
        let ids: Vec<String> = (0..25).map(|i| format!("m{i}")).collect();
        stats.record_batch_dropped(ids.iter().map(String::as_str));
        let report = stats.report();
        assert_eq!(report.not_moderated, 25);
        assert_eq!(report.not_moderated_sample.len(), SAMPLE_SIZE);
        assert_eq!(report.not_moderated_sample[0], "m0");
        assert_eq!(report.batches_dropped, 1);
    }

    #[test]
    fn display_summarizes() {
        let stats = PipelineStats::default();
        stats.record_received();
        stats.record_moderated(1);
        stats.record_action(true);
        let text = stats.report().to_string();
        assert!(text.starts_with("1 received, 1 moderated, 0 not moderated"));
    }
}
