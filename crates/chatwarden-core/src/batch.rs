//! Time and size bounded batching of chat messages.
//!
//! [`BatchCollector`] is plain state plus a [`Clock`]; it does no I/O.
//! A batch closes when:
//!
//! - `interval` has elapsed since its first message (checked by [`poll`]),
//! - adding the next message would push the estimated size past
//!   `max_size` (the triggering message opens the next batch), or
//! - it already holds `max_messages` messages.
//!
//! The size estimate is the sum of each message's serialized length plus a
//! fixed envelope reserve, kept up to date as messages arrive.
//!
//! [`poll`]: BatchCollector::poll

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use chatwarden_llm::payload::{ENVELOPE_RESERVE, message_size};
use chatwarden_types::config::PipelineConfig;
use chatwarden_types::event::{Batch, ChatMessage};
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};

/// What happened to a submitted message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submitted {
    /// Added to the open batch.
    Added,
    /// Added to a fresh batch; the previous one is ready for [`BatchCollector::poll`].
    Rolled,
    /// Larger than a batch may ever be; discarded.
    Oversize { message_id: String, size: usize },
}

#[derive(Debug)]
struct OpenBatch {
    messages: Vec<ChatMessage>,
    opened_at: Instant,
    size: usize,
}

pub struct BatchCollector<C: Clock = SystemClock> {
    clock: C,
    interval: Duration,
    max_size: usize,
    max_messages: usize,
    open: Option<OpenBatch>,
    ready: VecDeque<Batch>,
    next_seq: u64,
}

impl BatchCollector<SystemClock> {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            SystemClock,
            config.batch_interval(),
            config.max_content_size,
            config.max_batch_messages,
        )
    }
}

impl<C: Clock> BatchCollector<C> {
    pub fn new(clock: C, interval: Duration, max_size: usize, max_messages: usize) -> Self {
        Self {
            clock,
            interval,
            max_size,
            max_messages: max_messages.max(1),
            open: None,
            ready: VecDeque::new(),
            next_seq: 1,
        }
    }

    pub fn submit(&mut self, msg: ChatMessage) -> Submitted {
        let size = message_size(&msg);
        if ENVELOPE_RESERVE + size > self.max_size {
            warn!(
                message_id = %msg.id,
                user = %msg.user,
                size,
                max = self.max_size,
                "message too large to classify, dropping"
            );
            return Submitted::Oversize {
                message_id: msg.id,
                size,
            };
        }

        let mut rolled = false;
        if let Some(open) = &self.open
            && (open.size + size > self.max_size || open.messages.len() >= self.max_messages)
        {
            self.close();
            rolled = true;
        }

        let now = self.clock.now();
        let open = self.open.get_or_insert_with(|| OpenBatch {
            messages: Vec::new(),
            opened_at: now,
            size: ENVELOPE_RESERVE,
        });
        open.messages.push(msg);
        open.size += size;

        if rolled {
            Submitted::Rolled
        } else {
            Submitted::Added
        }
    }

    /// Take the next closed batch, closing the open one if its interval is up.
    pub fn poll(&mut self) -> Option<Batch> {
        if self.ready.is_empty()
            && let Some(open) = &self.open
            && self.clock.now().saturating_duration_since(open.opened_at) >= self.interval
        {
            self.close();
        }
        self.ready.pop_front()
    }

    /// When the open batch's interval runs out, if there is one.
    pub fn next_deadline(&self) -> Option<Instant> {
        if !self.ready.is_empty() {
            return Some(self.clock.now());
        }
        self.open.as_ref().map(|o| o.opened_at + self.interval)
    }

    /// Close everything, including the open batch. Used on shutdown.
    pub fn drain(&mut self) -> Vec<Batch> {
        self.close();
        self.ready.drain(..).collect()
    }

    /// Messages not yet handed out.
    pub fn pending(&self) -> usize {
        self.ready.iter().map(Batch::len).sum::<usize>()
            + self.open.as_ref().map_or(0, |o| o.messages.len())
    }

    fn close(&mut self) {
        let Some(open) = self.open.take() else {
            return;
        };
        if open.messages.is_empty() {
            return;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        debug!(
            batch = seq,
            messages = open.messages.len(),
            estimated_size = open.size,
            "batch closed"
        );
        self.ready
            .push_back(Batch::new(seq, open.messages, open.opened_at, open.size));
    }
}

/// Split a batch into two halves with fresh size estimates.
///
/// Returns `None` for batches of fewer than two messages.
pub fn split_batch(batch: Batch) -> Option<(Batch, Batch)> {
    if batch.len() < 2 {
        return None;
    }
    let seq = batch.seq();
    let opened_at = batch.opened_at();
    let mut first = batch.into_messages();
    let second = first.split_off(first.len() / 2);
    let sized = |msgs: Vec<ChatMessage>| {
        let size = ENVELOPE_RESERVE + msgs.iter().map(message_size).sum::<usize>();
        Batch::new(seq, msgs, opened_at, size)
    };
    Some((sized(first), sized(second)))
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeSet, HashMap};

    use chrono::Utc;

    use super::*;
    use crate::clock::ManualClock;

    fn msg(id: &str, text: &str) -> ChatMessage {
        ChatMessage {
            id: id.into(),
            user: "alice".into(),
            text: text.into(),
            timestamp: Utc::now(),
            badges: BTreeSet::new(),
            tags: HashMap::new(),
        }
    }

    fn collector(clock: &ManualClock, max_size: usize) -> BatchCollector<ManualClock> {
        BatchCollector::new(clock.clone(), Duration::from_secs(2), max_size, 500)
    }

    fn ids(batch: &Batch) -> Vec<&str> {
        batch.message_ids().collect()
    }

    #[test]
    fn nothing_before_interval_then_one_batch_in_order() {
        let clock = ManualClock::new();
        let mut c = collector(&clock, 256_000);
        for id in ["m1", "m2", "m3"] {
            assert_eq!(c.submit(msg(id, "hello")), Submitted::Added);
            clock.advance(Duration::from_millis(500));
            assert!(c.poll().is_none());
        }
        clock.advance(Duration::from_millis(500));
        let batch = c.poll().unwrap();
        assert_eq!(ids(&batch), vec!["m1", "m2", "m3"]);
        assert!(c.poll().is_none());
    }

    #[test]
    fn empty_interval_yields_nothing() {
        let clock = ManualClock::new();
        let mut c = collector(&clock, 256_000);
        clock.advance(Duration::from_secs(10));
        assert!(c.poll().is_none());
        assert!(c.next_deadline().is_none());
    }

    #[test]
    fn size_trigger_rolls_to_new_batch() {
        let clock = ManualClock::new();
        let one = message_size(&msg("m1", &"x".repeat(100)));
        let mut c = collector(&clock, ENVELOPE_RESERVE + one * 2);

        assert_eq!(c.submit(msg("m1", &"x".repeat(100))), Submitted::Added);
        assert_eq!(c.submit(msg("m2", &"x".repeat(100))), Submitted::Added);
        assert_eq!(c.submit(msg("m3", &"x".repeat(100))), Submitted::Rolled);

        let first = c.poll().unwrap();
        assert_eq!(ids(&first), vec!["m1", "m2"]);
        assert!(first.estimated_size() <= ENVELOPE_RESERVE + one * 2);
        assert!(c.poll().is_none());
        assert_eq!(c.pending(), 1);

        clock.advance(Duration::from_secs(2));
        assert_eq!(ids(&c.poll().unwrap()), vec!["m3"]);
    }

    #[test]
    fn message_cap_closes_batch() {
        let clock = ManualClock::new();
        let mut c = BatchCollector::new(clock.clone(), Duration::from_secs(2), 256_000, 2);
        c.submit(msg("m1", "a"));
        c.submit(msg("m2", "b"));
        assert_eq!(c.submit(msg("m3", "c")), Submitted::Rolled);
        assert_eq!(c.poll().unwrap().len(), 2);
    }

    #[test]
    fn oversize_message_dropped() {
        let clock = ManualClock::new();
        let mut c = collector(&clock, ENVELOPE_RESERVE + 64);
        match c.submit(msg("big", &"y".repeat(500))) {
            Submitted::Oversize { message_id, .. } => assert_eq!(message_id, "big"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(c.pending(), 0);
    }

    #[test]
    fn sequence_numbers_increase() {
        let clock = ManualClock::new();
        let mut c = collector(&clock, 256_000);
        c.submit(msg("m1", "a"));
        clock.advance(Duration::from_secs(2));
        let a = c.poll().unwrap();
        c.submit(msg("m2", "b"));
        clock.advance(Duration::from_secs(2));
        let b = c.poll().unwrap();
        assert!(b.seq() > a.seq());
    }

    #[test]
    fn drain_flushes_open_batch() {
        let clock = ManualClock::new();
        let mut c = collector(&clock, 256_000);
        c.submit(msg("m1", "a"));
        let drained = c.drain();
        assert_eq!(drained.len(), 1);
        assert!(c.drain().is_empty());
    }

    #[test]
    fn deadline_tracks_open_batch() {
        let clock = ManualClock::new();
        let mut c = collector(&clock, 256_000);
        let start = clock.now();
        c.submit(msg("m1", "a"));
        assert_eq!(c.next_deadline(), Some(start + Duration::from_secs(2)));
    }

    #[test]
    fn split_halves_keep_order() {
        let msgs = vec![msg("m1", "a"), msg("m2", "b"), msg("m3", "c")];
        let batch = Batch::new(7, msgs, Instant::now(), 0);
        let (a, b) = split_batch(batch).unwrap();
        assert_eq!(ids(&a), vec!["m1"]);
        assert_eq!(ids(&b), vec!["m2", "m3"]);
        assert_eq!(a.seq(), 7);
        assert!(b.estimated_size() > ENVELOPE_RESERVE);
        assert!(split_batch(a).is_none());
    }
}
