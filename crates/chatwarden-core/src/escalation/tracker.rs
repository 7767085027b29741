//! The escalation tracker task.
//!
//! All per-user history lives in one [`EscalationTracker`] task. Other
//! components reach it only through a [`TrackerHandle`]; requests are
//! handled one at a time in arrival order, so no locking is needed.
//! Decisions go out on an unbounded channel, which keeps violation intake
//! independent of how fast actions are carried out.

use std::collections::HashMap;

use chatwarden_types::WardenError;
use chatwarden_types::event::{Action, Decision, ModerationDecision};
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::history::HistoryStore;
use super::policy::{EscalationPolicy, note_for};
use super::{ViolationEvent, ViolationRecord};

enum TrackerRequest {
    Violation(ViolationEvent),
    History {
        user: String,
        reply: oneshot::Sender<Vec<ViolationRecord>>,
    },
}

#[derive(Debug, Default)]
struct UserState {
    history: Vec<ViolationRecord>,
    last_action: Option<Action>,
    last_action_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct TrackerHandle {
    tx: mpsc::Sender<TrackerRequest>,
}

impl TrackerHandle {
    /// Queue a violation. Waits only if the input queue is full.
    pub async fn report(&self, event: ViolationEvent) -> Result<(), WardenError> {
        self.tx
            .send(TrackerRequest::Violation(event))
            .await
            .map_err(|_| WardenError::Shutdown)
    }

    /// The user's records inside the window, oldest first.
    pub async fn history(&self, user: &str) -> Result<Vec<ViolationRecord>, WardenError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(TrackerRequest::History {
                user: user.to_owned(),
                reply,
            })
            .await
            .map_err(|_| WardenError::Shutdown)?;
        rx.await.map_err(|_| WardenError::Shutdown)
    }
}

/// Violations handled between sweeps of every user's history.
const SWEEP_EVERY: u64 = 256;

pub struct EscalationTracker {
    policy: EscalationPolicy,
    users: HashMap<String, UserState>,
    store: Option<HistoryStore>,
    handled: u64,
}

impl EscalationTracker {
    pub fn new(policy: EscalationPolicy) -> Self {
        Self {
            policy,
            users: HashMap::new(),
            store: None,
            handled: 0,
        }
    }

    /// Load history from `store` now and save back to it on shutdown.
    pub fn with_store(mut self, store: HistoryStore) -> Self {
        let cutoff = Utc::now() - self.policy.window();
        match store.load(cutoff) {
            Ok(records) => {
                for record in records {
                    self.insert(record);
                }
            }
            Err(e) => warn!(
                path = %store.path().display(),
                error = %e,
                "ignoring unreadable escalation history"
            ),
        }
        self.store = Some(store);
        self
    }

    fn insert(&mut self, record: ViolationRecord) {
        let state = self.users.entry(record.user.to_lowercase()).or_default();
        if record.action_taken.is_some() {
            state.last_action = record.action_taken;
            state.last_action_at = Some(record.timestamp);
        }
        state.history.push(record);
    }

    /// Start the task. It runs until every handle is dropped, then saves
    /// history if a store is attached.
    pub fn spawn(
        self,
        capacity: usize,
    ) -> (
        TrackerHandle,
        mpsc::UnboundedReceiver<Decision>,
        JoinHandle<()>,
    ) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(self.run(rx, out_tx));
        (TrackerHandle { tx }, out_rx, task)
    }

    async fn run(
        mut self,
        mut rx: mpsc::Receiver<TrackerRequest>,
        out: mpsc::UnboundedSender<Decision>,
    ) {
        debug!(users = self.users.len(), "escalation tracker started");
        while let Some(req) = rx.recv().await {
            match req {
                TrackerRequest::Violation(event) => {
                    self.handled += 1;
                    if self.handled % SWEEP_EVERY == 0 {
                        self.prune(Utc::now());
                    }
                    if let Some(decision) = self.handle_violation(event)
                        && out.send(decision).is_err()
                    {
                        warn!("decision receiver closed; action not carried out");
                    }
                }
                TrackerRequest::History { user, reply } => {
                    let records = self.recent(&user, Utc::now());
                    let _ = reply.send(records);
                }
            }
        }
        self.persist();
        debug!("escalation tracker stopped");
    }

    /// Apply policy to one violation and record the outcome.
    ///
    /// Returns `None` when policy chose leniency; the violation is still
    /// recorded.
    pub fn handle_violation(&mut self, event: ViolationEvent) -> Option<Decision> {
        let key = event.user.to_lowercase();
        let cutoff = event.observed_at - self.policy.window();
        let state = self.users.entry(key).or_default();
        state.history.retain(|r| r.timestamp > cutoff);

        let action = self.policy.decide(&event, &state.history);
        state.history.push(ViolationRecord {
            user: event.user.clone(),
            category: event.category,
            timestamp: event.observed_at,
            action_taken: action,
        });

        let Some(action) = action else {
            info!(
                user = %event.user,
                category = %event.category,
                prior = state.history.len() - 1,
                "violation recorded, no action"
            );
            return None;
        };
        state.last_action = Some(action);
        state.last_action_at = Some(event.observed_at);

        info!(
            user = %event.user,
            category = %event.category,
            message_id = %event.message_id,
            prior = state.history.len() - 1,
            %action,
            "escalation decided"
        );
        Some(Decision::Action(ModerationDecision {
            user: event.user,
            action,
            note: note_for(&action, event.category, &event.rationale),
        }))
    }

    fn recent(&self, user: &str, now: DateTime<Utc>) -> Vec<ViolationRecord> {
        let cutoff = now - self.policy.window();
        self.users
            .get(&user.to_lowercase())
            .map(|s| {
                s.history
                    .iter()
                    .filter(|r| r.timestamp > cutoff)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Last action issued to `user`, with when it was issued.
    pub fn last_action(&self, user: &str) -> Option<(Action, DateTime<Utc>)> {
        let state = self.users.get(&user.to_lowercase())?;
        Some((state.last_action?, state.last_action_at?))
    }

    /// Drop every record outside the window and forget users left with
    /// none. Returns how many users were forgotten.
    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.policy.window();
        let before = self.users.len();
        self.users.retain(|_, state| {
            state.history.retain(|r| r.timestamp > cutoff);
            !state.history.is_empty()
        });
        let forgotten = before - self.users.len();
        if forgotten > 0 {
            debug!(forgotten, remaining = self.users.len(), "pruned escalation history");
        }
        forgotten
    }

    /// Number of users with history in memory.
    pub fn tracked_users(&self) -> usize {
        self.users.len()
    }

    fn persist(&mut self) {
        if self.store.is_none() {
            return;
        }
        self.prune(Utc::now());
        let Some(store) = &self.store else {
            return;
        };
        let mut records: Vec<ViolationRecord> = self
            .users
            .values()
            .flat_map(|s| s.history.iter().cloned())
            .collect();
        records.sort_by_key(|r| r.timestamp);
        if let Err(e) = store.save(&records) {
            warn!(path = %store.path().display(), error = %e, "failed to save escalation history");
        }
    }
}

#[cfg(test)]
mod tests {
    use chatwarden_types::Category;
    use chatwarden_types::config::EscalationConfig;
    use chrono::Duration;

    use super::*;
    use crate::escalation::Severity;

    fn event(user: &str, category: Category, at: DateTime<Utc>) -> ViolationEvent {
        ViolationEvent {
            user: user.into(),
            category,
            severity: Severity::Normal,
            message_id: "m1".into(),
            rationale: "insult".into(),
            observed_at: at,
        }
    }

    fn tracker() -> EscalationTracker {
        EscalationTracker::new(EscalationPolicy::new(EscalationConfig::default()))
    }

    fn action(d: Option<Decision>) -> Action {
        match d {
            Some(Decision::Action(a)) => a.action,
            other => panic!("expected action, got {other:?}"),
        }
    }

    #[test]
    fn first_then_repeat_is_strictly_longer() {
        let mut t = tracker();
        let now = Utc::now();
        let first = action(t.handle_violation(event("alice", Category::Harassment, now)));
        assert_eq!(first, Action::Timeout { seconds: 30 });
        let second = action(t.handle_violation(event(
            "Alice",
            Category::Spam,
            now + Duration::days(3),
        )));
        assert_eq!(second, Action::Timeout { seconds: 1800 });
        assert_eq!(
            t.last_action("ALICE").map(|(a, _)| a),
            Some(Action::Timeout { seconds: 1800 })
        );
    }

    #[test]
    fn history_outside_window_is_ignored() {
        let mut t = tracker();
        let then = Utc::now() - Duration::days(31);
        t.handle_violation(event("alice", Category::Harassment, then));
        let again = action(t.handle_violation(event("alice", Category::Harassment, Utc::now())));
        assert_eq!(again, Action::Timeout { seconds: 30 });
    }

    #[test]
    fn zero_tolerance_bans_regardless() {
        let mut t = tracker();
        let d = t.handle_violation(event("bob", Category::Doxxing, Utc::now()));
        match d {
            Some(Decision::Action(a)) => {
                assert_eq!(a.action, Action::Ban);
                assert_eq!(a.user, "bob");
                assert!(a.note.contains("DOXXING"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn users_are_independent() {
        let mut t = tracker();
        let now = Utc::now();
        t.handle_violation(event("alice", Category::Spam, now));
        let bob = action(t.handle_violation(event("bob", Category::Spam, now)));
        assert_eq!(bob, Action::Timeout { seconds: 30 });
    }

    #[tokio::test]
    async fn actor_emits_decisions_in_order_and_answers_history() {
        let (handle, mut out, task) = tracker().spawn(8);
        let now = Utc::now();
        handle
            .report(event("alice", Category::Harassment, now))
            .await
            .unwrap();
        handle
            .report(event("alice", Category::Harassment, now + Duration::seconds(5)))
            .await
            .unwrap();

        let first = out.recv().await.unwrap();
        let second = out.recv().await.unwrap();
        assert!(matches!(first, Decision::Action(ref a) if a.action == Action::Timeout { seconds: 30 }));
        assert!(matches!(second, Decision::Action(ref a) if a.action == Action::Timeout { seconds: 1800 }));

        assert_eq!(handle.history("alice").await.unwrap().len(), 2);
        drop(handle);
        task.await.unwrap();
        assert!(out.recv().await.is_none());
    }

    #[test]
    fn prune_forgets_users_who_never_return() {
        let mut t = tracker();
        let now = Utc::now();
        t.handle_violation(event("old", Category::Spam, now - Duration::days(40)));
        t.handle_violation(event("mixed", Category::Spam, now - Duration::days(35)));
        t.handle_violation(event("mixed", Category::Spam, now - Duration::days(2)));
        t.handle_violation(event("fresh", Category::Spam, now));
        assert_eq!(t.tracked_users(), 3);

        assert_eq!(t.prune(now), 1);
        assert_eq!(t.tracked_users(), 2);
        assert!(t.last_action("old").is_none());
        assert_eq!(t.recent("mixed", now).len(), 1);
    }

    #[tokio::test]
    async fn snapshot_leaves_out_expired_history() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        let mut t = tracker().with_store(HistoryStore::new(&path));
        t.handle_violation(event("gone", Category::Spam, Utc::now() - Duration::days(45)));
        t.handle_violation(event("kept", Category::Spam, Utc::now()));
        let (handle, _out, task) = t.spawn(8);
        drop(handle);
        task.await.unwrap();

        let saved = std::fs::read_to_string(&path).unwrap();
        assert!(saved.contains("kept"));
        assert!(!saved.contains("gone"));
    }

    #[tokio::test]
    async fn history_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");

        let (handle, _out, task) = tracker().with_store(HistoryStore::new(&path)).spawn(8);
        handle
            .report(event("alice", Category::Harassment, Utc::now()))
            .await
            .unwrap();
        drop(handle);
        task.await.unwrap();

        let mut restarted = tracker().with_store(HistoryStore::new(&path));
        let next = action(restarted.handle_violation(event(
            "alice",
            Category::Harassment,
            Utc::now(),
        )));
        assert_eq!(next, Action::Timeout { seconds: 1800 });
    }
}
