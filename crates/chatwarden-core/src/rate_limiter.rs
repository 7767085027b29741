//! Rolling per-minute token budget for classification calls.
//!
//! [`TokenBudget`] is a sliding-window ledger: every admitted call is
//! recorded with its timestamp, and an entry stops counting exactly one
//! window after it was admitted. Capacity is therefore credited back
//! continuously rather than reset at minute boundaries.
//!
//! The budget is owned by a single [`RateLimiter`] task. Callers talk to it
//! through a cloneable [`RateLimiterHandle`]; waiting callers are admitted
//! in FIFO order.

use std::collections::VecDeque;
use std::time::Duration;

use chatwarden_types::WardenError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Length of the rolling window.
pub const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
struct Entry {
    at: Instant,
    id: u64,
    tokens: u64,
}

/// Sliding-window token ledger. Pure state; the caller supplies `now`.
#[derive(Debug)]
pub struct TokenBudget {
    capacity: u64,
    window: Duration,
    ledger: VecDeque<Entry>,
    next_id: u64,
}

impl TokenBudget {
    pub fn new(capacity_per_minute: u32) -> Self {
        Self::with_window(capacity_per_minute, WINDOW)
    }

    pub fn with_window(capacity: u32, window: Duration) -> Self {
        Self {
            capacity: u64::from(capacity.max(1)),
            window,
            ledger: VecDeque::new(),
            next_id: 1,
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    fn prune(&mut self, now: Instant) {
        while let Some(e) = self.ledger.front() {
            if now.saturating_duration_since(e.at) >= self.window {
                self.ledger.pop_front();
            } else {
                break;
            }
        }
    }

    /// Tokens charged inside the window ending at `now`.
    pub fn consumed(&mut self, now: Instant) -> u64 {
        self.prune(now);
        self.ledger.iter().map(|e| e.tokens).sum()
    }

    /// Charge `tokens` if they fit. A request larger than the whole
    /// capacity fits only when nothing else is in the window.
    pub fn try_admit(&mut self, now: Instant, tokens: u32) -> Option<u64> {
        let tokens = u64::from(tokens);
        let used = self.consumed(now);
        if !self.ledger.is_empty() && used + tokens > self.capacity {
            return None;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.ledger.push_back(Entry { at: now, id, tokens });
        Some(id)
    }

    /// Earliest instant at which `tokens` would be admitted, assuming no
    /// other admissions. `None` means "now".
    pub fn next_admission(&mut self, now: Instant, tokens: u32) -> Option<Instant> {
        let tokens = u64::from(tokens);
        let mut used = self.consumed(now);
        if self.ledger.is_empty() || used + tokens <= self.capacity {
            return None;
        }
        for (i, e) in self.ledger.iter().enumerate() {
            used -= e.tokens;
            let empty = i + 1 == self.ledger.len();
            if empty || used + tokens <= self.capacity {
                return Some(e.at + self.window);
            }
        }
        None
    }

    /// Replace an admitted estimate with the actual cost.
    pub fn reconcile(&mut self, id: u64, actual: u32) {
        if let Some(e) = self.ledger.iter_mut().find(|e| e.id == id) {
            e.tokens = u64::from(actual);
        }
    }

    /// Forget an admission that was never used.
    pub fn revoke(&mut self, id: u64) {
        self.ledger.retain(|e| e.id != id);
    }
}

/// Proof of admission, returned to [`RateLimiterHandle::release_unused`].
#[derive(Debug)]
pub struct Permit {
    id: u64,
    tokens: u32,
}

impl Permit {
    pub fn tokens(&self) -> u32 {
        self.tokens
    }
}

enum Request {
    Acquire {
        tokens: u32,
        reply: oneshot::Sender<Permit>,
    },
    Reconcile {
        id: u64,
        actual: u32,
    },
}

/// Cloneable front-end to the limiter task.
#[derive(Clone)]
pub struct RateLimiterHandle {
    tx: mpsc::Sender<Request>,
    cancel: CancellationToken,
}

impl RateLimiterHandle {
    /// Wait until `tokens` fit in the budget, then reserve them.
    ///
    /// Returns [`WardenError::Shutdown`] if the limiter stops first.
    pub async fn acquire(&self, tokens: u32) -> Result<Permit, WardenError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request::Acquire { tokens, reply })
            .await
            .map_err(|_| WardenError::Shutdown)?;
        tokio::select! {
            permit = rx => permit.map_err(|_| WardenError::Shutdown),
            _ = self.cancel.cancelled() => Err(WardenError::Shutdown),
        }
    }

    /// Correct the charge for a permit once the real cost is known.
    /// Without a reported cost the estimate stands.
    pub async fn release_unused(&self, permit: Permit, actual_tokens: Option<u32>) {
        let Some(actual) = actual_tokens else {
            return;
        };
        if actual == permit.tokens {
            return;
        }
        let _ = self
            .tx
            .send(Request::Reconcile {
                id: permit.id,
                actual,
            })
            .await;
    }
}

/// The task owning the [`TokenBudget`].
pub struct RateLimiter {
    budget: TokenBudget,
    rx: mpsc::Receiver<Request>,
    pending: VecDeque<(u32, oneshot::Sender<Permit>)>,
    cancel: CancellationToken,
}

impl RateLimiter {
    /// Start a limiter task. It stops when `cancel` fires or every handle
    /// is dropped.
    pub fn spawn(
        budget: TokenBudget,
        cancel: CancellationToken,
    ) -> (RateLimiterHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(64);
        let limiter = RateLimiter {
            budget,
            rx,
            pending: VecDeque::new(),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(limiter.run());
        (RateLimiterHandle { tx, cancel }, task)
    }

    async fn run(mut self) {
        debug!(capacity = self.budget.capacity(), "rate limiter started");
        loop {
            let wake = self.admit_waiting();
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                req = self.rx.recv() => match req {
                    Some(Request::Acquire { tokens, reply }) => {
                        self.pending.push_back((tokens, reply));
                    }
                    Some(Request::Reconcile { id, actual }) => {
                        trace!(id, actual, "reconciling token charge");
                        self.budget.reconcile(id, actual);
                    }
                    None => break,
                },
                _ = sleep_until_opt(wake), if wake.is_some() => {}
            }
        }
        debug!(waiting = self.pending.len(), "rate limiter stopped");
    }

    /// Admit waiting callers in order; return when to try again.
    fn admit_waiting(&mut self) -> Option<Instant> {
        loop {
            let (tokens, _) = self.pending.front()?;
            let tokens = *tokens;
            let now = Instant::now();
            match self.budget.try_admit(now, tokens) {
                Some(id) => {
                    let Some((_, reply)) = self.pending.pop_front() else {
                        return None;
                    };
                    if reply.send(Permit { id, tokens }).is_err() {
                        // The caller gave up while waiting.
                        self.budget.revoke(id);
                    } else {
                        trace!(id, tokens, "tokens admitted");
                    }
                }
                None => {
                    let at = self
                        .budget
                        .next_admission(now, tokens)
                        .unwrap_or(now + Duration::from_millis(10));
                    debug!(
                        tokens,
                        wait_ms = at.saturating_duration_since(now).as_millis() as u64,
                        "token budget exhausted, waiting"
                    );
                    return Some(at);
                }
            }
        }
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── Ledger ──────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn admits_until_capacity() {
        let mut b = TokenBudget::new(100);
        let now = Instant::now();
        assert!(b.try_admit(now, 60).is_some());
        assert!(b.try_admit(now, 40).is_some());
        assert!(b.try_admit(now, 1).is_none());
        assert_eq!(b.consumed(now), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn credit_returns_continuously() {
        let mut b = TokenBudget::new(100);
        let t0 = Instant::now();
        b.try_admit(t0, 50).unwrap();
        b.try_admit(t0 + Duration::from_secs(30), 50).unwrap();

        let t1 = t0 + Duration::from_secs(59);
        assert!(b.try_admit(t1, 10).is_none());
        assert_eq!(b.next_admission(t1, 10), Some(t0 + WINDOW));

        // The first entry ages out; the second still counts.
        let t2 = t0 + WINDOW;
        assert_eq!(b.consumed(t2), 50);
        assert!(b.try_admit(t2, 50).is_some());
        assert!(b.try_admit(t2, 1).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn oversize_request_waits_for_empty_window() {
        let mut b = TokenBudget::new(100);
        let t0 = Instant::now();
        b.try_admit(t0, 10).unwrap();
        assert!(b.try_admit(t0, 500).is_none());
        assert_eq!(b.next_admission(t0, 500), Some(t0 + WINDOW));
        assert!(b.try_admit(t0 + WINDOW, 500).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn reconcile_and_revoke_adjust_charge() {
        let mut b = TokenBudget::new(100);
        let now = Instant::now();
        let id = b.try_admit(now, 80).unwrap();
        b.reconcile(id, 20);
        assert_eq!(b.consumed(now), 20);
        assert!(b.try_admit(now, 80).is_some());
        b.revoke(id);
        assert_eq!(b.consumed(now), 80);
    }

    #[tokio::test(start_paused = true)]
    async fn window_sum_never_exceeds_capacity() {
        let mut b = TokenBudget::new(1000);
        let start = Instant::now();
        let mut admitted: Vec<(Instant, u64)> = Vec::new();
        for step in 0..600u64 {
            let now = start + Duration::from_millis(step * 500);
            let tokens = 37 + (step * 53 % 211) as u32;
            if b.try_admit(now, tokens).is_some() {
                admitted.push((now, u64::from(tokens)));
            }
            let in_window: u64 = admitted
                .iter()
                .filter(|(at, _)| now.saturating_duration_since(*at) < WINDOW)
                .map(|(_, t)| t)
                .sum();
            assert!(in_window <= 1000, "step {step}: {in_window}");
        }
    }

    // ── Actor ───────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn acquire_waits_for_budget() {
        let cancel = CancellationToken::new();
        let (handle, _task) = RateLimiter::spawn(TokenBudget::new(100), cancel.clone());

        let first = handle.acquire(80).await.unwrap();
        assert_eq!(first.tokens(), 80);

        let h = handle.clone();
        let waiter = tokio::spawn(async move { h.acquire(50).await });
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!waiter.is_finished());

        tokio::time::sleep(Duration::from_secs(31)).await;
        let second = waiter.await.unwrap().unwrap();
        assert_eq!(second.tokens(), 50);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn reported_usage_frees_budget() {
        let cancel = CancellationToken::new();
        let (handle, _task) = RateLimiter::spawn(TokenBudget::new(100), cancel.clone());

        let permit = handle.acquire(90).await.unwrap();
        handle.release_unused(permit, Some(10)).await;
        let next = tokio::time::timeout(Duration::from_secs(1), handle.acquire(80)).await;
        assert!(next.is_ok());
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_unblocks_waiters() {
        let cancel = CancellationToken::new();
        let (handle, task) = RateLimiter::spawn(TokenBudget::new(10), cancel.clone());
        handle.acquire(10).await.unwrap();

        let h = handle.clone();
        let waiter = tokio::spawn(async move { h.acquire(10).await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();

        assert!(matches!(
            waiter.await.unwrap(),
            Err(WardenError::Shutdown)
        ));
        task.await.unwrap();
    }
}
