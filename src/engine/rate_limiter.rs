//! Call pacing shared by every pipeline that talks to the same account.
//!
//! Two rules: consecutive calls are at least `min_spacing` apart, and a
//! server-issued cooldown blocks everyone until it expires. Waiters are served
//! in arrival order.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct RateLimitState {
    last_call: Option<Instant>,
    cooldown_until: Option<Instant>,
}

impl RateLimitState {
    fn ready_at(&self, min_spacing: Duration, now: Instant) -> Instant {
        let spaced = self
            .last_call
            .map(|last| last + min_spacing)
            .unwrap_or(now);
        match self.cooldown_until {
            Some(until) if until > spaced => until,
            _ => spaced,
        }
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    min_spacing: Duration,
    state: Mutex<RateLimitState>,
    // tokio's Mutex queues lockers FIFO, which gives arrival-order release.
    queue: tokio::sync::Mutex<()>,
}

impl RateLimiter {
    pub fn new(min_spacing: Duration) -> Self {
        Self {
            min_spacing,
            state: Mutex::new(RateLimitState::default()),
            queue: tokio::sync::Mutex::new(()),
        }
    }

    pub fn min_spacing(&self) -> Duration {
        self.min_spacing
    }

    fn state(&self) -> MutexGuard<'_, RateLimitState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Wait until the next call may go out, then claim the slot.
    ///
    /// Returns `Error::Cancelled` as soon as `cancel` fires.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let _turn = tokio::select! {
            guard = self.queue.lock() => guard,
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };

        loop {
            let ready_at = {
                let mut state = self.state();
                let now = Instant::now();
                let ready_at = state.ready_at(self.min_spacing, now);
                if ready_at <= now {
                    state.last_call = Some(now);
                    return Ok(());
                }
                ready_at
            };

            debug!(
                wait_ms = ready_at.saturating_duration_since(Instant::now()).as_millis() as u64,
                "rate limiter waiting"
            );

            // A cooldown that arrives while we sleep is picked up on the next pass.
            tokio::select! {
                _ = sleep_until(ready_at) => {}
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            }
        }
    }

    /// Record a server cooldown. Longer cooldowns extend, shorter ones are ignored.
    pub fn note_cooldown(&self, wait: Duration) {
        let until = Instant::now() + wait;
        let mut state = self.state();
        match state.cooldown_until {
            Some(current) if current >= until => {}
            _ => state.cooldown_until = Some(until),
        }
    }

    /// Time left on the active cooldown, if any.
    pub fn cooldown_remaining(&self) -> Option<Duration> {
        let state = self.state();
        state
            .cooldown_until
            .map(|until| until.saturating_duration_since(Instant::now()))
            .filter(|left| !left.is_zero())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn spacing_is_enforced_between_calls() {
        let limiter = RateLimiter::new(Duration::from_millis(500));
        let cancel = CancellationToken::new();
        let start = Instant::now();

        for _ in 0..5 {
            limiter.acquire(&cancel).await.unwrap();
        }

        assert!(start.elapsed() >= Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn first_call_is_immediate() {
        let limiter = RateLimiter::new(Duration::from_secs(10));
        let cancel = CancellationToken::new();
        let start = Instant::now();
        limiter.acquire(&cancel).await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(1));
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_blocks_next_acquire() {
        let limiter = RateLimiter::new(Duration::from_millis(100));
        let cancel = CancellationToken::new();

        limiter.acquire(&cancel).await.unwrap();
        limiter.note_cooldown(Duration::from_secs(30));

        let start = Instant::now();
        limiter.acquire(&cancel).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(30));
        assert!(limiter.cooldown_remaining().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn shorter_cooldown_never_shortens_active_one() {
        let limiter = RateLimiter::new(Duration::ZERO);
        let cancel = CancellationToken::new();

        limiter.note_cooldown(Duration::from_secs(30));
        limiter.note_cooldown(Duration::from_secs(5));

        let start = Instant::now();
        limiter.acquire(&cancel).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn longer_cooldown_extends_pending_wait() {
        let limiter = Arc::new(RateLimiter::new(Duration::ZERO));
        let cancel = CancellationToken::new();
        limiter.note_cooldown(Duration::from_secs(5));

        let waiter = {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let start = Instant::now();
                limiter.acquire(&cancel).await.unwrap();
                start.elapsed()
            })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        limiter.note_cooldown(Duration::from_secs(20));

        let waited = waiter.await.unwrap();
        assert!(waited >= Duration::from_secs(21), "{:?}", waited);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_cooldown() {
        let limiter = Arc::new(RateLimiter::new(Duration::ZERO));
        let cancel = CancellationToken::new();
        limiter.note_cooldown(Duration::from_secs(3600));

        let waiter = {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let start = Instant::now();
                let result = limiter.acquire(&cancel).await;
                (result, start.elapsed())
            })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();

        let (result, waited) = waiter.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(waited < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_are_released_in_arrival_order() {
        let limiter = Arc::new(RateLimiter::new(Duration::from_millis(200)));
        let cancel = CancellationToken::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();

        for idx in 0..4 {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                limiter.acquire(&cancel).await.unwrap();
                order.lock().unwrap().push(idx);
            }));
            // Let the task reach the queue before spawning the next one.
            tokio::task::yield_now().await;
        }

        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn pending_acquire_is_observable() {
        let limiter = RateLimiter::new(Duration::ZERO);
        let cancel = CancellationToken::new();
        limiter.note_cooldown(Duration::from_secs(60));

        let mut task = tokio_test::task::spawn(limiter.acquire(&cancel));
        tokio_test::assert_pending!(task.poll());
        cancel.cancel();
        let result = tokio_test::assert_ready!(task.poll());
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
