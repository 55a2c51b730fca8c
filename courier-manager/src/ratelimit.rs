//! Process-global dispatch rate control.
//!
//! Two caps, composable:
//! - a fixed per-second cap: at most `message_rate` grants per wall-clock
//!   second, with excess waiters sleeping to the next window boundary;
//! - an optional sliding-window cap: at most `sliding_window_rate` grants in
//!   any rolling `sliding_window_duration`.
//!
//! The state is a lock-guarded window record, not a sleep-poll loop: a
//! waiter computes exactly how long until the next grant can possibly
//! succeed and sleeps once, re-checking on wake. A token is committed only
//! when both caps admit it, so a waiter cancelled mid-wait has consumed
//! nothing.

use std::{collections::VecDeque, time::Duration};

use courier_common::Config;
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const WINDOW: Duration = Duration::from_secs(1);

/// The wait was aborted by shutdown; no token was consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

#[derive(Debug)]
struct SlidingLimit {
    rate: usize,
    duration: Duration,
}

#[derive(Debug)]
struct State {
    window_start: Instant,
    granted: usize,
    /// Grant instants of the last `sliding.rate` dispatches, oldest first.
    recent: VecDeque<Instant>,
}

/// Shared limiter all workers draw tokens from.
#[derive(Debug)]
pub struct RateLimiter {
    rate: usize,
    sliding: Option<SlidingLimit>,
    state: Mutex<State>,
}

impl RateLimiter {
    pub fn new(config: &Config) -> Self {
        let sliding = config.sliding_window.then(|| SlidingLimit {
            rate: config.sliding_window_rate,
            duration: Duration::from_secs(config.sliding_window_duration_secs),
        });

        Self {
            rate: config.message_rate,
            sliding,
            state: Mutex::new(State {
                window_start: Instant::now(),
                granted: 0,
                recent: VecDeque::new(),
            }),
        }
    }

    /// Block until a token is granted or the token observes shutdown.
    ///
    /// # Errors
    /// [`Cancelled`] if `cancel` fires first; the caller has not consumed a
    /// token in that case.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), Cancelled> {
        loop {
            match self.try_acquire(Instant::now()) {
                None => return Ok(()),
                Some(wait) => {
                    tokio::select! {
                        () = cancel.cancelled() => return Err(Cancelled),
                        () = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
    }

    /// Grant a token now, or report how long until the next possible grant.
    fn try_acquire(&self, now: Instant) -> Option<Duration> {
        let mut state = self.state.lock();

        if now.duration_since(state.window_start) >= WINDOW {
            state.window_start = now;
            state.granted = 0;
        }
        if state.granted >= self.rate {
            return Some(state.window_start + WINDOW - now);
        }

        if let Some(sliding) = &self.sliding {
            if state.recent.len() >= sliding.rate {
                let oldest = *state.recent.front().expect("non-empty by len check");
                let elapsed = now.duration_since(oldest);
                if elapsed < sliding.duration {
                    return Some(sliding.duration - elapsed);
                }
                state.recent.pop_front();
            }
            state.recent.push_back(now);
        }

        state.granted += 1;
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(rate: usize) -> Config {
        Config {
            message_rate: rate,
            ..Config::default()
        }
    }

    fn sliding_config(rate: usize, sliding_rate: usize, duration_secs: u64) -> Config {
        Config {
            message_rate: rate,
            sliding_window: true,
            sliding_window_rate: sliding_rate,
            sliding_window_duration_secs: duration_secs,
            ..Config::default()
        }
    }

    #[test]
    fn fixed_window_caps_grants() {
        let limiter = RateLimiter::new(&config(3));
        let now = Instant::now();

        assert!(limiter.try_acquire(now).is_none());
        assert!(limiter.try_acquire(now).is_none());
        assert!(limiter.try_acquire(now).is_none());

        let wait = limiter.try_acquire(now).expect("fourth grant must wait");
        assert!(wait <= WINDOW);

        // A fresh window admits again.
        assert!(limiter.try_acquire(now + WINDOW).is_none());
    }

    #[test]
    fn sliding_window_holds_across_fixed_windows() {
        // 10/sec fixed, but only 2 per rolling 10 seconds.
        let limiter = RateLimiter::new(&sliding_config(10, 2, 10));
        let start = Instant::now();

        assert!(limiter.try_acquire(start).is_none());
        assert!(limiter.try_acquire(start).is_none());

        // Third grant is over the sliding cap even in a new fixed window.
        let wait = limiter
            .try_acquire(start + Duration::from_secs(2))
            .expect("sliding cap must defer");
        assert_eq!(wait, Duration::from_secs(8));

        // Once the oldest grant ages out, dispatch resumes.
        assert!(limiter.try_acquire(start + Duration::from_secs(10)).is_none());
    }

    #[test]
    fn rejected_sliding_grant_consumes_nothing() {
        let limiter = RateLimiter::new(&sliding_config(10, 1, 60));
        let start = Instant::now();

        assert!(limiter.try_acquire(start).is_none());
        assert!(limiter.try_acquire(start).is_some());

        // The failed attempt must not have burned a fixed-window token:
        // the fixed cap still has 9 grants left after the window rolls.
        let state = limiter.state.lock();
        assert_eq!(state.granted, 1);
        assert_eq!(state.recent.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_waits_for_the_next_window() {
        let limiter = RateLimiter::new(&config(1));
        let cancel = CancellationToken::new();

        limiter.acquire(&cancel).await.unwrap();

        let started = tokio::time::Instant::now();
        limiter.acquire(&cancel).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(900));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_waiter_aborts_without_a_token() {
        let limiter = std::sync::Arc::new(RateLimiter::new(&config(1)));
        let cancel = CancellationToken::new();

        limiter.acquire(&cancel).await.unwrap();

        let waiter = {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.acquire(&cancel).await })
        };

        tokio::task::yield_now().await;
        cancel.cancel();

        assert_eq!(waiter.await.unwrap(), Err(Cancelled));
    }
}
