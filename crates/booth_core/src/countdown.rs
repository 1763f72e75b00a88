//! Per-shot countdown: `Tick(n) .. Tick(1)` one period apart, then a single `Fire`.

use std::{
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::Duration,
};

use futures::{stream, Stream};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const DEFAULT_TICK_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountdownEvent {
    Tick(u32),
    Fire,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CountdownError {
    #[error("a countdown is already running")]
    AlreadyRunning,
    #[error("countdown must start from at least one second")]
    ZeroDuration,
}

struct ActiveCountdown {
    token: CancellationToken,
    finished: Arc<AtomicBool>,
}

impl ActiveCountdown {
    fn is_live(&self) -> bool {
        !self.finished.load(Ordering::SeqCst) && !self.token.is_cancelled()
    }
}

pub struct Countdown {
    period: Duration,
    active: Option<ActiveCountdown>,
}

impl Default for Countdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Countdown {
    pub fn new() -> Self {
        Self::with_period(DEFAULT_TICK_PERIOD)
    }

    pub fn with_period(period: Duration) -> Self {
        Self {
            period,
            active: None,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn is_running(&self) -> bool {
        self.active.as_ref().is_some_and(ActiveCountdown::is_live)
    }

    pub fn start(&mut self, seconds: u32) -> Result<CountdownTicks, CountdownError> {
        if self.is_running() {
            return Err(CountdownError::AlreadyRunning);
        }
        if seconds == 0 {
            return Err(CountdownError::ZeroDuration);
        }

        let token = CancellationToken::new();
        let finished = Arc::new(AtomicBool::new(false));
        self.active = Some(ActiveCountdown {
            token: token.clone(),
            finished: finished.clone(),
        });
        debug!(seconds, "countdown started");

        Ok(CountdownTicks::new(seconds, self.period, token, finished))
    }

    /// Stops the running sequence; its stream ends without firing.
    pub fn cancel(&mut self) {
        if let Some(active) = self.active.take() {
            if active.is_live() {
                debug!("countdown cancelled");
            }
            active.token.cancel();
            active.finished.store(true, Ordering::SeqCst);
        }
    }

    /// A token that cancels whichever countdown is currently running.
    pub fn cancellation_token(&self) -> Option<CancellationToken> {
        self.active
            .as_ref()
            .filter(|active| active.is_live())
            .map(|active| active.token.clone())
    }
}

struct TickState {
    remaining: u32,
    first: bool,
    done: bool,
    period: Duration,
    token: CancellationToken,
    finished: Arc<AtomicBool>,
}

/// Lazy, finite tick sequence produced by [`Countdown::start`].
///
/// Dropping it before `Fire` releases the timer just like a cancel.
pub struct CountdownTicks {
    inner: Pin<Box<dyn Stream<Item = CountdownEvent> + Send>>,
    finished: Arc<AtomicBool>,
}

impl CountdownTicks {
    fn new(
        seconds: u32,
        period: Duration,
        token: CancellationToken,
        finished: Arc<AtomicBool>,
    ) -> Self {
        let state = TickState {
            remaining: seconds,
            first: true,
            done: false,
            period,
            token,
            finished: finished.clone(),
        };

        let inner = stream::unfold(state, |mut st| async move {
            if st.done {
                return None;
            }
            if st.first {
                st.first = false;
                if st.token.is_cancelled() {
                    return None;
                }
            } else {
                tokio::select! {
                    biased;
                    _ = st.token.cancelled() => {
                        st.finished.store(true, Ordering::SeqCst);
                        return None;
                    }
                    _ = tokio::time::sleep(st.period) => {}
                }
            }

            if st.remaining == 0 {
                st.done = true;
                st.finished.store(true, Ordering::SeqCst);
                return Some((CountdownEvent::Fire, st));
            }

            let tick = st.remaining;
            st.remaining -= 1;
            Some((CountdownEvent::Tick(tick), st))
        });

        Self {
            inner: Box::pin(inner),
            finished,
        }
    }
}

impl Stream for CountdownTicks {
    type Item = CountdownEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl Drop for CountdownTicks {
    fn drop(&mut self) {
        self.finished.store(true, Ordering::SeqCst);
    }
}
