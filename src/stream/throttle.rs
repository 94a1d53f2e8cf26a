//! Admission gate for capture+encode work.
//!
//! Two independent limits:
//! - a counting semaphore bounding how many capture+encode operations run
//!   at once (waiters queue), and
//! - a token bucket bounding how many operations are admitted per second
//!   (excess is rejected with [`StreamError::RateLimited`], never queued).

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::{StreamError, StreamResult};

pub const DEFAULT_MAX_CONCURRENT: usize = 4;
pub const DEFAULT_RATE_PER_SEC: u32 = 60;

/// Continuous-refill token bucket.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A full bucket holding `rate` tokens, refilling `rate` per second.
    pub fn new(rate: u32) -> Self {
        let rate = rate.max(1) as f64;
        Self {
            capacity: rate,
            tokens: rate,
            refill_per_sec: rate,
            last_refill: Instant::now(),
        }
    }

    pub fn try_take(&mut self) -> bool {
        self.try_take_at(Instant::now())
    }

    /// Take one token as of `now` (explicit clock for tests).
    pub fn try_take_at(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

pub struct CaptureThrottle {
    slots: Arc<Semaphore>,
    limit: usize,
    bucket: Mutex<TokenBucket>,
}

/// Held for the duration of one capture+encode. Dropping it frees the slot.
pub struct ThrottlePermit {
    _permit: OwnedSemaphorePermit,
}

impl CaptureThrottle {
    pub fn new(max_concurrent: usize, rate_per_sec: u32) -> Self {
        let limit = max_concurrent.max(1);
        Self {
            slots: Arc::new(Semaphore::new(limit)),
            limit,
            bucket: Mutex::new(TokenBucket::new(rate_per_sec)),
        }
    }

    /// Rate check only. Used by admission points that do not capture
    /// themselves (e.g. opening a new HTTP stream).
    pub fn admit(&self) -> StreamResult<()> {
        if self.bucket.lock().try_take() {
            Ok(())
        } else {
            Err(StreamError::RateLimited)
        }
    }

    /// Rate check, then wait for a free slot. The wait ends early with
    /// [`StreamError::Cancelled`] when `cancel` fires.
    pub async fn acquire(&self, cancel: &CancellationToken) -> StreamResult<ThrottlePermit> {
        self.admit()?;
        let permit = tokio::select! {
            permit = self.slots.clone().acquire_owned() => {
                permit.map_err(|_| StreamError::Cancelled)?
            }
            _ = cancel.cancelled() => return Err(StreamError::Cancelled),
        };
        trace!(in_flight = self.in_flight(), "throttle slot taken");
        Ok(ThrottlePermit { _permit: permit })
    }

    /// Slots not currently held.
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    /// Operations currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.limit - self.available()
    }
}

impl Default for CaptureThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENT, DEFAULT_RATE_PER_SEC)
    }
}

/// Interval between ticks at `fps` frames per second.
pub fn frame_interval(fps: u32) -> Duration {
    Duration::from_secs_f64(1.0 / fps.max(1) as f64)
}
