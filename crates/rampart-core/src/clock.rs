//! Injectable time source.
//!
//! Every time-dependent decision in the pipeline (breaker reset timeouts,
//! limiter refills, cache freshness, backoff sleeps) reads time through a
//! [`Clock`], so tests can drive it deterministically with [`ManualClock`].

use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Monotonic and wall-clock time plus a suspension primitive.
#[async_trait]
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current monotonic instant.
    fn now(&self) -> Instant;

    /// Current wall-clock time, used for HTTP dates.
    fn wall_time(&self) -> SystemTime;

    /// Suspend the caller for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Shared handle to a clock.
pub type SharedClock = Arc<dyn Clock>;

/// Clock backed by the OS and the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl SystemClock {
    /// Shared handle to the system clock
    #[must_use]
    pub fn shared() -> SharedClock {
        Arc::new(Self)
    }
}

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall_time(&self) -> SystemTime {
        SystemTime::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Wall time a [`ManualClock`] starts at: 2024-01-01T00:00:00Z.
const MANUAL_EPOCH_SECS: u64 = 1_704_067_200;

/// Clock that only moves when told to.
///
/// `sleep` advances the clock by the requested duration instead of waiting,
/// and records the duration so tests can assert on observed delays.
pub struct ManualClock {
    origin: Instant,
    wall_origin: SystemTime,
    state: Mutex<ManualState>,
}

#[derive(Default)]
struct ManualState {
    elapsed: Duration,
    sleeps: Vec<Duration>,
}

impl ManualClock {
    /// Create a clock frozen at its origin
    #[must_use]
    pub fn new() -> Self {
        Self::with_wall_time(UNIX_EPOCH + Duration::from_secs(MANUAL_EPOCH_SECS))
    }

    /// Create a clock whose wall time starts at `wall_origin`
    #[must_use]
    pub fn with_wall_time(wall_origin: SystemTime) -> Self {
        Self {
            origin: Instant::now(),
            wall_origin,
            state: Mutex::new(ManualState::default()),
        }
    }

    /// Move time forward
    pub fn advance(&self, by: Duration) {
        self.state.lock().elapsed += by;
    }

    /// Total time advanced since creation
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.state.lock().elapsed
    }

    /// Durations passed to `sleep`, in call order
    #[must_use]
    pub fn sleeps(&self) -> Vec<Duration> {
        self.state.lock().sleeps.clone()
    }

    /// Forget recorded sleeps
    pub fn clear_sleeps(&self) {
        self.state.lock().sleeps.clear();
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ManualClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ManualClock")
            .field("elapsed", &state.elapsed)
            .field("sleeps", &state.sleeps.len())
            .finish()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.state.lock().elapsed
    }

    fn wall_time(&self) -> SystemTime {
        self.wall_origin + self.state.lock().elapsed
    }

    async fn sleep(&self, duration: Duration) {
        {
            let mut state = self.state.lock();
            state.elapsed += duration;
            state.sleeps.push(duration);
        }
        // Keep the suspension point observable to other tasks.
        tokio::task::yield_now().await;
    }
}
