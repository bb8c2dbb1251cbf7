use chrono::{DateTime, Utc};

/// Wall-clock source for the scheduling loop.
///
/// Implement this to control "now" in tests; see `mocks::MockClock`.
pub trait Clock: Send + Sync + Clone + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// Zero-sized type, delegates to `chrono::Utc::now`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
