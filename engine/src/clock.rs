use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use shared::types::{UnixMillis, UnixSeconds};

/// Server-authoritative time source. The only authority for "is this lot
/// closed?"; client timestamps are never consulted. Reads are clamped so the
/// clock never runs backward, even if the wall clock does.
#[derive(Clone, Debug)]
pub enum Clock {
    System(Arc<AtomicI64>),
    /// Test-controlled clock, advanced explicitly.
    Manual(Arc<AtomicI64>),
}

impl Clock {
    pub fn system() -> Self {
        Clock::System(Arc::new(AtomicI64::new(0)))
    }

    pub fn manual(start: UnixSeconds) -> Self {
        Clock::Manual(Arc::new(AtomicI64::new(start * 1000)))
    }

    pub fn now_millis(&self) -> UnixMillis {
        match self {
            Clock::System(last) => {
                let wall = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_millis() as i64)
                    .unwrap_or(0);
                let prev = last.fetch_max(wall, Ordering::SeqCst);
                wall.max(prev)
            }
            Clock::Manual(at) => at.load(Ordering::SeqCst),
        }
    }

    pub fn now(&self) -> UnixSeconds {
        self.now_millis() / 1000
    }

    /// Advance a manual clock; a no-op on the system clock.
    pub fn advance_secs(&self, secs: i64) {
        if let Clock::Manual(at) = self {
            at.fetch_add(secs * 1000, Ordering::SeqCst);
        }
    }

    /// Move a manual clock to an absolute time. Moves forward only.
    pub fn set(&self, at_secs: UnixSeconds) {
        if let Clock::Manual(at) = self {
            at.fetch_max(at_secs * 1000, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_and_never_rewinds() {
        let clock = Clock::manual(1_000);
        assert_eq!(clock.now(), 1_000);
        clock.advance_secs(90);
        assert_eq!(clock.now(), 1_090);
        clock.set(1_050); // behind current time, ignored
        assert_eq!(clock.now(), 1_090);
        clock.set(2_000);
        assert_eq!(clock.now(), 2_000);
    }

    #[test]
    fn system_clock_reads_are_monotonic() {
        let clock = Clock::system();
        let a = clock.now_millis();
        let b = clock.now_millis();
        assert!(b >= a);
    }
}
