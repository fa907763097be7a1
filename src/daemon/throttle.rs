//! Rate-limited background error logging.
//!
//! Both periodic loops retry forever; without a throttle a persistent outage
//! floods the log every cycle. One admission per window per loop.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::lock;

pub struct ErrorThrottle {
    window: Duration,
    last: Mutex<Option<Instant>>,
}

impl ErrorThrottle {
    pub const DEFAULT_WINDOW: Duration = Duration::from_secs(300);

    pub fn new(window: Duration) -> Self {
        ErrorThrottle {
            window,
            last: Mutex::new(None),
        }
    }

    /// True if this error should be logged; records the admission time.
    pub fn admit(&self) -> bool {
        let mut last = lock(&self.last);
        match *last {
            Some(at) if at.elapsed() <= self.window => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }
}

impl Default for ErrorThrottle {
    fn default() -> Self {
        ErrorThrottle::new(Self::DEFAULT_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_error_admitted_immediately() {
        let throttle = ErrorThrottle::default();
        assert!(throttle.admit());
        assert!(!throttle.admit());
    }

    #[test]
    fn admits_again_after_window() {
        let throttle = ErrorThrottle::new(Duration::from_millis(10));
        assert!(throttle.admit());
        assert!(!throttle.admit());
        std::thread::sleep(Duration::from_millis(15));
        assert!(throttle.admit());
    }
}
