use std::time::Duration;
use std::{fmt, sync::Arc};

use tokio::sync::Notify;
use tokio::time::timeout;

/// Default timeout of [`TimedNotify::notified`].
pub const DEFAULT_NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// An [`Arc<Notify>`] whose waits panic after a timeout.
#[derive(Clone)]
pub struct TimedNotify {
    notify: Arc<Notify>,
    timeout_duration: Duration,
}

impl TimedNotify {
    pub fn new(notify: Arc<Notify>) -> Self {
        Self::with_timeout(notify, DEFAULT_NOTIFY_TIMEOUT)
    }

    pub fn with_timeout(notify: Arc<Notify>, timeout_duration: Duration) -> Self {
        Self {
            notify,
            timeout_duration,
        }
    }

    /// Waits for the next notification.
    ///
    /// # Panics
    ///
    /// Panics when nothing was notified within the timeout.
    pub async fn notified(&self) {
        if timeout(self.timeout_duration, self.notify.notified())
            .await
            .is_err()
        {
            panic!(
                "notification timed out after {:?}, the awaited state was never reached",
                self.timeout_duration
            );
        }
    }

    /// Waits for the next notification. Returns `false` on timeout.
    pub async fn try_notified(&self) -> bool {
        timeout(self.timeout_duration, self.notify.notified())
            .await
            .is_ok()
    }
}

impl fmt::Debug for TimedNotify {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimedNotify")
            .field("timeout_duration", &self.timeout_duration)
            .finish()
    }
}
