use std::time::Duration;

use tokio::time::Instant;

/// A single-shot timer, polled by the event loop rather than delivering a
///  callback: the loop sleeps until the armed deadline and converts an
///  elapsed deadline into its edge flag exactly once.
#[derive(Debug, Default)]
pub struct SingleShotTimer {
    deadline: Option<Instant>,
}

impl SingleShotTimer {
    /// (re-)arm the timer; a previously armed deadline is replaced
    pub fn start(&mut self, duration: Duration) {
        self.deadline = Some(Instant::now() + duration);
    }

    pub fn stop(&mut self) {
        self.deadline = None;
    }

    /// armed and not yet reported as fired
    pub fn is_active(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// reports an elapsed deadline exactly once, disarming the timer
    pub fn poll_fired(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}


/// A coarse deadline without a wakeup: only ever queried, never slept on.
#[derive(Debug)]
pub struct CoarseDeadline {
    deadline: Instant,
}

impl CoarseDeadline {
    /// a deadline that has already expired
    pub fn expired() -> CoarseDeadline {
        CoarseDeadline {
            deadline: Instant::now(),
        }
    }

    pub fn set_remaining(&mut self, duration: Duration) {
        self.deadline = Instant::now() + duration;
    }

    pub fn has_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }
}
