use std::future;
use std::time::Duration;
use tokio::time::{self, Instant};

/// Retransmission timer for the one packet a transfer keeps in flight.
///
/// The timer is only ever polled from the transfer's own event loop, so cancelling it and firing
/// it can never race: once `cancel` returns, `expired` will not complete until the timer is armed
/// again.
#[derive(Debug, Default)]
pub struct RetransmitTimer {
    deadline: Option<Instant>,
}

impl RetransmitTimer {
    pub fn new() -> RetransmitTimer {
        RetransmitTimer { deadline: None }
    }

    /// (Re)starts the countdown, replacing any pending deadline.
    pub fn arm(&mut self, after: Duration) {
        self.deadline = Some(Instant::now() + after);
    }

    /// Disarms the timer. Cancelling an idle or already fired timer does nothing.
    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Completes when the armed deadline passes, disarming the timer. Never completes while the
    /// timer is disarmed.
    pub async fn expired(&mut self) {
        match self.deadline {
            Some(deadline) => {
                time::sleep_until(deadline).await;
                self.deadline = None;
            }
            None => future::pending::<()>().await,
        }
    }
}
