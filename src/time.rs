use futures::Future;
use std::time::Duration;
use tokio::time::Instant;

pub async fn delay_for(duration: Duration) {
    tokio::time::sleep(duration).await
}

pub async fn timeout<T, O>(duration: Duration, future: T) -> Option<O>
where
    T: Future<Output = O>,
{
    tokio::time::timeout(duration, future).await.ok()
}

/// A one-shot deadline owned by a single task.
///
/// Backed by the monotonic clock, so adjustments to the system clock can
/// neither fire it early nor make it miss.
#[derive(Debug, Clone, Default)]
pub struct Timer {
    deadline: Option<Instant>,
}

impl Timer {
    pub fn new() -> Timer {
        Timer { deadline: None }
    }

    /// Arms the timer `duration` from now. Restarting an armed timer re-bases
    /// the deadline from the call time.
    pub fn start(&mut self, duration: Duration) {
        self.deadline = Some(Instant::now() + duration);
    }

    pub fn stop(&mut self) {
        self.deadline = None;
    }

    pub fn is_active(&self) -> bool {
        self.deadline.is_some()
    }

    /// True once the deadline has passed, and stays true until the timer is
    /// stopped or restarted. A stopped timer never reports a timeout.
    pub fn timed_out(&self) -> bool {
        match self.deadline {
            Some(deadline) => Instant::now() >= deadline,
            None => false,
        }
    }

    /// Time left before the deadline; zero when stopped or expired.
    pub fn remaining(&self) -> Duration {
        match self.deadline {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None => Duration::from_secs(0),
        }
    }

    /// Resolves when the deadline passes. Never resolves while stopped, which
    /// makes it usable as a `select!` arm for an optional timeout.
    pub async fn expired(&self) {
        match self.deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => futures::future::pending().await,
        }
    }
}
