//! Idle shutdown timer for supervisor-launched servers.
//!
//! Armed at startup and again whenever the last transfer finishes, cancelled
//! when a new read request arrives. A lifecycle built without a timeout is
//! never armed and never expires.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct IdleLifecycle {
    timeout: Option<Duration>,
    deadline: Option<Instant>,
}

impl IdleLifecycle {
    /// Create the lifecycle, already armed when `timeout` is set.
    pub fn new(timeout: Option<Duration>) -> Self {
        let mut idle = Self {
            timeout,
            deadline: None,
        };
        idle.arm();
        idle
    }

    pub fn arm(&mut self) {
        if let Some(timeout) = self.timeout {
            debug!("Idle timer armed for {:?}", timeout);
            self.deadline = Some(Instant::now() + timeout);
        }
    }

    pub fn cancel(&mut self) {
        if self.deadline.take().is_some() {
            debug!("Idle timer cancelled");
        }
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Resolves at the current deadline, or never when disarmed.
    ///
    /// The returned future does not borrow `self`, so the caller may re-arm
    /// or cancel while it is pending; the change is seen by the next call.
    pub fn expired(&self) -> impl Future<Output = ()> + Send + 'static {
        let deadline = self.deadline;
        async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        }
    }
}
