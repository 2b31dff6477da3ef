use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::{Error, Result};

/// Full instance boot, including image download and cloud-init start.
pub const BOOT_TIMEOUT: Duration = Duration::from_secs(30 * 60);
/// Sub-resource operations such as termination or spot fulfilment.
pub const RESOURCE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Outcome of one check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus<T> {
    Pending,
    Ready(T),
    /// The provider reported a terminal failure state.
    Failed(String),
}

/// Runs a check on a fixed interval until it settles or a deadline passes.
///
/// The effective deadline is the earlier of `timeout` from the start of the
/// wait and the caller's deadline, if one is set.
#[derive(Debug, Clone, Copy)]
pub struct Poller {
    interval: Duration,
    timeout: Duration,
    deadline: Option<Instant>,
}

impl Poller {
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = match (self.deadline, deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Check immediately, then once per interval, until the check returns
    /// [`PollStatus::Ready`] or [`PollStatus::Failed`].
    ///
    /// A check error aborts the wait. A check still in flight when the
    /// deadline passes is dropped.
    pub async fn until<T, F, Fut>(&self, what: &str, mut check: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<PollStatus<T>>>,
    {
        let started = Instant::now();
        let deadline = match self.deadline {
            Some(caller) => caller.min(started + self.timeout),
            None => started + self.timeout,
        };
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match tokio::time::timeout_at(deadline, check()).await {
                Err(_) => break,
                Ok(Err(e)) => return Err(e),
                Ok(Ok(PollStatus::Ready(value))) => {
                    debug!(what, attempts, "poll condition met");
                    return Ok(value);
                }
                Ok(Ok(PollStatus::Failed(status))) => {
                    return Err(Error::ProvisioningFailed {
                        what: what.to_string(),
                        status,
                    });
                }
                Ok(Ok(PollStatus::Pending)) => {}
            }

            let next = Instant::now() + self.interval;
            if next >= deadline {
                tokio::time::sleep_until(deadline).await;
                break;
            }
            tokio::time::sleep_until(next).await;
        }

        Err(Error::Timeout {
            what: what.to_string(),
            after: started.elapsed(),
        })
    }
}
