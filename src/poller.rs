//! Readiness polling: check a condition at a fixed interval until it holds, a timeout
//! elapses, or the check itself fails.

use crate::interrupt::Interrupt;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::trace;

/// Default interval between probe checks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// A probe failure that ends polling early (network error, page crash, child exit status).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ProbeError(pub String);

impl ProbeError {
    pub fn new(msg: impl Into<String>) -> Self {
        ProbeError(msg.into())
    }
}

/// Something that can be asked "ready yet?".
pub trait ReadinessProbe {
    fn check(&mut self) -> Result<bool, ProbeError>;
}

impl<F> ReadinessProbe for F
where
    F: FnMut() -> Result<bool, ProbeError>,
{
    fn check(&mut self) -> Result<bool, ProbeError> {
        self()
    }
}

/// Timeout and interval for one wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub timeout: Duration,
    pub interval: Duration,
}

impl PollPolicy {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        PollPolicy { timeout, interval }
    }

    /// Same interval, different timeout.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        PollPolicy { timeout, ..self }
    }
}

/// Result of a wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    TimedOut { waited: Duration },
    Errored(String),
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready)
    }
}

/// Check `probe` immediately and then every `policy.interval` until it reports ready,
/// fails, or `policy.timeout` elapses. The last sleep is clipped to the remaining time.
/// A raised interrupt ends the wait as `Errored("interrupted")`.
pub fn poll_until_ready<P: ReadinessProbe + ?Sized>(
    probe: &mut P,
    policy: PollPolicy,
    interrupt: &Interrupt,
) -> Readiness {
    let start = Instant::now();
    let mut attempts: u32 = 0;
    loop {
        if interrupt.is_raised() {
            return Readiness::Errored("interrupted".to_string());
        }
        attempts += 1;
        match probe.check() {
            Ok(true) => {
                trace!(attempts, elapsed_ms = start.elapsed().as_millis() as u64, "probe ready");
                return Readiness::Ready;
            }
            Ok(false) => {}
            Err(e) => return Readiness::Errored(e.0),
        }
        let elapsed = start.elapsed();
        if elapsed >= policy.timeout {
            return Readiness::TimedOut { waited: elapsed };
        }
        let remaining = policy.timeout - elapsed;
        std::thread::sleep(policy.interval.min(remaining));
    }
}
