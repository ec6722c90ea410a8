use crate::completion::CancelToken;
use std::time::{Duration, Instant};

/// Error type for polling operations
#[derive(Debug)]
pub enum PollError<E> {
    /// Operation timed out
    Timeout,
    /// The cancellation token fired
    Cancelled,
    /// Error occurred in the condition function
    ConditionError(E),
}

impl<E> std::fmt::Display for PollError<E>
where
    E: std::fmt::Display,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PollError::Timeout => write!(f, "Operation timed out"),
            PollError::Cancelled => write!(f, "Operation cancelled"),
            PollError::ConditionError(e) => write!(f, "Condition error: {}", e),
        }
    }
}

impl<E> std::error::Error for PollError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PollError::Timeout | PollError::Cancelled => None,
            PollError::ConditionError(e) => Some(e),
        }
    }
}

impl From<PollError<crate::error::FlyError>> for crate::error::FlyError {
    fn from(e: PollError<crate::error::FlyError>) -> Self {
        match e {
            PollError::Timeout => {
                crate::error::FlyError::WaitTimeout("polled condition".to_string())
            }
            PollError::Cancelled => crate::error::FlyError::Cancelled,
            PollError::ConditionError(inner) => inner,
        }
    }
}

/// Poll a condition until it holds.
///
/// Repeatedly calls `condition` until it returns `Ok(true)`. Gives up after
/// `timeout` (if any) or once `cancel` (if any) fires.
///
/// # Example
/// ```
/// use std::time::Duration;
/// use pvt_flyer::utils::poll_until;
///
/// let mut calls = 0;
/// poll_until(
///     || {
///         calls += 1;
///         Ok::<bool, ()>(calls >= 3)
///     },
///     Some(Duration::from_secs(1)),
///     Duration::from_millis(1),
///     None,
/// )
/// .unwrap();
/// assert_eq!(calls, 3);
/// ```
pub fn poll_until<F, E>(
    mut condition: F,
    timeout: Option<Duration>,
    poll_interval: Duration,
    cancel: Option<&CancelToken>,
) -> Result<(), PollError<E>>
where
    F: FnMut() -> Result<bool, E>,
{
    let start = Instant::now();

    loop {
        if cancel.is_some_and(CancelToken::is_cancelled) {
            return Err(PollError::Cancelled);
        }
        if timeout.is_some_and(|t| start.elapsed() >= t) {
            return Err(PollError::Timeout);
        }

        match condition() {
            Ok(true) => return Ok(()),
            Ok(false) => std::thread::sleep(poll_interval),
            Err(e) => return Err(PollError::ConditionError(e)),
        }
    }
}

/// Seconds since the Unix epoch as a float, the clock readback timestamps
/// are expressed in.
pub fn unix_now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1e6
}
