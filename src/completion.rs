//! Single-resolution completion handle shared between the foreground and a
//! background trajectory leg, plus a cancellation token for waits.

use crate::error::FlyError;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::warn;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How a trajectory leg ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum RunOutcome {
    Completed,
    Aborted(String),
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Completed)
    }
}

/// Cooperative cancellation flag threaded through blocking waits.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// The underlying flag, for signal handlers.
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.0)
    }
}

/// Create a connected completer/handle pair.
pub fn completion_pair() -> (Completer, CompletionHandle) {
    let (tx, rx) = bounded(1);
    (
        Completer { tx: Some(tx) },
        CompletionHandle { rx, outcome: None },
    )
}

/// Resolving side, owned by the background leg.
///
/// `resolve` consumes the completer, so a handle can only ever be resolved
/// once. Dropping an unresolved completer resolves the handle with a
/// failure, which keeps a waiting caller from blocking forever if the leg
/// panics.
#[derive(Debug)]
pub struct Completer {
    tx: Option<Sender<RunOutcome>>,
}

impl Completer {
    pub fn resolve(mut self, outcome: RunOutcome) {
        if let Some(tx) = self.tx.take() {
            // The handle may already be gone; nobody is waiting then.
            let _ = tx.send(outcome);
        }
    }
}

impl Drop for Completer {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            warn!("Trajectory leg ended without resolving its completion handle");
            let _ = tx.send(RunOutcome::Aborted(
                "background leg ended unexpectedly".to_string(),
            ));
        }
    }
}

/// Waiting side, returned to the caller by `kickoff()`.
#[derive(Debug)]
pub struct CompletionHandle {
    rx: Receiver<RunOutcome>,
    outcome: Option<RunOutcome>,
}

impl CompletionHandle {
    /// Non-blocking check.
    pub fn is_done(&mut self) -> bool {
        if self.outcome.is_none() {
            if let Ok(outcome) = self.rx.try_recv() {
                self.outcome = Some(outcome);
            }
        }
        self.outcome.is_some()
    }

    pub fn outcome(&self) -> Option<&RunOutcome> {
        self.outcome.as_ref()
    }

    /// Block until resolved, checking `cancel` every `poll` and giving up
    /// after `timeout` if one is set.
    pub fn wait(
        &mut self,
        poll: Duration,
        cancel: &CancelToken,
        timeout: Option<Duration>,
    ) -> Result<RunOutcome, FlyError> {
        let start = Instant::now();
        loop {
            if let Some(outcome) = &self.outcome {
                return Ok(outcome.clone());
            }
            if cancel.is_cancelled() {
                return Err(FlyError::Cancelled);
            }
            if timeout.is_some_and(|t| start.elapsed() >= t) {
                return Err(FlyError::WaitTimeout("trajectory completion".to_string()));
            }

            match self.rx.recv_timeout(poll) {
                Ok(outcome) => self.outcome = Some(outcome),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    // Completer dropped after sending is handled above; a bare
                    // disconnect means it vanished without a word.
                    self.outcome = Some(RunOutcome::Aborted(
                        "completion channel closed".to_string(),
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn resolves_across_threads() {
        let (completer, mut handle) = completion_pair();
        assert!(!handle.is_done());

        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            completer.resolve(RunOutcome::Completed);
        });

        let outcome = handle
            .wait(Duration::from_millis(5), &CancelToken::new(), None)
            .unwrap();
        assert!(outcome.is_success());
        assert!(handle.is_done());
    }

    #[test]
    fn dropped_completer_resolves_with_failure() {
        let (completer, mut handle) = completion_pair();
        drop(completer);
        let outcome = handle
            .wait(Duration::from_millis(5), &CancelToken::new(), None)
            .unwrap();
        assert!(matches!(outcome, RunOutcome::Aborted(_)));
    }

    #[test]
    fn cancellation_interrupts_wait() {
        let (_completer, mut handle) = completion_pair();
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = handle.wait(Duration::from_millis(5), &cancel, None);
        assert!(matches!(result, Err(FlyError::Cancelled)));
    }

    #[test]
    fn wait_times_out() {
        let (_completer, mut handle) = completion_pair();
        let result = handle.wait(
            Duration::from_millis(5),
            &CancelToken::new(),
            Some(Duration::from_millis(30)),
        );
        match result {
            Err(e @ FlyError::WaitTimeout(_)) => assert!(!e.is_transport()),
            other => panic!("expected a wait timeout, got {other:?}"),
        }
    }
}
