//! Safe-stop sequence run when a trajectory leg fails on the controller.

use crate::completion::{CancelToken, Completer, RunOutcome};
use crate::detector::{Detector, Shutter};
use crate::error::FlyError;
use crate::link::ControllerLink;
use crate::xps::protocol::GroupState;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;

pub struct FaultRecovery {
    shutter: Arc<dyn Shutter>,
    detector: Option<Arc<dyn Detector>>,
    /// Pause after each recovery command before re-reading the group state
    settle: Duration,
}

impl FaultRecovery {
    pub fn new(shutter: Arc<dyn Shutter>, detector: Option<Arc<dyn Detector>>) -> Self {
        Self {
            shutter,
            detector,
            settle: Duration::from_secs(1),
        }
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Bring `group` back to a known state after `cause`.
    ///
    /// Closes the shutter, lets the detector finish its pending frames, then
    /// walks the group through initialize / home search / motion enable as
    /// its state calls for. The run is always marked aborted and `completer`
    /// resolved with a failure, whatever the recovery achieves. Returns the
    /// [`FlyError::HardwareFault`] to raise; nothing here is retried.
    pub fn safe_stop(
        &self,
        link: &ControllerLink,
        group: &str,
        cause: &FlyError,
        aborted: &CancelToken,
        completer: Option<Completer>,
    ) -> FlyError {
        error!("Trajectory on {group} failed: {cause}");

        if let Err(e) = self.shutter.close() {
            error!("Failed to close shutter: {e}");
        }
        self.drain_detector();

        let state = self.recover_group(link, group);
        match state {
            Some(s) if s.is_ready() => info!("Group {group} re-initialized ({s})"),
            Some(s) => error!("Group {group} left in state {s}"),
            None => error!("Group {group} state unknown after recovery"),
        }

        aborted.cancel();
        if let Some(completer) = completer {
            completer.resolve(RunOutcome::Aborted(cause.to_string()));
        }
        warn!("Giving up the current scan");

        FlyError::HardwareFault(match state {
            Some(s) => format!("{cause}; group {group} is {s}"),
            None => format!("{cause}; group {group} state unknown"),
        })
    }

    fn drain_detector(&self) {
        let Some(detector) = &self.detector else {
            return;
        };
        let pending = detector
            .num_images()
            .and_then(|total| Ok(total.saturating_sub(detector.array_counter()?)));
        match pending {
            Ok(0) => {}
            Ok(n) => {
                info!("Triggering {} {n} more times to finish the exposure", detector.name());
                if let Err(e) = detector.repeat_ext_trigger(n) {
                    error!("Failed to drain {}: {e}", detector.name());
                }
            }
            Err(e) => error!("Failed to read {} frame count: {e}", detector.name()),
        }
    }

    fn status(&self, link: &ControllerLink, group: &str) -> Option<GroupState> {
        match link.read(|c| c.group_status_get(group)) {
            Ok(state) => Some(state),
            Err(e) => {
                error!("Group status query failed: {e}");
                None
            }
        }
    }

    fn step(
        &self,
        link: &ControllerLink,
        group: &str,
        what: &str,
        f: impl FnMut(&mut crate::xps::XpsClient) -> Result<(), FlyError>,
    ) -> Option<GroupState> {
        info!("Group {group}: {what}");
        if let Err(e) = link.command(f) {
            error!("Group {group}: {what} failed: {e}");
        }
        std::thread::sleep(self.settle);
        self.status(link, group)
    }

    fn recover_group(&self, link: &ControllerLink, group: &str) -> Option<GroupState> {
        let mut state = self.status(link, group)?;

        if state.needs_initialization() {
            state = self.step(link, group, "initialize", |c| c.group_initialize(group))?;
        }
        if state.ready_for_home_search() {
            state = self.step(link, group, "home search", |c| c.group_home_search(group))?;
        }
        if matches!(state, GroupState::Disabled(_)) {
            state = self.step(link, group, "motion enable", |c| c.group_motion_enable(group))?;
        }
        Some(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::completion_pair;
    use crate::link::RetryPolicy;
    use crate::xps::mock::MockController;
    use crate::xps::protocol::StatusCode;
    use crate::xps::XpsClient;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingShutter(AtomicUsize);

    impl Shutter for CountingShutter {
        fn close(&self) -> Result<(), FlyError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn setup(mock: &MockController) -> (ControllerLink, Arc<CountingShutter>, FaultRecovery) {
        let link = ControllerLink::new(
            XpsClient::with_transport(mock.transport()),
            RetryPolicy {
                retry_delay: Duration::from_millis(1),
                command_retries: 0,
            },
        );
        let shutter = Arc::new(CountingShutter::default());
        let recovery = FaultRecovery::new(shutter.clone(), None).with_settle(Duration::ZERO);
        (link, shutter, recovery)
    }

    fn cause() -> FlyError {
        FlyError::Device {
            code: StatusCode::NotAllowedAction,
            command: "MultipleAxesPVTExecution".to_string(),
            message: String::new(),
        }
    }

    #[test]
    fn reinitializes_and_homes() {
        let mock = MockController::new();
        mock.reply_once("GroupStatusGet", "0,1,EndOfAPI");
        mock.reply_once("GroupStatusGet", "0,42,EndOfAPI");
        mock.reply_once("GroupStatusGet", "0,11,EndOfAPI");
        let (link, shutter, recovery) = setup(&mock);

        let aborted = CancelToken::new();
        let (completer, mut handle) = completion_pair();
        let err = recovery.safe_stop(&link, "scan", &cause(), &aborted, Some(completer));

        assert!(matches!(err, FlyError::HardwareFault(_)));
        assert!(aborted.is_cancelled());
        assert_eq!(shutter.0.load(Ordering::SeqCst), 1);
        assert_eq!(mock.count("GroupInitialize"), 1);
        assert_eq!(mock.count("GroupHomeSearch"), 1);
        assert_eq!(mock.count("GroupMotionEnable"), 0);
        assert!(handle.is_done());
        assert!(!handle.outcome().unwrap().is_success());
    }

    #[test]
    fn disabled_group_is_re_enabled() {
        let mock = MockController::new();
        mock.reply_once("GroupStatusGet", "0,20,EndOfAPI");
        mock.reply_once("GroupStatusGet", "0,12,EndOfAPI");
        let (link, _shutter, recovery) = setup(&mock);

        let aborted = CancelToken::new();
        recovery.safe_stop(&link, "scan", &cause(), &aborted, None);
        assert_eq!(mock.count("GroupInitialize"), 0);
        assert_eq!(mock.count("GroupMotionEnable"), 1);
    }

    #[test]
    fn failed_status_still_aborts() {
        let mock = MockController::new();
        mock.reply("GroupStatusGet", "-19,GroupStatusGet(scan,int *),EndOfAPI");
        let (link, shutter, recovery) = setup(&mock);

        let aborted = CancelToken::new();
        let err = recovery.safe_stop(&link, "scan", &cause(), &aborted, None);
        assert!(matches!(err, FlyError::HardwareFault(_)));
        assert!(aborted.is_cancelled());
        assert_eq!(shutter.0.load(Ordering::SeqCst), 1);
    }
}
