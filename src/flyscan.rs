//! Fly-scan coordinator.
//!
//! Drives one trajectory leg at a time through
//! `Idle → Staged → KickedOff → Executing → Completed | Aborted`.
//! The leg itself runs on a background thread and reports back through a
//! [`CompletionHandle`]; all controller traffic from both sides goes through
//! the shared [`ControllerLink`].

use crate::completion::{completion_pair, CancelToken, Completer, CompletionHandle, RunOutcome};
use crate::detector::Detector;
use crate::error::FlyError;
use crate::link::ControllerLink;
use crate::profile::{ProfileGenerator, TrajectoryParams, TrajectorySpec};
use crate::readback::{align, ReadbackSeries};
use crate::recovery::FaultRecovery;
use crate::registry::AxisBinding;
use crate::transport::ProfileTransport;
use crate::types::{ScanDirection, TriggerMode};
use crate::utils::unix_now;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    Idle,
    Staged,
    KickedOff,
    Executing,
    Completed,
    Aborted,
}

impl Phase {
    pub fn is_running(self) -> bool {
        matches!(self, Phase::KickedOff | Phase::Executing)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Tunables for the coordinator.
#[derive(Debug, Clone)]
pub struct FlyScanOptions {
    /// Motion-status poll period while waiting for a move to finish
    pub poll_interval: Duration,
    /// Completion-handle poll period inside `complete()`
    pub complete_poll: Duration,
    /// Give up waiting in `complete()` after this long
    pub complete_timeout: Option<Duration>,
    /// Remove stale extended events before starting capture
    pub clean_event_queue: bool,
    /// Legs per staged scan; sizes the detector acquisition
    pub legs: usize,
    /// Detector readout time subtracted from the segment duration
    pub dead_time: f64,
}

impl Default for FlyScanOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            complete_poll: Duration::from_millis(100),
            complete_timeout: None,
            clean_event_queue: true,
            legs: 1,
            dead_time: 0.002,
        }
    }
}

#[derive(Debug)]
struct RunState {
    phase: Phase,
    direction: ScanDirection,
    start_time: Option<f64>,
    /// Readback of the most recent leg
    leg: ReadbackSeries,
    /// Readback accumulated since the last `stage()`
    fast: ReadbackSeries,
    slow: ReadbackSeries,
    fault: Option<String>,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            direction: ScanDirection::Forward,
            start_time: None,
            leg: ReadbackSeries::default(),
            fast: ReadbackSeries::default(),
            slow: ReadbackSeries::default(),
            fault: None,
        }
    }
}

/// Active trajectory parameters, as reported by
/// [`FlyScanCoordinator::configuration`].
#[derive(Debug, Clone, Serialize)]
pub struct TrajectoryConfiguration {
    pub n_segments: usize,
    pub ramp_segments: usize,
    pub segment_displacement: f64,
    pub segment_duration: f64,
    pub ramp_distance: f64,
    pub fast_axis: String,
    pub slow_axis: Option<String>,
    pub slow_displacement: f64,
    pub direction: ScanDirection,
    /// Physical pre-roll positions, forward then backward
    pub ready_positions: [f64; 2],
    pub verified: bool,
    pub defined_at: f64,
}

/// Description of one key produced by `collect()`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataKey {
    pub dtype: String,
    pub shape: Vec<usize>,
    pub source: String,
}

/// Everything gathered between `stage()` and `collect()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedRecord {
    pub time: f64,
    pub fast_axis: String,
    pub fast: ReadbackSeries,
    /// Detector frame times matched to `fast` by index
    pub frame_timestamps: Vec<Option<f64>>,
    pub slow_axis: Option<String>,
    pub slow: Option<ReadbackSeries>,
}

pub struct FlyScanCoordinator {
    link: Arc<ControllerLink>,
    transport: ProfileTransport,
    generator: ProfileGenerator,
    recovery: Arc<FaultRecovery>,
    detector: Option<Arc<dyn Detector>>,
    options: FlyScanOptions,
    spec: Option<Arc<TrajectorySpec>>,
    defined_at: f64,
    state: Arc<Mutex<RunState>>,
    aborted: CancelToken,
    worker: Option<JoinHandle<()>>,
}

impl FlyScanCoordinator {
    pub fn new(
        link: Arc<ControllerLink>,
        transport: ProfileTransport,
        recovery: FaultRecovery,
    ) -> Self {
        Self {
            link,
            transport,
            generator: ProfileGenerator::default(),
            recovery: Arc::new(recovery),
            detector: None,
            options: FlyScanOptions::default(),
            spec: None,
            defined_at: 0.0,
            state: Arc::new(Mutex::new(RunState::default())),
            aborted: CancelToken::new(),
            worker: None,
        }
    }

    pub fn with_detector(mut self, detector: Arc<dyn Detector>) -> Self {
        self.detector = Some(detector);
        self
    }

    pub fn with_generator(mut self, generator: ProfileGenerator) -> Self {
        self.generator = generator;
        self
    }

    pub fn with_options(mut self, options: FlyScanOptions) -> Self {
        self.options = options;
        self
    }

    pub fn link(&self) -> &Arc<ControllerLink> {
        &self.link
    }

    pub fn spec(&self) -> Option<&TrajectorySpec> {
        self.spec.as_deref()
    }

    pub fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    pub fn direction(&self) -> ScanDirection {
        self.state.lock().direction
    }

    /// Why the last leg was aborted, if it was.
    pub fn last_fault(&self) -> Option<String> {
        self.state.lock().fault.clone()
    }

    fn ensure_idle(&self) -> Result<(), FlyError> {
        if self.state.lock().phase.is_running() {
            return Err(FlyError::AlreadyRunning);
        }
        Ok(())
    }

    /// Generate, upload and verify a trajectory for `fast_axis`.
    ///
    /// Parameter errors are reported before any controller traffic. If the
    /// upload or verification fails, the new spec is kept but unverified, so
    /// `kickoff()` refuses to run it.
    pub fn define(
        &mut self,
        fast_axis: &AxisBinding,
        slow_axis: Option<&AxisBinding>,
        params: &TrajectoryParams,
    ) -> Result<&TrajectorySpec, FlyError> {
        self.ensure_idle()?;
        let mut spec = self.generator.generate(fast_axis, slow_axis, params)?;

        let (max_velocity, max_acceleration) = self.link.read(|c| {
            c.positioner_maximum_velocity_and_acceleration_get(&fast_axis.positioner)
        })?;
        let peak = spec.forward.peak_speed();
        debug!(
            "{}: peak velocity {peak}, limits {max_velocity} / {max_acceleration}",
            fast_axis.positioner
        );
        if peak > max_velocity {
            return Err(FlyError::Validation(format!(
                "peak velocity {peak} exceeds the {} maximum of {max_velocity}",
                fast_axis.positioner
            )));
        }

        self.defined_at = unix_now();
        let published = self.transport.publish(&self.link, &mut spec);
        let spec = self.spec.insert(Arc::new(spec));
        published?;
        let spec: &TrajectorySpec = spec;

        info!(
            "Trajectory defined on {}: N={}, dx={}, dt={}, Nr={}, ramp distance {:.6}",
            spec.fast_axis.positioner,
            spec.params.n_segments,
            spec.params.segment_displacement,
            spec.params.segment_duration,
            spec.params.ramp_segments,
            spec.ramp_distance
        );
        Ok(spec)
    }

    /// Reset per-scan state and arm the detector.
    pub fn stage(&mut self) -> Result<(), FlyError> {
        self.ensure_idle()?;
        self.join_worker();

        if let (Some(detector), Some(spec)) = (&self.detector, &self.spec) {
            let dt = spec.params.segment_duration;
            let exposure = (dt - self.options.dead_time).max(dt * 0.5);
            detector.set_trigger_mode(TriggerMode::External)?;
            detector.set_num_images(spec.expected_samples() * self.options.legs.max(1))?;
            detector.set_exp_time(exposure)?;
            detector.number_reset()?;
            debug!("{} armed, exposure {exposure}", detector.name());
        }

        self.aborted = CancelToken::new();
        let mut state = self.state.lock();
        let direction = state.direction;
        *state = RunState {
            phase: Phase::Staged,
            direction,
            ..RunState::default()
        };
        info!("Staged");
        Ok(())
    }

    /// Wait for any leg and motion to finish, then return to idle.
    pub fn unstage(&mut self) -> Result<(), FlyError> {
        self.join_worker();
        if let Some(spec) = &self.spec {
            self.link
                .wait_for_stop(&spec.fast_axis, self.options.poll_interval, None)?;
        }
        self.state.lock().phase = Phase::Idle;
        info!("Unstaged");
        Ok(())
    }

    pub fn select_forward(&self, forward: bool) {
        self.state.lock().direction = ScanDirection::from_forward(forward);
    }

    /// Start the selected leg in the background.
    ///
    /// Fails with [`FlyError::AlreadyRunning`] while a leg is in flight and
    /// with [`FlyError::NotVerified`] before any controller traffic if the
    /// trajectory was never verified.
    pub fn kickoff(&mut self) -> Result<CompletionHandle, FlyError> {
        let mut state = self.state.lock();
        if state.phase.is_running() {
            return Err(FlyError::AlreadyRunning);
        }
        let spec = match &self.spec {
            Some(spec) if spec.is_verified() => Arc::clone(spec),
            _ => return Err(FlyError::NotVerified),
        };
        if !matches!(state.phase, Phase::Staged | Phase::Completed) {
            return Err(FlyError::InvalidState {
                expected: "Staged or Completed".to_string(),
                actual: state.phase.to_string(),
            });
        }

        state.phase = Phase::KickedOff;
        state.start_time = None;
        state.fault = None;
        let direction = state.direction;
        drop(state);
        self.join_worker();

        let (completer, handle) = completion_pair();
        let leg = Leg {
            link: Arc::clone(&self.link),
            recovery: Arc::clone(&self.recovery),
            spec,
            direction,
            state: Arc::clone(&self.state),
            aborted: self.aborted.clone(),
            options: self.options.clone(),
        };

        info!("Kicking off {direction} leg");
        let spawned = std::thread::Builder::new()
            .name("pvt-leg".to_string())
            .spawn(move || leg.run(completer));
        match spawned {
            Ok(worker) => {
                self.worker = Some(worker);
                Ok(handle)
            }
            Err(e) => {
                self.state.lock().phase = Phase::Aborted;
                Err(FlyError::io(e, "spawning trajectory thread"))
            }
        }
    }

    /// Block until the leg behind `handle` resolves and return its readback.
    ///
    /// `cancel` (or the configured timeout) stops the wait and requests an
    /// abort; the leg then winds down through the safe-stop sequence.
    pub fn complete(
        &mut self,
        handle: &mut CompletionHandle,
        cancel: &CancelToken,
    ) -> Result<ReadbackSeries, FlyError> {
        let outcome = match handle.wait(
            self.options.complete_poll,
            cancel,
            self.options.complete_timeout,
        ) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Stopped waiting for the trajectory: {e}");
                self.abort();
                return Err(e);
            }
        };
        self.join_worker();

        let state = self.state.lock();
        if self.aborted.is_cancelled() || !outcome.is_success() || state.phase == Phase::Aborted {
            if let Some(fault) = &state.fault {
                error!("Leg aborted: {fault}");
            }
            return Err(FlyError::IncompleteRun);
        }
        info!("Leg complete with {} samples", state.leg.len());
        Ok(state.leg.clone())
    }

    /// Request that the current scan stop.
    ///
    /// A leg already executing on the controller cannot be interrupted; it is
    /// stopped through the safe-stop sequence as soon as the controller
    /// hands the trajectory back.
    pub fn abort(&self) {
        self.aborted.cancel();
        let mut state = self.state.lock();
        match state.phase {
            Phase::KickedOff | Phase::Executing => {
                warn!("Abort requested, leg will stop once the controller releases it");
            }
            Phase::Staged | Phase::Completed => {
                state.phase = Phase::Aborted;
                warn!("Scan aborted");
            }
            Phase::Idle | Phase::Aborted => {}
        }
    }

    /// Everything read back since `stage()`, with detector frame times.
    pub fn collect(&self) -> Result<AggregatedRecord, FlyError> {
        let spec = self.spec.as_ref().ok_or(FlyError::NotVerified)?;
        let state = self.state.lock();
        if state.phase != Phase::Completed {
            return Err(FlyError::InvalidState {
                expected: Phase::Completed.to_string(),
                actual: state.phase.to_string(),
            });
        }

        let frames = match &self.detector {
            Some(detector) => detector.frame_timestamps()?,
            None => Vec::new(),
        };
        if self.detector.is_some() && frames.len() != state.fast.len() {
            warn!(
                "{} detector frames for {} readback samples",
                frames.len(),
                state.fast.len()
            );
        }
        let frame_timestamps = (0..state.fast.len()).map(|i| frames.get(i).copied()).collect();

        Ok(AggregatedRecord {
            time: unix_now(),
            fast_axis: spec.fast_axis.logical_name.clone(),
            fast: state.fast.clone(),
            frame_timestamps,
            slow_axis: spec.slow_axis.as_ref().map(|a| a.logical_name.clone()),
            slow: spec.slow_axis.as_ref().map(|_| state.slow.clone()),
        })
    }

    /// Step the slow axis by the configured displacement and wait for it.
    pub fn advance_slow_axis(&self) -> Result<f64, FlyError> {
        self.ensure_idle()?;
        let spec = self.spec.as_ref().ok_or(FlyError::NotVerified)?;
        let slow = spec
            .slow_axis
            .as_ref()
            .ok_or_else(|| FlyError::Validation("no slow axis bound".to_string()))?;

        let target = self.link.position(slow)? + spec.params.slow_displacement;
        self.link.move_absolute(slow, target)?;
        self.link
            .wait_for_stop(slow, self.options.poll_interval, Some(&self.aborted))?;
        info!("{} advanced to {target}", slow.logical_name);
        Ok(target)
    }

    pub fn configuration(&self) -> Result<TrajectoryConfiguration, FlyError> {
        let spec = self.spec.as_ref().ok_or(FlyError::NotVerified)?;
        Ok(TrajectoryConfiguration {
            n_segments: spec.params.n_segments,
            ramp_segments: spec.params.ramp_segments,
            segment_displacement: spec.params.segment_displacement,
            segment_duration: spec.params.segment_duration,
            ramp_distance: spec.ramp_distance,
            fast_axis: spec.fast_axis.logical_name.clone(),
            slow_axis: spec.slow_axis.as_ref().map(|a| a.logical_name.clone()),
            slow_displacement: spec.params.slow_displacement,
            direction: self.direction(),
            ready_positions: [
                spec.ready_position(ScanDirection::Forward),
                spec.ready_position(ScanDirection::Backward),
            ],
            verified: spec.is_verified(),
            defined_at: self.defined_at,
        })
    }

    /// Keys `collect()` will produce.
    pub fn describe_collect(&self) -> Result<BTreeMap<String, DataKey>, FlyError> {
        let spec = self.spec.as_ref().ok_or(FlyError::NotVerified)?;
        let mut keys = BTreeMap::new();
        keys.insert(
            spec.fast_axis.logical_name.clone(),
            DataKey {
                dtype: "number".to_string(),
                shape: vec![1],
                source: "PVT trajectory readback position".to_string(),
            },
        );
        if let Some(slow) = &spec.slow_axis {
            keys.insert(
                slow.logical_name.clone(),
                DataKey {
                    dtype: "number".to_string(),
                    shape: vec![1],
                    source: "motor position readback".to_string(),
                },
            );
        }
        if let Some(detector) = &self.detector {
            keys.insert(
                format!("{}_timestamps", detector.name()),
                DataKey {
                    dtype: "number".to_string(),
                    shape: vec![1],
                    source: "detector frame log".to_string(),
                },
            );
        }
        Ok(keys)
    }

    fn join_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Trajectory thread panicked");
            }
        }
    }
}

/// Everything one background leg needs.
struct Leg {
    link: Arc<ControllerLink>,
    recovery: Arc<FaultRecovery>,
    spec: Arc<TrajectorySpec>,
    direction: ScanDirection,
    state: Arc<Mutex<RunState>>,
    aborted: CancelToken,
    options: FlyScanOptions,
}

impl Leg {
    fn run(self, completer: Completer) {
        let result = self.execute().and_then(|(event_id, start)| {
            if self.aborted.is_cancelled() {
                return Err(FlyError::Cancelled);
            }
            self.finish(event_id, start)
        });

        match result {
            Ok(()) => {
                self.state.lock().phase = Phase::Completed;
                completer.resolve(RunOutcome::Completed);
            }
            Err(cause) => {
                self.state.lock().phase = Phase::Aborted;
                let fault = self.recovery.safe_stop(
                    &self.link,
                    self.spec.group(),
                    &cause,
                    &self.aborted,
                    Some(completer),
                );
                self.state.lock().fault = Some(fault.to_string());
            }
        }
    }

    /// Pre-roll, arm gathering and triggering, then run the trajectory.
    /// Returns the gathering event id and the execution start time.
    fn execute(&self) -> Result<(i32, f64), FlyError> {
        let spec = &self.spec;
        let link = &self.link;
        let axis = &spec.fast_axis;
        let group = spec.group();
        let file = spec.file_name(self.direction);
        let dt = spec.params.segment_duration;

        let ready = spec.ready_position(self.direction);
        info!("Moving {} into ready position {ready}", axis.positioner);
        link.move_physical(axis, ready)?;
        link.wait_for_stop(axis, self.options.poll_interval, Some(&self.aborted))?;

        link.command(|c| c.gathering_reset())?;
        let (first, last) = spec.pulse_window();
        info!("Trajectory pulses on segments {first}..={last}, period {dt:.3}");
        link.command(|c| c.multiple_axes_pvt_pulse_output_set(group, first, last, dt))?;
        link.command(|c| c.multiple_axes_pvt_verification(group, file))?;
        link.command(|c| {
            c.gathering_configuration_set(&[format!("{}.CurrentPosition", axis.positioner)])
        })?;
        let pulse = format!("{group}.PVT.TrajectoryPulse");
        link.command(|c| c.event_extended_configuration_trigger_set(&["Always", pulse.as_str()]))?;
        link.command(|c| c.event_extended_configuration_action_set(&["GatheringOneData"]))?;

        if self.options.clean_event_queue {
            for id in link.read(|c| c.event_extended_all_get())? {
                debug!("Removing stale event {id}");
                if let Err(e) = link.command(|c| c.event_extended_remove(id)) {
                    warn!("Could not remove event {id}: {e}");
                }
            }
        }

        let event_id = link.command(|c| c.event_extended_start())?;
        let start = unix_now();
        {
            let mut state = self.state.lock();
            state.start_time = Some(start);
            state.phase = Phase::Executing;
        }

        info!("Executing {file}");
        // Single attempt: a resend after a lost reply would run the
        // trajectory twice.
        link.call(|c| c.multiple_axes_pvt_execution(group, file, 1, spec.duration()))?;
        Ok((event_id, start))
    }

    /// Save gathering, drop the event and record the readback.
    fn finish(&self, event_id: i32, start: f64) -> Result<(), FlyError> {
        let spec = &self.spec;
        let link = &self.link;

        link.command(|c| c.gathering_stop_and_save())?;
        link.command(|c| c.event_extended_remove(event_id))?;

        let (count, _) = link.read(|c| c.gathering_current_number_get())?;
        let raw = link.read(|c| c.gathering_data_multiple_lines_get(0, count))?;
        let positions: Vec<f64> = raw
            .iter()
            .map(|&p| spec.fast_axis.direction.to_logical(p))
            .collect();
        let series = align(
            &positions,
            start,
            spec.params.n_segments,
            spec.params.ramp_segments,
            spec.params.segment_duration,
        );

        let slow = match &spec.slow_axis {
            Some(axis) => Some((link.position(axis)?, unix_now())),
            None => None,
        };

        let mut state = self.state.lock();
        state.fast.extend(series.clone());
        state.leg = series;
        if let Some((position, time)) = slow {
            state.slow.push(position, time);
        }
        info!("End of {} trajectory, {} samples", self.direction, raw.len());
        Ok(())
    }
}
