//! Jerk-limited PVT profile synthesis.
//!
//! A profile has `N` cruise segments framed by `Nr` ramp-up and `Nr`
//! ramp-down segments, all of duration `dt`. The jerk sequence is integrated
//! over fixed steps into acceleration, velocity and per-segment
//! displacement, then rescaled so the cruise segments move exactly `dx` at
//! `dx/dt`.

use crate::error::FlyError;
use crate::registry::AxisBinding;
use crate::types::ScanDirection;
use log::debug;
use ndarray::{s, Array1};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const MONOTONIC_TOLERANCE: f64 = 1e-12;

/// Scan parameters for one fly-scan definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryParams {
    /// Number of cruise segments, N
    pub n_segments: usize,
    /// Displacement per cruise segment, dx
    pub segment_displacement: f64,
    /// Duration of every segment in seconds, dt
    pub segment_duration: f64,
    /// Ramp segments on each side, Nr
    pub ramp_segments: usize,
    /// Logical fast-axis position where the cruise region begins
    pub start: f64,
    /// Slow-axis step between legs, dy
    pub slow_displacement: f64,
}

impl Default for TrajectoryParams {
    fn default() -> Self {
        Self {
            n_segments: 10,
            segment_displacement: 0.1,
            segment_duration: 0.1,
            ramp_segments: 2,
            start: 0.0,
            slow_displacement: 0.0,
        }
    }
}

impl TrajectoryParams {
    pub fn validate(&self) -> Result<(), FlyError> {
        validate_inputs(
            self.n_segments,
            self.segment_displacement,
            self.segment_duration,
            self.ramp_segments,
        )?;
        if !self.start.is_finite() || !self.slow_displacement.is_finite() {
            return Err(FlyError::Validation(
                "start and slow displacement must be finite".to_string(),
            ));
        }
        Ok(())
    }

    /// Segments in one table, ramps included.
    pub fn total_segments(&self) -> usize {
        self.n_segments + 2 * self.ramp_segments
    }

    pub fn cruise_velocity(&self) -> f64 {
        self.segment_displacement / self.segment_duration
    }
}

fn validate_inputs(n: usize, dx: f64, dt: f64, nr: usize) -> Result<(), FlyError> {
    if n < 1 {
        return Err(FlyError::Validation(format!(
            "at least one cruise segment is required, got {n}"
        )));
    }
    if nr < 2 {
        return Err(FlyError::Validation(format!(
            "at least two ramp segments are required, got {nr}"
        )));
    }
    if !(dx.is_finite() && dx > 0.0) {
        return Err(FlyError::Validation(format!(
            "segment displacement must be positive, got {dx}"
        )));
    }
    if !(dt.is_finite() && dt > 0.0) {
        return Err(FlyError::Validation(format!(
            "segment duration must be positive, got {dt}"
        )));
    }
    Ok(())
}

/// Integrated kinematics of a forward profile.
///
/// Arrays hold `N + 2·Nr + 1` samples; index 0 is the rest state before the
/// first segment and index `i` is the state at the end of segment `i`.
/// `displacement[i]` is the distance covered during segment `i`, not the
/// cumulative position.
#[derive(Debug, Clone)]
pub struct Profile {
    pub displacement: Array1<f64>,
    pub velocity: Array1<f64>,
    pub acceleration: Array1<f64>,
    /// Distance covered by the `Nr` ramp-up segments
    pub ramp_distance: f64,
}

/// Synthesize the forward profile for `n` cruise segments of `dx` over `dt`
/// with `nr` ramp segments each side.
pub fn synthesize(n: usize, dx: f64, dt: f64, nr: usize) -> Result<Profile, FlyError> {
    validate_inputs(n, dx, dt, nr)?;
    let len = n + 2 * nr;

    let mut jerk = Array1::<f64>::zeros(len);
    jerk[0] = 1.0;
    jerk[nr - 1] = -1.0;
    jerk[len - nr] = -1.0;
    jerk[len - 1] = 1.0;

    let mut disp = Array1::<f64>::zeros(len + 1);
    let mut vel = Array1::<f64>::zeros(len + 1);
    let mut acc = Array1::<f64>::zeros(len + 1);

    for i in 0..len {
        acc[i + 1] = acc[i] + jerk[i] * dt;
        vel[i + 1] = vel[i] + acc[i] * dt + jerk[i] * dt * dt / 2.0;
        disp[i + 1] = vel[i] * dt + acc[i] * dt * dt / 2.0 + jerk[i] * dt.powi(3) / 6.0;
    }

    let vel_max = vel.fold(f64::NEG_INFINITY, |a, &b| a.max(b));
    let disp_max = disp.fold(f64::NEG_INFINITY, |a, &b| a.max(b));
    if !(vel_max > 0.0 && disp_max > 0.0) {
        return Err(FlyError::Validation(
            "degenerate profile: no motion generated".to_string(),
        ));
    }

    let vel = vel.mapv(|v| v / vel_max * dx / dt);
    let disp = disp.mapv(|d| d / disp_max * dx);

    check_ramps(&disp, n, nr, "displacement")?;
    check_ramps(&vel, n, nr, "velocity")?;

    let ramp_distance = disp.slice(s![1..=nr]).sum();
    debug!("Synthesized profile: {len} segments, ramp distance {ramp_distance}");

    Ok(Profile {
        displacement: disp,
        velocity: vel,
        acceleration: acc,
        ramp_distance,
    })
}

/// Ramp-up must be non-decreasing over `[0, Nr]` and ramp-down
/// non-increasing over `[N+Nr, N+2Nr]`.
fn check_ramps(values: &Array1<f64>, n: usize, nr: usize, what: &str) -> Result<(), FlyError> {
    let up = values.slice(s![0..=nr]);
    let down = values.slice(s![n + nr..=n + 2 * nr]);

    let rising = up
        .windows(2)
        .into_iter()
        .all(|w| w[1] >= w[0] - MONOTONIC_TOLERANCE);
    let falling = down
        .windows(2)
        .into_iter()
        .all(|w| w[1] <= w[0] + MONOTONIC_TOLERANCE);

    if rising && falling {
        Ok(())
    } else {
        Err(FlyError::Validation(format!(
            "{what} is not monotonic over the ramps (N={n}, Nr={nr})"
        )))
    }
}

/// One row of a PVT table for the fast axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Segment {
    pub duration: f64,
    pub displacement: f64,
    /// Velocity at the end of the segment
    pub velocity: f64,
}

/// All segments of one direction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentTable {
    pub direction: ScanDirection,
    pub segments: Vec<Segment>,
}

impl SegmentTable {
    fn from_profile(profile: &Profile, dt: f64, direction: ScanDirection) -> Self {
        let sign = match direction {
            ScanDirection::Forward => 1.0,
            ScanDirection::Backward => -1.0,
        };
        let segments = profile
            .displacement
            .iter()
            .zip(profile.velocity.iter())
            .skip(1)
            .map(|(&d, &v)| Segment {
                duration: dt,
                displacement: sign * d,
                velocity: sign * v,
            })
            .collect();
        Self {
            direction,
            segments,
        }
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn peak_speed(&self) -> f64 {
        self.segments
            .iter()
            .fold(0.0, |m, s| m.max(s.velocity.abs()))
    }

    /// Net travel over the whole table.
    pub fn travel(&self) -> f64 {
        self.segments.iter().map(|s| s.displacement).sum()
    }
}

/// A fully generated trajectory for one fast axis.
///
/// Only [`crate::ProfileTransport::publish`] marks a spec verified, after
/// both direction files were uploaded and accepted by the controller.
#[derive(Debug, Clone, Serialize)]
pub struct TrajectorySpec {
    pub fast_axis: AxisBinding,
    pub slow_axis: Option<AxisBinding>,
    pub params: TrajectoryParams,
    pub ramp_distance: f64,
    pub forward: SegmentTable,
    pub reverse: SegmentTable,
    /// Controller-side file names, forward then backward
    pub files: [String; 2],
    verified: bool,
}

impl TrajectorySpec {
    pub fn is_verified(&self) -> bool {
        self.verified
    }

    pub(crate) fn set_verified(&mut self, verified: bool) {
        self.verified = verified;
    }

    pub fn group(&self) -> &str {
        &self.fast_axis.group
    }

    pub fn table(&self, direction: ScanDirection) -> &SegmentTable {
        match direction {
            ScanDirection::Forward => &self.forward,
            ScanDirection::Backward => &self.reverse,
        }
    }

    pub fn file_name(&self, direction: ScanDirection) -> &str {
        match direction {
            ScanDirection::Forward => &self.files[0],
            ScanDirection::Backward => &self.files[1],
        }
    }

    /// Physical pre-roll position for a leg, chosen so the axis reaches the
    /// cruise region at cruise speed. The backward leg starts where the
    /// forward leg ends.
    pub fn ready_position(&self, direction: ScanDirection) -> f64 {
        let start = self.fast_axis.direction.to_physical(self.params.start);
        match direction {
            ScanDirection::Forward => start - self.ramp_distance,
            ScanDirection::Backward => {
                start
                    + self.params.n_segments as f64 * self.params.segment_displacement
                    + self.ramp_distance
            }
        }
    }

    /// Trigger pulses fire on entry of segments `Nr+1` through `N+Nr+1`
    /// (1-based), bracketing the cruise region.
    pub fn pulse_window(&self) -> (usize, usize) {
        let n = self.params.n_segments;
        let nr = self.params.ramp_segments;
        (nr + 1, n + nr + 1)
    }

    /// Samples one leg should gather, one per trigger pulse.
    pub fn expected_samples(&self) -> usize {
        self.params.n_segments + 1
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.params.total_segments() as f64 * self.params.segment_duration)
    }
}

/// Builds [`TrajectorySpec`]s.
#[derive(Debug, Clone)]
pub struct ProfileGenerator {
    file_tag: String,
}

impl Default for ProfileGenerator {
    fn default() -> Self {
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "flyer".to_string());
        Self::new(&user)
    }
}

impl ProfileGenerator {
    /// `file_tag` keeps trajectory files of different users apart on the
    /// controller.
    pub fn new(file_tag: &str) -> Self {
        Self {
            file_tag: file_tag.to_string(),
        }
    }

    pub fn file_names(&self) -> [String; 2] {
        [
            format!("TrajScan_FW.trj-{}", self.file_tag),
            format!("TrajScan_BK.trj-{}", self.file_tag),
        ]
    }

    /// Generate both direction tables for `fast_axis`. The result is not
    /// verified.
    pub fn generate(
        &self,
        fast_axis: &AxisBinding,
        slow_axis: Option<&AxisBinding>,
        params: &TrajectoryParams,
    ) -> Result<TrajectorySpec, FlyError> {
        params.validate()?;
        let profile = synthesize(
            params.n_segments,
            params.segment_displacement,
            params.segment_duration,
            params.ramp_segments,
        )?;

        let dt = params.segment_duration;
        Ok(TrajectorySpec {
            fast_axis: fast_axis.clone(),
            slow_axis: slow_axis.cloned(),
            params: params.clone(),
            ramp_distance: profile.ramp_distance,
            forward: SegmentTable::from_profile(&profile, dt, ScanDirection::Forward),
            reverse: SegmentTable::from_profile(&profile, dt, ScanDirection::Backward),
            files: self.file_names(),
            verified: false,
        })
    }
}
