//! Companion detector and safety shutter seams.
//!
//! The flyer only drives these through narrow traits; the beamline layer
//! supplies the real implementations.

use crate::error::FlyError;
use crate::types::TriggerMode;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};

/// An area detector triggered by the controller's trajectory pulses.
pub trait Detector: Send + Sync {
    fn name(&self) -> &str;

    fn set_trigger_mode(&self, mode: TriggerMode) -> Result<(), FlyError>;
    fn set_num_images(&self, count: usize) -> Result<(), FlyError>;
    fn set_exp_time(&self, seconds: f64) -> Result<(), FlyError>;
    /// Restart file/frame numbering.
    fn number_reset(&self) -> Result<(), FlyError>;

    fn num_images(&self) -> Result<usize, FlyError>;
    /// Frames acquired so far.
    fn array_counter(&self) -> Result<usize, FlyError>;
    /// Fire `count` software triggers so a pending acquisition can finish.
    fn repeat_ext_trigger(&self, count: usize) -> Result<(), FlyError>;

    /// Per-frame timestamps (seconds since the Unix epoch), in frame order.
    fn frame_timestamps(&self) -> Result<Vec<f64>, FlyError>;
}

/// Something that can cut the beam.
pub trait Shutter: Send + Sync {
    fn close(&self) -> Result<(), FlyError>;
}

/// Shutter for setups without one; closing only logs.
#[derive(Debug, Default)]
pub struct NullShutter;

impl Shutter for NullShutter {
    fn close(&self) -> Result<(), FlyError> {
        info!("No shutter configured, nothing to close");
        Ok(())
    }
}

fn parse_iso(token: &str) -> Option<f64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(token) {
        return Some(dt.timestamp_micros() as f64 / 1e6);
    }
    let naive = NaiveDateTime::parse_from_str(token, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(token, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.timestamp_micros() as f64 / 1e6)
}

/// Parse a detector frame log.
///
/// The log has a header line, one line per frame whose first column is an
/// ISO-8601 time, and a closing summary line. Naive times are taken as
/// local time.
pub fn parse_timestamp_log(text: &str) -> Result<Vec<f64>, FlyError> {
    let lines: Vec<&str> = text.split('\n').collect();
    if lines.len() < 3 {
        return Ok(Vec::new());
    }

    lines[1..lines.len() - 2]
        .iter()
        .enumerate()
        .map(|(i, line)| {
            let token = line.split_whitespace().next().unwrap_or_default();
            parse_iso(token).ok_or_else(|| {
                FlyError::Detector(format!("bad timestamp on frame line {}: {line:?}", i + 1))
            })
        })
        .collect()
}

pub fn read_timestamp_log(path: &Path) -> Result<Vec<f64>, FlyError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| FlyError::Detector(format!("reading {}: {e}", path.display())))?;
    let stamps = parse_timestamp_log(&text)?;
    debug!("Read {} frame timestamps from {}", stamps.len(), path.display());
    Ok(stamps)
}

#[derive(Debug, Default)]
struct Acquisition {
    mode: Option<TriggerMode>,
    num_images: usize,
    exp_time: f64,
    frames: usize,
}

/// Detector stand-in driven by a frame log that the acquisition system
/// copies to `log_path` out of band. Settings are only tracked locally.
#[derive(Debug)]
pub struct LogFileDetector {
    name: String,
    log_path: PathBuf,
    state: Mutex<Acquisition>,
}

impl LogFileDetector {
    pub fn new(name: &str, log_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            log_path: log_path.into(),
            state: Mutex::new(Acquisition::default()),
        }
    }

    pub fn exp_time(&self) -> f64 {
        self.state.lock().exp_time
    }

    pub fn trigger_mode(&self) -> Option<TriggerMode> {
        self.state.lock().mode
    }
}

impl Detector for LogFileDetector {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_trigger_mode(&self, mode: TriggerMode) -> Result<(), FlyError> {
        self.state.lock().mode = Some(mode);
        Ok(())
    }

    fn set_num_images(&self, count: usize) -> Result<(), FlyError> {
        self.state.lock().num_images = count;
        Ok(())
    }

    fn set_exp_time(&self, seconds: f64) -> Result<(), FlyError> {
        self.state.lock().exp_time = seconds;
        Ok(())
    }

    fn number_reset(&self) -> Result<(), FlyError> {
        self.state.lock().frames = 0;
        Ok(())
    }

    fn num_images(&self) -> Result<usize, FlyError> {
        Ok(self.state.lock().num_images)
    }

    fn array_counter(&self) -> Result<usize, FlyError> {
        Ok(self.state.lock().frames)
    }

    fn repeat_ext_trigger(&self, count: usize) -> Result<(), FlyError> {
        let mut state = self.state.lock();
        state.frames = (state.frames + count).min(state.num_images.max(state.frames));
        Ok(())
    }

    fn frame_timestamps(&self) -> Result<Vec<f64>, FlyError> {
        if !self.log_path.exists() {
            warn!(
                "Frame log {} not found, collecting without detector timestamps",
                self.log_path.display()
            );
            return Ok(Vec::new());
        }
        read_timestamp_log(&self.log_path)
    }
}
