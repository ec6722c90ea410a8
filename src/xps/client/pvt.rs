use super::XpsClient;
use crate::error::FlyError;
use serde::Serialize;
use std::time::Duration;

/// Limits computed by the controller while verifying a PVT file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PvtVerificationResult {
    pub file: String,
    pub min_position: f64,
    pub max_position: f64,
    pub max_velocity: f64,
    pub max_acceleration: f64,
}

impl XpsClient {
    /// Check a trajectory file stored on the controller against the group's
    /// limits. Also loads it as the group's current trajectory.
    pub fn multiple_axes_pvt_verification(
        &mut self,
        group: &str,
        file: &str,
    ) -> Result<(), FlyError> {
        self.quick_send(
            "MultipleAxesPVTVerification",
            vec![group.into(), file.into()],
            vec![],
        )?;
        Ok(())
    }

    pub fn multiple_axes_pvt_verification_result_get(
        &mut self,
        positioner: &str,
    ) -> Result<PvtVerificationResult, FlyError> {
        let result = self.quick_send(
            "MultipleAxesPVTVerificationResultGet",
            vec![positioner.into()],
            vec!["char *", "double *", "double *", "double *", "double *"],
        )?;

        if result.len() >= 5 {
            Ok(PvtVerificationResult {
                file: result[0].as_str()?.to_string(),
                min_position: result[1].as_f64()?,
                max_position: result[2].as_f64()?,
                max_velocity: result[3].as_f64()?,
                max_acceleration: result[4].as_f64()?,
            })
        } else {
            Err(FlyError::Protocol(
                "Invalid PVT verification result".to_string(),
            ))
        }
    }

    /// Emit a trajectory pulse on entry of every segment from `start` to
    /// `end` (1-based, inclusive).
    pub fn multiple_axes_pvt_pulse_output_set(
        &mut self,
        group: &str,
        start: usize,
        end: usize,
        period: f64,
    ) -> Result<(), FlyError> {
        self.quick_send(
            "MultipleAxesPVTPulseOutputSet",
            vec![group.into(), start.into(), end.into(), period.into()],
            vec![],
        )?;
        Ok(())
    }

    /// Run a verified trajectory. The call returns only once the motion has
    /// ended, so the reply timeout is stretched to `expected` plus the
    /// normal read timeout.
    pub fn multiple_axes_pvt_execution(
        &mut self,
        group: &str,
        file: &str,
        count: usize,
        expected: Duration,
    ) -> Result<(), FlyError> {
        let timeout = expected * count.max(1) as u32 + self.config().read_timeout;
        self.with_read_timeout(timeout, |client| {
            client.quick_send(
                "MultipleAxesPVTExecution",
                vec![group.into(), file.into(), count.into()],
                vec![],
            )?;
            Ok(())
        })
    }
}
