use super::XpsClient;
use crate::error::FlyError;

impl XpsClient {
    /// Maximum velocity and acceleration allowed for a positioner.
    pub fn positioner_maximum_velocity_and_acceleration_get(
        &mut self,
        positioner: &str,
    ) -> Result<(f64, f64), FlyError> {
        let result = self.quick_send(
            "PositionerMaximumVelocityAndAccelerationGet",
            vec![positioner.into()],
            vec!["double *", "double *"],
        )?;

        if result.len() >= 2 {
            Ok((result[0].as_f64()?, result[1].as_f64()?))
        } else {
            Err(FlyError::Protocol(
                "Invalid maximum velocity/acceleration response".to_string(),
            ))
        }
    }
}
