//! Serialized access to the controller command socket.
//!
//! The controller answers one request at a time per socket, so every call
//! goes through a single mutex-guarded [`XpsClient`]. Two retry policies
//! sit on top of it:
//!
//! - [`ControllerLink::read`] retries transport errors forever. Status and
//!   position reads are idempotent and there is no other source for the data.
//! - [`ControllerLink::command`] retries transport errors only up to the
//!   configured budget, because a state-changing request may have reached the
//!   controller before the socket failed.
//!
//! Device errors are never retried by either.

use crate::completion::CancelToken;
use crate::error::FlyError;
use crate::registry::AxisBinding;
use crate::utils::poll_until;
use crate::xps::client::{ConnectionConfig, XpsClient};
use crate::xps::protocol::Response;
use log::{debug, warn};
use parking_lot::Mutex;
use std::time::Duration;

/// Retry behaviour for transport failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Pause between attempts
    pub retry_delay: Duration,
    /// Extra attempts allowed for state-changing commands
    pub command_retries: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_millis(500),
            command_retries: 3,
        }
    }
}

pub struct ControllerLink {
    client: Mutex<XpsClient>,
    policy: RetryPolicy,
}

impl ControllerLink {
    pub fn new(client: XpsClient, policy: RetryPolicy) -> Self {
        Self {
            client: Mutex::new(client),
            policy,
        }
    }

    /// Open the command socket.
    pub fn connect(address: &str, port: u16, timeout: Duration) -> Result<Self, FlyError> {
        let client = XpsClient::builder()
            .address(address)
            .port(port)
            .config(ConnectionConfig {
                connect_timeout: timeout,
                ..ConnectionConfig::default()
            })
            .build()?;
        Ok(Self::new(client, RetryPolicy::default()))
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Issue a raw request once and hand back status and payload.
    pub fn send(&self, request: &str) -> Result<Response, FlyError> {
        self.client.lock().send_raw(request)
    }

    /// One attempt, no retry.
    pub fn call<T>(&self, f: impl FnOnce(&mut XpsClient) -> Result<T, FlyError>) -> Result<T, FlyError> {
        let mut client = self.client.lock();
        f(&mut *client)
    }

    /// Read-only query: transport errors are retried indefinitely.
    pub fn read<T>(
        &self,
        mut f: impl FnMut(&mut XpsClient) -> Result<T, FlyError>,
    ) -> Result<T, FlyError> {
        let mut attempt = 0usize;
        loop {
            let result = {
                let mut client = self.client.lock();
                f(&mut *client)
            };
            match result {
                Err(e) if e.is_transport() => {
                    attempt += 1;
                    warn!("Read failed ({e}), retry #{attempt} in {:?}", self.policy.retry_delay);
                    std::thread::sleep(self.policy.retry_delay);
                }
                other => return other,
            }
        }
    }

    /// State-changing command: transport errors are retried up to the
    /// command budget.
    pub fn command<T>(
        &self,
        mut f: impl FnMut(&mut XpsClient) -> Result<T, FlyError>,
    ) -> Result<T, FlyError> {
        let mut attempt = 0usize;
        loop {
            let result = {
                let mut client = self.client.lock();
                f(&mut *client)
            };
            match result {
                Err(e) if e.is_transport() && attempt < self.policy.command_retries => {
                    attempt += 1;
                    warn!(
                        "Command failed ({e}), retry {attempt}/{}",
                        self.policy.command_retries
                    );
                    std::thread::sleep(self.policy.retry_delay);
                }
                other => return other,
            }
        }
    }

    /// Logical position of a bound axis.
    pub fn position(&self, axis: &AxisBinding) -> Result<f64, FlyError> {
        let positions =
            self.read(|c| c.group_position_current_get(&axis.group, axis.group_size))?;
        let physical = positions.get(axis.index).copied().ok_or_else(|| {
            FlyError::Protocol(format!(
                "Group {} returned {} positions, expected index {}",
                axis.group,
                positions.len(),
                axis.index
            ))
        })?;
        Ok(axis.direction.to_logical(physical))
    }

    /// Whether a bound axis is in motion.
    pub fn moving(&self, axis: &AxisBinding) -> Result<bool, FlyError> {
        let flags = self.read(|c| c.group_motion_status_get(&axis.group, axis.group_size))?;
        flags.get(axis.index).copied().ok_or_else(|| {
            FlyError::Protocol(format!(
                "Group {} returned {} motion flags, expected index {}",
                axis.group,
                flags.len(),
                axis.index
            ))
        })
    }

    /// Start an absolute move of a bound axis to a logical position.
    pub fn move_absolute(&self, axis: &AxisBinding, target: f64) -> Result<(), FlyError> {
        let physical = axis.direction.to_physical(target);
        debug!("Moving {} to {target} (physical {physical})", axis.logical_name);
        self.command(|c| c.group_move_absolute(&axis.positioner, &[physical]))
    }

    /// Start an absolute move using the controller's own coordinates.
    pub fn move_physical(&self, axis: &AxisBinding, physical: f64) -> Result<(), FlyError> {
        debug!("Moving {} to physical {physical}", axis.positioner);
        self.command(|c| c.group_move_absolute(&axis.positioner, &[physical]))
    }

    /// Block until the axis stops, then wait its settle time.
    pub fn wait_for_stop(
        &self,
        axis: &AxisBinding,
        poll: Duration,
        cancel: Option<&CancelToken>,
    ) -> Result<(), FlyError> {
        poll_until(|| self.moving(axis).map(|m| !m), None, poll, cancel)?;
        if !axis.settle_time.is_zero() {
            std::thread::sleep(axis.settle_time);
        }
        Ok(())
    }

    pub fn abort_motion(&self, axis: &AxisBinding) -> Result<(), FlyError> {
        self.command(|c| c.group_move_abort(&axis.positioner))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xps::mock::MockController;
    use crate::xps::protocol::StatusCode;

    fn link(mock: &MockController, retries: usize) -> ControllerLink {
        ControllerLink::new(
            XpsClient::with_transport(mock.transport()),
            RetryPolicy {
                retry_delay: Duration::from_millis(1),
                command_retries: retries,
            },
        )
    }

    #[test]
    fn reads_retry_past_transport_errors() {
        let mock = MockController::new();
        mock.reply("GroupStatusGet", "0,12,EndOfAPI");
        mock.fail_transport("GroupStatusGet", 5);

        let link = link(&mock, 0);
        let state = link.read(|c| c.group_status_get("scan")).unwrap();
        assert!(state.is_ready());
        assert_eq!(mock.count("GroupStatusGet"), 6);
    }

    #[test]
    fn commands_give_up_after_budget() {
        let mock = MockController::new();
        mock.fail_transport("GroupMoveAbort", 10);

        let link = link(&mock, 2);
        let result = link.command(|c| c.group_move_abort("scan.X"));
        assert!(matches!(result, Err(FlyError::Timeout)));
        assert_eq!(mock.count("GroupMoveAbort"), 3);
    }

    #[test]
    fn device_errors_are_not_retried() {
        let mock = MockController::new();
        mock.reply("GroupInitialize", "-22,GroupInitialize(scan),EndOfAPI");

        let link = link(&mock, 5);
        match link.command(|c| c.group_initialize("scan")) {
            Err(FlyError::Device { code, .. }) => assert_eq!(code, StatusCode::NotAllowedAction),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(mock.count("GroupInitialize"), 1);
    }

    #[test]
    fn raw_send_reports_status() {
        let mock = MockController::new();
        mock.reply("GroupStatusGet", "-19,GroupStatusGet(nope,int *),EndOfAPI");
        let link = link(&mock, 0);
        let response = link.send("GroupStatusGet(nope,int *)").unwrap();
        assert_eq!(response.status, StatusCode::UnknownGroup);
    }
}
