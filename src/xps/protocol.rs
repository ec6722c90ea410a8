use crate::error::FlyError;
use crate::types::XpsValue;
use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt;

// Protocol constants
pub const END_OF_API: &str = "EndOfAPI";
pub const MAX_COMMAND_SIZE: usize = 1024;
pub const MAX_RESPONSE_SIZE: usize = 16 * 1024 * 1024;
pub const STATUS_OK: &str = "0";

/// Controller status codes.
///
/// Codes the flyer reacts to are named; everything else lands in
/// [`StatusCode::Other`] and is treated as a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    Ok,
    BusySocket,
    TcpTimeout,
    CommandTooLong,
    UnknownCommand,
    WrongFormat,
    WrongObjectType,
    WrongParameterCount,
    WrongParameterType,
    ParameterOutOfRange,
    UnknownPositioner,
    UnknownGroup,
    NotAllowedAction,
    FollowingError,
    EmergencySignal,
    MotionDoneTimeout,
    Other(i32),
}

impl StatusCode {
    pub fn code(self) -> i32 {
        match self {
            StatusCode::Ok => 0,
            StatusCode::BusySocket => -1,
            StatusCode::TcpTimeout => -2,
            StatusCode::CommandTooLong => -3,
            StatusCode::UnknownCommand => -4,
            StatusCode::WrongFormat => -7,
            StatusCode::WrongObjectType => -8,
            StatusCode::WrongParameterCount => -9,
            StatusCode::WrongParameterType => -10,
            StatusCode::ParameterOutOfRange => -17,
            StatusCode::UnknownPositioner => -18,
            StatusCode::UnknownGroup => -19,
            StatusCode::NotAllowedAction => -22,
            StatusCode::FollowingError => -25,
            StatusCode::EmergencySignal => -26,
            StatusCode::MotionDoneTimeout => -33,
            StatusCode::Other(code) => code,
        }
    }

    pub fn is_ok(self) -> bool {
        self == StatusCode::Ok
    }

    /// Parse the textual status field of a reply.
    pub fn parse(raw: &str) -> Result<Self, FlyError> {
        let code: i32 = raw
            .trim()
            .parse()
            .map_err(|_| FlyError::Protocol(format!("Invalid status field {raw:?}")))?;
        Ok(Self::from(code))
    }
}

impl From<i32> for StatusCode {
    fn from(code: i32) -> Self {
        match code {
            0 => StatusCode::Ok,
            -1 => StatusCode::BusySocket,
            -2 => StatusCode::TcpTimeout,
            -3 => StatusCode::CommandTooLong,
            -4 => StatusCode::UnknownCommand,
            -7 => StatusCode::WrongFormat,
            -8 => StatusCode::WrongObjectType,
            -9 => StatusCode::WrongParameterCount,
            -10 => StatusCode::WrongParameterType,
            -17 => StatusCode::ParameterOutOfRange,
            -18 => StatusCode::UnknownPositioner,
            -19 => StatusCode::UnknownGroup,
            -22 => StatusCode::NotAllowedAction,
            -25 => StatusCode::FollowingError,
            -26 => StatusCode::EmergencySignal,
            -33 => StatusCode::MotionDoneTimeout,
            other => StatusCode::Other(other),
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StatusCode::Ok => "success",
            StatusCode::BusySocket => "busy socket",
            StatusCode::TcpTimeout => "TCP timeout",
            StatusCode::CommandTooLong => "command string too long",
            StatusCode::UnknownCommand => "unknown command",
            StatusCode::WrongFormat => "wrong command format",
            StatusCode::WrongObjectType => "wrong object type",
            StatusCode::WrongParameterCount => "wrong number of parameters",
            StatusCode::WrongParameterType => "wrong parameter type",
            StatusCode::ParameterOutOfRange => "parameter out of range",
            StatusCode::UnknownPositioner => "unknown positioner",
            StatusCode::UnknownGroup => "unknown group",
            StatusCode::NotAllowedAction => "not allowed action",
            StatusCode::FollowingError => "following error",
            StatusCode::EmergencySignal => "emergency signal",
            StatusCode::MotionDoneTimeout => "motion done timeout",
            StatusCode::Other(_) => "device error",
        };
        write!(f, "{} ({})", self.code(), label)
    }
}

/// Group state as reported by a group status query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupState {
    NotInitialized(i32),
    ReadyFromHoming,
    ReadyFromMotion,
    Ready(i32),
    Disabled(i32),
    EmergencyBraking,
    MotorInitializing,
    NotReferenced,
    Homing,
    Moving,
    Trajectory,
    Other(i32),
}

impl GroupState {
    pub fn code(self) -> i32 {
        match self {
            GroupState::NotInitialized(c)
            | GroupState::Ready(c)
            | GroupState::Disabled(c)
            | GroupState::Other(c) => c,
            GroupState::ReadyFromHoming => 11,
            GroupState::ReadyFromMotion => 12,
            GroupState::EmergencyBraking => 40,
            GroupState::MotorInitializing => 41,
            GroupState::NotReferenced => 42,
            GroupState::Homing => 43,
            GroupState::Moving => 44,
            GroupState::Trajectory => 45,
        }
    }

    pub fn is_ready(self) -> bool {
        matches!(
            self,
            GroupState::ReadyFromHoming | GroupState::ReadyFromMotion | GroupState::Ready(_)
        )
    }

    pub fn needs_initialization(self) -> bool {
        matches!(self, GroupState::NotInitialized(_))
    }

    pub fn ready_for_home_search(self) -> bool {
        self == GroupState::NotReferenced
    }
}

impl From<i32> for GroupState {
    fn from(code: i32) -> Self {
        match code {
            0..=9 => GroupState::NotInitialized(code),
            11 => GroupState::ReadyFromHoming,
            12 => GroupState::ReadyFromMotion,
            10..=18 => GroupState::Ready(code),
            20..=39 => GroupState::Disabled(code),
            40 => GroupState::EmergencyBraking,
            41 => GroupState::MotorInitializing,
            42 => GroupState::NotReferenced,
            43 => GroupState::Homing,
            44 => GroupState::Moving,
            45 => GroupState::Trajectory,
            other => GroupState::Other(other),
        }
    }
}

impl fmt::Display for GroupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} [{}]", self, self.code())
    }
}

/// A raw controller reply split into status and payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: StatusCode,
    pub payload: String,
}

/// Low-level protocol handling
pub struct Protocol;

impl Protocol {
    /// Build the ASCII request for an API call.
    ///
    /// Output parameters are appended as placeholders (`int *`, `double *`,
    /// `char *`), which the controller fills in on the reply.
    pub fn format_command(
        command: &str,
        args: &[XpsValue],
        return_types: &[&str],
    ) -> Result<String, FlyError> {
        let params: Vec<String> = args
            .iter()
            .map(ToString::to_string)
            .chain(return_types.iter().map(|t| (*t).to_string()))
            .collect();
        let request = format!("{}({})", command, params.join(","));
        if request.len() > MAX_COMMAND_SIZE {
            return Err(FlyError::Protocol(format!(
                "Command {} exceeds {} bytes",
                command, MAX_COMMAND_SIZE
            )));
        }
        Ok(request)
    }

    /// Whether a receive buffer holds a complete reply.
    pub fn is_complete(buffer: &str) -> bool {
        buffer.trim_end().ends_with(END_OF_API)
    }

    /// Split `status,payload,EndOfAPI` into its parts.
    pub fn parse_reply(raw: &str) -> Result<Response, FlyError> {
        let body = raw
            .trim_end()
            .strip_suffix(END_OF_API)
            .ok_or_else(|| FlyError::Protocol(format!("Reply missing terminator: {raw:?}")))?;
        let body = body.strip_suffix(',').unwrap_or(body);

        let (status, payload) = match body.split_once(',') {
            Some((status, payload)) => (status, payload),
            None => (body, ""),
        };

        Ok(Response {
            status: StatusCode::parse(status)?,
            payload: payload.to_string(),
        })
    }

    /// Turn a non-zero status into a device error.
    pub fn check_status(response: Response, command: &str) -> Result<String, FlyError> {
        if response.status.is_ok() {
            Ok(response.payload)
        } else {
            debug!("{} returned {}: {}", command, response.status, response.payload);
            Err(FlyError::Device {
                code: response.status,
                command: command.to_string(),
                message: response.payload,
            })
        }
    }

    /// Split a success payload according to the requested output types.
    ///
    /// A trailing `char *` output swallows the rest of the payload, since
    /// string outputs may themselves contain separators.
    pub fn parse_payload(payload: &str, return_types: &[&str]) -> Result<Vec<XpsValue>, FlyError> {
        let mut values = Vec::with_capacity(return_types.len());
        let mut rest = payload;

        for (i, ty) in return_types.iter().enumerate() {
            let last = i + 1 == return_types.len();
            let field = if last && *ty == "char *" {
                std::mem::take(&mut rest)
            } else {
                match rest.split_once(',') {
                    Some((head, tail)) => {
                        rest = tail;
                        head
                    }
                    None => std::mem::take(&mut rest),
                }
            };

            let value = match *ty {
                "int *" | "short *" | "bool *" => XpsValue::Int(field.trim().parse().map_err(
                    |_| FlyError::Protocol(format!("Expected integer output, got {field:?}")),
                )?),
                "double *" => XpsValue::Double(field.trim().parse().map_err(|_| {
                    FlyError::Protocol(format!("Expected double output, got {field:?}"))
                })?),
                "char *" => XpsValue::String(field.to_string()),
                other => {
                    return Err(FlyError::Protocol(format!("Unsupported output type {other}")));
                }
            };
            values.push(value);
        }

        Ok(values)
    }
}
