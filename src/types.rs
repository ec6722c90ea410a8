use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::FlyError;

/// A single argument or return value of a controller API call.
#[derive(Debug, Clone, PartialEq)]
pub enum XpsValue {
    Int(i32),
    Double(f64),
    String(String),
}

impl From<i32> for XpsValue {
    fn from(value: i32) -> Self {
        XpsValue::Int(value)
    }
}

impl From<usize> for XpsValue {
    fn from(value: usize) -> Self {
        XpsValue::Int(value as i32)
    }
}

impl From<f64> for XpsValue {
    fn from(value: f64) -> Self {
        XpsValue::Double(value)
    }
}

impl From<&str> for XpsValue {
    fn from(value: &str) -> Self {
        XpsValue::String(value.to_string())
    }
}

impl From<String> for XpsValue {
    fn from(value: String) -> Self {
        XpsValue::String(value)
    }
}

impl fmt::Display for XpsValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            XpsValue::Int(v) => write!(f, "{v}"),
            XpsValue::Double(v) => write!(f, "{v}"),
            XpsValue::String(v) => write!(f, "{v}"),
        }
    }
}

impl XpsValue {
    pub fn as_i32(&self) -> Result<i32, FlyError> {
        match self {
            XpsValue::Int(v) => Ok(*v),
            XpsValue::String(s) => s
                .trim()
                .parse()
                .map_err(|_| FlyError::Protocol(format!("Expected integer, got {s:?}"))),
            XpsValue::Double(_) => Err(FlyError::Protocol(format!(
                "Expected integer, got {self:?}"
            ))),
        }
    }

    pub fn as_f64(&self) -> Result<f64, FlyError> {
        match self {
            XpsValue::Double(v) => Ok(*v),
            XpsValue::Int(v) => Ok(*v as f64),
            XpsValue::String(s) => s
                .trim()
                .parse()
                .map_err(|_| FlyError::Protocol(format!("Expected number, got {s:?}"))),
        }
    }

    pub fn as_str(&self) -> Result<&str, FlyError> {
        match self {
            XpsValue::String(s) => Ok(s),
            _ => Err(FlyError::Protocol(format!("Expected string, got {self:?}"))),
        }
    }
}

/// Sign relating the controller's physical axis to the logical axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "i8", into = "i8")]
pub enum Direction {
    #[default]
    Positive,
    Negative,
}

impl Direction {
    pub fn sign(self) -> f64 {
        match self {
            Direction::Positive => 1.0,
            Direction::Negative => -1.0,
        }
    }

    /// Logical position to physical controller position.
    pub fn to_physical(self, logical: f64) -> f64 {
        logical * self.sign()
    }

    /// Physical controller position to logical position.
    pub fn to_logical(self, physical: f64) -> f64 {
        physical * self.sign()
    }
}

impl TryFrom<i8> for Direction {
    type Error = FlyError;

    fn try_from(value: i8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Direction::Positive),
            -1 => Ok(Direction::Negative),
            _ => Err(FlyError::Validation(format!(
                "direction must be +1 or -1, got {value}"
            ))),
        }
    }
}

impl From<Direction> for i8 {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::Positive => 1,
            Direction::Negative => -1,
        }
    }
}

/// Which of the two uploaded trajectory tables a leg runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanDirection {
    Forward,
    Backward,
}

impl ScanDirection {
    pub fn from_forward(forward: bool) -> Self {
        if forward {
            ScanDirection::Forward
        } else {
            ScanDirection::Backward
        }
    }

    pub fn reversed(self) -> Self {
        match self {
            ScanDirection::Forward => ScanDirection::Backward,
            ScanDirection::Backward => ScanDirection::Forward,
        }
    }
}

impl fmt::Display for ScanDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanDirection::Forward => write!(f, "forward"),
            ScanDirection::Backward => write!(f, "backward"),
        }
    }
}

/// Detector trigger source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerMode {
    Internal,
    External,
}
