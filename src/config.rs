use crate::error::FlyError;
use crate::profile::TrajectoryParams;
use crate::transport::FtpSettings;
use crate::types::Direction;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct AppConfig {
    pub controller: ControllerConfig,
    pub file_transfer: FileTransferConfig,
    pub scan: ScanConfig,
    pub axes: Vec<AxisConfig>,
    pub recording: RecordingConfig,
    pub console: ConsoleConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ControllerConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub command_retries: usize,
    pub retry_delay_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct FileTransferConfig {
    pub port: u16,
    pub username: String,
    pub password: String,
    pub directory: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ScanConfig {
    pub group: String,
    pub fast_axis: String,
    pub slow_axis: Option<String>,
    pub n_segments: usize,
    pub segment_displacement: f64,
    pub segment_duration: f64,
    pub ramp_segments: usize,
    pub slow_displacement: f64,
    pub start: f64,
    pub legs: usize,
}

/// Maps a logical axis name onto a controller positioner.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AxisConfig {
    pub name: String,
    /// Positioner name, with or without the `group.` prefix
    pub positioner: String,
    pub unit: String,
    pub direction: Direction,
    pub settle_time_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RecordingConfig {
    pub enabled: bool,
    pub output_path: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ConsoleConfig {
    pub verbosity: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            host: "192.168.0.254".to_string(),
            port: 5001,
            connect_timeout_ms: 5000,
            read_timeout_ms: 10000,
            command_retries: 3,
            retry_delay_ms: 500,
        }
    }
}

impl Default for FileTransferConfig {
    fn default() -> Self {
        Self {
            port: 21,
            username: "Administrator".to_string(),
            password: "Administrator".to_string(),
            directory: "Public/Trajectories".to_string(),
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            group: "scan".to_string(),
            fast_axis: "ss_x".to_string(),
            slow_axis: None,
            n_segments: 10,
            segment_displacement: 0.1,
            segment_duration: 0.1,
            ramp_segments: 2,
            slow_displacement: 0.0,
            start: 0.0,
            legs: 1,
        }
    }
}

impl Default for AxisConfig {
    fn default() -> Self {
        Self {
            name: "ss_x".to_string(),
            positioner: "X".to_string(),
            unit: "mm".to_string(),
            direction: Direction::Positive,
            settle_time_ms: 0,
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            output_path: "./runs".to_string(),
        }
    }
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            verbosity: "info".to_string(),
        }
    }
}

impl ControllerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl ScanConfig {
    pub fn trajectory_params(&self) -> TrajectoryParams {
        TrajectoryParams {
            n_segments: self.n_segments,
            segment_displacement: self.segment_displacement,
            segment_duration: self.segment_duration,
            ramp_segments: self.ramp_segments,
            start: self.start,
            slow_displacement: self.slow_displacement,
        }
    }
}

impl AppConfig {
    pub fn axis(&self, name: &str) -> Option<&AxisConfig> {
        self.axes.iter().find(|a| a.name == name)
    }

    pub fn ftp_settings(&self) -> FtpSettings {
        FtpSettings {
            host: self.controller.host.clone(),
            port: self.file_transfer.port,
            username: self.file_transfer.username.clone(),
            password: self.file_transfer.password.clone(),
            directory: self.file_transfer.directory.clone(),
        }
    }

    /// Reject settings that could only fail later against the hardware.
    pub fn validate(&self) -> Result<(), FlyError> {
        if self.controller.host.trim().is_empty() {
            return Err(FlyError::Config("controller.host is empty".to_string()));
        }
        if self.controller.port == 0 || self.file_transfer.port == 0 {
            return Err(FlyError::Config("ports must be non-zero".to_string()));
        }
        if self.scan.legs == 0 {
            return Err(FlyError::Config("scan.legs must be at least 1".to_string()));
        }
        self.scan.trajectory_params().validate()?;

        if self.axis(&self.scan.fast_axis).is_none() {
            return Err(FlyError::Config(format!(
                "fast axis {} has no [[axes]] entry",
                self.scan.fast_axis
            )));
        }
        if let Some(slow) = &self.scan.slow_axis {
            if self.axis(slow).is_none() {
                return Err(FlyError::Config(format!(
                    "slow axis {slow} has no [[axes]] entry"
                )));
            }
            if slow == &self.scan.fast_axis {
                return Err(FlyError::Config(
                    "fast and slow axis must differ".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Load configuration from file with layered fallbacks
pub fn load_config(config_path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder().add_source(Config::try_from(&AppConfig::default())?);

    if let Some(path) = config_path {
        if path.exists() {
            builder = builder.add_source(File::from(path));
        } else {
            return Err(ConfigError::Message(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
    } else {
        for path in &["fly-scan.toml", "config.toml"] {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
                break;
            }
        }
    }

    // PVT_FLYER_SCAN__N_SEGMENTS=20 overrides scan.n_segments
    builder = builder.add_source(
        Environment::with_prefix("PVT_FLYER")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize::<AppConfig>()
}

/// Load configuration, falling back to defaults on any error
pub fn load_config_or_default(config_path: Option<&Path>) -> AppConfig {
    match load_config(config_path) {
        Ok(config) => {
            log::info!("Configuration loaded successfully");
            config
        }
        Err(e) => {
            log::warn!("Failed to load config ({}), using defaults", e);
            AppConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn with_axes() -> AppConfig {
        AppConfig {
            axes: vec![
                AxisConfig::default(),
                AxisConfig {
                    name: "ss_y".to_string(),
                    positioner: "Y".to_string(),
                    direction: Direction::Negative,
                    ..AxisConfig::default()
                },
            ],
            ..AppConfig::default()
        }
    }

    #[test]
    fn defaults_need_an_axis_table() {
        assert!(matches!(AppConfig::default().validate(), Err(FlyError::Config(_))));
        assert!(with_axes().validate().is_ok());
    }

    #[test]
    fn bad_scan_parameters_are_rejected() {
        let mut config = with_axes();
        config.scan.ramp_segments = 1;
        assert!(matches!(config.validate(), Err(FlyError::Validation(_))));

        let mut config = with_axes();
        config.scan.slow_axis = Some("ss_z".to_string());
        assert!(matches!(config.validate(), Err(FlyError::Config(_))));

        let mut config = with_axes();
        config.scan.slow_axis = Some("ss_x".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[controller]
host = "10.0.0.5"

[scan]
fast_axis = "ss_y"
n_segments = 25
ramp_segments = 3

[[axes]]
name = "ss_y"
positioner = "scan.Y"
unit = "mm"
direction = -1
settle_time_ms = 50
"#
        )
        .unwrap();

        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.controller.host, "10.0.0.5");
        assert_eq!(config.controller.port, 5001);
        assert_eq!(config.scan.n_segments, 25);
        assert_eq!(config.axes.len(), 1);
        assert_eq!(config.axes[0].direction, Direction::Negative);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(load_config(Some(Path::new("/nonexistent/fly.toml"))).is_err());
    }
}
