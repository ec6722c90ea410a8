//! Trajectory file export, upload and controller-side verification.

use crate::error::FlyError;
use crate::link::ControllerLink;
use crate::profile::{SegmentTable, TrajectorySpec};
use crate::types::ScanDirection;
use crate::xps::PvtVerificationResult;
use log::{debug, info, warn};
use std::fmt::Write as _;
use std::io::Cursor;
use suppaftp::types::FileType;
use suppaftp::FtpStream;

/// A trajectory file ready for upload.
#[derive(Debug, Clone, PartialEq)]
pub struct TrajectoryFile {
    pub name: String,
    pub contents: String,
}

/// Render one direction table as controller PVT rows.
///
/// Each row is `dt, disp_1, vel_1, disp_2, vel_2, ...` across every
/// positioner of the fast axis' group; positioners not taking part get zero
/// columns.
pub fn export_table(table: &SegmentTable, index: usize, group_size: usize) -> String {
    let mut out = String::new();
    for segment in &table.segments {
        let mut columns = vec![0.0; 1 + 2 * group_size];
        columns[0] = segment.duration;
        columns[2 * index + 1] = segment.displacement;
        columns[2 * index + 2] = segment.velocity;

        let row: Vec<String> = columns.iter().map(|v| format!("{v:.6}")).collect();
        let _ = writeln!(out, "{}", row.join(", "));
    }
    out
}

/// Both files of a spec, forward first.
pub fn export(spec: &TrajectorySpec) -> Vec<TrajectoryFile> {
    let axis = &spec.fast_axis;
    [ScanDirection::Forward, ScanDirection::Backward]
        .into_iter()
        .map(|direction| TrajectoryFile {
            name: spec.file_name(direction).to_string(),
            contents: export_table(spec.table(direction), axis.index, axis.group_size),
        })
        .collect()
}

/// Destination for trajectory files.
pub trait FileStore: Send + Sync {
    fn upload(&self, files: &[TrajectoryFile]) -> Result<(), FlyError>;
}

/// Connection settings for the controller's FTP server.
#[derive(Debug, Clone)]
pub struct FtpSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub directory: String,
}

impl Default for FtpSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 21,
            username: "Administrator".to_string(),
            password: "Administrator".to_string(),
            directory: "Public/Trajectories".to_string(),
        }
    }
}

/// Uploads over FTP, one session per upload.
#[derive(Debug, Clone)]
pub struct FtpStore {
    settings: FtpSettings,
}

impl FtpStore {
    pub fn new(settings: FtpSettings) -> Self {
        Self { settings }
    }
}

fn ftp_err(step: &str) -> impl FnOnce(suppaftp::FtpError) -> FlyError + '_ {
    move |e| FlyError::Transfer(format!("{step}: {e}"))
}

impl FileStore for FtpStore {
    fn upload(&self, files: &[TrajectoryFile]) -> Result<(), FlyError> {
        let s = &self.settings;
        let mut ftp =
            FtpStream::connect((s.host.as_str(), s.port)).map_err(ftp_err("connect"))?;
        ftp.login(s.username.as_str(), s.password.as_str())
            .map_err(ftp_err("login"))?;
        ftp.cwd(s.directory.as_str()).map_err(ftp_err("cwd"))?;
        ftp.transfer_type(FileType::Binary)
            .map_err(ftp_err("transfer type"))?;

        for file in files {
            let mut reader = Cursor::new(file.contents.as_bytes());
            let bytes = ftp
                .put_file(file.name.as_str(), &mut reader)
                .map_err(ftp_err("store"))?;
            debug!("Stored {} ({bytes} bytes)", file.name);
        }

        if let Err(e) = ftp.quit() {
            warn!("FTP quit failed: {e}");
        }
        Ok(())
    }
}

/// Pushes trajectory files to the controller and has them verified.
pub struct ProfileTransport {
    store: Box<dyn FileStore>,
}

impl ProfileTransport {
    pub fn new(store: Box<dyn FileStore>) -> Self {
        Self { store }
    }

    pub fn upload(&self, files: &[TrajectoryFile]) -> Result<(), FlyError> {
        self.store.upload(files)
    }

    /// Verify each uploaded file for `group`. A rejection carries the
    /// controller's diagnostic.
    pub fn verify(
        &self,
        link: &ControllerLink,
        group: &str,
        positioner: &str,
        files: &[TrajectoryFile],
    ) -> Result<Vec<PvtVerificationResult>, FlyError> {
        let mut results = Vec::with_capacity(files.len());
        for file in files {
            link.command(|c| c.multiple_axes_pvt_verification(group, &file.name))
                .map_err(|e| match e {
                    FlyError::Device { code, message, .. } => FlyError::Verify {
                        file: file.name.clone(),
                        message: format!("{code}: {message}"),
                    },
                    other => other,
                })?;

            let result = link.read(|c| c.multiple_axes_pvt_verification_result_get(positioner))?;
            info!(
                "Verified {}: position [{}, {}], max velocity {}, max acceleration {}",
                file.name,
                result.min_position,
                result.max_position,
                result.max_velocity,
                result.max_acceleration
            );
            results.push(result);
        }
        Ok(results)
    }

    /// Export, upload and verify both files of `spec`. The spec is marked
    /// verified only if every step succeeds; otherwise it is left
    /// unverified and a retry must start from a fresh export.
    pub fn publish(
        &self,
        link: &ControllerLink,
        spec: &mut TrajectorySpec,
    ) -> Result<Vec<PvtVerificationResult>, FlyError> {
        spec.set_verified(false);
        let files = export(spec);
        self.upload(&files)?;
        let results = self.verify(link, spec.group(), &spec.fast_axis.positioner, &files)?;
        spec.set_verified(true);
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::RetryPolicy;
    use crate::profile::{ProfileGenerator, TrajectoryParams};
    use crate::registry::AxisBinding;
    use crate::types::Direction;
    use crate::xps::mock::MockController;
    use crate::xps::XpsClient;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Default, Clone)]
    struct MemoryStore {
        files: Arc<Mutex<Vec<TrajectoryFile>>>,
        fail: bool,
    }

    impl FileStore for MemoryStore {
        fn upload(&self, files: &[TrajectoryFile]) -> Result<(), FlyError> {
            if self.fail {
                return Err(FlyError::Transfer("login: 530".to_string()));
            }
            self.files.lock().extend_from_slice(files);
            Ok(())
        }
    }

    fn spec() -> TrajectorySpec {
        let axis = AxisBinding {
            logical_name: "ss_y".to_string(),
            positioner: "scan.Y".to_string(),
            group: "scan".to_string(),
            index: 1,
            group_size: 3,
            direction: Direction::Positive,
            unit: "mm".to_string(),
            settle_time: Duration::ZERO,
        };
        let params = TrajectoryParams {
            n_segments: 4,
            segment_displacement: 0.5,
            segment_duration: 0.1,
            ramp_segments: 2,
            ..TrajectoryParams::default()
        };
        ProfileGenerator::new("t").generate(&axis, None, &params).unwrap()
    }

    fn link(mock: &MockController) -> ControllerLink {
        ControllerLink::new(
            XpsClient::with_transport(mock.transport()),
            RetryPolicy {
                retry_delay: Duration::from_millis(1),
                command_retries: 0,
            },
        )
    }

    #[test]
    fn export_places_axis_columns_by_index() {
        let spec = spec();
        let files = export(&spec);
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].name, "TrajScan_FW.trj-t");

        let rows: Vec<&str> = files[0].contents.lines().collect();
        assert_eq!(rows.len(), 8);
        let cruise: Vec<&str> = rows[3].split(", ").collect();
        assert_eq!(cruise.len(), 7);
        assert_eq!(cruise[0], "0.100000");
        assert_eq!(cruise[1], "0.000000");
        assert_eq!(cruise[3], "0.500000");
        assert_eq!(cruise[4], "5.000000");
        assert_eq!(cruise[6], "0.000000");

        let back: Vec<&str> = files[1].contents.lines().nth(3).unwrap().split(", ").collect();
        assert_eq!(back[3], "-0.500000");
        assert_eq!(back[4], "-5.000000");
    }

    #[test]
    fn publish_marks_verified() {
        let mock = MockController::new();
        mock.reply(
            "MultipleAxesPVTVerificationResultGet",
            "0,TrajScan_FW.trj-t,-1.0,2.0,5.0,50.0,EndOfAPI",
        );
        let store = MemoryStore::default();
        let transport = ProfileTransport::new(Box::new(store.clone()));

        let mut spec = spec();
        let results = transport.publish(&link(&mock), &mut spec).unwrap();
        assert!(spec.is_verified());
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].max_velocity, 5.0);
        assert_eq!(store.files.lock().len(), 2);
        assert_eq!(mock.count("MultipleAxesPVTVerification"), 2);
    }

    #[test]
    fn rejected_file_leaves_spec_unverified() {
        let mock = MockController::new();
        mock.reply_once("MultipleAxesPVTVerification", "0,EndOfAPI");
        mock.reply(
            "MultipleAxesPVTVerification",
            "-69,MultipleAxesPVTVerification(scan,TrajScan_BK.trj-t),EndOfAPI",
        );
        mock.reply(
            "MultipleAxesPVTVerificationResultGet",
            "0,TrajScan_FW.trj-t,-1.0,2.0,5.0,50.0,EndOfAPI",
        );
        let transport = ProfileTransport::new(Box::new(MemoryStore::default()));

        let mut spec = spec();
        match transport.publish(&link(&mock), &mut spec) {
            Err(FlyError::Verify { file, .. }) => assert_eq!(file, "TrajScan_BK.trj-t"),
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(!spec.is_verified());
    }

    #[test]
    fn upload_failure_skips_verification() {
        let mock = MockController::new();
        let transport = ProfileTransport::new(Box::new(MemoryStore {
            fail: true,
            ..MemoryStore::default()
        }));

        let mut spec = spec();
        assert!(matches!(
            transport.publish(&link(&mock), &mut spec),
            Err(FlyError::Transfer(_))
        ));
        assert!(!spec.is_verified());
        assert!(mock.requests().is_empty());
    }
}
