pub mod completion;
pub mod config;
pub mod detector;
pub mod error;
pub mod flyscan;
pub mod link;
pub mod logger;
pub mod plotting;
pub mod profile;
pub mod readback;
pub mod recovery;
pub mod registry;
pub mod transport;
pub mod types;
pub mod utils;
pub mod xps;

pub use completion::{completion_pair, CancelToken, Completer, CompletionHandle, RunOutcome};
pub use config::{load_config, load_config_or_default, AppConfig};
pub use detector::{Detector, LogFileDetector, NullShutter, Shutter};
pub use error::FlyError;
pub use flyscan::{
    AggregatedRecord, DataKey, FlyScanCoordinator, FlyScanOptions, Phase,
    TrajectoryConfiguration,
};
pub use link::{ControllerLink, RetryPolicy};
pub use logger::RunRecorder;
pub use plotting::plot_readback;
pub use profile::{
    synthesize, Profile, ProfileGenerator, Segment, SegmentTable, TrajectoryParams,
    TrajectorySpec,
};
pub use readback::{align, ReadbackSeries};
pub use recovery::FaultRecovery;
pub use registry::{AxisBinding, AxisGroup, AxisGroupRegistry};
pub use transport::{export, FileStore, FtpSettings, FtpStore, ProfileTransport, TrajectoryFile};
pub use types::{Direction, ScanDirection, TriggerMode, XpsValue};
pub use utils::{poll_until, PollError};
pub use xps::{
    ConnectionConfig, GroupState, PvtVerificationResult, StatusCode, TcpTransport, Transport,
    XpsClient, XpsClientBuilder,
};
#[cfg(any(test, feature = "mock"))]
pub use xps::MockController;
