#![allow(dead_code)]

use parking_lot::Mutex;
use pvt_flyer::xps::protocol::GroupState;
use pvt_flyer::{
    AxisBinding, AxisGroup, AxisGroupRegistry, ControllerLink, Direction, FaultRecovery, FileStore,
    FlyError, FlyScanCoordinator, FlyScanOptions, MockController, ProfileGenerator,
    ProfileTransport, RetryPolicy, Shutter, TrajectoryFile, TrajectoryParams, XpsClient,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Keeps uploads in memory.
#[derive(Default, Clone)]
pub struct MemoryStore {
    pub files: Arc<Mutex<Vec<TrajectoryFile>>>,
}

impl FileStore for MemoryStore {
    fn upload(&self, files: &[TrajectoryFile]) -> Result<(), FlyError> {
        self.files.lock().extend_from_slice(files);
        Ok(())
    }
}

#[derive(Default)]
pub struct CountingShutter(AtomicUsize);

impl CountingShutter {
    pub fn closed(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

impl Shutter for CountingShutter {
    fn close(&self) -> Result<(), FlyError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub const N: usize = 10;
pub const NR: usize = 3;
pub const DX: f64 = 0.1;
pub const DT: f64 = 0.01;

pub fn params() -> TrajectoryParams {
    TrajectoryParams {
        n_segments: N,
        segment_displacement: DX,
        segment_duration: DT,
        ramp_segments: NR,
        start: 0.0,
        slow_displacement: 0.25,
    }
}

/// Gathering reply with `count` samples.
pub fn gathering_reply(count: usize) -> String {
    let lines: String = (0..count).map(|i| format!("{:.4}\n", i as f64 * DX)).collect();
    format!("0,{lines},EndOfAPI")
}

/// A controller that runs every trajectory successfully.
pub fn healthy_controller() -> MockController {
    let mock = MockController::new();
    mock.reply(
        "PositionerMaximumVelocityAndAccelerationGet",
        "0,100.0,1000.0,EndOfAPI",
    );
    mock.reply(
        "MultipleAxesPVTVerificationResultGet",
        "0,TrajScan_FW.trj-test,-0.2,1.2,10.0,1500.0,EndOfAPI",
    );
    mock.reply("GroupMotionStatusGet", "0,0,0,EndOfAPI");
    mock.reply("GroupPositionCurrentGet", "0,0.0,1.5,EndOfAPI");
    mock.reply("GroupStatusGet", "0,12,EndOfAPI");
    mock.reply("EventExtendedAllGet", "0,3;4,EndOfAPI");
    mock.reply("EventExtendedStart", "0,7,EndOfAPI");
    mock.reply("GatheringCurrentNumberGet", &format!("0,{},100000,EndOfAPI", N + 1));
    mock.reply("GatheringDataMultipleLinesGet", &gathering_reply(N + 1));
    mock
}

pub fn link(mock: &MockController) -> Arc<ControllerLink> {
    Arc::new(ControllerLink::new(
        XpsClient::with_transport(mock.transport()),
        RetryPolicy {
            retry_delay: Duration::from_millis(1),
            command_retries: 1,
        },
    ))
}

pub fn registry() -> AxisGroupRegistry {
    AxisGroupRegistry::from_groups(vec![AxisGroup {
        name: "scan".to_string(),
        members: vec!["scan.X".to_string(), "scan.Y".to_string()],
        state: GroupState::ReadyFromMotion,
    }])
}

pub fn bind(registry: &mut AxisGroupRegistry, axis: &str, name: &str) -> AxisBinding {
    bind_with(registry, axis, name, Direction::Positive)
}

pub fn bind_with(
    registry: &mut AxisGroupRegistry,
    axis: &str,
    name: &str,
    direction: Direction,
) -> AxisBinding {
    registry
        .bind("scan", axis, name, "mm", direction, Duration::ZERO)
        .unwrap()
}

pub struct Rig {
    pub mock: MockController,
    pub store: MemoryStore,
    pub shutter: Arc<CountingShutter>,
    pub flyer: FlyScanCoordinator,
    pub fast: AxisBinding,
    pub slow: AxisBinding,
}

pub fn rig(mock: MockController) -> Rig {
    let store = MemoryStore::default();
    let shutter = Arc::new(CountingShutter::default());
    let recovery = FaultRecovery::new(shutter.clone(), None).with_settle(Duration::ZERO);
    let flyer = FlyScanCoordinator::new(
        link(&mock),
        ProfileTransport::new(Box::new(store.clone())),
        recovery,
    )
    .with_generator(ProfileGenerator::new("test"))
    .with_options(FlyScanOptions {
        poll_interval: Duration::from_millis(1),
        complete_poll: Duration::from_millis(2),
        complete_timeout: Some(Duration::from_secs(10)),
        ..FlyScanOptions::default()
    });

    let mut registry = registry();
    let fast = bind(&mut registry, "X", "ss_x");
    let slow = bind(&mut registry, "Y", "ss_y");

    Rig {
        mock,
        store,
        shutter,
        flyer,
        fast,
        slow,
    }
}
