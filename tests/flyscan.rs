mod common;

use common::*;
use pvt_flyer::{CancelToken, Direction, FlyError, Phase, ScanDirection};
use std::time::Duration;

fn position(requests: &[String], prefix: &str) -> usize {
    requests
        .iter()
        .position(|r| r.starts_with(prefix))
        .unwrap_or_else(|| panic!("{prefix} was never sent"))
}

#[test]
fn leg_runs_to_completion() {
    let mut rig = rig(healthy_controller());
    rig.flyer.define(&rig.fast, None, &params()).unwrap();
    assert!(rig.flyer.spec().unwrap().is_verified());
    assert_eq!(rig.store.files.lock().len(), 2);

    rig.flyer.stage().unwrap();
    assert_eq!(rig.flyer.phase(), Phase::Staged);

    let mut handle = rig.flyer.kickoff().unwrap();
    let readback = rig
        .flyer
        .complete(&mut handle, &CancelToken::new())
        .unwrap();

    assert_eq!(rig.flyer.phase(), Phase::Completed);
    assert_eq!(readback.len(), N + 1);
    let t0 = readback.timestamps[0];
    for (i, t) in readback.timestamps.iter().enumerate() {
        assert!((t - (t0 + i as f64 * DT)).abs() < 1e-9);
    }
    assert_eq!(rig.shutter.closed(), 0);

    let requests = rig.mock.requests();
    assert!(requests
        .iter()
        .any(|r| r == "MultipleAxesPVTPulseOutputSet(scan,4,14,0.01)"));
    assert!(requests
        .iter()
        .any(|r| r == "GatheringConfigurationSet(scan.X.CurrentPosition)"));
    assert!(requests.iter().any(|r| r.starts_with(
        "EventExtendedConfigurationTriggerSet(Always,0,0,0,0,scan.PVT.TrajectoryPulse,0,0,0,0)"
    )));

    let order = [
        "GroupMoveAbsolute(scan.X,",
        "GatheringReset(",
        "MultipleAxesPVTPulseOutputSet(",
        "GatheringConfigurationSet(",
        "EventExtendedStart(",
        "MultipleAxesPVTExecution(scan,TrajScan_FW.trj-test,1)",
        "GatheringStopAndSave(",
        "GatheringDataMultipleLinesGet(0,11,",
    ];
    let indices: Vec<usize> = order.iter().map(|p| position(&requests, p)).collect();
    assert!(indices.windows(2).all(|w| w[0] < w[1]), "{indices:?}");

    // Two stale events plus the capture event itself.
    assert_eq!(rig.mock.count("EventExtendedRemove"), 3);
    assert!(requests.iter().any(|r| r == "EventExtendedRemove(7)"));

    let record = rig.flyer.collect().unwrap();
    assert_eq!(record.fast_axis, "ss_x");
    assert_eq!(record.fast.len(), N + 1);
    assert!(record.slow.is_none());
    assert!(record.frame_timestamps.iter().all(Option::is_none));
}

#[test]
fn device_error_aborts_the_leg() {
    let mock = healthy_controller();
    mock.reply(
        "MultipleAxesPVTExecution",
        "-22,MultipleAxesPVTExecution(scan,TrajScan_FW.trj-test,1),EndOfAPI",
    );
    let mut rig = rig(mock);
    rig.flyer.define(&rig.fast, None, &params()).unwrap();
    rig.flyer.stage().unwrap();

    let mut handle = rig.flyer.kickoff().unwrap();
    let result = rig.flyer.complete(&mut handle, &CancelToken::new());

    assert!(matches!(result, Err(FlyError::IncompleteRun)));
    assert_eq!(rig.flyer.phase(), Phase::Aborted);
    assert_eq!(rig.shutter.closed(), 1);
    assert!(!handle.outcome().unwrap().is_success());
    assert!(rig.flyer.last_fault().unwrap().contains("-22"));

    assert_eq!(rig.mock.count("GatheringStopAndSave"), 0);
    assert!(matches!(
        rig.flyer.collect(),
        Err(FlyError::InvalidState { .. })
    ));

    // A fresh stage makes the coordinator usable again.
    rig.flyer.stage().unwrap();
    assert_eq!(rig.flyer.phase(), Phase::Staged);
}

#[test]
fn second_kickoff_while_running_is_refused() {
    let mock = healthy_controller();
    mock.delay("MultipleAxesPVTExecution", Duration::from_millis(300));
    let mut rig = rig(mock);
    rig.flyer.define(&rig.fast, None, &params()).unwrap();
    rig.flyer.stage().unwrap();

    let mut handle = rig.flyer.kickoff().unwrap();
    assert!(matches!(rig.flyer.kickoff(), Err(FlyError::AlreadyRunning)));
    assert!(matches!(rig.flyer.stage(), Err(FlyError::AlreadyRunning)));

    rig.flyer
        .complete(&mut handle, &CancelToken::new())
        .unwrap();
    assert_eq!(rig.mock.count("MultipleAxesPVTExecution"), 1);

    // Completed legs may be followed directly by the next one.
    rig.flyer.select_forward(false);
    let mut handle = rig.flyer.kickoff().unwrap();
    rig.flyer
        .complete(&mut handle, &CancelToken::new())
        .unwrap();
    assert_eq!(rig.mock.count("MultipleAxesPVTExecution"), 2);
}

#[test]
fn unverified_trajectory_never_reaches_the_controller() {
    let mut rig = rig(healthy_controller());
    assert!(matches!(rig.flyer.kickoff(), Err(FlyError::NotVerified)));
    assert!(rig.mock.requests().is_empty());

    rig.mock.reply(
        "MultipleAxesPVTVerification",
        "-69,MultipleAxesPVTVerification(scan,TrajScan_FW.trj-test),EndOfAPI",
    );
    assert!(matches!(
        rig.flyer.define(&rig.fast, None, &params()),
        Err(FlyError::Verify { .. })
    ));
    assert!(!rig.flyer.spec().unwrap().is_verified());
    rig.flyer.stage().unwrap();

    let sent = rig.mock.requests().len();
    assert!(matches!(rig.flyer.kickoff(), Err(FlyError::NotVerified)));
    assert_eq!(rig.mock.requests().len(), sent);
}

#[test]
fn invalid_parameters_are_rejected_before_io() {
    let mut rig = rig(healthy_controller());
    let mut bad = params();
    bad.ramp_segments = 1;
    assert!(matches!(
        rig.flyer.define(&rig.fast, None, &bad),
        Err(FlyError::Validation(_))
    ));
    assert!(rig.mock.requests().is_empty());
}

#[test]
fn velocity_above_positioner_limit_is_rejected() {
    let mock = healthy_controller();
    mock.reply(
        "PositionerMaximumVelocityAndAccelerationGet",
        "0,5.0,1000.0,EndOfAPI",
    );
    let mut rig = rig(mock);
    assert!(matches!(
        rig.flyer.define(&rig.fast, None, &params()),
        Err(FlyError::Validation(_))
    ));
    assert!(rig.store.files.lock().is_empty());
}

#[test]
fn short_readback_is_a_warning_only() {
    let mock = healthy_controller();
    mock.reply("GatheringCurrentNumberGet", &format!("0,{N},100000,EndOfAPI"));
    mock.reply("GatheringDataMultipleLinesGet", &gathering_reply(N));
    let mut rig = rig(mock);
    rig.flyer.define(&rig.fast, None, &params()).unwrap();
    rig.flyer.stage().unwrap();

    let mut handle = rig.flyer.kickoff().unwrap();
    let readback = rig
        .flyer
        .complete(&mut handle, &CancelToken::new())
        .unwrap();
    assert_eq!(readback.len(), N);
    assert_eq!(rig.flyer.phase(), Phase::Completed);
}

#[test]
fn serpentine_scan_with_slow_axis() {
    let mut rig = rig(healthy_controller());
    let fast = rig.fast.clone();
    let slow = rig.slow.clone();
    rig.flyer.define(&fast, Some(&slow), &params()).unwrap();
    rig.flyer.stage().unwrap();

    for leg in 0..2 {
        rig.flyer.select_forward(leg % 2 == 0);
        let mut handle = rig.flyer.kickoff().unwrap();
        rig.flyer
            .complete(&mut handle, &CancelToken::new())
            .unwrap();
        if leg == 0 {
            let target = rig.flyer.advance_slow_axis().unwrap();
            assert!((target - 1.75).abs() < 1e-12);
        }
    }
    assert_eq!(rig.flyer.direction(), ScanDirection::Backward);

    let requests = rig.mock.requests();
    assert!(requests
        .iter()
        .any(|r| r == "MultipleAxesPVTExecution(scan,TrajScan_BK.trj-test,1)"));
    assert!(requests.iter().any(|r| r == "GroupMoveAbsolute(scan.Y,1.75)"));

    let record = rig.flyer.collect().unwrap();
    assert_eq!(record.fast.len(), 2 * (N + 1));
    let slow_series = record.slow.unwrap();
    assert_eq!(slow_series.positions, vec![1.5, 1.5]);
    assert_eq!(record.slow_axis.as_deref(), Some("ss_y"));

    let keys = rig.flyer.describe_collect().unwrap();
    assert!(keys.contains_key("ss_x"));
    assert!(keys.contains_key("ss_y"));

    let config = rig.flyer.configuration().unwrap();
    assert_eq!(config.n_segments, N);
    assert_eq!(config.ramp_segments, NR);
    assert!(config.verified);
    assert!(config.ready_positions[0] < 0.0);
    assert!(config.ready_positions[1] > N as f64 * DX);
}

#[test]
fn abort_during_preroll_runs_safe_stop() {
    let mock = healthy_controller();
    mock.reply("GroupMotionStatusGet", "0,1,0,EndOfAPI");
    let mut rig = rig(mock);
    rig.flyer.define(&rig.fast, None, &params()).unwrap();
    rig.flyer.stage().unwrap();

    let mut handle = rig.flyer.kickoff().unwrap();
    std::thread::sleep(Duration::from_millis(20));
    rig.flyer.abort();

    let result = rig.flyer.complete(&mut handle, &CancelToken::new());
    assert!(matches!(result, Err(FlyError::IncompleteRun)));
    assert_eq!(rig.shutter.closed(), 1);
    assert_eq!(rig.mock.count("MultipleAxesPVTExecution"), 0);
}

#[test]
fn cancelled_wait_aborts_the_leg() {
    let mock = healthy_controller();
    mock.delay("MultipleAxesPVTExecution", Duration::from_millis(200));
    let mut rig = rig(mock);
    rig.flyer.define(&rig.fast, None, &params()).unwrap();
    rig.flyer.stage().unwrap();

    let mut handle = rig.flyer.kickoff().unwrap();
    let cancel = CancelToken::new();
    cancel.cancel();
    assert!(matches!(
        rig.flyer.complete(&mut handle, &cancel),
        Err(FlyError::Cancelled)
    ));

    rig.flyer.unstage().unwrap();
    assert_eq!(rig.flyer.phase(), Phase::Idle);
    assert_eq!(rig.shutter.closed(), 1);
    assert_eq!(rig.mock.count("GatheringStopAndSave"), 0);
}

#[test]
fn readback_follows_the_axis_direction() {
    let mut rig = rig(healthy_controller());
    let mut registry = registry();
    let fast = bind_with(&mut registry, "X", "ss_x", Direction::Negative);
    let slow = bind_with(&mut registry, "Y", "ss_y", Direction::Negative);

    rig.flyer.define(&fast, Some(&slow), &params()).unwrap();
    rig.flyer.stage().unwrap();
    let mut handle = rig.flyer.kickoff().unwrap();
    let readback = rig
        .flyer
        .complete(&mut handle, &CancelToken::new())
        .unwrap();

    assert_eq!(readback.len(), N + 1);
    assert_eq!(readback.positions[1], -0.1);
    assert_eq!(readback.positions[N], -1.0);

    // Both series of the record are in logical coordinates.
    let record = rig.flyer.collect().unwrap();
    assert_eq!(record.fast.positions[1], -0.1);
    assert_eq!(record.slow.unwrap().positions, vec![-1.5]);
}
