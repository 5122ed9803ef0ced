use std::sync::Arc;

use plcounter_backend::*;

fn setup(kcps: Option<f64>) -> (Arc<SimDriver>, DualTaskController<SimDriver>, AcquisitionLoop) {
    let sim = Arc::new(SimDriver::new());
    sim.set_photon_rate(kcps);
    let ctrl = DualTaskController::new(sim.clone());
    let acq = AcquisitionLoop::new(CounterSettings::from_driver(sim.as_ref()).unwrap());
    (sim, ctrl, acq)
}

#[test]
fn default_wiring() {
    let (sim, mut ctrl, mut acq) = setup(None);
    assert_eq!(acq.state(), AcqState::Idle);
    assert_eq!(acq.counting_time(), 0.1);

    acq.configure(&mut ctrl).unwrap();
    assert_eq!(acq.state(), AcqState::Armed);
    assert_eq!(acq.counting_time(), 1. / 200.);
    // Counter on ctr0, clock on ctr1, photons on PFI0
    assert_eq!(ctrl.gate_terminal(), Some("/Dev1/ctr1InternalOutput"));
    assert!(sim.calls().contains(&SimCall::SetTimebaseSrc {
        task: "counter1".to_string(),
        terminal: "/Dev1/PFI0".to_string()
    }));
    assert!(sim.calls().contains(&SimCall::CfgImplicitTiming {
        task: "clock1".to_string(),
        mode: SampleMode::Continuous,
        samps_per_chan: 1000
    }));
    assert!(sim.calls().contains(&SimCall::SetReadPolicy {
        task: "counter1".to_string(),
        policy: StreamReadPolicy::default()
    }));
}

#[test]
fn continuous_grab_reads_known_ticks() {
    let (sim, mut ctrl, mut acq) = setup(None);
    // Held by the card until the counter task starts
    sim.push_samples(&[100000, 150000]);

    let rates = acq.grab(&mut ctrl, true).unwrap();
    // 250000 ticks over 5 ms
    assert_eq!(rates.to_vec(), vec![50000.0]);
    assert_eq!(acq.state(), AcqState::Live);

    // Nothing left and no photon source: the read times out
    assert!(matches!(
        acq.grab(&mut ctrl, true),
        Err(PlCounterError::AcquisitionTimeout { .. })
    ));
}

#[test]
fn redundant_continuous_grab_does_not_rebuild() {
    let (sim, mut ctrl, mut acq) = setup(Some(20.));
    acq.grab(&mut ctrl, true).unwrap();
    let created = sim.created_tasks();
    let generation = ctrl.generation();

    for _ in 0..5 {
        let rates = acq.grab(&mut ctrl, true).unwrap();
        assert!((rates[0] - 20.).abs() < 1e-9);
    }
    assert_eq!(sim.created_tasks(), created);
    assert_eq!(ctrl.generation(), generation);
    assert_eq!(acq.state(), AcqState::Live);
}

#[test]
fn single_shot_grab_always_rebuilds() {
    let (sim, mut ctrl, mut acq) = setup(Some(20.));
    acq.grab(&mut ctrl, true).unwrap();
    acq.grab(&mut ctrl, false).unwrap();
    assert_eq!(acq.state(), AcqState::Armed);
    assert_eq!(ctrl.generation(), 2);

    // Not Live anymore: the next continuous grab rebuilds again
    acq.grab(&mut ctrl, true).unwrap();
    assert_eq!(ctrl.generation(), 3);
    assert_eq!(sim.open_tasks(), 2);
}

#[test]
fn timeout_keeps_the_stream_live() {
    let (sim, mut ctrl, mut acq) = setup(Some(20.));
    acq.grab(&mut ctrl, true).unwrap();
    let generation = ctrl.generation();

    sim.inject(SimFault::ReadTimeout);
    let err = acq.grab(&mut ctrl, true).unwrap_err();
    assert!(err.is_transient());
    assert_eq!(acq.state(), AcqState::Live);

    acq.grab(&mut ctrl, true).unwrap();
    assert_eq!(ctrl.generation(), generation);
}

#[test]
fn overrun_resynchronizes_on_next_grab() {
    let (sim, mut ctrl, mut acq) = setup(Some(20.));
    acq.grab(&mut ctrl, true).unwrap();

    sim.inject(SimFault::Overrun);
    assert!(matches!(
        acq.grab(&mut ctrl, true),
        Err(PlCounterError::BufferOverrun(_))
    ));
    assert_eq!(acq.state(), AcqState::Armed);

    acq.grab(&mut ctrl, true).unwrap();
    assert_eq!(ctrl.generation(), 2);
    assert_eq!(acq.state(), AcqState::Live);
}

#[test]
fn clock_freq_change_restarts_without_stop() {
    let (sim, mut ctrl, mut acq) = setup(Some(20.));
    acq.grab(&mut ctrl, true).unwrap();
    sim.clear_calls();

    acq.commit_setting(&mut ctrl, SettingKey::ClockFreq, 1000.0.into())
        .unwrap();
    assert_eq!(acq.counting_time(), 1e-3);
    assert_eq!(acq.state(), AcqState::Live);
    assert!(ctrl.is_running());
    assert!(sim.calls().contains(&SimCall::CreateCoPulseChan {
        task: "clock2".to_string(),
        counter: "Dev1/ctr1".to_string(),
        freq: 1000.
    }));

    // Still Live: the next grab reads the restarted stream without another rebuild
    let rates = acq.grab(&mut ctrl, true).unwrap();
    assert!((rates[0] - 20.).abs() < 1e-9);
    assert_eq!(ctrl.generation(), 2);
}

#[test]
fn other_settings_stop_and_rebuild() {
    let (sim, mut ctrl, mut acq) = setup(Some(20.));
    acq.grab(&mut ctrl, true).unwrap();
    sim.clear_calls();

    acq.commit_setting(&mut ctrl, SettingKey::ClockChannel, "Dev1/ctr2".into())
        .unwrap();
    assert_eq!(acq.state(), AcqState::Armed);
    assert!(!ctrl.is_running());
    assert_eq!(ctrl.gate_terminal(), Some("/Dev1/ctr2InternalOutput"));

    let calls = sim.calls();
    assert_eq!(calls[0], SimCall::Stop { task: "counter1".to_string() });
    assert_eq!(calls[1], SimCall::Stop { task: "clock1".to_string() });
    assert!(calls.contains(&SimCall::CreateTask { task: "clock2".to_string() }));

    // The next continuous grab starts the rebuilt pair
    let rates = acq.grab(&mut ctrl, true).unwrap();
    assert!((rates[0] - 20.).abs() < 1e-9);
    assert_eq!(acq.state(), AcqState::Live);
}

#[test]
fn multi_pair_reads() {
    let (_sim, mut ctrl, mut acq) = setup(Some(8.));
    acq.commit_setting(&mut ctrl, SettingKey::SamplesPerRead, 8i64.into())
        .unwrap();
    let rates = acq.grab(&mut ctrl, true).unwrap();
    assert_eq!(rates.len(), 4);
    for rate in rates.iter() {
        assert!((rate - 8.).abs() < 1e-9);
    }
}

#[test]
fn invalid_settings_leave_hardware_alone() {
    let (sim, mut ctrl, mut acq) = setup(Some(20.));
    acq.grab(&mut ctrl, true).unwrap();
    sim.clear_calls();

    let err = acq
        .commit_setting(&mut ctrl, SettingKey::ClockFreq, 0.5.into())
        .unwrap_err();
    assert!(err.is_configuration());
    assert!(sim.calls().is_empty());
    assert_eq!(acq.state(), AcqState::Live);

    // A read larger than the acquisition buffer could never complete
    for too_many in [MAX_SAMPLES_PER_READ as i64 + 2, i64::MAX - 1] {
        let err = acq
            .commit_setting(&mut ctrl, SettingKey::SamplesPerRead, too_many.into())
            .unwrap_err();
        assert!(matches!(err, PlCounterError::InvalidSetting { .. }));
    }
    assert!(sim.calls().is_empty());
    assert_eq!(acq.settings().samples_per_read, DEFAULT_SAMPLES_PER_READ);
    let rates = acq.grab(&mut ctrl, true).unwrap();
    assert_eq!(rates.len(), 1);
}

#[test]
fn bad_photon_source_fails_configuration() {
    let (sim, mut ctrl, mut acq) = setup(Some(20.));
    acq.configure(&mut ctrl).unwrap();
    let err = acq
        .commit_setting(&mut ctrl, SettingKey::PhotonChannel, "/Dev1/PFI99".into())
        .unwrap_err();
    assert!(matches!(err, PlCounterError::InvalidChannelSpec { .. }));
    assert_eq!(acq.state(), AcqState::Idle);
    assert_eq!(sim.open_tasks(), 0);
}

#[test]
fn stop_is_idempotent() {
    let (sim, mut ctrl, mut acq) = setup(Some(20.));
    acq.grab(&mut ctrl, true).unwrap();
    acq.stop(&mut ctrl);
    acq.stop(&mut ctrl);
    assert_eq!(acq.state(), AcqState::Idle);
    assert_eq!(ctrl.clock_state(), TaskState::Closed);
    assert_eq!(ctrl.counter_state(), TaskState::Closed);
    assert_eq!(sim.open_tasks(), 0);

    // A busy counter makes the next grab fail at configuration
    sim.reserve_counter("Dev1/ctr0");
    let err = acq.grab(&mut ctrl, true).unwrap_err();
    assert!(matches!(err, PlCounterError::HardwareConfig { .. }));
    assert_eq!(acq.state(), AcqState::Idle);
    assert_eq!(sim.open_tasks(), 0);
}
