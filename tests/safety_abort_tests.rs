use rcip_engine::recipe::SensorSpec;
use rcip_engine::safety::{SafetyEvent, SafetyLevel};
use rcip_engine::sim::SimFault;
use rcip_engine::*;
use std::sync::Arc;
use std::time::Duration;

fn pressure_kitchen() -> (Arc<SimKitchen>, ExecutionSession) {
    let kitchen = Arc::new(SimKitchen::new());
    kitchen.add_device("cooker-1");
    kitchen.add_device("oven-1");
    kitchen.script("gauge-1", [1.8, 2.0, 2.6]);
    kitchen.constant("cavity-1", 50.0);

    let session = ExecutionSession::builder(EngineConfig::default(), kitchen.clone(), kitchen.clone())
        .profiles([
            DeviceProfile::new("cooker-1", "pressure_cooker"),
            DeviceProfile::new("oven-1", "oven").with_range("temperature_range_c", 30.0, 300.0),
        ])
        .sensors([
            SensorSpec::new("gauge-1", "pressure", "pressure_bar").observing("cooker-1"),
            SensorSpec::new("cavity-1", "temperature", "oven_temp_c").observing("oven-1"),
        ])
        .build()
        .unwrap();
    (kitchen, session)
}

fn cook_steps() -> Vec<Step> {
    let mut cook = Step::new("s-cook", "pressure_cook")
        .with_device("cooker-1")
        .with_param("duration_s", 600.0);
    cook.hazards = vec!["pressure".into(), "hot-surface".into()];
    cook.independent = true;

    let mut roast = Step::new("s-roast", "roast")
        .with_device("oven-1")
        .with_param("temperature_c", 200.0)
        .complete_when("oven_temp_c", Target::AtLeast(200.0));
    roast.independent = true;

    let rest = Step::new("s-rest", "rest").with_param("duration_s", 60.0);
    vec![cook, roast, rest]
}

#[tokio::test(start_paused = true)]
async fn test_pressure_ceiling_aborts_every_step() {
    let (kitchen, session) = pressure_kitchen();
    let steps = cook_steps();

    let err = session.run_recipe(&steps).await.unwrap_err();
    match &err {
        EngineError::CriticalCondition {
            event,
            origin,
            value,
            limit,
        } => {
            assert_eq!(*event, SafetyEvent::PressureHigh);
            assert_eq!(origin, "pressure_bar");
            assert_eq!(*value, Some(2.6));
            assert_eq!(*limit, Some(2.5));
        }
        other => panic!("expected critical condition, got {other:?}"),
    }

    for step in &steps {
        let state = session.step_state(&step.id).unwrap();
        assert_eq!(state.state, StepState::Aborted, "{}", step.id);
    }
    // the roast step was still far from done
    let roast = session.step_state("s-roast").unwrap();
    assert!(roast.dispatched_at_ms.is_some());

    let mut stops = kitchen.stops();
    stops.sort();
    assert_eq!(stops, vec!["cooker-1".to_string(), "oven-1".to_string()]);
    assert!(!kitchen.is_running("cooker-1"));
    assert!(!kitchen.is_running("oven-1"));

    assert!(session.is_stopped());
    assert_eq!(session.stop_reason(), Some(err));
    assert_eq!(session.safety_level(), SafetyLevel::Critical);
}

#[tokio::test(start_paused = true)]
async fn test_pressure_trip_happens_within_one_tick() {
    let (_kitchen, session) = pressure_kitchen();
    let steps = cook_steps();
    let _ = session.run_recipe(&steps).await;

    let cook = session.step_state("s-cook").unwrap();
    let roast = session.step_state("s-roast").unwrap();
    // third reading at t=2s trips, the roast loop notices before its next tick
    assert_eq!(cook.ticks, 3);
    assert!(roast.finished_at_ms.unwrap() <= cook.finished_at_ms.unwrap() + 1_000);
}

#[tokio::test(start_paused = true)]
async fn test_approaching_ceiling_only_warns() {
    let kitchen = Arc::new(SimKitchen::new());
    kitchen.add_device("cooker-1");
    kitchen.script("gauge-1", [2.3, 2.3, 2.0]);
    let session = ExecutionSession::builder(EngineConfig::default(), kitchen.clone(), kitchen.clone())
        .profiles([DeviceProfile::new("cooker-1", "pressure_cooker")])
        .sensors([SensorSpec::new("gauge-1", "pressure", "pressure_bar").observing("cooker-1")])
        .build()
        .unwrap();

    let step = Step::new("s-cook", "pressure_cook")
        .with_device("cooker-1")
        .with_param("duration_s", 3.0);
    let exec = session.run_step(&step).await;

    assert_eq!(exec.state, StepState::Completed);
    assert!(!session.is_stopped());
    let events = session.safety_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event, SafetyEvent::PressureHigh);
    assert_eq!(events[0].level, SafetyLevel::Warning);
    assert!(events[0].resolved);
}

#[tokio::test(start_paused = true)]
async fn test_device_fault_is_critical() {
    let kitchen = Arc::new(SimKitchen::new());
    kitchen.add_device("mixer-1");
    let session = ExecutionSession::builder(EngineConfig::default(), kitchen.clone(), kitchen.clone())
        .profiles([DeviceProfile::new("mixer-1", "mixer")])
        .build()
        .unwrap();

    let step = Step::new("s-mix", "mix")
        .with_device("mixer-1")
        .with_param("speed", 4.0)
        .with_param("duration_s", 120.0);
    let (exec, ()) = tokio::join!(session.run_step(&step), async {
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        kitchen.inject(SimFault::DeviceError {
            device: "mixer-1".into(),
            message: "motor stall".into(),
        });
    });

    assert_eq!(exec.state, StepState::Aborted);
    assert!(matches!(
        exec.error,
        Some(EngineError::CriticalCondition {
            event: SafetyEvent::DeviceFault,
            ..
        })
    ));
    assert_eq!(kitchen.stops(), vec!["mixer-1".to_string()]);
    assert_eq!(kitchen.commands()[0].number("speed_level"), Some(4.0));
}

#[tokio::test(start_paused = true)]
async fn test_runtime_ceiling_from_capability() {
    let kitchen = Arc::new(SimKitchen::new());
    kitchen.add_device("hob-1");
    let session = ExecutionSession::builder(EngineConfig::default(), kitchen.clone(), kitchen.clone())
        .profiles([DeviceProfile::new("hob-1", "induction_hob").with_limit("max_runtime_s", 10.0)])
        .build()
        .unwrap();

    let step = Step::new("s-reduce", "reduce")
        .with_device("hob-1")
        .with_param("power_pct", 60.0)
        .with_param("duration_s", 60.0);
    let exec = session.run_step(&step).await;

    assert_eq!(exec.state, StepState::Aborted);
    assert!(matches!(
        exec.error,
        Some(EngineError::CriticalCondition {
            event: SafetyEvent::RuntimeExceeded,
            ..
        })
    ));
    let finished = exec.finished_at_ms.unwrap() - exec.dispatched_at_ms.unwrap();
    assert!(finished > 10_000 && finished <= 12_000, "{finished}");
}

#[tokio::test(start_paused = true)]
async fn test_external_abort_stops_devices_and_aborts_step() {
    let kitchen = Arc::new(SimKitchen::new());
    kitchen.add_device("oven-1");
    kitchen.constant("cavity-1", 25.0);
    let session = ExecutionSession::builder(EngineConfig::default(), kitchen.clone(), kitchen.clone())
        .profiles([DeviceProfile::new("oven-1", "oven")])
        .sensors([SensorSpec::new("cavity-1", "temperature", "oven_temp_c").observing("oven-1")])
        .build()
        .unwrap();

    let step = Step::new("s-bake", "bake")
        .with_device("oven-1")
        .with_param("temperature_c", 180.0)
        .complete_when("oven_temp_c", Target::AtLeast(180.0));
    let later = Step::new("s-cool", "rest").with_param("duration_s", 5.0);

    let steps = [step, later];
    let (results, report) = tokio::join!(session.run_recipe(&steps), async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        session.abort("operator cancelled").await
    });

    // external aborts are not safety failures
    let results = results.unwrap();
    assert!(results.iter().all(|r| r.state == StepState::Aborted));
    assert_eq!(
        results[0].error,
        Some(EngineError::Aborted("operator cancelled".into()))
    );
    assert_eq!(report.acknowledged, vec!["oven-1".to_string()]);
    assert!(report.unresponsive.is_empty());
    assert!(!kitchen.is_running("oven-1"));

    // teardown runs once
    let again = session.abort("second request").await;
    assert_eq!(again, report);
    assert_eq!(kitchen.stops().len(), 1);
    assert_eq!(
        session.stop_reason(),
        Some(EngineError::Aborted("operator cancelled".into()))
    );
}

#[tokio::test(start_paused = true)]
async fn test_unresponsive_device_is_reported() {
    let kitchen = Arc::new(SimKitchen::new());
    kitchen.add_device("oven-1");
    kitchen.add_device("fryer-1");
    kitchen.inject(SimFault::UnresponsiveStop {
        device: "fryer-1".into(),
    });
    let session = ExecutionSession::builder(EngineConfig::default(), kitchen.clone(), kitchen.clone())
        .profiles([
            DeviceProfile::new("oven-1", "oven"),
            DeviceProfile::new("fryer-1", "fryer"),
        ])
        .build()
        .unwrap();

    let started = tokio::time::Instant::now();
    let report = session.abort("shutdown").await;

    assert_eq!(report.acknowledged, vec!["oven-1".to_string()]);
    assert_eq!(report.unresponsive, vec!["fryer-1".to_string()]);
    // bounded by the stop grace period
    assert!(started.elapsed() >= Duration::from_millis(3_000));
    assert!(started.elapsed() < Duration::from_millis(4_000));
    assert_eq!(kitchen.get_fault_injection_stats().ignored_stops, 1);
}

#[tokio::test(start_paused = true)]
async fn test_steps_after_stop_never_dispatch() {
    let kitchen = Arc::new(SimKitchen::new());
    kitchen.add_device("oven-1");
    let session = ExecutionSession::builder(EngineConfig::default(), kitchen.clone(), kitchen.clone())
        .profiles([DeviceProfile::new("oven-1", "oven")])
        .build()
        .unwrap();
    session.abort("closed").await;

    let step = Step::new("s-bake", "bake")
        .with_device("oven-1")
        .with_param("duration_s", 10.0);
    let exec = session.run_step(&step).await;

    assert_eq!(exec.state, StepState::Aborted);
    assert!(exec.dispatched_at_ms.is_none());
    assert!(kitchen.commands().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_trip_beats_completion_in_the_same_tick() {
    let kitchen = Arc::new(SimKitchen::new());
    kitchen.add_device("cooker-1");
    kitchen.add_device("oven-1");
    kitchen.constant("gauge-1", 2.6);
    kitchen.constant("probe-1", 100.0);
    kitchen.inject(SimFault::SlowSensor {
        sensor: "probe-1".into(),
        delay_ms: 300,
    });
    let config = EngineConfig::from_json_str(r#"{"monitoring": {"debounce_ticks": 1}}"#).unwrap();
    let session = ExecutionSession::builder(config, kitchen.clone(), kitchen.clone())
        .profiles([
            DeviceProfile::new("cooker-1", "pressure_cooker"),
            DeviceProfile::new("oven-1", "oven").with_range("temperature_range_c", 30.0, 300.0),
        ])
        .sensors([
            SensorSpec::new("gauge-1", "pressure", "pressure_bar").observing("cooker-1"),
            SensorSpec::new("probe-1", "temperature", "internal_temp_c").observing("oven-1"),
        ])
        .build()
        .unwrap();

    let mut cook = Step::new("s-cook", "pressure_cook")
        .with_device("cooker-1")
        .with_param("duration_s", 600.0);
    cook.independent = true;
    // satisfied by its first reading, which arrives after the trip
    let mut roast = Step::new("s-roast", "roast")
        .with_device("oven-1")
        .with_param("temperature_c", 180.0)
        .complete_when("internal_temp_c", Target::AtLeast(50.0));
    roast.independent = true;

    let err = session.run_recipe(&[cook, roast]).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::CriticalCondition {
            event: SafetyEvent::PressureHigh,
            ..
        }
    ));

    let roast = session.step_state("s-roast").unwrap();
    assert_eq!(roast.state, StepState::Aborted);
    assert!(matches!(roast.error, Some(EngineError::Aborted(_))));
    assert!(roast.finished_at_ms.unwrap() < 300);
    assert!(session
        .step_states()
        .iter()
        .all(|s| s.state == StepState::Aborted));
}
