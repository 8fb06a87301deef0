use proptest::prelude::*;
use reactor_thermal_sim as rts;

fn clock_with(
    params: rts::PhysicalParameters,
    initial: rts::ReactorState,
    law: rts::ControlLaw,
) -> rts::SimulationClock {
    let mut clock =
        rts::SimulationClock::new(params, initial, law, rts::ClockConfig::default()).unwrap();
    clock.start().unwrap();
    clock
}

fn run_ticks(clock: &mut rts::SimulationClock, n: usize) -> Vec<rts::Sample> {
    let mut out = Vec::new();
    for _ in 0..n {
        clock.tick(&mut out).unwrap();
    }
    out
}

fn coolant_plant() -> rts::PhysicalParameters {
    rts::PhysicalParameters {
        jacket_supply: rts::JacketSupply::Coolant {
            flow_max: 120.0,
            inlet_temp: 2.0,
        },
        ..Default::default()
    }
}

proptest! {
    #[test]
    fn derivatives_stay_finite_for_valid_plants(
        heat_capacity in 100.0f64..10_000.0,
        density in 100.0f64..3000.0,
        u in 0.0f64..1e5,
        area in 0.0f64..50.0,
        vt in 0.01f64..20.0,
        vc in 0.01f64..5.0,
        feed in 0.0f64..200.0,
        coolant_only in any::<bool>(),
        av in 0.0f64..=1.0,
        t in -20.0f64..200.0,
        tj in -20.0f64..200.0,
    ) {
        let jacket_supply = if coolant_only {
            rts::JacketSupply::Coolant { flow_max: 120.0, inlet_temp: 2.0 }
        } else {
            rts::JacketSupply::default()
        };
        let p = rts::PhysicalParameters {
            heat_capacity,
            density,
            heat_transfer_coeff: u,
            exchange_area: area,
            reactor_volume: vt,
            jacket_volume: vc,
            feed_flow: feed,
            jacket_supply,
            ..Default::default()
        };
        prop_assert!(p.validate().is_ok());
        let s = rts::ReactorState { reactor_temp: t, jacket_temp: tj };
        let d = rts::derivatives(&s, av, &p);
        prop_assert!(d.is_finite(), "{:?}", d);
    }
}

#[test]
fn closed_valve_at_uniform_temperature_stays_in_equilibrium() {
    let params = rts::PhysicalParameters {
        feed_temp: 2.0,
        ..coolant_plant()
    };
    let initial = rts::ReactorState {
        reactor_temp: 2.0,
        jacket_temp: 2.0,
    };
    let mut clock = clock_with(params, initial, rts::ControlLaw::manual(0.0));
    let out = run_ticks(&mut clock, 200);
    for s in &out {
        assert!((s.reactor_temp - 2.0).abs() < 1e-9, "{s:?}");
        assert!((s.jacket_temp - 2.0).abs() < 1e-9, "{s:?}");
    }
}

#[test]
fn split_range_plant_at_cold_inlet_temperature_is_in_equilibrium() {
    let params = rts::PhysicalParameters {
        feed_temp: 2.0,
        ..Default::default()
    };
    let initial = rts::ReactorState {
        reactor_temp: 2.0,
        jacket_temp: 2.0,
    };
    let mut clock = clock_with(params, initial, rts::ControlLaw::manual(0.0));
    let out = run_ticks(&mut clock, 200);
    let last = out.last().unwrap();
    assert!((last.reactor_temp - 2.0).abs() < 1e-9);
    assert!((last.jacket_temp - 2.0).abs() < 1e-9);
}

#[test]
fn full_coolant_flow_cools_jacket_monotonically() {
    let initial = rts::ReactorState {
        reactor_temp: 60.0,
        jacket_temp: 47.7,
    };
    let mut clock = clock_with(coolant_plant(), initial, rts::ControlLaw::manual(1.0));
    let out = run_ticks(&mut clock, 30);
    let mut prev = initial.jacket_temp;
    for s in &out {
        assert!(s.jacket_temp < prev, "jacket rose at t={}: {} -> {}", s.time, prev, s.jacket_temp);
        prev = s.jacket_temp;
    }
}

#[test]
fn pid_brings_reactor_down_to_setpoint() {
    let cfg = rts::PidConfig {
        kp: 2.0,
        ki: 0.1,
        kd: 0.5,
        setpoint: 28.0,
        ..Default::default()
    };
    let mut clock = clock_with(
        rts::PhysicalParameters::default(),
        rts::ReactorState::default(),
        rts::ControlLaw::pid(cfg, 0.433255),
    );
    let out = run_ticks(&mut clock, 400);

    assert!(out.iter().all(|s| (20.0..35.0).contains(&s.reactor_temp)));
    assert!(out.iter().all(|s| (0.0..=1.0).contains(&s.valve_position)));
    for s in out.iter().filter(|s| s.time >= 120.0) {
        assert!((s.reactor_temp - 28.0).abs() < 0.5, "t={} T={}", s.time, s.reactor_temp);
    }
}

#[test]
fn reverse_acting_pid_holds_exothermic_reactor_with_coolant() {
    let params = rts::PhysicalParameters {
        reaction_heat: 6e6,
        ..coolant_plant()
    };
    let cfg = rts::PidConfig {
        kp: 2.0,
        ki: 0.1,
        kd: 0.5,
        setpoint: 45.0,
        action: rts::Action::Reverse,
        ..Default::default()
    };
    let initial = rts::ReactorState {
        reactor_temp: 50.0,
        jacket_temp: 40.0,
    };
    let mut clock = clock_with(params, initial, rts::ControlLaw::pid(cfg, 0.0));
    let out = run_ticks(&mut clock, 600);
    let last = out.last().unwrap();
    assert!((last.reactor_temp - 45.0).abs() < 0.5, "{last:?}");
}

#[test]
fn saturated_pid_output_is_applied_as_exactly_zero_or_one() {
    let p_only = |setpoint| rts::PidConfig {
        kp: 1.0,
        ki: 0.0,
        kd: 0.0,
        setpoint,
        ..Default::default()
    };

    // Reactor starts at 31 degC: errors of +1.8 and -0.3.
    let mut clock = clock_with(
        rts::PhysicalParameters::default(),
        rts::ReactorState::default(),
        rts::ControlLaw::pid(p_only(32.8), 0.5),
    );
    assert_eq!(run_ticks(&mut clock, 1)[0].valve_position, 1.0);

    let mut clock = clock_with(
        rts::PhysicalParameters::default(),
        rts::ReactorState::default(),
        rts::ControlLaw::pid(p_only(30.7), 0.5),
    );
    assert_eq!(run_ticks(&mut clock, 1)[0].valve_position, 0.0);
}

#[test]
fn solver_failure_faults_the_clock_and_nothing_reaches_the_display() {
    let params = rts::PhysicalParameters {
        heat_transfer_coeff: 1e13,
        ..Default::default()
    };
    let mut clock = clock_with(params, rts::ReactorState::default(), rts::ControlLaw::manual(0.4));
    let mut shown: Vec<rts::Sample> = Vec::new();

    let err = clock.tick(&mut shown).unwrap_err();
    assert!(matches!(
        err,
        rts::ClockError::Sim(rts::SimError::Integration { .. })
    ));
    assert_eq!(clock.state(), rts::ClockState::Faulted);
    assert!(clock.fault().is_some());

    // Terminal: later ticks and commands are ignored.
    clock.set_valve_position(0.1).unwrap();
    for _ in 0..3 {
        assert_eq!(
            clock.tick(&mut shown).unwrap(),
            rts::TickOutcome::Inactive(rts::ClockState::Faulted)
        );
    }
    assert!(shown.is_empty());
    assert!(clock.reactor().is_finite());

    let outcome = clock
        .run(&mut shown, &mut rts::NoCommands, Some(10.0))
        .unwrap();
    assert!(matches!(outcome, rts::RunOutcome::Faulted(_)));
    assert!(shown.iter().all(rts::Sample::is_finite));
}

#[test]
fn zero_heat_capacity_is_rejected_at_startup() {
    let params = rts::PhysicalParameters {
        heat_capacity: 0.0,
        ..Default::default()
    };
    let r = rts::SimulationClock::new(
        params,
        rts::ReactorState::default(),
        rts::ControlLaw::manual(0.4),
        rts::ClockConfig::default(),
    );
    assert!(matches!(r, Err(rts::SimError::Configuration(_))));

    // Bypassing the startup check, the integrator still refuses to produce garbage.
    let step = rts::integrate(
        &rts::ReactorState::default(),
        0.4,
        &params,
        1.0,
        &rts::SolverOptions::default(),
    );
    assert!(matches!(
        step,
        Err(rts::SimError::Integration {
            failure: rts::IntegrationFailure::NonFiniteDerivative,
            ..
        })
    ));
}

#[test]
fn scripted_switch_from_manual_to_pid() {
    let mut clock = rts::SimulationClock::new(
        rts::PhysicalParameters::default(),
        rts::ReactorState::default(),
        rts::ControlLaw::manual(0.433255),
        rts::ClockConfig::default(),
    )
    .unwrap();
    let mut script = rts::ScheduledCommands::new(vec![
        "50:gains=2,0.1,0.5".parse().unwrap(),
        "50:setpoint=28".parse().unwrap(),
        "50:mode=pid".parse().unwrap(),
    ]);
    let mut window = rts::TraceWindow::new(1000.0);
    let outcome = clock.run(&mut window, &mut script, Some(300.0)).unwrap();

    assert_eq!(outcome, rts::RunOutcome::Stopped);
    assert_eq!(window.len(), 300);
    let before: Vec<_> = window.iter().filter(|s| s.time <= 50.0).collect();
    assert!(before.iter().all(|s| s.setpoint.is_none()));
    assert!(before.iter().all(|s| s.valve_position == 0.433255));
    // Open loop at the nominal valve holds the steady state.
    assert!(before.iter().all(|s| (s.reactor_temp - 31.0).abs() < 0.01));

    let after: Vec<_> = window.iter().filter(|s| s.time > 50.0).collect();
    assert!(after.iter().all(|s| s.setpoint == Some(28.0)));
    let last = window.last().unwrap();
    assert!((last.reactor_temp - 28.0).abs() < 0.5, "{last:?}");
}
