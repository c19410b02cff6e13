use bombuh::bconf::{BombEvent, EventBits, ModuleFlags, VariableType};
use bombuh::bus::{request, transmit, VirtualBus};
use bombuh::component::{BombComponent, ComponentIdentity, DEFUSED_COLOR, STRIKE_COLOR};
use bombuh::master::{ComponentDescriptor, VirtualMaster};
use bombuh::sim::{BlinkModule, SimConfig, Simulation, BLINK_INTERVAL, BLINK_MODULE_NAME};
use bombuh::transport::ServiceOrder;
use bombuh::ComponentRuntime;

fn blinker() -> ComponentRuntime<BlinkModule> {
    let mut runtime = ComponentRuntime::new(BlinkModule::new(&SimConfig::default()));
    runtime.setup(42).unwrap();
    runtime
}

#[test]
fn test_raw_handshake_bytes() {
    let mut runtime = blinker();
    let mut bus = VirtualBus::new();
    transmit(&mut runtime, &mut bus, &[0xFE, 0x01, 0x00, 0x04]);

    let prolog = request(&mut runtime, &mut bus, 3);
    assert_eq!(prolog[0], 0xFE);
    let size = usize::from(u16::from_le_bytes([prolog[1], prolog[2]]));
    let content = request(&mut runtime, &mut bus, size.min(32));

    let mask = EventBits::ALWAYS_LISTEN | EventBits::STRIKE | EventBits::TIMER_SYNC | EventBits::LIGHTS;
    assert_eq!(&content[..6], b"Julka\0");
    assert_eq!(content[6..10], mask.0.to_le_bytes());
}

struct Bare;

impl BombComponent for Bare {
    fn identity(&self) -> ComponentIdentity {
        ComponentIdentity::module("Bare", ModuleFlags::DEFUSABLE)
    }
}

#[test]
fn test_raw_handshake_of_component_without_variables() {
    let mut runtime = ComponentRuntime::new(Bare);
    runtime.setup(0x22).unwrap();
    let mut bus = VirtualBus::new();
    transmit(&mut runtime, &mut bus, &[0xFE, 0x01, 0x00, 0x04]);

    let mut expected = b"Julka\0".to_vec();
    expected.extend_from_slice(&EventBits::ALWAYS_LISTEN.0.to_le_bytes());
    expected.extend_from_slice(&[0, 4]);
    expected.extend_from_slice(b"Bare");
    expected.extend_from_slice(&[ModuleFlags::DEFUSABLE.0, 0, 0, 0]);

    let prolog = request(&mut runtime, &mut bus, 3);
    assert_eq!(prolog, vec![0xFE, expected.len() as u8, 0]);
    let content = request(&mut runtime, &mut bus, expected.len());
    assert_eq!(content, expected);
}

#[test]
fn test_simulation_brings_module_up() {
    let mut sim = Simulation::new(SimConfig::default(), 42, ServiceOrder::Fifo).unwrap();
    assert_eq!(sim.address(), 42);
    sim.bring_up().unwrap();

    let report = sim.report();
    assert!(report.armed);
    assert!(report.configured);
    assert!(report.master.ready_to_arm);
    assert_eq!(report.blink_interval_ms, 250);

    let handshake = report.handshake.unwrap();
    assert!(matches!(
        &handshake.descriptor,
        ComponentDescriptor::Module { name, .. } if name == BLINK_MODULE_NAME
    ));
    assert_eq!(handshake.variables, vec![(BLINK_INTERVAL.to_string(), VariableType::Int)]);
}

#[test]
fn test_simulated_game_strikes_then_defuses() {
    let mut sim = Simulation::new(SimConfig::default(), 42, ServiceOrder::Fifo).unwrap();
    sim.bring_up().unwrap();

    for _ in 0..45 {
        sim.step(50).unwrap();
    }
    // Struck at 2000 ms, LED still red.
    assert_eq!(sim.master().state().strikes, 1);
    assert_eq!(sim.runtime().component().status().leds().color(), Some(STRIKE_COLOR));

    for _ in 0..25 {
        sim.step(50).unwrap();
    }
    // 3500 ms in: flash over, not yet defused.
    assert_eq!(sim.master().state().strikes, 1);
    assert!(!sim.master().state().defused);
    assert!(sim.runtime().component().is_blinking());
    assert_eq!(sim.runtime().component().status().leds().color(), None);

    for _ in 0..50 {
        sim.step(50).unwrap();
    }
    let report = sim.report();
    assert!(report.defused);
    assert_eq!(report.master.strikes, 1);
    assert!(!sim.runtime().component().is_blinking());
    assert_eq!(sim.runtime().component().status().leds().color(), Some(DEFUSED_COLOR));
    assert!(report.blink_toggles > 10);
    assert_eq!(report.dropped_requests, 0);
    assert_eq!(report.master.unknown_requests, 0);
    // Last step was a sync step.
    assert_eq!(report.synced_clock_ms, report.master.clock_ms - 20);
}

#[test]
fn test_simulation_runs_with_lifo_queues() {
    let mut sim = Simulation::new(SimConfig::default(), 42, ServiceOrder::Lifo).unwrap();
    sim.bring_up().unwrap();
    for _ in 0..120 {
        sim.step(50).unwrap();
    }
    assert!(sim.master().state().defused);
}

#[test]
fn test_configured_blink_interval_is_used() {
    let config = SimConfig {
        blink_interval_ms: 100,
        strike_after_ms: None,
        defuse_after_ms: None,
        ..SimConfig::default()
    };
    let mut sim = Simulation::new(config, 42, ServiceOrder::Fifo).unwrap();
    sim.bring_up().unwrap();
    for _ in 0..100 {
        sim.step(10).unwrap();
    }
    let report = sim.report();
    assert_eq!(report.blink_interval_ms, 100);
    assert!(report.blink_toggles >= 9);
    assert_eq!(report.master.strikes, 0);
    assert!(!report.defused);
}

#[test]
fn test_lights_out_stops_blinking() {
    let mut runtime = blinker();
    let config = SimConfig::default();
    let mut master = VirtualMaster::new(config.bomb_config(), config.module_config().to_bytes());
    master.send_event(&mut runtime, BombEvent::Configure, &[]).unwrap();
    master.sync(&mut runtime).unwrap();
    master.sync(&mut runtime).unwrap();
    master.send_event(&mut runtime, BombEvent::Arm, &[]).unwrap();
    runtime.tick(0);
    assert!(runtime.component().is_blinking());

    master.send_event(&mut runtime, BombEvent::LightsOut, &[]).unwrap();
    assert!(!runtime.component().is_blinking());
    assert!(!runtime.component().blink_state().lit);
}

#[test]
fn test_sim_config_loads_from_json_file() {
    let path = std::env::temp_dir().join(format!("bombuh-sim-{}.json", std::process::id()));
    std::fs::write(&path, r#"{"serial": "ZZ0AA8", "sync_every_ticks": 5}"#).unwrap();
    let config = SimConfig::load(&path).unwrap();
    std::fs::remove_file(&path).unwrap();

    assert_eq!(config.serial, "ZZ0AA8");
    assert_eq!(config.sync_every_ticks, 5);
    assert_eq!(config.blink_interval_ms, SimConfig::default().blink_interval_ms);
}

#[test]
fn test_report_serializes_to_json() {
    let mut sim = Simulation::new(SimConfig::default(), 42, ServiceOrder::Fifo).unwrap();
    sim.bring_up().unwrap();
    sim.step(50).unwrap();
    let json = serde_json::to_value(sim.report()).unwrap();
    assert_eq!(json["address"], 42);
    assert_eq!(json["ticks"], 1);
    assert_eq!(json["armed"], true);
}
