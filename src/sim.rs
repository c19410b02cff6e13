//! Host simulation of one component on a virtual bus.
//!
//! [`Simulation`] pairs a [`ComponentRuntime`] running the demo
//! [`BlinkModule`] with a [`VirtualMaster`] and drives them through
//! discovery, handshake, configuration and an armed game. Time is virtual:
//! each [`Simulation::step`] advances it by a fixed amount.

use alloc::string::String;
use alloc::vec::Vec;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::bconf::{BombEvent, EventBits, SerialFlags, SyncFlags, VariableType};
use crate::client::{ClientError, ClientStats};
use crate::component::{BombComponent, BombHandle, ComponentIdentity, DefusableModule, ModuleLedDriver};
use crate::config::{BombConfig, ComponentConfig, ConfigError, ModuleConfig, ModuleInfo, VariableValue};
use crate::event::{Event, EventChainHandle, EventManager, Step};
use crate::hash::hash_id;
use crate::info::VariableParam;
use crate::master::{Handshake, MasterError, MasterState, VirtualMaster};
use crate::runtime::ComponentRuntime;
use crate::transport::ServiceOrder;

pub const BLINK_MODULE_NAME: &str = "Blinker";
pub const BLINK_INTERVAL: &str = "Blink interval";
pub const DEFAULT_BLINK_INTERVAL_MS: u64 = 500;

/// Sync rounds allowed for the configuration handshake.
const MAX_CONFIG_ROUNDS: usize = 4;

static BLINK_VARIABLES: [VariableParam; 1] = [VariableParam::new(BLINK_INTERVAL, VariableType::Int)];

#[derive(Debug, Error)]
pub enum SimError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] MasterError),
    #[error("client error: {0}")]
    Client(#[from] ClientError),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("component never acknowledged its configuration")]
    NotReady,
}

/// Simulated bomb and demo module settings, loadable from JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub serial: String,
    pub max_strikes: u8,
    pub time_limit_ms: i32,
    pub blink_interval_ms: i16,
    /// Armed time after which the demo module commits a strike.
    pub strike_after_ms: Option<u64>,
    /// Armed time after which the demo module reports itself defused.
    pub defuse_after_ms: Option<u64>,
    /// Ticks between two TIMER_SYNC rounds.
    pub sync_every_ticks: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            serial: String::from("AB3CD4"),
            max_strikes: 3,
            time_limit_ms: 300_000,
            blink_interval_ms: 250,
            strike_after_ms: Some(2_000),
            defuse_after_ms: Some(5_000),
            sync_every_ticks: 10,
        }
    }
}

impl SimConfig {
    pub fn load(path: &Path) -> Result<Self, SimError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn bomb_config(&self) -> BombConfig {
        BombConfig {
            random_seed: hash_id(&self.serial),
            serial: self.serial.clone(),
            serial_flags: SerialFlags::from_serial(&self.serial),
            max_strikes: self.max_strikes,
            time_limit_ms: self.time_limit_ms,
            modules: alloc::vec![ModuleInfo {
                name_hash: hash_id(BLINK_MODULE_NAME),
                flags: DefusableModule::<LogLed>::flags(),
                extra: Vec::new(),
            }],
            ..BombConfig::default()
        }
    }

    pub fn module_config(&self) -> ModuleConfig {
        let mut config = ModuleConfig::default();
        config.set(BLINK_INTERVAL, VariableValue::Int(self.blink_interval_ms));
        config
    }
}

/// Status LED that only logs.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LogLed {
    color: Option<u32>,
    changes: u32,
}

impl LogLed {
    pub fn color(&self) -> Option<u32> {
        self.color
    }

    pub fn changes(&self) -> u32 {
        self.changes
    }
}

impl ModuleLedDriver for LogLed {
    fn init(&mut self) {
        trace!("Status LED ready");
    }

    fn turn_on(&mut self, color: u32) {
        debug!("Status LED {:06x}", color);
        self.color = Some(color);
        self.changes += 1;
    }

    fn turn_off(&mut self) {
        debug!("Status LED off");
        self.color = None;
        self.changes += 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlinkState {
    pub lit: bool,
    pub toggles: u32,
    pub interval_ms: u64,
}

fn blink() -> Event<BlinkState> {
    Event::new(|state: &mut BlinkState, step: &mut Step<BlinkState>| {
        state.lit = !state.lit;
        state.toggles += 1;
        step.then(Event::wait(state.interval_ms));
        step.then(blink());
        true
    })
}

/// Demo module: blinks at a configured interval while armed, strikes and
/// defuses itself on a schedule.
pub struct BlinkModule {
    status: DefusableModule<LogLed>,
    blink: BlinkState,
    events: EventManager<BlinkState>,
    blink_chain: EventChainHandle,
    strike_after_ms: Option<u64>,
    defuse_after_ms: Option<u64>,
    armed_at: Option<u64>,
    struck: bool,
    configured: bool,
}

impl BlinkModule {
    pub fn new(config: &SimConfig) -> Self {
        Self {
            status: DefusableModule::new(LogLed::default()),
            blink: BlinkState {
                lit: false,
                toggles: 0,
                interval_ms: DEFAULT_BLINK_INTERVAL_MS,
            },
            events: EventManager::new(),
            blink_chain: EventChainHandle::new(),
            strike_after_ms: config.strike_after_ms,
            defuse_after_ms: config.defuse_after_ms,
            armed_at: None,
            struck: false,
            configured: false,
        }
    }

    pub fn blink_state(&self) -> &BlinkState {
        &self.blink
    }

    pub fn is_blinking(&self) -> bool {
        self.blink_chain.is_active()
    }

    pub fn is_configured(&self) -> bool {
        self.configured
    }

    pub fn status(&self) -> &DefusableModule<LogLed> {
        &self.status
    }

    fn stop_blinking(&mut self) {
        self.events.cancel(&self.blink_chain);
        self.blink.lit = false;
    }
}

impl BombComponent for BlinkModule {
    fn identity(&self) -> ComponentIdentity {
        ComponentIdentity::module(BLINK_MODULE_NAME, DefusableModule::<LogLed>::flags())
    }

    fn variables(&self) -> &[VariableParam] {
        &BLINK_VARIABLES
    }

    fn accepted_events(&self) -> EventBits {
        EventBits::STRIKE | EventBits::TIMER_SYNC | EventBits::LIGHTS
    }

    fn sync_flags(&self) -> SyncFlags {
        SyncFlags::FETCH_CONFIG | SyncFlags::SYNC_CLOCK
    }

    fn bootstrap(&mut self) {
        self.status.bootstrap();
    }

    fn standby(&mut self, _: &mut BombHandle<'_>) {
        self.stop_blinking();
        self.armed_at = None;
    }

    fn arm(&mut self, bomb: &mut BombHandle<'_>) {
        self.status.arm();
        self.struck = false;
        self.armed_at = Some(bomb.now_ms());
        self.events.cancel(&self.blink_chain);
        self.events.start(blink(), Some(&mut self.blink_chain));
        info!(interval_ms = self.blink.interval_ms, "Blinker armed");
    }

    fn reset(&mut self, _: &mut BombHandle<'_>) {
        self.status.reset();
        self.events.cancel_all();
        self.blink.lit = false;
        self.struck = false;
        self.configured = false;
    }

    fn update(&mut self, bomb: &mut BombHandle<'_>) {
        let Some(armed_at) = self.armed_at else {
            return;
        };
        let elapsed = bomb.now_ms().saturating_sub(armed_at);
        if !self.struck && self.strike_after_ms.is_some_and(|after| elapsed >= after) {
            self.struck = true;
            self.status.strike(bomb);
        }
        if !self.status.is_defused() && self.defuse_after_ms.is_some_and(|after| elapsed >= after) {
            self.stop_blinking();
            self.status.defuse(bomb);
        }
    }

    fn display(&mut self, now_ms: u64) {
        self.events.update(&mut self.blink, now_ms);
        self.status.run_status_led(now_ms);
    }

    fn idle_display(&mut self, now_ms: u64) {
        self.status.run_status_led(now_ms);
    }

    fn on_event(&mut self, event_id: u8, _: &[u8], _: &mut BombHandle<'_>) {
        if event_id == BombEvent::LightsOut.id() {
            self.stop_blinking();
        }
    }

    fn load_bomb_config(&mut self, config: &BombConfig) {
        match config.module_info(BLINK_MODULE_NAME) {
            Some(module) => debug!(flags = module.flags.0, "Found own module record"),
            None => warn!("Bomb config does not list {}", BLINK_MODULE_NAME),
        }
    }

    fn load_config(&mut self, config: ComponentConfig) {
        if let ComponentConfig::Module(module) = config {
            let interval = module.get_int(BLINK_INTERVAL);
            if interval > 0 {
                self.blink.interval_ms = interval as u64;
            }
        }
    }

    fn configure(&mut self, _: &mut BombHandle<'_>) {
        self.configured = true;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SimReport {
    pub address: u8,
    pub order: ServiceOrder,
    pub handshake: Option<Handshake>,
    pub ticks: u64,
    pub elapsed_ms: u64,
    pub armed: bool,
    pub configured: bool,
    pub blink_toggles: u32,
    pub blink_interval_ms: u64,
    pub defused: bool,
    pub synced_clock_ms: i32,
    pub master: MasterState,
    pub client: ClientStats,
    pub dropped_requests: u32,
}

pub struct Simulation {
    runtime: ComponentRuntime<BlinkModule>,
    master: VirtualMaster,
    config: SimConfig,
    order: ServiceOrder,
    address: u8,
    handshake: Option<Handshake>,
    now_ms: u64,
    ticks: u64,
}

impl Simulation {
    pub fn new(config: SimConfig, analog_reading: u16, order: ServiceOrder) -> Result<Self, SimError> {
        let mut runtime = ComponentRuntime::with_order(BlinkModule::new(&config), order);
        let address = runtime.setup(analog_reading)?;
        let master = VirtualMaster::new(config.bomb_config(), config.module_config().to_bytes());
        Ok(Self {
            runtime,
            master,
            config,
            order,
            address,
            handshake: None,
            now_ms: 0,
            ticks: 0,
        })
    }

    pub fn runtime(&self) -> &ComponentRuntime<BlinkModule> {
        &self.runtime
    }

    pub fn master(&self) -> &VirtualMaster {
        &self.master
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    /// Discovery, handshake, configuration and arming.
    pub fn bring_up(&mut self) -> Result<(), SimError> {
        self.master.discover(&mut self.runtime)?;
        let handshake = self.master.handshake(&mut self.runtime)?;
        self.handshake = Some(handshake);

        self.master.send_event(&mut self.runtime, BombEvent::Reset, &[])?;
        self.runtime.tick(self.now_ms);

        self.master.send_event(&mut self.runtime, BombEvent::Configure, &[])?;
        for _ in 0..MAX_CONFIG_ROUNDS {
            if self.master.state().ready_to_arm {
                break;
            }
            self.master.sync(&mut self.runtime)?;
        }
        if !self.master.state().ready_to_arm {
            return Err(SimError::NotReady);
        }

        self.master.send_event(&mut self.runtime, BombEvent::Arm, &[])?;
        self.runtime.tick(self.now_ms);
        info!(address = self.address, "Component armed");
        Ok(())
    }

    /// Advances virtual time by `tick_ms` and runs one main loop pass.
    pub fn step(&mut self, tick_ms: u64) -> Result<(), SimError> {
        self.now_ms += tick_ms;
        self.ticks += 1;
        self.master.advance_clock(i32::try_from(tick_ms).unwrap_or(i32::MAX));

        if self.config.sync_every_ticks > 0 && self.ticks % self.config.sync_every_ticks == 0 {
            self.master.send_event(&mut self.runtime, BombEvent::TimerSync, &[])?;
        }
        let served = self.master.sync(&mut self.runtime)?;
        if served > 0 {
            trace!(served, "Requests served");
        }
        self.runtime.tick(self.now_ms);
        Ok(())
    }

    pub fn report(&self) -> SimReport {
        let module = self.runtime.component();
        SimReport {
            address: self.address,
            order: self.order,
            handshake: self.handshake.clone(),
            ticks: self.ticks,
            elapsed_ms: self.now_ms,
            armed: self.runtime.is_armed(),
            configured: module.is_configured(),
            blink_toggles: module.blink_state().toggles,
            blink_interval_ms: module.blink_state().interval_ms,
            defused: self.master.state().defused,
            synced_clock_ms: self.runtime.interface().state().clock,
            master: self.master.state().clone(),
            client: self.runtime.stats().clone(),
            dropped_requests: self.runtime.client().requests().dropped(),
        }
    }
}
