//! Component lifecycle hooks and the building blocks shared by modules.
//!
//! A peripheral implements [`BombComponent`] and is driven by
//! [`ComponentRuntime`](crate::runtime::ComponentRuntime). Behaviour common to
//! defusable modules (status LED, strike and defuse requests) lives in
//! [`DefusableModule`], which a module owns rather than inherits.

use alloc::string::String;
use alloc::vec::Vec;

use tracing::{debug, info, warn};

use crate::bconf::{ComponentKind, EventBits, ModuleFlags, SyncFlags};
use crate::client::{ClientError, RequestSink};
use crate::config::{BombConfig, ComponentConfig};
use crate::event::{Event, EventManager, EventMutex, EventQueue, Step};
use crate::info::{InfoStreamBuilder, VariableParam};
use crate::interface::{BombInterface, BombState};

/// What a component reports about itself in the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentIdentity {
    Module {
        name: &'static str,
        flags: ModuleFlags,
        extra: Vec<u8>,
    },
    Label {
        texts: Vec<String>,
    },
    Port {
        name: &'static str,
    },
    Battery {
        count: u8,
        size: u8,
    },
}

impl ComponentIdentity {
    pub fn module(name: &'static str, flags: ModuleFlags) -> Self {
        ComponentIdentity::Module {
            name,
            flags,
            extra: Vec::new(),
        }
    }

    pub fn kind(&self) -> ComponentKind {
        match self {
            ComponentIdentity::Module { .. } => ComponentKind::Module,
            ComponentIdentity::Label { .. } => ComponentKind::Label,
            ComponentIdentity::Port { .. } => ComponentKind::Port,
            ComponentIdentity::Battery { .. } => ComponentKind::Battery,
        }
    }

    /// Serialized capability schema, without the event mask.
    pub fn schema(&self, variables: &[VariableParam]) -> Vec<u8> {
        let mut builder = match self {
            ComponentIdentity::Module { name, flags, extra } => InfoStreamBuilder::module(name, *flags, extra),
            ComponentIdentity::Label { texts } => InfoStreamBuilder::label(texts.as_slice()),
            ComponentIdentity::Port { name } => InfoStreamBuilder::port(name),
            ComponentIdentity::Battery { count, size } => InfoStreamBuilder::battery(*count, *size),
        };
        builder.add_variables(variables);
        builder.build()
    }
}

/// The bomb as seen from inside a lifecycle hook.
pub struct BombHandle<'a> {
    interface: &'a mut BombInterface,
    requests: &'a mut dyn RequestSink,
    now_ms: u64,
}

impl<'a> BombHandle<'a> {
    pub fn new(interface: &'a mut BombInterface, requests: &'a mut dyn RequestSink, now_ms: u64) -> Self {
        Self {
            interface,
            requests,
            now_ms,
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    pub fn state(&self) -> &BombState {
        self.interface.state()
    }

    pub fn bomb_config(&self) -> Option<&BombConfig> {
        self.interface.bomb_config()
    }

    pub fn is_about_to_explode(&self) -> bool {
        self.interface.is_about_to_explode()
    }

    pub fn requests(&mut self) -> &mut dyn RequestSink {
        &mut *self.requests
    }

    pub fn strike(&mut self) {
        log_queue_error(BombInterface::strike(&mut *self.requests));
    }

    pub fn defuse_me(&mut self) {
        log_queue_error(BombInterface::defuse_me(&mut *self.requests));
    }

    pub fn ack_ready(&mut self) {
        log_queue_error(BombInterface::ack_ready(&mut *self.requests));
    }
}

fn log_queue_error(result: Result<u8, ClientError>) {
    if let Err(e) = result {
        warn!("{}", e);
    }
}

/// Lifecycle of one peripheral. Every hook has a no-op default.
#[allow(unused_variables)]
pub trait BombComponent: 'static {
    fn identity(&self) -> ComponentIdentity;

    /// Variables the master may configure, in declaration order.
    fn variables(&self) -> &[VariableParam] {
        &[]
    }

    /// Events wanted beyond [`EventBits::ALWAYS_LISTEN`].
    fn accepted_events(&self) -> EventBits {
        EventBits::NONE
    }

    fn sync_flags(&self) -> SyncFlags {
        SyncFlags::NOTHING
    }

    /// One-time hardware setup, before the first `standby`.
    fn bootstrap(&mut self) {}

    fn standby(&mut self, bomb: &mut BombHandle<'_>) {}

    fn arm(&mut self, bomb: &mut BombHandle<'_>) {}

    fn reset(&mut self, bomb: &mut BombHandle<'_>) {}

    /// Game logic, run while armed and all requests are answered.
    fn update(&mut self, bomb: &mut BombHandle<'_>) {}

    fn display(&mut self, now_ms: u64) {}

    fn idle_display(&mut self, now_ms: u64) {}

    fn on_event(&mut self, event_id: u8, data: &[u8], bomb: &mut BombHandle<'_>) {}

    fn load_bomb_config(&mut self, config: &BombConfig) {}

    fn load_config(&mut self, config: ComponentConfig) {}

    /// Runs once per configuration cycle after both configs arrived.
    fn configure(&mut self, bomb: &mut BombHandle<'_>) {}
}

pub const STRIKE_COLOR: u32 = 0xFF_00_00;
pub const DEFUSED_COLOR: u32 = 0x00_FF_00;
pub const STRIKE_FLASH_MS: u64 = 1000;

/// Status LED of a module.
pub trait ModuleLedDriver: 'static {
    fn init(&mut self);

    fn turn_on(&mut self, color: u32);

    fn turn_off(&mut self);
}

/// Strike and defuse handling with a status LED program.
pub struct DefusableModule<L> {
    leds: L,
    events: EventManager<L>,
    queue: EventQueue<L>,
    led_program: EventMutex,
    defused: bool,
}

impl<L: ModuleLedDriver> DefusableModule<L> {
    pub fn new(leds: L) -> Self {
        Self {
            leds,
            events: EventManager::new(),
            queue: EventQueue::new(),
            led_program: EventMutex::new(),
            defused: false,
        }
    }

    pub fn flags() -> ModuleFlags {
        ModuleFlags::DEFUSABLE
    }

    pub fn bootstrap(&mut self) {
        self.leds.init();
    }

    pub fn arm(&mut self) {
        self.defused = false;
    }

    pub fn reset(&mut self) {
        self.events.cancel_all();
        self.queue.clear();
        self.leds.turn_off();
        self.defused = false;
    }

    pub fn is_defused(&self) -> bool {
        self.defused
    }

    /// Flashes the status LED red and reports the strike. A strike arriving
    /// while the flash is still pending does not restart it.
    pub fn strike(&mut self, bomb: &mut BombHandle<'_>) {
        let flash = Event::once(|leds: &mut L| leds.turn_on(STRIKE_COLOR))
            .then_wait(STRIKE_FLASH_MS)
            .then(|leds: &mut L, _: &mut Step<L>| {
                leds.turn_off();
                true
            });
        if !self.queue.queue_exclusive(flash, &self.led_program) {
            debug!("Strike flash already pending");
        }
        bomb.strike();
    }

    pub fn defuse(&mut self, bomb: &mut BombHandle<'_>) {
        if self.defused {
            return;
        }
        self.defused = true;
        self.events.cancel_all();
        self.queue.clear();
        self.leds.turn_on(DEFUSED_COLOR);
        bomb.defuse_me();
        info!("Module defused");
    }

    /// Starts queued LED programs and advances the running ones.
    pub fn run_status_led(&mut self, now_ms: u64) -> bool {
        self.queue.execute(&mut self.events);
        self.events.update(&mut self.leds, now_ms)
    }

    pub fn is_led_program_pending(&self) -> bool {
        self.led_program.is_locked()
    }

    pub fn leds(&self) -> &L {
        &self.leds
    }

    pub fn leds_mut(&mut self) -> &mut L {
        &mut self.leds
    }
}
