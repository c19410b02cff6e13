//! Component view of the bomb: synced game state and the requests a
//! component sends to the master.

use alloc::vec::Vec;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::bconf::{BombEvent, SyncFlags};
use crate::client::{ClientError, RequestPool, RequestSink};
use crate::config::{split_config_response, BombConfig};

pub const GET_BOMB_CONFIG: &str = "GetBombConfig";
pub const GET_COMPONENT_CONFIG: &str = "GetComponentConfigByBusAddress";
pub const GET_CLOCK: &str = "GetClock";
pub const GET_STRIKES: &str = "GetStrikes";
pub const ACK_READY_TO_ARM: &str = "AckReadyToArm";
pub const ADD_STRIKE: &str = "AddStrike";
pub const DEFUSE_COMPONENT: &str = "DefuseComponent";

/// Compensates bus latency of a clock sync.
pub const CLOCK_SYNC_CORRECTION_MS: i32 = 20;
pub const ABOUT_TO_EXPLODE_MS: i32 = 10_000;

/// Milliseconds left on the bomb timer.
pub type BombClock = i32;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BombState {
    pub clock: BombClock,
    pub strikes: u8,
    pub defused_modules: u8,
}

impl BombState {
    pub fn minutes(&self) -> i32 {
        self.clock / 60_000
    }

    pub fn seconds(&self) -> i32 {
        (self.clock / 1000) % 60
    }

    pub fn hundredths(&self) -> i32 {
        (self.clock / 10) % 100
    }
}

/// Application state that owns a [`BombInterface`] and receives the
/// configuration fetched through it.
pub trait InterfaceHost: Sized + 'static {
    fn interface(&mut self) -> &mut BombInterface;

    fn on_bomb_config(&mut self, requests: &mut RequestPool<Self>, config: BombConfig);

    fn on_component_config(&mut self, requests: &mut RequestPool<Self>, blob: &[u8]);
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BombInterface {
    sync_flags: SyncFlags,
    state: BombState,
    bomb_config: Option<BombConfig>,
    bomb_config_done: bool,
    component_config_done: bool,
    configured: bool,
}

impl BombInterface {
    pub fn new(sync_flags: SyncFlags) -> Self {
        Self {
            sync_flags,
            ..Self::default()
        }
    }

    pub fn sync_flags(&self) -> SyncFlags {
        self.sync_flags
    }

    pub fn state(&self) -> &BombState {
        &self.state
    }

    pub fn bomb_config(&self) -> Option<&BombConfig> {
        self.bomb_config.as_ref()
    }

    /// Dispatcher registered ahead of the component's own.
    pub fn on_event<A: InterfaceHost>(host: &mut A, requests: &mut RequestPool<A>, event_id: u8, _data: &[u8]) {
        let flags = host.interface().sync_flags;
        match BombEvent::from_id(event_id) {
            Some(BombEvent::Reset) => requests.discard(),
            Some(BombEvent::Strike) if flags.contains(SyncFlags::SYNC_STRIKES) => {
                let _ = Self::sync_strikes(requests);
            }
            Some(BombEvent::TimerSync) if flags.contains(SyncFlags::SYNC_CLOCK) => {
                let _ = Self::sync_game_clock(requests);
            }
            _ => {}
        }
    }

    pub fn clear_configured_flags(&mut self) {
        self.bomb_config_done = false;
        self.component_config_done = false;
        self.configured = false;
    }

    pub fn is_bomb_config_done(&self) -> bool {
        self.bomb_config_done
    }

    pub fn is_component_config_done(&self) -> bool {
        self.component_config_done
    }

    pub fn mark_bomb_config_done(&mut self, config: Option<BombConfig>) {
        if config.is_some() {
            self.bomb_config = config;
        }
        self.bomb_config_done = true;
    }

    pub fn mark_component_config_done(&mut self) {
        self.component_config_done = true;
    }

    /// True exactly once per configuration cycle, when both configs arrived.
    pub fn take_ready_to_configure(&mut self) -> bool {
        if self.bomb_config_done && self.component_config_done && !self.configured {
            self.configured = true;
            return true;
        }
        false
    }

    pub fn load_bomb_config<A: InterfaceHost>(requests: &mut RequestPool<A>) -> Result<u8, ClientError> {
        requests.queue_with_handler(GET_BOMB_CONFIG, Vec::new(), |host: &mut A, requests: &mut RequestPool<A>, data: &[u8]| {
            match split_config_response(data).and_then(BombConfig::parse) {
                Ok(config) => {
                    debug!(modules = config.modules.len(), serial = %config.serial, "Bomb config received");
                    host.on_bomb_config(requests, config);
                }
                Err(e) => warn!("Bad bomb config: {}", e),
            }
        })
    }

    pub fn load_component_config<A: InterfaceHost>(requests: &mut RequestPool<A>) -> Result<u8, ClientError> {
        requests.queue_with_handler(
            GET_COMPONENT_CONFIG,
            Vec::new(),
            |host: &mut A, requests: &mut RequestPool<A>, data: &[u8]| match split_config_response(data) {
                Ok(blob) => {
                    debug!(size = blob.len(), "Component config received");
                    host.on_component_config(requests, blob);
                }
                Err(e) => warn!("Bad component config: {}", e),
            },
        )
    }

    pub fn sync_game_clock<A: InterfaceHost>(requests: &mut RequestPool<A>) -> Result<u8, ClientError> {
        requests.queue_with_handler(GET_CLOCK, Vec::new(), |host: &mut A, _: &mut RequestPool<A>, data: &[u8]| {
            match data.get(..4) {
                Some(&[a, b, c, d]) => {
                    let clock = i32::from_le_bytes([a, b, c, d]);
                    host.interface().update_clock(clock.saturating_sub(CLOCK_SYNC_CORRECTION_MS));
                }
                _ => warn!("Short clock response of {} bytes", data.len()),
            }
        })
    }

    pub fn sync_strikes<A: InterfaceHost>(requests: &mut RequestPool<A>) -> Result<u8, ClientError> {
        requests.queue_with_handler(GET_STRIKES, Vec::new(), |host: &mut A, _: &mut RequestPool<A>, data: &[u8]| {
            match data.first() {
                Some(&strikes) => host.interface().state.strikes = strikes,
                None => warn!("Empty strikes response"),
            }
        })
    }

    pub fn ack_ready(requests: &mut dyn RequestSink) -> Result<u8, ClientError> {
        requests.queue_simple(ACK_READY_TO_ARM)
    }

    pub fn strike(requests: &mut dyn RequestSink) -> Result<u8, ClientError> {
        requests.queue_simple(ADD_STRIKE)
    }

    pub fn defuse_me(requests: &mut dyn RequestSink) -> Result<u8, ClientError> {
        requests.queue_simple(DEFUSE_COMPONENT)
    }

    pub fn update_clock(&mut self, clock: BombClock) {
        self.state.clock = clock.max(0);
    }

    pub fn is_about_to_explode(&self) -> bool {
        self.state.clock < ABOUT_TO_EXPLODE_MS
    }
}
