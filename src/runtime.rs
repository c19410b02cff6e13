//! Main loop of a component.
//!
//! [`ComponentRuntime`] wires a [`BombComponent`] to the bomb client: it
//! answers the handshake, turns bomb events into lifecycle requests and
//! applies those requests on the next [`tick`](ComponentRuntime::tick) once
//! every outstanding request has been answered.

use alloc::vec::Vec;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::address::address_from_analog;
use crate::bconf::{BombEvent, ComponentKind, EventBits, SyncFlags};
use crate::bus::BusSlave;
use crate::client::{BombClient, ClientError, ClientStats, RequestPool};
use crate::component::{BombComponent, BombHandle};
use crate::config::{BombConfig, ComponentConfig};
use crate::interface::{BombInterface, InterfaceHost};
use crate::transport::{ServiceOrder, SlaveBus};

/// Lifecycle change waiting for the next tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StateRequest {
    #[default]
    None,
    Standby,
    Arm,
    /// Runs the reset hook, then settles in standby.
    Reset,
}

/// Application state owned by the bomb client of a component.
pub struct ComponentHost<M> {
    component: M,
    interface: BombInterface,
    kind: ComponentKind,
    armed: bool,
    requested: StateRequest,
    now_ms: u64,
}

impl<M: BombComponent> ComponentHost<M> {
    fn new(component: M) -> Self {
        Self {
            interface: BombInterface::new(component.sync_flags()),
            kind: component.identity().kind(),
            component,
            armed: false,
            requested: StateRequest::None,
            now_ms: 0,
        }
    }

    pub fn component(&self) -> &M {
        &self.component
    }

    pub fn component_mut(&mut self) -> &mut M {
        &mut self.component
    }

    pub fn bomb_interface(&self) -> &BombInterface {
        &self.interface
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn requested_state(&self) -> StateRequest {
        self.requested
    }

    /// Handshake payload after the check code: `[u32 event mask][schema]`.
    pub fn capabilities(&self) -> Vec<u8> {
        let mask = self.component.accepted_events() | EventBits::ALWAYS_LISTEN;
        let mut blob = mask.0.to_le_bytes().to_vec();
        blob.extend(self.component.identity().schema(self.component.variables()));
        blob
    }

    fn dispatch_event(&mut self, requests: &mut RequestPool<Self>, event_id: u8, data: &[u8]) {
        debug!(event_id, "Component event received");
        match BombEvent::from_id(event_id) {
            Some(BombEvent::Configure) => {
                debug!("Begin configuration");
                self.interface.clear_configured_flags();
                if self.interface.sync_flags().contains(SyncFlags::FETCH_CONFIG) {
                    log_queue_error(BombInterface::load_bomb_config(requests));
                } else {
                    self.interface.mark_bomb_config_done(None);
                }
                log_queue_error(BombInterface::load_component_config(requests));
            }
            Some(BombEvent::Reset | BombEvent::Explosion) => self.requested = StateRequest::Reset,
            Some(BombEvent::Defusal) => self.requested = StateRequest::Standby,
            Some(BombEvent::Arm) => self.requested = StateRequest::Arm,
            _ => {}
        }
        let mut bomb = BombHandle::new(&mut self.interface, requests, self.now_ms);
        self.component.on_event(event_id, data, &mut bomb);
    }

    fn try_configure(&mut self, requests: &mut RequestPool<Self>) {
        if !self.interface.take_ready_to_configure() {
            return;
        }
        let mut bomb = BombHandle::new(&mut self.interface, requests, self.now_ms);
        self.component.configure(&mut bomb);
        bomb.ack_ready();
        debug!("Configured, ready to arm");
    }

    fn apply_state_request(&mut self, requests: &mut RequestPool<Self>) {
        let mut request = core::mem::take(&mut self.requested);
        loop {
            debug!(?request, "Applying state change");
            let mut bomb = BombHandle::new(&mut self.interface, &mut *requests, self.now_ms);
            match request {
                StateRequest::Arm => {
                    self.armed = true;
                    self.component.arm(&mut bomb);
                }
                StateRequest::Standby => {
                    self.armed = false;
                    self.component.standby(&mut bomb);
                }
                StateRequest::Reset => {
                    self.component.reset(&mut bomb);
                    request = StateRequest::Standby;
                    continue;
                }
                StateRequest::None => {}
            }
            break;
        }
    }
}

impl<M: BombComponent> InterfaceHost for ComponentHost<M> {
    fn interface(&mut self) -> &mut BombInterface {
        &mut self.interface
    }

    fn on_bomb_config(&mut self, requests: &mut RequestPool<Self>, config: BombConfig) {
        self.component.load_bomb_config(&config);
        self.interface.mark_bomb_config_done(Some(config));
        self.try_configure(requests);
    }

    fn on_component_config(&mut self, requests: &mut RequestPool<Self>, blob: &[u8]) {
        match ComponentConfig::parse(self.kind, blob) {
            Ok(config) => {
                self.component.load_config(config);
                self.interface.mark_component_config_done();
                self.try_configure(requests);
            }
            Err(e) => warn!("Could not parse component config: {}", e),
        }
    }
}

fn log_queue_error(result: Result<u8, ClientError>) {
    if let Err(e) = result {
        warn!("{}", e);
    }
}

/// A component attached to the bus through its own bomb client.
pub struct ComponentRuntime<M> {
    client: BombClient<ComponentHost<M>>,
}

impl<M: BombComponent> ComponentRuntime<M> {
    pub fn new(component: M) -> Self {
        Self::with_order(component, ServiceOrder::default())
    }

    pub fn with_order(component: M, order: ServiceOrder) -> Self {
        Self {
            client: BombClient::new(ComponentHost::new(component), order),
        }
    }

    /// Brings the component up and attaches it to the bus. Returns the
    /// address derived from `analog_reading`.
    pub fn setup(&mut self, analog_reading: u16) -> Result<u8, ClientError> {
        let (host, requests) = self.client.parts_mut();
        host.component.bootstrap();
        let mut bomb = BombHandle::new(&mut host.interface, requests, host.now_ms);
        host.component.standby(&mut bomb);

        self.client
            .set_handshake_handler(|host: &mut ComponentHost<M>| host.capabilities());
        self.client
            .add_event_dispatcher(BombInterface::on_event::<ComponentHost<M>>)?;
        self.client.add_event_dispatcher(
            |host: &mut ComponentHost<M>, requests: &mut RequestPool<ComponentHost<M>>, event_id: u8, data: &[u8]| {
                host.dispatch_event(requests, event_id, data);
            },
        )?;

        let address = address_from_analog(analog_reading);
        self.client.attach(address);
        info!(address, "Setup done");
        Ok(address)
    }

    /// One pass of the cooperative main loop.
    pub fn tick(&mut self, now_ms: u64) {
        let (host, requests) = self.client.parts_mut();
        host.now_ms = now_ms;
        if host.requested != StateRequest::None && requests.is_all_sync_done() {
            host.apply_state_request(requests);
        }

        if host.armed {
            if requests.is_all_sync_done() {
                let mut bomb = BombHandle::new(&mut host.interface, requests, now_ms);
                host.component.update(&mut bomb);
            }
            host.component.display(now_ms);
        } else {
            host.component.idle_display(now_ms);
        }
    }

    pub fn is_armed(&self) -> bool {
        self.client.app().armed
    }

    pub fn requested_state(&self) -> StateRequest {
        self.client.app().requested
    }

    pub fn component(&self) -> &M {
        &self.client.app().component
    }

    pub fn component_mut(&mut self) -> &mut M {
        &mut self.client.app_mut().component
    }

    pub fn interface(&self) -> &BombInterface {
        &self.client.app().interface
    }

    pub fn client(&self) -> &BombClient<ComponentHost<M>> {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut BombClient<ComponentHost<M>> {
        &mut self.client
    }

    pub fn stats(&self) -> &ClientStats {
        self.client.stats()
    }

    pub fn on_receive<B: SlaveBus>(&mut self, bus: &mut B) {
        self.client.on_receive(bus);
    }

    pub fn on_request<B: SlaveBus>(&mut self, bus: &mut B) {
        self.client.on_request(bus);
    }
}

impl<M: BombComponent> BusSlave for ComponentRuntime<M> {
    fn on_receive<B: SlaveBus>(&mut self, bus: &mut B) {
        ComponentRuntime::on_receive(self, bus);
    }

    fn on_request<B: SlaveBus>(&mut self, bus: &mut B) {
        ComponentRuntime::on_request(self, bus);
    }
}
