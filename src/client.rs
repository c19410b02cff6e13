//! Bomb client protocol.
//!
//! Framed request/response/event protocol spoken with the bus master on top
//! of the promise transport. Every packet is `[0xFE][u16 length LE][content]`;
//! the first content byte selects the command. A lone `0xEA` written outside
//! of a packet is a discovery probe, answered with `0xAE` on the next read.

use alloc::boxed::Box;
use alloc::vec::Vec;

use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::bus::BusSlave;
use crate::hash::{hash_id, IdHash};
use crate::promise::{Promise, Response};
use crate::transport::{AsyncI2c, I2cContext, ServiceOrder, SlaveBus};

pub const PACKET_MAGIC: u8 = 0xFE;
pub const PROLOG_SIZE: usize = 3;
pub const DISCOVERY_PROBE: u8 = 0xEA;
pub const DISCOVERY_REPLY: u8 = 0xAE;
pub const HANDSHAKE_CHECK_CODE: [u8; 6] = *b"Julka\0";

pub const REQUEST_POOL_LIMIT: usize = 8;
pub const MAX_EVENT_DISPATCHERS: usize = 4;
/// Bytes in front of the parameters of each flushed request.
pub const POLL_ENTRY_HEADER_SIZE: usize = 7;

const_assert!(REQUEST_POOL_LIMIT <= 32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum NetCommand {
    Invalid = 0,
    Poll = 1,
    Response = 2,
    Event = 3,
    Handshake = 4,
}

pub const NET_COMMAND_MAX: usize = 5;

impl TryFrom<u8> for NetCommand {
    type Error = ClientError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(NetCommand::Invalid),
            1 => Ok(NetCommand::Poll),
            2 => Ok(NetCommand::Response),
            3 => Ok(NetCommand::Event),
            4 => Ok(NetCommand::Handshake),
            other => Err(ClientError::UnknownCommand(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("could not insert request for {0} - queue full")]
    RequestPoolFull(alloc::string::String),
    #[error("response id out of range: {0}")]
    ResponseIdOutOfRange(u8),
    #[error("invalid packet start byte {0:#04x}")]
    InvalidMagic(u8),
    #[error("unknown command id {0}")]
    UnknownCommand(u8),
    #[error("empty packet")]
    EmptyPacket,
    #[error("packet content of {0} bytes does not fit the length field")]
    PacketTooLarge(usize),
    #[error("event dispatcher table full")]
    DispatcherTableFull,
}

/// Encodes the 3-byte packet prolog for `content_len` bytes of content.
pub fn encode_prolog(content_len: u16) -> [u8; PROLOG_SIZE] {
    let [lo, hi] = content_len.to_le_bytes();
    [PACKET_MAGIC, lo, hi]
}

/// Called with the response bytes after the slot id.
pub type ResponseHandler<A> = Box<dyn FnOnce(&mut A, &mut RequestPool<A>, &[u8])>;
/// Called for every EVENT command with the event id and its data.
pub type EventDispatcher<A> = Box<dyn FnMut(&mut A, &mut RequestPool<A>, u8, &[u8])>;
/// Produces the capability blob following the handshake check code.
pub type HandshakeHandler<A> = Box<dyn FnMut(&mut A) -> Vec<u8>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestState {
    /// Waiting for the next POLL.
    Queued,
    /// Announced to the master, waiting for its RESPONSE.
    Flushed,
}

struct ServerRequest<A> {
    handler_id: IdHash,
    params: Vec<u8>,
    on_response: Option<ResponseHandler<A>>,
    state: RequestState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestSnapshot {
    pub slot: u8,
    pub handler_id: IdHash,
    #[serde(with = "serde_bytes")]
    pub params: Vec<u8>,
    pub state: RequestState,
}

/// Queueing surface for code that does not need typed response handlers.
pub trait RequestSink {
    fn queue_simple(&mut self, name: &str) -> Result<u8, ClientError>;

    fn queue_with_params(&mut self, name: &str, params: Vec<u8>) -> Result<u8, ClientError>;
}

/// Fixed pool of requests awaiting the master's response. The slot index is
/// the correlation id used on the wire.
pub struct RequestPool<A> {
    slots: [Option<ServerRequest<A>>; REQUEST_POOL_LIMIT],
    alloc: u32,
    dropped: u32,
}

impl<A> RequestPool<A> {
    pub fn new() -> Self {
        Self {
            slots: Default::default(),
            alloc: 0,
            dropped: 0,
        }
    }

    fn bit(slot: usize) -> u32 {
        1 << slot
    }

    /// Lowest free slot, if any.
    pub fn available_slot(&self) -> Option<u8> {
        (0..REQUEST_POOL_LIMIT)
            .find(|&slot| self.alloc & Self::bit(slot) == 0)
            .map(|slot| slot as u8)
    }

    pub fn queue_request(
        &mut self,
        name: &str,
        params: Vec<u8>,
        on_response: Option<ResponseHandler<A>>,
    ) -> Result<u8, ClientError> {
        let Some(slot) = self.available_slot() else {
            warn!("Could not insert request for {} - queue full!", name);
            self.dropped += 1;
            return Err(ClientError::RequestPoolFull(name.into()));
        };
        debug!(slot, name, params = params.len(), "Queued request");
        self.slots[usize::from(slot)] = Some(ServerRequest {
            handler_id: hash_id(name),
            params,
            on_response,
            state: RequestState::Queued,
        });
        self.alloc |= Self::bit(usize::from(slot));
        Ok(slot)
    }

    /// Queues a request whose response is handled by `handler`.
    pub fn queue_with_handler<F>(
        &mut self,
        name: &str,
        params: Vec<u8>,
        handler: F,
    ) -> Result<u8, ClientError>
    where
        F: FnOnce(&mut A, &mut RequestPool<A>, &[u8]) + 'static,
    {
        self.queue_request(name, params, Some(Box::new(handler)))
    }

    /// Abandons every outstanding request without running any handler.
    pub fn discard(&mut self) {
        if self.alloc != 0 {
            debug!(outstanding = self.alloc.count_ones(), "Discarding requests");
        }
        self.alloc = 0;
        self.slots = Default::default();
    }

    pub fn is_all_sync_done(&self) -> bool {
        self.alloc == 0
    }

    pub fn outstanding(&self) -> usize {
        self.alloc.count_ones() as usize
    }

    /// Requests dropped because the pool was full.
    pub fn dropped(&self) -> u32 {
        self.dropped
    }

    pub fn is_occupied(&self, slot: u8) -> bool {
        usize::from(slot) < REQUEST_POOL_LIMIT && self.alloc & Self::bit(usize::from(slot)) != 0
    }

    pub fn snapshot(&self) -> Vec<RequestSnapshot> {
        self.occupied()
            .filter_map(|slot| {
                self.slots[slot].as_ref().map(|req| RequestSnapshot {
                    slot: slot as u8,
                    handler_id: req.handler_id,
                    params: req.params.clone(),
                    state: req.state,
                })
            })
            .collect()
    }

    fn occupied(&self) -> impl Iterator<Item = usize> + '_ {
        (0..REQUEST_POOL_LIMIT).filter(move |&slot| self.alloc & Self::bit(slot) != 0)
    }

    /// Serializes every occupied slot into a POLL response payload:
    /// `[count]` then `[slot][u32 hash][u16 size][params]` per request.
    /// Slots stay occupied until their RESPONSE arrives.
    pub fn flush(&mut self) -> Vec<u8> {
        let slots: Vec<usize> = self.occupied().collect();
        let size = 1 + slots
            .iter()
            .filter_map(|&slot| self.slots[slot].as_ref())
            .map(|req| POLL_ENTRY_HEADER_SIZE + req.params.len())
            .sum::<usize>();

        let mut payload = Vec::with_capacity(size);
        payload.push(slots.len() as u8);
        for slot in slots {
            let Some(req) = self.slots[slot].as_mut() else {
                continue;
            };
            payload.push(slot as u8);
            payload.extend_from_slice(&req.handler_id.to_le_bytes());
            payload.extend_from_slice(&(req.params.len() as u16).to_le_bytes());
            payload.extend_from_slice(&req.params);
            req.state = RequestState::Flushed;
        }
        payload
    }

    /// Frees `slot` and runs its response handler with `data`. The slot is
    /// released before the handler runs, so the handler may reuse it.
    pub fn resolve(&mut self, app: &mut A, slot: u8, data: &[u8]) -> Result<(), ClientError> {
        let index = usize::from(slot);
        if index >= REQUEST_POOL_LIMIT {
            warn!("Response ID out of range: {}", slot);
            return Err(ClientError::ResponseIdOutOfRange(slot));
        }
        let request = self.slots[index].take();
        self.alloc &= !Self::bit(index);
        match request.and_then(|req| req.on_response) {
            Some(handler) => {
                trace!(slot, size = data.len(), "Running response handler");
                handler(app, self, data);
            }
            None => trace!(slot, "Response without handler"),
        }
        Ok(())
    }
}

impl<A> Default for RequestPool<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> RequestSink for RequestPool<A> {
    fn queue_simple(&mut self, name: &str) -> Result<u8, ClientError> {
        self.queue_request(name, Vec::new(), None)
    }

    fn queue_with_params(&mut self, name: &str, params: Vec<u8>) -> Result<u8, ClientError> {
        self.queue_request(name, params, None)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientStats {
    pub packets_received: u32,
    pub packets_rejected: u32,
    pub packets_sent: u32,
    pub discovery_probes: u32,
    pub events_dispatched: u32,
    pub responses_handled: u32,
    pub polls_answered: u32,
}

type CommandHandler<A> = fn(&mut BombClient<A>, &[u8]);

/// Slave side of the bomb protocol, owning the application state `A` that
/// dispatchers and response handlers operate on.
pub struct BombClient<A> {
    i2c: AsyncI2c<Self>,
    requests: RequestPool<A>,
    app: A,
    dispatchers: heapless::Vec<EventDispatcher<A>, MAX_EVENT_DISPATCHERS>,
    handshake: Option<HandshakeHandler<A>>,
    discovery_requested: bool,
    address: Option<u8>,
    stats: ClientStats,
}

impl<A> I2cContext for BombClient<A> {
    fn i2c(&mut self) -> &mut AsyncI2c<Self> {
        &mut self.i2c
    }
}

impl<A: 'static> BombClient<A> {
    const COMMAND_HANDLERS: [Option<CommandHandler<A>>; NET_COMMAND_MAX] = [
        None,
        Some(Self::flush_requests),
        Some(Self::handle_response),
        Some(Self::dispatch_event),
        Some(Self::respond_to_handshake),
    ];

    pub fn new(app: A, order: ServiceOrder) -> Self {
        Self {
            i2c: AsyncI2c::new(order),
            requests: RequestPool::new(),
            app,
            dispatchers: heapless::Vec::new(),
            handshake: None,
            discovery_requested: false,
            address: None,
            stats: ClientStats::default(),
        }
    }

    /// Records the slave address the peripheral answers on.
    pub fn attach(&mut self, address: u8) {
        info!("Attached at bus address {:#04x}", address);
        self.address = Some(address);
    }

    pub fn address(&self) -> Option<u8> {
        self.address
    }

    pub fn app(&self) -> &A {
        &self.app
    }

    pub fn app_mut(&mut self) -> &mut A {
        &mut self.app
    }

    pub fn requests(&self) -> &RequestPool<A> {
        &self.requests
    }

    pub fn requests_mut(&mut self) -> &mut RequestPool<A> {
        &mut self.requests
    }

    /// Application state and request pool, borrowed together.
    pub fn parts_mut(&mut self) -> (&mut A, &mut RequestPool<A>) {
        (&mut self.app, &mut self.requests)
    }

    pub fn stats(&self) -> &ClientStats {
        &self.stats
    }

    pub fn add_event_dispatcher<F>(&mut self, dispatcher: F) -> Result<(), ClientError>
    where
        F: FnMut(&mut A, &mut RequestPool<A>, u8, &[u8]) + 'static,
    {
        self.dispatchers
            .push(Box::new(dispatcher))
            .map_err(|_| ClientError::DispatcherTableFull)
    }

    pub fn set_handshake_handler<F>(&mut self, handler: F)
    where
        F: FnMut(&mut A) -> Vec<u8> + 'static,
    {
        self.handshake = Some(Box::new(handler));
    }

    pub fn queue_request<F>(&mut self, name: &str, params: Vec<u8>, handler: F) -> Result<u8, ClientError>
    where
        F: FnOnce(&mut A, &mut RequestPool<A>, &[u8]) + 'static,
    {
        self.requests.queue_with_handler(name, params, handler)
    }

    pub fn queue_simple(&mut self, name: &str) -> Result<u8, ClientError> {
        self.requests.queue_simple(name)
    }

    pub fn discard_requests(&mut self) {
        self.requests.discard();
    }

    pub fn is_all_sync_done(&self) -> bool {
        self.requests.is_all_sync_done()
    }

    pub fn is_receiving(&self) -> bool {
        self.i2c.is_receiving()
    }

    /// Master wrote to us.
    pub fn on_receive<B: SlaveBus>(&mut self, bus: &mut B) {
        let mut bytes = bus.available();
        if bytes == 0 {
            return;
        }
        trace!(bytes, "Receiving");

        bytes -= AsyncI2c::handle_receive(self, bus, bytes);
        if bytes == 0 {
            return;
        }

        if bus.peek() == Ok(DISCOVERY_PROBE) {
            self.discovery_requested = true;
            self.stats.discovery_probes += 1;
            let _ = bus.read();
            debug!("Discovery probe received");
            return;
        }

        let packet = Self::read_packet().finally(|client, content| client.dispatch_command(content));
        AsyncI2c::submit(self, packet);
        while bytes > 0 && self.i2c.is_receiving() {
            let consumed = AsyncI2c::handle_receive(self, bus, bytes);
            if consumed == 0 {
                break;
            }
            bytes -= consumed;
        }
    }

    /// Master reads from us.
    pub fn on_request<B: SlaveBus>(&mut self, bus: &mut B) {
        if self.discovery_requested {
            self.discovery_requested = false;
            bus.write(&[DISCOVERY_REPLY]);
            return;
        }
        AsyncI2c::handle_request(self, bus);
    }

    /// Reads one framed packet and resolves with its content. A bad start
    /// byte ends the chain.
    pub fn read_packet() -> Promise<Self> {
        Promise::read_temp(PROLOG_SIZE).then(|client: &mut Self, prolog: &mut Response| {
            let &[magic, lo, hi] = prolog.as_bytes() else {
                return None;
            };
            if magic != PACKET_MAGIC {
                warn!("{}", ClientError::InvalidMagic(magic));
                client.stats.packets_rejected += 1;
                return None;
            }
            let size = usize::from(u16::from_le_bytes([lo, hi]));
            trace!(size, "Read packet prolog");
            if size == 0 {
                Some(Promise::ready())
            } else {
                Some(Promise::read(size))
            }
        })
    }

    /// Queues `content` as one framed packet. The prolog and the content go
    /// out as separate writes so each master read sees exactly one of them.
    pub fn write_packet(&mut self, content: Vec<u8>) -> Result<(), ClientError> {
        let size = u16::try_from(content.len()).map_err(|_| ClientError::PacketTooLarge(content.len()))?;
        let packet = Promise::write(encode_prolog(size).to_vec()).then(move |_: &mut Self, _: &mut Response| {
            if content.is_empty() {
                Some(Promise::ready())
            } else {
                Some(Promise::write(content))
            }
        });
        self.stats.packets_sent += 1;
        AsyncI2c::submit(self, packet);
        Ok(())
    }

    fn empty_response(&mut self) {
        if let Err(e) = self.write_packet(Vec::new()) {
            warn!("Could not write empty response: {}", e);
        }
    }

    fn dispatch_command(&mut self, content: &mut Response) {
        let Some((&command, params)) = content.as_bytes().split_first() else {
            warn!("{}", ClientError::EmptyPacket);
            self.stats.packets_rejected += 1;
            return;
        };
        self.stats.packets_received += 1;

        let handler = match NetCommand::try_from(command) {
            Ok(command) => Self::COMMAND_HANDLERS[command as usize],
            Err(e) => {
                warn!("{}", e);
                None
            }
        };
        match handler {
            Some(handler) => {
                debug!(command, size = params.len(), "Dispatching command");
                handler(self, params);
            }
            None => self.stats.packets_rejected += 1,
        }
    }

    fn flush_requests(&mut self, _params: &[u8]) {
        let payload = self.requests.flush();
        debug!(requests = payload.first().copied().unwrap_or(0), "Flushing requests");
        self.stats.polls_answered += 1;
        if let Err(e) = self.write_packet(payload) {
            warn!("Could not flush requests: {}", e);
        }
    }

    fn handle_response(&mut self, params: &[u8]) {
        let Some((&slot, data)) = params.split_first() else {
            warn!("Response without slot id");
            return;
        };
        if self.requests.resolve(&mut self.app, slot, data).is_ok() {
            self.stats.responses_handled += 1;
        }
    }

    fn dispatch_event(&mut self, params: &[u8]) {
        match params.split_first() {
            Some((&event_id, data)) => {
                debug!(event_id, size = data.len(), "Dispatching event");
                self.stats.events_dispatched += 1;
                for dispatcher in self.dispatchers.iter_mut() {
                    dispatcher(&mut self.app, &mut self.requests, event_id, data);
                }
            }
            None => warn!("Event without id"),
        }
        self.empty_response();
    }

    fn respond_to_handshake(&mut self, _params: &[u8]) {
        let info = match self.handshake.as_mut() {
            Some(handler) => handler(&mut self.app),
            None => Vec::new(),
        };
        let mut content = Vec::with_capacity(HANDSHAKE_CHECK_CODE.len() + info.len());
        content.extend_from_slice(&HANDSHAKE_CHECK_CODE);
        content.extend_from_slice(&info);
        debug!(size = content.len(), "Responding to handshake");
        if let Err(e) = self.write_packet(content) {
            warn!("Could not answer handshake: {}", e);
        }
    }
}

impl<A: 'static> BusSlave for BombClient<A> {
    fn on_receive<B: SlaveBus>(&mut self, bus: &mut B) {
        BombClient::on_receive(self, bus);
    }

    fn on_request<B: SlaveBus>(&mut self, bus: &mut B) {
        BombClient::on_request(self, bus);
    }
}
