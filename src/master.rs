//! Bus master peer for simulation and end-to-end tests.
//!
//! [`VirtualMaster`] speaks the master side of the bomb protocol against any
//! [`BusSlave`] over a [`VirtualBus`]: discovery, handshake, events and the
//! POLL/RESPONSE cycle. Writes and reads are split into transactions of at
//! most 32 bytes like on the real bus.

use alloc::string::String;
use alloc::vec::Vec;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::bconf::{BombEvent, ComponentKind, EventBits, ModuleFlags, VariableType};
use crate::bus::{request, transmit, BusSlave, VirtualBus};
use crate::client::{
    encode_prolog, NetCommand, DISCOVERY_PROBE, DISCOVERY_REPLY, HANDSHAKE_CHECK_CODE, PACKET_MAGIC, PROLOG_SIZE,
};
use crate::config::{encode_config_response, BombConfig, ByteReader, ConfigError};
use crate::hash::{hash_id, IdHash};
use crate::interface::{
    ACK_READY_TO_ARM, ADD_STRIKE, DEFUSE_COMPONENT, GET_BOMB_CONFIG, GET_CLOCK, GET_COMPONENT_CONFIG, GET_STRIKES,
};
use crate::transport::I2C_BUFFER_LIMIT;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MasterError {
    #[error("device did not answer the discovery probe (got {0:?})")]
    NoDiscoveryReply(Option<u8>),
    #[error("invalid packet start: {0:02x?}")]
    InvalidPacketStart(Vec<u8>),
    #[error("short read: wanted {wanted} bytes, got {got}")]
    ShortRead { wanted: usize, got: usize },
    #[error("invalid handshake check code")]
    BadCheckCode,
    #[error("unknown component type {0}")]
    UnknownComponentKind(u8),
    #[error("unknown variable type {0}")]
    UnknownVariableType(u8),
    #[error("expected an empty reply, got {0} bytes")]
    UnexpectedReply(usize),
    #[error("packet of {0} bytes is too large")]
    PacketTooLarge(usize),
    #[error("malformed payload: {0}")]
    Malformed(#[from] ConfigError),
}

/// Component description sent in reply to HANDSHAKE.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComponentDescriptor {
    Module {
        name: String,
        flags: ModuleFlags,
        #[serde(with = "serde_bytes")]
        extra: Vec<u8>,
    },
    Label {
        texts: Vec<String>,
    },
    Port {
        name: String,
    },
    Battery {
        count: u8,
        size: u8,
    },
}

impl ComponentDescriptor {
    pub fn kind(&self) -> ComponentKind {
        match self {
            ComponentDescriptor::Module { .. } => ComponentKind::Module,
            ComponentDescriptor::Label { .. } => ComponentKind::Label,
            ComponentDescriptor::Port { .. } => ComponentKind::Port,
            ComponentDescriptor::Battery { .. } => ComponentKind::Battery,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub accepted_events: EventBits,
    pub descriptor: ComponentDescriptor,
    pub variables: Vec<(String, VariableType)>,
}

impl Handshake {
    /// Parses a HANDSHAKE reply, check code included.
    pub fn parse(content: &[u8]) -> Result<Self, MasterError> {
        let mut reader = ByteReader::new(content);
        if reader.bytes(HANDSHAKE_CHECK_CODE.len())? != HANDSHAKE_CHECK_CODE {
            return Err(MasterError::BadCheckCode);
        }
        let accepted_events = EventBits(reader.u32()?);
        let kind_id = reader.u8()?;
        let descriptor = match ComponentKind::from_id(kind_id) {
            Some(ComponentKind::Module) => {
                let name = read_str(&mut reader)?;
                let flags = ModuleFlags(reader.u8()?);
                let extra_len = usize::from(reader.u16()?);
                ComponentDescriptor::Module {
                    name,
                    flags,
                    extra: reader.bytes(extra_len)?.to_vec(),
                }
            }
            Some(ComponentKind::Label) => {
                let count = reader.u8()?;
                let texts = (0..count).map(|_| read_str(&mut reader)).collect::<Result<_, _>>()?;
                ComponentDescriptor::Label { texts }
            }
            Some(ComponentKind::Port) => ComponentDescriptor::Port {
                name: read_str(&mut reader)?,
            },
            Some(ComponentKind::Battery) => ComponentDescriptor::Battery {
                count: reader.u8()?,
                size: reader.u8()?,
            },
            None => return Err(MasterError::UnknownComponentKind(kind_id)),
        };

        let count = reader.u8()?;
        let mut variables = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            let name = read_str(&mut reader)?;
            let type_id = reader.u8()?;
            let kind = VariableType::from_id(type_id).ok_or(MasterError::UnknownVariableType(type_id))?;
            variables.push((name, kind));
        }
        Ok(Self {
            accepted_events,
            descriptor,
            variables,
        })
    }
}

fn read_str(reader: &mut ByteReader<'_>) -> Result<String, MasterError> {
    let offset = reader.position();
    let len = usize::from(reader.u8()?);
    let bytes = reader.bytes(len)?;
    core::str::from_utf8(bytes)
        .map(String::from)
        .map_err(|_| MasterError::Malformed(ConfigError::InvalidUtf8(offset)))
}

/// One request announced in a POLL reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolledRequest {
    pub slot: u8,
    pub handler_id: IdHash,
    #[serde(with = "serde_bytes")]
    pub params: Vec<u8>,
}

pub fn parse_poll(payload: &[u8]) -> Result<Vec<PolledRequest>, MasterError> {
    let mut reader = ByteReader::new(payload);
    let count = reader.u8()?;
    let mut polled = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        let slot = reader.u8()?;
        let handler_id = reader.u32()?;
        let size = usize::from(reader.u16()?);
        polled.push(PolledRequest {
            slot,
            handler_id,
            params: reader.bytes(size)?.to_vec(),
        });
    }
    Ok(polled)
}

/// Game state kept by the master and served to the component.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterState {
    pub clock_ms: i32,
    pub strikes: u8,
    pub ready_to_arm: bool,
    pub defused: bool,
    pub requests_served: u32,
    pub unknown_requests: u32,
}

pub struct VirtualMaster {
    bus: VirtualBus,
    bomb_config: BombConfig,
    component_config: Vec<u8>,
    state: MasterState,
}

impl VirtualMaster {
    pub fn new(bomb_config: BombConfig, component_config: Vec<u8>) -> Self {
        let state = MasterState {
            clock_ms: bomb_config.time_limit_ms,
            ..MasterState::default()
        };
        Self {
            bus: VirtualBus::new(),
            bomb_config,
            component_config,
            state,
        }
    }

    pub fn state(&self) -> &MasterState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut MasterState {
        &mut self.state
    }

    pub fn bomb_config(&self) -> &BombConfig {
        &self.bomb_config
    }

    pub fn set_component_config(&mut self, blob: Vec<u8>) {
        self.component_config = blob;
    }

    /// Counts the bomb clock down by `elapsed_ms`, stopping at zero.
    pub fn advance_clock(&mut self, elapsed_ms: i32) {
        self.state.clock_ms = self.state.clock_ms.saturating_sub(elapsed_ms).max(0);
    }

    pub fn discover<S: BusSlave>(&mut self, slave: &mut S) -> Result<(), MasterError> {
        transmit(slave, &mut self.bus, &[DISCOVERY_PROBE]);
        let reply = request(slave, &mut self.bus, 1);
        match reply.first() {
            Some(&DISCOVERY_REPLY) => {
                debug!("Device ping succeeded");
                Ok(())
            }
            other => Err(MasterError::NoDiscoveryReply(other.copied())),
        }
    }

    pub fn send_packet<S: BusSlave>(&mut self, slave: &mut S, content: &[u8]) -> Result<(), MasterError> {
        let size = u16::try_from(content.len()).map_err(|_| MasterError::PacketTooLarge(content.len()))?;
        let mut packet = encode_prolog(size).to_vec();
        packet.extend_from_slice(content);
        trace!(size = content.len(), "Sending packet");
        transmit(slave, &mut self.bus, &packet);
        Ok(())
    }

    pub fn read_packet<S: BusSlave>(&mut self, slave: &mut S) -> Result<Vec<u8>, MasterError> {
        let header = request(slave, &mut self.bus, PROLOG_SIZE);
        if header.len() != PROLOG_SIZE || header[0] != PACKET_MAGIC {
            return Err(MasterError::InvalidPacketStart(header));
        }
        let mut remaining = usize::from(u16::from_le_bytes([header[1], header[2]]));
        let mut content = Vec::with_capacity(remaining);
        while remaining > 0 {
            let wanted = remaining.min(I2C_BUFFER_LIMIT);
            let chunk = request(slave, &mut self.bus, wanted);
            if chunk.len() != wanted {
                return Err(MasterError::ShortRead {
                    wanted,
                    got: chunk.len(),
                });
            }
            content.extend_from_slice(&chunk);
            remaining -= wanted;
        }
        trace!(size = content.len(), "Read packet");
        Ok(content)
    }

    pub fn send_command<S: BusSlave>(
        &mut self,
        slave: &mut S,
        command: NetCommand,
        params: &[u8],
    ) -> Result<Vec<u8>, MasterError> {
        let mut content = Vec::with_capacity(1 + params.len());
        content.push(command as u8);
        content.extend_from_slice(params);
        self.send_packet(slave, &content)?;
        self.read_packet(slave)
    }

    pub fn handshake<S: BusSlave>(&mut self, slave: &mut S) -> Result<Handshake, MasterError> {
        let reply = self.send_command(slave, NetCommand::Handshake, &[])?;
        let handshake = Handshake::parse(&reply)?;
        info!(kind = ?handshake.descriptor.kind(), variables = handshake.variables.len(), "Handshake done");
        Ok(handshake)
    }

    pub fn send_event<S: BusSlave>(&mut self, slave: &mut S, event: BombEvent, data: &[u8]) -> Result<(), MasterError> {
        let mut params = Vec::with_capacity(1 + data.len());
        params.push(event.id());
        params.extend_from_slice(data);
        debug!(?event, "Sending event");
        let reply = self.send_command(slave, NetCommand::Event, &params)?;
        if reply.is_empty() {
            Ok(())
        } else {
            Err(MasterError::UnexpectedReply(reply.len()))
        }
    }

    pub fn poll<S: BusSlave>(&mut self, slave: &mut S) -> Result<Vec<PolledRequest>, MasterError> {
        let payload = self.send_command(slave, NetCommand::Poll, &[])?;
        parse_poll(&payload)
    }

    /// Resolves `slot` on the component. RESPONSE gets no reply.
    pub fn respond<S: BusSlave>(&mut self, slave: &mut S, slot: u8, data: &[u8]) -> Result<(), MasterError> {
        let mut content = Vec::with_capacity(2 + data.len());
        content.push(NetCommand::Response as u8);
        content.push(slot);
        content.extend_from_slice(data);
        self.send_packet(slave, &content)
    }

    /// One POLL/RESPONSE round. Returns how many requests were answered.
    pub fn sync<S: BusSlave>(&mut self, slave: &mut S) -> Result<usize, MasterError> {
        let polled = self.poll(slave)?;
        for req in &polled {
            let response = self.answer(req)?;
            self.respond(slave, req.slot, &response)?;
        }
        Ok(polled.len())
    }

    fn answer(&mut self, req: &PolledRequest) -> Result<Vec<u8>, MasterError> {
        let id = req.handler_id;
        self.state.requests_served += 1;
        let response = if id == hash_id(GET_BOMB_CONFIG) {
            encode_config_response(&self.bomb_config.to_bytes())?
        } else if id == hash_id(GET_COMPONENT_CONFIG) {
            encode_config_response(&self.component_config)?
        } else if id == hash_id(GET_CLOCK) {
            self.state.clock_ms.to_le_bytes().to_vec()
        } else if id == hash_id(GET_STRIKES) {
            alloc::vec![self.state.strikes]
        } else if id == hash_id(ACK_READY_TO_ARM) {
            self.state.ready_to_arm = true;
            Vec::new()
        } else if id == hash_id(ADD_STRIKE) {
            self.state.strikes = self.state.strikes.saturating_add(1);
            info!(strikes = self.state.strikes, "Strike");
            Vec::new()
        } else if id == hash_id(DEFUSE_COMPONENT) {
            self.state.defused = true;
            info!("Component defused");
            Vec::new()
        } else {
            warn!("No handler for request {:#010x}", id);
            self.state.requests_served -= 1;
            self.state.unknown_requests += 1;
            Vec::new()
        };
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_poll_entries() {
        let payload = [2, 0, 1, 0, 0, 0, 0, 0, 5, 2, 0, 0, 0, 1, 0, 0xAA];
        let polled = parse_poll(&payload).unwrap();
        assert_eq!(polled.len(), 2);
        assert_eq!(polled[0].handler_id, 1);
        assert!(polled[0].params.is_empty());
        assert_eq!(polled[1].slot, 5);
        assert_eq!(polled[1].handler_id, 2);
        assert_eq!(polled[1].params, vec![0xAA]);
    }

    #[test]
    fn test_handshake_rejects_bad_check_code() {
        assert_eq!(Handshake::parse(b"Julia\0\0\0\0\0\x03\x01\x01\x00"), Err(MasterError::BadCheckCode));
    }

    #[test]
    fn test_handshake_parses_battery() {
        let mut content = HANDSHAKE_CHECK_CODE.to_vec();
        content.extend_from_slice(&EventBits::ALWAYS_LISTEN.0.to_le_bytes());
        content.extend_from_slice(&[3, 2, 1, 0]);
        let handshake = Handshake::parse(&content).unwrap();
        assert_eq!(handshake.descriptor, ComponentDescriptor::Battery { count: 2, size: 1 });
        assert_eq!(handshake.accepted_events, EventBits::ALWAYS_LISTEN);
    }
}
