//! Bomb and component configuration blobs.
//!
//! The master answers `GetBombConfig` and `GetComponentConfigByBusAddress`
//! with `[u16 size LE][blob]`. Blobs are flat little-endian structures whose
//! arrays and strings are referenced by `u16` offsets from the blob start.
//! They are parsed here into owned values; nothing points back into the
//! received buffer.

use alloc::string::String;
use alloc::vec::Vec;

use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;
use thiserror::Error;

use crate::bconf::{ComponentKind, ModuleFlags, SerialFlags, VariableType};
use crate::hash::{hash_id, IdHash};

pub const SERIAL_NUMBER_SIZE: usize = 16;
pub const BOMB_CONFIG_HEADER_SIZE: usize = 43;
pub const MODULE_RECORD_SIZE: usize = 7;
pub const LABEL_RECORD_SIZE: usize = 5;
pub const PORT_RECORD_SIZE: usize = 4;
pub const BATTERY_RECORD_SIZE: usize = 2;
pub const VARIABLE_RECORD_SIZE: usize = 9;
pub const MODULE_CONFIG_HEADER_SIZE: usize = 4;

const_assert_eq!(BOMB_CONFIG_HEADER_SIZE, 4 + SERIAL_NUMBER_SIZE + 2 + 1 + 4 + 4 * 4);
const_assert_eq!(VARIABLE_RECORD_SIZE, 4 + 1 + 4);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("config truncated: needed {needed} bytes at offset {offset}")]
    Truncated { offset: usize, needed: usize },
    #[error("offset {0} points outside the config blob")]
    BadOffset(usize),
    #[error("unknown variable type {0}")]
    UnknownVariableType(u8),
    #[error("string at offset {0} is not terminated")]
    UnterminatedString(usize),
    #[error("string at offset {0} is not valid UTF-8")]
    InvalidUtf8(usize),
    #[error("blob of {0} bytes does not fit a config response")]
    TooLarge(usize),
}

/// Little-endian cursor over a config blob.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Cursor positioned at `offset`.
    pub fn at(buf: &'a [u8], offset: usize) -> Result<Self, ConfigError> {
        if offset > buf.len() {
            return Err(ConfigError::BadOffset(offset));
        }
        Ok(Self { buf, pos: offset })
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn bytes(&mut self, count: usize) -> Result<&'a [u8], ConfigError> {
        let end = self
            .pos
            .checked_add(count)
            .filter(|&end| end <= self.buf.len())
            .ok_or(ConfigError::Truncated {
                offset: self.pos,
                needed: count,
            })?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], ConfigError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, ConfigError> {
        Ok(self.array::<1>()?[0])
    }

    pub fn bool(&mut self) -> Result<bool, ConfigError> {
        Ok(self.u8()? != 0)
    }

    pub fn u16(&mut self) -> Result<u16, ConfigError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub fn i16(&mut self) -> Result<i16, ConfigError> {
        Ok(i16::from_le_bytes(self.array()?))
    }

    pub fn u32(&mut self) -> Result<u32, ConfigError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub fn i32(&mut self) -> Result<i32, ConfigError> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    /// NUL-terminated string starting at `offset` of the whole blob.
    pub fn cstr_at(&self, offset: usize) -> Result<&'a str, ConfigError> {
        let tail = self.buf.get(offset..).ok_or(ConfigError::BadOffset(offset))?;
        let len = tail
            .iter()
            .position(|&b| b == 0)
            .ok_or(ConfigError::UnterminatedString(offset))?;
        core::str::from_utf8(&tail[..len]).map_err(|_| ConfigError::InvalidUtf8(offset))
    }
}

/// Splits a `[u16 size][blob]` config response.
pub fn split_config_response(data: &[u8]) -> Result<&[u8], ConfigError> {
    let mut reader = ByteReader::new(data);
    let size = usize::from(reader.u16()?);
    reader.bytes(size)
}

pub fn encode_config_response(blob: &[u8]) -> Result<Vec<u8>, ConfigError> {
    let size = u16::try_from(blob.len()).map_err(|_| ConfigError::TooLarge(blob.len()))?;
    let mut out = Vec::with_capacity(2 + blob.len());
    out.extend_from_slice(&size.to_le_bytes());
    out.extend_from_slice(blob);
    Ok(out)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleInfo {
    pub name_hash: IdHash,
    pub flags: ModuleFlags,
    /// Module specific data, if the master sent any.
    #[serde(with = "serde_bytes")]
    pub extra: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelInfo {
    pub text_hash: IdHash,
    pub lit: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    pub name_hash: IdHash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatteryInfo {
    pub count: u8,
    pub size: u8,
}

/// Bomb-wide configuration shared with every component.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BombConfig {
    pub random_seed: u32,
    pub serial: String,
    pub serial_flags: SerialFlags,
    pub max_strikes: u8,
    pub time_limit_ms: i32,
    pub modules: Vec<ModuleInfo>,
    pub labels: Vec<LabelInfo>,
    pub ports: Vec<PortInfo>,
    pub batteries: Vec<BatteryInfo>,
}

struct ArrayRef {
    count: usize,
    offset: usize,
}

impl ArrayRef {
    fn read(reader: &mut ByteReader<'_>) -> Result<Self, ConfigError> {
        Ok(Self {
            count: usize::from(reader.u16()?),
            offset: usize::from(reader.u16()?),
        })
    }
}

impl BombConfig {
    pub fn parse(blob: &[u8]) -> Result<Self, ConfigError> {
        let mut header = ByteReader::new(blob);
        let random_seed = header.u32()?;
        let serial_raw = header.bytes(SERIAL_NUMBER_SIZE)?;
        let serial_len = serial_raw.iter().position(|&b| b == 0).unwrap_or(SERIAL_NUMBER_SIZE);
        let serial = core::str::from_utf8(&serial_raw[..serial_len])
            .map_err(|_| ConfigError::InvalidUtf8(4))?
            .into();
        let serial_flags = SerialFlags(header.u16()?);
        let max_strikes = header.u8()?;
        let time_limit_ms = header.i32()?;
        let modules_ref = ArrayRef::read(&mut header)?;
        let labels_ref = ArrayRef::read(&mut header)?;
        let ports_ref = ArrayRef::read(&mut header)?;
        let batteries_ref = ArrayRef::read(&mut header)?;

        let mut reader = ByteReader::at(blob, modules_ref.offset)?;
        let mut raw_modules = Vec::with_capacity(modules_ref.count);
        for _ in 0..modules_ref.count {
            let name_hash = reader.u32()?;
            let flags = ModuleFlags(reader.u8()?);
            let extra_offset = usize::from(reader.u16()?);
            raw_modules.push((name_hash, flags, extra_offset));
        }

        // Extras are laid out back to back; each one ends where the next
        // referenced region begins.
        let boundaries: Vec<usize> = raw_modules
            .iter()
            .map(|&(_, _, offset)| offset)
            .chain([labels_ref.offset, ports_ref.offset, batteries_ref.offset, blob.len()])
            .collect();
        let mut modules = Vec::with_capacity(raw_modules.len());
        for (name_hash, flags, offset) in raw_modules {
            let extra = if offset == 0 {
                Vec::new()
            } else {
                let end = boundaries
                    .iter()
                    .copied()
                    .filter(|&b| b > offset)
                    .min()
                    .unwrap_or(blob.len());
                blob.get(offset..end).ok_or(ConfigError::BadOffset(offset))?.to_vec()
            };
            modules.push(ModuleInfo {
                name_hash,
                flags,
                extra,
            });
        }

        let mut reader = ByteReader::at(blob, labels_ref.offset)?;
        let mut labels = Vec::with_capacity(labels_ref.count);
        for _ in 0..labels_ref.count {
            labels.push(LabelInfo {
                text_hash: reader.u32()?,
                lit: reader.bool()?,
            });
        }

        let mut reader = ByteReader::at(blob, ports_ref.offset)?;
        let mut ports = Vec::with_capacity(ports_ref.count);
        for _ in 0..ports_ref.count {
            ports.push(PortInfo {
                name_hash: reader.u32()?,
            });
        }

        let mut reader = ByteReader::at(blob, batteries_ref.offset)?;
        let mut batteries = Vec::with_capacity(batteries_ref.count);
        for _ in 0..batteries_ref.count {
            batteries.push(BatteryInfo {
                count: reader.u8()?,
                size: reader.u8()?,
            });
        }

        Ok(Self {
            random_seed,
            serial,
            serial_flags,
            max_strikes,
            time_limit_ms,
            modules,
            labels,
            ports,
            batteries,
        })
    }

    /// Serializes the configuration in the layout the master sends.
    pub fn to_bytes(&self) -> Vec<u8> {
        let modules_at = BOMB_CONFIG_HEADER_SIZE;
        let extras_at = modules_at + self.modules.len() * MODULE_RECORD_SIZE;
        let extras_len: usize = self.modules.iter().map(|m| m.extra.len()).sum();
        let labels_at = extras_at + extras_len;
        let ports_at = labels_at + self.labels.len() * LABEL_RECORD_SIZE;
        let batteries_at = ports_at + self.ports.len() * PORT_RECORD_SIZE;

        let mut out = Vec::with_capacity(batteries_at + self.batteries.len() * BATTERY_RECORD_SIZE);
        out.extend_from_slice(&self.random_seed.to_le_bytes());
        let mut serial = [0u8; SERIAL_NUMBER_SIZE];
        let serial_len = self.serial.len().min(SERIAL_NUMBER_SIZE);
        serial[..serial_len].copy_from_slice(&self.serial.as_bytes()[..serial_len]);
        out.extend_from_slice(&serial);
        out.extend_from_slice(&self.serial_flags.0.to_le_bytes());
        out.push(self.max_strikes);
        out.extend_from_slice(&self.time_limit_ms.to_le_bytes());
        for (count, offset) in [
            (self.modules.len(), modules_at),
            (self.labels.len(), labels_at),
            (self.ports.len(), ports_at),
            (self.batteries.len(), batteries_at),
        ] {
            out.extend_from_slice(&(count as u16).to_le_bytes());
            out.extend_from_slice(&(offset as u16).to_le_bytes());
        }

        let mut extra_at = extras_at;
        for module in &self.modules {
            out.extend_from_slice(&module.name_hash.to_le_bytes());
            out.push(module.flags.0);
            let offset = if module.extra.is_empty() { 0 } else { extra_at };
            out.extend_from_slice(&(offset as u16).to_le_bytes());
            extra_at += module.extra.len();
        }
        for module in &self.modules {
            out.extend_from_slice(&module.extra);
        }
        for label in &self.labels {
            out.extend_from_slice(&label.text_hash.to_le_bytes());
            out.push(u8::from(label.lit));
        }
        for port in &self.ports {
            out.extend_from_slice(&port.name_hash.to_le_bytes());
        }
        for battery in &self.batteries {
            out.push(battery.count);
            out.push(battery.size);
        }
        out
    }

    pub fn module_info(&self, name: &str) -> Option<&ModuleInfo> {
        let hash = hash_id(name);
        self.modules.iter().find(|m| m.name_hash == hash)
    }

    /// Total number of batteries across all holders.
    pub fn battery_count(&self) -> u32 {
        self.batteries.iter().map(|b| u32::from(b.count)).sum()
    }

    pub fn is_label_present(&self, text: &str, must_be_lit: bool) -> bool {
        let hash = hash_id(text);
        self.labels
            .iter()
            .any(|l| l.text_hash == hash && (l.lit || !must_be_lit))
    }

    pub fn is_port_present(&self, name: &str) -> bool {
        let hash = hash_id(name);
        self.ports.iter().any(|p| p.name_hash == hash)
    }

    pub fn has_serial_flag(&self, flag: SerialFlags) -> bool {
        self.serial_flags.contains(flag)
    }
}

/// Value of one component config variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VariableValue {
    Null,
    Str(String),
    Int(i16),
    Long(i32),
    Bool(bool),
    StrEnum(String),
}

impl VariableValue {
    pub fn kind(&self) -> VariableType {
        match self {
            VariableValue::Null => VariableType::Null,
            VariableValue::Str(_) => VariableType::Str,
            VariableValue::Int(_) => VariableType::Int,
            VariableValue::Long(_) => VariableType::Long,
            VariableValue::Bool(_) => VariableType::Bool,
            VariableValue::StrEnum(_) => VariableType::StrEnum,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigVariable {
    pub name_hash: IdHash,
    pub value: VariableValue,
}

/// Values the master chose for a module's declared variables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleConfig {
    pub variables: Vec<ConfigVariable>,
}

impl ModuleConfig {
    pub fn parse(blob: &[u8]) -> Result<Self, ConfigError> {
        let mut header = ByteReader::new(blob);
        let count = usize::from(header.u16()?);
        let offset = usize::from(header.u16()?);

        let mut reader = ByteReader::at(blob, offset)?;
        let mut variables = Vec::with_capacity(count);
        for _ in 0..count {
            let name_hash = reader.u32()?;
            let type_id = reader.u8()?;
            let mut value = ByteReader::new(reader.bytes(4)?);
            let kind = VariableType::from_id(type_id).ok_or(ConfigError::UnknownVariableType(type_id))?;
            let value = match kind {
                VariableType::Null => VariableValue::Null,
                VariableType::Int => VariableValue::Int(value.i16()?),
                VariableType::Long => VariableValue::Long(value.i32()?),
                VariableType::Bool => VariableValue::Bool(value.bool()?),
                VariableType::Str => VariableValue::Str(reader.cstr_at(usize::from(value.u16()?))?.into()),
                VariableType::StrEnum => {
                    VariableValue::StrEnum(reader.cstr_at(usize::from(value.u16()?))?.into())
                }
            };
            variables.push(ConfigVariable { name_hash, value });
        }
        Ok(Self { variables })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let records_at = MODULE_CONFIG_HEADER_SIZE;
        let mut strings_at = records_at + self.variables.len() * VARIABLE_RECORD_SIZE;

        let mut out = Vec::new();
        out.extend_from_slice(&(self.variables.len() as u16).to_le_bytes());
        out.extend_from_slice(&(records_at as u16).to_le_bytes());
        let mut strings = Vec::new();
        for variable in &self.variables {
            out.extend_from_slice(&variable.name_hash.to_le_bytes());
            out.push(variable.value.kind() as u8);
            let mut value = [0u8; 4];
            match &variable.value {
                VariableValue::Null => {}
                VariableValue::Int(v) => value[..2].copy_from_slice(&v.to_le_bytes()),
                VariableValue::Long(v) => value.copy_from_slice(&v.to_le_bytes()),
                VariableValue::Bool(v) => value[0] = u8::from(*v),
                VariableValue::Str(s) | VariableValue::StrEnum(s) => {
                    value[..2].copy_from_slice(&(strings_at as u16).to_le_bytes());
                    strings.extend_from_slice(s.as_bytes());
                    strings.push(0);
                    strings_at += s.len() + 1;
                }
            }
            out.extend_from_slice(&value);
        }
        out.extend_from_slice(&strings);
        out
    }

    pub fn set(&mut self, name: &str, value: VariableValue) {
        let name_hash = hash_id(name);
        match self.variables.iter_mut().find(|v| v.name_hash == name_hash) {
            Some(variable) => variable.value = value,
            None => self.variables.push(ConfigVariable { name_hash, value }),
        }
    }

    pub fn get(&self, name: &str) -> Option<&VariableValue> {
        let name_hash = hash_id(name);
        self.variables
            .iter()
            .find(|v| v.name_hash == name_hash)
            .map(|v| &v.value)
    }

    pub fn get_int(&self, name: &str) -> i16 {
        match self.get(name) {
            Some(VariableValue::Int(v)) => *v,
            _ => 0,
        }
    }

    pub fn get_long(&self, name: &str) -> i32 {
        match self.get(name) {
            Some(VariableValue::Long(v)) => *v,
            _ => 0,
        }
    }

    pub fn get_bool(&self, name: &str) -> bool {
        matches!(self.get(name), Some(VariableValue::Bool(true)))
    }

    pub fn get_string(&self, name: &str) -> &str {
        match self.get(name) {
            Some(VariableValue::Str(s)) => s,
            _ => "",
        }
    }

    /// Chosen option of a string enum variable.
    pub fn get_enum(&self, name: &str) -> &str {
        match self.get(name) {
            Some(VariableValue::StrEnum(s)) => s,
            _ => "",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelConfig {
    pub text_hash: IdHash,
    pub lit: bool,
}

impl LabelConfig {
    pub fn parse(blob: &[u8]) -> Result<Self, ConfigError> {
        let mut reader = ByteReader::new(blob);
        Ok(Self {
            text_hash: reader.u32()?,
            lit: reader.bool()?,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.text_hash.to_le_bytes().to_vec();
        out.push(u8::from(self.lit));
        out
    }

    pub fn shows(&self, text: &str) -> bool {
        self.text_hash == hash_id(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortConfig {
    pub used: bool,
}

impl PortConfig {
    pub fn parse(blob: &[u8]) -> Result<Self, ConfigError> {
        Ok(Self {
            used: ByteReader::new(blob).bool()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatteryConfig {
    pub used: bool,
}

impl BatteryConfig {
    pub fn parse(blob: &[u8]) -> Result<Self, ConfigError> {
        Ok(Self {
            used: ByteReader::new(blob).bool()?,
        })
    }
}

/// Component specific configuration, shaped by the component kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComponentConfig {
    Module(ModuleConfig),
    Label(LabelConfig),
    Port(PortConfig),
    Battery(BatteryConfig),
}

impl ComponentConfig {
    pub fn parse(kind: ComponentKind, blob: &[u8]) -> Result<Self, ConfigError> {
        Ok(match kind {
            ComponentKind::Module => ComponentConfig::Module(ModuleConfig::parse(blob)?),
            ComponentKind::Label => ComponentConfig::Label(LabelConfig::parse(blob)?),
            ComponentKind::Port => ComponentConfig::Port(PortConfig::parse(blob)?),
            ComponentKind::Battery => ComponentConfig::Battery(BatteryConfig::parse(blob)?),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            ComponentConfig::Module(config) => config.to_bytes(),
            ComponentConfig::Label(config) => config.to_bytes(),
            ComponentConfig::Port(config) => alloc::vec![u8::from(config.used)],
            ComponentConfig::Battery(config) => alloc::vec![u8::from(config.used)],
        }
    }
}
