//! Capability schema sent in the handshake.
//!
//! `[u8 kind][kind specific fields][u8 variable count]` followed by
//! `(string name, u8 type)` per variable. Strings carry a one byte length
//! prefix and no terminator.

use alloc::vec::Vec;

use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::bconf::{ComponentKind, ModuleFlags, VariableType};

/// Declaration of one variable the master may configure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VariableParam {
    pub name: &'static str,
    pub kind: VariableType,
}

impl VariableParam {
    pub const fn new(name: &'static str, kind: VariableType) -> Self {
        Self { name, kind }
    }
}

/// Streaming serializer for the handshake schema.
#[derive(Debug, Clone)]
pub struct InfoStreamBuilder {
    kind: ComponentKind,
    header: Vec<u8>,
    variables: Vec<u8>,
    variable_count: u8,
}

impl InfoStreamBuilder {
    fn new(kind: ComponentKind) -> Self {
        Self {
            kind,
            header: alloc::vec![kind as u8],
            variables: Vec::new(),
            variable_count: 0,
        }
    }

    pub fn module(name: &str, flags: ModuleFlags, extra: &[u8]) -> Self {
        let mut builder = Self::new(ComponentKind::Module);
        builder.push_str(name);
        builder.header.push(flags.0);
        let extra_len = u16::try_from(extra.len()).unwrap_or(u16::MAX);
        builder.header.extend_from_slice(&extra_len.to_le_bytes());
        builder.header.extend_from_slice(&extra[..usize::from(extra_len)]);
        builder
    }

    pub fn port(name: &str) -> Self {
        let mut builder = Self::new(ComponentKind::Port);
        builder.push_str(name);
        builder
    }

    pub fn label<S: AsRef<str>>(texts: &[S]) -> Self {
        let mut builder = Self::new(ComponentKind::Label);
        let count = texts.len().min(usize::from(u8::MAX));
        builder.header.push(count as u8);
        for text in &texts[..count] {
            builder.push_str(text.as_ref());
        }
        builder
    }

    pub fn battery(count: u8, size: u8) -> Self {
        let mut builder = Self::new(ComponentKind::Battery);
        builder.header.push(count);
        builder.header.push(size);
        builder
    }

    pub fn kind(&self) -> ComponentKind {
        self.kind
    }

    fn push_str(&mut self, text: &str) {
        write_str(&mut self.header, text);
    }

    pub fn add_variable(&mut self, variable: &VariableParam) {
        if self.variable_count == u8::MAX {
            warn!("Too many variables, dropping {}", variable.name);
            return;
        }
        trace!(name = variable.name, kind = ?variable.kind, "Adding variable");
        write_str(&mut self.variables, variable.name);
        self.variables.push(variable.kind as u8);
        self.variable_count += 1;
    }

    pub fn add_variables(&mut self, variables: &[VariableParam]) {
        for variable in variables {
            self.add_variable(variable);
        }
    }

    pub fn build(self) -> Vec<u8> {
        let mut out = self.header;
        out.push(self.variable_count);
        out.extend_from_slice(&self.variables);
        out
    }
}

fn write_str(out: &mut Vec<u8>, text: &str) {
    let bytes = text.as_bytes();
    let len = bytes.len().min(usize::from(u8::MAX));
    out.push(len as u8);
    out.extend_from_slice(&bytes[..len]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_schema_layout() {
        let mut builder = InfoStreamBuilder::module("Wires", ModuleFlags::DEFUSABLE, &[9]);
        builder.add_variable(&VariableParam::new("Count", VariableType::Int));
        let blob = builder.build();
        assert_eq!(
            blob,
            vec![0, 5, b'W', b'i', b'r', b'e', b's', 4, 1, 0, 9, 1, 5, b'C', b'o', b'u', b'n', b't', 2]
        );
    }

    #[test]
    fn test_label_and_battery_schema() {
        assert_eq!(InfoStreamBuilder::label(&["FRK", "CAR"]).build(), vec![1, 2, 3, b'F', b'R', b'K', 3, b'C', b'A', b'R', 0]);
        assert_eq!(InfoStreamBuilder::battery(2, 1).build(), vec![3, 2, 1, 0]);
        assert_eq!(InfoStreamBuilder::port("PS2").build(), vec![2, 3, b'P', b'S', b'2', 0]);
    }

    #[test]
    fn test_long_strings_are_truncated() {
        let name = "x".repeat(300);
        let blob = InfoStreamBuilder::port(&name).build();
        assert_eq!(blob[1], 255);
        assert_eq!(blob.len(), 1 + 1 + 255 + 1);
    }
}
