//! Identifiers and flag sets shared by the bomb and its components.

use core::ops::{BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};

/// Game-wide events broadcast by the master with the EVENT command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum BombEvent {
    Reset = 0,
    Configure = 1,
    Arm = 2,
    Strike = 3,
    Explosion = 4,
    Defusal = 5,
    LightsOut = 6,
    LightsOn = 7,
    TimerSync = 8,
    ConfigLight = 9,
}

impl BombEvent {
    pub const ALL: [BombEvent; 10] = [
        BombEvent::Reset,
        BombEvent::Configure,
        BombEvent::Arm,
        BombEvent::Strike,
        BombEvent::Explosion,
        BombEvent::Defusal,
        BombEvent::LightsOut,
        BombEvent::LightsOn,
        BombEvent::TimerSync,
        BombEvent::ConfigLight,
    ];

    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn from_id(id: u8) -> Option<Self> {
        Self::ALL.get(usize::from(id)).copied()
    }

    pub fn bit(self) -> EventBits {
        EventBits(1 << self.id())
    }
}

/// Set of events a component wants to receive, one bit per event id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventBits(pub u32);

impl EventBits {
    pub const NONE: EventBits = EventBits(0);
    pub const RESET: EventBits = EventBits(1 << 0);
    pub const CONFIGURE: EventBits = EventBits(1 << 1);
    pub const ARM: EventBits = EventBits(1 << 2);
    pub const STRIKE: EventBits = EventBits(1 << 3);
    pub const EXPLOSION: EventBits = EventBits(1 << 4);
    pub const DEFUSAL: EventBits = EventBits(1 << 5);
    pub const LIGHTS_OUT: EventBits = EventBits(1 << 6);
    pub const LIGHTS_ON: EventBits = EventBits(1 << 7);
    pub const TIMER_SYNC: EventBits = EventBits(1 << 8);
    pub const CONFIG_LIGHT: EventBits = EventBits(1 << 9);

    pub const LIGHTS: EventBits = EventBits(Self::LIGHTS_OUT.0 | Self::LIGHTS_ON.0);

    /// Events every component receives regardless of what it asked for.
    pub const ALWAYS_LISTEN: EventBits = EventBits(
        Self::RESET.0
            | Self::CONFIGURE.0
            | Self::ARM.0
            | Self::EXPLOSION.0
            | Self::DEFUSAL.0
            | Self::CONFIG_LIGHT.0,
    );

    pub fn contains(self, other: EventBits) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn accepts(self, event: BombEvent) -> bool {
        self.contains(event.bit())
    }
}

impl BitOr for EventBits {
    type Output = EventBits;

    fn bitor(self, rhs: EventBits) -> EventBits {
        EventBits(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventBits {
    fn bitor_assign(&mut self, rhs: EventBits) {
        self.0 |= rhs.0;
    }
}

/// What a component keeps in sync with the bomb.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncFlags(pub u8);

impl SyncFlags {
    pub const NOTHING: SyncFlags = SyncFlags(0);
    pub const FETCH_CONFIG: SyncFlags = SyncFlags(1 << 0);
    pub const SYNC_CLOCK: SyncFlags = SyncFlags(1 << 1);
    pub const SYNC_STRIKES: SyncFlags = SyncFlags(1 << 2);

    pub fn contains(self, other: SyncFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for SyncFlags {
    type Output = SyncFlags;

    fn bitor(self, rhs: SyncFlags) -> SyncFlags {
        SyncFlags(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModuleFlags(pub u8);

impl ModuleFlags {
    pub const NONE: ModuleFlags = ModuleFlags(0);
    pub const NEEDY: ModuleFlags = ModuleFlags(1 << 0);
    pub const DECORATIVE: ModuleFlags = ModuleFlags(1 << 1);
    pub const DEFUSABLE: ModuleFlags = ModuleFlags(1 << 2);

    pub fn contains(self, other: ModuleFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ModuleFlags {
    type Output = ModuleFlags;

    fn bitor(self, rhs: ModuleFlags) -> ModuleFlags {
        ModuleFlags(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SerialFlags(pub u16);

impl SerialFlags {
    pub const CONTAINS_VOWEL: SerialFlags = SerialFlags(1 << 0);
    pub const LAST_DIGIT_EVEN: SerialFlags = SerialFlags(1 << 1);
    pub const LAST_DIGIT_ODD: SerialFlags = SerialFlags(1 << 2);

    /// Flags the master derives from a serial number.
    pub fn from_serial(serial: &str) -> SerialFlags {
        let mut flags = 0;
        if serial.chars().any(|c| matches!(c, 'A' | 'E' | 'I' | 'O' | 'U')) {
            flags |= Self::CONTAINS_VOWEL.0;
        }
        match serial.chars().last() {
            Some(c @ '0'..='9') if (c as u8 - b'0') % 2 == 0 => flags |= Self::LAST_DIGIT_EVEN.0,
            _ => flags |= Self::LAST_DIGIT_ODD.0,
        }
        SerialFlags(flags)
    }

    pub fn contains(self, other: SerialFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ComponentKind {
    Module = 0,
    Label = 1,
    Port = 2,
    Battery = 3,
}

impl ComponentKind {
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(ComponentKind::Module),
            1 => Some(ComponentKind::Label),
            2 => Some(ComponentKind::Port),
            3 => Some(ComponentKind::Battery),
            _ => None,
        }
    }
}

/// Type tag of a component config variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum VariableType {
    Null = 0,
    Str = 1,
    Int = 2,
    Long = 3,
    Bool = 4,
    StrEnum = 5,
}

impl VariableType {
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(VariableType::Null),
            1 => Some(VariableType::Str),
            2 => Some(VariableType::Int),
            3 => Some(VariableType::Long),
            4 => Some(VariableType::Bool),
            5 => Some(VariableType::StrEnum),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_bits_follow_ids() {
        for event in BombEvent::ALL {
            assert_eq!(event.bit().0, 1 << event.id());
            assert_eq!(BombEvent::from_id(event.id()), Some(event));
        }
        assert_eq!(BombEvent::from_id(10), None);
    }

    #[test]
    fn test_always_listen_mask() {
        let mask = EventBits::ALWAYS_LISTEN;
        assert!(mask.accepts(BombEvent::Reset));
        assert!(mask.accepts(BombEvent::ConfigLight));
        assert!(!mask.accepts(BombEvent::Strike));
        assert!(!mask.accepts(BombEvent::TimerSync));
        assert_eq!(mask.0, 0b10_0011_0111);
    }

    #[test]
    fn test_serial_flags() {
        let flags = SerialFlags::from_serial("AB3CD4");
        assert!(flags.contains(SerialFlags::CONTAINS_VOWEL));
        assert!(flags.contains(SerialFlags::LAST_DIGIT_EVEN));
        assert_eq!(SerialFlags::from_serial("XYZ7").0, SerialFlags::LAST_DIGIT_ODD.0);
    }
}
