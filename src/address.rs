//! Slave address selection.

/// Lowest and highest non-reserved 7-bit addresses.
pub const MIN_SLAVE_ADDRESS: u8 = 0x08;
pub const MAX_SLAVE_ADDRESS: u8 = 0x77;

/// Maps a raw analog reading from the address-select divider into the usable
/// 7-bit address range.
pub fn address_from_analog(reading: u16) -> u8 {
    let address = (reading & 0x7F) as u8;
    address.clamp(MIN_SLAVE_ADDRESS, MAX_SLAVE_ADDRESS)
}
