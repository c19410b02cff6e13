//! In-memory slave peripheral used by the simulator and the tests.

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::convert::Infallible;

use crate::transport::{SlaveBus, I2C_BUFFER_LIMIT};

/// Something that answers the slave side of bus transactions.
pub trait BusSlave {
    /// The master finished writing bytes to this slave.
    fn on_receive<B: SlaveBus>(&mut self, bus: &mut B);

    /// The master started a read from this slave.
    fn on_request<B: SlaveBus>(&mut self, bus: &mut B);
}

/// Receive and transmit buffers of a Wire-style slave peripheral.
///
/// Every master transaction starts from a fresh buffer, as on the real
/// peripheral: unread receive bytes are discarded when the next write
/// arrives, and at most [`I2C_BUFFER_LIMIT`] bytes can be queued per read.
#[derive(Debug, Default, Clone)]
pub struct VirtualBus {
    rx: VecDeque<u8>,
    tx: Vec<u8>,
}

impl VirtualBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a master write transaction carrying `bytes`.
    pub fn master_write(&mut self, bytes: &[u8]) {
        self.rx.clear();
        self.rx.extend(bytes.iter().copied());
    }

    /// Starts a master read transaction.
    pub fn begin_master_read(&mut self) {
        self.tx.clear();
    }

    pub fn take_transmitted(&mut self) -> Vec<u8> {
        core::mem::take(&mut self.tx)
    }

    /// Receive bytes the slave left unread.
    pub fn unread(&self) -> usize {
        self.rx.len()
    }
}

impl SlaveBus for VirtualBus {
    fn available(&self) -> usize {
        self.rx.len()
    }

    fn read_bytes(&mut self, buf: &mut [u8]) -> usize {
        let count = buf.len().min(self.rx.len());
        for (slot, byte) in buf.iter_mut().zip(self.rx.drain(..count)) {
            *slot = byte;
        }
        count
    }

    fn peek(&mut self) -> nb::Result<u8, Infallible> {
        self.rx.front().copied().ok_or(nb::Error::WouldBlock)
    }

    fn read(&mut self) -> nb::Result<u8, Infallible> {
        self.rx.pop_front().ok_or(nb::Error::WouldBlock)
    }

    fn write(&mut self, data: &[u8]) -> usize {
        let room = I2C_BUFFER_LIMIT.saturating_sub(self.tx.len());
        let count = data.len().min(room);
        self.tx.extend_from_slice(&data[..count]);
        count
    }
}

/// Runs one master write followed by the slave's receive callback, split
/// into transactions of at most [`I2C_BUFFER_LIMIT`] bytes.
pub fn transmit<S: BusSlave>(slave: &mut S, bus: &mut VirtualBus, bytes: &[u8]) {
    for chunk in bytes.chunks(I2C_BUFFER_LIMIT) {
        bus.master_write(chunk);
        slave.on_receive(bus);
    }
}

/// Runs one master read transaction of `size` bytes.
pub fn request<S: BusSlave>(slave: &mut S, bus: &mut VirtualBus, size: usize) -> Vec<u8> {
    bus.begin_master_read();
    slave.on_request(bus);
    let mut data = bus.take_transmitted();
    data.truncate(size);
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_write_discards_unread_bytes() {
        let mut bus = VirtualBus::new();
        bus.master_write(&[1, 2, 3]);
        assert_eq!(bus.read(), Ok(1));
        bus.master_write(&[9]);
        assert_eq!(bus.available(), 1);
        assert_eq!(bus.peek(), Ok(9));
    }

    #[test]
    fn test_write_is_capped_per_transaction() {
        let mut bus = VirtualBus::new();
        bus.begin_master_read();
        assert_eq!(bus.write(&[0; 40]), 32);
        assert_eq!(bus.write(&[1]), 0);
        bus.begin_master_read();
        assert_eq!(bus.write(&[1]), 1);
    }

    #[test]
    fn test_read_on_empty_would_block() {
        let mut bus = VirtualBus::new();
        assert_eq!(bus.read(), Err(nb::Error::WouldBlock));
    }
}
