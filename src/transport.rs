//! Promise queues over the I2C slave peripheral.
//!
//! The hardware calls back into [`AsyncI2c::handle_receive`] when the bus
//! master has written bytes and into [`AsyncI2c::handle_request`] when it
//! wants data. Both callbacks service pending promises incrementally; nothing
//! here ever blocks waiting for the bus.

use alloc::collections::VecDeque;
use alloc::vec;
use alloc::vec::Vec;
use core::convert::Infallible;

use arrayvec::ArrayVec;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::promise::{Operation, Promise, ReadBuffer, Response};

/// Largest single transfer the slave peripheral buffers.
pub const I2C_BUFFER_LIMIT: usize = 32;
/// Reads up to this size may be buffered inline.
pub const STACK_READ_LIMIT: usize = I2C_BUFFER_LIMIT;

/// Byte-level access to the slave peripheral, modelled on the Wire API.
pub trait SlaveBus {
    /// Bytes received from the master and not yet consumed.
    fn available(&self) -> usize;

    /// Copies up to `buf.len()` received bytes, returning how many were copied.
    fn read_bytes(&mut self, buf: &mut [u8]) -> usize;

    fn peek(&mut self) -> nb::Result<u8, Infallible>;

    fn read(&mut self) -> nb::Result<u8, Infallible>;

    /// Queues bytes for the master's current read, returning how many fit.
    fn write(&mut self, data: &[u8]) -> usize;
}

/// Buffer placement policy for a pending read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadLocation {
    /// Transient inline buffer; promoted to `TempHeap` when it cannot be
    /// satisfied from the bytes immediately available.
    Stack,
    /// Transient heap buffer, freed once the chain has run.
    TempHeap,
    /// Heap buffer handed to the continuation uncopied.
    Heap,
    /// Caller supplied destination.
    Defined,
}

/// Order in which pending entries of one queue are serviced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceOrder {
    /// Oldest pending entry first.
    #[default]
    Fifo,
    /// Newest pending entry first, matching the legacy firmware.
    Lifo,
}

impl ServiceOrder {
    fn insert<T>(self, queue: &mut VecDeque<T>, entry: T) {
        match self {
            ServiceOrder::Fifo => queue.push_back(entry),
            ServiceOrder::Lifo => queue.push_front(entry),
        }
    }
}

struct ReadEntry<C> {
    promise: Promise<C>,
    size: usize,
    location: ReadLocation,
    buffer: ReadBuffer,
    filled: usize,
}

impl<C> ReadEntry<C> {
    fn remaining(&self) -> usize {
        self.size - self.filled
    }

    fn allocate(&mut self, limit: usize) {
        if !matches!(self.buffer, ReadBuffer::Empty) {
            return;
        }
        if self.location == ReadLocation::Stack
            && (self.size > limit || self.size > STACK_READ_LIMIT)
        {
            trace!(size = self.size, limit, "Promoting inline read to heap");
            self.location = ReadLocation::TempHeap;
        }
        self.buffer = match self.location {
            ReadLocation::Stack => ReadBuffer::Inline(ArrayVec::new()),
            _ => ReadBuffer::Heap(vec![0; self.size]),
        };
    }

    fn receive<B: SlaveBus>(&mut self, bus: &mut B, wanted: usize) -> usize {
        let ReadEntry { buffer, filled, .. } = self;
        let got = match buffer {
            ReadBuffer::Empty => 0,
            ReadBuffer::Inline(bytes) => {
                let mut chunk = [0u8; STACK_READ_LIMIT];
                let got = bus.read_bytes(&mut chunk[..wanted]);
                bytes.extend(chunk[..got].iter().copied());
                got
            }
            ReadBuffer::Heap(bytes) => bus.read_bytes(&mut bytes[*filled..*filled + wanted]),
        };
        *filled += got;
        got
    }
}

/// Outcome of one [`ReadPromiseQueue::fill`] pass.
pub struct Filled<C> {
    pub consumed: usize,
    pub completed: Option<(Promise<C>, Response)>,
}

/// Pending reads, filled from the peripheral's receive buffer.
pub struct ReadPromiseQueue<C> {
    entries: VecDeque<ReadEntry<C>>,
    order: ServiceOrder,
}

impl<C> ReadPromiseQueue<C> {
    pub fn new(order: ServiceOrder) -> Self {
        Self {
            entries: VecDeque::new(),
            order,
        }
    }

    pub fn insert(&mut self, promise: Promise<C>, size: usize, location: ReadLocation) {
        trace!(size, ?location, "Promising read");
        let entry = ReadEntry {
            promise,
            size,
            location,
            buffer: ReadBuffer::Empty,
            filled: 0,
        };
        self.order.insert(&mut self.entries, entry);
    }

    pub fn insert_into(&mut self, promise: Promise<C>, mut dest: Vec<u8>) {
        let size = dest.len();
        dest.clear();
        dest.resize(size, 0);
        trace!(size, "Promising read into caller buffer");
        let entry = ReadEntry {
            promise,
            size,
            location: ReadLocation::Defined,
            buffer: ReadBuffer::Heap(dest),
            filled: 0,
        };
        self.order.insert(&mut self.entries, entry);
    }

    /// Moves up to `limit` bytes from `bus` into the entry at the head of the
    /// queue. The entry is unlinked and handed back once it is complete so
    /// the caller can resolve it; at most one entry completes per call.
    pub fn fill<B: SlaveBus>(&mut self, bus: &mut B, limit: usize) -> Filled<C> {
        let mut consumed = 0;
        if limit == 0 {
            return Filled {
                consumed,
                completed: None,
            };
        }
        let Some(entry) = self.entries.front_mut() else {
            return Filled {
                consumed,
                completed: None,
            };
        };

        if entry.remaining() > 0 {
            entry.allocate(limit);
            let wanted = entry.remaining().min(limit);
            consumed = entry.receive(bus, wanted);
            trace!(consumed, wanted, "Filled read promise");
        }

        if entry.remaining() > 0 {
            return Filled {
                consumed,
                completed: None,
            };
        }

        let completed = self.entries.pop_front().map(|entry| {
            let response = Response::from_read(entry.location, entry.buffer);
            (entry.promise, response)
        });
        Filled {
            consumed,
            completed,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

struct WriteEntry<C> {
    promise: Promise<C>,
    data: Vec<u8>,
    sent: usize,
}

/// Outcome of one [`WritePromiseQueue::write_out`] pass.
pub struct Drained<C> {
    pub written: usize,
    pub completed: Option<Promise<C>>,
}

/// Pending writes, drained one response transaction at a time.
pub struct WritePromiseQueue<C> {
    entries: VecDeque<WriteEntry<C>>,
    order: ServiceOrder,
}

impl<C> WritePromiseQueue<C> {
    pub fn new(order: ServiceOrder) -> Self {
        Self {
            entries: VecDeque::new(),
            order,
        }
    }

    pub fn insert(&mut self, promise: Promise<C>, data: Vec<u8>) {
        trace!(size = data.len(), "Promising write");
        self.order.insert(
            &mut self.entries,
            WriteEntry {
                promise,
                data,
                sent: 0,
            },
        );
    }

    /// Sends at most [`I2C_BUFFER_LIMIT`] bytes of the head entry.
    pub fn write_out<B: SlaveBus>(&mut self, bus: &mut B) -> Drained<C> {
        let Some(entry) = self.entries.front_mut() else {
            return Drained {
                written: 0,
                completed: None,
            };
        };

        let chunk = (entry.data.len() - entry.sent).min(I2C_BUFFER_LIMIT);
        let written = bus.write(&entry.data[entry.sent..entry.sent + chunk]);
        entry.sent += written;
        trace!(written, remaining = entry.data.len() - entry.sent, "Wrote promised data");

        let completed = if entry.sent >= entry.data.len() {
            self.entries.pop_front().map(|entry| entry.promise)
        } else {
            None
        };
        Drained { written, completed }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Owner of an [`AsyncI2c`] transport; promise continuations run against it.
pub trait I2cContext: Sized {
    fn i2c(&mut self) -> &mut AsyncI2c<Self>;
}

/// Read and write promise queues bound to one slave peripheral.
pub struct AsyncI2c<C> {
    reads: ReadPromiseQueue<C>,
    writes: WritePromiseQueue<C>,
}

impl<C> AsyncI2c<C> {
    pub fn new(order: ServiceOrder) -> Self {
        Self {
            reads: ReadPromiseQueue::new(order),
            writes: WritePromiseQueue::new(order),
        }
    }

    /// Whether any read promise is still waiting for bytes.
    pub fn is_receiving(&self) -> bool {
        !self.reads.is_empty()
    }

    pub fn pending_reads(&self) -> usize {
        self.reads.len()
    }

    pub fn pending_writes(&self) -> usize {
        self.writes.len()
    }

    /// Drops every pending operation without running its continuations.
    pub fn clear(&mut self) {
        self.reads.clear();
        self.writes.clear();
    }

    fn enqueue(&mut self, mut promise: Promise<C>) {
        match promise.take_operation() {
            Operation::Read { size, location } => self.reads.insert(promise, size, location),
            Operation::ReadInto { dest } => self.reads.insert_into(promise, dest),
            Operation::Write { data } => self.writes.insert(promise, data),
            // Completes on the next receive pass.
            Operation::Ready => self.reads.insert(promise, 0, ReadLocation::Stack),
        }
    }
}

impl<C: I2cContext> AsyncI2c<C> {
    /// Queues `promise`, resolving it right away when there is nothing to wait for.
    pub fn submit(ctx: &mut C, promise: Promise<C>) {
        if promise.is_ready() {
            promise.resolve(ctx, Response::empty());
        } else {
            ctx.i2c().enqueue(promise);
        }
    }

    /// Distributes up to `size` received bytes over the pending reads and
    /// returns how many were consumed. Reads queued by continuations during
    /// this call are serviced from the same bytes.
    pub fn handle_receive<B: SlaveBus>(ctx: &mut C, bus: &mut B, size: usize) -> usize {
        let mut consumed = 0;
        loop {
            let filled = ctx.i2c().reads.fill(bus, size - consumed);
            consumed += filled.consumed;
            match filled.completed {
                Some((promise, response)) => promise.resolve(ctx, response),
                None => break,
            }
        }
        trace!(consumed, size, "Consumed bytes in read promises");
        consumed
    }

    /// Answers one master read with at most one chunk of the head write.
    pub fn handle_request<B: SlaveBus>(ctx: &mut C, bus: &mut B) -> usize {
        let drained = ctx.i2c().writes.write_out(bus);
        if let Some(promise) = drained.completed {
            promise.resolve(ctx, Response::empty());
        }
        drained.written
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::VirtualBus;
    use alloc::rc::Rc;
    use core::cell::RefCell;

    struct Ctx {
        i2c: AsyncI2c<Ctx>,
        done: Rc<RefCell<Vec<(usize, Vec<u8>, Option<ReadLocation>)>>>,
    }

    impl I2cContext for Ctx {
        fn i2c(&mut self) -> &mut AsyncI2c<Self> {
            &mut self.i2c
        }
    }

    fn ctx(order: ServiceOrder) -> Ctx {
        Ctx {
            i2c: AsyncI2c::new(order),
            done: Rc::new(RefCell::new(Vec::new())),
        }
    }

    fn tagged(tag: usize, promise: Promise<Ctx>) -> Promise<Ctx> {
        promise.finally(move |c, r| {
            c.done
                .borrow_mut()
                .push((tag, r.as_bytes().to_vec(), r.location()))
        })
    }

    #[test]
    fn test_empty_queue_is_noop() {
        let mut ctx = ctx(ServiceOrder::Fifo);
        let mut bus = VirtualBus::new();
        bus.master_write(&[1, 2, 3]);
        assert_eq!(AsyncI2c::handle_receive(&mut ctx, &mut bus, 3), 0);
        assert_eq!(AsyncI2c::handle_request(&mut ctx, &mut bus), 0);
        assert_eq!(bus.available(), 3);
    }

    #[test]
    fn test_zero_limit_returns_immediately() {
        let mut ctx = ctx(ServiceOrder::Fifo);
        let mut bus = VirtualBus::new();
        bus.master_write(&[1]);
        AsyncI2c::submit(&mut ctx, tagged(0, Promise::read(1)));
        assert_eq!(AsyncI2c::handle_receive(&mut ctx, &mut bus, 0), 0);
        assert!(ctx.i2c.is_receiving());
    }

    #[test]
    fn test_stack_read_promoted_when_short_of_bytes() {
        let mut ctx = ctx(ServiceOrder::Fifo);
        let mut bus = VirtualBus::new();
        AsyncI2c::submit(&mut ctx, tagged(0, Promise::read_temp(4)));

        bus.master_write(&[1, 2]);
        assert_eq!(AsyncI2c::handle_receive(&mut ctx, &mut bus, 2), 2);
        bus.master_write(&[3, 4]);
        assert_eq!(AsyncI2c::handle_receive(&mut ctx, &mut bus, 2), 2);

        let done = ctx.done.borrow();
        assert_eq!(done[0].1, vec![1, 2, 3, 4]);
        assert_eq!(done[0].2, Some(ReadLocation::TempHeap));
    }

    #[test]
    fn test_stack_read_stays_inline_when_satisfiable() {
        let mut ctx = ctx(ServiceOrder::Fifo);
        let mut bus = VirtualBus::new();
        AsyncI2c::submit(&mut ctx, tagged(0, Promise::read_temp(3)));
        bus.master_write(&[7, 8, 9]);
        AsyncI2c::handle_receive(&mut ctx, &mut bus, 3);
        assert_eq!(ctx.done.borrow()[0].2, Some(ReadLocation::Stack));
    }

    #[test]
    fn test_read_into_fills_caller_buffer() {
        let mut ctx = ctx(ServiceOrder::Fifo);
        let mut bus = VirtualBus::new();
        AsyncI2c::submit(&mut ctx, tagged(0, Promise::read_into(vec![0xAA; 2])));
        bus.master_write(&[5, 6]);
        AsyncI2c::handle_receive(&mut ctx, &mut bus, 2);
        let done = ctx.done.borrow();
        assert_eq!(done[0].1, vec![5, 6]);
        assert_eq!(done[0].2, Some(ReadLocation::Defined));
    }

    #[test]
    fn test_starved_bus_stops_without_spinning() {
        let mut ctx = ctx(ServiceOrder::Fifo);
        let mut bus = VirtualBus::new();
        AsyncI2c::submit(&mut ctx, tagged(0, Promise::read(4)));
        bus.master_write(&[1]);
        assert_eq!(AsyncI2c::handle_receive(&mut ctx, &mut bus, 4), 1);
        assert!(ctx.i2c.is_receiving());
    }

    #[test]
    fn test_write_out_chunks_at_buffer_limit() {
        let mut ctx = ctx(ServiceOrder::Fifo);
        let mut bus = VirtualBus::new();
        let data: Vec<u8> = (0..40).collect();
        AsyncI2c::submit(&mut ctx, tagged(0, Promise::write(data.clone())));

        bus.begin_master_read();
        assert_eq!(AsyncI2c::handle_request(&mut ctx, &mut bus), 32);
        assert_eq!(bus.take_transmitted(), data[..32].to_vec());
        assert!(ctx.done.borrow().is_empty());

        bus.begin_master_read();
        assert_eq!(AsyncI2c::handle_request(&mut ctx, &mut bus), 8);
        assert_eq!(bus.take_transmitted(), data[32..].to_vec());
        assert_eq!(ctx.done.borrow().len(), 1);
    }

    #[test]
    fn test_continuation_write_follows_completed_write() {
        let mut ctx = ctx(ServiceOrder::Fifo);
        let mut bus = VirtualBus::new();
        let promise = Promise::write(vec![1, 2, 3]).then(|_, _| Some(Promise::write(vec![4])));
        AsyncI2c::submit(&mut ctx, tagged(0, promise));

        bus.begin_master_read();
        AsyncI2c::handle_request(&mut ctx, &mut bus);
        assert_eq!(bus.take_transmitted(), vec![1, 2, 3]);
        assert_eq!(ctx.i2c.pending_writes(), 1);

        bus.begin_master_read();
        AsyncI2c::handle_request(&mut ctx, &mut bus);
        assert_eq!(bus.take_transmitted(), vec![4]);
        assert_eq!(ctx.done.borrow().len(), 1);
    }
}
