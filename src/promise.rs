//! One-shot continuation chains for asynchronous bus I/O.
//!
//! A [`Promise`] describes a single pending bus operation together with the
//! continuations that run once it completes. Promises are moved into the
//! transport queues on submission and consumed by [`Promise::resolve`] or
//! [`Promise::reject`], so a promise can never be resolved twice.
//!
//! Continuations receive the owning context mutably. A [`Continuation::Then`]
//! step may hand back further asynchronous work; that work is spliced in
//! front of the continuations already chained after it, so dynamically
//! returned I/O always completes before the rest of the chain runs.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;

use arrayvec::ArrayVec;
use tracing::trace;

use crate::transport::{AsyncI2c, I2cContext, ReadLocation, STACK_READ_LIMIT};

/// Step that may continue with more asynchronous work.
pub type ThenFn<C> = Box<dyn FnOnce(&mut C, &mut Response) -> Option<Promise<C>>>;
/// Terminal step; the same response is passed on to whatever follows.
pub type FinallyFn<C> = Box<dyn FnOnce(&mut C, &mut Response)>;

pub enum Continuation<C> {
    Then(ThenFn<C>),
    Finally(FinallyFn<C>),
}

/// The bus operation a promise waits on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Nothing to wait for; resolves as soon as it is submitted.
    Ready,
    Read { size: usize, location: ReadLocation },
    ReadInto { dest: Vec<u8> },
    Write { data: Vec<u8> },
}

pub struct Promise<C> {
    op: Operation,
    chain: VecDeque<Continuation<C>>,
}

impl<C> Promise<C> {
    pub fn new(op: Operation) -> Self {
        Self {
            op,
            chain: VecDeque::new(),
        }
    }

    /// Persistent read; the buffer can be taken out of the response uncopied.
    pub fn read(size: usize) -> Self {
        Self::new(Operation::Read {
            size,
            location: ReadLocation::Heap,
        })
    }

    /// Short-lived read, buffered inline when it fits.
    pub fn read_temp(size: usize) -> Self {
        Self::new(Operation::Read {
            size,
            location: ReadLocation::Stack,
        })
    }

    /// Read exactly `dest.len()` bytes into a caller supplied buffer.
    pub fn read_into(dest: Vec<u8>) -> Self {
        Self::new(Operation::ReadInto { dest })
    }

    pub fn write(data: Vec<u8>) -> Self {
        Self::new(Operation::Write { data })
    }

    pub fn ready() -> Self {
        Self::new(Operation::Ready)
    }

    pub fn operation(&self) -> &Operation {
        &self.op
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.op, Operation::Ready)
    }

    /// Number of continuations still chained on this promise.
    pub fn pending_steps(&self) -> usize {
        self.chain.len()
    }

    #[must_use]
    pub fn then<F>(mut self, step: F) -> Self
    where
        F: FnOnce(&mut C, &mut Response) -> Option<Promise<C>> + 'static,
    {
        self.chain.push_back(Continuation::Then(Box::new(step)));
        self
    }

    #[must_use]
    pub fn finally<F>(mut self, step: F) -> Self
    where
        F: FnOnce(&mut C, &mut Response) + 'static,
    {
        self.chain.push_back(Continuation::Finally(Box::new(step)));
        self
    }

    pub(crate) fn take_operation(&mut self) -> Operation {
        core::mem::replace(&mut self.op, Operation::Ready)
    }

    /// Drops the promise and every continuation chained after it.
    pub fn reject(self) {
        trace!(dropped = self.chain.len(), "Promise rejected");
    }
}

impl<C: I2cContext> Promise<C> {
    /// Runs the chain against `response`, consuming the promise.
    pub fn resolve(self, ctx: &mut C, mut response: Response) {
        let mut chain = self.chain;
        while let Some(step) = chain.pop_front() {
            match step {
                Continuation::Finally(step) => step(ctx, &mut response),
                Continuation::Then(step) => match step(ctx, &mut response) {
                    None => {
                        if !chain.is_empty() {
                            trace!(dropped = chain.len(), "Promise chain ended early");
                        }
                        return;
                    }
                    Some(mut next) => {
                        next.chain.append(&mut chain);
                        if next.is_ready() {
                            chain = next.chain;
                            response = Response::empty();
                            continue;
                        }
                        AsyncI2c::submit(ctx, next);
                        return;
                    }
                },
            }
        }
    }
}

impl<C> core::fmt::Debug for Promise<C> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Promise")
            .field("op", &self.op)
            .field("steps", &self.chain.len())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ReadBuffer {
    Empty,
    Inline(ArrayVec<u8, STACK_READ_LIMIT>),
    Heap(Vec<u8>),
}

impl ReadBuffer {
    pub(crate) fn as_slice(&self) -> &[u8] {
        match self {
            ReadBuffer::Empty => &[],
            ReadBuffer::Inline(bytes) => bytes.as_slice(),
            ReadBuffer::Heap(bytes) => bytes.as_slice(),
        }
    }
}

/// Result handed to continuations: the bytes of a completed read, or
/// nothing for writes and immediate promises.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    location: Option<ReadLocation>,
    buffer: ReadBuffer,
}

impl Response {
    pub fn empty() -> Self {
        Self {
            location: None,
            buffer: ReadBuffer::Empty,
        }
    }

    pub(crate) fn from_read(location: ReadLocation, buffer: ReadBuffer) -> Self {
        Self {
            location: Some(location),
            buffer,
        }
    }

    /// Where the read was buffered, `None` when nothing was read.
    pub fn location(&self) -> Option<ReadLocation> {
        self.location
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.buffer.as_slice()
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }

    /// Moves heap buffers out without copying; inline buffers are copied.
    pub fn take(&mut self) -> Vec<u8> {
        match core::mem::replace(&mut self.buffer, ReadBuffer::Empty) {
            ReadBuffer::Empty => Vec::new(),
            ReadBuffer::Inline(bytes) => bytes.to_vec(),
            ReadBuffer::Heap(bytes) => bytes,
        }
    }
}
