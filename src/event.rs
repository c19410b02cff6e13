//! Cooperative event scheduler.
//!
//! An [`Event`] is a sequence of steps run against a shared container `C`.
//! [`EventManager::start`] turns it into an independently scheduled chain;
//! [`EventManager::update`] runs the current step of every chain once per
//! tick. A step returning `true` is finished and the chain moves on, a step
//! returning `false` is polled again on the next tick.
//!
//! Steps influence the scheduler only through their [`Step`] argument.
//! Everything requested there (follow-up steps, cancellation, new chains) is
//! applied after the step returns, so a step can never invalidate the chain
//! list while it is being walked.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};

use critical_section::Mutex;
use tracing::trace;

pub type EventFn<C> = Box<dyn FnMut(&mut C, &mut Step<C>) -> bool>;

/// A not yet scheduled sequence of steps.
pub struct Event<C> {
    steps: VecDeque<EventFn<C>>,
    guards: Vec<ExclusiveGuard>,
}

impl<C: 'static> Event<C> {
    pub fn new<F>(step: F) -> Self
    where
        F: FnMut(&mut C, &mut Step<C>) -> bool + 'static,
    {
        let mut steps: VecDeque<EventFn<C>> = VecDeque::new();
        steps.push_back(Box::new(step));
        Self {
            steps,
            guards: Vec::new(),
        }
    }

    /// Step that finishes once `ms` have elapsed since it first ran.
    pub fn wait(ms: u64) -> Self {
        Self::new(wait_step(ms))
    }

    /// Step that finishes on its first run.
    pub fn once<F>(mut action: F) -> Self
    where
        F: FnMut(&mut C) + 'static,
    {
        Self::new(move |container: &mut C, _: &mut Step<C>| {
            action(container);
            true
        })
    }

    #[must_use]
    pub fn then<F>(mut self, step: F) -> Self
    where
        F: FnMut(&mut C, &mut Step<C>) -> bool + 'static,
    {
        self.steps.push_back(Box::new(step));
        self
    }

    #[must_use]
    pub fn then_wait(mut self, ms: u64) -> Self {
        self.steps.push_back(Box::new(wait_step(ms)));
        self
    }

    #[must_use]
    pub fn followed_by(mut self, other: Event<C>) -> Self {
        self.steps.extend(other.steps);
        self.guards.extend(other.guards);
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

fn wait_step<C>(ms: u64) -> impl FnMut(&mut C, &mut Step<C>) -> bool {
    let mut deadline = None;
    move |_: &mut C, step: &mut Step<C>| {
        let due = *deadline.get_or_insert(step.now().saturating_add(ms));
        step.now() >= due
    }
}

/// Scheduler access for the step currently running.
pub struct Step<C> {
    now_ms: u64,
    inserted: VecDeque<EventFn<C>>,
    guards: Vec<ExclusiveGuard>,
    started: Vec<Event<C>>,
    cancel: bool,
    cancel_all: bool,
    cancel_chains: Vec<ChainId>,
}

impl<C> Step<C> {
    fn new(now_ms: u64) -> Self {
        Self {
            now_ms,
            inserted: VecDeque::new(),
            guards: Vec::new(),
            started: Vec::new(),
            cancel: false,
            cancel_all: false,
            cancel_chains: Vec::new(),
        }
    }

    pub fn now(&self) -> u64 {
        self.now_ms
    }

    /// Inserts `event` right after the current step of this chain. Repeated
    /// calls keep their call order.
    pub fn then(&mut self, event: Event<C>) {
        self.inserted.extend(event.steps);
        self.guards.extend(event.guards);
    }

    /// Starts `event` as a new chain once this step returns.
    pub fn start(&mut self, event: Event<C>) {
        self.started.push(event);
    }

    /// Ends this chain; no further step of it runs.
    pub fn cancel(&mut self) {
        self.cancel = true;
    }

    /// Ends the chain behind `handle` as soon as this step returns, before
    /// any other chain runs.
    pub fn cancel_chain(&mut self, handle: &EventChainHandle) {
        if let Some(id) = handle.chain_id() {
            self.cancel_chains.push(id);
        }
    }

    /// Ends every chain of the manager once this step returns, including
    /// chains started earlier in this tick.
    pub fn cancel_all(&mut self) {
        self.started.clear();
        self.cancel_all = true;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChainId(u64);

struct EventChain<C> {
    id: ChainId,
    steps: VecDeque<EventFn<C>>,
    guards: Vec<ExclusiveGuard>,
    link: Option<Rc<Cell<Option<ChainId>>>>,
}

impl<C> Drop for EventChain<C> {
    fn drop(&mut self) {
        if let Some(link) = &self.link {
            if link.get() == Some(self.id) {
                link.set(None);
            }
        }
        trace!(chain = self.id.0, "Chain ended");
    }
}

/// Weak reference to a running chain. Becomes inert once the chain ends.
#[derive(Debug, Default, Clone)]
pub struct EventChainHandle {
    link: Rc<Cell<Option<ChainId>>>,
}

impl EventChainHandle {
    pub fn new() -> Self {
        Self::default()
    }

    fn bind(&mut self, id: ChainId) -> Rc<Cell<Option<ChainId>>> {
        self.link = Rc::new(Cell::new(Some(id)));
        Rc::clone(&self.link)
    }

    pub fn chain_id(&self) -> Option<ChainId> {
        self.link.get()
    }

    pub fn is_active(&self) -> bool {
        self.link.get().is_some()
    }
}

/// Runs chains of events against a container of type `C`.
pub struct EventManager<C> {
    chains: VecDeque<EventChain<C>>,
    next_id: u64,
}

impl<C: 'static> EventManager<C> {
    pub fn new() -> Self {
        Self {
            chains: VecDeque::new(),
            next_id: 0,
        }
    }

    /// Schedules `event` as a new chain, optionally binding `handle` to it.
    pub fn start(&mut self, event: Event<C>, handle: Option<&mut EventChainHandle>) -> ChainId {
        let id = ChainId(self.next_id);
        self.next_id += 1;
        trace!(chain = id.0, steps = event.steps.len(), "Starting chain");
        self.chains.push_front(EventChain {
            id,
            steps: event.steps,
            guards: event.guards,
            link: handle.map(|handle| handle.bind(id)),
        });
        id
    }

    /// Runs one tick. Returns whether any chain is still running.
    ///
    /// Chains cancelled by a step are removed before any other chain runs.
    /// Chains started by a step begin on the next tick, unless a later
    /// `cancel_all` in the same tick tears them down first.
    pub fn update(&mut self, container: &mut C, now_ms: u64) -> bool {
        let mut started = Vec::new();
        let mut cancel_all = false;

        let mut index = 0;
        while index < self.chains.len() {
            let mut step = Step::new(now_ms);
            let chain = &mut self.chains[index];
            if let Some(mut current) = chain.steps.pop_front() {
                let finished = current(container, &mut step);

                chain.guards.append(&mut step.guards);
                if step.cancel {
                    trace!(chain = chain.id.0, "Chain cancelled from within");
                    chain.steps.clear();
                } else {
                    while let Some(inserted) = step.inserted.pop_back() {
                        chain.steps.push_front(inserted);
                    }
                    if !finished {
                        chain.steps.push_front(current);
                    }
                }
            }

            if step.cancel_all {
                started.clear();
                started.append(&mut step.started);
                cancel_all = true;
                break;
            }
            started.append(&mut step.started);

            for id in step.cancel_chains.drain(..) {
                match self.chains.iter().position(|chain| chain.id == id) {
                    Some(pos) if pos == index => self.chains[index].steps.clear(),
                    Some(pos) => {
                        trace!(chain = id.0, "Chain cancelled by another chain");
                        self.chains.remove(pos);
                        if pos < index {
                            index -= 1;
                        }
                    }
                    None => {}
                }
            }

            if self.chains[index].steps.is_empty() {
                self.chains.remove(index);
            } else {
                index += 1;
            }
        }

        if cancel_all {
            self.chains.clear();
        }
        for event in started {
            self.start(event, None);
        }
        !self.chains.is_empty()
    }

    /// Cancels the chain behind `handle`. Returns whether a chain was running.
    pub fn cancel(&mut self, handle: &EventChainHandle) -> bool {
        handle.chain_id().is_some_and(|id| self.remove(id))
    }

    pub fn cancel_all(&mut self) {
        self.chains.clear();
    }

    pub fn is_running(&self) -> bool {
        !self.chains.is_empty()
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }

    fn remove(&mut self, id: ChainId) -> bool {
        match self.chains.iter().position(|chain| chain.id == id) {
            Some(index) => {
                self.chains.remove(index);
                true
            }
            None => false,
        }
    }
}

impl<C: 'static> Default for EventManager<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Flag guarding one kind of queued work, e.g. the status LED program.
#[derive(Debug, Default, Clone)]
pub struct EventMutex {
    locked: Rc<Cell<bool>>,
}

impl EventMutex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_locked(&self) -> bool {
        self.locked.get()
    }

    fn try_lock(&self) -> Option<ExclusiveGuard> {
        if self.locked.replace(true) {
            return None;
        }
        Some(ExclusiveGuard {
            locked: Rc::clone(&self.locked),
        })
    }
}

/// Holds an [`EventMutex`] until the event carrying it is gone.
#[derive(Debug)]
pub struct ExclusiveGuard {
    locked: Rc<Cell<bool>>,
}

impl Drop for ExclusiveGuard {
    fn drop(&mut self) {
        self.locked.set(false);
    }
}

/// Events queued from interrupt context, started later from the main loop.
pub struct EventQueue<C> {
    pending: Mutex<RefCell<VecDeque<Event<C>>>>,
}

impl<C: 'static> EventQueue<C> {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(RefCell::new(VecDeque::new())),
        }
    }

    pub fn queue(&self, event: Event<C>) {
        critical_section::with(|cs| self.pending.borrow_ref_mut(cs).push_back(event));
    }

    /// Queues `event` only if `mutex` is free. The mutex stays taken until
    /// the event's chain ends, or until the event is dropped unstarted.
    pub fn queue_exclusive(&self, mut event: Event<C>, mutex: &EventMutex) -> bool {
        let Some(guard) = mutex.try_lock() else {
            trace!("Exclusive event already pending");
            return false;
        };
        event.guards.push(guard);
        self.queue(event);
        true
    }

    /// Starts everything queued so far. Returns how many chains were started.
    pub fn execute(&self, events: &mut EventManager<C>) -> usize {
        let pending = critical_section::with(|cs| core::mem::take(&mut *self.pending.borrow_ref_mut(cs)));
        let count = pending.len();
        for event in pending {
            events.start(event, None);
        }
        count
    }

    pub fn len(&self) -> usize {
        critical_section::with(|cs| self.pending.borrow_ref(cs).len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops queued events, releasing their mutexes.
    pub fn clear(&self) {
        critical_section::with(|cs| self.pending.borrow_ref_mut(cs).clear());
    }
}

impl<C: 'static> Default for EventQueue<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Trace {
        runs: Vec<&'static str>,
    }

    fn record(name: &'static str, finish: bool) -> impl FnMut(&mut Trace, &mut Step<Trace>) -> bool {
        move |t: &mut Trace, _: &mut Step<Trace>| {
            t.runs.push(name);
            finish
        }
    }

    #[test]
    fn test_wait_finishes_after_deadline() {
        let mut events = EventManager::new();
        let mut trace = Trace::default();
        events.start(Event::wait(100).then(record("after", true)), None);

        assert!(events.update(&mut trace, 1000));
        assert!(events.update(&mut trace, 1099));
        assert!(trace.runs.is_empty());
        assert!(events.update(&mut trace, 1100));
        assert!(!events.update(&mut trace, 1100));
        assert_eq!(trace.runs, vec!["after"]);
    }

    #[test]
    fn test_step_then_inserts_after_current_in_call_order() {
        let mut events = EventManager::new();
        let mut trace = Trace::default();
        events.start(
            Event::new(|t: &mut Trace, step: &mut Step<Trace>| {
                t.runs.push("a");
                step.then(Event::new(record("x", true)));
                step.then(Event::new(record("y", true)));
                true
            })
            .then(record("b", true)),
            None,
        );
        for now in 0..4 {
            events.update(&mut trace, now);
        }
        assert_eq!(trace.runs, vec!["a", "x", "y", "b"]);
    }

    #[test]
    fn test_cancel_all_from_within_is_deferred() {
        let mut events = EventManager::new();
        let mut trace = Trace::default();
        events.start(Event::new(record("other", false)), None);
        events.start(
            Event::new(|t: &mut Trace, step: &mut Step<Trace>| {
                t.runs.push("killer");
                step.cancel_all();
                true
            }),
            None,
        );

        assert!(!events.update(&mut trace, 0));
        assert_eq!(trace.runs, vec!["killer"]);
        assert!(events.is_empty());
    }

    #[test]
    fn test_started_chain_runs_next_tick() {
        let mut events = EventManager::new();
        let mut trace = Trace::default();
        events.start(
            Event::new(|_: &mut Trace, step: &mut Step<Trace>| {
                step.start(Event::new(record("child", true)));
                true
            }),
            None,
        );
        assert!(events.update(&mut trace, 0));
        assert!(trace.runs.is_empty());
        assert!(!events.update(&mut trace, 1));
        assert_eq!(trace.runs, vec!["child"]);
    }

    #[test]
    fn test_dropped_queue_releases_mutex() {
        let mutex = EventMutex::new();
        {
            let queue: EventQueue<Trace> = EventQueue::new();
            assert!(queue.queue_exclusive(Event::new(record("a", true)), &mutex));
            assert!(mutex.is_locked());
        }
        assert!(!mutex.is_locked());
    }

    #[test]
    fn test_rebinding_handle_leaves_old_chain_running() {
        let mut events = EventManager::new();
        let mut handle = EventChainHandle::new();
        events.start(Event::new(record("first", false)), Some(&mut handle));
        events.start(Event::new(record("second", false)), Some(&mut handle));
        assert!(events.cancel(&handle));
        assert!(!handle.is_active());
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_cancel_all_drops_chains_started_before_it() {
        let mut events = EventManager::new();
        let mut trace = Trace::default();
        events.start(
            Event::new(|_: &mut Trace, step: &mut Step<Trace>| {
                step.start(Event::new(record("child", true)));
                step.cancel_all();
                step.start(Event::new(record("late", true)));
                true
            }),
            None,
        );
        // Runs first, its chain is started before the cancel.
        events.start(
            Event::new(|_: &mut Trace, step: &mut Step<Trace>| {
                step.start(Event::new(record("early", true)));
                true
            }),
            None,
        );

        assert!(events.update(&mut trace, 0));
        assert_eq!(events.len(), 1);
        assert!(!events.update(&mut trace, 1));
        assert_eq!(trace.runs, vec!["late"]);
    }
}
