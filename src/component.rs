use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use indexmap::IndexSet;
use parking_lot::{Condvar, Mutex, RwLock};
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::bus::SignalBus;
use crate::hash::FastHashBuilder;
use crate::pool::{JobToken, ThreadPool};
use crate::wire::Wire;
use crate::worker::SlotWorker;

/// How a tick traverses the circuit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickMode {
    /// Synchronous traversal: a component recursively ticks its upstream
    /// neighbours on the calling thread before processing.
    Series,
    /// Worker-dispatched traversal: each component's input-pull and
    /// processing run asynchronously on its slot worker or the shared
    /// thread pool, pipelining the tick across components.
    Parallel,
}

/// Whether a component's processing must observe buffer slots in ring order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessOrder {
    /// `process` calls are serialised across buffer slots in the order
    /// 0, 1, ..., B-1, 0, ... even while ticks are pipelined. This is what a
    /// stateful component (a counter, a filter with memory) needs to see a
    /// coherent timeline.
    InOrder,
    /// No inter-buffer ordering is imposed; `process` may run concurrently
    /// for two buffers.
    OutOfOrder,
}

/// User-supplied processing body of a [`Component`].
///
/// A processor declares its port layout up front and transforms one bus of
/// inputs into one bus of outputs per tick. Not writing an output leaves it
/// empty for that tick; downstream typed reads then return `None`.
///
/// `process` takes `&self`: a component declared
/// [`OutOfOrder`](ProcessOrder::OutOfOrder) may have `process` invoked
/// concurrently for different buffer slots, so mutable processor state
/// belongs in atomics or a lock.
pub trait Processor: Send + Sync + 'static {
    /// Number of input ports
    fn input_count(&self) -> usize;

    /// Number of output ports
    fn output_count(&self) -> usize;

    /// Optional input port names, indexed like the input bus
    fn input_names(&self) -> Vec<String> {
        Vec::new()
    }

    /// Optional output port names, indexed like the output bus
    fn output_names(&self) -> Vec<String> {
        Vec::new()
    }

    /// Buffer-ordering requirement, [`ProcessOrder::InOrder`] by default
    fn process_order(&self) -> ProcessOrder {
        ProcessOrder::InOrder
    }

    /// Transform the inputs for one tick into outputs.
    ///
    /// Must not panic: a panic here poisons the worker serving the current
    /// buffer slot and is not recovered by the engine.
    fn process(&self, inputs: &mut SignalBus, outputs: &mut SignalBus);
}

// Tick status per buffer slot. TickStarted covers the window in which the
// component is still ticking its upstream neighbours; re-entering during
// that window is how a feedback edge announces itself.
const NOT_TICKED: u8 = 0;
const TICK_STARTED: u8 = 1;
const TICKING: u8 = 2;

#[derive(Clone, Copy, Default)]
struct RefCount {
    /// Static fan-out of the output: number of wires reading it
    total: usize,
    /// Consumers that have fetched the value this tick
    count: usize,
}

struct OutputState {
    bus: SignalBus,
    refs: Vec<RefCount>,
}

struct ReleaseFlag {
    got_release: Mutex<bool>,
    released: Condvar,
}

impl ReleaseFlag {
    fn new(got_release: bool) -> Self {
        Self {
            got_release: Mutex::new(got_release),
            released: Condvar::new(),
        }
    }
}

/// Independent per-tick state: one of these exists per buffer slot, which is
/// what lets B successive ticks be in flight at once.
struct BufferSlot {
    status: AtomicU8,
    inputs: Mutex<SignalBus>,
    output: Mutex<OutputState>,
    /// Wire indices identified as feedback edges for the tick in flight
    feedback: Mutex<IndexSet<usize, FastHashBuilder>>,
    release: ReleaseFlag,
    worker: SlotWorker,
    /// Latest pool job for this slot, when a thread pool is set
    pool_job: Mutex<Option<Arc<JobToken>>>,
}

impl BufferSlot {
    fn new(input_count: usize, output_count: usize, totals: &[usize]) -> Self {
        let mut inputs = SignalBus::new();
        inputs.set_signal_count(input_count);
        let mut bus = SignalBus::new();
        bus.set_signal_count(output_count);
        let refs = (0..output_count)
            .map(|i| RefCount {
                total: totals.get(i).copied().unwrap_or(0),
                count: 0,
            })
            .collect();
        Self {
            status: AtomicU8::new(NOT_TICKED),
            inputs: Mutex::new(inputs),
            output: Mutex::new(OutputState { bus, refs }),
            feedback: Mutex::new(IndexSet::default()),
            release: ReleaseFlag::new(false),
            worker: SlotWorker::new(),
            pool_job: Mutex::new(None),
        }
    }

    /// Block until any in-flight processing for this slot has finished.
    fn wait(&self) {
        let token = self.pool_job.lock().clone();
        match token {
            Some(token) => token.wait(),
            None => self.worker.wait(),
        }
    }
}

/// A node of the circuit: a [`Processor`] plus the engine state that wires
/// it into the graph and drives it through ticks.
///
/// A component owns, per buffer slot, an input bus, an output bus, a tick
/// status, per-output reference counters, and worker state; wires from
/// upstream components are held on the component they target. Components
/// are shared through `Arc`: the circuit and every wire pointing at a
/// component keep it alive.
///
/// Outputs written during one tick remain readable until the next tick on
/// the same buffer slot clears them after pulling its own inputs; feedback
/// edges rely on this holdover to read the previous tick's values.
pub struct Component {
    self_ref: Weak<Component>,
    processor: Box<dyn Processor>,
    process_order: ProcessOrder,
    slots: RwLock<Vec<BufferSlot>>,
    wires: Mutex<SmallVec<[Wire; 4]>>,
    input_count: AtomicUsize,
    output_count: AtomicUsize,
    input_names: Mutex<Vec<String>>,
    output_names: Mutex<Vec<String>>,
    pool: Mutex<Option<Arc<ThreadPool>>>,
}

impl Component {
    /// Wrap a processor into a circuit node with a single buffer slot.
    pub fn new(processor: impl Processor) -> Arc<Self> {
        let process_order = processor.process_order();
        let input_count = processor.input_count();
        let output_count = processor.output_count();
        let input_names = processor.input_names();
        let output_names = processor.output_names();

        let component = Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            processor: Box::new(processor),
            process_order,
            slots: RwLock::new(Vec::new()),
            wires: Mutex::new(SmallVec::new()),
            input_count: AtomicUsize::new(input_count),
            output_count: AtomicUsize::new(output_count),
            input_names: Mutex::new(input_names),
            output_names: Mutex::new(output_names),
            pool: Mutex::new(None),
        });
        component.resize_slots(1);
        component
    }

    /// Number of input ports
    pub fn input_count(&self) -> usize {
        self.input_count.load(Ordering::Relaxed)
    }

    /// Number of output ports
    pub fn output_count(&self) -> usize {
        self.output_count.load(Ordering::Relaxed)
    }

    /// Name of input port `input_no`, `None` when unnamed or out of range
    pub fn input_name(&self, input_no: usize) -> Option<String> {
        self.input_names.lock().get(input_no).cloned()
    }

    /// Name of output port `output_no`, `None` when unnamed or out of range
    pub fn output_name(&self, output_no: usize) -> Option<String> {
        self.output_names.lock().get(output_no).cloned()
    }

    /// Number of buffer slots
    pub fn buffer_count(&self) -> usize {
        self.slots.read_recursive().len()
    }

    /// Resize the per-buffer state to `buffer_count` slots (minimum one).
    ///
    /// All transient tick state is reset; the static fan-out totals carry
    /// over to every new slot. Must not be called while a tick is in
    /// flight.
    pub fn set_buffer_count(&self, buffer_count: usize) {
        debug!(buffer_count, "component buffer count set");
        self.resize_slots(buffer_count);
    }

    /// Route Parallel-mode processing through a shared pool instead of this
    /// component's own worker threads.
    ///
    /// Setting a pool adopts the pool's buffer count; a pool with zero
    /// threads per buffer counts as no pool. Passing `None` restores
    /// per-component workers and keeps the current buffer count. Must not
    /// be called while a tick is in flight.
    pub fn set_thread_pool(&self, pool: Option<Arc<ThreadPool>>) {
        let adopted = {
            let mut current = self.pool.lock();
            match pool {
                Some(pool) if pool.threads_per_buffer() > 0 => {
                    let buffer_count = pool.buffer_count();
                    *current = Some(pool);
                    Some(buffer_count)
                }
                _ => {
                    *current = None;
                    None
                }
            }
        };
        if let Some(buffer_count) = adopted {
            self.resize_slots(buffer_count);
        }
    }

    /// Wire the output `from_output` of `from` into this component's input
    /// `to_input`, replacing any wire already on that input.
    ///
    /// Returns `false` (and changes nothing) when either port index is out
    /// of range. Connecting a component to itself is allowed and forms a
    /// feedback loop.
    pub fn connect_input(
        &self,
        from: &Arc<Component>,
        from_output: usize,
        to_input: usize,
    ) -> bool {
        if from_output >= from.output_count() || to_input >= self.input_count() {
            return false;
        }

        // a port holds at most one wire
        self.disconnect_input(to_input);

        self.wires.lock().push(Wire {
            from: Arc::clone(from),
            from_output,
            to_input,
        });
        from.inc_refs(from_output);
        debug!(from_output, to_input, "input connected");
        true
    }

    /// Remove the wire on input `input_no`, if any.
    pub fn disconnect_input(&self, input_no: usize) {
        let removed = {
            let mut wires = self.wires.lock();
            wires
                .iter()
                .position(|wire| wire.to_input == input_no)
                .map(|index| wires.remove(index))
        };
        if let Some(wire) = removed {
            wire.from.dec_refs(wire.from_output);
            debug!(input = input_no, "input disconnected");
        }
    }

    /// Remove every wire arriving from `from`.
    pub fn disconnect_input_from(&self, from: &Arc<Component>) {
        let removed: Vec<Wire> = {
            let mut wires = self.wires.lock();
            let mut removed = Vec::new();
            let mut index = 0;
            while index < wires.len() {
                if Arc::ptr_eq(&wires[index].from, from) {
                    removed.push(wires.remove(index));
                } else {
                    index += 1;
                }
            }
            removed
        };
        for wire in removed {
            wire.from.dec_refs(wire.from_output);
        }
    }

    /// Remove every incoming wire.
    ///
    /// This is the escape hatch for the reference cycles feedback wires
    /// create: a circuit disconnects all inputs on teardown so the `Arc`s
    /// can drop.
    pub fn disconnect_all_inputs(&self) {
        let removed: SmallVec<[Wire; 4]> = std::mem::take(&mut *self.wires.lock());
        for wire in removed {
            wire.from.dec_refs(wire.from_output);
        }
    }

    /// Resize the input bus of every buffer slot to `input_count` ports.
    ///
    /// Must not be called while a tick is in flight.
    pub fn set_input_count(&self, input_count: usize, input_names: Vec<String>) {
        *self.input_names.lock() = input_names;
        self.input_count.store(input_count, Ordering::Relaxed);
        let slots = self.slots.read_recursive();
        for slot in slots.iter() {
            slot.inputs.lock().set_signal_count(input_count);
        }
    }

    /// Resize the output bus and reference counters of every buffer slot to
    /// `output_count` ports.
    ///
    /// Must not be called while a tick is in flight.
    pub fn set_output_count(&self, output_count: usize, output_names: Vec<String>) {
        *self.output_names.lock() = output_names;
        self.output_count.store(output_count, Ordering::Relaxed);
        let slots = self.slots.read_recursive();
        for slot in slots.iter() {
            let mut output = slot.output.lock();
            output.bus.set_signal_count(output_count);
            output.refs.resize(output_count, RefCount::default());
        }
    }

    /// Advance this component by one tick on buffer slot `buffer_no`.
    ///
    /// Recursively ticks upstream components first (Series) or dispatches
    /// processing onto worker threads after starting upstreams (Parallel).
    /// Returns `false` only when the call re-entered a component that is
    /// still starting its own tick; the caller's edge is a feedback edge
    /// and must not be waited on. All other calls return `true` (including
    /// redundant ticks of an already-ticked component, which are no-ops).
    pub fn tick(&self, mode: TickMode, buffer_no: usize) -> bool {
        let slots = self.slots.read_recursive();
        let Some(slot) = slots.get(buffer_no) else {
            return true;
        };

        match slot.status.compare_exchange(
            NOT_TICKED,
            TICK_STARTED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(TICK_STARTED) => {
                // re-entered while still starting upstreams: the current
                // edge closes a cycle
                cov_mark::hit!(feedback_edge_detected);
                trace!(buffer = buffer_no, "feedback re-entry");
                return false;
            }
            Err(_) => return true,
        }

        match mode {
            TickMode::Parallel => {
                let wires = self.wires.lock().clone();
                for (index, wire) in wires.iter().enumerate() {
                    if !wire.from.tick(mode, buffer_no) {
                        slot.feedback.lock().insert(index);
                    }
                }
                slot.status.store(TICKING, Ordering::Release);

                let Some(me) = self.self_ref.upgrade() else {
                    return true;
                };
                let job = move || me.do_tick(mode, buffer_no);
                let pool = self.pool.lock().clone();
                match pool {
                    Some(pool) => {
                        let token = pool.add_job(buffer_no, job);
                        *slot.pool_job.lock() = Some(token);
                    }
                    None => {
                        // a token left over from an earlier pool would let
                        // consumers skip the wait below
                        *slot.pool_job.lock() = None;
                        slot.worker.dispatch(job);
                    }
                }
            }
            TickMode::Series => {
                slot.status.store(TICKING, Ordering::Release);
                drop(slots);
                self.do_tick(mode, buffer_no);
            }
        }
        true
    }

    /// Return buffer slot `buffer_no` to the `NotTicked` state.
    ///
    /// Waits for any in-flight processing, then clears the slot's input
    /// bus. The output bus is deliberately left alone: it was cleared at
    /// the start of this tick's processing and now holds values that
    /// feedback consumers may still read during the next tick.
    pub fn reset(&self, buffer_no: usize) {
        let slots = self.slots.read_recursive();
        let Some(slot) = slots.get(buffer_no) else {
            return;
        };
        slot.wait();
        slot.inputs.lock().clear_all();
        slot.status.store(NOT_TICKED, Ordering::Release);
    }

    /// Pull inputs, clear the output bus, and run the processor for one
    /// buffer slot. Runs on the caller (Series) or on a worker thread
    /// (Parallel).
    fn do_tick(&self, mode: TickMode, buffer_no: usize) {
        let slots = self.slots.read_recursive();
        let Some(slot) = slots.get(buffer_no) else {
            return;
        };
        let wires = self.wires.lock().clone();

        let mut inputs = slot.inputs.lock();
        match mode {
            TickMode::Parallel => {
                for (index, wire) in wires.iter().enumerate() {
                    if slot.feedback.lock().swap_remove(&index) {
                        // feedback edges are not waited on; the upstream
                        // output read below is last tick's retained value
                        trace!(wire = index, buffer = buffer_no, "feedback pull");
                    } else {
                        wire.from.wait_for_slot(buffer_no);
                    }
                    wire.from
                        .get_output(buffer_no, wire.from_output, wire.to_input, &mut inputs);
                }
            }
            TickMode::Series => {
                for wire in wires.iter() {
                    wire.from.tick(mode, buffer_no);
                    wire.from
                        .get_output(buffer_no, wire.from_output, wire.to_input, &mut inputs);
                }
            }
        }

        // Outputs are cleared here, after the inputs were pulled, never in
        // reset(): feedback consumers read the previous tick's outputs
        // during the current tick, so those values must survive until the
        // last reader has taken them.
        let mut output_guard = slot.output.lock();
        let output = &mut *output_guard;
        output.bus.clear_all();

        if self.process_order == ProcessOrder::InOrder && slots.len() > 1 {
            Self::wait_for_release(slot);
            self.processor.process(&mut inputs, &mut output.bus);
            Self::release_thread(&slots, buffer_no);
        } else {
            self.processor.process(&mut inputs, &mut output.bus);
        }
    }

    /// Block until the upstream processing for `buffer_no` has finished.
    fn wait_for_slot(&self, buffer_no: usize) {
        let slots = self.slots.read_recursive();
        if let Some(slot) = slots.get(buffer_no) {
            slot.wait();
        }
    }

    /// Hand this component's output `from_output` for slot `buffer_no` to a
    /// consumer's input bus.
    ///
    /// Every consumer of an output fetches it exactly once per tick; all
    /// but the last receive a copy, and the last takes the value by O(1)
    /// swap and resets the fetch counter for the next round. Resetting on
    /// the final fetch rather than in `reset()` keeps the output readable
    /// across the tick boundary for feedback consumers and stays correct
    /// when wires are added mid-run.
    fn get_output(
        &self,
        buffer_no: usize,
        from_output: usize,
        to_input: usize,
        target: &mut SignalBus,
    ) {
        let slots = self.slots.read_recursive();
        let Some(slot) = slots.get(buffer_no) else {
            return;
        };
        let mut output_guard = slot.output.lock();
        let output = &mut *output_guard;
        if !output.bus.has_value(from_output) {
            return;
        }
        let Some(ref_count) = output.refs.get_mut(from_output) else {
            return;
        };

        ref_count.count += 1;
        if ref_count.count != ref_count.total {
            if let Some(signal) = output.bus.signal(from_output) {
                target.set_signal(to_input, signal);
            }
        } else {
            cov_mark::hit!(final_consumer_swap);
            ref_count.count = 0;
            if let Some(signal) = output.bus.signal_mut(from_output) {
                target.move_signal(to_input, signal);
            }
        }
    }

    /// One more wire now reads output `output_no`; every buffer slot shares
    /// the same static fan-out.
    fn inc_refs(&self, output_no: usize) {
        let slots = self.slots.read_recursive();
        for slot in slots.iter() {
            if let Some(ref_count) = slot.output.lock().refs.get_mut(output_no) {
                ref_count.total += 1;
            }
        }
    }

    /// One fewer wire reads output `output_no`.
    fn dec_refs(&self, output_no: usize) {
        let slots = self.slots.read_recursive();
        for slot in slots.iter() {
            if let Some(ref_count) = slot.output.lock().refs.get_mut(output_no) {
                ref_count.total = ref_count.total.saturating_sub(1);
            }
        }
    }

    /// Wait for this slot's turn in the in-order release ring.
    fn wait_for_release(slot: &BufferSlot) {
        let mut got_release = slot.release.got_release.lock();
        while !*got_release {
            slot.release.released.wait(&mut got_release);
        }
        *got_release = false;
    }

    /// Pass the release token to the next buffer slot in the ring.
    fn release_thread(slots: &[BufferSlot], buffer_no: usize) {
        let next = (buffer_no + 1) % slots.len();
        let release = &slots[next].release;
        *release.got_release.lock() = true;
        release.released.notify_all();
    }

    /// Rebuild the slot vector with `buffer_count` entries, carrying over
    /// the fan-out totals and re-arming the release ring at slot 0.
    fn resize_slots(&self, buffer_count: usize) {
        let buffer_count = buffer_count.max(1);
        let input_count = self.input_count();
        let output_count = self.output_count();

        let mut slots = self.slots.write();
        let totals: Vec<usize> = match slots.first() {
            Some(first) => first.output.lock().refs.iter().map(|r| r.total).collect(),
            None => vec![0; output_count],
        };

        let mut fresh = Vec::with_capacity(buffer_count);
        for _ in 0..buffer_count {
            fresh.push(BufferSlot::new(input_count, output_count, &totals));
        }
        *fresh[0].release.got_release.lock() = true;
        *slots = fresh;
    }
}

impl Drop for Component {
    fn drop(&mut self) {
        // keeps upstream fan-out totals exact when a consumer goes away
        self.disconnect_all_inputs();
    }
}

impl std::fmt::Debug for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Component")
            .field("input_count", &self.input_count())
            .field("output_count", &self.output_count())
            .field("buffer_count", &self.buffer_count())
            .field("process_order", &self.process_order)
            .finish()
    }
}
