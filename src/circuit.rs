use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use indexmap::IndexMap;
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::debug;

use crate::component::{Component, TickMode};
use crate::hash::FastHashBuilder;

/// Stable identifier for a component registered in a [`Circuit`].
///
/// Handles survive removals of other components; a removed component's
/// handle is never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ComponentHandle(u32);

type ComponentMap = IndexMap<ComponentHandle, Arc<Component>, FastHashBuilder>;

/// Component registry shared between the circuit and its worker threads.
///
/// Iteration order is insertion order: circuit sweeps visit components in
/// the order they were added.
struct Registry {
    components: RwLock<ComponentMap>,
}

/// Handshake state of one circuit worker thread.
struct ThreadShared {
    state: Mutex<ThreadState>,
    sync_gained: Condvar,
    resume_gained: Condvar,
    stopped: AtomicBool,
}

struct ThreadState {
    stop: bool,
    got_sync: bool,
    got_resume: bool,
    mode: TickMode,
}

impl ThreadShared {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ThreadState {
                stop: false,
                got_sync: false,
                got_resume: false,
                mode: TickMode::Series,
            }),
            sync_gained: Condvar::new(),
            resume_gained: Condvar::new(),
            stopped: AtomicBool::new(false),
        })
    }

    /// Worker side of the barrier: announce the sync point, then block
    /// until the circuit grants a resume. Returns the tick mode and stop
    /// flag as of the resume.
    fn sync_and_wait_resume(&self) -> (TickMode, bool) {
        let mut state = self.state.lock();
        state.got_sync = true;
        self.sync_gained.notify_all();
        while !state.got_resume {
            self.resume_gained.wait(&mut state);
        }
        state.got_resume = false;
        (state.mode, state.stop)
    }
}

/// Circuit side of the barrier: wait until every live worker thread has
/// reached its sync point. Sync flags are left set.
fn sync_all(threads: &[Arc<ThreadShared>]) {
    for shared in threads {
        if shared.stopped.load(Ordering::Acquire) {
            continue;
        }
        let mut state = shared.state.lock();
        while !state.got_sync {
            shared.sync_gained.wait(&mut state);
        }
    }
}

/// Complete a sync across every live worker thread, then release them all
/// into the next phase with `mode`.
fn sync_and_resume(threads: &[Arc<ThreadShared>], mode: TickMode) {
    sync_all(threads);
    for shared in threads {
        if shared.stopped.load(Ordering::Acquire) {
            continue;
        }
        let mut state = shared.state.lock();
        state.got_sync = false;
        state.mode = mode;
        state.got_resume = true;
        shared.resume_gained.notify_all();
    }
}

/// One worker thread: sweeps every component for a fixed buffer slot,
/// pausing at a barrier after the tick phase and after the reset phase.
fn worker_run(shared: &ThreadShared, registry: &Registry, buffer_no: usize) {
    // Startup handshake: park until the first round is released.
    let (mut mode, mut stop) = shared.sync_and_wait_resume();

    // Every thread sweeps the full list front to back. Because buffer
    // number equals thread number, an in-order component sees its buffers
    // in the same rotation everywhere; staggering start positions would
    // break that.
    while !stop {
        {
            let components = registry.components.read();
            for component in components.values() {
                component.tick(mode, buffer_no);
            }
        }

        // Mid-round barrier: a stop requested here still completes the
        // reset sweep, so components are never left mid-tick.
        let _ = shared.sync_and_wait_resume();

        {
            let components = registry.components.read();
            for component in components.values() {
                component.reset(buffer_no);
            }
        }

        (mode, stop) = shared.sync_and_wait_resume();
    }

    shared.stopped.store(true, Ordering::Release);
}

/// Worker team for one buffer slot.
struct CircuitWorker {
    threads: Vec<WorkerThread>,
}

struct WorkerThread {
    shared: Arc<ThreadShared>,
    handle: Option<JoinHandle<()>>,
}

impl CircuitWorker {
    fn start(registry: &Arc<Registry>, buffer_no: usize, threads_per_buffer: usize) -> Self {
        let threads = (0..threads_per_buffer)
            .map(|_| {
                let shared = ThreadShared::new();
                let thread_shared = Arc::clone(&shared);
                let registry = Arc::clone(registry);
                let handle = std::thread::spawn(move || {
                    worker_run(&thread_shared, &registry, buffer_no);
                });
                WorkerThread {
                    shared,
                    handle: Some(handle),
                }
            })
            .collect();
        debug!(buffer = buffer_no, threads = threads_per_buffer, "circuit worker started");
        Self { threads }
    }
}

/// Auto-tick driver: a thin loop releasing one round (tick phase + reset
/// phase) at a time through the worker barriers.
struct AutoTickDriver {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl AutoTickDriver {
    fn spawn(threads: Vec<Arc<ThreadShared>>, mode: TickMode) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let driver_stop = Arc::clone(&stop);
        let handle = std::thread::spawn(move || {
            while !driver_stop.load(Ordering::Acquire) {
                sync_and_resume(&threads, mode); // tick phase
                sync_and_resume(&threads, mode); // reset phase
            }
        });
        Self { stop, handle }
    }

    /// Signal the driver and wait for it to finish its current round.
    fn halt(self) {
        self.stop.store(true, Ordering::Release);
        let _ = self.handle.join();
    }
}

/// A dataflow graph of [`Component`]s and the control surface that drives
/// it through ticks.
///
/// Components are swept in insertion order. With a buffer count B greater
/// than one, up to B ticks are pipelined: each buffer slot is driven by its
/// own worker team, and a component may be processing buffer b while buffer
/// b + 1 is already being pulled.
///
/// Structural changes (adding, removing, wiring) must not race a running
/// tick: pause or stop auto-ticking first. The circuit synchronises its own
/// workers internally around `set_buffer_count`.
///
/// Dropping the circuit disconnects every registered component's inputs,
/// which breaks the reference cycles feedback wires create.
pub struct Circuit {
    registry: Arc<Registry>,
    next_handle: u32,
    buffer_count: usize,
    threads_per_buffer: usize,
    workers: Vec<CircuitWorker>,
    worker_threads: Vec<Arc<ThreadShared>>,
    driver: Option<AutoTickDriver>,
    auto_tick_mode: Option<TickMode>,
}

impl Circuit {
    /// Create an empty circuit with one buffer slot.
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry {
                components: RwLock::new(IndexMap::default()),
            }),
            next_handle: 0,
            buffer_count: 1,
            threads_per_buffer: 1,
            workers: Vec::new(),
            worker_threads: Vec::new(),
            driver: None,
            auto_tick_mode: None,
        }
    }

    /// Register a component, propagating the circuit's buffer count to it.
    ///
    /// Adding the same component twice returns the original handle without
    /// registering it again.
    pub fn add_component(&mut self, component: &Arc<Component>) -> ComponentHandle {
        {
            let components = self.registry.components.read();
            if let Some((&handle, _)) = components
                .iter()
                .find(|(_, existing)| Arc::ptr_eq(existing, component))
            {
                return handle;
            }
        }

        let handle = ComponentHandle(self.next_handle);
        self.next_handle += 1;
        component.set_buffer_count(self.buffer_count);
        self.registry
            .components
            .write()
            .insert(handle, Arc::clone(component));
        debug!(?handle, "component added");
        handle
    }

    /// Disconnect and deregister a component.
    ///
    /// Severs its incoming wires and every wire in the circuit that reads
    /// from it, then removes it from the sweep list.
    pub fn remove_component(&mut self, handle: ComponentHandle) {
        let removed = self.registry.components.write().shift_remove(&handle);
        if let Some(component) = removed {
            component.disconnect_all_inputs();
            let components = self.registry.components.read();
            for other in components.values() {
                other.disconnect_input_from(&component);
            }
            debug!(?handle, "component removed");
        }
    }

    /// Sever a component's incoming wires and every wire that reads from
    /// it, keeping it registered.
    pub fn disconnect_component(&mut self, handle: ComponentHandle) {
        let component = {
            let components = self.registry.components.read();
            components.get(&handle).cloned()
        };
        if let Some(component) = component {
            component.disconnect_all_inputs();
            let components = self.registry.components.read();
            for other in components.values() {
                if !Arc::ptr_eq(other, &component) {
                    other.disconnect_input_from(&component);
                }
            }
        }
    }

    /// Wire output `from_output` of the component at `from` into input
    /// `to_input` of the component at `to`.
    ///
    /// Returns `false` when either handle is unknown or a port index is out
    /// of range.
    pub fn connect_out_to_in(
        &mut self,
        from: ComponentHandle,
        from_output: usize,
        to: ComponentHandle,
        to_input: usize,
    ) -> bool {
        let (from, to) = {
            let components = self.registry.components.read();
            match (components.get(&from), components.get(&to)) {
                (Some(from), Some(to)) => (Arc::clone(from), Arc::clone(to)),
                _ => return false,
            }
        };
        to.connect_input(&from, from_output, to_input)
    }

    /// Number of buffer slots ticks are pipelined across
    pub fn buffer_count(&self) -> usize {
        self.buffer_count
    }

    /// Worker threads sweeping each buffer slot
    pub fn threads_per_buffer(&self) -> usize {
        self.threads_per_buffer
    }

    /// Reconfigure pipelining to `buffer_count` slots swept by
    /// `threads_per_buffer` threads each (both clamped to at least one).
    ///
    /// Circuit workers are stopped, the new buffer count is propagated to
    /// every component, and the workers are restarted if auto-ticking was
    /// configured. Safe to call while auto-ticking; the change takes effect
    /// at a round boundary.
    pub fn set_buffer_count(&mut self, buffer_count: usize, threads_per_buffer: usize) {
        let resume_mode = self.driver.is_some().then_some(self.auto_tick_mode).flatten();
        self.halt_driver();
        self.stop_workers();

        self.buffer_count = buffer_count.max(1);
        self.threads_per_buffer = threads_per_buffer.max(1);
        debug!(
            buffer_count = self.buffer_count,
            threads_per_buffer = self.threads_per_buffer,
            "circuit buffer count set"
        );

        {
            let components = self.registry.components.read();
            for component in components.values() {
                component.set_buffer_count(self.buffer_count);
            }
        }

        if self.auto_tick_mode.is_some() {
            self.start_workers();
        }
        if let Some(mode) = resume_mode {
            self.driver = Some(AutoTickDriver::spawn(self.worker_threads.clone(), mode));
        }
    }

    /// Run one manual tick: every component is ticked for every buffer
    /// slot, then every component is reset.
    ///
    /// With one buffer slot this is a plain synchronous pass over the
    /// graph. A no-op while auto-ticking is running (pause first).
    pub fn tick(&mut self, mode: TickMode) {
        if self.driver.is_some() {
            return;
        }
        let components = self.registry.components.read();
        for buffer_no in 0..self.buffer_count {
            for component in components.values() {
                component.tick(mode, buffer_no);
            }
        }
        for buffer_no in 0..self.buffer_count {
            for component in components.values() {
                component.reset(buffer_no);
            }
        }
    }

    /// Begin ticking continuously from the circuit's worker threads.
    ///
    /// Also resumes a paused auto-tick (with the new `mode`). Does nothing
    /// if auto-ticking is already running.
    pub fn start_auto_tick(&mut self, mode: TickMode) {
        if self.driver.is_some() {
            return;
        }
        if self.workers.is_empty() {
            self.start_workers();
        }
        self.driver = Some(AutoTickDriver::spawn(self.worker_threads.clone(), mode));
        self.auto_tick_mode = Some(mode);
        debug!(?mode, "auto tick started");
    }

    /// Halt auto-ticking at a round boundary, leaving the workers parked.
    ///
    /// All buffer slots are quiescent afterwards, so the graph may be
    /// rewired before resuming.
    pub fn pause_auto_tick(&mut self) {
        if self.driver.is_none() {
            return;
        }
        self.halt_driver();
        // workers are parked at a barrier once their sync flags are up
        sync_all(&self.worker_threads);
        debug!("auto tick paused");
    }

    /// Resume auto-ticking after [`pause_auto_tick`](Circuit::pause_auto_tick).
    pub fn resume_auto_tick(&mut self) {
        if self.driver.is_some() {
            return;
        }
        if let Some(mode) = self.auto_tick_mode {
            if self.workers.is_empty() {
                self.start_workers();
            }
            self.driver = Some(AutoTickDriver::spawn(self.worker_threads.clone(), mode));
            debug!("auto tick resumed");
        }
    }

    /// Stop auto-ticking and join every circuit worker thread.
    pub fn stop_auto_tick(&mut self) {
        self.halt_driver();
        self.stop_workers();
        self.auto_tick_mode = None;
        debug!("auto tick stopped");
    }

    fn start_workers(&mut self) {
        self.workers = (0..self.buffer_count)
            .map(|buffer_no| {
                CircuitWorker::start(&self.registry, buffer_no, self.threads_per_buffer)
            })
            .collect();
        self.worker_threads = self
            .workers
            .iter()
            .flat_map(|worker| worker.threads.iter().map(|t| Arc::clone(&t.shared)))
            .collect();
    }

    fn stop_workers(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        // complete any round in flight before the stop flag is observable
        sync_all(&self.worker_threads);
        for shared in &self.worker_threads {
            shared.state.lock().stop = true;
        }
        sync_and_resume(&self.worker_threads, TickMode::Series);
        for worker in &mut self.workers {
            for thread in &mut worker.threads {
                if let Some(handle) = thread.handle.take() {
                    let _ = handle.join();
                }
            }
        }
        self.workers.clear();
        self.worker_threads.clear();
        debug!("circuit workers stopped");
    }

    fn halt_driver(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.halt();
        }
    }
}

impl Default for Circuit {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Circuit {
    fn drop(&mut self) {
        self.stop_auto_tick();
        // break feedback ownership cycles so components can deallocate
        let components = self.registry.components.read();
        for component in components.values() {
            component.disconnect_all_inputs();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::SignalBus;
    use crate::component::Processor;

    struct Null;

    impl Processor for Null {
        fn input_count(&self) -> usize {
            1
        }

        fn output_count(&self) -> usize {
            1
        }

        fn process(&self, _inputs: &mut SignalBus, _outputs: &mut SignalBus) {}
    }

    #[test]
    fn empty_circuit_ticks_cleanly() {
        let mut circuit = Circuit::new();
        circuit.tick(TickMode::Series);
        circuit.tick(TickMode::Parallel);
    }

    #[test]
    fn adding_a_component_twice_returns_the_same_handle() {
        let mut circuit = Circuit::new();
        let component = Component::new(Null);

        let first = circuit.add_component(&component);
        let second = circuit.add_component(&component);

        assert_eq!(first, second);
    }

    #[test]
    fn handles_stay_valid_across_removal() {
        let mut circuit = Circuit::new();
        let a = Component::new(Null);
        let b = Component::new(Null);
        let c = Component::new(Null);

        let handle_a = circuit.add_component(&a);
        let handle_b = circuit.add_component(&b);
        let handle_c = circuit.add_component(&c);

        circuit.remove_component(handle_b);

        assert!(circuit.connect_out_to_in(handle_a, 0, handle_c, 0));
        assert!(!circuit.connect_out_to_in(handle_a, 0, handle_b, 0));
    }

    #[test]
    fn add_component_adopts_the_circuit_buffer_count() {
        let mut circuit = Circuit::new();
        circuit.set_buffer_count(3, 1);

        let component = Component::new(Null);
        circuit.add_component(&component);

        assert_eq!(component.buffer_count(), 3);
    }

    #[test]
    fn connect_fails_for_removed_handles() {
        let mut circuit = Circuit::new();
        let a = Component::new(Null);
        let b = Component::new(Null);
        let handle_a = circuit.add_component(&a);
        let handle_b = circuit.add_component(&b);

        circuit.remove_component(handle_a);

        assert!(!circuit.connect_out_to_in(handle_a, 0, handle_b, 0));
        assert!(!circuit.connect_out_to_in(handle_b, 0, handle_a, 0));
    }

    #[test]
    fn auto_tick_controls_are_reentrant() {
        let mut circuit = Circuit::new();
        let component = Component::new(Null);
        circuit.add_component(&component);

        circuit.pause_auto_tick(); // not running: no-op
        circuit.resume_auto_tick(); // never started: no-op

        circuit.start_auto_tick(TickMode::Series);
        circuit.start_auto_tick(TickMode::Series); // already running: no-op
        circuit.pause_auto_tick();
        circuit.pause_auto_tick(); // already paused: no-op
        circuit.resume_auto_tick();
        circuit.stop_auto_tick();
        circuit.stop_auto_tick(); // already stopped: no-op
    }
}
