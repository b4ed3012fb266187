#![deny(missing_docs)]

//! Concurrent dataflow circuit engine
//!
//! patchbay executes directed graphs of processing nodes ("components")
//! connected by wires. The graph advances in discrete ticks: on each tick
//! every component consumes the outputs its upstream neighbours produced and
//! writes new outputs. Feedback wires (cycles) are first-class: a feedback
//! consumer reads the previous tick's value. With more than one buffer slot
//! configured, successive ticks are pipelined across worker threads while
//! components that ask for it still observe their buffers strictly in order.
//!
//! # Quick Start
//!
//! ```ignore
//! use patchbay::{Circuit, Component, Processor, SignalBus, TickMode};
//!
//! struct Doubler;
//!
//! impl Processor for Doubler {
//!     fn input_count(&self) -> usize { 1 }
//!     fn output_count(&self) -> usize { 1 }
//!
//!     fn process(&self, inputs: &mut SignalBus, outputs: &mut SignalBus) {
//!         if let Some(&v) = inputs.value::<i32>(0) {
//!             outputs.set_value(0, v * 2);
//!         }
//!     }
//! }
//!
//! let mut circuit = Circuit::new();
//! let source = Component::new(MySource);
//! let doubler = Component::new(Doubler);
//!
//! let source_h = circuit.add_component(&source);
//! let doubler_h = circuit.add_component(&doubler);
//! circuit.connect_out_to_in(source_h, 0, doubler_h, 0);
//!
//! // one synchronous tick
//! circuit.tick(TickMode::Series);
//!
//! // or: pipeline ticks across 3 buffer slots, driven continuously
//! circuit.set_buffer_count(3, 1);
//! circuit.start_auto_tick(TickMode::Series);
//! // ... later
//! circuit.stop_auto_tick();
//! ```
//!
//! # Core Types
//!
//! - [`Signal`] / [`SignalBus`]: dynamically typed value cells and the
//!   indexed buses components read and write.
//! - [`Processor`]: the user-implemented processing body, a port layout plus
//!   a `process(inputs, outputs)` function.
//! - [`Component`]: a processor wired into the graph, with per-buffer tick
//!   state. Created with [`Component::new`], connected with
//!   [`Component::connect_input`] or through the circuit.
//! - [`Circuit`]: the component registry and control surface with manual
//!   [`tick`](Circuit::tick), auto-tick start/pause/resume/stop, and buffer
//!   configuration.
//! - [`ThreadPool`]: optional shared worker teams replacing per-component
//!   threads in Parallel mode.
//!
//! # Execution model
//!
//! [`TickMode::Series`] traverses the graph recursively on the calling
//! thread. [`TickMode::Parallel`] dispatches each component's processing to
//! a worker thread (its own, or the shared [`ThreadPool`]); downstream
//! components wait only on the upstream workers they actually read from.
//! Feedback edges are detected at runtime (re-entering a component that is
//! still starting its tick marks the edge) and are never waited on.
//!
//! With `buffer_count` B > 1, the circuit runs B worker sweeps concurrently,
//! one per buffer slot, so up to B ticks are in flight. A component declared
//! [`ProcessOrder::InOrder`] has its `process` calls serialised in the ring
//! order 0, 1, ..., B-1, 0, ... by a release token passed between slots;
//! [`ProcessOrder::OutOfOrder`] components process buffers concurrently.
//!
//! The engine surfaces no errors: out-of-range connects return `false`,
//! missing or mismatched values read as `None`, and user `process` bodies
//! must not panic.

mod bus;
mod circuit;
mod component;
pub(crate) mod hash;
mod pool;
mod signal;
mod wire;
mod worker;

pub use bus::SignalBus;
pub use circuit::{Circuit, ComponentHandle};
pub use component::{Component, ProcessOrder, Processor, TickMode};
pub use pool::{JobToken, ThreadPool};
pub use signal::Signal;
