use std::any::{Any, TypeId};

use crate::signal::Signal;

/// Indexed array of [`Signal`]s attached to a component as inputs or outputs
///
/// A component's `process` receives two buses: its inputs, filled by the
/// engine from upstream outputs, and its outputs, which it writes and the
/// engine distributes downstream. Indices are stable; the length is fixed by
/// the owning component's port count.
///
/// All accessors are index-checked and signal absence or a type mismatch
/// reads as `None`; there is no panicking path.
#[derive(Default)]
pub struct SignalBus {
    signals: Vec<Signal>,
}

impl SignalBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self {
            signals: Vec::new(),
        }
    }

    /// Resize the bus to `signal_count` signals
    ///
    /// Existing signals below the new length keep their values; new slots
    /// start empty.
    pub fn set_signal_count(&mut self, signal_count: usize) {
        self.signals.resize_with(signal_count, Signal::new);
    }

    /// Number of signals in the bus
    pub fn signal_count(&self) -> usize {
        self.signals.len()
    }

    /// Borrow the signal at `index`
    pub fn signal(&self, index: usize) -> Option<&Signal> {
        self.signals.get(index)
    }

    /// Mutably borrow the signal at `index`
    pub fn signal_mut(&mut self, index: usize) -> Option<&mut Signal> {
        self.signals.get_mut(index)
    }

    /// Whether the signal at `index` holds a value
    pub fn has_value(&self, index: usize) -> bool {
        self.signals.get(index).is_some_and(Signal::has_value)
    }

    /// Read the signal at `index` as `T`
    ///
    /// Returns `None` when the index is out of range, the signal is empty,
    /// or it holds a different type.
    pub fn value<T: Any + Send + Clone>(&self, index: usize) -> Option<&T> {
        self.signals.get(index)?.value::<T>()
    }

    /// Store a value into the signal at `index`
    ///
    /// Out-of-range indices are ignored.
    pub fn set_value<T: Any + Send + Clone>(&mut self, index: usize, value: T) {
        if let Some(signal) = self.signals.get_mut(index) {
            signal.set(value);
        }
    }

    /// Copy another signal into the slot at `index`
    pub fn set_signal(&mut self, index: usize, from: &Signal) {
        if let Some(signal) = self.signals.get_mut(index) {
            signal.clone_from_signal(from);
        }
    }

    /// Swap another signal into the slot at `index`
    ///
    /// The source is left holding whatever the slot held before (usually
    /// nothing). This is the O(1) transfer used for the final consumer of a
    /// fanned-out output.
    pub fn move_signal(&mut self, index: usize, from: &mut Signal) {
        if let Some(signal) = self.signals.get_mut(index) {
            signal.swap(from);
        }
    }

    /// Runtime type identity of the signal at `index`
    pub fn type_id(&self, index: usize) -> Option<TypeId> {
        self.signals.get(index)?.type_id()
    }

    /// Clear every signal in the bus
    pub fn clear_all(&mut self) {
        for signal in &mut self.signals {
            signal.clear();
        }
    }
}

impl std::fmt::Debug for SignalBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalBus")
            .field("signal_count", &self.signals.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resize_preserves_existing_values() {
        let mut bus = SignalBus::new();
        bus.set_signal_count(2);
        bus.set_value(0, 10i32);
        bus.set_value(1, 20i32);

        bus.set_signal_count(4);

        assert_eq!(bus.signal_count(), 4);
        assert_eq!(bus.value::<i32>(0), Some(&10));
        assert_eq!(bus.value::<i32>(1), Some(&20));
        assert!(!bus.has_value(2));
        assert!(!bus.has_value(3));
    }

    #[test]
    fn out_of_range_access_is_inert() {
        let mut bus = SignalBus::new();
        bus.set_signal_count(1);

        bus.set_value(5, 1i32);

        assert!(!bus.has_value(5));
        assert_eq!(bus.value::<i32>(5), None);
        assert_eq!(bus.type_id(5), None);
        assert!(bus.signal(5).is_none());
    }

    #[test]
    fn move_signal_drains_the_source() {
        let mut bus = SignalBus::new();
        bus.set_signal_count(1);
        let mut source = Signal::new();
        source.set(String::from("payload"));
        let source_type = source.type_id();

        bus.move_signal(0, &mut source);

        assert!(!source.has_value());
        assert_eq!(bus.type_id(0), source_type);
        assert_eq!(
            bus.value::<String>(0).map(String::as_str),
            Some("payload")
        );
    }

    #[test]
    fn clear_all_empties_every_slot() {
        let mut bus = SignalBus::new();
        bus.set_signal_count(3);
        bus.set_value(0, 1i32);
        bus.set_value(2, 3i32);

        bus.clear_all();

        for i in 0..3 {
            assert!(!bus.has_value(i));
        }
        assert_eq!(bus.signal_count(), 3);
    }
}
