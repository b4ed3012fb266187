use std::any::{Any, TypeId};

/// Object-safe value holder: any `'static + Send + Clone` type can travel
/// through a signal. Clone is required because a fanned-out output hands
/// copies to every consumer but the last.
pub(crate) trait SignalValue: Any + Send {
    fn clone_boxed(&self) -> Box<dyn SignalValue>;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any + Send + Clone> SignalValue for T {
    fn clone_boxed(&self) -> Box<dyn SignalValue> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Optionally-present dynamically-typed value cell
///
/// Signals are the unit of data transfer between components: a component
/// receives a bus of input signals and writes a bus of output signals. A
/// signal may hold a value of any `'static + Send + Clone` type and may
/// change that type from one tick to the next, useful for ports that accept
/// several payload shapes.
///
/// Reads are type-checked at runtime: [`value`](Signal::value) returns
/// `None` on an empty cell or a type mismatch, and the caller decides what
/// to do (commonly: produce no output this tick).
///
/// # Transfer
/// Two transfer operations exist, mirroring the engine's fan-out protocol:
/// [`clone_from_signal`](Signal::clone_from_signal) for non-final consumers
/// and [`swap`](Signal::swap) for the final one. Swap exchanges the value
/// holders of two cells in O(1): both the value and its runtime type move,
/// nothing is cloned or reallocated.
#[derive(Default)]
pub struct Signal {
    value: Option<Box<dyn SignalValue>>,
}

impl Signal {
    /// Create an empty signal
    pub fn new() -> Self {
        Self { value: None }
    }

    /// Whether a value is present
    pub fn has_value(&self) -> bool {
        self.value.is_some()
    }

    /// Runtime type identity of the held value, `None` when empty
    pub fn type_id(&self) -> Option<TypeId> {
        self.value.as_deref().map(|v| v.as_any().type_id())
    }

    /// Drop the held value, leaving the cell empty
    pub fn clear(&mut self) {
        self.value = None;
    }

    /// Read the value as `T`
    ///
    /// Returns `None` when the cell is empty or holds a different type.
    pub fn value<T: Any + Send + Clone>(&self) -> Option<&T> {
        self.value.as_deref()?.as_any().downcast_ref::<T>()
    }

    /// Store a value
    ///
    /// When the cell already holds a value of the same type, the existing
    /// heap allocation is overwritten in place instead of reallocated. Swaps
    /// shuttle value holders back and forth between a producer's output cell
    /// and a consumer's input cell, so on steady-state ticks this path makes
    /// the store allocation-free.
    pub fn set<T: Any + Send + Clone>(&mut self, value: T) {
        if let Some(holder) = self.value.as_deref_mut() {
            if let Some(slot) = holder.as_any_mut().downcast_mut::<T>() {
                cov_mark::hit!(signal_holder_reused);
                *slot = value;
                return;
            }
        }
        self.value = Some(Box::new(value));
    }

    /// Copy-assign from another signal (clones the held value, if any)
    pub fn clone_from_signal(&mut self, other: &Signal) {
        self.value = other.value.as_deref().map(SignalValue::clone_boxed);
    }

    /// Exchange value and type identity with another signal in O(1)
    pub fn swap(&mut self, other: &mut Signal) {
        std::mem::swap(&mut self.value, &mut other.value);
    }
}

impl std::fmt::Debug for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.type_id() {
            Some(type_id) => f.debug_struct("Signal").field("type_id", &type_id).finish(),
            None => f.write_str("Signal(empty)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_signal_reads_none() {
        let signal = Signal::new();
        assert!(!signal.has_value());
        assert_eq!(signal.type_id(), None);
        assert_eq!(signal.value::<i32>(), None);
    }

    #[test]
    fn typed_read_rejects_mismatch() {
        let mut signal = Signal::new();
        signal.set(42i32);

        assert_eq!(signal.value::<i32>(), Some(&42));
        assert_eq!(signal.value::<f32>(), None);
        assert_eq!(signal.type_id(), Some(TypeId::of::<i32>()));
    }

    #[test]
    fn set_reuses_holder_for_same_type() {
        let mut signal = Signal::new();
        signal.set(String::from("first"));

        cov_mark::check!(signal_holder_reused);
        signal.set(String::from("second"));
        assert_eq!(signal.value::<String>().map(String::as_str), Some("second"));
    }

    #[test]
    fn set_replaces_holder_on_type_change() {
        let mut signal = Signal::new();
        signal.set(1u8);
        signal.set(vec![1i32, 2, 3]);

        assert_eq!(signal.value::<u8>(), None);
        assert_eq!(signal.value::<Vec<i32>>(), Some(&vec![1, 2, 3]));
    }

    #[test]
    fn swap_exchanges_value_and_type() {
        let mut a = Signal::new();
        let mut b = Signal::new();
        a.set(7i32);
        b.set(String::from("seven"));

        let a_type = a.type_id();
        let b_type = b.type_id();
        a.swap(&mut b);

        assert_eq!(a.type_id(), b_type);
        assert_eq!(b.type_id(), a_type);
        assert_eq!(a.value::<String>().map(String::as_str), Some("seven"));
        assert_eq!(b.value::<i32>(), Some(&7));
    }

    #[test]
    fn swap_with_empty_moves_value_out() {
        let mut full = Signal::new();
        let mut empty = Signal::new();
        full.set(3.5f64);

        full.swap(&mut empty);

        assert!(!full.has_value());
        assert_eq!(empty.value::<f64>(), Some(&3.5));
    }

    #[test]
    fn clone_from_signal_leaves_source_intact() {
        let mut source = Signal::new();
        let mut target = Signal::new();
        source.set(vec![1u8, 2]);

        target.clone_from_signal(&source);

        assert_eq!(source.value::<Vec<u8>>(), Some(&vec![1, 2]));
        assert_eq!(target.value::<Vec<u8>>(), Some(&vec![1, 2]));
    }
}
