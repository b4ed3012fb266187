use std::sync::Arc;

use crate::component::Component;

/// Directed connection from an upstream component's output to one input of
/// the component holding the wire.
///
/// Wires live on the *target* component and hold a strong reference to the
/// source, so a component's wire list keeps its upstream neighbourhood
/// alive. Feedback wires therefore form reference cycles; the circuit
/// breaks them by disconnecting inputs on teardown.
pub(crate) struct Wire {
    pub from: Arc<Component>,
    pub from_output: usize,
    pub to_input: usize,
}

impl Clone for Wire {
    fn clone(&self) -> Self {
        Self {
            from: Arc::clone(&self.from),
            from_output: self.from_output,
            to_input: self.to_input,
        }
    }
}

impl std::fmt::Debug for Wire {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wire")
            .field("from_output", &self.from_output)
            .field("to_input", &self.to_input)
            .finish()
    }
}
