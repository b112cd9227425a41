use std::{
    num::NonZeroU64,
    sync::{
        atomic::{AtomicU64, Ordering::Relaxed},
        Arc,
    },
};

/// Identifier correlating a change message with the flush that delivered it.
pub type FlowId = NonZeroU64;

/// Context shared by every slot sender of an application.
///
/// Currently, this only holds the flow counter used when flow tracing is enabled. It is cheap to clone, and all clones
/// share the same state.
#[derive(Clone, Debug, Default)]
pub struct DispatchRoot {
    flow_counter: Arc<AtomicU64>,
}

impl DispatchRoot {
    /// Creates a new `DispatchRoot`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a new flow identifier.
    ///
    /// Identifiers are unique across all clones of this root, and increase monotonically.
    pub fn bump_flow_counter(&self) -> FlowId {
        let previous = self.flow_counter.fetch_add(1, Relaxed);
        NonZeroU64::new(previous.wrapping_add(1)).unwrap_or(NonZeroU64::MIN)
    }
}
