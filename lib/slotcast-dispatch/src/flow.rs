//! Flow tracing.
//!
//! A flow links the change message that made a channel dirty to the flush that eventually delivered it, so a trace
//! viewer can draw an arrow from producer to consumer. Every message sent between two flushes of a channel belongs to
//! the same flow.
//!
//! Two sinks are provided: [`NullFlowManager`], which does nothing and compiles away entirely, and
//! [`TracingFlowManager`], which emits `trace`-level events on the [`FLOW_TARGET`] target. [`FlowManager`] selects
//! between them based on the `flow-tracing` feature, so slot senders call the same methods either way.
use std::sync::atomic::{
    AtomicU64,
    Ordering::{AcqRel, Acquire},
};

use tracing::trace;

use crate::{DispatchRoot, DispatchType, DispatchTypeContainer, FlowId, HashedId};

/// Target used for all flow events.
pub const FLOW_TARGET: &str = "slotcast::flow";

/// The flow sink used by slot senders.
#[cfg(feature = "flow-tracing")]
pub type FlowManager = TracingFlowManager;

/// The flow sink used by slot senders.
#[cfg(not(feature = "flow-tracing"))]
pub type FlowManager = NullFlowManager;

/// An instrumentation sink for flows.
pub trait FlowSink: Send + Sync {
    /// Creates the sink for a sender, identified by its source and its own identifier.
    fn for_sender(root: &DispatchRoot, source: &HashedId, sender: &HashedId) -> Self
    where
        Self: Sized;

    /// Records a change message for the given channel and slot, starting a flow if none is pending on the channel.
    fn open_flow(&self, channel: DispatchType, slot_index: u8);

    /// Ends the pending flow for the given channel, if any, and returns its identifier.
    fn close_flow(&self, channel: DispatchType) -> Option<FlowId>;
}

/// A flow sink that does nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullFlowManager;

impl FlowSink for NullFlowManager {
    #[inline(always)]
    fn for_sender(_: &DispatchRoot, _: &HashedId, _: &HashedId) -> Self {
        NullFlowManager
    }

    #[inline(always)]
    fn open_flow(&self, _: DispatchType, _: u8) {}

    #[inline(always)]
    fn close_flow(&self, _: DispatchType) -> Option<FlowId> {
        None
    }
}

/// A flow sink that emits flow events through `tracing`.
///
/// Flow identifiers come from the [`DispatchRoot`], and at most one flow is pending per channel: sending many change
/// messages before a flush extends the pending flow rather than opening new ones.
#[derive(Debug)]
pub struct TracingFlowManager {
    root: DispatchRoot,
    source: HashedId,
    sender: HashedId,
    pending: DispatchTypeContainer<AtomicU64>,
}

impl FlowSink for TracingFlowManager {
    fn for_sender(root: &DispatchRoot, source: &HashedId, sender: &HashedId) -> Self {
        Self {
            root: root.clone(),
            source: source.clone(),
            sender: sender.clone(),
            pending: DispatchTypeContainer::default(),
        }
    }

    fn open_flow(&self, channel: DispatchType, slot_index: u8) {
        let pending = self.pending.get(channel);

        let mut flow_id = pending.load(Acquire);
        if flow_id == 0 {
            // The consumer may close the flow between our load and our exchange, in which case the flow it closed was
            // never ours to reuse, and we simply open a fresh one.
            let candidate = self.root.bump_flow_counter().get();
            flow_id = match pending.compare_exchange(0, candidate, AcqRel, Acquire) {
                Ok(_) => candidate,
                Err(existing) => existing,
            };
        }

        trace!(
            target: FLOW_TARGET,
            flow_id,
            source = %self.source,
            sender = %self.sender,
            channel = channel.as_str(),
            slot_index,
            "Sent change message."
        );
    }

    fn close_flow(&self, channel: DispatchType) -> Option<FlowId> {
        let flow_id = FlowId::new(self.pending.get(channel).swap(0, AcqRel))?;

        trace!(
            target: FLOW_TARGET,
            flow_id = flow_id.get(),
            source = %self.source,
            sender = %self.sender,
            channel = channel.as_str(),
            "Flushed change messages."
        );

        Some(flow_id)
    }
}
