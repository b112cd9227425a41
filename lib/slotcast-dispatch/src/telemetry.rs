use std::sync::Arc;

use metrics::{counter, histogram, Counter, Histogram};

use crate::{DispatchType, HashedId, NotifyReport};

pub(crate) const FLUSHES: &str = "dispatch.sender.flushes";
pub(crate) const FLUSHED_SLOTS: &str = "dispatch.sender.flushed_slots";
pub(crate) const LISTENER_FAILURES: &str = "dispatch.listener.failures";
pub(crate) const LISTENERS_EXPIRED: &str = "dispatch.listener.expired";

/// Per-channel telemetry of a slot sender.
///
/// Handles are registered once, when the sender is created. Nothing here is touched when sending change messages.
pub(crate) struct ChannelTelemetry {
    flushes: Counter,
    flushed_slots: Histogram,
    listener_failures: Counter,
    listeners_expired: Counter,
}

impl ChannelTelemetry {
    pub(crate) fn new(sender_id: &HashedId, channel: DispatchType) -> Self {
        let sender_id: Arc<str> = Arc::from(sender_id.as_str());
        let channel = channel.as_str();

        Self {
            flushes: counter!(FLUSHES, "sender_id" => Arc::clone(&sender_id), "channel" => channel),
            flushed_slots: histogram!(FLUSHED_SLOTS, "sender_id" => Arc::clone(&sender_id), "channel" => channel),
            listener_failures: counter!(LISTENER_FAILURES, "sender_id" => Arc::clone(&sender_id), "channel" => channel),
            listeners_expired: counter!(LISTENERS_EXPIRED, "sender_id" => sender_id, "channel" => channel),
        }
    }

    pub(crate) fn record_flush(&self, num_slots: usize, report: &NotifyReport) {
        self.flushes.increment(1);
        self.flushed_slots.record(num_slots as f64);

        if report.failed() > 0 {
            self.listener_failures.increment(report.failed() as u64);
        }

        if report.expired() > 0 {
            self.listeners_expired.increment(report.expired() as u64);
        }
    }
}
