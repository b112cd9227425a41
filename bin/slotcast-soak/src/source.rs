use std::sync::{
    atomic::{AtomicU64, Ordering::Relaxed},
    Arc,
};

use anyhow::{anyhow, ensure};
use slotcast_dispatch::{
    DispatchRoot, DispatchType, DispatchTypeContainer, GenericError, HashedPath, SlotChange, SlotListener, SlotSender,
};

pub const SOURCE_ID: &str = "soak";
const SENDER_IDS: [&str; 2] = ["values", "modes"];

/// A source owning one slot sender per slot group.
pub struct DemoSource {
    senders: Vec<Arc<SlotSender>>,
}

impl DemoSource {
    pub fn new(root: &DispatchRoot, num_slots: u8) -> Self {
        let senders = SENDER_IDS
            .iter()
            .zip(0u8..)
            .map(|(id, index)| {
                let mut sender = SlotSender::new(root, SOURCE_ID, index, *id);
                sender.set_num_slots(num_slots);
                Arc::new(sender)
            })
            .collect();

        Self { senders }
    }

    pub fn senders(&self) -> &[Arc<SlotSender>] {
        &self.senders
    }

    /// Finds the sender addressed by the given path.
    pub fn route(&self, path: &HashedPath) -> Option<&Arc<SlotSender>> {
        if path.source().as_str() != SOURCE_ID {
            return None;
        }

        self.senders.iter().find(|sender| sender.matches_path(path))
    }

    pub fn flush_all(&self) -> bool {
        self.senders
            .iter()
            .fold(false, |flushed, sender| sender.flush_all() | flushed)
    }

    pub fn shutdown(&self) {
        for sender in &self.senders {
            sender.shutdown();
        }
    }
}

/// Counts every delivered slot, per sender and channel.
pub struct DeliveryCounter {
    num_slots: usize,
    delivered: Vec<DispatchTypeContainer<AtomicU64>>,
}

impl DeliveryCounter {
    pub fn new(num_senders: usize, num_slots: u8) -> Self {
        Self {
            num_slots: usize::from(num_slots),
            delivered: (0..num_senders).map(|_| DispatchTypeContainer::default()).collect(),
        }
    }

    pub fn snapshot(&self) -> Vec<DispatchTypeContainer<u64>> {
        self.delivered
            .iter()
            .map(|counts| DispatchTypeContainer::from_fn(|channel| counts.get(channel).load(Relaxed)))
            .collect()
    }
}

impl SlotListener for DeliveryCounter {
    fn slots_changed(&self, change: &SlotChange<'_>) -> Result<(), GenericError> {
        let counts = self
            .delivered
            .get(usize::from(change.sender_index()))
            .ok_or_else(|| anyhow!("Unknown sender index {}.", change.sender_index()))?;

        let slots = change.slots();
        ensure!(!slots.is_empty(), "Empty batch delivered for sender '{}'.", change.sender_id());

        let mut previous = None;
        for slot in slots {
            ensure!(slot < self.num_slots, "Out-of-range slot {} delivered.", slot);
            ensure!(previous < Some(slot), "Slots delivered out of order.");
            previous = Some(slot);
        }

        counts.get(change.channel()).fetch_add(slots.len() as u64, Relaxed);
        Ok(())
    }
}

/// Per-channel totals, in ordinal order.
pub fn totals(counts: &DispatchTypeContainer<u64>) -> [(DispatchType, u64); 2] {
    DispatchType::ALL.map(|channel| (channel, *counts.get(channel)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_by_path() {
        let source = DemoSource::new(&DispatchRoot::new(), 4);

        let values = HashedPath::parse("soak.values").unwrap();
        assert_eq!(source.route(&values).map(|sender| sender.index()), Some(0));

        let modes = HashedPath::parse("soak.modes.*").unwrap();
        assert_eq!(source.route(&modes).map(|sender| sender.index()), Some(1));

        assert!(source.route(&HashedPath::parse("other.values").unwrap()).is_none());
        assert!(source.route(&HashedPath::parse("soak.values.deferred").unwrap()).is_none());
    }

    #[test]
    fn counts_deliveries() {
        let source = DemoSource::new(&DispatchRoot::new(), 8);
        let counter = Arc::new(DeliveryCounter::new(source.senders().len(), 8));
        for sender in source.senders() {
            for channel in DispatchType::ALL {
                sender.listener_queue(channel).add(&counter);
            }
        }

        let values = &source.senders()[0];
        values.send_change_message(1, DispatchType::Deferred);
        values.send_change_message(2, DispatchType::Deferred);
        source.senders()[1].send_change_message(7, DispatchType::Immediate);

        assert!(source.flush_all());
        assert!(!source.flush_all());

        let snapshot = counter.snapshot();
        assert_eq!(totals(&snapshot[0]), [(DispatchType::Immediate, 0), (DispatchType::Deferred, 2)]);
        assert_eq!(totals(&snapshot[1]), [(DispatchType::Immediate, 1), (DispatchType::Deferred, 0)]);

        source.shutdown();
        assert!(values.listener_queue(DispatchType::Deferred).is_empty());
    }
}
