use std::fmt;

use tracing::{debug, error, trace, warn};

use crate::{
    flow::{FlowManager, FlowSink as _},
    telemetry::ChannelTelemetry,
    DispatchRoot, DispatchSelector, DispatchType, DispatchTypeContainer, HashedId, HashedPath, ListenerQueue,
    MarkOutcome, SlotBitmap, SlotChange,
};

/// A change notifier for a group of slots owned by a source.
///
/// Sources call [`send_change_message`][Self::send_change_message] whenever one of their slots changes, which only
/// marks the slot as dirty for the given channel. Consumers call [`flush`][Self::flush] on their own schedule, which
/// delivers every slot marked since the previous flush to the listeners of that channel, as a single batch.
///
/// Sending change messages never blocks and never allocates, so it can be done from real-time threads, concurrently
/// with flushing from another thread. The number of slots must be configured with
/// [`set_num_slots`][Self::set_num_slots] before the sender is shared.
pub struct SlotSender {
    index: u8,
    id: HashedId,
    source_id: HashedId,
    num_slots: u8,
    bitmaps: DispatchTypeContainer<SlotBitmap>,
    queues: DispatchTypeContainer<ListenerQueue>,
    telemetry: DispatchTypeContainer<ChannelTelemetry>,
    flow: FlowManager,
}

impl SlotSender {
    /// Creates a new `SlotSender` with no slots.
    ///
    /// `index` is the position of the sender within its source, and is passed along to listeners with every batch.
    pub fn new<S, I>(root: &DispatchRoot, source_id: S, index: u8, id: I) -> Self
    where
        S: Into<HashedId>,
        I: Into<HashedId>,
    {
        let source_id = source_id.into();
        let id = id.into();

        let telemetry = DispatchTypeContainer::from_fn(|channel| ChannelTelemetry::new(&id, channel));
        let flow = FlowManager::for_sender(root, &source_id, &id);

        Self {
            index,
            id,
            source_id,
            num_slots: 0,
            bitmaps: DispatchTypeContainer::default(),
            queues: DispatchTypeContainer::default(),
            telemetry,
            flow,
        }
    }

    /// Returns the index of this sender within its source.
    pub fn index(&self) -> u8 {
        self.index
    }

    /// Returns the identifier of this sender.
    pub fn id(&self) -> &HashedId {
        &self.id
    }

    /// Returns the identifier of the source owning this sender.
    pub fn source_id(&self) -> &HashedId {
        &self.source_id
    }

    /// Returns the number of slots.
    pub fn num_slots(&self) -> u8 {
        self.num_slots
    }

    /// Sets the number of slots for every channel.
    ///
    /// Pending changes for slots that are still addressable are kept, and pending changes for slots beyond the new
    /// count are dropped.
    pub fn set_num_slots(&mut self, num_slots: u8) {
        if num_slots == self.num_slots {
            return;
        }

        self.bitmaps.for_each_mut(|bitmap| bitmap.resize(usize::from(num_slots)));

        debug!(
            sender_id = %self.id,
            previous = self.num_slots,
            num_slots,
            "Resized slot sender."
        );
        self.num_slots = num_slots;
    }

    /// Marks the given slot as changed on the given channel.
    ///
    /// Returns `true` if the slot was not already pending on that channel.
    ///
    /// An out-of-range slot is a caller bug, but it is never fatal: in debug and release builds alike, nothing is
    /// marked, the rejection is logged at error level, and `false` is returned.
    pub fn send_change_message(&self, slot_index: u8, channel: DispatchType) -> bool {
        match self.bitmaps.get(channel).mark(usize::from(slot_index)) {
            MarkOutcome::Marked => {
                self.flow.open_flow(channel, slot_index);
                true
            }
            MarkOutcome::AlreadyPending => {
                self.flow.open_flow(channel, slot_index);
                false
            }
            MarkOutcome::OutOfRange => {
                error!(
                    sender_id = %self.id,
                    channel = channel.as_str(),
                    slot_index,
                    num_slots = self.num_slots,
                    "Change message sent for out-of-range slot."
                );
                false
            }
        }
    }

    /// Returns `true` if any slot is pending on the given channel.
    pub fn has_pending(&self, channel: DispatchType) -> bool {
        self.bitmaps.get(channel).any_set()
    }

    /// Delivers every slot changed since the previous flush of the given channel to its listeners.
    ///
    /// Returns `false`, without notifying anyone, if no slot is pending.
    pub fn flush(&self, channel: DispatchType) -> bool {
        let bitmap = self.bitmaps.get(channel);
        if !bitmap.any_set() {
            self.flow.close_flow(channel);
            return false;
        }

        let slots = bitmap.consume_and_clear();
        let flow_id = self.flow.close_flow(channel);

        // A concurrent shutdown can drain the bitmap between our check and our drain.
        if slots.is_empty() {
            return false;
        }

        let change = SlotChange::new(self.index, &self.id, channel, &slots);
        let report = self.queues.get(channel).notify_all(&change);
        self.telemetry.get(channel).record_flush(slots.len(), &report);

        trace!(
            sender_id = %self.id,
            channel = channel.as_str(),
            slots = slots.len(),
            delivered = report.delivered(),
            failed = report.failed(),
            flow_id = flow_id.map(|id| id.get()),
            "Flushed slot changes."
        );

        true
    }

    /// Flushes every channel, in ordinal order.
    ///
    /// Returns `true` if any channel had pending slots.
    pub fn flush_all(&self) -> bool {
        DispatchType::ALL
            .into_iter()
            .fold(false, |flushed, channel| self.flush(channel) | flushed)
    }

    /// Returns `true` if the given path addresses this sender.
    ///
    /// Only paths selecting every channel are matched: matching a path to a single channel is not supported, and always
    /// returns `false`.
    pub fn matches_path(&self, path: &HashedPath) -> bool {
        if self.num_slots == 0 {
            debug!(sender_id = %self.id, %path, "Matching path against unconfigured slot sender.");
            return false;
        }

        match path.dispatch() {
            DispatchSelector::Any => path.slot() == &self.id,
            DispatchSelector::Only(channel) => {
                warn!(
                    sender_id = %self.id,
                    %path,
                    channel = channel.as_str(),
                    "Matching paths to a single channel is not supported."
                );
                false
            }
        }
    }

    /// Drops every pending change and every listener, on all channels.
    ///
    /// Pending changes are discarded without notifying listeners. Calling this more than once has no further effect.
    pub fn shutdown(&self) {
        for (channel, bitmap) in self.bitmaps.iter() {
            bitmap.clear();
            self.flow.close_flow(channel);
        }

        self.queues.for_each(ListenerQueue::clear);

        debug!(sender_id = %self.id, source_id = %self.source_id, "Shut down slot sender.");
    }

    /// Returns the listener queue for the given channel.
    pub fn listener_queue(&self, channel: DispatchType) -> &ListenerQueue {
        self.queues.get(channel)
    }
}

impl fmt::Debug for SlotSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotSender")
            .field("index", &self.index)
            .field("id", &self.id)
            .field("source_id", &self.source_id)
            .field("num_slots", &self.num_slots)
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use std::{
        collections::BTreeSet,
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering::SeqCst},
            Arc, Mutex,
        },
        thread,
    };

    use anyhow::anyhow;
    use metrics::{SharedString, Unit};
    use metrics_util::{
        debugging::{DebugValue, DebuggingRecorder},
        CompositeKey,
    };
    use proptest::prelude::*;

    use super::*;
    use crate::{telemetry, GenericError, SlotListener};

    struct RecordingListener {
        name: &'static str,
        batches: Mutex<Vec<(&'static str, DispatchType, Vec<usize>)>>,
    }

    impl RecordingListener {
        fn named(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                batches: Mutex::new(Vec::new()),
            })
        }

        fn slots(&self) -> Vec<Vec<usize>> {
            self.batches.lock().unwrap().iter().map(|(_, _, slots)| slots.clone()).collect()
        }
    }

    impl SlotListener for RecordingListener {
        fn slots_changed(&self, change: &SlotChange<'_>) -> Result<(), GenericError> {
            self.batches
                .lock()
                .unwrap()
                .push((self.name, change.channel(), change.slots().iter().collect()));
            Ok(())
        }
    }

    fn sender_with_slots(num_slots: u8) -> SlotSender {
        let mut sender = SlotSender::new(&DispatchRoot::new(), "source", 0, "sender");
        sender.set_num_slots(num_slots);
        sender
    }

    type MetricSnapshot = [(CompositeKey, Option<Unit>, Option<SharedString>, DebugValue)];

    fn find_metric<'a>(metrics: &'a MetricSnapshot, name: &str, channel: DispatchType) -> &'a DebugValue {
        metrics
            .iter()
            .find(|(k, _, _, _)| {
                k.key().name() == name
                    && k.key()
                        .labels()
                        .any(|label| label.key() == "channel" && label.value() == channel.as_str())
            })
            .map(|(_, _, _, value)| value)
            .unwrap_or_else(|| panic!("no metric found with name: {}", name))
    }

    fn get_counter_value(metrics: &MetricSnapshot, name: &str, channel: DispatchType) -> u64 {
        match find_metric(metrics, name, channel) {
            DebugValue::Counter(value) => *value,
            other => panic!("expected a counter, got: {:?}", other),
        }
    }

    fn get_histogram_values(metrics: &MetricSnapshot, name: &str, channel: DispatchType) -> Vec<f64> {
        match find_metric(metrics, name, channel) {
            DebugValue::Histogram(values) => values.iter().map(|value| value.into_inner()).collect(),
            other => panic!("expected a histogram, got: {:?}", other),
        }
    }

    #[test]
    fn coalesces_and_delivers_in_order() {
        let sender = sender_with_slots(4);
        let order = Arc::new(Mutex::new(Vec::new()));
        let first = RecordingListener::named("first");
        let second = RecordingListener::named("second");

        let queue = sender.listener_queue(DispatchType::Deferred);
        for listener in [&first, &second] {
            let order = Arc::clone(&order);
            queue.add_with(listener, move |listener: &RecordingListener, change| {
                order.lock().unwrap().push(listener.name);
                listener.slots_changed(change)
            });
        }

        assert!(sender.send_change_message(1, DispatchType::Deferred));
        assert!(sender.send_change_message(3, DispatchType::Deferred));
        assert!(!sender.send_change_message(1, DispatchType::Deferred));

        assert!(sender.flush(DispatchType::Deferred));
        assert_eq!(first.slots(), vec![vec![1, 3]]);
        assert_eq!(second.slots(), vec![vec![1, 3]]);
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);

        assert!(!sender.flush(DispatchType::Deferred));
        assert_eq!(first.slots().len(), 1);
    }

    #[test]
    fn empty_flush_notifies_nobody() {
        let sender = sender_with_slots(4);
        let listener = RecordingListener::named("listener");
        sender.listener_queue(DispatchType::Immediate).add(&listener);

        assert!(!sender.has_pending(DispatchType::Immediate));
        assert!(!sender.flush(DispatchType::Immediate));
        assert!(!sender.flush_all());
        assert!(listener.slots().is_empty());
    }

    #[test]
    fn channels_are_independent() {
        let sender = sender_with_slots(8);
        let immediate = RecordingListener::named("immediate");
        let deferred = RecordingListener::named("deferred");
        sender.listener_queue(DispatchType::Immediate).add(&immediate);
        sender.listener_queue(DispatchType::Deferred).add(&deferred);

        sender.send_change_message(2, DispatchType::Immediate);
        sender.send_change_message(5, DispatchType::Deferred);

        assert!(sender.flush(DispatchType::Immediate));
        assert_eq!(immediate.slots(), vec![vec![2]]);
        assert!(deferred.slots().is_empty());
        assert!(sender.has_pending(DispatchType::Deferred));

        assert!(sender.flush_all());
        assert_eq!(deferred.slots(), vec![vec![5]]);
        assert_eq!(immediate.slots().len(), 1);
    }

    #[test]
    fn default_channel_is_deferred() {
        let sender = sender_with_slots(1);
        sender.send_change_message(0, DispatchType::default());
        assert!(sender.has_pending(DispatchType::Deferred));
        assert!(!sender.has_pending(DispatchType::Immediate));
    }

    #[test]
    fn out_of_range_is_rejected() {
        let unconfigured = sender_with_slots(0);
        assert!(!unconfigured.send_change_message(0, DispatchType::Deferred));

        let sender = sender_with_slots(4);
        assert!(!sender.send_change_message(4, DispatchType::Deferred));
        assert!(!sender.send_change_message(u8::MAX, DispatchType::Immediate));
        assert!(!sender.flush_all());
    }

    #[test]
    fn resize_drops_tail() {
        let mut sender = sender_with_slots(8);
        sender.send_change_message(2, DispatchType::Deferred);
        sender.send_change_message(6, DispatchType::Deferred);

        sender.set_num_slots(4);
        assert_eq!(sender.num_slots(), 4);
        assert!(!sender.send_change_message(6, DispatchType::Deferred));

        sender.set_num_slots(8);
        let listener = RecordingListener::named("listener");
        sender.listener_queue(DispatchType::Deferred).add(&listener);

        assert!(sender.flush(DispatchType::Deferred));
        assert_eq!(listener.slots(), vec![vec![2]]);
    }

    #[test]
    fn shrink_from_heap_storage() {
        let mut sender = sender_with_slots(200);
        for slot in [1, 5, 63, 64, 130, 199] {
            sender.send_change_message(slot, DispatchType::Deferred);
        }

        sender.set_num_slots(5);
        assert!(sender.has_pending(DispatchType::Deferred));

        sender.set_num_slots(200);
        let listener = RecordingListener::named("listener");
        sender.listener_queue(DispatchType::Deferred).add(&listener);

        assert!(sender.flush(DispatchType::Deferred));
        assert_eq!(listener.slots(), vec![vec![1]]);
    }

    #[test]
    fn shrink_within_inline_storage() {
        let mut sender = sender_with_slots(100);
        let listener = RecordingListener::named("listener");
        sender.listener_queue(DispatchType::Immediate).add(&listener);
        sender.send_change_message(70, DispatchType::Immediate);

        sender.set_num_slots(10);
        assert!(!sender.has_pending(DispatchType::Immediate));
        assert!(!sender.flush(DispatchType::Immediate));
        assert!(listener.slots().is_empty());

        sender.set_num_slots(100);
        assert!(!sender.flush(DispatchType::Immediate));
        assert!(listener.slots().is_empty());
    }

    #[test]
    fn shrink_to_word_boundary() {
        let mut sender = sender_with_slots(128);
        sender.send_change_message(3, DispatchType::Deferred);
        sender.send_change_message(100, DispatchType::Deferred);

        sender.set_num_slots(64);
        let listener = RecordingListener::named("listener");
        sender.listener_queue(DispatchType::Deferred).add(&listener);

        assert!(sender.flush(DispatchType::Deferred));
        assert_eq!(listener.slots(), vec![vec![3]]);
    }

    #[test]
    fn large_slot_counts() {
        let sender = sender_with_slots(u8::MAX);
        let listener = RecordingListener::named("listener");
        sender.listener_queue(DispatchType::Deferred).add(&listener);

        for slot in [0, 63, 64, 127, 128, 200, 254] {
            assert!(sender.send_change_message(slot, DispatchType::Deferred));
        }

        assert!(sender.flush(DispatchType::Deferred));
        assert_eq!(listener.slots(), vec![vec![0, 63, 64, 127, 128, 200, 254]]);
    }

    #[test]
    fn shutdown_clears_everything() {
        let sender = sender_with_slots(4);
        let listener = RecordingListener::named("listener");
        sender.listener_queue(DispatchType::Immediate).add(&listener);
        sender.listener_queue(DispatchType::Deferred).add(&listener);

        sender.send_change_message(0, DispatchType::Immediate);
        sender.send_change_message(1, DispatchType::Deferred);

        sender.shutdown();
        sender.shutdown();

        assert!(!sender.has_pending(DispatchType::Immediate));
        assert!(!sender.has_pending(DispatchType::Deferred));
        assert!(sender.listener_queue(DispatchType::Immediate).is_empty());
        assert!(sender.listener_queue(DispatchType::Deferred).is_empty());
        assert!(listener.slots().is_empty());

        // Still usable, just without any listeners.
        assert!(sender.send_change_message(0, DispatchType::Deferred));
        assert!(sender.flush(DispatchType::Deferred));
        assert!(listener.slots().is_empty());
    }

    #[test]
    fn path_matching() {
        let sender = sender_with_slots(4);

        assert!(sender.matches_path(&HashedPath::parse("source.sender").unwrap()));
        assert!(sender.matches_path(&HashedPath::parse("elsewhere.sender.*").unwrap()));
        assert!(!sender.matches_path(&HashedPath::parse("source.other").unwrap()));
        assert!(!sender.matches_path(&HashedPath::parse("source.sender.deferred").unwrap()));
        assert!(!sender.matches_path(&HashedPath::parse("source.sender.immediate").unwrap()));

        let unconfigured = sender_with_slots(0);
        assert!(!unconfigured.matches_path(&HashedPath::parse("source.sender").unwrap()));
    }

    #[test]
    fn listener_failures_do_not_stop_delivery() {
        struct FailingListener;

        impl SlotListener for FailingListener {
            fn slots_changed(&self, _: &SlotChange<'_>) -> Result<(), GenericError> {
                Err(anyhow!("not today"))
            }
        }

        let sender = sender_with_slots(4);
        let failing = Arc::new(FailingListener);
        let listener = RecordingListener::named("listener");
        sender.listener_queue(DispatchType::Deferred).add(&failing);
        sender.listener_queue(DispatchType::Deferred).add(&listener);

        sender.send_change_message(3, DispatchType::Deferred);
        assert!(sender.flush(DispatchType::Deferred));
        assert_eq!(listener.slots(), vec![vec![3]]);

        // The failed delivery is not retried.
        assert!(!sender.flush(DispatchType::Deferred));
    }

    #[test]
    fn change_carries_sender_identity() {
        let mut sender = SlotSender::new(&DispatchRoot::new(), "mixer", 3, "gains");
        sender.set_num_slots(2);

        let seen = Arc::new(Mutex::new(None));
        let listener = RecordingListener::named("listener");
        let captured = Arc::clone(&seen);
        sender
            .listener_queue(DispatchType::Immediate)
            .add_with(&listener, move |_: &RecordingListener, change| {
                *captured.lock().unwrap() = Some((change.sender_index(), change.sender_id().clone(), change.channel()));
                Ok(())
            });

        sender.send_change_message(1, DispatchType::Immediate);
        sender.flush(DispatchType::Immediate);

        assert_eq!(
            *seen.lock().unwrap(),
            Some((3, HashedId::new("gains"), DispatchType::Immediate))
        );
        assert_eq!(sender.source_id(), &HashedId::new("mixer"));
        assert_eq!(sender.index(), 3);
    }

    #[test]
    fn flush_telemetry() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        let sender = metrics::with_local_recorder(&recorder, || sender_with_slots(16));

        struct FailingListener;

        impl SlotListener for FailingListener {
            fn slots_changed(&self, _: &SlotChange<'_>) -> Result<(), GenericError> {
                Err(anyhow!("nope"))
            }
        }

        let failing = Arc::new(FailingListener);
        let dropped = RecordingListener::named("dropped");
        sender.listener_queue(DispatchType::Deferred).add(&failing);
        sender.listener_queue(DispatchType::Deferred).add(&dropped);
        drop(dropped);

        for slot in [1, 2, 3] {
            sender.send_change_message(slot, DispatchType::Deferred);
        }
        assert!(sender.flush(DispatchType::Deferred));
        assert!(!sender.flush(DispatchType::Deferred));

        let metrics = snapshotter.snapshot().into_vec();
        assert_eq!(get_counter_value(&metrics, telemetry::FLUSHES, DispatchType::Deferred), 1);
        assert_eq!(get_counter_value(&metrics, telemetry::LISTENER_FAILURES, DispatchType::Deferred), 1);
        assert_eq!(get_counter_value(&metrics, telemetry::LISTENERS_EXPIRED, DispatchType::Deferred), 1);
        assert_eq!(
            get_histogram_values(&metrics, telemetry::FLUSHED_SLOTS, DispatchType::Deferred),
            vec![3.0]
        );
    }

    #[test]
    fn no_changes_lost_across_threads() {
        const NUM_SLOTS: u8 = 64;
        const ROUNDS: usize = 2_000;

        struct CountingListener {
            delivered: AtomicUsize,
        }

        impl SlotListener for CountingListener {
            fn slots_changed(&self, change: &SlotChange<'_>) -> Result<(), GenericError> {
                self.delivered.fetch_add(change.slots().len(), SeqCst);
                Ok(())
            }
        }

        let sender = Arc::new(sender_with_slots(NUM_SLOTS));
        let listener = Arc::new(CountingListener {
            delivered: AtomicUsize::new(0),
        });
        sender.listener_queue(DispatchType::Deferred).add(&listener);

        let done = Arc::new(AtomicBool::new(false));

        let producer = {
            let sender = Arc::clone(&sender);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut marked = 0;
                for round in 0..ROUNDS {
                    let slot = (round * 7 % usize::from(NUM_SLOTS)) as u8;
                    if sender.send_change_message(slot, DispatchType::Deferred) {
                        marked += 1;
                    }
                }
                done.store(true, SeqCst);
                marked
            })
        };

        while !done.load(SeqCst) {
            sender.flush(DispatchType::Deferred);
            thread::yield_now();
        }

        let marked = producer.join().unwrap();
        sender.flush(DispatchType::Deferred);

        assert_eq!(listener.delivered.load(SeqCst), marked);
        assert!(!sender.has_pending(DispatchType::Deferred));
    }

    #[derive(Clone, Debug)]
    enum Op {
        Send(u8, DispatchType),
        Flush(DispatchType),
        SetNumSlots(u8),
    }

    fn arb_channel() -> impl Strategy<Value = DispatchType> {
        prop_oneof![Just(DispatchType::Immediate), Just(DispatchType::Deferred)]
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => (0u8..40, arb_channel()).prop_map(|(slot, channel)| Op::Send(slot, channel)),
            1 => arb_channel().prop_map(Op::Flush),
            1 => (0u8..=200).prop_map(Op::SetNumSlots),
        ]
    }

    proptest! {
        #[test]
        fn property_test_matches_model(num_slots in 1u8..32, ops in proptest::collection::vec(arb_op(), 0..64)) {
            let mut sender = sender_with_slots(num_slots);
            let mut num_slots = num_slots;
            let listener = RecordingListener::named("listener");
            for channel in DispatchType::ALL {
                sender.listener_queue(channel).add(&listener);
            }

            let mut model = DispatchTypeContainer::<BTreeSet<usize>>::default();
            let mut expected = Vec::new();

            for op in ops {
                match op {
                    Op::Send(slot, channel) => {
                        let in_range = slot < num_slots;
                        let fresh = in_range && model.get_mut(channel).insert(usize::from(slot));
                        prop_assert_eq!(sender.send_change_message(slot, channel), fresh);
                    }
                    Op::Flush(channel) => {
                        let pending = std::mem::take(model.get_mut(channel));
                        let flushed = sender.flush(channel);
                        prop_assert_eq!(flushed, !pending.is_empty());
                        if flushed {
                            let batches = listener.batches.lock().unwrap();
                            let (_, _, delivered) = batches.last().expect("flush should deliver a batch");
                            prop_assert!(delivered.iter().all(|slot| *slot < usize::from(num_slots)));
                        }
                        if !pending.is_empty() {
                            expected.push(("listener", channel, pending.into_iter().collect::<Vec<_>>()));
                        }
                    }
                    Op::SetNumSlots(new_num_slots) => {
                        sender.set_num_slots(new_num_slots);
                        num_slots = new_num_slots;
                        for channel in DispatchType::ALL {
                            model.get_mut(channel).retain(|slot| *slot < usize::from(num_slots));
                            prop_assert_eq!(sender.has_pending(channel), !model.get(channel).is_empty());
                        }
                    }
                }
            }

            prop_assert_eq!(&*listener.batches.lock().unwrap(), &expected);
        }
    }
}
