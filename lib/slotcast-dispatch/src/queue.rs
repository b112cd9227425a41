use std::{
    any::Any,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering::Relaxed},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
};

use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::{DispatchType, GenericError, HashedId, SlotSet};

/// A batch of slot changes, as delivered to listeners.
#[derive(Clone, Copy, Debug)]
pub struct SlotChange<'a> {
    sender_index: u8,
    sender_id: &'a HashedId,
    channel: DispatchType,
    slots: &'a SlotSet,
}

impl<'a> SlotChange<'a> {
    /// Creates a new `SlotChange`.
    pub fn new(sender_index: u8, sender_id: &'a HashedId, channel: DispatchType, slots: &'a SlotSet) -> Self {
        Self {
            sender_index,
            sender_id,
            channel,
            slots,
        }
    }

    /// Returns the index of the sender within its source.
    pub fn sender_index(&self) -> u8 {
        self.sender_index
    }

    /// Returns the identifier of the sender.
    pub fn sender_id(&self) -> &'a HashedId {
        self.sender_id
    }

    /// Returns the channel that was flushed.
    pub fn channel(&self) -> DispatchType {
        self.channel
    }

    /// Returns the slots that changed since the previous flush of the channel.
    pub fn slots(&self) -> &'a SlotSet {
        self.slots
    }
}

/// An observer of slot changes.
pub trait SlotListener: Send + Sync {
    /// Called with every batch of slot changes delivered to this listener.
    ///
    /// # Errors
    ///
    /// Errors are logged and counted by the queue, and do not prevent other listeners from being notified.
    fn slots_changed(&self, change: &SlotChange<'_>) -> Result<(), GenericError>;
}

/// Identifier of a single registration in a [`ListenerQueue`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct RegistrationId(u64);

/// Outcome of notifying every listener in a queue.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct NotifyReport {
    delivered: usize,
    failed: usize,
    expired: usize,
}

impl NotifyReport {
    /// Number of listeners that handled the change successfully.
    pub fn delivered(&self) -> usize {
        self.delivered
    }

    /// Number of listeners that returned an error or panicked.
    pub fn failed(&self) -> usize {
        self.failed
    }

    /// Number of registrations skipped because their listener no longer exists.
    pub fn expired(&self) -> usize {
        self.expired
    }
}

trait Registration: Send + Sync {
    fn target(&self) -> *const ();

    fn is_alive(&self) -> bool;

    /// Returns `None` if the listener no longer exists.
    fn invoke(&self, change: &SlotChange<'_>) -> Option<Result<(), GenericError>>;
}

struct CallbackRegistration<L: ?Sized, F> {
    listener: Weak<L>,
    callback: F,
}

impl<L, F> Registration for CallbackRegistration<L, F>
where
    L: ?Sized + Send + Sync,
    F: Fn(&L, &SlotChange<'_>) -> Result<(), GenericError> + Send + Sync,
{
    fn target(&self) -> *const () {
        self.listener.as_ptr().cast()
    }

    fn is_alive(&self) -> bool {
        self.listener.strong_count() > 0
    }

    fn invoke(&self, change: &SlotChange<'_>) -> Option<Result<(), GenericError>> {
        let listener = self.listener.upgrade()?;
        Some((self.callback)(&listener, change))
    }
}

struct Entry {
    id: RegistrationId,
    registration: Arc<dyn Registration>,
}

/// An ordered registry of listeners for a single channel.
///
/// Registrations only hold weak references to their listener: the queue never keeps a listener alive, and a listener
/// that was dropped without deregistering is skipped (and pruned) the next time the queue is notified. Listeners should
/// still remove themselves before being dropped.
///
/// Mutation and notification are serialized by a lock which is never held while listener callbacks run, so callbacks
/// may freely add or remove registrations, with the change taking effect from the next notification onwards.
#[derive(Default)]
pub struct ListenerQueue {
    entries: Mutex<Vec<Entry>>,
    next_id: AtomicU64,
}

impl ListenerQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, Vec<Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a listener.
    ///
    /// Listeners are notified in the order they were registered.
    pub fn add<L>(&self, listener: &Arc<L>) -> RegistrationId
    where
        L: ?Sized + SlotListener + 'static,
    {
        self.add_with(listener, |listener: &L, change| listener.slots_changed(change))
    }

    /// Registers a callback bound to the given listener object.
    ///
    /// The callback is invoked with the listener for as long as the listener exists.
    pub fn add_with<L, F>(&self, listener: &Arc<L>, callback: F) -> RegistrationId
    where
        L: ?Sized + Send + Sync + 'static,
        F: Fn(&L, &SlotChange<'_>) -> Result<(), GenericError> + Send + Sync + 'static,
    {
        let id = RegistrationId(self.next_id.fetch_add(1, Relaxed));
        let registration = Arc::new(CallbackRegistration {
            listener: Arc::downgrade(listener),
            callback,
        });

        self.entries().push(Entry { id, registration });
        id
    }

    /// Removes every registration for the given listener, returning how many were removed.
    ///
    /// Removing a listener that is not registered does nothing.
    pub fn remove<L>(&self, listener: &Arc<L>) -> usize
    where
        L: ?Sized,
    {
        let target = Arc::as_ptr(listener).cast::<()>();

        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|entry| entry.registration.target() != target);
        before - entries.len()
    }

    /// Removes a single registration, returning `true` if it was present.
    pub fn remove_registration(&self, id: RegistrationId) -> bool {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        before != entries.len()
    }

    /// Removes every registration.
    pub fn clear(&self) {
        self.entries().clear();
    }

    /// Returns the number of registrations.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Returns `true` if there are no registrations.
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Notifies every live listener of the given change, in registration order.
    ///
    /// A listener returning an error, or panicking, is logged and counted as failed, and the remaining listeners are
    /// still notified.
    pub fn notify_all(&self, change: &SlotChange<'_>) -> NotifyReport {
        let mut report = NotifyReport::default();

        let registrations = {
            let mut entries = self.entries();
            let before = entries.len();
            entries.retain(|entry| entry.registration.is_alive());
            report.expired = before - entries.len();

            entries
                .iter()
                .map(|entry| Arc::clone(&entry.registration))
                .collect::<SmallVec<[Arc<dyn Registration>; 4]>>()
        };

        if report.expired > 0 {
            debug!(
                sender_id = %change.sender_id(),
                channel = change.channel().as_str(),
                expired = report.expired,
                "Pruned registrations of dropped listeners."
            );
        }

        for registration in registrations {
            match catch_unwind(AssertUnwindSafe(|| registration.invoke(change))) {
                Ok(Some(Ok(()))) => report.delivered += 1,
                Ok(Some(Err(e))) => {
                    report.failed += 1;
                    warn!(
                        sender_id = %change.sender_id(),
                        channel = change.channel().as_str(),
                        error = %e,
                        "Listener failed to handle slot changes."
                    );
                }
                Ok(None) => report.expired += 1,
                Err(payload) => {
                    report.failed += 1;
                    warn!(
                        sender_id = %change.sender_id(),
                        channel = change.channel().as_str(),
                        panic = panic_message(&*payload),
                        "Listener panicked while handling slot changes."
                    );
                }
            }
        }

        report
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "<non-string panic payload>"
    }
}
