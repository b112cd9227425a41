//! Slot change notification.
//!
//! `slotcast-dispatch` lets a source owning a group of slots tell interested listeners which of its slots changed,
//! without the source ever blocking or allocating. Sources mark slots as dirty through a [`SlotSender`], on one of
//! several notification channels ([`DispatchType`]), and consumers periodically flush each channel, delivering every
//! slot marked since the previous flush to the channel's listeners as a single, ordered [`SlotSet`].
//!
//! Listeners implement [`SlotListener`] (or provide a callback) and register with the [`ListenerQueue`] of a channel.
//! Registrations never keep a listener alive.
#![deny(warnings)]
#![deny(missing_docs)]

mod bitmap;
pub use self::bitmap::{MarkOutcome, SlotBitmap, INLINE_SLOTS};

mod channel;
pub use self::channel::{DispatchSelector, DispatchType, DispatchTypeContainer, NUM_DISPATCH_TYPES};

pub mod flow;

mod path;
pub use self::path::{HashedId, HashedPath, PathError};

mod queue;
pub use self::queue::{ListenerQueue, NotifyReport, RegistrationId, SlotChange, SlotListener};

mod root;
pub use self::root::{DispatchRoot, FlowId};

mod sender;
pub use self::sender::SlotSender;

mod slot_set;
pub use self::slot_set::{Iter as SlotSetIter, SlotSet};

mod sync;
mod telemetry;

/// A type-erased error.
pub type GenericError = anyhow::Error;
