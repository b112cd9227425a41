use std::fmt;

/// Number of notification channels.
pub const NUM_DISPATCH_TYPES: usize = 2;

/// A notification channel.
///
/// Every channel carries its own pending state and its own set of listeners, so a change reported on one channel is
/// never observed when flushing another.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum DispatchType {
    /// Changes meant to be delivered as soon as the consumer can get to them.
    Immediate,

    /// Changes meant to be batched up and delivered on the consumer's own cadence.
    #[default]
    Deferred,
}

impl DispatchType {
    /// All channels, in ordinal order.
    pub const ALL: [DispatchType; NUM_DISPATCH_TYPES] = [DispatchType::Immediate, DispatchType::Deferred];

    /// Returns the ordinal of this channel.
    ///
    /// Ordinals are dense, start at zero, and never change.
    #[inline]
    pub const fn ordinal(self) -> usize {
        match self {
            DispatchType::Immediate => 0,
            DispatchType::Deferred => 1,
        }
    }

    /// Returns the channel name as a static string.
    pub const fn as_str(self) -> &'static str {
        match self {
            DispatchType::Immediate => "immediate",
            DispatchType::Deferred => "deferred",
        }
    }

    /// Parses a channel name, ignoring ASCII case.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|ty| ty.as_str().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for DispatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Selects one or all notification channels.
///
/// Only used for addressing: pending state always lives on a concrete [`DispatchType`].
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum DispatchSelector {
    /// Matches any channel.
    #[default]
    Any,

    /// Matches a single channel.
    Only(DispatchType),
}

impl DispatchSelector {
    /// Returns `true` if this is the wildcard selector.
    pub const fn is_wildcard(&self) -> bool {
        matches!(self, DispatchSelector::Any)
    }
}

impl From<DispatchType> for DispatchSelector {
    fn from(ty: DispatchType) -> Self {
        DispatchSelector::Only(ty)
    }
}

impl fmt::Display for DispatchSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchSelector::Any => f.write_str("*"),
            DispatchSelector::Only(ty) => ty.fmt(f),
        }
    }
}

/// Holds one value per notification channel.
///
/// Backed by a fixed-size array indexed by [`DispatchType::ordinal`], so lookups never hash and never allocate.
#[derive(Clone, Debug, Default)]
pub struct DispatchTypeContainer<T> {
    values: [T; NUM_DISPATCH_TYPES],
}

impl<T> DispatchTypeContainer<T> {
    /// Creates a container by calling `f` once for every channel, in ordinal order.
    pub fn from_fn<F>(mut f: F) -> Self
    where
        F: FnMut(DispatchType) -> T,
    {
        Self {
            values: DispatchType::ALL.map(&mut f),
        }
    }

    /// Gets a reference to the value for the given channel.
    #[inline]
    pub fn get(&self, ty: DispatchType) -> &T {
        &self.values[ty.ordinal()]
    }

    /// Gets a mutable reference to the value for the given channel.
    #[inline]
    pub fn get_mut(&mut self, ty: DispatchType) -> &mut T {
        &mut self.values[ty.ordinal()]
    }

    /// Calls `f` on the value of every channel.
    pub fn for_each<F>(&self, f: F)
    where
        F: FnMut(&T),
    {
        self.values.iter().for_each(f);
    }

    /// Calls `f` on a mutable reference to the value of every channel.
    pub fn for_each_mut<F>(&mut self, f: F)
    where
        F: FnMut(&mut T),
    {
        self.values.iter_mut().for_each(f);
    }

    /// Returns an iterator over every channel and its value, in ordinal order.
    pub fn iter(&self) -> impl Iterator<Item = (DispatchType, &T)> {
        DispatchType::ALL.into_iter().zip(self.values.iter())
    }
}
