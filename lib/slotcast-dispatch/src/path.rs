use std::{
    fmt,
    hash::{BuildHasher as _, Hash, Hasher},
    str::FromStr,
    sync::Arc,
};

use foldhash::quality::FixedState;
use snafu::{ensure, OptionExt as _, Snafu};

use crate::{DispatchSelector, DispatchType};

// Fixed so that identifiers hash identically across runs, which keeps flow traces and metric tags comparable.
const ID_HASH_SEED: u64 = 0x5107_ca57_d15b_a7c4;

const SEGMENT_SEPARATOR: char = '.';
const WILDCARD: &str = "*";

/// A path error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum PathError {
    /// The path did not have two or three segments.
    #[snafu(display(
        "Path '{}' has {} segment(s); expected 'source.slot' or 'source.slot.channel'.",
        path,
        segments
    ))]
    SegmentCount {
        /// The path that failed to parse.
        path: String,

        /// Number of segments found.
        segments: usize,
    },

    /// A segment of the path was empty.
    #[snafu(display("Path '{}' contains an empty segment.", path))]
    EmptySegment {
        /// The path that failed to parse.
        path: String,
    },

    /// The channel segment did not name a known channel.
    #[snafu(display("Unknown dispatch channel '{}' in path '{}'.", channel, path))]
    UnknownChannel {
        /// The path that failed to parse.
        path: String,

        /// The unrecognized channel name.
        channel: String,
    },
}

/// A name paired with its precomputed hash.
///
/// Comparisons check the hash first, so mismatches are almost always decided without touching the name itself.
#[derive(Clone)]
pub struct HashedId {
    hash: u64,
    name: Arc<str>,
}

impl HashedId {
    /// Creates a new `HashedId` from the given name.
    pub fn new<S>(name: S) -> Self
    where
        S: Into<Arc<str>>,
    {
        let name = name.into();
        let hash = FixedState::with_seed(ID_HASH_SEED).hash_one(&*name);
        Self { hash, name }
    }

    /// Returns the precomputed hash.
    pub fn hash_value(&self) -> u64 {
        self.hash
    }

    /// Returns the name.
    pub fn as_str(&self) -> &str {
        &self.name
    }
}

impl PartialEq for HashedId {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.name == other.name
    }
}

impl Eq for HashedId {}

impl Hash for HashedId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl fmt::Debug for HashedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}#{:016x}", self.name, self.hash)
    }
}

impl fmt::Display for HashedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl From<&str> for HashedId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for HashedId {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

/// A hashed address of a slot sender and one or all of its channels.
///
/// Paths let routers refer to a sender symbolically (`source.slot.channel`) instead of holding a reference to it.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct HashedPath {
    source: HashedId,
    slot: HashedId,
    dispatch: DispatchSelector,
}

impl HashedPath {
    /// Creates a new `HashedPath`.
    pub fn new<S, T, D>(source: S, slot: T, dispatch: D) -> Self
    where
        S: Into<HashedId>,
        T: Into<HashedId>,
        D: Into<DispatchSelector>,
    {
        Self {
            source: source.into(),
            slot: slot.into(),
            dispatch: dispatch.into(),
        }
    }

    /// Parses a path in the form of `source.slot` or `source.slot.channel`.
    ///
    /// Leaving out the channel, or using `*` as the channel, selects every channel.
    ///
    /// # Errors
    ///
    /// If the path does not have two or three non-empty segments, or the channel segment is neither `*` nor a known
    /// channel name, an error is returned.
    pub fn parse(path: &str) -> Result<Self, PathError> {
        let segments = path.split(SEGMENT_SEPARATOR).collect::<Vec<_>>();
        ensure!(
            (2..=3).contains(&segments.len()),
            SegmentCount {
                path,
                segments: segments.len()
            }
        );
        ensure!(segments.iter().all(|segment| !segment.is_empty()), EmptySegment { path });

        let dispatch = match segments.get(2) {
            None => DispatchSelector::Any,
            Some(&WILDCARD) => DispatchSelector::Any,
            Some(channel) => DispatchType::from_name(channel)
                .map(DispatchSelector::Only)
                .context(UnknownChannel { path, channel: *channel })?,
        };

        Ok(Self::new(segments[0], segments[1], dispatch))
    }

    /// Returns the identifier of the addressed source.
    pub fn source(&self) -> &HashedId {
        &self.source
    }

    /// Returns the identifier of the addressed slot sender.
    pub fn slot(&self) -> &HashedId {
        &self.slot
    }

    /// Returns the channel selector.
    pub fn dispatch(&self) -> DispatchSelector {
        self.dispatch
    }
}

impl FromStr for HashedPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for HashedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.source, self.slot, self.dispatch)
    }
}
