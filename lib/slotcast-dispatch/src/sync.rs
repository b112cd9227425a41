//! Atomics shared between producer and consumer, swapped for `loom`'s instrumented versions under model checking.

#[cfg(feature = "loom")]
pub(crate) use loom::sync::atomic::AtomicU64;

#[cfg(not(feature = "loom"))]
pub(crate) use std::sync::atomic::AtomicU64;
