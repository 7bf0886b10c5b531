#[cfg(feature = "portable-atomic")]
pub(crate) use portable_atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
#[cfg(not(feature = "portable-atomic"))]
pub(crate) use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
