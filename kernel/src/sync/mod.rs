//! Synchronization primitives.
//!
//! The scheduler and the device models use [`SpinLock`], a test-and-set
//! lock that tracks the holding CPU so re-acquisition bugs surface as
//! panics instead of deadlocks. Leaf state that never participates in the
//! lock-order discipline uses `spin::Mutex` directly.

pub mod spinlock;

pub use spinlock::{SpinGuard, SpinLock};
