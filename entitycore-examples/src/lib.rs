//! Reference domain for `EntityCore`
//!
//! A test aggregate that holds and exchanges tests, and a transfer saga that
//! moves a test from one aggregate to another and arms two timeouts. Both are
//! wired together in [`system::TestSystem`] for the end-to-end tests.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// The test aggregate: commands, events, state and snapshot.
pub mod test_aggregate;

/// The transfer saga started by `TestSent`.
pub mod test_saga;

/// In-memory wiring of the aggregate host, saga host and saga manager.
pub mod system;
