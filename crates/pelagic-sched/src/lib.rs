//! Single-threaded cooperative scheduler.
//!
//! Every "wait" in the system -- for a delay, an interrupt, a peer's
//! response -- is expressed as posting a deferred continuation; a task runs
//! to completion and never blocks. State machines re-post their own tick
//! with a computed delay, and an asynchronous completion cancels its own
//! timeout task before handling the result.
//!
//! Time is a virtual monotonic millisecond counter owned by the scheduler.
//! On hardware it is driven by the tick interrupt; in tests,
//! [`Scheduler::run_for`] and [`Scheduler::run_until_idle`] advance it
//! deterministically, which makes every driver state machine replayable.

pub mod scheduler;

pub use scheduler::{Scheduler, TaskHandle};
