#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Dataflow concurrency primitives: values that are written once and read by anyone who
//! waits for them, and channels built from such values.
//!
//! # Building blocks
//!
//! - [`Cell`] is a single-assignment slot. Readers block, poll, await or register
//!   callbacks; chaining with [`then()`][Cell::then] builds computations that run as
//!   soon as their inputs are bound.
//! - [`Channel`] is an unbounded FIFO that matches each write with the oldest waiting
//!   read. [`SyncChannel`] hands values over without buffering: a write blocks until a
//!   read takes it.
//! - [`SyncCell`] is a cell whose writer and readers meet at a barrier: nobody returns
//!   until the configured number of readers has seen the value.
//! - [`Select`] takes the first available value out of several sources, at random or
//!   by priority. [`create_timeout()`] makes a source that fires after a delay.
//! - [`Broadcast`] and [`SyncBroadcast`] deliver every published value to every
//!   [`Subscription`].
//! - [`LazyCell`] computes its value the first time anyone touches it.
//!
//! # Scheduling
//!
//! Callbacks never run on the thread that registers them. Every operation that runs
//! code later takes an explicit [`Scheduler`], which wraps any [`Executor`]. A
//! thread [`Pool`] is provided as the default executor.
//!
//! ```rust
//! use dataflow::{Cell, Channel, Pool};
//!
//! let pool = Pool::new();
//! let scheduler = pool.scheduler();
//!
//! let input = Cell::new();
//! let answer = input.then(&scheduler, |x: i32| x * 2);
//! input.bind(21);
//! assert_eq!(answer.get().unwrap(), 42);
//!
//! let channel = Channel::new();
//! channel.send("hello");
//! assert_eq!(channel.receive().unwrap(), "hello");
//! ```
//!
//! # Failures
//!
//! Any cell or channel position can hold a [`Failure`] instead of a value. Failures
//! flow through chains and pipelines like values and surface as the `Err` of an
//! [`Outcome`] when read. Panics in callbacks become failures. Misuse of the
//! synchronization protocol, such as binding a cell twice through a checked API, is
//! reported as an [`Error`] at the call site.

mod broadcast;
mod cell;
mod channel;
mod contract;
mod error;
mod lazy;
mod pipeline;
mod pool;
mod rendezvous;
mod scheduler;
mod select;
mod slot;
mod timer;

#[cfg(test)]
mod test_utils;

pub use broadcast::*;
pub use cell::*;
pub use channel::*;
pub use contract::*;
pub use error::*;
pub(crate) use error::{Result, panic_message, run_guarded};
pub use lazy::*;
pub use pool::*;
pub use rendezvous::*;
pub use scheduler::*;
pub use select::*;
