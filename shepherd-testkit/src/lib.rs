//! Test doubles for shepherd workers.
//!
//! - [`InMemoryWorkQueue`] - visibility-timeout queue that counts acks
//! - [`ScriptedProcessor`] - processor with canned results and a call log
//! - [`ManualClock`] - clock that only moves when told to
//! - [`FaultyObjectStore`] - object store that fails chosen operations
//! - fixtures for stores, records and worker contexts

mod clock;
mod faults;
mod fixtures;
mod mock;
mod queue;

pub use clock::ManualClock;
pub use faults::FaultyObjectStore;
pub use fixtures::*;
pub use mock::{ProcessCall, ScriptedProcessor};
pub use queue::InMemoryWorkQueue;
