//! Process supervision and output streaming.
//!
//! Covers the task registry, worker process handles, output capture and
//! fan-out, and the per-task supervision state machine.

pub mod broker;
pub mod codec;
pub mod process;
pub mod reader;
pub mod registry;
pub mod supervisor;

pub use broker::{OutputBroker, Subscription};
pub use registry::TaskRegistry;
pub use supervisor::{LaunchMode, RunOutput, Supervisor, TrackedStatus};
