//! Domain model module declarations.

pub mod output;
pub mod task;
