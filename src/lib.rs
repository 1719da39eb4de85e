#![forbid(unsafe_code)]

//! `autorun`: supervision of long-running worker scripts.
//!
//! A [`orchestrator::Supervisor`] enforces one live run per task type,
//! tracks runs across controller restarts through a
//! [`persistence::StateStore`], and fans worker output out to log files
//! and live subscribers. The `autorun` CLI and the `autorun-server` HTTP
//! front-end are thin layers over it.

pub mod config;
pub mod errors;
pub mod http;
pub mod journal;
pub mod logging;
pub mod models;
pub mod orchestrator;
pub mod persistence;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
