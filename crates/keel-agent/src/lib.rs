//! Container entrypoint supervisor.
//!
//! [`Supervisor`] runs one service process behind a health probe, restarts it
//! when it crashes and shuts it down gracefully on container stop.

pub mod config;
pub mod error;
pub mod health;
pub mod launcher;
pub mod signals;
pub mod status_file;
pub mod supervisor;

#[cfg(test)]
mod testing;

pub use config::{ServiceFile, ServiceSpec};
pub use error::SupervisorError;
pub use health::{HealthError, HealthProbe, HttpProbe};
pub use launcher::{ChildHandle, Launched, Launcher, OsLauncher};
pub use signals::Signal;
pub use supervisor::{StopReason, Supervisor, SupervisorOutcome, Transition};
