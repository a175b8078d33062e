//! Shared core for the drawbridge services: configuration, domain model,
//! domain errors, and telemetry initialisation.

pub mod config;
pub mod error;
pub mod models;
pub mod telemetry;

pub use error::TaskError;
pub use models::{Task, TaskStatus};
