//! cloudigrade - Backend Library
//!
//! Registers customer AWS accounts, discovers their instances and images,
//! inspects image snapshots for RHEL and reports daily usage.

#[macro_use]
mod macros;

pub mod api;
pub mod cli;
pub mod cloud;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod queue;
pub mod services;
pub mod telemetry;

pub use config::Config;
pub use error::{AppError, Result};
