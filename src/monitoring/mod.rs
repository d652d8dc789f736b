//! Monitoring Module
//!
//! Structured logging bootstrap for services embedding the coordinator.

pub mod logging;

pub use logging::{init_logging, LogConfig, LogFormat};
