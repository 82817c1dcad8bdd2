//! Library crate for hostwatch-rs: security scan life cycle, result
//! normalization and host health polling for the monitoring console.
pub mod config;
pub mod controller;
pub mod error;
pub mod health;
pub mod history;
pub mod normalize;
pub mod quick;
pub mod server;
pub mod service;
pub mod severity;
pub mod types;
