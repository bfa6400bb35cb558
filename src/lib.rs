//! Per-customer tool-provider orchestrator.
//!
//! Keeps the integration workers (metrics, alerting, telephony tool
//! servers) of a bounded set of customers running, health-checked and
//! reachable, and reports per integration what a customer switch produced.

pub mod api;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod error;
pub mod integration;
pub mod orchestrator;
pub mod testing;

pub use config::Config;
pub use error::{ConfigError, Error, Result};
