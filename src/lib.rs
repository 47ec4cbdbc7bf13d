//! Tradegate trade approval and execution control plane
//!
//! Forecast-driven trade candidates pass a safety gate and a reasoning step,
//! then either execute directly or wait for an SMS approval before the order
//! reaches the brokerage gateway.

pub mod application;
pub mod auth;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod persistence;
pub mod rate_limit;
pub mod secrets;
pub mod task_runner;
