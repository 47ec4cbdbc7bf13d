//! Concrete adapters for the domain ports.

pub mod gateway_client;
pub mod oracle_client;
pub mod twilio_client;
