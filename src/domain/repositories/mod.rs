//! Ports to the world outside the control plane.
//!
//! The broker session, notification channel, oracles and the persistence
//! repository are traits here; concrete adapters live in `infrastructure`
//! and `persistence`.

pub mod broker_client;
pub mod notification;
pub mod oracles;
pub mod trade_store;
