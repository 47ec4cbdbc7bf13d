pub mod approval_broker;
pub mod pipeline;
pub mod safety_gate;
