pub mod account_mode;
pub mod confirmation;
pub mod connection_status;
pub mod decision;
pub mod execution;
pub mod trade_request;
