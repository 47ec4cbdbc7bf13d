pub mod execution_gateway;
pub mod trade_dispatcher;
