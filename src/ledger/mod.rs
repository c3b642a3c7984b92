//! Ledger transport layer
//!
//! Wire message shapes plus the two transports the pipeline needs: the
//! streaming subscription feed (see `monitor`) and the request/response
//! client behind the [`rpc::LedgerRpc`] port.

pub mod rpc;
pub mod types;

pub use rpc::{LedgerRpc, WsRpcClient};
pub use types::{Amount, StreamFrame};
