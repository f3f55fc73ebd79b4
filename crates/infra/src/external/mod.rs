//! Adapters for the remote ledger service.

pub mod jsonrpc;

pub use jsonrpc::JsonRpcLedger;
