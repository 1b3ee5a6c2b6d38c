//! JSON-RPC Protocol
//!
//! Request/response/error types and the stdio transport.

pub mod stdio;
pub mod types;
