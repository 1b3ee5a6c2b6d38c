//! stdio Transport
//!
//! Newline-delimited JSON-RPC over stdin/stdout. Logging goes to stderr so
//! stdout stays a clean protocol channel.

use std::io::{self, BufRead, BufReader, Write};

use tracing::{debug, error, warn};

use super::types::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
use crate::server::RpcServer;

/// stdio transport for the RPC server.
pub struct StdioTransport;

impl StdioTransport {
    pub fn new() -> Self {
        Self
    }

    /// Run the server over stdio until stdin closes.
    pub fn run(self, server: RpcServer) -> Result<(), io::Error> {
        let stdin = io::stdin();
        let stdout = io::stdout();

        let reader = BufReader::new(stdin.lock());
        let mut stdout = stdout.lock();

        for line in reader.lines() {
            let line = match line {
                Ok(l) => l,
                Err(e) => {
                    error!("failed to read line: {e}");
                    break;
                }
            };

            if line.is_empty() {
                continue;
            }

            debug!("received: {} bytes", line.len());

            let request: JsonRpcRequest = match serde_json::from_str(&line) {
                Ok(r) => r,
                Err(e) => {
                    warn!("failed to parse request: {e}");
                    let response = JsonRpcResponse::error(None, JsonRpcError::parse_error());
                    write_response(&mut stdout, &response)?;
                    continue;
                }
            };

            let response = server.handle_request(request);
            write_response(&mut stdout, &response)?;
        }

        Ok(())
    }
}

impl Default for StdioTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn write_response(stdout: &mut impl Write, response: &JsonRpcResponse) -> Result<(), io::Error> {
    match serde_json::to_string(response) {
        Ok(raw) => {
            debug!("sending: {} bytes", raw.len());
            writeln!(stdout, "{raw}")?;
            stdout.flush()?;
        }
        Err(e) => {
            error!("failed to serialize response: {e}");
            // Minimal error response so the client does not hang
            let fallback = r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32603,"message":"Internal error"}}"#;
            let _ = writeln!(stdout, "{fallback}");
            let _ = stdout.flush();
        }
    }
    Ok(())
}
