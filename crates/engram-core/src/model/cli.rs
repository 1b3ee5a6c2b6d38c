//! Cloud model tier - external CLI child process
//!
//! Pipes the prompt over stdin to an external assistant CLI and reads the
//! reply from stdout. Sets `CONTEXT_ORCHESTRATOR_INTERNAL=1` in the child
//! environment so external recorders do not re-ingest the engine's own
//! internal calls.

use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use tracing::debug;

use super::{GenerationBackend, ModelError, INTERNAL_CALL_SENTINEL};

/// Poll interval while waiting for the child process.
const WAIT_POLL: Duration = Duration::from_millis(50);

/// Generation backend backed by an external CLI (e.g. a cloud assistant).
pub struct CliModelClient {
    command: String,
}

impl CliModelClient {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    fn run(&self, prompt: &str, timeout: Duration) -> Result<String, ModelError> {
        debug!(command = %self.command, timeout_s = timeout.as_secs(), "invoking cloud CLI");

        let mut child = Command::new(&self.command)
            .env(INTERNAL_CALL_SENTINEL, "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ModelError::Unavailable(format!("{}: {e}", self.command)))?;

        // Feed the prompt over stdin; closing the handle signals EOF.
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .map_err(|e| ModelError::Unavailable(e.to_string()))?;
        }

        // Drain stdout concurrently so a chatty child cannot deadlock on a
        // full pipe before exiting.
        let mut stdout = child.stdout.take();
        let reader = std::thread::spawn(move || {
            let mut buffer = String::new();
            if let Some(out) = stdout.as_mut() {
                let _ = out.read_to_string(&mut buffer);
            }
            buffer
        });

        let started = Instant::now();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if started.elapsed() > timeout {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(ModelError::Timeout(timeout.as_secs()));
                    }
                    std::thread::sleep(WAIT_POLL);
                }
                Err(e) => return Err(ModelError::Unavailable(e.to_string())),
            }
        };

        let output = reader
            .join()
            .map_err(|_| ModelError::Unavailable("CLI reader thread panicked".to_string()))?;

        if !status.success() {
            return Err(ModelError::Unavailable(format!(
                "{} exited with {status}",
                self.command
            )));
        }

        Ok(output.trim().to_string())
    }
}

impl GenerationBackend for CliModelClient {
    fn generate(
        &self,
        prompt: &str,
        _max_tokens: Option<u32>,
        _temperature: f32,
        timeout: Duration,
    ) -> Result<String, ModelError> {
        self.run(prompt, timeout)
    }
}

// ============================================================================
// TESTS
// ============================================================================
