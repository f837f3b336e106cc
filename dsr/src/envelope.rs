//! Envelope assembly and emission
//!
//! Every command ends by printing exactly one envelope object to stdout (in
//! `--json` mode) and exiting with the code the envelope carries. Logs never
//! touch stdout; that's the whole contract.

use std::time::Instant;

use dsr_schema::{Envelope, EnvelopeStatus};

/// Timing and identity for one command invocation
#[derive(Debug)]
pub struct CommandRun {
    /// The subcommand name as it appears in the envelope
    pub command: String,
    /// This run's id (honors `DSR_RUN_ID` when it looks like a uuid)
    pub run_id: String,
    started_at: String,
    started: Instant,
}

impl CommandRun {
    /// Start the clock for a command
    pub fn start(command: impl Into<String>) -> Self {
        let run_id = std::env::var("DSR_RUN_ID")
            .ok()
            .filter(|id| dsr_schema::looks_like_run_id(id))
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Self {
            command: command.into(),
            run_id,
            started_at: dsr_schema::rfc3339_now(),
            started: Instant::now(),
        }
    }

    /// The status an exit code implies
    pub fn status_for(exit_code: u8) -> EnvelopeStatus {
        match exit_code {
            0 => EnvelopeStatus::Success,
            1 => EnvelopeStatus::Partial,
            _ => EnvelopeStatus::Error,
        }
    }

    /// Wrap up into the final envelope
    pub fn finish(&self, exit_code: u8, details: serde_json::Value) -> Envelope {
        Envelope::new(
            self.command.clone(),
            Self::status_for(exit_code),
            exit_code,
            self.run_id.clone(),
            self.started_at.clone(),
            self.started.elapsed().as_millis() as u64,
            env!("CARGO_PKG_VERSION"),
            details,
        )
    }
}

/// Print the envelope to stdout as the single machine-readable object
pub fn emit(envelope: &Envelope) {
    let json = serde_json::to_string_pretty(envelope)
        .unwrap_or_else(|_| r#"{"error":"envelope serialization failed"}"#.to_owned());
    println!("{json}");
}
