use std::io::{self, Write};

use serde::Serialize;

use crate::poller::PollResult;
use crate::submit::{ProgressEvent, ProgressSink, SubmissionOutcome};
use crate::transfer::{TransferExecution, TransferJob};

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_outcomes(outcomes: &[SubmissionOutcome]) -> io::Result<()> {
        match outcomes {
            [single] => Self::print_json(single),
            many => Self::print_json(&many),
        }
    }

    pub fn print_job(job: &TransferJob) -> io::Result<()> {
        Self::print_json(job)
    }

    pub fn print_executions(executions: &[TransferExecution]) -> io::Result<()> {
        Self::print_json(&executions)
    }

    pub fn print_poll(result: &PollResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize + ?Sized>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

/// Forwards progress events to the log at info level.
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => tracing::info!(
                elapsed_ms = elapsed.as_millis() as u64,
                "{}",
                event.message
            ),
            None => tracing::info!("{}", event.message),
        }
    }
}
