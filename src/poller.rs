use std::thread;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::SubmitError;
use crate::submit::{ProgressEvent, ProgressSink};
use crate::transfer::{TransferExecution, TransferJobManager, TransferService};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "execution", rename_all = "lowercase")]
pub enum PollResult {
    Terminal(TransferExecution),
    /// Attempts ran out while the execution was still running or paused.
    Pending(TransferExecution),
}

impl PollResult {
    pub fn execution(&self) -> &TransferExecution {
        match self {
            PollResult::Terminal(execution) | PollResult::Pending(execution) => execution,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PollResult::Terminal(_))
    }

    pub fn into_terminal(self) -> Result<TransferExecution, SubmitError> {
        match self {
            PollResult::Terminal(execution) => Ok(execution),
            PollResult::Pending(execution) => Err(SubmitError::TransferNotTerminal {
                job: execution.job_name.clone(),
                status: execution.status.as_str().to_string(),
            }),
        }
    }
}

pub struct TransferStatusPoller<'a, T: TransferService> {
    manager: &'a TransferJobManager<T>,
    sleeper: Box<dyn Fn(Duration) + 'a>,
}

impl<'a, T: TransferService> TransferStatusPoller<'a, T> {
    pub fn new(manager: &'a TransferJobManager<T>) -> Self {
        Self {
            manager,
            sleeper: Box::new(thread::sleep),
        }
    }

    /// Replaces the pause between attempts.
    pub fn with_sleeper(mut self, sleeper: impl Fn(Duration) + 'a) -> Self {
        self.sleeper = Box::new(sleeper);
        self
    }

    /// Fetches the job's latest execution until it is terminal or `max_attempts` fetches were made.
    /// A `max_attempts` of zero is treated as one.
    pub fn await_terminal(
        &self,
        job_name: &str,
        max_attempts: u32,
        interval: Duration,
        sink: &dyn ProgressSink,
    ) -> Result<PollResult, SubmitError> {
        let max_attempts = max_attempts.max(1);
        let mut last_seen: Option<TransferExecution> = None;
        for attempt in 1..=max_attempts {
            let latest = self.manager.list_executions(job_name)?.pop();
            match latest {
                Some(execution) => {
                    sink.event(ProgressEvent {
                        message: format!(
                            "phase=Poll; attempt {attempt}/{max_attempts} status={}",
                            execution.status.as_str()
                        ),
                        elapsed: None,
                    });
                    if execution.status.is_terminal() {
                        info!(job = job_name, status = execution.status.as_str(), "transfer finished");
                        return Ok(PollResult::Terminal(execution));
                    }
                    last_seen = Some(execution);
                }
                None => debug!(job = job_name, attempt, "transfer has no execution yet"),
            }
            if attempt < max_attempts {
                (self.sleeper)(interval);
            }
        }
        match last_seen {
            Some(execution) => {
                warn!(
                    job = job_name,
                    status = execution.status.as_str(),
                    "poll attempts exhausted before transfer finished"
                );
                Ok(PollResult::Pending(execution))
            }
            None => Err(SubmitError::TransferNotTerminal {
                job: job_name.to_string(),
                status: "NOT_STARTED".to_string(),
            }),
        }
    }
}
