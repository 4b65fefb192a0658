use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum SubmitError {
    #[error("unknown profile: {0}")]
    UnknownProfile(String),

    #[error("no profile given; pass a profile token or set `_profile`/`@id` in the payload")]
    ProfileNotSpecified,

    #[error("profile {profile} requires property '{property}' and no default is configured")]
    #[diagnostic(help("set the property in the payload or register a default (e.g. DCC_LAB, DCC_AWARD)"))]
    MissingRequiredProperty { profile: String, property: String },

    #[error("lookup '{lookup}' matches several records: {}", candidates.join(", "))]
    AmbiguousRecord {
        lookup: String,
        candidates: Vec<String>,
    },

    #[error("cannot {intent}: {detail}")]
    RecordStateMismatch { intent: String, detail: String },

    #[error("cannot remove '{property}' from {profile}: {reason}")]
    PropertyNotRemovable {
        profile: String,
        property: String,
        reason: &'static str,
    },

    #[error("invalid transfer source: {0}")]
    InvalidSourceSpec(String),

    #[error("record {record_id} was created but its file upload failed: {message}")]
    #[diagnostic(help("the record exists on the portal without its file; retry with `upload --id`"))]
    UploadFailedAfterCreate { record_id: String, message: String },

    #[error("transfer job {job} has not reached a terminal state (last status: {status})")]
    TransferNotTerminal { job: String, status: String },

    #[error("{service} request failed: {message}")]
    RemoteCallFailed {
        service: &'static str,
        message: String,
    },

    #[error("{service} returned status {status}: {message}")]
    RemoteStatus {
        service: &'static str,
        status: u16,
        message: String,
    },

    #[error("no upload credentials available for {0}")]
    MissingUploadCredentials(String),

    #[error("unexpected response shape: {0}")]
    MalformedResponse(String),

    #[error("invalid record identifier: {0}")]
    InvalidIdentifier(String),

    #[error("missing config file portal-submit.json")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl SubmitError {
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            SubmitError::RemoteCallFailed { .. } | SubmitError::RemoteStatus { .. }
        )
    }

    /// Errors raised before any mutating call was issued.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            SubmitError::UnknownProfile(_)
                | SubmitError::ProfileNotSpecified
                | SubmitError::MissingRequiredProperty { .. }
                | SubmitError::PropertyNotRemovable { .. }
                | SubmitError::InvalidSourceSpec(_)
                | SubmitError::AmbiguousRecord { .. }
                | SubmitError::RecordStateMismatch { .. }
                | SubmitError::InvalidIdentifier(_)
        )
    }
}
