use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use clap::ValueEnum;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::SubmitError;

/// A record body as submitted to the portal.
pub type Payload = Map<String, Value>;

/// Client-side routing key naming the target profile.
pub const PROFILE_KEY: &str = "_profile";
/// Client-side routing key naming the record to PATCH.
pub const ID_KEY: &str = "_enc_id";

pub const ALIASES_PROP: &str = "aliases";
pub const ACCESSION_PROP: &str = "accession";
pub const UUID_PROP: &str = "uuid";
pub const MD5SUM_PROP: &str = "md5sum";
pub const FILE_SIZE_PROP: &str = "file_size";
pub const SUBMITTED_FILE_PROP: &str = "submitted_file_name";

static UUID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?i)[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$").unwrap()
});
static ACCESSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(ENC|TST|IGVF)[A-Z]{2}\d{3,6}[A-Z]{0,4}$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentifierKind {
    Accession,
    Alias,
    Uuid,
    Unknown,
}

impl IdentifierKind {
    pub fn classify(token: &str) -> Self {
        let token = last_path_segment(token);
        if UUID_RE.is_match(token) {
            IdentifierKind::Uuid
        } else if ACCESSION_RE.is_match(token) {
            IdentifierKind::Accession
        } else if token
            .split_once(':')
            .map(|(prefix, rest)| !prefix.is_empty() && !rest.is_empty())
            .unwrap_or(false)
        {
            IdentifierKind::Alias
        } else {
            IdentifierKind::Unknown
        }
    }
}

impl fmt::Display for IdentifierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentifierKind::Accession => write!(f, "accession"),
            IdentifierKind::Alias => write!(f, "alias"),
            IdentifierKind::Uuid => write!(f, "uuid"),
            IdentifierKind::Unknown => write!(f, "unknown"),
        }
    }
}

/// A portal identifier together with what kind of identifier it is.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordIdentity {
    pub id: String,
    pub kind: IdentifierKind,
}

impl RecordIdentity {
    pub fn as_str(&self) -> &str {
        &self.id
    }

    /// Picks the most stable identifier out of a record: accession, then uuid, then first alias.
    pub fn from_record(record: &Value) -> Option<Self> {
        if let Some(accession) = record.get(ACCESSION_PROP).and_then(Value::as_str) {
            return Some(Self {
                id: accession.to_string(),
                kind: IdentifierKind::Accession,
            });
        }
        if let Some(uuid) = record.get(UUID_PROP).and_then(Value::as_str) {
            return Some(Self {
                id: uuid.to_string(),
                kind: IdentifierKind::Uuid,
            });
        }
        record
            .get(ALIASES_PROP)
            .and_then(Value::as_array)
            .and_then(|aliases| aliases.first())
            .and_then(Value::as_str)
            .map(|alias| Self {
                id: alias.to_string(),
                kind: IdentifierKind::Alias,
            })
    }
}

impl fmt::Display for RecordIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

impl FromStr for RecordIdentity {
    type Err = SubmitError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim().trim_matches('/');
        if trimmed.is_empty() || trimmed.chars().any(char::is_whitespace) {
            return Err(SubmitError::InvalidIdentifier(value.to_string()));
        }
        Ok(Self {
            id: trimmed.to_string(),
            kind: IdentifierKind::classify(trimmed),
        })
    }
}

/// What the caller wants to happen to the target record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SubmitIntent {
    Create,
    Update,
    Upsert,
}

impl fmt::Display for SubmitIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmitIntent::Create => write!(f, "create"),
            SubmitIntent::Update => write!(f, "update"),
            SubmitIntent::Upsert => write!(f, "upsert"),
        }
    }
}

/// The portal operation a submission actually performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmitOperation {
    Patch,
    Post,
    Put,
    Upload,
    #[serde(rename = "no-op")]
    NoOp,
}

impl fmt::Display for SubmitOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmitOperation::Patch => write!(f, "patch"),
            SubmitOperation::Post => write!(f, "post"),
            SubmitOperation::Put => write!(f, "put"),
            SubmitOperation::Upload => write!(f, "upload"),
            SubmitOperation::NoOp => write!(f, "no-op"),
        }
    }
}

/// `/biosamples/ENCBS123ABC/` -> `ENCBS123ABC`
pub fn last_path_segment(token: &str) -> &str {
    token
        .trim()
        .trim_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
}

pub fn string_values(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        Value::Number(n) => vec![n.to_string()],
        _ => Vec::new(),
    }
}
