use std::fs::{self, OpenOptions};
use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{ALIASES_PROP, RecordIdentity, string_values};
use crate::error::SubmitError;

pub const LEDGER_FILE_NAME: &str = "submissions.jsonl";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub profile: String,
    pub record_id: String,
    pub primary_alias: Option<String>,
    #[serde(default)]
    pub other_aliases: Vec<String>,
    pub recorded_at: String,
}

impl LedgerEntry {
    pub fn from_record(profile: &str, record: &Value) -> Self {
        let mut aliases = record
            .get(ALIASES_PROP)
            .map(string_values)
            .unwrap_or_default()
            .into_iter();
        let record_id = RecordIdentity::from_record(record)
            .map(|identity| identity.id)
            .or_else(|| record.get("@id").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_default();
        Self {
            profile: profile.to_string(),
            record_id,
            primary_alias: aliases.next(),
            other_aliases: aliases.collect(),
            recorded_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Ledger {
    path: Utf8PathBuf,
}

impl Ledger {
    pub fn new() -> Result<Self, SubmitError> {
        let dirs = ProjectDirs::from("org", "portal-submit", "portal-submit").ok_or_else(|| {
            SubmitError::Filesystem("unable to resolve data directory".to_string())
        })?;
        let path = Utf8PathBuf::from_path_buf(dirs.data_dir().join(LEDGER_FILE_NAME))
            .map_err(|_| SubmitError::Filesystem("invalid data directory path".to_string()))?;
        Ok(Self { path })
    }

    pub fn new_with_path(path: Utf8PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn append(&self, entry: &LedgerEntry) -> Result<(), SubmitError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| SubmitError::Filesystem(err.to_string()))?;
        }
        let mut line =
            serde_json::to_vec(entry).map_err(|err| SubmitError::Filesystem(err.to_string()))?;
        line.push(b'\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path.as_std_path())
            .map_err(|err| SubmitError::Filesystem(err.to_string()))?;
        file.write_all(&line)
            .map_err(|err| SubmitError::Filesystem(err.to_string()))
    }

    pub fn entries(&self) -> Result<Vec<LedgerEntry>, SubmitError> {
        if !self.path.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(self.path.as_std_path())
            .map_err(|err| SubmitError::Filesystem(err.to_string()))?;
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line).map_err(|err| {
                    SubmitError::Filesystem(format!("corrupt ledger line in {}: {err}", self.path))
                })
            })
            .collect()
    }
}

/// Writes through a temp file in the destination directory and renames it into place.
pub fn write_file_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), SubmitError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent,
        _ => Utf8Path::new("."),
    };
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| SubmitError::Filesystem(err.to_string()))?;
    let mut temp = tempfile::Builder::new()
        .prefix("portal-submit")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| SubmitError::Filesystem(err.to_string()))?;
    temp.write_all(content)
        .map_err(|err| SubmitError::Filesystem(err.to_string()))?;
    temp.persist(path.as_std_path())
        .map_err(|err| SubmitError::Filesystem(err.to_string()))?;
    Ok(())
}
