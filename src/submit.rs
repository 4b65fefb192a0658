use std::sync::Arc;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::config::{ProcessDefaults, SubmissionSettings};
use crate::domain::{
    Payload, RecordIdentity, SUBMITTED_FILE_PROP, SubmitIntent, SubmitOperation,
};
use crate::error::SubmitError;
use crate::ledger::{Ledger, LedgerEntry};
use crate::normalize;
use crate::portal::{Frame, PortalClient};
use crate::resolver::{Lookup, RecordResolver, ResolvedRecord};
use crate::schema::{Schema, SchemaCatalog, normalize_profile_token};
use crate::storage::{ObjectStore, UploadCredentials};

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

/// Discards every event.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn event(&self, _event: ProgressEvent) {}
}

fn phase(sink: &dyn ProgressSink, message: String) {
    sink.event(ProgressEvent {
        message,
        elapsed: None,
    });
}

#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub intent: SubmitIntent,
    pub identifier: Option<RecordIdentity>,
    pub file_path: Option<Utf8PathBuf>,
}

impl SubmitRequest {
    pub fn new(intent: SubmitIntent) -> Self {
        Self {
            intent,
            identifier: None,
            file_path: None,
        }
    }

    pub fn with_identifier(mut self, identifier: RecordIdentity) -> Self {
        self.identifier = Some(identifier);
        self
    }

    pub fn with_file(mut self, path: Utf8PathBuf) -> Self {
        self.file_path = Some(path);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmissionOutcome {
    pub profile: String,
    pub operation: SubmitOperation,
    pub dry_run: bool,
    /// Portal path of the affected record; absent for a simulated POST.
    pub record_id: Option<String>,
    pub identity: Option<RecordIdentity>,
    /// The record as returned by the portal. Absent when nothing was sent.
    pub record: Option<Value>,
    /// The body that was (or, in a dry run, would have been) sent.
    pub payload: Payload,
    pub local_file: Option<String>,
    pub uploaded_to: Option<String>,
}

pub struct SubmissionOrchestrator<P: PortalClient, S: ObjectStore> {
    portal: P,
    store: S,
    catalog: Arc<SchemaCatalog>,
    defaults: ProcessDefaults,
    settings: SubmissionSettings,
    ledger: Option<Ledger>,
}

impl<P: PortalClient, S: ObjectStore> SubmissionOrchestrator<P, S> {
    pub fn new(
        portal: P,
        store: S,
        catalog: Arc<SchemaCatalog>,
        defaults: ProcessDefaults,
        settings: SubmissionSettings,
    ) -> Self {
        Self {
            portal,
            store,
            catalog,
            defaults,
            settings,
            ledger: None,
        }
    }

    pub fn with_ledger(mut self, ledger: Ledger) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn set_dry_run(&mut self, dry_run: bool) {
        self.settings.dry_run = dry_run;
    }

    pub fn is_dry_run(&self) -> bool {
        self.settings.dry_run
    }

    pub fn portal(&self) -> &P {
        &self.portal
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn catalog(&self) -> &SchemaCatalog {
        &self.catalog
    }

    /// Runs one submission through resolve, validate, dispatch and (for new file records) upload.
    pub fn submit(
        &self,
        profile: &str,
        payload: Payload,
        request: &SubmitRequest,
        sink: &dyn ProgressSink,
    ) -> Result<SubmissionOutcome, SubmitError> {
        let started = Instant::now();
        let schema = self.catalog.resolve(&self.portal, profile)?;
        let mut payload = payload;
        normalize::strip_control_keys(&mut payload);
        normalize::normalize_aliases(&mut payload, &self.defaults);

        phase(
            sink,
            format!("phase=Resolve; {} ({})", schema.name(), request.intent),
        );
        let lookup = match &request.identifier {
            Some(identifier) => Lookup::Identifier(identifier),
            None => Lookup::Payload(&payload),
        };
        let existing = RecordResolver::new(&self.portal)
            .resolve(&schema, lookup)?
            .into_result()?;
        let operation = plan(request.intent, existing.as_ref(), &schema)?;

        phase(sink, format!("phase=Validate; {operation} {}", schema.name()));
        normalize::apply_attachment(&mut payload)?;
        let local_file = match operation {
            SubmitOperation::Post => self.validate_post(&mut payload, &schema, request)?,
            _ => {
                normalize::strip_non_writable(&mut payload, &schema, SubmitOperation::Patch);
                None
            }
        };

        phase(sink, format!("phase=Dispatch; {operation} {}", schema.name()));
        let outcome = match (operation, existing) {
            (SubmitOperation::Patch, Some(found)) => self.dispatch_patch(&schema, payload, found)?,
            _ => self.dispatch_post(&schema, payload, local_file, sink)?,
        };
        sink.event(ProgressEvent {
            message: format!("phase=Done; {} {}", outcome.operation, schema.name()),
            elapsed: Some(started.elapsed()),
        });
        Ok(outcome)
    }

    fn validate_post(
        &self,
        payload: &mut Payload,
        schema: &Schema,
        request: &SubmitRequest,
    ) -> Result<Option<Utf8PathBuf>, SubmitError> {
        normalize::apply_defaults(payload, schema, &self.defaults);
        let local_file = normalize::apply_file_hooks(payload, schema, request.file_path.as_deref())?;
        if self.settings.require_aliases {
            normalize::check_aliases(payload, schema)?;
        }
        normalize::check_required(payload, schema)?;
        Ok(local_file)
    }

    fn dispatch_patch(
        &self,
        schema: &Schema,
        payload: Payload,
        found: ResolvedRecord,
    ) -> Result<SubmissionOutcome, SubmitError> {
        let current = self
            .portal
            .get(&found.canonical_id, Some(Frame::Edit))?
            .unwrap_or_else(|| found.record.clone());
        let delta = normalize::patch_delta(
            payload,
            &current,
            schema,
            self.settings.extend_array_values,
        );
        let mut outcome = SubmissionOutcome {
            profile: schema.name().to_string(),
            operation: SubmitOperation::Patch,
            dry_run: self.settings.dry_run,
            record_id: Some(found.canonical_id.clone()),
            identity: Some(found.identity.clone()),
            record: None,
            payload: delta,
            local_file: None,
            uploaded_to: None,
        };
        if outcome.payload.is_empty() {
            info!(record = %found.canonical_id, "record already up to date");
            outcome.operation = SubmitOperation::NoOp;
            outcome.record = Some(found.record);
            return Ok(outcome);
        }
        if self.settings.dry_run {
            warn!(record = %found.canonical_id, "dry run; PATCH not sent");
            return Ok(outcome);
        }
        let record = self.portal.patch(&found.canonical_id, &outcome.payload)?;
        info!(record = %found.canonical_id, properties = outcome.payload.len(), "record patched");
        outcome.record = Some(record);
        Ok(outcome)
    }

    fn dispatch_post(
        &self,
        schema: &Schema,
        payload: Payload,
        local_file: Option<Utf8PathBuf>,
        sink: &dyn ProgressSink,
    ) -> Result<SubmissionOutcome, SubmitError> {
        let upload_file = local_file.filter(|_| self.settings.upload_file);
        let mut outcome = SubmissionOutcome {
            profile: schema.name().to_string(),
            operation: SubmitOperation::Post,
            dry_run: self.settings.dry_run,
            record_id: None,
            identity: None,
            record: None,
            payload,
            local_file: upload_file.as_ref().map(|path| path.to_string()),
            uploaded_to: None,
        };
        if self.settings.dry_run {
            warn!(profile = schema.name(), "dry run; POST not sent");
            return Ok(outcome);
        }

        let record = self.portal.post(schema.name(), &outcome.payload)?;
        let identity = RecordIdentity::from_record(&record);
        let record_id = record
            .get("@id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| identity.as_ref().map(|identity| identity.id.clone()))
            .unwrap_or_default();
        info!(profile = schema.name(), record = %record_id, "record created");
        if let Some(ledger) = &self.ledger {
            if let Err(err) = ledger.append(&LedgerEntry::from_record(schema.name(), &record)) {
                warn!(error = %err, "failed to append to submission ledger");
            }
        }
        outcome.record_id = Some(record_id.clone());
        outcome.identity = identity;

        if let Some(path) = upload_file.filter(|_| schema.expects_file()) {
            phase(sink, format!("phase=Upload; {path}"));
            match self.upload_for_record(&record, &record_id, &path) {
                Ok(location) => outcome.uploaded_to = Some(location),
                Err(err) => {
                    warn!(record = %record_id, error = %err, "record created but upload failed");
                    return Err(SubmitError::UploadFailedAfterCreate {
                        record_id,
                        message: err.to_string(),
                    });
                }
            }
        }
        outcome.record = Some(record);
        Ok(outcome)
    }

    fn upload_for_record(
        &self,
        record: &Value,
        record_id: &str,
        path: &Utf8Path,
    ) -> Result<String, SubmitError> {
        let credentials = match record.get("upload_credentials") {
            Some(value) => UploadCredentials::from_value(value)?,
            None => UploadCredentials::from_value(&self.portal.upload_credentials(record_id)?)?,
        };
        let location = credentials.location()?;
        self.store.put(&location, path, &credentials)?;
        Ok(location.to_string())
    }

    /// Uploads (or re-uploads) the bytes of an existing file record.
    pub fn upload(
        &self,
        identifier: &RecordIdentity,
        path: Option<&Utf8Path>,
        sink: &dyn ProgressSink,
    ) -> Result<SubmissionOutcome, SubmitError> {
        phase(sink, format!("phase=Resolve; {identifier}"));
        let record = self
            .portal
            .get(identifier.as_str(), Some(Frame::Object))?
            .ok_or_else(|| SubmitError::RecordStateMismatch {
                intent: "upload".to_string(),
                detail: format!("no record matches {identifier}"),
            })?;
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => record
                .get(SUBMITTED_FILE_PROP)
                .and_then(Value::as_str)
                .map(Utf8PathBuf::from)
                .filter(|path| path.is_file())
                .ok_or_else(|| {
                    SubmitError::Filesystem(format!(
                        "no local file given and {SUBMITTED_FILE_PROP} of {identifier} is not readable"
                    ))
                })?,
        };
        let schema = self.catalog.resolve(&self.portal, &record_profile(&record)?)?;
        if !schema.expects_file() {
            return Err(SubmitError::RecordStateMismatch {
                intent: "upload".to_string(),
                detail: format!("{identifier} is a {} record and carries no file", schema.name()),
            });
        }
        let identity = RecordIdentity::from_record(&record).unwrap_or_else(|| identifier.clone());
        let record_id = record_path(&record, &identity);
        let mut outcome = SubmissionOutcome {
            profile: schema.name().to_string(),
            operation: SubmitOperation::Upload,
            dry_run: self.settings.dry_run,
            record_id: Some(record_id),
            identity: Some(identity.clone()),
            record: None,
            payload: Payload::new(),
            local_file: Some(path.to_string()),
            uploaded_to: None,
        };
        if self.settings.dry_run {
            warn!(file = %identity, "dry run; upload not sent");
            return Ok(outcome);
        }

        phase(sink, format!("phase=Upload; {path}"));
        let credentials =
            UploadCredentials::from_value(&self.portal.upload_credentials(identity.as_str())?)?;
        let location = credentials.location()?;
        self.store.put(&location, &path, &credentials)?;
        outcome.uploaded_to = Some(location.to_string());
        outcome.record = Some(record);
        Ok(outcome)
    }

    /// Removes optional properties from an existing record and applies `patch` in the same
    /// request. A PATCH cannot unset a property, so the record is replaced with PUT.
    pub fn remove_properties(
        &self,
        identifier: &RecordIdentity,
        properties: &[String],
        patch: Payload,
        sink: &dyn ProgressSink,
    ) -> Result<SubmissionOutcome, SubmitError> {
        let started = Instant::now();
        phase(sink, format!("phase=Resolve; {identifier}"));
        let missing = || SubmitError::RecordStateMismatch {
            intent: "remove".to_string(),
            detail: format!("no record matches {identifier}"),
        };
        let record = self
            .portal
            .get(identifier.as_str(), Some(Frame::Object))?
            .ok_or_else(missing)?;
        let schema = self.catalog.resolve(&self.portal, &record_profile(&record)?)?;
        let identity = RecordIdentity::from_record(&record).unwrap_or_else(|| identifier.clone());
        let record_id = record_path(&record, &identity);

        phase(sink, format!("phase=Validate; put {}", schema.name()));
        for property in properties {
            normalize::check_removable(&schema, property)?;
        }
        let mut patch = patch;
        normalize::strip_control_keys(&mut patch);
        normalize::normalize_aliases(&mut patch, &self.defaults);
        normalize::apply_attachment(&mut patch)?;
        normalize::strip_non_writable(&mut patch, &schema, SubmitOperation::Patch);

        let current = self
            .portal
            .get(&record_id, Some(Frame::Edit))?
            .ok_or_else(missing)?;
        let body = normalize::replacement_body(
            &current,
            properties,
            patch,
            &schema,
            self.settings.extend_array_values,
        );
        let mut before = current.as_object().cloned().unwrap_or_default();
        before.retain(|key, _| !key.starts_with('@'));

        phase(sink, format!("phase=Dispatch; put {}", schema.name()));
        let mut outcome = SubmissionOutcome {
            profile: schema.name().to_string(),
            operation: SubmitOperation::Put,
            dry_run: self.settings.dry_run,
            record_id: Some(record_id.clone()),
            identity: Some(identity),
            record: None,
            payload: body,
            local_file: None,
            uploaded_to: None,
        };
        if outcome.payload == before {
            info!(record = %record_id, "nothing to remove or change");
            outcome.operation = SubmitOperation::NoOp;
            outcome.record = Some(record);
        } else if self.settings.dry_run {
            warn!(record = %record_id, "dry run; PUT not sent");
        } else {
            let updated = self.portal.put(&record_id, &outcome.payload)?;
            info!(record = %record_id, removed = ?properties, "record replaced");
            outcome.record = Some(updated);
        }
        sink.event(ProgressEvent {
            message: format!("phase=Done; {} {}", outcome.operation, schema.name()),
            elapsed: Some(started.elapsed()),
        });
        Ok(outcome)
    }
}

/// Profile token of a fetched record: its most specific `@type`, else the collection in `@id`.
fn record_profile(record: &Value) -> Result<String, SubmitError> {
    record
        .get("@type")
        .and_then(|types| types.get(0))
        .and_then(Value::as_str)
        .or_else(|| record.get("@id").and_then(Value::as_str))
        .map(normalize_profile_token)
        .ok_or_else(|| SubmitError::MalformedResponse("record without @type or @id".to_string()))
}

fn record_path(record: &Value, identity: &RecordIdentity) -> String {
    record
        .get("@id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| identity.id.clone())
}

/// Maps intent and lookup result onto the portal operation, rejecting mismatches.
fn plan(
    intent: SubmitIntent,
    existing: Option<&ResolvedRecord>,
    schema: &Schema,
) -> Result<SubmitOperation, SubmitError> {
    match (intent, existing) {
        (SubmitIntent::Create, Some(found)) => Err(SubmitError::RecordStateMismatch {
            intent: intent.to_string(),
            detail: format!(
                "{} {} already exists as {}",
                schema.name(),
                found.identity,
                found.canonical_id
            ),
        }),
        (SubmitIntent::Update, None) => Err(SubmitError::RecordStateMismatch {
            intent: intent.to_string(),
            detail: format!("no {} record matches the payload", schema.name()),
        }),
        (SubmitIntent::Create | SubmitIntent::Upsert, None) => Ok(SubmitOperation::Post),
        (SubmitIntent::Update | SubmitIntent::Upsert, Some(_)) => Ok(SubmitOperation::Patch),
    }
}
