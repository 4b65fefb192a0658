use std::collections::BTreeMap;
use std::thread;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue, USER_AGENT};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::config::{AwsAccessKey, TransferSettings};
use crate::domain::{FILE_SIZE_PROP, MD5SUM_PROP};
use crate::error::SubmitError;
use crate::portal::{is_retryable_error, is_retryable_status};
use crate::storage::ObjectLocation;

const SERVICE: &str = "transfer";
pub const TRANSFER_API_URL: &str = "https://storagetransfer.googleapis.com/v1";
pub const URL_LIST_HEADER: &str = "TsvHttpData-1.0";

/// The remote transfer service, reduced to what job creation and polling need.
pub trait TransferService: Send + Sync {
    fn create_job(&self, spec: &Value) -> Result<Value, SubmitError>;
    fn list_operations(&self, job_name: &str) -> Result<Vec<Value>, SubmitError>;
    fn get_operation(&self, name: &str) -> Result<Value, SubmitError>;
}

#[derive(Clone)]
pub struct StorageTransferHttpClient {
    client: Client,
    base_url: String,
    project: String,
    access_token: String,
}

impl StorageTransferHttpClient {
    pub fn new(settings: &TransferSettings) -> Result<Self, SubmitError> {
        let project = required_project(settings)?;
        let access_token = settings.access_token.clone().ok_or_else(|| {
            SubmitError::InvalidConfig(
                "transfer access token is not set (GOOGLE_OAUTH_ACCESS_TOKEN)".to_string(),
            )
        })?;
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("portal-submit/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| SubmitError::InvalidConfig(err.to_string()))?,
        );
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| remote_failure(err.to_string()))?;
        Ok(Self {
            client,
            base_url: TRANSFER_API_URL.to_string(),
            project,
            access_token,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn send_with_retries<F>(&self, mut make_req: F) -> Result<Response, SubmitError>
    where
        F: FnMut() -> RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            match make_req().bearer_auth(&self.access_token).send() {
                Ok(resp) => {
                    if attempt < MAX_RETRIES && is_retryable_status(resp.status().as_u16()) {
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                        attempt += 1;
                        continue;
                    }
                    return Err(remote_failure(err.to_string()));
                }
            }
        }
    }

    fn read_json(response: Response) -> Result<Value, SubmitError> {
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "transfer request failed".to_string());
            return Err(SubmitError::RemoteStatus {
                service: SERVICE,
                status,
                message,
            });
        }
        response
            .json::<Value>()
            .map_err(|err| remote_failure(err.to_string()))
    }
}

impl TransferService for StorageTransferHttpClient {
    fn create_job(&self, spec: &Value) -> Result<Value, SubmitError> {
        let url = format!("{}/transferJobs", self.base_url);
        debug!(%url, "creating transfer job");
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.access_token)
            .json(spec)
            .send()
            .map_err(|err| remote_failure(err.to_string()))?;
        Self::read_json(response)
    }

    fn list_operations(&self, job_name: &str) -> Result<Vec<Value>, SubmitError> {
        let url = format!("{}/transferOperations", self.base_url);
        let filter = json!({"project_id": self.project, "job_names": [job_name]}).to_string();
        let mut operations = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            debug!(%url, job_name, "listing transfer operations");
            let mut query = vec![("filter", filter.clone())];
            if let Some(token) = &page_token {
                query.push(("pageToken", token.clone()));
            }
            let body = Self::read_json(
                self.send_with_retries(|| self.client.get(&url).query(&query))?,
            )?;
            if let Some(items) = body.get("operations").and_then(Value::as_array) {
                operations.extend(items.iter().cloned());
            }
            page_token = body
                .get("nextPageToken")
                .and_then(Value::as_str)
                .filter(|token| !token.is_empty())
                .map(str::to_string);
            if page_token.is_none() {
                break;
            }
        }
        Ok(operations)
    }

    fn get_operation(&self, name: &str) -> Result<Value, SubmitError> {
        let url = format!("{}/{}", self.base_url, name.trim_start_matches('/'));
        debug!(%url, "fetching transfer operation");
        Self::read_json(self.send_with_retries(|| self.client.get(&url))?)
    }
}

/// Source description as supplied by a caller. Exactly one kind must be set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferSourceSpec {
    pub s3_bucket: Option<String>,
    pub s3_keys: Vec<String>,
    pub url_list: Option<String>,
}

impl TransferSourceSpec {
    pub fn object_store(bucket: impl Into<String>, keys: Vec<String>) -> Self {
        Self {
            s3_bucket: Some(bucket.into()),
            s3_keys: keys,
            url_list: None,
        }
    }

    pub fn url_list(url: impl Into<String>) -> Self {
        Self {
            url_list: Some(url.into()),
            ..Self::default()
        }
    }

    /// All URIs must point into the same bucket.
    pub fn from_s3_uris<S: AsRef<str>>(uris: &[S]) -> Result<Self, SubmitError> {
        let mut bucket: Option<String> = None;
        let mut keys = Vec::with_capacity(uris.len());
        for uri in uris {
            let uri = uri.as_ref();
            let location = ObjectLocation::parse(uri).ok_or_else(|| {
                SubmitError::InvalidSourceSpec(format!("'{uri}' is not an s3://bucket/key URI"))
            })?;
            match &bucket {
                Some(known) if *known != location.bucket => {
                    return Err(SubmitError::InvalidSourceSpec(format!(
                        "objects span buckets {known} and {}",
                        location.bucket
                    )));
                }
                Some(_) => {}
                None => bucket = Some(location.bucket.clone()),
            }
            keys.push(location.key);
        }
        Ok(Self {
            s3_bucket: bucket,
            s3_keys: keys,
            url_list: None,
        })
    }

    pub fn validate(&self) -> Result<TransferSource, SubmitError> {
        let has_object_source = self.s3_bucket.is_some() || !self.s3_keys.is_empty();
        match (&self.url_list, has_object_source) {
            (Some(_), true) => Err(SubmitError::InvalidSourceSpec(
                "both an object-store source and a URL list were given".to_string(),
            )),
            (None, false) => Err(SubmitError::InvalidSourceSpec(
                "no source given; set an object-store bucket with keys or a URL list".to_string(),
            )),
            (Some(url), false) => {
                let url = url.trim();
                if !(url.starts_with("https://") || url.starts_with("http://")) {
                    return Err(SubmitError::InvalidSourceSpec(format!(
                        "URL list location '{url}' is not an http(s) URL"
                    )));
                }
                Ok(TransferSource::UrlList {
                    url: url.to_string(),
                })
            }
            (None, true) => {
                let bucket = self
                    .s3_bucket
                    .as_deref()
                    .map(|bucket| bucket.trim().trim_start_matches("s3://").trim_matches('/'))
                    .filter(|bucket| !bucket.is_empty())
                    .ok_or_else(|| {
                        SubmitError::InvalidSourceSpec("object keys given without a bucket".to_string())
                    })?;
                let mut keys: Vec<String> = Vec::with_capacity(self.s3_keys.len());
                for key in &self.s3_keys {
                    let key = key.trim().trim_start_matches('/');
                    if !key.is_empty() && !keys.iter().any(|known| known == key) {
                        keys.push(key.to_string());
                    }
                }
                if keys.is_empty() {
                    return Err(SubmitError::InvalidSourceSpec(format!(
                        "bucket {bucket} given without object keys"
                    )));
                }
                Ok(TransferSource::ObjectStore {
                    bucket: bucket.to_string(),
                    keys,
                })
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum TransferSource {
    ObjectStore { bucket: String, keys: Vec<String> },
    UrlList { url: String },
}

impl TransferSource {
    fn default_description(&self) -> String {
        match self {
            TransferSource::ObjectStore { keys, .. } => keys.first().cloned().unwrap_or_default(),
            TransferSource::UrlList { url } => url.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferSink {
    pub bucket: String,
    pub overwrite: bool,
}

impl TransferSink {
    pub fn new(bucket: &str, overwrite: bool) -> Result<Self, SubmitError> {
        let bucket = bucket.trim().trim_start_matches("gs://").trim_matches('/');
        if bucket.is_empty() {
            return Err(SubmitError::InvalidSourceSpec(
                "sink bucket is empty".to_string(),
            ));
        }
        Ok(Self {
            bucket: bucket.to_string(),
            overwrite,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferJob {
    pub name: String,
    pub description: String,
    pub project_id: String,
    pub source: TransferSource,
    pub sink: TransferSink,
    /// Jobs always run once, on this (UTC) date.
    pub run_on: NaiveDate,
}

impl TransferJob {
    /// `transferJobs/123` -> `123`
    pub fn id(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferStatus {
    InProgress,
    Paused,
    Success,
    Failed,
    Aborted,
    Unknown,
}

impl TransferStatus {
    pub fn parse(value: &str) -> Self {
        match value {
            "IN_PROGRESS" | "QUEUED" => TransferStatus::InProgress,
            "PAUSED" => TransferStatus::Paused,
            "SUCCESS" => TransferStatus::Success,
            "FAILED" => TransferStatus::Failed,
            "ABORTED" => TransferStatus::Aborted,
            _ => TransferStatus::Unknown,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Success | TransferStatus::Failed | TransferStatus::Aborted
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::InProgress => "IN_PROGRESS",
            TransferStatus::Paused => "PAUSED",
            TransferStatus::Success => "SUCCESS",
            TransferStatus::Failed => "FAILED",
            TransferStatus::Aborted => "ABORTED",
            TransferStatus::Unknown => "UNKNOWN",
        }
    }
}

/// Snapshot of one run of a transfer job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferExecution {
    pub name: String,
    pub job_name: String,
    pub status: TransferStatus,
    pub counters: BTreeMap<String, u64>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl TransferExecution {
    pub fn from_operation(operation: &Value) -> Result<Self, SubmitError> {
        let name = operation
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| SubmitError::MalformedResponse("transfer operation without name".to_string()))?
            .to_string();
        let metadata = operation.get("metadata").unwrap_or(&Value::Null);
        let text = |key: &str| metadata.get(key).and_then(Value::as_str);
        let time = |key: &str| {
            text(key)
                .and_then(|value| DateTime::parse_from_rfc3339(value).ok())
                .map(|value| value.with_timezone(&Utc))
        };
        // Counters arrive as int64 strings.
        let counters = metadata
            .get("counters")
            .and_then(Value::as_object)
            .map(|map| {
                map.iter()
                    .filter_map(|(key, value)| {
                        let count = match value {
                            Value::String(s) => s.parse::<u64>().ok(),
                            Value::Number(n) => n.as_u64(),
                            _ => None,
                        }?;
                        Some((key.clone(), count))
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(Self {
            name,
            job_name: text("transferJobName")
                .or_else(|| text("transferJob"))
                .unwrap_or_default()
                .to_string(),
            status: text("status")
                .map(TransferStatus::parse)
                .unwrap_or(TransferStatus::Unknown),
            counters,
            start_time: time("startTime"),
            end_time: time("endTime"),
        })
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }
}

pub struct TransferJobManager<T: TransferService> {
    service: T,
    project: String,
    aws_source: Option<AwsAccessKey>,
}

impl<T: TransferService> TransferJobManager<T> {
    pub fn new(service: T, settings: &TransferSettings) -> Result<Self, SubmitError> {
        Ok(Self {
            service,
            project: required_project(settings)?,
            aws_source: settings.aws_source.clone(),
        })
    }

    pub fn service(&self) -> &T {
        &self.service
    }

    /// Creates a job that runs once, today. Source problems are reported before any remote call.
    pub fn create(
        &self,
        source: &TransferSourceSpec,
        sink: &TransferSink,
        description: Option<&str>,
    ) -> Result<TransferJob, SubmitError> {
        let source = source.validate()?;
        let description = description
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| source.default_description());
        let run_on = Utc::now().date_naive();
        let spec = self.job_spec(&source, sink, &description, run_on)?;

        let created = self.service.create_job(&spec)?;
        let name = created
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                SubmitError::MalformedResponse("created transfer job without name".to_string())
            })?
            .to_string();
        info!(job = %name, %description, "transfer job created");
        Ok(TransferJob {
            name,
            description,
            project_id: self.project.clone(),
            source,
            sink: sink.clone(),
            run_on,
        })
    }

    /// Request body for a job that starts and ends on `run_on`, i.e. runs exactly once.
    pub fn job_spec(
        &self,
        source: &TransferSource,
        sink: &TransferSink,
        description: &str,
        run_on: NaiveDate,
    ) -> Result<Value, SubmitError> {
        let date = json!({
            "year": run_on.year(),
            "month": run_on.month(),
            "day": run_on.day(),
        });
        let mut transfer_spec = json!({
            "gcsDataSink": {"bucketName": sink.bucket},
        });
        match source {
            TransferSource::ObjectStore { bucket, keys } => {
                let aws = self.aws_source.as_ref().ok_or_else(|| {
                    SubmitError::InvalidConfig(
                        "object-store transfers need AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY"
                            .to_string(),
                    )
                })?;
                transfer_spec["awsS3DataSource"] = json!({
                    "bucketName": bucket,
                    "awsAccessKey": {
                        "accessKeyId": aws.access_key_id,
                        "secretAccessKey": aws.secret_access_key,
                    },
                });
                transfer_spec["objectConditions"] = json!({"includePrefixes": keys});
            }
            TransferSource::UrlList { url } => {
                transfer_spec["httpDataSource"] = json!({"listUrl": url});
            }
        }
        if sink.overwrite {
            transfer_spec["transferOptions"] =
                json!({"overwriteObjectsAlreadyExistingInSink": true});
        }
        Ok(json!({
            "description": description,
            "status": "ENABLED",
            "projectId": self.project,
            "schedule": {
                "scheduleStartDate": date,
                "scheduleEndDate": date,
            },
            "transferSpec": transfer_spec,
        }))
    }

    /// Every execution of the job, most recent last.
    pub fn list_executions(&self, job_name: &str) -> Result<Vec<TransferExecution>, SubmitError> {
        let mut executions = self
            .service
            .list_operations(job_name)?
            .iter()
            .map(TransferExecution::from_operation)
            .collect::<Result<Vec<_>, _>>()?;
        executions.sort_by_key(|execution| execution.start_time);
        Ok(executions)
    }

    pub fn get_execution(&self, name: &str) -> Result<TransferExecution, SubmitError> {
        TransferExecution::from_operation(&self.service.get_operation(name)?)
    }
}

fn required_project(settings: &TransferSettings) -> Result<String, SubmitError> {
    settings
        .project
        .clone()
        .filter(|project| !project.trim().is_empty())
        .ok_or_else(|| SubmitError::InvalidConfig("GCP project is not set (GCP_PROJECT)".to_string()))
}

fn remote_failure(message: String) -> SubmitError {
    SubmitError::RemoteCallFailed {
        service: SERVICE,
        message,
    }
}

/// One line of a `TsvHttpData-1.0` URL list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlListEntry {
    pub url: String,
    pub size: u64,
    pub md5_hex: String,
}

impl UrlListEntry {
    /// Reads the public URL, size and checksum of a file record.
    pub fn from_file_record(record: &Value) -> Result<Self, SubmitError> {
        let id = record
            .get("accession")
            .or_else(|| record.get("@id"))
            .and_then(Value::as_str)
            .unwrap_or("file record");
        let cloud = record.get("cloud_metadata");
        let url = cloud
            .and_then(|meta| meta.get("url"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| {
                record
                    .get("s3_uri")
                    .and_then(Value::as_str)
                    .and_then(ObjectLocation::parse)
                    .map(|location| {
                        format!("https://{}.s3.amazonaws.com/{}", location.bucket, location.key)
                    })
            })
            .ok_or_else(|| SubmitError::MalformedResponse(format!("{id} has no public URL")))?;
        let size = record
            .get(FILE_SIZE_PROP)
            .and_then(Value::as_u64)
            .ok_or_else(|| SubmitError::MalformedResponse(format!("{id} has no file_size")))?;
        let md5_hex = record
            .get(MD5SUM_PROP)
            .and_then(Value::as_str)
            .ok_or_else(|| SubmitError::MalformedResponse(format!("{id} has no md5sum")))?
            .to_string();
        Ok(Self { url, size, md5_hex })
    }
}

/// Renders the URL list the transfer service fetches for HTTP sources.
pub fn render_url_list(entries: &[UrlListEntry]) -> Result<String, SubmitError> {
    let mut out = String::from(URL_LIST_HEADER);
    out.push('\n');
    for entry in entries {
        let digest = hex::decode(&entry.md5_hex).map_err(|err| {
            SubmitError::MalformedResponse(format!("md5sum '{}': {err}", entry.md5_hex))
        })?;
        out.push_str(&format!("{}\t{}\t{}\n", entry.url, entry.size, STANDARD.encode(digest)));
    }
    Ok(out)
}
