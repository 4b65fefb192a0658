use std::thread;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT};
use serde_json::Value;
use tracing::debug;

use crate::config::PortalSettings;
use crate::domain::{Payload, last_path_segment};
use crate::error::SubmitError;

const SERVICE: &str = "portal";

/// Representation requested from the portal on GET.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    Object,
    Edit,
}

impl Frame {
    pub fn as_str(&self) -> &'static str {
        match self {
            Frame::Object => "object",
            Frame::Edit => "edit",
        }
    }
}

/// The metadata portal as seen by this crate. Query values are passed unencoded;
/// implementations own the URL encoding.
pub trait PortalClient: Send + Sync {
    /// `Ok(None)` when the portal answers 404.
    fn get(&self, identifier: &str, frame: Option<Frame>) -> Result<Option<Value>, SubmitError>;
    fn search(&self, query: &[(String, String)]) -> Result<Vec<Value>, SubmitError>;
    fn patch(&self, identifier: &str, payload: &Payload) -> Result<Value, SubmitError>;
    /// Replaces the whole record; properties missing from `payload` are removed.
    fn put(&self, identifier: &str, payload: &Payload) -> Result<Value, SubmitError>;
    /// Creates a record under the singular profile id, e.g. `genetic_modification`.
    fn post(&self, profile: &str, payload: &Payload) -> Result<Value, SubmitError>;
    /// Re-issues object-store upload credentials for a file record.
    fn upload_credentials(&self, file_id: &str) -> Result<Value, SubmitError>;
}

#[derive(Clone)]
pub struct PortalHttpClient {
    client: Client,
    base_url: String,
    auth: Option<(String, String)>,
    database_reads: bool,
}

impl PortalHttpClient {
    pub fn new(settings: &PortalSettings) -> Result<Self, SubmitError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("portal-submit/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| SubmitError::InvalidConfig(err.to_string()))?,
        );
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .default_headers(headers)
            .timeout(settings.timeout)
            .build()
            .map_err(|err| remote_failure(err.to_string()))?;

        Ok(Self {
            client,
            base_url: settings.url.clone(),
            auth: settings
                .credentials
                .as_ref()
                .map(|creds| (creds.api_key.clone(), creds.secret_key.clone())),
            database_reads: settings.database_reads,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}/", self.base_url, path.trim_matches('/'))
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.auth {
            Some((key, secret)) => builder.basic_auth(key, Some(secret)),
            None => builder,
        }
    }

    fn send_with_retries<F>(&self, mut make_req: F) -> Result<Response, SubmitError>
    where
        F: FnMut() -> RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            let response = make_req().send();
            match response {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(remote_failure(err.to_string()));
                }
            }
        }
    }

    fn send_once(&self, builder: RequestBuilder) -> Result<Response, SubmitError> {
        builder.send().map_err(|err| remote_failure(err.to_string()))
    }

    fn handle_status(response: Response) -> Result<Response, SubmitError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "portal request failed".to_string());
        Err(SubmitError::RemoteStatus {
            service: SERVICE,
            status,
            message,
        })
    }

    fn read_query(&self, frame: Option<Frame>) -> Vec<(&'static str, &'static str)> {
        let mut query = vec![("format", "json")];
        if self.database_reads {
            query.push(("datastore", "database"));
        }
        if let Some(frame) = frame {
            query.push(("frame", frame.as_str()));
        }
        query
    }
}

impl PortalClient for PortalHttpClient {
    fn get(&self, identifier: &str, frame: Option<Frame>) -> Result<Option<Value>, SubmitError> {
        let url = self.url(identifier);
        let query = self.read_query(frame);
        debug!(%url, identifier, "GET from portal");
        let response =
            self.send_with_retries(|| self.authorized(self.client.get(&url).query(&query)))?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!(identifier, "not found");
            return Ok(None);
        }
        let response = Self::handle_status(response)?;
        let value = response
            .json::<Value>()
            .map_err(|err| remote_failure(err.to_string()))?;
        Ok(Some(value))
    }

    fn search(&self, query: &[(String, String)]) -> Result<Vec<Value>, SubmitError> {
        let url = self.url("search");
        let mut params: Vec<(String, String)> = query.to_vec();
        params.sort();
        if !params.iter().any(|(key, _)| key == "limit") {
            params.push(("limit".to_string(), "all".to_string()));
        }
        if self.database_reads && !params.iter().any(|(key, _)| key == "datastore") {
            params.push(("datastore".to_string(), "database".to_string()));
        }
        params.push(("format".to_string(), "json".to_string()));
        debug!(%url, ?params, "searching portal");

        let response =
            self.send_with_retries(|| self.authorized(self.client.get(&url).query(&params)))?;
        // The portal answers an empty search with 404.
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let response = Self::handle_status(response)?;
        let body = response
            .json::<Value>()
            .map_err(|err| remote_failure(err.to_string()))?;
        let hits = body
            .get("@graph")
            .and_then(Value::as_array)
            .cloned()
            .ok_or_else(|| SubmitError::MalformedResponse("search without @graph".to_string()))?;
        debug!(hits = hits.len(), "search completed");
        Ok(hits)
    }

    fn patch(&self, identifier: &str, payload: &Payload) -> Result<Value, SubmitError> {
        let url = self.url(identifier);
        debug!(%url, identifier, "PATCH to portal");
        let response = self.send_once(self.authorized(self.client.patch(&url).json(payload)))?;
        let response = Self::handle_status(response)?;
        let body = response
            .json::<Value>()
            .map_err(|err| remote_failure(err.to_string()))?;
        first_graph_item(body)
    }

    fn put(&self, identifier: &str, payload: &Payload) -> Result<Value, SubmitError> {
        let url = self.url(identifier);
        debug!(%url, identifier, "PUT to portal");
        let response = self.send_once(self.authorized(self.client.put(&url).json(payload)))?;
        let response = Self::handle_status(response)?;
        let body = response
            .json::<Value>()
            .map_err(|err| remote_failure(err.to_string()))?;
        first_graph_item(body)
    }

    fn post(&self, profile: &str, payload: &Payload) -> Result<Value, SubmitError> {
        let url = self.url(profile);
        debug!(%url, profile, "POST to portal");
        let response = self.send_once(self.authorized(self.client.post(&url).json(payload)))?;
        let response =
            Self::handle_status(response).map_err(|err| conflict_as_mismatch(err, "create"))?;
        let body = response
            .json::<Value>()
            .map_err(|err| remote_failure(err.to_string()))?;
        first_graph_item(body)
    }

    fn upload_credentials(&self, file_id: &str) -> Result<Value, SubmitError> {
        let url = self.url(&format!("files/{}/@@upload", last_path_segment(file_id)));
        debug!(file_id, "requesting upload credentials");
        let response = self.send_once(
            self.authorized(self.client.post(&url).json(&serde_json::json!({}))),
        )?;
        let response = Self::handle_status(response)?;
        let body = response
            .json::<Value>()
            .map_err(|err| remote_failure(err.to_string()))?;
        first_graph_item(body)?
            .get("upload_credentials")
            .cloned()
            .ok_or_else(|| SubmitError::MissingUploadCredentials(file_id.to_string()))
    }
}

/// Mutation responses wrap the record as `{"@graph": [record]}`.
pub fn first_graph_item(body: Value) -> Result<Value, SubmitError> {
    match body {
        Value::Object(mut map) => match map.remove("@graph") {
            Some(Value::Array(mut items)) if !items.is_empty() => Ok(items.swap_remove(0)),
            _ => Err(SubmitError::MalformedResponse(
                "response without @graph record".to_string(),
            )),
        },
        _ => Err(SubmitError::MalformedResponse(
            "response is not a JSON object".to_string(),
        )),
    }
}

/// The portal answers 409 when a unique key (alias, accession, md5sum) is already taken.
pub(crate) fn conflict_as_mismatch(err: SubmitError, intent: &str) -> SubmitError {
    match err {
        SubmitError::RemoteStatus {
            status: 409,
            message,
            ..
        } => SubmitError::RecordStateMismatch {
            intent: intent.to_string(),
            detail: format!("portal reports a conflicting record: {message}"),
        },
        other => other,
    }
}

fn remote_failure(message: String) -> SubmitError {
    SubmitError::RemoteCallFailed {
        service: SERVICE,
        message,
    }
}

pub(crate) fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

pub(crate) fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    #[test]
    fn graph_unwrapping() {
        let record = first_graph_item(json!({"@graph": [{"uuid": "u"}]})).unwrap();
        assert_eq!(record, json!({"uuid": "u"}));
        assert_matches!(
            first_graph_item(json!({"@graph": []})),
            Err(SubmitError::MalformedResponse(_))
        );
        assert_matches!(
            first_graph_item(json!([1])),
            Err(SubmitError::MalformedResponse(_))
        );
    }

    #[test]
    fn urls_are_slash_terminated() {
        let client = PortalHttpClient::new(&PortalSettings {
            url: "https://test.encodedcc.org".to_string(),
            credentials: None,
            database_reads: false,
            timeout: Duration::from_secs(5),
        })
        .unwrap();
        assert_eq!(
            client.url("/biosamples/ENCBS123ABC/"),
            "https://test.encodedcc.org/biosamples/ENCBS123ABC/"
        );
        assert_eq!(client.url("profiles"), "https://test.encodedcc.org/profiles/");
    }

    #[test]
    fn reads_go_to_the_database_when_configured() {
        let mut settings = PortalSettings {
            url: "https://test.encodedcc.org".to_string(),
            credentials: None,
            database_reads: true,
            timeout: Duration::from_secs(5),
        };
        let client = PortalHttpClient::new(&settings).unwrap();
        assert_eq!(
            client.read_query(Some(Frame::Edit)),
            vec![("format", "json"), ("datastore", "database"), ("frame", "edit")]
        );
        settings.database_reads = false;
        let client = PortalHttpClient::new(&settings).unwrap();
        assert_eq!(client.read_query(None), vec![("format", "json")]);
    }

    #[test]
    fn conflict_becomes_state_mismatch() {
        let conflict = SubmitError::RemoteStatus {
            service: SERVICE,
            status: 409,
            message: "keys conflict: alias michael-snyder:rep1".to_string(),
        };
        assert_matches!(
            conflict_as_mismatch(conflict, "create"),
            SubmitError::RecordStateMismatch { intent, detail }
                if intent == "create" && detail.contains("michael-snyder:rep1")
        );
        let forbidden = SubmitError::RemoteStatus {
            service: SERVICE,
            status: 403,
            message: "forbidden".to_string(),
        };
        assert_matches!(
            conflict_as_mismatch(forbidden, "create"),
            SubmitError::RemoteStatus { status: 403, .. }
        );
    }

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable_status(503));
        assert!(!is_retryable_status(404));
        assert!(!is_retryable_status(409));
    }
}
