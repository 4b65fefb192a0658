use std::fmt;
use std::fs::File;

use camino::Utf8Path;
use s3::bucket::Bucket;
use s3::creds::Credentials;
use s3::region::Region;
use serde_json::Value;
use tracing::{debug, info};

use crate::config::StorageSettings;
use crate::error::SubmitError;

const SERVICE: &str = "object-store";

/// `s3://bucket/key/with/slashes`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectLocation {
    pub bucket: String,
    pub key: String,
}

impl ObjectLocation {
    pub fn parse(uri: &str) -> Option<Self> {
        let rest = uri.trim().strip_prefix("s3://")?;
        let (bucket, key) = rest.split_once('/')?;
        let key = key.trim_start_matches('/');
        if bucket.is_empty() || key.is_empty() {
            return None;
        }
        Some(Self {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
    }
}

impl fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

/// Short-lived credentials the portal issues for a single file upload.
#[derive(Clone)]
pub struct UploadCredentials {
    pub access_key: String,
    pub secret_key: String,
    pub session_token: Option<String>,
    pub upload_url: String,
}

impl UploadCredentials {
    pub fn from_value(value: &Value) -> Result<Self, SubmitError> {
        let field = |name: &str| value.get(name).and_then(Value::as_str).map(str::to_string);
        let missing = |name: &str| {
            SubmitError::MalformedResponse(format!("upload credentials without {name}"))
        };
        Ok(Self {
            access_key: field("access_key").ok_or_else(|| missing("access_key"))?,
            secret_key: field("secret_key").ok_or_else(|| missing("secret_key"))?,
            session_token: field("session_token"),
            upload_url: field("upload_url").ok_or_else(|| missing("upload_url"))?,
        })
    }

    pub fn location(&self) -> Result<ObjectLocation, SubmitError> {
        ObjectLocation::parse(&self.upload_url).ok_or_else(|| {
            SubmitError::MalformedResponse(format!("upload url {} is not s3://", self.upload_url))
        })
    }
}

impl fmt::Debug for UploadCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadCredentials")
            .field("access_key", &"<redacted>")
            .field("secret_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .field("upload_url", &self.upload_url)
            .finish()
    }
}

pub trait ObjectStore: Send + Sync {
    fn put(
        &self,
        location: &ObjectLocation,
        path: &Utf8Path,
        credentials: &UploadCredentials,
    ) -> Result<(), SubmitError>;
}

#[derive(Debug, Clone)]
pub struct S3ObjectStore {
    region: String,
}

impl S3ObjectStore {
    pub fn new(settings: &StorageSettings) -> Self {
        Self {
            region: settings.region.clone(),
        }
    }

    fn bucket(
        &self,
        name: &str,
        credentials: &UploadCredentials,
    ) -> Result<Box<Bucket>, SubmitError> {
        let region = self
            .region
            .parse::<Region>()
            .map_err(|err| store_failure(err.to_string()))?;
        let creds = Credentials::new(
            Some(credentials.access_key.as_str()),
            Some(credentials.secret_key.as_str()),
            None,
            credentials.session_token.as_deref(),
            None,
        )
        .map_err(|err| store_failure(err.to_string()))?;
        Bucket::new(name, region, creds)
            .map(Box::new)
            .map_err(|err| store_failure(err.to_string()))
    }
}

impl ObjectStore for S3ObjectStore {
    fn put(
        &self,
        location: &ObjectLocation,
        path: &Utf8Path,
        credentials: &UploadCredentials,
    ) -> Result<(), SubmitError> {
        let bucket = self.bucket(&location.bucket, credentials)?;
        let mut file = File::open(path.as_std_path())
            .map_err(|err| SubmitError::Filesystem(format!("{path}: {err}")))?;
        debug!(%location, %path, "uploading file");
        let status = bucket
            .put_object_stream(&mut file, &location.key)
            .map_err(|err| store_failure(err.to_string()))?;
        if !(200..300).contains(&status) {
            return Err(SubmitError::RemoteStatus {
                service: SERVICE,
                status,
                message: format!("upload of {path} to {location} rejected"),
            });
        }
        info!(%location, "upload completed");
        Ok(())
    }
}

fn store_failure(message: String) -> SubmitError {
    SubmitError::RemoteCallFailed {
        service: SERVICE,
        message,
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    #[test]
    fn parse_locations() {
        let location = ObjectLocation::parse("s3://encode-files/2024/01/02/abc/ENCFF001.fastq.gz")
            .unwrap();
        assert_eq!(location.bucket, "encode-files");
        assert_eq!(location.key, "2024/01/02/abc/ENCFF001.fastq.gz");
        assert_eq!(location.to_string(), "s3://encode-files/2024/01/02/abc/ENCFF001.fastq.gz");
        assert!(ObjectLocation::parse("s3://bucket-only").is_none());
        assert!(ObjectLocation::parse("s3://bucket/").is_none());
        assert!(ObjectLocation::parse("gs://bucket/key").is_none());
    }

    #[test]
    fn credentials_are_parsed_and_redacted() {
        let creds = UploadCredentials::from_value(&json!({
            "access_key": "AKIA",
            "secret_key": "very-secret",
            "session_token": "token",
            "upload_url": "s3://bucket/key.bam"
        }))
        .unwrap();
        assert_eq!(creds.location().unwrap().key, "key.bam");
        let rendered = format!("{creds:?}");
        assert!(!rendered.contains("very-secret"));
        assert!(!rendered.contains("AKIA"));

        assert_matches!(
            UploadCredentials::from_value(&json!({"access_key": "a"})),
            Err(SubmitError::MalformedResponse(_))
        );
    }
}
