use std::sync::Mutex;
use std::time::Duration;

use assert_matches::assert_matches;
use chrono::NaiveDate;
use serde_json::{Value, json};

use portal_submit::config::{AwsAccessKey, TransferSettings};
use portal_submit::error::SubmitError;
use portal_submit::poller::{PollResult, TransferStatusPoller};
use portal_submit::submit::NoProgress;
use portal_submit::transfer::{
    TransferJobManager, TransferService, TransferSink, TransferSource, TransferSourceSpec,
    TransferStatus,
};

/// Replays a fixed sequence of operation listings, repeating the last one.
struct MockTransfer {
    listings: Vec<Vec<Value>>,
    creates: Mutex<usize>,
    lists: Mutex<usize>,
    last_spec: Mutex<Option<Value>>,
}

impl MockTransfer {
    fn new(listings: Vec<Vec<Value>>) -> Self {
        Self {
            listings,
            creates: Mutex::new(0),
            lists: Mutex::new(0),
            last_spec: Mutex::new(None),
        }
    }
}

impl TransferService for MockTransfer {
    fn create_job(&self, spec: &Value) -> Result<Value, SubmitError> {
        *self.creates.lock().unwrap() += 1;
        *self.last_spec.lock().unwrap() = Some(spec.clone());
        Ok(json!({"name": "transferJobs/4242", "status": "ENABLED"}))
    }

    fn list_operations(&self, _job_name: &str) -> Result<Vec<Value>, SubmitError> {
        let mut lists = self.lists.lock().unwrap();
        let index = (*lists).min(self.listings.len().saturating_sub(1));
        *lists += 1;
        Ok(self.listings.get(index).cloned().unwrap_or_default())
    }

    fn get_operation(&self, name: &str) -> Result<Value, SubmitError> {
        Ok(operation(name, "SUCCESS", "2024-05-01T10:00:00Z"))
    }
}

fn operation(name: &str, status: &str, started: &str) -> Value {
    json!({
        "name": name,
        "metadata": {
            "transferJobName": "transferJobs/4242",
            "status": status,
            "startTime": started,
            "counters": {"objectsCopiedToSink": "12", "bytesCopiedToSink": 4096}
        }
    })
}

fn settings(with_aws: bool) -> TransferSettings {
    TransferSettings {
        project: Some("encode-transfers".to_string()),
        access_token: Some("ya29.test".to_string()),
        aws_source: with_aws.then(|| AwsAccessKey {
            access_key_id: "AKIA-test".to_string(),
            secret_access_key: "secret".to_string(),
        }),
        poll_attempts: 5,
        poll_interval: Duration::from_secs(1),
    }
}

fn manager(service: MockTransfer) -> TransferJobManager<MockTransfer> {
    TransferJobManager::new(service, &settings(true)).unwrap()
}

#[test]
fn object_store_job_is_created_and_terminal_run_polled_once() {
    let manager = manager(MockTransfer::new(vec![vec![operation(
        "transferOperations/op-1",
        "SUCCESS",
        "2024-05-01T10:00:00Z",
    )]]));
    let source = TransferSourceSpec::object_store(
        "encode-public",
        vec!["2024/05/01/reads.fastq.gz".to_string()],
    );
    let sink = TransferSink::new("gs://encode-mirror", false).unwrap();
    let job = manager.create(&source, &sink, None).unwrap();
    assert_eq!(job.id(), "4242");
    assert_eq!(sink.bucket, "encode-mirror");
    assert_matches!(job.source, TransferSource::ObjectStore { ref bucket, .. } if bucket == "encode-public");
    assert_eq!(*manager.service().creates.lock().unwrap(), 1);
    let sent = manager.service().last_spec.lock().unwrap().clone().unwrap();
    assert_eq!(sent["description"], json!("2024/05/01/reads.fastq.gz"));
    assert_eq!(sent["status"], json!("ENABLED"));

    let sleeps = Mutex::new(0usize);
    let result = TransferStatusPoller::new(&manager)
        .with_sleeper(|_| *sleeps.lock().unwrap() += 1)
        .await_terminal(&job.name, 1, Duration::from_secs(30), &NoProgress)
        .unwrap();
    assert_eq!(*manager.service().lists.lock().unwrap(), 1);
    assert_eq!(*sleeps.lock().unwrap(), 0);
    let execution = result.into_terminal().unwrap();
    assert_eq!(execution.status, TransferStatus::Success);
    assert_eq!(execution.name, "transferOperations/op-1");
    assert_eq!(execution.counter("objectsCopiedToSink"), 12);
    assert_eq!(execution.counter("bytesCopiedToSink"), 4096);
}

#[test]
fn conflicting_sources_fail_before_any_remote_call() {
    let manager = manager(MockTransfer::new(vec![]));
    let sink = TransferSink::new("encode-mirror", false).unwrap();

    let both = TransferSourceSpec {
        s3_bucket: Some("encode-public".to_string()),
        s3_keys: vec!["a.bam".to_string()],
        url_list: Some("https://example.org/urls.tsv".to_string()),
    };
    assert_matches!(
        manager.create(&both, &sink, None),
        Err(SubmitError::InvalidSourceSpec(_))
    );
    let neither = TransferSourceSpec::default();
    assert_matches!(
        manager.create(&neither, &sink, None),
        Err(SubmitError::InvalidSourceSpec(_))
    );
    assert_matches!(
        manager.create(&TransferSourceSpec::url_list("ftp://example.org/urls.tsv"), &sink, None),
        Err(SubmitError::InvalidSourceSpec(_))
    );
    assert_eq!(*manager.service().creates.lock().unwrap(), 0);
}

#[test]
fn pending_execution_is_reported_after_attempts_run_out() {
    let running = operation("transferOperations/op-1", "IN_PROGRESS", "2024-05-01T10:00:00Z");
    let manager = manager(MockTransfer::new(vec![vec![], vec![running]]));
    let sleeps = Mutex::new(Vec::new());
    let result = TransferStatusPoller::new(&manager)
        .with_sleeper(|interval| sleeps.lock().unwrap().push(interval))
        .await_terminal("transferJobs/4242", 4, Duration::from_secs(2), &NoProgress)
        .unwrap();

    assert_eq!(*manager.service().lists.lock().unwrap(), 4);
    assert_eq!(*sleeps.lock().unwrap(), vec![Duration::from_secs(2); 3]);
    assert!(!result.is_terminal());
    assert_eq!(result.execution().status, TransferStatus::InProgress);
    assert_matches!(
        result.into_terminal(),
        Err(SubmitError::TransferNotTerminal { status, .. }) if status == "IN_PROGRESS"
    );
}

#[test]
fn job_without_executions_is_an_error() {
    let manager = manager(MockTransfer::new(vec![vec![]]));
    let result = TransferStatusPoller::new(&manager)
        .with_sleeper(|_| {})
        .await_terminal("transferJobs/4242", 0, Duration::ZERO, &NoProgress);
    assert_matches!(
        result,
        Err(SubmitError::TransferNotTerminal { status, .. }) if status == "NOT_STARTED"
    );
    assert_eq!(*manager.service().lists.lock().unwrap(), 1);
}

#[test]
fn executions_are_ordered_by_start_time() {
    let manager = manager(MockTransfer::new(vec![vec![
        operation("transferOperations/late", "FAILED", "2024-05-02T09:00:00Z"),
        operation("transferOperations/early", "SUCCESS", "2024-05-01T09:00:00Z"),
    ]]));
    let executions = manager.list_executions("transferJobs/4242").unwrap();
    let names: Vec<&str> = executions.iter().map(|execution| execution.name.as_str()).collect();
    assert_eq!(names, vec!["transferOperations/early", "transferOperations/late"]);

    let result = TransferStatusPoller::new(&manager)
        .await_terminal("transferJobs/4242", 3, Duration::ZERO, &NoProgress)
        .unwrap();
    assert_matches!(result, PollResult::Terminal(execution) if execution.status == TransferStatus::Failed);
}

#[test]
fn job_spec_runs_once_and_carries_source() {
    let manager = manager(MockTransfer::new(vec![]));
    let run_on = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
    let sink = TransferSink::new("encode-mirror", true).unwrap();
    let source = TransferSourceSpec::object_store("encode-public", vec!["/a.bam".to_string()])
        .validate()
        .unwrap();
    let spec = manager.job_spec(&source, &sink, "mirror", run_on).unwrap();

    let date = json!({"year": 2024, "month": 5, "day": 1});
    assert_eq!(spec["projectId"], json!("encode-transfers"));
    assert_eq!(spec["schedule"]["scheduleStartDate"], date);
    assert_eq!(spec["schedule"]["scheduleEndDate"], date);
    assert_eq!(spec["transferSpec"]["gcsDataSink"]["bucketName"], json!("encode-mirror"));
    assert_eq!(
        spec["transferSpec"]["awsS3DataSource"]["bucketName"],
        json!("encode-public")
    );
    assert_eq!(
        spec["transferSpec"]["objectConditions"]["includePrefixes"],
        json!(["a.bam"])
    );
    assert_eq!(
        spec["transferSpec"]["transferOptions"]["overwriteObjectsAlreadyExistingInSink"],
        json!(true)
    );

    let list = TransferSourceSpec::url_list("https://example.org/urls.tsv")
        .validate()
        .unwrap();
    let spec = manager.job_spec(&list, &sink, "mirror", run_on).unwrap();
    assert_eq!(
        spec["transferSpec"]["httpDataSource"]["listUrl"],
        json!("https://example.org/urls.tsv")
    );
    assert!(spec["transferSpec"].get("awsS3DataSource").is_none());
}

#[test]
fn object_store_source_needs_aws_credentials() {
    let manager = TransferJobManager::new(MockTransfer::new(vec![]), &settings(false)).unwrap();
    let source = TransferSourceSpec::object_store("encode-public", vec!["a.bam".to_string()]);
    let sink = TransferSink::new("encode-mirror", false).unwrap();
    assert_matches!(
        manager.create(&source, &sink, None),
        Err(SubmitError::InvalidConfig(_))
    );
    assert_eq!(*manager.service().creates.lock().unwrap(), 0);
}

#[test]
fn manager_requires_a_project() {
    let mut settings = settings(true);
    settings.project = None;
    assert_matches!(
        TransferJobManager::new(MockTransfer::new(vec![]), &settings).err(),
        Some(SubmitError::InvalidConfig(_))
    );
}

#[test]
fn single_execution_is_read_by_operation_name() {
    let manager = manager(MockTransfer::new(vec![]));
    let execution = manager
        .get_execution("transferOperations/transferJobs-4242-1714557600")
        .unwrap();
    assert_eq!(execution.name, "transferOperations/transferJobs-4242-1714557600");
    assert_eq!(execution.status, TransferStatus::Success);
    assert_eq!(execution.counter("objectsCopiedToSink"), 12);
    assert_eq!(*manager.service().lists.lock().unwrap(), 0);
}
