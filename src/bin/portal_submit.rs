use std::fs;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use serde_json::Value;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use portal_submit::config::{ConfigLoader, Settings};
use portal_submit::domain::{ID_KEY, PROFILE_KEY, Payload, RecordIdentity, SubmitIntent};
use portal_submit::error::SubmitError;
use portal_submit::ledger::{Ledger, write_file_atomic};
use portal_submit::output::{JsonOutput, LogProgress};
use portal_submit::poller::TransferStatusPoller;
use portal_submit::portal::{Frame, PortalClient, PortalHttpClient};
use portal_submit::schema::SchemaCatalog;
use portal_submit::storage::S3ObjectStore;
use portal_submit::submit::{SubmissionOrchestrator, SubmitRequest};
use portal_submit::transfer::{
    StorageTransferHttpClient, TransferJobManager, TransferSink, TransferSourceSpec, UrlListEntry,
    render_url_list,
};

#[derive(Parser)]
#[command(name = "portal-submit")]
#[command(about = "Submit metadata records to the data portal and move their files between clouds")]
#[command(version, author)]
struct Cli {
    /// Path to portal-submit.json
    #[arg(long, global = true)]
    config: Option<String>,

    /// Resolve and validate against the live portal, but send no PATCH/POST/upload
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Create or update records from a JSON payload file")]
    Submit(SubmitArgs),
    #[command(about = "Upload the bytes of an existing file record")]
    Upload(UploadArgs),
    #[command(about = "Remove optional properties from a record, optionally patching it too")]
    Remove(RemoveArgs),
    #[command(about = "Create and inspect cloud transfer jobs")]
    Transfer(TransferArgs),
    #[command(about = "Write a TsvHttpData-1.0 URL list for file records")]
    UrlList(UrlListArgs),
}

#[derive(Args)]
struct SubmitArgs {
    /// Profile token, e.g. biosample or /profiles/biosample.json
    #[arg(long)]
    profile: Option<String>,

    /// JSON file holding one payload object or an array of them
    #[arg(long)]
    payload: Utf8PathBuf,

    #[arg(long, conflicts_with_all = ["update", "upsert"])]
    create: bool,

    #[arg(long, conflicts_with_all = ["create", "upsert"])]
    update: bool,

    #[arg(long, conflicts_with_all = ["create", "update"])]
    upsert: bool,

    /// Identifier of the record to update
    #[arg(long)]
    id: Option<String>,

    /// Local file for a file record
    #[arg(long)]
    file: Option<Utf8PathBuf>,

    #[arg(long)]
    no_upload: bool,
}

#[derive(Args)]
struct UploadArgs {
    #[arg(long)]
    id: String,

    #[arg(long)]
    file: Option<Utf8PathBuf>,
}

#[derive(Args)]
struct RemoveArgs {
    #[arg(long)]
    id: String,

    /// Property to remove; repeat for several
    #[arg(long = "prop", required = true)]
    props: Vec<String>,

    /// JSON file with one object of properties to set in the same request
    #[arg(long)]
    payload: Option<Utf8PathBuf>,
}

#[derive(Args)]
struct TransferArgs {
    #[command(subcommand)]
    command: TransferCommand,
}

#[derive(Subcommand)]
enum TransferCommand {
    #[command(about = "Create a one-off transfer job")]
    Create(TransferCreateArgs),
    #[command(about = "List executions of a transfer job")]
    Executions(JobArgs),
    #[command(about = "Poll a transfer job until it finishes")]
    Status(StatusArgs),
    #[command(about = "Show one execution by its operation name")]
    Operation(OperationArgs),
}

#[derive(Args)]
struct TransferCreateArgs {
    #[arg(long)]
    s3_bucket: Option<String>,

    #[arg(long = "key")]
    keys: Vec<String>,

    #[arg(long = "s3-uri")]
    s3_uris: Vec<String>,

    #[arg(long)]
    url_list: Option<String>,

    /// Destination bucket
    #[arg(long)]
    sink: String,

    #[arg(long)]
    description: Option<String>,

    #[arg(long)]
    overwrite: bool,

    /// Poll the new job until it finishes
    #[arg(long)]
    wait: bool,
}

#[derive(Args)]
struct JobArgs {
    #[arg(long)]
    job: String,
}

#[derive(Args)]
struct OperationArgs {
    /// e.g. transferOperations/transferJobs-4242-1714557600
    #[arg(long)]
    name: String,
}

#[derive(Args)]
struct StatusArgs {
    #[arg(long)]
    job: String,

    #[arg(long)]
    attempts: Option<u32>,

    /// Seconds between attempts
    #[arg(long)]
    interval: Option<u64>,
}

#[derive(Args)]
struct UrlListArgs {
    #[arg(long = "id", required = true)]
    ids: Vec<String>,

    #[arg(long)]
    output: Utf8PathBuf,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<SubmitError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &SubmitError) -> u8 {
    match error {
        SubmitError::UploadFailedAfterCreate { .. } => 4,
        SubmitError::MissingConfig
        | SubmitError::ConfigParse(_)
        | SubmitError::InvalidConfig(_) => 2,
        SubmitError::MissingUploadCredentials(_) | SubmitError::MalformedResponse(_) => 3,
        error if error.is_validation() => 2,
        error if error.is_remote() => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut settings = ConfigLoader::resolve(cli.config.as_deref())?;
    if cli.dry_run {
        settings.submission.dry_run = true;
    }

    match cli.command {
        Commands::Submit(args) => run_submit(args, settings),
        Commands::Upload(args) => run_upload(args, settings),
        Commands::Remove(args) => run_remove(args, settings),
        Commands::Transfer(args) => run_transfer(args.command, settings),
        Commands::UrlList(args) => run_url_list(args, settings),
    }
}

fn orchestrator(
    settings: &Settings,
) -> miette::Result<SubmissionOrchestrator<PortalHttpClient, S3ObjectStore>> {
    let portal = PortalHttpClient::new(&settings.portal)?;
    let store = S3ObjectStore::new(&settings.storage);
    let orchestrator = SubmissionOrchestrator::new(
        portal,
        store,
        Arc::new(SchemaCatalog::new()),
        settings.defaults.clone(),
        settings.submission,
    );
    Ok(match Ledger::new() {
        Ok(ledger) => orchestrator.with_ledger(ledger),
        Err(err) => {
            warn!(error = %err, "submission ledger disabled");
            orchestrator
        }
    })
}

fn run_submit(args: SubmitArgs, mut settings: Settings) -> miette::Result<()> {
    if args.no_upload {
        settings.submission.upload_file = false;
    }
    let intent = if args.create {
        SubmitIntent::Create
    } else if args.update {
        SubmitIntent::Update
    } else {
        SubmitIntent::Upsert
    };
    let payloads = read_payloads(&args.payload)?;
    if payloads.len() > 1 && (args.id.is_some() || args.file.is_some()) {
        return Err(miette::Report::msg(
            "--id and --file apply to a single payload; put `_enc_id`/`submitted_file_name` in each object instead",
        ));
    }
    let orchestrator = orchestrator(&settings)?;

    let mut outcomes = Vec::with_capacity(payloads.len());
    for payload in payloads {
        let (profile, identifier) = routing(&payload, args.profile.as_deref(), args.id.as_deref())?;
        let mut request = SubmitRequest::new(intent);
        if let Some(identifier) = identifier {
            request = request.with_identifier(identifier);
        }
        if let Some(file) = &args.file {
            request = request.with_file(file.clone());
        }
        outcomes.push(orchestrator.submit(&profile, payload, &request, &LogProgress)?);
    }
    JsonOutput::print_outcomes(&outcomes).into_diagnostic()
}

/// Reads the profile and target identifier, honouring the `_profile`, `@id` and `_enc_id` keys
/// older payload files carry.
fn routing(
    payload: &Payload,
    profile: Option<&str>,
    id: Option<&str>,
) -> Result<(String, Option<RecordIdentity>), SubmitError> {
    let profile = profile
        .map(str::to_string)
        .or_else(|| payload.get(PROFILE_KEY).and_then(Value::as_str).map(str::to_string))
        .or_else(|| payload.get("@id").and_then(Value::as_str).map(str::to_string))
        .ok_or(SubmitError::ProfileNotSpecified)?;
    let identifier = id
        .or_else(|| payload.get(ID_KEY).and_then(Value::as_str))
        .map(str::parse::<RecordIdentity>)
        .transpose()?;
    Ok((profile, identifier))
}

fn read_payloads(path: &Utf8PathBuf) -> miette::Result<Vec<Payload>> {
    let content = fs::read_to_string(path.as_std_path())
        .map_err(|err| SubmitError::Filesystem(format!("{path}: {err}")))?;
    let value: Value = serde_json::from_str(&content)
        .map_err(|err| miette::Report::msg(format!("{path} is not valid JSON: {err}")))?;
    let items = match value {
        Value::Object(map) => vec![map],
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::Object(map) => Ok(map),
                _ => Err(miette::Report::msg(format!(
                    "{path}: every payload must be a JSON object"
                ))),
            })
            .collect::<miette::Result<Vec<_>>>()?,
        _ => {
            return Err(miette::Report::msg(format!(
                "{path}: expected a JSON object or an array of objects"
            )));
        }
    };
    Ok(items)
}

fn run_upload(args: UploadArgs, settings: Settings) -> miette::Result<()> {
    let identifier = args.id.parse::<RecordIdentity>()?;
    let orchestrator = orchestrator(&settings)?;
    let outcome = orchestrator.upload(&identifier, args.file.as_deref(), &LogProgress)?;
    JsonOutput::print_outcomes(&[outcome]).into_diagnostic()
}

fn run_remove(args: RemoveArgs, settings: Settings) -> miette::Result<()> {
    let identifier = args.id.parse::<RecordIdentity>()?;
    let patch = match &args.payload {
        Some(path) => {
            let mut payloads = read_payloads(path)?;
            if payloads.len() != 1 {
                return Err(miette::Report::msg(format!(
                    "{path}: remove takes exactly one payload object"
                )));
            }
            payloads.remove(0)
        }
        None => Payload::new(),
    };
    let orchestrator = orchestrator(&settings)?;
    let outcome = orchestrator.remove_properties(&identifier, &args.props, patch, &LogProgress)?;
    JsonOutput::print_outcomes(&[outcome]).into_diagnostic()
}

fn run_transfer(command: TransferCommand, settings: Settings) -> miette::Result<()> {
    let service = StorageTransferHttpClient::new(&settings.transfer)?;
    let manager = TransferJobManager::new(service, &settings.transfer)?;
    match command {
        TransferCommand::Create(args) => {
            let source = if args.s3_uris.is_empty() {
                TransferSourceSpec {
                    s3_bucket: args.s3_bucket,
                    s3_keys: args.keys,
                    url_list: args.url_list,
                }
            } else {
                if args.s3_bucket.is_some() || !args.keys.is_empty() {
                    return Err(SubmitError::InvalidSourceSpec(
                        "--s3-uri cannot be combined with --s3-bucket/--key".to_string(),
                    )
                    .into());
                }
                let mut spec = TransferSourceSpec::from_s3_uris(&args.s3_uris)?;
                spec.url_list = args.url_list;
                spec
            };
            let sink = TransferSink::new(&args.sink, args.overwrite)?;
            let job = manager.create(&source, &sink, args.description.as_deref())?;
            JsonOutput::print_job(&job).into_diagnostic()?;
            if args.wait {
                let result = TransferStatusPoller::new(&manager).await_terminal(
                    &job.name,
                    settings.transfer.poll_attempts,
                    settings.transfer.poll_interval,
                    &LogProgress,
                )?;
                JsonOutput::print_poll(&result).into_diagnostic()?;
                result.into_terminal()?;
            }
            Ok(())
        }
        TransferCommand::Executions(args) => {
            let executions = manager.list_executions(&args.job)?;
            JsonOutput::print_executions(&executions).into_diagnostic()
        }
        TransferCommand::Operation(args) => {
            let execution = manager.get_execution(&args.name)?;
            JsonOutput::print_executions(&[execution]).into_diagnostic()
        }
        TransferCommand::Status(args) => {
            let attempts = args.attempts.unwrap_or(settings.transfer.poll_attempts);
            let interval = args
                .interval
                .map(Duration::from_secs)
                .unwrap_or(settings.transfer.poll_interval);
            let result = TransferStatusPoller::new(&manager).await_terminal(
                &args.job,
                attempts,
                interval,
                &LogProgress,
            )?;
            JsonOutput::print_poll(&result).into_diagnostic()?;
            result.into_terminal()?;
            Ok(())
        }
    }
}

fn run_url_list(args: UrlListArgs, settings: Settings) -> miette::Result<()> {
    let portal = PortalHttpClient::new(&settings.portal)?;
    let mut entries = Vec::with_capacity(args.ids.len());
    for id in &args.ids {
        let identifier = id.parse::<RecordIdentity>()?;
        let record = portal
            .get(identifier.as_str(), Some(Frame::Object))?
            .ok_or_else(|| SubmitError::RecordStateMismatch {
                intent: "list".to_string(),
                detail: format!("no file record matches {identifier}"),
            })?;
        entries.push(UrlListEntry::from_file_record(&record)?);
    }
    let rendered = render_url_list(&entries)?;
    write_file_atomic(&args.output, rendered.as_bytes())?;
    eprintln!("wrote {} entries to {}", entries.len(), args.output);
    Ok(())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn routing_reads_control_keys() {
        let body = payload(json!({"_profile": "biosample", "_enc_id": "ENCBS123ABC"}));
        let (profile, identifier) = routing(&body, None, None).unwrap();
        assert_eq!(profile, "biosample");
        assert_eq!(identifier.unwrap().id, "ENCBS123ABC");

        let body = payload(json!({"@id": "/profiles/library.json"}));
        let (profile, identifier) = routing(&body, None, None).unwrap();
        assert_eq!(profile, "/profiles/library.json");
        assert!(identifier.is_none());

        let (profile, _) = routing(&body, Some("file"), None).unwrap();
        assert_eq!(profile, "file");

        assert_matches!(
            routing(&payload(json!({})), None, None),
            Err(SubmitError::ProfileNotSpecified)
        );
    }

    #[test]
    fn exit_codes() {
        assert_eq!(map_exit_code(&SubmitError::ProfileNotSpecified), 2);
        assert_eq!(
            map_exit_code(&SubmitError::RemoteStatus {
                service: "portal",
                status: 500,
                message: String::new(),
            }),
            3
        );
        assert_eq!(
            map_exit_code(&SubmitError::UploadFailedAfterCreate {
                record_id: "/files/ENCFF001AAA/".to_string(),
                message: String::new(),
            }),
            4
        );
        assert_eq!(
            map_exit_code(&SubmitError::PropertyNotRemovable {
                profile: "biosample".to_string(),
                property: "lab".to_string(),
                reason: "it is required",
            }),
            2
        );
        assert_eq!(map_exit_code(&SubmitError::Filesystem(String::new())), 1);
    }
}
