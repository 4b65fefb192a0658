use assert_matches::assert_matches;
use serde_json::json;

use portal_submit::domain::{
    IdentifierKind, RecordIdentity, SubmitOperation, last_path_segment, string_values,
};
use portal_submit::error::SubmitError;

#[test]
fn parse_accession_identifier() {
    let id: RecordIdentity = "/biosamples/ENCBS123ABC/".parse().unwrap();
    assert_eq!(id.as_str(), "biosamples/ENCBS123ABC");
    assert_eq!(id.kind, IdentifierKind::Accession);
}

#[test]
fn parse_uuid_and_alias_identifiers() {
    let uuid: RecordIdentity = "7b3e5c7a-0c52-4c1e-9d32-5a7d5ec1f2a0".parse().unwrap();
    assert_eq!(uuid.kind, IdentifierKind::Uuid);

    let alias: RecordIdentity = "michael-snyder:rep1".parse().unwrap();
    assert_eq!(alias.kind, IdentifierKind::Alias);

    let other: RecordIdentity = "K562".parse().unwrap();
    assert_eq!(other.kind, IdentifierKind::Unknown);
}

#[test]
fn parse_identifier_invalid() {
    assert_matches!(
        "   ".parse::<RecordIdentity>(),
        Err(SubmitError::InvalidIdentifier(_))
    );
    assert_matches!(
        "two words".parse::<RecordIdentity>(),
        Err(SubmitError::InvalidIdentifier(_))
    );
}

#[test]
fn identity_prefers_accession_then_uuid_then_alias() {
    let record = json!({
        "uuid": "7b3e5c7a-0c52-4c1e-9d32-5a7d5ec1f2a0",
        "accession": "ENCFF001ABC",
        "aliases": ["michael-snyder:f1"]
    });
    assert_eq!(
        RecordIdentity::from_record(&record).unwrap().kind,
        IdentifierKind::Accession
    );
    let record = json!({"aliases": ["michael-snyder:f1"]});
    let identity = RecordIdentity::from_record(&record).unwrap();
    assert_eq!(identity.id, "michael-snyder:f1");
    assert!(RecordIdentity::from_record(&json!({"lab": "x"})).is_none());
}

#[test]
fn path_segments_and_values() {
    assert_eq!(last_path_segment("/files/ENCFF001ABC/"), "ENCFF001ABC");
    assert_eq!(last_path_segment("ENCFF001ABC"), "ENCFF001ABC");
    assert_eq!(string_values(&json!(["a", 1, "b"])), vec!["a", "b"]);
    assert_eq!(string_values(&json!(12)), vec!["12"]);
    assert!(string_values(&json!(null)).is_empty());
}

#[test]
fn operations_serialize_lowercase() {
    assert_eq!(serde_json::to_value(SubmitOperation::NoOp).unwrap(), json!("no-op"));
    assert_eq!(SubmitOperation::Patch.to_string(), "patch");
}
