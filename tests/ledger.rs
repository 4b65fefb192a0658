use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use serde_json::json;

use portal_submit::error::SubmitError;
use portal_submit::ledger::{LEDGER_FILE_NAME, Ledger, LedgerEntry, write_file_atomic};

fn temp_ledger(dir: &tempfile::TempDir) -> Ledger {
    let path = Utf8PathBuf::from_path_buf(dir.path().join("nested").join(LEDGER_FILE_NAME)).unwrap();
    Ledger::new_with_path(path)
}

#[test]
fn default_ledger_lives_in_data_dir() {
    let ledger = Ledger::new().unwrap();
    assert!(ledger.path().ends_with(LEDGER_FILE_NAME));
}

#[test]
fn entries_append_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = temp_ledger(&dir);
    assert!(ledger.entries().unwrap().is_empty());

    let first = LedgerEntry::from_record(
        "biosample",
        &json!({"accession": "ENCBS001AAA", "aliases": ["michael-snyder:a", "michael-snyder:b"]}),
    );
    let second = LedgerEntry::from_record("document", &json!({"@id": "/documents/abc/"}));
    ledger.append(&first).unwrap();
    ledger.append(&second).unwrap();

    let entries = ledger.entries().unwrap();
    assert_eq!(entries, vec![first, second]);
    assert_eq!(entries[0].primary_alias.as_deref(), Some("michael-snyder:a"));
    assert_eq!(entries[0].other_aliases, vec!["michael-snyder:b"]);
    assert_eq!(entries[1].record_id, "/documents/abc/");
    assert!(entries[1].primary_alias.is_none());
}

#[test]
fn corrupt_line_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = temp_ledger(&dir);
    write_file_atomic(ledger.path(), b"{\"profile\": \n").unwrap();
    assert_matches!(ledger.entries(), Err(SubmitError::Filesystem(_)));
}

#[test]
fn atomic_write_replaces_content() {
    let dir = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(dir.path().join("urls.tsv")).unwrap();
    write_file_atomic(&path, b"first").unwrap();
    write_file_atomic(&path, b"second").unwrap();
    assert_eq!(std::fs::read_to_string(path.as_std_path()).unwrap(), "second");
}
