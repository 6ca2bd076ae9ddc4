//! Unit tests for operation status judgement and RPC block parsing.

use serde_json::{json, Value};

use vault_intercom::operation::rpc::parse_block_operations;
use vault_intercom::operation::{judge, OperationRecord, OperationStatus};
use vault_intercom::AppError;

fn record(hash: &str, status: OperationStatus) -> OperationRecord {
    OperationRecord {
        hash: hash.into(),
        status,
        level: Some(10),
        data: Value::Null,
    }
}

#[test]
fn absent_hash_has_no_verdict() {
    let records = [record("opA", OperationStatus::Applied)];
    assert!(judge("opB", &records).is_none());
}

#[test]
fn applied_hash_is_success() {
    let records = [
        record("opA", OperationStatus::Applied),
        record("opB", OperationStatus::Applied),
    ];
    let verdict = judge("opB", &records).expect("verdict").expect("applied");
    assert_eq!(verdict.hash, "opB");
}

#[test]
fn non_applied_status_is_failure() {
    for status in [
        OperationStatus::Failed,
        OperationStatus::Backtracked,
        OperationStatus::Skipped,
        OperationStatus::Unknown,
    ] {
        let records = [record("opA", status)];
        let verdict = judge("opA", &records).expect("verdict");
        assert!(matches!(verdict, Err(AppError::OperationFailed(_))));
    }
}

#[test]
fn failure_wins_over_applied_duplicate() {
    let records = [
        record("opA", OperationStatus::Applied),
        record("opA", OperationStatus::Backtracked),
    ];
    let verdict = judge("opA", &records).expect("verdict");
    assert!(matches!(verdict, Err(AppError::OperationFailed(msg)) if msg.contains("Backtracked")));
}

#[test]
fn status_parse_never_defaults_to_applied() {
    assert_eq!(OperationStatus::parse("applied"), OperationStatus::Applied);
    assert_eq!(OperationStatus::parse("failed"), OperationStatus::Failed);
    assert_eq!(OperationStatus::parse("pending"), OperationStatus::Unknown);
    assert!(!OperationStatus::parse("").is_applied());
}

#[test]
fn unknown_status_deserializes_as_unknown() {
    let status: OperationStatus = serde_json::from_value(json!("refused")).expect("deserialize");
    assert_eq!(status, OperationStatus::Unknown);
}

fn transaction(hash: &str, statuses: &[&str]) -> Value {
    let contents: Vec<Value> = statuses
        .iter()
        .map(|status| {
            json!({
                "kind": "transaction",
                "metadata": { "operation_result": { "status": status } }
            })
        })
        .collect();
    json!({ "hash": hash, "contents": contents })
}

#[test]
fn parses_operation_passes() {
    let body = json!([
        [{ "hash": "endorsement", "contents": [{ "kind": "attestation", "metadata": {} }] }],
        [],
        [],
        [
            transaction("opApplied", &["applied", "applied"]),
            transaction("opBacktracked", &["backtracked", "failed"]),
        ]
    ]);

    let records = parse_block_operations(42, &body).expect("parse");
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.level == Some(42)));

    let status_of = |hash: &str| {
        records
            .iter()
            .find(|r| r.hash == hash)
            .map(|r| r.status.clone())
            .expect("present")
    };
    assert_eq!(status_of("endorsement"), OperationStatus::Applied);
    assert_eq!(status_of("opApplied"), OperationStatus::Applied);
    assert_eq!(status_of("opBacktracked"), OperationStatus::Backtracked);
}

#[test]
fn operations_without_hash_are_skipped() {
    let body = json!([[{ "contents": [] }, transaction("opA", &["applied"])]]);
    let records = parse_block_operations(1, &body).expect("parse");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].hash, "opA");
}

#[test]
fn non_list_body_is_network_error() {
    let result = parse_block_operations(1, &json!({ "oops": true }));
    assert!(matches!(result, Err(AppError::Network(_))));

    let result = parse_block_operations(1, &json!([{ "hash": "x" }]));
    assert!(matches!(result, Err(AppError::Network(msg)) if msg.contains("validation pass")));
}
