//! Unit tests for typed request and response payloads.

use chrono::Utc;
use serde_json::json;

use vault_intercom::dispatch::{
    DappPermission, IntercomRequest, IntercomResponse, StateSnapshot,
};

#[test]
fn decodes_each_request_kind() {
    let cases = [
        (json!({"type": "ping"}), "ping"),
        (json!({"type": "get_state"}), "get_state"),
        (json!({"type": "get_confirmation", "id": "c1"}), "get_confirmation"),
        (json!({"type": "confirmation", "id": "c1", "confirm": true}), "confirmation"),
        (
            json!({"type": "operations", "source": "tz1", "network": "main", "operations": [{"kind": "transaction"}]}),
            "operations",
        ),
        (json!({"type": "sign", "source": "tz1", "bytes": "05"}), "sign"),
        (
            json!({"type": "dapp_permission", "origin": "https://app", "name": "App", "network": "main"}),
            "dapp_permission",
        ),
        (json!({"type": "dapp_disconnect", "origin": "https://app"}), "dapp_disconnect"),
        (json!({"type": "await_operation", "hash": "op1"}), "await_operation"),
    ];

    for (payload, kind) in cases {
        let request: IntercomRequest = serde_json::from_value(payload).expect("decode");
        assert_eq!(request.kind(), kind);
    }
}

#[test]
fn only_side_effecting_requests_are_gated() {
    let gated = [
        json!({"type": "operations", "source": "tz1", "network": "main", "operations": []}),
        json!({"type": "sign", "source": "tz1", "bytes": "05"}),
        json!({"type": "dapp_permission", "origin": "o", "name": "n", "network": "main"}),
    ];
    for payload in gated {
        let request: IntercomRequest = serde_json::from_value(payload).expect("decode");
        assert!(request.requires_confirmation(), "{} should be gated", request.kind());
    }

    let direct = [
        json!({"type": "ping"}),
        json!({"type": "confirmation", "id": "c", "confirm": false}),
        json!({"type": "await_operation", "hash": "op"}),
    ];
    for payload in direct {
        let request: IntercomRequest = serde_json::from_value(payload).expect("decode");
        assert!(!request.requires_confirmation(), "{} should not be gated", request.kind());
    }
}

#[test]
fn confirmation_password_is_optional() {
    let request: IntercomRequest =
        serde_json::from_value(json!({"type": "confirmation", "id": "c1", "confirm": true}))
            .expect("decode");
    assert_eq!(
        request,
        IntercomRequest::Confirmation {
            id: "c1".into(),
            confirm: true,
            password: None
        }
    );
}

#[test]
fn unknown_request_type_is_rejected() {
    let result = serde_json::from_value::<IntercomRequest>(json!({"type": "launch"}));
    assert!(result.is_err());
}

#[test]
fn responses_are_tagged() {
    let pong = serde_json::to_value(IntercomResponse::Pong).expect("serialize");
    assert_eq!(pong, json!({"type": "pong"}));

    let sent = serde_json::to_value(IntercomResponse::OperationsSent { hash: "op1".into() })
        .expect("serialize");
    assert_eq!(sent, json!({"type": "operations_sent", "hash": "op1"}));
}

#[test]
fn state_response_flattens_snapshot() {
    let snapshot = StateSnapshot {
        channels: 2,
        queued: 1,
        confirmation: json!({"state": "idle"}),
        permissions: vec![DappPermission {
            origin: "https://app".into(),
            name: "App".into(),
            network: "main".into(),
            granted_at: Utc::now(),
        }],
    };
    let value = serde_json::to_value(IntercomResponse::State(snapshot)).expect("serialize");

    assert_eq!(value["type"], "state");
    assert_eq!(value["channels"], 2);
    assert_eq!(value["queued"], 1);
    assert_eq!(value["confirmation"]["state"], "idle");
    assert_eq!(value["permissions"][0]["origin"], "https://app");
}
