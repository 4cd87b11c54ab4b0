//! Wire Compatibility Tests
//!
//! These tests pin the JSON frame shapes the coordinator expects. The kind
//! strings MUST remain stable: the coordinator dispatches on them verbatim.

use acqsync_protocol::*;
use serde_json::json;

/// Verify kind strings match the documented values in both directions
#[test]
fn test_all_kinds_compatibility() {
    let kinds = [
        (MessageKind::StateUpdate, "state-update"),
        (MessageKind::StateUpdatePartial, "state-update-partial"),
    ];

    for (kind, expected) in kinds {
        assert_eq!(kind.as_str(), expected, "{:?} should be {}", kind, expected);
        assert_eq!(
            MessageKind::parse(expected),
            Some(kind),
            "{} should parse to {:?}",
            expected,
            kind
        );
        assert_eq!(
            serde_json::to_value(kind).unwrap(),
            json!(expected),
            "serde form of {:?} should be {}",
            kind,
            expected
        );
    }
}

/// A frame produced by the agent must decode to the same message
#[test]
fn test_agent_frames_are_readable_by_agent() -> anyhow::Result<()> {
    let msg = ChannelMessage::partial(
        "completed_groups",
        json!({"Position_1": {"members": 41, "context": "tomography"}}),
    );
    let text = msg.encode()?;
    let back = ChannelMessage::decode(&text)?.expect("known kind");
    assert_eq!(back, msg);
    Ok(())
}

/// Coordinator frames carry extra keys that must be tolerated
#[test]
fn test_coordinator_frame_with_extra_fields() -> anyhow::Result<()> {
    let text = r#"{
        "message": "state-update",
        "attribute": "data_collection_ids",
        "value": {"Position_1": 1234},
        "origin": "server"
    }"#;
    let msg = ChannelMessage::decode(text)?.expect("known kind");
    assert_eq!(msg.kind, MessageKind::StateUpdate);
    assert_eq!(msg.value["Position_1"], 1234);
    Ok(())
}

#[test]
fn test_transfer_progress_serializes_flat() -> anyhow::Result<()> {
    let progress = TransferProgress {
        source: "/data/session1".to_string(),
        files_transferred: 3,
        files_failed: 1,
        last_exit_code: Some(23),
        ..Default::default()
    };
    let value = serde_json::to_value(&progress)?;
    assert_eq!(value["files_transferred"], 3);
    assert_eq!(value["last_exit_code"], 23);
    assert_eq!(value["source"], "/data/session1");
    Ok(())
}
