//! Inbound frame classification.
//!
//! Turns one text frame into a control frame, a normalized domain [`Event`],
//! or an unknown-type record. Nothing here touches session state.

use serde_json::Value;
use taskpilot_protocol::{new_id, ControlFrame, Event, EventPayload, InboundFrame};

use crate::error::SessionError;

#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    Control(ControlFrame),
    Domain(Event),
    Unknown { kind: String, payload: Value },
}

/// Classify one frame. `now_ms` stamps events whose frame has no timestamp.
pub fn classify(text: &str, now_ms: u128) -> Result<Classified, SessionError> {
    let frame = InboundFrame::parse(text).map_err(|e| SessionError::Protocol(e.to_string()))?;

    if let Some(control) = ControlFrame::from_frame(&frame) {
        return Ok(Classified::Control(control));
    }

    match EventPayload::from_frame(&frame) {
        Ok(Some(payload)) => {
            let id = frame
                .frame_id()
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| default_event_id(payload.kind(), now_ms));
            let timestamp = frame.timestamp().unwrap_or_else(|| now_ms.to_string());
            Ok(Classified::Domain(Event {
                id,
                timestamp,
                payload,
            }))
        }
        Ok(None) => Ok(Classified::Unknown {
            kind: frame.kind.clone(),
            payload: frame.payload.clone(),
        }),
        Err(e) => Err(SessionError::Protocol(format!("{}: {}", frame.kind, e))),
    }
}

/// `{type}-{time}-{random}`
fn default_event_id(kind: &str, now_ms: u128) -> String {
    let random = new_id();
    let short = random.split('-').next().unwrap_or(&random);
    format!("{}-{}-{}", kind, now_ms, short)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u128 = 1_700_000_000_000;

    #[test]
    fn garbage_is_a_protocol_error() {
        assert!(matches!(
            classify("not json", NOW),
            Err(SessionError::Protocol(_))
        ));
        assert!(matches!(
            classify(r#"{"payload":{}}"#, NOW),
            Err(SessionError::Protocol(_))
        ));
    }

    #[test]
    fn control_frames_are_recognized() {
        assert_eq!(
            classify(r#"{"type":"status","payload":{"message":"Queued"}}"#, NOW).expect("classify"),
            Classified::Control(ControlFrame::Status {
                message: "Queued".to_string()
            })
        );
    }

    #[test]
    fn domain_event_without_id_gets_a_generated_one() {
        let classified = classify(
            r#"{"type":"process_start","payload":{"taskDescription":"Build it"}}"#,
            NOW,
        )
        .expect("classify");
        match classified {
            Classified::Domain(event) => {
                assert_eq!(event.kind(), "process_start");
                assert!(event.id.starts_with("process_start-1700000000000-"));
                assert_eq!(event.timestamp, NOW.to_string());
            }
            other => panic!("unexpected classification: {:?}", other),
        }
    }

    #[test]
    fn domain_event_keeps_frame_id_and_timestamp() {
        let classified = classify(
            r#"{"type":"phase_change","id":"evt-9","timestamp":"2024-05-01T10:00:00Z","payload":{"phaseName":"Build"}}"#,
            NOW,
        )
        .expect("classify");
        match classified {
            Classified::Domain(event) => {
                assert_eq!(event.id, "evt-9");
                assert_eq!(event.timestamp, "2024-05-01T10:00:00Z");
            }
            other => panic!("unexpected classification: {:?}", other),
        }
    }

    #[test]
    fn unknown_type_keeps_its_payload() {
        let classified = classify(r#"{"type":"foo","payload":{"a":1}}"#, NOW).expect("classify");
        assert_eq!(
            classified,
            Classified::Unknown {
                kind: "foo".to_string(),
                payload: serde_json::json!({"a": 1}),
            }
        );
    }
}
