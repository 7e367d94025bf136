//! Wire contract for the signaling and presence channels.
//!
//! Both channels speak newline-free JSON envelopes of the shape
//! `{"event": "...", "data": {...}}` with camelCase field names, matching the
//! server's JS peer. Intents flow client to server, events server to client;
//! the presence channel carries the same event shape but only ever emits
//! `identityConfirmed` and `userStatusChanged`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{CallEndReason, CallId, CallerInfo, DeviceStatus, PresenceStatus, UserId};

/// Client to server signaling intents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientIntent {
    #[serde(rename_all = "camelCase")]
    StartCall { target_user_id: UserId },

    #[serde(rename_all = "camelCase")]
    AcceptCall { call_id: CallId },

    #[serde(rename_all = "camelCase")]
    DeclineCall { call_id: CallId },

    #[serde(rename_all = "camelCase")]
    EndCall { call_id: CallId },

    UpdateUserStatus(DeviceStatus),
}

/// Server to client events. Authoritative: these, and only these, move the
/// call session between states.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    IdentityConfirmed {
        user_dehive_id: UserId,
        status: PresenceStatus,
    },

    #[serde(rename_all = "camelCase")]
    IncomingCall {
        call_id: CallId,
        caller_id: UserId,
        #[serde(default)]
        caller_info: CallerInfo,
    },

    #[serde(rename_all = "camelCase")]
    CallAccepted { call_id: CallId },

    #[serde(rename_all = "camelCase")]
    CallDeclined { call_id: CallId },

    #[serde(rename_all = "camelCase")]
    CallEnded {
        call_id: CallId,
        #[serde(default)]
        reason: CallEndReason,
    },

    #[serde(rename_all = "camelCase")]
    UserStatusChanged {
        user_id: UserId,
        status: PresenceStatus,
    },

    Error(ErrorEvent),
}

/// Payload of the server's `error` event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub message: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub details: Option<serde_json::Value>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

pub fn encode_intent(intent: &ClientIntent) -> Result<String, serde_json::Error> {
    serde_json::to_string(intent)
}

/// Decodes one inbound frame. Unknown or malformed events are an `Err`;
/// the dispatcher logs and drops them rather than failing the connection.
pub fn decode_event(text: &str) -> Result<ServerEvent, serde_json::Error> {
    serde_json::from_str(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_call_wire_shape() {
        let intent = ClientIntent::StartCall {
            target_user_id: UserId::from("user-b"),
        };
        assert_eq!(
            encode_intent(&intent).unwrap(),
            r#"{"event":"startCall","data":{"targetUserId":"user-b"}}"#
        );
    }

    #[test]
    fn decline_call_wire_shape() {
        let intent = ClientIntent::DeclineCall {
            call_id: CallId::from("abc123"),
        };
        assert_eq!(
            encode_intent(&intent).unwrap(),
            r#"{"event":"declineCall","data":{"callId":"abc123"}}"#
        );
    }

    #[test]
    fn update_user_status_uses_camel_case_flags() {
        let intent = ClientIntent::UpdateUserStatus(DeviceStatus {
            is_camera: true,
            is_mic: true,
            is_headphone: false,
            is_live: false,
        });
        let text = encode_intent(&intent).unwrap();
        assert!(text.contains(r#""event":"updateUserStatus""#));
        assert!(text.contains(r#""isCamera":true"#));
        assert!(text.contains(r#""isHeadphone":false"#));
    }

    #[test]
    fn decodes_incoming_call() {
        let event = decode_event(
            r#"{"event":"incomingCall","data":{"callId":"abc123","callerId":"user-a","callerInfo":{"displayName":"A"}}}"#,
        )
        .unwrap();
        match event {
            ServerEvent::IncomingCall {
                call_id,
                caller_id,
                caller_info,
            } => {
                assert_eq!(call_id.as_str(), "abc123");
                assert_eq!(caller_id.as_str(), "user-a");
                assert_eq!(caller_info.display_name.as_deref(), Some("A"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn decodes_caller_info_when_absent() {
        let event = decode_event(
            r#"{"event":"incomingCall","data":{"callId":"abc123","callerId":"user-a"}}"#,
        )
        .unwrap();
        assert!(matches!(event, ServerEvent::IncomingCall { .. }));
    }

    #[test]
    fn decodes_user_status_changed() {
        let event = decode_event(
            r#"{"event":"userStatusChanged","data":{"userId":"user-b","status":"offline"}}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            ServerEvent::UserStatusChanged {
                user_id: UserId::from("user-b"),
                status: PresenceStatus::Offline,
            }
        );
    }

    #[test]
    fn decodes_call_ended_with_unknown_reason() {
        let event = decode_event(
            r#"{"event":"callEnded","data":{"callId":"abc123","reason":"server_maintenance"}}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            ServerEvent::CallEnded {
                call_id: CallId::from("abc123"),
                reason: CallEndReason::Unknown,
            }
        );
    }

    #[test]
    fn decodes_error_event_with_optional_fields_missing() {
        let event = decode_event(r#"{"event":"error","data":{"message":"user busy"}}"#).unwrap();
        match event {
            ServerEvent::Error(err) => {
                assert_eq!(err.message, "user busy");
                assert!(err.code.is_none());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn unknown_event_is_an_error_not_a_panic() {
        assert!(decode_event(r#"{"event":"fileUploaded","data":{}}"#).is_err());
        assert!(decode_event("not json").is_err());
    }
}
