//! Signaling wire events
//!
//! Frames are JSON objects of the form `{"event": "call:initiate", "data": {...}}`
//! with camelCase field names. Offer, answer and candidate payloads are carried
//! verbatim.

use crate::types::{CallId, Payload, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Events sent by a client over its authenticated channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "call:initiate", rename_all = "camelCase")]
    Initiate {
        #[serde(default)]
        callee_id: UserId,
        #[serde(default)]
        offer: Payload,
    },

    #[serde(rename = "call:response", rename_all = "camelCase")]
    Response {
        #[serde(default)]
        caller_id: UserId,
        accepted: bool,
        #[serde(default)]
        answer: Option<Payload>,
        #[serde(default)]
        reason: Option<String>,
    },

    #[serde(rename = "call:ringing", rename_all = "camelCase")]
    Ringing {
        #[serde(default)]
        caller_id: UserId,
    },

    #[serde(rename = "call:cancel")]
    Cancel {},

    #[serde(rename = "call:end")]
    End {},

    /// Client confirmation that media is flowing end to end
    #[serde(rename = "call:connected")]
    Connected {},

    #[serde(rename = "ice:candidate")]
    IceCandidate {
        #[serde(default)]
        candidate: Payload,
    },
}

impl ClientEvent {
    /// Parse a text frame. A missing `data` member is read as `{}` so that
    /// bodiless events like `{"event": "call:end"}` are accepted.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        let mut frame: Value = serde_json::from_str(text)?;
        if let Value::Object(map) = &mut frame {
            if !map.contains_key("data") || map.get("data") == Some(&Value::Null) {
                map.insert("data".to_string(), Value::Object(Default::default()));
            }
        }
        serde_json::from_value(frame)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Initiate { .. } => "call:initiate",
            ClientEvent::Response { .. } => "call:response",
            ClientEvent::Ringing { .. } => "call:ringing",
            ClientEvent::Cancel {} => "call:cancel",
            ClientEvent::End {} => "call:end",
            ClientEvent::Connected {} => "call:connected",
            ClientEvent::IceCandidate { .. } => "ice:candidate",
        }
    }
}

/// Friend presence change broadcast to a user's friends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceChange {
    Online,
    Offline,
    InCall,
    OutOfCall,
}

/// Events emitted to a user's channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "call:incoming", rename_all = "camelCase")]
    Incoming { caller_id: UserId, offer: Payload },

    #[serde(rename = "call:ringing", rename_all = "camelCase")]
    Ringing { callee_id: UserId },

    #[serde(rename = "call:accepted", rename_all = "camelCase")]
    Accepted {
        callee_id: UserId,
        answer: Payload,
        call_id: CallId,
    },

    #[serde(rename = "call:rejected", rename_all = "camelCase")]
    Rejected { callee_id: UserId, reason: String },

    #[serde(rename = "call:cancelled", rename_all = "camelCase")]
    Cancelled {
        cancelled_by: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<CallId>,
    },

    #[serde(rename = "call:ended", rename_all = "camelCase")]
    Ended {
        call_id: CallId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ended_by: Option<UserId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    #[serde(rename = "call:no-answer", rename_all = "camelCase")]
    NoAnswer { callee_id: UserId },

    #[serde(rename = "call:peer-online", rename_all = "camelCase")]
    PeerOnline { user_id: UserId, call_id: CallId },

    #[serde(rename = "call:peer-offline", rename_all = "camelCase")]
    PeerOffline { user_id: UserId, call_id: CallId },

    #[serde(rename = "call:reconnect", rename_all = "camelCase")]
    Reconnect {
        call_id: CallId,
        caller_id: UserId,
        callee_id: UserId,
        offer: Payload,
        answer: Payload,
        is_callee: bool,
    },

    #[serde(rename = "call:error", rename_all = "camelCase")]
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        busy: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        require_reload: Option<bool>,
    },

    #[serde(rename = "ice:candidate")]
    IceCandidate { candidate: Payload },

    #[serde(rename = "friend_online", rename_all = "camelCase")]
    FriendOnline { user_id: UserId },

    #[serde(rename = "friend_offline", rename_all = "camelCase")]
    FriendOffline { user_id: UserId },

    #[serde(rename = "friend_in_call", rename_all = "camelCase")]
    FriendInCall { user_id: UserId },

    #[serde(rename = "friend_out_of_call", rename_all = "camelCase")]
    FriendOutOfCall { user_id: UserId },
}

impl ServerEvent {
    /// Plain error with no hint flags
    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error {
            message: message.into(),
            busy: None,
            require_reload: None,
        }
    }

    pub fn presence(change: PresenceChange, user_id: UserId) -> Self {
        match change {
            PresenceChange::Online => ServerEvent::FriendOnline { user_id },
            PresenceChange::Offline => ServerEvent::FriendOffline { user_id },
            PresenceChange::InCall => ServerEvent::FriendInCall { user_id },
            PresenceChange::OutOfCall => ServerEvent::FriendOutOfCall { user_id },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Incoming { .. } => "call:incoming",
            ServerEvent::Ringing { .. } => "call:ringing",
            ServerEvent::Accepted { .. } => "call:accepted",
            ServerEvent::Rejected { .. } => "call:rejected",
            ServerEvent::Cancelled { .. } => "call:cancelled",
            ServerEvent::Ended { .. } => "call:ended",
            ServerEvent::NoAnswer { .. } => "call:no-answer",
            ServerEvent::PeerOnline { .. } => "call:peer-online",
            ServerEvent::PeerOffline { .. } => "call:peer-offline",
            ServerEvent::Reconnect { .. } => "call:reconnect",
            ServerEvent::Error { .. } => "call:error",
            ServerEvent::IceCandidate { .. } => "ice:candidate",
            ServerEvent::FriendOnline { .. } => "friend_online",
            ServerEvent::FriendOffline { .. } => "friend_offline",
            ServerEvent::FriendInCall { .. } => "friend_in_call",
            ServerEvent::FriendOutOfCall { .. } => "friend_out_of_call",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_initiate() {
        let event = ClientEvent::from_json(
            r#"{"event":"call:initiate","data":{"calleeId":"bob","offer":{"type":"offer","sdp":"v=0"}}}"#,
        )
        .unwrap();

        match event {
            ClientEvent::Initiate { callee_id, offer } => {
                assert_eq!(callee_id, UserId::new("bob"));
                assert_eq!(offer["sdp"], "v=0");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_missing_offer_parses_as_null() {
        let event =
            ClientEvent::from_json(r#"{"event":"call:initiate","data":{"calleeId":"bob"}}"#).unwrap();
        assert!(matches!(event, ClientEvent::Initiate { offer: Value::Null, .. }));
    }

    #[test]
    fn test_bodiless_events() {
        assert_eq!(ClientEvent::from_json(r#"{"event":"call:end"}"#).unwrap(), ClientEvent::End {});
        assert_eq!(
            ClientEvent::from_json(r#"{"event":"call:cancel","data":{}}"#).unwrap(),
            ClientEvent::Cancel {}
        );
        assert_eq!(
            ClientEvent::from_json(r#"{"event":"call:connected","data":null}"#).unwrap(),
            ClientEvent::Connected {}
        );
    }

    #[test]
    fn test_numeric_user_ids_are_read_as_text() {
        let event = ClientEvent::from_json(
            r#"{"event":"call:initiate","data":{"calleeId":42,"offer":{"type":"offer"}}}"#,
        )
        .unwrap();
        assert!(matches!(event, ClientEvent::Initiate { callee_id, .. } if callee_id == UserId::new("42")));

        let event =
            ClientEvent::from_json(r#"{"event":"call:response","data":{"callerId":7,"accepted":false}}"#)
                .unwrap();
        assert!(matches!(event, ClientEvent::Response { caller_id, .. } if caller_id == UserId::new("7")));
    }

    #[test]
    fn test_missing_user_id_parses_as_blank() {
        let event =
            ClientEvent::from_json(r#"{"event":"call:initiate","data":{"offer":{"type":"offer"}}}"#).unwrap();
        assert!(matches!(event, ClientEvent::Initiate { callee_id, .. } if callee_id.is_blank()));

        let event = ClientEvent::from_json(r#"{"event":"call:ringing","data":{}}"#).unwrap();
        assert!(matches!(event, ClientEvent::Ringing { caller_id } if caller_id.is_blank()));
    }

    #[test]
    fn test_non_scalar_user_id_is_rejected() {
        assert!(ClientEvent::from_json(r#"{"event":"call:ringing","data":{"callerId":{"id":1}}}"#).is_err());
    }

    #[test]
    fn test_response_requires_accepted_flag() {
        assert!(ClientEvent::from_json(r#"{"event":"call:response","data":{"callerId":"a"}}"#).is_err());
    }

    #[test]
    fn test_unknown_event_is_rejected() {
        assert!(ClientEvent::from_json(r#"{"event":"call:teleport","data":{}}"#).is_err());
    }

    #[test]
    fn test_server_event_wire_shape() {
        let event = ServerEvent::Accepted {
            callee_id: UserId::new("bob"),
            answer: json!({"type": "answer"}),
            call_id: CallId::from("c1"),
        };
        let value: Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "event": "call:accepted",
                "data": {"calleeId": "bob", "answer": {"type": "answer"}, "callId": "c1"}
            })
        );
    }

    #[test]
    fn test_error_omits_unset_flags() {
        let value: Value =
            serde_json::from_str(&ServerEvent::error("nope").to_json().unwrap()).unwrap();
        assert_eq!(value, json!({"event": "call:error", "data": {"message": "nope"}}));
    }

    #[test]
    fn test_presence_event_names() {
        let user = UserId::new("a");
        assert_eq!(ServerEvent::presence(PresenceChange::Online, user.clone()).name(), "friend_online");
        assert_eq!(ServerEvent::presence(PresenceChange::OutOfCall, user).name(), "friend_out_of_call");
    }
}
