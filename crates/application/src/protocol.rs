//! 实时通道的 JSON 帧格式
//!
//! 每个文本帧是一个带 `event` 标签的对象，字段统一使用 camelCase。
//! 入站帧可以携带 `ackId`，服务端回执时原样带回。

use domain::{ConversationId, ListingId, Message, SenderRole, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 客户端发往服务端的事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    JoinChat {
        conversation_id: ConversationId,
    },
    LeaveChat {
        conversation_id: ConversationId,
    },
    SendMessage {
        conversation_id: ConversationId,
        sender_id: UserId,
        text: String,
        sender_role: SenderRole,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_temp_id: Option<String>,
    },
    MarkRead {
        conversation_id: ConversationId,
        reader_id: UserId,
    },
    BlockChat {
        conversation_id: ConversationId,
        blocker_id: UserId,
    },
}

/// 解析后的入站帧
#[derive(Debug, Clone, PartialEq)]
pub struct ClientFrame {
    pub ack_id: Option<u64>,
    pub event: ClientEvent,
}

/// 无法识别的入站帧
#[derive(Debug, thiserror::Error)]
#[error("malformed frame: {source}")]
pub struct FrameError {
    /// 帧本身是合法 JSON 时尽量取出 `ackId`，便于客户端对上失败的请求
    pub ack_id: Option<u64>,
    #[source]
    pub source: serde_json::Error,
}

impl ClientFrame {
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_str(text).map_err(|source| FrameError {
            ack_id: None,
            source,
        })?;
        let ack_id = value.get("ackId").and_then(Value::as_u64);
        let event = serde_json::from_value(value).map_err(|source| FrameError { ack_id, source })?;
        Ok(Self { ack_id, event })
    }
}

/// 请求的同步回执
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum Ack {
    Ok {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<Message>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_temp_id: Option<String>,
    },
    Error {
        error: String,
    },
}

impl Ack {
    pub fn ok() -> Self {
        Ack::Ok {
            message: None,
            client_temp_id: None,
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Ack::Error {
            error: error.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Ack::Ok { .. })
    }
}

/// 服务端推送给客户端的事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    /// 握手成功后的第一帧
    Connected {
        user_id: UserId,
        display_name: String,
    },
    Ack {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ack_id: Option<u64>,
        ack: Ack,
    },
    ReceiveMessage {
        message: Message,
    },
    NewMessageNotification {
        conversation_id: ConversationId,
        sender_name: String,
        text_preview: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        listing_id: Option<ListingId>,
    },
    MessagesRead {
        conversation_id: ConversationId,
        reader_id: UserId,
    },
    ChatBlocked {
        conversation_id: ConversationId,
        blocked_by: UserId,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ack_id: Option<u64>,
        code: String,
        message: String,
    },
}

impl ServerEvent {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn send_message_frame_uses_camel_case_fields() {
        let frame = ClientFrame::parse(
            r#"{"event":"send_message","ackId":7,"conversationId":"3-9","senderId":3,
                "text":"Hola","senderRole":"buyer","clientTempId":"tmp-1"}"#,
        )
        .unwrap();

        assert_eq!(frame.ack_id, Some(7));
        assert_eq!(
            frame.event,
            ClientEvent::SendMessage {
                conversation_id: ConversationId::from("3-9"),
                sender_id: UserId(3),
                text: "Hola".into(),
                sender_role: SenderRole::Buyer,
                client_temp_id: Some("tmp-1".into()),
            }
        );
    }

    #[test]
    fn unknown_event_keeps_ack_id() {
        let err = ClientFrame::parse(r#"{"event":"typing","ackId":4}"#).unwrap_err();
        assert_eq!(err.ack_id, Some(4));

        let err = ClientFrame::parse("not json").unwrap_err();
        assert_eq!(err.ack_id, None);
    }

    #[test]
    fn acks_serialize_with_status_tag() {
        let blocked = serde_json::to_value(Ack::error("Chat is blocked")).unwrap();
        assert_eq!(blocked, json!({"status": "error", "error": "Chat is blocked"}));

        let ok = serde_json::to_value(Ack::ok()).unwrap();
        assert_eq!(ok, json!({"status": "ok"}));
    }

    #[test]
    fn chat_blocked_event_shape() {
        let event = ServerEvent::ChatBlocked {
            conversation_id: ConversationId::from("3-9"),
            blocked_by: UserId(9),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"event": "chat_blocked", "conversationId": "3-9", "blockedBy": 9})
        );
    }

    #[test]
    fn notification_omits_missing_listing() {
        let event = ServerEvent::NewMessageNotification {
            conversation_id: ConversationId::from("3-9"),
            sender_name: "Ana".into(),
            text_preview: "Hola".into(),
            listing_id: None,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "new_message_notification");
        assert!(value.get("listingId").is_none());
    }
}
