//! Realtime channel frames.
//!
//! The platform speaks the Phoenix channel protocol (`vsn=1.0.0`): every
//! frame is a JSON object `{"topic", "event", "payload", "ref"}`. Row
//! changes arrive as `postgres_changes` events whose payload carries the
//! table, the change type and the affected record.

use eryxon_realtime::ports::SubscribeRequest;
use eryxon_realtime::{ChangeKind, ChangeNotification, EntityType};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Topic heartbeats are sent on.
pub const HEARTBEAT_TOPIC: &str = "phoenix";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhoenixMessage {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
}

impl PhoenixMessage {
    fn new(topic: impl Into<String>, event: &str, payload: Value, reference: String) -> Self {
        Self {
            topic: topic.into(),
            event: event.into(),
            payload,
            reference: Some(reference),
        }
    }

    pub fn heartbeat(reference: String) -> Self {
        Self::new(HEARTBEAT_TOPIC, "heartbeat", json!({}), reference)
    }

    pub fn leave(topic: &str, reference: String) -> Self {
        Self::new(topic, "phx_leave", json!({}), reference)
    }

    pub fn to_text(&self) -> String {
        // A struct of strings and JSON values always serializes.
        serde_json::to_string(self).unwrap_or_default()
    }
}

pub fn parse_frame(text: &str) -> Result<PhoenixMessage, serde_json::Error> {
    serde_json::from_str(text)
}

/// Topic and join frame for one subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSpec {
    pub topic: String,
    join_payload: Value,
}

impl ChannelSpec {
    /// One `postgres_changes` listener per watched table, all sharing the
    /// request's column filter.
    pub fn for_request(request: &SubscribeRequest, channel_id: u64, access_token: &str) -> Self {
        let filter = request.filter.expression();
        let listeners: Vec<Value> = request
            .entity_types
            .iter()
            .map(|entity| {
                json!({
                    "event": "*",
                    "schema": "public",
                    "table": entity.table(),
                    "filter": filter,
                })
            })
            .collect();

        Self {
            topic: format!("realtime:eryxon-{}-{channel_id}", request.tenant_id),
            join_payload: json!({
                "config": {
                    "broadcast": {"self": false},
                    "presence": {"key": ""},
                    "postgres_changes": listeners,
                },
                "access_token": access_token,
            }),
        }
    }

    pub fn join(&self, reference: String) -> PhoenixMessage {
        PhoenixMessage::new(&self.topic, "phx_join", self.join_payload.clone(), reference)
    }
}

/// What an inbound frame means for a subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Change(ChangeNotification),
    Reply {
        reference: Option<String>,
        ok: bool,
        response: Value,
    },
    /// The server reports the channel as broken.
    ChannelError(String),
    Ignored,
}

/// Interpret a frame received on a connection carrying `topic`.
pub fn classify(message: &PhoenixMessage, topic: &str) -> Inbound {
    if message.event == "phx_reply" {
        let ok = message.payload.get("status").and_then(Value::as_str) == Some("ok");
        return Inbound::Reply {
            reference: message.reference.clone(),
            ok,
            response: message.payload.get("response").cloned().unwrap_or(Value::Null),
        };
    }
    if message.topic != topic {
        return Inbound::Ignored;
    }

    match message.event.as_str() {
        "postgres_changes" => parse_change(&message.payload).map_or(Inbound::Ignored, Inbound::Change),
        "phx_error" => Inbound::ChannelError("channel crashed on the server".into()),
        "phx_close" => Inbound::ChannelError("channel closed by the server".into()),
        "system" if message.payload.get("status").and_then(Value::as_str) == Some("error") => {
            let detail = message
                .payload
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("subscription rejected");
            Inbound::ChannelError(detail.to_string())
        }
        _ => Inbound::Ignored,
    }
}

#[derive(Debug, Deserialize)]
struct ChangeData {
    table: String,
    #[serde(rename = "type")]
    change_type: String,
    #[serde(default)]
    record: Option<Map<String, Value>>,
    #[serde(default)]
    old_record: Option<Map<String, Value>>,
}

/// Convert a `postgres_changes` payload. Unknown tables and change types
/// yield `None`.
pub fn parse_change(payload: &Value) -> Option<ChangeNotification> {
    let data: ChangeData = serde_json::from_value(payload.get("data")?.clone()).ok()?;
    let entity_type = EntityType::from_table(&data.table)?;
    let change_kind = match data.change_type.as_str() {
        "INSERT" => ChangeKind::Insert,
        "UPDATE" => ChangeKind::Update,
        "DELETE" => ChangeKind::Delete,
        _ => return None,
    };

    let (record, old_record) = match change_kind {
        ChangeKind::Delete => (data.old_record, None),
        ChangeKind::Update => (data.record, data.old_record),
        ChangeKind::Insert => (data.record, None),
    };
    let record = record.unwrap_or_default();

    let mut change = ChangeNotification::new(entity_type, change_kind);
    change.entity_id = record
        .get("id")
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok());
    change.record = record;
    change.old_record = old_record.unwrap_or_default();
    Some(change)
}
