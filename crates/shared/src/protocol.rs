use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{domain::EntityId, error::CommandError};

/// Snapshot of one entity as reported by the server. Snapshots are
/// replaced wholesale on every update, never patched in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_changed: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceTarget {
    pub entity_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTrigger {
    pub platform: String,
    pub entity_id: String,
}

impl StateTrigger {
    pub fn for_entity(entity_id: &EntityId) -> Self {
        Self {
            platform: "state".to_string(),
            entity_id: entity_id.as_str().to_string(),
        }
    }
}

/// Outbound command frames. The wire `id` is injected by the session at
/// send time and is not part of the command itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    CallService {
        domain: String,
        service: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        service_data: Option<Map<String, Value>>,
        target: ServiceTarget,
    },
    GetStates,
    SubscribeTrigger {
        trigger: StateTrigger,
    },
    Ping,
}

impl ClientCommand {
    pub fn call_service(
        domain: impl Into<String>,
        service: impl Into<String>,
        service_data: Option<Map<String, Value>>,
        entity_id: &EntityId,
    ) -> Self {
        Self::CallService {
            domain: domain.into(),
            service: service.into(),
            service_data,
            target: ServiceTarget {
                entity_id: entity_id.as_str().to_string(),
            },
        }
    }

    pub fn subscribe_trigger(entity_id: &EntityId) -> Self {
        Self::SubscribeTrigger {
            trigger: StateTrigger::for_entity(entity_id),
        }
    }
}

/// Authentication frame sent in response to `auth_required`. Carries no id.
#[derive(Debug, Clone, Serialize)]
pub struct AuthMessage {
    #[serde(rename = "type")]
    msg_type: &'static str,
    access_token: String,
}

impl AuthMessage {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            msg_type: "auth",
            access_token: access_token.into(),
        }
    }
}

/// Inbound frames. Anything unrecognized decodes to `Unknown` and is
/// dropped by the session with a debug log.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    AuthRequired {
        #[serde(default)]
        ha_version: Option<String>,
    },
    AuthOk {
        #[serde(default)]
        ha_version: Option<String>,
    },
    AuthInvalid {
        message: String,
    },
    Result {
        id: u64,
        success: bool,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<CommandError>,
    },
    Event {
        id: u64,
        event: Value,
    },
    Pong {
        id: u64,
    },
    #[serde(other)]
    Unknown,
}

/// Lenient decode target for `subscribe_trigger` event payloads. Every
/// level is optional; a payload that does not bottom out in a matching
/// `entity_id` plus a well-formed `to_state` means "no change".
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TriggerEvent {
    #[serde(default)]
    pub variables: Option<TriggerVariables>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TriggerVariables {
    #[serde(default)]
    pub trigger: Option<TriggerPayload>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TriggerPayload {
    #[serde(default)]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub to_state: Option<EntityState>,
}
