use std::sync::{Arc, Mutex};

use serde_json::Value;
use shared::{
    domain::EntityId,
    protocol::{ClientCommand, EntityState, TriggerEvent},
};
use tracing::debug;

use crate::{error::SetupError, lock, session::Session};

pub type UpdateHook = Box<dyn Fn(&EntityState) + Send + Sync>;

/// Owns the authoritative state snapshot for one entity: a one-shot bulk
/// fetch establishes it, a `subscribe_trigger` stream keeps it current.
/// Payloads that do not carry a well-formed new state for this entity are
/// "no change" and never touch the snapshot.
pub struct EntityWatcher {
    entity_id: EntityId,
    snapshot: Mutex<Option<EntityState>>,
    on_update: Mutex<Option<UpdateHook>>,
}

impl EntityWatcher {
    pub async fn start(
        session: Arc<dyn Session>,
        entity_id: EntityId,
    ) -> Result<Arc<Self>, SetupError> {
        let states = session
            .send_command_await_response(ClientCommand::GetStates)
            .await?;
        let Value::Array(states) = states else {
            return Err(SetupError::MalformedStateList);
        };
        let initial = states
            .into_iter()
            .find_map(|record| match serde_json::from_value::<EntityState>(record) {
                Ok(state) if state.entity_id == entity_id.as_str() => Some(state),
                _ => None,
            });

        let mut events = session
            .subscribe(ClientCommand::subscribe_trigger(&entity_id))
            .await?;

        let watcher = Arc::new(Self {
            entity_id,
            snapshot: Mutex::new(initial),
            on_update: Mutex::new(None),
        });

        let task_watcher = Arc::clone(&watcher);
        tokio::spawn(async move {
            while let Some(payload) = events.recv().await {
                match decode_trigger(&task_watcher.entity_id, payload) {
                    Some(state) => task_watcher.apply(state),
                    None => {
                        debug!(entity = %task_watcher.entity_id, "trigger payload carries no state change")
                    }
                }
            }
        });

        Ok(watcher)
    }

    pub fn entity_id(&self) -> &EntityId {
        &self.entity_id
    }

    pub fn state(&self) -> Option<EntityState> {
        lock(&self.snapshot).clone()
    }

    /// Installs the update hook (single slot, last writer wins) and replays
    /// the current snapshot so the initial fetch result is observed too.
    pub fn set_on_update(&self, hook: UpdateHook) {
        let mut slot = lock(&self.on_update);
        *slot = Some(hook);
        if let (Some(hook), Some(state)) = (slot.as_ref(), self.state()) {
            hook(&state);
        }
    }

    fn apply(&self, state: EntityState) {
        *lock(&self.snapshot) = Some(state.clone());
        if let Some(hook) = lock(&self.on_update).as_ref() {
            hook(&state);
        }
    }
}

fn decode_trigger(entity_id: &EntityId, payload: Value) -> Option<EntityState> {
    let event: TriggerEvent = serde_json::from_value(payload).ok()?;
    let trigger = event.variables?.trigger?;
    if trigger.entity_id.as_deref() != Some(entity_id.as_str()) {
        return None;
    }
    trigger.to_state
}
