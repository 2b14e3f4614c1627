use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use serde_json::Value;
use shared::{domain::EntityId, protocol::EntityState};
use tokio::{
    sync::{broadcast, oneshot, Mutex},
    task::JoinHandle,
};
use tracing::{info, warn};

pub mod actions;
pub mod error;
pub mod rate_limiter;
pub mod session;
pub mod signals;
pub mod watcher;

use actions::{AttributeAction, EntityAction};
use rate_limiter::RateLimiter;
use shared::protocol::ClientCommand;

pub use error::{CallError, SessionError, SetupError};
pub use session::{Lifecycle, Session, SessionConfig, WsSession};
pub use signals::{SignalSource, SystemSignal, SystemSignals};
pub use watcher::EntityWatcher;

/// Bound on each outbound command attempt in the rate limiter.
const CALL_TIMEOUT: Duration = Duration::from_millis(250);

pub(crate) fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub type ObserverHook = Box<dyn Fn(&EntityState) + Send + Sync>;

/// Connection settings for one watched entity.
#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub url: String,
    pub access_token: String,
    pub entity_id: String,
}

/// Mediates between user intents and the watcher/limiter/session: click
/// and scroll actions go out through the rate limiter, accepted state
/// updates come back through the watcher, and system sleep/connectivity
/// signals drive session suspend/resume and liveness probing.
pub struct EntityController {
    entity_id: EntityId,
    session: Arc<dyn Session>,
    watcher: Arc<EntityWatcher>,
    limiter: RateLimiter<ClientCommand>,
    /// Attribute values a command predicted but the server has not echoed
    /// yet; suppresses flicker between a command and its state echo.
    expected_attr_values: Arc<StdMutex<HashMap<String, f64>>>,
    observer: Arc<StdMutex<Option<ObserverHook>>>,
    signal_task: JoinHandle<()>,
    closed: AtomicBool,
}

impl std::fmt::Debug for EntityController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityController")
            .field("entity_id", &self.entity_id)
            .finish_non_exhaustive()
    }
}

impl EntityController {
    pub async fn start(
        session: Arc<dyn Session>,
        signal_source: &dyn SignalSource,
        entity_id: &str,
    ) -> Result<Arc<Self>, SetupError> {
        let entity_id = EntityId::parse(entity_id)?;
        let watcher = EntityWatcher::start(Arc::clone(&session), entity_id.clone()).await?;

        let call_op: rate_limiter::CallOp<ClientCommand> = {
            let session = Arc::clone(&session);
            Arc::new(move |command| {
                let session = Arc::clone(&session);
                Box::pin(async move {
                    session
                        .send_command_await_response(command)
                        .await
                        .map(|_| ())
                        .map_err(anyhow::Error::from)
                })
            })
        };
        let limiter = RateLimiter::new(CALL_TIMEOUT, call_op);

        let expected_attr_values = Arc::new(StdMutex::new(HashMap::new()));
        let observer: Arc<StdMutex<Option<ObserverHook>>> = Arc::new(StdMutex::new(None));
        {
            let expected = Arc::clone(&expected_attr_values);
            let observer = Arc::clone(&observer);
            watcher.set_on_update(Box::new(move |state: &EntityState| {
                // Confirm echoed expected values before the observer sees
                // the update, so it never observes a stale flicker state.
                {
                    let mut expected = lock(&expected);
                    expected.retain(|attr, value| {
                        state.attributes.get(attr).and_then(Value::as_f64) != Some(*value)
                    });
                }
                if let Some(hook) = lock(&observer).as_ref() {
                    hook(state);
                }
            }));
        }

        let signal_task = tokio::spawn(run_signal_loop(
            Arc::clone(&session),
            signal_source.subscribe(),
        ));

        Ok(Arc::new(Self {
            entity_id,
            session,
            watcher,
            limiter,
            expected_attr_values,
            observer,
            signal_task,
            closed: AtomicBool::new(false),
        }))
    }

    pub fn entity_id(&self) -> &EntityId {
        &self.entity_id
    }

    /// Current confirmed snapshot; `None` until the entity has been seen.
    pub fn state(&self) -> Option<EntityState> {
        self.watcher.state()
    }

    /// Single observer slot, last writer wins. Replays the current
    /// snapshot immediately when one exists.
    pub fn set_on_update(&self, hook: ObserverHook) {
        let mut slot = lock(&self.observer);
        *slot = Some(hook);
        if let (Some(hook), Some(state)) = (slot.as_ref(), self.watcher.state()) {
            hook(&state);
        }
    }

    pub async fn click_action(&self) {
        let command = match actions::click_action(self.entity_id.domain()) {
            EntityAction::Simple(simple) => simple.build(&self.entity_id),
            EntityAction::Attribute(adjust) => {
                let target = self.adjust_attribute_value(adjust, 0.0);
                (adjust.build)(&self.entity_id, target)
            }
        };
        self.limiter.call(command).await;
    }

    pub async fn scroll_action(&self, delta: f64) {
        let Some(action) = actions::adjust_action(self.entity_id.domain()) else {
            return;
        };
        let command = match action {
            EntityAction::Simple(simple) => simple.build(&self.entity_id),
            EntityAction::Attribute(adjust) => {
                let target = self.adjust_attribute_value(adjust, delta);
                (adjust.build)(&self.entity_id, target)
            }
        };
        self.limiter.call(command).await;
    }

    /// Display string for the adjustable attribute, from the confirmed
    /// value only; `None` when the domain defines no formatter.
    pub fn formatted_state_value(&self) -> Option<String> {
        let Some(EntityAction::Attribute(adjust)) =
            actions::adjust_action(self.entity_id.domain())
        else {
            return None;
        };
        let state = self.watcher.state()?;
        let value = state.attributes.get(adjust.attribute)?;
        adjust.format_value(value)
    }

    /// Computes the next target value for `adjust` and records it as the
    /// expected value: start from a pending expected value, else the
    /// confirmed numeric value, else the descriptor default; then clamp.
    fn adjust_attribute_value(&self, adjust: &AttributeAction, delta: f64) -> f64 {
        let confirmed = self
            .watcher
            .state()
            .and_then(|state| state.attributes.get(adjust.attribute).and_then(Value::as_f64));
        let mut expected = lock(&self.expected_attr_values);
        let current = expected
            .get(adjust.attribute)
            .copied()
            .or(confirmed)
            .unwrap_or(adjust.default_if_unset);
        let target = (current + delta).clamp(adjust.min, adjust.max);
        expected.insert(adjust.attribute.to_string(), target);
        target
    }

    /// Idempotent; a closed controller cannot reconnect, construct a new
    /// one instead.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.signal_task.abort();
        self.session.close().await;
        info!(entity = %self.entity_id, "controller closed");
    }

    #[cfg(test)]
    fn expected_value(&self, attribute: &str) -> Option<f64> {
        lock(&self.expected_attr_values).get(attribute).copied()
    }
}

/// Wires system sleep/wake to session suspend/resume and connectivity
/// changes to liveness probing.
async fn run_signal_loop(
    session: Arc<dyn Session>,
    mut signals: broadcast::Receiver<SystemSignal>,
) {
    let mut resume_gate: Option<oneshot::Sender<()>> = None;
    loop {
        let signal = match signals.recv().await {
            Ok(signal) => signal,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "missed system signals");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        match signal {
            SystemSignal::Sleeping => {
                // Repeated sleep signals must not stack resume gates.
                if resume_gate.is_none() {
                    let (tx, rx) = oneshot::channel();
                    session.resume_after(rx).await;
                    info!("system sleeping, suspending session");
                    session.suspend().await;
                    resume_gate = Some(tx);
                }
            }
            SystemSignal::Woke => {
                if let Some(gate) = resume_gate.take() {
                    info!("system woke, resuming session");
                    let _ = gate.send(());
                }
            }
            SystemSignal::ConnectivityChanged => {
                // Don't probe while suspended for system sleep.
                if resume_gate.is_none() {
                    info!("connectivity changed, probing session");
                    if let Err(err) = session.ping().await {
                        warn!(%err, "liveness probe failed");
                    }
                }
            }
        }
    }
}

/// Single mutable current-controller cell. Connection attempts are
/// asynchronous; when two overlap, whichever installs first stays active
/// and the later one is closed immediately instead of replacing it.
#[derive(Default)]
pub struct ControllerSlot {
    current: Mutex<Option<Arc<EntityController>>>,
}

impl ControllerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether `controller` became the active one; a rejected
    /// controller has already been closed on return.
    pub async fn install(&self, controller: Arc<EntityController>) -> bool {
        {
            let mut current = self.current.lock().await;
            if current.is_none() {
                *current = Some(controller);
                return true;
            }
        }
        controller.close().await;
        false
    }

    pub async fn current(&self) -> Option<Arc<EntityController>> {
        self.current.lock().await.clone()
    }

    /// Closes and removes the active controller, if any.
    pub async fn close_current(&self) {
        let current = self.current.lock().await.take();
        if let Some(controller) = current {
            controller.close().await;
        }
    }
}

/// Connects a websocket session and builds the controller for one entity.
pub async fn connect(
    settings: &LinkSettings,
    signal_source: &dyn SignalSource,
) -> Result<Arc<EntityController>, SetupError> {
    if settings.access_token.trim().is_empty() || settings.entity_id.trim().is_empty() {
        return Err(SetupError::MissingCredentials);
    }
    info!(url = %settings.url, "connecting");
    let session: Arc<dyn Session> =
        WsSession::connect(SessionConfig::new(&settings.url, &settings.access_token)).await?;

    match EntityController::start(Arc::clone(&session), signal_source, &settings.entity_id).await {
        Ok(controller) => {
            info!(entity = %settings.entity_id, "connected");
            Ok(controller)
        }
        Err(err) => {
            session.close().await;
            Err(err)
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
