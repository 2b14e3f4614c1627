use std::{
    sync::atomic::{AtomicUsize, Ordering as AtomicOrdering},
    time::Duration,
};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::*;

struct MockSession {
    states: Value,
    sent: Mutex<Vec<ClientCommand>>,
    events_tx: Mutex<Option<mpsc::UnboundedSender<Value>>>,
    call_log: Mutex<Vec<&'static str>>,
    resume_gate: Mutex<Option<oneshot::Receiver<()>>>,
    suspends: AtomicUsize,
    pings: AtomicUsize,
    closes: AtomicUsize,
}

impl MockSession {
    fn new(states: Value) -> Arc<Self> {
        Arc::new(Self {
            states,
            sent: Mutex::new(Vec::new()),
            events_tx: Mutex::new(None),
            call_log: Mutex::new(Vec::new()),
            resume_gate: Mutex::new(None),
            suspends: AtomicUsize::new(0),
            pings: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        })
    }

    async fn push_event(&self, payload: Value) {
        if let Some(tx) = self.events_tx.lock().await.as_ref() {
            let _ = tx.send(payload);
        }
    }

    async fn sent(&self) -> Vec<ClientCommand> {
        self.sent.lock().await.clone()
    }

    /// Commands issued after setup (bulk fetch + subscription).
    async fn sent_after_setup(&self) -> Vec<ClientCommand> {
        self.sent.lock().await.iter().skip(2).cloned().collect()
    }
}

#[async_trait]
impl Session for MockSession {
    async fn send_command(&self, command: ClientCommand) -> Result<(), SessionError> {
        self.sent.lock().await.push(command);
        Ok(())
    }

    async fn send_command_await_response(
        &self,
        command: ClientCommand,
    ) -> Result<Value, SessionError> {
        let response = match &command {
            ClientCommand::GetStates => self.states.clone(),
            _ => Value::Null,
        };
        self.sent.lock().await.push(command);
        Ok(response)
    }

    async fn subscribe(
        &self,
        request: ClientCommand,
    ) -> Result<mpsc::UnboundedReceiver<Value>, SessionError> {
        self.sent.lock().await.push(request);
        let (tx, rx) = mpsc::unbounded_channel();
        *self.events_tx.lock().await = Some(tx);
        Ok(rx)
    }

    async fn ping(&self) -> Result<(), SessionError> {
        self.pings.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(())
    }

    async fn suspend(&self) {
        self.call_log.lock().await.push("suspend");
        self.suspends.fetch_add(1, AtomicOrdering::SeqCst);
    }

    async fn resume_after(&self, gate: oneshot::Receiver<()>) {
        self.call_log.lock().await.push("resume_after");
        *self.resume_gate.lock().await = Some(gate);
    }

    async fn close(&self) {
        self.closes.fetch_add(1, AtomicOrdering::SeqCst);
        // A closed session delivers no further events.
        *self.events_tx.lock().await = None;
    }
}

fn state_json(entity: &str, state: &str, attributes: Value) -> Value {
    json!({ "entity_id": entity, "state": state, "attributes": attributes })
}

fn trigger_payload(entity: &str, to_state: Value) -> Value {
    json!({ "variables": { "trigger": { "entity_id": entity, "to_state": to_state } } })
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(30)).await;
}

async fn start_light_controller(
    brightness: Value,
) -> (Arc<EntityController>, Arc<MockSession>, SystemSignals) {
    let session = MockSession::new(json!([state_json(
        "light.kitchen",
        "on",
        json!({ "brightness": brightness })
    )]));
    let signals = SystemSignals::new();
    let controller = EntityController::start(
        Arc::clone(&session) as Arc<dyn Session>,
        &signals,
        "light.kitchen",
    )
    .await
    .expect("controller start");
    (controller, session, signals)
}

#[tokio::test]
async fn initial_snapshot_comes_from_bulk_fetch() {
    let session = MockSession::new(json!([
        state_json("switch.other", "off", json!({})),
        state_json("light.kitchen", "on", json!({ "brightness": 120 })),
    ]));
    let signals = SystemSignals::new();
    let controller = EntityController::start(
        Arc::clone(&session) as Arc<dyn Session>,
        &signals,
        "light.kitchen",
    )
    .await
    .expect("controller start");

    let state = controller.state().expect("initial snapshot");
    assert_eq!(state.entity_id, "light.kitchen");
    assert_eq!(state.state, "on");
    assert_eq!(state.attributes.get("brightness"), Some(&json!(120)));

    // Setup issues exactly the bulk fetch and the trigger subscription.
    let sent = session.sent().await;
    assert_eq!(sent.len(), 2);
    assert!(matches!(sent[0], ClientCommand::GetStates));
    assert!(matches!(sent[1], ClientCommand::SubscribeTrigger { .. }));
}

#[tokio::test]
async fn setup_fails_on_non_list_bulk_fetch() {
    let session = MockSession::new(json!({ "unexpected": "shape" }));
    let signals = SystemSignals::new();
    let err = EntityController::start(
        Arc::clone(&session) as Arc<dyn Session>,
        &signals,
        "light.kitchen",
    )
    .await
    .expect_err("setup must fail");
    assert!(matches!(err, SetupError::MalformedStateList));
}

#[tokio::test]
async fn setup_fails_on_invalid_entity_id() {
    let session = MockSession::new(json!([]));
    let signals = SystemSignals::new();
    let err = EntityController::start(
        Arc::clone(&session) as Arc<dyn Session>,
        &signals,
        "not-an-entity",
    )
    .await
    .expect_err("setup must fail");
    assert!(matches!(err, SetupError::InvalidEntityId(_)));
    // Rejected before any command went out.
    assert!(session.sent().await.is_empty());
}

#[tokio::test]
async fn missing_entity_yields_empty_snapshot() {
    let session = MockSession::new(json!([state_json("switch.other", "off", json!({}))]));
    let signals = SystemSignals::new();
    let controller = EntityController::start(
        Arc::clone(&session) as Arc<dyn Session>,
        &signals,
        "light.kitchen",
    )
    .await
    .expect("controller start");
    assert!(controller.state().is_none());
}

#[tokio::test]
async fn trigger_event_replaces_snapshot_wholesale() {
    let (controller, session, _signals) = start_light_controller(json!(120)).await;

    session
        .push_event(trigger_payload(
            "light.kitchen",
            state_json("light.kitchen", "off", json!({})),
        ))
        .await;
    settle().await;

    let state = controller.state().expect("snapshot");
    assert_eq!(state.state, "off");
    // No merge with the previous attributes.
    assert!(state.attributes.get("brightness").is_none());
}

#[tokio::test]
async fn malformed_or_mismatched_trigger_payloads_are_no_change() {
    let (controller, session, _signals) = start_light_controller(json!(120)).await;

    for payload in [
        json!(null),
        json!({}),
        json!({ "variables": {} }),
        json!({ "variables": { "trigger": {} } }),
        json!({ "variables": { "trigger": { "entity_id": "light.kitchen", "to_state": 42 } } }),
        trigger_payload(
            "light.other",
            state_json("light.other", "off", json!({})),
        ),
    ] {
        session.push_event(payload).await;
    }
    settle().await;

    let state = controller.state().expect("snapshot");
    assert_eq!(state.state, "on");
    assert_eq!(state.attributes.get("brightness"), Some(&json!(120)));
}

#[tokio::test]
async fn updates_reach_observer_in_order_and_replay_snapshot() {
    let (controller, session, _signals) = start_light_controller(json!(120)).await;

    let seen: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
    {
        let seen = Arc::clone(&seen);
        controller.set_on_update(Box::new(move |state| {
            lock(&seen).push(state.state.clone());
        }));
    }
    // Installing the hook replays the current snapshot immediately.
    assert_eq!(lock(&seen).clone(), vec!["on".to_string()]);

    for next in ["off", "on", "unavailable"] {
        session
            .push_event(trigger_payload(
                "light.kitchen",
                state_json("light.kitchen", next, json!({})),
            ))
            .await;
    }
    settle().await;
    assert_eq!(lock(&seen).clone(), vec!["on", "off", "on", "unavailable"]);
}

#[tokio::test]
async fn scroll_action_records_expected_value_and_issues_command() {
    let (controller, session, _signals) = start_light_controller(json!(100)).await;

    controller.scroll_action(10.0).await;
    settle().await;

    assert_eq!(controller.expected_value("brightness"), Some(110.0));
    let sent = session.sent_after_setup().await;
    assert_eq!(sent.len(), 1);
    let value = serde_json::to_value(&sent[0]).expect("serialize");
    assert_eq!(value["type"], "call_service");
    assert_eq!(value["domain"], "light");
    assert_eq!(value["service"], "turn_on");
    assert_eq!(value["service_data"]["brightness"], json!(110));
    assert_eq!(value["target"]["entity_id"], "light.kitchen");
}

#[tokio::test]
async fn scroll_action_clamps_to_descriptor_bounds() {
    let (controller, session, _signals) = start_light_controller(json!(250)).await;

    controller.scroll_action(20.0).await;
    settle().await;

    assert_eq!(controller.expected_value("brightness"), Some(255.0));
    let sent = session.sent_after_setup().await;
    let value = serde_json::to_value(&sent[0]).expect("serialize");
    assert_eq!(value["service_data"]["brightness"], json!(255));
}

#[tokio::test]
async fn scroll_to_zero_turns_off() {
    let (controller, session, _signals) = start_light_controller(json!(5)).await;

    controller.scroll_action(-10.0).await;
    settle().await;

    assert_eq!(controller.expected_value("brightness"), Some(0.0));
    let sent = session.sent_after_setup().await;
    let value = serde_json::to_value(&sent[0]).expect("serialize");
    assert_eq!(value["service"], "turn_off");
    assert!(value.get("service_data").is_none());
}

#[tokio::test]
async fn scroll_starts_from_default_when_attribute_unset() {
    let session = MockSession::new(json!([state_json("light.kitchen", "off", json!({}))]));
    let signals = SystemSignals::new();
    let controller = EntityController::start(
        Arc::clone(&session) as Arc<dyn Session>,
        &signals,
        "light.kitchen",
    )
    .await
    .expect("controller start");

    controller.scroll_action(10.0).await;
    settle().await;
    assert_eq!(controller.expected_value("brightness"), Some(10.0));
}

#[tokio::test]
async fn expected_value_cleared_only_by_exact_echo() {
    let (controller, session, _signals) = start_light_controller(json!(100)).await;

    controller.scroll_action(10.0).await;
    settle().await;
    assert_eq!(controller.expected_value("brightness"), Some(110.0));

    // A stale or unrelated value must not clear the expectation.
    session
        .push_event(trigger_payload(
            "light.kitchen",
            state_json("light.kitchen", "on", json!({ "brightness": 90 })),
        ))
        .await;
    settle().await;
    assert_eq!(controller.expected_value("brightness"), Some(110.0));

    // Further scrolls build on the expected value, not the stale echo.
    controller.scroll_action(5.0).await;
    settle().await;
    assert_eq!(controller.expected_value("brightness"), Some(115.0));

    session
        .push_event(trigger_payload(
            "light.kitchen",
            state_json("light.kitchen", "on", json!({ "brightness": 115 })),
        ))
        .await;
    settle().await;
    assert_eq!(controller.expected_value("brightness"), None);

    // With the expectation confirmed, the confirmed value is the new base.
    controller.scroll_action(5.0).await;
    settle().await;
    assert_eq!(controller.expected_value("brightness"), Some(120.0));
}

#[tokio::test]
async fn reconciliation_happens_before_observer_sees_the_update() {
    let (controller, session, _signals) = start_light_controller(json!(100)).await;
    controller.scroll_action(10.0).await;
    settle().await;

    let observed: Arc<StdMutex<Vec<Option<f64>>>> = Arc::new(StdMutex::new(Vec::new()));
    {
        let observed = Arc::clone(&observed);
        let probe = Arc::clone(&controller);
        controller.set_on_update(Box::new(move |_state| {
            lock(&observed).push(probe.expected_value("brightness"));
        }));
    }
    lock(&observed).clear(); // drop the replayed snapshot entry

    session
        .push_event(trigger_payload(
            "light.kitchen",
            state_json("light.kitchen", "on", json!({ "brightness": 110 })),
        ))
        .await;
    settle().await;

    // By the time the observer ran, the confirmed expectation was dropped.
    assert_eq!(lock(&observed).clone(), vec![None]);
}

#[tokio::test]
async fn click_uses_generic_toggle_for_unmapped_domains() {
    let session = MockSession::new(json!([state_json("switch.fan", "off", json!({}))]));
    let signals = SystemSignals::new();
    let controller = EntityController::start(
        Arc::clone(&session) as Arc<dyn Session>,
        &signals,
        "switch.fan",
    )
    .await
    .expect("controller start");

    controller.click_action().await;
    settle().await;

    let sent = session.sent_after_setup().await;
    let value = serde_json::to_value(&sent[0]).expect("serialize");
    assert_eq!(value["domain"], "homeassistant");
    assert_eq!(value["service"], "toggle");

    // No adjust action for this domain; scrolling is a no-op.
    controller.scroll_action(3.0).await;
    settle().await;
    assert_eq!(session.sent_after_setup().await.len(), 1);
}

#[tokio::test]
async fn click_uses_domain_specific_service_when_mapped() {
    let session = MockSession::new(json!([state_json("button.doorbell", "unknown", json!({}))]));
    let signals = SystemSignals::new();
    let controller = EntityController::start(
        Arc::clone(&session) as Arc<dyn Session>,
        &signals,
        "button.doorbell",
    )
    .await
    .expect("controller start");

    controller.click_action().await;
    settle().await;

    let sent = session.sent_after_setup().await;
    let value = serde_json::to_value(&sent[0]).expect("serialize");
    assert_eq!(value["domain"], "button");
    assert_eq!(value["service"], "press");
}

#[tokio::test]
async fn formatted_value_reflects_confirmed_state_only() {
    let (controller, session, _signals) = start_light_controller(json!(128)).await;
    assert_eq!(controller.formatted_state_value(), Some("50%".to_string()));

    // A pending expected value must not affect the displayed value.
    controller.scroll_action(127.0).await;
    settle().await;
    assert_eq!(controller.formatted_state_value(), Some("50%".to_string()));

    session
        .push_event(trigger_payload(
            "light.kitchen",
            state_json("light.kitchen", "on", json!({ "brightness": 255 })),
        ))
        .await;
    settle().await;
    assert_eq!(controller.formatted_state_value(), Some("100%".to_string()));
}

#[tokio::test]
async fn sleeping_suspends_once_and_woke_resolves_the_gate() {
    let (_controller, session, signals) = start_light_controller(json!(120)).await;

    signals.notify(SystemSignal::Sleeping);
    signals.notify(SystemSignal::Sleeping);
    settle().await;

    assert_eq!(session.suspends.load(AtomicOrdering::SeqCst), 1);
    assert_eq!(
        session.call_log.lock().await.clone(),
        vec!["resume_after", "suspend"]
    );

    let gate = session
        .resume_gate
        .lock()
        .await
        .take()
        .expect("gate installed");

    signals.notify(SystemSignal::Woke);
    settle().await;
    tokio::time::timeout(Duration::from_secs(1), gate)
        .await
        .expect("gate must resolve")
        .expect("gate sender must fire");
}

#[tokio::test]
async fn sleep_again_after_wake_installs_a_fresh_gate() {
    let (_controller, session, signals) = start_light_controller(json!(120)).await;

    signals.notify(SystemSignal::Sleeping);
    settle().await;
    signals.notify(SystemSignal::Woke);
    settle().await;
    signals.notify(SystemSignal::Sleeping);
    settle().await;

    assert_eq!(session.suspends.load(AtomicOrdering::SeqCst), 2);
}

#[tokio::test]
async fn connectivity_probe_skipped_while_suspended_for_sleep() {
    let (_controller, session, signals) = start_light_controller(json!(120)).await;

    signals.notify(SystemSignal::Sleeping);
    settle().await;
    signals.notify(SystemSignal::ConnectivityChanged);
    settle().await;
    assert_eq!(session.pings.load(AtomicOrdering::SeqCst), 0);

    signals.notify(SystemSignal::Woke);
    settle().await;
    signals.notify(SystemSignal::ConnectivityChanged);
    settle().await;
    assert_eq!(session.pings.load(AtomicOrdering::SeqCst), 1);
}

#[tokio::test]
async fn close_is_idempotent_and_stops_signal_handling() {
    let (controller, session, signals) = start_light_controller(json!(120)).await;

    controller.close().await;
    controller.close().await;
    assert_eq!(session.closes.load(AtomicOrdering::SeqCst), 1);

    // Signals after close must not reach the session.
    signals.notify(SystemSignal::Sleeping);
    settle().await;
    assert_eq!(session.suspends.load(AtomicOrdering::SeqCst), 0);
}

#[tokio::test]
async fn controller_slot_first_install_wins() {
    let slot = ControllerSlot::new();

    let (first, first_session, _signals_a) = start_light_controller(json!(120)).await;
    let (second, second_session, _signals_b) = start_light_controller(json!(120)).await;

    assert!(slot.install(Arc::clone(&first)).await);
    assert!(!slot.install(Arc::clone(&second)).await);

    // The redundant controller was closed immediately, the winner was not.
    assert_eq!(second_session.closes.load(AtomicOrdering::SeqCst), 1);
    assert_eq!(first_session.closes.load(AtomicOrdering::SeqCst), 0);

    // The loser's session delivers no further updates.
    let observed: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
    {
        let observed = Arc::clone(&observed);
        second.set_on_update(Box::new(move |state| {
            lock(&observed).push(state.state.clone());
        }));
    }
    lock(&observed).clear();
    second_session
        .push_event(trigger_payload(
            "light.kitchen",
            state_json("light.kitchen", "off", json!({})),
        ))
        .await;
    settle().await;
    assert!(lock(&observed).is_empty());

    // Teardown closes whatever is installed.
    slot.close_current().await;
    assert_eq!(first_session.closes.load(AtomicOrdering::SeqCst), 1);
    assert!(slot.current().await.is_none());
}
