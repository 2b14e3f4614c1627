use serde_json::{Map, Value};
use shared::{domain::EntityId, protocol::ClientCommand};

/// Static per-domain action table. Defined once at process start and
/// shared read-only across controller instances.
pub enum EntityAction {
    Simple(SimpleAction),
    Attribute(AttributeAction),
}

pub struct SimpleAction {
    pub domain: &'static str,
    pub service: &'static str,
}

impl SimpleAction {
    pub fn build(&self, entity_id: &EntityId) -> ClientCommand {
        ClientCommand::call_service(self.domain, self.service, None, entity_id)
    }
}

pub struct AttributeAction {
    pub attribute: &'static str,
    /// Inclusive bounds; unbounded descriptors use infinities.
    pub min: f64,
    pub max: f64,
    /// Assumed current value when the attribute is unset or non-numeric.
    pub default_if_unset: f64,
    pub build: fn(&EntityId, f64) -> ClientCommand,
    pub format: Option<fn(&AttributeAction, &Value) -> Option<String>>,
}

impl AttributeAction {
    pub fn format_value(&self, value: &Value) -> Option<String> {
        self.format.and_then(|format| format(self, value))
    }
}

pub struct DomainActions {
    pub click: Option<EntityAction>,
    pub adjust: Option<EntityAction>,
}

/// Click action suitable for most entity domains. Where toggling is not
/// supported the server simply rejects the call.
static GENERIC_CLICK: EntityAction = EntityAction::Simple(SimpleAction {
    domain: "homeassistant",
    service: "toggle",
});

static DEFAULT: DomainActions = DomainActions {
    click: None,
    adjust: None,
};

static LIGHT: DomainActions = DomainActions {
    click: None,
    adjust: Some(EntityAction::Attribute(AttributeAction {
        attribute: "brightness",
        min: 0.0,
        max: 255.0,
        default_if_unset: 0.0, // unset brightness means the light is off
        build: light_brightness_call,
        format: Some(format_percentage),
    })),
};

static BUTTON: DomainActions = DomainActions {
    click: Some(EntityAction::Simple(SimpleAction {
        domain: "button",
        service: "press",
    })),
    adjust: None,
};

static AUTOMATION: DomainActions = DomainActions {
    click: Some(EntityAction::Simple(SimpleAction {
        domain: "automation",
        service: "trigger",
    })),
    adjust: None,
};

pub fn actions_for(domain: &str) -> &'static DomainActions {
    match domain {
        "light" => &LIGHT,
        "button" => &BUTTON,
        "automation" => &AUTOMATION,
        _ => &DEFAULT,
    }
}

/// Domains without their own click action fall back to the generic toggle.
pub fn click_action(domain: &str) -> &'static EntityAction {
    actions_for(domain).click.as_ref().unwrap_or(&GENERIC_CLICK)
}

pub fn adjust_action(domain: &str) -> Option<&'static EntityAction> {
    actions_for(domain).adjust.as_ref()
}

fn light_brightness_call(entity_id: &EntityId, brightness: f64) -> ClientCommand {
    if brightness > 0.0 {
        let mut data = Map::new();
        data.insert(
            "brightness".to_string(),
            Value::from(brightness.round() as i64),
        );
        ClientCommand::call_service("light", "turn_on", Some(data), entity_id)
    } else {
        ClientCommand::call_service("light", "turn_off", None, entity_id)
    }
}

/// Renders a bounded numeric attribute as a whole percentage, but only for
/// descriptors whose range is zero-based or symmetric around zero.
fn format_percentage(action: &AttributeAction, value: &Value) -> Option<String> {
    let value = value.as_f64()?;
    let max = action.max;
    if !max.is_finite() || max == 0.0 || !(action.min == 0.0 || action.min == -max) {
        return None;
    }
    Some(format!("{}%", (100.0 * value / max).round() as i64))
}
