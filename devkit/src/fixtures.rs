/*!
Scripted device model fixtures

[`ScriptedComponent`] stores arbitrary properties, replays scripted telemetry
and records every set, command and initial state call. [`ScriptedRoot`] wraps
one as the root and owns named sub-components.
*/

use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use twinlink_agent::component::{
    parse_bool, parse_f64, parse_i64, Component, ComponentMap, RootComponent, TelemetryReading,
};
use twinlink_agent::error::ComponentError;

/// What the next telemetry poll returns
#[derive(Debug, Clone)]
pub enum Reading {
    Value(TelemetryReading),
    Nothing,
    Fail(String),
}

#[derive(Debug, Default)]
struct Script {
    properties: Map<String, Value>,
    read_only: HashSet<String>,
    telemetry: bool,
    queued: VecDeque<Reading>,
    fallback: Option<Reading>,
    command_results: HashMap<String, Value>,
    sets: Vec<(String, Value)>,
    commands: Vec<(String, Value)>,
    initial_state: Vec<HashMap<String, String>>,
    raw_properties: Option<Value>,
}

pub struct ScriptedComponent {
    identity: String,
    script: Mutex<Script>,
}

impl ScriptedComponent {
    pub fn new(identity: &str) -> Self {
        Self {
            identity: identity.to_string(),
            script: Mutex::new(Script::default()),
        }
    }

    /// Writable property with a starting value (`null` for "not yet available")
    pub fn with_property(self, name: &str, value: Value) -> Self {
        self.script.lock().properties.insert(name.to_string(), value);
        self
    }

    /// Reported but not writable
    pub fn with_read_only(self, name: &str, value: Value) -> Self {
        {
            let mut script = self.script.lock();
            script.properties.insert(name.to_string(), value);
            script.read_only.insert(name.to_string());
        }
        self
    }

    /// Returned on every poll once the queue is empty
    pub fn with_reading(self, reading: Reading) -> Self {
        {
            let mut script = self.script.lock();
            script.telemetry = true;
            script.fallback = Some(reading);
        }
        self
    }

    /// Returned once each, in order, before the fallback
    pub fn with_readings(self, readings: impl IntoIterator<Item = Reading>) -> Self {
        {
            let mut script = self.script.lock();
            script.telemetry = true;
            script.queued.extend(readings);
        }
        self
    }

    /// Replace the property document wholesale, e.g. with a non-object
    pub fn with_raw_properties(self, document: Value) -> Self {
        self.script.lock().raw_properties = Some(document);
        self
    }

    pub fn with_command(self, name: &str, result: Value) -> Self {
        self.script.lock().command_results.insert(name.to_string(), result);
        self
    }

    pub fn sets(&self) -> Vec<(String, Value)> {
        self.script.lock().sets.clone()
    }

    pub fn commands(&self) -> Vec<(String, Value)> {
        self.script.lock().commands.clone()
    }

    pub fn initial_state(&self) -> Vec<HashMap<String, String>> {
        self.script.lock().initial_state.clone()
    }

    pub fn property(&self, name: &str) -> Option<Value> {
        self.script.lock().properties.get(name).cloned()
    }
}

/// Coerce `raw` to the JSON type of the current value, as typed setters do
fn coerce(name: &str, current: &Value, raw: &Value) -> Result<Value, ComponentError> {
    match current {
        Value::Number(n) if n.is_i64() || n.is_u64() => {
            parse_i64(name, raw).map(Value::from).or_else(|_| parse_f64(name, raw).map(Value::from))
        }
        Value::Number(_) => parse_f64(name, raw).map(Value::from),
        Value::Bool(_) => parse_bool(name, raw).map(Value::Bool),
        _ => Ok(raw.clone()),
    }
}

impl Component for ScriptedComponent {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn has_telemetry(&self) -> bool {
        self.script.lock().telemetry
    }

    fn telemetry(&self) -> Result<Option<TelemetryReading>, ComponentError> {
        let mut script = self.script.lock();
        let next = match script.queued.pop_front() {
            Some(reading) => reading,
            None => match &script.fallback {
                Some(reading) => reading.clone(),
                None => Reading::Nothing,
            },
        };
        match next {
            Reading::Value(reading) => Ok(Some(reading)),
            Reading::Nothing => Ok(None),
            Reading::Fail(reason) => Err(ComponentError::Unavailable {
                component: self.identity.clone(),
                reason,
            }),
        }
    }

    fn properties(&self) -> Value {
        let script = self.script.lock();
        match &script.raw_properties {
            Some(document) => document.clone(),
            None => Value::Object(script.properties.clone()),
        }
    }

    fn set_property(&self, name: &str, raw: &Value) -> Result<Value, ComponentError> {
        let mut script = self.script.lock();
        let current = match script.properties.get(name) {
            Some(current) if !script.read_only.contains(name) => current,
            _ => {
                return Err(ComponentError::UnknownProperty {
                    component: self.identity.clone(),
                    name: name.to_string(),
                })
            }
        };
        let stored = coerce(name, current, raw)?;
        script.properties.insert(name.to_string(), stored.clone());
        script.sets.push((name.to_string(), stored.clone()));
        Ok(stored)
    }

    fn do_command(&self, name: &str, params: &Value) -> Result<Value, ComponentError> {
        let mut script = self.script.lock();
        let result = script.command_results.get(name).cloned().ok_or_else(|| ComponentError::UnknownCommand {
            component: self.identity.clone(),
            name: name.to_string(),
        })?;
        script.commands.push((name.to_string(), params.clone()));
        Ok(result)
    }

    fn set_initial_state(&self, values: &HashMap<String, String>) {
        self.script.lock().initial_state.push(values.clone());
    }
}

/// Root built from a scripted component plus named children
pub struct ScriptedRoot {
    own: Arc<ScriptedComponent>,
    period: Mutex<Duration>,
    components: ComponentMap,
}

impl ScriptedRoot {
    pub fn new(own: ScriptedComponent, period: Duration) -> Self {
        Self {
            own: Arc::new(own),
            period: Mutex::new(period),
            components: ComponentMap::new(),
        }
    }

    pub fn with_component(mut self, name: &str, component: Arc<ScriptedComponent>) -> Self {
        self.components.insert(name.to_string(), component);
        self
    }

    pub fn set_period(&self, period: Duration) {
        *self.period.lock() = period;
    }

    /// The root's own scripted behaviour
    pub fn own(&self) -> &ScriptedComponent {
        &self.own
    }
}

impl Component for ScriptedRoot {
    fn identity(&self) -> &str {
        self.own.identity()
    }

    fn has_telemetry(&self) -> bool {
        self.own.has_telemetry()
    }

    fn telemetry(&self) -> Result<Option<TelemetryReading>, ComponentError> {
        self.own.telemetry()
    }

    fn properties(&self) -> Value {
        self.own.properties()
    }

    fn set_property(&self, name: &str, raw: &Value) -> Result<Value, ComponentError> {
        self.own.set_property(name, raw)
    }

    fn do_command(&self, name: &str, params: &Value) -> Result<Value, ComponentError> {
        self.own.do_command(name, params)
    }

    fn set_initial_state(&self, values: &HashMap<String, String>) {
        self.own.set_initial_state(values)
    }
}

impl RootComponent for ScriptedRoot {
    fn telemetry_period(&self) -> Duration {
        *self.period.lock()
    }

    fn components(&self) -> &ComponentMap {
        &self.components
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_coerces_to_current_type() {
        let sensor = ScriptedComponent::new("test:sensor;1")
            .with_property("gain", json!(1))
            .with_property("enabled", json!(false))
            .with_read_only("serial", json!("S-1"));

        assert_eq!(sensor.set_property("gain", &json!("5")).unwrap(), json!(5));
        assert_eq!(sensor.set_property("enabled", &json!("true")).unwrap(), json!(true));
        assert!(sensor.set_property("gain", &json!("loud")).is_err());
        assert!(sensor.set_property("serial", &json!("S-2")).is_err());
        assert!(sensor.set_property("missing", &json!(1)).is_err());

        assert_eq!(sensor.sets(), vec![("gain".to_string(), json!(5)), ("enabled".to_string(), json!(true))]);
        assert_eq!(sensor.property("serial"), Some(json!("S-1")));
    }

    #[test]
    fn test_readings_replay_then_fallback() {
        let sensor = ScriptedComponent::new("test:sensor;1")
            .with_readings([Reading::Fail("warming up".into())])
            .with_reading(Reading::Value(TelemetryReading::new().with("t", 1)));

        assert!(sensor.telemetry().is_err());
        assert_eq!(sensor.telemetry().unwrap().unwrap().len(), 1);
        assert_eq!(sensor.telemetry().unwrap().unwrap().len(), 1);
    }

    #[test]
    fn test_root_delegates_to_own() {
        let root = ScriptedRoot::new(
            ScriptedComponent::new("test:root;1").with_command("reboot", json!({"ok": true})),
            Duration::from_secs(5),
        )
        .with_component("sensorA", Arc::new(ScriptedComponent::new("test:sensor;1")));

        assert_eq!(root.do_command("reboot", &Value::Null).unwrap(), json!({"ok": true}));
        assert_eq!(root.own().commands().len(), 1);
        assert_eq!(root.components().len(), 1);
        assert!(!root.has_telemetry());
    }
}
