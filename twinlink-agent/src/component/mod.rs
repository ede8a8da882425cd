//! Device model component abstraction
//!
//! Every node of the device model tree implements [`Component`]:
//! - identity for diagnostics and routing errors
//! - a property snapshot and per-property setters
//! - optional telemetry readings
//! - optional named commands
//! - initial state from configuration
//!
//! The root additionally implements [`RootComponent`] and owns the named
//! sub-components. Implementations are shared between the main loop and the
//! inbound callback tasks, so they must synchronize their own state.

mod handlers;
mod values;

pub use handlers::{Handler, HandlerKind, HandlerTable};
pub use values::{parse_bool, parse_f64, parse_i64, parse_string};

use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use crate::error::ComponentError;

/// Named sub-components of a root, iterated in name order
pub type ComponentMap = BTreeMap<String, Arc<dyn Component>>;

/// Device model tree handle shared by the main loop and callback tasks
pub type SharedRoot = Arc<dyn RootComponent>;

/// One poll worth of metric values from a single component
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct TelemetryReading(Map<String, Value>);

impl TelemetryReading {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Builder-style insert
    pub fn with(mut self, metric: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(metric.into(), value.into());
        self
    }

    pub fn insert(&mut self, metric: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(metric.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

impl From<Map<String, Value>> for TelemetryReading {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Capability set shared by every device sub-unit
pub trait Component: Send + Sync {
    /// Stable type identifier, never empty
    fn identity(&self) -> &str;

    /// Whether this component ever produces telemetry
    fn has_telemetry(&self) -> bool {
        false
    }

    /// Current readings, or `None` to skip this cycle
    fn telemetry(&self) -> Result<Option<TelemetryReading>, ComponentError> {
        Ok(None)
    }

    /// Snapshot of every reportable property. Values not yet available are `null`.
    fn properties(&self) -> Value;

    /// Store a property and return exactly the stored value
    fn set_property(&self, name: &str, raw: &Value) -> Result<Value, ComponentError>;

    fn do_command(&self, name: &str, _params: &Value) -> Result<Value, ComponentError> {
        Err(ComponentError::UnknownCommand {
            component: self.identity().to_string(),
            name: name.to_string(),
        })
    }

    /// Apply configuration values; unknown keys are ignored
    fn set_initial_state(&self, values: &HashMap<String, String>);
}

/// Top of the device model tree
pub trait RootComponent: Component {
    /// How often to send telemetry; zero disables polling
    fn telemetry_period(&self) -> Duration;

    fn components(&self) -> &ComponentMap;
}

/// Serialize a typed snapshot struct into the property value shape
pub fn snapshot<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_else(|e| {
        tracing::error!("Property: snapshot serialization failed: {}", e);
        Value::Object(Map::new())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Bare;

    impl Component for Bare {
        fn identity(&self) -> &str {
            "test:bare;1"
        }

        fn properties(&self) -> Value {
            json!({})
        }

        fn set_property(&self, name: &str, _raw: &Value) -> Result<Value, ComponentError> {
            Err(ComponentError::UnknownProperty {
                component: self.identity().to_string(),
                name: name.to_string(),
            })
        }

        fn set_initial_state(&self, _values: &HashMap<String, String>) {}
    }

    #[test]
    fn test_defaults_have_no_telemetry_or_commands() {
        let bare = Bare;
        assert!(!bare.has_telemetry());
        assert!(bare.telemetry().unwrap().is_none());

        let err = bare.do_command("reboot", &Value::Null).unwrap_err();
        assert!(matches!(err, ComponentError::UnknownCommand { ref name, .. } if name == "reboot"));
    }

    #[test]
    fn test_reading_serializes_flat() {
        let reading = TelemetryReading::new().with("temperature", 21.5).with("unit", "C");
        assert_eq!(reading.len(), 2);
        let value = serde_json::to_value(&reading).unwrap();
        assert_eq!(value, json!({"temperature": 21.5, "unit": "C"}));
    }

    #[test]
    fn test_empty_reading_is_not_none() {
        let reading = TelemetryReading::new();
        assert!(reading.is_empty());
        assert_eq!(serde_json::to_string(&reading).unwrap(), "{}");
    }
}
