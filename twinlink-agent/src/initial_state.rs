//! Initial state loading from configuration
//!
//! Reads the `InitialState` section once at startup: `Root` goes to the root
//! component, every other section whose name matches a registered component
//! goes to that component. Sections for hardware that is not present are
//! ignored.

use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::component::RootComponent;

pub const INITIAL_STATE_SECTION: &str = "InitialState";
pub const ROOT_SECTION: &str = "Root";
/// Root key receiving the agent's software version
pub const VERSION_KEY: &str = "Version";

/// Nested key/value configuration, addressed by `:`-separated section paths
pub trait ConfigSource {
    fn section_exists(&self, path: &str) -> bool;

    /// Scalar children of a section, rendered as strings
    fn children(&self, path: &str) -> HashMap<String, String>;
}

impl ConfigSource for toml::Table {
    fn section_exists(&self, path: &str) -> bool {
        lookup_table(self, path).is_some()
    }

    fn children(&self, path: &str) -> HashMap<String, String> {
        let Some(table) = lookup_table(self, path) else {
            return HashMap::new();
        };
        table
            .iter()
            .filter_map(|(key, value)| scalar_to_string(value).map(|v| (key.clone(), v)))
            .collect()
    }
}

fn lookup_table<'a>(root: &'a toml::Table, path: &str) -> Option<&'a toml::Table> {
    let mut current = root;
    for part in path.split(':').filter(|p| !p.is_empty()) {
        current = current.get(part)?.as_table()?;
    }
    Some(current)
}

fn scalar_to_string(value: &toml::Value) -> Option<String> {
    match value {
        toml::Value::String(s) => Some(s.clone()),
        toml::Value::Integer(i) => Some(i.to_string()),
        toml::Value::Float(f) => Some(f.to_string()),
        toml::Value::Boolean(b) => Some(b.to_string()),
        toml::Value::Datetime(d) => Some(d.to_string()),
        toml::Value::Array(_) | toml::Value::Table(_) => None,
    }
}

/// Apply configured initial state to the tree; returns the number of keys applied
pub fn load_initial_state(root: &dyn RootComponent, config: &dyn ConfigSource) -> usize {
    if !config.section_exists(INITIAL_STATE_SECTION) {
        warn!("Initial State: Not specified");
        return 0;
    }

    let mut applied = 0;

    let root_path = format!("{}:{}", INITIAL_STATE_SECTION, ROOT_SECTION);
    if config.section_exists(&root_path) {
        let values = config.children(&root_path);
        root.set_initial_state(&values);
        applied += values.len();
    }

    for (name, component) in root.components() {
        let path = format!("{}:{}", INITIAL_STATE_SECTION, name);
        if config.section_exists(&path) {
            let values = config.children(&path);
            debug!(component = %name, "Initial State: {} keys for {}", values.len(), name);
            component.set_initial_state(&values);
            applied += values.len();
        }
    }

    info!("Initial State: OK Applied {} keys", applied);
    applied
}

/// Hand the software version to the root as a `Version` initial state key
pub fn apply_version(root: &dyn RootComponent, version: &str) {
    let values = HashMap::from([(VERSION_KEY.to_string(), version.to_string())]);
    root.set_initial_state(&values);
}
