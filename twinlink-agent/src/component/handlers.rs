use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::error::ComponentError;

/// Setter or command body operating on a component's locked state
pub type Handler<S> = fn(&mut S, &Value) -> Result<Value, ComponentError>;

/// What a table dispatches, which decides the error on a lookup miss
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Property,
    Command,
}

/// Name -> handler registration table built once at component construction
pub struct HandlerTable<S> {
    kind: HandlerKind,
    entries: BTreeMap<&'static str, Handler<S>>,
}

impl<S> HandlerTable<S> {
    pub fn properties() -> Self {
        Self {
            kind: HandlerKind::Property,
            entries: BTreeMap::new(),
        }
    }

    pub fn commands() -> Self {
        Self {
            kind: HandlerKind::Command,
            entries: BTreeMap::new(),
        }
    }

    pub fn with(mut self, name: &'static str, handler: Handler<S>) -> Self {
        self.entries.insert(name, handler);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.keys().copied()
    }

    /// Look up `name` and run its handler against `state`
    pub fn invoke(
        &self,
        component: &str,
        state: &mut S,
        name: &str,
        raw: &Value,
    ) -> Result<Value, ComponentError> {
        match self.entries.get(name) {
            Some(handler) => handler(state, raw),
            None => Err(match self.kind {
                HandlerKind::Property => ComponentError::UnknownProperty {
                    component: component.to_string(),
                    name: name.to_string(),
                },
                HandlerKind::Command => ComponentError::UnknownCommand {
                    component: component.to_string(),
                    name: name.to_string(),
                },
            }),
        }
    }
}

impl<S> fmt::Debug for HandlerTable<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerTable")
            .field("kind", &self.kind)
            .field("entries", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}
