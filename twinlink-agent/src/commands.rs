//! Command routing into the device model tree
//!
//! Command names are `command` (root) or `component*command`. The router
//! always answers: either the serialized result or a structured error, never
//! a propagated failure.

use serde::Serialize;
use serde_json::{json, Value};
use std::time::Instant;
use tracing::{debug, error, info};

use crate::component::{Component, RootComponent};
use crate::error::RouteError;

/// Separates the component name from the command name
pub const COMMAND_SEPARATOR: char = '*';

pub const STATUS_OK: u16 = 200;

/// Incoming command invocation
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRequest {
    pub name: String,
    /// Raw JSON parameters; empty means no parameters
    pub payload: Vec<u8>,
}

impl CommandRequest {
    pub fn new(name: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            payload: payload.into(),
        }
    }
}

/// Response handed back to the transport
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResponse {
    pub status: u16,
    pub payload: Vec<u8>,
    pub execution_time_ms: u128,
}

impl CommandResponse {
    pub fn is_success(&self) -> bool {
        self.status == STATUS_OK
    }

    pub fn json(&self) -> Result<Value, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

/// Error information for failed commands
#[derive(Debug, Serialize)]
struct ErrorInfo {
    code: String,
    message: String,
}

/// Where a command name resolved to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTarget<'a> {
    /// `None` for the root
    pub component: Option<&'a str>,
    pub command: &'a str,
}

/// Split `component*command`; no separator targets the root
pub fn parse_command_name(name: &str) -> CommandTarget<'_> {
    match name.split_once(COMMAND_SEPARATOR) {
        Some((component, command)) => CommandTarget {
            component: Some(component),
            command,
        },
        None => CommandTarget {
            component: None,
            command: name,
        },
    }
}

pub struct CommandRouter;

impl CommandRouter {
    /// Resolve, execute and answer one command
    pub fn handle(root: &dyn RootComponent, request: &CommandRequest) -> CommandResponse {
        let started = Instant::now();
        debug!(command = %request.name, "Command: Received {}", request.name);

        match Self::execute(root, request) {
            Ok(payload) => {
                info!(
                    command = %request.name,
                    "Command: OK {} Response: {}",
                    request.name,
                    String::from_utf8_lossy(&payload)
                );
                CommandResponse {
                    status: STATUS_OK,
                    payload,
                    execution_time_ms: started.elapsed().as_millis(),
                }
            }
            Err(e) => {
                error!(command = %request.name, "Command: {} Failed: {}", request.name, e);
                Self::error_response(&e, started)
            }
        }
    }

    fn execute(root: &dyn RootComponent, request: &CommandRequest) -> Result<Vec<u8>, RouteError> {
        let target = parse_command_name(&request.name);
        let params = decode_params(&request.payload)?;

        let result = match target.component {
            None => root.do_command(target.command, &params)?,
            Some(name) => {
                let component = Self::resolve(root, name)?;
                component.do_command(target.command, &params)?
            }
        };

        serde_json::to_vec(&result).map_err(RouteError::Result)
    }

    fn resolve<'a>(root: &'a dyn RootComponent, name: &str) -> Result<&'a dyn Component, RouteError> {
        let mut matches = root.components().iter().filter(|(key, _)| key.as_str() == name);
        match (matches.next(), matches.next()) {
            (None, _) => Err(RouteError::UnknownComponent(name.to_string())),
            (Some((_, component)), None) => Ok(component.as_ref()),
            (Some(_), Some(_)) => Err(RouteError::AmbiguousComponent(name.to_string())),
        }
    }

    fn error_response(err: &RouteError, started: Instant) -> CommandResponse {
        let info = ErrorInfo {
            code: err.code().to_string(),
            message: err.to_string(),
        };
        let body = json!({ "error": info });
        CommandResponse {
            status: err.status(),
            payload: serde_json::to_vec(&body).unwrap_or_else(|_| b"{}".to_vec()),
            execution_time_ms: started.elapsed().as_millis(),
        }
    }
}

fn decode_params(payload: &[u8]) -> Result<Value, RouteError> {
    if payload.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(payload).map_err(RouteError::InvalidParams)
}
