//! Error types shared across the agent
//!
//! Errors are split by the boundary they cross:
//! - `ComponentError`: raised by device model components
//! - `RouteError`: command routing failures (wraps component errors)
//! - `TransportError`: anything the cloud link reports
//! - `SyncError`: full property sync failures, classified for logging
//! - `AgentError`: fatal startup errors that end the run

use thiserror::Error;

/// Failure raised by a component while handling a property, command or reading
#[derive(Debug, Error)]
pub enum ComponentError {
    #[error("property {name} is not implemented on {component}")]
    UnknownProperty { component: String, name: String },

    #[error("command {name} is not implemented on {component}")]
    UnknownCommand { component: String, name: String },

    #[error("invalid value for {name}: {reason}")]
    InvalidValue { name: String, reason: String },

    /// Sensor or bus currently unreachable; soft, retried next cycle
    #[error("{component} unavailable: {reason}")]
    Unavailable { component: String, reason: String },

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

/// Failure while resolving or executing a command
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("unknown component: {0}")]
    UnknownComponent(String),

    #[error("ambiguous component: {0}")]
    AmbiguousComponent(String),

    #[error("invalid command parameters: {0}")]
    InvalidParams(#[source] serde_json::Error),

    #[error(transparent)]
    Component(#[from] ComponentError),

    #[error("failed to serialize command result: {0}")]
    Result(#[source] serde_json::Error),
}

impl RouteError {
    /// Stable error code used in structured command responses
    pub fn code(&self) -> &'static str {
        match self {
            RouteError::UnknownComponent(_) => "unknown_component",
            RouteError::AmbiguousComponent(_) => "ambiguous_component",
            RouteError::InvalidParams(_) => "invalid_params",
            RouteError::Component(ComponentError::UnknownCommand { .. }) => "unknown_command",
            RouteError::Component(ComponentError::InvalidValue { .. }) => "invalid_value",
            RouteError::Component(ComponentError::Unavailable { .. }) => "unavailable",
            RouteError::Component(_) => "command_failed",
            RouteError::Result(_) => "invalid_result",
        }
    }

    /// Status code returned to the caller of the command
    pub fn status(&self) -> u16 {
        match self {
            RouteError::UnknownComponent(_) => 404,
            RouteError::Component(ComponentError::UnknownCommand { .. }) => 404,
            RouteError::AmbiguousComponent(_) => 409,
            RouteError::InvalidParams(_) => 400,
            RouteError::Component(ComponentError::InvalidValue { .. }) => 400,
            RouteError::Component(ComponentError::Unavailable { .. }) => 503,
            _ => 500,
        }
    }
}

/// Failure reported by the cloud transport
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport not connected")]
    NotConnected,

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("malformed message on {topic}: {reason}")]
    Malformed { topic: String, reason: String },

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

/// Full property sync failure, classified the way it is logged
#[derive(Debug, Error)]
pub enum SyncError {
    /// Expected condition (link down, component not ready); message only
    #[error("{0}")]
    Soft(String),

    /// Several independent causes, each logged on its own
    #[error("{} property sync failures", .0.len())]
    Aggregate(Vec<SyncError>),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<TransportError> for SyncError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::NotConnected | TransportError::Publish(_) => SyncError::Soft(err.to_string()),
            other => SyncError::Other(other.into()),
        }
    }
}

/// Fatal agent error; terminates the run
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("provisioning failed: {0}")]
    Provisioning(String),

    #[error("connection failed: {0}")]
    Connect(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_error_codes() {
        let err = RouteError::UnknownComponent("sensorA".into());
        assert_eq!(err.code(), "unknown_component");
        assert_eq!(err.status(), 404);

        let err = RouteError::Component(ComponentError::UnknownCommand {
            component: "root".into(),
            name: "reboot".into(),
        });
        assert_eq!(err.code(), "unknown_command");
        assert_eq!(err.status(), 404);

        let err = RouteError::AmbiguousComponent("x".into());
        assert_eq!(err.status(), 409);
    }

    #[test]
    fn test_transport_errors_are_soft_for_sync() {
        let sync: SyncError = TransportError::NotConnected.into();
        assert!(matches!(sync, SyncError::Soft(_)));

        let sync: SyncError = TransportError::Malformed {
            topic: "t".into(),
            reason: "bad".into(),
        }
        .into();
        assert!(matches!(sync, SyncError::Other(_)));
    }
}
