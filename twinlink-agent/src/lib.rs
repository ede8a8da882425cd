//! twinlink - device twin agent
//!
//! Keeps an in-process device model tree in sync with a cloud twin:
//! - periodic telemetry per component
//! - full reported-property pushes under exponential backoff
//! - desired-property patches reconciled and acknowledged
//! - commands routed to `component*command` handlers

pub mod agent;
pub mod commands;
pub mod component;
pub mod config;
pub mod devices;
pub mod error;
pub mod initial_state;
pub mod properties;
pub mod telemetry;
pub mod transport;

pub use agent::{Agent, AGENT_VERSION};
pub use commands::{CommandRequest, CommandResponse, CommandRouter};
pub use component::{Component, ComponentMap, RootComponent, SharedRoot, TelemetryReading};
pub use config::AgentConfig;
pub use error::{AgentError, ComponentError, RouteError, SyncError, TransportError};
pub use properties::{Backoff, Clock, DesiredPatch, PatchReconciler, PropertyAck, PropertySynchronizer, SystemClock};
pub use telemetry::{TelemetryMessage, TelemetryScheduler};
pub use transport::{Connector, DeviceIdentity, Inbound, Link, SharedTransport, Transport};
