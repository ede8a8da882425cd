//! Cloud link boundary
//!
//! The core never talks to a broker directly. It sees:
//! - [`Transport`]: outbound primitives (telemetry, reported properties, acks)
//! - [`Inbound`]: desired patches and command invocations delivered on a channel
//! - [`Connector`]: provisioning + connect, producing a [`Link`]
//!
//! The MQTT implementation lives in [`mqtt`].

pub mod mqtt;

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use crate::commands::{CommandRequest, CommandResponse};
use crate::error::{AgentError, TransportError};
use crate::properties::{DesiredPatch, PropertyAck};
use crate::telemetry::TelemetryMessage;

/// Outbound transport primitives
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_telemetry(&self, message: TelemetryMessage) -> Result<(), TransportError>;

    /// Replace/merge the reported side of the twin with `snapshot`
    async fn push_reported(&self, snapshot: Value) -> Result<(), TransportError>;

    async fn send_property_ack(&self, ack: &PropertyAck) -> Result<(), TransportError>;

    /// Current desired document, if this transport can read it on demand
    async fn fetch_desired(&self) -> Result<Option<DesiredPatch>, TransportError> {
        Ok(None)
    }
}

pub type SharedTransport = Arc<dyn Transport>;

/// Event delivered by the transport on its own schedule
#[derive(Debug)]
pub enum Inbound {
    Desired(DesiredPatch),
    Command(CommandRequest, oneshot::Sender<CommandResponse>),
}

/// Result of a successful connect
pub struct Link {
    pub transport: SharedTransport,
    pub inbound: mpsc::Receiver<Inbound>,
}

/// Identity assigned by provisioning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub device_id: String,
}

/// Provisioning and connect bookends of the agent run
#[async_trait]
pub trait Connector: Send + Sync {
    async fn provision(&self) -> Result<DeviceIdentity, AgentError>;

    async fn connect(&self, identity: &DeviceIdentity) -> Result<Link, AgentError>;
}
