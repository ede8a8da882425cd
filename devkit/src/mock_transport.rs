/*!
In-memory transport and connector

Records every outbound message so tests can assert on telemetry, reported
pushes and acks without a broker. Each outbound primitive can be switched to
fail on demand. The connector hands out the mock transport plus an
[`InboundHandle`] used to inject desired patches and command invocations.
*/

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

use twinlink_agent::commands::{CommandRequest, CommandResponse};
use twinlink_agent::error::{AgentError, TransportError};
use twinlink_agent::properties::{Clock, DesiredPatch, PropertyAck};
use twinlink_agent::telemetry::TelemetryMessage;
use twinlink_agent::transport::{Connector, DeviceIdentity, Inbound, Link, Transport};

#[derive(Debug, Default, Clone, Copy)]
struct Failures {
    telemetry: bool,
    reported: bool,
    acks: bool,
}

#[derive(Default)]
pub struct MockTransport {
    telemetry: Mutex<Vec<TelemetryMessage>>,
    reported: Mutex<Vec<Value>>,
    acks: Mutex<Vec<PropertyAck>>,
    desired: Mutex<Option<DesiredPatch>>,
    failures: Mutex<Failures>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Desired document returned by `fetch_desired`
    pub fn with_desired(self, patch: DesiredPatch) -> Self {
        *self.desired.lock() = Some(patch);
        self
    }

    pub fn fail_telemetry(&self, fail: bool) {
        self.failures.lock().telemetry = fail;
    }

    pub fn fail_reported(&self, fail: bool) {
        self.failures.lock().reported = fail;
    }

    pub fn fail_acks(&self, fail: bool) {
        self.failures.lock().acks = fail;
    }

    pub fn telemetry(&self) -> Vec<TelemetryMessage> {
        self.telemetry.lock().clone()
    }

    /// Telemetry attributed to `component` (`None` for the root)
    pub fn telemetry_for(&self, component: Option<&str>) -> Vec<TelemetryMessage> {
        self.telemetry
            .lock()
            .iter()
            .filter(|m| m.component.as_deref() == component)
            .cloned()
            .collect()
    }

    pub fn reported(&self) -> Vec<Value> {
        self.reported.lock().clone()
    }

    pub fn acks(&self) -> Vec<PropertyAck> {
        self.acks.lock().clone()
    }

    /// Acks for `property`, whatever component they belong to
    pub fn acks_for(&self, property: &str) -> Vec<PropertyAck> {
        self.acks.lock().iter().filter(|a| a.property == property).cloned().collect()
    }

    pub fn clear(&self) {
        self.telemetry.lock().clear();
        self.reported.lock().clear();
        self.acks.lock().clear();
    }
}

fn rejected(what: &str) -> TransportError {
    TransportError::Publish(format!("mock {} failure", what))
}

#[async_trait]
impl Transport for MockTransport {
    async fn send_telemetry(&self, message: TelemetryMessage) -> Result<(), TransportError> {
        if self.failures.lock().telemetry {
            return Err(rejected("telemetry"));
        }
        log::info!("[MOCK] telemetry from {:?}: {} bytes", message.component, message.payload.len());
        self.telemetry.lock().push(message);
        Ok(())
    }

    async fn push_reported(&self, snapshot: Value) -> Result<(), TransportError> {
        if self.failures.lock().reported {
            return Err(rejected("reported"));
        }
        log::info!("[MOCK] reported push");
        self.reported.lock().push(snapshot);
        Ok(())
    }

    async fn send_property_ack(&self, ack: &PropertyAck) -> Result<(), TransportError> {
        if self.failures.lock().acks {
            return Err(rejected("ack"));
        }
        log::info!("[MOCK] ack {} v{}", ack.scoped_key(), ack.version);
        self.acks.lock().push(ack.clone());
        Ok(())
    }

    async fn fetch_desired(&self) -> Result<Option<DesiredPatch>, TransportError> {
        Ok(self.desired.lock().clone())
    }
}

/// Sender side of the agent's inbound channel
#[derive(Clone)]
pub struct InboundHandle {
    sender: mpsc::Sender<Inbound>,
}

impl InboundHandle {
    pub async fn send_desired(&self, patch: DesiredPatch) -> anyhow::Result<()> {
        self.sender
            .send(Inbound::Desired(patch))
            .await
            .map_err(|_| anyhow::anyhow!("agent is not listening"))
    }

    /// Invoke a command and wait for its response
    pub async fn invoke(&self, name: &str, payload: &[u8]) -> anyhow::Result<CommandResponse> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(Inbound::Command(CommandRequest::new(name, payload.to_vec()), reply))
            .await
            .map_err(|_| anyhow::anyhow!("agent is not listening"))?;
        Ok(response.await?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectorFailure {
    None,
    Provision,
    Connect,
}

/// Connector handing out a shared [`MockTransport`]; connects once
pub struct MockConnector {
    device_id: String,
    transport: Arc<MockTransport>,
    inbound: Mutex<Option<mpsc::Receiver<Inbound>>>,
    failure: ConnectorFailure,
}

impl MockConnector {
    pub fn new(transport: Arc<MockTransport>) -> (Self, InboundHandle) {
        let (sender, receiver) = mpsc::channel(16);
        (
            Self {
                device_id: "mock-device".to_string(),
                transport,
                inbound: Mutex::new(Some(receiver)),
                failure: ConnectorFailure::None,
            },
            InboundHandle { sender },
        )
    }

    pub fn failing_provision(mut self) -> Self {
        self.failure = ConnectorFailure::Provision;
        self
    }

    pub fn failing_connect(mut self) -> Self {
        self.failure = ConnectorFailure::Connect;
        self
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn provision(&self) -> Result<DeviceIdentity, AgentError> {
        if self.failure == ConnectorFailure::Provision {
            return Err(AgentError::Provisioning("mock provisioning failure".to_string()));
        }
        Ok(DeviceIdentity {
            device_id: self.device_id.clone(),
        })
    }

    async fn connect(&self, _identity: &DeviceIdentity) -> Result<Link, AgentError> {
        if self.failure == ConnectorFailure::Connect {
            return Err(AgentError::Connect("mock connect failure".to_string()));
        }
        let inbound = self
            .inbound
            .lock()
            .take()
            .ok_or_else(|| AgentError::Connect("mock connector already used".to_string()))?;
        Ok(Link {
            transport: self.transport.clone(),
            inbound,
        })
    }
}

/// Clock that only moves when told to
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use twinlink_agent::component::TelemetryReading;

    #[tokio::test]
    async fn test_records_and_fails_on_demand() {
        let transport = MockTransport::new();

        let reading = TelemetryReading::new().with("temperature", 21.5);
        transport
            .send_telemetry(TelemetryMessage::frame(&reading, Some("thermostat1")).unwrap())
            .await
            .unwrap();
        assert_eq!(transport.telemetry_for(Some("thermostat1")).len(), 1);
        assert!(transport.telemetry_for(None).is_empty());

        transport.fail_reported(true);
        assert!(transport.push_reported(json!({})).await.is_err());
        assert!(transport.reported().is_empty());

        transport.fail_reported(false);
        transport.push_reported(json!({"a": 1})).await.unwrap();
        assert_eq!(transport.reported(), vec![json!({"a": 1})]);
    }

    #[tokio::test]
    async fn test_connector_hands_out_link_once() {
        let transport = Arc::new(MockTransport::new());
        let (connector, _inbound) = MockConnector::new(transport);

        let identity = connector.provision().await.unwrap();
        assert!(connector.connect(&identity).await.is_ok());
        assert!(matches!(connector.connect(&identity).await, Err(AgentError::Connect(_))));
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new();
        let start = clock.now();
        clock.advance(Duration::from_secs(90));
        assert_eq!(clock.now() - start, Duration::from_secs(90));
    }
}
