//! MQTT transport and connector
//!
//! Topic layout under `<base_topic>/<device_id>`:
//! - `telemetry` and `telemetry/<component>`: one framed reading per message
//! - `twin/reported`: full snapshots and property acks
//! - `twin/desired`: retained desired document carrying `$version`
//! - `methods/<name>/<rid>`: command requests, answered on `methods/res/<rid>`
//!
//! The retained desired document is delivered again on every subscribe, which
//! is how the agent picks up desired state that changed while it was offline.

use async_trait::async_trait;
use rumqttc::{AsyncClient, ClientError, ConnectReturnCode, Event, EventLoop, Incoming, MqttOptions, QoS};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::{Connector, DeviceIdentity, Inbound, Link, Transport};
use crate::commands::{CommandRequest, CommandResponse};
use crate::config::AgentConfig;
use crate::error::{AgentError, TransportError};
use crate::properties::{DesiredPatch, PropertyAck};
use crate::telemetry::TelemetryMessage;

const INBOUND_CAPACITY: usize = 32;
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Topic names for one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    base: String,
}

impl Topics {
    pub fn new(base_topic: &str, device_id: &str) -> Self {
        Self {
            base: format!("{}/{}", base_topic.trim_end_matches('/'), device_id),
        }
    }

    pub fn telemetry(&self, component: Option<&str>) -> String {
        match component {
            Some(name) => format!("{}/telemetry/{}", self.base, name),
            None => format!("{}/telemetry", self.base),
        }
    }

    pub fn reported(&self) -> String {
        format!("{}/twin/reported", self.base)
    }

    pub fn desired(&self) -> String {
        format!("{}/twin/desired", self.base)
    }

    pub fn methods_filter(&self) -> String {
        format!("{}/methods/+/+", self.base)
    }

    /// Filters the device listens on; a clean session forgets them on reconnect
    pub fn subscriptions(&self) -> [String; 2] {
        [self.desired(), self.methods_filter()]
    }

    pub fn method_response(&self, request_id: &str) -> String {
        format!("{}/methods/res/{}", self.base, request_id)
    }

    /// `(command name, request id)` for a method request topic
    pub fn parse_method<'a>(&self, topic: &'a str) -> Option<(&'a str, &'a str)> {
        let rest = topic.strip_prefix(self.base.as_str())?.strip_prefix("/methods/")?;
        let (name, request_id) = rest.split_once('/')?;
        if name == "res" || name.is_empty() || request_id.is_empty() || request_id.contains('/') {
            return None;
        }
        Some((name, request_id))
    }
}

/// Wire envelope for one telemetry message
#[derive(Debug, Serialize)]
struct TelemetryEnvelope<'a> {
    message_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    component: Option<&'a str>,
    content_type: &'a str,
    timestamp: String,
    data: Value,
}

/// Wire response to a method request
#[derive(Debug, Serialize)]
struct MethodResponse {
    status: u16,
    payload: Value,
    execution_time_ms: u128,
}

impl From<&CommandResponse> for MethodResponse {
    fn from(response: &CommandResponse) -> Self {
        let payload = response
            .json()
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&response.payload).into_owned()));
        Self {
            status: response.status,
            payload,
            execution_time_ms: response.execution_time_ms,
        }
    }
}

pub struct MqttTransport {
    client: AsyncClient,
    topics: Topics,
}

impl MqttTransport {
    pub fn new(client: AsyncClient, topics: Topics) -> Self {
        Self { client, topics }
    }

    async fn publish_json(&self, topic: String, value: &impl Serialize) -> Result<(), TransportError> {
        let payload = serde_json::to_vec(value)?;
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| match e {
                // event loop gone
                ClientError::Request(_) => TransportError::NotConnected,
                other => TransportError::Publish(other.to_string()),
            })
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn send_telemetry(&self, message: TelemetryMessage) -> Result<(), TransportError> {
        let envelope = TelemetryEnvelope {
            message_id: &message.message_id,
            component: message.component.as_deref(),
            content_type: message.content_type,
            timestamp: message.created_at.to_rfc3339(),
            data: message.json()?,
        };
        let topic = self.topics.telemetry(message.component.as_deref());
        self.publish_json(topic, &envelope).await
    }

    async fn push_reported(&self, snapshot: Value) -> Result<(), TransportError> {
        self.publish_json(self.topics.reported(), &snapshot).await
    }

    async fn send_property_ack(&self, ack: &PropertyAck) -> Result<(), TransportError> {
        self.publish_json(self.topics.reported(), &ack.to_patch()).await
    }
}

/// Static provisioning + MQTT connect
pub struct MqttConnector {
    config: AgentConfig,
}

impl MqttConnector {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for MqttConnector {
    async fn provision(&self) -> Result<DeviceIdentity, AgentError> {
        let identity = provision_static(&self.config)?;
        info!("Provisioning: OK. Device {}", identity.device_id);
        Ok(identity)
    }

    async fn connect(&self, identity: &DeviceIdentity) -> Result<Link, AgentError> {
        let mqtt = &self.config.mqtt;
        let client_id = self.config.client_id(&identity.device_id);

        let mut options = MqttOptions::new(&client_id, &mqtt.broker_host, mqtt.broker_port);
        options.set_keep_alive(Duration::from_secs(mqtt.keep_alive_secs));
        options.set_clean_session(true);

        let (client, mut eventloop) = AsyncClient::new(options, 10);

        let timeout = Duration::from_secs(mqtt.connect_timeout_secs);
        tokio::time::timeout(timeout, wait_for_connack(&mut eventloop))
            .await
            .map_err(|_| AgentError::Connect(format!("no answer from {}:{} after {:?}", mqtt.broker_host, mqtt.broker_port, timeout)))??;

        let topics = Topics::new(&mqtt.base_topic, &identity.device_id);
        subscribe(&client, &topics)
            .await
            .map_err(|e| AgentError::Connect(format!("subscribe failed: {}", e)))?;

        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        tokio::spawn(run_event_loop(eventloop, client.clone(), topics.clone(), tx));

        info!(
            "Connection: OK. {} on {}:{}",
            client_id, mqtt.broker_host, mqtt.broker_port
        );

        Ok(Link {
            transport: std::sync::Arc::new(MqttTransport::new(client, topics)),
            inbound: rx,
        })
    }
}

/// Validate the `[provisioning]` section; only static identities are supported
pub fn provision_static(config: &AgentConfig) -> Result<DeviceIdentity, AgentError> {
    let provisioning = &config.provisioning;
    if provisioning.source != "static" {
        return Err(AgentError::Provisioning(format!(
            "source {} not supported",
            provisioning.source
        )));
    }

    match provisioning.device_id.as_deref().map(str::trim) {
        Some(id) if !id.is_empty() => Ok(DeviceIdentity { device_id: id.to_string() }),
        _ => Err(AgentError::Provisioning(
            "please supply provisioning.device_id in configuration".to_string(),
        )),
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), AgentError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                return if ack.code == ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(AgentError::Connect(format!("broker refused connection: {:?}", ack.code)))
                };
            }
            Ok(_) => {}
            Err(e) => return Err(AgentError::Connect(e.to_string())),
        }
    }
}

async fn subscribe(client: &AsyncClient, topics: &Topics) -> Result<(), ClientError> {
    for filter in topics.subscriptions() {
        client.subscribe(&filter, QoS::AtLeastOnce).await?;
        debug!("Connection: Subscribed to {}", filter);
    }
    Ok(())
}

async fn run_event_loop(mut eventloop: EventLoop, client: AsyncClient, topics: Topics, tx: mpsc::Sender<Inbound>) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                debug!("Received MQTT message on topic: {}", publish.topic);
                match decode_inbound(&topics, &publish.topic, &publish.payload) {
                    Ok(Some(Decoded::Desired(patch))) => {
                        if tx.send(Inbound::Desired(patch)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Some(Decoded::Command { request, request_id })) => {
                        let (reply_tx, reply_rx) = oneshot::channel();
                        if tx.send(Inbound::Command(request, reply_tx)).await.is_err() {
                            break;
                        }
                        tokio::spawn(respond(client.clone(), topics.method_response(&request_id), reply_rx));
                    }
                    Ok(None) => {}
                    Err(e) => warn!("Dropping inbound message: {}", e),
                }
            }
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                info!("Connection: Reconnected, restoring subscriptions");
                if let Err(e) = subscribe(&client, &topics).await {
                    error!("Connection: Resubscribe failed: {}", e);
                }
            }
            Ok(_) => {}
            Err(e) => {
                error!("MQTT connection error: {}", e);
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
    debug!("MQTT event loop stopped: agent no longer listening");
}

async fn respond(client: AsyncClient, topic: String, reply: oneshot::Receiver<CommandResponse>) {
    let Ok(response) = reply.await else {
        warn!("Command: no response produced for {}", topic);
        return;
    };
    let body = MethodResponse::from(&response);
    match serde_json::to_vec(&body) {
        Ok(payload) => {
            if let Err(e) = client.publish(topic, QoS::AtLeastOnce, false, payload).await {
                error!("Command: failed to publish response: {}", e);
            }
        }
        Err(e) => error!("Command: failed to serialize response: {}", e),
    }
}

#[derive(Debug, PartialEq)]
enum Decoded {
    Desired(DesiredPatch),
    Command { request: CommandRequest, request_id: String },
}

fn decode_inbound(topics: &Topics, topic: &str, payload: &[u8]) -> Result<Option<Decoded>, TransportError> {
    if topic == topics.desired() {
        if payload.is_empty() {
            // retained document cleared
            return Ok(None);
        }
        let document: Value = serde_json::from_slice(payload).map_err(|e| TransportError::Malformed {
            topic: topic.to_string(),
            reason: e.to_string(),
        })?;
        return DesiredPatch::from_document(document).map(|patch| Some(Decoded::Desired(patch)));
    }

    if let Some((name, request_id)) = topics.parse_method(topic) {
        return Ok(Some(Decoded::Command {
            request: CommandRequest::new(name, payload.to_vec()),
            request_id: request_id.to_string(),
        }));
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn topics() -> Topics {
        Topics::new("twinlink/devices/", "dev-01")
    }

    #[test]
    fn test_topic_layout() {
        let t = topics();
        assert_eq!(t.telemetry(None), "twinlink/devices/dev-01/telemetry");
        assert_eq!(t.telemetry(Some("thermostat1")), "twinlink/devices/dev-01/telemetry/thermostat1");
        assert_eq!(t.reported(), "twinlink/devices/dev-01/twin/reported");
        assert_eq!(t.methods_filter(), "twinlink/devices/dev-01/methods/+/+");
        assert_eq!(t.method_response("r1"), "twinlink/devices/dev-01/methods/res/r1");
    }

    #[test]
    fn test_subscriptions_cover_inbound_topics() {
        let t = topics();
        let filters = t.subscriptions();
        assert_eq!(
            filters,
            [
                "twinlink/devices/dev-01/twin/desired".to_string(),
                "twinlink/devices/dev-01/methods/+/+".to_string(),
            ]
        );

        // everything decode_inbound accepts arrives through one of them
        assert_eq!(filters[0], t.desired());
        assert!(t.parse_method("twinlink/devices/dev-01/methods/reboot/9").is_some());
    }

    #[tokio::test]
    async fn test_resubscribe_queues_every_filter() {
        let options = MqttOptions::new("test-client", "127.0.0.1", 1883);
        let (client, mut eventloop) = AsyncClient::new(options, 10);

        subscribe(&client, &topics()).await.unwrap();

        // nothing is polled, so the requests are still queued for the next connection
        eventloop.clean();
        let queued: Vec<String> = eventloop
            .pending
            .drain(..)
            .filter_map(|request| match request {
                rumqttc::Request::Subscribe(subscribe) => Some(subscribe.filters),
                _ => None,
            })
            .flatten()
            .map(|filter| filter.path)
            .collect();
        assert_eq!(queued, topics().subscriptions().to_vec());
    }

    #[test]
    fn test_parse_method_topics() {
        let t = topics();
        assert_eq!(
            t.parse_method("twinlink/devices/dev-01/methods/thermostat1*getMaxMinReport/17"),
            Some(("thermostat1*getMaxMinReport", "17"))
        );
        assert_eq!(t.parse_method("twinlink/devices/dev-01/methods/res/17"), None);
        assert_eq!(t.parse_method("twinlink/devices/dev-02/methods/reboot/1"), None);
        assert_eq!(t.parse_method("twinlink/devices/dev-01/methods/reboot"), None);
    }

    #[test]
    fn test_decode_desired_and_command() {
        let t = topics();
        let desired = serde_json::to_vec(&json!({"$version": 3, "telemetryPeriod": "5s"})).unwrap();
        match decode_inbound(&t, &t.desired(), &desired).unwrap() {
            Some(Decoded::Desired(patch)) => {
                assert_eq!(patch.version, 3);
                assert_eq!(patch.properties["telemetryPeriod"], "5s");
            }
            other => panic!("unexpected {:?}", other),
        }

        assert_eq!(decode_inbound(&t, &t.desired(), b"").unwrap(), None);
        assert!(decode_inbound(&t, &t.desired(), b"{oops").is_err());

        let topic = "twinlink/devices/dev-01/methods/reboot/abc";
        match decode_inbound(&t, topic, br#"{"delay":1}"#).unwrap() {
            Some(Decoded::Command { request, request_id }) => {
                assert_eq!(request.name, "reboot");
                assert_eq!(request_id, "abc");
                assert_eq!(request.payload, br#"{"delay":1}"#.to_vec());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_static_provisioning() {
        let mut config = AgentConfig::default();
        assert!(matches!(provision_static(&config), Err(AgentError::Provisioning(_))));

        config.provisioning.device_id = Some(" dev-01 ".into());
        assert_eq!(provision_static(&config).unwrap().device_id, "dev-01");

        config.provisioning.source = "dps".into();
        assert!(matches!(provision_static(&config), Err(AgentError::Provisioning(_))));
    }

    #[test]
    fn test_method_response_wraps_json() {
        let response = CommandResponse {
            status: 200,
            payload: br#"{"ok":true}"#.to_vec(),
            execution_time_ms: 3,
        };
        let body = serde_json::to_value(MethodResponse::from(&response)).unwrap();
        assert_eq!(body, json!({"status": 200, "payload": {"ok": true}, "execution_time_ms": 3}));
    }
}
