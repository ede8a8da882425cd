//! Whole-agent runs over the mock connector

use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use twinlink_agent::component::{Component, ComponentMap, RootComponent, TelemetryReading};
use twinlink_agent::config::LoopConfig;
use twinlink_agent::error::{AgentError, ComponentError};
use twinlink_agent::properties::DesiredPatch;
use twinlink_agent::{Agent, AGENT_VERSION};
use twinlink_devkit::{MockConnector, MockTransport, Reading, ScriptedComponent, ScriptedRoot, TestHarness};

fn tree(period: Duration) -> (ScriptedRoot, Arc<ScriptedComponent>) {
    let sensor = Arc::new(
        ScriptedComponent::new("test:sensor;1")
            .with_property("gain", json!(1))
            .with_command("calibrate", json!({"calibrated": true}))
            .with_reading(Reading::Value(TelemetryReading::new().with("t", 20.0))),
    );
    let root = ScriptedRoot::new(
        ScriptedComponent::new("test:root;1").with_property("serialNumber", Value::Null),
        period,
    )
    .with_component("sensorA", sensor.clone());
    (root, sensor)
}

fn desired(version: i64, document: Value) -> DesiredPatch {
    match document {
        Value::Object(map) => DesiredPatch::new(version, map),
        _ => DesiredPatch::new(version, Map::new()),
    }
}

fn run_once() -> LoopConfig {
    LoopConfig {
        run_once: true,
        ..LoopConfig::default()
    }
}

#[tokio::test]
async fn test_run_once_startup_sequence() {
    let (root, sensor) = tree(Duration::from_secs(5));
    let transport = MockTransport::new().with_desired(desired(9, json!({"sensorA": {"__t": "c", "gain": 4}})));
    let harness = TestHarness::with_transport(root, transport);
    let (mut agent, connector, _inbound) = harness.agent(&run_once());

    agent.initialize(&toml::Table::new());
    agent.run(&connector, CancellationToken::new()).await.unwrap();

    // startup push happened, loop tick was still inside the backoff window
    let reported = harness.transport.reported();
    assert_eq!(reported.len(), 1);
    assert_eq!(reported[0]["sensorA"]["__t"], "c");

    // desired state waiting at connect was applied and acked
    assert_eq!(sensor.property("gain"), Some(json!(4)));
    harness.assert_acked("gain", &json!(4)).unwrap();

    // exactly one telemetry cycle
    assert_eq!(harness.transport.telemetry_for(Some("sensorA")).len(), 1);

    let initial = harness.root.own().initial_state();
    assert_eq!(initial.last().unwrap()["Version"], AGENT_VERSION);
}

#[tokio::test]
async fn test_initial_state_reaches_components() {
    let (root, sensor) = tree(Duration::ZERO);
    let harness = TestHarness::new(root);
    let (agent, _connector, _inbound) = harness.agent(&run_once());

    let config: toml::Table = toml::from_str(
        r#"
        [InitialState.Root]
        SerialNumber = "SN-1"
        [InitialState.sensorA]
        Gain = 3
        "#,
    )
    .unwrap();

    assert_eq!(agent.initialize(&config), 2);
    assert_eq!(sensor.initial_state()[0]["Gain"], "3");
    assert_eq!(harness.root.own().initial_state()[0]["SerialNumber"], "SN-1");
}

#[tokio::test]
async fn test_inbound_events_while_running() {
    let (root, sensor) = tree(Duration::ZERO);
    let harness = TestHarness::new(root);
    let (mut agent, connector, inbound) = harness.agent(&LoopConfig::default());

    let cancel = CancellationToken::new();
    let run = {
        let cancel = cancel.clone();
        tokio::spawn(async move { agent.run(&connector, cancel).await })
    };

    let response = inbound.invoke("sensorA*calibrate", b"").await.unwrap();
    assert!(response.is_success());
    assert_eq!(response.json().unwrap(), json!({"calibrated": true}));
    assert_eq!(sensor.commands(), vec![("calibrate".to_string(), Value::Null)]);

    let response = inbound.invoke("sensorQ*calibrate", b"").await.unwrap();
    assert_eq!(response.status, 404);

    inbound
        .send_desired(desired(2, json!({"serialNumber": "SN-2"})))
        .await
        .unwrap();
    assert!(harness.wait_for(1000, |t| t.acks().len() == 1).await);
    harness.assert_acked("serialNumber", &json!("SN-2")).unwrap();

    cancel.cancel();
    run.await.unwrap().unwrap();

    // period zero: telemetry disabled the whole time
    assert!(harness.transport.telemetry().is_empty());
}

#[tokio::test]
async fn test_startup_failures_are_fatal() {
    let (root, _sensor) = tree(Duration::ZERO);
    let harness = TestHarness::new(root);

    let (mut agent, connector, _inbound) = harness.agent(&run_once());
    let result = agent.run(&connector.failing_provision(), CancellationToken::new()).await;
    assert!(matches!(result, Err(AgentError::Provisioning(_))));

    let (mut agent, connector, _inbound) = harness.agent(&run_once());
    let result = agent.run(&connector.failing_connect(), CancellationToken::new()).await;
    assert!(matches!(result, Err(AgentError::Connect(_))));

    assert_eq!(harness.stats().reported, 0);
}

/// Root whose `mode` setter blocks for a while when asked for "old"
struct SlowSetter {
    mode: Mutex<String>,
    components: ComponentMap,
}

impl Component for SlowSetter {
    fn identity(&self) -> &str {
        "test:slow;1"
    }

    fn properties(&self) -> Value {
        json!({"mode": *self.mode.lock()})
    }

    fn set_property(&self, name: &str, raw: &Value) -> Result<Value, ComponentError> {
        if name != "mode" {
            return Err(ComponentError::UnknownProperty {
                component: "root".into(),
                name: name.into(),
            });
        }
        let mode = raw.as_str().ok_or_else(|| ComponentError::InvalidValue {
            name: name.into(),
            reason: "expected a string".into(),
        })?;
        if mode == "old" {
            std::thread::sleep(Duration::from_millis(300));
        }
        *self.mode.lock() = mode.to_string();
        Ok(json!(mode))
    }

    fn set_initial_state(&self, _values: &HashMap<String, String>) {}
}

impl RootComponent for SlowSetter {
    fn telemetry_period(&self) -> Duration {
        Duration::ZERO
    }

    fn components(&self) -> &ComponentMap {
        &self.components
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_desired_patches_apply_in_arrival_order() {
    let root = Arc::new(SlowSetter {
        mode: Mutex::new("idle".into()),
        components: ComponentMap::new(),
    });
    let transport = Arc::new(MockTransport::new());
    let (connector, inbound) = MockConnector::new(transport.clone());
    let mut agent = Agent::new(root.clone(), &LoopConfig::default());

    let cancel = CancellationToken::new();
    let run = {
        let cancel = cancel.clone();
        tokio::spawn(async move { agent.run(&connector, cancel).await })
    };

    inbound.send_desired(desired(1, json!({"mode": "old"}))).await.unwrap();
    inbound.send_desired(desired(2, json!({"mode": "new"}))).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while transport.acks().len() < 2 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    cancel.cancel();
    run.await.unwrap().unwrap();

    assert_eq!(*root.mode.lock(), "new");
    let acks: Vec<_> = transport.acks().into_iter().map(|ack| (ack.version, ack.value)).collect();
    assert_eq!(acks, vec![(1, json!("old")), (2, json!("new"))]);
}

#[tokio::test]
async fn test_older_desired_version_is_ignored() {
    let (root, sensor) = tree(Duration::ZERO);
    let transport = MockTransport::new().with_desired(desired(5, json!({"sensorA": {"gain": 5}})));
    let harness = TestHarness::with_transport(root, transport);
    let (mut agent, connector, inbound) = harness.agent(&LoopConfig::default());

    let cancel = CancellationToken::new();
    let run = {
        let cancel = cancel.clone();
        tokio::spawn(async move { agent.run(&connector, cancel).await })
    };

    // startup applied v5; v3 arrives late and v6 follows it through the same queue
    inbound.send_desired(desired(3, json!({"sensorA": {"gain": 3}}))).await.unwrap();
    inbound.send_desired(desired(6, json!({"serialNumber": "SN-6"}))).await.unwrap();
    assert!(harness.wait_for(1000, |t| !t.acks_for("serialNumber").is_empty()).await);

    cancel.cancel();
    run.await.unwrap().unwrap();

    assert_eq!(sensor.property("gain"), Some(json!(5)));
    let versions: Vec<i64> = harness.transport.acks().iter().map(|ack| ack.version).collect();
    assert_eq!(versions, vec![5, 6]);
}
