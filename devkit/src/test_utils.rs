/*!
Test harness for agent flows

Wires a [`ScriptedRoot`] to a [`MockTransport`] and a [`ManualClock`], and
builds the flow objects (scheduler, synchronizer, agent) against them.
*/

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use twinlink_agent::agent::Agent;
use twinlink_agent::config::LoopConfig;
use twinlink_agent::properties::{Backoff, PropertySynchronizer};
use twinlink_agent::telemetry::TelemetryScheduler;

use crate::fixtures::ScriptedRoot;
use crate::mock_transport::{InboundHandle, ManualClock, MockConnector, MockTransport};

pub struct TestHarness {
    pub root: Arc<ScriptedRoot>,
    pub transport: Arc<MockTransport>,
    pub clock: Arc<ManualClock>,
}

impl TestHarness {
    pub fn new(root: ScriptedRoot) -> Self {
        Self::with_transport(root, MockTransport::new())
    }

    pub fn with_transport(root: ScriptedRoot, transport: MockTransport) -> Self {
        env_logger::try_init().ok();

        Self {
            root: Arc::new(root),
            transport: Arc::new(transport),
            clock: Arc::new(ManualClock::new()),
        }
    }

    pub fn scheduler(&self, retry_period: Duration) -> TelemetryScheduler {
        TelemetryScheduler::new(retry_period)
    }

    /// Synchronizer driven by the harness clock
    pub fn synchronizer(&self, initial: Duration, cap: Duration) -> PropertySynchronizer {
        PropertySynchronizer::new(Backoff::new(initial, cap), self.clock.clone())
    }

    /// Agent plus connector, both wired to the harness transport
    pub fn agent(&self, config: &LoopConfig) -> (Agent, MockConnector, InboundHandle) {
        let agent = Agent::with_clock(self.root.clone(), config, self.clock.clone());
        let (connector, inbound) = MockConnector::new(self.transport.clone());
        (agent, connector, inbound)
    }

    /// Poll until `check` holds or `timeout_ms` elapses
    pub async fn wait_for<F>(&self, timeout_ms: u64, mut check: F) -> bool
    where
        F: FnMut(&MockTransport) -> bool,
    {
        let start = std::time::Instant::now();
        while start.elapsed() < Duration::from_millis(timeout_ms) {
            if check(&self.transport) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        log::warn!("Timeout after {}ms waiting on mock transport", timeout_ms);
        check(&self.transport)
    }

    /// Assert that one ack carries `property` = `value`
    pub fn assert_acked(&self, property: &str, value: &Value) -> anyhow::Result<()> {
        let acks = self.transport.acks_for(property);
        match acks.as_slice() {
            [ack] if ack.value == *value => Ok(()),
            [ack] => anyhow::bail!("ack for {} carried {}, expected {}", property, ack.value, value),
            [] => anyhow::bail!("no ack for {}", property),
            _ => anyhow::bail!("{} acks for {}, expected one", acks.len(), property),
        }
    }

    pub fn stats(&self) -> TestStats {
        TestStats {
            telemetry: self.transport.telemetry().len(),
            reported: self.transport.reported().len(),
            acks: self.transport.acks().len(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestStats {
    pub telemetry: usize,
    pub reported: usize,
    pub acks: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::ScriptedComponent;
    use serde_json::json;
    use twinlink_agent::properties::PropertyAck;
    use twinlink_agent::transport::Transport;

    #[tokio::test]
    async fn test_harness_basic_functionality() {
        let harness = TestHarness::new(ScriptedRoot::new(ScriptedComponent::new("test:root;1"), Duration::ZERO));

        harness
            .transport
            .send_property_ack(&PropertyAck::ok(None, "gain", json!(5), 2))
            .await
            .unwrap();

        assert!(harness.wait_for(100, |t| t.acks().len() == 1).await);
        harness.assert_acked("gain", &json!(5)).unwrap();
        assert!(harness.assert_acked("gain", &json!(6)).is_err());
        assert_eq!(harness.stats(), TestStats { telemetry: 0, reported: 0, acks: 1 });
    }
}
