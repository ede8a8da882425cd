//! Telemetry scheduling for the device model tree
//!
//! One cycle polls the root, then every named component, and dispatches one
//! message per component that produced a reading. Readings are never batched
//! across components: consumers rely on the component name carried by each
//! message for provenance.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::component::{Component, RootComponent, TelemetryReading};
use crate::error::{ComponentError, TransportError};
use crate::transport::Transport;

/// Delay before re-checking when the telemetry period is zero
pub const DEFAULT_RETRY_PERIOD: Duration = Duration::from_secs(60);

const CONTENT_TYPE_JSON: &str = "application/json";
const CONTENT_ENCODING_UTF8: &str = "utf-8";

/// One framed telemetry message, attributed to at most one component
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryMessage {
    pub message_id: String,
    /// `None` for readings from the root
    pub component: Option<String>,
    pub content_type: &'static str,
    pub content_encoding: &'static str,
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

impl TelemetryMessage {
    pub fn frame(reading: &TelemetryReading, component: Option<&str>) -> Result<Self, serde_json::Error> {
        Ok(Self {
            message_id: Uuid::new_v4().to_string(),
            component: component.filter(|name| !name.trim().is_empty()).map(str::to_string),
            content_type: CONTENT_TYPE_JSON,
            content_encoding: CONTENT_ENCODING_UTF8,
            payload: serde_json::to_vec(reading)?,
            created_at: Utc::now(),
        })
    }

    /// Payload decoded back to JSON
    pub fn json(&self) -> Result<Value, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

/// Scheduler state between and during cycles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Polling,
}

/// Outcome of one telemetry cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub sent: usize,
    pub failed: usize,
    /// Period was zero; nothing polled
    pub disabled: bool,
    /// Sleep before the next cycle
    pub next_delay: Duration,
}

pub struct TelemetryScheduler {
    retry_period: Duration,
    state: SchedulerState,
}

impl TelemetryScheduler {
    pub fn new(retry_period: Duration) -> Self {
        Self {
            retry_period,
            state: SchedulerState::Idle,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn retry_period(&self) -> Duration {
        self.retry_period
    }

    /// Run one Polling pass and return to Idle
    pub async fn run_cycle(&mut self, root: &dyn RootComponent, transport: &dyn Transport) -> CycleReport {
        self.state = SchedulerState::Polling;

        let period = root.telemetry_period();
        if period.is_zero() {
            warn!(
                "Telemetry: Telemetry period not configured. Nothing sent. Will try again in {}",
                humantime::format_duration(self.retry_period)
            );
            self.state = SchedulerState::Idle;
            return CycleReport {
                sent: 0,
                failed: 0,
                disabled: true,
                next_delay: self.retry_period,
            };
        }

        let mut sent = 0;
        let mut failures: Vec<(String, ComponentError)> = Vec::new();

        if let Err(e) = Self::poll_all(root, transport, &mut sent, &mut failures).await {
            error!("Telemetry: Error sending telemetry, abandoning cycle: {}", e);
        }

        match failures.len() {
            0 => {}
            1 => {
                let (name, err) = &failures[0];
                error!(component = %name, "Telemetry: Error {}", err);
            }
            _ => {
                for (name, err) in &failures {
                    error!(component = %name, "Telemetry: Multiple Errors {}", err);
                }
            }
        }

        if sent > 0 {
            info!("Telemetry: OK {} messages", sent);
        } else if failures.is_empty() {
            warn!("Telemetry: No components had available readings. Nothing sent");
        } else {
            warn!("Telemetry: All {} reporting components failed. Nothing sent", failures.len());
        }

        self.state = SchedulerState::Idle;
        CycleReport {
            sent,
            failed: failures.len(),
            disabled: false,
            next_delay: period,
        }
    }

    async fn poll_all(
        root: &dyn RootComponent,
        transport: &dyn Transport,
        sent: &mut usize,
        failures: &mut Vec<(String, ComponentError)>,
    ) -> Result<(), TransportError> {
        if let Some(reading) = Self::poll_one("root", root, failures) {
            Self::dispatch(transport, &reading, None).await?;
            *sent += 1;
        }

        for (name, component) in root.components() {
            if let Some(reading) = Self::poll_one(name, component.as_ref(), failures) {
                Self::dispatch(transport, &reading, Some(name.as_str())).await?;
                *sent += 1;
            }
        }

        Ok(())
    }

    fn poll_one<C: Component + ?Sized>(
        name: &str,
        component: &C,
        failures: &mut Vec<(String, ComponentError)>,
    ) -> Option<TelemetryReading> {
        if !component.has_telemetry() {
            return None;
        }
        match component.telemetry() {
            Ok(reading) => reading,
            Err(e) => {
                failures.push((name.to_string(), e));
                None
            }
        }
    }

    async fn dispatch(
        transport: &dyn Transport,
        reading: &TelemetryReading,
        component: Option<&str>,
    ) -> Result<(), TransportError> {
        let message = TelemetryMessage::frame(reading, component)?;
        transport.send_telemetry(message).await?;

        let details = reading
            .iter()
            .map(|(k, v)| match v.as_f64() {
                Some(n) => format!("{}={:.1}", k, n),
                None => format!("{}={}", k, v),
            })
            .collect::<Vec<_>>()
            .join(" ");
        debug!("Telemetry: {} {}", component.unwrap_or("Root"), details);
        Ok(())
    }
}

impl Default for TelemetryScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_PERIOD)
    }
}
