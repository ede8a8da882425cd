//! Property synchronization between the device model and the twin
//!
//! Two independent flows:
//! - outbound: full reported snapshots, throttled by an exponential backoff
//!   owned by the main loop ([`PropertySynchronizer`])
//! - inbound: desired patches applied property by property, each successful
//!   set acknowledged with the patch version ([`PatchReconciler`])
//!
//! A failed property never aborts the rest of its patch.

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::component::{Component, RootComponent};
use crate::error::{ComponentError, SyncError, TransportError};
use crate::transport::Transport;

/// Reserved key tagging a nested map as a component; never a property
pub const METADATA_KEY: &str = "__t";
pub const COMPONENT_MARKER: &str = "c";
/// Version key of a desired twin document
pub const VERSION_KEY: &str = "$version";

pub const DEFAULT_BACKOFF_INITIAL: Duration = Duration::from_secs(60);
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(24 * 60 * 60);

pub const ACK_STATUS_OK: u16 = 200;

/// Time source for backoff decisions
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Window {
    Open,
    Until(Instant),
    /// Period runs past what `Instant` can represent
    Closed,
}

/// Full-sync throttle: (next allowed time, current period)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    window: Window,
    period: Duration,
    cap: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, cap: Duration) -> Self {
        Self {
            window: Window::Open,
            period: initial.min(cap),
            cap,
        }
    }

    pub fn is_due(&self, now: Instant) -> bool {
        match self.window {
            Window::Open => true,
            Window::Until(next) => now >= next,
            Window::Closed => false,
        }
    }

    /// Schedule the next sync after a successful one, doubling up to the cap
    pub fn record_success(&mut self, now: Instant) {
        self.window = match now.checked_add(self.period) {
            Some(next) => Window::Until(next),
            None => {
                warn!(
                    "Property: Backoff of {} is out of range, no further full reports",
                    humantime::format_duration(self.period)
                );
                Window::Closed
            }
        };
        self.period = self.period.saturating_mul(2).min(self.cap);
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// `None` before the first sync, or when the next one is out of range
    pub fn next_allowed(&self) -> Option<Instant> {
        match self.window {
            Window::Until(next) => Some(next),
            Window::Open | Window::Closed => None,
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_BACKOFF_INITIAL, DEFAULT_BACKOFF_CAP)
    }
}

/// Desired properties delivered by the twin, with the version of the whole patch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredPatch {
    pub version: i64,
    pub properties: Map<String, Value>,
}

impl DesiredPatch {
    pub fn new(version: i64, properties: Map<String, Value>) -> Self {
        Self { version, properties }
    }

    /// Split a twin document into its `$version` and the property keys.
    /// Other `$`-prefixed keys are service metadata and are dropped.
    pub fn from_document(document: Value) -> Result<Self, TransportError> {
        let Value::Object(mut map) = document else {
            return Err(TransportError::Malformed {
                topic: "desired".into(),
                reason: "desired document is not an object".into(),
            });
        };

        let version = map
            .remove(VERSION_KEY)
            .and_then(|v| v.as_i64())
            .ok_or_else(|| TransportError::Malformed {
                topic: "desired".into(),
                reason: format!("missing or invalid {}", VERSION_KEY),
            })?;
        map.retain(|key, _| !key.starts_with('$'));

        Ok(Self::new(version, map))
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }
}

/// Acknowledgement of one applied desired property
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyAck {
    pub component: Option<String>,
    pub property: String,
    pub value: Value,
    pub version: i64,
    pub status: u16,
    pub description: String,
}

impl PropertyAck {
    pub fn ok(component: Option<&str>, property: &str, value: Value, version: i64) -> Self {
        Self {
            component: component.map(str::to_string),
            property: property.to_string(),
            value,
            version,
            status: ACK_STATUS_OK,
            description: "OK".to_string(),
        }
    }

    /// `component.property`, or just `property` on the root
    pub fn scoped_key(&self) -> String {
        match &self.component {
            Some(component) => format!("{}.{}", component, self.property),
            None => self.property.clone(),
        }
    }

    /// Reported patch carrying this ack; component acks are wrapped in a
    /// marked component envelope
    pub fn to_patch(&self) -> Value {
        let mut patch = Map::new();
        patch.insert(
            self.property.clone(),
            json!({
                "value": self.value,
                "ac": self.status,
                "av": self.version,
                "ad": self.description,
            }),
        );

        match &self.component {
            Some(component) => {
                patch.insert(METADATA_KEY.to_string(), Value::from(COMPONENT_MARKER));
                let mut envelope = Map::new();
                envelope.insert(component.clone(), Value::Object(patch));
                Value::Object(envelope)
            }
            None => Value::Object(patch),
        }
    }
}

/// Merge root properties with each component's properties keyed by name
pub fn full_snapshot(root: &dyn RootComponent) -> Result<Map<String, Value>, SyncError> {
    let mut errors = Vec::new();

    let mut update = match object_or_empty("root", root.properties()) {
        Ok(map) => map,
        Err(e) => {
            errors.push(e);
            Map::new()
        }
    };

    for (name, component) in root.components() {
        match object_or_empty(name, component.properties()) {
            Ok(mut props) => {
                props.insert(METADATA_KEY.to_string(), Value::from(COMPONENT_MARKER));
                update.insert(name.clone(), Value::Object(props));
            }
            Err(e) => errors.push(e),
        }
    }

    match errors.len() {
        0 => Ok(update),
        1 => Err(errors.remove(0)),
        _ => Err(SyncError::Aggregate(errors)),
    }
}

fn object_or_empty(name: &str, value: Value) -> Result<Map<String, Value>, SyncError> {
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        other => Err(SyncError::Other(anyhow!(
            "properties of {} are not an object: {}",
            name,
            other
        ))),
    }
}

/// Outcome of one full-sync tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Backoff window still open
    Skipped,
    Reported(usize),
    Failed,
}

/// Outbound full-sync flow; owns the backoff state
pub struct PropertySynchronizer {
    backoff: Backoff,
    clock: Arc<dyn Clock>,
}

impl PropertySynchronizer {
    pub fn new(backoff: Backoff, clock: Arc<dyn Clock>) -> Self {
        Self { backoff, clock }
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Push a full snapshot if the backoff window allows it
    pub async fn tick(&mut self, root: &dyn RootComponent, transport: &dyn Transport) -> SyncOutcome {
        let now = self.clock.now();
        if !self.backoff.is_due(now) {
            return SyncOutcome::Skipped;
        }

        match self.push_full(root, transport).await {
            Ok(count) => {
                self.backoff.record_success(now);
                info!("Property: OK Reported {} properties", count);
                debug!(
                    "Property: Next full report after {}",
                    humantime::format_duration(self.backoff.period())
                );
                SyncOutcome::Reported(count)
            }
            Err(e) => {
                log_sync_error(&e);
                SyncOutcome::Failed
            }
        }
    }

    async fn push_full(&self, root: &dyn RootComponent, transport: &dyn Transport) -> Result<usize, SyncError> {
        let update = full_snapshot(root)?;
        let count = update.len();
        let snapshot = Value::Object(update);
        debug!("Property: Reporting {}", snapshot);
        transport.push_reported(snapshot).await?;
        Ok(count)
    }
}

impl Default for PropertySynchronizer {
    fn default() -> Self {
        Self::new(Backoff::default(), Arc::new(SystemClock))
    }
}

fn log_sync_error(err: &SyncError) {
    match err {
        SyncError::Soft(message) => error!("Property: Application Error. {}", message),
        SyncError::Aggregate(causes) => {
            for cause in causes {
                error!("Property: Multiple reporting errors: {}", cause);
            }
        }
        SyncError::Other(e) => error!("Property: Reporting error: {:#}", e),
    }
}

/// Outcome of reconciling one desired patch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub applied: usize,
    pub acked: usize,
    pub failed: usize,
}

/// Inbound desired-patch flow; holds no state, safe to run from any task
pub struct PatchReconciler;

impl PatchReconciler {
    pub async fn reconcile(
        root: &dyn RootComponent,
        transport: &dyn Transport,
        patch: &DesiredPatch,
    ) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        debug!("Property: Desired v{} {:?}", patch.version, patch.properties);

        for (key, value) in &patch.properties {
            match root.components().get(key) {
                Some(component) => match value.as_object() {
                    Some(children) => {
                        for (child, raw) in children {
                            if child == METADATA_KEY {
                                continue;
                            }
                            Self::apply(component.as_ref(), Some(key.as_str()), child, raw, patch.version, transport, &mut report)
                                .await;
                        }
                    }
                    None => {
                        report.failed += 1;
                        error!(property = %key, "Property: Update failed for {}: component patch is not an object", key);
                    }
                },
                None => Self::apply(root, None, key, value, patch.version, transport, &mut report).await,
            }
        }

        if report.failed > 0 {
            warn!(
                "Property: Patch v{} applied {} of {} properties",
                patch.version,
                report.applied,
                report.applied + report.failed
            );
        }
        report
    }

    async fn apply<C: Component + ?Sized>(
        target: &C,
        component: Option<&str>,
        property: &str,
        raw: &Value,
        version: i64,
        transport: &dyn Transport,
        report: &mut ReconcileReport,
    ) {
        let full_name = match component {
            Some(component) => format!("{}.{}", component, property),
            None => property.to_string(),
        };

        let updated = match target.set_property(property, raw) {
            Ok(updated) => updated,
            Err(e) => {
                report.failed += 1;
                log_update_failure(&full_name, &e);
                return;
            }
        };
        report.applied += 1;
        info!(property = %full_name, "Property: OK. Updated {} to {}", full_name, updated);

        let ack = PropertyAck::ok(component, property, updated, version);
        match transport.send_property_ack(&ack).await {
            Ok(()) => {
                report.acked += 1;
                debug!("Property: Responded to server with {}", ack.to_patch());
            }
            Err(e) => error!(property = %full_name, "Property: Acknowledgement failed for {}: {}", full_name, e),
        }
    }
}

fn log_update_failure(full_name: &str, err: &ComponentError) {
    match err {
        ComponentError::UnknownProperty { .. } | ComponentError::InvalidValue { .. } => {
            warn!(property = %full_name, "Property: Update failed for {}: {}", full_name, err)
        }
        _ => error!(property = %full_name, "Property: Update failed for {}: {}", full_name, err),
    }
}
