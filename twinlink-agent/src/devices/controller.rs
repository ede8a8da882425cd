//! Temperature controller root

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::System;
use tracing::{info, warn};

use crate::component::{
    parse_i64, parse_string, snapshot, Component, ComponentMap, HandlerTable, RootComponent, TelemetryReading,
};
use crate::error::ComponentError;

use super::device_info::DeviceInformation;
use super::thermostat::Thermostat;

pub const CONTROLLER_MODEL: &str = "dtmi:com:example:TemperatureController;2";
pub const DEVICE_INFORMATION: &str = "deviceInformation";
pub const THERMOSTAT: &str = "thermostat1";

#[derive(Debug, Default)]
struct ControllerState {
    serial_number: Option<String>,
    telemetry_period: Duration,
    version: Option<String>,
    reboots: u32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ControllerProperties<'a> {
    serial_number: Option<&'a str>,
    telemetry_period: String,
    version: Option<&'a str>,
}

fn set_serial_number(state: &mut ControllerState, raw: &Value) -> Result<Value, ComponentError> {
    let serial = parse_string("serialNumber", raw)?;
    state.serial_number = Some(serial.clone());
    Ok(Value::String(serial))
}

fn set_telemetry_period(state: &mut ControllerState, raw: &Value) -> Result<Value, ComponentError> {
    let text = parse_string("telemetryPeriod", raw)?;
    let period = parse_period(&text).map_err(|reason| ComponentError::InvalidValue {
        name: "telemetryPeriod".to_string(),
        reason,
    })?;
    state.telemetry_period = period;
    Ok(Value::String(humantime::format_duration(period).to_string()))
}

fn reboot(state: &mut ControllerState, params: &Value) -> Result<Value, ComponentError> {
    let delay = match params {
        Value::Null => 0,
        Value::Object(map) => map.get("delay").map(|d| parse_i64("delay", d)).transpose()?.unwrap_or(0),
        other => parse_i64("delay", other)?,
    };
    if delay < 0 {
        return Err(ComponentError::InvalidValue {
            name: "delay".to_string(),
            reason: "must not be negative".to_string(),
        });
    }
    state.reboots += 1;
    Ok(json!({ "rebooting": true, "delay": delay }))
}

/// Humantime (`"30s"`, `"1m 30s"`) or bare seconds
fn parse_period(text: &str) -> Result<Duration, String> {
    let text = text.trim();
    if let Ok(secs) = text.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(text).map_err(|e| format!("{}: {}", text, e))
}

/// Root of the demo device: one device information unit and one thermostat
pub struct Controller {
    state: Mutex<ControllerState>,
    process: Mutex<System>,
    properties: HandlerTable<ControllerState>,
    commands: HandlerTable<ControllerState>,
    thermostat: Arc<Thermostat>,
    components: ComponentMap,
}

impl Controller {
    pub fn new(device_information: DeviceInformation) -> Self {
        let thermostat = Arc::new(Thermostat::new());

        let mut components = ComponentMap::new();
        components.insert(DEVICE_INFORMATION.to_string(), Arc::new(device_information));
        components.insert(THERMOSTAT.to_string(), thermostat.clone());

        Self {
            state: Mutex::new(ControllerState::default()),
            process: Mutex::new(System::new()),
            properties: HandlerTable::properties()
                .with("serialNumber", set_serial_number)
                .with("telemetryPeriod", set_telemetry_period),
            commands: HandlerTable::commands().with("reboot", reboot),
            thermostat,
            components,
        }
    }

    /// Controller with host facts discovered from this machine
    pub fn discover() -> Self {
        Self::new(DeviceInformation::discover())
    }

    pub fn reboots(&self) -> u32 {
        self.state.lock().reboots
    }

    fn working_set(&self) -> Option<u64> {
        let pid = sysinfo::get_current_pid().ok()?;
        let mut sys = self.process.lock();
        sys.refresh_process(pid);
        sys.process(pid).map(|p| p.memory() / 1024)
    }
}

impl Component for Controller {
    fn identity(&self) -> &str {
        CONTROLLER_MODEL
    }

    fn has_telemetry(&self) -> bool {
        true
    }

    fn telemetry(&self) -> Result<Option<TelemetryReading>, ComponentError> {
        match self.working_set() {
            Some(kib) => Ok(Some(TelemetryReading::new().with("workingSet", kib))),
            None => Err(ComponentError::Unavailable {
                component: CONTROLLER_MODEL.to_string(),
                reason: "process memory not readable".to_string(),
            }),
        }
    }

    fn properties(&self) -> Value {
        let state = self.state.lock();
        snapshot(&ControllerProperties {
            serial_number: state.serial_number.as_deref(),
            telemetry_period: humantime::format_duration(state.telemetry_period).to_string(),
            version: state.version.as_deref(),
        })
    }

    fn set_property(&self, name: &str, raw: &Value) -> Result<Value, ComponentError> {
        self.properties.invoke(CONTROLLER_MODEL, &mut self.state.lock(), name, raw)
    }

    fn do_command(&self, name: &str, params: &Value) -> Result<Value, ComponentError> {
        let result = self.commands.invoke(CONTROLLER_MODEL, &mut self.state.lock(), name, params)?;
        if name == "reboot" {
            info!("Command: Reboot requested, resetting thermostat history");
            self.thermostat.reset();
        }
        Ok(result)
    }

    fn set_initial_state(&self, values: &HashMap<String, String>) {
        let mut state = self.state.lock();
        if let Some(serial) = values.get("SerialNumber") {
            state.serial_number = Some(serial.clone());
        }
        if let Some(period) = values.get("TelemetryPeriod") {
            match parse_period(period) {
                Ok(period) => state.telemetry_period = period,
                Err(e) => warn!("Initial State: Invalid TelemetryPeriod {}", e),
            }
        }
        if let Some(version) = values.get("Version") {
            state.version = Some(version.clone());
        }
    }
}

impl RootComponent for Controller {
    fn telemetry_period(&self) -> Duration {
        self.state.lock().telemetry_period
    }

    fn components(&self) -> &ComponentMap {
        &self.components
    }
}
