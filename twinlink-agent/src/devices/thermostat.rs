//! Simulated thermostat
//!
//! The measured temperature drifts towards `targetTemperature` by at most one
//! degree per reading; every reading is kept for `getMaxMinReport`.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use tracing::debug;

use crate::component::{parse_f64, snapshot, Component, HandlerTable, TelemetryReading};
use crate::error::ComponentError;

pub const THERMOSTAT_MODEL: &str = "dtmi:com:example:Thermostat;1";

const MAX_STEP: f64 = 1.0;
const HISTORY_LIMIT: usize = 1024;
const DEFAULT_TEMPERATURE: f64 = 20.0;

/// Summary over the readings taken since a point in time
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MaxMinReport {
    pub max_temp: f64,
    pub min_temp: f64,
    pub avg_temp: f64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl MaxMinReport {
    fn from_readings(readings: &[(DateTime<Utc>, f64)]) -> Option<Self> {
        let (first, last) = (readings.first()?, readings.last()?);
        let mut max_temp = f64::MIN;
        let mut min_temp = f64::MAX;
        let mut total = 0.0;
        for (_, t) in readings {
            max_temp = max_temp.max(*t);
            min_temp = min_temp.min(*t);
            total += t;
        }
        Some(Self {
            max_temp,
            min_temp,
            avg_temp: total / readings.len() as f64,
            start_time: first.0,
            end_time: last.0,
        })
    }
}

#[derive(Debug)]
struct ThermostatState {
    temperature: f64,
    target_temperature: Option<f64>,
    max_temp_since_last_reboot: Option<f64>,
    history: VecDeque<(DateTime<Utc>, f64)>,
}

impl ThermostatState {
    fn record(&mut self, at: DateTime<Utc>, temperature: f64) {
        self.temperature = temperature;
        self.max_temp_since_last_reboot = Some(match self.max_temp_since_last_reboot {
            Some(max) => max.max(temperature),
            None => temperature,
        });
        if self.history.len() >= HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back((at, temperature));
    }

    fn next_temperature(&self) -> f64 {
        match self.target_temperature {
            Some(target) => {
                let delta = (target - self.temperature).clamp(-MAX_STEP, MAX_STEP);
                self.temperature + delta
            }
            None => self.temperature,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ThermostatProperties {
    target_temperature: Option<f64>,
    max_temp_since_last_reboot: Option<f64>,
}

fn set_target_temperature(state: &mut ThermostatState, raw: &Value) -> Result<Value, ComponentError> {
    let target = parse_f64("targetTemperature", raw)?;
    state.target_temperature = Some(target);
    Ok(json!(target))
}

fn get_max_min_report(state: &mut ThermostatState, params: &Value) -> Result<Value, ComponentError> {
    let since = parse_since(params)?;
    let readings: Vec<_> = state
        .history
        .iter()
        .filter(|(at, _)| since.map_or(true, |since| *at >= since))
        .copied()
        .collect();

    let report = MaxMinReport::from_readings(&readings).ok_or_else(|| ComponentError::Unavailable {
        component: THERMOSTAT_MODEL.to_string(),
        reason: "no temperature readings in range".to_string(),
    })?;
    Ok(serde_json::to_value(report)?)
}

/// `null`, an RFC 3339 string, or `{"since": "<rfc3339>"}`
fn parse_since(params: &Value) -> Result<Option<DateTime<Utc>>, ComponentError> {
    let raw = match params {
        Value::Null => return Ok(None),
        Value::Object(map) => match map.get("since") {
            None | Some(Value::Null) => return Ok(None),
            Some(value) => value,
        },
        other => other,
    };

    let text = raw.as_str().ok_or_else(|| ComponentError::InvalidValue {
        name: "since".to_string(),
        reason: format!("expected a timestamp, got {}", raw),
    })?;
    DateTime::parse_from_rfc3339(text)
        .map(|t| Some(t.with_timezone(&Utc)))
        .map_err(|e| ComponentError::InvalidValue {
            name: "since".to_string(),
            reason: e.to_string(),
        })
}

pub struct Thermostat {
    state: Mutex<ThermostatState>,
    properties: HandlerTable<ThermostatState>,
    commands: HandlerTable<ThermostatState>,
}

impl Thermostat {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ThermostatState {
                temperature: DEFAULT_TEMPERATURE,
                target_temperature: None,
                max_temp_since_last_reboot: None,
                history: VecDeque::new(),
            }),
            properties: HandlerTable::properties().with("targetTemperature", set_target_temperature),
            commands: HandlerTable::commands().with("getMaxMinReport", get_max_min_report),
        }
    }

    /// Forget the running maximum and history, as after a device reboot
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.max_temp_since_last_reboot = None;
        state.history.clear();
    }

    pub fn temperature(&self) -> f64 {
        self.state.lock().temperature
    }
}

impl Default for Thermostat {
    fn default() -> Self {
        Self::new()
    }
}

impl Component for Thermostat {
    fn identity(&self) -> &str {
        THERMOSTAT_MODEL
    }

    fn has_telemetry(&self) -> bool {
        true
    }

    fn telemetry(&self) -> Result<Option<TelemetryReading>, ComponentError> {
        let mut state = self.state.lock();
        let temperature = state.next_temperature();
        state.record(Utc::now(), temperature);
        Ok(Some(TelemetryReading::new().with("temperature", temperature)))
    }

    fn properties(&self) -> Value {
        let state = self.state.lock();
        snapshot(&ThermostatProperties {
            target_temperature: state.target_temperature,
            max_temp_since_last_reboot: state.max_temp_since_last_reboot,
        })
    }

    fn set_property(&self, name: &str, raw: &Value) -> Result<Value, ComponentError> {
        self.properties.invoke(THERMOSTAT_MODEL, &mut self.state.lock(), name, raw)
    }

    fn do_command(&self, name: &str, params: &Value) -> Result<Value, ComponentError> {
        self.commands.invoke(THERMOSTAT_MODEL, &mut self.state.lock(), name, params)
    }

    fn set_initial_state(&self, values: &HashMap<String, String>) {
        let mut state = self.state.lock();
        if let Some(t) = values.get("Temperature").and_then(|v| v.parse::<f64>().ok()) {
            state.temperature = t;
        }
        if let Some(t) = values.get("TargetTemperature").and_then(|v| v.parse::<f64>().ok()) {
            state.target_temperature = Some(t);
        }
        debug!("Thermostat: initial temperature {}", state.temperature);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_drifts_towards_target() {
        let thermostat = Thermostat::new();
        thermostat.set_property("targetTemperature", &json!("22.5")).unwrap();

        let temps: Vec<f64> = (0..4)
            .map(|_| thermostat.telemetry().unwrap().unwrap().iter().next().unwrap().1.as_f64().unwrap())
            .collect();
        assert_eq!(temps, vec![21.0, 22.0, 22.5, 22.5]);
        assert_eq!(thermostat.properties()["maxTempSinceLastReboot"], json!(22.5));
    }

    #[test]
    fn test_properties_before_any_reading() {
        let thermostat = Thermostat::new();
        assert_eq!(
            thermostat.properties(),
            json!({"targetTemperature": null, "maxTempSinceLastReboot": null})
        );
        assert!(matches!(
            thermostat.set_property("maxTempSinceLastReboot", &json!(1)),
            Err(ComponentError::UnknownProperty { .. })
        ));
        assert!(matches!(
            thermostat.set_property("targetTemperature", &json!("warm")),
            Err(ComponentError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_max_min_report() {
        let thermostat = Thermostat::new();
        thermostat.set_initial_state(&HashMap::from([
            ("Temperature".to_string(), "18".to_string()),
            ("TargetTemperature".to_string(), "20".to_string()),
        ]));
        for _ in 0..3 {
            thermostat.telemetry().unwrap();
        }

        let report = thermostat.do_command("getMaxMinReport", &Value::Null).unwrap();
        assert_eq!(report["maxTemp"], json!(20.0));
        assert_eq!(report["minTemp"], json!(19.0));
        assert!(report["startTime"].is_string());

        let future = (Utc::now() + Duration::hours(1)).to_rfc3339();
        let err = thermostat.do_command("getMaxMinReport", &json!({ "since": future })).unwrap_err();
        assert!(matches!(err, ComponentError::Unavailable { .. }));

        assert!(thermostat.do_command("getMaxMinReport", &json!("yesterday")).is_err());
    }

    #[test]
    fn test_history_keeps_latest_readings() {
        let thermostat = Thermostat::new();
        let start = Utc::now();
        {
            let mut state = thermostat.state.lock();
            for i in 0..HISTORY_LIMIT + 5 {
                state.record(start + Duration::seconds(i as i64), i as f64);
            }
            assert_eq!(state.history.len(), HISTORY_LIMIT);
            assert_eq!(state.history.front().map(|(_, t)| *t), Some(5.0));
        }

        let report = thermostat.do_command("getMaxMinReport", &Value::Null).unwrap();
        assert_eq!(report["minTemp"], json!(5.0));
        assert_eq!(report["maxTemp"], json!((HISTORY_LIMIT + 4) as f64));
    }

    #[test]
    fn test_reset_clears_maximum() {
        let thermostat = Thermostat::new();
        thermostat.telemetry().unwrap();
        thermostat.reset();
        assert_eq!(thermostat.properties()["maxTempSinceLastReboot"], Value::Null);
        assert!(thermostat.do_command("getMaxMinReport", &Value::Null).is_err());
    }
}
