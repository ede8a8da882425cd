//! Static device information
//!
//! Manufacturer, model and software version come from initial state; the rest
//! is discovered from the host once at construction.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use sysinfo::{Disks, System};
use tracing::debug;

use crate::component::{snapshot, Component};
use crate::error::ComponentError;

pub const DEVICE_INFORMATION_MODEL: &str = "dtmi:azure:DeviceManagement:DeviceInformation;1";

/// Host facts gathered once at startup
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostFacts {
    pub host_name: Option<String>,
    pub os_name: Option<String>,
    pub processor_architecture: String,
    pub processor_manufacturer: Option<String>,
    /// KiB
    pub total_storage: Option<u64>,
    /// KiB
    pub total_memory: Option<u64>,
}

impl HostFacts {
    pub fn discover() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.refresh_cpu();

        let host_name = gethostname::gethostname().into_string().ok();
        let os_name = match (System::name(), System::os_version()) {
            (Some(name), Some(version)) => Some(format!("{} {}", name, version)),
            (name, _) => name,
        };
        let processor_manufacturer = sys
            .cpus()
            .first()
            .map(|cpu| cpu.vendor_id().to_string())
            .filter(|vendor| !vendor.is_empty());

        let disks = Disks::new_with_refreshed_list();
        let storage: u64 = disks.list().iter().map(|disk| disk.total_space()).sum();

        let facts = Self {
            host_name,
            os_name,
            processor_architecture: std::env::consts::ARCH.to_string(),
            processor_manufacturer,
            total_storage: (storage > 0).then_some(storage / 1024),
            total_memory: Some(sys.total_memory() / 1024).filter(|m| *m > 0),
        };
        debug!("Device information: {:?}", facts);
        facts
    }
}

#[derive(Debug, Clone, Default)]
struct Configured {
    manufacturer: Option<String>,
    model: Option<String>,
    sw_version: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DeviceInformationProperties<'a> {
    manufacturer: Option<&'a str>,
    model: Option<&'a str>,
    sw_version: Option<&'a str>,
    #[serde(flatten)]
    host: &'a HostFacts,
}

/// Read-only component describing the device
pub struct DeviceInformation {
    configured: Mutex<Configured>,
    host: HostFacts,
}

impl DeviceInformation {
    pub fn new(host: HostFacts) -> Self {
        Self {
            configured: Mutex::new(Configured::default()),
            host,
        }
    }

    pub fn discover() -> Self {
        Self::new(HostFacts::discover())
    }
}

impl Component for DeviceInformation {
    fn identity(&self) -> &str {
        DEVICE_INFORMATION_MODEL
    }

    fn properties(&self) -> Value {
        let configured = self.configured.lock();
        snapshot(&DeviceInformationProperties {
            manufacturer: configured.manufacturer.as_deref(),
            model: configured.model.as_deref(),
            sw_version: configured.sw_version.as_deref(),
            host: &self.host,
        })
    }

    fn set_property(&self, name: &str, _raw: &Value) -> Result<Value, ComponentError> {
        Err(ComponentError::UnknownProperty {
            component: DEVICE_INFORMATION_MODEL.to_string(),
            name: name.to_string(),
        })
    }

    fn set_initial_state(&self, values: &HashMap<String, String>) {
        let mut configured = self.configured.lock();
        if let Some(v) = values.get("Manufacturer") {
            configured.manufacturer = Some(v.clone());
        }
        if let Some(v) = values.get("Model") {
            configured.model = Some(v.clone());
        }
        if let Some(v) = values.get("SwVersion") {
            configured.sw_version = Some(v.clone());
        }
    }
}
