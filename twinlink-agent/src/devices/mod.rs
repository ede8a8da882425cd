//! Demo device model: a temperature controller with device information and
//! one thermostat

pub mod controller;
pub mod device_info;
pub mod thermostat;

pub use controller::Controller;
pub use device_info::{DeviceInformation, HostFacts};
pub use thermostat::{MaxMinReport, Thermostat};
