//! The `DeviceDirectory` and `ClaimRegistry` collaborator contracts (§6).
//!
//! The protocol core is reimplementable against any implementation of these
//! traits; a concrete udev-backed pair lives in [`crate::local`].

use std::sync::Arc;

use crate::{UsbSpeed, transport::UsbTransport};

/// One exportable USB device as seen by the enumeration/import handlers.
///
/// Mirrors the fields the wire protocol actually needs plus a few optional
/// descriptive strings that are never put on the wire by this server but are
/// useful for logging and admin tooling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub bus_id: String,
    pub bus_num: u32,
    pub dev_num: u32,
    pub vendor_id: u16,
    pub product_id: u16,
    pub b_device_class: u8,
    pub b_device_sub_class: u8,
    pub b_device_protocol: u8,
    pub b_num_configurations: u8,
    pub b_configuration_value: u8,
    pub b_num_interfaces: u8,
    pub speed: UsbSpeed,
    pub sys_path: String,
    pub product: Option<String>,
    pub manufacturer: Option<String>,
    pub serial: Option<String>,
}

impl Device {
    /// The 32-bit `devid` carried in SUBMIT/UNLINK PDUs: `busnum << 16 |
    /// devnum`, the convention the Linux kernel's `usbip` driver uses.
    pub fn devid(&self) -> u32 {
        (self.bus_num << 16) | (self.dev_num & 0xFFFF)
    }

    /// Encodes this device as the wire-format block used in
    /// `OP_REP_DEVLIST`/`OP_REP_IMPORT`. Returns `None` if any string field
    /// doesn't fit its fixed-length wire buffer.
    pub fn to_wire(&self) -> Option<crate::proto::ExportedDevice> {
        crate::proto::ExportedDevice::new(
            &self.sys_path,
            &self.bus_id,
            self.bus_num,
            self.dev_num,
            self.speed as u32,
            self.vendor_id,
            self.product_id,
            self.b_device_class,
            self.b_device_sub_class,
            self.b_device_protocol,
            self.b_num_configurations,
            self.b_configuration_value,
            self.b_num_interfaces,
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("failed to enumerate attached devices: {0}")]
    Enumeration(String),
    #[error("failed to look up device `{0}`: {1}")]
    Lookup(String, String),
}

/// Enumerates and looks up locally attached USB devices.
pub trait DeviceDirectory: Send + Sync {
    fn list(&self) -> Result<Vec<Device>, DirectoryError>;
    fn lookup(&self, bus_id: &str) -> Result<Option<Device>, DirectoryError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ClaimError {
    #[error("device `{0}` is already claimed")]
    AlreadyClaimed(String),
    #[error("device `{0}` is no longer present")]
    Gone(String),
    #[error("failed to claim device `{0}`: {1}")]
    Other(String, String),
}

/// Exclusive ownership of a claimed device's USB transport, for the lifetime
/// of an `Imported` connection.
pub trait ClaimHandle: Send + Sync {
    fn device(&self) -> &Device;
    fn transport(&self) -> Arc<dyn UsbTransport>;
}

/// Process-wide table of device claims; must be concurrency-safe, as
/// multiple connections may race to claim different (or even the same)
/// device concurrently.
pub trait ClaimRegistry: Send + Sync {
    fn claim(&self, device: Device) -> Result<Box<dyn ClaimHandle>, ClaimError>;
    fn release(&self, handle: Box<dyn ClaimHandle>);
    fn is_claimed(&self, device_id: u32) -> bool;
}
