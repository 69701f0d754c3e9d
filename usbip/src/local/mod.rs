//! Concrete, Linux-specific implementations of the collaborator contracts
//! (§3 of the expanded specification): a udev-backed [`DeviceDirectory`],
//! a [`ClaimRegistry`] built on the existing `usbip-host` sysfs driver
//! bindings, and (behind the `usbfs-transport` feature) a [`UsbTransport`]
//! adapter over `/dev/bus/usb` via the `usbfs` crate.
//!
//! None of this module is required to exercise the protocol core itself;
//! tests drive [`crate::dispatch`], [`crate::submit`], and [`crate::unlink`]
//! against in-memory fakes instead.

pub mod claim;
pub mod directory;

#[cfg(feature = "usbfs-transport")]
pub mod usbfs_transport;
