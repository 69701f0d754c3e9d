//! Implements higher level client routines which compose usbip network requests
//! and vhci_hcd driver commands

mod attach;
mod detach;
mod list;
mod port;

pub use attach::attach_device;
pub use detach::detach_device;
pub use list::{ExportedDevice, list_exported_devices};
pub use port::{ImportedDevice, list_imported_devices};

