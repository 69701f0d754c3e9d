//! CLI-facing operations that only make sense to run on the host machine
//! exporting its own USB devices: listing what's attached, and binding /
//! unbinding devices to the `usbip-host` stub driver.

mod bind;
mod list_local;
mod unbind;

pub use bind::{Error as BindError, bind_device};
pub use list_local::{Error as ListLocalError, ExportableDevice, list_local_devices};
pub use unbind::{Error as UnbindError, unbind_device};
