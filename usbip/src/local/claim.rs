//! A [`ClaimRegistry`] built on the existing usbip-host sysfs driver bindings
//! (§3): claiming a device binds it to the kernel's `usbip-host` stub driver,
//! the same operation [`crate::server::bind_device`] performs for the CLI, so
//! no other process on the host can also open it. Releasing unbinds it,
//! letting the driver core match it back to its original driver.

use std::{
    collections::HashSet,
    ffi::OsStr,
    sync::{Arc, Mutex},
};

use crate::{
    directory::{ClaimError, ClaimHandle, ClaimRegistry, Device},
    drivers::{
        DriverBindingError, bind_usb_driver,
        host::{MatchListOperation, UsbipHost},
        unbind_usb_driver,
    },
    transport::{TransferOutcome, TransferRequest, TransportError, UsbTransport},
};

#[cfg(feature = "usbfs-transport")]
use crate::local::usbfs_transport::UsbfsTransport;

const USBIP_HOST_DRIVER: &str = "usbip-host";

/// Stands in for the real transport when built without `usbfs-transport`:
/// the device is still claimed (bound to `usbip-host`) but no transfer can
/// actually be issued.
struct UnavailableTransport;

impl UsbTransport for UnavailableTransport {
    fn transfer(&self, _request: TransferRequest) -> Result<TransferOutcome, TransportError> {
        Err(TransportError::Unsupported(
            "built without the usbfs-transport feature",
        ))
    }
}

pub struct HostDriverClaimHandle {
    device: Device,
    transport: Arc<dyn UsbTransport>,
}

impl ClaimHandle for HostDriverClaimHandle {
    fn device(&self) -> &Device {
        &self.device
    }

    fn transport(&self) -> Arc<dyn UsbTransport> {
        self.transport.clone()
    }
}

/// Tracks which `devid`s are currently claimed so a second concurrent import
/// is rejected in-process before it ever reaches sysfs, per §5.
#[derive(Default)]
pub struct HostDriverClaimRegistry {
    claimed: Arc<Mutex<HashSet<u32>>>,
}

impl HostDriverClaimRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ClaimRegistry for HostDriverClaimRegistry {
    fn claim(&self, device: Device) -> Result<Box<dyn ClaimHandle>, ClaimError> {
        let devid = device.devid();

        {
            let mut claimed = self.claimed.lock().unwrap();
            if !claimed.insert(devid) {
                return Err(ClaimError::AlreadyClaimed(device.bus_id));
            }
        }

        if let Err(err) = bind_to_usbip_host(&device.bus_id) {
            self.claimed.lock().unwrap().remove(&devid);
            return Err(err);
        }

        #[cfg(feature = "usbfs-transport")]
        let transport: Arc<dyn UsbTransport> = match UsbfsTransport::open(&device) {
            Ok(t) => Arc::new(t),
            Err(e) => {
                let _ = unbind_from_usbip_host(&device.bus_id);
                self.claimed.lock().unwrap().remove(&devid);
                return Err(ClaimError::Other(device.bus_id, e.to_string()));
            }
        };
        #[cfg(not(feature = "usbfs-transport"))]
        let transport: Arc<dyn UsbTransport> = Arc::new(UnavailableTransport);

        Ok(Box::new(HostDriverClaimHandle { device, transport }))
    }

    fn release(&self, handle: Box<dyn ClaimHandle>) {
        let bus_id = handle.device().bus_id.clone();
        let devid = handle.device().devid();

        if let Err(e) = unbind_from_usbip_host(&bus_id) {
            tracing::warn!(bus_id = %bus_id, error = %e, "failed to unbind device from usbip-host on release");
        }

        self.claimed.lock().unwrap().remove(&devid);
    }

    fn is_claimed(&self, device_id: u32) -> bool {
        self.claimed.lock().unwrap().contains(&device_id)
    }
}

fn bind_to_usbip_host(bus_id: &str) -> Result<(), ClaimError> {
    UsbipHost::update_bus_id_match_list(bus_id, MatchListOperation::Add)
        .map_err(|e| ClaimError::Other(bus_id.to_string(), e.to_string()))?;

    if let Err(e) = bind_usb_driver(OsStr::new(USBIP_HOST_DRIVER), bus_id) {
        // best effort; if the match list add above failed we wouldn't be here
        let _ = UsbipHost::update_bus_id_match_list(bus_id, MatchListOperation::Remove);

        return Err(match e {
            DriverBindingError::NoDevice => ClaimError::Gone(bus_id.to_string()),
            DriverBindingError::AlreadyBound => ClaimError::AlreadyClaimed(bus_id.to_string()),
            other => ClaimError::Other(bus_id.to_string(), other.to_string()),
        });
    }

    Ok(())
}

fn unbind_from_usbip_host(bus_id: &str) -> Result<(), ClaimError> {
    unbind_usb_driver(OsStr::new(USBIP_HOST_DRIVER), bus_id)
        .map_err(|e| ClaimError::Other(bus_id.to_string(), e.to_string()))
}
