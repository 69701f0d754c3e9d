//! A udev-backed [`DeviceDirectory`] (§3 of the expanded specification):
//! enumerates and looks up locally attached USB devices, applying the same
//! filtering [`crate::server::list_local`] does for the CLI (skip hubs, skip
//! interface nodes).

use crate::{
    directory::{Device, DeviceDirectory, DirectoryError},
    hwdb::get_device_display_strings,
    util::extract_usb_info_from_udev_device,
};

#[derive(Debug, Default)]
pub struct UdevDeviceDirectory;

impl UdevDeviceDirectory {
    pub fn new() -> Self {
        Self
    }
}

fn to_device(
    dev: &udev::Device,
    #[cfg(feature = "runtime-hwdb")] hwdb: &udev::Hwdb,
) -> Result<Device, DirectoryError> {
    let bus_id = dev.sysname().to_string_lossy().to_string();

    let info = extract_usb_info_from_udev_device(dev)
        .map_err(|e| DirectoryError::Lookup(bus_id.clone(), e.to_string()))?;

    let (manufacturer, product) = get_device_display_strings(
        #[cfg(feature = "runtime-hwdb")]
        hwdb,
        info.id_vendor,
        info.id_product,
    );

    let serial = dev
        .attribute_value("serial")
        .and_then(|v| v.to_str())
        .map(str::to_string);

    Ok(Device {
        bus_id: info.bus_id.to_string(),
        bus_num: info.bus_num,
        dev_num: info.dev_num,
        vendor_id: info.id_vendor,
        product_id: info.id_product,
        b_device_class: info.b_device_class,
        b_device_sub_class: info.b_device_sub_class,
        b_device_protocol: info.b_device_protocol,
        b_num_configurations: info.b_num_configurations,
        b_configuration_value: info.b_configuration_value,
        b_num_interfaces: info.b_num_interfaces,
        speed: info.speed,
        sys_path: info.sys_path,
        product,
        manufacturer,
        serial,
    })
}

impl DeviceDirectory for UdevDeviceDirectory {
    fn list(&self) -> Result<Vec<Device>, DirectoryError> {
        #[cfg(feature = "runtime-hwdb")]
        let hwdb = udev::Hwdb::new().map_err(|e| DirectoryError::Enumeration(e.to_string()))?;

        let udev = udev::Udev::new().map_err(|e| DirectoryError::Enumeration(e.to_string()))?;

        let mut enumerator = udev::Enumerator::with_udev(udev)
            .map_err(|e| DirectoryError::Enumeration(e.to_string()))?;

        enumerator
            .match_subsystem("usb")
            .map_err(|e| DirectoryError::Enumeration(e.to_string()))?;
        enumerator
            .nomatch_attribute("bDeviceClass", "09")
            .map_err(|e| DirectoryError::Enumeration(e.to_string()))?;

        let mut devices = Vec::new();

        for dev in enumerator
            .scan_devices()
            .map_err(|e| DirectoryError::Enumeration(e.to_string()))?
        {
            // FIXME: the udev crate doesn't expose libudev's wildcard nomatch,
            // so interface nodes are filtered by checking for an attribute
            // only they carry. (https://github.com/Smithay/udev-rs/issues/58)
            if dev.attribute_value("bInterfaceNumber").is_some() {
                continue;
            }

            devices.push(to_device(
                &dev,
                #[cfg(feature = "runtime-hwdb")]
                &hwdb,
            )?);
        }

        Ok(devices)
    }

    fn lookup(&self, bus_id: &str) -> Result<Option<Device>, DirectoryError> {
        #[cfg(feature = "runtime-hwdb")]
        let hwdb =
            udev::Hwdb::new().map_err(|e| DirectoryError::Lookup(bus_id.into(), e.to_string()))?;

        let context =
            udev::Udev::new().map_err(|e| DirectoryError::Lookup(bus_id.into(), e.to_string()))?;

        let dev = match udev::Device::from_subsystem_sysname_with_context(
            context,
            "usb".into(),
            bus_id.into(),
        ) {
            Ok(dev) => dev,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(DirectoryError::Lookup(bus_id.into(), e.to_string())),
        };

        if dev.attribute_value("bInterfaceNumber").is_some() {
            return Ok(None);
        }

        to_device(
            &dev,
            #[cfg(feature = "runtime-hwdb")]
            &hwdb,
        )
        .map(Some)
    }
}
