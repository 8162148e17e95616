//! udev-backed lister for USB mass-storage disks.

use crate::props::{is_usb_disk, serial_from_properties};
use log::{debug, warn};
use std::collections::BTreeSet;
use std::ffi::OsStr;
use udev::{Device, Enumerator};
use usbgate_core::{DeviceId, DeviceLister, GateError, GateResult};

/// Enumerates `block` disks on the USB bus through libudev.
#[derive(Debug, Clone, Copy, Default)]
pub struct UdevLister;

impl UdevLister {
    pub fn new() -> Self {
        Self
    }

    fn scan(&self) -> GateResult<BTreeSet<DeviceId>> {
        let mut enumerator = Enumerator::new().map_err(query_error)?;
        enumerator.match_subsystem("block").map_err(query_error)?;
        enumerator
            .match_property("DEVTYPE", "disk")
            .map_err(query_error)?;
        enumerator
            .match_property("ID_BUS", "usb")
            .map_err(query_error)?;

        let mut ids = BTreeSet::new();
        for device in enumerator.scan_devices().map_err(query_error)? {
            if let Some(id) = device_serial(&device) {
                ids.insert(id);
            }
        }
        Ok(ids)
    }
}

impl DeviceLister for UdevLister {
    fn poll(&self) -> BTreeSet<DeviceId> {
        match self.scan() {
            Ok(ids) => ids,
            Err(err) => {
                warn!("{err}; treating as no devices");
                BTreeSet::new()
            }
        }
    }

    fn name(&self) -> &'static str {
        "udev"
    }
}

fn device_serial(device: &Device) -> Option<DeviceId> {
    let devtype = property(device, "DEVTYPE");
    let bus = property(device, "ID_BUS");
    if !is_usb_disk(devtype, bus) {
        return None;
    }

    let id = serial_from_properties(
        property(device, "ID_SERIAL_SHORT"),
        property(device, "ID_SERIAL"),
    );
    if id.is_none() {
        debug!(
            "USB disk {} exposes no serial; ignoring",
            device.syspath().to_string_lossy()
        );
    }
    id
}

fn property<'a>(device: &'a Device, key: &str) -> Option<&'a str> {
    device.property_value(key).and_then(OsStr::to_str)
}

fn query_error(err: std::io::Error) -> GateError {
    GateError::DeviceQuery(format!("udev enumeration failed: {err}"))
}
