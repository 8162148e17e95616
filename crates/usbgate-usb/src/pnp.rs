//! Windows PNP device enumeration through `wmic`.

use crate::command::TimedCommand;
use log::{debug, warn};
use std::collections::BTreeSet;
use std::time::Duration;
use usbgate_core::{DeviceId, DeviceLister};

const WMIC_BINARY: &str = "wmic";
const WMIC_ARGS: &[&str] = &[
    "path",
    "Win32_DiskDrive",
    "where",
    "InterfaceType='USB'",
    "get",
    "PNPDeviceID",
];

/// Lists USB disks via `wmic path Win32_DiskDrive ... get PNPDeviceID`.
#[derive(Debug, Clone)]
pub struct WmicLister {
    command: TimedCommand,
}

impl WmicLister {
    pub fn new(timeout: Duration) -> Self {
        Self {
            command: TimedCommand::new(WMIC_BINARY, timeout),
        }
    }
}

impl DeviceLister for WmicLister {
    fn poll(&self) -> BTreeSet<DeviceId> {
        match self.command.run(WMIC_ARGS) {
            Ok(out) if out.status == 0 => parse_pnp_device_ids(&out.stdout),
            Ok(out) => {
                warn!("wmic exited with status {}; treating as no devices", out.status);
                BTreeSet::new()
            }
            Err(err) => {
                warn!("{err}; treating as no devices");
                BTreeSet::new()
            }
        }
    }

    fn name(&self) -> &'static str {
        "wmic"
    }
}

/// Extract serials from `PNPDeviceID` lines such as
/// `USBSTOR\DISK&VEN_SANDISK&PROD_CRUZER&REV_1.00\4C530001110311103521&0`.
///
/// Only `USBSTOR` paths count; the serial is the last `\` segment up to the
/// first `&`.
pub fn parse_pnp_device_ids(output: &str) -> BTreeSet<DeviceId> {
    let mut ids = BTreeSet::new();
    for line in output.lines() {
        let line = line.trim();
        if !line.to_ascii_uppercase().contains("USBSTOR") {
            continue;
        }
        let segment = line.rsplit('\\').next().unwrap_or(line);
        let serial = segment.split('&').next().unwrap_or(segment);
        match DeviceId::new(serial) {
            Some(id) => {
                ids.insert(id);
            }
            None => debug!("no serial in PNP path {line}"),
        }
    }
    ids
}
