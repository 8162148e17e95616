//! Platform listers for attached USB mass-storage devices.
//!
//! Integrates with the host via:
//! - udev enumeration on Linux (`block` disks on the USB bus)
//! - `wmic` PNP device queries on Windows (`USBSTOR` hardware paths)
//!
//! Every lister satisfies the fail-closed `DeviceLister` contract: query
//! failures are logged and reported as "no devices".

mod command;
#[cfg(target_os = "linux")]
mod linux;
mod pnp;
mod props;

use std::sync::Arc;
use std::time::Duration;
use usbgate_core::DeviceLister;

#[cfg(target_os = "linux")]
pub use linux::UdevLister;
pub use pnp::{parse_pnp_device_ids, WmicLister};
pub use props::{is_usb_disk, serial_from_properties};

/// Pick the lister for the running platform.
///
/// `query_timeout` bounds external commands spawned by the lister; platforms
/// without support get a lister that never reports a device.
pub fn system_lister(query_timeout: Duration) -> Arc<dyn DeviceLister> {
    #[cfg(target_os = "linux")]
    {
        let _ = query_timeout;
        Arc::new(UdevLister::new())
    }

    #[cfg(windows)]
    {
        Arc::new(WmicLister::new(query_timeout))
    }

    #[cfg(not(any(target_os = "linux", windows)))]
    {
        let _ = query_timeout;
        log::warn!("no device lister for this platform; the gate will stay locked");
        Arc::new(usbgate_core::NullLister)
    }
}
