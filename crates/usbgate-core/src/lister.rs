//! Contract for enumerating attached removable storage devices.
//!
//! Concrete platform listers live in `usbgate-usb`; the controller and
//! service only depend on this trait so tests can script device presence.

use crate::device::DeviceId;
use std::collections::BTreeSet;

/// Enumerates the identifiers of currently attached mass-storage devices.
pub trait DeviceLister: Send + Sync {
    /// Return the attached device identifiers.
    ///
    /// Implementations never fail: an OS query error reads as "no devices",
    /// which keeps the gate locked.
    fn poll(&self) -> BTreeSet<DeviceId>;

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}

/// Lister for platforms without device enumeration support; always empty.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullLister;

impl DeviceLister for NullLister {
    fn poll(&self) -> BTreeSet<DeviceId> {
        BTreeSet::new()
    }

    fn name(&self) -> &'static str {
        "none"
    }
}
