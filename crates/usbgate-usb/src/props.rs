//! Interpretation of udev device properties.
//!
//! Kept free of libudev so the rules are testable on any host.

use usbgate_core::DeviceId;

/// Whole-disk block devices on the USB bus; partitions are skipped so each
/// stick is reported once.
pub fn is_usb_disk(devtype: Option<&str>, bus: Option<&str>) -> bool {
    devtype == Some("disk") && bus == Some("usb")
}

/// Derive the device identifier from udev serial properties.
///
/// `ID_SERIAL_SHORT` carries the bare hardware serial. When it is missing,
/// `ID_SERIAL` (`Vendor_Model_Serial[-0:0]`) is cut at its last `_` and the
/// LUN suffix dropped.
pub fn serial_from_properties(serial_short: Option<&str>, serial: Option<&str>) -> Option<DeviceId> {
    if let Some(id) = serial_short.and_then(DeviceId::new) {
        return Some(id);
    }

    let serial = serial?;
    let tail = serial.rsplit('_').next().unwrap_or(serial);
    let tail = tail.split_once('-').map(|(head, _)| head).unwrap_or(tail);
    DeviceId::new(tail)
}
