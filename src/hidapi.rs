use crate::codec::{Report, REPORT_SIZE};
use crate::exchange::Transport;
use hidapi::{HidApi, HidDevice};
use std::ffi::{CString, NulError};
use std::io;
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub const VENDOR_ID: u16 = 0x28E9;
pub const PRODUCT_ID: u16 = 0x028A;

#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    #[error("HID error: {0}")]
    Hid(#[from] hidapi::HidError),
    #[error("invalid device path: {0}")]
    InvalidPath(#[from] NulError),
}

/// One enumerated HID interface.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DeviceInfo {
    pub path: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    pub interface_number: i32,
}

/// Lists HID interfaces, optionally restricted to one vendor/product pair.
pub fn list_devices(filter: Option<(u16, u16)>) -> Result<Vec<DeviceInfo>, OpenError> {
    let api = HidApi::new()?;
    let devices = api
        .device_list()
        .filter(|info| {
            filter.map_or(true, |(vid, pid)| info.vendor_id() == vid && info.product_id() == pid)
        })
        .map(|info| DeviceInfo {
            path: info.path().to_string_lossy().into_owned(),
            vendor_id: info.vendor_id(),
            product_id: info.product_id(),
            manufacturer: info.manufacturer_string().map(str::to_owned),
            product: info.product_string().map(str::to_owned),
            serial_number: info.serial_number().map(str::to_owned),
            interface_number: info.interface_number(),
        })
        .collect();
    Ok(devices)
}

/// Blocking transport over a hidapi device handle.
pub struct HidTransport {
    device: HidDevice,
    // keeps the hidapi context alive for the handle
    _api: HidApi,
}

impl HidTransport {
    pub fn open(vendor_id: u16, product_id: u16) -> Result<Self, OpenError> {
        let api = HidApi::new()?;
        let device = api.open(vendor_id, product_id)?;
        log::debug!("Opened HID device {vendor_id:04x}:{product_id:04x}");
        Ok(Self { device, _api: api })
    }

    pub fn open_path(path: &str) -> Result<Self, OpenError> {
        let api = HidApi::new()?;
        let device = api.open_path(&CString::new(path)?)?;
        log::debug!("Opened HID device '{path}'");
        Ok(Self { device, _api: api })
    }
}

impl std::fmt::Debug for HidTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HidTransport").finish_non_exhaustive()
    }
}

/// Some platforms count the report id on top of the report.
fn check_written(written: usize) -> io::Result<()> {
    if written < REPORT_SIZE {
        log::warn!("Short HID write: {written} of {REPORT_SIZE} bytes");
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            format!("wrote {written} of {REPORT_SIZE} report bytes"),
        ));
    }
    Ok(())
}

impl Transport for HidTransport {
    fn write_report(&mut self, report: &Report) -> io::Result<()> {
        // the direction byte goes out in the report id position
        let written = self.device.write(report.as_ref()).map_err(io::Error::other)?;
        check_written(written)
    }

    fn read_report(&mut self, timeout: Duration) -> io::Result<Option<Report>> {
        let millis = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        let mut buffer = [0u8; REPORT_SIZE];
        let received = self
            .device
            .read_timeout(&mut buffer, millis)
            .map_err(io::Error::other)?;
        if received == 0 {
            return Ok(None);
        }
        Ok(Some(Report::from_slice(&buffer[..received])))
    }
}
