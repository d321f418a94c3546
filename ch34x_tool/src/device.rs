//! Device discovery and the libusb transport.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context as _, Result};
use ch34x_uart::config::usb_ids;
use ch34x_uart::{ControlRequest, TransportError, UsbTransport};
use log::{debug, info, warn};
use rusb::{Context, Device, DeviceHandle, Direction, TransferType, UsbContext};

/// VID:PID pair given on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceSelector {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl FromStr for DeviceSelector {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (vid, pid) = s
            .split_once(':')
            .ok_or_else(|| format!("expected VID:PID, got '{}'", s))?;
        let parse = |part: &str| {
            u16::from_str_radix(part.trim_start_matches("0x"), 16)
                .map_err(|e| format!("invalid hex id '{}': {}", part, e))
        };
        Ok(Self {
            vendor_id: parse(vid)?,
            product_id: parse(pid)?,
        })
    }
}

impl DeviceSelector {
    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id == vendor_id && self.product_id == product_id
    }
}

/// Summary of a device found on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub bus: u8,
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Bus {:03} Device {:03}: ID {:04x}:{:04x}",
            self.bus, self.address, self.vendor_id, self.product_id
        )
    }
}

/// Transfer timeouts.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub control: Duration,
    pub bulk: Duration,
}

/// Find devices matching the selector (or any supported CH34x).
pub fn find_devices(
    context: &Context,
    selector: Option<DeviceSelector>,
) -> Result<Vec<(Device<Context>, DeviceInfo)>> {
    let mut found = Vec::new();

    for device in context.devices()?.iter() {
        let descriptor = match device.device_descriptor() {
            Ok(descriptor) => descriptor,
            Err(e) => {
                debug!("skipping device without descriptor: {}", e);
                continue;
            }
        };

        let (vendor_id, product_id) = (descriptor.vendor_id(), descriptor.product_id());
        let wanted = match selector {
            Some(sel) => sel.matches(vendor_id, product_id),
            None => usb_ids::is_supported(vendor_id, product_id),
        };
        if !wanted {
            continue;
        }

        let info = DeviceInfo {
            bus: device.bus_number(),
            address: device.address(),
            vendor_id,
            product_id,
        };
        found.push((device, info));
    }

    Ok(found)
}

/// Open the first matching device. Returns error if none found.
pub fn open_first(
    context: &Context,
    selector: Option<DeviceSelector>,
    timeouts: Timeouts,
) -> Result<(RusbTransport, DeviceInfo)> {
    let (device, info) = match find_devices(context, selector)?.into_iter().next() {
        Some(found) => found,
        None => anyhow::bail!("No CH34x device found - check the USB connection"),
    };

    info!("opening {}", info);
    let transport = RusbTransport::open(&device, timeouts)
        .with_context(|| format!("Failed to open {}", info))?;
    Ok((transport, info))
}

/// libusb-backed transport.
///
/// Claims every interface of the active configuration on open. Interfaces
/// are released by [`UsbTransport::release`] or, failing that, on drop; the
/// handle itself closes when dropped.
pub struct RusbTransport {
    handle: DeviceHandle<Context>,
    claimed: Vec<u8>,
    detached: Vec<u8>,
    bulk_out: u8,
    timeouts: Timeouts,
}

impl RusbTransport {
    pub fn open(device: &Device<Context>, timeouts: Timeouts) -> Result<Self> {
        let config = device
            .active_config_descriptor()
            .context("Failed to read configuration descriptor")?;
        let handle = device.open()?;

        let mut transport = Self {
            handle,
            claimed: Vec::new(),
            detached: Vec::new(),
            bulk_out: 0,
            timeouts,
        };

        let mut bulk_out = None;
        for interface in config.interfaces() {
            transport.claim(interface.number())?;

            for descriptor in interface.descriptors() {
                for endpoint in descriptor.endpoint_descriptors() {
                    if bulk_out.is_none()
                        && endpoint.direction() == Direction::Out
                        && endpoint.transfer_type() == TransferType::Bulk
                    {
                        bulk_out = Some(endpoint.address());
                    }
                }
            }
        }

        transport.bulk_out = bulk_out.context("Device has no bulk OUT endpoint")?;
        debug!("bulk OUT endpoint 0x{:02x}", transport.bulk_out);
        Ok(transport)
    }

    fn claim(&mut self, number: u8) -> Result<()> {
        match self.handle.kernel_driver_active(number) {
            Ok(true) => {
                self.handle
                    .detach_kernel_driver(number)
                    .with_context(|| format!("Failed to detach kernel driver from interface {}", number))?;
                self.detached.push(number);
            }
            Ok(false) | Err(rusb::Error::NotSupported) => {}
            Err(e) => return Err(e.into()),
        }

        self.handle
            .claim_interface(number)
            .with_context(|| format!("Failed to claim interface {}", number))?;
        self.claimed.push(number);
        debug!("claimed interface {}", number);
        Ok(())
    }

    fn release_interfaces(&mut self) -> Result<(), rusb::Error> {
        let mut result = Ok(());

        for number in self.claimed.drain(..) {
            if let Err(e) = self.handle.release_interface(number) {
                warn!("failed to release interface {}: {}", number, e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }

        for number in self.detached.drain(..) {
            if let Err(e) = self.handle.attach_kernel_driver(number) {
                debug!("kernel driver not reattached to interface {}: {}", number, e);
            }
        }

        result
    }
}

impl UsbTransport for RusbTransport {
    async fn control_out(
        &mut self,
        setup: ControlRequest,
        data: &[u8],
    ) -> Result<usize, TransportError> {
        self.handle
            .write_control(
                setup.request_type,
                setup.request,
                setup.value,
                setup.index,
                data,
                self.timeouts.control,
            )
            .map_err(map_error)
    }

    async fn control_in(
        &mut self,
        setup: ControlRequest,
        buf: &mut [u8],
    ) -> Result<usize, TransportError> {
        self.handle
            .read_control(
                setup.request_type,
                setup.request,
                setup.value,
                setup.index,
                buf,
                self.timeouts.control,
            )
            .map_err(map_error)
    }

    async fn bulk_out(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        self.handle
            .write_bulk(self.bulk_out, data, self.timeouts.bulk)
            .map_err(map_error)
    }

    async fn release(&mut self) -> Result<(), TransportError> {
        self.release_interfaces().map_err(map_error)
    }
}

impl Drop for RusbTransport {
    fn drop(&mut self) {
        if needs_cleanup(&self.claimed, &self.detached) {
            let _ = self.release_interfaces();
        }
    }
}

// A failed claim can leave a kernel driver detached with nothing claimed.
fn needs_cleanup(claimed: &[u8], detached: &[u8]) -> bool {
    !claimed.is_empty() || !detached.is_empty()
}

/// Translate libusb errors into the driver's transport errors.
pub fn map_error(error: rusb::Error) -> TransportError {
    match error {
        rusb::Error::Timeout => TransportError::Timeout,
        rusb::Error::Pipe => TransportError::Pipe,
        rusb::Error::NoDevice | rusb::Error::NotFound => TransportError::NoDevice,
        rusb::Error::Busy => TransportError::Busy,
        rusb::Error::Access => TransportError::Access,
        rusb::Error::Overflow => TransportError::Overflow,
        rusb::Error::Interrupted => TransportError::Interrupted,
        rusb::Error::NotSupported => TransportError::NotSupported,
        rusb::Error::Io => TransportError::Io,
        _ => TransportError::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_parse() {
        let sel: DeviceSelector = "1a86:7523".parse().unwrap();
        assert_eq!(sel.vendor_id, 0x1a86);
        assert_eq!(sel.product_id, 0x7523);

        let sel: DeviceSelector = "0x4348:0x5523".parse().unwrap();
        assert_eq!(sel.vendor_id, 0x4348);

        assert!("1a86".parse::<DeviceSelector>().is_err());
        assert!("zz:7523".parse::<DeviceSelector>().is_err());
    }

    #[test]
    fn test_selector_matching() {
        let ftdi = DeviceSelector {
            vendor_id: 0x0403,
            product_id: 0x6001,
        };
        assert!(ftdi.matches(0x0403, 0x6001));
        assert!(!ftdi.matches(0x1a86, 0x7523));
        assert!(!ftdi.matches(0x0403, 0x6010));
    }

    #[test]
    fn test_cleanup_after_failed_claim() {
        // Kernel driver detached from interface 0, claim then failed
        assert!(needs_cleanup(&[], &[0]));
        assert!(needs_cleanup(&[0, 1], &[]));
        assert!(needs_cleanup(&[0], &[0]));
        assert!(!needs_cleanup(&[], &[]));
    }

    #[test]
    fn test_error_mapping() {
        assert_eq!(map_error(rusb::Error::Timeout), TransportError::Timeout);
        assert_eq!(map_error(rusb::Error::NotFound), TransportError::NoDevice);
        assert_eq!(map_error(rusb::Error::Pipe), TransportError::Pipe);
        assert_eq!(map_error(rusb::Error::NoMem), TransportError::Other);
    }

    #[test]
    fn test_device_info_display() {
        let info = DeviceInfo {
            bus: 1,
            address: 4,
            vendor_id: 0x1a86,
            product_id: 0x7523,
        };
        assert_eq!(info.to_string(), "Bus 001 Device 004: ID 1a86:7523");
    }
}
