//! Discovery of attached USBTMC instruments

use crate::usbtmc::{is_instrument_capable, AltSetting};
use crate::visa::ResourceIdentifier;
use crate::Error;

use log::{debug, trace};
use rusb::UsbContext;

/// Get the VISA resource strings of the connected instruments
///
/// Every call scans the bus again. Devices whose serial number or active
/// configuration cannot be read are skipped.
pub fn list_resources() -> Result<Vec<String>, Error> {
    let context = rusb::Context::new()?;
    list_resources_in(&context)
}

/// Same as [`list_resources`], scanning the devices of the given context
pub fn list_resources_in<C: UsbContext>(context: &C) -> Result<Vec<String>, Error> {
    let mut resources = Vec::new();

    for device in context.devices()?.iter() {
        match scan_device(&device) {
            Ok(found) => resources.extend(found),
            Err(e) => debug!(
                "skipping device {:03}:{:03}: {}",
                device.bus_number(),
                device.address(),
                e
            ),
        }
    }

    Ok(resources)
}

/// Resource strings of the USBTMC alternate settings of a single device.
/// The device handle is released before returning.
fn scan_device<C: UsbContext>(device: &rusb::Device<C>) -> Result<Vec<String>, rusb::Error> {
    let desc = device.device_descriptor()?;
    let handle = device.open()?;
    let serial = handle.read_serial_number_string_ascii(&desc)?;
    let config = device.active_config_descriptor()?;

    let alt_settings = config
        .interfaces()
        .flat_map(|iface| iface.descriptors())
        .map(|alt| AltSetting::from(&alt));

    Ok(render_resources(
        desc.vendor_id(),
        desc.product_id(),
        &serial,
        alt_settings,
    ))
}

/// One resource string per instrument capable alternate setting
pub fn render_resources<I>(
    vendor_id: u16,
    product_id: u16,
    serial: &str,
    alt_settings: I,
) -> Vec<String>
where
    I: IntoIterator<Item = AltSetting>,
{
    alt_settings
        .into_iter()
        .filter(is_instrument_capable)
        .map(|alt| {
            let resource =
                ResourceIdentifier::usb_instr(vendor_id, product_id, serial, alt.interface_number)
                    .to_string();
            trace!("alternate setting {} matches {}", alt.setting_number, resource);
            resource
        })
        .collect()
}

/// Open the first device matching the vendor ID, product ID and serial number
///
/// IDs that are `None` and an empty serial number match any device.
pub fn find_device<C: UsbContext>(
    context: &C,
    vendor_id: Option<u16>,
    product_id: Option<u16>,
    serial: &str,
) -> Result<rusb::DeviceHandle<C>, Error> {
    for device in context.devices()?.iter() {
        let desc = match device.device_descriptor() {
            Ok(desc) => desc,
            Err(_) => continue,
        };

        if !id_matches(vendor_id, desc.vendor_id()) || !id_matches(product_id, desc.product_id()) {
            continue;
        }

        let handle = match device.open() {
            Ok(handle) => handle,
            Err(e) => {
                debug!(
                    "failed to open {:04x}:{:04x}: {}",
                    desc.vendor_id(),
                    desc.product_id(),
                    e
                );
                continue;
            }
        };

        if !serial.is_empty() {
            match handle.read_serial_number_string_ascii(&desc) {
                Ok(sn) if sn == serial => {}
                _ => continue,
            }
        }

        return Ok(handle);
    }

    Err(Error::DeviceNotFound)
}

fn id_matches(wanted: Option<u16>, actual: u16) -> bool {
    wanted.map_or(true, |id| id == actual)
}
