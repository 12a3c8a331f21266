/// Rust USB Test and Measurement Class (USBTMC) instruments addressed by VISA
/// resource strings

/* rusbtmc (c) by Nao Pross <np@0hm.ch>
 *
 *
 * rusbtmc is licensed under a
 * Creative Commons Attribution-ShareAlike 4.0 International License.
 *
 * You should have received a copy of the license along with this
 * work. If not, see <http://creativecommons.org/licenses/by-sa/4.0/>.
 */

pub mod discovery;
pub mod usbtmc;
pub mod visa;

use log::debug;
use thiserror::Error;

pub use discovery::{find_device, list_resources, list_resources_in};
pub use usbtmc::{Capabilities, Instrument};
pub use visa::{ParseError, ResourceIdentifier};

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid resource string: {0}")]
    Parse(#[from] ParseError),
    #[error("error on low level USB")]
    Usb(#[from] rusb::Error),
    #[error("device not found")]
    DeviceNotFound,
    #[error("not a usbtmc device")]
    NotUsbtmcDevice,
    #[error("not connected")]
    NotConnected,
    #[error("request failed")]
    Request,
    #[error("malformed response from device")]
    InvalidResponse,
    #[error("decoding error (utf-8)")]
    Decoding(#[from] std::string::FromUtf8Error),
}

/// Open the instrument addressed by a VISA resource string
///
/// The device must match the manufacturer ID and model code of the resource
/// string, and its serial number when one is given. When the resource string
/// has an interface index only that USBTMC interface is claimed.
///
/// The returned instrument is already connected and terminates reads on
/// `term_char` (0 disables termination character reads).
pub fn open_resource(
    resource: &str,
    term_char: u8,
) -> Result<Instrument<rusb::Context>, Error> {
    let context = rusb::Context::new()?;
    open_resource_in(&context, resource, term_char)
}

/// Same as [`open_resource`], searching the devices of the given context
pub fn open_resource_in<C: rusb::UsbContext>(
    context: &C,
    resource: &str,
    term_char: u8,
) -> Result<Instrument<C>, Error> {
    let id: ResourceIdentifier = resource.parse()?;

    let handle = find_device(
        context,
        id.manufacturer_id(),
        id.model_code(),
        id.serial_number(),
    )?;
    debug!("found device for {}", id);

    let mut instrument = Instrument::with_handle(handle, term_char);
    instrument.select_interface(id.interface_index());
    instrument.open()?;

    Ok(instrument)
}
