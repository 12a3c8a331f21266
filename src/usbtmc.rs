//! USBTMC protocol layer: capability detection and the instrument handle

use crate::Error;

use log::{debug, trace, warn};
use std::time::Duration;

const USBTMC_BINTERFACE_CLASS: u8 = 0xfe;
const USBTMC_BINTERFACE_SUBCLASS: u8 = 3;

/// Size of the header of every bulk transfer
pub const HEADER_SIZE: usize = 12;
/// Largest payload sent in a single DEV_DEP_MSG_OUT transfer
const MAX_TRANSFER_SIZE: usize = 1024 * 1024;
/// Minimum size of the buffer used for each bulk-in read, header included
const READ_BUFFER_SIZE: usize = 4096;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/* control values */

/// USBTMC bRequest Values
#[repr(u8)]
enum RequestType {
    InitiateAbortBulkOut = 1,
    InitiateClear = 5,
    CheckClearStatus = 6,
    GetCapabilities = 7,
}

/// USBTMC Status values
#[repr(u8)]
enum Status {
    Success = 0x01,
    Pending = 0x02,
}

/* bulk values */

/// MsgID values, table 2 of the USBTMC spec
#[repr(u8)]
enum MsgId {
    DevDepMsgOut = 1,
    RequestDevDepMsgIn = 2,
}

/// The descriptor fields of an interface alternate setting that identify
/// a USBTMC interface
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AltSetting {
    pub interface_number: u8,
    pub setting_number: u8,
    pub class_code: u8,
    pub sub_class_code: u8,
    pub protocol_code: u8,
}

impl From<&rusb::InterfaceDescriptor<'_>> for AltSetting {
    fn from(desc: &rusb::InterfaceDescriptor<'_>) -> Self {
        AltSetting {
            interface_number: desc.interface_number(),
            setting_number: desc.setting_number(),
            class_code: desc.class_code(),
            sub_class_code: desc.sub_class_code(),
            protocol_code: desc.protocol_code(),
        }
    }
}

/// Whether the alternate setting declares the USBTMC class and subclass
///
/// Both plain USBTMC (protocol 0) and USB488 (protocol 1) interfaces qualify.
pub fn is_instrument_capable(alt: &AltSetting) -> bool {
    alt.class_code == USBTMC_BINTERFACE_CLASS
        && alt.sub_class_code == USBTMC_BINTERFACE_SUBCLASS
}

/* instruments */

/// Capabilities of the USBTMC Devices
#[derive(Clone, Debug)]
pub struct Capabilities {
    /* version number (in BCD) */
    bcd_usbtmc: u16,
    /* interface capabilities */
    /// The device has an indicator for identification purposes
    pub pulse: bool,
    /// The interface is talk-only if it is not capable of processing any Bulk-OUT USBTMC
    /// device dependent message data bytes.
    pub talk_only: bool,
    /// The interface is it is not capable of sending Bulk-IN USBTMC device dependent
    /// message data bytes
    pub listen_only: bool,
    /* device capabilities */
    /// The device supports ending a Bulk-IN transfer from this USBTMC interface when a
    /// byte matches a specified TermChar.
    pub term_char: bool,
}

impl Capabilities {
    /// USBTMC specification release supported by the device, in BCD
    pub fn bcd_usbtmc(&self) -> u16 {
        self.bcd_usbtmc
    }

    fn from_response(buf: &[u8; 0x18]) -> Self {
        Capabilities {
            bcd_usbtmc: u16::from_le_bytes([buf[2], buf[3]]),
            pulse: (buf[4] & 4) != 0,
            talk_only: (buf[4] & 2) != 0,
            listen_only: (buf[4] & 1) != 0,
            term_char: (buf[5] & 1) != 0,
        }
    }
}

/// USBTMC instrument handle around a rusb Device
pub struct Instrument<C: rusb::UsbContext> {
    connected: bool,
    // rusb objects
    device: rusb::Device<C>,
    handle: Option<rusb::DeviceHandle<C>>,
    // byte that ends a read, 0 to disable
    term_char: u8,
    // usbtmc capabilites
    capabilities: Option<Capabilities>,
    // for linux kernel
    has_kernel_driver: bool,
    // addresses in the usb device
    config_num: Option<u8>,
    iface_num: Option<u8>,
    ep_bulk_in: Option<u8>,
    ep_bulk_in_max_packet: u16,
    ep_bulk_out: Option<u8>,
    ep_interrupt_in: Option<u8>,
    // only claim this bInterfaceNumber when set
    wanted_iface: Option<u16>,
    // last btag sent
    btag: u8,
    timeout: Duration,
}

impl<C: rusb::UsbContext> Instrument<C> {
    /// Creates an Instrument from a rusb Device, the device is opened by
    /// [`Instrument::open`]
    pub fn new(device: rusb::Device<C>, term_char: u8) -> Instrument<C> {
        Instrument {
            connected: false,
            device,
            handle: None,
            term_char,
            capabilities: None,
            has_kernel_driver: false,
            config_num: None,
            iface_num: None,
            ep_bulk_in: None,
            ep_bulk_in_max_packet: 0,
            ep_bulk_out: None,
            ep_interrupt_in: None,
            wanted_iface: None,
            btag: 0,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Creates an Instrument from an already opened device
    pub fn with_handle(handle: rusb::DeviceHandle<C>, term_char: u8) -> Instrument<C> {
        let mut instrument = Instrument::new(handle.device(), term_char);
        instrument.handle = Some(handle);
        instrument
    }

    pub fn device(&self) -> &rusb::Device<C> {
        &self.device
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn term_char(&self) -> u8 {
        self.term_char
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Restrict [`Instrument::open`] to the USBTMC interface with this
    /// bInterfaceNumber, `None` takes the first one
    pub fn select_interface(&mut self, interface_number: Option<u16>) {
        self.wanted_iface = interface_number;
    }

    /// Timeout of every single USB transfer
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Opens (searches for) the USBTMC interface of the device
    ///
    /// It loops through the available usb interfaces and uses the first that
    /// matches the usbtmc spec class and subclass
    pub fn open(&mut self) -> Result<(), Error> {
        if self.connected {
            debug!("device already connected");
            return Ok(());
        }

        let mut handle = match self.handle.take() {
            Some(handle) => handle,
            None => self.device.open()?,
        };

        self.find_endpoints()?;

        let (config_num, iface_num) = match (self.config_num, self.iface_num) {
            (Some(config_num), Some(iface_num)) => (config_num, iface_num),
            _ => return Err(Error::NotUsbtmcDevice),
        };

        // detach kernel driver if necessary
        self.has_kernel_driver = match handle.kernel_driver_active(iface_num) {
            Ok(true) => {
                handle.detach_kernel_driver(iface_num)?;
                true
            }
            _ => false,
        };

        let claimed = claim(&mut handle, config_num, iface_num);
        let has_kernel_driver = self.has_kernel_driver;
        restore_on_error(claimed, || {
            if has_kernel_driver {
                if let Err(e) = handle.attach_kernel_driver(iface_num) {
                    warn!("failed to attach kernel driver: {}", e);
                }
            }
        })?;

        self.handle = Some(handle);
        self.connected = true;

        self.clear()
    }

    fn find_endpoints(&mut self) -> Result<(), Error> {
        let desc = self.device.device_descriptor()?;

        'outer: for cfg_desc in (0..desc.num_configurations())
            .map(|num| self.device.config_descriptor(num))
            .filter_map(|cfg_desc| cfg_desc.ok())
        {
            for iface_desc in cfg_desc.interfaces().flat_map(|iface| iface.descriptors()) {
                if !interface_selected(&AltSetting::from(&iface_desc), self.wanted_iface) {
                    continue;
                }

                self.config_num = Some(cfg_desc.number());
                self.iface_num = Some(iface_desc.interface_number());

                for ep_desc in iface_desc.endpoint_descriptors() {
                    match (ep_desc.transfer_type(), ep_desc.direction()) {
                        (rusb::TransferType::Bulk, rusb::Direction::Out) => {
                            self.ep_bulk_out = Some(ep_desc.address());
                        }
                        (rusb::TransferType::Bulk, rusb::Direction::In) => {
                            self.ep_bulk_in = Some(ep_desc.address());
                            self.ep_bulk_in_max_packet = ep_desc.max_packet_size();
                        }
                        (rusb::TransferType::Interrupt, rusb::Direction::In) => {
                            self.ep_interrupt_in = Some(ep_desc.address());
                        }
                        _ => {}
                    }
                }

                // found first interface = happy
                break 'outer;
            }
        }

        // the interrupt endpoint is optional for plain USBTMC
        if self.ep_bulk_out.is_none() || self.ep_bulk_in.is_none() {
            return Err(Error::NotUsbtmcDevice);
        }

        Ok(())
    }

    /// Closes the devices
    pub fn close(&mut self) {
        if !self.connected {
            return;
        }

        if let (Some(handle), Some(iface_num)) = (self.handle.as_mut(), self.iface_num) {
            if let Err(e) = handle.release_interface(iface_num) {
                warn!("failed to release interface {}: {}", iface_num, e);
            }

            if self.has_kernel_driver {
                if let Err(e) = handle.attach_kernel_driver(iface_num) {
                    warn!("failed to attach kernel driver: {}", e);
                }
            }
        }

        self.connected = false;

        self.ep_bulk_out = None;
        self.ep_bulk_in = None;
        self.ep_interrupt_in = None;
    }

    fn connection(&self) -> Result<(&rusb::DeviceHandle<C>, u8), Error> {
        match (self.connected, self.handle.as_ref(), self.iface_num) {
            (true, Some(handle), Some(iface_num)) => Ok((handle, iface_num)),
            _ => Err(Error::NotConnected),
        }
    }

    /// Sends a clear request and waits for it to complete
    pub fn clear(&mut self) -> Result<(), Error> {
        let (handle, index) = self.connection()?;
        let request_type = rusb::request_type(
            rusb::Direction::In,
            rusb::RequestType::Class,
            rusb::Recipient::Interface,
        );

        let mut buf = [0u8; 1];
        handle.read_control(
            request_type,
            RequestType::InitiateClear as u8,
            0x0000,
            index.into(),
            &mut buf,
            self.timeout,
        )?;

        if buf[0] != Status::Success as u8 {
            return Err(Error::Request);
        }

        // wait for completion of clear
        loop {
            let mut buf = [0u8; 2];
            handle.read_control(
                request_type,
                RequestType::CheckClearStatus as u8,
                0x0000,
                index.into(),
                &mut buf,
                self.timeout,
            )?;

            if buf[0] != Status::Pending as u8 {
                break;
            }

            std::thread::sleep(Duration::from_millis(100));
        }

        // clear halt condition
        let bulk_out_ep = self.ep_bulk_out.ok_or(Error::NotConnected)?;
        match self.handle.as_mut() {
            Some(handle) => handle.clear_halt(bulk_out_ep)?,
            None => return Err(Error::NotConnected),
        }

        Ok(())
    }

    /// Ask to the device with features are supported
    pub fn get_capabilities(&mut self) -> Result<Capabilities, Error> {
        let (handle, index) = self.connection()?;

        let mut buf = [0u8; 0x18];
        handle.read_control(
            rusb::request_type(
                rusb::Direction::In,
                rusb::RequestType::Class,
                rusb::Recipient::Interface,
            ),
            RequestType::GetCapabilities as u8,
            0x0000,
            index.into(),
            &mut buf,
            self.timeout,
        )?;

        if buf[0] != Status::Success as u8 {
            return Err(Error::Request);
        }

        let capabilities = Capabilities::from_response(&buf);
        self.capabilities = Some(capabilities.clone());
        Ok(capabilities)
    }

    /// Write a string to the instrument
    pub fn write(&mut self, message: &str) -> Result<usize, Error> {
        self.write_raw(message.as_bytes())
    }

    /// Write binary data to the instrument, returns the number of payload
    /// bytes sent
    pub fn write_raw(&mut self, data: &[u8]) -> Result<usize, Error> {
        // borrow the handle field alone, btag is updated while it is held
        let handle = match (self.connected, self.handle.as_ref()) {
            (true, Some(handle)) => handle,
            _ => return Err(Error::NotConnected),
        };
        let endpoint = self.ep_bulk_out.ok_or(Error::NotConnected)?;

        let chunks = data.len().div_ceil(MAX_TRANSFER_SIZE).max(1);
        let mut sent_bytes = 0;

        for index in 0..chunks {
            let end = data.len().min((index + 1) * MAX_TRANSFER_SIZE);
            let chunk = &data[index * MAX_TRANSFER_SIZE..end];
            let is_last = index + 1 == chunks;

            self.btag = next_btag(self.btag);
            let packet = make_bulk_out_packet(self.btag, chunk, is_last);
            trace!("bulk out: btag {} {} bytes", self.btag, chunk.len());

            if let Err(e) = handle.write_bulk(endpoint, &packet, self.timeout) {
                debug!("failed to send chunk during bulk out");
                abort_bulk_out(handle, endpoint, self.btag, self.timeout)?;
                return Err(Error::Usb(e));
            }

            sent_bytes += chunk.len();
        }

        Ok(sent_bytes)
    }

    /// Read binary data from the device and decode into an utf-8 string
    pub fn read(&mut self) -> Result<String, Error> {
        let data = self.read_raw()?;
        Ok(String::from_utf8(data)?)
    }

    /// Read binary data from the device
    ///
    /// Requests device dependent messages until the device sets EOM.
    pub fn read_raw(&mut self) -> Result<Vec<u8>, Error> {
        let handle = match (self.connected, self.handle.as_ref()) {
            (true, Some(handle)) => handle,
            _ => return Err(Error::NotConnected),
        };
        let ep_out = self.ep_bulk_out.ok_or(Error::NotConnected)?;
        let ep_in = self.ep_bulk_in.ok_or(Error::NotConnected)?;

        let mut data = Vec::new();
        let mut buf = vec![0u8; read_buffer_len(self.ep_bulk_in_max_packet)];

        loop {
            self.btag = next_btag(self.btag);
            let request = make_request_header(self.btag, MAX_TRANSFER_SIZE as u32, self.term_char);
            handle.write_bulk(ep_out, &request, self.timeout)?;

            let received = handle.read_bulk(ep_in, &mut buf, self.timeout)?;
            let (transfer_size, eom) = parse_response_header(&buf[..received], self.btag)?;
            trace!("bulk in: btag {} {} bytes, eom {}", self.btag, transfer_size, eom);

            let mut message = buf[HEADER_SIZE..received].to_vec();
            while message.len() < transfer_size {
                let received = handle.read_bulk(ep_in, &mut buf, self.timeout)?;
                if received == 0 {
                    return Err(Error::InvalidResponse);
                }
                message.extend_from_slice(&buf[..received]);
            }

            // drop alignment bytes
            message.truncate(transfer_size);
            data.extend_from_slice(&message);

            if eom {
                break;
            }
        }

        Ok(data)
    }

    /// Write a command and read the response
    pub fn query(&mut self, message: &str) -> Result<String, Error> {
        self.write(message)?;
        self.read()
    }
}

impl<C: rusb::UsbContext> Drop for Instrument<C> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Set the configuration if not correct and claim the interface
fn claim<C: rusb::UsbContext>(
    handle: &mut rusb::DeviceHandle<C>,
    config_num: u8,
    iface_num: u8,
) -> Result<(), Error> {
    if handle.active_configuration()? != config_num {
        handle.set_active_configuration(config_num)?;
        debug!("set configuration to {}", config_num);
    }

    handle.claim_interface(iface_num)?;
    Ok(())
}

/// Runs `restore` when `result` is an error, then passes `result` on
fn restore_on_error<T>(result: Result<T, Error>, restore: impl FnOnce()) -> Result<T, Error> {
    if result.is_err() {
        restore();
    }
    result
}

/// Whether `open` may use this alternate setting
fn interface_selected(alt: &AltSetting, wanted_iface: Option<u16>) -> bool {
    is_instrument_capable(alt)
        && wanted_iface.map_or(true, |iface| iface == u16::from(alt.interface_number))
}

/// Bulk-in buffer length, a multiple of the endpoint max packet size so a
/// full packet never lands in a partially filled buffer
fn read_buffer_len(max_packet_size: u16) -> usize {
    let packet = usize::from(max_packet_size).max(1);
    READ_BUFFER_SIZE.div_ceil(packet) * packet
}

/// Abort a bulk-out operation
fn abort_bulk_out<C: rusb::UsbContext>(
    handle: &rusb::DeviceHandle<C>,
    endpoint: u8,
    btag: u8,
    timeout: Duration,
) -> Result<(), Error> {
    let mut buf = [0u8; 2];
    handle.read_control(
        rusb::request_type(
            rusb::Direction::In,
            rusb::RequestType::Class,
            rusb::Recipient::Endpoint,
        ),
        RequestType::InitiateAbortBulkOut as u8,
        u16::from(btag),
        endpoint.into(),
        &mut buf,
        timeout,
    )?;

    Ok(())
}

/// bTag sequence, 1 to 255 then wraps to 1
fn next_btag(btag: u8) -> u8 {
    btag % 255 + 1
}

/// helper function to create bulk headers
fn make_bulk_header(msgid: MsgId, btag: u8) -> [u8; HEADER_SIZE] {
    let mut header = [0u8; HEADER_SIZE];
    // table 1 in spec
    header[0] = msgid as u8;
    header[1] = btag;
    header[2] = !btag;
    header
}

/// DEV_DEP_MSG_OUT header and payload, padded to a multiple of 4 bytes
fn make_bulk_out_packet(btag: u8, data: &[u8], is_last: bool) -> Vec<u8> {
    let mut header = make_bulk_header(MsgId::DevDepMsgOut, btag);
    // table 3 in spec, size of the transfer without header and padding
    header[4..8].copy_from_slice(&(data.len() as u32).to_le_bytes());
    header[8] = u8::from(is_last);

    let pad_size = (4 - (data.len() % 4)) % 4;
    let mut packet = Vec::with_capacity(HEADER_SIZE + data.len() + pad_size);
    packet.extend_from_slice(&header);
    packet.extend_from_slice(data);
    packet.resize(HEADER_SIZE + data.len() + pad_size, 0);
    packet
}

/// REQUEST_DEV_DEP_MSG_IN header, table 4 in spec
fn make_request_header(btag: u8, transfer_size: u32, term_char: u8) -> [u8; HEADER_SIZE] {
    let mut header = make_bulk_header(MsgId::RequestDevDepMsgIn, btag);
    header[4..8].copy_from_slice(&transfer_size.to_le_bytes());
    if term_char != 0 {
        header[8] = 0x02;
        header[9] = term_char;
    }
    header
}

/// Validates a DEV_DEP_MSG_IN header, returns the transfer size and EOM
fn parse_response_header(buf: &[u8], btag: u8) -> Result<(usize, bool), Error> {
    if buf.len() < HEADER_SIZE
        || buf[0] != MsgId::RequestDevDepMsgIn as u8
        || buf[1] != btag
        || buf[2] != !btag
    {
        return Err(Error::InvalidResponse);
    }

    let transfer_size = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
    let eom = buf[8] & 0x01 != 0;

    Ok((transfer_size, eom))
}

impl<C: rusb::UsbContext> std::fmt::Debug for Instrument<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Instrument")
            .field("connected", &self.connected)
            .field("term_char", &self.term_char)
            .field("capabilities", &self.capabilities)
            .field("has_kernel_driver", &self.has_kernel_driver)
            .field("config_num", &self.config_num)
            .field("iface_num", &self.iface_num)
            .field("ep_interrupt_in", &self.ep_interrupt_in)
            .field("timeout", &self.timeout)
            .finish()
    }
}
