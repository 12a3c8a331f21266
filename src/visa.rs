//! VISA resource strings for USB instruments
//!
//! A resource string addresses an instrument as
//! `USB[board]::manufacturer::model[::serial]::[interface]::INSTR`, e.g.
//! `USB0::0x0957::0x1796::MY56310471::0::INSTR`. Only the `USB` interface
//! type and the `INSTR` resource class are supported.

use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Largest interface index accepted (10 bit)
const MAX_INTERFACE_INDEX: u64 = (1 << 10) - 1;

// tokens exclude ASCII whitespace only, other Unicode spaces are accepted
static RESOURCE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"^(?P<interface_type>[A-Za-z]+)(?P<board_index>[0-9]*)::",
        r"(?P<manufacturer_id>[^\t\n\x0C\r :]+)::",
        r"(?P<model_code>[^\t\n\x0C\r :]+)",
        r"(?:::(?P<serial_number>[^\t\n\x0C\r :]+))?",
        r"::(?P<interface_index>[0-9]*)",
        r"::(?P<resource_class>[^\t\n\x0C\r :]+)$",
    ))
    .expect("resource string grammar is a valid regex")
});

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("{0:?} is not a VISA resource string")]
    MalformedIdentifier(String),
    #[error("interface type {0:?} is not USB")]
    UnsupportedInterfaceType(String),
    #[error("resource class {0:?} is not INSTR")]
    UnsupportedResourceClass(String),
    #[error("invalid board index {0:?}")]
    InvalidBoardIndex(String),
    #[error("invalid manufacturer ID {0:?}")]
    InvalidManufacturerId(String),
    #[error("invalid model code {0:?}")]
    InvalidModelCode(String),
    #[error("invalid interface index {0:?}")]
    InvalidInterfaceIndex(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterfaceType {
    Usb,
}

impl InterfaceType {
    fn from_token(token: &str) -> Option<Self> {
        if token.eq_ignore_ascii_case("USB") {
            Some(InterfaceType::Usb)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InterfaceType::Usb => "USB",
        }
    }
}

impl fmt::Display for InterfaceType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceClass {
    Instr,
}

impl ResourceClass {
    fn from_token(token: &str) -> Option<Self> {
        if token.eq_ignore_ascii_case("INSTR") {
            Some(ResourceClass::Instr)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceClass::Instr => "INSTR",
        }
    }
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated VISA resource string
///
/// Fields that the resource string leaves out are `None` (or an empty serial
/// number). The original text is kept as given, the `Display` implementation
/// renders the normalized form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceIdentifier {
    resource_string: String,
    interface_type: InterfaceType,
    board_index: Option<u16>,
    manufacturer_id: Option<u16>,
    model_code: Option<u16>,
    serial_number: String,
    interface_index: Option<u16>,
    resource_class: ResourceClass,
}

/// Parse a VISA resource string
pub fn parse(resource: &str) -> Result<ResourceIdentifier, ParseError> {
    let caps = RESOURCE_RE
        .captures(resource)
        .ok_or_else(|| ParseError::MalformedIdentifier(resource.to_string()))?;

    // optional groups that did not participate are None, an empty match of
    // `[0-9]*` is treated the same way
    let field = |name: &str| caps.name(name).map(|m| m.as_str()).filter(|s| !s.is_empty());

    let interface_type_str = field("interface_type").unwrap_or_default();
    let interface_type = InterfaceType::from_token(interface_type_str)
        .ok_or_else(|| ParseError::UnsupportedInterfaceType(interface_type_str.to_string()))?;

    let board_index = field("board_index")
        .map(|s| parse_u16(s).ok_or_else(|| ParseError::InvalidBoardIndex(s.to_string())))
        .transpose()?;

    let manufacturer_id = field("manufacturer_id")
        .map(|s| parse_u16(s).ok_or_else(|| ParseError::InvalidManufacturerId(s.to_string())))
        .transpose()?;

    let model_code = field("model_code")
        .map(|s| parse_u16(s).ok_or_else(|| ParseError::InvalidModelCode(s.to_string())))
        .transpose()?;

    let serial_number = field("serial_number").unwrap_or_default().to_string();

    let interface_index = field("interface_index")
        .map(|s| {
            parse_radix(s, 10)
                .filter(|&n| n <= MAX_INTERFACE_INDEX)
                .map(|n| n as u16)
                .ok_or_else(|| ParseError::InvalidInterfaceIndex(s.to_string()))
        })
        .transpose()?;

    let resource_class_str = field("resource_class").unwrap_or_default();
    let resource_class = ResourceClass::from_token(resource_class_str)
        .ok_or_else(|| ParseError::UnsupportedResourceClass(resource_class_str.to_string()))?;

    Ok(ResourceIdentifier {
        resource_string: resource.to_string(),
        interface_type,
        board_index,
        manufacturer_id,
        model_code,
        serial_number,
        interface_index,
        resource_class,
    })
}

/// Unsigned 16 bit number with an optional `0x`, `0o` or `0b` base prefix
fn parse_u16(text: &str) -> Option<u16> {
    let (digits, radix) = match text.get(..2) {
        Some("0x") | Some("0X") => (&text[2..], 16),
        Some("0o") | Some("0O") => (&text[2..], 8),
        Some("0b") | Some("0B") => (&text[2..], 2),
        _ => (text, 10),
    };

    parse_radix(digits, radix).and_then(|n| u16::try_from(n).ok())
}

fn parse_radix(digits: &str, radix: u32) -> Option<u64> {
    // from_str_radix accepts a leading '+'
    if digits.is_empty() || !digits.chars().all(|c| c.is_digit(radix)) {
        return None;
    }
    u64::from_str_radix(digits, radix).ok()
}

impl ResourceIdentifier {
    /// Resource string of the USBTMC interface `interface_number` of a device,
    /// as reported by discovery
    pub fn usb_instr(
        vendor_id: u16,
        product_id: u16,
        serial_number: &str,
        interface_number: u8,
    ) -> Self {
        let mut id = ResourceIdentifier {
            resource_string: String::new(),
            interface_type: InterfaceType::Usb,
            board_index: Some(0),
            manufacturer_id: Some(vendor_id),
            model_code: Some(product_id),
            serial_number: serial_number.to_string(),
            interface_index: Some(u16::from(interface_number)),
            resource_class: ResourceClass::Instr,
        };
        id.resource_string = id.to_string();
        id
    }

    /// The text this identifier was parsed from
    pub fn resource_string(&self) -> &str {
        &self.resource_string
    }

    pub fn interface_type(&self) -> InterfaceType {
        self.interface_type
    }

    pub fn board_index(&self) -> Option<u16> {
        self.board_index
    }

    /// USB idVendor
    pub fn manufacturer_id(&self) -> Option<u16> {
        self.manufacturer_id
    }

    /// USB idProduct
    pub fn model_code(&self) -> Option<u16> {
        self.model_code
    }

    /// Serial number, empty when not given
    pub fn serial_number(&self) -> &str {
        &self.serial_number
    }

    /// USB bInterfaceNumber
    pub fn interface_index(&self) -> Option<u16> {
        self.interface_index
    }

    pub fn resource_class(&self) -> ResourceClass {
        self.resource_class
    }
}

impl FromStr for ResourceIdentifier {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse(s)
    }
}

impl fmt::Display for ResourceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.interface_type)?;
        if let Some(board) = self.board_index {
            write!(f, "{}", board)?;
        }

        for id in [self.manufacturer_id, self.model_code] {
            match id {
                Some(id) => write!(f, "::0x{:04x}", id)?,
                None => f.write_str("::")?,
            }
        }

        if !self.serial_number.is_empty() {
            write!(f, "::{}", self.serial_number)?;
        }

        f.write_str("::")?;
        if let Some(iface) = self.interface_index {
            write!(f, "{}", iface)?;
        }

        write!(f, "::{}", self.resource_class)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parse_full_resource() {
        let id = parse("USB0::0x1234::0x5678::A12345::0::INSTR").unwrap();
        assert_eq!(id.interface_type(), InterfaceType::Usb);
        assert_eq!(id.board_index(), Some(0));
        assert_eq!(id.manufacturer_id(), Some(0x1234));
        assert_eq!(id.model_code(), Some(0x5678));
        assert_eq!(id.serial_number(), "A12345");
        assert_eq!(id.interface_index(), Some(0));
        assert_eq!(id.resource_class(), ResourceClass::Instr);
        assert_eq!(id.resource_string(), "USB0::0x1234::0x5678::A12345::0::INSTR");
    }

    #[test]
    fn parse_without_serial() {
        let id = parse("USB::0x1234::0x5678::0::INSTR").unwrap();
        assert_eq!(id.board_index(), None);
        assert_eq!(id.manufacturer_id(), Some(0x1234));
        assert_eq!(id.model_code(), Some(0x5678));
        assert_eq!(id.serial_number(), "");
        assert_eq!(id.interface_index(), Some(0));
    }

    #[test]
    fn serial_is_optional_for_any_field_values() {
        let with = parse("USB0::0x0957::0x1796::MY56310471::3::INSTR").unwrap();
        let without = parse("USB0::0x0957::0x1796::3::INSTR").unwrap();
        assert_eq!(without.serial_number(), "");
        assert_eq!(with.board_index(), without.board_index());
        assert_eq!(with.manufacturer_id(), without.manufacturer_id());
        assert_eq!(with.model_code(), without.model_code());
        assert_eq!(with.interface_index(), without.interface_index());
    }

    #[test]
    fn empty_interface_index() {
        let id = parse("USB0::0x1234::0x5678::A12345::::INSTR").unwrap();
        assert_eq!(id.serial_number(), "A12345");
        assert_eq!(id.interface_index(), None);
    }

    #[test]
    fn literals_are_case_insensitive() {
        let id = parse("usb1::0x1234::0x5678::abc::2::instr").unwrap();
        assert_eq!(id.interface_type(), InterfaceType::Usb);
        assert_eq!(id.resource_class(), ResourceClass::Instr);
        assert_eq!(id.board_index(), Some(1));
        // serial numbers are kept verbatim
        assert_eq!(id.serial_number(), "abc");
        assert_eq!(id.to_string(), "USB1::0x1234::0x5678::abc::2::INSTR");
    }

    #[test]
    fn reject_other_interface_types() {
        for resource in [
            "GPIB0::0x1234::0x5678::A12345::0::INSTR",
            "TCPIP::0x1234::0x5678::0::INSTR",
            "usbx0::0x1234::0x5678::0::INSTR",
        ] {
            assert!(
                matches!(parse(resource), Err(ParseError::UnsupportedInterfaceType(_))),
                "{}",
                resource
            );
        }
    }

    #[test]
    fn reject_other_resource_classes() {
        for resource in [
            "USB0::0x1234::0x5678::A12345::0::SOCKET",
            "USB0::0x1234::0x5678::0::RAW",
            "USB0::0x1234::0x5678::0::INSTRUMENT",
        ] {
            assert!(
                matches!(parse(resource), Err(ParseError::UnsupportedResourceClass(_))),
                "{}",
                resource
            );
        }
    }

    #[test]
    fn reject_malformed() {
        for resource in [
            "",
            "USB0",
            "USB0::0x1234::INSTR",
            "0::0x1234::0x5678::0::INSTR",
            "USB0::0x1234::0x5678::A 12::0::INSTR",
            "USB0::0x1234::0x5678::A12345::0::INSTR ",
            "USB0::0x1234::0x5678::A12345::x::INSTR",
        ] {
            assert!(
                matches!(parse(resource), Err(ParseError::MalformedIdentifier(_))),
                "{:?}",
                resource
            );
        }
    }

    #[test]
    fn invalid_numbers() {
        assert_eq!(
            parse("USB0::0xZZZZ::0x5678::0::INSTR"),
            Err(ParseError::InvalidManufacturerId("0xZZZZ".into()))
        );
        assert_eq!(
            parse("USB0::0x1234::+5678::0::INSTR"),
            Err(ParseError::InvalidModelCode("+5678".into()))
        );
        // does not fit 16 bits
        assert_eq!(
            parse("USB0::0x10000::0x5678::0::INSTR"),
            Err(ParseError::InvalidManufacturerId("0x10000".into()))
        );
        assert_eq!(
            parse("USB70000::0x1234::0x5678::0::INSTR"),
            Err(ParseError::InvalidBoardIndex("70000".into()))
        );
        assert_eq!(
            parse("USB0::0x1234::0x5678::1024::INSTR"),
            Err(ParseError::InvalidInterfaceIndex("1024".into()))
        );
        let id = parse("USB0::0x1234::0x5678::1023::INSTR").unwrap();
        assert_eq!(id.interface_index(), Some(1023));
    }

    #[test]
    fn only_ascii_whitespace_splits_tokens() {
        let id = parse("USB0::0x1234::0x5678::A\u{a0}B::0::INSTR").unwrap();
        assert_eq!(id.serial_number(), "A\u{a0}B");

        for resource in [
            "USB0::0x1234::0x5678::A\tB::0::INSTR",
            "USB0::0x1234::0x5678::A\rB::0::INSTR",
            "USB0::0x1234::0x5678::A\x0CB::0::INSTR",
            "USB0::0x1234::0x5678::A12345::0::INSTR\n",
        ] {
            assert!(
                matches!(parse(resource), Err(ParseError::MalformedIdentifier(_))),
                "{:?}",
                resource
            );
        }
    }

    #[test]
    fn numeric_bases() {
        let hex = parse("USB0::0x1234::0X5678::0::INSTR").unwrap();
        let dec = parse("USB0::4660::22136::0::INSTR").unwrap();
        assert_eq!(hex.manufacturer_id(), dec.manufacturer_id());
        assert_eq!(hex.model_code(), dec.model_code());

        let other = parse("USB0::0b1001000110100::0o53170::0::INSTR").unwrap();
        assert_eq!(other.manufacturer_id(), Some(0x1234));
        assert_eq!(other.model_code(), Some(0x5678));
    }

    #[test]
    fn render_is_normalized() {
        for resource in [
            "USB0::0x1234::0x5678::A12345::0::INSTR",
            "USB::0x1234::0x5678::0::INSTR",
            "USB2::0x0957::0x1796::MY56310471::12::INSTR",
            "USB0::0x0957::0x1796::MY56310471::::INSTR",
        ] {
            let id: ResourceIdentifier = resource.parse().unwrap();
            assert_eq!(id.to_string(), resource);

            let again: ResourceIdentifier = id.to_string().parse().unwrap();
            assert_eq!(again.to_string(), id.to_string());
        }

        let id = parse("usb0::4660::22136::sn::0::Instr").unwrap();
        assert_eq!(id.to_string(), "USB0::0x1234::0x5678::sn::0::INSTR");
    }

    #[test]
    fn usb_instr_roundtrip() {
        let id = ResourceIdentifier::usb_instr(0x0957, 0x1796, "MY56310471", 0);
        assert_eq!(id.resource_string(), "USB0::0x0957::0x1796::MY56310471::0::INSTR");
        assert_eq!(parse(id.resource_string()).unwrap(), id);
    }

    fn resource_text(
        board: Option<u16>,
        vid: u16,
        pid: u16,
        serial: &str,
        iface: Option<u16>,
    ) -> String {
        let mut text = String::from("USB");
        if let Some(board) = board {
            text.push_str(&board.to_string());
        }
        text.push_str(&format!("::0x{:04x}::0x{:04x}", vid, pid));
        if !serial.is_empty() {
            text.push_str(&format!("::{}", serial));
        }
        text.push_str("::");
        if let Some(iface) = iface {
            text.push_str(&iface.to_string());
        }
        text.push_str("::INSTR");
        text
    }

    proptest! {
        #[test]
        fn render_parse_render_is_stable(
            board in proptest::option::of(any::<u16>()),
            vid in any::<u16>(),
            pid in any::<u16>(),
            serial in "[A-Za-z0-9_.-]{0,16}",
            iface in proptest::option::of(0u16..=1023),
        ) {
            let text = resource_text(board, vid, pid, &serial, iface);
            let id = parse(&text).unwrap();

            prop_assert_eq!(id.board_index(), board);
            prop_assert_eq!(id.manufacturer_id(), Some(vid));
            prop_assert_eq!(id.model_code(), Some(pid));
            prop_assert_eq!(id.serial_number(), serial.as_str());
            prop_assert_eq!(id.interface_index(), iface);
            prop_assert_eq!(id.to_string(), text.clone());

            let again = parse(&id.to_string()).unwrap();
            prop_assert_eq!(again.to_string(), text);
        }

        #[test]
        fn missing_serial_keeps_other_fields(
            board in proptest::option::of(any::<u16>()),
            vid in any::<u16>(),
            pid in any::<u16>(),
            serial in "[A-Za-z0-9]{1,16}",
            iface in 0u16..=1023,
        ) {
            let with = parse(&resource_text(board, vid, pid, &serial, Some(iface))).unwrap();
            let without = parse(&resource_text(board, vid, pid, "", Some(iface))).unwrap();

            prop_assert_eq!(without.serial_number(), "");
            prop_assert_eq!(with.board_index(), without.board_index());
            prop_assert_eq!(with.manufacturer_id(), without.manufacturer_id());
            prop_assert_eq!(with.model_code(), without.model_code());
            prop_assert_eq!(with.interface_index(), without.interface_index());
        }

        #[test]
        fn other_interface_types_rejected(
            interface_type in "[A-Za-z]{1,8}"
                .prop_filter("USB is accepted", |t| !t.eq_ignore_ascii_case("usb")),
        ) {
            let text = format!("{}0::0x1234::0x5678::0::INSTR", interface_type);
            prop_assert_eq!(
                parse(&text),
                Err(ParseError::UnsupportedInterfaceType(interface_type))
            );
        }

        #[test]
        fn other_resource_classes_rejected(
            class in "[A-Za-z0-9_]{1,12}"
                .prop_filter("INSTR is accepted", |c| !c.eq_ignore_ascii_case("instr")),
        ) {
            let text = format!("USB0::0x1234::0x5678::A12345::0::{}", class);
            prop_assert_eq!(parse(&text), Err(ParseError::UnsupportedResourceClass(class)));
        }

        #[test]
        fn hex_and_decimal_agree(n in any::<u16>()) {
            let dec = parse(&format!("USB0::{}::{}::0::INSTR", n, n)).unwrap();
            let hex = parse(&format!("USB0::0x{:x}::0X{:X}::0::INSTR", n, n)).unwrap();

            prop_assert_eq!(dec.manufacturer_id(), Some(n));
            prop_assert_eq!(dec.manufacturer_id(), hex.manufacturer_id());
            prop_assert_eq!(dec.model_code(), hex.model_code());
        }
    }
}
