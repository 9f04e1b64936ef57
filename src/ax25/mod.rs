//! AX.25 frame codec
//!
//! Parses and constructs AX.25 UI/I/S/U frames as carried inside KISS data
//! frames (no FCS; the TNC owns the checksum). The codec is byte-exact: a
//! parsed frame re-encodes to the identical byte sequence, including the C/R
//! bit and the two reserved bits of every address SSID octet.
//!
//! - [AX.25 v2.2 specification](https://www.tapr.org/pdf/AX25.2.2.pdf)

pub mod connection;

use std::fmt;
use std::str::FromStr;

use bytes::{
    BufMut,
    Bytes,
    BytesMut,
};
use serde::{
    Deserialize,
    Serialize,
};

/// PID for "no layer 3", the value APRS uses.
pub const PID_NO_LAYER3: u8 = 0xf0;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("frame truncated at offset {0}")]
    Truncated(usize),
    #[error("address field does not terminate")]
    UnterminatedAddressField,
    #[error("fewer than two addresses")]
    MissingAddresses,
    #[error("invalid callsign: {0:?}")]
    InvalidCallsign(String),
}

/// A callsign: 1–6 uppercase alphanumerics plus an SSID 0–15.
///
/// The lexical form omits a zero SSID (`N0CALL`, `N0CALL-5`).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Callsign {
    base: String,
    ssid: u8,
}

impl Callsign {
    pub fn new(base: &str, ssid: u8) -> Result<Self, DecodeError> {
        let base = base.trim().to_ascii_uppercase();
        if base.is_empty()
            || base.len() > 6
            || !base.bytes().all(|b| b.is_ascii_alphanumeric())
            || ssid > 15
        {
            return Err(DecodeError::InvalidCallsign(format!("{base}-{ssid}")));
        }
        Ok(Self { base, ssid })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn ssid(&self) -> u8 {
        self.ssid
    }

    /// SSID-agnostic comparison: `K1FSY` and `K1FSY-7` share a base.
    pub fn same_base(&self, other: &Callsign) -> bool {
        self.base == other.base
    }
}

impl fmt::Display for Callsign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ssid == 0 {
            write!(f, "{}", self.base)
        }
        else {
            write!(f, "{}-{}", self.base, self.ssid)
        }
    }
}

impl fmt::Debug for Callsign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl FromStr for Callsign {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().trim_end_matches('*');
        match s.split_once('-') {
            Some((base, ssid)) => {
                let ssid = ssid
                    .parse()
                    .map_err(|_| DecodeError::InvalidCallsign(s.to_owned()))?;
                Self::new(base, ssid)
            }
            None => Self::new(s, 0),
        }
    }
}

impl TryFrom<String> for Callsign {
    type Error = DecodeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Callsign> for String {
    fn from(value: Callsign) -> Self {
        value.to_string()
    }
}

/// One 7-byte address field.
///
/// `top_bits` preserves bits 5–7 of the SSID octet verbatim: the two reserved
/// bits and the C bit (destination/source) or H bit (digipeater).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Address {
    pub callsign: Callsign,
    top_bits: u8,
}

impl Address {
    /// Plain address with the reserved bits set (the customary idle value).
    pub fn new(callsign: Callsign) -> Self {
        Self {
            callsign,
            top_bits: 0x60,
        }
    }

    /// The C bit (destination/source addresses) or H "has-been-repeated" bit
    /// (digipeater addresses). Both live in bit 7.
    pub fn top_bit(&self) -> bool {
        self.top_bits & 0x80 != 0
    }

    pub fn with_top_bit(mut self, set: bool) -> Self {
        if set {
            self.top_bits |= 0x80;
        }
        else {
            self.top_bits &= !0x80;
        }
        self
    }

    /// For digipeater entries: has this digi already repeated the frame?
    pub fn repeated(&self) -> bool {
        self.top_bit()
    }

    fn decode(bytes: &[u8; 7]) -> Result<(Self, bool), DecodeError> {
        let mut base = String::with_capacity(6);
        for &b in &bytes[..6] {
            let c = (b >> 1) as char;
            if c != ' ' {
                base.push(c);
            }
        }
        let ssid_byte = bytes[6];
        let callsign = Callsign {
            base,
            ssid: (ssid_byte >> 1) & 0x0f,
        };
        let address = Self {
            callsign,
            top_bits: ssid_byte & 0xe0,
        };
        Ok((address, ssid_byte & 0x01 != 0))
    }

    fn encode<B: BufMut>(&self, buffer: &mut B, is_last: bool) {
        let mut field = [b' '; 6];
        for (slot, byte) in field.iter_mut().zip(self.callsign.base.bytes()) {
            *slot = byte;
        }
        for byte in field {
            buffer.put_u8(byte << 1);
        }
        let mut ssid_byte = self.top_bits | ((self.callsign.ssid & 0x0f) << 1);
        if is_last {
            ssid_byte |= 0x01;
        }
        buffer.put_u8(ssid_byte);
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.callsign)?;
        if self.top_bit() {
            write!(f, "*")?;
        }
        Ok(())
    }
}

/// Supervisory frame subtypes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Supervisory {
    ReceiveReady,
    ReceiveNotReady,
    Reject,
    SelectiveReject,
}

/// Unnumbered frame subtypes. `Other` carries unrecognized control bytes
/// verbatim so they survive re-encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Unnumbered {
    Sabm,
    Disconnect,
    DisconnectedMode,
    UnnumberedAck,
    FrameReject,
    Other(u8),
}

/// Decoded control byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Control {
    Information { ns: u8, nr: u8, poll: bool },
    Supervisory { kind: Supervisory, nr: u8, poll: bool },
    UnnumberedInformation { poll: bool },
    Unnumbered { kind: Unnumbered, poll: bool },
}

impl Control {
    pub fn decode(byte: u8) -> Self {
        let poll = byte & 0x10 != 0;
        if byte & 0x01 == 0 {
            Self::Information {
                ns: (byte >> 1) & 0x07,
                nr: (byte >> 5) & 0x07,
                poll,
            }
        }
        else if byte & 0x03 == 0x01 {
            let kind = match (byte >> 2) & 0x03 {
                0 => Supervisory::ReceiveReady,
                1 => Supervisory::ReceiveNotReady,
                2 => Supervisory::Reject,
                _ => Supervisory::SelectiveReject,
            };
            Self::Supervisory {
                kind,
                nr: (byte >> 5) & 0x07,
                poll,
            }
        }
        else {
            match byte & !0x10 {
                0x03 => Self::UnnumberedInformation { poll },
                0x2f => {
                    Self::Unnumbered {
                        kind: Unnumbered::Sabm,
                        poll,
                    }
                }
                0x43 => {
                    Self::Unnumbered {
                        kind: Unnumbered::Disconnect,
                        poll,
                    }
                }
                0x0f => {
                    Self::Unnumbered {
                        kind: Unnumbered::DisconnectedMode,
                        poll,
                    }
                }
                0x63 => {
                    Self::Unnumbered {
                        kind: Unnumbered::UnnumberedAck,
                        poll,
                    }
                }
                0x87 => {
                    Self::Unnumbered {
                        kind: Unnumbered::FrameReject,
                        poll,
                    }
                }
                other => {
                    Self::Unnumbered {
                        kind: Unnumbered::Other(other),
                        poll,
                    }
                }
            }
        }
    }

    pub fn encode(&self) -> u8 {
        match *self {
            Self::Information { ns, nr, poll } => {
                ((nr & 0x07) << 5) | (u8::from(poll) << 4) | ((ns & 0x07) << 1)
            }
            Self::Supervisory { kind, nr, poll } => {
                let type_bits = match kind {
                    Supervisory::ReceiveReady => 0,
                    Supervisory::ReceiveNotReady => 1,
                    Supervisory::Reject => 2,
                    Supervisory::SelectiveReject => 3,
                };
                0x01 | (type_bits << 2) | (u8::from(poll) << 4) | ((nr & 0x07) << 5)
            }
            Self::UnnumberedInformation { poll } => 0x03 | (u8::from(poll) << 4),
            Self::Unnumbered { kind, poll } => {
                let base = match kind {
                    Unnumbered::Sabm => 0x2f,
                    Unnumbered::Disconnect => 0x43,
                    Unnumbered::DisconnectedMode => 0x0f,
                    Unnumbered::UnnumberedAck => 0x63,
                    Unnumbered::FrameReject => 0x87,
                    Unnumbered::Other(other) => other,
                };
                base | (u8::from(poll) << 4)
            }
        }
    }

    /// Frames that carry a PID byte after the control byte.
    pub fn has_pid(&self) -> bool {
        matches!(
            self,
            Self::Information { .. } | Self::UnnumberedInformation { .. }
        )
    }
}

/// A complete AX.25 frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub destination: Address,
    pub source: Address,
    pub path: Vec<Address>,
    pub control: Control,
    pub pid: Option<u8>,
    pub info: Bytes,
}

impl Frame {
    /// Build a UI frame with the customary address bits (command frame,
    /// reserved bits set) and PID F0.
    pub fn ui(source: Callsign, destination: Callsign, path: Vec<Address>, info: Bytes) -> Self {
        Self {
            destination: Address::new(destination).with_top_bit(true),
            source: Address::new(source),
            path,
            control: Control::UnnumberedInformation { poll: false },
            pid: Some(PID_NO_LAYER3),
            info,
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self, DecodeError> {
        let mut offset = 0;
        let mut addresses = Vec::new();
        loop {
            let field: &[u8; 7] = data
                .get(offset..offset + 7)
                .and_then(|s| s.try_into().ok())
                .ok_or(DecodeError::Truncated(offset))?;
            let (address, is_last) = Address::decode(field)?;
            addresses.push(address);
            offset += 7;
            if is_last {
                break;
            }
            if addresses.len() >= 10 {
                return Err(DecodeError::UnterminatedAddressField);
            }
        }
        if addresses.len() < 2 {
            return Err(DecodeError::MissingAddresses);
        }

        let control_byte = *data.get(offset).ok_or(DecodeError::Truncated(offset))?;
        offset += 1;
        let control = Control::decode(control_byte);

        let pid = if control.has_pid() {
            let byte = *data.get(offset).ok_or(DecodeError::Truncated(offset))?;
            offset += 1;
            Some(byte)
        }
        else {
            None
        };

        let mut addresses = addresses.into_iter();
        let destination = addresses.next().unwrap();
        let source = addresses.next().unwrap();

        Ok(Self {
            destination,
            source,
            path: addresses.collect(),
            control,
            pid,
            info: Bytes::copy_from_slice(&data[offset..]),
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(16 + self.path.len() * 7 + self.info.len() + 2);
        self.destination.encode(&mut out, false);
        self.source.encode(&mut out, self.path.is_empty());
        for (index, digi) in self.path.iter().enumerate() {
            digi.encode(&mut out, index == self.path.len() - 1);
        }
        out.put_u8(self.control.encode());
        if let Some(pid) = self.pid {
            out.put_u8(pid);
        }
        out.put_slice(&self.info);
        out.freeze()
    }

    pub fn is_ui(&self) -> bool {
        matches!(self.control, Control::UnnumberedInformation { .. })
    }

    /// Number of path entries already marked repeated.
    pub fn hop_count(&self) -> usize {
        self.path.iter().filter(|digi| digi.repeated()).count()
    }

    /// The `SRC>DST,PATH` header in TNC-2 monitor notation.
    pub fn header_string(&self) -> String {
        let mut out = format!("{}>{}", self.source.callsign, self.destination.callsign);
        for digi in &self.path {
            out.push(',');
            out.push_str(&digi.to_string());
        }
        out
    }
}
