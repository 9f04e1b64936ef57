//! APRS payload decoding
//!
//! Interprets the information field of an AX.25 UI frame as one of the APRS
//! data types, dispatching on the first byte. Each decoded numeric records
//! its unit in the field name (°F, knots, mph, mbar, inches, feet).
//!
//! - [APRS 1.01 specification](http://www.aprs.org/doc/APRS101.PDF)

pub mod device;
pub mod grid;
pub mod message;
pub mod mice;
pub mod position;
pub mod telemetry;
pub mod weather;

use serde::Serialize;

use crate::{
    aprs::{
        message::MessagePayload,
        position::PositionReport,
        telemetry::TelemetryReport,
        weather::WeatherReport,
    },
    ax25::Callsign,
};

#[derive(Debug, thiserror::Error)]
pub enum AprsError {
    #[error("empty information field")]
    Empty,
    #[error("{0} payload truncated")]
    Truncated(&'static str),
    #[error("malformed {0} payload")]
    Malformed(&'static str),
    #[error("position out of range: {latitude}, {longitude}")]
    OutOfRange { latitude: f64, longitude: f64 },
    #[error("null island position rejected")]
    NullIsland,
    #[error("unknown data type {0:?}")]
    UnknownType(char),
}

/// A validated position. (0, 0) is rejected as synthetic.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct LatLon {
    pub latitude: f64,
    pub longitude: f64,
}

impl LatLon {
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, AprsError> {
        if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
            return Err(AprsError::OutOfRange {
                latitude,
                longitude,
            });
        }
        if latitude == 0.0 && longitude == 0.0 {
            return Err(AprsError::NullIsland);
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }

    pub fn grid_square(&self) -> String {
        grid::latlon_to_maidenhead(self.latitude, self.longitude)
    }
}

/// Symbol table byte plus symbol code byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Symbol {
    pub table: char,
    pub code: char,
}

impl Default for Symbol {
    fn default() -> Self {
        Self {
            table: '/',
            code: '>',
        }
    }
}

/// APRS wall-clock timestamps, as found in `/` and `@` position reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum AprsTimestamp {
    /// `DDHHMMz` (UTC) or `DDHHMM/` (station local time)
    DayHoursMinutes { day: u8, hour: u8, minute: u8, utc: bool },
    /// `HHMMSSh`
    HoursMinutesSeconds { hour: u8, minute: u8, second: u8 },
}

/// An object (`;`) or item (`)`) report. The position is recorded under the
/// object name rather than the transmitting station.
#[derive(Clone, Debug, PartialEq)]
pub struct NamedReport {
    pub name: String,
    pub alive: bool,
    pub report: PositionReport,
}

/// A status report (`>`), with a leading Maidenhead locator split out when
/// one is embedded.
#[derive(Clone, Debug, PartialEq)]
pub struct StatusReport {
    pub text: String,
    pub grid: Option<String>,
}

/// Decoded APRS payload.
#[derive(Clone, Debug, PartialEq)]
pub enum AprsPayload {
    Position(PositionReport),
    Object(NamedReport),
    Item(NamedReport),
    Message(MessagePayload),
    Status(StatusReport),
    Weather(WeatherReport),
    Telemetry(TelemetryReport),
    /// `}` third-party encapsulation; the inner packet is decoded
    /// recursively. Never forwarded back to RF, never counted as direct RF.
    ThirdParty {
        source: Callsign,
        payload: Box<AprsPayload>,
    },
    Unknown {
        data_type: char,
    },
}

/// Decode a UI information field. The destination callsign is needed for
/// MIC-E (latitude lives in the address) and for device identification.
pub fn decode(info: &[u8], destination: &Callsign) -> Result<AprsPayload, AprsError> {
    let first = *info.first().ok_or(AprsError::Empty)?;
    match first {
        b'!' | b'=' | b'/' | b'@' => position::decode(info, destination).map(AprsPayload::Position),
        b'`' | b'\'' | 0x1c..=0x1f => mice::decode(info, destination).map(AprsPayload::Position),
        b':' => message::decode(info).map(AprsPayload::Message),
        b'_' => weather::decode_report(info).map(AprsPayload::Weather),
        b'>' => Ok(AprsPayload::Status(decode_status(info))),
        b';' => position::decode_object(info).map(AprsPayload::Object),
        b')' => position::decode_item(info).map(AprsPayload::Item),
        b'T' if info.starts_with(b"T#") => telemetry::decode(info).map(AprsPayload::Telemetry),
        b'}' => decode_third_party(info),
        other => {
            Ok(AprsPayload::Unknown {
                data_type: other as char,
            })
        }
    }
}

fn decode_status(info: &[u8]) -> StatusReport {
    let text = String::from_utf8_lossy(&info[1..]).trim().to_owned();
    let grid = extract_leading_grid(&text);
    StatusReport { text, grid }
}

/// Status payloads may begin with a 4- or 6-character locator followed by a
/// symbol pair, e.g. `>IO91SX/- via satellite`.
fn extract_leading_grid(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    for len in [6usize, 4] {
        if bytes.len() < len {
            continue;
        }
        let candidate = &bytes[..len];
        let fields_ok = candidate[0].is_ascii_alphabetic()
            && candidate[0].to_ascii_uppercase() <= b'R'
            && candidate[1].is_ascii_alphabetic()
            && candidate[1].to_ascii_uppercase() <= b'R'
            && candidate[2].is_ascii_digit()
            && candidate[3].is_ascii_digit();
        let subsquare_ok = len == 4
            || (candidate[4].is_ascii_alphabetic()
                && candidate[4].to_ascii_uppercase() <= b'X'
                && candidate[5].is_ascii_alphabetic()
                && candidate[5].to_ascii_uppercase() <= b'X');
        let boundary_ok = match bytes.get(len) {
            None => true,
            Some(&b) => b == b' ' || b == b'/' || b == b'\\',
        };
        if fields_ok && subsquare_ok && boundary_ok {
            return Some(text[..len].to_uppercase());
        }
    }
    None
}

/// `}SRC>DST,PATH:inner` — strip the tunnel header and decode the inner
/// payload against the tunneled destination.
fn decode_third_party(info: &[u8]) -> Result<AprsPayload, AprsError> {
    let inner = &info[1..];
    let text = std::str::from_utf8(inner).map_err(|_| AprsError::Malformed("third-party"))?;

    let (header, inner_info) = text
        .split_once(':')
        .ok_or(AprsError::Malformed("third-party"))?;
    let (source, rest) = header
        .split_once('>')
        .ok_or(AprsError::Malformed("third-party"))?;
    let source: Callsign = source
        .parse()
        .map_err(|_| AprsError::Malformed("third-party"))?;
    let destination: Callsign = rest
        .split(',')
        .next()
        .unwrap_or_default()
        .parse()
        .unwrap_or_else(|_| Callsign::new("APRS", 0).expect("static callsign"));

    let payload = decode(inner_info.as_bytes(), &destination)?;
    Ok(AprsPayload::ThirdParty {
        source,
        payload: Box::new(payload),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(s: &str) -> Callsign {
        s.parse().unwrap()
    }

    #[test]
    fn latlon_validation() {
        assert!(LatLon::new(42.6, -71.1).is_ok());
        assert!(matches!(
            LatLon::new(0.0, 0.0),
            Err(AprsError::NullIsland)
        ));
        assert!(matches!(
            LatLon::new(91.0, 0.0),
            Err(AprsError::OutOfRange { .. })
        ));
        assert!(matches!(
            LatLon::new(0.0, -181.0),
            Err(AprsError::OutOfRange { .. })
        ));
    }

    #[test]
    fn dispatch_status_with_grid() {
        let payload = decode(b">FN42ir/- QRV 146.52", &call("APRS")).unwrap();
        match payload {
            AprsPayload::Status(status) => {
                assert_eq!(status.grid.as_deref(), Some("FN42IR"));
                assert!(status.text.ends_with("146.52"));
            }
            other => panic!("expected status, got {other:?}"),
        }
    }

    #[test]
    fn status_without_grid() {
        let payload = decode(b">on the air", &call("APRS")).unwrap();
        match payload {
            AprsPayload::Status(status) => assert_eq!(status.grid, None),
            other => panic!("expected status, got {other:?}"),
        }
    }

    #[test]
    fn third_party_decodes_inner() {
        let payload = decode(
            b"}W1XYZ-9>APRS,TCPIP,K1IGW*::K1FSY-9  :hello{00001",
            &call("APRS"),
        )
        .unwrap();
        match payload {
            AprsPayload::ThirdParty { source, payload } => {
                assert_eq!(source.to_string(), "W1XYZ-9");
                assert!(matches!(*payload, AprsPayload::Message(_)));
            }
            other => panic!("expected third-party, got {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_not_an_error() {
        let payload = decode(b"?APRS?", &call("APRS")).unwrap();
        assert!(matches!(payload, AprsPayload::Unknown { data_type: '?' }));
    }
}
