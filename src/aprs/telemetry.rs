//! APRS telemetry (`T#SSS,A1,A2,A3,A4,A5,BBBBBBBB`).

use serde::{
    Deserialize,
    Serialize,
};

use crate::aprs::AprsError;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryReport {
    /// Sequence counter 000–999.
    pub sequence: u16,
    /// Five analog channels, 0–255 each.
    pub analog: [u16; 5],
    /// Eight binary channels, bit 0 first on the wire.
    pub digital: [bool; 8],
}

pub(super) fn decode(info: &[u8]) -> Result<TelemetryReport, AprsError> {
    let text = std::str::from_utf8(&info[2..]).map_err(|_| AprsError::Malformed("telemetry"))?;
    let mut parts = text.trim().split(',');

    let sequence: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .filter(|v| *v <= 999)
        .ok_or(AprsError::Malformed("telemetry"))?;

    let mut analog = [0u16; 5];
    for slot in &mut analog {
        *slot = parts
            .next()
            .and_then(|s| s.trim().parse().ok())
            .filter(|v| *v <= 255)
            .ok_or(AprsError::Malformed("telemetry"))?;
    }

    let bits = parts.next().ok_or(AprsError::Malformed("telemetry"))?.trim();
    if bits.len() != 8 || parts.next().is_some() {
        return Err(AprsError::Malformed("telemetry"));
    }
    let mut digital = [false; 8];
    for (slot, ch) in digital.iter_mut().zip(bits.chars()) {
        *slot = match ch {
            '0' => false,
            '1' => true,
            _ => return Err(AprsError::Malformed("telemetry")),
        };
    }

    Ok(TelemetryReport {
        sequence,
        analog,
        digital,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_packet() {
        let report = decode(b"T#005,199,000,255,073,123,01101001").unwrap();
        assert_eq!(report.sequence, 5);
        assert_eq!(report.analog, [199, 0, 255, 73, 123]);
        assert_eq!(
            report.digital,
            [false, true, true, false, true, false, false, true]
        );
    }

    #[test]
    fn rejects_out_of_range() {
        assert!(decode(b"T#1000,0,0,0,0,0,00000000").is_err());
        assert!(decode(b"T#005,256,0,0,0,0,00000000").is_err());
        assert!(decode(b"T#005,0,0,0,0,0,0000000").is_err());
        assert!(decode(b"T#005,0,0,0,0,0,0000000x").is_err());
        assert!(decode(b"T#005,0,0,0,0,00000000").is_err());
    }
}
