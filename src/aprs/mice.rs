//! MIC-E compressed position decoding.
//!
//! MIC-E splits the position across the frame: the destination callsign
//! carries the latitude digits, the N/S and E/W flags, the +100° longitude
//! offset and a 3-bit message code, while the information field carries the
//! longitude, speed, course, symbol, and an optional altitude plus free text
//! with a device-identifier suffix.

use crate::{
    aprs::{
        AprsError,
        LatLon,
        Symbol,
        device,
        position::PositionReport,
    },
    ax25::Callsign,
};

const MESSAGE_CODES: [&str; 8] = [
    "Emergency",
    "Priority",
    "Special",
    "Committed",
    "Returning",
    "In Service",
    "En Route",
    "Off Duty",
];

pub(super) fn decode(info: &[u8], destination: &Callsign) -> Result<PositionReport, AprsError> {
    if info.len() < 9 {
        return Err(AprsError::Truncated("mic-e"));
    }

    let dest = destination.base();
    if dest.len() != 6 {
        return Err(AprsError::Malformed("mic-e destination"));
    }

    // each destination byte encodes one latitude digit plus one message bit;
    // bits 3..5 double as N/S, longitude offset, and E/W
    let mut digits = [0u8; 6];
    let mut bits = [0u8; 6];
    for (i, ch) in dest.bytes().enumerate() {
        let (digit, bit) = match ch {
            b'0'..=b'9' => (ch - b'0', 0),
            b'A'..=b'J' => (ch - b'A', 1),
            b'P'..=b'Y' => (ch - b'P', 1),
            b'L' => (0, 0),
            b'K' | b'Z' => (0, 1),
            _ => return Err(AprsError::Malformed("mic-e destination")),
        };
        digits[i] = digit;
        bits[i] = bit;
    }

    let lat_deg = f64::from(digits[0] * 10 + digits[1]);
    let lat_min = f64::from(digits[2] * 10 + digits[3]) + f64::from(digits[4] * 10 + digits[5]) / 100.0;
    let mut latitude = lat_deg + lat_min / 60.0;
    if bits[3] == 0 {
        latitude = -latitude;
    }

    let mut lon_deg = i32::from(info[1]) - 28;
    if bits[4] == 1 {
        lon_deg += 100;
    }
    let lon_min = i32::from(info[2]) - 28;
    let lon_hundredths = i32::from(info[3]) - 28;
    let mut longitude = f64::from(lon_deg) + (f64::from(lon_min) + f64::from(lon_hundredths) / 100.0) / 60.0;
    if bits[5] == 1 {
        longitude = -longitude;
    }

    let speed_course = i32::from(info[4]) - 28;
    let speed_knots = (i32::from(info[5]) - 28) * 10 + (speed_course / 10) % 10;
    let course = (speed_course % 10) * 100 + i32::from(info[6]) - 28;

    let symbol = Symbol {
        code: info[7] as char,
        table: *info.get(8).unwrap_or(&b'/') as char,
    };

    let message_bits = (bits[0] << 2) | (bits[1] << 1) | bits[2];

    let mut report = PositionReport {
        position: Some(LatLon::new(latitude, longitude)?),
        symbol,
        messaging: true,
        course_degrees: (0..=360).contains(&course).then_some(course as u16),
        speed_knots: (speed_knots >= 0).then_some(f64::from(speed_knots)),
        mice_message: Some(MESSAGE_CODES[message_bits as usize]),
        ..Default::default()
    };

    decode_trailer(&mut report, &info[9..]);
    Ok(report)
}

/// The trailing bytes are order-sensitive in real traffic: an optional type
/// indicator, an optional base-91 altitude terminated by `}`, free text, and
/// a device suffix. Unknown trailing bytes stay in the comment.
fn decode_trailer(report: &mut PositionReport, trailer: &[u8]) {
    let mut comment: Vec<u8> = trailer.to_vec();

    // type indicator byte
    if let Some(&first) = comment.first() {
        if matches!(first, b' ' | b'>' | b']' | b'`' | b'\'') {
            comment.remove(0);
        }
    }

    // keep printable ASCII only
    comment.retain(|b| (0x20..=0x7e).contains(b));

    // altitude: three base-91 bytes terminated by `}`, metres above -10 km
    if comment.len() >= 4 && comment[3] == b'}' && comment[..3].iter().all(|b| (33..=124).contains(b)) {
        let value = comment[..3]
            .iter()
            .fold(0i64, |acc, &b| acc * 91 + i64::from(b - 33));
        let meters = value - 10_000;
        report.altitude_feet = Some(meters as f64 * 3.28084);
        comment.drain(..4);
    }
    else if let Some(brace) = comment.iter().position(|&b| b == b'}') {
        // stray altitude fragment; drop the brace and up to three base-91
        // bytes that follow it
        let mut end = brace + 1;
        while end < comment.len() && end < brace + 4 && (33..=123).contains(&comment[end]) {
            end += 1;
        }
        comment.drain(brace..end);
    }

    let text = String::from_utf8_lossy(&comment).into_owned();

    // the device suffix is matched before trailing punctuation is trimmed
    report.device = device::identify_mice(&text);

    let mut text = text
        .trim_end_matches(|c: char| c.is_ascii_punctuation())
        .trim()
        .to_owned();

    // suppress comments that are mostly line noise
    if !text.is_empty() {
        let readable = text.chars().filter(|c| c.is_alphanumeric() || *c == ' ').count();
        if (readable as f64) / (text.len() as f64) < 0.4 {
            text.clear();
        }
    }

    report.comment = text;
}
