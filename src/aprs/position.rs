//! Position reports: uncompressed, base-91 compressed, objects and items.

use serde::Serialize;

use crate::{
    aprs::{
        AprsError,
        AprsTimestamp,
        LatLon,
        NamedReport,
        Symbol,
        weather,
        weather::WeatherReport,
    },
    ax25::Callsign,
};

/// A decoded position report (also produced by the MIC-E decoder).
#[derive(Clone, Debug, PartialEq, Default, Serialize)]
pub struct PositionReport {
    pub position: Option<LatLon>,
    pub symbol: Symbol,
    pub timestamp: Option<AprsTimestamp>,
    /// Station can receive messages (`=`/`@` data types, or MIC-E).
    pub messaging: bool,
    pub course_degrees: Option<u16>,
    pub speed_knots: Option<f64>,
    pub altitude_feet: Option<f64>,
    /// Radio range from a compressed report's `{` extension.
    pub range_miles: Option<f64>,
    pub comment: String,
    pub weather: Option<WeatherReport>,
    /// MIC-E 3-bit message code, when the report came in MIC-E form.
    pub mice_message: Option<&'static str>,
    /// Transmitter model inferred from the tocall or MIC-E suffix.
    pub device: Option<&'static str>,
}

pub(super) fn decode(info: &[u8], destination: &Callsign) -> Result<PositionReport, AprsError> {
    let data_type = info[0];
    let messaging = matches!(data_type, b'=' | b'@');

    let mut offset = 1;
    let mut timestamp = None;
    if matches!(data_type, b'/' | b'@') {
        timestamp = parse_timestamp(info.get(1..8).ok_or(AprsError::Truncated("position"))?);
        offset = 8;
    }

    let body = info.get(offset..).ok_or(AprsError::Truncated("position"))?;
    let mut report = if is_compressed(body) {
        decode_compressed(body)?
    }
    else {
        decode_uncompressed(body)?
    };

    report.messaging = messaging;
    report.timestamp = timestamp;
    finish_comment(&mut report);

    report.device = super::device::identify_tocall(destination.base());
    Ok(report)
}

/// Compressed reports start with the symbol table byte (`/`, `\` or an
/// overlay letter) followed by eight base-91 digits. Uncompressed reports
/// start with a latitude digit.
fn is_compressed(body: &[u8]) -> bool {
    if body.len() < 13 {
        return false;
    }
    let table = body[0];
    (table == b'/' || table == b'\\' || table.is_ascii_uppercase())
        && body[1..9].iter().all(|&b| (33..=124).contains(&b))
        && !body[0].is_ascii_digit()
}

fn decode_uncompressed(body: &[u8]) -> Result<PositionReport, AprsError> {
    if body.len() < 19 {
        return Err(AprsError::Truncated("position"));
    }

    let lat = parse_latitude(&body[0..8])?;
    let symbol_table = body[8] as char;
    let lon = parse_longitude(&body[9..18])?;
    let symbol_code = body[18] as char;
    let comment = String::from_utf8_lossy(&body[19..]).into_owned();

    Ok(PositionReport {
        position: Some(LatLon::new(lat, lon)?),
        symbol: Symbol {
            table: symbol_table,
            code: symbol_code,
        },
        comment,
        ..Default::default()
    })
}

fn decode_compressed(body: &[u8]) -> Result<PositionReport, AprsError> {
    let symbol_table = body[0] as char;
    let lat_value = base91(&body[1..5]).ok_or(AprsError::Malformed("compressed position"))?;
    let lon_value = base91(&body[5..9]).ok_or(AprsError::Malformed("compressed position"))?;
    let symbol_code = body[9] as char;

    let latitude = 90.0 - lat_value as f64 / 380_926.0;
    let longitude = -180.0 + lon_value as f64 / 190_463.0;

    let mut report = PositionReport {
        position: Some(LatLon::new(latitude, longitude)?),
        symbol: Symbol {
            table: symbol_table,
            code: symbol_code,
        },
        comment: String::from_utf8_lossy(&body[13..]).into_owned(),
        ..Default::default()
    };

    // three extension bytes: course/speed, radio range, or altitude,
    // selected by the first byte and the compression-type byte
    let (c, s, t) = (body[10], body[11], body[12]);
    if c == b'{' {
        report.range_miles = Some(2.0 * 1.08f64.powi(i32::from(s) - 33));
    }
    else if (b'!'..=b'z').contains(&c) {
        if (t.wrapping_sub(33)) & 0x18 == 0x10 {
            // NMEA GGA source: extension is altitude
            let value = (i32::from(c) - 33) * 91 + (i32::from(s) - 33);
            report.altitude_feet = Some(1.002f64.powi(value));
        }
        else {
            report.course_degrees = Some(u16::from(c - 33) * 4);
            report.speed_knots = Some(1.08f64.powi(i32::from(s) - 33) - 1.0);
        }
    }

    Ok(report)
}

/// `DDMM.mmN` → decimal degrees.
fn parse_latitude(field: &[u8]) -> Result<f64, AprsError> {
    let text = std::str::from_utf8(field).map_err(|_| AprsError::Malformed("latitude"))?;
    if !text.is_ascii() {
        return Err(AprsError::Malformed("latitude"));
    }
    let degrees: f64 = text[0..2]
        .parse()
        .map_err(|_| AprsError::Malformed("latitude"))?;
    let minutes: f64 = text[2..7]
        .parse()
        .map_err(|_| AprsError::Malformed("latitude"))?;
    let value = degrees + minutes / 60.0;
    match &text[7..8] {
        "N" | "n" => Ok(value),
        "S" | "s" => Ok(-value),
        _ => Err(AprsError::Malformed("latitude")),
    }
}

/// `DDDMM.mmW` → decimal degrees.
fn parse_longitude(field: &[u8]) -> Result<f64, AprsError> {
    let text = std::str::from_utf8(field).map_err(|_| AprsError::Malformed("longitude"))?;
    if !text.is_ascii() {
        return Err(AprsError::Malformed("longitude"));
    }
    let degrees: f64 = text[0..3]
        .parse()
        .map_err(|_| AprsError::Malformed("longitude"))?;
    let minutes: f64 = text[3..8]
        .parse()
        .map_err(|_| AprsError::Malformed("longitude"))?;
    let value = degrees + minutes / 60.0;
    match &text[8..9] {
        "E" | "e" => Ok(value),
        "W" | "w" => Ok(-value),
        _ => Err(AprsError::Malformed("longitude")),
    }
}

fn base91(digits: &[u8]) -> Option<u32> {
    let mut value: u32 = 0;
    for &d in digits {
        let v = d.checked_sub(33)?;
        if v > 90 {
            return None;
        }
        value = value * 91 + u32::from(v);
    }
    Some(value)
}

fn parse_timestamp(field: &[u8]) -> Option<AprsTimestamp> {
    if field.len() != 7 || !field[..6].iter().all(u8::is_ascii_digit) {
        return None;
    }
    let pair = |i: usize| (field[i] - b'0') * 10 + (field[i + 1] - b'0');
    match field[6] {
        b'z' | b'/' => {
            Some(AprsTimestamp::DayHoursMinutes {
                day: pair(0),
                hour: pair(2),
                minute: pair(4),
                utc: field[6] == b'z',
            })
        }
        b'h' => {
            Some(AprsTimestamp::HoursMinutesSeconds {
                hour: pair(0),
                minute: pair(2),
                second: pair(4),
            })
        }
        _ => None,
    }
}

/// Post-process the free-text comment: split out a leading `CCC/SSS`
/// course/speed pair, an embedded `/A=NNNNNN` altitude, and any weather
/// fields riding along with a weather-symbol report.
fn finish_comment(report: &mut PositionReport) {
    let comment = std::mem::take(&mut report.comment);
    let mut comment = comment.as_str();

    // a weather symbol's ddd/sss prefix is wind, not course/speed
    if report.symbol.code != '_' && report.course_degrees.is_none() && comment.len() >= 7 {
        let bytes = comment.as_bytes();
        if bytes[3] == b'/'
            && bytes[..3].iter().all(u8::is_ascii_digit)
            && bytes[4..7].iter().all(u8::is_ascii_digit)
        {
            let course: u16 = comment[..3].parse().unwrap_or(0);
            let speed: f64 = comment[4..7].parse().unwrap_or(0.0);
            if course <= 360 {
                report.course_degrees = Some(course);
                report.speed_knots = Some(speed);
                comment = &comment[7..];
            }
        }
    }

    let mut owned = comment.to_owned();
    if let Some(index) = owned.find("/A=") {
        let digits = &owned[index + 3..];
        let len = digits
            .bytes()
            .take(6)
            .take_while(|b| b.is_ascii_digit() || *b == b'-')
            .count();
        if len == 6 {
            if let Ok(altitude) = digits[..6].parse::<f64>() {
                report.altitude_feet = Some(altitude);
            }
            owned.replace_range(index..index + 9, "");
        }
    }

    if report.symbol.code == '_' || weather::looks_like_weather(&owned) {
        if let Some(wx) = weather::parse_fields(&owned) {
            owned = weather::strip_fields(&owned);
            report.weather = Some(wx);
        }
    }

    report.comment = owned.trim().to_owned();
}

/// `;OBJECTNAM*DDHHMMzPOSITION...` — 9-char padded name, `*` live / `_`
/// killed, then a standard timestamped position body.
pub(super) fn decode_object(info: &[u8]) -> Result<NamedReport, AprsError> {
    if info.len() < 18 {
        return Err(AprsError::Truncated("object"));
    }
    let name = String::from_utf8_lossy(&info[1..10]).trim().to_owned();
    let alive = match info[10] {
        b'*' => true,
        b'_' => false,
        _ => return Err(AprsError::Malformed("object")),
    };

    let timestamp = parse_timestamp(&info[11..18]);
    let body = &info[18..];
    let mut report = if is_compressed(body) {
        decode_compressed(body)?
    }
    else {
        decode_uncompressed(body)?
    };
    report.timestamp = timestamp;
    finish_comment(&mut report);

    Ok(NamedReport {
        name,
        alive,
        report,
    })
}

/// `)NAME!POSITION...` — 3–9 char name terminated by `!` (live) or `_`
/// (killed).
pub(super) fn decode_item(info: &[u8]) -> Result<NamedReport, AprsError> {
    let marker = info
        .iter()
        .skip(1)
        .position(|&b| b == b'!' || b == b'_')
        .map(|i| i + 1)
        .ok_or(AprsError::Malformed("item"))?;
    let name = String::from_utf8_lossy(&info[1..marker]).trim().to_owned();
    if name.len() < 3 || name.len() > 9 {
        return Err(AprsError::Malformed("item"));
    }
    let alive = info[marker] == b'!';

    let body = &info[marker + 1..];
    let mut report = if is_compressed(body) {
        decode_compressed(body)?
    }
    else {
        decode_uncompressed(body)?
    };
    finish_comment(&mut report);

    Ok(NamedReport {
        name,
        alive,
        report,
    })
}

/// Re-encode a position in the uncompressed text format, suitable for a `!`
/// beacon body.
pub fn encode_uncompressed(position: LatLon, symbol: Symbol) -> String {
    let lat = position.latitude.abs();
    let lat_deg = lat.floor();
    let lat_min = (lat - lat_deg) * 60.0;
    let ns = if position.latitude < 0.0 { 'S' } else { 'N' };

    let lon = position.longitude.abs();
    let lon_deg = lon.floor();
    let lon_min = (lon - lon_deg) * 60.0;
    let ew = if position.longitude < 0.0 { 'W' } else { 'E' };

    format!(
        "{:02.0}{:05.2}{}{}{:03.0}{:05.2}{}{}",
        lat_deg, lat_min, ns, symbol.table, lon_deg, lon_min, ew, symbol.code
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(s: &str) -> Callsign {
        s.parse().unwrap()
    }

    fn decode_str(info: &str) -> PositionReport {
        decode(info.as_bytes(), &call("APRS")).unwrap()
    }

    #[test]
    fn uncompressed_position() {
        let report = decode_str("!4237.14N/07107.45W-Testing");
        let position = report.position.unwrap();
        assert!((position.latitude - 42.619).abs() < 0.001);
        assert!((position.longitude - -71.1242).abs() < 0.001);
        assert_eq!(report.symbol.table, '/');
        assert_eq!(report.symbol.code, '-');
        assert_eq!(report.comment, "Testing");
        assert!(!report.messaging);
    }

    #[test]
    fn messaging_flag_and_timestamp() {
        let report = decode_str("@092345z4237.14N/07107.45W>comment");
        assert!(report.messaging);
        assert_eq!(
            report.timestamp,
            Some(AprsTimestamp::DayHoursMinutes {
                day: 9,
                hour: 23,
                minute: 45,
                utc: true
            })
        );
    }

    #[test]
    fn course_speed_and_altitude() {
        let report = decode_str("!4237.14N/07107.45W>088/036/A=001234 climbing");
        assert_eq!(report.course_degrees, Some(88));
        assert_eq!(report.speed_knots, Some(36.0));
        assert_eq!(report.altitude_feet, Some(1234.0));
        assert_eq!(report.comment, "climbing");
    }

    #[test]
    fn null_island_rejected() {
        let result = decode("!0000.00N/00000.00W>".as_bytes(), &call("APRS"));
        assert!(matches!(result, Err(AprsError::NullIsland)));
    }

    #[test]
    fn southern_western_hemispheres() {
        let report = decode_str("!3350.25S/15112.50E-Sydney");
        let position = report.position.unwrap();
        assert!(position.latitude < 0.0);
        assert!(position.longitude > 0.0);
    }

    #[test]
    fn compressed_position_round_trip_value() {
        // /5L!!<*e7> OG7: the APRS101 worked example, lat 49.5, lon -72.75
        let report = decode_str("!/5L!!<*e7>7P[comment");
        let position = report.position.unwrap();
        assert!((position.latitude - 49.5).abs() < 0.01);
        assert!((position.longitude - -72.75).abs() < 0.01);
        assert_eq!(report.symbol.code, '>');
        assert_eq!(report.comment, "comment");
    }

    #[test]
    fn compressed_course_speed() {
        // cs = "7P" with a type byte selecting course/speed
        let report = decode_str("!/5L!!<*e7>7P[");
        assert_eq!(report.course_degrees, Some((b'7' - 33) as u16 * 4));
        assert!(report.speed_knots.unwrap() > 0.0);
    }

    #[test]
    fn weather_riding_on_position() {
        let report = decode_str("!4237.14N/07107.45W_090/005g012t068r000h45b10215");
        let wx = report.weather.expect("weather fields");
        assert_eq!(wx.wind_direction_degrees, Some(90));
        assert_eq!(wx.wind_speed_mph, Some(5.0));
        assert_eq!(wx.wind_gust_mph, Some(12.0));
        assert_eq!(wx.temperature_f, Some(68.0));
        assert_eq!(wx.humidity_percent, Some(45));
        assert_eq!(wx.pressure_mbar, Some(1021.5));
    }

    #[test]
    fn object_report() {
        let report = decode_object(b";LEADER   *092345z4903.50N/07201.75W>088/036").unwrap();
        assert_eq!(report.name, "LEADER");
        assert!(report.alive);
        assert_eq!(report.report.course_degrees, Some(88));
    }

    #[test]
    fn killed_object() {
        let report = decode_object(b";LEADER   _092345z4903.50N/07201.75W>").unwrap();
        assert!(!report.alive);
    }

    #[test]
    fn item_report() {
        let report = decode_item(b")AID#2!4903.50N/07201.75WA").unwrap();
        assert_eq!(report.name, "AID#2");
        assert!(report.alive);
        assert_eq!(report.report.symbol.code, 'A');
    }

    #[test]
    fn encode_decode_agrees() {
        let position = LatLon::new(42.619, -71.1242).unwrap();
        let symbol = Symbol {
            table: '/',
            code: '-',
        };
        let body = format!("!{}", encode_uncompressed(position, symbol));
        let report = decode_str(&body);
        let round = report.position.unwrap();
        // uncompressed precision is a hundredth of a minute
        assert!((round.latitude - position.latitude).abs() < 0.0002);
        assert!((round.longitude - position.longitude).abs() < 0.0002);
        assert_eq!(report.symbol, symbol);
    }
}
