//! APRS weather data.
//!
//! Weather rides either in a standalone `_` report or in the comment of a
//! position whose symbol code is `_`. Fields are single-letter prefixes with
//! fixed-width numeric bodies; stations substitute dots (or spaces) for
//! values they cannot measure.

use serde::{
    Deserialize,
    Serialize,
};

use crate::aprs::AprsError;

#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct WeatherReport {
    pub wind_direction_degrees: Option<u16>,
    pub wind_speed_mph: Option<f64>,
    pub wind_gust_mph: Option<f64>,
    pub temperature_f: Option<f64>,
    pub rain_1h_inches: Option<f64>,
    pub rain_24h_inches: Option<f64>,
    pub rain_midnight_inches: Option<f64>,
    pub humidity_percent: Option<u8>,
    pub pressure_mbar: Option<f64>,
    pub raw: String,
}

impl WeatherReport {
    pub fn has_any_field(&self) -> bool {
        self.wind_direction_degrees.is_some()
            || self.wind_speed_mph.is_some()
            || self.wind_gust_mph.is_some()
            || self.temperature_f.is_some()
            || self.rain_1h_inches.is_some()
            || self.rain_24h_inches.is_some()
            || self.rain_midnight_inches.is_some()
            || self.humidity_percent.is_some()
            || self.pressure_mbar.is_some()
    }
}

/// Standalone `_` weather report (`_ddd/sss g...t...`).
pub(super) fn decode_report(info: &[u8]) -> Result<WeatherReport, AprsError> {
    let text = String::from_utf8_lossy(&info[1..]).into_owned();
    parse_fields(&text).ok_or(AprsError::Malformed("weather"))
}

/// Quick check whether a comment carries weather fields at all.
pub(super) fn looks_like_weather(text: &str) -> bool {
    let bytes = text.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        if matches!(b, b'c' | b's' | b'g' | b'h' | b'p' | b'P' | b'b' | b'r' | b't') {
            let digits = bytes[i + 1..]
                .iter()
                .take_while(|c| c.is_ascii_digit() || **c == b'-')
                .count();
            if digits >= 2 {
                return true;
            }
        }
    }
    false
}

/// Scan a text for weather fields. Returns `None` when nothing decodes.
pub(super) fn parse_fields(text: &str) -> Option<WeatherReport> {
    let mut wx = WeatherReport {
        raw: text.to_owned(),
        ..Default::default()
    };
    let bytes = text.as_bytes();

    // wind as a leading or underscore-prefixed ddd/sss pair
    let wind_at = if slice_is_wind(bytes, 0) {
        Some(0)
    }
    else {
        bytes
            .iter()
            .position(|&b| b == b'_')
            .filter(|&i| slice_is_wind(bytes, i + 1))
            .map(|i| i + 1)
    };
    if let Some(at) = wind_at {
        wx.wind_direction_degrees = digits(&bytes[at..at + 3]).map(|v| v as u16);
        wx.wind_speed_mph = digits(&bytes[at + 4..at + 7]).map(f64::from);
    }

    let mut i = 0;
    while i < bytes.len() {
        let rest = &bytes[i + 1..];
        match bytes[i] {
            b'c' => {
                if let Some(v) = fixed_digits(rest, 3) {
                    wx.wind_direction_degrees = Some(v as u16);
                }
            }
            b's' => {
                // 's' also appears inside ddd/sss; only treat it as a field
                // when three digits follow
                if let Some(v) = fixed_digits(rest, 3) {
                    wx.wind_speed_mph = Some(f64::from(v));
                }
            }
            b'g' => {
                if let Some(v) = fixed_digits(rest, 3) {
                    wx.wind_gust_mph = Some(f64::from(v));
                }
            }
            b't' => {
                if let Some(v) = signed_digits(rest, 3) {
                    // two's-complement negatives from stations that never
                    // learned about the minus sign
                    let v = if v > 200 { v - 256 } else { v };
                    wx.temperature_f = Some(f64::from(v));
                }
            }
            b'r' => {
                if let Some(v) = fixed_digits(rest, 3) {
                    wx.rain_1h_inches = Some(f64::from(v) / 100.0);
                }
            }
            b'p' => {
                if let Some(v) = fixed_digits(rest, 3) {
                    wx.rain_24h_inches = Some(f64::from(v) / 100.0);
                }
            }
            b'P' => {
                if let Some(v) = fixed_digits(rest, 3) {
                    wx.rain_midnight_inches = Some(f64::from(v) / 100.0);
                }
            }
            b'h' => {
                if let Some(v) = fixed_digits(rest, 2) {
                    // h00 means 100%
                    wx.humidity_percent = Some(if v == 0 { 100 } else { v as u8 });
                }
            }
            b'b' => {
                if let Some(v) = fixed_digits(rest, 5) {
                    wx.pressure_mbar = decode_pressure(v);
                }
            }
            _ => {}
        }
        i += 1;
    }

    wx.has_any_field().then_some(wx)
}

fn slice_is_wind(bytes: &[u8], at: usize) -> bool {
    bytes.len() >= at + 7
        && bytes[at..at + 3].iter().all(u8::is_ascii_digit)
        && bytes[at + 3] == b'/'
        && bytes[at + 4..at + 7].iter().all(u8::is_ascii_digit)
}

fn digits(slice: &[u8]) -> Option<i32> {
    if slice.is_empty() || !slice.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(slice).ok()?.parse().ok()
}

fn fixed_digits(rest: &[u8], count: usize) -> Option<i32> {
    digits(rest.get(..count)?)
}

fn signed_digits(rest: &[u8], count: usize) -> Option<i32> {
    if rest.first() == Some(&b'-') {
        fixed_digits(&rest[1..], count.min(rest.len().saturating_sub(1))).map(|v| -v)
    }
    else {
        fixed_digits(rest, count)
    }
}

/// The five-digit `b` field is ambiguous in the wild: tenths of millibars
/// (b10132 = 1013.2 mb) or hundredths of inHg (b02992 = 29.92 inHg).
/// Sanity ranges pick the interpretation; nonsense is dropped.
fn decode_pressure(raw: i32) -> Option<f64> {
    let mbar = f64::from(raw) / 10.0;
    if (900.0..=1100.0).contains(&mbar) {
        return Some(mbar);
    }
    let inhg = f64::from(raw) / 100.0;
    if (25.0..=32.0).contains(&inhg) {
        return Some(inhg * 33.8639);
    }
    None
}

/// Remove the weather field characters from a comment, leaving free text.
pub(super) fn strip_fields(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut keep = vec![true; bytes.len()];

    if slice_is_wind(bytes, 0) {
        keep[..7].fill(false);
    }

    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'_' && slice_is_wind(bytes, i + 1) {
            keep[i..i + 8].fill(false);
            i += 8;
            continue;
        }
        let width = match bytes[i] {
            b'c' | b's' | b'g' | b'r' | b'p' | b'P' => 3,
            b't' => 3,
            b'h' => 2,
            b'b' => 5,
            _ => {
                i += 1;
                continue;
            }
        };
        let start = i + 1;
        let negative = bytes[i] == b't' && bytes.get(start) == Some(&b'-');
        let digit_start = if negative { start + 1 } else { start };
        let end = digit_start + width;
        if end <= bytes.len() && bytes[digit_start..end].iter().all(u8::is_ascii_digit) {
            keep[i..end].fill(false);
            i = end;
        }
        else {
            i += 1;
        }
    }

    text.char_indices()
        .filter(|(i, _)| keep[*i])
        .map(|(_, c)| c)
        .collect::<String>()
        .trim()
        .to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standalone_report() {
        let wx = decode_report(b"_270/010g015t072r000p010P020h50b10132").unwrap();
        assert_eq!(wx.wind_direction_degrees, Some(270));
        assert_eq!(wx.wind_speed_mph, Some(10.0));
        assert_eq!(wx.wind_gust_mph, Some(15.0));
        assert_eq!(wx.temperature_f, Some(72.0));
        assert_eq!(wx.rain_1h_inches, Some(0.0));
        assert_eq!(wx.rain_24h_inches, Some(0.1));
        assert_eq!(wx.rain_midnight_inches, Some(0.2));
        assert_eq!(wx.humidity_percent, Some(50));
        assert_eq!(wx.pressure_mbar, Some(1013.2));
    }

    #[test]
    fn humidity_zero_means_saturated() {
        let wx = parse_fields("t068h00").unwrap();
        assert_eq!(wx.humidity_percent, Some(100));
    }

    #[test]
    fn negative_temperature_two_complement() {
        let wx = parse_fields("t253").unwrap();
        assert_eq!(wx.temperature_f, Some(-3.0));

        let wx = parse_fields("t-003").unwrap();
        assert_eq!(wx.temperature_f, Some(-3.0));
    }

    #[test]
    fn pressure_inhg_autodetect() {
        let wx = parse_fields("b02992").unwrap();
        let mbar = wx.pressure_mbar.unwrap();
        assert!((mbar - 1013.2).abs() < 0.5);

        // gibberish pressure dropped
        let wx = parse_fields("t068b00001").unwrap();
        assert_eq!(wx.pressure_mbar, None);
    }

    #[test]
    fn missing_fields_as_dots() {
        let wx = parse_fields("270/...g...t072").unwrap();
        assert_eq!(wx.wind_direction_degrees, None);
        assert_eq!(wx.wind_gust_mph, None);
        assert_eq!(wx.temperature_f, Some(72.0));
    }

    #[test]
    fn no_fields_is_none() {
        assert!(parse_fields("just a comment").is_none());
        assert!(decode_report(b"_hello world").is_err());
    }

    #[test]
    fn strips_fields_leaving_comment() {
        let cleaned = strip_fields("090/005g012t068r000h45b10215 Davis VP2");
        assert_eq!(cleaned, "Davis VP2");
    }
}
