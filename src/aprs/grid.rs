//! Maidenhead grid squares and the dew-point formula.

#[derive(Debug, thiserror::Error)]
pub enum GridError {
    #[error("grid square must be 2, 4, 6, 8 or 10 characters, got {0}")]
    BadLength(usize),
    #[error("grid square has characters out of range: {0:?}")]
    BadCharacter(String),
}

/// Convert a position to a 6-character Maidenhead locator (e.g. `FN42ir`).
pub fn latlon_to_maidenhead(lat: f64, lon: f64) -> String {
    let lon_adj = lon + 180.0;
    let lat_adj = lat + 90.0;

    let field_lon = (lon_adj / 20.0) as u8;
    let field_lat = (lat_adj / 10.0) as u8;
    let square_lon = ((lon_adj % 20.0) / 2.0) as u8;
    let square_lat = (lat_adj % 10.0) as u8;
    let subsq_lon = (((lon_adj % 2.0) * 60.0) / 5.0) as u8;
    let subsq_lat = (((lat_adj % 1.0) * 60.0) / 2.5) as u8;

    let mut grid = String::with_capacity(6);
    grid.push((b'A' + field_lon.min(17)) as char);
    grid.push((b'A' + field_lat.min(17)) as char);
    grid.push((b'0' + square_lon.min(9)) as char);
    grid.push((b'0' + square_lat.min(9)) as char);
    grid.push((b'a' + subsq_lon.min(23)) as char);
    grid.push((b'a' + subsq_lat.min(23)) as char);
    grid
}

/// Convert a 2–10 character Maidenhead locator to the centre of its square.
pub fn maidenhead_to_latlon(grid: &str) -> Result<(f64, f64), GridError> {
    let grid = grid.to_ascii_uppercase();
    let chars: Vec<char> = grid.chars().collect();
    let len = chars.len();
    if !(2..=10).contains(&len) || len % 2 != 0 {
        return Err(GridError::BadLength(len));
    }

    let letter = |c: char, max: u8| -> Result<f64, GridError> {
        let v = (c as i32) - ('A' as i32);
        if v < 0 || v > max as i32 {
            return Err(GridError::BadCharacter(grid.clone()));
        }
        Ok(v as f64)
    };
    let digit = |c: char| -> Result<f64, GridError> {
        c.to_digit(10)
            .map(f64::from)
            .ok_or_else(|| GridError::BadCharacter(grid.clone()))
    };

    let mut lon = letter(chars[0], 17)? * 20.0 - 180.0;
    let mut lat = letter(chars[1], 17)? * 10.0 - 90.0;

    if len >= 4 {
        lon += digit(chars[2])? * 2.0;
        lat += digit(chars[3])?;
    }
    if len >= 6 {
        lon += letter(chars[4], 23)? * (2.0 / 24.0);
        lat += letter(chars[5], 23)? * (1.0 / 24.0);
    }
    if len >= 8 {
        lon += digit(chars[6])? * (2.0 / 240.0);
        lat += digit(chars[7])? * (1.0 / 240.0);
    }
    if len >= 10 {
        lon += letter(chars[8], 23)? * (2.0 / 5760.0);
        lat += letter(chars[9], 23)? * (1.0 / 5760.0);
    }

    // centre of the square at the given precision
    let (half_lon, half_lat) = match len {
        2 => (10.0, 5.0),
        4 => (1.0, 0.5),
        6 => (1.0 / 24.0, 0.5 / 24.0),
        8 => (1.0 / 240.0, 0.5 / 240.0),
        _ => (1.0 / 5760.0, 0.5 / 5760.0),
    };

    Ok((lat + half_lat, lon + half_lon))
}

/// Dew point via the Magnus formula. Inputs in °F and percent, output °F.
pub fn dew_point_f(temp_f: f64, humidity: u8) -> Option<f64> {
    if humidity == 0 || humidity > 100 {
        return None;
    }
    let temp_c = (temp_f - 32.0) * 5.0 / 9.0;
    const A: f64 = 17.27;
    const B: f64 = 237.3;
    let alpha = (A * temp_c) / (B + temp_c) + (f64::from(humidity) / 100.0).ln();
    let dew_c = (B * alpha) / (A - alpha);
    Some(dew_c * 9.0 / 5.0 + 32.0)
}

/// Great-circle distance in meters (haversine).
pub fn distance_meters(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    const EARTH_RADIUS: f64 = 6_371_000.0;
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let dphi = (lat2 - lat1).to_radians();
    let dlambda = (lon2 - lon1).to_radians();
    let a = (dphi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (dlambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS * a.sqrt().atan2((1.0 - a).sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn w1aw_grid() {
        // ARRL headquarters, the canonical grid-square example
        let grid = latlon_to_maidenhead(41.7147, -72.7272);
        assert_eq!(grid, "FN31pr");
    }

    #[test]
    fn grid_round_trip_is_within_subsquare() {
        let (lat, lon) = (42.619, -71.1242);
        let grid = latlon_to_maidenhead(lat, lon);
        let (lat2, lon2) = maidenhead_to_latlon(&grid).unwrap();
        assert!((lat - lat2).abs() < 1.0 / 48.0 + 1e-9);
        assert!((lon - lon2).abs() < 2.0 / 48.0 + 1e-9);
    }

    #[test]
    fn grid_lengths() {
        assert!(maidenhead_to_latlon("FN").is_ok());
        assert!(maidenhead_to_latlon("FN42").is_ok());
        assert!(maidenhead_to_latlon("FN42ir").is_ok());
        assert!(maidenhead_to_latlon("FN42ir34").is_ok());
        assert!(maidenhead_to_latlon("FN42ir34ab").is_ok());
        assert!(maidenhead_to_latlon("F").is_err());
        assert!(maidenhead_to_latlon("FN4").is_err());
        assert!(maidenhead_to_latlon("!!").is_err());
    }

    #[test]
    fn dew_point_sanity() {
        let dp = dew_point_f(68.0, 50).unwrap();
        assert!((dp - 48.5).abs() < 1.5);
        assert_eq!(dew_point_f(68.0, 0), None);
        // saturated air: dew point equals temperature
        let dp = dew_point_f(68.0, 100).unwrap();
        assert!((dp - 68.0).abs() < 0.2);
    }

    #[test]
    fn haversine() {
        // Boston to Worcester is about 64 km
        let d = distance_meters(42.3601, -71.0589, 42.2626, -71.8023);
        assert!((d - 62_000.0).abs() < 4_000.0);
    }
}
