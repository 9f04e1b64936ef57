//! Station database.
//!
//! One record per callsign heard, owned exclusively by the engine reactor.
//! Histories are bounded; everything else in the process reads snapshots
//! serialized out of here.

pub mod persist;

use std::collections::{
    HashMap,
    VecDeque,
};

use chrono::{
    DateTime,
    Duration,
    Utc,
};
use serde::{
    Deserialize,
    Serialize,
};

use crate::aprs::{
    grid,
    position::PositionReport,
    telemetry::TelemetryReport,
    weather::WeatherReport,
};

/// Reception events kept per station.
const RECEPTION_LOG_LIMIT: usize = 200;

/// Telemetry packets kept per station.
const TELEMETRY_LIMIT: usize = 20;

/// Default per-station position history cap.
pub const DEFAULT_POSITION_LIMIT: usize = 6_000;

/// Context of one packet reception, shared by every ingest call.
#[derive(Clone, Debug)]
pub struct RxMeta {
    pub now: DateTime<Utc>,
    /// Relay station when the packet arrived third-party encapsulated.
    pub relay: Option<String>,
    /// Digipeater path, `*` marking repeated hops.
    pub path: Vec<String>,
    pub frame_number: Option<u64>,
}

impl RxMeta {
    pub fn direct_rf(&self) -> bool {
        self.relay.is_none()
    }

    pub fn hop_count(&self) -> usize {
        self.path.iter().filter(|hop| hop.ends_with('*')).count()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReceptionEvent {
    pub timestamp: DateTime<Utc>,
    pub hop_count: usize,
    pub direct_rf: bool,
    pub relay_call: Option<String>,
    pub digipeater_path: Vec<String>,
    pub packet_type: String,
    pub frame_number: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PositionEntry {
    pub timestamp: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude_feet: Option<f64>,
    pub course_degrees: Option<u16>,
    pub speed_knots: Option<f64>,
    pub symbol_table: String,
    pub symbol_code: String,
    pub comment: String,
    pub grid_square: String,
    /// Digipeater path length of the packet that carried this fix.
    pub path_len: usize,
}

impl PositionEntry {
    pub fn from_report(report: &PositionReport, now: DateTime<Utc>, path_len: usize) -> Option<Self> {
        let position = report.position?;
        Some(Self {
            timestamp: now,
            latitude: position.latitude,
            longitude: position.longitude,
            altitude_feet: report.altitude_feet,
            course_degrees: report.course_degrees,
            speed_knots: report.speed_knots,
            symbol_table: report.symbol.table.to_string(),
            symbol_code: report.symbol.code.to_string(),
            comment: report.comment.clone(),
            grid_square: grid::latlon_to_maidenhead(position.latitude, position.longitude),
            path_len,
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WeatherEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub report: WeatherReport,
    /// Magnus-formula dew point, when temperature and humidity are present.
    pub dew_point_f: Option<f64>,
    /// 3-hour pressure change, mbar.
    pub pressure_change_3h: Option<f64>,
    pub pressure_tendency: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusEntry {
    pub timestamp: DateTime<Utc>,
    pub text: String,
    pub grid: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TelemetryEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub report: TelemetryReport,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Station {
    pub callsign: String,
    pub first_heard: DateTime<Utc>,
    pub last_heard: DateTime<Utc>,
    pub packets_heard: u64,
    /// Messages this station addressed to us.
    pub messages_received: u64,
    /// Messages heard from this station to anyone.
    pub messages_sent: u64,
    pub last_position: Option<PositionEntry>,
    pub position_history: Vec<PositionEntry>,
    pub last_weather: Option<WeatherEntry>,
    pub weather_history: Vec<WeatherEntry>,
    pub last_status: Option<StatusEntry>,
    pub last_telemetry: Option<TelemetryEntry>,
    pub telemetry_history: Vec<TelemetryEntry>,
    pub receptions: VecDeque<ReceptionEvent>,
    /// Distinct digipeater paths observed; `["DIRECT"]` stands for zero-hop.
    pub digipeater_paths: Vec<Vec<String>>,
    /// First-hop digipeaters that heard this station off the air.
    pub digipeaters_heard_by: Vec<String>,
    pub is_digipeater: bool,
    pub heard_direct: bool,
    pub heard_zero_hop: bool,
    pub zero_hop_packet_count: u64,
    pub last_heard_zero_hop: Option<DateTime<Utc>>,
    pub device: Option<String>,
}

impl Station {
    fn new(callsign: String, now: DateTime<Utc>) -> Self {
        Self {
            callsign,
            first_heard: now,
            last_heard: now,
            packets_heard: 0,
            messages_received: 0,
            messages_sent: 0,
            last_position: None,
            position_history: Vec::new(),
            last_weather: None,
            weather_history: Vec::new(),
            last_status: None,
            last_telemetry: None,
            telemetry_history: Vec::new(),
            receptions: VecDeque::new(),
            digipeater_paths: Vec::new(),
            digipeaters_heard_by: Vec::new(),
            is_digipeater: false,
            heard_direct: false,
            heard_zero_hop: false,
            zero_hop_packet_count: 0,
            last_heard_zero_hop: None,
            device: None,
        }
    }

    /// Minimum hop count over the reception log.
    pub fn min_hop_count(&self) -> Option<usize> {
        self.receptions
            .iter()
            .filter(|r| r.direct_rf)
            .map(|r| r.hop_count)
            .min()
    }
}

#[derive(Debug)]
pub struct StationDb {
    stations: HashMap<String, Station>,
    position_limit: usize,
}

impl StationDb {
    pub fn new(position_limit: usize) -> Self {
        Self {
            stations: HashMap::new(),
            position_limit,
        }
    }

    pub fn len(&self) -> usize {
        self.stations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stations.is_empty()
    }

    pub fn get(&self, callsign: &str) -> Option<&Station> {
        self.stations.get(&normalize(callsign))
    }

    pub fn stations(&self) -> impl Iterator<Item = &Station> {
        self.stations.values()
    }

    /// Record one reception for `callsign` and update the hop bookkeeping.
    /// Duplicates (digipeated copies) refresh `last_heard` and path data but
    /// do not count a packet.
    pub fn observe(
        &mut self,
        callsign: &str,
        packet_type: &str,
        meta: &RxMeta,
        is_duplicate: bool,
    ) -> &mut Station {
        let key = normalize(callsign);
        let station = self
            .stations
            .entry(key.clone())
            .or_insert_with(|| Station::new(key.clone(), meta.now));

        if meta.now < station.first_heard {
            station.first_heard = meta.now;
        }
        if meta.now > station.last_heard {
            station.last_heard = meta.now;
        }
        if !is_duplicate {
            station.packets_heard += 1;
        }

        let hop_count = meta.hop_count();
        if meta.direct_rf() {
            station.heard_direct = true;
            if hop_count == 0 {
                station.heard_zero_hop = true;
                station.zero_hop_packet_count += 1;
                station.last_heard_zero_hop = Some(meta.now);
            }
        }

        station.receptions.push_back(ReceptionEvent {
            timestamp: meta.now,
            hop_count,
            direct_rf: meta.direct_rf(),
            relay_call: meta.relay.clone(),
            digipeater_path: meta.path.clone(),
            packet_type: packet_type.to_owned(),
            frame_number: meta.frame_number,
        });
        while station.receptions.len() > RECEPTION_LOG_LIMIT {
            station.receptions.pop_front();
        }

        let recorded_path = if meta.path.is_empty() {
            vec!["DIRECT".to_owned()]
        }
        else {
            meta.path.iter().map(|hop| hop.to_uppercase()).collect()
        };
        if !station.digipeater_paths.contains(&recorded_path) {
            station.digipeater_paths.push(recorded_path);
        }

        // first hop with the H-bit set is the digi that heard them off the air
        if meta.direct_rf() {
            if let Some(first) = meta.path.first() {
                if let Some(first_digi) = first.strip_suffix('*') {
                    let first_digi = first_digi.to_uppercase();
                    if !station.digipeaters_heard_by.contains(&first_digi) {
                        station.digipeaters_heard_by.push(first_digi);
                    }
                }
            }
        }

        // every repeated hop in the path has proven itself a digipeater
        let repeated: Vec<String> = meta
            .path
            .iter()
            .filter_map(|hop| hop.strip_suffix('*'))
            .map(normalize)
            .filter(|digi| *digi != key)
            .collect();
        for digi in repeated {
            let record = self
                .stations
                .entry(digi.clone())
                .or_insert_with(|| Station::new(digi, meta.now));
            record.is_digipeater = true;
        }

        self.stations.get_mut(&key).expect("station just inserted")
    }

    pub fn record_position(&mut self, callsign: &str, entry: PositionEntry, device: Option<&str>) {
        let limit = self.position_limit;
        let Some(station) = self.stations.get_mut(&normalize(callsign)) else {
            return;
        };
        if let Some(device) = device {
            station.device = Some(device.to_owned());
        }
        station.last_position = Some(entry.clone());
        station.position_history.push(entry);
        retain_positions(&mut station.position_history, limit);
    }

    pub fn record_weather(&mut self, callsign: &str, report: WeatherReport, now: DateTime<Utc>) {
        let Some(station) = self.stations.get_mut(&normalize(callsign)) else {
            return;
        };

        let dew_point_f = match (report.temperature_f, report.humidity_percent) {
            (Some(temperature), Some(humidity)) => grid::dew_point_f(temperature, humidity),
            _ => None,
        };
        let mut entry = WeatherEntry {
            timestamp: now,
            report,
            dew_point_f,
            pressure_change_3h: None,
            pressure_tendency: None,
        };

        // 3-hour pressure delta against history, ±30 min tolerance
        if let Some(pressure) = entry.report.pressure_mbar {
            let target = now - Duration::hours(3);
            let tolerance = Duration::minutes(30);
            let reference = station
                .weather_history
                .iter()
                .filter(|old| old.report.pressure_mbar.is_some())
                .min_by_key(|old| (old.timestamp - target).abs().num_seconds());
            if let Some(old) = reference {
                if (old.timestamp - target).abs() <= tolerance {
                    let change = pressure - old.report.pressure_mbar.expect("filtered");
                    entry.pressure_change_3h = Some(change);
                    entry.pressure_tendency = Some(
                        if change > 0.5 {
                            "rising"
                        }
                        else if change < -0.5 {
                            "falling"
                        }
                        else {
                            "steady"
                        }
                        .to_owned(),
                    );
                }
            }
        }

        station.last_weather = Some(entry.clone());
        station.weather_history.push(entry);
        retain_weather(&mut station.weather_history, now);
    }

    pub fn record_status(&mut self, callsign: &str, text: String, grid: Option<String>, now: DateTime<Utc>) {
        if let Some(station) = self.stations.get_mut(&normalize(callsign)) {
            station.last_status = Some(StatusEntry {
                timestamp: now,
                text,
                grid,
            });
        }
    }

    pub fn record_telemetry(&mut self, callsign: &str, report: TelemetryReport, now: DateTime<Utc>) {
        if let Some(station) = self.stations.get_mut(&normalize(callsign)) {
            station.last_telemetry = Some(TelemetryEntry {
                timestamp: now,
                report: report.clone(),
            });
            station.telemetry_history.push(TelemetryEntry {
                timestamp: now,
                report,
            });
            if station.telemetry_history.len() > TELEMETRY_LIMIT {
                station.telemetry_history.remove(0);
            }
        }
    }

    pub fn note_message_from(&mut self, callsign: &str, addressed_to_us: bool) {
        if let Some(station) = self.stations.get_mut(&normalize(callsign)) {
            station.messages_sent += 1;
            if addressed_to_us {
                station.messages_received += 1;
            }
        }
    }

    /// Drop stations idle for longer than `days`. Returns how many went.
    pub fn prune(&mut self, days: i64, now: DateTime<Utc>) -> usize {
        let cutoff = now - Duration::days(days);
        let before = self.stations.len();
        self.stations.retain(|_, station| station.last_heard >= cutoff);
        before - self.stations.len()
    }

    pub(crate) fn insert_loaded(&mut self, station: Station) {
        self.stations.insert(station.callsign.clone(), station);
    }
}

fn normalize(callsign: &str) -> String {
    callsign.trim_end_matches('*').to_uppercase()
}

/// Movement-aware thinning: keep everything from the last hour, then one fix
/// per 100 m or 15 min up to a day old, then one per 500 m or hour, and trim
/// to the hard cap. Runs only once the history is past 250 entries so bulk
/// replay stays linear.
fn retain_positions(history: &mut Vec<PositionEntry>, limit: usize) {
    if history.len() <= 250.min(limit) {
        if history.len() > limit {
            let excess = history.len() - limit;
            history.drain(..excess);
        }
        return;
    }

    history.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    let now = history[0].timestamp;

    let mut retained: Vec<PositionEntry> = Vec::with_capacity(history.len());
    for entry in history.drain(..) {
        let age = now - entry.timestamp;
        if age <= Duration::hours(1) {
            retained.push(entry);
            continue;
        }

        let keep = match retained.last() {
            None => true,
            Some(last) => {
                let moved = crate::aprs::grid::distance_meters(
                    last.latitude,
                    last.longitude,
                    entry.latitude,
                    entry.longitude,
                );
                let elapsed = last.timestamp - entry.timestamp;
                if age <= Duration::days(1) {
                    moved > 100.0 || elapsed >= Duration::minutes(15)
                }
                else {
                    moved > 500.0 || elapsed >= Duration::hours(1)
                }
            }
        };
        if keep {
            retained.push(entry);
        }
    }

    retained.truncate(limit);
    retained.reverse();
    *history = retained;
}

/// Weather thinning: full detail for an hour, one sample per 15 min out to a
/// day, one per hour beyond that.
fn retain_weather(history: &mut Vec<WeatherEntry>, now: DateTime<Utc>) {
    if history.len() <= 250 {
        return;
    }

    history.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

    let mut retained: Vec<WeatherEntry> = Vec::with_capacity(history.len());
    let mut last_quarter: Option<DateTime<Utc>> = None;
    let mut last_hour: Option<DateTime<Utc>> = None;

    for entry in history.drain(..) {
        let age = now - entry.timestamp;
        if age <= Duration::hours(1) {
            retained.push(entry);
        }
        else if age <= Duration::days(1) {
            if last_quarter.map_or(true, |t| t - entry.timestamp >= Duration::minutes(15)) {
                last_quarter = Some(entry.timestamp);
                retained.push(entry);
            }
        }
        else if last_hour.map_or(true, |t| t - entry.timestamp >= Duration::hours(1)) {
            last_hour = Some(entry.timestamp);
            retained.push(entry);
        }
    }

    retained.reverse();
    *history = retained;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(path: &[&str]) -> RxMeta {
        RxMeta {
            now: Utc::now(),
            relay: None,
            path: path.iter().map(|s| s.to_string()).collect(),
            frame_number: None,
        }
    }

    #[test]
    fn creates_station_on_first_reception() {
        let mut db = StationDb::new(DEFAULT_POSITION_LIMIT);
        db.observe("k1fsy-9", "position", &meta(&[]), false);
        let station = db.get("K1FSY-9").unwrap();
        assert_eq!(station.packets_heard, 1);
        assert!(station.heard_direct);
        assert!(station.heard_zero_hop);
        assert_eq!(station.digipeater_paths, vec![vec!["DIRECT".to_owned()]]);
    }

    #[test]
    fn hop_accounting() {
        let mut db = StationDb::new(DEFAULT_POSITION_LIMIT);
        db.observe("W1ABC", "position", &meta(&["W1XM-1*", "WIDE2-1"]), false);
        let station = db.get("W1ABC").unwrap();
        assert!(station.heard_direct);
        assert!(!station.heard_zero_hop);
        assert_eq!(station.digipeaters_heard_by, vec!["W1XM-1".to_owned()]);

        // the repeating digi got its own record and flag
        let digi = db.get("W1XM-1").unwrap();
        assert!(digi.is_digipeater);
        assert_eq!(digi.packets_heard, 0);
    }

    #[test]
    fn third_party_is_not_direct() {
        let mut db = StationDb::new(DEFAULT_POSITION_LIMIT);
        let rx = RxMeta {
            now: Utc::now(),
            relay: Some("W1IGW".to_owned()),
            path: Vec::new(),
            frame_number: None,
        };
        db.observe("W1ABC", "position", &rx, false);
        let station = db.get("W1ABC").unwrap();
        assert!(!station.heard_direct);
        assert!(!station.heard_zero_hop);
    }

    #[test]
    fn duplicates_do_not_count_packets() {
        let mut db = StationDb::new(DEFAULT_POSITION_LIMIT);
        db.observe("W1ABC", "position", &meta(&[]), false);
        db.observe("W1ABC", "position", &meta(&["W1XM-1*"]), true);
        let station = db.get("W1ABC").unwrap();
        assert_eq!(station.packets_heard, 1);
        // but the extra path was still recorded
        assert_eq!(station.digipeater_paths.len(), 2);
    }

    #[test]
    fn reception_log_is_bounded() {
        let mut db = StationDb::new(DEFAULT_POSITION_LIMIT);
        for _ in 0..(RECEPTION_LOG_LIMIT + 50) {
            db.observe("W1ABC", "position", &meta(&[]), false);
        }
        assert_eq!(db.get("W1ABC").unwrap().receptions.len(), RECEPTION_LOG_LIMIT);
    }

    #[test]
    fn position_cap_evicts_oldest() {
        let mut db = StationDb::new(100);
        db.observe("W1ABC", "position", &meta(&[]), false);
        let base = Utc::now();
        for i in 0..120 {
            let entry = PositionEntry {
                timestamp: base + Duration::seconds(i),
                latitude: 42.0,
                longitude: -71.0,
                altitude_feet: None,
                course_degrees: None,
                speed_knots: None,
                symbol_table: "/".to_owned(),
                symbol_code: ">".to_owned(),
                comment: String::new(),
                grid_square: "FN42".to_owned(),
                path_len: 0,
            };
            db.record_position("W1ABC", entry, None);
        }
        let station = db.get("W1ABC").unwrap();
        assert!(station.position_history.len() <= 100);
        // newest kept
        let newest = station.position_history.last().unwrap();
        assert_eq!(newest.timestamp, base + Duration::seconds(119));
    }

    #[test]
    fn pressure_tendency_from_history() {
        let mut db = StationDb::new(DEFAULT_POSITION_LIMIT);
        let now = Utc::now();
        db.observe("WX1", "weather", &meta(&[]), false);

        let old = WeatherReport {
            pressure_mbar: Some(1010.0),
            ..Default::default()
        };
        db.record_weather("WX1", old, now - Duration::hours(3));

        let new = WeatherReport {
            pressure_mbar: Some(1012.0),
            ..Default::default()
        };
        db.record_weather("WX1", new, now);

        let station = db.get("WX1").unwrap();
        let last = station.last_weather.as_ref().unwrap();
        assert_eq!(last.pressure_change_3h, Some(2.0));
        assert_eq!(last.pressure_tendency.as_deref(), Some("rising"));
    }

    #[test]
    fn prune_removes_idle_stations() {
        let mut db = StationDb::new(DEFAULT_POSITION_LIMIT);
        let now = Utc::now();
        let mut old = RxMeta {
            now: now - Duration::days(40),
            relay: None,
            path: Vec::new(),
            frame_number: None,
        };
        db.observe("OLD1", "position", &old, false);
        old.now = now;
        db.observe("NEW1", "position", &old, false);

        assert_eq!(db.prune(30, now), 1);
        assert!(db.get("OLD1").is_none());
        assert!(db.get("NEW1").is_some());
    }
}
