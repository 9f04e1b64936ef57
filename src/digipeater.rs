//! WIDEn-N digipeater.
//!
//! Services the first unused hop of a received UI frame when it names us or
//! a WIDEn-N alias, substituting our callsign (H-bit set) so downstream
//! receivers see who repeated, and decrementing the remaining hop budget.
//! A 30-second hash window suppresses the loops that two digis in range of
//! each other would otherwise produce.

use std::collections::HashMap;
use std::hash::{
    Hash,
    Hasher,
};

use chrono::{
    DateTime,
    Duration,
    Utc,
};

use crate::ax25::{
    Address,
    Callsign,
    Frame,
};

/// Seconds a (source, destination, info) hash suppresses re-transmission.
const DEDUP_WINDOW_SECS: i64 = 30;

#[derive(Debug)]
pub struct Digipeater {
    mycall: Callsign,
    alias: Option<String>,
    enabled: bool,
    /// Only service hops that name us explicitly; never consume WIDEn-N.
    direct_only: bool,
    recently_repeated: HashMap<u64, DateTime<Utc>>,
    pub packets_digipeated: u64,
}

impl Digipeater {
    pub fn new(mycall: Callsign, alias: Option<String>, enabled: bool, direct_only: bool) -> Self {
        Self {
            mycall,
            alias: alias.filter(|a| !a.is_empty()).map(|a| a.to_uppercase()),
            enabled,
            direct_only,
            recently_repeated: HashMap::new(),
            packets_digipeated: 0,
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn set_mycall(&mut self, mycall: Callsign) {
        self.mycall = mycall;
    }

    /// Decide whether to repeat `frame`, and build the rewritten copy.
    ///
    /// `source_is_digipeater` suppresses digi-to-digi ping-pong; the caller
    /// knows from the station database whether the source has been seen
    /// repeating other stations.
    pub fn process(
        &mut self,
        frame: &Frame,
        source_is_digipeater: bool,
        now: DateTime<Utc>,
    ) -> Option<Frame> {
        if !self.enabled || !frame.is_ui() {
            return None;
        }
        // only packets heard off the air directly; repeated copies are some
        // other digi's job already done
        if frame.hop_count() != 0 {
            return None;
        }
        if source_is_digipeater {
            return None;
        }
        if frame.source.callsign == self.mycall {
            return None;
        }

        let new_path = self.rewrite_path(&frame.path)?;

        if self.is_recent_duplicate(frame, now) {
            tracing::debug!(source = %frame.source.callsign, "digipeat suppressed by dedup window");
            return None;
        }

        self.packets_digipeated += 1;
        tracing::info!(
            source = %frame.source.callsign,
            path = ?new_path.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "digipeating"
        );

        Some(Frame {
            path: new_path,
            ..frame.clone()
        })
    }

    /// Service the first unused hop. Returns `None` when no entry in the
    /// path is ours to fill.
    fn rewrite_path(&self, path: &[Address]) -> Option<Vec<Address>> {
        let first_unused = path.iter().position(|hop| !hop.repeated())?;
        let hop = &path[first_unused];
        let call = &hop.callsign;

        let ours = Address::new(self.mycall.clone()).with_top_bit(true);
        let mut new_path: Vec<Address> = path[..first_unused].to_vec();

        if !self.direct_only && is_wide(call) && call.ssid() > 0 {
            new_path.push(ours);
            if call.ssid() > 1 {
                // one hop spent, the rest stays available downstream
                let remaining = Callsign::new(call.base(), call.ssid() - 1).ok()?;
                new_path.push(Address::new(remaining));
            }
            else {
                // WIDE1-1 fully consumed
                new_path.push(Address::new(call.clone()).with_top_bit(true));
            }
        }
        else if call.base() == self.mycall.base() || self.matches_alias(call) {
            // addressed to us (or our alias) by name: substitute and mark
            new_path.push(ours);
        }
        else {
            return None;
        }

        new_path.extend_from_slice(&path[first_unused + 1..]);
        Some(new_path)
    }

    /// Plain aliases only (`RELAY`, `WIDE1`, the MYALIAS setting); WIDEn-N
    /// forms with hops remaining are handled by the decrement path.
    fn matches_alias(&self, call: &Callsign) -> bool {
        match &self.alias {
            Some(alias) => call.ssid() == 0 && call.base() == alias,
            None => false,
        }
    }

    fn is_recent_duplicate(&mut self, frame: &Frame, now: DateTime<Utc>) -> bool {
        let window = Duration::seconds(DEDUP_WINDOW_SECS);
        self.recently_repeated.retain(|_, seen| now - *seen <= window);

        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        frame.source.callsign.to_string().hash(&mut hasher);
        frame.destination.callsign.to_string().hash(&mut hasher);
        frame.info.hash(&mut hasher);
        let key = hasher.finish();

        if self.recently_repeated.contains_key(&key) {
            return true;
        }
        self.recently_repeated.insert(key, now);
        false
    }
}

/// `WIDEn` alias bases: `WIDE1`..`WIDE7`.
fn is_wide(call: &Callsign) -> bool {
    let base = call.base();
    base.len() == 5 && base.starts_with("WIDE") && base.as_bytes()[4].is_ascii_digit()
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn call(s: &str) -> Callsign {
        s.parse().unwrap()
    }

    fn ui_frame(source: &str, path: &[(&str, bool)]) -> Frame {
        Frame::ui(
            call(source),
            call("APRS"),
            path.iter()
                .map(|(c, repeated)| Address::new(call(c)).with_top_bit(*repeated))
                .collect(),
            Bytes::from_static(b"!4237.14N/07107.45W-"),
        )
    }

    fn digi() -> Digipeater {
        Digipeater::new(call("N0CALL"), Some("WIDE2".to_owned()), true, false)
    }

    #[test]
    fn wide2_2_becomes_us_plus_wide2_1() {
        let mut digi = digi();
        let frame = ui_frame("W1ABC", &[("WIDE2-2", false)]);
        let repeated = digi.process(&frame, false, Utc::now()).unwrap();

        let path: Vec<String> = repeated.path.iter().map(ToString::to_string).collect();
        assert_eq!(path, vec!["N0CALL*", "WIDE2-1"]);
    }

    #[test]
    fn wide1_1_is_fully_consumed() {
        let mut digi = digi();
        let frame = ui_frame("W1ABC", &[("WIDE1-1", false), ("WIDE2-1", false)]);
        let repeated = digi.process(&frame, false, Utc::now()).unwrap();

        let path: Vec<String> = repeated.path.iter().map(ToString::to_string).collect();
        assert_eq!(path, vec!["N0CALL*", "WIDE1*", "WIDE2-1"]);
    }

    #[test]
    fn explicit_callsign_hop() {
        let mut digi = digi();
        let frame = ui_frame("W1ABC", &[("N0CALL", false), ("WIDE2-1", false)]);
        let repeated = digi.process(&frame, false, Utc::now()).unwrap();

        let path: Vec<String> = repeated.path.iter().map(ToString::to_string).collect();
        assert_eq!(path, vec!["N0CALL*", "WIDE2-1"]);
    }

    #[test]
    fn never_advertises_us_unrepeated() {
        let mut digi = digi();
        let frame = ui_frame("W1ABC", &[("WIDE2-2", false)]);
        let repeated = digi.process(&frame, false, Utc::now()).unwrap();
        assert!(
            repeated
                .path
                .iter()
                .filter(|hop| hop.callsign.base() == "N0CALL")
                .all(Address::repeated)
        );
    }

    #[test]
    fn dedup_window_suppresses_second_copy() {
        let mut digi = digi();
        let now = Utc::now();
        let frame = ui_frame("W1ABC", &[("WIDE2-2", false)]);
        assert!(digi.process(&frame, false, now).is_some());
        assert!(digi.process(&frame, false, now + Duration::seconds(5)).is_none());
        // outside the window it repeats again
        assert!(digi.process(&frame, false, now + Duration::seconds(40)).is_some());
    }

    #[test]
    fn skips_already_repeated_packets() {
        let mut digi = digi();
        let frame = ui_frame("W1ABC", &[("W1XM-1", true), ("WIDE2-1", false)]);
        assert!(digi.process(&frame, false, Utc::now()).is_none());
    }

    #[test]
    fn skips_own_packets_and_digi_sources() {
        let mut digi = digi();
        let own = ui_frame("N0CALL", &[("WIDE2-2", false)]);
        assert!(digi.process(&own, false, Utc::now()).is_none());

        let theirs = ui_frame("W1ABC", &[("WIDE2-2", false)]);
        assert!(digi.process(&theirs, true, Utc::now()).is_none());
    }

    #[test]
    fn direct_only_ignores_wide() {
        let mut digi = Digipeater::new(call("N0CALL"), None, true, true);
        let wide = ui_frame("W1ABC", &[("WIDE2-2", false)]);
        assert!(digi.process(&wide, false, Utc::now()).is_none());

        let named = ui_frame("W1ABC", &[("N0CALL", false)]);
        assert!(digi.process(&named, false, Utc::now()).is_some());
    }

    #[test]
    fn disabled_does_nothing() {
        let mut digi = Digipeater::new(call("N0CALL"), None, false, false);
        let frame = ui_frame("W1ABC", &[("WIDE2-2", false)]);
        assert!(digi.process(&frame, false, Utc::now()).is_none());
    }

    #[test]
    fn no_viable_hop() {
        let mut digi = digi();
        // someone else's explicit path
        let frame = ui_frame("W1ABC", &[("K9XYZ-1", false)]);
        assert!(digi.process(&frame, false, Utc::now()).is_none());
    }
}
