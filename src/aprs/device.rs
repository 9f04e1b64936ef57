//! APRS device identification.
//!
//! The transmitter's software or radio model is advertised in the AX.25
//! destination address (the "tocall") for most traffic, or in a one- or
//! two-character suffix of the MIC-E comment. Patterns follow the
//! hessu/aprs-deviceid conventions: `?` matches any character, `n` matches a
//! digit, `*` matches any tail. The most specific (longest literal) pattern
//! wins.

struct TocallEntry {
    pattern: &'static str,
    device: &'static str,
}

struct MiceEntry {
    suffix: &'static str,
    device: &'static str,
}

struct MiceLegacyEntry {
    prefix: char,
    suffix: char,
    device: &'static str,
}

/// Excerpt of the hessu tocall database covering the vendors commonly heard
/// on VHF; the matcher takes any table size.
static TOCALLS: &[TocallEntry] = &[
    TocallEntry { pattern: "AP1WWX", device: "TAPR T-238+" },
    TocallEntry { pattern: "APAGW*", device: "SV2AGW AGWtracker" },
    TocallEntry { pattern: "APAND?", device: "APRSdroid" },
    TocallEntry { pattern: "APAT51", device: "Anytone AT-D578" },
    TocallEntry { pattern: "APAT8?", device: "Anytone AT-878" },
    TocallEntry { pattern: "APAVT5", device: "SainSonic AP510" },
    TocallEntry { pattern: "APAW*", device: "AGWPE" },
    TocallEntry { pattern: "APB2MF", device: "Mic-E Data 2MF" },
    TocallEntry { pattern: "APBL*", device: "BitLabs LoRa" },
    TocallEntry { pattern: "APBPQ?", device: "John Wiseman BPQ32" },
    TocallEntry { pattern: "APC???", device: "APRS/CE" },
    TocallEntry { pattern: "APCLEY", device: "EYTraker" },
    TocallEntry { pattern: "APCLWX", device: "EYWeather" },
    TocallEntry { pattern: "APDR??", device: "APRSdroid" },
    TocallEntry { pattern: "APDST?", device: "dsTracker" },
    TocallEntry { pattern: "APDW??", device: "WB2OSZ DireWolf" },
    TocallEntry { pattern: "APE2A?", device: "E2Ayaprs" },
    TocallEntry { pattern: "APECAN", device: "Pecan Pico" },
    TocallEntry { pattern: "APESP?", device: "ESP APRS" },
    TocallEntry { pattern: "APFII?", device: "aprs.fi app" },
    TocallEntry { pattern: "APGO??", device: "APRS-Go" },
    TocallEntry { pattern: "APHAX?", device: "PY2UEP SM2APRS" },
    TocallEntry { pattern: "APHBL?", device: "HBLink D-APRS" },
    TocallEntry { pattern: "APHK??", device: "LA1BR tracker" },
    TocallEntry { pattern: "API282", device: "Icom IC-2820" },
    TocallEntry { pattern: "API31?", device: "Icom ID-31" },
    TocallEntry { pattern: "API410", device: "Icom ID-4100" },
    TocallEntry { pattern: "API51?", device: "Icom ID-51" },
    TocallEntry { pattern: "API52?", device: "Icom ID-52" },
    TocallEntry { pattern: "API705", device: "Icom IC-705" },
    TocallEntry { pattern: "API880", device: "Icom ID-880" },
    TocallEntry { pattern: "API910", device: "Icom IC-9100" },
    TocallEntry { pattern: "API970", device: "Icom IC-9700" },
    TocallEntry { pattern: "APIC??", device: "HA9MCQ PICiGATE" },
    TocallEntry { pattern: "APIN??", device: "PinPoint APRS" },
    TocallEntry { pattern: "APJI??", device: "jAPRSIgate" },
    TocallEntry { pattern: "APJS??", device: "javAPRSSrvr" },
    TocallEntry { pattern: "APK003", device: "Kenwood TH-D72" },
    TocallEntry { pattern: "APK004", device: "Kenwood TH-D74" },
    TocallEntry { pattern: "APK005", device: "Kenwood TH-D75" },
    TocallEntry { pattern: "APK0??", device: "Kenwood TH-D7" },
    TocallEntry { pattern: "APK1??", device: "Kenwood TM-D700" },
    TocallEntry { pattern: "APLC??", device: "APRScube" },
    TocallEntry { pattern: "APLG??", device: "LoRa gateway" },
    TocallEntry { pattern: "APLO??", device: "LoRa KISS TNC" },
    TocallEntry { pattern: "APLRG?", device: "LoRa gateway" },
    TocallEntry { pattern: "APLRT?", device: "LoRa tracker" },
    TocallEntry { pattern: "APLT??", device: "LoRa tracker" },
    TocallEntry { pattern: "APMI0?", device: "WX3in1" },
    TocallEntry { pattern: "APMI??", device: "Microsat" },
    TocallEntry { pattern: "APN3??", device: "Kantronics KPC-3" },
    TocallEntry { pattern: "APN9??", device: "Kantronics KPC-9612" },
    TocallEntry { pattern: "APND??", device: "PE1MEW DIGI_NED" },
    TocallEntry { pattern: "APNK01", device: "Kenwood TM-D700" },
    TocallEntry { pattern: "APNK80", device: "Kantronics KAM" },
    TocallEntry { pattern: "APNKMP", device: "Kantronics KAM+" },
    TocallEntry { pattern: "APNU??", device: "UIdigi" },
    TocallEntry { pattern: "APNX??", device: "TNC-X" },
    TocallEntry { pattern: "APOT??", device: "Argent Data OpenTracker" },
    TocallEntry { pattern: "APPIC?", device: "PicoAPRS" },
    TocallEntry { pattern: "APPT??", device: "JF6LZE KetaiTracker" },
    TocallEntry { pattern: "APRARX", device: "VK5QI radiosonde_auto_rx" },
    TocallEntry { pattern: "APRS", device: "unknown APRS" },
    TocallEntry { pattern: "APRX??", device: "OH2MQK aprx" },
    TocallEntry { pattern: "APSAR?", device: "SARTrack" },
    TocallEntry { pattern: "APSTM?", device: "W7QO balloon tracker" },
    TocallEntry { pattern: "APT2??", device: "Argent Data Tracker2" },
    TocallEntry { pattern: "APT3??", device: "Byonics TinyTrak3" },
    TocallEntry { pattern: "APT4??", device: "Byonics TinyTrak4" },
    TocallEntry { pattern: "APTT?", device: "Byonics TinyTrak" },
    TocallEntry { pattern: "APU2??", device: "UI-View32" },
    TocallEntry { pattern: "APU1??", device: "UI-View16" },
    TocallEntry { pattern: "APUDR?", device: "NW Digital UDR" },
    TocallEntry { pattern: "APVE??", device: "PHG2100" },
    TocallEntry { pattern: "APWM??", device: "KJ4ERJ APRSISCE" },
    TocallEntry { pattern: "APWW??", device: "KJ4ERJ APRSIS32" },
    TocallEntry { pattern: "APWXD?", device: "open source WXdigi" },
    TocallEntry { pattern: "APX???", device: "Xastir" },
    TocallEntry { pattern: "APY0??", device: "Yaesu FT1D" },
    TocallEntry { pattern: "APY2??", device: "Yaesu FT2D" },
    TocallEntry { pattern: "APY3??", device: "Yaesu FT3D" },
    TocallEntry { pattern: "APY5??", device: "Yaesu FT5D" },
    TocallEntry { pattern: "APYS??", device: "W2GMD Python APRS" },
    TocallEntry { pattern: "APZ???", device: "experimental" },
    TocallEntry { pattern: "APZ18", device: "UIdigi 1.8" },
    TocallEntry { pattern: "APZ247", device: "UPRS NR0Q" },
    TocallEntry { pattern: "APZMDR", device: "HaMDR" },
];

/// New-style MIC-E suffixes (last two characters of the comment).
static MICE_SUFFIXES: &[MiceEntry] = &[
    MiceEntry { suffix: "_\"", device: "Yaesu VX-8" },
    MiceEntry { suffix: "_#", device: "Yaesu VX-8G" },
    MiceEntry { suffix: "_$", device: "Yaesu FT1D" },
    MiceEntry { suffix: "_%", device: "Yaesu FTM-400DR" },
    MiceEntry { suffix: "_)", device: "Yaesu FTM-100D" },
    MiceEntry { suffix: "_(", device: "Yaesu FT2D" },
    MiceEntry { suffix: "_0", device: "Yaesu FT3D" },
    MiceEntry { suffix: "_3", device: "Yaesu FT5D" },
    MiceEntry { suffix: "_1", device: "Yaesu FTM-300D" },
    MiceEntry { suffix: "_5", device: "Yaesu FTM-500D" },
    MiceEntry { suffix: " X", device: "AP510" },
    MiceEntry { suffix: "(5", device: "Anytone D578UV" },
    MiceEntry { suffix: "(8", device: "Anytone D878UV" },
    MiceEntry { suffix: "|3", device: "Byonics TinyTrak3" },
    MiceEntry { suffix: "|4", device: "Byonics TinyTrak4" },
    MiceEntry { suffix: "^v", device: "HinzTec anyfrog" },
    MiceEntry { suffix: "*v", device: "KissOZ tracker" },
    MiceEntry { suffix: ":4", device: "SCS GmbH & Co. P4dragon DR-7400" },
    MiceEntry { suffix: ":8", device: "SCS GmbH & Co. P4dragon DR-7800" },
    MiceEntry { suffix: "~v", device: "other MIC-E" },
    MiceEntry { suffix: "`v", device: "other MIC-E" },
    MiceEntry { suffix: "'v", device: "other MIC-E" },
];

/// Legacy Kenwood marking: one prefix byte and one suffix byte.
static MICE_LEGACY: &[MiceLegacyEntry] = &[
    MiceLegacyEntry { prefix: '>', suffix: '=', device: "Kenwood TH-D72" },
    MiceLegacyEntry { prefix: '>', suffix: '^', device: "Kenwood TH-D74" },
    MiceLegacyEntry { prefix: '>', suffix: '&', device: "Kenwood TH-D75" },
    MiceLegacyEntry { prefix: '>', suffix: ' ', device: "Kenwood TH-D7A" },
    MiceLegacyEntry { prefix: ']', suffix: '=', device: "Kenwood TM-D710" },
    MiceLegacyEntry { prefix: ']', suffix: ' ', device: "Kenwood TM-D700" },
];

/// Identify a transmitter from its destination address. The SSID, if any,
/// is ignored.
pub fn identify_tocall(destination: &str) -> Option<&'static str> {
    let tocall = destination
        .split('-')
        .next()
        .unwrap_or(destination)
        .to_ascii_uppercase();

    // exact matches win outright
    for entry in TOCALLS {
        if !entry.pattern.contains(['?', '*', 'n']) && entry.pattern == tocall {
            return Some(entry.device);
        }
    }

    // then the wildcard pattern with the most literal characters
    TOCALLS
        .iter()
        .filter(|entry| pattern_matches(entry.pattern, &tocall))
        .max_by_key(|entry| {
            entry
                .pattern
                .chars()
                .filter(|c| !matches!(c, '?' | '*' | 'n'))
                .count()
        })
        .map(|entry| entry.device)
}

/// Identify a transmitter from the raw MIC-E comment, before any trimming.
pub fn identify_mice(comment: &str) -> Option<&'static str> {
    if comment.len() < 2 {
        return None;
    }

    let chars: Vec<char> = comment.chars().collect();
    let suffix: String = chars[chars.len() - 2..].iter().collect();
    for entry in MICE_SUFFIXES {
        if entry.suffix == suffix {
            return Some(entry.device);
        }
    }

    let prefix = chars[0];
    let last = chars[chars.len() - 1];
    for entry in MICE_LEGACY {
        if entry.prefix == prefix && entry.suffix == last {
            return Some(entry.device);
        }
    }

    None
}

fn pattern_matches(pattern: &str, tocall: &str) -> bool {
    let pattern = pattern.as_bytes();
    let tocall = tocall.as_bytes();

    let mut i = 0;
    let mut j = 0;
    while i < pattern.len() && j < tocall.len() {
        match pattern[i] {
            b'?' => {}
            b'n' => {
                if !tocall[j].is_ascii_digit() {
                    return false;
                }
            }
            b'*' => return true,
            literal => {
                if literal != tocall[j] {
                    return false;
                }
            }
        }
        i += 1;
        j += 1;
    }

    (i == pattern.len() && j == tocall.len()) || pattern[i..] == [b'*']
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_tocall() {
        assert_eq!(identify_tocall("APK004"), Some("Kenwood TH-D74"));
        assert_eq!(identify_tocall("APK004-7"), Some("Kenwood TH-D74"));
    }

    #[test]
    fn wildcard_tocall_prefers_specific() {
        // APK004 is exact; APK0?? would also match
        assert_eq!(identify_tocall("APK001"), Some("Kenwood TH-D7"));
        assert_eq!(identify_tocall("APDW16"), Some("WB2OSZ DireWolf"));
        assert_eq!(identify_tocall("APZ123"), Some("experimental"));
    }

    #[test]
    fn star_matches_tail() {
        assert_eq!(identify_tocall("APAW99"), Some("AGWPE"));
        assert_eq!(identify_tocall("APBL12"), Some("BitLabs LoRa"));
    }

    #[test]
    fn unknown_tocall() {
        assert_eq!(identify_tocall("N0CALL"), None);
    }

    #[test]
    fn mice_suffixes() {
        assert_eq!(identify_mice("Mobile_%"), Some("Yaesu FTM-400DR"));
        assert_eq!(identify_mice(">Dan ="), Some("Kenwood TH-D72"));
        assert_eq!(identify_mice("hi"), None);
    }
}
