//! TNC-2 style configuration, persisted as JSON in the user's home
//! directory. Key names match the classic uppercase TNC settings so the file
//! stays hand-editable.

use std::path::{
    Path,
    PathBuf,
};

use serde::{
    Deserialize,
    Serialize,
};

pub const CONFIG_FILE: &str = ".tnc_config.json";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read config: {0}")]
    Read(#[source] std::io::Error),
    #[error("failed to write config: {0}")]
    Write(#[source] std::io::Error),
    #[error("config is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(rename = "MYCALL")]
    pub mycall: String,
    #[serde(rename = "MYALIAS")]
    pub myalias: String,
    /// Maidenhead locator used for beacons when no GPS is attached.
    #[serde(rename = "MYLOCATION")]
    pub mylocation: String,
    /// BLE peer address of the handheld radio.
    #[serde(rename = "RADIO_MAC")]
    pub radio_mac: String,
    #[serde(rename = "UNPROTO")]
    pub unproto: String,
    /// KISS TXDELAY in 10 ms units.
    #[serde(rename = "TXDELAY")]
    pub txdelay: u8,
    #[serde(rename = "RETRY")]
    pub retry: u32,
    /// Seconds between retries while a message has not been heard digipeated.
    #[serde(rename = "RETRY_FAST")]
    pub retry_fast: u64,
    /// Seconds between retries once digipeated but not yet acknowledged.
    #[serde(rename = "RETRY_SLOW")]
    pub retry_slow: u64,
    #[serde(rename = "DIGIPEAT", with = "onoff")]
    pub digipeat: bool,
    /// Service WIDEn-N aliases, or only hops addressed to us directly.
    #[serde(rename = "DIGIPEAT_DIRECT_ONLY", with = "onoff")]
    pub digipeat_direct_only: bool,
    #[serde(rename = "AUTO_ACK", with = "onoff")]
    pub auto_ack: bool,
    #[serde(rename = "BEACON", with = "onoff")]
    pub beacon: bool,
    /// Minutes between beacons.
    #[serde(rename = "BEACON_INTERVAL")]
    pub beacon_interval: u64,
    #[serde(rename = "BEACON_PATH")]
    pub beacon_path: String,
    /// Symbol table byte followed by symbol code byte.
    #[serde(rename = "BEACON_SYMBOL")]
    pub beacon_symbol: String,
    #[serde(rename = "BEACON_COMMENT")]
    pub beacon_comment: String,
    /// Frame buffer cap in MB, or "off" for a tiny ring.
    #[serde(rename = "DEBUG_BUFFER")]
    pub debug_buffer: String,
    #[serde(rename = "AGWPE_HOST")]
    pub agwpe_host: String,
    #[serde(rename = "AGWPE_PORT")]
    pub agwpe_port: u16,
    #[serde(rename = "TNC_HOST")]
    pub tnc_host: String,
    #[serde(rename = "TNC_PORT")]
    pub tnc_port: u16,
    #[serde(rename = "WEBUI_HOST")]
    pub webui_host: String,
    #[serde(rename = "WEBUI_PORT")]
    pub webui_port: u16,
    /// Shared secret for mutating web endpoints; empty disables them.
    #[serde(rename = "WEBUI_PASSWORD")]
    pub webui_password: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mycall: "NOCALL".to_owned(),
            myalias: String::new(),
            mylocation: String::new(),
            radio_mac: String::new(),
            unproto: "APZ001".to_owned(),
            txdelay: 30,
            retry: 3,
            retry_fast: 20,
            retry_slow: 600,
            digipeat: false,
            digipeat_direct_only: false,
            auto_ack: true,
            beacon: false,
            beacon_interval: 10,
            beacon_path: "WIDE1-1".to_owned(),
            beacon_symbol: "/[".to_owned(),
            beacon_comment: "aprs-console".to_owned(),
            debug_buffer: "10".to_owned(),
            agwpe_host: "0.0.0.0".to_owned(),
            agwpe_port: 8000,
            tnc_host: "0.0.0.0".to_owned(),
            tnc_port: 8001,
            webui_host: "0.0.0.0".to_owned(),
            webui_port: 8002,
            webui_password: String::new(),
        }
    }
}

impl Config {
    pub fn default_path() -> PathBuf {
        dirs::home_dir().unwrap_or_default().join(CONFIG_FILE)
    }

    /// Load the configuration, falling back to defaults when the file does
    /// not exist yet.
    pub fn load(path: &Path) -> Result<Self, Error> {
        match std::fs::read_to_string(path) {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(error) => Err(Error::Read(error)),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), Error> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text).map_err(Error::Write)
    }

    /// Frame-buffer cap in bytes; `None` selects the tiny ring.
    pub fn debug_buffer_bytes(&self) -> Option<usize> {
        if self.debug_buffer.eq_ignore_ascii_case("off") {
            return None;
        }
        self.debug_buffer
            .parse::<usize>()
            .ok()
            .map(|mb| mb * 1024 * 1024)
    }
}

/// The classic TNC settings file spells booleans `ON`/`OFF`.
mod onoff {
    use serde::{
        Deserialize,
        Deserializer,
        Serializer,
    };

    pub fn serialize<S: Serializer>(value: &bool, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(if *value { "ON" } else { "OFF" })
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        let text = String::deserialize(deserializer)?;
        Ok(text.eq_ignore_ascii_case("on"))
    }
}
