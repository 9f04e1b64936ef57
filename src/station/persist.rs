//! Station database persistence: gzip-compressed JSON, written atomically
//! (temp file, then rename), loaded best-effort.

use std::io::{
    Read,
    Write,
};
use std::path::{
    Path,
    PathBuf,
};

use chrono::{
    DateTime,
    Utc,
};
use libflate::gzip;
use serde::{
    Deserialize,
    Serialize,
};

use crate::{
    messages::MessageRecord,
    station::{
        Station,
        StationDb,
    },
};

pub const DATABASE_FILE: &str = ".aprs_stations.json.gz";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("database io: {0}")]
    Io(#[from] std::io::Error),
    #[error("database is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Serialize, Deserialize)]
struct DatabaseFile {
    stations: Vec<Station>,
    messages: Vec<MessageRecord>,
    saved_at: DateTime<Utc>,
}

pub fn default_path() -> PathBuf {
    dirs::home_dir().unwrap_or_default().join(DATABASE_FILE)
}

/// Write the database and the monitored message log. Returns the number of
/// stations saved.
pub fn save(db: &StationDb, messages: &[MessageRecord], path: &Path) -> Result<usize, Error> {
    let file = DatabaseFile {
        stations: db.stations().cloned().collect(),
        messages: messages.to_vec(),
        saved_at: Utc::now(),
    };
    let count = file.stations.len();

    let json = serde_json::to_vec(&file)?;
    let mut encoder = gzip::Encoder::new(Vec::new())?;
    encoder.write_all(&json)?;
    let compressed = encoder.finish().into_result()?;

    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, compressed)?;
    std::fs::rename(&tmp, path)?;

    Ok(count)
}

/// Load into a fresh database. A missing file is an empty database; a
/// corrupt one logs a warning and starts fresh, never fails startup.
pub fn load(path: &Path, position_limit: usize) -> (StationDb, Vec<MessageRecord>) {
    match try_load(path, position_limit) {
        Ok(loaded) => loaded,
        Err(Error::Io(error)) if error.kind() == std::io::ErrorKind::NotFound => {
            (StationDb::new(position_limit), Vec::new())
        }
        Err(error) => {
            tracing::warn!(?error, ?path, "station database unreadable, starting fresh");
            (StationDb::new(position_limit), Vec::new())
        }
    }
}

fn try_load(path: &Path, position_limit: usize) -> Result<(StationDb, Vec<MessageRecord>), Error> {
    let compressed = std::fs::read(path)?;
    let mut decoder = gzip::Decoder::new(&compressed[..])?;
    let mut json = Vec::new();
    decoder.read_to_end(&mut json)?;

    let file: DatabaseFile = serde_json::from_slice(&json)?;
    let mut db = StationDb::new(position_limit);
    for station in file.stations {
        db.insert_loaded(station);
    }
    Ok((db, file.messages))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::station::{
        DEFAULT_POSITION_LIMIT,
        RxMeta,
    };

    fn temp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("aprs-console-persist-test");
        std::fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    #[test]
    fn round_trips_stations() {
        let mut db = StationDb::new(DEFAULT_POSITION_LIMIT);
        let meta = RxMeta {
            now: Utc::now(),
            relay: None,
            path: vec!["W1XM-1*".to_owned()],
            frame_number: Some(7),
        };
        db.observe("K1FSY-9", "position", &meta, false);

        let path = temp_path(DATABASE_FILE);
        let saved = save(&db, &[], &path).unwrap();
        assert_eq!(saved, 2); // station plus the digi it implied

        let (reloaded, messages) = load(&path, DEFAULT_POSITION_LIMIT);
        assert!(messages.is_empty());
        let station = reloaded.get("K1FSY-9").unwrap();
        assert_eq!(station.packets_heard, 1);
        assert_eq!(station.receptions.len(), 1);
        assert!(reloaded.get("W1XM-1").unwrap().is_digipeater);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn missing_file_is_empty() {
        let (db, messages) = load(Path::new("/nonexistent/stations.json.gz"), 100);
        assert!(db.is_empty());
        assert!(messages.is_empty());
    }

    #[test]
    fn corrupt_file_starts_fresh() {
        let path = temp_path("corrupt.json.gz");
        std::fs::write(&path, b"this is not gzip").unwrap();
        let (db, _) = load(&path, 100);
        assert!(db.is_empty());
        std::fs::remove_file(&path).ok();
    }
}
