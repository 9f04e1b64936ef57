//! Raw frame capture buffer.
//!
//! Every KISS frame crossing the transport is recorded with a sequence
//! number, timestamp and direction. The buffer is bounded by a byte budget
//! (`DEBUG_BUFFER` megabytes) or runs as a tiny ten-frame ring when capture
//! is switched off, and is persisted through restarts.

use std::collections::VecDeque;
use std::io::{
    Read,
    Write,
};
use std::path::{
    Path,
    PathBuf,
};

use bytes::Bytes;
use chrono::{
    DateTime,
    Utc,
};
use libflate::gzip;
use serde::{
    Deserialize,
    Serialize,
};

pub const BUFFER_FILE: &str = ".console_frame_buffer.json.gz";

/// Frames kept when capture is configured off.
const TINY_RING: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("frame buffer io: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame buffer is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Rx,
    Tx,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FrameRecord {
    pub number: u64,
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
    #[serde(with = "hex_bytes")]
    pub bytes: Bytes,
}

#[derive(Debug)]
pub struct FrameBuffer {
    records: VecDeque<FrameRecord>,
    total_bytes: usize,
    /// Byte budget; `None` means the tiny ring.
    capacity: Option<usize>,
    next_number: u64,
}

impl FrameBuffer {
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            records: VecDeque::new(),
            total_bytes: 0,
            capacity,
            next_number: 1,
        }
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir().unwrap_or_default().join(BUFFER_FILE)
    }

    /// Record one frame, evicting oldest-first past the budget. Returns the
    /// frame number for cross-referencing from station reception logs.
    pub fn record(&mut self, direction: Direction, bytes: Bytes, now: DateTime<Utc>) -> u64 {
        let number = self.next_number;
        self.next_number += 1;
        self.total_bytes += bytes.len();
        self.records.push_back(FrameRecord {
            number,
            timestamp: now,
            direction,
            bytes,
        });

        match self.capacity {
            Some(budget) => {
                while self.total_bytes > budget && self.records.len() > 1 {
                    if let Some(evicted) = self.records.pop_front() {
                        self.total_bytes -= evicted.bytes.len();
                    }
                }
            }
            None => {
                while self.records.len() > TINY_RING {
                    if let Some(evicted) = self.records.pop_front() {
                        self.total_bytes -= evicted.bytes.len();
                    }
                }
            }
        }

        number
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn recent(&self, count: usize) -> impl Iterator<Item = &FrameRecord> {
        let skip = self.records.len().saturating_sub(count);
        self.records.iter().skip(skip)
    }

    pub fn get(&self, number: u64) -> Option<&FrameRecord> {
        self.records.iter().find(|record| record.number == number)
    }

    /// Persist as gzip JSON, atomically.
    pub fn save(&self, path: &Path) -> Result<(), Error> {
        let records: Vec<&FrameRecord> = self.records.iter().collect();
        let json = serde_json::to_vec(&records)?;

        let tmp = path.with_extension("tmp");
        let mut encoder = gzip::Encoder::new(Vec::new())?;
        encoder.write_all(&json)?;
        let compressed = encoder.finish().into_result()?;
        std::fs::write(&tmp, compressed)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Best-effort load; a missing or corrupt file starts an empty buffer.
    pub fn load(path: &Path, capacity: Option<usize>) -> Self {
        match Self::try_load(path, capacity) {
            Ok(buffer) => buffer,
            Err(error) => {
                tracing::warn!(?error, ?path, "frame buffer not loaded, starting fresh");
                Self::new(capacity)
            }
        }
    }

    fn try_load(path: &Path, capacity: Option<usize>) -> Result<Self, Error> {
        let compressed = std::fs::read(path)?;
        let mut decoder = gzip::Decoder::new(&compressed[..])?;
        let mut json = Vec::new();
        decoder.read_to_end(&mut json)?;
        let records: Vec<FrameRecord> = serde_json::from_slice(&json)?;

        let mut buffer = Self::new(capacity);
        buffer.next_number = records.iter().map(|r| r.number + 1).max().unwrap_or(1);
        for record in records {
            buffer.total_bytes += record.bytes.len();
            buffer.records.push_back(record);
        }
        Ok(buffer)
    }
}

mod hex_bytes {
    use bytes::Bytes;
    use serde::{
        Deserialize,
        Deserializer,
        Serializer,
        de,
    };

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        let mut out = String::with_capacity(bytes.len() * 2);
        for byte in bytes {
            out.push_str(&format!("{byte:02x}"));
        }
        serializer.serialize_str(&out)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let text = String::deserialize(deserializer)?;
        if text.len() % 2 != 0 {
            return Err(de::Error::custom("odd hex length"));
        }
        let mut out = Vec::with_capacity(text.len() / 2);
        for chunk in text.as_bytes().chunks(2) {
            let hi = (chunk[0] as char)
                .to_digit(16)
                .ok_or_else(|| de::Error::custom("bad hex digit"))?;
            let lo = (chunk[1] as char)
                .to_digit(16)
                .ok_or_else(|| de::Error::custom("bad hex digit"))?;
            out.push(((hi << 4) | lo) as u8);
        }
        Ok(Bytes::from(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_frames_sequentially() {
        let mut buffer = FrameBuffer::new(Some(1024));
        let now = Utc::now();
        let a = buffer.record(Direction::Rx, Bytes::from_static(b"one"), now);
        let b = buffer.record(Direction::Tx, Bytes::from_static(b"two"), now);
        assert_eq!((a, b), (1, 2));
        assert_eq!(buffer.get(2).unwrap().direction, Direction::Tx);
    }

    #[test]
    fn byte_budget_evicts_oldest() {
        let mut buffer = FrameBuffer::new(Some(8));
        let now = Utc::now();
        buffer.record(Direction::Rx, Bytes::from_static(b"aaaa"), now);
        buffer.record(Direction::Rx, Bytes::from_static(b"bbbb"), now);
        buffer.record(Direction::Rx, Bytes::from_static(b"cccc"), now);
        assert_eq!(buffer.len(), 2);
        assert!(buffer.get(1).is_none());
        assert!(buffer.get(3).is_some());
    }

    #[test]
    fn tiny_ring_keeps_ten() {
        let mut buffer = FrameBuffer::new(None);
        let now = Utc::now();
        for _ in 0..25 {
            buffer.record(Direction::Rx, Bytes::from_static(b"x"), now);
        }
        assert_eq!(buffer.len(), TINY_RING);
    }

    #[test]
    fn persists_and_reloads() {
        let dir = std::env::temp_dir().join("aprs-console-framebuf-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(BUFFER_FILE);

        let mut buffer = FrameBuffer::new(Some(1024));
        buffer.record(Direction::Rx, Bytes::from_static(&[0xc0, 0x00, 0xc0]), Utc::now());
        buffer.save(&path).unwrap();

        let reloaded = FrameBuffer::load(&path, Some(1024));
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.get(1).unwrap().bytes.as_ref(), &[0xc0, 0x00, 0xc0]);

        // numbering continues after the highest persisted frame
        let mut reloaded = reloaded;
        let next = reloaded.record(Direction::Tx, Bytes::from_static(b"y"), Utc::now());
        assert_eq!(next, 2);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn missing_file_starts_fresh() {
        let buffer = FrameBuffer::load(Path::new("/nonexistent/nope.json.gz"), None);
        assert!(buffer.is_empty());
    }
}
