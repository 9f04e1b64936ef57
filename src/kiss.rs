//! KISS framing
//!
//! KISS is the host-to-TNC protocol: opaque AX.25 frames delimited by FEND
//! sentinels, with FESC escape sequences for payload bytes that collide with
//! the sentinels, and a single command byte whose high nibble selects the TNC
//! port and whose low nibble selects the frame type.
//!
//! - [KISS protocol](http://www.ax25.net/kiss.aspx)

use bytes::{
    BufMut,
    Bytes,
    BytesMut,
};

pub const FEND: u8 = 0xC0;
pub const FESC: u8 = 0xDB;
pub const TFEND: u8 = 0xDC;
pub const TFESC: u8 = 0xDD;

/// largest accepted frame; anything bigger is line noise or a runaway stream
const MAX_FRAME_LENGTH: usize = 0x2000;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid escape sequence: FESC {0:#04x}")]
    InvalidEscape(u8),
    #[error("frame exceeds {MAX_FRAME_LENGTH} bytes")]
    Oversize,
}

/// KISS frame types (low nibble of the command byte).
///
/// Types 1 through 6 configure the TNC; only `Data` carries an AX.25 frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameKind {
    Data,
    TxDelay,
    Persistence,
    SlotTime,
    TxTail,
    FullDuplex,
    SetHardware,
    Unknown(u8),
}

impl FrameKind {
    pub fn from_nibble(nibble: u8) -> Self {
        match nibble {
            0x0 => Self::Data,
            0x1 => Self::TxDelay,
            0x2 => Self::Persistence,
            0x3 => Self::SlotTime,
            0x4 => Self::TxTail,
            0x5 => Self::FullDuplex,
            0x6 => Self::SetHardware,
            other => Self::Unknown(other),
        }
    }

    pub fn as_nibble(&self) -> u8 {
        match self {
            Self::Data => 0x0,
            Self::TxDelay => 0x1,
            Self::Persistence => 0x2,
            Self::SlotTime => 0x3,
            Self::TxTail => 0x4,
            Self::FullDuplex => 0x5,
            Self::SetHardware => 0x6,
            Self::Unknown(other) => *other & 0x0f,
        }
    }
}

/// A decoded KISS frame: command byte split into port and kind, plus the
/// unescaped payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KissFrame {
    pub port: u8,
    pub kind: FrameKind,
    pub payload: Bytes,
}

/// Incremental KISS decoder.
///
/// Bytes arrive in arbitrary chunks (BLE notifies deliver partial frames), so
/// the decoder carries its accumulator and escape state across calls to
/// [`KissDecoder::push`].
#[derive(Debug, Default)]
pub struct KissDecoder {
    accumulator: Vec<u8>,
    in_escape: bool,
}

impl KissDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed received bytes, collecting every frame completed by them.
    ///
    /// Framing errors drop the partial frame and are reported alongside the
    /// frames that did decode; the decoder itself stays usable.
    pub fn push(&mut self, data: &[u8]) -> (Vec<KissFrame>, Vec<Error>) {
        let mut frames = Vec::new();
        let mut errors = Vec::new();

        for &byte in data {
            if self.in_escape {
                self.in_escape = false;
                match byte {
                    TFEND => self.accumulator.push(FEND),
                    TFESC => self.accumulator.push(FESC),
                    other => {
                        errors.push(Error::InvalidEscape(other));
                        self.accumulator.clear();
                        // resynchronize at the next FEND
                        continue;
                    }
                }
            }
            else if byte == FEND {
                // FEND both closes the current frame and opens the next one.
                // A lone command byte between two FENDs is idle-line noise.
                if self.accumulator.len() > 1 {
                    let raw = std::mem::take(&mut self.accumulator);
                    let command = raw[0];
                    frames.push(KissFrame {
                        port: (command >> 4) & 0x0f,
                        kind: FrameKind::from_nibble(command & 0x0f),
                        payload: Bytes::from(raw[1..].to_vec()),
                    });
                }
                else {
                    self.accumulator.clear();
                }
            }
            else if byte == FESC {
                self.in_escape = true;
            }
            else {
                if self.accumulator.len() >= MAX_FRAME_LENGTH {
                    errors.push(Error::Oversize);
                    self.accumulator.clear();
                }
                self.accumulator.push(byte);
            }
        }

        (frames, errors)
    }

    pub fn reset(&mut self) {
        self.accumulator.clear();
        self.in_escape = false;
    }
}

/// Encode a payload as a KISS data frame on the given port.
///
/// A leading FEND is always emitted; some TNCs discard frames without it.
pub fn encode_frame(port: u8, kind: FrameKind, payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(payload.len() + 4);
    out.put_u8(FEND);
    out.put_u8(((port & 0x0f) << 4) | kind.as_nibble());
    for &byte in payload {
        match byte {
            FEND => {
                out.put_u8(FESC);
                out.put_u8(TFEND);
            }
            FESC => {
                out.put_u8(FESC);
                out.put_u8(TFESC);
            }
            other => out.put_u8(other),
        }
    }
    out.put_u8(FEND);
    out.freeze()
}

/// Encode a one-byte TNC parameter frame (TXDELAY, P, SlotTime, TXtail,
/// full-duplex). The value is in the unit the TNC expects (10 ms steps for
/// the timing parameters).
pub fn encode_parameter(port: u8, kind: FrameKind, value: u8) -> Bytes {
    encode_frame(port, kind, &[value])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_with_escapes() {
        let encoded = encode_frame(0, FrameKind::Data, &[0x00, 0xc0, 0xdb, 0x01]);
        assert_eq!(
            encoded.as_ref(),
            &[0xc0, 0x00, 0x00, 0xdb, 0xdc, 0xdb, 0xdd, 0x01, 0xc0]
        );
    }

    #[test]
    fn decodes_split_across_pushes() {
        let mut decoder = KissDecoder::new();
        let (frames, errors) = decoder.push(&[0xc0, 0x00, 0x01, 0x02]);
        assert!(frames.is_empty());
        assert!(errors.is_empty());

        let (frames, errors) = decoder.push(&[0x03, 0xc0]);
        assert!(errors.is_empty());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].port, 0);
        assert_eq!(frames[0].kind, FrameKind::Data);
        assert_eq!(frames[0].payload.as_ref(), &[0x01, 0x02, 0x03]);
    }

    #[test]
    fn round_trips_escaped_payload() {
        let payload = [0x00, 0xc0, 0xdb, 0x01];
        let wire = encode_frame(3, FrameKind::Data, &payload);

        let mut decoder = KissDecoder::new();
        let (frames, errors) = decoder.push(&wire);
        assert!(errors.is_empty());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].port, 3);
        assert_eq!(frames[0].payload.as_ref(), &payload);
    }

    #[test]
    fn discards_idle_noise_between_fends() {
        let mut decoder = KissDecoder::new();
        // back-to-back FENDs and a single stray byte produce nothing
        let (frames, errors) = decoder.push(&[0xc0, 0xc0, 0x00, 0xc0]);
        assert!(frames.is_empty());
        assert!(errors.is_empty());
    }

    #[test]
    fn reports_bad_escape_and_recovers() {
        let mut decoder = KissDecoder::new();
        let (frames, errors) = decoder.push(&[0xc0, 0x00, 0xdb, 0x42, 0xc0]);
        assert!(frames.is_empty());
        assert_eq!(errors.len(), 1);

        // next frame decodes normally
        let (frames, errors) = decoder.push(&[0xc0, 0x00, 0x55, 0xc0]);
        assert!(errors.is_empty());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload.as_ref(), &[0x55]);
    }

    #[test]
    fn parameter_frames() {
        let encoded = encode_parameter(0, FrameKind::TxDelay, 30);
        assert_eq!(encoded.as_ref(), &[0xc0, 0x01, 30, 0xc0]);
    }
}
