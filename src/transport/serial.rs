//! Serial KISS TNC carrier: a plain tty at the configured baud, 8N1.

use tokio_serial::{
    DataBits,
    Parity,
    SerialPortBuilderExt,
    SerialStream,
    StopBits,
};

use crate::transport::Error;

pub const VALID_BAUD_RATES: [u32; 8] = [1200, 2400, 4800, 9600, 19200, 38400, 57600, 115200];

pub fn connect(path: &str, baud: u32) -> Result<SerialStream, Error> {
    if !VALID_BAUD_RATES.contains(&baud) {
        tracing::warn!(baud, "unusual baud rate, expected one of {VALID_BAUD_RATES:?}");
    }

    let stream = tokio_serial::new(path, baud)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .open_native_async()?;

    tracing::info!(path, baud, "serial port open");
    Ok(stream)
}
