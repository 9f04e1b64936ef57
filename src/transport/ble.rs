//! BLE handheld carrier.
//!
//! The radio exposes a vendor GATT service with a notify characteristic for
//! TNC-to-host bytes and a write characteristic for host-to-TNC bytes.
//! Notifies may split a KISS frame across several packets; the bytes are fed
//! to the framer upstream untouched. Writes are chunked to the negotiated
//! MTU.

use btleplug::api::{
    Central,
    CharPropFlags,
    Characteristic,
    Manager as _,
    Peripheral as _,
    ScanFilter,
    WriteType,
};
use btleplug::platform::{
    Manager,
    Peripheral,
};
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::{
    mpsc,
    watch,
};
use tokio_util::sync::CancellationToken;

use crate::transport::{
    BACKOFF_CAP_SECS,
    BACKOFF_START_SECS,
    Error,
    LinkState,
};

/// Vendor TNC service characteristics (host→TNC and TNC→host).
const TNC_WRITE_UUID: &str = "00000002-ba2a-46c9-ae49-01b0961f68bb";
const TNC_NOTIFY_UUID: &str = "00000003-ba2a-46c9-ae49-01b0961f68bb";

/// Usable payload per write after MTU negotiation.
const WRITE_CHUNK: usize = 185;

/// How long one scan pass waits for the radio to advertise.
const SCAN_WAIT: std::time::Duration = std::time::Duration::from_secs(4);

/// Connect-and-pump loop for the BLE radio. Runs until shutdown, handling
/// its own reconnects (scanning again costs more than a socket connect, so
/// the back-off lives here too).
pub(super) async fn run(
    mac: &str,
    rx_bytes: &mpsc::Sender<Bytes>,
    write_queue: &mut mpsc::Receiver<Bytes>,
    state: &watch::Sender<LinkState>,
    backoff: &mut u64,
    shutdown: &CancellationToken,
) -> Result<(), Error> {
    loop {
        if shutdown.is_cancelled() {
            return Ok(());
        }

        match connect_radio(mac).await {
            Ok((peripheral, write_char)) => {
                let _ = state.send(LinkState::Connected);
                *backoff = BACKOFF_START_SECS;
                tracing::info!(mac, "BLE radio connected");

                let result = pump(&peripheral, &write_char, rx_bytes, write_queue, shutdown).await;
                let _ = peripheral.disconnect().await;

                match result {
                    Ok(()) => return Ok(()),
                    Err(error) => {
                        tracing::warn!(?error, mac, "BLE link dropped");
                    }
                }
            }
            Err(error) => {
                tracing::warn!(?error, mac, retry_in = *backoff, "BLE connect failed");
            }
        }

        let _ = state.send(LinkState::Disconnected);
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = tokio::time::sleep(std::time::Duration::from_secs(*backoff)) => {}
        }
        *backoff = (*backoff * 2).min(BACKOFF_CAP_SECS);
    }
}

/// Scan for the configured peer, connect, and resolve the TNC
/// characteristics.
async fn connect_radio(mac: &str) -> Result<(Peripheral, Characteristic), Error> {
    let manager = Manager::new().await?;
    let adapter = manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| Error::DeviceNotFound("no bluetooth adapter".to_owned()))?;

    adapter.start_scan(ScanFilter::default()).await?;
    tokio::time::sleep(SCAN_WAIT).await;

    let mut found = None;
    for peripheral in adapter.peripherals().await? {
        if peripheral.address().to_string().eq_ignore_ascii_case(mac) {
            found = Some(peripheral);
            break;
        }
    }
    let _ = adapter.stop_scan().await;
    let peripheral = found.ok_or_else(|| Error::DeviceNotFound(mac.to_owned()))?;

    peripheral.connect().await?;
    peripheral.discover_services().await?;

    let mut notify_char = None;
    let mut write_char = None;
    for characteristic in peripheral.characteristics() {
        let uuid = characteristic.uuid.to_string();
        if uuid == TNC_NOTIFY_UUID && characteristic.properties.contains(CharPropFlags::NOTIFY) {
            notify_char = Some(characteristic);
        }
        else if uuid == TNC_WRITE_UUID {
            write_char = Some(characteristic);
        }
    }

    let notify_char = notify_char
        .ok_or_else(|| Error::DeviceNotFound(format!("{mac}: TNC notify characteristic")))?;
    let write_char = write_char
        .ok_or_else(|| Error::DeviceNotFound(format!("{mac}: TNC write characteristic")))?;

    peripheral.subscribe(&notify_char).await?;
    Ok((peripheral, write_char))
}

async fn pump(
    peripheral: &Peripheral,
    write_char: &Characteristic,
    rx_bytes: &mpsc::Sender<Bytes>,
    write_queue: &mut mpsc::Receiver<Bytes>,
    shutdown: &CancellationToken,
) -> Result<(), Error> {
    let mut notifications = peripheral.notifications().await?;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            notification = notifications.next() => {
                match notification {
                    Some(data) => {
                        if rx_bytes.send(Bytes::from(data.value)).await.is_err() {
                            return Ok(());
                        }
                    }
                    None => {
                        return Err(Error::Io(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "notification stream ended",
                        )));
                    }
                }
            }
            frame = write_queue.recv() => {
                match frame {
                    Some(frame) => {
                        for chunk in frame.chunks(WRITE_CHUNK) {
                            peripheral
                                .write(write_char, chunk, WriteType::WithoutResponse)
                                .await?;
                        }
                    }
                    None => return Ok(()),
                }
            }
        }
    }
}
