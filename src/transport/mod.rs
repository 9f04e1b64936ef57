//! TNC transports.
//!
//! One trait-shaped surface over three very different carriers: a serial
//! tty, a KISS-over-TCP socket (Direwolf and friends), and a BLE handheld
//! with an embedded TNC. The supervisor owns reconnection: unexpected closes
//! retry with capped exponential back-off, permission failures latch the
//! link `Failed`.

pub mod ble;
pub mod serial;
pub mod tcp;

use bytes::Bytes;
use tokio::io::{
    AsyncRead,
    AsyncReadExt,
    AsyncWrite,
    AsyncWriteExt,
};
use tokio::sync::{
    mpsc,
    watch,
};
use tokio_util::sync::CancellationToken;

/// Initial reconnect delay.
pub(crate) const BACKOFF_START_SECS: u64 = 1;

/// Reconnect delay cap.
pub(crate) const BACKOFF_CAP_SECS: u64 = 30;

const READ_BUFFER_SIZE: usize = 1024;

/// Queued outbound frames before senders block.
const WRITE_QUEUE_SIZE: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("transport io: {0}")]
    Io(#[from] std::io::Error),
    #[error("serial: {0}")]
    Serial(#[from] tokio_serial::Error),
    #[error("bluetooth: {0}")]
    Ble(#[from] btleplug::Error),
    #[error("device {0} not found")]
    DeviceNotFound(String),
    #[error("transport closed")]
    Closed,
}

impl Error {
    /// Fatal errors are not retried; the operator has to fix something.
    fn is_fatal(&self) -> bool {
        match self {
            Self::Io(error) => error.kind() == std::io::ErrorKind::PermissionDenied,
            Self::Serial(error) => {
                matches!(
                    error.kind(),
                    tokio_serial::ErrorKind::NoDevice
                        | tokio_serial::ErrorKind::Io(std::io::ErrorKind::PermissionDenied)
                )
            }
            _ => false,
        }
    }
}

/// Which carrier to drive.
#[derive(Clone, Debug)]
pub enum TransportConfig {
    Serial { path: String, baud: u32 },
    Tcp { host: String, port: u16 },
    Ble { mac: String },
}

impl std::fmt::Display for TransportConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serial { path, baud } => write!(f, "serial {path} @ {baud}"),
            Self::Tcp { host, port } => write!(f, "tcp {host}:{port}"),
            Self::Ble { mac } => write!(f, "ble {mac}"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Connecting,
    Connected,
    Disconnected,
    /// Unrecoverable (permissions, missing device); no further retries.
    Failed,
}

/// Handle to a running transport task: send complete KISS frames, watch the
/// link state.
#[derive(Clone, Debug)]
pub struct Transport {
    writer: mpsc::Sender<Bytes>,
    state: watch::Receiver<LinkState>,
}

impl Transport {
    /// Spawn the supervisor. Received bytes (raw, possibly partial KISS
    /// frames) are pushed into `rx_bytes` in arrival order.
    pub fn spawn(
        config: TransportConfig,
        rx_bytes: mpsc::Sender<Bytes>,
        shutdown: CancellationToken,
    ) -> Self {
        let (writer, write_queue) = mpsc::channel(WRITE_QUEUE_SIZE);
        let (state_sender, state) = watch::channel(LinkState::Connecting);

        tokio::spawn(async move {
            supervise(config, rx_bytes, write_queue, state_sender, shutdown).await;
        });

        Self { writer, state }
    }

    pub async fn send(&self, frame: Bytes) -> Result<(), Error> {
        self.writer.send(frame).await.map_err(|_| Error::Closed)
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// The raw outbound frame queue, for the transmit scheduler.
    pub fn writer(&self) -> mpsc::Sender<Bytes> {
        self.writer.clone()
    }

    pub fn state_watch(&self) -> watch::Receiver<LinkState> {
        self.state.clone()
    }
}

async fn supervise(
    config: TransportConfig,
    rx_bytes: mpsc::Sender<Bytes>,
    mut write_queue: mpsc::Receiver<Bytes>,
    state: watch::Sender<LinkState>,
    shutdown: CancellationToken,
) {
    let mut backoff = BACKOFF_START_SECS;

    loop {
        if shutdown.is_cancelled() {
            break;
        }
        let _ = state.send(LinkState::Connecting);
        tracing::info!(%config, "connecting transport");

        let result = match &config {
            TransportConfig::Serial { path, baud } => {
                match serial::connect(path, *baud) {
                    Ok(stream) => {
                        let _ = state.send(LinkState::Connected);
                        backoff = BACKOFF_START_SECS;
                        run_stream(stream, &rx_bytes, &mut write_queue, &shutdown).await
                    }
                    Err(error) => Err(error),
                }
            }
            TransportConfig::Tcp { host, port } => {
                match tcp::connect(host, *port).await {
                    Ok(stream) => {
                        let _ = state.send(LinkState::Connected);
                        backoff = BACKOFF_START_SECS;
                        run_stream(stream, &rx_bytes, &mut write_queue, &shutdown).await
                    }
                    Err(error) => Err(error),
                }
            }
            TransportConfig::Ble { mac } => {
                ble::run(mac, &rx_bytes, &mut write_queue, &state, &mut backoff, &shutdown).await
            }
        };

        if shutdown.is_cancelled() {
            break;
        }

        match result {
            Ok(()) => break,
            Err(error) if error.is_fatal() => {
                tracing::error!(?error, %config, "transport failed permanently");
                let _ = state.send(LinkState::Failed);
                break;
            }
            Err(error) => {
                tracing::warn!(?error, %config, retry_in = backoff, "transport error, reconnecting");
                let _ = state.send(LinkState::Disconnected);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(std::time::Duration::from_secs(backoff)) => {}
                }
                backoff = (backoff * 2).min(BACKOFF_CAP_SECS);
            }
        }
    }

    let _ = state.send(LinkState::Disconnected);
    tracing::info!(%config, "transport stopped");
}

/// Pump a byte stream: reads go to the KISS decoder upstream, queued frames
/// go onto the wire. Returns `Ok` only on shutdown.
async fn run_stream<S>(
    mut stream: S,
    rx_bytes: &mpsc::Sender<Bytes>,
    write_queue: &mut mpsc::Receiver<Bytes>,
    shutdown: &CancellationToken,
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buffer = [0u8; READ_BUFFER_SIZE];

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            result = stream.read(&mut buffer) => {
                let n = result?;
                if n == 0 {
                    return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "connection closed",
                    )));
                }
                if rx_bytes.send(Bytes::copy_from_slice(&buffer[..n])).await.is_err() {
                    return Ok(());
                }
            }
            frame = write_queue.recv() => {
                match frame {
                    Some(frame) => {
                        stream.write_all(&frame).await?;
                        stream.flush().await?;
                    }
                    None => return Ok(()),
                }
            }
        }
    }
}
