//! Raw KISS-over-TCP bridge.
//!
//! Every frame heard on the radio is broadcast to all connected clients;
//! every complete KISS data frame a client sends is queued for transmission.
//! Client frames are re-framed through the decoder so a misbehaving client
//! cannot corrupt the shared wire, and each client keeps its own FIFO into
//! the transmit scheduler.

use bytes::Bytes;
use tokio::io::{
    AsyncReadExt,
    AsyncWriteExt,
};
use tokio::net::{
    TcpListener,
    TcpStream,
};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    engine::Engine,
    kiss::{
        self,
        KissDecoder,
    },
};

const READ_BUFFER_SIZE: usize = 4096;

pub async fn serve(
    listener: TcpListener,
    engine: Engine,
    rx_kiss: broadcast::Sender<Bytes>,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    let local = listener.local_addr()?;
    tracing::info!(%local, "KISS bridge listening");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            result = listener.accept() => {
                let (connection, address) = result?;
                let engine = engine.clone();
                let subscription = rx_kiss.subscribe();
                let shutdown = shutdown.clone();
                let span = tracing::info_span!("kiss_client", %address);
                tokio::spawn(
                    async move {
                        tracing::info!("client connected");
                        if let Err(error) = handle_client(connection, engine, subscription, shutdown).await {
                            tracing::debug!(?error, "client error");
                        }
                        tracing::info!("client disconnected");
                    }
                    .instrument(span),
                );
            }
        }
    }

    Ok(())
}

async fn handle_client(
    mut connection: TcpStream,
    engine: Engine,
    mut subscription: broadcast::Receiver<Bytes>,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    let (mut reader, mut writer) = connection.split();
    let mut buffer = [0u8; READ_BUFFER_SIZE];
    let mut decoder = KissDecoder::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = subscription.recv() => {
                match frame {
                    Ok(frame) => {
                        writer.write_all(&frame).await?;
                        writer.flush().await?;
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        // slow client: drop what it missed, keep the stream
                        tracing::warn!(missed, "client lagging, frames dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            result = reader.read(&mut buffer) => {
                let n = result?;
                if n == 0 {
                    break;
                }
                let (frames, errors) = decoder.push(&buffer[..n]);
                for error in errors {
                    tracing::debug!(?error, "client framing error");
                }
                for frame in frames {
                    let wire = kiss::encode_frame(frame.port, frame.kind, &frame.payload);
                    engine.transmit_from_client(wire).await;
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcasts_rx_frames_to_clients() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let (rx_kiss, _) = broadcast::channel(16);
        let shutdown = CancellationToken::new();

        // an engine stub: commands go nowhere relevant for this test
        let engine = test_engine(shutdown.clone());

        let sender = rx_kiss.clone();
        tokio::spawn(serve(listener, engine, rx_kiss, shutdown.clone()));

        let mut client = TcpStream::connect(address).await.unwrap();
        // give the accept loop a beat to subscribe the client
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let frame = kiss::encode_frame(0, kiss::FrameKind::Data, b"hello");
        sender.send(frame.clone()).unwrap();

        let mut received = vec![0u8; frame.len()];
        client.read_exact(&mut received).await.unwrap();
        assert_eq!(received, frame.to_vec());
        shutdown.cancel();
    }

    fn test_engine(shutdown: CancellationToken) -> Engine {
        use std::sync::Arc;

        use tokio::sync::{
            mpsc,
            watch,
        };

        use crate::{
            config::Config,
            engine::EngineSetup,
            events::EventBus,
            scheduler::Scheduler,
            transport,
        };

        let (sink, _wire) = mpsc::channel(16);
        let (rx_kiss, _) = broadcast::channel(4);
        let (monitor, _) = broadcast::channel(4);
        let (link_frames, _link_rx) = mpsc::channel(4);
        let (_state_tx, state_rx) = watch::channel(transport::LinkState::Connected);
        let (_rx_tx, rx_queue) = mpsc::channel(4);
        let dir = std::env::temp_dir().join("aprs-console-kiss-bridge-test");
        std::fs::create_dir_all(&dir).unwrap();

        Engine::spawn(
            EngineSetup {
                config: Arc::new(parking_lot::RwLock::new(Config::default())),
                scheduler: Scheduler::spawn(sink, 0, shutdown.clone()),
                rx_kiss,
                monitor,
                link_frames,
                events: EventBus::new(),
                transport_state: state_rx,
                db_path: dir.join("stations.json.gz"),
                framebuf_path: dir.join("frames.json.gz"),
            },
            rx_queue,
            shutdown,
        )
    }
}
