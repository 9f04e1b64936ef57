//! Transmit scheduler.
//!
//! Exactly one frame is on the wire at a time. Frames are picked FIFO
//! within a priority class, acks first, beacons last, with a TXDELAY-sized
//! gap between transmissions so a half-duplex TNC gets its key-up time.

use std::collections::VecDeque;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Queued requests before senders block.
const QUEUE_SIZE: usize = 128;

/// Shutdown drain budget.
const DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(15);

/// Priority classes, highest first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Ack,
    Retry,
    User,
    Beacon,
}

#[derive(Debug)]
pub struct TxRequest {
    pub priority: Priority,
    /// Complete wire-format KISS frame.
    pub frame: Bytes,
}

#[derive(Clone, Debug)]
pub struct Scheduler {
    sender: mpsc::Sender<TxRequest>,
}

impl Scheduler {
    /// Spawn the scheduler writing to `sink` (the transport's frame queue).
    /// `txdelay` is in the KISS 10 ms units.
    pub fn spawn(sink: mpsc::Sender<Bytes>, txdelay: u8, shutdown: CancellationToken) -> Self {
        let (sender, requests) = mpsc::channel(QUEUE_SIZE);
        tokio::spawn(run(sink, requests, txdelay, shutdown));
        Self { sender }
    }

    pub async fn send(&self, priority: Priority, frame: Bytes) {
        if self.sender.send(TxRequest { priority, frame }).await.is_err() {
            tracing::warn!("transmit scheduler is gone, dropping frame");
        }
    }
}

async fn run(
    sink: mpsc::Sender<Bytes>,
    mut requests: mpsc::Receiver<TxRequest>,
    txdelay: u8,
    shutdown: CancellationToken,
) {
    let gap = std::time::Duration::from_millis(u64::from(txdelay) * 10);
    // one queue per priority class
    let mut queues: [VecDeque<Bytes>; 4] = Default::default();

    loop {
        // pull in everything already waiting so priorities can compete
        while let Ok(request) = requests.try_recv() {
            queues[request.priority as usize].push_back(request.frame);
        }

        let next = queues.iter_mut().find_map(VecDeque::pop_front);
        match next {
            Some(frame) => {
                if sink.send(frame).await.is_err() {
                    tracing::warn!("transport write queue closed, scheduler stopping");
                    return;
                }
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        drain(&sink, &mut queues, &mut requests).await;
                        return;
                    }
                    _ = tokio::time::sleep(gap) => {}
                }
            }
            None => {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        drain(&sink, &mut queues, &mut requests).await;
                        return;
                    }
                    request = requests.recv() => {
                        match request {
                            Some(request) => {
                                queues[request.priority as usize].push_back(request.frame);
                            }
                            None => return,
                        }
                    }
                }
            }
        }
    }
}

/// On shutdown, push whatever is still queued out within the grace period.
async fn drain(
    sink: &mpsc::Sender<Bytes>,
    queues: &mut [VecDeque<Bytes>; 4],
    requests: &mut mpsc::Receiver<TxRequest>,
) {
    while let Ok(request) = requests.try_recv() {
        queues[request.priority as usize].push_back(request.frame);
    }
    let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;

    while let Some(frame) = queues.iter_mut().find_map(VecDeque::pop_front) {
        let send = sink.send(frame);
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                tracing::warn!("shutdown drain timed out with frames still queued");
                return;
            }
            result = send => {
                if result.is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acks_preempt_beacons() {
        let (sink, mut wire) = mpsc::channel::<Bytes>(16);
        let shutdown = CancellationToken::new();
        // a long txdelay so the queue backs up behind the first frame
        let scheduler = Scheduler::spawn(sink, 20, shutdown.clone());

        scheduler.send(Priority::Beacon, Bytes::from_static(b"first")).await;
        // the first frame goes out immediately; these race the 200 ms gap
        scheduler.send(Priority::Beacon, Bytes::from_static(b"beacon")).await;
        scheduler.send(Priority::User, Bytes::from_static(b"user")).await;
        scheduler.send(Priority::Ack, Bytes::from_static(b"ack")).await;

        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(wire.recv().await.unwrap());
        }
        shutdown.cancel();

        assert_eq!(seen[0].as_ref(), b"first");
        assert_eq!(seen[1].as_ref(), b"ack");
        assert_eq!(seen[2].as_ref(), b"user");
        assert_eq!(seen[3].as_ref(), b"beacon");
    }

    #[tokio::test]
    async fn fifo_within_class() {
        let (sink, mut wire) = mpsc::channel::<Bytes>(16);
        let shutdown = CancellationToken::new();
        let scheduler = Scheduler::spawn(sink, 1, shutdown.clone());

        scheduler.send(Priority::User, Bytes::from_static(b"one")).await;
        scheduler.send(Priority::User, Bytes::from_static(b"two")).await;
        scheduler.send(Priority::User, Bytes::from_static(b"three")).await;

        assert_eq!(wire.recv().await.unwrap().as_ref(), b"one");
        assert_eq!(wire.recv().await.unwrap().as_ref(), b"two");
        assert_eq!(wire.recv().await.unwrap().as_ref(), b"three");
        shutdown.cancel();
    }
}
