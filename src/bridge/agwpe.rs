//! AGWPE protocol emulator.
//!
//! Speaks the SV2AGW packet-engine TCP protocol used by Direwolf, YAAC,
//! Outpost and others: a 36-byte little-endian header followed by a payload.
//! Monitor clients get every decoded frame re-formatted as a `U`/`I` record;
//! connected-mode requests drive the AX.25 link engine.
//!
//! - [AGWPE API](http://www.on7lds.net/42/sites/default/files/AGWPEAPI.HTM)

use bytes::{
    Buf,
    BufMut,
    Bytes,
    BytesMut,
};
use tokio::io::{
    AsyncReadExt,
    AsyncWriteExt,
};
use tokio::net::{
    TcpListener,
    TcpStream,
    tcp::OwnedWriteHalf,
};
use tokio::sync::{
    broadcast,
    mpsc,
    oneshot,
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    ax25::{
        Address,
        Callsign,
        Control,
        Frame,
        Supervisory,
        Unnumbered,
        connection::{
            ConnectionManager,
            LinkError,
            LinkEvent,
        },
    },
    engine::{
        Engine,
        MonitorFrame,
        parse_path,
    },
    kiss::{
        self,
        FrameKind,
    },
    scheduler::Scheduler,
};

pub const HEADER_SIZE: usize = 36;

/// Sanity cap on the payload length field.
const MAX_DATA_LENGTH: u32 = 2048;

const VERSION_STRING: &str = "aprs-console AGWPE 2005.127";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("agwpe io: {0}")]
    Io(#[from] std::io::Error),
    #[error("data length {0} exceeds maximum")]
    OversizeData(u32),
}

/// One AGWPE frame: fixed header plus payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgwpeFrame {
    pub port: u8,
    pub kind: u8,
    pub pid: u8,
    pub call_from: String,
    pub call_to: String,
    pub data: Bytes,
}

impl AgwpeFrame {
    pub fn new(kind: u8) -> Self {
        Self {
            port: 0,
            kind,
            pid: 0xf0,
            call_from: String::new(),
            call_to: String::new(),
            data: Bytes::new(),
        }
    }

    /// Parse the fixed header, returning the frame (data empty) and the
    /// payload length still to be read.
    pub fn parse_header(header: &[u8; HEADER_SIZE]) -> (Self, u32) {
        let mut buffer = &header[..];
        let port = buffer.get_u8();
        buffer.advance(3);
        let kind = buffer.get_u8();
        buffer.advance(1);
        let pid = buffer.get_u8();
        buffer.advance(1);

        let call_from = callsign_field(&header[8..18]);
        let call_to = callsign_field(&header[18..28]);

        let mut length_buffer = &header[28..32];
        let data_len = length_buffer.get_u32_le();

        (
            Self {
                port,
                kind,
                pid,
                call_from,
                call_to,
                data: Bytes::new(),
            },
            data_len,
        )
    }

    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(HEADER_SIZE + self.data.len());
        out.put_u8(self.port);
        out.put_bytes(0, 3);
        out.put_u8(self.kind);
        out.put_u8(0);
        out.put_u8(self.pid);
        out.put_u8(0);

        let mut call_from = [0u8; 10];
        for (slot, byte) in call_from.iter_mut().zip(self.call_from.bytes()) {
            *slot = byte;
        }
        out.put_slice(&call_from);

        let mut call_to = [0u8; 10];
        for (slot, byte) in call_to.iter_mut().zip(self.call_to.bytes()) {
            *slot = byte;
        }
        out.put_slice(&call_to);

        out.put_u32_le(self.data.len() as u32);
        out.put_u32_le(0);
        out.put_slice(&self.data);
        out.freeze()
    }
}

fn callsign_field(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_owned()
}

/// Commands from client handlers to the shared link hub.
enum HubCommand {
    Connect {
        peer: Callsign,
        path: Vec<Address>,
        respond: oneshot::Sender<Result<(), LinkError>>,
    },
    SendData {
        peer: Callsign,
        data: Bytes,
    },
    Disconnect {
        peer: Callsign,
        respond: oneshot::Sender<()>,
    },
}

/// The hub owns the [`ConnectionManager`]: it feeds it the I/S/U frames the
/// engine routes our way and executes client connect/send/disconnect
/// requests. Link events are re-broadcast to every client handler.
async fn link_hub(
    mut manager: ConnectionManager,
    mut link_frames: mpsc::Receiver<Frame>,
    mut link_events: mpsc::Receiver<LinkEvent>,
    mut commands: mpsc::Receiver<HubCommand>,
    events_out: broadcast::Sender<LinkEvent>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = link_frames.recv() => {
                match frame {
                    Some(frame) => manager.handle_frame(frame).await,
                    None => break,
                }
            }
            event = link_events.recv() => {
                match event {
                    Some(event) => {
                        let _ = events_out.send(event);
                    }
                    None => break,
                }
            }
            command = commands.recv() => {
                match command {
                    Some(HubCommand::Connect { peer, path, respond }) => {
                        let result = manager.connect(peer, path).await;
                        let _ = respond.send(result);
                    }
                    Some(HubCommand::SendData { peer, data }) => {
                        if let Err(error) = manager.send_data(&peer, data).await {
                            tracing::warn!(?error, %peer, "connected data not sent");
                        }
                    }
                    Some(HubCommand::Disconnect { peer, respond }) => {
                        manager.disconnect(&peer).await;
                        let _ = respond.send(());
                    }
                    None => break,
                }
            }
        }
    }
}

pub struct AgwpeServer {
    listener: TcpListener,
    engine: Engine,
    monitor: broadcast::Sender<MonitorFrame>,
    hub: mpsc::Sender<HubCommand>,
    link_events: broadcast::Sender<LinkEvent>,
    shutdown: CancellationToken,
}

impl AgwpeServer {
    /// Wire up the server and its link hub.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        listener: TcpListener,
        engine: Engine,
        scheduler: Scheduler,
        mycall: Callsign,
        monitor: broadcast::Sender<MonitorFrame>,
        link_frames: mpsc::Receiver<Frame>,
        shutdown: CancellationToken,
    ) -> Self {
        let (event_sender, event_receiver) = mpsc::channel(32);
        let manager = ConnectionManager::new(mycall, scheduler, event_sender, shutdown.clone());

        let (hub, hub_commands) = mpsc::channel(32);
        let (link_events, _) = broadcast::channel(64);
        tokio::spawn(link_hub(
            manager,
            link_frames,
            event_receiver,
            hub_commands,
            link_events.clone(),
            shutdown.clone(),
        ));

        Self {
            listener,
            engine,
            monitor,
            hub,
            link_events,
            shutdown,
        }
    }

    pub async fn serve(self) -> Result<(), Error> {
        let local = self.listener.local_addr()?;
        tracing::info!(%local, "AGWPE bridge listening");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = self.listener.accept() => {
                    let (connection, address) = result?;
                    let client = ClientHandler {
                        engine: self.engine.clone(),
                        hub: self.hub.clone(),
                        monitor: self.monitor.subscribe(),
                        link_events: self.link_events.subscribe(),
                        shutdown: self.shutdown.clone(),
                        mon_enabled: false,
                        raw_enabled: false,
                        registered_calls: Vec::new(),
                        active_peer: None,
                    };
                    let span = tracing::info_span!("agwpe_client", %address);
                    tokio::spawn(
                        async move {
                            tracing::info!("client connected");
                            if let Err(error) = client.run(connection).await {
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
}

struct ClientHandler {
    engine: Engine,
    hub: mpsc::Sender<HubCommand>,
    monitor: broadcast::Receiver<MonitorFrame>,
    link_events: broadcast::Receiver<LinkEvent>,
    shutdown: CancellationToken,
    mon_enabled: bool,
    raw_enabled: bool,
    registered_calls: Vec<String>,
    /// The remote end of the connection this client opened.
    active_peer: Option<Callsign>,
}

impl ClientHandler {
    async fn run(mut self, connection: TcpStream) -> Result<(), Error> {
        let (reader, mut writer) = connection.into_split();

        // reads run in their own task so a slow header never blocks (or gets
        // torn by) the monitor stream
        let (request_sender, mut requests) = mpsc::channel(16);
        let read_task = tokio::spawn(read_requests(reader, request_sender));

        let result = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break Ok(()),
                request = requests.recv() => {
                    match request {
                        Some(request) => {
                            if let Err(error) = self.handle_request(request, &mut writer).await {
                                break Err(error);
                            }
                        }
                        None => break Ok(()),
                    }
                }
                monitored = self.monitor.recv() => {
                    match monitored {
                        Ok(monitored) => {
                            if let Err(error) = self.emit_monitor(&monitored, &mut writer).await {
                                break Err(error);
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            tracing::warn!(missed, "monitor client lagging");
                        }
                        Err(broadcast::error::RecvError::Closed) => break Ok(()),
                    }
                }
                event = self.link_events.recv() => {
                    match event {
                        Ok(event) => {
                            if let Err(error) = self.emit_link_event(&event, &mut writer).await {
                                break Err(error);
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => break Ok(()),
                    }
                }
            }
        };

        read_task.abort();

        // a vanished client must not hold the link open
        if let Some(peer) = self.active_peer.take() {
            let (respond, done) = oneshot::channel();
            if self.hub.send(HubCommand::Disconnect { peer, respond }).await.is_ok() {
                let _ = done.await;
            }
        }

        result
    }

    async fn handle_request(
        &mut self,
        request: AgwpeFrame,
        writer: &mut OwnedWriteHalf,
    ) -> Result<(), Error> {
        tracing::debug!(
            kind = %(request.kind as char),
            from = %request.call_from,
            to = %request.call_to,
            len = request.data.len(),
            "request"
        );

        match request.kind {
            b'R' => {
                let mut response = AgwpeFrame::new(b'R');
                response.data = Bytes::from(format!("{VERSION_STRING}\r\n"));
                writer.write_all(&response.encode()).await?;
            }
            b'G' => {
                let mut response = AgwpeFrame::new(b'G');
                response.data = Bytes::from_static(b"1;Port1 KISS TNC on radio;");
                writer.write_all(&response.encode()).await?;
            }
            b'g' => {
                let mut response = AgwpeFrame::new(b'g');
                response.port = request.port;
                // baud, traffic, txdelay, txtail, persist, slottime,
                // maxframe, active connections
                response.data = Bytes::from_static(&[96, 0, 30, 10, 63, 10, 4, 0]);
                writer.write_all(&response.encode()).await?;
            }
            b'm' => {
                self.mon_enabled = !self.mon_enabled;
                tracing::debug!(enabled = self.mon_enabled, "monitor toggled");
            }
            b'k' => {
                self.raw_enabled = !self.raw_enabled;
                tracing::debug!(enabled = self.raw_enabled, "raw frames toggled");
            }
            b'X' => {
                if !request.call_from.is_empty()
                    && !self.registered_calls.contains(&request.call_from)
                {
                    self.registered_calls.push(request.call_from.clone());
                    tracing::info!(callsign = %request.call_from, "callsign registered");
                }
            }
            b'x' => {
                self.registered_calls.retain(|call| *call != request.call_from);
            }
            b'M' => {
                // unproto; a via path may ride comma-separated in call_to
                let mut parts = request.call_to.split(',');
                let destination = parts.next().unwrap_or_default().to_owned();
                let path = parts.collect::<Vec<_>>().join(",");
                self.send_unproto(&request.call_from, &destination, &path, &request.data)
                    .await;
            }
            b'V' => {
                // data: "DEST,VIA1,VIA2\0info"
                let (via, info) = match request.data.iter().position(|&b| b == 0) {
                    Some(zero) => (
                        String::from_utf8_lossy(&request.data[..zero]).into_owned(),
                        request.data.slice(zero + 1..),
                    ),
                    None => (request.call_to.clone(), request.data.clone()),
                };
                let mut parts = via.split(',');
                let destination = parts.next().unwrap_or_default().trim().to_owned();
                let path = parts.map(str::trim).collect::<Vec<_>>().join(",");
                self.send_unproto(&request.call_from, &destination, &path, &info)
                    .await;
            }
            b'K' => {
                // raw AX.25; wrap in KISS and transmit as-is
                let wire = kiss::encode_frame(0, FrameKind::Data, &request.data);
                self.engine.transmit_from_client(wire).await;
            }
            b'y' | b'Y' => {
                let mut response = AgwpeFrame::new(request.kind);
                response.port = request.port;
                response.call_from = request.call_from;
                response.call_to = request.call_to;
                let mut data = BytesMut::with_capacity(4);
                data.put_u32_le(0);
                response.data = data.freeze();
                writer.write_all(&response.encode()).await?;
            }
            b'C' | b'c' => {
                self.connect(request, Vec::new(), writer).await?;
            }
            b'v' => {
                // connect with via path: null-terminated "DEST,VIA1,..."
                let data = request.data.clone();
                let start = data.iter().position(|&b| b >= 0x20).unwrap_or(0);
                let end = data[start..]
                    .iter()
                    .position(|&b| b == 0)
                    .map(|p| start + p)
                    .unwrap_or(data.len());
                let via = String::from_utf8_lossy(&data[start..end]).into_owned();
                let mut parts = via.split(',');
                let destination = parts.next().unwrap_or_default().trim().to_owned();
                let path = parse_path(&parts.map(str::trim).collect::<Vec<_>>().join(","));

                let mut request = request;
                if !destination.is_empty() {
                    request.call_to = destination;
                }
                self.connect(request, path, writer).await?;
            }
            b'D' => {
                if let Some(peer) = self.active_peer.clone() {
                    let _ = self
                        .hub
                        .send(HubCommand::SendData {
                            peer,
                            data: request.data.clone(),
                        })
                        .await;
                }
                else {
                    tracing::warn!("connected data without an open connection");
                }
            }
            b'd' => {
                if let Some(peer) = self.active_peer.take() {
                    let (respond, done) = oneshot::channel();
                    if self.hub.send(HubCommand::Disconnect { peer, respond }).await.is_ok() {
                        let _ = done.await;
                    }
                }
                let mut response = AgwpeFrame::new(b'd');
                response.port = request.port;
                response.call_from = request.call_from;
                response.call_to = request.call_to;
                writer.write_all(&response.encode()).await?;
            }
            other => {
                tracing::debug!(kind = %(other as char), "unhandled AGWPE request");
            }
        }

        Ok(())
    }

    async fn send_unproto(&self, from: &str, destination: &str, path: &str, info: &[u8]) {
        let Ok(source) = from.parse::<Callsign>() else {
            tracing::warn!(from, "invalid source callsign in unproto");
            return;
        };
        let Ok(destination) = destination.parse::<Callsign>() else {
            tracing::warn!(destination, "invalid destination in unproto");
            return;
        };
        let frame = Frame::ui(
            source,
            destination,
            parse_path(path),
            Bytes::from(info.to_vec()),
        );
        let wire = kiss::encode_frame(0, FrameKind::Data, &frame.encode());
        self.engine.transmit_from_client(wire).await;
    }

    async fn connect(
        &mut self,
        request: AgwpeFrame,
        path: Vec<Address>,
        writer: &mut OwnedWriteHalf,
    ) -> Result<(), Error> {
        let Ok(peer) = request.call_to.parse::<Callsign>() else {
            tracing::warn!(to = %request.call_to, "invalid connect destination");
            return self.send_disconnected(&request, writer).await;
        };

        if self.active_peer.is_some() {
            tracing::warn!("connect refused, a connection is already active");
            return self.send_disconnected(&request, writer).await;
        }

        let (respond, result) = oneshot::channel();
        let sent = self
            .hub
            .send(HubCommand::Connect {
                peer: peer.clone(),
                path,
                respond,
            })
            .await;

        let connected = match sent {
            Ok(()) => matches!(result.await, Ok(Ok(()))),
            Err(_) => false,
        };

        if connected {
            self.active_peer = Some(peer);
            // Direwolf convention: the confirmation swaps the callsigns so
            // the client sees "remote is connected to local"
            let mut response = AgwpeFrame::new(b'C');
            response.port = request.port;
            response.call_from = request.call_to;
            response.call_to = request.call_from;
            writer.write_all(&response.encode()).await?;
        }
        else {
            self.send_disconnected(&request, writer).await?;
        }
        Ok(())
    }

    async fn send_disconnected(
        &self,
        request: &AgwpeFrame,
        writer: &mut OwnedWriteHalf,
    ) -> Result<(), Error> {
        let mut response = AgwpeFrame::new(b'd');
        response.port = request.port;
        response.call_from = request.call_from.clone();
        response.call_to = request.call_to.clone();
        writer.write_all(&response.encode()).await?;
        Ok(())
    }

    async fn emit_link_event(
        &mut self,
        event: &LinkEvent,
        writer: &mut OwnedWriteHalf,
    ) -> Result<(), Error> {
        match event {
            LinkEvent::Data { peer, pid, data } => {
                if self.active_peer.as_ref() == Some(peer) {
                    let mut response = AgwpeFrame::new(b'D');
                    response.pid = *pid;
                    response.call_from = peer.to_string();
                    response.data = data.clone();
                    writer.write_all(&response.encode()).await?;
                }
            }
            LinkEvent::Connected { peer, inbound } => {
                // inbound connections go to whoever registered a callsign
                if *inbound && !self.registered_calls.is_empty() && self.active_peer.is_none() {
                    self.active_peer = Some(peer.clone());
                    let mut response = AgwpeFrame::new(b'C');
                    response.call_from = peer.to_string();
                    response.call_to = self.registered_calls[0].clone();
                    writer.write_all(&response.encode()).await?;
                }
            }
            LinkEvent::Disconnected { peer } => {
                if self.active_peer.as_ref() == Some(peer) {
                    self.active_peer = None;
                    let mut response = AgwpeFrame::new(b'd');
                    response.call_from = peer.to_string();
                    writer.write_all(&response.encode()).await?;
                }
            }
        }
        Ok(())
    }

    async fn emit_monitor(
        &mut self,
        monitored: &MonitorFrame,
        writer: &mut OwnedWriteHalf,
    ) -> Result<(), Error> {
        if self.mon_enabled {
            let record = monitor_record(&monitored.frame, &monitored.raw);
            let kind = match monitored.frame.control {
                Control::Information { .. } => b'I',
                _ => b'U',
            };
            let mut response = AgwpeFrame::new(kind);
            response.pid = monitored.frame.pid.unwrap_or(0xf0);
            response.call_from = monitored.frame.source.callsign.to_string();
            response.call_to = monitored.frame.destination.callsign.to_string();
            response.data = record;
            writer.write_all(&response.encode()).await?;
        }

        if self.raw_enabled {
            let mut response = AgwpeFrame::new(b'K');
            response.data = monitored.raw.clone();
            writer.write_all(&response.encode()).await?;
        }

        Ok(())
    }
}

/// Sequential request reader: a slow client can only ever stall itself.
async fn read_requests(
    mut reader: tokio::net::tcp::OwnedReadHalf,
    out: mpsc::Sender<AgwpeFrame>,
) -> Result<(), Error> {
    let mut header = [0u8; HEADER_SIZE];
    loop {
        if reader.read_exact(&mut header).await.is_err() {
            return Ok(());
        }
        let (mut frame, data_len) = AgwpeFrame::parse_header(&header);
        if data_len > MAX_DATA_LENGTH {
            return Err(Error::OversizeData(data_len));
        }
        if data_len > 0 {
            let mut data = vec![0u8; data_len as usize];
            reader.read_exact(&mut data).await?;
            frame.data = Bytes::from(data);
        }
        if out.send(frame).await.is_err() {
            return Ok(());
        }
    }
}

/// `0: SRC>DST,PATH <UI Len=42> [HH:MM:SS]\r\ninfo`
fn monitor_record(frame: &Frame, raw: &Bytes) -> Bytes {
    let frame_type = match frame.control {
        Control::Information { ns, nr, .. } => format!("I N(S)={ns} N(R)={nr}"),
        Control::Supervisory { kind, nr, .. } => {
            let name = match kind {
                Supervisory::ReceiveReady => "RR",
                Supervisory::ReceiveNotReady => "RNR",
                Supervisory::Reject => "REJ",
                Supervisory::SelectiveReject => "SREJ",
            };
            format!("{name} N(R)={nr}")
        }
        Control::UnnumberedInformation { .. } => {
            match frame.pid {
                Some(pid) => format!("UI pid={pid:02X}"),
                None => "UI".to_owned(),
            }
        }
        Control::Unnumbered { kind, .. } => {
            match kind {
                Unnumbered::Sabm => "SABM",
                Unnumbered::Disconnect => "DISC",
                Unnumbered::DisconnectedMode => "DM",
                Unnumbered::UnnumberedAck => "UA",
                Unnumbered::FrameReject => "FRMR",
                Unnumbered::Other(_) => "U",
            }
            .to_owned()
        }
    };

    let time = chrono::Local::now().format("%H:%M:%S");
    let header = format!(
        "0: {} <{frame_type} Len={}> [{time}]\r\n",
        frame.header_string(),
        raw.len(),
    );

    let mut out = BytesMut::with_capacity(header.len() + frame.info.len());
    out.put_slice(header.as_bytes());
    out.put_slice(&frame.info);
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let mut frame = AgwpeFrame::new(b'C');
        frame.port = 2;
        frame.pid = 0xf0;
        frame.call_from = "K1FSY-9".to_owned();
        frame.call_to = "W1ABC".to_owned();
        frame.data = Bytes::from_static(b"payload");

        let wire = frame.encode();
        assert_eq!(wire.len(), HEADER_SIZE + 7);

        let header: [u8; HEADER_SIZE] = wire[..HEADER_SIZE].try_into().unwrap();
        let (parsed, data_len) = AgwpeFrame::parse_header(&header);
        assert_eq!(parsed.port, 2);
        assert_eq!(parsed.kind, b'C');
        assert_eq!(parsed.call_from, "K1FSY-9");
        assert_eq!(parsed.call_to, "W1ABC");
        assert_eq!(data_len, 7);
    }

    #[test]
    fn data_length_is_little_endian() {
        let mut frame = AgwpeFrame::new(b'D');
        frame.data = Bytes::from(vec![0u8; 0x0102]);
        let wire = frame.encode();
        assert_eq!(&wire[28..32], &[0x02, 0x01, 0x00, 0x00]);
    }

    #[test]
    fn monitor_record_format() {
        let frame = Frame::ui(
            "K1FSY-9".parse().unwrap(),
            "APRS".parse().unwrap(),
            Vec::new(),
            Bytes::from_static(b"!4237.14N/07107.45W-"),
        );
        let raw = frame.encode();
        let record = monitor_record(&frame, &raw);
        let text = String::from_utf8_lossy(&record);
        assert!(text.starts_with("0: K1FSY-9>APRS <UI pid=F0 Len="));
        assert!(text.contains("\r\n!4237.14N/07107.45W-"));
    }
}
