//! The engine reactor.
//!
//! All shared mutable state — the station database, the message manager,
//! the digipeater and the frame buffer — lives in one task driven by a
//! command channel. Received transport bytes run through the KISS framer
//! and the AX.25 codec here, then fan out to the APRS pipeline, the
//! connected-mode engine, and the bridges. The [`Engine`] handle is just a
//! cheap-to-clone sender to that task.

use std::collections::HashMap;
use std::hash::{
    Hash,
    Hasher,
};
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{
    DateTime,
    Duration,
    Utc,
};
use serde::Serialize;
use tokio::sync::{
    broadcast,
    mpsc,
    oneshot,
    watch,
};
use tokio_util::sync::CancellationToken;

use crate::{
    aprs::{
        self,
        AprsPayload,
        LatLon,
        Symbol,
        grid,
        message::MessageContent,
        position,
    },
    ax25::{
        Address,
        Callsign,
        Frame,
        PID_NO_LAYER3,
    },
    config::Config,
    digipeater::Digipeater,
    events::{
        self,
        EventBus,
    },
    framebuf::{
        Direction,
        FrameBuffer,
    },
    kiss::{
        self,
        FrameKind,
        KissDecoder,
    },
    messages::{
        Incoming,
        MessageManager,
        MessageRecord,
    },
    scheduler::{
        Priority,
        Scheduler,
    },
    station::{
        self,
        PositionEntry,
        RxMeta,
        Station,
        StationDb,
    },
    transport,
};

/// Seconds a (source, info) pair suppresses duplicate APRS processing.
const APRS_DEDUP_WINDOW_SECS: i64 = 30;

const COMMAND_QUEUE_SIZE: usize = 64;

/// Message retry ticker.
const TICK_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

/// Database persistence ticker.
const PERSIST_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);

pub type SharedConfig = Arc<parking_lot::RwLock<Config>>;

/// A decoded frame plus its raw AX.25 bytes, for monitor taps.
#[derive(Clone, Debug)]
pub struct MonitorFrame {
    pub frame: Frame,
    pub raw: Bytes,
    pub direction: Direction,
}

/// Wiring for the engine task.
pub struct EngineSetup {
    pub config: SharedConfig,
    pub scheduler: Scheduler,
    /// Raw received KISS frames, re-broadcast to KISS bridge clients.
    pub rx_kiss: broadcast::Sender<Bytes>,
    /// Decoded frames for AGWPE monitor clients.
    pub monitor: broadcast::Sender<MonitorFrame>,
    /// I/S/U frames addressed to us, for the connected-mode engine.
    pub link_frames: mpsc::Sender<Frame>,
    pub events: EventBus,
    pub transport_state: watch::Receiver<transport::LinkState>,
    pub db_path: PathBuf,
    pub framebuf_path: PathBuf,
}

#[derive(Clone, Debug, Serialize)]
pub struct StatusInfo {
    pub mycall: String,
    pub uptime_seconds: i64,
    pub station_count: usize,
    pub unread_messages: usize,
    pub packets_digipeated: u64,
    pub transport: transport::LinkState,
    pub version: &'static str,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StationSort {
    Last,
    Name,
    Packets,
    Hops,
}

impl StationSort {
    pub fn from_query(value: &str) -> Self {
        match value {
            "name" => Self::Name,
            "packets" => Self::Packets,
            "hops" => Self::Hops,
            _ => Self::Last,
        }
    }
}

enum Command {
    FromClient {
        wire: Bytes,
    },
    SendMessage {
        to_call: String,
        body: String,
        respond: oneshot::Sender<String>,
    },
    SendBeacon {
        respond: oneshot::Sender<Result<(), String>>,
    },
    Stations {
        sort: StationSort,
        respond: oneshot::Sender<Vec<Station>>,
    },
    StationDetail {
        callsign: String,
        respond: oneshot::Sender<Option<Station>>,
    },
    WeatherStations {
        respond: oneshot::Sender<Vec<Station>>,
    },
    Digipeaters {
        respond: oneshot::Sender<Vec<Station>>,
    },
    Messages {
        unread_only: bool,
        respond: oneshot::Sender<Vec<MessageRecord>>,
    },
    Monitored {
        limit: Option<usize>,
        callsign: Option<String>,
        respond: oneshot::Sender<Vec<MessageRecord>>,
    },
    Status {
        respond: oneshot::Sender<StatusInfo>,
    },
    Persist,
}

/// Handle to the engine reactor.
#[derive(Clone)]
pub struct Engine {
    commands: mpsc::Sender<Command>,
}

impl Engine {
    pub fn spawn(
        setup: EngineSetup,
        rx_bytes: mpsc::Receiver<Bytes>,
        shutdown: CancellationToken,
    ) -> Self {
        let (commands, command_queue) = mpsc::channel(COMMAND_QUEUE_SIZE);

        tokio::spawn(async move {
            let reactor = Reactor::new(setup);
            reactor.run(rx_bytes, command_queue, shutdown).await;
        });

        Self { commands }
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let (respond, result) = oneshot::channel();
        self.commands.send(build(respond)).await.ok()?;
        result.await.ok()
    }

    /// A raw KISS frame from a bridge client, to be transmitted.
    pub async fn transmit_from_client(&self, wire: Bytes) {
        let _ = self.commands.send(Command::FromClient { wire }).await;
    }

    pub async fn send_message(&self, to_call: &str, body: &str) -> Option<String> {
        self.request(|respond| {
            Command::SendMessage {
                to_call: to_call.to_owned(),
                body: body.to_owned(),
                respond,
            }
        })
        .await
    }

    pub async fn send_beacon(&self) -> Result<(), String> {
        self.request(|respond| Command::SendBeacon { respond })
            .await
            .unwrap_or_else(|| Err("engine gone".to_owned()))
    }

    pub async fn stations(&self, sort: StationSort) -> Vec<Station> {
        self.request(|respond| Command::Stations { sort, respond })
            .await
            .unwrap_or_default()
    }

    pub async fn station(&self, callsign: &str) -> Option<Station> {
        self.request(|respond| {
            Command::StationDetail {
                callsign: callsign.to_owned(),
                respond,
            }
        })
        .await
        .flatten()
    }

    pub async fn weather_stations(&self) -> Vec<Station> {
        self.request(|respond| Command::WeatherStations { respond })
            .await
            .unwrap_or_default()
    }

    pub async fn digipeaters(&self) -> Vec<Station> {
        self.request(|respond| Command::Digipeaters { respond })
            .await
            .unwrap_or_default()
    }

    pub async fn messages(&self, unread_only: bool) -> Vec<MessageRecord> {
        self.request(|respond| {
            Command::Messages {
                unread_only,
                respond,
            }
        })
        .await
        .unwrap_or_default()
    }

    pub async fn monitored_messages(
        &self,
        limit: Option<usize>,
        callsign: Option<String>,
    ) -> Vec<MessageRecord> {
        self.request(|respond| {
            Command::Monitored {
                limit,
                callsign,
                respond,
            }
        })
        .await
        .unwrap_or_default()
    }

    pub async fn status(&self) -> Option<StatusInfo> {
        self.request(|respond| Command::Status { respond }).await
    }

    pub async fn persist(&self) {
        let _ = self.commands.send(Command::Persist).await;
    }
}

struct Reactor {
    config: SharedConfig,
    scheduler: Scheduler,
    rx_kiss: broadcast::Sender<Bytes>,
    monitor: broadcast::Sender<MonitorFrame>,
    link_frames: mpsc::Sender<Frame>,
    events: EventBus,
    transport_state: watch::Receiver<transport::LinkState>,
    db_path: PathBuf,
    framebuf_path: PathBuf,

    decoder: KissDecoder,
    db: StationDb,
    messages: MessageManager,
    digipeater: Digipeater,
    framebuf: FrameBuffer,
    aprs_dedup: HashMap<u64, DateTime<Utc>>,
    started_at: DateTime<Utc>,
}

impl Reactor {
    fn new(setup: EngineSetup) -> Self {
        let (mycall, max_retries, retry_fast, retry_slow, auto_ack, digipeat, direct_only, alias, buffer_bytes) = {
            let config = setup.config.read();
            (
                parse_mycall(&config.mycall),
                config.retry,
                config.retry_fast,
                config.retry_slow,
                config.auto_ack,
                config.digipeat,
                config.digipeat_direct_only,
                (!config.myalias.is_empty()).then(|| config.myalias.clone()),
                config.debug_buffer_bytes(),
            )
        };

        let (db, monitored) = station::persist::load(&setup.db_path, station::DEFAULT_POSITION_LIMIT);
        let mut messages = MessageManager::new(mycall.clone(), max_retries, retry_fast, retry_slow, auto_ack);
        messages.restore_monitored(monitored);
        let framebuf = FrameBuffer::load(&setup.framebuf_path, buffer_bytes);

        tracing::info!(
            stations = db.len(),
            frames = framebuf.len(),
            %mycall,
            "engine state loaded"
        );

        Self {
            config: setup.config,
            scheduler: setup.scheduler,
            rx_kiss: setup.rx_kiss,
            monitor: setup.monitor,
            link_frames: setup.link_frames,
            events: setup.events,
            transport_state: setup.transport_state,
            db_path: setup.db_path,
            framebuf_path: setup.framebuf_path,
            decoder: KissDecoder::new(),
            db,
            messages,
            digipeater: Digipeater::new(mycall, alias, digipeat, direct_only),
            framebuf,
            aprs_dedup: HashMap::new(),
            started_at: Utc::now(),
        }
    }

    async fn run(
        mut self,
        mut rx_bytes: mpsc::Receiver<Bytes>,
        mut commands: mpsc::Receiver<Command>,
        shutdown: CancellationToken,
    ) {
        let mut retry_tick = tokio::time::interval(TICK_INTERVAL);
        let mut persist_tick = tokio::time::interval(PERSIST_INTERVAL);
        persist_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                chunk = rx_bytes.recv() => {
                    match chunk {
                        Some(chunk) => self.handle_rx_bytes(chunk).await,
                        None => break,
                    }
                }
                command = commands.recv() => {
                    match command {
                        Some(command) => self.handle_command(command).await,
                        None => break,
                    }
                }
                _ = retry_tick.tick() => self.handle_retry_tick().await,
                _ = persist_tick.tick() => self.persist(),
            }
        }

        // final persistence is part of shutdown, not best-effort
        self.persist();
        tracing::info!("engine stopped");
    }

    async fn handle_rx_bytes(&mut self, chunk: Bytes) {
        let (frames, errors) = self.decoder.push(&chunk);
        for error in errors {
            tracing::debug!(?error, "kiss framing error");
        }
        for kiss_frame in frames {
            if kiss_frame.kind != FrameKind::Data {
                tracing::debug!(kind = ?kiss_frame.kind, "ignoring KISS control frame from TNC");
                continue;
            }
            self.process_received(kiss_frame.port, kiss_frame.payload).await;
        }
    }

    async fn process_received(&mut self, port: u8, payload: Bytes) {
        let now = Utc::now();
        let wire = kiss::encode_frame(port, FrameKind::Data, &payload);
        let frame_number = self.framebuf.record(Direction::Rx, wire.clone(), now);

        // bridges see every frame, decodable or not
        let _ = self.rx_kiss.send(wire);

        let frame = match Frame::parse(&payload) {
            Ok(frame) => frame,
            Err(error) => {
                tracing::debug!(?error, len = payload.len(), "undecodable AX.25 frame");
                return;
            }
        };

        let _ = self.monitor.send(MonitorFrame {
            frame: frame.clone(),
            raw: payload,
            direction: Direction::Rx,
        });

        if frame.is_ui() {
            if frame.pid == Some(PID_NO_LAYER3) {
                self.process_aprs(&frame, now, frame_number).await;
            }
            return;
        }

        // connected-mode traffic for us goes to the link engine
        let mycall = self.digipeater_mycall();
        if frame.destination.callsign == mycall {
            let _ = self.link_frames.send(frame).await;
        }
    }

    async fn process_aprs(&mut self, frame: &Frame, now: DateTime<Utc>, frame_number: u64) {
        let source = frame.source.callsign.clone();
        let destination = frame.destination.callsign.clone();

        let payload = match aprs::decode(&frame.info, &destination) {
            Ok(payload) => payload,
            Err(error) => {
                tracing::debug!(%source, ?error, "undecodable APRS payload");
                // still worth a station record: we heard them
                let meta = self.meta_for(frame, None, now, frame_number);
                self.db.observe(&source.to_string(), "unknown", &meta, false);
                return;
            }
        };

        let is_duplicate = self.is_aprs_duplicate(&source, &frame.info, now);
        let meta = self.meta_for(frame, None, now, frame_number);
        self.apply_payload(&source, payload, &meta, is_duplicate, frame.hop_count() > 0)
            .await;

        if !is_duplicate {
            self.maybe_digipeat(frame, now).await;
        }
    }

    fn meta_for(
        &self,
        frame: &Frame,
        relay: Option<String>,
        now: DateTime<Utc>,
        frame_number: u64,
    ) -> RxMeta {
        RxMeta {
            now,
            relay,
            path: frame.path.iter().map(ToString::to_string).collect(),
            frame_number: Some(frame_number),
        }
    }

    /// Apply one decoded payload to the station database and the message
    /// manager. Third-party wrappers are unwrapped with the relay recorded;
    /// tunneled packets are never digipeated and never count as direct RF.
    async fn apply_payload(
        &mut self,
        source: &Callsign,
        mut payload: AprsPayload,
        meta: &RxMeta,
        is_duplicate: bool,
        mut heard_digipeated: bool,
    ) {
        let mut source = source.clone();
        let mut meta = meta.clone();
        while let AprsPayload::ThirdParty {
            source: inner_source,
            payload: inner_payload,
        } = payload
        {
            self.db
                .observe(&source.to_string(), "third_party_relay", &meta, is_duplicate);
            meta = RxMeta {
                now: meta.now,
                relay: Some(source.to_string()),
                path: Vec::new(),
                frame_number: meta.frame_number,
            };
            source = inner_source;
            payload = *inner_payload;
            heard_digipeated = false;
        }
        let meta = &meta;
        let source = &source;

        let source_str = source.to_string();
        match payload {
            AprsPayload::Position(report) => {
                self.db.observe(&source_str, "position", meta, is_duplicate);
                if let Some(entry) = PositionEntry::from_report(&report, meta.now, meta.path.len()) {
                    self.db.record_position(&source_str, entry, report.device);
                }
                if let Some(weather) = report.weather {
                    self.db.record_weather(&source_str, weather, meta.now);
                    self.publish_station(&source_str, events::WEATHER_UPDATE);
                }
                self.publish_station(&source_str, events::STATION_UPDATE);
            }
            AprsPayload::Object(named) | AprsPayload::Item(named) => {
                // position belongs to the object, activity to the sender
                self.db.observe(&source_str, "object", meta, is_duplicate);
                if named.alive {
                    self.db.observe(&named.name, "object", meta, true);
                    if let Some(entry) =
                        PositionEntry::from_report(&named.report, meta.now, meta.path.len())
                    {
                        self.db.record_position(&named.name, entry, None);
                    }
                    self.publish_station(&named.name, events::STATION_UPDATE);
                }
            }
            AprsPayload::Weather(report) => {
                self.db.observe(&source_str, "weather", meta, is_duplicate);
                self.db.record_weather(&source_str, report, meta.now);
                self.publish_station(&source_str, events::WEATHER_UPDATE);
            }
            AprsPayload::Status(status) => {
                self.db.observe(&source_str, "status", meta, is_duplicate);
                self.db
                    .record_status(&source_str, status.text, status.grid, meta.now);
                self.publish_station(&source_str, events::STATION_UPDATE);
            }
            AprsPayload::Telemetry(report) => {
                self.db.observe(&source_str, "telemetry", meta, is_duplicate);
                self.db.record_telemetry(&source_str, report, meta.now);
            }
            AprsPayload::Message(message) => {
                let packet_type = match &message.content {
                    MessageContent::Ack { .. } | MessageContent::Reject { .. } => "message_ack",
                    MessageContent::TelemetryDefinition { .. } => "telemetry_config",
                    MessageContent::Text { .. } => "message",
                };
                self.db.observe(&source_str, packet_type, meta, is_duplicate);

                let addressed_to_us = {
                    let outcome =
                        self.messages
                            .handle_incoming(source, &message, heard_digipeated, meta.now);
                    match outcome {
                        Incoming::Stored { ack } => {
                            if let Some(record) = self.messages.messages(true).last() {
                                self.events.publish(events::MESSAGE_RECEIVED, record);
                            }
                            if let Some(ack_info) = ack {
                                self.transmit_info(&ack_info, Priority::Ack).await;
                            }
                            true
                        }
                        Incoming::Monitored | Incoming::Consumed => false,
                    }
                };
                if matches!(message.content, MessageContent::Text { .. }) {
                    self.db.note_message_from(&source_str, addressed_to_us);
                }
            }
            AprsPayload::ThirdParty { .. } => unreachable!("unwrapped above"),
            AprsPayload::Unknown { data_type } => {
                tracing::debug!(%source, %data_type, "unhandled APRS data type");
                self.db.observe(&source_str, "unknown", meta, is_duplicate);
            }
        }
    }

    async fn maybe_digipeat(&mut self, frame: &Frame, now: DateTime<Utc>) {
        let source_is_digi = self
            .db
            .get(&frame.source.callsign.to_string())
            .map(|s| s.is_digipeater)
            .unwrap_or(false);

        if let Some(repeated) = self.digipeater.process(frame, source_is_digi, now) {
            let wire = kiss::encode_frame(0, FrameKind::Data, &repeated.encode());
            self.framebuf.record(Direction::Tx, wire.clone(), now);
            let _ = self.monitor.send(MonitorFrame {
                frame: repeated.clone(),
                raw: repeated.encode(),
                direction: Direction::Tx,
            });
            self.scheduler.send(Priority::User, wire).await;
        }
    }

    fn is_aprs_duplicate(&mut self, source: &Callsign, info: &[u8], now: DateTime<Utc>) -> bool {
        let window = Duration::seconds(APRS_DEDUP_WINDOW_SECS);
        self.aprs_dedup.retain(|_, seen| now - *seen <= window);

        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        source.to_string().hash(&mut hasher);
        info.hash(&mut hasher);
        let key = hasher.finish();

        if self.aprs_dedup.contains_key(&key) {
            tracing::debug!(%source, "duplicate packet suppressed");
            return true;
        }
        self.aprs_dedup.insert(key, now);
        false
    }

    /// Build and queue a UI frame carrying `info` from us to the configured
    /// unproto destination over the configured path.
    async fn transmit_info(&mut self, info: &str, priority: Priority) {
        let (mycall, unproto, path) = {
            let config = self.config.read();
            (
                parse_mycall(&config.mycall),
                config.unproto.clone(),
                config.beacon_path.clone(),
            )
        };
        let destination = unproto.parse().unwrap_or_else(|_| fallback_destination());
        let frame = Frame::ui(
            mycall,
            destination,
            parse_path(&path),
            Bytes::from(info.as_bytes().to_vec()),
        );

        let wire = kiss::encode_frame(0, FrameKind::Data, &frame.encode());
        self.framebuf.record(Direction::Tx, wire.clone(), Utc::now());
        let _ = self.monitor.send(MonitorFrame {
            raw: frame.encode(),
            frame,
            direction: Direction::Tx,
        });
        self.scheduler.send(priority, wire).await;
    }

    async fn handle_retry_tick(&mut self) {
        let now = Utc::now();
        let due = self.messages.tick(now);
        for retransmission in due {
            tracing::info!(to = %retransmission.to_call, "retrying message");
            self.transmit_info(&retransmission.info, Priority::Retry).await;
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::FromClient { wire } => {
                self.framebuf.record(Direction::Tx, wire.clone(), Utc::now());
                self.scheduler.send(Priority::User, wire).await;
            }
            Command::SendMessage {
                to_call,
                body,
                respond,
            } => {
                let (id, info) = self.messages.send(&to_call, &body, Utc::now());
                self.transmit_info(&info, Priority::User).await;
                let _ = respond.send(id);
            }
            Command::SendBeacon { respond } => {
                let _ = respond.send(self.send_beacon().await);
            }
            Command::Stations { sort, respond } => {
                let mut stations: Vec<Station> = self.db.stations().cloned().collect();
                sort_stations(&mut stations, sort);
                let _ = respond.send(stations);
            }
            Command::StationDetail { callsign, respond } => {
                let _ = respond.send(self.db.get(&callsign).cloned());
            }
            Command::WeatherStations { respond } => {
                let mut stations: Vec<Station> = self
                    .db
                    .stations()
                    .filter(|s| s.last_weather.is_some())
                    .cloned()
                    .collect();
                stations.sort_by(|a, b| b.last_heard.cmp(&a.last_heard));
                let _ = respond.send(stations);
            }
            Command::Digipeaters { respond } => {
                let mut stations: Vec<Station> = self
                    .db
                    .stations()
                    .filter(|s| s.is_digipeater)
                    .cloned()
                    .collect();
                stations.sort_by(|a, b| a.callsign.cmp(&b.callsign));
                let _ = respond.send(stations);
            }
            Command::Messages {
                unread_only,
                respond,
            } => {
                let _ = respond.send(self.messages.messages(unread_only).into_iter().cloned().collect());
            }
            Command::Monitored {
                limit,
                callsign,
                respond,
            } => {
                let _ = respond.send(
                    self.messages
                        .monitored(limit, callsign.as_deref())
                        .into_iter()
                        .cloned()
                        .collect(),
                );
            }
            Command::Status { respond } => {
                let config = self.config.read();
                let _ = respond.send(StatusInfo {
                    mycall: config.mycall.clone(),
                    uptime_seconds: (Utc::now() - self.started_at).num_seconds(),
                    station_count: self.db.len(),
                    unread_messages: self.messages.unread_count(),
                    packets_digipeated: self.digipeater.packets_digipeated,
                    transport: *self.transport_state.borrow(),
                    version: env!("CARGO_PKG_VERSION"),
                });
            }
            Command::Persist => self.persist(),
        }
    }

    /// Position beacon from the configured locator.
    async fn send_beacon(&mut self) -> Result<(), String> {
        let (location, symbol, comment) = {
            let config = self.config.read();
            (
                config.mylocation.clone(),
                config.beacon_symbol.clone(),
                config.beacon_comment.clone(),
            )
        };
        if location.is_empty() {
            return Err("MYLOCATION is not set".to_owned());
        }
        let (latitude, longitude) =
            grid::maidenhead_to_latlon(&location).map_err(|e| e.to_string())?;
        let position = LatLon::new(latitude, longitude).map_err(|e| e.to_string())?;

        let mut symbol_chars = symbol.chars();
        let symbol = Symbol {
            table: symbol_chars.next().unwrap_or('/'),
            code: symbol_chars.next().unwrap_or('['),
        };

        let info = format!("!{}{}", position::encode_uncompressed(position, symbol), comment);
        self.transmit_info(&info, Priority::Beacon).await;
        Ok(())
    }

    fn publish_station(&self, callsign: &str, kind: &'static str) {
        if let Some(station) = self.db.get(callsign) {
            self.events.publish(kind, station);
        }
    }

    fn digipeater_mycall(&self) -> Callsign {
        parse_mycall(&self.config.read().mycall)
    }

    fn persist(&mut self) {
        match station::persist::save(&self.db, self.messages.monitored_records(), &self.db_path) {
            Ok(count) => tracing::debug!(stations = count, "database saved"),
            Err(error) => tracing::warn!(?error, "database save failed, retrying next tick"),
        }
        if let Err(error) = self.framebuf.save(&self.framebuf_path) {
            tracing::warn!(?error, "frame buffer save failed");
        }
    }
}

fn parse_mycall(value: &str) -> Callsign {
    value
        .parse()
        .unwrap_or_else(|_| Callsign::new("NOCALL", 0).expect("static callsign"))
}

fn fallback_destination() -> Callsign {
    Callsign::new("APZ001", 0).expect("static callsign")
}

/// `WIDE1-1,WIDE2-1` → address list; `*` marks survive for completeness.
pub fn parse_path(path: &str) -> Vec<Address> {
    path.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .filter_map(|part| {
            let repeated = part.ends_with('*');
            part.parse::<Callsign>()
                .ok()
                .map(|call| Address::new(call).with_top_bit(repeated))
        })
        .collect()
}

fn sort_stations(stations: &mut [Station], sort: StationSort) {
    match sort {
        StationSort::Last => stations.sort_by(|a, b| b.last_heard.cmp(&a.last_heard)),
        StationSort::Name => stations.sort_by(|a, b| a.callsign.cmp(&b.callsign)),
        StationSort::Packets => stations.sort_by(|a, b| b.packets_heard.cmp(&a.packets_heard)),
        StationSort::Hops => {
            stations.sort_by_key(|s| s.min_hop_count().unwrap_or(usize::MAX));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Harness {
        engine: Engine,
        rx_bytes: mpsc::Sender<Bytes>,
        wire: mpsc::Receiver<Bytes>,
        shutdown: CancellationToken,
    }

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "aprs-console-engine-test-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn harness(mutate: impl FnOnce(&mut Config)) -> Harness {
        let mut config = Config::default();
        config.mycall = "K1FSY-9".to_owned();
        mutate(&mut config);
        let config: SharedConfig = Arc::new(parking_lot::RwLock::new(config));

        let shutdown = CancellationToken::new();
        let (sink, wire) = mpsc::channel(64);
        let scheduler = Scheduler::spawn(sink, 0, shutdown.clone());
        let (rx_kiss, _) = broadcast::channel(16);
        let (monitor, _) = broadcast::channel(16);
        let (link_frames, _link_rx) = mpsc::channel(16);
        let (_state_tx, state_rx) = watch::channel(transport::LinkState::Connected);
        let (rx_bytes, rx_queue) = mpsc::channel(16);

        let dir = temp_dir();
        let unique = format!(
            "{}-{}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos(),
            rand::random::<u32>()
        );

        let setup = EngineSetup {
            config,
            scheduler,
            rx_kiss,
            monitor,
            link_frames,
            events: EventBus::new(),
            transport_state: state_rx,
            db_path: dir.join(format!("stations-{unique}.json.gz")),
            framebuf_path: dir.join(format!("frames-{unique}.json.gz")),
        };

        let engine = Engine::spawn(setup, rx_queue, shutdown.clone());
        Harness {
            engine,
            rx_bytes,
            wire,
            shutdown,
        }
    }

    fn ui_wire(source: &str, destination: &str, path: &[&str], info: &[u8]) -> Bytes {
        let frame = Frame::ui(
            source.parse().unwrap(),
            destination.parse().unwrap(),
            path.iter()
                .map(|hop| {
                    let repeated = hop.ends_with('*');
                    Address::new(hop.trim_end_matches('*').parse().unwrap()).with_top_bit(repeated)
                })
                .collect(),
            Bytes::from(info.to_vec()),
        );
        kiss::encode_frame(0, FrameKind::Data, &frame.encode())
    }

    #[tokio::test]
    async fn position_packet_creates_station() {
        let h = harness(|_| {});
        h.rx_bytes
            .send(ui_wire("W1ABC", "APRS", &[], b"!4237.14N/07107.45W-Testing"))
            .await
            .unwrap();

        // the reactor processes asynchronously; poll until it lands
        let mut station = None;
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            if let Some(s) = h.engine.station("W1ABC").await {
                station = Some(s);
                break;
            }
        }
        let station = station.expect("station created");
        assert_eq!(station.packets_heard, 1);
        let position = station.last_position.expect("position recorded");
        assert!((position.latitude - 42.619).abs() < 0.001);
        assert!(station.heard_zero_hop);
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn incoming_message_is_acked() {
        let mut h = harness(|_| {});
        h.rx_bytes
            .send(ui_wire(
                "W1ABC",
                "APRS",
                &[],
                b":K1FSY-9  :Hello there{00123",
            ))
            .await
            .unwrap();

        // the auto-ack shows up on the wire
        let wire = tokio::time::timeout(std::time::Duration::from_secs(2), h.wire.recv())
            .await
            .expect("ack transmitted")
            .unwrap();
        let decoded = {
            let mut decoder = KissDecoder::new();
            let (frames, _) = decoder.push(&wire);
            Frame::parse(&frames[0].payload).unwrap()
        };
        assert_eq!(decoded.source.callsign.to_string(), "K1FSY-9");
        assert!(decoded.info.starts_with(b":W1ABC    :ack00123"));

        let unread = h.engine.messages(true).await;
        assert_eq!(unread.len(), 1);
        assert_eq!(unread[0].body, "Hello there");
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn digipeats_wide_path() {
        let mut h = harness(|config| {
            config.mycall = "N0CALL".to_owned();
            config.digipeat = true;
        });

        h.rx_bytes
            .send(ui_wire(
                "W1ABC",
                "APRS",
                &["WIDE2-2"],
                b"!4237.14N/07107.45W-",
            ))
            .await
            .unwrap();

        let wire = tokio::time::timeout(std::time::Duration::from_secs(2), h.wire.recv())
            .await
            .expect("digipeated frame")
            .unwrap();
        let repeated = {
            let mut decoder = KissDecoder::new();
            let (frames, _) = decoder.push(&wire);
            Frame::parse(&frames[0].payload).unwrap()
        };
        let path: Vec<String> = repeated.path.iter().map(ToString::to_string).collect();
        assert_eq!(path, vec!["N0CALL*", "WIDE2-1"]);

        // the same frame again within the window is suppressed
        h.rx_bytes
            .send(ui_wire(
                "W1ABC",
                "APRS",
                &["WIDE2-2"],
                b"!4237.14N/07107.45W-",
            ))
            .await
            .unwrap();
        let second = tokio::time::timeout(std::time::Duration::from_millis(300), h.wire.recv()).await;
        assert!(second.is_err(), "duplicate was digipeated");
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn send_message_transmits_and_tracks() {
        let mut h = harness(|_| {});
        let id = h.engine.send_message("W1ABC", "Hello").await.unwrap();
        assert_eq!(id.len(), 5);

        let wire = tokio::time::timeout(std::time::Duration::from_secs(2), h.wire.recv())
            .await
            .expect("message transmitted")
            .unwrap();
        let frame = {
            let mut decoder = KissDecoder::new();
            let (frames, _) = decoder.push(&wire);
            Frame::parse(&frames[0].payload).unwrap()
        };
        assert!(frame.info.starts_with(b":W1ABC    :Hello{"));

        let all = h.engine.messages(false).await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id.as_deref(), Some(id.as_str()));
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn third_party_never_counts_direct() {
        let h = harness(|_| {});
        h.rx_bytes
            .send(ui_wire(
                "W1IGW",
                "APRS",
                &[],
                b"}W9TPD>APRS,TCPIP*::K1FSY-9  :via tunnel",
            ))
            .await
            .unwrap();

        let mut station = None;
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            if let Some(s) = h.engine.station("W9TPD").await {
                station = Some(s);
                break;
            }
        }
        let station = station.expect("tunneled source tracked");
        assert!(!station.heard_direct);
        assert!(!station.heard_zero_hop);
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn status_reports_counts() {
        let h = harness(|_| {});
        h.rx_bytes
            .send(ui_wire("W1ABC", "APRS", &[], b">hello from the shack"))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let status = h.engine.status().await.unwrap();
        assert_eq!(status.mycall, "K1FSY-9");
        assert_eq!(status.station_count, 1);
        assert_eq!(status.transport, transport::LinkState::Connected);
        h.shutdown.cancel();
    }
}
