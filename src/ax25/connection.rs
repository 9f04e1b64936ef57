//! AX.25 v2.2 connected mode.
//!
//! One [`Link`] per remote peer runs the SABM/I/S/U state machine as pure
//! transition functions returning action lists, and a small actor task per
//! peer applies those actions (frames to the transmit scheduler, events to
//! the bridge). Window 4, modulo-8 sequence numbers, T1 with a retry budget.

use std::collections::{
    HashMap,
    VecDeque,
};

use bytes::Bytes;
use tokio::sync::{
    mpsc,
    oneshot,
};
use tokio_util::sync::CancellationToken;

use crate::{
    ax25::{
        Address,
        Callsign,
        Control,
        Frame,
        PID_NO_LAYER3,
        Supervisory,
        Unnumbered,
    },
    kiss,
    scheduler::{
        Priority,
        Scheduler,
    },
};

/// Outstanding unacknowledged I-frames.
const WINDOW_SIZE: usize = 4;

/// T1 retransmission timer.
const T1: std::time::Duration = std::time::Duration::from_secs(3);

/// Attempts before a connect or a retransmission gives up.
const MAX_RETRIES: u32 = 5;

/// Idle peers (disconnected, nothing queued) expire after T3.
const T3: std::time::Duration = std::time::Duration::from_secs(300);

const PEER_QUEUE_SIZE: usize = 16;

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum LinkError {
    #[error("connection refused")]
    Refused,
    #[error("retries exhausted")]
    RetryExhausted,
    #[error("not connected")]
    NotConnected,
    #[error("link task gone")]
    Gone,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    AwaitingConnect,
    Connected,
    AwaitingDisconnect,
}

/// What the owner of a link needs to hear about.
#[derive(Clone, Debug)]
pub enum LinkEvent {
    Connected { peer: Callsign, inbound: bool },
    Disconnected { peer: Callsign },
    Data { peer: Callsign, pid: u8, data: Bytes },
}

/// Side effects of one transition.
#[derive(Debug, PartialEq)]
enum Action {
    Send(Frame),
    Deliver { pid: u8, data: Bytes },
    Connected { inbound: bool },
    Disconnected,
    ConnectResult(Result<(), LinkError>),
    StartT1,
    StopT1,
}

/// The per-peer state machine. No I/O in here; every input returns the
/// actions to perform.
#[derive(Debug)]
struct Link {
    mycall: Callsign,
    peer: Callsign,
    path: Vec<Address>,
    state: LinkState,
    /// V(S): next send sequence number.
    vs: u8,
    /// V(R): next expected receive sequence number.
    vr: u8,
    /// Sent but unacknowledged I-frames, oldest first.
    in_flight: VecDeque<(u8, Bytes)>,
    /// Payloads waiting for the window to open.
    backlog: VecDeque<Bytes>,
    retries: u32,
    /// One REJ per window until the sequence recovers.
    rejecting: bool,
    peer_busy: bool,
}

impl Link {
    fn new(mycall: Callsign, peer: Callsign) -> Self {
        Self {
            mycall,
            peer,
            path: Vec::new(),
            state: LinkState::Disconnected,
            vs: 0,
            vr: 0,
            in_flight: VecDeque::new(),
            backlog: VecDeque::new(),
            retries: 0,
            rejecting: false,
            peer_busy: false,
        }
    }

    fn reset_sequences(&mut self) {
        self.vs = 0;
        self.vr = 0;
        self.in_flight.clear();
        self.backlog.clear();
        self.retries = 0;
        self.rejecting = false;
        self.peer_busy = false;
    }

    fn u_frame(&self, kind: Unnumbered, poll: bool) -> Frame {
        Frame {
            destination: Address::new(self.peer.clone()).with_top_bit(true),
            source: Address::new(self.mycall.clone()),
            path: self.path.clone(),
            control: Control::Unnumbered { kind, poll },
            pid: None,
            info: Bytes::new(),
        }
    }

    fn s_frame(&self, kind: Supervisory, poll: bool) -> Frame {
        Frame {
            destination: Address::new(self.peer.clone()).with_top_bit(true),
            source: Address::new(self.mycall.clone()),
            path: self.path.clone(),
            control: Control::Supervisory {
                kind,
                nr: self.vr,
                poll,
            },
            pid: None,
            info: Bytes::new(),
        }
    }

    fn i_frame(&self, ns: u8, data: Bytes) -> Frame {
        Frame {
            destination: Address::new(self.peer.clone()).with_top_bit(true),
            source: Address::new(self.mycall.clone()),
            path: self.path.clone(),
            control: Control::Information {
                ns,
                nr: self.vr,
                poll: true,
            },
            pid: Some(PID_NO_LAYER3),
            info: data,
        }
    }

    fn connect(&mut self, path: Vec<Address>) -> Vec<Action> {
        self.path = path;
        self.reset_sequences();
        self.state = LinkState::AwaitingConnect;
        vec![
            Action::Send(self.u_frame(Unnumbered::Sabm, true)),
            Action::StartT1,
        ]
    }

    fn disconnect(&mut self) -> Vec<Action> {
        match self.state {
            LinkState::Connected | LinkState::AwaitingConnect => {
                self.state = LinkState::AwaitingDisconnect;
                self.retries = 0;
                vec![
                    Action::Send(self.u_frame(Unnumbered::Disconnect, true)),
                    Action::StartT1,
                ]
            }
            _ => {
                self.state = LinkState::Disconnected;
                vec![Action::Disconnected, Action::StopT1]
            }
        }
    }

    fn send_data(&mut self, data: Bytes) -> Vec<Action> {
        if self.state != LinkState::Connected {
            return Vec::new();
        }
        self.backlog.push_back(data);
        self.pump()
    }

    /// Push backlog into the window.
    fn pump(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        while !self.peer_busy && self.in_flight.len() < WINDOW_SIZE {
            let Some(data) = self.backlog.pop_front() else {
                break;
            };
            let ns = self.vs;
            self.vs = (self.vs + 1) & 0x07;
            self.in_flight.push_back((ns, data.clone()));
            actions.push(Action::Send(self.i_frame(ns, data)));
        }
        if !actions.is_empty() {
            actions.push(Action::StartT1);
        }
        actions
    }

    /// Drop in-flight frames acknowledged by `nr`.
    fn apply_ack(&mut self, nr: u8) -> bool {
        let before = self.in_flight.len();
        let vs = self.vs;
        self.in_flight
            .retain(|(ns, _)| ((ns.wrapping_sub(nr)) & 0x07) < ((vs.wrapping_sub(nr)) & 0x07));
        let progressed = self.in_flight.len() != before;
        if progressed {
            self.retries = 0;
        }
        progressed
    }

    fn t1_expired(&mut self) -> Vec<Action> {
        match self.state {
            LinkState::AwaitingConnect => {
                self.retries += 1;
                if self.retries >= MAX_RETRIES {
                    self.state = LinkState::Disconnected;
                    vec![
                        Action::ConnectResult(Err(LinkError::RetryExhausted)),
                        Action::StopT1,
                    ]
                }
                else {
                    vec![
                        Action::Send(self.u_frame(Unnumbered::Sabm, true)),
                        Action::StartT1,
                    ]
                }
            }
            LinkState::AwaitingDisconnect => {
                self.retries += 1;
                if self.retries >= MAX_RETRIES {
                    self.state = LinkState::Disconnected;
                    vec![Action::Disconnected, Action::StopT1]
                }
                else {
                    vec![
                        Action::Send(self.u_frame(Unnumbered::Disconnect, true)),
                        Action::StartT1,
                    ]
                }
            }
            LinkState::Connected if !self.in_flight.is_empty() => {
                self.retries += 1;
                if self.retries >= MAX_RETRIES {
                    self.state = LinkState::Disconnected;
                    vec![Action::Disconnected, Action::StopT1]
                }
                else {
                    // retransmit everything outstanding
                    let mut actions: Vec<Action> = self
                        .in_flight
                        .iter()
                        .map(|(ns, data)| Action::Send(self.i_frame(*ns, data.clone())))
                        .collect();
                    actions.push(Action::StartT1);
                    actions
                }
            }
            _ => vec![Action::StopT1],
        }
    }

    fn handle_frame(&mut self, frame: &Frame) -> Vec<Action> {
        match frame.control {
            Control::Unnumbered { kind, .. } => self.handle_unnumbered(kind),
            Control::Supervisory { kind, nr, .. } => self.handle_supervisory(kind, nr),
            Control::Information { ns, nr, .. } => self.handle_information(ns, nr, frame),
            Control::UnnumberedInformation { .. } => Vec::new(),
        }
    }

    fn handle_unnumbered(&mut self, kind: Unnumbered) -> Vec<Action> {
        match (kind, self.state) {
            (Unnumbered::Sabm, _) => {
                // inbound connection (or reset of an existing one)
                let was_connected = self.state == LinkState::Connected;
                self.reset_sequences();
                self.state = LinkState::Connected;
                let mut actions = vec![Action::Send(self.u_frame(Unnumbered::UnnumberedAck, true))];
                if !was_connected {
                    actions.push(Action::Connected { inbound: true });
                }
                actions
            }
            (Unnumbered::UnnumberedAck, LinkState::AwaitingConnect) => {
                self.state = LinkState::Connected;
                self.vs = 0;
                self.vr = 0;
                self.retries = 0;
                vec![
                    Action::ConnectResult(Ok(())),
                    Action::Connected { inbound: false },
                    Action::StopT1,
                ]
            }
            (Unnumbered::DisconnectedMode, LinkState::AwaitingConnect) => {
                self.state = LinkState::Disconnected;
                vec![
                    Action::ConnectResult(Err(LinkError::Refused)),
                    Action::StopT1,
                ]
            }
            (Unnumbered::UnnumberedAck | Unnumbered::DisconnectedMode, LinkState::AwaitingDisconnect) => {
                self.state = LinkState::Disconnected;
                vec![Action::Disconnected, Action::StopT1]
            }
            (Unnumbered::Disconnect, _) => {
                let was_connected = self.state == LinkState::Connected;
                self.state = LinkState::Disconnected;
                self.reset_sequences();
                let mut actions = vec![Action::Send(self.u_frame(Unnumbered::UnnumberedAck, true))];
                if was_connected {
                    actions.push(Action::Disconnected);
                }
                actions.push(Action::StopT1);
                actions
            }
            (Unnumbered::DisconnectedMode, LinkState::Connected) => {
                self.state = LinkState::Disconnected;
                self.reset_sequences();
                vec![Action::Disconnected, Action::StopT1]
            }
            (Unnumbered::FrameReject, _) => {
                // serious protocol disagreement; drop outstanding frames and
                // let the higher layer decide whether to reconnect
                tracing::warn!(peer = %self.peer, "FRMR received");
                self.in_flight.clear();
                self.backlog.clear();
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn handle_supervisory(&mut self, kind: Supervisory, nr: u8) -> Vec<Action> {
        if self.state != LinkState::Connected {
            return Vec::new();
        }

        match kind {
            Supervisory::ReceiveReady => {
                self.peer_busy = false;
                self.apply_ack(nr);
                let mut actions = self.pump();
                if self.in_flight.is_empty() {
                    actions.push(Action::StopT1);
                }
                else {
                    actions.push(Action::StartT1);
                }
                actions
            }
            Supervisory::ReceiveNotReady => {
                self.peer_busy = true;
                self.apply_ack(nr);
                Vec::new()
            }
            Supervisory::Reject | Supervisory::SelectiveReject => {
                self.apply_ack(nr);
                // retransmit from N(R) onward
                let mut actions: Vec<Action> = self
                    .in_flight
                    .iter()
                    .map(|(ns, data)| Action::Send(self.i_frame(*ns, data.clone())))
                    .collect();
                if !self.in_flight.is_empty() {
                    actions.push(Action::StartT1);
                }
                actions
            }
        }
    }

    fn handle_information(&mut self, ns: u8, nr: u8, frame: &Frame) -> Vec<Action> {
        if self.state != LinkState::Connected {
            return Vec::new();
        }

        self.apply_ack(nr);
        let mut actions = Vec::new();

        if ns == self.vr {
            self.vr = (self.vr + 1) & 0x07;
            self.rejecting = false;
            actions.push(Action::Deliver {
                pid: frame.pid.unwrap_or(PID_NO_LAYER3),
                data: frame.info.clone(),
            });
            actions.push(Action::Send(self.s_frame(Supervisory::ReceiveReady, false)));
        }
        else if !self.rejecting {
            // one REJ per window; repeating it for every out-of-sequence
            // frame only multiplies the collisions
            self.rejecting = true;
            actions.push(Action::Send(self.s_frame(Supervisory::Reject, false)));
        }

        actions.extend(self.pump());
        if self.in_flight.is_empty() {
            actions.push(Action::StopT1);
        }
        actions
    }
}

/// Inputs to a peer actor.
enum PeerInput {
    Frame(Frame),
    Connect {
        path: Vec<Address>,
        respond: oneshot::Sender<Result<(), LinkError>>,
    },
    SendData(Bytes),
    Disconnect {
        respond: oneshot::Sender<()>,
    },
}

/// Routes frames and local requests to per-peer link actors.
#[derive(Debug)]
pub struct ConnectionManager {
    mycall: Callsign,
    scheduler: Scheduler,
    events: mpsc::Sender<LinkEvent>,
    peers: HashMap<Callsign, mpsc::Sender<PeerInput>>,
    shutdown: CancellationToken,
}

impl ConnectionManager {
    pub fn new(
        mycall: Callsign,
        scheduler: Scheduler,
        events: mpsc::Sender<LinkEvent>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            mycall,
            scheduler,
            events,
            peers: HashMap::new(),
            shutdown,
        }
    }

    pub fn set_mycall(&mut self, mycall: Callsign) {
        self.mycall = mycall;
        self.peers.clear();
    }

    /// Feed a received I/S/U frame addressed to us.
    pub async fn handle_frame(&mut self, frame: Frame) {
        let peer = frame.source.callsign.clone();
        let sender = self.peer_sender(&peer);
        if sender.send(PeerInput::Frame(frame)).await.is_err() {
            self.peers.remove(&peer);
        }
    }

    /// Connect to `peer`; resolves when the link is up or has failed.
    pub async fn connect(&mut self, peer: Callsign, path: Vec<Address>) -> Result<(), LinkError> {
        let (respond, result) = oneshot::channel();
        let sender = self.peer_sender(&peer);
        sender
            .send(PeerInput::Connect { path, respond })
            .await
            .map_err(|_| LinkError::Gone)?;
        result.await.map_err(|_| LinkError::Gone)?
    }

    pub async fn send_data(&mut self, peer: &Callsign, data: Bytes) -> Result<(), LinkError> {
        let sender = self.peers.get(peer).ok_or(LinkError::NotConnected)?;
        sender
            .send(PeerInput::SendData(data))
            .await
            .map_err(|_| LinkError::Gone)
    }

    pub async fn disconnect(&mut self, peer: &Callsign) {
        if let Some(sender) = self.peers.get(peer) {
            let (respond, done) = oneshot::channel();
            if sender.send(PeerInput::Disconnect { respond }).await.is_ok() {
                let _ = done.await;
            }
        }
    }

    fn peer_sender(&mut self, peer: &Callsign) -> mpsc::Sender<PeerInput> {
        if let Some(sender) = self.peers.get(peer) {
            return sender.clone();
        }

        let (sender, inputs) = mpsc::channel(PEER_QUEUE_SIZE);
        let link = Link::new(self.mycall.clone(), peer.clone());
        let actor = PeerActor {
            link,
            inputs,
            scheduler: self.scheduler.clone(),
            events: self.events.clone(),
            connect_waiter: None,
            disconnect_waiter: None,
            shutdown: self.shutdown.clone(),
        };
        tokio::spawn(actor.run());
        self.peers.insert(peer.clone(), sender.clone());
        sender
    }
}

struct PeerActor {
    link: Link,
    inputs: mpsc::Receiver<PeerInput>,
    scheduler: Scheduler,
    events: mpsc::Sender<LinkEvent>,
    connect_waiter: Option<oneshot::Sender<Result<(), LinkError>>>,
    disconnect_waiter: Option<oneshot::Sender<()>>,
    shutdown: CancellationToken,
}

impl PeerActor {
    async fn run(mut self) {
        let t1 = tokio::time::sleep(T1);
        tokio::pin!(t1);
        let mut t1_armed = false;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = &mut t1, if t1_armed => {
                    t1_armed = false;
                    let actions = self.link.t1_expired();
                    self.apply(actions, &mut t1, &mut t1_armed).await;
                }
                input = self.inputs.recv() => {
                    let Some(input) = input else { break };
                    let actions = match input {
                        PeerInput::Frame(frame) => self.link.handle_frame(&frame),
                        PeerInput::Connect { path, respond } => {
                            self.connect_waiter = Some(respond);
                            self.link.connect(path)
                        }
                        PeerInput::SendData(data) => self.link.send_data(data),
                        PeerInput::Disconnect { respond } => {
                            self.disconnect_waiter = Some(respond);
                            self.link.disconnect()
                        }
                    };
                    self.apply(actions, &mut t1, &mut t1_armed).await;
                }
                _ = tokio::time::sleep(T3), if !t1_armed && self.link.state == LinkState::Disconnected => {
                    // idle peer, let the actor go
                    break;
                }
            }
        }
    }

    async fn apply(
        &mut self,
        actions: Vec<Action>,
        t1: &mut std::pin::Pin<&mut tokio::time::Sleep>,
        t1_armed: &mut bool,
    ) {
        for action in actions {
            match action {
                Action::Send(frame) => {
                    let wire = kiss::encode_frame(0, kiss::FrameKind::Data, &frame.encode());
                    // acknowledgments ride the high-priority queue
                    let priority = match frame.control {
                        Control::Supervisory { .. } => Priority::Ack,
                        _ => Priority::User,
                    };
                    self.scheduler.send(priority, wire).await;
                }
                Action::Deliver { pid, data } => {
                    let _ = self
                        .events
                        .send(LinkEvent::Data {
                            peer: self.link.peer.clone(),
                            pid,
                            data,
                        })
                        .await;
                }
                Action::Connected { inbound } => {
                    let _ = self
                        .events
                        .send(LinkEvent::Connected {
                            peer: self.link.peer.clone(),
                            inbound,
                        })
                        .await;
                }
                Action::Disconnected => {
                    if let Some(waiter) = self.disconnect_waiter.take() {
                        let _ = waiter.send(());
                    }
                    let _ = self
                        .events
                        .send(LinkEvent::Disconnected {
                            peer: self.link.peer.clone(),
                        })
                        .await;
                }
                Action::ConnectResult(result) => {
                    if let Some(waiter) = self.connect_waiter.take() {
                        let _ = waiter.send(result);
                    }
                }
                Action::StartT1 => {
                    t1.as_mut().reset(tokio::time::Instant::now() + T1);
                    *t1_armed = true;
                }
                Action::StopT1 => {
                    *t1_armed = false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(s: &str) -> Callsign {
        s.parse().unwrap()
    }

    fn link() -> Link {
        Link::new(call("N0CALL"), call("W1ABC"))
    }

    fn frame_with_control(control: Control) -> Frame {
        Frame {
            destination: Address::new(call("N0CALL")).with_top_bit(true),
            source: Address::new(call("W1ABC")),
            path: Vec::new(),
            control,
            pid: control.has_pid().then_some(PID_NO_LAYER3),
            info: Bytes::new(),
        }
    }

    fn sent_controls(actions: &[Action]) -> Vec<Control> {
        actions
            .iter()
            .filter_map(|action| {
                match action {
                    Action::Send(frame) => Some(frame.control),
                    _ => None,
                }
            })
            .collect()
    }

    #[test]
    fn connect_sends_sabm_then_ua_completes() {
        let mut link = link();
        let actions = link.connect(Vec::new());
        assert_eq!(
            sent_controls(&actions),
            vec![Control::Unnumbered {
                kind: Unnumbered::Sabm,
                poll: true
            }]
        );
        assert_eq!(link.state, LinkState::AwaitingConnect);

        let actions = link.handle_frame(&frame_with_control(Control::Unnumbered {
            kind: Unnumbered::UnnumberedAck,
            poll: true,
        }));
        assert!(actions.contains(&Action::ConnectResult(Ok(()))));
        assert_eq!(link.state, LinkState::Connected);
        assert_eq!((link.vs, link.vr), (0, 0));
    }

    #[test]
    fn dm_refuses_connect() {
        let mut link = link();
        link.connect(Vec::new());
        let actions = link.handle_frame(&frame_with_control(Control::Unnumbered {
            kind: Unnumbered::DisconnectedMode,
            poll: false,
        }));
        assert!(actions.contains(&Action::ConnectResult(Err(LinkError::Refused))));
        assert_eq!(link.state, LinkState::Disconnected);
    }

    #[test]
    fn sabm_retry_budget() {
        let mut link = link();
        link.connect(Vec::new());
        for _ in 0..(MAX_RETRIES - 1) {
            let actions = link.t1_expired();
            assert_eq!(
                sent_controls(&actions),
                vec![Control::Unnumbered {
                    kind: Unnumbered::Sabm,
                    poll: true
                }]
            );
        }
        let actions = link.t1_expired();
        assert!(actions.contains(&Action::ConnectResult(Err(LinkError::RetryExhausted))));
        assert_eq!(link.state, LinkState::Disconnected);
    }

    #[test]
    fn inbound_sabm_answers_ua() {
        let mut link = link();
        let actions = link.handle_frame(&frame_with_control(Control::Unnumbered {
            kind: Unnumbered::Sabm,
            poll: true,
        }));
        assert_eq!(
            sent_controls(&actions),
            vec![Control::Unnumbered {
                kind: Unnumbered::UnnumberedAck,
                poll: true
            }]
        );
        assert!(actions.contains(&Action::Connected { inbound: true }));
        assert_eq!(link.state, LinkState::Connected);
    }

    fn connected_link() -> Link {
        let mut link = link();
        link.connect(Vec::new());
        link.handle_frame(&frame_with_control(Control::Unnumbered {
            kind: Unnumbered::UnnumberedAck,
            poll: true,
        }));
        link
    }

    #[test]
    fn window_limits_in_flight() {
        let mut link = connected_link();
        for i in 0..6u8 {
            link.send_data(Bytes::from(vec![i]));
        }
        assert_eq!(link.in_flight.len(), WINDOW_SIZE);
        assert_eq!(link.backlog.len(), 2);
        assert_eq!(link.vs, WINDOW_SIZE as u8);
    }

    #[test]
    fn rr_slides_window() {
        let mut link = connected_link();
        for i in 0..5u8 {
            link.send_data(Bytes::from(vec![i]));
        }
        // RR with N(R)=2 acknowledges frames 0 and 1, opening room
        let actions = link.handle_frame(&frame_with_control(Control::Supervisory {
            kind: Supervisory::ReceiveReady,
            nr: 2,
            poll: false,
        }));
        assert_eq!(link.in_flight.len(), 3);
        assert!(link.backlog.is_empty());
        // the queued frame went out with N(S)=4
        let sent = sent_controls(&actions);
        assert!(sent.contains(&Control::Information {
            ns: 4,
            nr: 0,
            poll: true
        }));
    }

    #[test]
    fn in_sequence_i_frame_delivers_and_acks() {
        let mut link = connected_link();
        let mut frame = frame_with_control(Control::Information {
            ns: 0,
            nr: 0,
            poll: false,
        });
        frame.info = Bytes::from_static(b"hello");

        let actions = link.handle_frame(&frame);
        assert!(actions.iter().any(|a| {
            matches!(a, Action::Deliver { data, .. } if data.as_ref() == b"hello")
        }));
        assert_eq!(link.vr, 1);
        let sent = sent_controls(&actions);
        assert!(sent.contains(&Control::Supervisory {
            kind: Supervisory::ReceiveReady,
            nr: 1,
            poll: false
        }));
    }

    #[test]
    fn out_of_sequence_rejects_once() {
        let mut link = connected_link();
        let frame = frame_with_control(Control::Information {
            ns: 3,
            nr: 0,
            poll: false,
        });

        let actions = link.handle_frame(&frame);
        let sent = sent_controls(&actions);
        assert!(sent.contains(&Control::Supervisory {
            kind: Supervisory::Reject,
            nr: 0,
            poll: false
        }));

        // the second stray frame does not trigger a second REJ
        let actions = link.handle_frame(&frame);
        assert!(sent_controls(&actions).is_empty());
    }

    #[test]
    fn rej_retransmits_from_nr() {
        let mut link = connected_link();
        for i in 0..3u8 {
            link.send_data(Bytes::from(vec![i]));
        }
        let actions = link.handle_frame(&frame_with_control(Control::Supervisory {
            kind: Supervisory::Reject,
            nr: 1,
            poll: false,
        }));
        let sent = sent_controls(&actions);
        // frame 0 acked; 1 and 2 retransmitted
        assert_eq!(link.in_flight.len(), 2);
        assert_eq!(sent.len(), 2);
        assert!(matches!(sent[0], Control::Information { ns: 1, .. }));
        assert!(matches!(sent[1], Control::Information { ns: 2, .. }));
    }

    #[test]
    fn disc_while_connected() {
        let mut link = connected_link();
        let actions = link.handle_frame(&frame_with_control(Control::Unnumbered {
            kind: Unnumbered::Disconnect,
            poll: true,
        }));
        assert!(actions.contains(&Action::Disconnected));
        assert_eq!(link.state, LinkState::Disconnected);
        let sent = sent_controls(&actions);
        assert!(matches!(
            sent[0],
            Control::Unnumbered {
                kind: Unnumbered::UnnumberedAck,
                ..
            }
        ));
    }

    #[test]
    fn local_disconnect_waits_for_ua() {
        let mut link = connected_link();
        let actions = link.disconnect();
        assert_eq!(link.state, LinkState::AwaitingDisconnect);
        assert!(matches!(
            sent_controls(&actions)[0],
            Control::Unnumbered {
                kind: Unnumbered::Disconnect,
                ..
            }
        ));

        let actions = link.handle_frame(&frame_with_control(Control::Unnumbered {
            kind: Unnumbered::UnnumberedAck,
            poll: false,
        }));
        assert!(actions.contains(&Action::Disconnected));
        assert_eq!(link.state, LinkState::Disconnected);
    }

    #[test]
    fn retry_exhaustion_disconnects() {
        let mut link = connected_link();
        link.send_data(Bytes::from_static(b"data"));
        for _ in 0..(MAX_RETRIES - 1) {
            let actions = link.t1_expired();
            assert!(!sent_controls(&actions).is_empty());
        }
        let actions = link.t1_expired();
        assert!(actions.contains(&Action::Disconnected));
        assert_eq!(link.state, LinkState::Disconnected);
    }

    #[test]
    fn acknowledged_frames_are_never_retransmitted() {
        let mut link = connected_link();
        link.send_data(Bytes::from_static(b"data"));
        link.handle_frame(&frame_with_control(Control::Supervisory {
            kind: Supervisory::ReceiveReady,
            nr: 1,
            poll: false,
        }));
        assert!(link.in_flight.is_empty());
        let actions = link.t1_expired();
        assert!(sent_controls(&actions).is_empty());
    }
}
