//! APRS message delivery.
//!
//! Outgoing messages are retried on a two-tier schedule: a fast timer until
//! the packet is first heard back from a digipeater (proof it made it onto
//! the channel), then a slow timer while waiting for the addressee's ack.
//! Incoming traffic is deduplicated, including fuzzy matching of the mangled
//! copies iGates like to produce.

use chrono::{
    DateTime,
    Duration,
    Utc,
};
use rand::Rng;
use serde::{
    Deserialize,
    Serialize,
};

use crate::{
    aprs::message::{
        self,
        MessageContent,
        MessagePayload,
    },
    ax25::Callsign,
};

/// Exact-duplicate and fuzzy suppression window, seconds.
const DUPLICATE_WINDOW_SECS: i64 = 300;

/// Similarity threshold for fuzzy duplicate suppression.
const FUZZY_THRESHOLD: f64 = 0.8;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Sent,
    Received,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    Digipeated,
    Acknowledged,
    Rejected,
    Expired,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageRecord {
    pub timestamp: DateTime<Utc>,
    pub from_call: String,
    pub to_call: String,
    pub body: String,
    pub id: Option<String>,
    pub direction: Direction,
    /// Delivery progress; `None` for received messages.
    pub state: Option<DeliveryState>,
    pub retry_count: u32,
    pub last_sent: Option<DateTime<Utc>>,
    pub read: bool,
}

impl MessageRecord {
    /// Acks are fire-and-forget per the APRS spec: never retried.
    fn is_ack(&self) -> bool {
        self.id.is_none()
            && self.body.len() >= 4
            && self.body.len() <= 8
            && self.body.to_ascii_lowercase().starts_with("ack")
    }
}

/// What the engine should do with an incoming message payload.
#[derive(Debug, PartialEq, Eq)]
pub enum Incoming {
    /// Stored for the operator; transmit the ack if one is supplied.
    Stored { ack: Option<String> },
    /// Heard but not for us (or a duplicate); monitored only.
    Monitored,
    /// Protocol traffic (acks, telemetry definitions, our own echoes).
    Consumed,
}

/// A frame the retry tick wants on the air.
#[derive(Debug)]
pub struct Retransmission {
    pub info: String,
    pub to_call: String,
}

#[derive(Debug)]
pub struct MessageManager {
    mycall: Callsign,
    max_retries: u32,
    retry_fast: Duration,
    retry_slow: Duration,
    auto_ack: bool,
    messages: Vec<MessageRecord>,
    monitored: Vec<MessageRecord>,
}

impl MessageManager {
    pub fn new(mycall: Callsign, max_retries: u32, retry_fast: u64, retry_slow: u64, auto_ack: bool) -> Self {
        Self {
            mycall,
            max_retries,
            retry_fast: Duration::seconds(retry_fast as i64),
            retry_slow: Duration::seconds(retry_slow as i64),
            auto_ack,
            messages: Vec::new(),
            monitored: Vec::new(),
        }
    }

    pub fn set_mycall(&mut self, mycall: Callsign) {
        self.mycall = mycall;
    }

    /// Queue an outgoing message. Returns the generated message-id and the
    /// information field to transmit.
    pub fn send(&mut self, to_call: &str, body: &str, now: DateTime<Utc>) -> (String, String) {
        let id = generate_id();
        let info = message::encode(to_call, body, Some(&id));
        let record = MessageRecord {
            timestamp: now,
            from_call: self.mycall.to_string(),
            to_call: to_call.to_uppercase(),
            body: body.to_owned(),
            id: Some(id.clone()),
            direction: Direction::Sent,
            state: Some(DeliveryState::Pending),
            retry_count: 0,
            last_sent: Some(now),
            read: true,
        };
        self.messages.push(record.clone());
        self.monitored.push(record);
        (id, info)
    }

    /// Track an outgoing ack so a digipeated echo of it can be recognized.
    fn track_ack(&mut self, to_call: &str, id: &str, now: DateTime<Utc>) -> String {
        let info = message::encode_ack(to_call, id);
        self.messages.push(MessageRecord {
            timestamp: now,
            from_call: self.mycall.to_string(),
            to_call: to_call.to_uppercase(),
            body: format!("ack{id}"),
            id: None,
            direction: Direction::Sent,
            state: Some(DeliveryState::Pending),
            retry_count: 0,
            last_sent: Some(now),
            read: true,
        });
        info
    }

    /// Process a received message payload. `digipeated` reports whether the
    /// carrying frame had any repeated hop, which is the evidence that our
    /// own transmissions reached the network.
    pub fn handle_incoming(
        &mut self,
        from: &Callsign,
        payload: &MessagePayload,
        digipeated: bool,
        now: DateTime<Utc>,
    ) -> Incoming {
        match &payload.content {
            MessageContent::Ack { id } => {
                if *from == self.mycall {
                    // our own ack came back off a digi
                    if digipeated {
                        self.mark_digipeated(&payload.addressee, &format!("ack{id}"), None);
                    }
                }
                else {
                    self.correlate_ack(from, id, DeliveryState::Acknowledged);
                }
                Incoming::Consumed
            }
            MessageContent::Reject { id } => {
                self.correlate_ack(from, id, DeliveryState::Rejected);
                Incoming::Consumed
            }
            MessageContent::TelemetryDefinition { .. } => Incoming::Consumed,
            MessageContent::Text { body, id } => {
                self.handle_text(from, payload, body, id.as_deref(), digipeated, now)
            }
        }
    }

    fn handle_text(
        &mut self,
        from: &Callsign,
        payload: &MessagePayload,
        body: &str,
        id: Option<&str>,
        digipeated: bool,
        now: DateTime<Utc>,
    ) -> Incoming {
        // our own message heard again: evidence of digipeat, not traffic
        if *from == self.mycall {
            if digipeated {
                self.mark_digipeated(&payload.addressee, body, id);
            }
            return Incoming::Consumed;
        }

        let record = MessageRecord {
            timestamp: now,
            from_call: from.to_string(),
            to_call: payload.addressee.clone(),
            body: body.to_owned(),
            id: id.map(str::to_owned),
            direction: Direction::Received,
            state: None,
            retry_count: 0,
            last_sent: None,
            read: false,
        };
        self.monitored.push(record.clone());

        if !self.addressed_to_us(&payload.addressee) {
            return Incoming::Monitored;
        }

        if self.is_duplicate(&record, now) {
            return Incoming::Monitored;
        }

        self.messages.push(record);

        let ack = match (id, self.auto_ack) {
            (Some(id), true) => Some(self.track_ack(&from.to_string(), id, now)),
            _ => None,
        };
        Incoming::Stored { ack }
    }

    /// `K1FSY` and `K1FSY-0` are the same station; other SSIDs are not.
    /// Bulletins to `ALL`, `BSS*` group traffic, and the bare base callsign
    /// are kept too.
    fn addressed_to_us(&self, addressee: &str) -> bool {
        let addressee = addressee.to_uppercase();
        if addressee == "ALL" || addressee.starts_with("BSS") {
            return true;
        }
        if addressee == self.mycall.base() {
            return true;
        }
        match addressee.parse::<Callsign>() {
            Ok(call) => call == self.mycall,
            Err(_) => false,
        }
    }

    fn correlate_ack(&mut self, from: &Callsign, id: &str, state: DeliveryState) {
        let matched = self.messages.iter_mut().find(|msg| {
            msg.direction == Direction::Sent
                && msg.id.as_deref() == Some(id)
                && msg
                    .to_call
                    .parse::<Callsign>()
                    .map(|to| to == *from || to.same_base(from))
                    .unwrap_or(false)
        });
        match matched {
            Some(msg) => {
                tracing::info!(to = %msg.to_call, id, ?state, "delivery confirmed");
                msg.state = Some(state);
            }
            None => {
                tracing::debug!(%from, id, "ack without a matching sent message");
            }
        }
    }

    /// The escalation match is by message-id (id-less acks by addressee and
    /// body), never by comparing information fields byte-for-byte; digis are
    /// allowed to rewrite whitespace.
    fn mark_digipeated(&mut self, addressee: &str, body: &str, id: Option<&str>) {
        for msg in &mut self.messages {
            if msg.direction != Direction::Sent || msg.state != Some(DeliveryState::Pending) {
                continue;
            }
            let matched = match (&msg.id, id) {
                (Some(ours), Some(heard)) => ours == heard,
                (None, None) => msg.to_call.eq_ignore_ascii_case(addressee) && msg.body == body,
                _ => false,
            };
            if matched {
                if msg.is_ack() {
                    // nobody acks an ack; hearing it repeated is as good as
                    // delivered
                    msg.state = Some(DeliveryState::Acknowledged);
                }
                else {
                    msg.state = Some(DeliveryState::Digipeated);
                }
                return;
            }
        }
    }

    fn is_duplicate(&self, candidate: &MessageRecord, now: DateTime<Utc>) -> bool {
        self.messages
            .iter()
            .filter(|existing| {
                existing.direction == Direction::Received
                    && existing.from_call == candidate.from_call
                    && now - existing.timestamp <= Duration::seconds(DUPLICATE_WINDOW_SECS)
            })
            .any(|existing| {
                if candidate.id.is_some() && existing.id == candidate.id {
                    return true;
                }
                if existing.body == candidate.body {
                    return true;
                }
                // fuzzy: same correspondents and id, nearly the same body
                existing.to_call == candidate.to_call
                    && existing.id == candidate.id
                    && similarity(&existing.body, &candidate.body) > FUZZY_THRESHOLD
            })
    }

    /// Drive the two-tier retry schedule. Returns the frames to retransmit;
    /// exhausted messages flip to `Expired`.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<Retransmission> {
        let mut retransmissions = Vec::new();

        for msg in &mut self.messages {
            if msg.direction != Direction::Sent || msg.is_ack() {
                continue;
            }
            let Some(state) = msg.state else {
                continue;
            };
            if !matches!(state, DeliveryState::Pending | DeliveryState::Digipeated) {
                continue;
            }
            let Some(last_sent) = msg.last_sent else {
                continue;
            };

            let timeout = if state == DeliveryState::Digipeated {
                self.retry_slow
            }
            else {
                self.retry_fast
            };
            if now - last_sent < timeout {
                continue;
            }

            if msg.retry_count >= self.max_retries {
                tracing::info!(to = %msg.to_call, id = ?msg.id, "message expired");
                msg.state = Some(DeliveryState::Expired);
                continue;
            }

            msg.retry_count += 1;
            msg.last_sent = Some(now);
            retransmissions.push(Retransmission {
                info: message::encode(&msg.to_call, &msg.body, msg.id.as_deref()),
                to_call: msg.to_call.clone(),
            });
        }

        retransmissions
    }

    pub fn messages(&self, unread_only: bool) -> Vec<&MessageRecord> {
        self.messages
            .iter()
            .filter(|msg| !unread_only || (msg.direction == Direction::Received && !msg.read))
            .collect()
    }

    pub fn monitored(&self, limit: Option<usize>, callsign: Option<&str>) -> Vec<&MessageRecord> {
        let filtered: Vec<&MessageRecord> = self
            .monitored
            .iter()
            .filter(|msg| {
                callsign.map_or(true, |call| {
                    msg.from_call.eq_ignore_ascii_case(call) || msg.to_call.eq_ignore_ascii_case(call)
                })
            })
            .collect();
        match limit {
            Some(limit) => filtered[filtered.len().saturating_sub(limit)..].to_vec(),
            None => filtered,
        }
    }

    pub fn unread_count(&self) -> usize {
        self.messages
            .iter()
            .filter(|msg| msg.direction == Direction::Received && !msg.read)
            .count()
    }

    pub fn mark_all_read(&mut self) -> usize {
        let mut count = 0;
        for msg in &mut self.messages {
            if msg.direction == Direction::Received && !msg.read {
                msg.read = true;
                count += 1;
            }
        }
        count
    }

    pub(crate) fn restore_monitored(&mut self, records: Vec<MessageRecord>) {
        self.monitored = records;
    }

    pub(crate) fn monitored_records(&self) -> &[MessageRecord] {
        &self.monitored
    }
}

fn generate_id() -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::thread_rng();
    (0..5)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Normalized Levenshtein similarity in [0, 1].
fn similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(previous[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    let distance = previous[b.len()];
    1.0 - distance as f64 / a.len().max(b.len()) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> MessageManager {
        MessageManager::new("K1FSY-9".parse().unwrap(), 3, 20, 600, true)
    }

    fn text_payload(addressee: &str, body: &str, id: Option<&str>) -> MessagePayload {
        MessagePayload {
            addressee: addressee.to_owned(),
            content: MessageContent::Text {
                body: body.to_owned(),
                id: id.map(str::to_owned),
            },
        }
    }

    #[test]
    fn send_generates_id_and_info() {
        let mut mgr = manager();
        let (id, info) = mgr.send("W1ABC", "Hello", Utc::now());
        assert_eq!(id.len(), 5);
        assert_eq!(info, format!(":W1ABC    :Hello{{{id}"));
        assert_eq!(mgr.messages(false).len(), 1);
    }

    #[test]
    fn ack_from_addressee_stops_retries() {
        let mut mgr = manager();
        let now = Utc::now();
        let (id, _) = mgr.send("W1ABC", "Hello", now);

        let ack = MessagePayload {
            addressee: "K1FSY-9".to_owned(),
            content: MessageContent::Ack { id },
        };
        let outcome = mgr.handle_incoming(&"W1ABC".parse().unwrap(), &ack, true, now);
        assert_eq!(outcome, Incoming::Consumed);
        assert_eq!(mgr.messages(false)[0].state, Some(DeliveryState::Acknowledged));

        // an acknowledged message is never retransmitted
        let due = mgr.tick(now + Duration::seconds(3_600));
        assert!(due.is_empty());
    }

    #[test]
    fn ack_matches_across_ssids() {
        let mut mgr = manager();
        let now = Utc::now();
        let (id, _) = mgr.send("W1ABC-7", "Hello", now);
        let ack = MessagePayload {
            addressee: "K1FSY-9".to_owned(),
            content: MessageContent::Ack { id },
        };
        mgr.handle_incoming(&"W1ABC".parse().unwrap(), &ack, true, now);
        assert_eq!(mgr.messages(false)[0].state, Some(DeliveryState::Acknowledged));
    }

    #[test]
    fn fast_retry_until_digipeated() {
        let mut mgr = manager();
        let now = Utc::now();
        let (id, _) = mgr.send("W1ABC", "Hello", now);

        // before the fast timeout nothing is due
        assert!(mgr.tick(now + Duration::seconds(10)).is_empty());

        // after it, the message retries
        let due = mgr.tick(now + Duration::seconds(21));
        assert_eq!(due.len(), 1);
        assert_eq!(mgr.messages(false)[0].retry_count, 1);

        // hearing our own frame back from a digi escalates to the slow tier
        let echo = text_payload("W1ABC", "Hello", Some(&id));
        mgr.handle_incoming(&"K1FSY-9".parse().unwrap(), &echo, true, now);
        assert_eq!(mgr.messages(false)[0].state, Some(DeliveryState::Digipeated));

        // fast timeout no longer applies
        assert!(mgr.tick(now + Duration::seconds(60)).is_empty());
        // the slow one does
        assert_eq!(mgr.tick(now + Duration::seconds(21 + 601)).len(), 1);
    }

    #[test]
    fn retry_budget_expires_message() {
        let mut mgr = manager();
        let mut now = Utc::now();
        mgr.send("W1ABC", "Hello", now);

        for _ in 0..3 {
            now += Duration::seconds(21);
            assert_eq!(mgr.tick(now).len(), 1);
        }
        now += Duration::seconds(21);
        assert!(mgr.tick(now).is_empty());
        assert_eq!(mgr.messages(false)[0].state, Some(DeliveryState::Expired));
    }

    #[test]
    fn incoming_for_us_is_stored_and_acked() {
        let mut mgr = manager();
        let payload = text_payload("K1FSY-9", "Good morning", Some("00123"));
        let outcome = mgr.handle_incoming(&"W1ABC".parse().unwrap(), &payload, false, Utc::now());
        match outcome {
            Incoming::Stored { ack: Some(info) } => {
                assert_eq!(info, ":W1ABC    :ack00123");
            }
            other => panic!("expected stored with ack, got {other:?}"),
        }
        assert_eq!(mgr.unread_count(), 1);
    }

    #[test]
    fn ssid_agnostic_delivery() {
        let mut mgr = manager();
        // bare base callsign matches us
        let payload = text_payload("K1FSY", "hi", None);
        let outcome = mgr.handle_incoming(&"W1ABC".parse().unwrap(), &payload, false, Utc::now());
        assert!(matches!(outcome, Incoming::Stored { .. }));

        // a different SSID is a different station
        let payload = text_payload("K1FSY-7", "hi again", None);
        let outcome = mgr.handle_incoming(&"W1ABC".parse().unwrap(), &payload, false, Utc::now());
        assert_eq!(outcome, Incoming::Monitored);
    }

    #[test]
    fn exact_duplicate_suppressed() {
        let mut mgr = manager();
        let now = Utc::now();
        let payload = text_payload("K1FSY-9", "Good morning", Some("00123"));
        let sender: Callsign = "W1ABC".parse().unwrap();
        assert!(matches!(
            mgr.handle_incoming(&sender, &payload, false, now),
            Incoming::Stored { .. }
        ));
        assert_eq!(mgr.handle_incoming(&sender, &payload, true, now), Incoming::Monitored);
        assert_eq!(mgr.unread_count(), 1);
    }

    #[test]
    fn fuzzy_duplicate_suppressed() {
        let mut mgr = manager();
        let now = Utc::now();
        let sender: Callsign = "W1ABC".parse().unwrap();
        let original = text_payload("K1FSY-9", "Meet at the repeater site at noon", Some("00123"));
        mgr.handle_incoming(&sender, &original, false, now);

        // an iGate chewed one character but kept the id
        let mangled = text_payload("K1FSY-9", "Meet at the repeater site at noo", Some("00123"));
        let outcome = mgr.handle_incoming(&sender, &mangled, false, now + Duration::seconds(10));
        assert_eq!(outcome, Incoming::Monitored);
        assert_eq!(mgr.unread_count(), 1);
    }

    #[test]
    fn different_message_is_not_a_duplicate() {
        let mut mgr = manager();
        let now = Utc::now();
        let sender: Callsign = "W1ABC".parse().unwrap();
        mgr.handle_incoming(&sender, &text_payload("K1FSY-9", "first", Some("A")), false, now);
        let outcome = mgr.handle_incoming(
            &sender,
            &text_payload("K1FSY-9", "entirely different text", Some("B")),
            false,
            now + Duration::seconds(30),
        );
        assert!(matches!(outcome, Incoming::Stored { .. }));
        assert_eq!(mgr.unread_count(), 2);
    }

    #[test]
    fn acks_are_never_retried() {
        let mut mgr = manager();
        let now = Utc::now();
        let payload = text_payload("K1FSY-9", "ping", Some("X1"));
        mgr.handle_incoming(&"W1ABC".parse().unwrap(), &payload, false, now);

        // the tracked ack is in the sent list but the tick skips it
        let due = mgr.tick(now + Duration::seconds(3_600));
        assert!(due.is_empty());
    }

    #[test]
    fn own_ack_echo_completes() {
        let mut mgr = manager();
        let now = Utc::now();
        let payload = text_payload("K1FSY-9", "ping", Some("X1"));
        mgr.handle_incoming(&"W1ABC".parse().unwrap(), &payload, false, now);

        // our ack comes back with a repeated hop
        let echo = MessagePayload {
            addressee: "W1ABC".to_owned(),
            content: MessageContent::Ack {
                id: "X1".to_owned(),
            },
        };
        mgr.handle_incoming(&"K1FSY-9".parse().unwrap(), &echo, true, now);

        let ack_record = mgr
            .messages(false)
            .into_iter()
            .find(|m| m.direction == Direction::Sent)
            .unwrap()
            .clone();
        assert_eq!(ack_record.state, Some(DeliveryState::Acknowledged));
    }

    #[test]
    fn similarity_measure() {
        assert_eq!(similarity("abc", "abc"), 1.0);
        assert!(similarity("hello world", "hello worl") > 0.8);
        assert!(similarity("hello", "goodbye") < 0.5);
    }
}
