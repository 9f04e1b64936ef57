//! APRS messages, acknowledgments and rejects.
//!
//! Wire form: `:ADDRESSEE:body{XXXXX` — a 9-byte space-padded addressee, a
//! colon, up to 67 characters of body, and an optional `{`-prefixed
//! message-id of up to five characters. Bodies `ackXXXXX` / `rejXXXXX` are
//! protocol acknowledgments, and `PARM.`/`UNIT.`/`EQNS.`/`BITS.` bodies are
//! telemetry channel definitions rather than human traffic.

use serde::Serialize;

use crate::aprs::AprsError;

/// Maximum body length per APRS 1.01.
pub const MAX_BODY_LENGTH: usize = 67;

/// Maximum message-id length.
pub const MAX_ID_LENGTH: usize = 5;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MessagePayload {
    /// Addressee as transmitted. Not necessarily a strict callsign:
    /// bulletins use `BLNn`, announcements use `ALL`.
    pub addressee: String,
    pub content: MessageContent,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum MessageContent {
    Text {
        body: String,
        id: Option<String>,
    },
    Ack {
        id: String,
    },
    Reject {
        id: String,
    },
    /// `PARM.` / `UNIT.` / `EQNS.` / `BITS.` telemetry definitions.
    TelemetryDefinition {
        body: String,
    },
}

pub(super) fn decode(info: &[u8]) -> Result<MessagePayload, AprsError> {
    // ':' + 9 addressee bytes + ':'
    if info.len() < 11 {
        return Err(AprsError::Truncated("message"));
    }
    if info[10] != b':' {
        return Err(AprsError::Malformed("message"));
    }

    let addressee = String::from_utf8_lossy(&info[1..10]).trim().to_owned();
    if addressee.is_empty() {
        return Err(AprsError::Malformed("message"));
    }

    let body = String::from_utf8_lossy(&info[11..]).into_owned();

    if let Some(id) = parse_ack_body(&body, "ack") {
        return Ok(MessagePayload {
            addressee,
            content: MessageContent::Ack { id },
        });
    }
    if let Some(id) = parse_ack_body(&body, "rej") {
        return Ok(MessagePayload {
            addressee,
            content: MessageContent::Reject { id },
        });
    }

    if ["PARM.", "UNIT.", "EQNS.", "BITS."]
        .iter()
        .any(|prefix| body.starts_with(prefix))
    {
        return Ok(MessagePayload {
            addressee,
            content: MessageContent::TelemetryDefinition { body },
        });
    }

    let (body, id) = match body.split_once('{') {
        Some((text, id)) => {
            let id = id.trim().to_owned();
            (text.to_owned(), (!id.is_empty()).then_some(id))
        }
        None => (body, None),
    };

    Ok(MessagePayload {
        addressee,
        content: MessageContent::Text {
            body: body.trim_end_matches(['\r', '\n']).to_owned(),
            id,
        },
    })
}

/// `ackXXXXX` / `rejXXXXX`, tolerating the multi-line `}`-suffixed form some
/// clients append.
fn parse_ack_body(body: &str, prefix: &str) -> Option<String> {
    let rest = body
        .strip_prefix(prefix)
        .or_else(|| body.strip_prefix(&prefix.to_uppercase()))?;
    let id = rest.split('}').next().unwrap_or(rest).trim();
    (!id.is_empty() && id.len() <= MAX_ID_LENGTH).then(|| id.to_owned())
}

/// Build the information field for an outgoing message.
pub fn encode(addressee: &str, body: &str, id: Option<&str>) -> String {
    let mut info = format!(":{:<9}:{}", addressee.to_uppercase(), truncate_body(body));
    if let Some(id) = id {
        info.push('{');
        info.push_str(&id[..id.len().min(MAX_ID_LENGTH)]);
    }
    info
}

/// Build the information field for an acknowledgment.
pub fn encode_ack(addressee: &str, id: &str) -> String {
    format!(":{:<9}:ack{}", addressee.to_uppercase(), id)
}

fn truncate_body(body: &str) -> &str {
    match body.char_indices().nth(MAX_BODY_LENGTH) {
        Some((index, _)) => &body[..index],
        None => body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_message_with_id() {
        let payload = decode(b":K1FSY-9  :Hello there{AB123").unwrap();
        assert_eq!(payload.addressee, "K1FSY-9");
        assert_eq!(
            payload.content,
            MessageContent::Text {
                body: "Hello there".to_owned(),
                id: Some("AB123".to_owned()),
            }
        );
    }

    #[test]
    fn message_without_id() {
        let payload = decode(b":ALL      :club meeting friday").unwrap();
        assert_eq!(payload.addressee, "ALL");
        assert!(matches!(
            payload.content,
            MessageContent::Text { id: None, .. }
        ));
    }

    #[test]
    fn ack_and_rej() {
        let payload = decode(b":K1FSY-9  :ack00345").unwrap();
        assert_eq!(
            payload.content,
            MessageContent::Ack {
                id: "00345".to_owned()
            }
        );

        let payload = decode(b":K1FSY-9  :rejAB1").unwrap();
        assert_eq!(
            payload.content,
            MessageContent::Reject {
                id: "AB1".to_owned()
            }
        );
    }

    #[test]
    fn multiline_ack_suffix() {
        let payload = decode(b":K1FSY-9  :ack003}42").unwrap();
        assert_eq!(
            payload.content,
            MessageContent::Ack {
                id: "003".to_owned()
            }
        );
    }

    #[test]
    fn telemetry_definitions_are_not_traffic() {
        let payload = decode(b":N0QBF-11 :PARM.Battery,Btemp,ATemp,Pres,Alt").unwrap();
        assert!(matches!(
            payload.content,
            MessageContent::TelemetryDefinition { .. }
        ));
    }

    #[test]
    fn malformed_messages() {
        assert!(decode(b":SHORT").is_err());
        assert!(decode(b":K1FSY-9   missing colon").is_err());
        assert!(decode(b":         :body").is_err());
    }

    #[test]
    fn encode_pads_addressee() {
        assert_eq!(encode("W1ABC", "Hello", Some("00001")), ":W1ABC    :Hello{00001");
        assert_eq!(encode_ack("w1abc-4", "003"), ":W1ABC-4  :ack003");
    }

    #[test]
    fn encode_truncates_long_bodies() {
        let long = "x".repeat(80);
        let info = encode("W1ABC", &long, None);
        assert_eq!(info.len(), 11 + MAX_BODY_LENGTH);
    }

    #[test]
    fn decode_encode_round_trip() {
        let info = encode("K1FSY-9", "QSL 73", Some("A1"));
        let payload = decode(info.as_bytes()).unwrap();
        assert_eq!(payload.addressee, "K1FSY-9");
        assert_eq!(
            payload.content,
            MessageContent::Text {
                body: "QSL 73".to_owned(),
                id: Some("A1".to_owned()),
            }
        );
    }
}
