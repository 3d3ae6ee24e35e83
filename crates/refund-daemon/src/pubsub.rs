//! Decodes the Gmail Pub/Sub push envelope (§6:
//! `{message:{data:base64(json({historyId:int}))}}`). No `base64` crate
//! dependency exists in this workspace's stack (see
//! `refund_vision_tool`'s and `refund_mail_ingress::gmail`'s own hand
//! rolled decoders); this one follows the same style with the standard
//! alphabet, since Pub/Sub's `data` field is standard, not URL-safe,
//! base64.

use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct PushEnvelope {
    pub message: Option<PushMessage>,
}

#[derive(Debug, Deserialize)]
pub struct PushMessage {
    pub data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HistoryNotification {
    #[serde(rename = "historyId")]
    #[allow(dead_code)]
    history_id: u64,
}

/// `None` means there was no message to act on (an empty push, or a
/// message with no `data` field) — the caller should answer 204.
pub fn decode_history_notification(envelope: &PushEnvelope) -> Result<Option<u64>, String> {
    let Some(message) = &envelope.message else { return Ok(None) };
    let Some(data) = &message.data else { return Ok(None) };

    let bytes = decode_base64(data)?;
    let notification: HistoryNotification =
        serde_json::from_slice(&bytes).map_err(|e| format!("push payload decode: {e}"))?;
    Ok(Some(notification.history_id))
}

fn decode_base64(input: &str) -> Result<Vec<u8>, String> {
    fn value(c: u8) -> Option<u8> {
        match c {
            b'A'..=b'Z' => Some(c - b'A'),
            b'a'..=b'z' => Some(c - b'a' + 26),
            b'0'..=b'9' => Some(c - b'0' + 52),
            b'+' => Some(62),
            b'/' => Some(63),
            _ => None,
        }
    }
    let cleaned: Vec<u8> = input.bytes().filter(|b| *b != b'\n' && *b != b'\r' && *b != b'=').collect();
    let mut out = Vec::with_capacity(cleaned.len() * 3 / 4);
    for chunk in cleaned.chunks(4) {
        let vals: Vec<u8> = chunk
            .iter()
            .map(|b| value(*b).ok_or_else(|| format!("invalid base64 byte {b}")))
            .collect::<Result<_, _>>()?;
        match vals.len() {
            4 => {
                out.push((vals[0] << 2) | (vals[1] >> 4));
                out.push((vals[1] << 4) | (vals[2] >> 2));
                out.push((vals[2] << 6) | vals[3]);
            }
            3 => {
                out.push((vals[0] << 2) | (vals[1] >> 4));
                out.push((vals[1] << 4) | (vals[2] >> 2));
            }
            2 => out.push((vals[0] << 2) | (vals[1] >> 4)),
            _ => return Err("truncated base64 input".into()),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(bytes: &[u8]) -> String {
        const ALPHABET: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
        let mut out = String::new();
        for chunk in bytes.chunks(3) {
            let b = [chunk[0], *chunk.get(1).unwrap_or(&0), *chunk.get(2).unwrap_or(&0)];
            let n = (u32::from(b[0]) << 16) | (u32::from(b[1]) << 8) | u32::from(b[2]);
            out.push(ALPHABET[((n >> 18) & 0x3f) as usize] as char);
            out.push(ALPHABET[((n >> 12) & 0x3f) as usize] as char);
            out.push(if chunk.len() > 1 { ALPHABET[((n >> 6) & 0x3f) as usize] as char } else { '=' });
            out.push(if chunk.len() > 2 { ALPHABET[(n & 0x3f) as usize] as char } else { '=' });
        }
        out
    }

    #[test]
    fn decodes_history_id_from_envelope() {
        let payload = encode(br#"{"historyId":12345}"#);
        let envelope = PushEnvelope { message: Some(PushMessage { data: Some(payload) }) };
        assert_eq!(decode_history_notification(&envelope).unwrap(), Some(12345));
    }

    #[test]
    fn missing_message_is_no_op() {
        let envelope = PushEnvelope { message: None };
        assert_eq!(decode_history_notification(&envelope).unwrap(), None);
    }

    #[test]
    fn missing_data_is_no_op() {
        let envelope = PushEnvelope { message: Some(PushMessage { data: None }) };
        assert_eq!(decode_history_notification(&envelope).unwrap(), None);
    }
}
