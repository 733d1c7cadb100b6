// MIT License - Copyright (c) 2026 Peter Wright

use chrono::NaiveDateTime;

use crate::constants::{
    CR, LF, TIMEBAND_FUTURE_SECS, TIMEBAND_PAST_SECS, TIMESTAMP_FORMAT,
};
use crate::crypto::{SiaCrypt, crc16_hex};
use crate::error::{BridgeError, Result};
use crate::event::SiaEvent;

/// Message types carried in the DC-09 envelope header.
///
/// Only `SIA-DCS` (and its encrypted `*SIA-DCS` form) produces events.
/// `NULL` is the link-test heartbeat and is acknowledged without an event.
/// Anything else is answered with `DUH` per the protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageType {
    SiaDcs,
    Null,
    Unsupported(String),
}

/// One parsed DC-09 envelope.
///
/// The envelope is validated (length field, CRC, field grammar) but the
/// data block is kept raw: for encrypted frames it is still hex
/// ciphertext until [`decode_event`] runs it through the crypto engine.
#[derive(Debug, Clone)]
pub struct SiaFrame {
    pub message_type: MessageType,
    pub encrypted: bool,
    /// 4-digit sequence number, echoed in the acknowledgement.
    pub sequence: String,
    /// Receiver number (hex digits after `R`), when the panel sends one.
    pub receiver: Option<String>,
    /// Line/account prefix (hex digits after `L`).
    pub line: String,
    /// Account identifier (3-16 hex characters).
    pub account: String,
    /// Raw data block: text content for plain frames, hex ciphertext for
    /// encrypted ones.
    pub data: String,
    /// Trailer timestamp, only present on plain frames (encrypted frames
    /// carry it inside the ciphertext).
    pub timestamp: Option<NaiveDateTime>,
}

/// Parse and validate a raw DC-09 frame.
///
/// Wire layout: `LF` + 4 hex CRC + 4 hex body length + body + `CR`, where
/// the body is `"TYPE"seq[R...]L...#account[data]` with an optional
/// `_HH:MM:SS,MM-DD-YYYY` trailer. The CRC covers the body only.
pub fn parse_frame(raw: &[u8]) -> Result<SiaFrame> {
    let mut bytes = raw;
    if bytes.first() == Some(&LF) {
        bytes = &bytes[1..];
    }
    if bytes.last() == Some(&CR) {
        bytes = &bytes[..bytes.len() - 1];
    }

    let text = std::str::from_utf8(bytes)
        .map_err(|_| BridgeError::malformed("frame is not valid ASCII"))?;
    if !text.is_ascii() {
        return Err(BridgeError::malformed("frame is not valid ASCII"));
    }

    if text.len() < 8 {
        return Err(BridgeError::malformed("frame shorter than CRC and length header"));
    }
    let (header, body) = text.split_at(8);
    if !header.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(BridgeError::malformed("CRC/length header is not hex"));
    }
    let (crc_field, len_field) = header.split_at(4);

    let length = usize::from_str_radix(len_field, 16)
        .map_err(|_| BridgeError::malformed("unparseable length field"))?;
    if body.len() != length {
        return Err(BridgeError::malformed(format!(
            "length field says {length} bytes but body has {}",
            body.len()
        )));
    }

    let computed = crc16_hex(body.as_bytes());
    if computed != crc_field.to_ascii_uppercase() {
        return Err(BridgeError::Crc {
            expected: computed,
            received: crc_field.to_string(),
        });
    }

    parse_body(body)
}

fn parse_body(body: &str) -> Result<SiaFrame> {
    let rest = body
        .strip_prefix('"')
        .ok_or_else(|| BridgeError::malformed("missing message type"))?;
    let quote = rest
        .find('"')
        .ok_or_else(|| BridgeError::malformed("unterminated message type"))?;
    let type_str = &rest[..quote];
    let rest = &rest[quote + 1..];

    let encrypted = type_str.starts_with('*');
    let message_type = match type_str.trim_start_matches('*') {
        "SIA-DCS" => MessageType::SiaDcs,
        "NULL" => MessageType::Null,
        other => MessageType::Unsupported(other.to_string()),
    };

    if rest.len() < 4 || !rest[..4].bytes().all(|b| b.is_ascii_digit()) {
        return Err(BridgeError::malformed("missing 4-digit sequence number"));
    }
    let sequence = rest[..4].to_string();
    let mut rest = &rest[4..];

    let receiver = match rest.strip_prefix('R') {
        Some(r) => {
            let n = r.find(|c: char| !c.is_ascii_hexdigit()).unwrap_or(r.len());
            if n == 0 || n > 6 {
                return Err(BridgeError::malformed("invalid receiver field"));
            }
            rest = &r[n..];
            Some(r[..n].to_string())
        }
        None => None,
    };

    let l = rest
        .strip_prefix('L')
        .ok_or_else(|| BridgeError::malformed("missing line prefix"))?;
    let n = l.find(|c: char| !c.is_ascii_hexdigit()).unwrap_or(l.len());
    if n == 0 || n > 6 {
        return Err(BridgeError::malformed("invalid line field"));
    }
    let line = l[..n].to_string();
    let rest = &l[n..];

    let a = rest
        .strip_prefix('#')
        .ok_or_else(|| BridgeError::malformed("missing account field"))?;
    let open = a
        .find('[')
        .ok_or_else(|| BridgeError::malformed("missing data block"))?;
    let account = a[..open].to_string();
    if !(3..=16).contains(&account.len()) || !account.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(BridgeError::malformed("account must be 3-16 hex characters"));
    }
    let rest = &a[open + 1..];

    // Encrypted frames put the closing bracket and timestamp inside the
    // ciphertext, so the data block runs to the end of the body.
    let (data, timestamp) = if encrypted {
        if rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(BridgeError::malformed("encrypted data block is not hex"));
        }
        (rest.to_string(), None)
    } else {
        let close = rest
            .rfind(']')
            .ok_or_else(|| BridgeError::malformed("unterminated data block"))?;
        let data = rest[..close].to_string();
        let timestamp = parse_trailer_timestamp(&rest[close + 1..])?;
        (data, timestamp)
    };

    Ok(SiaFrame {
        message_type,
        encrypted,
        sequence,
        receiver,
        line,
        account,
        data,
        timestamp,
    })
}

fn parse_trailer_timestamp(trailer: &str) -> Result<Option<NaiveDateTime>> {
    match trailer.strip_prefix('_') {
        None if trailer.is_empty() => Ok(None),
        None => Err(BridgeError::malformed("unexpected bytes after data block")),
        Some(ts) => NaiveDateTime::parse_from_str(ts, TIMESTAMP_FORMAT)
            .map(Some)
            .map_err(|_| BridgeError::malformed(format!("unparseable timestamp {ts:?}"))),
    }
}

/// Decode the data block of a validated frame into an event.
///
/// Returns `Ok(None)` for `NULL` link tests. Encrypted blocks are
/// hex-decoded and run through AES before the content grammar
/// (`|Nri<zone>/<code><argument>`) is applied.
pub fn decode_event(frame: &SiaFrame, crypt: &SiaCrypt) -> Result<Option<SiaEvent>> {
    match &frame.message_type {
        MessageType::Null => return Ok(None),
        MessageType::Unsupported(t) => {
            return Err(BridgeError::UnsupportedMessageType { message_type: t.clone() });
        }
        MessageType::SiaDcs => {}
    }

    if !frame.encrypted && crypt.is_enabled() {
        return Err(BridgeError::Decrypt {
            details: "plaintext frame refused: encryption key is configured".into(),
        });
    }

    let (content, timestamp) = if frame.encrypted {
        let ciphertext = hex::decode(&frame.data)
            .map_err(|e| BridgeError::Decrypt { details: e.to_string() })?;
        let plain = crypt.decrypt(&ciphertext)?;
        let marker = plain
            .iter()
            .position(|&b| b == b'|')
            .ok_or_else(|| BridgeError::Decrypt {
                details: "no content marker after decryption (wrong key?)".into(),
            })?;
        let text = std::str::from_utf8(&plain[marker..]).map_err(|_| BridgeError::Decrypt {
            details: "decrypted content is not ASCII (wrong key?)".into(),
        })?;
        match text.find(']') {
            Some(close) => (
                text[..close].to_string(),
                parse_trailer_timestamp(&text[close + 1..])?,
            ),
            None => (text.to_string(), None),
        }
    } else {
        (frame.data.clone(), frame.timestamp)
    };

    let (zone, code, message) = parse_content(&content)?;

    Ok(Some(SiaEvent {
        account: frame.account.clone(),
        code,
        zone,
        message,
        sequence: frame.sequence.clone(),
        timestamp,
    }))
}

/// Split `|Nri<zone>/<code><argument>` into its parts.
fn parse_content(content: &str) -> Result<(Option<u32>, String, String)> {
    let c = content.strip_prefix('|').unwrap_or(content);
    let c = c.strip_prefix('N').unwrap_or(c);

    let (zone, c) = match c.strip_prefix("ri") {
        Some(r) => {
            let n = r.find(|ch: char| !ch.is_ascii_digit()).unwrap_or(r.len());
            let zone = r[..n].parse::<u32>().ok();
            let after = r[n..].strip_prefix('/').unwrap_or(&r[n..]);
            (zone, after)
        }
        None => (None, c),
    };

    if c.len() < 2 || !c[..2].bytes().all(|b| b.is_ascii_uppercase()) {
        return Err(BridgeError::malformed(format!(
            "missing event code in data block {content:?}"
        )));
    }

    Ok((zone, c[..2].to_string(), c[2..].to_string()))
}

/// Reject events whose timestamp falls outside the accepted skew window.
pub fn check_timeband(event_ts: NaiveDateTime, now: NaiveDateTime) -> Result<()> {
    let skew_secs = (now - event_ts).num_seconds();
    if skew_secs > TIMEBAND_PAST_SECS || skew_secs < -TIMEBAND_FUTURE_SECS {
        return Err(BridgeError::StaleTimestamp { skew_secs });
    }
    Ok(())
}

fn wrap_body(body: &str) -> Vec<u8> {
    let mut frame = Vec::with_capacity(body.len() + 10);
    frame.push(LF);
    frame.extend_from_slice(crc16_hex(body.as_bytes()).as_bytes());
    frame.extend_from_slice(format!("{:04X}", body.len()).as_bytes());
    frame.extend_from_slice(body.as_bytes());
    frame.push(CR);
    frame
}

fn routing_fields(frame: &SiaFrame) -> String {
    let mut fields = String::new();
    if let Some(r) = &frame.receiver {
        fields.push('R');
        fields.push_str(r);
    }
    fields.push('L');
    fields.push_str(&frame.line);
    fields
}

/// Positive acknowledgement, echoing the frame's routing fields.
pub fn build_ack(frame: &SiaFrame) -> Vec<u8> {
    wrap_body(&format!(
        "\"ACK\"{}{}#{}[]",
        frame.sequence,
        routing_fields(frame),
        frame.account
    ))
}

/// `DUH`: the frame parsed but its message type is not supported here.
pub fn build_duh(frame: &SiaFrame) -> Vec<u8> {
    wrap_body(&format!(
        "\"DUH\"{}{}#{}[]",
        frame.sequence,
        routing_fields(frame),
        frame.account
    ))
}

/// Negative acknowledgement with the receiver's current time.
pub fn build_nak(now: NaiveDateTime) -> Vec<u8> {
    wrap_body(&format!("\"NAK\"0000L0R0A0[]_{}", now.format(TIMESTAMP_FORMAT)))
}

/// Compose a full event frame, encrypting the data block when the engine
/// has a key.
pub fn encode_event_frame(
    account: &str,
    sequence: u16,
    zone: u32,
    code: &str,
    message: &str,
    timestamp: Option<NaiveDateTime>,
    crypt: &SiaCrypt,
) -> Result<Vec<u8>> {
    let content = format!("|Nri{zone}/{code}{message}");
    let trailer = timestamp
        .map(|t| format!("_{}", t.format(TIMESTAMP_FORMAT)))
        .unwrap_or_default();

    let body = if crypt.is_enabled() {
        let plaintext = format!("{content}]{trailer}");
        let ciphertext = crypt.encrypt(plaintext.as_bytes())?;
        format!(
            "\"*SIA-DCS\"{sequence:04}R0L0#{account}[{}",
            hex::encode_upper(ciphertext)
        )
    } else {
        format!("\"SIA-DCS\"{sequence:04}R0L0#{account}[{content}]{trailer}")
    };

    Ok(wrap_body(&body))
}
