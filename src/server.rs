// MIT License - Copyright (c) 2026 Peter Wright

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDateTime, Utc};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, tcp::OwnedWriteHalf};
use tokio::sync::watch;
use tokio::time::{Instant, timeout};
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::constants::{BAD_FRAME_LIMIT, BAD_FRAME_RESET_SECS, CR};
use crate::crypto::SiaCrypt;
use crate::error::{BridgeError, Result};
use crate::event::{EventSender, SiaEvent};
use crate::protocol::{
    MessageType, build_ack, build_duh, build_nak, check_timeband, decode_event, parse_frame,
};

/// Frames larger than this are junk; DC-09 bodies are a few hundred bytes.
const MAX_FRAME_BYTES: usize = 4096;

/// The DC-09 receiver: accepts panel connections and feeds decoded events
/// into the router queue.
///
/// Each connection runs in its own task. Connections never share state;
/// the only cross-task effect of a frame is the event it pushes into the
/// bounded queue. A slow or dead peer is bounded by the socket timeout
/// and cannot stall the others.
pub struct SiaServer {
    listener: TcpListener,
    account: String,
    crypt: Arc<SiaCrypt>,
    socket_timeout: Duration,
    events: EventSender,
}

impl SiaServer {
    /// Bind the configured address. A bind failure is fatal at startup.
    pub async fn bind(config: &BridgeConfig, events: EventSender) -> Result<Self> {
        let addr = config.listen_addr();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| BridgeError::config(format!("cannot bind {addr}: {e}")))?;
        let crypt = Arc::new(SiaCrypt::new(config.encryption_key.as_deref())?);
        info!(%addr, encrypted = crypt.is_enabled(), "SIA receiver listening");
        Ok(Self {
            listener,
            account: config.account.clone(),
            crypt,
            socket_timeout: config.socket_timeout,
            events,
        })
    }

    /// The actually bound address (useful when the port was 0 in tests).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until shutdown is signalled.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "panel connected");
                        let connection = Connection {
                            account: self.account.clone(),
                            crypt: Arc::clone(&self.crypt),
                            socket_timeout: self.socket_timeout,
                            events: self.events.clone(),
                        };
                        tokio::spawn(connection.serve(stream, peer, shutdown.clone()));
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("listener stopping, no longer accepting connections");
                        break;
                    }
                }
            }
        }
    }
}

struct Connection {
    account: String,
    crypt: Arc<SiaCrypt>,
    socket_timeout: Duration,
    events: EventSender,
}

impl Connection {
    async fn serve(self, stream: TcpStream, peer: SocketAddr, mut shutdown: watch::Receiver<bool>) {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut buf: Vec<u8> = Vec::new();
        let mut bad_frames: u32 = 0;
        let mut last_bad: Option<Instant> = None;

        loop {
            buf.clear();
            // Cap the read so a peer that never sends CR cannot grow the
            // buffer past one frame's worth of bytes.
            let mut limited = (&mut reader).take(MAX_FRAME_BYTES as u64 + 1);
            let read = tokio::select! {
                r = timeout(self.socket_timeout, limited.read_until(CR, &mut buf)) => r,
                _ = shutdown.changed() => {
                    debug!(%peer, "closing connection for shutdown");
                    return;
                }
            };

            match read {
                Err(_) => {
                    debug!(%peer, "read timeout, closing connection");
                    return;
                }
                Ok(Err(e)) => {
                    debug!(%peer, error = %e, "read failed, closing connection");
                    return;
                }
                Ok(Ok(0)) => {
                    debug!(%peer, "panel disconnected");
                    return;
                }
                Ok(Ok(_)) if buf.len() > MAX_FRAME_BYTES => {
                    warn!(%peer, bytes = buf.len(), "oversized frame, closing connection");
                    return;
                }
                Ok(Ok(_)) => {}
            }

            let outcome = process_frame(&buf, &self.account, &self.crypt, Utc::now().naive_utc());

            if outcome.failed {
                // Reset the strike counter after a quiet minute
                if let Some(last) = last_bad
                    && last.elapsed() > Duration::from_secs(BAD_FRAME_RESET_SECS)
                {
                    bad_frames = 0;
                }
                bad_frames += 1;
                last_bad = Some(Instant::now());
                if bad_frames > BAD_FRAME_LIMIT {
                    warn!(%peer, bad_frames, "too many undecodable frames, closing connection");
                    return;
                }
            }

            // Queue the event before acknowledging receipt
            if let Some(event) = outcome.event
                && self.events.send(event).await.is_err()
            {
                debug!(%peer, "event queue closed, dropping connection");
                return;
            }

            if !self.write_reply(&mut write_half, &outcome.reply, peer).await {
                return;
            }
        }
    }

    async fn write_reply(&self, write_half: &mut OwnedWriteHalf, reply: &[u8], peer: SocketAddr) -> bool {
        match timeout(self.socket_timeout, write_half.write_all(reply)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!(%peer, error = %e, "write failed, closing connection");
                false
            }
            Err(_) => {
                debug!(%peer, "write timeout, closing connection");
                false
            }
        }
    }
}

struct FrameOutcome {
    reply: Vec<u8>,
    event: Option<SiaEvent>,
    /// Counts toward the per-connection bad-frame limit.
    failed: bool,
}

/// Decide how to answer one raw frame. Pure apart from logging.
fn process_frame(
    raw: &[u8],
    expected_account: &str,
    crypt: &SiaCrypt,
    now: NaiveDateTime,
) -> FrameOutcome {
    let frame = match parse_frame(raw) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "frame rejected");
            return FrameOutcome { reply: build_nak(now), event: None, failed: true };
        }
    };

    if frame.account != expected_account {
        let e = BridgeError::AccountMismatch { received: frame.account.clone() };
        warn!(error = %e, "frame rejected");
        return FrameOutcome { reply: build_nak(now), event: None, failed: true };
    }

    if let MessageType::Unsupported(t) = &frame.message_type {
        info!(message_type = %t, account = %frame.account, "unsupported message type");
        return FrameOutcome { reply: build_duh(&frame), event: None, failed: false };
    }

    match decode_event(&frame, crypt) {
        Ok(None) => {
            debug!(account = %frame.account, "link test");
            FrameOutcome { reply: build_ack(&frame), event: None, failed: false }
        }
        Ok(Some(event)) => {
            if let Some(ts) = event.timestamp
                && let Err(e) = check_timeband(ts, now)
            {
                warn!(account = %event.account, code = %event.code, error = %e, "frame rejected");
                return FrameOutcome { reply: build_nak(now), event: None, failed: true };
            }
            debug!(
                account = %event.account,
                code = %event.code,
                zone = ?event.zone,
                sequence = %event.sequence,
                "event received"
            );
            FrameOutcome { reply: build_ack(&frame), event: Some(event), failed: false }
        }
        Err(e) => {
            warn!(account = %frame.account, error = %e, "frame rejected");
            FrameOutcome { reply: build_nak(now), event: None, failed: true }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode_event_frame;

    fn plain_crypt() -> SiaCrypt {
        SiaCrypt::new(None).unwrap()
    }

    fn now() -> NaiveDateTime {
        Utc::now().naive_utc()
    }

    fn reply_text(outcome: &FrameOutcome) -> String {
        String::from_utf8_lossy(&outcome.reply).to_string()
    }

    #[test]
    fn test_valid_event_gets_ack() {
        let crypt = plain_crypt();
        let raw = encode_event_frame("000", 1, 1, "CL", "1", None, &crypt).unwrap();
        let outcome = process_frame(&raw, "000", &crypt, now());
        assert!(!outcome.failed);
        assert!(reply_text(&outcome).contains("\"ACK\""));
        let event = outcome.event.unwrap();
        assert_eq!(event.code, "CL");
        assert_eq!(event.account, "000");
    }

    #[test]
    fn test_wrong_account_gets_nak_and_no_event() {
        let crypt = plain_crypt();
        let raw = encode_event_frame("999", 1, 1, "CL", "1", None, &crypt).unwrap();
        let outcome = process_frame(&raw, "000", &crypt, now());
        assert!(outcome.failed);
        assert!(outcome.event.is_none());
        assert!(reply_text(&outcome).contains("\"NAK\""));
    }

    #[test]
    fn test_tampered_frame_gets_nak() {
        let crypt = plain_crypt();
        let mut raw = encode_event_frame("000", 1, 1, "CL", "1", None, &crypt).unwrap();
        let n = raw.len();
        raw[n - 3] ^= 0x01;
        let outcome = process_frame(&raw, "000", &crypt, now());
        assert!(outcome.failed);
        assert!(outcome.event.is_none());
        assert!(reply_text(&outcome).contains("\"NAK\""));
    }

    #[test]
    fn test_stale_timestamp_gets_nak() {
        let crypt = plain_crypt();
        let stale = now() - chrono::Duration::seconds(600);
        let raw = encode_event_frame("000", 1, 1, "CL", "1", Some(stale), &crypt).unwrap();
        let outcome = process_frame(&raw, "000", &crypt, now());
        assert!(outcome.failed);
        assert!(outcome.event.is_none());
    }

    #[test]
    fn test_fresh_timestamp_accepted() {
        let crypt = plain_crypt();
        let raw = encode_event_frame("000", 1, 1, "OP", "1", Some(now()), &crypt).unwrap();
        let outcome = process_frame(&raw, "000", &crypt, now());
        assert!(!outcome.failed);
        assert!(outcome.event.is_some());
    }

    #[test]
    fn test_garbage_gets_nak() {
        let outcome = process_frame(b"\nhello world\r", "000", &plain_crypt(), now());
        assert!(outcome.failed);
        assert!(reply_text(&outcome).contains("\"NAK\""));
    }
}
