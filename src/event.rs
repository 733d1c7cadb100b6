// MIT License - Copyright (c) 2026 Peter Wright

use chrono::NaiveDateTime;

/// A decoded SIA DC-09 event, produced by the codec after the frame has
/// passed CRC, account and (if configured) decryption checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiaEvent {
    /// Account identifier from the frame (3-16 hex characters).
    pub account: String,
    /// Two-letter SIA event code, e.g. `CL`, `NL`, `OP`.
    pub code: String,
    /// Zone/area number from the `ri` prefix, when present.
    pub zone: Option<u32>,
    /// Free-form argument after the code (user number etc.).
    pub message: String,
    /// Frame sequence number (4 digits on the wire).
    pub sequence: String,
    /// UTC timestamp carried by the frame, when present.
    pub timestamp: Option<NaiveDateTime>,
}

/// Whether the alarm system is currently armed.
///
/// The bridge starts as `Disarmed` (privacy mode assumed on) and only the
/// router mutates this on a recognized transition event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmState {
    Armed,
    Disarmed,
}

/// A privacy-mode command for the camera fleet, produced by the router
/// and consumed exactly once by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraAction {
    /// Shut the lenses (system disarmed, people are home).
    EnablePrivacy,
    /// Restore capture (system armed, premises empty).
    DisablePrivacy,
}

impl CameraAction {
    /// The `closeCamera` switch position this action maps to.
    pub fn switch_on(self) -> bool {
        matches!(self, CameraAction::EnablePrivacy)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CameraAction::EnablePrivacy => "enable-privacy",
            CameraAction::DisablePrivacy => "disable-privacy",
        }
    }
}

impl std::fmt::Display for CameraAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bounded queue from protocol connections into the router task.
pub type EventSender = tokio::sync::mpsc::Sender<SiaEvent>;
pub type EventReceiver = tokio::sync::mpsc::Receiver<SiaEvent>;

/// Bounded queue from the router task into the dispatcher task. A single
/// consumer keeps actions in arrival order.
pub type ActionSender = tokio::sync::mpsc::Sender<CameraAction>;
pub type ActionReceiver = tokio::sync::mpsc::Receiver<CameraAction>;

/// Create the event channel with the given capacity.
pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    tokio::sync::mpsc::channel(capacity)
}

/// Create the action channel with the given capacity.
pub fn action_channel(capacity: usize) -> (ActionSender, ActionReceiver) {
    tokio::sync::mpsc::channel(capacity)
}
