// MIT License - Copyright (c) 2026 Peter Wright

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::constants::{CODE_CLOSE, CODE_NIGHT_ARM, CODE_OPENING};
use crate::event::{ArmState, CameraAction, SiaEvent};

/// Maps decoded events onto camera actions, tracking the armed state.
///
/// The router is the only owner of [`ArmState`]. The check-then-update in
/// [`observe`](EventRouter::observe) runs under one mutex, so two
/// near-simultaneous copies of the same transition cannot both count as
/// novel. Repeated events for the current state (panel retransmits,
/// periodic status reports) produce no action.
pub struct EventRouter {
    state: Mutex<RouterState>,
}

#[derive(Debug, Clone, Copy)]
struct RouterState {
    armed: ArmState,
    last_transition: Option<DateTime<Utc>>,
}

impl EventRouter {
    /// Start disarmed: privacy mode is assumed on until the panel says
    /// otherwise.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RouterState {
                armed: ArmState::Disarmed,
                last_transition: None,
            }),
        }
    }

    /// Decide what an event means for the cameras.
    ///
    /// Returns an action only on a genuine state transition; the armed
    /// state is updated before the action is handed out, so it reflects
    /// the latest known truth even if the dispatch later fails.
    pub fn observe(&self, event: &SiaEvent) -> Option<CameraAction> {
        let (target, action) = match event.code.as_str() {
            CODE_CLOSE | CODE_NIGHT_ARM => (ArmState::Armed, CameraAction::DisablePrivacy),
            CODE_OPENING => (ArmState::Disarmed, CameraAction::EnablePrivacy),
            other => {
                debug!(account = %event.account, code = %other, "ignoring event code");
                return None;
            }
        };

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.armed == target {
            debug!(
                account = %event.account,
                code = %event.code,
                state = ?state.armed,
                "duplicate transition event, no action"
            );
            return None;
        }

        state.armed = target;
        state.last_transition = Some(Utc::now());
        info!(
            account = %event.account,
            code = %event.code,
            state = ?target,
            action = %action,
            "arm state transition"
        );
        Some(action)
    }

    /// The current armed state.
    pub fn armed(&self) -> ArmState {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).armed
    }

    /// When the state last changed, if it has.
    pub fn last_transition(&self) -> Option<DateTime<Utc>> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last_transition
    }
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(code: &str) -> SiaEvent {
        SiaEvent {
            account: "000".to_string(),
            code: code.to_string(),
            zone: Some(1),
            message: "1".to_string(),
            sequence: "0001".to_string(),
            timestamp: None,
        }
    }

    #[test]
    fn test_starts_disarmed() {
        let router = EventRouter::new();
        assert_eq!(router.armed(), ArmState::Disarmed);
        assert_eq!(router.last_transition(), None);
    }

    #[test]
    fn test_close_arms_and_disables_privacy() {
        let router = EventRouter::new();
        assert_eq!(
            router.observe(&event("CL")),
            Some(CameraAction::DisablePrivacy)
        );
        assert_eq!(router.armed(), ArmState::Armed);
        assert!(router.last_transition().is_some());
    }

    #[test]
    fn test_duplicate_close_is_idempotent() {
        let router = EventRouter::new();
        assert!(router.observe(&event("CL")).is_some());
        assert_eq!(router.observe(&event("CL")), None);
        assert_eq!(router.armed(), ArmState::Armed);
    }

    #[test]
    fn test_night_arm_after_close_is_idempotent() {
        let router = EventRouter::new();
        assert!(router.observe(&event("CL")).is_some());
        // NL targets the same state, so no second action
        assert_eq!(router.observe(&event("NL")), None);
        assert_eq!(router.armed(), ArmState::Armed);
    }

    #[test]
    fn test_opening_enables_privacy() {
        let router = EventRouter::new();
        assert!(router.observe(&event("NL")).is_some());
        assert_eq!(
            router.observe(&event("OP")),
            Some(CameraAction::EnablePrivacy)
        );
        assert_eq!(router.armed(), ArmState::Disarmed);
    }

    #[test]
    fn test_opening_while_disarmed_is_ignored() {
        let router = EventRouter::new();
        assert_eq!(router.observe(&event("OP")), None);
        assert_eq!(router.armed(), ArmState::Disarmed);
    }

    #[test]
    fn test_unrecognized_codes_do_nothing() {
        let router = EventRouter::new();
        for code in ["BA", "TA", "RP", "YX"] {
            assert_eq!(router.observe(&event(code)), None);
        }
        assert_eq!(router.armed(), ArmState::Disarmed);
        assert_eq!(router.last_transition(), None);
    }

    #[test]
    fn test_arm_disarm_sequence_produces_ordered_actions() {
        let router = EventRouter::new();
        let actions: Vec<_> = ["NL", "OP", "CL", "CL", "OP"]
            .iter()
            .filter_map(|code| router.observe(&event(code)))
            .collect();
        assert_eq!(
            actions,
            vec![
                CameraAction::DisablePrivacy,
                CameraAction::EnablePrivacy,
                CameraAction::DisablePrivacy,
                CameraAction::EnablePrivacy,
            ]
        );
    }
}
