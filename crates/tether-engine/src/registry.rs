//! Session registry: which observer owns which window.
//!
//! The registry is the only structure shared by every session. All
//! operations take one lock, so attach/detach/resolve are serialized and a
//! window never has two live observers.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use tether_common::RelayError;
use tether_common::protocol::{SessionId, SessionInfo, SessionState, TargetHint, WindowId};
use tracing::info;
use uuid::Uuid;

pub const SESSION_ID_PREFIX: &str = "sess_";

/// Result of attaching an observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub session_id: SessionId,
    /// The session that previously owned the window, now disconnected.
    pub displaced: Option<SessionId>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    sessions: HashMap<SessionId, SessionInfo>,
    by_window: HashMap<WindowId, SessionId>,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    inner: Mutex<RegistryInner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a new observer for `window_id`.
    ///
    /// The new session starts in `Connecting`; call [`activate`](Self::activate)
    /// once its runtime is wired up. Any session that owned the window is
    /// moved to `Disconnected` in the same critical section.
    pub fn attach(&self, window_id: &str, url: Option<String>) -> Attachment {
        let session_id = format!("{}{}", SESSION_ID_PREFIX, Uuid::new_v4().simple());
        let mut inner = self.lock();

        let displaced = inner.by_window.remove(window_id);
        if let Some(old) = &displaced
            && let Some(info) = inner.sessions.get_mut(old)
        {
            info.state = SessionState::Disconnected;
            info!(
                session_id = %old,
                window_id = %window_id,
                "Session displaced by newer observer"
            );
        }

        inner.sessions.insert(
            session_id.clone(),
            SessionInfo {
                session_id: session_id.clone(),
                window_id: window_id.to_string(),
                state: SessionState::Connecting,
                created_at: unix_millis(),
                url,
            },
        );
        inner
            .by_window
            .insert(window_id.to_string(), session_id.clone());

        Attachment {
            session_id,
            displaced,
        }
    }

    /// Move a `Connecting` session to `Connected`.
    pub fn activate(&self, session_id: &str) -> Result<(), RelayError> {
        let mut inner = self.lock();
        let info = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| RelayError::NotFound(format!("session {}", session_id)))?;
        match info.state {
            SessionState::Connecting => {
                info.state = SessionState::Connected;
                Ok(())
            }
            SessionState::Connected | SessionState::Paused => Ok(()),
            SessionState::Disconnected => Err(RelayError::NotActive(format!(
                "session {} was displaced before activation",
                session_id
            ))),
        }
    }

    /// Remove a session. The window index is only cleared if it still points
    /// at this session, so detaching a displaced session never touches its
    /// successor.
    pub fn detach(&self, session_id: &str) -> Option<SessionInfo> {
        let mut inner = self.lock();
        let info = inner.sessions.remove(session_id)?;
        if inner.by_window.get(&info.window_id).map(String::as_str) == Some(session_id) {
            inner.by_window.remove(&info.window_id);
        }
        Some(info)
    }

    /// Resolve an addressing hint to a live session.
    ///
    /// Precedence: explicit session > explicit window > the single live
    /// session. With no hint and several live sessions the result is
    /// `Ambiguous`, never a guess.
    pub fn resolve(&self, hint: &TargetHint) -> Result<SessionId, RelayError> {
        let inner = self.lock();

        if let Some(session_id) = &hint.session {
            let info = inner
                .sessions
                .get(session_id)
                .ok_or_else(|| RelayError::NotFound(format!("session {}", session_id)))?;
            return live_or_not_active(info);
        }

        if let Some(window_id) = &hint.window {
            let session_id = inner
                .by_window
                .get(window_id)
                .ok_or_else(|| RelayError::NotFound(format!("window {}", window_id)))?;
            let info = inner
                .sessions
                .get(session_id)
                .ok_or_else(|| RelayError::NotFound(format!("session {}", session_id)))?;
            return live_or_not_active(info);
        }

        let mut live = inner.sessions.values().filter(|s| s.state.is_live());
        match (live.next(), live.next()) {
            (None, _) => Err(RelayError::NotFound("no attached sessions".into())),
            (Some(only), None) => Ok(only.session_id.clone()),
            (Some(_), Some(_)) => Err(RelayError::Ambiguous(format!(
                "{} sessions attached; specify a session or window",
                inner.sessions.values().filter(|s| s.state.is_live()).count()
            ))),
        }
    }

    pub fn set_paused(&self, session_id: &str, paused: bool) -> Result<(), RelayError> {
        let mut inner = self.lock();
        let info = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| RelayError::NotFound(format!("session {}", session_id)))?;
        info.state = match (info.state, paused) {
            (SessionState::Connected | SessionState::Paused, true) => SessionState::Paused,
            (SessionState::Connected | SessionState::Paused, false) => SessionState::Connected,
            (state, _) => {
                return Err(RelayError::NotActive(format!(
                    "session {} is {:?}",
                    session_id, state
                )));
            }
        };
        info!(session_id = %session_id, paused, "Session pause state changed");
        Ok(())
    }

    pub fn state(&self, session_id: &str) -> Option<SessionState> {
        self.lock().sessions.get(session_id).map(|s| s.state)
    }

    pub fn get(&self, session_id: &str) -> Option<SessionInfo> {
        self.lock().sessions.get(session_id).cloned()
    }

    /// All known sessions, oldest first.
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self.lock().sessions.values().cloned().collect();
        sessions.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        sessions
    }
}

fn live_or_not_active(info: &SessionInfo) -> Result<SessionId, RelayError> {
    if info.state.is_live() {
        Ok(info.session_id.clone())
    } else {
        Err(RelayError::NotActive(format!(
            "session {} is {:?}",
            info.session_id, info.state
        )))
    }
}

pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_common::ErrorKind;

    fn attach_active(registry: &SessionRegistry, window: &str) -> SessionId {
        let attachment = registry.attach(window, None);
        registry.activate(&attachment.session_id).unwrap();
        attachment.session_id
    }

    fn live_for_window(registry: &SessionRegistry, window: &str) -> usize {
        registry
            .list()
            .iter()
            .filter(|s| s.window_id == window && s.state.is_live())
            .count()
    }

    #[test]
    fn test_reattach_displaces_previous_observer() {
        let registry = SessionRegistry::new();
        let first = attach_active(&registry, "w1");
        let second = registry.attach("w1", None);
        registry.activate(&second.session_id).unwrap();

        assert_eq!(second.displaced.as_deref(), Some(first.as_str()));
        assert_eq!(registry.state(&first), Some(SessionState::Disconnected));
        assert_eq!(
            registry.resolve(&TargetHint::window("w1")).unwrap(),
            second.session_id
        );
        assert_eq!(live_for_window(&registry, "w1"), 1);
    }

    #[test]
    fn test_displaced_session_cannot_activate() {
        let registry = SessionRegistry::new();
        let first = registry.attach("w1", None);
        registry.attach("w1", None);
        let err = registry.activate(&first.session_id).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotActive);
    }

    #[test]
    fn test_detach_of_displaced_session_keeps_successor() {
        let registry = SessionRegistry::new();
        let first = attach_active(&registry, "w1");
        let second = attach_active(&registry, "w1");

        registry.detach(&first);
        assert_eq!(
            registry.resolve(&TargetHint::window("w1")).unwrap(),
            second
        );
    }

    #[test]
    fn test_at_most_one_live_session_per_window_over_any_sequence() {
        let registry = SessionRegistry::new();
        let windows = ["w1", "w2", "w1", "w1", "w3", "w2", "w1"];
        let mut attached = Vec::new();
        for (i, window) in windows.iter().enumerate() {
            attached.push(attach_active(&registry, window));
            if i % 3 == 2 {
                registry.detach(&attached[i / 2]);
            }
            for w in ["w1", "w2", "w3"] {
                assert!(live_for_window(&registry, w) <= 1);
            }
        }
    }

    #[test]
    fn test_resolution_precedence() {
        let registry = SessionRegistry::new();
        let s1 = attach_active(&registry, "w1");
        let s2 = attach_active(&registry, "w2");

        let hint = TargetHint {
            session: Some(s1.clone()),
            window: Some("w2".into()),
        };
        assert_eq!(registry.resolve(&hint).unwrap(), s1);
        assert_eq!(registry.resolve(&TargetHint::window("w2")).unwrap(), s2);

        let err = registry.resolve(&TargetHint::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Ambiguous);
    }

    #[test]
    fn test_default_resolution_with_single_or_no_session() {
        let registry = SessionRegistry::new();
        let err = registry.resolve(&TargetHint::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let s1 = attach_active(&registry, "w1");
        assert_eq!(registry.resolve(&TargetHint::default()).unwrap(), s1);
    }

    #[test]
    fn test_unknown_targets_are_not_found() {
        let registry = SessionRegistry::new();
        attach_active(&registry, "w1");
        let err = registry.resolve(&TargetHint::window("nope")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = registry.resolve(&TargetHint::session("nope")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_pause_and_resume() {
        let registry = SessionRegistry::new();
        let s1 = attach_active(&registry, "w1");
        registry.set_paused(&s1, true).unwrap();
        assert_eq!(registry.state(&s1), Some(SessionState::Paused));
        // Paused sessions stay resolvable for read-only traffic.
        assert_eq!(registry.resolve(&TargetHint::default()).unwrap(), s1);
        registry.set_paused(&s1, false).unwrap();
        assert_eq!(registry.state(&s1), Some(SessionState::Connected));
    }
}
