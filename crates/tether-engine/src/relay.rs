//! Relay core: routes caller commands to observers and observer emissions to
//! per-session buffers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::json;
use tether_common::RelayError;
use tether_common::protocol::{
    BufferedItem, CommandRequest, CommandResponse, ObserverCommand, ObserverMessage,
    PollResponse, RelayMessage, SessionId, SessionInfo, SessionState, TargetHint, Verb,
};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::registry::SessionRegistry;
use crate::session::{CommandOutcome, Ingest, SessionRuntime};

/// The relay side of an attached observer.
///
/// `commands` yields what must be written to the observer. It closes when the
/// session is displaced or killed, which is the observer's cue to hang up.
#[derive(Debug)]
pub struct ObserverLink {
    pub session_id: SessionId,
    pub commands: mpsc::Receiver<RelayMessage>,
}

/// A live view of one session's outbound buffer.
#[derive(Debug)]
pub struct Subscription {
    pub session_id: SessionId,
    pub backlog: Vec<BufferedItem>,
    pub live: broadcast::Receiver<BufferedItem>,
}

pub struct Relay {
    config: RelayConfig,
    registry: SessionRegistry,
    sessions: Mutex<HashMap<SessionId, Arc<SessionRuntime>>>,
    affinity: Mutex<HashMap<String, SessionId>>,
    next_request_id: AtomicU64,
}

impl Relay {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            registry: SessionRegistry::new(),
            sessions: Mutex::new(HashMap::new()),
            affinity: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<SessionId, Arc<SessionRuntime>>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn affinity(&self) -> MutexGuard<'_, HashMap<String, SessionId>> {
        self.affinity.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn runtime(&self, session_id: &str) -> Result<Arc<SessionRuntime>, RelayError> {
        self.sessions()
            .get(session_id)
            .cloned()
            .ok_or_else(|| RelayError::NotActive(format!("session {} ended", session_id)))
    }

    // ------------------------------------------------------------------
    // Observer side
    // ------------------------------------------------------------------

    /// Handshake a new observer for `window_id`. Must be called from within a
    /// tokio runtime: the session's pipeline tasks are spawned here.
    pub fn attach_observer(
        &self,
        window_id: &str,
        url: Option<String>,
    ) -> Result<ObserverLink, RelayError> {
        let attachment = self.registry.attach(window_id, url);
        let session_id = attachment.session_id;

        if let Some(old) = attachment.displaced {
            self.retire(&old, "session displaced by a newer observer");
        }

        let (link_tx, link_rx) = mpsc::channel(self.config.relay.outbound_queue.max(1));
        let runtime = SessionRuntime::spawn(session_id.clone(), &self.config, link_tx);
        self.sessions()
            .insert(session_id.clone(), Arc::new(runtime));

        if let Err(e) = self.registry.activate(&session_id) {
            // Raced with an even newer observer for the same window.
            self.retire(&session_id, "session displaced during attach");
            return Err(e);
        }

        info!(session_id = %session_id, window_id = %window_id, "Observer attached");
        Ok(ObserverLink {
            session_id,
            commands: link_rx,
        })
    }

    /// Feed one message from an observer into its session.
    pub async fn ingest(&self, session_id: &str, message: ObserverMessage) -> Result<(), RelayError> {
        let runtime = self.runtime(session_id)?;
        match message {
            ObserverMessage::Hello { .. } => {
                warn!(session_id = %session_id, "Ignoring repeated hello");
                Ok(())
            }
            ObserverMessage::Result {
                request_id,
                success,
                data,
                error,
            } => {
                let outcome = match (success, error) {
                    (true, _) => Ok(data.unwrap_or(serde_json::Value::Null)),
                    (false, Some(body)) => Err(RelayError::from(body)),
                    (false, None) => Err(RelayError::Observer("command failed".into())),
                };
                runtime.complete(request_id, outcome);
                Ok(())
            }
            ObserverMessage::Mutations { records } => {
                runtime.ingest(Ingest::Mutations(records)).await
            }
            ObserverMessage::Input { events } => runtime.ingest(Ingest::Input(events)).await,
            ObserverMessage::Console(entry) => runtime.ingest(Ingest::Console(entry)).await,
        }
    }

    /// Observer disconnected. Outstanding commands fail with `NotActive`.
    pub fn detach(&self, session_id: &str) -> Option<SessionInfo> {
        self.retire(session_id, "session ended");
        let info = self.registry.detach(session_id);
        if info.is_some() {
            info!(session_id = %session_id, "Observer detached");
        }
        info
    }

    /// Drop the session's runtime and fail whatever was waiting on it. The
    /// registry entry is left to the caller.
    fn retire(&self, session_id: &str, reason: &str) {
        let runtime = self.sessions().remove(session_id);
        if let Some(runtime) = runtime {
            let failed = runtime.fail_pending(reason);
            if failed > 0 {
                warn!(session_id = %session_id, failed, "Failed outstanding commands");
            }
        }
        self.affinity().retain(|_, s| s != session_id);
    }

    // ------------------------------------------------------------------
    // Caller side
    // ------------------------------------------------------------------

    /// Resolve a caller's target: explicit hint, then the caller's sticky
    /// session, then the single live session.
    pub fn resolve(&self, caller: Option<&str>, hint: &TargetHint) -> Result<SessionId, RelayError> {
        if !hint.is_empty() {
            return self.registry.resolve(hint);
        }
        if let Some(caller) = caller {
            let sticky = self.affinity().get(caller).cloned();
            if let Some(session_id) = sticky {
                match self.registry.state(&session_id) {
                    Some(state) if state.is_live() => return Ok(session_id),
                    _ => {
                        debug!(caller = %caller, session_id = %session_id, "Clearing stale affinity");
                        self.affinity().remove(caller);
                    }
                }
            }
        }
        self.registry.resolve(hint)
    }

    /// Execute a caller's command and wrap the outcome in a response.
    pub async fn dispatch(&self, caller: Option<&str>, request: CommandRequest) -> CommandResponse {
        match self.execute(caller, request).await {
            (session, Ok(data)) => CommandResponse::ok(data, session),
            (session, Err(e)) => CommandResponse::err(e.to_body(), session),
        }
    }

    /// Like [`dispatch`](Self::dispatch) but keeps the typed error.
    pub async fn execute(
        &self,
        caller: Option<&str>,
        request: CommandRequest,
    ) -> (Option<SessionId>, CommandOutcome) {
        let session_id = match self.resolve(caller, &request.target) {
            Ok(id) => id,
            Err(e) => return (None, Err(e)),
        };
        if let Some(caller) = caller {
            self.affinity()
                .insert(caller.to_string(), session_id.clone());
        }

        let runtime = match self.runtime(&session_id) {
            Ok(runtime) => runtime,
            Err(e) => return (Some(session_id), Err(e)),
        };

        let outcome = match request.verb {
            Verb::RecordStart => self.record_start(&runtime, &request),
            Verb::RecordStop => self.record_stop(&runtime),
            _ => {
                let outcome = self.forward(&runtime, &request).await;
                runtime.recorder().note_command(&request, &outcome);
                outcome
            }
        };

        if let Err(e) = &outcome {
            debug!(session_id = %session_id, verb = request.verb.as_str(), error = %e, "Command failed");
        }
        (Some(session_id), outcome)
    }

    fn record_start(&self, runtime: &SessionRuntime, request: &CommandRequest) -> CommandOutcome {
        let name = request
            .args
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| RelayError::InvalidRequest("record_start needs a name".into()))?;
        runtime.recorder().start(name)?;
        Ok(json!({ "recording": name, "session": runtime.id }))
    }

    fn record_stop(&self, runtime: &SessionRuntime) -> CommandOutcome {
        let recording = runtime.recorder().stop(&runtime.id)?;
        Ok(serde_json::to_value(recording)?)
    }

    async fn forward(&self, runtime: &SessionRuntime, request: &CommandRequest) -> CommandOutcome {
        if request.verb.is_mutating()
            && self.registry.state(&runtime.id) == Some(SessionState::Paused)
        {
            return Err(RelayError::Paused(format!(
                "session {} rejects {}",
                runtime.id,
                request.verb.as_str()
            )));
        }

        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let rx = runtime.register(request_id)?;
        let command = RelayMessage::Command(ObserverCommand {
            request_id,
            verb: request.verb,
            args: request.args.clone(),
        });

        // One deadline covers both waiting for room on the link and waiting
        // for the result.
        let exchange = async {
            runtime.send(command).await?;
            debug!(
                session_id = %runtime.id,
                request_id,
                verb = request.verb.as_str(),
                "Command forwarded"
            );
            rx.await.unwrap_or_else(|_| {
                Err(RelayError::NotActive(format!(
                    "session {} ended",
                    runtime.id
                )))
            })
        };

        let timeout = self.config.relay.command_timeout();
        let outcome = tokio::select! {
            result = tokio::time::timeout(timeout, exchange) => match result {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(session_id = %runtime.id, request_id, "Command timed out");
                    Err(RelayError::Timeout(format!(
                        "no result for {} within {}ms",
                        request.verb.as_str(),
                        timeout.as_millis()
                    )))
                }
            },
            _ = runtime.ended() => {
                Err(RelayError::NotActive(format!("session {} ended", runtime.id)))
            }
        };
        if outcome.is_err() {
            runtime.forget(request_id);
        }
        outcome
    }

    /// Buffered items after `since`, capped at `limit` (and the configured
    /// maximum).
    pub fn poll(
        &self,
        caller: Option<&str>,
        hint: &TargetHint,
        since: u64,
        limit: Option<usize>,
    ) -> Result<PollResponse, RelayError> {
        let session_id = self.resolve(caller, hint)?;
        let runtime = self.runtime(&session_id)?;
        let max = self.config.relay.max_poll_items.max(1);
        let limit = limit.unwrap_or(max).clamp(1, max);
        let read = runtime.buffer().read_since(since, limit);
        Ok(PollResponse {
            session: session_id,
            items: read.items,
            next: read.next,
            oldest: read.oldest,
            gap: read.gap,
        })
    }

    /// Backlog after `since` plus every item buffered from now on.
    pub fn subscribe(
        &self,
        caller: Option<&str>,
        hint: &TargetHint,
        since: u64,
    ) -> Result<Subscription, RelayError> {
        let session_id = self.resolve(caller, hint)?;
        let runtime = self.runtime(&session_id)?;
        let (backlog, live) = runtime.buffer().subscribe(since);
        Ok(Subscription {
            session_id,
            backlog,
            live,
        })
    }

    // ------------------------------------------------------------------
    // Admin
    // ------------------------------------------------------------------

    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        self.registry.list()
    }

    pub fn session(&self, session_id: &str) -> Option<SessionInfo> {
        self.registry.get(session_id)
    }

    pub fn set_paused(&self, session_id: &str, paused: bool) -> Result<SessionInfo, RelayError> {
        self.registry.set_paused(session_id, paused)?;
        self.registry
            .get(session_id)
            .ok_or_else(|| RelayError::NotFound(format!("session {}", session_id)))
    }

    /// Forcibly end a session. Its observer link closes.
    pub fn kill(&self, session_id: &str) -> Result<SessionInfo, RelayError> {
        let info = self
            .detach(session_id)
            .ok_or_else(|| RelayError::NotFound(format!("session {}", session_id)))?;
        info!(session_id = %session_id, "Session killed");
        Ok(info)
    }
}
