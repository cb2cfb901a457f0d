use serde::{Deserialize, Serialize};
use tether_common::RelayError;
use tether_common::error::ErrorKind;
use tether_common::protocol::{CommandRequest, MutationBatch, NotableEntry, SessionId, Verb};
use tracing::info;

use crate::registry::unix_millis;

/// Notable entries kept per step.
const EFFECT_NOTABLE_LIMIT: usize = 3;

/// Mutations observed between one step and the next.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepEffects {
    pub added: usize,
    pub removed: usize,
    pub attributes_changed: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notable: Vec<NotableEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedStep {
    pub index: usize,
    pub verb: Verb,
    /// Selector or reference the command addressed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Selector the observer reported for the element, when the command
    /// addressed it by reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_selector: Option<String>,
    pub args: serde_json::Value,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effects: Option<StepEffects>,
}

/// A finished recording. Immutable once handed out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recording {
    pub name: String,
    pub session: SessionId,
    pub started_at: u64,
    pub stopped_at: u64,
    pub steps: Vec<RecordedStep>,
}

impl Recording {
    /// Successful steps as commands that can be sent again through the relay.
    ///
    /// References do not survive into a new session, so a step that was
    /// addressed by `ref` is rewritten to the selector the observer reported.
    pub fn replay_requests(&self) -> Vec<CommandRequest> {
        self.steps
            .iter()
            .filter(|s| s.success)
            .map(|step| {
                let mut args = step.args.clone();
                if let (Some(selector), Some(obj)) = (&step.resolved_selector, args.as_object_mut())
                    && obj.remove("ref").is_some()
                {
                    obj.insert("selector".into(), serde_json::Value::String(selector.clone()));
                }
                CommandRequest::new(step.verb, args)
            })
            .collect()
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}

#[derive(Debug)]
struct ActiveRecording {
    name: String,
    started_at: u64,
    steps: Vec<RecordedStep>,
}

/// Idle/recording state machine, one per session.
#[derive(Debug, Default)]
pub struct RecordingController {
    active: Option<ActiveRecording>,
}

impl RecordingController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    pub fn start(&mut self, name: &str) -> Result<(), RelayError> {
        if let Some(active) = &self.active {
            return Err(RelayError::AlreadyActive(format!(
                "recording '{}' is already in progress",
                active.name
            )));
        }
        info!(recording = %name, "Recording started");
        self.active = Some(ActiveRecording {
            name: name.to_string(),
            started_at: unix_millis(),
            steps: Vec::new(),
        });
        Ok(())
    }

    /// Record a forwarded command and its outcome.
    pub fn note_command(
        &mut self,
        request: &CommandRequest,
        outcome: &Result<serde_json::Value, RelayError>,
    ) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let resolved_selector = match outcome {
            Ok(data) => data
                .get("selector")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            Err(_) => None,
        };
        active.steps.push(RecordedStep {
            index: active.steps.len(),
            verb: request.verb,
            target: request.target_label(),
            resolved_selector,
            args: request.args.clone(),
            success: outcome.is_ok(),
            error: outcome.as_ref().err().map(RelayError::kind),
            effects: None,
        });
    }

    /// Attribute a mutation batch to the most recent step. Batches that
    /// arrive before the first step are not part of any step.
    pub fn note_batch(&mut self, batch: &MutationBatch) {
        let Some(step) = self.active.as_mut().and_then(|a| a.steps.last_mut()) else {
            return;
        };
        let effects = step.effects.get_or_insert_with(StepEffects::default);
        effects.added += batch.added;
        effects.removed += batch.removed;
        effects.attributes_changed += batch.attributes_changed;
        for entry in &batch.notable {
            if effects.notable.len() >= EFFECT_NOTABLE_LIMIT {
                break;
            }
            effects.notable.push(entry.clone());
        }
    }

    pub fn stop(&mut self, session: &str) -> Result<Recording, RelayError> {
        let active = self
            .active
            .take()
            .ok_or_else(|| RelayError::NotActive("no recording in progress".into()))?;
        info!(recording = %active.name, steps = active.steps.len(), "Recording stopped");
        Ok(Recording {
            name: active.name,
            session: session.to_string(),
            started_at: active.started_at,
            stopped_at: unix_millis(),
            steps: active.steps,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn batch(added: usize) -> MutationBatch {
        MutationBatch {
            timestamp: 0,
            first_record_at: 0,
            last_record_at: 0,
            record_count: added,
            added,
            removed: 0,
            attributes_changed: 0,
            notable: vec![],
            windows: 1,
        }
    }

    #[test]
    fn test_start_twice_is_already_active() {
        let mut rec = RecordingController::new();
        rec.start("login").unwrap();
        let err = rec.start("other").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyActive);
    }

    #[test]
    fn test_stop_when_idle_is_not_active() {
        let mut rec = RecordingController::new();
        let err = rec.stop("s").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotActive);
    }

    #[test]
    fn test_steps_in_order_with_effects() {
        let mut rec = RecordingController::new();
        rec.start("login").unwrap();
        rec.note_batch(&batch(9)); // before any step: ignored

        let type_req = CommandRequest::new(Verb::Type, json!({"selector": "#user", "text": "bob"}));
        rec.note_command(&type_req, &Ok(json!({"ref": "e1"})));
        rec.note_batch(&batch(1));
        rec.note_batch(&batch(2));

        let click_req = CommandRequest::new(Verb::Click, json!({"selector": "#go"}));
        rec.note_command(&click_req, &Err(RelayError::NotFound("#go".into())));

        let recording = rec.stop("sess_1").unwrap();
        assert!(!rec.is_recording());
        assert_eq!(recording.steps.len(), 2);
        assert_eq!(recording.steps[0].target.as_deref(), Some("#user"));
        assert_eq!(recording.steps[0].effects.as_ref().map(|e| e.added), Some(3));
        assert_eq!(recording.steps[1].error, Some(ErrorKind::NotFound));
        assert_eq!(recording.replay_requests().len(), 1);
    }

    #[test]
    fn test_replay_rewrites_refs_to_selectors() {
        let mut rec = RecordingController::new();
        rec.start("r").unwrap();
        let req = CommandRequest::new(Verb::Click, json!({"ref": "e4"}));
        rec.note_command(&req, &Ok(json!({"ref": "e4", "selector": "button#submit"})));
        let recording = rec.stop("s").unwrap();

        let replay = recording.replay_requests();
        assert_eq!(replay[0].args, json!({"selector": "button#submit"}));
        assert!(recording.to_yaml().unwrap().contains("button#submit"));
    }
}
