//! In-process observer: executes relay commands against a [`Document`].
//!
//! This is the same contract an in-page agent implements over the WebSocket,
//! run on its own task so every command for the session executes on one
//! logical thread, in arrival order.

use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::{Value, json};
use tether_common::RelayError;
use tether_common::protocol::{
    MutationKind, MutationRecord, NodeInfo, ObserverMessage, RelayMessage, SessionId, Verb,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dom::{Document, Interaction};
use crate::refs::RefTable;
use crate::relay::Relay;

/// Longest text snippet returned per query match.
const SNIPPET_CHARS: usize = 80;

pub struct DocumentObserver<D: Document> {
    doc: D,
    refs: RefTable<D::Node>,
}

impl<D: Document> DocumentObserver<D> {
    pub fn new(doc: D) -> Self {
        Self {
            doc,
            refs: RefTable::new(),
        }
    }

    pub fn document(&self) -> &D {
        &self.doc
    }

    pub fn document_mut(&mut self) -> &mut D {
        &mut self.doc
    }

    pub fn refs(&self) -> &RefTable<D::Node> {
        &self.refs
    }

    /// Run one command. Zero matches for `query` is an empty success; for
    /// any verb that needs an element it is `NotFound`.
    pub fn execute(&mut self, verb: Verb, args: &Value) -> Result<Value, RelayError> {
        match verb {
            Verb::Query => self.query(args),
            Verb::Read => {
                let node = self.target(args)?;
                let property = str_arg(args, "property").unwrap_or("text");
                let value = self.doc.read_property(&node, property);
                Ok(self.element_result(&node, json!({ "property": property, "value": value })))
            }
            Verb::RecordStart | Verb::RecordStop => Err(RelayError::InvalidRequest(format!(
                "{} is handled by the relay",
                verb.as_str()
            ))),
            _ => {
                let interaction = interaction(verb, args)?;
                let node = self.target(args)?;
                self.doc.dispatch(&node, &interaction)?;
                let events = interaction.stages().len();
                Ok(self.element_result(
                    &node,
                    json!({ "action": interaction.name(), "events": events }),
                ))
            }
        }
    }

    /// Take the document's pending change records. References to nodes that
    /// left the document are released whenever the records include removals.
    pub fn drain_records(&mut self) -> Vec<MutationRecord> {
        let mut records = self.doc.take_records();
        if records.iter().any(|r| r.kind == MutationKind::Removed) {
            let doc = &self.doc;
            self.refs.release_detached(|n| doc.is_attached(n));
        }
        for record in &mut records {
            if record.target.reference.is_none()
                && let Some(token) = self.token_for_info(&record.target)
            {
                record.target.reference = Some(token);
            }
        }
        records
    }

    /// Token of a still-attached node matching the record's id, if one was
    /// handed out.
    fn token_for_info(&self, info: &NodeInfo) -> Option<String> {
        let id = info.id.as_ref()?;
        let node = self
            .doc
            .query_selector_all(&format!("#{}", id))
            .ok()?
            .into_iter()
            .next()?;
        self.refs.token_for(&node)
    }

    fn query(&mut self, args: &Value) -> Result<Value, RelayError> {
        let selector = str_arg(args, "selector")
            .ok_or_else(|| RelayError::InvalidRequest("query needs a selector".into()))?;
        let nodes = self.doc.query_selector_all(selector)?;
        let matches: Vec<Value> = nodes
            .into_iter()
            .map(|node| {
                let token = self.refs.allocate(node.clone());
                let info = self.doc.describe(&node);
                let text: String = self
                    .doc
                    .text_content(&node)
                    .split_whitespace()
                    .collect::<Vec<_>>()
                    .join(" ")
                    .chars()
                    .take(SNIPPET_CHARS)
                    .collect();
                json!({
                    "ref": token,
                    "tag": info.tag,
                    "id": info.id,
                    "classes": info.classes,
                    "text": text,
                })
            })
            .collect();
        Ok(json!({ "count": matches.len(), "matches": matches }))
    }

    /// Resolve the element a command addresses. `ref` wins over `selector`.
    fn target(&mut self, args: &Value) -> Result<D::Node, RelayError> {
        if let Some(token) = str_arg(args, "ref") {
            let doc = &self.doc;
            return self.refs.resolve(token, |n| doc.is_attached(n));
        }
        let selector = str_arg(args, "selector").ok_or_else(|| {
            RelayError::InvalidRequest("command needs a ref or selector".into())
        })?;
        let node = self
            .doc
            .query_selector_all(selector)?
            .into_iter()
            .next()
            .ok_or_else(|| RelayError::NotFound(format!("no element matches {}", selector)))?;
        self.refs.allocate(node.clone());
        Ok(node)
    }

    fn element_result(&self, node: &D::Node, extra: Value) -> Value {
        let mut out = json!({
            "ref": self.refs.token_for(node),
            "selector": self.doc.describe(node).selector(),
        });
        if let (Some(map), Value::Object(extra)) = (out.as_object_mut(), extra) {
            map.extend(extra);
        }
        out
    }
}

fn str_arg<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str)
}

fn interaction(verb: Verb, args: &Value) -> Result<Interaction, RelayError> {
    let required = |key: &str| {
        str_arg(args, key)
            .map(str::to_string)
            .ok_or_else(|| RelayError::InvalidRequest(format!("{} needs '{}'", verb.as_str(), key)))
    };
    Ok(match verb {
        Verb::Click => Interaction::Click,
        Verb::Hover => Interaction::Hover,
        Verb::Focus => Interaction::Focus,
        Verb::Type => Interaction::Type {
            text: required("text")?,
            clear: args.get("clear").and_then(Value::as_bool).unwrap_or(false),
        },
        Verb::Scroll => Interaction::Scroll {
            x: args.get("x").and_then(Value::as_f64).unwrap_or(0.0),
            y: args.get("y").and_then(Value::as_f64).unwrap_or(0.0),
        },
        Verb::Select => Interaction::Select {
            value: required("value")?,
        },
        Verb::Press => Interaction::Press {
            key: required("key")?,
        },
        Verb::Query | Verb::Read | Verb::RecordStart | Verb::RecordStop => {
            return Err(RelayError::InvalidRequest(format!(
                "{} is not an interaction",
                verb.as_str()
            )));
        }
    })
}

/// A document observer attached to a relay.
pub struct ObserverHandle<D: Document> {
    session_id: SessionId,
    relay: Arc<Relay>,
    observer: Arc<Mutex<DocumentObserver<D>>>,
    task: JoinHandle<()>,
}

impl<D> ObserverHandle<D>
where
    D: Document + Send + 'static,
    D::Node: Send,
{
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn lock(&self) -> MutexGuard<'_, DocumentObserver<D>> {
        self.observer.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Change the document from outside a command, as page scripts would,
    /// and forward the resulting records.
    pub async fn mutate<R>(&self, f: impl FnOnce(&mut D) -> R) -> Result<R, RelayError> {
        let (out, records) = {
            let mut observer = self.lock();
            let out = f(observer.document_mut());
            (out, observer.drain_records())
        };
        if !records.is_empty() {
            self.relay
                .ingest(&self.session_id, ObserverMessage::Mutations { records })
                .await?;
        }
        Ok(out)
    }

    /// Read the document without changing it.
    pub fn inspect<R>(&self, f: impl FnOnce(&D) -> R) -> R {
        f(self.lock().document())
    }

    /// Forward an arbitrary observer emission (input events, console).
    pub async fn emit(&self, message: ObserverMessage) -> Result<(), RelayError> {
        self.relay.ingest(&self.session_id, message).await
    }

    /// Disconnect from the relay and wait for the observer task to finish.
    pub async fn disconnect(self) {
        self.relay.detach(&self.session_id);
        if let Err(e) = self.task.await {
            warn!(session_id = %self.session_id, error = %e, "Observer task failed");
        }
    }
}

/// Attach `doc` to the relay as the observer of `window_id` and serve
/// commands on a dedicated task.
pub fn spawn_document_observer<D>(
    relay: Arc<Relay>,
    window_id: &str,
    doc: D,
) -> Result<ObserverHandle<D>, RelayError>
where
    D: Document + Send + 'static,
    D::Node: Send,
{
    let mut link = relay.attach_observer(window_id, None)?;
    let session_id = link.session_id.clone();
    let observer = Arc::new(Mutex::new(DocumentObserver::new(doc)));

    let task = {
        let relay = relay.clone();
        let observer = observer.clone();
        let session_id = session_id.clone();
        tokio::spawn(async move {
            while let Some(message) = link.commands.recv().await {
                let RelayMessage::Command(command) = message else {
                    continue;
                };
                let (outcome, records) = {
                    let mut observer = observer.lock().unwrap_or_else(|e| e.into_inner());
                    let outcome = observer.execute(command.verb, &command.args);
                    (outcome, observer.drain_records())
                };
                debug!(
                    session_id = %session_id,
                    request_id = command.request_id,
                    verb = command.verb.as_str(),
                    success = outcome.is_ok(),
                    "Executed command"
                );

                if !records.is_empty()
                    && relay
                        .ingest(&session_id, ObserverMessage::Mutations { records })
                        .await
                        .is_err()
                {
                    break;
                }
                let result = match outcome {
                    Ok(data) => ObserverMessage::Result {
                        request_id: command.request_id,
                        success: true,
                        data: Some(data),
                        error: None,
                    },
                    Err(e) => ObserverMessage::Result {
                        request_id: command.request_id,
                        success: false,
                        data: None,
                        error: Some(e.to_body()),
                    },
                };
                if relay.ingest(&session_id, result).await.is_err() {
                    break;
                }
            }
            relay.detach(&session_id);
            info!(session_id = %session_id, "Document observer stopped");
        })
    };

    Ok(ObserverHandle {
        session_id,
        relay,
        observer,
        task,
    })
}
