use crate::error::ErrorBody;
use serde::{Deserialize, Serialize};

pub type SessionId = String;
pub type WindowId = String;

// ============================================================================
// Caller-facing protocol
// ============================================================================

/// Addressing hint supplied by a caller.
///
/// Precedence: `session` > `window` > caller affinity > the single live session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetHint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<WindowId>,
}

impl TargetHint {
    pub fn session(id: impl Into<String>) -> Self {
        Self {
            session: Some(id.into()),
            window: None,
        }
    }

    pub fn window(id: impl Into<String>) -> Self {
        Self {
            session: None,
            window: Some(id.into()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.session.is_none() && self.window.is_none()
    }
}

/// Verbs a caller can issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verb {
    Query,
    Read,
    Click,
    Hover,
    Focus,
    Type,
    Scroll,
    Select,
    Press,
    RecordStart,
    RecordStop,
}

impl Verb {
    /// Verbs that change page state. Paused sessions reject these.
    pub fn is_mutating(self) -> bool {
        !matches!(
            self,
            Verb::Query | Verb::Read | Verb::RecordStart | Verb::RecordStop
        )
    }

    /// Verbs handled by the relay itself rather than forwarded to the observer.
    pub fn is_relay_local(self) -> bool {
        matches!(self, Verb::RecordStart | Verb::RecordStop)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Query => "query",
            Verb::Read => "read",
            Verb::Click => "click",
            Verb::Hover => "hover",
            Verb::Focus => "focus",
            Verb::Type => "type",
            Verb::Scroll => "scroll",
            Verb::Select => "select",
            Verb::Press => "press",
            Verb::RecordStart => "record_start",
            Verb::RecordStop => "record_stop",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    #[serde(default)]
    pub target: TargetHint,
    pub verb: Verb,
    #[serde(default)]
    pub args: serde_json::Value,
}

impl CommandRequest {
    pub fn new(verb: Verb, args: serde_json::Value) -> Self {
        Self {
            target: TargetHint::default(),
            verb,
            args,
        }
    }

    pub fn with_target(mut self, target: TargetHint) -> Self {
        self.target = target;
        self
    }

    /// The element target named in `args`, preferring `ref` over `selector`.
    pub fn target_label(&self) -> Option<String> {
        ["ref", "selector"]
            .iter()
            .find_map(|key| self.args.get(*key).and_then(|v| v.as_str()))
            .map(str::to_string)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionId>,
}

impl CommandResponse {
    pub fn ok(data: serde_json::Value, session: Option<SessionId>) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            session,
        }
    }

    pub fn err(error: ErrorBody, session: Option<SessionId>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
            session,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    Connected,
    Paused,
    Disconnected,
}

impl SessionState {
    /// Connected or paused: the observer is attached and owns its window.
    pub fn is_live(self) -> bool {
        matches!(self, SessionState::Connected | SessionState::Paused)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub window_id: WindowId,
    pub state: SessionState,
    /// Unix milliseconds.
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

// ============================================================================
// Observer-facing protocol
// ============================================================================

/// Messages sent by an in-page observer to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObserverMessage {
    Hello {
        window_id: WindowId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },
    Result {
        request_id: u64,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorBody>,
    },
    Mutations {
        records: Vec<MutationRecord>,
    },
    Input {
        events: Vec<InputEvent>,
    },
    Console(ConsoleEntry),
}

/// Messages sent by the relay to an in-page observer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayMessage {
    Attached { session_id: SessionId },
    Command(ObserverCommand),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObserverCommand {
    pub request_id: u64,
    pub verb: Verb,
    #[serde(default)]
    pub args: serde_json::Value,
}

// ============================================================================
// Mutation records and batches
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Added,
    Removed,
    AttributeChanged,
}

/// Identity hints about a node, as far as the observer could describe it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Lowercase tag name, or `#text` for text nodes.
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub classes: Vec<String>,
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

impl NodeInfo {
    pub fn element(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..Default::default()
        }
    }

    pub fn text() -> Self {
        Self::element("#text")
    }

    pub fn is_text(&self) -> bool {
        self.tag == "#text"
    }

    /// A compact CSS-like rendering: `tag#id.class1.class2`.
    pub fn selector(&self) -> String {
        let mut out = self.tag.clone();
        if let Some(id) = &self.id {
            out.push('#');
            out.push_str(id);
        }
        for class in &self.classes {
            out.push('.');
            out.push_str(class);
        }
        out
    }
}

/// One raw change record from the DOM observation capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationRecord {
    pub kind: MutationKind,
    pub target: NodeInfo,
    /// Source timestamp (page clock, milliseconds).
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<String>,
    /// Number of element nodes in the added/removed subtree, including the root.
    #[serde(default = "default_subtree_size")]
    pub subtree_size: usize,
}

fn default_subtree_size() -> usize {
    1
}

impl MutationRecord {
    pub fn added(target: NodeInfo, subtree_size: usize, timestamp: u64) -> Self {
        Self {
            kind: MutationKind::Added,
            target,
            timestamp,
            attribute: None,
            old_value: None,
            subtree_size,
        }
    }

    pub fn removed(target: NodeInfo, subtree_size: usize, timestamp: u64) -> Self {
        Self {
            kind: MutationKind::Removed,
            ..Self::added(target, subtree_size, timestamp)
        }
    }

    pub fn attribute(
        target: NodeInfo,
        attribute: impl Into<String>,
        old_value: Option<String>,
        timestamp: u64,
    ) -> Self {
        Self {
            kind: MutationKind::AttributeChanged,
            target,
            timestamp,
            attribute: Some(attribute.into()),
            old_value,
            subtree_size: 1,
        }
    }
}

/// A high-salience mutation picked out of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotableEntry {
    pub kind: MutationKind,
    pub selector: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
    pub subtree_size: usize,
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    /// Score used to rank entries; higher is more notable.
    pub salience: u32,
}

/// Debounced summary of a run of raw mutation records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationBatch {
    /// Relay clock time of the flush.
    pub timestamp: u64,
    /// Source timestamps of the first and last raw records.
    pub first_record_at: u64,
    pub last_record_at: u64,
    pub record_count: usize,
    pub added: usize,
    pub removed: usize,
    pub attributes_changed: usize,
    pub notable: Vec<NotableEntry>,
    /// How many debounce windows were folded into this batch (1 unless merged
    /// under backpressure).
    #[serde(default = "default_windows")]
    pub windows: usize,
}

fn default_windows() -> usize {
    1
}

// ============================================================================
// Raw input events and semantic events
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    Keydown,
    Input,
    Focus,
    Blur,
    Scroll,
    PointerEnter,
    PointerMove,
    PointerDown,
    PointerUp,
    Click,
    Visibility,
}

/// One raw interaction event observed in the page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputEvent {
    pub kind: InputKind,
    /// Element reference (or selector) the event fired on.
    pub target: String,
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visible: Option<bool>,
}

impl InputEvent {
    pub fn new(kind: InputKind, target: impl Into<String>, timestamp: u64) -> Self {
        Self {
            kind,
            target: target.into(),
            timestamp,
            key: None,
            value: None,
            x: None,
            y: None,
            visible: None,
        }
    }

    pub fn key(target: impl Into<String>, key: impl Into<String>, timestamp: u64) -> Self {
        Self {
            key: Some(key.into()),
            ..Self::new(InputKind::Keydown, target, timestamp)
        }
    }

    pub fn scroll(target: impl Into<String>, x: f64, y: f64, timestamp: u64) -> Self {
        Self {
            x: Some(x),
            y: Some(y),
            ..Self::new(InputKind::Scroll, target, timestamp)
        }
    }
}

/// Intent-level event folded from a burst of raw events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SemanticEvent {
    TextEntered {
        target: String,
        value: String,
        keystrokes: usize,
        started_at: u64,
        ended_at: u64,
    },
    Scrolled {
        target: String,
        x: f64,
        y: f64,
        ticks: usize,
        started_at: u64,
        ended_at: u64,
    },
    Clicked {
        target: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        x: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        y: Option<f64>,
        at: u64,
    },
    Hovered {
        target: String,
        moves: usize,
        started_at: u64,
        ended_at: u64,
    },
    VisibilityChanged {
        target: String,
        visible: bool,
        at: u64,
    },
}

impl SemanticEvent {
    pub fn target(&self) -> &str {
        match self {
            SemanticEvent::TextEntered { target, .. }
            | SemanticEvent::Scrolled { target, .. }
            | SemanticEvent::Clicked { target, .. }
            | SemanticEvent::Hovered { target, .. }
            | SemanticEvent::VisibilityChanged { target, .. } => target,
        }
    }
}

// ============================================================================
// Outbound buffer items
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleEntry {
    pub level: String,
    pub text: String,
    #[serde(default)]
    pub timestamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Console,
    Mutations,
    Events,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Console => "console",
            Channel::Mutations => "mutations",
            Channel::Events => "events",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "channel", content = "data", rename_all = "snake_case")]
pub enum OutboundEntry {
    Console(ConsoleEntry),
    Mutations(MutationBatch),
    Events(SemanticEvent),
}

impl OutboundEntry {
    pub fn channel(&self) -> Channel {
        match self {
            OutboundEntry::Console(_) => Channel::Console,
            OutboundEntry::Mutations(_) => Channel::Mutations,
            OutboundEntry::Events(_) => Channel::Events,
        }
    }
}

/// An entry in a session's outbound buffer, stamped with its sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferedItem {
    pub seq: u64,
    /// Relay clock time the entry was buffered (unix milliseconds).
    pub at: u64,
    pub entry: OutboundEntry,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollResponse {
    pub session: SessionId,
    pub items: Vec<BufferedItem>,
    /// Pass this as `since` on the next poll.
    pub next: u64,
    /// Oldest sequence still buffered, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oldest: Option<u64>,
    /// True when entries after `since` were evicted before this poll.
    pub gap: bool,
}
