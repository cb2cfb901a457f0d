//! The DOM capability the in-process observer drives.
//!
//! A [`Document`] answers selector queries synchronously, reads properties,
//! dispatches multi-stage interactions and hands out the raw change records
//! it accumulated since the last call, much like `MutationObserver.takeRecords`.

pub mod memory;

use std::hash::Hash;

use tether_common::RelayError;
use tether_common::protocol::{MutationRecord, NodeInfo};
use thiserror::Error;

pub use memory::{DispatchedEvent, MemoryDocument, NodeId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomError {
    #[error("Invalid selector: {0}")]
    InvalidSelector(String),

    #[error("Node is no longer attached")]
    Detached,

    #[error("No option with value '{0}'")]
    NoSuchOption(String),

    #[error("Cannot {action} <{tag}>")]
    Unsupported { action: &'static str, tag: String },
}

impl From<DomError> for RelayError {
    fn from(e: DomError) -> Self {
        match e {
            DomError::InvalidSelector(s) => RelayError::InvalidRequest(format!("invalid selector: {}", s)),
            DomError::Detached => RelayError::Stale("node is no longer attached".into()),
            DomError::NoSuchOption(v) => RelayError::NotFound(format!("option '{}'", v)),
            e @ DomError::Unsupported { .. } => RelayError::InvalidRequest(e.to_string()),
        }
    }
}

/// A user-level interaction, dispatched as the sequence of DOM events a real
/// user would produce.
#[derive(Debug, Clone, PartialEq)]
pub enum Interaction {
    Click,
    Hover,
    Focus,
    Type { text: String, clear: bool },
    Scroll { x: f64, y: f64 },
    Select { value: String },
    Press { key: String },
}

impl Interaction {
    pub fn name(&self) -> &'static str {
        match self {
            Interaction::Click => "click",
            Interaction::Hover => "hover",
            Interaction::Focus => "focus",
            Interaction::Type { .. } => "type",
            Interaction::Scroll { .. } => "scroll",
            Interaction::Select { .. } => "select",
            Interaction::Press { .. } => "press",
        }
    }

    /// DOM event names in dispatch order.
    pub fn stages(&self) -> Vec<&'static str> {
        match self {
            Interaction::Click => vec![
                "pointerover",
                "pointerenter",
                "pointermove",
                "pointerdown",
                "mousedown",
                "focus",
                "pointerup",
                "mouseup",
                "click",
            ],
            Interaction::Hover => vec!["pointerover", "pointerenter", "pointermove", "mouseover"],
            Interaction::Focus => vec!["focus", "focusin"],
            Interaction::Type { text, .. } => {
                let mut stages = vec!["focus"];
                for _ in text.chars() {
                    stages.extend(["keydown", "beforeinput", "input", "keyup"]);
                }
                stages.push("change");
                stages
            }
            Interaction::Scroll { .. } => vec!["scroll"],
            Interaction::Select { .. } => vec!["focus", "input", "change"],
            Interaction::Press { .. } => vec!["keydown", "keyup"],
        }
    }
}

pub trait Document {
    type Node: Clone + Eq + Hash;

    /// Attached nodes matching `selector`, in document order.
    fn query_selector_all(&self, selector: &str) -> Result<Vec<Self::Node>, DomError>;

    fn is_attached(&self, node: &Self::Node) -> bool;

    fn describe(&self, node: &Self::Node) -> NodeInfo;

    fn text_content(&self, node: &Self::Node) -> String;

    /// Attribute or property value. `text` and `value` are always readable.
    fn read_property(&self, node: &Self::Node, name: &str) -> Option<String>;

    fn dispatch(&mut self, node: &Self::Node, interaction: &Interaction) -> Result<(), DomError>;

    /// Change records accumulated since the previous call.
    fn take_records(&mut self) -> Vec<MutationRecord>;
}
