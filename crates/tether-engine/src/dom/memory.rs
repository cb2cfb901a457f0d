//! In-memory document: an arena DOM with enough selector support to drive
//! the observer without a browser.
//!
//! Selectors: `*`, tag, `#id`, `.class`, `[attr]`, `[attr=value]`, compounds
//! of those, descendant chains (`form input.primary`) and comma groups.

use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

use regex::Regex;
use tether_common::protocol::{MutationRecord, NodeInfo};

use super::{Document, DomError, Interaction};

pub type NodeId = usize;

static COMPOUND_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"^(\*|[a-zA-Z][a-zA-Z0-9-]*)?((?:#[\w-]+|\.[\w-]+|\[[\w-]+(?:=(?:"[^"]*"|'[^']*'|[^\]"']*))?\])*)$"#,
    )
    .unwrap()
});

static PART_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"#([\w-]+)|\.([\w-]+)|\[([\w-]+)(?:=("[^"]*"|'[^']*'|[^\]"']*))?\]"#).unwrap()
});

/// One event fired by [`MemoryDocument::dispatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchedEvent {
    pub node: NodeId,
    pub event: &'static str,
}

#[derive(Debug, Clone)]
enum NodeData {
    Element {
        tag: String,
        attrs: BTreeMap<String, String>,
    },
    Text(String),
}

#[derive(Debug, Clone)]
struct NodeEntry {
    data: NodeData,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

type ClickHandler = Box<dyn FnMut(&mut MemoryDocument) + Send>;

pub struct MemoryDocument {
    nodes: Vec<NodeEntry>,
    root: NodeId,
    body: NodeId,
    records: Vec<MutationRecord>,
    dispatched: Vec<DispatchedEvent>,
    scroll: HashMap<NodeId, (f64, f64)>,
    focused: Option<NodeId>,
    click_handlers: HashMap<NodeId, ClickHandler>,
    clock: u64,
}

impl Default for MemoryDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDocument {
    /// An empty `<html><body></body></html>` document.
    pub fn new() -> Self {
        let mut doc = Self {
            nodes: Vec::new(),
            root: 0,
            body: 0,
            records: Vec::new(),
            dispatched: Vec::new(),
            scroll: HashMap::new(),
            focused: None,
            click_handlers: HashMap::new(),
            clock: 0,
        };
        doc.root = doc.element("html", &[]);
        doc.body = doc.element("body", &[]);
        doc.link(doc.root, doc.body);
        doc
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn body(&self) -> NodeId {
        self.body
    }

    /// Page clock used to stamp change records.
    pub fn set_time(&mut self, millis: u64) {
        self.clock = millis;
    }

    /// Create a detached element. Nothing is recorded until it is appended.
    pub fn element(&mut self, tag: &str, attrs: &[(&str, &str)]) -> NodeId {
        self.nodes.push(NodeEntry {
            data: NodeData::Element {
                tag: tag.to_ascii_lowercase(),
                attrs: attrs
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            },
            parent: None,
            children: Vec::new(),
        });
        self.nodes.len() - 1
    }

    /// Append `child` (and its subtree) under `parent`.
    pub fn append(&mut self, parent: NodeId, child: NodeId) {
        self.detach_silently(child);
        self.link(parent, child);
        if self.is_attached(&child) {
            let info = self.describe(&child);
            let size = self.subtree_size(child);
            self.records
                .push(MutationRecord::added(info, size, self.clock));
        }
    }

    /// Create an element and append it in one step.
    pub fn add_element(&mut self, parent: NodeId, tag: &str, attrs: &[(&str, &str)]) -> NodeId {
        let id = self.element(tag, attrs);
        self.append(parent, id);
        id
    }

    pub fn add_text(&mut self, parent: NodeId, text: &str) -> NodeId {
        self.nodes.push(NodeEntry {
            data: NodeData::Text(text.to_string()),
            parent: None,
            children: Vec::new(),
        });
        let id = self.nodes.len() - 1;
        self.append(parent, id);
        id
    }

    /// Detach `node` from the tree. Its id stays valid but never re-attaches
    /// by itself.
    pub fn remove(&mut self, node: NodeId) {
        if !self.is_attached(&node) || node == self.root {
            self.detach_silently(node);
            return;
        }
        let info = self.describe(&node);
        let size = self.subtree_size(node);
        self.detach_silently(node);
        if self.focused.is_some_and(|f| !self.is_attached(&f)) {
            self.focused = None;
        }
        self.records
            .push(MutationRecord::removed(info, size, self.clock));
    }

    pub fn set_attribute(&mut self, node: NodeId, name: &str, value: &str) {
        let Some(attrs) = self.attr_mut(node) else {
            return;
        };
        let old = attrs.insert(name.to_string(), value.to_string());
        if old.as_deref() != Some(value) {
            self.record_attribute(node, name, old);
        }
    }

    pub fn remove_attribute(&mut self, node: NodeId, name: &str) {
        if let Some(old) = self.attr_mut(node).and_then(|attrs| attrs.remove(name)) {
            self.record_attribute(node, name, Some(old));
        }
    }

    /// Run `handler` after every click on `node`, e.g. to simulate a page
    /// re-rendering in response.
    pub fn on_click<F>(&mut self, node: NodeId, handler: F)
    where
        F: FnMut(&mut MemoryDocument) + Send + 'static,
    {
        self.click_handlers.insert(node, Box::new(handler));
    }

    /// Every DOM event fired so far, in order.
    pub fn dispatched(&self) -> &[DispatchedEvent] {
        &self.dispatched
    }

    pub fn focused(&self) -> Option<NodeId> {
        self.focused
    }

    pub fn scroll_position(&self, node: NodeId) -> Option<(f64, f64)> {
        self.scroll.get(&node).copied()
    }

    pub fn attribute(&self, node: NodeId, name: &str) -> Option<&str> {
        match &self.nodes.get(node)?.data {
            NodeData::Element { attrs, .. } => attrs.get(name).map(String::as_str),
            NodeData::Text(_) => None,
        }
    }

    fn tag(&self, node: NodeId) -> Option<&str> {
        match &self.nodes.get(node)?.data {
            NodeData::Element { tag, .. } => Some(tag),
            NodeData::Text(_) => None,
        }
    }

    fn attr_mut(&mut self, node: NodeId) -> Option<&mut BTreeMap<String, String>> {
        match &mut self.nodes.get_mut(node)?.data {
            NodeData::Element { attrs, .. } => Some(attrs),
            NodeData::Text(_) => None,
        }
    }

    fn record_attribute(&mut self, node: NodeId, name: &str, old: Option<String>) {
        if self.is_attached(&node) {
            let info = self.describe(&node);
            self.records
                .push(MutationRecord::attribute(info, name, old, self.clock));
        }
    }

    fn link(&mut self, parent: NodeId, child: NodeId) {
        self.nodes[child].parent = Some(parent);
        self.nodes[parent].children.push(child);
    }

    fn detach_silently(&mut self, node: NodeId) {
        if let Some(parent) = self.nodes.get_mut(node).and_then(|n| n.parent.take()) {
            self.nodes[parent].children.retain(|c| *c != node);
        }
    }

    fn subtree_size(&self, node: NodeId) -> usize {
        let own = usize::from(matches!(self.nodes[node].data, NodeData::Element { .. }));
        own + self.nodes[node]
            .children
            .iter()
            .map(|c| self.subtree_size(*c))
            .sum::<usize>()
    }

    fn preorder(&self, node: NodeId, out: &mut Vec<NodeId>) {
        out.push(node);
        for child in &self.nodes[node].children {
            self.preorder(*child, out);
        }
    }

    fn matches_compound(&self, node: NodeId, compound: &Compound) -> bool {
        let NodeData::Element { tag, attrs } = &self.nodes[node].data else {
            return false;
        };
        if compound.tag.as_ref().is_some_and(|t| t != tag) {
            return false;
        }
        if compound
            .id
            .as_ref()
            .is_some_and(|id| attrs.get("id") != Some(id))
        {
            return false;
        }
        let classes: Vec<&str> = attrs
            .get("class")
            .map(|c| c.split_whitespace().collect())
            .unwrap_or_default();
        if !compound.classes.iter().all(|c| classes.contains(&c.as_str())) {
            return false;
        }
        compound.attrs.iter().all(|(name, value)| match value {
            Some(v) => attrs.get(name) == Some(v),
            None => attrs.contains_key(name),
        })
    }

    /// Right-to-left descendant matching. Greedy ancestor search is exact
    /// when the only combinator is descendant.
    fn matches_chain(&self, node: NodeId, chain: &[Compound]) -> bool {
        let Some((last, rest)) = chain.split_last() else {
            return false;
        };
        if !self.matches_compound(node, last) {
            return false;
        }
        let mut remaining = rest;
        let mut cursor = self.nodes[node].parent;
        while let Some((want, before)) = remaining.split_last() {
            let Some(ancestor) = cursor else {
                return false;
            };
            if self.matches_compound(ancestor, want) {
                remaining = before;
            }
            cursor = self.nodes[ancestor].parent;
        }
        true
    }

    fn require_tag(&self, node: NodeId, action: &'static str, allowed: &[&str]) -> Result<(), DomError> {
        let tag = self.tag(node).unwrap_or("#text");
        let editable = self.attribute(node, "contenteditable").is_some();
        if allowed.contains(&tag) || (allowed.contains(&"input") && editable) {
            Ok(())
        } else {
            Err(DomError::Unsupported {
                action,
                tag: tag.to_string(),
            })
        }
    }

    fn apply(&mut self, node: NodeId, interaction: &Interaction) -> Result<(), DomError> {
        match interaction {
            Interaction::Click => {
                self.focused = Some(node);
                let toggles = self.tag(node) == Some("input")
                    && matches!(self.attribute(node, "type"), Some("checkbox" | "radio"));
                if toggles {
                    if self.attribute(node, "checked").is_some() {
                        self.remove_attribute(node, "checked");
                    } else {
                        self.set_attribute(node, "checked", "");
                    }
                }
                if let Some(mut handler) = self.click_handlers.remove(&node) {
                    handler(self);
                    self.click_handlers.entry(node).or_insert(handler);
                }
            }
            Interaction::Hover => {}
            Interaction::Focus => self.focused = Some(node),
            Interaction::Type { text, clear } => {
                self.require_tag(node, "type into", &["input", "textarea"])?;
                self.focused = Some(node);
                let mut value = if *clear {
                    String::new()
                } else {
                    self.attribute(node, "value").unwrap_or_default().to_string()
                };
                value.push_str(text);
                self.set_attribute(node, "value", &value);
            }
            Interaction::Scroll { x, y } => {
                self.scroll.insert(node, (*x, *y));
            }
            Interaction::Select { value } => {
                self.require_tag(node, "select an option in", &["select"])?;
                let known = self.nodes[node].children.iter().any(|c| {
                    self.tag(*c) == Some("option")
                        && (self.attribute(*c, "value") == Some(value.as_str())
                            || self.text_content(c).trim() == value)
                });
                if !known {
                    return Err(DomError::NoSuchOption(value.clone()));
                }
                self.focused = Some(node);
                self.set_attribute(node, "value", value);
            }
            Interaction::Press { .. } => {}
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
struct Compound {
    tag: Option<String>,
    id: Option<String>,
    classes: Vec<String>,
    attrs: Vec<(String, Option<String>)>,
}

fn parse_compound(input: &str, selector: &str) -> Result<Compound, DomError> {
    let invalid = || DomError::InvalidSelector(selector.to_string());
    let caps = COMPOUND_RE.captures(input).ok_or_else(invalid)?;

    let mut compound = Compound {
        tag: caps
            .get(1)
            .map(|m| m.as_str())
            .filter(|t| *t != "*")
            .map(str::to_ascii_lowercase),
        ..Default::default()
    };
    let parts = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
    if caps.get(1).is_none() && parts.is_empty() {
        return Err(invalid());
    }
    for part in PART_RE.captures_iter(parts) {
        if let Some(id) = part.get(1) {
            compound.id = Some(id.as_str().to_string());
        } else if let Some(class) = part.get(2) {
            compound.classes.push(class.as_str().to_string());
        } else if let Some(name) = part.get(3) {
            let value = part
                .get(4)
                .map(|v| v.as_str().trim_matches(|c| c == '"' || c == '\'').to_string());
            compound.attrs.push((name.as_str().to_string(), value));
        }
    }
    Ok(compound)
}

fn parse_selector(selector: &str) -> Result<Vec<Vec<Compound>>, DomError> {
    let groups: Vec<Vec<Compound>> = selector
        .split(',')
        .map(|group| {
            group
                .split_whitespace()
                .map(|part| parse_compound(part, selector))
                .collect::<Result<Vec<_>, _>>()
        })
        .collect::<Result<_, _>>()?;
    if groups.iter().any(Vec::is_empty) {
        return Err(DomError::InvalidSelector(selector.to_string()));
    }
    Ok(groups)
}

impl Document for MemoryDocument {
    type Node = NodeId;

    fn query_selector_all(&self, selector: &str) -> Result<Vec<NodeId>, DomError> {
        let groups = parse_selector(selector)?;
        let mut all = Vec::new();
        self.preorder(self.root, &mut all);
        Ok(all
            .into_iter()
            .filter(|node| groups.iter().any(|chain| self.matches_chain(*node, chain)))
            .collect())
    }

    fn is_attached(&self, node: &NodeId) -> bool {
        let mut cursor = Some(*node);
        while let Some(n) = cursor {
            if n == self.root {
                return true;
            }
            cursor = self.nodes.get(n).and_then(|e| e.parent);
        }
        false
    }

    fn describe(&self, node: &NodeId) -> NodeInfo {
        match self.nodes.get(*node).map(|n| &n.data) {
            Some(NodeData::Element { tag, attrs }) => NodeInfo {
                tag: tag.clone(),
                id: attrs.get("id").cloned(),
                classes: attrs
                    .get("class")
                    .map(|c| c.split_whitespace().map(str::to_string).collect())
                    .unwrap_or_default(),
                reference: None,
            },
            _ => NodeInfo::text(),
        }
    }

    fn text_content(&self, node: &NodeId) -> String {
        match self.nodes.get(*node).map(|n| &n.data) {
            Some(NodeData::Text(text)) => text.clone(),
            Some(NodeData::Element { .. }) => self.nodes[*node]
                .children
                .iter()
                .map(|c| self.text_content(c))
                .collect(),
            None => String::new(),
        }
    }

    fn read_property(&self, node: &NodeId, name: &str) -> Option<String> {
        match name {
            "text" | "textContent" => Some(self.text_content(node)),
            "value" => Some(self.attribute(*node, "value").unwrap_or_default().to_string()),
            "tag" | "tagName" => self.tag(*node).map(str::to_string),
            "checked" => Some(self.attribute(*node, "checked").is_some().to_string()),
            other => self.attribute(*node, other).map(str::to_string),
        }
    }

    fn dispatch(&mut self, node: &NodeId, interaction: &Interaction) -> Result<(), DomError> {
        if !self.is_attached(node) {
            return Err(DomError::Detached);
        }
        if matches!(self.nodes[*node].data, NodeData::Text(_)) {
            return Err(DomError::Unsupported {
                action: interaction.name(),
                tag: "#text".into(),
            });
        }
        self.apply(*node, interaction)?;
        self.dispatched.extend(
            interaction
                .stages()
                .into_iter()
                .map(|event| DispatchedEvent { node: *node, event }),
        );
        Ok(())
    }

    fn take_records(&mut self) -> Vec<MutationRecord> {
        std::mem::take(&mut self.records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_common::protocol::MutationKind;

    fn login_form() -> (MemoryDocument, NodeId, NodeId, NodeId) {
        let mut doc = MemoryDocument::new();
        let form = doc.add_element(doc.body(), "form", &[("id", "login")]);
        let user = doc.add_element(form, "input", &[("name", "user"), ("class", "field")]);
        let submit = doc.add_element(form, "button", &[("class", "btn primary"), ("type", "submit")]);
        doc.add_text(submit, "Sign in");
        doc.take_records();
        (doc, form, user, submit)
    }

    #[test]
    fn test_compound_descendant_and_group_selectors() {
        let (doc, form, user, submit) = login_form();
        assert_eq!(doc.query_selector_all("#login").unwrap(), vec![form]);
        assert_eq!(doc.query_selector_all("button.btn.primary").unwrap(), vec![submit]);
        assert_eq!(doc.query_selector_all("form input").unwrap(), vec![user]);
        assert_eq!(doc.query_selector_all("body [name=user]").unwrap(), vec![user]);
        assert_eq!(
            doc.query_selector_all("button, input").unwrap(),
            vec![user, submit]
        );
        assert!(doc.query_selector_all("form span").unwrap().is_empty());
        assert!(matches!(
            doc.query_selector_all("div >> p"),
            Err(DomError::InvalidSelector(_))
        ));
    }

    #[test]
    fn test_click_dispatches_realistic_stages_in_order() {
        let (mut doc, _, _, submit) = login_form();
        doc.dispatch(&submit, &Interaction::Click).unwrap();
        let events: Vec<&str> = doc.dispatched().iter().map(|e| e.event).collect();
        assert_eq!(
            events,
            vec![
                "pointerover", "pointerenter", "pointermove", "pointerdown", "mousedown",
                "focus", "pointerup", "mouseup", "click"
            ]
        );
        assert_eq!(doc.focused(), Some(submit));
    }

    #[test]
    fn test_remove_records_subtree_and_detaches() {
        let (mut doc, form, user, _) = login_form();
        doc.set_time(42);
        doc.remove(form);

        let records = doc.take_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, MutationKind::Removed);
        assert_eq!(records[0].subtree_size, 3);
        assert_eq!(records[0].timestamp, 42);
        assert!(!doc.is_attached(&user));
        assert_eq!(
            doc.dispatch(&user, &Interaction::Focus),
            Err(DomError::Detached)
        );
    }

    #[test]
    fn test_type_appends_or_clears_value() {
        let (mut doc, _, user, submit) = login_form();
        let typing = |text: &str, clear| Interaction::Type {
            text: text.into(),
            clear,
        };
        doc.dispatch(&user, &typing("bo", false)).unwrap();
        doc.dispatch(&user, &typing("b", false)).unwrap();
        assert_eq!(doc.read_property(&user, "value").as_deref(), Some("bob"));
        doc.dispatch(&user, &typing("al", true)).unwrap();
        assert_eq!(doc.read_property(&user, "value").as_deref(), Some("al"));

        let records = doc.take_records();
        assert_eq!(records.len(), 3);
        assert_eq!(records[1].old_value.as_deref(), Some("bo"));

        assert!(matches!(
            doc.dispatch(&submit, &typing("x", false)),
            Err(DomError::Unsupported { .. })
        ));
    }

    #[test]
    fn test_select_requires_known_option() {
        let mut doc = MemoryDocument::new();
        let select = doc.add_element(doc.body(), "select", &[("id", "size")]);
        let option = doc.add_element(select, "option", &[("value", "m")]);
        doc.add_text(option, "Medium");

        doc.dispatch(&select, &Interaction::Select { value: "Medium".into() })
            .unwrap();
        assert_eq!(doc.attribute(select, "value"), Some("Medium"));
        assert_eq!(
            doc.dispatch(&select, &Interaction::Select { value: "xl".into() }),
            Err(DomError::NoSuchOption("xl".into()))
        );
    }

    #[test]
    fn test_click_handler_runs_after_click() {
        let (mut doc, form, _, submit) = login_form();
        doc.on_click(submit, move |d| d.remove(form));
        doc.dispatch(&submit, &Interaction::Click).unwrap();
        assert!(!doc.is_attached(&form));
    }
}
