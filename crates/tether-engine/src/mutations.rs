//! Debounced mutation batching.
//!
//! Raw records accumulate until `debounce_ms` passes without a new one; the
//! run is then compacted into a single [`MutationBatch`]. The aggregator
//! never reads a clock: callers pass `now` in, so a fixed trace with fixed
//! timings always yields the same batches.

use std::collections::{HashSet, VecDeque};

use tether_common::protocol::{MutationBatch, MutationKind, MutationRecord, NodeInfo, NotableEntry};
use tracing::debug;

use crate::config::MutationsConfig;

/// Attributes whose changes usually mean something to a caller.
const SALIENT_ATTRIBUTES: &[&str] = &[
    "class", "disabled", "hidden", "checked", "selected", "value", "open", "href", "src",
];

#[derive(Debug)]
pub struct MutationAggregator {
    config: MutationsConfig,
    buffered: Vec<MutationRecord>,
    last_arrival: Option<u64>,
    pending: VecDeque<MutationBatch>,
}

impl MutationAggregator {
    pub fn new(config: MutationsConfig) -> Self {
        Self {
            config,
            buffered: Vec::new(),
            last_arrival: None,
            pending: VecDeque::new(),
        }
    }

    /// Buffer a record that arrived at `now`. Every record restarts the
    /// debounce window.
    pub fn push(&mut self, record: MutationRecord, now: u64) {
        self.buffered.push(record);
        self.last_arrival = Some(now);
    }

    /// When the current debounce window closes, if anything is buffered.
    pub fn deadline(&self) -> Option<u64> {
        if self.buffered.is_empty() {
            return None;
        }
        self.last_arrival
            .map(|t| t.saturating_add(self.config.debounce_ms))
    }

    /// Close the debounce window if it has elapsed. Returns true when a batch
    /// was produced.
    pub fn poll(&mut self, now: u64) -> bool {
        match self.deadline() {
            Some(deadline) if now >= deadline => {
                self.flush(now);
                true
            }
            _ => false,
        }
    }

    /// Compact whatever is buffered regardless of the timer (used on disconnect).
    pub fn flush(&mut self, now: u64) {
        if self.buffered.is_empty() {
            return;
        }
        let records = std::mem::take(&mut self.buffered);
        self.last_arrival = None;
        let batch = compact(&records, now, self.config.notable_limit);
        self.enqueue(batch);
    }

    fn enqueue(&mut self, batch: MutationBatch) {
        let limit = self.config.max_pending_batches.max(1);
        if self.pending.len() >= limit
            && let Some(last) = self.pending.pop_back()
        {
            debug!(
                pending = self.pending.len() + 1,
                "Downstream behind, merging mutation batches"
            );
            self.pending
                .push_back(merge(last, batch, self.config.notable_limit));
        } else {
            self.pending.push_back(batch);
        }
    }

    /// Next batch ready for delivery, oldest first.
    pub fn pop_ready(&mut self) -> Option<MutationBatch> {
        self.pending.pop_front()
    }

    pub fn has_ready(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn buffered_len(&self) -> usize {
        self.buffered.len()
    }
}

/// Salience of a single raw record.
///
/// Element add/remove: 2, +4 with an id, +2 with classes, +1 per extra
/// element in the subtree (capped at 16). Text nodes score 0. Attribute
/// changes: 6 for `aria-*` and [`SALIENT_ATTRIBUTES`], 1 otherwise, +4 when
/// the element has an id.
pub fn salience(record: &MutationRecord) -> u32 {
    let target = &record.target;
    let id_bonus = if target.id.is_some() { 4 } else { 0 };
    match record.kind {
        MutationKind::Added | MutationKind::Removed => {
            if target.is_text() {
                return 0;
            }
            let class_bonus = if target.classes.is_empty() { 0 } else { 2 };
            let subtree_bonus = record.subtree_size.saturating_sub(1).min(16) as u32;
            2 + id_bonus + class_bonus + subtree_bonus
        }
        MutationKind::AttributeChanged => {
            let attribute = record.attribute.as_deref().unwrap_or_default();
            let base = if attribute.starts_with("aria-") || SALIENT_ATTRIBUTES.contains(&attribute)
            {
                6
            } else {
                1
            };
            base + id_bonus
        }
    }
}

fn entry_for(record: &MutationRecord) -> NotableEntry {
    NotableEntry {
        kind: record.kind,
        selector: describe(&record.target),
        attribute: record.attribute.clone(),
        subtree_size: record.subtree_size,
        reference: record.target.reference.clone(),
        salience: salience(record),
    }
}

fn describe(node: &NodeInfo) -> String {
    node.selector()
}

/// Compact a run of raw records into one batch.
pub fn compact(records: &[MutationRecord], now: u64, notable_limit: usize) -> MutationBatch {
    let mut added = 0;
    let mut removed = 0;
    let mut attributes_changed = 0;
    for record in records {
        match record.kind {
            MutationKind::Added => added += 1,
            MutationKind::Removed => removed += 1,
            MutationKind::AttributeChanged => attributes_changed += 1,
        }
    }

    let first_record_at = records.iter().map(|r| r.timestamp).min().unwrap_or_default();
    let last_record_at = records.iter().map(|r| r.timestamp).max().unwrap_or_default();

    MutationBatch {
        timestamp: now,
        first_record_at,
        last_record_at,
        record_count: records.len(),
        added,
        removed,
        attributes_changed,
        notable: select_notable(records.iter().map(entry_for).collect(), notable_limit),
        windows: 1,
    }
}

/// Pick at most `limit` entries.
///
/// Duplicates of (kind, selector, attribute) keep their first occurrence.
/// Ranking is salience descending, then selector ascending, then original
/// position; the winners are returned in original order.
pub fn select_notable(candidates: Vec<NotableEntry>, limit: usize) -> Vec<NotableEntry> {
    let mut seen = HashSet::new();
    let mut ranked: Vec<(usize, NotableEntry)> = candidates
        .into_iter()
        .filter(|e| seen.insert((e.kind, e.selector.clone(), e.attribute.clone())))
        .enumerate()
        .collect();

    ranked.sort_by(|(ia, a), (ib, b)| {
        b.salience
            .cmp(&a.salience)
            .then_with(|| a.selector.cmp(&b.selector))
            .then_with(|| ia.cmp(ib))
    });
    ranked.truncate(limit);
    ranked.sort_by_key(|(i, _)| *i);
    ranked.into_iter().map(|(_, e)| e).collect()
}

/// Fold two consecutive batches into one, `earlier` first.
pub fn merge(earlier: MutationBatch, later: MutationBatch, notable_limit: usize) -> MutationBatch {
    let mut candidates = earlier.notable;
    candidates.extend(later.notable);
    MutationBatch {
        timestamp: later.timestamp,
        first_record_at: earlier.first_record_at.min(later.first_record_at),
        last_record_at: earlier.last_record_at.max(later.last_record_at),
        record_count: earlier.record_count + later.record_count,
        added: earlier.added + later.added,
        removed: earlier.removed + later.removed,
        attributes_changed: earlier.attributes_changed + later.attributes_changed,
        notable: select_notable(candidates, notable_limit),
        windows: earlier.windows + later.windows,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> MutationsConfig {
        MutationsConfig {
            debounce_ms: 50,
            notable_limit: 3,
            max_pending_batches: 2,
        }
    }

    fn el(tag: &str, id: Option<&str>, classes: &[&str]) -> NodeInfo {
        NodeInfo {
            tag: tag.into(),
            id: id.map(String::from),
            classes: classes.iter().map(|c| c.to_string()).collect(),
            reference: None,
        }
    }

    fn trace() -> Vec<(u64, MutationRecord)> {
        vec![
            (0, MutationRecord::added(NodeInfo::text(), 1, 100)),
            (10, MutationRecord::added(el("div", None, &[]), 1, 110)),
            (
                20,
                MutationRecord::added(el("ul", Some("results"), &["list"]), 12, 120),
            ),
            (
                30,
                MutationRecord::attribute(el("button", None, &["btn"]), "disabled", None, 130),
            ),
            (
                35,
                MutationRecord::attribute(el("div", None, &[]), "style", None, 135),
            ),
            (40, MutationRecord::removed(el("span", None, &["spinner"]), 1, 140)),
            (200, MutationRecord::added(el("p", None, &[]), 1, 300)),
        ]
    }

    fn run(trace: &[(u64, MutationRecord)], until: u64) -> Vec<MutationBatch> {
        let mut agg = MutationAggregator::new(MutationsConfig {
            max_pending_batches: 16,
            ..config()
        });
        let mut out = Vec::new();
        let mut events = trace.iter().peekable();
        for now in 0..=until {
            while let Some((t, record)) = events.peek() {
                if *t != now {
                    break;
                }
                agg.push(record.clone(), now);
                events.next();
            }
            agg.poll(now);
            while let Some(batch) = agg.pop_ready() {
                out.push(batch);
            }
        }
        out
    }

    #[test]
    fn test_debounce_splits_bursts() {
        let batches = run(&trace(), 400);
        assert_eq!(batches.len(), 2);

        let first = &batches[0];
        assert_eq!(first.timestamp, 90); // last record at 40 + 50ms window
        assert_eq!(first.record_count, 6);
        assert_eq!(first.added, 3);
        assert_eq!(first.removed, 1);
        assert_eq!(first.attributes_changed, 2);
        assert_eq!(first.first_record_at, 100);
        assert_eq!(first.last_record_at, 140);

        assert_eq!(batches[1].record_count, 1);
        assert!(batches[0].timestamp < batches[1].timestamp);
    }

    #[test]
    fn test_notable_prefers_structure_and_state_over_churn() {
        let batches = run(&trace(), 400);
        let selectors: Vec<&str> = batches[0]
            .notable
            .iter()
            .map(|e| e.selector.as_str())
            .collect();
        // ul#results.list (2+4+2+11=19), button.btn disabled (6), span.spinner (4);
        // emitted in record order.
        assert_eq!(selectors, vec!["ul#results.list", "button.btn", "span.spinner"]);
    }

    #[test]
    fn test_batches_are_deterministic_for_fixed_trace() {
        assert_eq!(run(&trace(), 400), run(&trace(), 400));
    }

    #[test]
    fn test_window_restarts_on_every_record() {
        let mut agg = MutationAggregator::new(config());
        agg.push(MutationRecord::added(el("a", None, &[]), 1, 0), 0);
        agg.push(MutationRecord::added(el("b", None, &[]), 1, 0), 40);
        assert!(!agg.poll(60));
        assert_eq!(agg.deadline(), Some(90));
        assert!(agg.poll(90));
        assert_eq!(agg.pop_ready().map(|b| b.record_count), Some(2));
    }

    #[test]
    fn test_tie_break_is_selector_then_order() {
        let records = vec![
            MutationRecord::added(el("div", None, &["b"]), 1, 0),
            MutationRecord::added(el("div", None, &["a"]), 1, 0),
            MutationRecord::added(el("div", None, &["c"]), 1, 0),
        ];
        let batch = compact(&records, 0, 2);
        let selectors: Vec<&str> = batch.notable.iter().map(|e| e.selector.as_str()).collect();
        assert_eq!(selectors, vec!["div.b", "div.a"]);
    }

    #[test]
    fn test_duplicate_attribute_churn_is_deduplicated() {
        let records: Vec<MutationRecord> = (0..20)
            .map(|i| MutationRecord::attribute(el("div", Some("clock"), &[]), "class", None, i))
            .collect();
        let batch = compact(&records, 0, 10);
        assert_eq!(batch.attributes_changed, 20);
        assert_eq!(batch.notable.len(), 1);
    }

    #[test]
    fn test_notable_list_is_capped() {
        let records: Vec<MutationRecord> = (0..100)
            .map(|i| MutationRecord::added(el("li", Some(&format!("item-{}", i)), &[]), 1, i))
            .collect();
        let batch = compact(&records, 0, 10);
        assert_eq!(batch.record_count, 100);
        assert_eq!(batch.notable.len(), 10);
    }

    #[test]
    fn test_backpressure_merges_instead_of_growing() {
        let mut agg = MutationAggregator::new(config());
        for i in 0..5u64 {
            let now = i * 100;
            agg.push(MutationRecord::added(el("div", None, &[]), 1, now), now);
            agg.flush(now);
        }
        let a = agg.pop_ready().unwrap();
        let b = agg.pop_ready().unwrap();
        assert!(agg.pop_ready().is_none());
        assert_eq!(a.windows, 1);
        assert_eq!(b.windows, 4);
        assert_eq!(a.record_count + b.record_count, 5);
        assert!(a.timestamp < b.timestamp);
    }
}
