use std::collections::HashMap;
use std::hash::Hash;

use tether_common::RelayError;
use tracing::debug;

pub const REF_PREFIX: char = 'e';

/// Per-session reference table.
///
/// Tokens (`e1`, `e2`, ...) come from a counter and are never reissued, so a
/// token that outlived its node resolves to `Stale`, never to a later node.
/// Attachment is checked at resolution time; the table does not keep nodes
/// alive.
#[derive(Debug)]
pub struct RefTable<N> {
    /// Next token number to hand out. Token numbers start at 1.
    next: u64,
    live: HashMap<u64, N>,
    by_node: HashMap<N, u64>,
}

impl<N: Clone + Eq + Hash> Default for RefTable<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<N: Clone + Eq + Hash> RefTable<N> {
    pub fn new() -> Self {
        Self {
            next: 1,
            live: HashMap::new(),
            by_node: HashMap::new(),
        }
    }

    /// Return the token for `node`, minting one if the node has none.
    pub fn allocate(&mut self, node: N) -> String {
        if let Some(n) = self.by_node.get(&node) {
            return format_token(*n);
        }
        let n = self.next;
        self.next += 1;
        self.live.insert(n, node.clone());
        self.by_node.insert(node, n);
        format_token(n)
    }

    /// Existing token for `node`, without allocating.
    pub fn token_for(&self, node: &N) -> Option<String> {
        self.by_node.get(node).map(|n| format_token(*n))
    }

    /// Resolve a token to its node.
    ///
    /// Tokens that were never issued are `NotFound`; tokens whose node left
    /// the document (now or earlier) are `Stale`.
    pub fn resolve<F>(&mut self, token: &str, is_attached: F) -> Result<N, RelayError>
    where
        F: Fn(&N) -> bool,
    {
        let n = parse_token(token)
            .filter(|n| *n < self.next)
            .ok_or_else(|| RelayError::NotFound(format!("unknown reference {}", token)))?;

        let node = self
            .live
            .get(&n)
            .cloned()
            .ok_or_else(|| RelayError::Stale(token.to_string()))?;

        if is_attached(&node) {
            Ok(node)
        } else {
            self.release(n);
            Err(RelayError::Stale(token.to_string()))
        }
    }

    /// Drop every entry whose node is no longer attached. Returns how many
    /// entries were released.
    pub fn release_detached<F>(&mut self, is_attached: F) -> usize
    where
        F: Fn(&N) -> bool,
    {
        let detached: Vec<u64> = self
            .live
            .iter()
            .filter(|(_, node)| !is_attached(node))
            .map(|(n, _)| *n)
            .collect();
        for n in &detached {
            self.release(*n);
        }
        if !detached.is_empty() {
            debug!(released = detached.len(), "Released detached references");
        }
        detached.len()
    }

    fn release(&mut self, n: u64) {
        if let Some(node) = self.live.remove(&n) {
            self.by_node.remove(&node);
        }
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

fn format_token(n: u64) -> String {
    format!("{}{}", REF_PREFIX, n)
}

/// Only the exact form `format_token` produces is accepted, so `e01` and
/// `e+1` do not alias `e1`.
fn parse_token(token: &str) -> Option<u64> {
    let n = token
        .strip_prefix(REF_PREFIX)
        .and_then(|rest| rest.parse::<u64>().ok())
        .filter(|n| *n > 0)?;
    (format_token(n) == token).then_some(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tether_common::ErrorKind;

    #[test]
    fn test_allocation_is_idempotent_per_node() {
        let mut table = RefTable::new();
        let a = table.allocate(10u32);
        let b = table.allocate(10u32);
        let c = table.allocate(11u32);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, "e1");
        assert_eq!(c, "e2");
    }

    #[test]
    fn test_detached_node_resolves_stale_and_never_comes_back() {
        let mut table = RefTable::new();
        let mut attached: HashSet<u32> = HashSet::from([1, 2]);
        let token = table.allocate(1u32);

        assert_eq!(table.resolve(&token, |n| attached.contains(n)).unwrap(), 1);

        attached.remove(&1);
        let err = table.resolve(&token, |n| attached.contains(n)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Stale);

        // Even if the node is re-attached the old token stays dead, and a
        // fresh allocation mints a new token.
        attached.insert(1);
        let err = table.resolve(&token, |n| attached.contains(n)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Stale);
        let fresh = table.allocate(1u32);
        assert_ne!(fresh, token);
    }

    #[test]
    fn test_unknown_and_malformed_tokens_are_not_found() {
        let mut table: RefTable<u32> = RefTable::new();
        table.allocate(1);
        for token in ["e9", "e0", "x1", "e", "ee2"] {
            let err = table.resolve(token, |_| true).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::NotFound, "token {}", token);
        }
    }

    #[test]
    fn test_non_canonical_spellings_do_not_alias() {
        let mut table: RefTable<u32> = RefTable::new();
        let token = table.allocate(1);
        assert_eq!(token, "e1");
        for alias in ["e01", "e+1", "e001"] {
            let err = table.resolve(alias, |_| true).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::NotFound, "token {}", alias);
        }
        assert_eq!(table.resolve("e1", |_| true).unwrap(), 1);
    }

    #[test]
    fn test_release_detached_sweeps_only_detached_nodes() {
        let mut table = RefTable::new();
        let keep = table.allocate(1u32);
        let drop = table.allocate(2u32);
        assert_eq!(table.release_detached(|n| *n == 1), 1);
        assert_eq!(table.len(), 1);
        assert!(table.resolve(&keep, |_| true).is_ok());
        assert_eq!(
            table.resolve(&drop, |_| true).unwrap_err().kind(),
            ErrorKind::Stale
        );
    }

    #[test]
    fn test_tokens_never_reused_across_churn() {
        let mut table = RefTable::new();
        let mut seen = HashSet::new();
        for round in 0..50u32 {
            let token = table.allocate(round);
            assert!(seen.insert(token.clone()), "token {} reissued", token);
            table.release_detached(|_| false);
            // A released token never resolves to the next node.
            assert!(table.resolve(&token, |_| true).is_err());
        }
    }
}
