//! Reference-state classification: decides, for every resource reachable
//! from an unsubscribed root, whether it can be evicted, must be kept, or
//! goes stale awaiting resubscription.

use std::collections::HashMap;

use resclient_core::Rid;

use super::item::CacheItem;

/// Classification of a reachable cache item.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum RefState {
    /// Visited but not yet classified.
    None,
    /// No remaining reason to keep; evict.
    Delete,
    /// Anchored by external edges or a stale root; retain.
    Keep,
    /// Orphaned but directly listened to; demote to the stale set.
    Stale,
}

pub(crate) struct RefEntry {
    /// Inbound edges from outside the subgraph rooted at the traversal
    /// root (for the root itself: its full indirect count).
    pub(crate) rc: usize,
    pub(crate) state: RefState,
}

// Parent state during the marking pass: either plain deletion, or a
// stale-root token naming the resource whose retention covers this
// subtree.
enum Mark {
    Delete,
    Root(Rid),
}

/// Computes the reference-state map for the subgraph reachable from
/// `root`. The caller has already established that the root is neither
/// subscribed nor fetching.
pub(crate) fn reference_states(
    items: &HashMap<Rid, CacheItem>,
    root: &Rid,
) -> HashMap<Rid, RefEntry> {
    let mut map = HashMap::new();
    seek_refs(items, &mut map, root, root);
    mark(items, &mut map, root, &Mark::Delete);
    map
}

// Anchored items terminate traversal: the server keeps them live
// (subscribed), or an in-flight subscribe is about to.
fn anchored(item: &CacheItem) -> bool {
    item.subscribed || item.pending
}

fn child_refs(item: &CacheItem) -> Vec<Rid> {
    item.resource.as_ref().map(|r| r.refs()).unwrap_or_default()
}

// Pass 1: depth-first count of inbound edges. After the pass, an entry's
// `rc` equals the number of edges reaching it from outside the subgraph.
fn seek_refs(
    items: &HashMap<Rid, CacheItem>,
    map: &mut HashMap<Rid, RefEntry>,
    root: &Rid,
    rid: &Rid,
) {
    if let Some(entry) = map.get_mut(rid) {
        // revisit over an in-subgraph edge
        entry.rc = entry.rc.saturating_sub(1);
        return;
    }
    let Some(item) = items.get(rid.as_str()) else { return };
    if anchored(item) && rid != root {
        return;
    }
    let rc = if rid == root { item.indirect } else { item.indirect.saturating_sub(1) };
    map.insert(rid.clone(), RefEntry { rc, state: RefState::None });
    for child in child_refs(item) {
        seek_refs(items, map, root, &child);
    }
}

// Pass 2: classify. `parent` starts as Delete at the root; a kept or
// stale item switches the state to a token naming itself, marking its
// subtree as covered.
fn mark(
    items: &HashMap<Rid, CacheItem>,
    map: &mut HashMap<Rid, RefEntry>,
    rid: &Rid,
    parent: &Mark,
) {
    let Some(item) = items.get(rid.as_str()) else { return };
    // anchored items never entered the map in pass 1, so the entry
    // lookup terminates on them as well
    let Some(entry) = map.get_mut(rid) else { return };
    if entry.state == RefState::Keep {
        return;
    }

    let next = match parent {
        Mark::Delete => {
            if entry.rc > 0 {
                entry.state = RefState::Keep;
                Mark::Root(rid.clone())
            } else if entry.state != RefState::None {
                return;
            } else if item.direct > 0 {
                entry.state = RefState::Stale;
                Mark::Root(rid.clone())
            } else {
                entry.state = RefState::Delete;
                Mark::Delete
            }
        }
        Mark::Root(token) => {
            if rid == token {
                return;
            }
            entry.state = RefState::Keep;
            if entry.rc > 0 {
                Mark::Root(rid.clone())
            } else {
                Mark::Root(token.clone())
            }
        }
    };

    for child in child_refs(item) {
        mark(items, map, &child, &next);
    }
}
