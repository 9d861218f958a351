use std::collections::HashSet;

use resclient_core::Rid;

/// The set of retained resources that lost their subscription and await
/// resubscription. A RID is only ever in the set while it has a cache
/// entry; eviction removes it.
#[derive(Default)]
pub(crate) struct StaleSet {
    rids: HashSet<Rid>,
}

impl StaleSet {
    pub(crate) fn insert(&mut self, rid: Rid) -> bool {
        self.rids.insert(rid)
    }

    pub(crate) fn remove(&mut self, rid: &Rid) -> bool {
        self.rids.remove(rid)
    }

    pub(crate) fn contains(&self, rid: &Rid) -> bool {
        self.rids.contains(rid)
    }

    pub(crate) fn rids(&self) -> Vec<Rid> {
        self.rids.iter().cloned().collect()
    }
}
