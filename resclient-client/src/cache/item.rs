use futures_channel::oneshot;
use resclient_core::Rid;

use crate::{
    errors::ClientError,
    resource::{Resource, ResourceKind},
};

/// Per-resource cache record.
pub(crate) struct CacheItem {
    pub(crate) rid: Rid,
    /// Set on first materialization and fixed thereafter; a later bundle
    /// disagreeing on the kind is a protocol violation.
    pub(crate) kind: Option<ResourceKind>,
    /// The materialized resource, absent until first materialization.
    pub(crate) resource: Option<Resource>,
    /// True iff the server currently considers the client subscribed.
    pub(crate) subscribed: bool,
    /// Count of application listeners registered through the cache.
    pub(crate) direct: usize,
    /// Count of inbound edges from other cached resources.
    pub(crate) indirect: usize,
    /// True while a subscribe request for this RID is in flight.
    pub(crate) pending: bool,
    /// `get` calls sharing the in-flight subscription.
    pub(crate) waiters: Vec<oneshot::Sender<Result<Resource, ClientError>>>,
}

impl CacheItem {
    pub(crate) fn new(rid: Rid) -> Self {
        Self {
            rid,
            kind: None,
            resource: None,
            subscribed: false,
            direct: 0,
            indirect: 0,
            pending: false,
            waiters: Vec::new(),
        }
    }

    pub(crate) fn add_indirect(&mut self) {
        self.indirect += 1;
    }

    pub(crate) fn remove_indirect(&mut self) {
        self.indirect = self.indirect.saturating_sub(1);
    }

    /// Resolves every waiter with a clone of the result.
    pub(crate) fn resolve_waiters(&mut self, result: &Result<Resource, ClientError>) {
        for waiter in self.waiters.drain(..) {
            let res = match result {
                Ok(resource) => Ok(resource.clone()),
                // waiters observe the same failure; the original error is
                // not Clone, so it travels in wire shape
                Err(err) => Err(ClientError::Res(err.to_res_error())),
            };
            // a dropped receiver means the caller went away
            let _ = waiter.send(res);
        }
    }
}
