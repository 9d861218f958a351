//! The resource cache: materializes server snapshots into shared
//! resource handles, wires up cross-resource references with exact
//! reference counts, applies pushed events, and decides the fate of
//! resources when their anchors go away.

mod item;
mod refstate;
mod type_list;

pub(crate) use item::CacheItem;
pub use type_list::Factory;
pub(crate) use type_list::TypeList;

use std::{collections::HashMap, sync::Arc};

use futures_channel::oneshot;
use serde::Deserialize;
use serde_json::value::RawValue;
use tracing::{debug, error};

use resclient_core::{DataValue, Pattern, ResError, ResourceSet, Rid};

use crate::{
    diff::{diff, DiffOp},
    errors::ClientError,
    events::{resource_subject, EventBus, ListenerId, ResourceEvent},
    resource::{Collection, FieldChange, Model, Resource, ResourceError, ResourceKind, Value},
    stale::StaleSet,
};

/// `change` event payload. New resources referenced by the change ride
/// along in the same bundle shape as a subscribe response.
#[derive(Deserialize)]
struct ChangeData {
    values: HashMap<String, serde_json::Value>,
    #[serde(flatten)]
    resources: ResourceSet,
}

/// `add` event payload.
#[derive(Deserialize)]
struct AddData {
    value: serde_json::Value,
    idx: usize,
    #[serde(flatten)]
    resources: ResourceSet,
}

/// `remove` event payload.
#[derive(Deserialize)]
struct RemoveData {
    idx: usize,
}

/// `new` response payload: the RID of the created resource plus its data
/// bundle.
#[derive(Deserialize)]
pub(crate) struct NewResult {
    rid: Rid,
    #[serde(flatten)]
    resources: ResourceSet,
}

/// What the coordinator should do after a direct listener was removed.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ListenerRemoval {
    /// Other listeners remain; nothing to do.
    StillHeld,
    /// Direct count hit zero on a subscribed item: issue an unsubscribe
    /// request.
    SendUnsubscribe,
    /// Direct count hit zero on an unsubscribed item; the item was fed to
    /// reference-state classification.
    Classified,
    /// The listener id was not registered; counts were left untouched.
    UnknownListener,
}

enum CreateDisposition {
    Fresh,
    Sync,
    Skip,
}

/// The cache coordinator. Owned and driven exclusively by the client's
/// manager task; see the crate docs for the single-writer rationale.
pub(crate) struct Cache {
    items: HashMap<Rid, CacheItem>,
    stale: StaleSet,
    // staled since the last `take_new_stale`, for resubscribe scheduling
    new_stale: Vec<Rid>,
    model_types: TypeList<Model>,
    collection_types: TypeList<Collection>,
    bus: Arc<EventBus>,
    namespace: String,
}

impl Cache {
    pub(crate) fn new(bus: Arc<EventBus>, namespace: String) -> Self {
        Self {
            items: HashMap::new(),
            stale: StaleSet::default(),
            new_stale: Vec::new(),
            model_types: TypeList::new(Arc::new(|rid: &Rid| Model::new(rid.clone()))),
            collection_types: TypeList::new(Arc::new(|rid: &Rid| Collection::new(rid.clone()))),
            bus,
            namespace,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn stale_rids(&self) -> Vec<Rid> {
        self.stale.rids()
    }

    pub(crate) fn is_stale(&self, rid: &Rid) -> bool {
        self.stale.contains(rid)
    }

    pub(crate) fn is_pending(&self, rid: &Rid) -> bool {
        self.items.get(rid).map(|i| i.pending).unwrap_or(false)
    }

    /// Drains the RIDs that went stale since the last call, so the
    /// manager can schedule their resubscription.
    pub(crate) fn take_new_stale(&mut self) -> Vec<Rid> {
        std::mem::take(&mut self.new_stale)
    }

    pub(crate) fn register_model_type(&mut self, pattern: Pattern, factory: Factory<Model>) {
        self.model_types.register(pattern, factory);
    }

    pub(crate) fn unregister_model_type(&mut self, pattern: &Pattern) -> bool {
        self.model_types.unregister(pattern)
    }

    pub(crate) fn register_collection_type(
        &mut self,
        pattern: Pattern,
        factory: Factory<Collection>,
    ) {
        self.collection_types.register(pattern, factory);
    }

    pub(crate) fn unregister_collection_type(&mut self, pattern: &Pattern) -> bool {
        self.collection_types.unregister(pattern)
    }

    fn emit(&self, rid: &Rid, event: &ResourceEvent) {
        self.bus.emit_resource(&resource_subject(&self.namespace, rid), event);
    }

    fn ensure_item(&mut self, rid: &Rid) -> &mut CacheItem {
        self.items.entry(rid.clone()).or_insert_with(|| CacheItem::new(rid.clone()))
    }

    fn resolve_ref(&self, rid: &Rid) -> Option<Resource> {
        self.items.get(rid).and_then(|item| item.resource.clone())
    }

    // ---- get / subscribe lifecycle -------------------------------------

    /// Routes a `get`: resolves immediately from cache, attaches to an
    /// in-flight subscription, or registers the waiter and reports that a
    /// subscribe request must be issued.
    pub(crate) fn get_or_fetch(
        &mut self,
        rid: &Rid,
        waiter: oneshot::Sender<Result<Resource, ClientError>>,
    ) -> bool {
        let item = self.ensure_item(rid);
        if let Some(resource) = &item.resource {
            let _ = waiter.send(Ok(resource.clone()));
            return false;
        }
        item.waiters.push(waiter);
        if item.pending {
            false
        } else {
            item.pending = true;
            true
        }
    }

    /// Applies a successful subscribe response for `rid`.
    pub(crate) fn handle_subscribe_response(&mut self, rid: &Rid, set: ResourceSet) {
        // an error object for the requested RID itself is a failure
        if let Some(err) = set.errors.get(rid).cloned() {
            self.fail_subscribe(rid, err);
            return;
        }
        self.materialize(set);
        let Some(item) = self.items.get_mut(rid) else {
            error!(rid = %rid, "subscribe response for evicted resource");
            return;
        };
        item.pending = false;
        if item.resource.is_none() {
            let err = ClientError::Protocol(format!("subscribe response missing resource {rid}"));
            item.resolve_waiters(&Err(err));
            self.evict(rid);
            return;
        }
        item.subscribed = true;
        if let Some(resource) = item.resource.clone() {
            item.resolve_waiters(&Ok(resource));
        }
        self.stale.remove(rid);
    }

    /// Applies an error response to a subscribe request.
    pub(crate) fn fail_subscribe(&mut self, rid: &Rid, err: ResError) {
        let Some(item) = self.items.get_mut(rid) else { return };
        item.pending = false;
        item.resolve_waiters(&Err(ClientError::Res(err)));
        if item.resource.is_none() {
            // a just-created item: evict and let the error propagate
            self.evict(rid);
        } else {
            // failed stale resubscription: the resource is dead
            self.stale.remove(rid);
            self.try_delete(rid);
            self.emit(rid, &ResourceEvent::Unsubscribe);
        }
    }

    /// A subscribe request was lost to a transport close. Fresh items are
    /// evicted and their waiters rejected; materialized items keep their
    /// staleness for the reconnect sweep.
    pub(crate) fn fail_subscribe_closed(&mut self, rid: &Rid, err: &ResError) {
        let Some(item) = self.items.get_mut(rid) else { return };
        item.pending = false;
        if item.resource.is_none() {
            item.resolve_waiters(&Err(ClientError::Res(err.clone())));
            self.evict(rid);
        }
    }

    /// Marks a stale item as having a resubscription in flight. Returns
    /// false when the RID is no longer stale (or already fetching), in
    /// which case no request should be sent.
    pub(crate) fn begin_resubscribe(&mut self, rid: &Rid) -> bool {
        if !self.stale.contains(rid) {
            return false;
        }
        let Some(item) = self.items.get_mut(rid) else { return false };
        if item.pending {
            return false;
        }
        item.pending = true;
        true
    }

    /// Applies a successful unsubscribe response.
    pub(crate) fn confirm_unsubscribed(&mut self, rid: &Rid) {
        if let Some(item) = self.items.get_mut(rid) {
            item.subscribed = false;
            self.try_delete(rid);
        }
    }

    /// Applies a `new` response: the bundle is materialized, then the
    /// created resource is marked subscribed and returned.
    pub(crate) fn handle_new_response(
        &mut self,
        result: NewResult,
    ) -> Result<Resource, ClientError> {
        self.materialize(result.resources);
        let item = self.items.get_mut(&result.rid).ok_or_else(|| {
            ClientError::Protocol(format!("new response missing resource {}", result.rid))
        })?;
        let resource = item.resource.clone().ok_or_else(|| {
            ClientError::Protocol(format!("new response missing resource {}", result.rid))
        })?;
        item.subscribed = true;
        self.stale.remove(&result.rid);
        Ok(resource)
    }

    // ---- listeners -----------------------------------------------------

    pub(crate) fn add_listener(
        &mut self,
        rid: &Rid,
        filter: Option<&str>,
    ) -> Result<(ListenerId, futures_channel::mpsc::UnboundedReceiver<ResourceEvent>), ClientError>
    {
        let item =
            self.items.get_mut(rid).ok_or_else(|| ClientError::NotFound(rid.clone()))?;
        item.direct += 1;
        Ok(self.bus.subscribe_resource(&resource_subject(&self.namespace, rid), filter))
    }

    pub(crate) fn remove_listener(
        &mut self,
        rid: &Rid,
        id: ListenerId,
    ) -> Result<ListenerRemoval, ClientError> {
        if !self.items.contains_key(rid) {
            return Err(ClientError::NotFound(rid.clone()));
        }
        if !self.bus.unsubscribe_resource(&resource_subject(&self.namespace, rid), id) {
            return Ok(ListenerRemoval::UnknownListener);
        }
        let item = self.items.get_mut(rid).ok_or_else(|| ClientError::NotFound(rid.clone()))?;
        item.direct = item.direct.saturating_sub(1);
        if item.direct > 0 {
            return Ok(ListenerRemoval::StillHeld);
        }
        if item.subscribed {
            Ok(ListenerRemoval::SendUnsubscribe)
        } else {
            self.try_delete(rid);
            Ok(ListenerRemoval::Classified)
        }
    }

    // ---- materialization ----------------------------------------------

    /// Materializes a resource bundle in three phases: create every cache
    /// item first (so references resolve even in cyclic graphs), then
    /// populate fresh items, then synchronize pre-existing ones. Phases
    /// one and two emit no user-visible events.
    pub(crate) fn materialize(&mut self, set: ResourceSet) {
        let mut fresh_models = Vec::new();
        let mut sync_models = Vec::new();
        let mut fresh_collections = Vec::new();
        let mut sync_collections = Vec::new();

        // phase 1: create
        for (rid, data) in set.models {
            match self.create_item(&rid, ResourceKind::Model) {
                CreateDisposition::Fresh => fresh_models.push((rid, data)),
                CreateDisposition::Sync => sync_models.push((rid, data)),
                CreateDisposition::Skip => {}
            }
        }
        for (rid, data) in set.collections {
            match self.create_item(&rid, ResourceKind::Collection) {
                CreateDisposition::Fresh => fresh_collections.push((rid, data)),
                CreateDisposition::Sync => sync_collections.push((rid, data)),
                CreateDisposition::Skip => {}
            }
        }
        for (rid, err) in set.errors {
            if let CreateDisposition::Fresh = self.create_item(&rid, ResourceKind::Error) {
                let item = self.ensure_item(&rid);
                item.resource = Some(Resource::Error(ResourceError::new(rid.clone(), err)));
            }
        }

        // phase 2: init
        for (rid, data) in fresh_models {
            let prepared = self.prepare_model_values(&rid, data);
            if let Some(Resource::Model(model)) = self.resolve_ref(&rid) {
                model.init(prepared);
            }
        }
        for (rid, data) in fresh_collections {
            let prepared = self.prepare_collection_values(&rid, data);
            if let Some(Resource::Collection(collection)) = self.resolve_ref(&rid) {
                collection.init(prepared);
            }
        }

        // phase 3: sync
        for (rid, data) in sync_models {
            self.sync_model(&rid, data);
        }
        for (rid, data) in sync_collections {
            self.sync_collection(&rid, data);
        }
    }

    fn create_item(&mut self, rid: &Rid, kind: ResourceKind) -> CreateDisposition {
        if let Some(item) = self.items.get(rid) {
            if let Some(existing) = item.kind {
                if existing != kind {
                    error!(
                        rid = %rid,
                        existing = %existing,
                        received = %kind,
                        "resource type inconsistency; skipping materialization"
                    );
                    return CreateDisposition::Skip;
                }
            }
            if item.resource.is_some() {
                return CreateDisposition::Sync;
            }
        }
        let resource = match kind {
            ResourceKind::Model => {
                let factory = self.model_types.factory(rid).clone();
                Some(Resource::Model(factory(rid)))
            }
            ResourceKind::Collection => {
                let factory = self.collection_types.factory(rid).clone();
                Some(Resource::Collection(factory(rid)))
            }
            // error resources are built by the caller from the error object
            ResourceKind::Error => None,
        };
        let item = self.ensure_item(rid);
        item.kind = Some(kind);
        if resource.is_some() {
            item.resource = resource;
        }
        CreateDisposition::Fresh
    }

    // Resolves raw model data into values, bumping indirect counts on
    // referenced resources.
    fn prepare_model_values(
        &mut self,
        rid: &Rid,
        data: HashMap<String, serde_json::Value>,
    ) -> HashMap<String, Value> {
        let mut prepared = HashMap::with_capacity(data.len());
        for (key, raw) in data {
            let value = self.prepare_value(rid, raw);
            prepared.insert(key, value);
        }
        prepared
    }

    fn prepare_collection_values(
        &mut self,
        rid: &Rid,
        data: Vec<serde_json::Value>,
    ) -> Vec<Value> {
        data.into_iter().map(|raw| self.prepare_value(rid, raw)).collect()
    }

    fn prepare_value(&mut self, rid: &Rid, raw: serde_json::Value) -> Value {
        match DataValue::classify(raw) {
            DataValue::Primitive(v) => Value::Data(v),
            DataValue::Ref(target) => match self.resolve_ref(&target) {
                Some(resource) => {
                    if let Some(item) = self.items.get_mut(&target) {
                        item.add_indirect();
                    }
                    Value::Resource(resource)
                }
                None => {
                    error!(rid = %rid, target = %target, "unresolved resource reference");
                    Value::Data(serde_json::json!({ "rid": target.as_str() }))
                }
            },
            DataValue::Delete => {
                error!(rid = %rid, "delete sentinel outside change event");
                Value::Data(serde_json::json!({ "action": "delete" }))
            }
            DataValue::Unsupported(v) => {
                error!(rid = %rid, "unsupported value shape in resource data");
                Value::Data(v)
            }
        }
    }

    // ---- event pipeline ------------------------------------------------

    /// Routes an inbound event frame: splits `<rid>.<name>` at the last
    /// dot and dispatches on the name. Unknown names pass through to the
    /// event bus untouched.
    pub(crate) fn handle_event(
        &mut self,
        event: &str,
        data: Option<&RawValue>,
    ) -> Result<(), ClientError> {
        let (rid, name) = event
            .rsplit_once('.')
            .ok_or_else(|| ClientError::Protocol(format!("malformed event name: {event}")))?;
        let rid = Rid::from(rid);
        if !self.items.contains_key(&rid) {
            return Err(ClientError::Protocol(format!("event for unknown resource: {event}")));
        }
        match name {
            "change" => self.handle_change(&rid, parse_data(data)?),
            "add" => self.handle_add(&rid, parse_data(data)?),
            "remove" => self.handle_remove(&rid, parse_data(data)?),
            "unsubscribe" => {
                self.handle_unsubscribe(&rid);
                Ok(())
            }
            custom => {
                let data = match data {
                    Some(raw) => Some(serde_json::from_str(raw.get())?),
                    None => None,
                };
                self.emit(&rid, &ResourceEvent::Custom { name: custom.to_owned(), data });
                Ok(())
            }
        }
    }

    fn handle_change(&mut self, rid: &Rid, data: ChangeData) -> Result<(), ClientError> {
        self.expect_kind(rid, ResourceKind::Model, "change")?;
        self.materialize(data.resources);
        let mut prepared = HashMap::with_capacity(data.values.len());
        for (key, raw) in data.values {
            let change = match DataValue::classify(raw) {
                DataValue::Primitive(v) => FieldChange::Set(Value::Data(v)),
                DataValue::Delete => FieldChange::Delete,
                DataValue::Ref(target) => match self.resolve_ref(&target) {
                    Some(resource) => FieldChange::Set(Value::Resource(resource)),
                    None => {
                        return Err(ClientError::Protocol(format!(
                            "change for {rid} references unknown resource {target}"
                        )))
                    }
                },
                DataValue::Unsupported(v) => {
                    return Err(ClientError::Protocol(format!(
                        "unsupported change value for {rid}: {v}"
                    )))
                }
            };
            prepared.insert(key, change);
        }
        self.apply_change(rid, prepared)
    }

    // Applies prepared field changes, settles indirect counts by net
    // delta, emits the change event, and feeds orphaned references to
    // classification.
    fn apply_change(
        &mut self,
        rid: &Rid,
        prepared: HashMap<String, FieldChange>,
    ) -> Result<(), ClientError> {
        let Some(Resource::Model(model)) = self.resolve_ref(rid) else {
            return Err(ClientError::Protocol(format!("change event for non-model {rid}")));
        };
        let Some(old_values) = model.update(&prepared) else { return Ok(()) };

        // net per-RID delta over the changed keys; a reference removed
        // and re-added in the same change cancels out
        let mut deltas: HashMap<Rid, i64> = HashMap::new();
        for (key, old) in &old_values {
            if let Some(Value::Resource(resource)) = old {
                *deltas.entry(resource.rid().clone()).or_default() -= 1;
            }
            if let Some(FieldChange::Set(Value::Resource(resource))) = prepared.get(key) {
                *deltas.entry(resource.rid().clone()).or_default() += 1;
            }
        }
        let mut orphaned = Vec::new();
        for (target, delta) in deltas {
            let Some(item) = self.items.get_mut(&target) else { continue };
            match delta {
                d if d > 0 => {
                    for _ in 0..d {
                        item.add_indirect();
                    }
                }
                d if d < 0 => {
                    for _ in 0..-d {
                        item.remove_indirect();
                    }
                    if item.indirect == 0 {
                        orphaned.push(target);
                    }
                }
                _ => {}
            }
        }

        self.emit(rid, &ResourceEvent::Change { old_values });
        for target in orphaned {
            self.try_delete(&target);
        }
        Ok(())
    }

    fn handle_add(&mut self, rid: &Rid, data: AddData) -> Result<(), ClientError> {
        self.expect_kind(rid, ResourceKind::Collection, "add")?;
        self.materialize(data.resources);
        let Some(Resource::Collection(collection)) = self.resolve_ref(rid) else {
            return Err(ClientError::Protocol(format!("add event for non-collection {rid}")));
        };
        if data.idx > collection.len() {
            return Err(ClientError::Protocol(format!(
                "add index {} out of bounds for {rid}",
                data.idx
            )));
        }
        let value = match DataValue::classify(data.value) {
            DataValue::Primitive(v) => Value::Data(v),
            DataValue::Ref(target) => match self.resolve_ref(&target) {
                Some(resource) => {
                    if let Some(item) = self.items.get_mut(&target) {
                        item.add_indirect();
                    }
                    Value::Resource(resource)
                }
                None => {
                    return Err(ClientError::Protocol(format!(
                        "add to {rid} references unknown resource {target}"
                    )))
                }
            },
            other => {
                return Err(ClientError::Protocol(format!(
                    "unsupported add value for {rid}: {other:?}"
                )))
            }
        };
        collection.insert(data.idx, value.clone());
        self.emit(rid, &ResourceEvent::Add { idx: data.idx, value });
        Ok(())
    }

    fn handle_remove(&mut self, rid: &Rid, data: RemoveData) -> Result<(), ClientError> {
        self.expect_kind(rid, ResourceKind::Collection, "remove")?;
        let Some(Resource::Collection(collection)) = self.resolve_ref(rid) else {
            return Err(ClientError::Protocol(format!("remove event for non-collection {rid}")));
        };
        let Some(value) = collection.remove(data.idx) else {
            return Err(ClientError::Protocol(format!(
                "remove index {} out of bounds for {rid}",
                data.idx
            )));
        };
        let mut orphan = None;
        if let Value::Resource(resource) = &value {
            let target = resource.rid().clone();
            if let Some(item) = self.items.get_mut(&target) {
                item.remove_indirect();
                if item.indirect == 0 {
                    orphan = Some(target);
                }
            }
        }
        self.emit(rid, &ResourceEvent::Remove { idx: data.idx, value });
        if let Some(target) = orphan {
            self.try_delete(&target);
        }
        Ok(())
    }

    fn handle_unsubscribe(&mut self, rid: &Rid) {
        if let Some(item) = self.items.get_mut(rid) {
            item.subscribed = false;
            self.try_delete(rid);
            self.emit(rid, &ResourceEvent::Unsubscribe);
        }
    }

    fn expect_kind(
        &self,
        rid: &Rid,
        kind: ResourceKind,
        event: &str,
    ) -> Result<(), ClientError> {
        match self.items.get(rid).and_then(|i| i.kind) {
            Some(k) if k == kind => Ok(()),
            other => Err(ClientError::Protocol(format!(
                "{event} event for {rid} of kind {other:?}"
            ))),
        }
    }

    // ---- synchronization (stale resubscription) ------------------------

    // Reconciles a model against a fresh snapshot: routed through the
    // change pipeline with the snapshot as values, plus deletions for
    // keys the snapshot no longer carries. The diff keeps the emitted
    // change minimal.
    fn sync_model(&mut self, rid: &Rid, data: HashMap<String, serde_json::Value>) {
        let Some(Resource::Model(model)) = self.resolve_ref(rid) else { return };
        let mut prepared = HashMap::with_capacity(data.len());
        for key in model.keys() {
            if !data.contains_key(&key) {
                prepared.insert(key, FieldChange::Delete);
            }
        }
        for (key, raw) in data {
            let change = match DataValue::classify(raw) {
                DataValue::Primitive(v) => FieldChange::Set(Value::Data(v)),
                DataValue::Ref(target) => match self.resolve_ref(&target) {
                    Some(resource) => FieldChange::Set(Value::Resource(resource)),
                    None => {
                        error!(rid = %rid, target = %target, "unresolved reference in model sync");
                        continue;
                    }
                },
                other => {
                    error!(rid = %rid, value = ?other, "unsupported value in model sync");
                    continue;
                }
            };
            prepared.insert(key, change);
        }
        if let Err(err) = self.apply_change(rid, prepared) {
            error!(rid = %rid, err = %err, "model synchronization failed");
        }
    }

    // Reconciles a collection against a fresh snapshot via an LCS diff,
    // emitting the remove/add events the missed stream would have
    // produced. Matched elements keep their identity.
    fn sync_collection(&mut self, rid: &Rid, data: Vec<serde_json::Value>) {
        let Some(Resource::Collection(collection)) = self.resolve_ref(rid) else { return };
        let mut new_items = Vec::with_capacity(data.len());
        for raw in data {
            match DataValue::classify(raw) {
                DataValue::Primitive(v) => new_items.push(Value::Data(v)),
                DataValue::Ref(target) => match self.resolve_ref(&target) {
                    Some(resource) => new_items.push(Value::Resource(resource)),
                    None => {
                        error!(rid = %rid, target = %target, "unresolved reference in collection sync");
                        return;
                    }
                },
                other => {
                    error!(rid = %rid, value = ?other, "unsupported value in collection sync");
                    return;
                }
            }
        }

        let old_items = collection.items();
        let ops = diff(&old_items, &new_items);
        let mut orphaned = Vec::new();
        for op in ops {
            match op {
                DiffOp::Remove { idx } => {
                    let Some(value) = collection.remove(idx) else { continue };
                    if let Value::Resource(resource) = &value {
                        let target = resource.rid().clone();
                        if let Some(item) = self.items.get_mut(&target) {
                            item.remove_indirect();
                            if item.indirect == 0 {
                                orphaned.push(target);
                            }
                        }
                    }
                    self.emit(rid, &ResourceEvent::Remove { idx, value });
                }
                DiffOp::Add { idx, value } => {
                    if let Value::Resource(resource) = &value {
                        if let Some(item) = self.items.get_mut(resource.rid()) {
                            item.add_indirect();
                        }
                    }
                    collection.insert(idx, value.clone());
                    self.emit(rid, &ResourceEvent::Add { idx, value });
                }
            }
        }
        // classification runs after the whole patch; an element removed
        // and re-added by the diff nets out and stays anchored
        for target in orphaned {
            if let Some(item) = self.items.get(&target) {
                if item.indirect == 0 {
                    self.try_delete(&target);
                }
            }
        }
    }

    // ---- reference-state execution -------------------------------------

    /// Classifies the subgraph reachable from `rid` and executes the
    /// verdicts: delete-marked items are evicted, stale-marked items join
    /// the stale set.
    pub(crate) fn try_delete(&mut self, rid: &Rid) {
        let Some(item) = self.items.get(rid) else { return };
        if item.subscribed || item.pending {
            return;
        }
        let states = refstate::reference_states(&self.items, rid);
        for (target, entry) in states {
            match entry.state {
                refstate::RefState::Delete => self.evict(&target),
                refstate::RefState::Stale => self.set_stale(target),
                _ => {}
            }
        }
    }

    fn set_stale(&mut self, rid: Rid) {
        if self.stale.insert(rid.clone()) {
            debug!(rid = %rid, "resource went stale");
            self.new_stale.push(rid);
        }
    }

    // Removes the item and severs its outbound edges. Classification has
    // already accounted for the cascade, so no re-classification here.
    fn evict(&mut self, rid: &Rid) {
        let Some(mut item) = self.items.remove(rid) else { return };
        self.stale.remove(rid);
        debug!(rid = %rid, "evicting resource");
        item.resolve_waiters(&Err(ClientError::Res(ResError::not_found(rid))));
        if let Some(resource) = item.resource.take() {
            for value in resource.drain() {
                if let Value::Resource(child) = value {
                    if let Some(child_item) = self.items.get_mut(child.rid()) {
                        child_item.remove_indirect();
                    }
                }
            }
        }
    }

    // ---- disconnect sweep ----------------------------------------------

    /// Transition every subscribed item to unsubscribed-and-stale, then
    /// classify each: unanchored resources are evicted, listened-to ones
    /// stay stale for the reconnect resubscription.
    pub(crate) fn mark_all_stale(&mut self) {
        let subscribed: Vec<Rid> = self
            .items
            .iter()
            .filter(|(_, item)| item.subscribed)
            .map(|(rid, _)| rid.clone())
            .collect();
        for rid in &subscribed {
            if let Some(item) = self.items.get_mut(rid) {
                item.subscribed = false;
                self.set_stale(rid.clone());
            }
        }
        for rid in &subscribed {
            self.try_delete(rid);
        }
    }

    #[cfg(test)]
    pub(crate) fn item(&self, rid: &Rid) -> Option<&CacheItem> {
        self.items.get(rid)
    }
}

fn parse_data<T: serde::de::DeserializeOwned>(data: Option<&RawValue>) -> Result<T, ClientError> {
    let raw = data
        .ok_or_else(|| ClientError::Protocol("event missing its data payload".to_owned()))?;
    Ok(serde_json::from_str(raw.get())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cache() -> Cache {
        Cache::new(Arc::new(EventBus::new()), "test".to_owned())
    }

    fn bundle(value: serde_json::Value) -> ResourceSet {
        serde_json::from_value(value).unwrap()
    }

    // creates a pending item and applies the subscribe response, like a
    // `get` would
    fn subscribe(cache: &mut Cache, rid: &str, set: serde_json::Value) -> Resource {
        let (tx, mut rx) = oneshot::channel();
        assert!(cache.get_or_fetch(&rid.into(), tx));
        cache.handle_subscribe_response(&rid.into(), bundle(set));
        rx.try_recv().unwrap().unwrap().unwrap()
    }

    fn event(cache: &mut Cache, rid: &str, name: &str, data: serde_json::Value) {
        let raw = serde_json::value::to_raw_value(&data).unwrap();
        cache.handle_event(&format!("{rid}.{name}"), Some(&raw)).unwrap();
    }

    #[test]
    fn nested_reference_materializes_and_counts() {
        let mut cache = cache();
        let p = subscribe(
            &mut cache,
            "p",
            json!({"models": {"p": {"child": {"rid": "c"}}, "c": {"v": 1}}}),
        );

        // p.child is the very object cached at c
        let child = p.as_model().unwrap().get("child").unwrap();
        let c = cache.item(&"c".into()).unwrap().resource.clone().unwrap();
        assert!(child.as_resource().unwrap().same_resource(&c));
        assert_eq!(cache.item(&"c".into()).unwrap().indirect, 1);
        assert!(cache.item(&"p".into()).unwrap().subscribed);
        assert!(!cache.item(&"c".into()).unwrap().subscribed);

        // deleting the field orphans and evicts c
        event(&mut cache, "p", "change", json!({"values": {"child": {"action": "delete"}}}));
        assert!(!p.as_model().unwrap().contains_key("child"));
        assert!(cache.item(&"c".into()).is_none());
    }

    #[test]
    fn cyclic_bundle_materializes_without_recursing() {
        let mut cache = cache();
        let a = subscribe(
            &mut cache,
            "a",
            json!({"models": {"a": {"next": {"rid": "b"}}, "b": {"next": {"rid": "a"}}}}),
        );

        let b = cache.item(&"b".into()).unwrap().resource.clone().unwrap();
        let a_next = a.as_model().unwrap().get("next").unwrap();
        let b_next = b.as_model().unwrap().get("next").unwrap();
        assert!(a_next.as_resource().unwrap().same_resource(&b));
        assert!(b_next.as_resource().unwrap().same_resource(&a));
        assert_eq!(cache.item(&"a".into()).unwrap().indirect, 1);
        assert_eq!(cache.item(&"b".into()).unwrap().indirect, 1);
    }

    #[test]
    fn unsubscribe_collapses_cycles() {
        let mut cache = cache();
        let _a = subscribe(
            &mut cache,
            "a",
            json!({"models": {"a": {"next": {"rid": "b"}}, "b": {"next": {"rid": "a"}}}}),
        );

        cache.handle_event("a.unsubscribe", None).unwrap();
        assert!(cache.item(&"a".into()).is_none());
        assert!(cache.item(&"b".into()).is_none());
    }

    #[test]
    fn remove_and_readd_of_same_reference_nets_zero() {
        let mut cache = cache();
        let _p = subscribe(
            &mut cache,
            "p",
            json!({"models": {"p": {"a": {"rid": "c"}, "b": 5}, "c": {"v": 1}}}),
        );
        assert_eq!(cache.item(&"c".into()).unwrap().indirect, 1);

        // the reference moves from field a to field b in one change
        event(
            &mut cache,
            "p",
            "change",
            json!({"values": {"a": {"action": "delete"}, "b": {"rid": "c"}}}),
        );
        let item = cache.item(&"c".into()).unwrap();
        assert_eq!(item.indirect, 1);
    }

    #[test]
    fn type_inconsistency_is_skipped() {
        let mut cache = cache();
        let p = subscribe(&mut cache, "p", json!({"models": {"p": {"v": 1}}}));

        // the same RID arriving as a collection is a protocol violation;
        // the materialization is skipped and the model stands
        cache.materialize(bundle(json!({"collections": {"p": [1, 2]}})));
        let item = cache.item(&"p".into()).unwrap();
        assert_eq!(item.kind, Some(ResourceKind::Model));
        assert!(item.resource.as_ref().unwrap().same_resource(&p));
    }

    #[test]
    fn error_entries_become_error_resources() {
        let mut cache = cache();
        let l = subscribe(
            &mut cache,
            "l",
            json!({
                "collections": {"l": [{"rid": "gone"}]},
                "errors": {"gone": {"code": "system.notFound", "message": "Not found"}}
            }),
        );
        let first = l.as_collection().unwrap().get(0).unwrap();
        let err = first.as_resource().unwrap().as_error().unwrap().error().clone();
        assert_eq!(err.code, "system.notFound");
        assert_eq!(cache.item(&"gone".into()).unwrap().indirect, 1);
    }

    #[test]
    fn subscribe_error_for_requested_rid_rejects_and_evicts() {
        let mut cache = cache();
        let (tx, mut rx) = oneshot::channel();
        assert!(cache.get_or_fetch(&"x".into(), tx));
        cache.handle_subscribe_response(
            &"x".into(),
            bundle(json!({"errors": {"x": {"code": "access.denied", "message": "no"}}})),
        );
        let err = rx.try_recv().unwrap().unwrap().unwrap_err();
        assert!(err.is_code("access.denied"));
        assert!(cache.item(&"x".into()).is_none());
    }

    #[test]
    fn collection_add_and_remove_adjust_references() {
        let mut cache = cache();
        let l = subscribe(
            &mut cache,
            "l",
            json!({"collections": {"l": [1, {"rid": "m"}]}, "models": {"m": {"v": 1}}}),
        );
        assert_eq!(cache.item(&"m".into()).unwrap().indirect, 1);

        event(&mut cache, "l", "remove", json!({"idx": 1}));
        assert_eq!(l.as_collection().unwrap().len(), 1);
        // the reference was the only anchor
        assert!(cache.item(&"m".into()).is_none());

        event(&mut cache, "l", "add", json!({"value": 2, "idx": 1}));
        assert_eq!(l.as_collection().unwrap().items().len(), 2);
        assert_eq!(l.as_collection().unwrap().get(1).unwrap(), Value::Data(json!(2)));
    }

    #[test]
    fn events_for_unknown_resources_are_protocol_errors() {
        let mut cache = cache();
        assert!(matches!(
            cache.handle_event("ghost.change", None),
            Err(ClientError::Protocol(_))
        ));
        assert!(matches!(cache.handle_event("nodot", None), Err(ClientError::Protocol(_))));
    }
}
