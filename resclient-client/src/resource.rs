use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, RwLock},
};

use resclient_core::{ResError, Rid};

/// A value held by a model field or a collection slot.
#[derive(Clone, Debug)]
pub enum Value {
    /// Plain JSON data.
    Data(serde_json::Value),
    /// A materialized reference to another cached resource.
    Resource(Resource),
}

impl Value {
    /// The value as plain JSON data, if it is not a resource.
    pub fn as_data(&self) -> Option<&serde_json::Value> {
        match self {
            Value::Data(v) => Some(v),
            Value::Resource(_) => None,
        }
    }

    /// The value as a resource handle.
    pub fn as_resource(&self) -> Option<&Resource> {
        match self {
            Value::Resource(r) => Some(r),
            Value::Data(_) => None,
        }
    }

    /// The RID of the referenced resource, if the value is one.
    pub fn resource_rid(&self) -> Option<&Rid> {
        self.as_resource().map(Resource::rid)
    }
}

// Data compares by JSON equality, resources by cache identity.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Data(a), Value::Data(b)) => a == b,
            (Value::Resource(a), Value::Resource(b)) => a.same_resource(b),
            _ => false,
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Data(v)
    }
}

/// The resource kinds defined by the protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceKind {
    /// A key/value model.
    Model,
    /// An ordered collection.
    Collection,
    /// An error standing in for a resource the server could not provide.
    Error,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResourceKind::Model => "model",
            ResourceKind::Collection => "collection",
            ResourceKind::Error => "error",
        })
    }
}

/// A materialized resource handle.
///
/// Handles are cheap to clone and identity-stable: every holder of a
/// handle for a given cached resource observes the same underlying
/// object until the cache evicts it.
#[derive(Clone, Debug)]
pub enum Resource {
    /// A model resource.
    Model(Model),
    /// A collection resource.
    Collection(Collection),
    /// An error resource.
    Error(ResourceError),
}

impl Resource {
    /// The resource identifier.
    pub fn rid(&self) -> &Rid {
        match self {
            Resource::Model(m) => m.rid(),
            Resource::Collection(c) => c.rid(),
            Resource::Error(e) => e.rid(),
        }
    }

    /// The resource kind.
    pub fn kind(&self) -> ResourceKind {
        match self {
            Resource::Model(_) => ResourceKind::Model,
            Resource::Collection(_) => ResourceKind::Collection,
            Resource::Error(_) => ResourceKind::Error,
        }
    }

    /// The resource as a model handle.
    pub fn as_model(&self) -> Option<&Model> {
        match self {
            Resource::Model(m) => Some(m),
            _ => None,
        }
    }

    /// The resource as a collection handle.
    pub fn as_collection(&self) -> Option<&Collection> {
        match self {
            Resource::Collection(c) => Some(c),
            _ => None,
        }
    }

    /// The resource as an error resource.
    pub fn as_error(&self) -> Option<&ResourceError> {
        match self {
            Resource::Error(e) => Some(e),
            _ => None,
        }
    }

    /// True if both handles refer to the same cached object.
    pub fn same_resource(&self, other: &Resource) -> bool {
        match (self, other) {
            (Resource::Model(a), Resource::Model(b)) => Arc::ptr_eq(&a.inner, &b.inner),
            (Resource::Collection(a), Resource::Collection(b)) => Arc::ptr_eq(&a.inner, &b.inner),
            (Resource::Error(a), Resource::Error(b)) => Arc::ptr_eq(&a.inner, &b.inner),
            _ => false,
        }
    }

    /// RIDs of the resources this resource currently references.
    pub fn refs(&self) -> Vec<Rid> {
        match self {
            Resource::Model(m) => m
                .inner
                .fields
                .read()
                .unwrap()
                .values()
                .filter_map(|v| v.resource_rid().cloned())
                .collect(),
            Resource::Collection(c) => c
                .inner
                .items
                .read()
                .unwrap()
                .iter()
                .filter_map(|v| v.resource_rid().cloned())
                .collect(),
            Resource::Error(_) => Vec::new(),
        }
    }

    // Severs every outbound edge, returning the dropped values. Run on
    // eviction; also breaks Arc cycles so cyclic graphs are freed.
    pub(crate) fn drain(&self) -> Vec<Value> {
        match self {
            Resource::Model(m) => {
                let mut fields = m.inner.fields.write().unwrap();
                fields.drain().map(|(_, v)| v).collect()
            }
            Resource::Collection(c) => {
                let mut items = c.inner.items.write().unwrap();
                items.drain(..).collect()
            }
            Resource::Error(_) => Vec::new(),
        }
    }
}

/// A change applied to one model field.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum FieldChange {
    /// Set the field to the value.
    Set(Value),
    /// Remove the field.
    Delete,
}

/// A key/value model resource.
#[derive(Clone)]
pub struct Model {
    inner: Arc<ModelInner>,
}

struct ModelInner {
    rid: Rid,
    fields: RwLock<HashMap<String, Value>>,
}

impl Model {
    /// Creates an empty model for the RID. Used by type factories; the
    /// cache populates it on materialization.
    pub fn new(rid: Rid) -> Self {
        Self { inner: Arc::new(ModelInner { rid, fields: RwLock::new(HashMap::new()) }) }
    }

    /// The resource identifier.
    pub fn rid(&self) -> &Rid {
        &self.inner.rid
    }

    /// The current value of a field.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.fields.read().unwrap().get(key).cloned()
    }

    /// True if the field is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.fields.read().unwrap().contains_key(key)
    }

    /// A snapshot of all fields.
    pub fn fields(&self) -> HashMap<String, Value> {
        self.inner.fields.read().unwrap().clone()
    }

    /// The current field names.
    pub fn keys(&self) -> Vec<String> {
        self.inner.fields.read().unwrap().keys().cloned().collect()
    }

    // Initial population. No diffing, no events.
    pub(crate) fn init(&self, fields: HashMap<String, Value>) {
        *self.inner.fields.write().unwrap() = fields;
    }

    // Applies prepared changes and returns the previous values of the
    // keys that actually changed (`None` = key was absent). Returns
    // `None` when nothing changed.
    pub(crate) fn update(
        &self,
        changes: &HashMap<String, FieldChange>,
    ) -> Option<HashMap<String, Option<Value>>> {
        let mut fields = self.inner.fields.write().unwrap();
        let mut old: HashMap<String, Option<Value>> = HashMap::new();
        for (key, change) in changes {
            match change {
                FieldChange::Set(value) => match fields.get(key) {
                    Some(current) if current == value => {}
                    current => {
                        old.insert(key.clone(), current.cloned());
                        fields.insert(key.clone(), value.clone());
                    }
                },
                FieldChange::Delete => {
                    if let Some(prev) = fields.remove(key) {
                        old.insert(key.clone(), Some(prev));
                    }
                }
            }
        }
        if old.is_empty() {
            None
        } else {
            Some(old)
        }
    }
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model").field("rid", &self.inner.rid).finish_non_exhaustive()
    }
}

/// An ordered collection resource.
#[derive(Clone)]
pub struct Collection {
    inner: Arc<CollectionInner>,
}

struct CollectionInner {
    rid: Rid,
    items: RwLock<Vec<Value>>,
}

impl Collection {
    /// Creates an empty collection for the RID. Used by type factories;
    /// the cache populates it on materialization.
    pub fn new(rid: Rid) -> Self {
        Self { inner: Arc::new(CollectionInner { rid, items: RwLock::new(Vec::new()) }) }
    }

    /// The resource identifier.
    pub fn rid(&self) -> &Rid {
        &self.inner.rid
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.inner.items.read().unwrap().len()
    }

    /// True if the collection has no elements.
    pub fn is_empty(&self) -> bool {
        self.inner.items.read().unwrap().is_empty()
    }

    /// The element at `idx`.
    pub fn get(&self, idx: usize) -> Option<Value> {
        self.inner.items.read().unwrap().get(idx).cloned()
    }

    /// A snapshot of all elements.
    pub fn items(&self) -> Vec<Value> {
        self.inner.items.read().unwrap().clone()
    }

    // Initial population. No events.
    pub(crate) fn init(&self, items: Vec<Value>) {
        *self.inner.items.write().unwrap() = items;
    }

    // Inserts at `idx`. The caller has validated `idx <= len`.
    pub(crate) fn insert(&self, idx: usize, value: Value) {
        self.inner.items.write().unwrap().insert(idx, value);
    }

    // Removes the element at `idx`, if in range.
    pub(crate) fn remove(&self, idx: usize) -> Option<Value> {
        let mut items = self.inner.items.write().unwrap();
        if idx < items.len() {
            Some(items.remove(idx))
        } else {
            None
        }
    }
}

impl fmt::Debug for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection").field("rid", &self.inner.rid).finish_non_exhaustive()
    }
}

/// An error resource: the server answered a resource request with an
/// error object, cached in place of the resource.
#[derive(Clone)]
pub struct ResourceError {
    inner: Arc<ResourceErrorInner>,
}

struct ResourceErrorInner {
    rid: Rid,
    error: ResError,
}

impl ResourceError {
    pub(crate) fn new(rid: Rid, error: ResError) -> Self {
        Self { inner: Arc::new(ResourceErrorInner { rid, error }) }
    }

    /// The resource identifier.
    pub fn rid(&self) -> &Rid {
        &self.inner.rid
    }

    /// The error object.
    pub fn error(&self) -> &ResError {
        &self.inner.error
    }
}

impl fmt::Debug for ResourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceError")
            .field("rid", &self.inner.rid)
            .field("error", &self.inner.error)
            .finish()
    }
}
