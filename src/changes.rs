/// Change events from the source database and their resolution into view
/// mutations.
///
/// The change listener reports raw events:
///
/// - **Data events**: `insert`, `update`, `replace`, `delete`
/// - **Namespace events**: `drop`, `dropDatabase`
/// - **Stream events**: `invalidate`
///
/// Update and delete events may lack the previous version of the document.
/// [`DocumentShadow`] remembers the last-seen version of each document so the
/// delete half of an update can still be applied.
use crate::error::CacheResult;
use crate::types::{Namespace, canonical_key, get_path, remove_path, set_path};
use crate::views::MaterializedView;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue, json};

/// Kind of change reported by the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationType {
    /// A new document was inserted.
    Insert,
    /// Some fields of a document changed.
    Update,
    /// A document was replaced wholesale.
    Replace,
    /// A document was deleted.
    Delete,
    /// The collection was dropped.
    Drop,
    /// The database was dropped.
    DropDatabase,
    /// The change stream can no longer be trusted.
    Invalidate,
}

impl OperationType {
    /// Whether the event touches a single document.
    pub fn is_data_change(&self) -> bool {
        matches!(
            self,
            OperationType::Insert
                | OperationType::Update
                | OperationType::Replace
                | OperationType::Delete
        )
    }
}

/// Field-level delta carried by `update` events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDescription {
    /// Dotted path → new value.
    #[serde(default)]
    pub updated_fields: Map<String, JsonValue>,
    /// Dotted paths that were unset.
    #[serde(default)]
    pub removed_fields: Vec<String>,
}

impl UpdateDescription {
    /// Set one field.
    pub fn set(mut self, path: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.updated_fields.insert(path.into(), value.into());
        self
    }

    /// Unset one field.
    pub fn unset(mut self, path: impl Into<String>) -> Self {
        self.removed_fields.push(path.into());
        self
    }

    /// The document that results from applying this delta to `base`.
    pub fn apply(&self, base: &JsonValue) -> JsonValue {
        let mut doc = base.clone();
        for (path, value) in &self.updated_fields {
            set_path(&mut doc, path, value.clone());
        }
        for path in &self.removed_fields {
            remove_path(&mut doc, path);
        }
        doc
    }
}

/// A change event as delivered by the change listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    /// What happened.
    pub operation_type: OperationType,
    /// Where it happened. Empty for `invalidate`.
    #[serde(default)]
    pub ns: Namespace,
    /// Identity of the document, usually `{"_id": ...}`.
    #[serde(default)]
    pub document_key: JsonValue,
    /// Post-image, present for inserts and replaces (and optionally updates).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_document: Option<JsonValue>,
    /// Pre-image, when the source is configured to report it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_document_before_change: Option<JsonValue>,
    /// Field delta for updates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_description: Option<UpdateDescription>,
}

impl ChangeEvent {
    fn new(operation_type: OperationType, ns: Namespace, document_key: JsonValue) -> Self {
        Self {
            operation_type,
            ns,
            document_key,
            full_document: None,
            full_document_before_change: None,
            update_description: None,
        }
    }

    /// An insert of `doc`; the key is taken from its `_id`.
    pub fn insert(ns: Namespace, doc: JsonValue) -> Self {
        let key = key_of(&doc);
        let mut event = Self::new(OperationType::Insert, ns, key);
        event.full_document = Some(doc);
        event
    }

    /// A field-level update of the document with `_id == id`.
    pub fn update(ns: Namespace, id: impl Into<JsonValue>, description: UpdateDescription) -> Self {
        let id: JsonValue = id.into();
        let mut event = Self::new(OperationType::Update, ns, json!({"_id": id}));
        event.update_description = Some(description);
        event
    }

    /// A wholesale replacement by `doc`.
    pub fn replace(ns: Namespace, doc: JsonValue) -> Self {
        let key = key_of(&doc);
        let mut event = Self::new(OperationType::Replace, ns, key);
        event.full_document = Some(doc);
        event
    }

    /// A delete of the document with `_id == id`.
    pub fn delete(ns: Namespace, id: impl Into<JsonValue>) -> Self {
        let id: JsonValue = id.into();
        Self::new(OperationType::Delete, ns, json!({"_id": id}))
    }

    /// The collection was dropped.
    pub fn drop_collection(ns: Namespace) -> Self {
        Self::new(OperationType::Drop, ns, JsonValue::Null)
    }

    /// The database was dropped.
    pub fn drop_database(db: impl Into<String>) -> Self {
        Self::new(
            OperationType::DropDatabase,
            Namespace::new(db, ""),
            JsonValue::Null,
        )
    }

    /// The stream was invalidated.
    pub fn invalidate() -> Self {
        Self::new(OperationType::Invalidate, Namespace::default(), JsonValue::Null)
    }

    /// Attach the pre-image.
    pub fn with_before(mut self, doc: JsonValue) -> Self {
        self.full_document_before_change = Some(doc);
        self
    }

    /// Attach the post-image.
    pub fn with_after(mut self, doc: JsonValue) -> Self {
        self.full_document = Some(doc);
        self
    }

    /// Stable key identifying the document, if the event carries one.
    pub fn shadow_key(&self) -> Option<String> {
        let id = get_path(&self.document_key, "_id")
            .or_else(|| (!self.document_key.is_null()).then_some(&self.document_key))
            .or_else(|| self.full_document.as_ref().and_then(|d| get_path(d, "_id")))
            .or_else(|| {
                self.full_document_before_change
                    .as_ref()
                    .and_then(|d| get_path(d, "_id"))
            })?;
        Some(canonical_key(Some(id)))
    }
}

fn key_of(doc: &JsonValue) -> JsonValue {
    match get_path(doc, "_id") {
        Some(id) => json!({"_id": id}),
        None => JsonValue::Null,
    }
}

/// Effect of one data event on the views of its namespace.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// A document entered the collection.
    Add(JsonValue),
    /// A document changed.
    Update { old: JsonValue, new: JsonValue },
    /// A document left the collection.
    Delete(JsonValue),
    /// The event cannot be applied; views must be rebuilt.
    Unresolvable(String),
}

impl Mutation {
    /// Apply to one view.
    pub fn apply_to(&self, view: &MaterializedView) -> CacheResult<()> {
        match self {
            Mutation::Add(doc) => view.add_document(doc),
            Mutation::Update { old, new } => view.update_document(old, new),
            Mutation::Delete(doc) => view.delete_document(doc),
            Mutation::Unresolvable(_) => Ok(()),
        }
    }

    /// Derive the mutation from an event and the last-seen version of its
    /// document. Returns the mutation and the version to remember next.
    pub fn resolve(
        event: &ChangeEvent,
        previous: Option<&JsonValue>,
    ) -> (Mutation, Option<JsonValue>) {
        let before = event
            .full_document_before_change
            .as_ref()
            .or(previous)
            .cloned();
        match event.operation_type {
            OperationType::Insert => match (&event.full_document, before) {
                (Some(doc), None) => (Mutation::Add(doc.clone()), Some(doc.clone())),
                // A second insert under a known key replaces the old version.
                (Some(doc), Some(old)) => (
                    Mutation::Update {
                        old,
                        new: doc.clone(),
                    },
                    Some(doc.clone()),
                ),
                (None, _) => (
                    Mutation::Unresolvable("insert without a document".to_string()),
                    None,
                ),
            },
            OperationType::Update | OperationType::Replace => {
                let after = event.full_document.clone().or_else(|| {
                    match (&before, &event.update_description) {
                        (Some(old), Some(delta)) => Some(delta.apply(old)),
                        _ => None,
                    }
                });
                match (before, after) {
                    (Some(old), Some(new)) => {
                        (Mutation::Update { old, new: new.clone() }, Some(new))
                    }
                    (None, after) => (
                        Mutation::Unresolvable(format!(
                            "{:?} of a document whose previous version is unknown",
                            event.operation_type
                        )),
                        after,
                    ),
                    (Some(_), None) => (
                        Mutation::Unresolvable("update without a document or delta".to_string()),
                        None,
                    ),
                }
            }
            OperationType::Delete => match before {
                Some(old) => (Mutation::Delete(old), None),
                None => (
                    Mutation::Unresolvable(
                        "delete of a document whose previous version is unknown".to_string(),
                    ),
                    None,
                ),
            },
            other => (
                Mutation::Unresolvable(format!("{other:?} is not a document event")),
                None,
            ),
        }
    }
}

/// Last-seen version of every document in the namespaces that have views.
#[derive(Debug, Default)]
pub struct DocumentShadow {
    docs: DashMap<(Namespace, String), JsonValue>,
}

impl DocumentShadow {
    /// Create an empty shadow.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of remembered documents.
    pub fn len(&self) -> usize {
        self.docs.len()
    }

    /// Whether nothing is remembered.
    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Last-seen version of a document.
    pub fn get(&self, ns: &Namespace, id: &JsonValue) -> Option<JsonValue> {
        self.docs
            .get(&(ns.clone(), canonical_key(Some(id))))
            .map(|d| d.value().clone())
    }

    /// Remember `docs` (keyed by `_id`) as the current contents of `ns`.
    /// Documents without an `_id` cannot be tracked and are skipped.
    pub fn seed<'a, I>(&self, ns: &Namespace, docs: I) -> usize
    where
        I: IntoIterator<Item = &'a JsonValue>,
    {
        let mut seeded = 0;
        for doc in docs {
            if let Some(id) = get_path(doc, "_id") {
                self.docs
                    .insert((ns.clone(), canonical_key(Some(id))), doc.clone());
                seeded += 1;
            }
        }
        seeded
    }

    /// Forget one collection.
    pub fn clear_namespace(&self, ns: &Namespace) {
        self.docs.retain(|(doc_ns, _), _| doc_ns != ns);
    }

    /// Forget every collection of a database.
    pub fn clear_database(&self, db: &str) {
        self.docs.retain(|(doc_ns, _), _| doc_ns.db != db);
    }

    /// Forget everything.
    pub fn clear(&self) {
        self.docs.clear();
    }

    /// Resolve `event` and hand the mutation to `apply` while holding the
    /// document's entry, so events for one document apply in order.
    pub fn process<F, T>(&self, event: &ChangeEvent, apply: F) -> T
    where
        F: FnOnce(&Mutation) -> T,
    {
        let Some(key) = event.shadow_key() else {
            let (mutation, _) = Mutation::resolve(event, None);
            return apply(&mutation);
        };

        match self.docs.entry((event.ns.clone(), key)) {
            Entry::Occupied(mut slot) => {
                let (mutation, next) = Mutation::resolve(event, Some(slot.get()));
                let result = apply(&mutation);
                match next {
                    Some(doc) => {
                        slot.insert(doc);
                    }
                    None => {
                        slot.remove();
                    }
                }
                result
            }
            Entry::Vacant(slot) => {
                let (mutation, next) = Mutation::resolve(event, None);
                let result = apply(&mutation);
                if let Some(doc) = next {
                    slot.insert(doc);
                }
                result
            }
        }
    }
}
