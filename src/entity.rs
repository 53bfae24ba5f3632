/// Entity, metadata and collection types.
///
/// An entity is a JSON object with a string `id`. Entities that have been
/// synchronized with the backend carry a `metadata` object whose
/// `lastModifiedAt` string is the sole staleness comparator used by the
/// delta-set reconciler.
use crate::error::{CacheError, CacheResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;

/// Field holding the entity identifier.
pub const ID_FIELD: &str = "id";

/// Field holding server-stamped metadata.
pub const METADATA_FIELD: &str = "metadata";

/// Server-stamped metadata of a synchronized entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    /// When the entity was first created server-side.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    /// Last server-side modification, compared verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified_at: Option<String>,
    /// Per-entity auth token (user entities only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

/// A JSON document with a unique `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Entity(Map<String, JsonValue>);

impl Entity {
    /// Wrap a JSON value. Fails unless the value is an object.
    pub fn from_json(value: JsonValue) -> CacheResult<Self> {
        match value {
            JsonValue::Object(map) => Ok(Self(map)),
            other => Err(CacheError::InvalidArgument(format!(
                "entity must be a JSON object, got {}",
                json_type_name(&other)
            ))),
        }
    }

    /// Wrap an already-parsed JSON object.
    pub fn from_map(map: Map<String, JsonValue>) -> Self {
        Self(map)
    }

    /// Create an entity with only an id.
    pub fn with_id(id: impl Into<String>) -> Self {
        let mut map = Map::new();
        map.insert(ID_FIELD.to_string(), JsonValue::String(id.into()));
        Self(map)
    }

    /// The entity id, if present and a string.
    pub fn id(&self) -> Option<&str> {
        self.0.get(ID_FIELD).and_then(JsonValue::as_str)
    }

    /// Set the id field.
    pub fn set_id(&mut self, id: impl Into<String>) {
        self.0
            .insert(ID_FIELD.to_string(), JsonValue::String(id.into()));
    }

    /// Assign a generated id when none is present and return the id.
    pub fn ensure_id(&mut self) -> String {
        if let Some(id) = self.id() {
            return id.to_string();
        }
        let id = uuid::Uuid::new_v4().simple().to_string();
        self.set_id(id.clone());
        id
    }

    /// Parsed metadata; `None` for local-only entities.
    pub fn metadata(&self) -> Option<Metadata> {
        self.0
            .get(METADATA_FIELD)
            .and_then(|m| serde_json::from_value(m.clone()).ok())
    }

    /// Replace the metadata object.
    pub fn set_metadata(&mut self, metadata: &Metadata) -> CacheResult<()> {
        self.0
            .insert(METADATA_FIELD.to_string(), serde_json::to_value(metadata)?);
        Ok(())
    }

    /// The `metadata.lastModifiedAt` string, read without reparsing.
    pub fn last_modified_at(&self) -> Option<&str> {
        self.0
            .get(METADATA_FIELD)?
            .get("lastModifiedAt")?
            .as_str()
    }

    /// True when the entity has never been synchronized.
    pub fn is_local_only(&self) -> bool {
        !self.0.contains_key(METADATA_FIELD)
    }

    /// Read a top-level field.
    pub fn get(&self, field: &str) -> Option<&JsonValue> {
        self.0.get(field)
    }

    /// Write a top-level field.
    pub fn insert(&mut self, field: impl Into<String>, value: JsonValue) {
        self.0.insert(field.into(), value);
    }

    /// Borrow the entity as a JSON value view.
    pub fn as_map(&self) -> &Map<String, JsonValue> {
        &self.0
    }

    /// Clone into a `serde_json::Value`.
    pub fn to_json(&self) -> JsonValue {
        JsonValue::Object(self.0.clone())
    }

    /// Consume into a `serde_json::Value`.
    pub fn into_json(self) -> JsonValue {
        JsonValue::Object(self.0)
    }
}

impl From<Entity> for JsonValue {
    fn from(entity: Entity) -> Self {
        entity.into_json()
    }
}

impl TryFrom<JsonValue> for Entity {
    type Error = CacheError;

    fn try_from(value: JsonValue) -> CacheResult<Self> {
        Entity::from_json(value)
    }
}

/// Parse a JSON object or array of objects into entities.
pub fn entities_from_json(value: JsonValue) -> CacheResult<Vec<Entity>> {
    match value {
        JsonValue::Array(items) => items.into_iter().map(Entity::from_json).collect(),
        JsonValue::Null => Ok(Vec::new()),
        other => Ok(vec![Entity::from_json(other)?]),
    }
}

/// Convert entities back into a JSON array.
pub fn entities_to_json(entities: &[Entity]) -> JsonValue {
    JsonValue::Array(entities.iter().map(Entity::to_json).collect())
}

fn json_type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

/// Validate a collection or database name.
pub fn validate_name(kind: &str, name: &str) -> CacheResult<()> {
    if name.trim().is_empty() {
        return Err(CacheError::InvalidArgument(format!(
            "{} name must be a non-empty string",
            kind
        )));
    }
    Ok(())
}

/// An insertion-ordered set of entities keyed by id.
///
/// Upserting an existing id keeps its position; new ids append. Removal is
/// O(n) because positions after the removed slot shift.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<Entity>", into = "Vec<Entity>")]
pub struct Collection {
    entities: Vec<Entity>,
    index: HashMap<String, usize>,
}

impl Collection {
    /// Create an empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entities.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// True when empty.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Look up by id.
    pub fn get(&self, id: &str) -> Option<&Entity> {
        self.index.get(id).map(|&pos| &self.entities[pos])
    }

    /// Insert or replace by id. Entities without an id get one generated.
    pub fn upsert(&mut self, mut entity: Entity) -> Entity {
        let id = entity.ensure_id();
        match self.index.get(&id) {
            Some(&pos) => self.entities[pos] = entity.clone(),
            None => {
                self.index.insert(id, self.entities.len());
                self.entities.push(entity.clone());
            }
        }
        entity
    }

    /// Remove by id.
    pub fn remove(&mut self, id: &str) -> Option<Entity> {
        let pos = self.index.remove(id)?;
        let removed = self.entities.remove(pos);
        for slot in self.index.values_mut() {
            if *slot > pos {
                *slot -= 1;
            }
        }
        Some(removed)
    }

    /// Entities in insertion order.
    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    /// Consume into entities in insertion order.
    pub fn into_entities(self) -> Vec<Entity> {
        self.entities
    }
}

impl From<Vec<Entity>> for Collection {
    fn from(entities: Vec<Entity>) -> Self {
        let mut collection = Collection::new();
        for entity in entities {
            collection.upsert(entity);
        }
        collection
    }
}

impl From<Collection> for Vec<Entity> {
    fn from(collection: Collection) -> Self {
        collection.entities
    }
}
