//! Instance model: entities, relationships and classifications, with the
//! provenance metadata that decides which collection may mutate them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Globally unique, immutable instance identifier.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceGuid(Uuid);

impl InstanceGuid {
    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        InstanceGuid(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    pub fn from_uuid(id: Uuid) -> Self {
        InstanceGuid(id)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for InstanceGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a metadata collection, one per cohort member.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MetadataCollectionId(String);

impl MetadataCollectionId {
    /// Creates a collection id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        MetadataCollectionId(id.into())
    }

    /// Returns the raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MetadataCollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How and where an instance originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceProvenance {
    /// Owned by this repository, not shared.
    Local,
    /// Owned by this repository and visible cohort-wide.
    LocalCohort,
    /// Owned by a technology outside the cohort.
    ExternalSource,
    /// Owned elsewhere, cached here.
    ReplicatedReferenceCopy,
}

impl InstanceProvenance {
    /// True for the two provenances that denote the authoritative copy.
    pub fn is_home_owned(&self) -> bool {
        matches!(self, Self::Local | Self::LocalCohort)
    }

    /// Provenance an instance takes on when cached by a non-owning member.
    pub fn as_reference_copy(&self) -> Self {
        match self {
            Self::Local | Self::LocalCohort | Self::ReplicatedReferenceCopy => {
                Self::ReplicatedReferenceCopy
            }
            Self::ExternalSource => Self::ExternalSource,
        }
    }
}

/// Lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Live and returned by searches.
    Active,
    /// Soft-deleted; retained and restorable until purged.
    Deleted,
    /// Removed for good.
    Purged,
}

/// Primitive property values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PrimitiveValue {
    /// Boolean.
    Boolean(bool),
    /// 32-bit integer.
    Int(i32),
    /// 64-bit integer.
    Long(i64),
    /// Double precision float.
    Float(f64),
    /// UTF-8 string.
    String(String),
    /// Milliseconds since the Unix epoch.
    Date(i64),
}

/// Category of a property value; used by type definitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyCategory {
    /// A primitive value.
    Primitive,
    /// An enum value.
    Enum,
    /// A nested map of properties.
    Map,
    /// An array of values.
    Array,
}

/// A typed property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InstancePropertyValue {
    /// Primitive value.
    Primitive(PrimitiveValue),
    /// Enumerated value.
    Enum {
        /// Ordinal within the enum definition.
        ordinal: u32,
        /// Symbolic name of the element.
        symbolic_name: String,
    },
    /// Nested property map.
    Map(InstanceProperties),
    /// Ordered array of values.
    Array(Vec<InstancePropertyValue>),
}

impl InstancePropertyValue {
    /// Shorthand for a string primitive.
    pub fn string(value: impl Into<String>) -> Self {
        Self::Primitive(PrimitiveValue::String(value.into()))
    }

    /// Shorthand for an int primitive.
    pub fn int(value: i32) -> Self {
        Self::Primitive(PrimitiveValue::Int(value))
    }

    /// Shorthand for a boolean primitive.
    pub fn boolean(value: bool) -> Self {
        Self::Primitive(PrimitiveValue::Boolean(value))
    }

    /// Returns the category of this value.
    pub fn category(&self) -> PropertyCategory {
        match self {
            Self::Primitive(_) => PropertyCategory::Primitive,
            Self::Enum { .. } => PropertyCategory::Enum,
            Self::Map(_) => PropertyCategory::Map,
            Self::Array(_) => PropertyCategory::Array,
        }
    }
}

/// Ordered mapping of property name to value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InstanceProperties(BTreeMap<String, InstancePropertyValue>);

impl InstanceProperties {
    /// Creates an empty property map.
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: InstancePropertyValue) -> Self {
        self.0.insert(name.into(), value);
        self
    }

    /// Inserts or replaces a property, returning the old value.
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        value: InstancePropertyValue,
    ) -> Option<InstancePropertyValue> {
        self.0.insert(name.into(), value)
    }

    /// Looks up a property by name.
    pub fn get(&self, name: &str) -> Option<&InstancePropertyValue> {
        self.0.get(name)
    }

    /// Iterates properties in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &InstancePropertyValue)> {
        self.0.iter()
    }

    /// Number of properties.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if there are no properties.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Reference to a shared type definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceType {
    /// Type definition GUID.
    pub type_guid: String,
    /// Type definition name.
    pub type_name: String,
}

/// Fields common to entities and relationships.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceHeader {
    /// Instance identifier.
    pub guid: InstanceGuid,
    /// Type of the instance.
    pub instance_type: InstanceType,
    /// Incremented on every home-side mutation; starts at 1.
    pub version: u64,
    /// Origin of the instance.
    pub provenance: InstanceProvenance,
    /// Owning metadata collection.
    pub home_metadata_collection_id: MetadataCollectionId,
    /// Member holding this copy, when it is a reference copy.
    pub replicated_by: Option<MetadataCollectionId>,
    /// Lifecycle state.
    pub status: InstanceStatus,
    /// User that created the instance.
    pub created_by: String,
    /// User that last updated the instance.
    pub updated_by: Option<String>,
    /// Creation time (microseconds since epoch).
    pub create_time_us: u64,
    /// Last update time (microseconds since epoch).
    pub update_time_us: Option<u64>,
}

impl InstanceHeader {
    /// Header for a brand new instance homed in `home`.
    pub fn new(
        instance_type: InstanceType,
        home: MetadataCollectionId,
        provenance: InstanceProvenance,
        user_id: &str,
    ) -> Self {
        Self {
            guid: InstanceGuid::generate(),
            instance_type,
            version: 1,
            provenance,
            home_metadata_collection_id: home,
            replicated_by: None,
            status: InstanceStatus::Active,
            created_by: user_id.to_string(),
            updated_by: None,
            create_time_us: current_time_us(),
            update_time_us: None,
        }
    }

    /// True if `collection` is the home of this instance.
    pub fn is_homed_in(&self, collection: &MetadataCollectionId) -> bool {
        &self.home_metadata_collection_id == collection
    }

    /// Bump the version and stamp the updating user.
    pub fn touch(&mut self, user_id: &str) {
        self.version += 1;
        self.updated_by = Some(user_id.to_string());
        self.update_time_us = Some(current_time_us());
    }

    /// Rewrite provenance for a copy cached by `holder`.
    pub fn mark_reference_copy(&mut self, holder: &MetadataCollectionId) {
        self.provenance = self.provenance.as_reference_copy();
        self.replicated_by = Some(holder.clone());
    }
}

/// Total order over the states a classification passes through.
///
/// `generation` grows each time the classification is re-created after a
/// declassify, `version` restarts at 1 within a generation, and a removal
/// sorts after the last live version of its generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClassificationKey {
    /// Incarnation of the classification on its entity.
    pub generation: u64,
    /// Version within the generation.
    pub version: u64,
    /// True once the classification has been declassified.
    pub removed: bool,
}

/// A named, versioned tag with properties attached to an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    /// Classification type.
    pub instance_type: InstanceType,
    /// Classification properties.
    pub properties: InstanceProperties,
    /// Version within the current generation; starts at 1.
    pub version: u64,
    /// Incarnation counter, see [`ClassificationKey`].
    pub generation: u64,
    /// Origin of the classification.
    pub provenance: InstanceProvenance,
    /// Collection that owns the classification; may differ from the entity's.
    pub home_metadata_collection_id: MetadataCollectionId,
    /// Member holding this copy, when it is a reference copy.
    pub replicated_by: Option<MetadataCollectionId>,
    /// User that classified the entity.
    pub created_by: String,
    /// User that last reclassified the entity.
    pub updated_by: Option<String>,
    /// Classification time (microseconds since epoch).
    pub create_time_us: u64,
    /// Last reclassification time (microseconds since epoch).
    pub update_time_us: Option<u64>,
}

impl Classification {
    /// Version 1 of a classification homed in `home`.
    pub fn new(
        instance_type: InstanceType,
        properties: InstanceProperties,
        home: MetadataCollectionId,
        generation: u64,
        user_id: &str,
    ) -> Self {
        Self {
            instance_type,
            properties,
            version: 1,
            generation,
            provenance: InstanceProvenance::LocalCohort,
            home_metadata_collection_id: home,
            replicated_by: None,
            created_by: user_id.to_string(),
            updated_by: None,
            create_time_us: current_time_us(),
            update_time_us: None,
        }
    }

    /// Classification type name.
    pub fn name(&self) -> &str {
        &self.instance_type.type_name
    }

    /// Ordering key of this live classification.
    pub fn key(&self) -> ClassificationKey {
        ClassificationKey {
            generation: self.generation,
            version: self.version,
            removed: false,
        }
    }

    /// Ordering key of the removal of this classification.
    pub fn removal_key(&self) -> ClassificationKey {
        ClassificationKey {
            removed: true,
            ..self.key()
        }
    }

    /// Next version within the same generation, with new properties.
    pub fn reclassified(&self, properties: InstanceProperties, user_id: &str) -> Self {
        Self {
            properties,
            version: self.version + 1,
            updated_by: Some(user_id.to_string()),
            update_time_us: Some(current_time_us()),
            ..self.clone()
        }
    }

    /// True if `collection` is the home of this classification.
    pub fn is_homed_in(&self, collection: &MetadataCollectionId) -> bool {
        &self.home_metadata_collection_id == collection
    }

    /// Rewrite provenance for a copy cached by `holder`.
    pub fn mark_reference_copy(&mut self, holder: &MetadataCollectionId) {
        self.provenance = self.provenance.as_reference_copy();
        self.replicated_by = Some(holder.clone());
    }
}

/// An entity together with its properties and classifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDetail {
    /// Common instance fields.
    pub header: InstanceHeader,
    /// Entity properties.
    pub properties: InstanceProperties,
    /// Attached classifications, sorted by name.
    pub classifications: Vec<Classification>,
}

impl EntityDetail {
    /// A new active entity at version 1.
    pub fn new(header: InstanceHeader, properties: InstanceProperties) -> Self {
        Self {
            header,
            properties,
            classifications: Vec::new(),
        }
    }

    /// Entity identifier.
    pub fn guid(&self) -> InstanceGuid {
        self.header.guid
    }

    /// Looks up an attached classification by type name.
    pub fn classification(&self, name: &str) -> Option<&Classification> {
        self.classifications.iter().find(|c| c.name() == name)
    }

    /// Attach or replace a classification, keeping the list sorted by name.
    pub fn upsert_classification(&mut self, classification: Classification) {
        match self
            .classifications
            .binary_search_by(|c| c.name().cmp(classification.name()))
        {
            Ok(idx) => self.classifications[idx] = classification,
            Err(idx) => self.classifications.insert(idx, classification),
        }
    }

    /// Detach a classification, returning it if it was attached.
    pub fn remove_classification(&mut self, name: &str) -> Option<Classification> {
        let idx = self.classifications.iter().position(|c| c.name() == name)?;
        Some(self.classifications.remove(idx))
    }

    /// Proxy pointing at this entity, for relationship ends.
    pub fn proxy(&self) -> EntityProxy {
        EntityProxy {
            guid: self.header.guid,
            type_name: self.header.instance_type.type_name.clone(),
            home_metadata_collection_id: self.header.home_metadata_collection_id.clone(),
        }
    }
}

/// Minimal reference to an entity at one end of a relationship.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityProxy {
    /// Entity identifier.
    pub guid: InstanceGuid,
    /// Entity type name.
    pub type_name: String,
    /// Home of the entity.
    pub home_metadata_collection_id: MetadataCollectionId,
}

/// A typed link between two entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    /// Common instance fields.
    pub header: InstanceHeader,
    /// Relationship properties.
    pub properties: InstanceProperties,
    /// First end.
    pub end_one: EntityProxy,
    /// Second end.
    pub end_two: EntityProxy,
}

/// A top-level instance as carried by instance events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Instance {
    /// An entity with its classifications.
    Entity(EntityDetail),
    /// A relationship.
    Relationship(Relationship),
}

impl Instance {
    /// Header of the wrapped instance.
    pub fn header(&self) -> &InstanceHeader {
        match self {
            Self::Entity(e) => &e.header,
            Self::Relationship(r) => &r.header,
        }
    }

    /// Mutable header of the wrapped instance.
    pub fn header_mut(&mut self) -> &mut InstanceHeader {
        match self {
            Self::Entity(e) => &mut e.header,
            Self::Relationship(r) => &mut r.header,
        }
    }

    /// Instance identifier.
    pub fn guid(&self) -> InstanceGuid {
        self.header().guid
    }

    /// Instance version.
    pub fn version(&self) -> u64 {
        self.header().version
    }

    /// The wrapped entity, if any.
    pub fn as_entity(&self) -> Option<&EntityDetail> {
        match self {
            Self::Entity(e) => Some(e),
            Self::Relationship(_) => None,
        }
    }

    /// The wrapped relationship, if any.
    pub fn as_relationship(&self) -> Option<&Relationship> {
        match self {
            Self::Entity(_) => None,
            Self::Relationship(r) => Some(r),
        }
    }
}

/// Get current time in microseconds since Unix epoch.
pub(crate) fn current_time_us() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}
