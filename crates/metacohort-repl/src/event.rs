//! Instance events and the envelope they travel in.
//!
//! Every event carries the full post-mutation instance, never a diff, so a
//! receiver can apply any single event without having seen the ones before.

use crate::error::{CohortError, Result};
use crate::instance::{
    current_time_us, Classification, EntityDetail, Instance, InstanceGuid, MetadataCollectionId,
    Relationship,
};
use crate::registry::MemberDescriptor;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of instance change an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceEventKind {
    /// Entity created.
    NewEntity,
    /// Entity properties or status changed.
    UpdatedEntity,
    /// Entity soft-deleted.
    DeletedEntity,
    /// Entity removed for good.
    PurgedEntity,
    /// Relationship created.
    NewRelationship,
    /// Relationship properties or status changed.
    UpdatedRelationship,
    /// Relationship soft-deleted.
    DeletedRelationship,
    /// Relationship removed for good.
    PurgedRelationship,
    /// Classification attached to an entity.
    NewClassification,
    /// Classification properties changed.
    ReclassifiedEntity,
    /// Classification removed from an entity.
    DeclassifiedEntity,
}

/// What a reference copy store does with an event of a given kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyAction {
    /// Create or replace the cached instance.
    Upsert,
    /// Keep the cached instance, marked deleted.
    MarkDeleted,
    /// Drop the cached instance.
    Purge,
    /// Attach or replace one classification.
    Classify,
    /// Detach one classification.
    Declassify,
}

impl InstanceEventKind {
    /// Every event kind, in declaration order.
    pub const ALL: [InstanceEventKind; 11] = [
        Self::NewEntity,
        Self::UpdatedEntity,
        Self::DeletedEntity,
        Self::PurgedEntity,
        Self::NewRelationship,
        Self::UpdatedRelationship,
        Self::DeletedRelationship,
        Self::PurgedRelationship,
        Self::NewClassification,
        Self::ReclassifiedEntity,
        Self::DeclassifiedEntity,
    ];

    /// True for kinds whose instance is a relationship.
    pub fn is_relationship(&self) -> bool {
        matches!(
            self,
            Self::NewRelationship
                | Self::UpdatedRelationship
                | Self::DeletedRelationship
                | Self::PurgedRelationship
        )
    }

    /// True for kinds that carry a classification.
    pub fn is_classification(&self) -> bool {
        matches!(
            self,
            Self::NewClassification | Self::ReclassifiedEntity | Self::DeclassifiedEntity
        )
    }

    /// How a reference copy store applies this kind.
    pub fn action(&self) -> ApplyAction {
        match self {
            Self::NewEntity
            | Self::UpdatedEntity
            | Self::NewRelationship
            | Self::UpdatedRelationship => ApplyAction::Upsert,
            Self::DeletedEntity | Self::DeletedRelationship => ApplyAction::MarkDeleted,
            Self::PurgedEntity | Self::PurgedRelationship => ApplyAction::Purge,
            Self::NewClassification | Self::ReclassifiedEntity => ApplyAction::Classify,
            Self::DeclassifiedEntity => ApplyAction::Declassify,
        }
    }
}

/// A notification describing a change that occurred at some member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceEvent {
    /// Unique id of this event.
    pub event_id: Uuid,
    /// What changed.
    pub kind: InstanceEventKind,
    /// Member that made the change.
    pub originator: MetadataCollectionId,
    /// Display name of the originator, for implicit registration.
    pub originator_name: String,
    /// Monotonic per-originator counter; diagnostics only, never ordering.
    pub sequence_hint: u64,
    /// When the event was emitted (microseconds since epoch).
    pub timestamp_us: u64,
    /// Full post-mutation instance.
    pub instance: Instance,
    /// The affected classification, for classification kinds.
    pub classification: Option<Classification>,
}

impl InstanceEvent {
    fn build(
        kind: InstanceEventKind,
        originator: &MetadataCollectionId,
        originator_name: &str,
        sequence_hint: u64,
        instance: Instance,
        classification: Option<Classification>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            kind,
            originator: originator.clone(),
            originator_name: originator_name.to_string(),
            sequence_hint,
            timestamp_us: current_time_us(),
            instance,
            classification,
        }
    }

    /// Event about an entity.
    pub fn entity(
        kind: InstanceEventKind,
        originator: &MetadataCollectionId,
        originator_name: &str,
        sequence_hint: u64,
        entity: EntityDetail,
    ) -> Self {
        Self::build(
            kind,
            originator,
            originator_name,
            sequence_hint,
            Instance::Entity(entity),
            None,
        )
    }

    /// Event about a relationship.
    pub fn relationship(
        kind: InstanceEventKind,
        originator: &MetadataCollectionId,
        originator_name: &str,
        sequence_hint: u64,
        relationship: Relationship,
    ) -> Self {
        Self::build(
            kind,
            originator,
            originator_name,
            sequence_hint,
            Instance::Relationship(relationship),
            None,
        )
    }

    /// Event about a classification of `entity`.
    pub fn classification(
        kind: InstanceEventKind,
        originator: &MetadataCollectionId,
        originator_name: &str,
        sequence_hint: u64,
        entity: EntityDetail,
        classification: Classification,
    ) -> Self {
        Self::build(
            kind,
            originator,
            originator_name,
            sequence_hint,
            Instance::Entity(entity),
            Some(classification),
        )
    }

    /// Id of the instance the event is about.
    pub fn instance_guid(&self) -> InstanceGuid {
        self.instance.guid()
    }

    /// Check that the payload matches the event kind.
    pub fn validate(&self) -> Result<()> {
        let payload_ok = match (&self.instance, self.kind.is_relationship()) {
            (Instance::Relationship(_), true) | (Instance::Entity(_), false) => true,
            _ => false,
        };
        if !payload_ok {
            return Err(CohortError::invalid(
                "apply_event",
                format!("{:?} event carries the wrong instance category", self.kind),
            ));
        }
        if self.kind.is_classification() != self.classification.is_some() {
            return Err(CohortError::invalid(
                "apply_event",
                format!("{:?} event classification payload mismatch", self.kind),
            ));
        }
        Ok(())
    }
}

/// Everything that travels on the cohort topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CohortMessage {
    /// A member announcing itself.
    Registration {
        /// The announcing member.
        member_id: MetadataCollectionId,
        /// Its descriptor.
        descriptor: MemberDescriptor,
        /// When the announcement was made (microseconds since epoch).
        timestamp_us: u64,
    },
    /// An instance change.
    Instance(InstanceEvent),
}

impl CohortMessage {
    /// Member that sent the message.
    pub fn sender(&self) -> &MetadataCollectionId {
        match self {
            Self::Registration { member_id, .. } => member_id,
            Self::Instance(event) => &event.originator,
        }
    }
}

/// A sealed message: bincode payload plus CRC32.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventEnvelope {
    /// Encoded message.
    pub payload: Vec<u8>,
    /// CRC32 of `payload`.
    pub crc32: u32,
}

impl EventEnvelope {
    /// Encode and checksum a message.
    pub fn seal(message: &CohortMessage) -> Result<Self> {
        let payload = bincode::serialize(message)?;
        let crc32 = crc32fast::hash(&payload);
        Ok(Self { payload, crc32 })
    }

    /// Verify and decode a message.
    pub fn open(&self) -> Result<CohortMessage> {
        let actual = crc32fast::hash(&self.payload);
        if actual != self.crc32 {
            return Err(CohortError::Corrupted {
                msg: format!("crc mismatch: expected {:08x}, got {:08x}", self.crc32, actual),
            });
        }
        Ok(bincode::deserialize(&self.payload)?)
    }

    /// Size of the encoded payload in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// True if the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}
