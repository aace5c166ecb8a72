//! Storage adapter seam for home instances.
//!
//! The core only needs create/read/update/mark-deleted/purge keyed by
//! instance id. Back ends decline work they cannot do with
//! [`StorageError::NotSupported`]; that variant is the only path to
//! [`CohortError::NotSupported`] from storage.

use crate::error::CohortError;
use crate::instance::{EntityDetail, InstanceGuid, InstanceStatus, Relationship};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Errors reported by a storage adapter.
#[derive(Debug, Error, PartialEq)]
pub enum StorageError {
    /// The back end deliberately declines the request.
    #[error("not supported: {reason}")]
    NotSupported {
        /// Why the back end declines.
        reason: String,
    },
    /// No record with this id.
    #[error("instance {guid} not stored")]
    NotFound {
        /// Missing instance.
        guid: InstanceGuid,
    },
    /// A record with this id already exists.
    #[error("instance {guid} already stored")]
    AlreadyExists {
        /// Duplicate instance.
        guid: InstanceGuid,
    },
    /// The back end is temporarily unreachable.
    #[error("storage unavailable: {reason}")]
    Unavailable {
        /// Underlying failure.
        reason: String,
    },
    /// Any other back end failure.
    #[error("storage failure: {reason}")]
    Backend {
        /// Underlying failure.
        reason: String,
    },
}

impl StorageError {
    /// Map to the core taxonomy, tagging the operation and target.
    pub fn into_cohort(self, operation: &'static str, target: impl ToString) -> CohortError {
        let target = target.to_string();
        match self {
            StorageError::NotSupported { reason } => CohortError::NotSupported {
                operation,
                target,
                reason,
            },
            StorageError::NotFound { .. } => CohortError::NotFound {
                operation,
                kind: "instance",
                target,
            },
            StorageError::Unavailable { reason } => CohortError::Transient {
                operation,
                target,
                reason,
            },
            other @ (StorageError::AlreadyExists { .. } | StorageError::Backend { .. }) => {
                CohortError::unexpected(operation, target, other)
            }
        }
    }
}

/// Raw persistence of home instances.
pub trait StorageAdapter: Send + Sync {
    /// Store a new entity.
    fn create_entity(&self, entity: EntityDetail) -> Result<(), StorageError>;
    /// Read an entity, including soft-deleted ones.
    fn read_entity(&self, guid: InstanceGuid) -> Result<Option<EntityDetail>, StorageError>;
    /// Replace a stored entity with its post-mutation record.
    fn update_entity(&self, entity: EntityDetail) -> Result<(), StorageError>;
    /// Persist the soft-deleted record of an entity.
    fn mark_entity_deleted(&self, entity: EntityDetail) -> Result<(), StorageError>;
    /// Remove an entity for good.
    fn purge_entity(&self, guid: InstanceGuid) -> Result<(), StorageError>;

    /// Store a new relationship.
    fn create_relationship(&self, relationship: Relationship) -> Result<(), StorageError>;
    /// Read a relationship, including soft-deleted ones.
    fn read_relationship(&self, guid: InstanceGuid) -> Result<Option<Relationship>, StorageError>;
    /// Replace a stored relationship with its post-mutation record.
    fn update_relationship(&self, relationship: Relationship) -> Result<(), StorageError>;
    /// Persist the soft-deleted record of a relationship.
    fn mark_relationship_deleted(&self, relationship: Relationship) -> Result<(), StorageError>;
    /// Remove a relationship for good.
    fn purge_relationship(&self, guid: InstanceGuid) -> Result<(), StorageError>;

    /// Point-in-time copy of every stored entity.
    fn snapshot_entities(&self) -> Result<Vec<EntityDetail>, StorageError>;

    /// Decline with `NotSupported` if the back end cannot attach
    /// `classification` to entities of `entity_type`.
    fn check_classification_support(
        &self,
        entity_type: &str,
        classification: &str,
    ) -> Result<(), StorageError>;
}

/// In-memory storage adapter backed by concurrent maps.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    entities: DashMap<InstanceGuid, EntityDetail>,
    relationships: DashMap<InstanceGuid, Relationship>,
    unsupported: HashSet<(String, String)>,
    unavailable: AtomicBool,
}

impl InMemoryStorage {
    /// Create an empty store that supports every classification.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decline `classification` on `entity_type` ("*" matches any type).
    pub fn decline_classification(mut self, entity_type: &str, classification: &str) -> Self {
        self.unsupported
            .insert((entity_type.to_string(), classification.to_string()));
        self
    }

    /// Simulate an outage: every call fails with `Unavailable` while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of stored entities, deleted ones included.
    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    fn check_available(&self) -> Result<(), StorageError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable {
                reason: "in-memory store switched off".to_string(),
            });
        }
        Ok(())
    }
}

impl StorageAdapter for InMemoryStorage {
    fn create_entity(&self, entity: EntityDetail) -> Result<(), StorageError> {
        self.check_available()?;
        let guid = entity.guid();
        match self.entities.entry(guid) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(StorageError::AlreadyExists { guid }),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(entity);
                Ok(())
            }
        }
    }

    fn read_entity(&self, guid: InstanceGuid) -> Result<Option<EntityDetail>, StorageError> {
        self.check_available()?;
        Ok(self.entities.get(&guid).map(|e| e.value().clone()))
    }

    fn update_entity(&self, entity: EntityDetail) -> Result<(), StorageError> {
        self.check_available()?;
        let guid = entity.guid();
        match self.entities.get_mut(&guid) {
            Some(mut stored) => {
                *stored = entity;
                Ok(())
            }
            None => Err(StorageError::NotFound { guid }),
        }
    }

    fn mark_entity_deleted(&self, entity: EntityDetail) -> Result<(), StorageError> {
        if entity.header.status != InstanceStatus::Deleted {
            return Err(StorageError::Backend {
                reason: format!("entity {} is not marked deleted", entity.guid()),
            });
        }
        self.update_entity(entity)
    }

    fn purge_entity(&self, guid: InstanceGuid) -> Result<(), StorageError> {
        self.check_available()?;
        self.entities
            .remove(&guid)
            .map(|_| ())
            .ok_or(StorageError::NotFound { guid })
    }

    fn create_relationship(&self, relationship: Relationship) -> Result<(), StorageError> {
        self.check_available()?;
        let guid = relationship.header.guid;
        match self.relationships.entry(guid) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(StorageError::AlreadyExists { guid }),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(relationship);
                Ok(())
            }
        }
    }

    fn read_relationship(&self, guid: InstanceGuid) -> Result<Option<Relationship>, StorageError> {
        self.check_available()?;
        Ok(self.relationships.get(&guid).map(|r| r.value().clone()))
    }

    fn update_relationship(&self, relationship: Relationship) -> Result<(), StorageError> {
        self.check_available()?;
        let guid = relationship.header.guid;
        match self.relationships.get_mut(&guid) {
            Some(mut stored) => {
                *stored = relationship;
                Ok(())
            }
            None => Err(StorageError::NotFound { guid }),
        }
    }

    fn mark_relationship_deleted(&self, relationship: Relationship) -> Result<(), StorageError> {
        if relationship.header.status != InstanceStatus::Deleted {
            return Err(StorageError::Backend {
                reason: format!("relationship {} is not marked deleted", relationship.header.guid),
            });
        }
        self.update_relationship(relationship)
    }

    fn purge_relationship(&self, guid: InstanceGuid) -> Result<(), StorageError> {
        self.check_available()?;
        self.relationships
            .remove(&guid)
            .map(|_| ())
            .ok_or(StorageError::NotFound { guid })
    }

    fn snapshot_entities(&self) -> Result<Vec<EntityDetail>, StorageError> {
        self.check_available()?;
        Ok(self.entities.iter().map(|e| e.value().clone()).collect())
    }

    fn check_classification_support(
        &self,
        entity_type: &str,
        classification: &str,
    ) -> Result<(), StorageError> {
        let declined = self
            .unsupported
            .contains(&(entity_type.to_string(), classification.to_string()))
            || self
                .unsupported
                .contains(&("*".to_string(), classification.to_string()));
        if declined {
            return Err(StorageError::NotSupported {
                reason: format!(
                    "classification {} is not supported on {}",
                    classification, entity_type
                ),
            });
        }
        Ok(())
    }
}
