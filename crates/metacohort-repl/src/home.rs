//! Home collection: mutations of the instances this member owns.
//!
//! Every mutation runs under the instance lock, bumps the version, commits to
//! storage and only then publishes the full post-mutation instance. A
//! publish problem is logged and never undoes the committed change.

use crate::classification::ClassificationLedger;
use crate::error::{CohortError, Result};
use crate::event::{InstanceEvent, InstanceEventKind};
use crate::fabric::EventFabric;
use crate::instance::{
    EntityDetail, InstanceGuid, InstanceHeader, InstanceProperties, InstanceProvenance,
    InstanceStatus, MetadataCollectionId, Relationship,
};
use crate::locking::InstanceLocks;
use crate::refcopy::ReferenceCopyStore;
use crate::storage::StorageAdapter;
use crate::types::{TypeCategory, TypeRegistry};
use std::sync::Arc;
use tracing::{debug, error, info};

fn check_version(
    operation: &'static str,
    guid: InstanceGuid,
    expected: Option<u64>,
    current: u64,
) -> Result<()> {
    match expected {
        Some(supplied) if supplied != current => Err(CohortError::StaleVersion {
            operation,
            target: guid.to_string(),
            supplied,
            current,
        }),
        _ => Ok(()),
    }
}

fn require_status(
    operation: &'static str,
    guid: InstanceGuid,
    status: InstanceStatus,
    wanted: InstanceStatus,
) -> Result<()> {
    if status == wanted {
        return Ok(());
    }
    Err(CohortError::Conflict {
        operation,
        target: guid.to_string(),
        reason: format!("instance is {:?}, expected {:?}", status, wanted),
    })
}

/// Owner-side operations on entities and relationships.
pub struct HomeCollection {
    local_member_id: MetadataCollectionId,
    storage: Arc<dyn StorageAdapter>,
    types: Arc<dyn TypeRegistry>,
    store: Arc<ReferenceCopyStore>,
    fabric: Arc<EventFabric>,
    locks: Arc<InstanceLocks>,
    ledger: Arc<ClassificationLedger>,
}

impl HomeCollection {
    /// Wire the collection to the member's shared components.
    pub fn new(
        storage: Arc<dyn StorageAdapter>,
        types: Arc<dyn TypeRegistry>,
        store: Arc<ReferenceCopyStore>,
        fabric: Arc<EventFabric>,
        locks: Arc<InstanceLocks>,
        ledger: Arc<ClassificationLedger>,
    ) -> Self {
        Self {
            local_member_id: fabric.local_member_id().clone(),
            storage,
            types,
            store,
            fabric,
            locks,
            ledger,
        }
    }

    /// Create an entity homed here.
    pub fn add_entity(
        &self,
        user_id: &str,
        type_name: &str,
        properties: InstanceProperties,
    ) -> Result<EntityDetail> {
        const OP: &str = "add_entity";
        let def = self.types.resolve(OP, type_name, TypeCategory::Entity)?;
        def.validate_properties(OP, &properties)?;

        let entity = EntityDetail::new(
            InstanceHeader::new(
                def.instance_type(),
                self.local_member_id.clone(),
                InstanceProvenance::LocalCohort,
                user_id,
            ),
            properties,
        );
        let guid = entity.guid();
        self.locks.with_lock(guid, || {
            self.storage
                .create_entity(entity.clone())
                .map_err(|e| e.into_cohort(OP, guid))?;
            debug!("{} created {} {}", user_id, type_name, guid);
            self.emit_entity(InstanceEventKind::NewEntity, entity.clone());
            Ok(entity)
        })
    }

    /// Replace an entity's properties.
    pub fn update_entity_properties(
        &self,
        user_id: &str,
        guid: InstanceGuid,
        properties: InstanceProperties,
        expected_version: Option<u64>,
    ) -> Result<EntityDetail> {
        const OP: &str = "update_entity_properties";
        self.locks.with_lock(guid, || {
            let mut entity = self.home_entity(OP, guid)?;
            require_status(OP, guid, entity.header.status, InstanceStatus::Active)?;
            check_version(OP, guid, expected_version, entity.header.version)?;
            self.types
                .resolve(OP, &entity.header.instance_type.type_name, TypeCategory::Entity)?
                .validate_properties(OP, &properties)?;

            entity.properties = properties;
            entity.header.touch(user_id);
            self.storage
                .update_entity(entity.clone())
                .map_err(|e| e.into_cohort(OP, guid))?;
            self.emit_entity(InstanceEventKind::UpdatedEntity, entity.clone());
            Ok(entity)
        })
    }

    /// Soft-delete an entity; it stays readable until purged.
    pub fn delete_entity(
        &self,
        user_id: &str,
        guid: InstanceGuid,
        expected_version: Option<u64>,
    ) -> Result<EntityDetail> {
        const OP: &str = "delete_entity";
        self.locks.with_lock(guid, || {
            let mut entity = self.home_entity(OP, guid)?;
            require_status(OP, guid, entity.header.status, InstanceStatus::Active)?;
            check_version(OP, guid, expected_version, entity.header.version)?;

            entity.header.status = InstanceStatus::Deleted;
            entity.header.touch(user_id);
            self.storage
                .mark_entity_deleted(entity.clone())
                .map_err(|e| e.into_cohort(OP, guid))?;
            info!("{} deleted entity {}", user_id, guid);
            self.emit_entity(InstanceEventKind::DeletedEntity, entity.clone());
            Ok(entity)
        })
    }

    /// Undo a soft delete.
    pub fn restore_entity(&self, user_id: &str, guid: InstanceGuid) -> Result<EntityDetail> {
        const OP: &str = "restore_entity";
        self.locks.with_lock(guid, || {
            let mut entity = self.home_entity(OP, guid)?;
            require_status(OP, guid, entity.header.status, InstanceStatus::Deleted)?;

            entity.header.status = InstanceStatus::Active;
            entity.header.touch(user_id);
            self.storage
                .update_entity(entity.clone())
                .map_err(|e| e.into_cohort(OP, guid))?;
            info!("{} restored entity {}", user_id, guid);
            self.emit_entity(InstanceEventKind::UpdatedEntity, entity.clone());
            Ok(entity)
        })
    }

    /// Remove a soft-deleted entity for good.
    pub fn purge_entity(&self, user_id: &str, guid: InstanceGuid) -> Result<()> {
        const OP: &str = "purge_entity";
        self.locks.with_lock(guid, || {
            let mut entity = self.home_entity(OP, guid)?;
            require_status(OP, guid, entity.header.status, InstanceStatus::Deleted)?;

            self.storage
                .purge_entity(guid)
                .map_err(|e| e.into_cohort(OP, guid))?;
            self.ledger.forget(guid);
            entity.header.status = InstanceStatus::Purged;
            entity.header.touch(user_id);
            info!("{} purged entity {}", user_id, guid);
            self.emit_entity(InstanceEventKind::PurgedEntity, entity);
            Ok(())
        })
    }

    /// Create a relationship homed here between two known entities.
    pub fn add_relationship(
        &self,
        user_id: &str,
        type_name: &str,
        end_one: InstanceGuid,
        end_two: InstanceGuid,
        properties: InstanceProperties,
    ) -> Result<Relationship> {
        const OP: &str = "add_relationship";
        let def = self.types.resolve(OP, type_name, TypeCategory::Relationship)?;
        def.validate_properties(OP, &properties)?;
        let one = self.get_entity_detail(end_one)?;
        let two = self.get_entity_detail(end_two)?;

        let relationship = Relationship {
            header: InstanceHeader::new(
                def.instance_type(),
                self.local_member_id.clone(),
                InstanceProvenance::LocalCohort,
                user_id,
            ),
            properties,
            end_one: one.proxy(),
            end_two: two.proxy(),
        };
        let guid = relationship.header.guid;
        self.locks.with_lock(guid, || {
            self.storage
                .create_relationship(relationship.clone())
                .map_err(|e| e.into_cohort(OP, guid))?;
            debug!(
                "{} linked {} and {} with {} {}",
                user_id, end_one, end_two, type_name, guid
            );
            self.emit_relationship(InstanceEventKind::NewRelationship, relationship.clone());
            Ok(relationship)
        })
    }

    /// Replace a relationship's properties.
    pub fn update_relationship_properties(
        &self,
        user_id: &str,
        guid: InstanceGuid,
        properties: InstanceProperties,
        expected_version: Option<u64>,
    ) -> Result<Relationship> {
        const OP: &str = "update_relationship_properties";
        self.locks.with_lock(guid, || {
            let mut relationship = self.home_relationship(OP, guid)?;
            require_status(OP, guid, relationship.header.status, InstanceStatus::Active)?;
            check_version(OP, guid, expected_version, relationship.header.version)?;
            self.types
                .resolve(
                    OP,
                    &relationship.header.instance_type.type_name,
                    TypeCategory::Relationship,
                )?
                .validate_properties(OP, &properties)?;

            relationship.properties = properties;
            relationship.header.touch(user_id);
            self.storage
                .update_relationship(relationship.clone())
                .map_err(|e| e.into_cohort(OP, guid))?;
            self.emit_relationship(InstanceEventKind::UpdatedRelationship, relationship.clone());
            Ok(relationship)
        })
    }

    /// Soft-delete a relationship.
    pub fn delete_relationship(
        &self,
        user_id: &str,
        guid: InstanceGuid,
        expected_version: Option<u64>,
    ) -> Result<Relationship> {
        const OP: &str = "delete_relationship";
        self.locks.with_lock(guid, || {
            let mut relationship = self.home_relationship(OP, guid)?;
            require_status(OP, guid, relationship.header.status, InstanceStatus::Active)?;
            check_version(OP, guid, expected_version, relationship.header.version)?;

            relationship.header.status = InstanceStatus::Deleted;
            relationship.header.touch(user_id);
            self.storage
                .mark_relationship_deleted(relationship.clone())
                .map_err(|e| e.into_cohort(OP, guid))?;
            info!("{} deleted relationship {}", user_id, guid);
            self.emit_relationship(InstanceEventKind::DeletedRelationship, relationship.clone());
            Ok(relationship)
        })
    }

    /// Remove a soft-deleted relationship for good.
    pub fn purge_relationship(&self, user_id: &str, guid: InstanceGuid) -> Result<()> {
        const OP: &str = "purge_relationship";
        self.locks.with_lock(guid, || {
            let mut relationship = self.home_relationship(OP, guid)?;
            require_status(OP, guid, relationship.header.status, InstanceStatus::Deleted)?;

            self.storage
                .purge_relationship(guid)
                .map_err(|e| e.into_cohort(OP, guid))?;
            relationship.header.status = InstanceStatus::Purged;
            relationship.header.touch(user_id);
            info!("{} purged relationship {}", user_id, guid);
            self.emit_relationship(InstanceEventKind::PurgedRelationship, relationship);
            Ok(())
        })
    }

    /// An entity from home storage, or else its reference copy.
    pub fn get_entity_detail(&self, guid: InstanceGuid) -> Result<EntityDetail> {
        const OP: &str = "get_entity_detail";
        if let Some(entity) = self
            .storage
            .read_entity(guid)
            .map_err(|e| e.into_cohort(OP, guid))?
        {
            return Ok(entity);
        }
        self.store
            .cached_entity(guid)
            .ok_or_else(|| CohortError::not_found(OP, "entity", guid))
    }

    /// A relationship from home storage, or else its reference copy.
    pub fn get_relationship(&self, guid: InstanceGuid) -> Result<Relationship> {
        const OP: &str = "get_relationship";
        if let Some(relationship) = self
            .storage
            .read_relationship(guid)
            .map_err(|e| e.into_cohort(OP, guid))?
        {
            return Ok(relationship);
        }
        self.store
            .cached_relationship(guid)
            .ok_or_else(|| CohortError::not_found(OP, "relationship", guid))
    }

    fn home_entity(&self, operation: &'static str, guid: InstanceGuid) -> Result<EntityDetail> {
        if let Some(entity) = self
            .storage
            .read_entity(guid)
            .map_err(|e| e.into_cohort(operation, guid))?
        {
            return Ok(entity);
        }
        match self.store.cached_entity(guid) {
            Some(copy) => Err(CohortError::NotHome {
                operation,
                target: guid.to_string(),
                home: copy.header.home_metadata_collection_id.to_string(),
            }),
            None => Err(CohortError::not_found(operation, "entity", guid)),
        }
    }

    fn home_relationship(
        &self,
        operation: &'static str,
        guid: InstanceGuid,
    ) -> Result<Relationship> {
        if let Some(relationship) = self
            .storage
            .read_relationship(guid)
            .map_err(|e| e.into_cohort(operation, guid))?
        {
            return Ok(relationship);
        }
        match self.store.cached_relationship(guid) {
            Some(copy) => Err(CohortError::NotHome {
                operation,
                target: guid.to_string(),
                home: copy.header.home_metadata_collection_id.to_string(),
            }),
            None => Err(CohortError::not_found(operation, "relationship", guid)),
        }
    }

    fn emit_entity(&self, kind: InstanceEventKind, entity: EntityDetail) {
        self.emit(InstanceEvent::entity(
            kind,
            &self.local_member_id,
            self.fabric.display_name(),
            self.fabric.next_sequence(),
            entity,
        ));
    }

    fn emit_relationship(&self, kind: InstanceEventKind, relationship: Relationship) {
        self.emit(InstanceEvent::relationship(
            kind,
            &self.local_member_id,
            self.fabric.display_name(),
            self.fabric.next_sequence(),
            relationship,
        ));
    }

    fn emit(&self, event: InstanceEvent) {
        let kind = event.kind;
        if let Err(e) = self.fabric.publish(event) {
            error!("failed to publish {:?}: {}", kind, e);
        }
    }
}
