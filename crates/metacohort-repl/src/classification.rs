//! Classification lifecycle: classify, reclassify and declassify entities,
//! and mirror classifications owned by other members.
//!
//! Per (entity, classification type) the lifecycle is
//! `Unclassified -> Classified -> Reclassified* -> Unclassified`. Only the
//! classification's home may move it along. An entity's home may classify it;
//! so may a member configured as external classifier for that classification
//! type, in which case the classification is homed at the classifier while
//! the entity keeps its home.

use crate::error::{CohortError, Result};
use crate::event::{InstanceEvent, InstanceEventKind};
use crate::fabric::EventFabric;
use crate::instance::{
    current_time_us, Classification, ClassificationKey, EntityDetail, InstanceGuid,
    InstanceProperties, InstanceStatus, MetadataCollectionId,
};
use crate::locking::InstanceLocks;
use crate::refcopy::ReferenceCopyStore;
use crate::storage::StorageAdapter;
use crate::types::{TypeCategory, TypeDef, TypeRegistry};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Where a classification stands on one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassificationState {
    /// Not attached (never, or declassified).
    Unclassified,
    /// Attached at version 1.
    Classified,
    /// Attached and reclassified at least once.
    Reclassified,
}

/// A lifecycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassificationOp {
    /// Attach.
    Classify,
    /// Replace properties.
    Reclassify,
    /// Detach.
    Declassify,
}

impl ClassificationState {
    /// State implied by the attached classification, if any.
    pub fn of(classification: Option<&Classification>) -> Self {
        match classification {
            None => Self::Unclassified,
            Some(c) if c.version <= 1 => Self::Classified,
            Some(_) => Self::Reclassified,
        }
    }

    /// True if `op` is allowed from this state.
    pub fn permits(self, op: ClassificationOp) -> bool {
        match (self, op) {
            (Self::Unclassified, ClassificationOp::Classify) => true,
            (Self::Classified | Self::Reclassified, ClassificationOp::Reclassify) => true,
            (Self::Classified | Self::Reclassified, ClassificationOp::Declassify) => true,
            _ => false,
        }
    }

    /// State after a permitted `op`.
    pub fn after(self, op: ClassificationOp) -> Self {
        match op {
            ClassificationOp::Classify => Self::Classified,
            ClassificationOp::Reclassify => Self::Reclassified,
            ClassificationOp::Declassify => Self::Unclassified,
        }
    }
}

/// Result of a bulk classification run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkOutcome {
    /// Entities classified, in processing order.
    pub classified: Vec<InstanceGuid>,
    /// Entities the local repository declined.
    pub skipped_not_supported: Vec<InstanceGuid>,
    /// True if the run stopped early on cancellation.
    pub cancelled: bool,
}

enum Target {
    Home(EntityDetail),
    Reference(EntityDetail),
}

impl Target {
    fn entity(&self) -> &EntityDetail {
        match self {
            Target::Home(e) | Target::Reference(e) => e,
        }
    }
}

/// Ordering state kept per (entity, classification type): the last
/// generation this member allocated and the newest key it accepted for
/// classifications homed elsewhere but attached to entities homed here.
#[derive(Debug, Default)]
pub struct ClassificationLedger {
    generations: DashMap<(InstanceGuid, String), u64>,
    foreign_keys: DashMap<(InstanceGuid, String), ClassificationKey>,
}

impl ClassificationLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next generation for `name` on `guid`.
    ///
    /// The result is above every generation the ledger has seen, including
    /// removals recorded for foreign classifications, and above `seen`. The
    /// clock is only a floor.
    pub(crate) fn next_generation(&self, guid: InstanceGuid, name: &str, seen: u64) -> u64 {
        let key = (guid, name.to_string());
        let foreign = self.foreign_keys.get(&key).map_or(0, |k| k.generation);
        let mut last = self.generations.entry(key).or_insert(0);
        let known = (*last).max(foreign).max(seen);
        let next = known.saturating_add(1).max(current_time_us());
        *last = next;
        next
    }

    /// Record `key` if it is newer than what is held; false if it is not.
    fn advance_foreign_key(&self, guid: InstanceGuid, name: &str, key: ClassificationKey) -> bool {
        let mut current = self
            .foreign_keys
            .entry((guid, name.to_string()))
            .or_insert(ClassificationKey {
                generation: 0,
                version: 0,
                removed: false,
            });
        if *current >= key {
            return false;
        }
        *current = key;
        true
    }

    /// Drop everything recorded for `guid`. Returns the entries removed.
    pub fn forget(&self, guid: InstanceGuid) -> usize {
        let before = self.len();
        self.generations.retain(|(g, _), _| *g != guid);
        self.foreign_keys.retain(|(g, _), _| *g != guid);
        let removed = before.saturating_sub(self.len());
        if removed > 0 {
            debug!("forgot {} classification ledger entries for {}", removed, guid);
        }
        removed
    }

    /// Number of entries held.
    pub fn len(&self) -> usize {
        self.generations.len() + self.foreign_keys.len()
    }

    /// True if nothing is held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Applies classification mutations and mirrors remote ones.
pub struct ClassificationManager {
    local_member_id: MetadataCollectionId,
    storage: Arc<dyn StorageAdapter>,
    types: Arc<dyn TypeRegistry>,
    store: Arc<ReferenceCopyStore>,
    fabric: Arc<EventFabric>,
    locks: Arc<InstanceLocks>,
    external_classifications: HashSet<String>,
    ledger: Arc<ClassificationLedger>,
}

impl ClassificationManager {
    /// Wire a manager to the member's shared components.
    pub fn new(
        storage: Arc<dyn StorageAdapter>,
        types: Arc<dyn TypeRegistry>,
        store: Arc<ReferenceCopyStore>,
        fabric: Arc<EventFabric>,
        locks: Arc<InstanceLocks>,
        external_classifications: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            local_member_id: fabric.local_member_id().clone(),
            storage,
            types,
            store,
            fabric,
            locks,
            external_classifications: external_classifications.into_iter().collect(),
            ledger: Arc::new(ClassificationLedger::new()),
        }
    }

    /// Ordering state shared with whoever purges entities.
    pub fn ledger(&self) -> &Arc<ClassificationLedger> {
        &self.ledger
    }

    /// Attach a new classification at version 1.
    pub fn classify(
        &self,
        user_id: &str,
        entity_guid: InstanceGuid,
        classification_name: &str,
        properties: InstanceProperties,
    ) -> Result<EntityDetail> {
        const OP: &str = "classify_entity";
        let def = self.resolve(OP, classification_name, &properties)?;

        self.locks.with_lock(entity_guid, || {
            let target = self.load_target(OP, entity_guid)?;
            let entity = target.entity();
            let entity_type = entity.header.instance_type.type_name.clone();
            if !def.applies_to(&entity_type) {
                return Err(CohortError::invalid(
                    OP,
                    format!("{} cannot classify entities of type {}", def.name, entity_type),
                ));
            }
            let state = ClassificationState::of(entity.classification(classification_name));
            if !state.permits(ClassificationOp::Classify) {
                return Err(CohortError::Conflict {
                    operation: OP,
                    target: entity_guid.to_string(),
                    reason: format!("already classified as {}", classification_name),
                });
            }
            if let Target::Reference(entity) = &target {
                self.ensure_external_classifier(OP, entity, classification_name)?;
            }
            self.storage
                .check_classification_support(&entity_type, classification_name)
                .map_err(|e| e.into_cohort(OP, entity_guid))?;

            let generation = self.next_generation(&target, classification_name);
            let classification = Classification::new(
                def.instance_type(),
                properties,
                self.local_member_id.clone(),
                generation,
                user_id,
            );

            let updated = match target {
                Target::Home(mut entity) => {
                    entity.upsert_classification(classification.clone());
                    entity.header.touch(user_id);
                    self.storage
                        .update_entity(entity.clone())
                        .map_err(|e| e.into_cohort(OP, entity_guid))?;
                    entity
                }
                Target::Reference(entity) => self.mirror_locally(&entity, &classification),
            };
            info!(
                "{} classified {} as {} (generation {})",
                user_id, entity_guid, classification_name, generation
            );
            self.emit(
                InstanceEventKind::NewClassification,
                updated.clone(),
                classification,
            );
            Ok(updated)
        })
    }

    /// Replace the properties of an attached classification, bumping its
    /// version. `expected_version`, when given, must match the current one.
    pub fn reclassify(
        &self,
        user_id: &str,
        entity_guid: InstanceGuid,
        classification_name: &str,
        properties: InstanceProperties,
        expected_version: Option<u64>,
    ) -> Result<EntityDetail> {
        const OP: &str = "reclassify_entity";
        self.resolve(OP, classification_name, &properties)?;

        self.locks.with_lock(entity_guid, || {
            let target = self.load_target(OP, entity_guid)?;
            let existing = self.owned_classification(
                OP,
                target.entity(),
                classification_name,
                ClassificationOp::Reclassify,
                expected_version,
            )?;
            let classification = existing.reclassified(properties, user_id);

            let updated = match target {
                Target::Home(mut entity) => {
                    entity.upsert_classification(classification.clone());
                    entity.header.touch(user_id);
                    self.storage
                        .update_entity(entity.clone())
                        .map_err(|e| e.into_cohort(OP, entity_guid))?;
                    entity
                }
                Target::Reference(entity) => self.mirror_locally(&entity, &classification),
            };
            debug!(
                "{} reclassified {} as {} v{}",
                user_id, entity_guid, classification_name, classification.version
            );
            self.emit(
                InstanceEventKind::ReclassifiedEntity,
                updated.clone(),
                classification,
            );
            Ok(updated)
        })
    }

    /// Detach a classification.
    pub fn declassify(
        &self,
        user_id: &str,
        entity_guid: InstanceGuid,
        classification_name: &str,
        expected_version: Option<u64>,
    ) -> Result<EntityDetail> {
        const OP: &str = "declassify_entity";
        self.types
            .resolve(OP, classification_name, TypeCategory::Classification)?;

        self.locks.with_lock(entity_guid, || {
            let target = self.load_target(OP, entity_guid)?;
            let existing = self.owned_classification(
                OP,
                target.entity(),
                classification_name,
                ClassificationOp::Declassify,
                expected_version,
            )?;

            let updated = match target {
                Target::Home(mut entity) => {
                    entity.remove_classification(classification_name);
                    entity.header.touch(user_id);
                    self.storage
                        .update_entity(entity.clone())
                        .map_err(|e| e.into_cohort(OP, entity_guid))?;
                    entity
                }
                Target::Reference(entity) => {
                    self.store
                        .remove_classification(&entity, &existing, &self.local_member_id);
                    self.store.cached_entity(entity_guid).unwrap_or(entity)
                }
            };
            info!(
                "{} declassified {} from {}",
                user_id, classification_name, entity_guid
            );
            self.emit(
                InstanceEventKind::DeclassifiedEntity,
                updated.clone(),
                existing,
            );
            Ok(updated)
        })
    }

    /// Mirror a classification homed at another member. No ownership check
    /// and nothing is published.
    ///
    /// If the entity is homed here the classification is attached to the
    /// stored entity without changing the entity's version; otherwise it is
    /// merged into the reference copy of the entity. Older states than the
    /// one already held are ignored.
    pub fn save_reference_copy(
        &self,
        user_id: &str,
        entity: &EntityDetail,
        classification: &Classification,
    ) -> Result<()> {
        const OP: &str = "save_classification_reference_copy";
        if classification.is_homed_in(&self.local_member_id) {
            return Err(CohortError::invalid(
                OP,
                format!(
                    "classification {} on {} is homed locally",
                    classification.name(),
                    entity.guid()
                ),
            ));
        }
        self.types
            .resolve(OP, classification.name(), TypeCategory::Classification)?;
        let guid = entity.guid();

        self.locks.with_lock(guid, || {
            self.storage
                .check_classification_support(
                    &entity.header.instance_type.type_name,
                    classification.name(),
                )
                .map_err(|e| e.into_cohort(OP, guid))?;

            if !entity.header.is_homed_in(&self.local_member_id) {
                let outcome = self.store.save_classification(
                    entity,
                    classification,
                    &classification.home_metadata_collection_id,
                );
                debug!(
                    "{} saved reference copy of {} on {}: {:?}",
                    user_id,
                    classification.name(),
                    guid,
                    outcome
                );
                return Ok(());
            }

            let mut stored = self
                .storage
                .read_entity(guid)
                .map_err(|e| e.into_cohort(OP, guid))?
                .ok_or_else(|| CohortError::not_found(OP, "entity", guid))?;
            if !self.ledger.advance_foreign_key(guid, classification.name(), classification.key()) {
                debug!("ignoring older {} on {}", classification.name(), guid);
                return Ok(());
            }
            if let Some(existing) = stored.classification(classification.name()) {
                if existing.is_homed_in(&self.local_member_id) {
                    return Err(CohortError::Conflict {
                        operation: OP,
                        target: guid.to_string(),
                        reason: format!(
                            "{} is already classified locally as {}",
                            guid,
                            classification.name()
                        ),
                    });
                }
            }
            let mut copy = classification.clone();
            copy.mark_reference_copy(&self.local_member_id);
            stored.upsert_classification(copy);
            self.storage
                .update_entity(stored)
                .map_err(|e| e.into_cohort(OP, guid))?;
            debug!(
                "{} attached reference copy of {} to home entity {}",
                user_id,
                classification.name(),
                guid
            );
            Ok(())
        })
    }

    /// Remove a mirrored classification after its home declassified it.
    pub fn purge_classification_reference_copy(
        &self,
        user_id: &str,
        entity: &EntityDetail,
        classification: &Classification,
    ) -> Result<()> {
        const OP: &str = "purge_classification_reference_copy";
        if classification.is_homed_in(&self.local_member_id) {
            return Err(CohortError::invalid(
                OP,
                format!("classification {} is homed locally", classification.name()),
            ));
        }
        let guid = entity.guid();

        self.locks.with_lock(guid, || {
            if !entity.header.is_homed_in(&self.local_member_id) {
                self.store.remove_classification(
                    entity,
                    classification,
                    &classification.home_metadata_collection_id,
                );
                return Ok(());
            }

            let Some(mut stored) = self
                .storage
                .read_entity(guid)
                .map_err(|e| e.into_cohort(OP, guid))?
            else {
                return Ok(());
            };
            if !self.ledger.advance_foreign_key(guid, classification.name(), classification.removal_key())
            {
                return Ok(());
            }
            let held_foreign = stored
                .classification(classification.name())
                .map_or(false, |c| !c.is_homed_in(&self.local_member_id));
            if held_foreign {
                stored.remove_classification(classification.name());
                self.storage
                    .update_entity(stored)
                    .map_err(|e| e.into_cohort(OP, guid))?;
                debug!(
                    "{} removed reference copy of {} from {}",
                    user_id,
                    classification.name(),
                    guid
                );
            }
            Ok(())
        })
    }

    /// Classify every entity in `guids`, checking `cancel` between entities.
    ///
    /// Entities the repository declines are skipped and counted; any other
    /// error ends the run.
    pub fn bulk_classify(
        &self,
        user_id: &str,
        guids: &[InstanceGuid],
        classification_name: &str,
        properties: &InstanceProperties,
        cancel: &CancellationToken,
    ) -> Result<BulkOutcome> {
        let mut outcome = BulkOutcome::default();
        for guid in guids {
            if cancel.is_cancelled() {
                info!(
                    "bulk classify as {} cancelled after {} entities",
                    classification_name,
                    outcome.classified.len() + outcome.skipped_not_supported.len()
                );
                outcome.cancelled = true;
                break;
            }
            match self.classify(user_id, *guid, classification_name, properties.clone()) {
                Ok(_) => outcome.classified.push(*guid),
                Err(e) if e.is_not_supported() => {
                    debug!("skipping {}: {}", guid, e);
                    outcome.skipped_not_supported.push(*guid);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(outcome)
    }

    /// Current lifecycle state of `classification_name` on an entity.
    pub fn state(
        &self,
        entity_guid: InstanceGuid,
        classification_name: &str,
    ) -> Result<ClassificationState> {
        let target = self.load_target("classification_state", entity_guid)?;
        Ok(ClassificationState::of(
            target.entity().classification(classification_name),
        ))
    }

    fn resolve(
        &self,
        operation: &'static str,
        name: &str,
        properties: &InstanceProperties,
    ) -> Result<TypeDef> {
        let def = self
            .types
            .resolve(operation, name, TypeCategory::Classification)?;
        def.validate_properties(operation, properties)?;
        Ok(def)
    }

    fn load_target(&self, operation: &'static str, guid: InstanceGuid) -> Result<Target> {
        let target = match self
            .storage
            .read_entity(guid)
            .map_err(|e| e.into_cohort(operation, guid))?
        {
            Some(entity) if entity.header.is_homed_in(&self.local_member_id) => {
                Target::Home(entity)
            }
            Some(entity) => {
                return Err(CohortError::NotHome {
                    operation,
                    target: guid.to_string(),
                    home: entity.header.home_metadata_collection_id.to_string(),
                })
            }
            None => match self.store.cached_entity(guid) {
                Some(entity) => Target::Reference(entity),
                None => return Err(CohortError::not_found(operation, "entity", guid)),
            },
        };
        if target.entity().header.status != InstanceStatus::Active {
            return Err(CohortError::Conflict {
                operation,
                target: guid.to_string(),
                reason: "entity is deleted".to_string(),
            });
        }
        Ok(target)
    }

    fn owned_classification(
        &self,
        operation: &'static str,
        entity: &EntityDetail,
        name: &str,
        op: ClassificationOp,
        expected_version: Option<u64>,
    ) -> Result<Classification> {
        let existing = entity.classification(name);
        if !ClassificationState::of(existing).permits(op) {
            return Err(CohortError::not_found(
                operation,
                "classification",
                format!("{} on {}", name, entity.guid()),
            ));
        }
        let Some(existing) = existing.cloned() else {
            return Err(CohortError::not_found(operation, "classification", name));
        };
        if let Some(supplied) = expected_version {
            if supplied != existing.version {
                return Err(CohortError::StaleVersion {
                    operation,
                    target: entity.guid().to_string(),
                    supplied,
                    current: existing.version,
                });
            }
        }
        if !existing.is_homed_in(&self.local_member_id) {
            return Err(CohortError::NotHome {
                operation,
                target: entity.guid().to_string(),
                home: existing.home_metadata_collection_id.to_string(),
            });
        }
        Ok(existing)
    }

    fn ensure_external_classifier(
        &self,
        operation: &'static str,
        entity: &EntityDetail,
        name: &str,
    ) -> Result<()> {
        if self.external_classifications.contains(name) {
            return Ok(());
        }
        Err(CohortError::NotHome {
            operation,
            target: entity.guid().to_string(),
            home: entity.header.home_metadata_collection_id.to_string(),
        })
    }

    fn mirror_locally(&self, entity: &EntityDetail, classification: &Classification) -> EntityDetail {
        self.store
            .save_classification(entity, classification, &self.local_member_id);
        self.store
            .cached_entity(entity.guid())
            .unwrap_or_else(|| entity.clone())
    }

    // Generations only grow per (entity, classification). The newest key
    // held anywhere locally seeds the next one, so a removal stamped by a
    // classifier with a faster clock is still superseded.
    fn next_generation(&self, target: &Target, name: &str) -> u64 {
        let entity = target.entity();
        let guid = entity.guid();
        let cached = self
            .store
            .entry(guid)
            .and_then(|copy| copy.classification_key(name))
            .map_or(0, |k| k.generation);
        let attached = entity.classification(name).map_or(0, |c| c.generation);
        self.ledger
            .next_generation(guid, name, cached.max(attached))
    }

    fn emit(&self, kind: InstanceEventKind, entity: EntityDetail, classification: Classification) {
        let event = InstanceEvent::classification(
            kind,
            &self.local_member_id,
            self.fabric.display_name(),
            self.fabric.next_sequence(),
            entity,
            classification,
        );
        if let Err(e) = self.fabric.publish(event) {
            error!("failed to publish {:?}: {}", kind, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PublishConfig;
    use crate::fabric::InMemoryTopic;
    use crate::instance::{
        InstanceHeader, InstancePropertyValue, InstanceProvenance, InstanceType, PropertyCategory,
    };
    use crate::registry::CohortRegistry;
    use crate::storage::InMemoryStorage;
    use crate::types::InMemoryTypeRegistry;

    fn m(id: &str) -> MetadataCollectionId {
        MetadataCollectionId::new(id)
    }

    fn types() -> Arc<dyn TypeRegistry> {
        Arc::new(
            InMemoryTypeRegistry::new()
                .with(TypeDef::entity("t-asset", "Asset"))
                .with(TypeDef::entity("t-person", "Person"))
                .with(
                    TypeDef::classification("c-conf", "Confidentiality")
                        .with_property("level", PropertyCategory::Primitive)
                        .valid_for("Asset"),
                )
                .with(TypeDef::classification("c-anchor", "Anchors")),
        )
    }

    struct Fixture {
        storage: Arc<InMemoryStorage>,
        store: Arc<ReferenceCopyStore>,
        manager: ClassificationManager,
    }

    fn fixture_with(local: &str, storage: InMemoryStorage, external: &[&str]) -> Fixture {
        let storage = Arc::new(storage);
        let registry = Arc::new(CohortRegistry::new(m(local)));
        let topic = InMemoryTopic::new();
        let fabric = Arc::new(EventFabric::new(
            registry,
            local,
            Arc::new(topic.connect(m(local))),
            PublishConfig::default(),
        ));
        let store = Arc::new(ReferenceCopyStore::new(m(local)));
        let manager = ClassificationManager::new(
            storage.clone(),
            types(),
            Arc::clone(&store),
            fabric,
            Arc::new(InstanceLocks::new()),
            external.iter().map(|s| s.to_string()),
        );
        Fixture {
            storage,
            store,
            manager,
        }
    }

    fn fixture(local: &str) -> Fixture {
        fixture_with(local, InMemoryStorage::new(), &[])
    }

    fn asset_at(home: &str) -> EntityDetail {
        EntityDetail::new(
            InstanceHeader::new(
                InstanceType {
                    type_guid: "t-asset".to_string(),
                    type_name: "Asset".to_string(),
                },
                m(home),
                InstanceProvenance::LocalCohort,
                "alice",
            ),
            InstanceProperties::new(),
        )
    }

    fn level(n: i32) -> InstanceProperties {
        InstanceProperties::new().with("level", InstancePropertyValue::int(n))
    }

    fn home_asset(f: &Fixture) -> InstanceGuid {
        let entity = asset_at("m1");
        let guid = entity.guid();
        f.storage.create_entity(entity).unwrap();
        guid
    }

    #[test]
    fn test_state_machine() {
        use ClassificationOp::*;
        use ClassificationState::*;
        assert!(Unclassified.permits(Classify));
        assert!(!Unclassified.permits(Declassify));
        assert!(!Classified.permits(Classify));
        assert!(Reclassified.permits(Reclassify));
        assert_eq!(Classified.after(Reclassify), Reclassified);
        assert_eq!(Reclassified.after(Declassify), Unclassified);
    }

    #[test]
    fn test_classify_home_entity() {
        let f = fixture("m1");
        let guid = home_asset(&f);
        let entity = f
            .manager
            .classify("alice", guid, "Confidentiality", level(2))
            .unwrap();

        let c = entity.classification("Confidentiality").unwrap();
        assert_eq!(c.version, 1);
        assert_eq!(c.home_metadata_collection_id, m("m1"));
        assert_eq!(entity.header.version, 2);
        assert_eq!(f.storage.read_entity(guid).unwrap().unwrap(), entity);
        assert_eq!(
            f.manager.state(guid, "Confidentiality").unwrap(),
            ClassificationState::Classified
        );
    }

    #[test]
    fn test_classify_twice_conflicts() {
        let f = fixture("m1");
        let guid = home_asset(&f);
        f.manager
            .classify("alice", guid, "Confidentiality", level(1))
            .unwrap();
        let err = f
            .manager
            .classify("alice", guid, "Confidentiality", level(1))
            .unwrap_err();
        assert!(matches!(err, CohortError::Conflict { .. }));
    }

    #[test]
    fn test_classify_validates_type_and_properties() {
        let f = fixture("m1");
        let guid = home_asset(&f);
        let unknown = f
            .manager
            .classify("alice", guid, "Nope", InstanceProperties::new())
            .unwrap_err();
        assert!(unknown.is_not_found());

        let bad_prop = InstanceProperties::new().with("owner", InstancePropertyValue::string("x"));
        assert!(matches!(
            f.manager.classify("alice", guid, "Confidentiality", bad_prop),
            Err(CohortError::InvalidParameter { .. })
        ));

        let person = EntityDetail::new(
            InstanceHeader::new(
                InstanceType {
                    type_guid: "t-person".to_string(),
                    type_name: "Person".to_string(),
                },
                m("m1"),
                InstanceProvenance::LocalCohort,
                "alice",
            ),
            InstanceProperties::new(),
        );
        let person_guid = person.guid();
        f.storage.create_entity(person).unwrap();
        assert!(matches!(
            f.manager
                .classify("alice", person_guid, "Confidentiality", level(1)),
            Err(CohortError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_classify_unknown_entity_not_found() {
        let f = fixture("m1");
        let err = f
            .manager
            .classify("alice", InstanceGuid::generate(), "Confidentiality", level(1))
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_declined_classification_is_not_supported() {
        let f = fixture_with(
            "m1",
            InMemoryStorage::new().decline_classification("Asset", "Anchors"),
            &[],
        );
        let guid = home_asset(&f);
        let err = f
            .manager
            .classify("alice", guid, "Anchors", InstanceProperties::new())
            .unwrap_err();
        assert!(err.is_not_supported());
        assert!(f
            .storage
            .read_entity(guid)
            .unwrap()
            .unwrap()
            .classifications
            .is_empty());
    }

    #[test]
    fn test_reclassify_bumps_version_and_checks_expected() {
        let f = fixture("m1");
        let guid = home_asset(&f);
        f.manager
            .classify("alice", guid, "Confidentiality", level(1))
            .unwrap();
        let entity = f
            .manager
            .reclassify("bob", guid, "Confidentiality", level(2), Some(1))
            .unwrap();
        let c = entity.classification("Confidentiality").unwrap();
        assert_eq!(c.version, 2);
        assert_eq!(c.updated_by.as_deref(), Some("bob"));

        let err = f
            .manager
            .reclassify("bob", guid, "Confidentiality", level(3), Some(1))
            .unwrap_err();
        assert!(err.is_stale());
    }

    #[test]
    fn test_declassify_never_classified_is_not_found() {
        let f = fixture("m1");
        let guid = home_asset(&f);
        let err = f
            .manager
            .declassify("alice", guid, "Confidentiality", None)
            .unwrap_err();
        assert!(err.is_not_found());
        let err = f
            .manager
            .reclassify("alice", guid, "Confidentiality", level(1), None)
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_classify_again_after_declassify_restarts_at_one() {
        let f = fixture("m1");
        let guid = home_asset(&f);
        let first = f
            .manager
            .classify("alice", guid, "Confidentiality", level(1))
            .unwrap();
        f.manager
            .reclassify("alice", guid, "Confidentiality", level(2), None)
            .unwrap();
        let cleared = f
            .manager
            .declassify("alice", guid, "Confidentiality", None)
            .unwrap();
        assert!(cleared.classification("Confidentiality").is_none());

        let again = f
            .manager
            .classify("alice", guid, "Confidentiality", level(9))
            .unwrap();
        let c = again.classification("Confidentiality").unwrap();
        assert_eq!(c.version, 1);
        assert!(c.generation > first.classification("Confidentiality").unwrap().generation);
    }

    #[test]
    fn test_non_home_classify_rejected_without_authority() {
        let f = fixture("m2");
        let remote = asset_at("m1");
        f.store.save_classification(
            &remote,
            &Classification::new(
                InstanceType {
                    type_guid: "c-anchor".to_string(),
                    type_name: "Anchors".to_string(),
                },
                InstanceProperties::new(),
                m("m1"),
                1,
                "alice",
            ),
            &m("m1"),
        );
        let err = f
            .manager
            .classify("alice", remote.guid(), "Confidentiality", level(1))
            .unwrap_err();
        assert!(matches!(err, CohortError::NotHome { .. }));
    }

    #[test]
    fn test_external_classifier_keeps_entity_home() {
        let f = fixture_with("m2", InMemoryStorage::new(), &["Confidentiality"]);
        let remote = asset_at("m1");
        let guid = remote.guid();
        // Seed the reference copy the way the fabric would.
        f.store
            .apply_event(&InstanceEvent::entity(
                InstanceEventKind::NewEntity,
                &m("m1"),
                "one",
                1,
                remote,
            ))
            .unwrap();

        let entity = f
            .manager
            .classify("carol", guid, "Confidentiality", level(4))
            .unwrap();
        assert_eq!(entity.header.home_metadata_collection_id, m("m1"));
        assert_eq!(entity.header.version, 1);
        let c = entity.classification("Confidentiality").unwrap();
        assert_eq!(c.home_metadata_collection_id, m("m2"));

        // The classifier owns its classification and may reclassify it.
        let entity = f
            .manager
            .reclassify("carol", guid, "Confidentiality", level(5), None)
            .unwrap();
        assert_eq!(entity.classification("Confidentiality").unwrap().version, 2);
        let entity = f
            .manager
            .declassify("carol", guid, "Confidentiality", None)
            .unwrap();
        assert!(entity.classification("Confidentiality").is_none());
    }

    #[test]
    fn test_save_reference_copy_on_non_home_member() {
        let f = fixture("m2");
        let remote = asset_at("m1");
        let mut c = Classification::new(
            InstanceType {
                type_guid: "c-conf".to_string(),
                type_name: "Confidentiality".to_string(),
            },
            level(1),
            m("m1"),
            1,
            "alice",
        );
        f.manager.save_reference_copy("svc", &remote, &c).unwrap();
        let cached = f.store.cached_entity(remote.guid()).unwrap();
        assert_eq!(cached.header.home_metadata_collection_id, m("m1"));
        assert!(cached.classification("Confidentiality").is_some());

        c.home_metadata_collection_id = m("m2");
        assert!(matches!(
            f.manager.save_reference_copy("svc", &remote, &c),
            Err(CohortError::InvalidParameter { .. })
        ));
    }

    fn foreign_conf(home: &str, generation: u64) -> Classification {
        Classification::new(
            InstanceType {
                type_guid: "c-conf".to_string(),
                type_name: "Confidentiality".to_string(),
            },
            level(1),
            m(home),
            generation,
            "carol",
        )
    }

    #[test]
    fn test_home_classify_supersedes_skewed_foreign_removal() {
        let f = fixture("m1");
        let guid = home_asset(&f);
        let entity = f.storage.read_entity(guid).unwrap().unwrap();
        // m3's clock runs far ahead of ours.
        let skewed = foreign_conf("m3", current_time_us() + 1_000_000_000);
        f.manager.save_reference_copy("svc", &entity, &skewed).unwrap();
        f.manager
            .purge_classification_reference_copy("svc", &entity, &skewed)
            .unwrap();

        let replica = ReferenceCopyStore::new(m("m2"));
        for kind in [
            InstanceEventKind::NewClassification,
            InstanceEventKind::DeclassifiedEntity,
        ] {
            replica
                .apply_event(&InstanceEvent::classification(
                    kind,
                    &m("m3"),
                    "three",
                    0,
                    entity.clone(),
                    skewed.clone(),
                ))
                .unwrap();
        }

        let updated = f
            .manager
            .classify("alice", guid, "Confidentiality", level(2))
            .unwrap();
        let ours = updated.classification("Confidentiality").unwrap().clone();
        assert!(ours.generation > skewed.generation);

        let outcome = replica
            .apply_event(&InstanceEvent::classification(
                InstanceEventKind::NewClassification,
                &m("m1"),
                "one",
                updated.header.version,
                updated.clone(),
                ours.clone(),
            ))
            .unwrap();
        assert!(!outcome.is_discarded());
        let seen = replica.cached_entity(guid).unwrap();
        let held = seen.classification("Confidentiality").unwrap();
        assert_eq!(held.home_metadata_collection_id, m("m1"));
        assert_eq!(held.generation, ours.generation);
    }

    #[test]
    fn test_ledger_forget_drops_entity_entries() {
        let f = fixture("m1");
        let guid = home_asset(&f);
        let entity = f.storage.read_entity(guid).unwrap().unwrap();
        f.manager
            .save_reference_copy("svc", &entity, &foreign_conf("m3", 7))
            .unwrap();
        let other = home_asset(&f);
        f.manager
            .classify("alice", other, "Confidentiality", level(1))
            .unwrap();
        assert_eq!(f.manager.ledger().len(), 2);

        assert_eq!(f.manager.ledger().forget(guid), 1);
        assert_eq!(f.manager.ledger().forget(guid), 0);
        assert_eq!(f.manager.ledger().forget(other), 1);
        assert!(f.manager.ledger().is_empty());
    }

    #[test]
    fn test_late_copy_for_purged_entity_leaves_no_ledger_entry() {
        let f = fixture("m1");
        let guid = home_asset(&f);
        let entity = f.storage.read_entity(guid).unwrap().unwrap();
        f.storage.purge_entity(guid).unwrap();

        let c = foreign_conf("m3", 9);
        assert!(f
            .manager
            .save_reference_copy("svc", &entity, &c)
            .unwrap_err()
            .is_not_found());
        f.manager
            .purge_classification_reference_copy("svc", &entity, &c)
            .unwrap();
        assert!(f.manager.ledger().is_empty());
    }

    #[test]
    fn test_external_classify_supersedes_cached_removal() {
        let f = fixture_with("m2", InMemoryStorage::new(), &["Confidentiality"]);
        let entity = asset_at("m1");
        let guid = entity.guid();
        f.store
            .apply_event(&InstanceEvent::entity(
                InstanceEventKind::NewEntity,
                &m("m1"),
                "one",
                1,
                entity.clone(),
            ))
            .unwrap();
        let skewed = foreign_conf("m3", current_time_us() + 1_000_000_000);
        for kind in [
            InstanceEventKind::NewClassification,
            InstanceEventKind::DeclassifiedEntity,
        ] {
            f.store
                .apply_event(&InstanceEvent::classification(
                    kind,
                    &m("m3"),
                    "three",
                    0,
                    entity.clone(),
                    skewed.clone(),
                ))
                .unwrap();
        }

        let updated = f
            .manager
            .classify("bob", guid, "Confidentiality", level(3))
            .unwrap();
        let ours = updated.classification("Confidentiality").unwrap();
        assert!(ours.generation > skewed.generation);
        assert_eq!(
            f.store.entry(guid).unwrap().classification_key("Confidentiality"),
            Some(ours.key())
        );
    }

    #[test]
    fn test_save_reference_copy_on_home_entity() {
        let f = fixture("m1");
        let guid = home_asset(&f);
        let entity = f.storage.read_entity(guid).unwrap().unwrap();
        let c = Classification::new(
            InstanceType {
                type_guid: "c-conf".to_string(),
                type_name: "Confidentiality".to_string(),
            },
            level(1),
            m("m3"),
            5,
            "carol",
        );
        f.manager.save_reference_copy("svc", &entity, &c).unwrap();
        let stored = f.storage.read_entity(guid).unwrap().unwrap();
        assert_eq!(stored.header.version, 1);
        let held = stored.classification("Confidentiality").unwrap();
        assert_eq!(held.provenance, InstanceProvenance::ReplicatedReferenceCopy);
        assert_eq!(held.home_metadata_collection_id, m("m3"));

        // The home of the entity cannot reclassify someone else's classification.
        assert!(matches!(
            f.manager
                .reclassify("alice", guid, "Confidentiality", level(2), None),
            Err(CohortError::NotHome { .. })
        ));

        f.manager
            .purge_classification_reference_copy("svc", &entity, &c)
            .unwrap();
        assert!(f
            .storage
            .read_entity(guid)
            .unwrap()
            .unwrap()
            .classification("Confidentiality")
            .is_none());

        // A late copy of the removed state stays removed.
        f.manager.save_reference_copy("svc", &entity, &c).unwrap();
        assert!(f
            .storage
            .read_entity(guid)
            .unwrap()
            .unwrap()
            .classification("Confidentiality")
            .is_none());
    }

    #[test]
    fn test_save_reference_copy_not_supported() {
        let f = fixture_with(
            "m2",
            InMemoryStorage::new().decline_classification("*", "Anchors"),
            &[],
        );
        let remote = asset_at("m1");
        let c = Classification::new(
            InstanceType {
                type_guid: "c-anchor".to_string(),
                type_name: "Anchors".to_string(),
            },
            InstanceProperties::new(),
            m("m1"),
            1,
            "alice",
        );
        let err = f.manager.save_reference_copy("svc", &remote, &c).unwrap_err();
        assert!(err.is_not_supported());
        assert!(f.store.is_empty());
    }

    #[test]
    fn test_bulk_classify_skips_declined_and_cancels() {
        let f = fixture_with(
            "m1",
            InMemoryStorage::new().decline_classification("Person", "Anchors"),
            &[],
        );
        let assets: Vec<InstanceGuid> = (0..3).map(|_| home_asset(&f)).collect();
        let person = EntityDetail::new(
            InstanceHeader::new(
                InstanceType {
                    type_guid: "t-person".to_string(),
                    type_name: "Person".to_string(),
                },
                m("m1"),
                InstanceProvenance::LocalCohort,
                "alice",
            ),
            InstanceProperties::new(),
        );
        let person_guid = person.guid();
        f.storage.create_entity(person).unwrap();

        let mut guids = assets.clone();
        guids.insert(1, person_guid);
        let outcome = f
            .manager
            .bulk_classify(
                "alice",
                &guids,
                "Anchors",
                &InstanceProperties::new(),
                &CancellationToken::new(),
            )
            .unwrap();
        assert_eq!(outcome.classified, assets);
        assert_eq!(outcome.skipped_not_supported, vec![person_guid]);
        assert!(!outcome.cancelled);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let more: Vec<InstanceGuid> = (0..2).map(|_| home_asset(&f)).collect();
        let outcome = f
            .manager
            .bulk_classify("alice", &more, "Anchors", &InstanceProperties::new(), &cancel)
            .unwrap();
        assert!(outcome.cancelled);
        assert!(outcome.classified.is_empty());
    }
}
