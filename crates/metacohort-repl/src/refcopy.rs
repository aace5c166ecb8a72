//! Reference copy store: the local, read-only cache of instances homed
//! elsewhere in the cohort.
//!
//! Entity and relationship state is ordered by the instance version; each
//! classification on a cached entity is ordered separately by its
//! [`ClassificationKey`], because a classification may have a different home
//! than its entity. Anything not strictly newer than what is cached is
//! discarded, which makes every apply idempotent under duplicate and
//! out-of-order delivery. The store never initiates outbound calls.

use crate::error::{CohortError, Result};
use crate::event::{ApplyAction, InstanceEvent};
use crate::instance::{
    Classification, ClassificationKey, EntityDetail, Instance, InstanceGuid, MetadataCollectionId,
    Relationship,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::BTreeMap;
use tracing::debug;

/// Why an event was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// The cached state is already at or past the incoming state.
    Stale {
        /// Version carried by the event.
        incoming: u64,
        /// Version already applied.
        applied: u64,
    },
    /// The instance is homed in the local collection.
    LocallyHomed,
    /// The instance was purged by its home.
    Purged,
}

/// What [`ReferenceCopyStore::apply_event`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// A new entry was cached.
    Created,
    /// The cached instance was replaced by a newer version.
    Updated,
    /// The cached instance was marked deleted and retained.
    MarkedDeleted,
    /// The entry was removed.
    Purged,
    /// A classification was attached or replaced.
    ClassificationApplied,
    /// A classification was detached.
    ClassificationRemoved,
    /// Nothing changed.
    Discarded(DiscardReason),
}

impl ApplyOutcome {
    /// True if the event left the store unchanged.
    pub fn is_discarded(&self) -> bool {
        matches!(self, Self::Discarded(_))
    }
}

#[derive(Debug, Clone)]
struct ClassificationSlot {
    key: ClassificationKey,
    current: Option<Classification>,
}

/// One cached instance.
#[derive(Debug, Clone)]
pub struct ReferenceCopy {
    /// The cached instance, provenance rewritten for this holder.
    pub instance: Instance,
    /// Member whose event last changed this entry.
    pub source_member_id: MetadataCollectionId,
    /// Version of the newest applied instance state.
    pub last_applied_version: u64,
    slots: BTreeMap<String, ClassificationSlot>,
}

impl ReferenceCopy {
    fn new(
        mut instance: Instance,
        source: &MetadataCollectionId,
        holder: &MetadataCollectionId,
    ) -> Self {
        instance.header_mut().mark_reference_copy(holder);
        let incoming = take_classifications(&mut instance);
        let mut copy = Self {
            last_applied_version: instance.version(),
            instance,
            source_member_id: source.clone(),
            slots: BTreeMap::new(),
        };
        for classification in incoming {
            copy.offer_classification(classification, holder);
        }
        copy.rebuild_classifications();
        copy
    }

    /// Ordering key of the named classification, live or removed.
    pub fn classification_key(&self, name: &str) -> Option<ClassificationKey> {
        self.slots.get(name).map(|s| s.key)
    }

    fn replace_instance(
        &mut self,
        mut instance: Instance,
        source: &MetadataCollectionId,
        holder: &MetadataCollectionId,
    ) {
        instance.header_mut().mark_reference_copy(holder);
        let incoming = take_classifications(&mut instance);
        self.last_applied_version = instance.version();
        self.source_member_id = source.clone();
        self.instance = instance;
        for classification in incoming {
            self.offer_classification(classification, holder);
        }
        self.rebuild_classifications();
    }

    fn offer_classification(
        &mut self,
        mut classification: Classification,
        holder: &MetadataCollectionId,
    ) -> bool {
        let key = classification.key();
        if let Some(slot) = self.slots.get(classification.name()) {
            if slot.key >= key {
                return false;
            }
        }
        if !classification.is_homed_in(holder) {
            classification.mark_reference_copy(holder);
        }
        self.slots.insert(
            classification.name().to_string(),
            ClassificationSlot {
                key,
                current: Some(classification),
            },
        );
        true
    }

    fn offer_removal(&mut self, classification: &Classification) -> bool {
        let key = classification.removal_key();
        if let Some(slot) = self.slots.get(classification.name()) {
            if slot.key >= key {
                return false;
            }
        }
        self.slots.insert(
            classification.name().to_string(),
            ClassificationSlot { key, current: None },
        );
        true
    }

    fn rebuild_classifications(&mut self) {
        if let Instance::Entity(entity) = &mut self.instance {
            entity.classifications = self
                .slots
                .values()
                .filter_map(|slot| slot.current.clone())
                .collect();
        }
    }

    fn stale(&self, incoming: u64) -> DiscardReason {
        DiscardReason::Stale {
            incoming,
            applied: self.last_applied_version,
        }
    }
}

fn take_classifications(instance: &mut Instance) -> Vec<Classification> {
    match instance {
        Instance::Entity(entity) => std::mem::take(&mut entity.classifications),
        Instance::Relationship(_) => Vec::new(),
    }
}

/// Per-member cache of instances owned by other members.
#[derive(Debug)]
pub struct ReferenceCopyStore {
    local_member_id: MetadataCollectionId,
    entries: DashMap<InstanceGuid, ReferenceCopy>,
    purged: DashMap<InstanceGuid, u64>,
}

impl ReferenceCopyStore {
    /// Create an empty store for the given local member.
    pub fn new(local_member_id: MetadataCollectionId) -> Self {
        Self {
            local_member_id,
            entries: DashMap::new(),
            purged: DashMap::new(),
        }
    }

    /// Apply an inbound event.
    ///
    /// Errors only for malformed events; stale, duplicate and locally homed
    /// events are discarded silently and reported in the outcome.
    pub fn apply_event(&self, event: &InstanceEvent) -> Result<ApplyOutcome> {
        event.validate()?;
        let action = event.kind.action();
        let outcome = match action {
            ApplyAction::Classify | ApplyAction::Declassify => {
                let (Some(entity), Some(classification)) =
                    (event.instance.as_entity(), event.classification.as_ref())
                else {
                    return Err(CohortError::invalid(
                        "apply_event",
                        "classification event without entity",
                    ));
                };
                self.apply_classification(
                    entity,
                    classification,
                    action == ApplyAction::Declassify,
                    &event.originator,
                )
            }
            ApplyAction::Purge => self.apply_purge(&event.instance),
            ApplyAction::Upsert | ApplyAction::MarkDeleted => {
                self.apply_instance(&event.instance, action, &event.originator)
            }
        };
        debug!(
            "applied {:?} for {} from {} (seq {}): {:?}",
            event.kind,
            event.instance_guid(),
            event.originator,
            event.sequence_hint,
            outcome
        );
        Ok(outcome)
    }

    fn guard(&self, instance: &Instance) -> Option<DiscardReason> {
        if instance.header().is_homed_in(&self.local_member_id) {
            return Some(DiscardReason::LocallyHomed);
        }
        if self.purged.contains_key(&instance.guid()) {
            return Some(DiscardReason::Purged);
        }
        None
    }

    fn apply_purge(&self, instance: &Instance) -> ApplyOutcome {
        if instance.header().is_homed_in(&self.local_member_id) {
            return ApplyOutcome::Discarded(DiscardReason::LocallyHomed);
        }
        // Tombstone first so a racing upsert that re-checks after taking the
        // entry lock sees it.
        let guid = instance.guid();
        self.purged.insert(guid, instance.version());
        self.entries.remove(&guid);
        ApplyOutcome::Purged
    }

    fn apply_instance(
        &self,
        instance: &Instance,
        action: ApplyAction,
        source: &MetadataCollectionId,
    ) -> ApplyOutcome {
        if instance.header().is_homed_in(&self.local_member_id) {
            return ApplyOutcome::Discarded(DiscardReason::LocallyHomed);
        }
        let changed = if action == ApplyAction::MarkDeleted {
            ApplyOutcome::MarkedDeleted
        } else {
            ApplyOutcome::Updated
        };
        match self.entries.entry(instance.guid()) {
            Entry::Vacant(slot) => {
                if let Some(reason) = self.guard(instance) {
                    return ApplyOutcome::Discarded(reason);
                }
                slot.insert(ReferenceCopy::new(
                    instance.clone(),
                    source,
                    &self.local_member_id,
                ));
                if action == ApplyAction::MarkDeleted {
                    ApplyOutcome::MarkedDeleted
                } else {
                    ApplyOutcome::Created
                }
            }
            Entry::Occupied(mut slot) => {
                let copy = slot.get_mut();
                if instance.version() <= copy.last_applied_version {
                    return ApplyOutcome::Discarded(copy.stale(instance.version()));
                }
                copy.replace_instance(instance.clone(), source, &self.local_member_id);
                changed
            }
        }
    }

    fn apply_classification(
        &self,
        entity: &EntityDetail,
        classification: &Classification,
        removal: bool,
        source: &MetadataCollectionId,
    ) -> ApplyOutcome {
        let instance = Instance::Entity(entity.clone());
        if instance.header().is_homed_in(&self.local_member_id) {
            return ApplyOutcome::Discarded(DiscardReason::LocallyHomed);
        }
        let holder = &self.local_member_id;
        let changed = if removal {
            ApplyOutcome::ClassificationRemoved
        } else {
            ApplyOutcome::ClassificationApplied
        };
        match self.entries.entry(entity.guid()) {
            Entry::Vacant(slot) => {
                if let Some(reason) = self.guard(&instance) {
                    return ApplyOutcome::Discarded(reason);
                }
                let mut copy = ReferenceCopy::new(instance, source, holder);
                if removal {
                    copy.offer_removal(classification);
                } else {
                    copy.offer_classification(classification.clone(), holder);
                }
                copy.rebuild_classifications();
                slot.insert(copy);
                changed
            }
            Entry::Occupied(mut slot) => {
                let copy = slot.get_mut();
                let entity_newer = entity.header.version > copy.last_applied_version;
                if entity_newer {
                    copy.replace_instance(instance, source, holder);
                }
                let applied = if removal {
                    copy.offer_removal(classification)
                } else {
                    copy.offer_classification(classification.clone(), holder)
                };
                copy.rebuild_classifications();
                match (applied, entity_newer) {
                    (true, _) => changed,
                    (false, true) => ApplyOutcome::Updated,
                    (false, false) => ApplyOutcome::Discarded(DiscardReason::Stale {
                        incoming: classification.version,
                        applied: copy
                            .classification_key(classification.name())
                            .map_or(0, |k| k.version),
                    }),
                }
            }
        }
    }

    /// Mirror a classification onto a cached entity, creating the entry from
    /// `entity` if it is not cached yet.
    pub fn save_classification(
        &self,
        entity: &EntityDetail,
        classification: &Classification,
        source: &MetadataCollectionId,
    ) -> ApplyOutcome {
        self.apply_classification(entity, classification, false, source)
    }

    /// Record the removal of a classification from a cached entity.
    pub fn remove_classification(
        &self,
        entity: &EntityDetail,
        classification: &Classification,
        source: &MetadataCollectionId,
    ) -> ApplyOutcome {
        self.apply_classification(entity, classification, true, source)
    }

    /// Cached instance, or `None`. Never blocks on the network.
    pub fn get_cached(&self, guid: InstanceGuid) -> Option<Instance> {
        self.entries.get(&guid).map(|c| c.instance.clone())
    }

    /// Cached entity, or `None`.
    pub fn cached_entity(&self, guid: InstanceGuid) -> Option<EntityDetail> {
        self.get_cached(guid).and_then(|i| match i {
            Instance::Entity(e) => Some(e),
            Instance::Relationship(_) => None,
        })
    }

    /// Cached relationship, or `None`.
    pub fn cached_relationship(&self, guid: InstanceGuid) -> Option<Relationship> {
        self.get_cached(guid).and_then(|i| match i {
            Instance::Entity(_) => None,
            Instance::Relationship(r) => Some(r),
        })
    }

    /// Full cache entry, including bookkeeping.
    pub fn entry(&self, guid: InstanceGuid) -> Option<ReferenceCopy> {
        self.entries.get(&guid).map(|c| c.value().clone())
    }

    /// Version of the newest applied state for `guid`.
    pub fn last_applied_version(&self, guid: InstanceGuid) -> Option<u64> {
        self.entries.get(&guid).map(|c| c.last_applied_version)
    }

    /// True if the home purged this instance.
    pub fn is_purged(&self, guid: InstanceGuid) -> bool {
        self.purged.contains_key(&guid)
    }

    /// Copy of every cached entity, deleted ones included.
    pub fn snapshot_entities(&self) -> Vec<EntityDetail> {
        self.entries
            .iter()
            .filter_map(|c| c.instance.as_entity().cloned())
            .collect()
    }

    /// Number of cached instances.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
