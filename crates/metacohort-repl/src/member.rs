//! Cohort member: one repository taking part in the cohort.
//!
//! Assembles the registry, reference copy store, fabric, classification
//! manager, home collection and query engine around a storage adapter and a
//! type registry, and exposes the contract operations clients call.

use crate::classification::{BulkOutcome, ClassificationManager};
use crate::config::MemberConfig;
use crate::error::{CohortError, Result};
use crate::event::{ApplyAction, InstanceEvent};
use crate::fabric::{EventFabric, EventHandler, EventTransport};
use crate::home::HomeCollection;
use crate::instance::{
    current_time_us, Classification, EntityDetail, InstanceGuid, InstanceProperties,
    MetadataCollectionId,
};
use crate::locking::InstanceLocks;
use crate::measure::{measure, Measured};
use crate::query::{FederatedQueryEngine, MatchCriteria, Page};
use crate::refcopy::ReferenceCopyStore;
use crate::registry::{CohortRegistry, MemberDescriptor};
use crate::storage::StorageAdapter;
use crate::types::TypeRegistry;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// User recorded on changes made while applying inbound events.
const REPLICATION_USER: &str = "cohort-replication";

/// Maintenance period when stale detection is off.
const MAINTENANCE_PERIOD: Duration = Duration::from_secs(60);

struct InboundHandler {
    local_member_id: MetadataCollectionId,
    store: Arc<ReferenceCopyStore>,
    classifier: Arc<ClassificationManager>,
    locks: Arc<InstanceLocks>,
}

impl InboundHandler {
    fn apply(&self, event: &InstanceEvent) -> Result<()> {
        let homed_here = event.instance.header().is_homed_in(&self.local_member_id);
        match (
            event.kind.action(),
            event.instance.as_entity(),
            event.classification.as_ref(),
        ) {
            (ApplyAction::Classify, Some(entity), Some(classification)) if homed_here => self
                .classifier
                .save_reference_copy(REPLICATION_USER, entity, classification),
            (ApplyAction::Declassify, Some(entity), Some(classification)) if homed_here => self
                .classifier
                .purge_classification_reference_copy(REPLICATION_USER, entity, classification),
            _ => {
                let guid = event.instance_guid();
                let outcome = self.locks.with_lock(guid, || {
                    if event.kind.action() == ApplyAction::Purge {
                        self.classifier.ledger().forget(guid);
                    }
                    self.store.apply_event(event)
                })?;
                if outcome.is_discarded() {
                    debug!(
                        "discarded {:?} for {} from {}: {:?}",
                        event.kind,
                        event.instance_guid(),
                        event.originator,
                        outcome
                    );
                }
                Ok(())
            }
        }
    }
}

impl EventHandler for InboundHandler {
    fn on_event(&self, event: &InstanceEvent) {
        match self.apply(event) {
            Ok(()) => {}
            Err(e) if e.is_not_supported() => {
                debug!("declined {:?} for {}: {}", event.kind, event.instance_guid(), e)
            }
            Err(e) => warn!(
                "failed to apply {:?} for {} from {}: {}",
                event.kind,
                event.instance_guid(),
                event.originator,
                e
            ),
        }
    }
}

fn maintain(registry: &CohortRegistry, locks: &InstanceLocks, stale_after_secs: u64) -> usize {
    if stale_after_secs > 0 {
        let silence_us = stale_after_secs.saturating_mul(1_000_000);
        for member in registry.mark_stale(current_time_us(), silence_us) {
            info!("cohort member {} has gone quiet", member);
        }
    }
    let pruned = locks.prune();
    if pruned > 0 {
        debug!("pruned {} idle instance locks", pruned);
    }
    pruned
}

/// A cohort member and the contract it exposes.
pub struct CohortMember {
    config: MemberConfig,
    local_member_id: MetadataCollectionId,
    registry: Arc<CohortRegistry>,
    store: Arc<ReferenceCopyStore>,
    fabric: Arc<EventFabric>,
    classifier: Arc<ClassificationManager>,
    home: HomeCollection,
    query: FederatedQueryEngine,
    locks: Arc<InstanceLocks>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CohortMember {
    /// Build a member; call [`start`](Self::start) to join the cohort.
    pub fn new(
        config: MemberConfig,
        storage: Arc<dyn StorageAdapter>,
        types: Arc<dyn TypeRegistry>,
        transport: Arc<dyn EventTransport>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| CohortError::invalid("create_member", e.to_string()))?;
        let local_member_id = MetadataCollectionId::new(config.member_id.clone());
        let registry = Arc::new(CohortRegistry::new(local_member_id.clone()));
        let store = Arc::new(ReferenceCopyStore::new(local_member_id.clone()));
        let locks = Arc::new(InstanceLocks::new());
        let fabric = Arc::new(EventFabric::new(
            Arc::clone(&registry),
            &config.display_name,
            transport,
            config.publish.clone(),
        ));
        let classifier = Arc::new(ClassificationManager::new(
            Arc::clone(&storage),
            Arc::clone(&types),
            Arc::clone(&store),
            Arc::clone(&fabric),
            Arc::clone(&locks),
            config.external_classifications.iter().cloned(),
        ));
        let home = HomeCollection::new(
            Arc::clone(&storage),
            Arc::clone(&types),
            Arc::clone(&store),
            Arc::clone(&fabric),
            Arc::clone(&locks),
            Arc::clone(classifier.ledger()),
        );
        let query = FederatedQueryEngine::new(
            local_member_id.clone(),
            storage,
            Arc::clone(&store),
            types,
            config.query.clone(),
        );
        fabric.subscribe(Arc::new(InboundHandler {
            local_member_id: local_member_id.clone(),
            store: Arc::clone(&store),
            classifier: Arc::clone(&classifier),
            locks: Arc::clone(&locks),
        }));

        Ok(Self {
            config,
            local_member_id,
            registry,
            store,
            fabric,
            classifier,
            home,
            query,
            locks,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Start the fabric tasks, register locally and announce to the cohort.
    pub fn start(&self) -> Result<()> {
        let mut tasks = self.fabric.start()?;
        let descriptor = MemberDescriptor {
            display_name: self.config.display_name.clone(),
            endpoint: self.config.endpoint.clone(),
        };
        self.registry
            .register_member(self.local_member_id.clone(), &descriptor);
        self.fabric.announce(descriptor)?;
        tasks.push(self.spawn_maintenance());
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(tasks);
        info!("cohort member {} started", self.local_member_id);
        Ok(())
    }

    /// Prune idle instance locks and, when stale detection is on, mark
    /// quiet members stale. Returns the number of locks pruned.
    pub fn run_maintenance(&self) -> usize {
        maintain(&self.registry, &self.locks, self.config.stale_after_secs)
    }

    fn spawn_maintenance(&self) -> JoinHandle<()> {
        let registry = Arc::clone(&self.registry);
        let locks = Arc::clone(&self.locks);
        let cancel = self.cancel.clone();
        let stale_after_secs = self.config.stale_after_secs;
        let period = match stale_after_secs {
            0 => MAINTENANCE_PERIOD,
            secs => Duration::from_secs((secs / 2).max(1)),
        };
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        maintain(&registry, &locks, stale_after_secs);
                    }
                }
            }
        })
    }

    /// Stop every background task and wait for them to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.fabric.shutdown();
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("member task ended abnormally: {}", e);
            }
        }
        info!("cohort member {} shut down", self.local_member_id);
    }

    /// The local member id.
    pub fn local_member_id(&self) -> &MetadataCollectionId {
        &self.local_member_id
    }

    /// Member configuration.
    pub fn config(&self) -> &MemberConfig {
        &self.config
    }

    /// Known cohort members.
    pub fn registry(&self) -> &Arc<CohortRegistry> {
        &self.registry
    }

    /// Reference copies held by this member.
    pub fn store(&self) -> &Arc<ReferenceCopyStore> {
        &self.store
    }

    /// The member's attachment to the cohort topic.
    pub fn fabric(&self) -> &Arc<EventFabric> {
        &self.fabric
    }

    /// Owner-side entity and relationship operations.
    pub fn home(&self) -> &HomeCollection {
        &self.home
    }

    /// Classification lifecycle operations.
    pub fn classifier(&self) -> &ClassificationManager {
        &self.classifier
    }

    /// Run a contract call and report its elapsed time with the result.
    pub fn timed<T>(&self, operation: &'static str, f: impl FnOnce(&Self) -> T) -> Measured<T> {
        measure(operation, || f(self))
    }

    /// Attach a classification to an entity.
    pub fn classify_entity(
        &self,
        user_id: &str,
        entity_guid: InstanceGuid,
        classification_name: &str,
        properties: InstanceProperties,
    ) -> Result<EntityDetail> {
        self.classifier
            .classify(user_id, entity_guid, classification_name, properties)
    }

    /// Replace the properties of a classification this member owns.
    pub fn reclassify_entity(
        &self,
        user_id: &str,
        entity_guid: InstanceGuid,
        classification_name: &str,
        properties: InstanceProperties,
        expected_version: Option<u64>,
    ) -> Result<EntityDetail> {
        self.classifier.reclassify(
            user_id,
            entity_guid,
            classification_name,
            properties,
            expected_version,
        )
    }

    /// Remove a classification this member owns.
    pub fn declassify_entity(
        &self,
        user_id: &str,
        entity_guid: InstanceGuid,
        classification_name: &str,
    ) -> Result<EntityDetail> {
        self.classifier
            .declassify(user_id, entity_guid, classification_name, None)
    }

    /// Store a copy of a classification owned by another member.
    pub fn save_classification_reference_copy(
        &self,
        user_id: &str,
        entity: &EntityDetail,
        classification: &Classification,
    ) -> Result<()> {
        self.classifier
            .save_reference_copy(user_id, entity, classification)
    }

    /// Classify many entities, skipping the ones the repository declines.
    pub fn bulk_classify(
        &self,
        user_id: &str,
        guids: &[InstanceGuid],
        classification_name: &str,
        properties: &InstanceProperties,
        cancel: &CancellationToken,
    ) -> Result<BulkOutcome> {
        self.classifier
            .bulk_classify(user_id, guids, classification_name, properties, cancel)
    }

    /// Page through entities carrying a classification.
    #[allow(clippy::too_many_arguments)]
    pub fn find_entities_by_classification(
        &self,
        user_id: &str,
        entity_type_guid: Option<&str>,
        classification_name: &str,
        match_properties: &InstanceProperties,
        criteria: MatchCriteria,
        page_offset: usize,
        page_size: usize,
    ) -> Result<Vec<EntityDetail>> {
        debug!(
            "{} searching for {} at offset {}",
            user_id, classification_name, page_offset
        );
        self.query.find_by_classification(
            entity_type_guid,
            classification_name,
            match_properties,
            criteria,
            Page::new(page_offset, page_size),
            None,
        )
    }

    /// Page through entities by their own properties.
    pub fn find_entities_by_property(
        &self,
        user_id: &str,
        entity_type_guid: Option<&str>,
        match_properties: &InstanceProperties,
        criteria: MatchCriteria,
        page_offset: usize,
        page_size: usize,
    ) -> Result<Vec<EntityDetail>> {
        debug!("{} searching by property at offset {}", user_id, page_offset);
        self.query.find_by_property(
            entity_type_guid,
            match_properties,
            criteria,
            Page::new(page_offset, page_size),
            None,
        )
    }

    /// The query engine, for cancellable searches.
    pub fn query(&self) -> &FederatedQueryEngine {
        &self.query
    }
}
