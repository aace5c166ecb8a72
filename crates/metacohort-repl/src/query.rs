//! Federated query engine.
//!
//! Each call materializes one snapshot: the home collection first, then the
//! reference copies, merged by instance id with the home copy winning. Only
//! active entities are returned, ordered by id so that consecutive pages of
//! an unchanged cohort never overlap. Remote members are never contacted.

use crate::config::QueryConfig;
use crate::error::{CohortError, Result};
use crate::instance::{
    EntityDetail, InstanceGuid, InstanceProperties, InstanceStatus, MetadataCollectionId,
};
use crate::refcopy::ReferenceCopyStore;
use crate::storage::StorageAdapter;
use crate::types::{TypeCategory, TypeRegistry};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How match properties combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchCriteria {
    /// Every match property must be present with an equal value.
    #[default]
    All,
    /// At least one match property must be present with an equal value.
    Any,
    /// No match property may be present with an equal value.
    None,
}

impl MatchCriteria {
    /// True if `candidate` satisfies `wanted`. An empty `wanted` matches
    /// everything.
    pub fn matches(&self, candidate: &InstanceProperties, wanted: &InstanceProperties) -> bool {
        if wanted.is_empty() {
            return true;
        }
        let mut hits = wanted
            .iter()
            .map(|(name, value)| candidate.get(name) == Some(value));
        match self {
            MatchCriteria::All => hits.all(|hit| hit),
            MatchCriteria::Any => hits.any(|hit| hit),
            MatchCriteria::None => !hits.any(|hit| hit),
        }
    }
}

/// Requested slice of a result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Page {
    /// Matches to skip.
    pub offset: usize,
    /// Matches to return; 0 means the configured maximum.
    pub size: usize,
}

impl Page {
    /// A page of `size` starting after `offset` matches.
    pub fn new(offset: usize, size: usize) -> Self {
        Self { offset, size }
    }
}

/// Searches home storage and reference copies together.
pub struct FederatedQueryEngine {
    local_member_id: MetadataCollectionId,
    storage: Arc<dyn StorageAdapter>,
    store: Arc<ReferenceCopyStore>,
    types: Arc<dyn TypeRegistry>,
    config: QueryConfig,
}

impl FederatedQueryEngine {
    /// Create an engine over the member's storage and reference copies.
    pub fn new(
        local_member_id: MetadataCollectionId,
        storage: Arc<dyn StorageAdapter>,
        store: Arc<ReferenceCopyStore>,
        types: Arc<dyn TypeRegistry>,
        config: QueryConfig,
    ) -> Self {
        Self {
            local_member_id,
            storage,
            store,
            types,
            config,
        }
    }

    /// Entities carrying `classification_name` whose classification
    /// properties satisfy `match_properties` under `criteria`, optionally
    /// restricted to one entity type.
    pub fn find_by_classification(
        &self,
        entity_type_guid: Option<&str>,
        classification_name: &str,
        match_properties: &InstanceProperties,
        criteria: MatchCriteria,
        page: Page,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<EntityDetail>> {
        const OP: &str = "find_entities_by_classification";
        self.types
            .resolve(OP, classification_name, TypeCategory::Classification)?;
        self.check_entity_type(OP, entity_type_guid)?;
        self.search(OP, entity_type_guid, page, cancel, |entity| {
            entity
                .classification(classification_name)
                .map_or(false, |c| criteria.matches(&c.properties, match_properties))
        })
    }

    /// Entities whose own properties satisfy `match_properties` under
    /// `criteria`, optionally restricted to one entity type.
    pub fn find_by_property(
        &self,
        entity_type_guid: Option<&str>,
        match_properties: &InstanceProperties,
        criteria: MatchCriteria,
        page: Page,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<EntityDetail>> {
        const OP: &str = "find_entities_by_property";
        self.check_entity_type(OP, entity_type_guid)?;
        self.search(OP, entity_type_guid, page, cancel, |entity| {
            criteria.matches(&entity.properties, match_properties)
        })
    }

    fn check_entity_type(&self, operation: &'static str, type_guid: Option<&str>) -> Result<()> {
        let Some(guid) = type_guid else {
            return Ok(());
        };
        match self.types.type_by_guid(guid) {
            Some(def) if def.category == TypeCategory::Entity => Ok(()),
            Some(def) => Err(CohortError::invalid(
                operation,
                format!("type {} is not an entity type", def.name),
            )),
            None => Err(CohortError::not_found(operation, "type", guid)),
        }
    }

    fn page_size(&self, requested: usize) -> usize {
        if requested == 0 {
            self.config.max_page_size
        } else {
            requested.min(self.config.max_page_size)
        }
    }

    fn snapshot(&self, operation: &'static str) -> Result<BTreeMap<InstanceGuid, EntityDetail>> {
        let mut merged = BTreeMap::new();
        for entity in self
            .storage
            .snapshot_entities()
            .map_err(|e| e.into_cohort(operation, &self.local_member_id))?
        {
            merged.insert(entity.guid(), entity);
        }
        for entity in self.store.snapshot_entities() {
            merged.entry(entity.guid()).or_insert(entity);
        }
        Ok(merged)
    }

    fn search(
        &self,
        operation: &'static str,
        entity_type_guid: Option<&str>,
        page: Page,
        cancel: Option<&CancellationToken>,
        predicate: impl Fn(&EntityDetail) -> bool,
    ) -> Result<Vec<EntityDetail>> {
        let size = self.page_size(page.size);
        let snapshot = self.snapshot(operation)?;
        let mut results = Vec::with_capacity(size.min(snapshot.len()));
        let mut skipped = 0;

        for (examined, entity) in snapshot.into_values().enumerate() {
            if results.len() == size {
                break;
            }
            if cancel.map_or(false, CancellationToken::is_cancelled) {
                return Err(CohortError::Cancelled {
                    operation,
                    completed: examined,
                });
            }
            if entity.header.status != InstanceStatus::Active {
                continue;
            }
            if let Some(type_guid) = entity_type_guid {
                if entity.header.instance_type.type_guid != type_guid {
                    continue;
                }
            }
            if !predicate(&entity) {
                continue;
            }
            if skipped < page.offset {
                skipped += 1;
                continue;
            }
            results.push(entity);
        }
        debug!(
            "{} returned {} entities (offset {}, size {})",
            operation,
            results.len(),
            page.offset,
            size
        );
        Ok(results)
    }
}
