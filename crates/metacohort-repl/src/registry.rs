//! Cohort registry: the set of known member repositories.
//!
//! Members are registered explicitly through registration messages or
//! implicitly the first time one of their events arrives. Entries are never
//! removed; members that fall silent are marked stale so the causal history
//! of their instances stays attributable.

use crate::instance::{current_time_us, MetadataCollectionId};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// What a member says about itself when it registers.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MemberDescriptor {
    /// Human-readable name.
    pub display_name: String,
    /// Optional endpoint for out-of-band access.
    pub endpoint: Option<String>,
}

impl MemberDescriptor {
    /// Descriptor with just a display name.
    pub fn named(display_name: &str) -> Self {
        Self {
            display_name: display_name.to_string(),
            endpoint: None,
        }
    }
}

/// Record of a known member in the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberRecord {
    /// Metadata collection of the member.
    pub member_id: MetadataCollectionId,
    /// Human-readable display name.
    pub display_name: String,
    /// Endpoint advertised by the member.
    pub endpoint: Option<String>,
    /// When the member was first seen (microseconds since epoch).
    pub registered_at_us: u64,
    /// Timestamp of the newest processed event from this member.
    pub last_seen_event_us: Option<u64>,
    /// True if the member has not been heard from within the silence window.
    pub stale: bool,
}

impl MemberRecord {
    fn new(member_id: MetadataCollectionId, descriptor: &MemberDescriptor) -> Self {
        Self {
            member_id,
            display_name: descriptor.display_name.clone(),
            endpoint: descriptor.endpoint.clone(),
            registered_at_us: current_time_us(),
            last_seen_event_us: None,
            stale: false,
        }
    }
}

/// Registry of cohort members, shared by handle between the fabric and the
/// member facade.
#[derive(Debug)]
pub struct CohortRegistry {
    local_member_id: MetadataCollectionId,
    members: DashMap<MetadataCollectionId, MemberRecord>,
}

impl CohortRegistry {
    /// Create a registry for the given local member. The local member is
    /// not listed until it registers itself.
    pub fn new(local_member_id: MetadataCollectionId) -> Self {
        Self {
            local_member_id,
            members: DashMap::new(),
        }
    }

    /// The local member id.
    pub fn local_member_id(&self) -> &MetadataCollectionId {
        &self.local_member_id
    }

    /// Idempotent upsert. Re-registration refreshes the descriptor and
    /// clears the stale mark, keeping registration time and last-seen.
    pub fn register_member(
        &self,
        member_id: MetadataCollectionId,
        descriptor: &MemberDescriptor,
    ) -> MemberRecord {
        let mut entry = self
            .members
            .entry(member_id.clone())
            .or_insert_with(|| {
                info!("registering cohort member {}", member_id);
                MemberRecord::new(member_id.clone(), descriptor)
            });
        entry.display_name = descriptor.display_name.clone();
        entry.endpoint = descriptor.endpoint.clone();
        entry.stale = false;
        entry.clone()
    }

    /// Record a processed event from `member_id`. Unknown members are
    /// registered implicitly; returns true when that happened.
    pub fn observe_event(
        &self,
        member_id: &MetadataCollectionId,
        display_name: &str,
        timestamp_us: u64,
    ) -> bool {
        let mut implicit = false;
        let mut entry = self.members.entry(member_id.clone()).or_insert_with(|| {
            implicit = true;
            MemberRecord::new(member_id.clone(), &MemberDescriptor::named(display_name))
        });
        if implicit {
            info!("implicitly registered cohort member {} from event", member_id);
        }
        entry.last_seen_event_us = Some(
            entry
                .last_seen_event_us
                .map_or(timestamp_us, |seen| seen.max(timestamp_us)),
        );
        entry.stale = false;
        implicit
    }

    /// Look up a member by id.
    pub fn lookup(&self, member_id: &MetadataCollectionId) -> Option<MemberRecord> {
        self.members.get(member_id).map(|r| r.value().clone())
    }

    /// Lazy, restartable walk over the current members in id order.
    pub fn list_members(&self) -> MemberCursor<'_> {
        MemberCursor::new(self)
    }

    /// Mark members silent for longer than `silence_us` as stale; returns
    /// the newly stale ids.
    pub fn mark_stale(&self, now_us: u64, silence_us: u64) -> Vec<MetadataCollectionId> {
        let mut newly_stale = Vec::new();
        for mut record in self.members.iter_mut() {
            if record.member_id == self.local_member_id || record.stale {
                continue;
            }
            let last = record.last_seen_event_us.unwrap_or(record.registered_at_us);
            if now_us.saturating_sub(last) > silence_us {
                record.stale = true;
                newly_stale.push(record.member_id.clone());
            }
        }
        for id in &newly_stale {
            debug!("cohort member {} marked stale", id);
        }
        newly_stale.sort();
        newly_stale
    }

    /// Number of known members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// True if no members are known.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    fn sorted_ids(&self) -> Vec<MetadataCollectionId> {
        let mut ids: Vec<_> = self.members.iter().map(|r| r.key().clone()).collect();
        ids.sort();
        ids
    }
}

/// Cursor over registry members.
///
/// The id list is captured when the cursor is created or restarted; each
/// record is read from the registry only when the cursor reaches it, so it
/// reflects the latest state. Members registered after the capture appear
/// after a [`restart`](Self::restart).
pub struct MemberCursor<'a> {
    registry: &'a CohortRegistry,
    ids: Vec<MetadataCollectionId>,
    pos: usize,
}

impl<'a> MemberCursor<'a> {
    fn new(registry: &'a CohortRegistry) -> Self {
        Self {
            registry,
            ids: registry.sorted_ids(),
            pos: 0,
        }
    }

    /// Start over from the first member, picking up new registrations.
    pub fn restart(&mut self) {
        self.ids = self.registry.sorted_ids();
        self.pos = 0;
    }
}

impl Iterator for MemberCursor<'_> {
    type Item = MemberRecord;

    fn next(&mut self) -> Option<MemberRecord> {
        while self.pos < self.ids.len() {
            let id = &self.ids[self.pos];
            self.pos += 1;
            if let Some(record) = self.registry.lookup(id) {
                return Some(record);
            }
        }
        None
    }
}
