//! Common test utilities and fixtures for integration tests.

#![allow(dead_code)]

use metacohort_repl::config::{MemberConfig, PublishConfig};
use metacohort_repl::fabric::InMemoryTopic;
use metacohort_repl::instance::{MetadataCollectionId, PropertyCategory};
use metacohort_repl::storage::InMemoryStorage;
use metacohort_repl::types::{InMemoryTypeRegistry, TypeDef, TypeRegistry};
use metacohort_repl::CohortMember;
use std::sync::Arc;
use std::time::Duration;

pub const ASSET: &str = "Asset";
pub const ASSET_GUID: &str = "asset-type";
pub const CONFIDENTIALITY: &str = "Confidentiality";

/// Publish settings with short timeouts for fast testing
pub fn fast_publish() -> PublishConfig {
    PublishConfig {
        attempt_timeout_ms: 100,
        max_attempts: 2,
        initial_backoff_ms: 5,
        max_backoff_ms: 20,
        backoff_multiplier: 2.0,
        jitter: false,
        redelivery_interval_ms: 20,
        listener_tasks: 1,
    }
}

/// Type definitions shared by every member of a test cohort
pub fn cohort_types() -> Arc<dyn TypeRegistry> {
    Arc::new(
        InMemoryTypeRegistry::new()
            .with(
                TypeDef::entity(ASSET_GUID, ASSET)
                    .with_property("name", PropertyCategory::Primitive),
            )
            .with(TypeDef::entity("process-type", "Process"))
            .with(
                TypeDef::classification("confidentiality-type", CONFIDENTIALITY)
                    .with_property("level", PropertyCategory::Primitive),
            )
            .with(TypeDef::relationship("lineage-type", "Lineage")),
    )
}

/// Config for a test member
pub fn member_config(id: &str) -> MemberConfig {
    let mut config = MemberConfig::for_member(id);
    config.publish = fast_publish();
    config.stale_after_secs = 0;
    config
}

/// An in-process cohort whose members share one in-memory topic
pub struct TestCohort {
    pub topic: InMemoryTopic,
    pub members: Vec<CohortMember>,
}

impl TestCohort {
    /// Create and start `num_members` members named `m1`, `m2`, ...
    pub fn start(num_members: usize) -> Self {
        let mut cohort = Self {
            topic: InMemoryTopic::new(),
            members: Vec::new(),
        };
        for i in 0..num_members {
            cohort.join(member_config(&format!("m{}", i + 1)));
        }
        cohort
    }

    /// Connect and start one more member
    pub fn join(&mut self, config: MemberConfig) -> &CohortMember {
        let transport = Arc::new(
            self.topic
                .connect(MetadataCollectionId::new(config.member_id.clone())),
        );
        let member = CohortMember::new(
            config,
            Arc::new(InMemoryStorage::new()),
            cohort_types(),
            transport,
        )
        .unwrap();
        member.start().unwrap();
        self.members.push(member);
        self.members.last().unwrap()
    }

    /// Member by position
    pub fn member(&self, index: usize) -> &CohortMember {
        &self.members[index]
    }

    /// Stop every member
    pub async fn shutdown(self) {
        for member in &self.members {
            member.shutdown().await;
        }
    }
}

/// Poll `condition` until it holds or two seconds pass
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cohort_creation() {
        let cohort = TestCohort::start(3);
        assert_eq!(cohort.members.len(), 3);
        assert_eq!(cohort.member(2).local_member_id().as_str(), "m3");
        cohort.shutdown().await;
    }

    #[tokio::test]
    async fn test_wait_until_gives_up() {
        assert!(!wait_until(|| false).await);
        assert!(wait_until(|| true).await);
    }
}
