//! Integration tests for multi-member cohort scenarios.
//!
//! These tests run several members in one process over a shared in-memory
//! topic and check ownership, replication ordering, the classification
//! lifecycle and federated paging end to end.

mod common;

use common::{member_config, wait_until, TestCohort, ASSET, ASSET_GUID, CONFIDENTIALITY};
use metacohort_repl::instance::{
    EntityDetail, InstanceGuid, InstanceProperties, InstancePropertyValue, MetadataCollectionId,
};
use metacohort_repl::query::MatchCriteria;
use metacohort_repl::CohortMember;
use std::collections::HashSet;

fn level(value: i32) -> InstanceProperties {
    InstanceProperties::new().with("level", InstancePropertyValue::int(value))
}

fn add_asset(member: &CohortMember, name: &str) -> EntityDetail {
    member
        .home()
        .add_entity(
            "alice",
            ASSET,
            InstanceProperties::new().with("name", InstancePropertyValue::string(name)),
        )
        .unwrap()
}

fn classified_version(member: &CohortMember, guid: InstanceGuid) -> Option<u64> {
    member
        .home()
        .get_entity_detail(guid)
        .ok()?
        .classification(CONFIDENTIALITY)
        .map(|c| c.version)
}

#[tokio::test]
async fn test_single_ownership_across_members() {
    let cohort = TestCohort::start(3);
    let entity = add_asset(cohort.member(0), "orders");
    let guid = entity.guid();

    assert!(
        wait_until(|| cohort
            .members
            .iter()
            .all(|m| m.home().get_entity_detail(guid).is_ok()))
        .await
    );

    let owners: Vec<&MetadataCollectionId> = cohort
        .members
        .iter()
        .filter(|m| {
            m.home()
                .get_entity_detail(guid)
                .map(|e| e.header.provenance.is_home_owned())
                .unwrap_or(false)
        })
        .map(|m| m.local_member_id())
        .collect();
    assert_eq!(owners, vec![&MetadataCollectionId::new("m1")]);

    for replica in &cohort.members[1..] {
        let cached = replica.store().cached_entity(guid).unwrap();
        assert_eq!(cached.header.replicated_by.as_ref(), Some(replica.local_member_id()));
        assert_eq!(
            cached.header.home_metadata_collection_id,
            MetadataCollectionId::new("m1")
        );
    }
    cohort.shutdown().await;
}

#[tokio::test]
async fn test_replica_cannot_mutate_home_instance() {
    let cohort = TestCohort::start(2);
    let entity = add_asset(cohort.member(0), "orders");
    let guid = entity.guid();
    assert!(wait_until(|| cohort.member(1).store().cached_entity(guid).is_some()).await);

    let err = cohort
        .member(1)
        .home()
        .update_entity_properties("bob", guid, InstanceProperties::new(), None)
        .unwrap_err();
    assert!(matches!(err, metacohort_repl::CohortError::NotHome { .. }));
    let err = cohort
        .member(1)
        .classify_entity("bob", guid, CONFIDENTIALITY, level(1))
        .unwrap_err();
    assert!(matches!(err, metacohort_repl::CohortError::NotHome { .. }));
    cohort.shutdown().await;
}

#[tokio::test]
async fn test_classification_round_trip_resets_version() {
    let cohort = TestCohort::start(2);
    let home = cohort.member(0);
    let replica = cohort.member(1);
    let guid = add_asset(home, "payroll").guid();

    let first = home
        .classify_entity("alice", guid, CONFIDENTIALITY, level(1))
        .unwrap();
    let first_generation = first.classification(CONFIDENTIALITY).unwrap().generation;
    home.reclassify_entity("alice", guid, CONFIDENTIALITY, level(2), Some(1))
        .unwrap();
    home.declassify_entity("alice", guid, CONFIDENTIALITY)
        .unwrap();

    let found = home
        .find_entities_by_classification(
            "alice",
            None,
            CONFIDENTIALITY,
            &InstanceProperties::new(),
            MatchCriteria::All,
            0,
            10,
        )
        .unwrap();
    assert!(found.is_empty());

    let again = home
        .classify_entity("alice", guid, CONFIDENTIALITY, level(3))
        .unwrap();
    let classification = again.classification(CONFIDENTIALITY).unwrap();
    assert_eq!(classification.version, 1);
    assert!(classification.generation > first_generation);

    let found = home
        .find_entities_by_classification(
            "alice",
            None,
            CONFIDENTIALITY,
            &InstanceProperties::new(),
            MatchCriteria::All,
            0,
            10,
        )
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(
        found[0].classification(CONFIDENTIALITY).unwrap().properties,
        level(3)
    );

    assert!(
        wait_until(|| replica
            .store()
            .cached_entity(guid)
            .and_then(|e| e.classification(CONFIDENTIALITY).map(|c| c.properties.clone()))
            == Some(level(3)))
        .await
    );
    assert_eq!(classified_version(replica, guid), Some(1));
    cohort.shutdown().await;
}

#[tokio::test]
async fn test_paging_covers_every_classified_entity() {
    let cohort = TestCohort::start(2);
    let home = cohort.member(0);
    let mut classified = HashSet::new();
    for i in 0..50 {
        let guid = add_asset(home, &format!("asset-{}", i)).guid();
        home.classify_entity("alice", guid, CONFIDENTIALITY, level(i % 3))
            .unwrap();
        classified.insert(guid);
    }
    for i in 0..5 {
        add_asset(home, &format!("unclassified-{}", i));
    }

    for member in &cohort.members {
        assert!(
            wait_until(|| member
                .find_entities_by_classification(
                    "alice",
                    Some(ASSET_GUID),
                    CONFIDENTIALITY,
                    &InstanceProperties::new(),
                    MatchCriteria::All,
                    0,
                    100,
                )
                .map(|page| page.len() == 50)
                .unwrap_or(false))
            .await
        );

        let mut seen = HashSet::new();
        let mut offset = 0;
        loop {
            let page = member
                .find_entities_by_classification(
                    "alice",
                    Some(ASSET_GUID),
                    CONFIDENTIALITY,
                    &InstanceProperties::new(),
                    MatchCriteria::All,
                    offset,
                    10,
                )
                .unwrap();
            for entity in &page {
                assert!(seen.insert(entity.guid()), "duplicate across pages");
            }
            if page.len() < 10 {
                break;
            }
            offset += 10;
        }
        assert_eq!(seen, classified);
    }
    cohort.shutdown().await;
}

#[tokio::test]
async fn test_declassify_unclassified_is_not_found() {
    let cohort = TestCohort::start(1);
    let home = cohort.member(0);
    let guid = add_asset(home, "ledger").guid();

    let err = home
        .declassify_entity("alice", guid, CONFIDENTIALITY)
        .unwrap_err();
    assert!(err.is_not_found());
    let err = home
        .reclassify_entity("alice", guid, CONFIDENTIALITY, level(1), None)
        .unwrap_err();
    assert!(err.is_not_found());
    cohort.shutdown().await;
}

#[tokio::test]
async fn test_reversed_delivery_never_regresses() {
    let cohort = TestCohort::start(2);
    let home = cohort.member(0);
    let replica = cohort.member(1);
    let guid = add_asset(home, "customers").guid();
    assert!(wait_until(|| replica.store().cached_entity(guid).is_some()).await);

    cohort.topic.hold();
    home.classify_entity("alice", guid, CONFIDENTIALITY, level(1))
        .unwrap();
    home.reclassify_entity("alice", guid, CONFIDENTIALITY, level(2), None)
        .unwrap();
    assert!(wait_until(|| cohort.topic.held_for(replica.local_member_id()) == 2).await);
    cohort.topic.release(true);

    assert!(wait_until(|| classified_version(replica, guid) == Some(2)).await);
    // Entity creation plus both classification events.
    assert!(wait_until(|| replica.fabric().stats().delivered >= 3).await);
    assert_eq!(classified_version(replica, guid), Some(2));
    assert_eq!(
        replica
            .store()
            .cached_entity(guid)
            .unwrap()
            .classification(CONFIDENTIALITY)
            .unwrap()
            .properties,
        level(2)
    );
    cohort.shutdown().await;
}

#[tokio::test]
async fn test_save_reference_copy_keeps_home() {
    let cohort = TestCohort::start(2);
    let home = cohort.member(0);
    let replica = cohort.member(1);

    let entity = add_asset(home, "invoices");
    let classified = home
        .classify_entity("alice", entity.guid(), CONFIDENTIALITY, level(2))
        .unwrap();
    let classification = classified.classification(CONFIDENTIALITY).unwrap().clone();

    replica
        .save_classification_reference_copy("bob", &classified, &classification)
        .unwrap();
    let cached = replica.store().cached_entity(entity.guid()).unwrap();
    assert_eq!(
        cached.header.home_metadata_collection_id,
        MetadataCollectionId::new("m1")
    );
    let copy = cached.classification(CONFIDENTIALITY).unwrap();
    assert_eq!(copy.home_metadata_collection_id, MetadataCollectionId::new("m1"));
    assert_eq!(copy.replicated_by.as_ref(), Some(replica.local_member_id()));
    cohort.shutdown().await;
}

#[tokio::test]
async fn test_third_party_classification_reaches_home() {
    let mut cohort = TestCohort::start(1);
    let mut config = member_config("m2");
    config.external_classifications = vec![CONFIDENTIALITY.to_string()];
    cohort.join(config);
    cohort.join(member_config("m3"));

    let guid = add_asset(cohort.member(0), "shipments").guid();
    assert!(wait_until(|| cohort.member(1).store().cached_entity(guid).is_some()).await);

    cohort
        .member(1)
        .classify_entity("carol", guid, CONFIDENTIALITY, level(4))
        .unwrap();

    let home = cohort.member(0);
    assert!(wait_until(|| classified_version(home, guid) == Some(1)).await);
    let stored = home.home().get_entity_detail(guid).unwrap();
    assert!(stored.header.provenance.is_home_owned());
    let copy = stored.classification(CONFIDENTIALITY).unwrap();
    assert_eq!(copy.home_metadata_collection_id, MetadataCollectionId::new("m2"));
    assert_eq!(copy.replicated_by.as_ref(), Some(home.local_member_id()));

    assert!(wait_until(|| classified_version(cohort.member(2), guid) == Some(1)).await);

    // The entity's home still cannot reclassify what m2 owns.
    let err = home
        .reclassify_entity("alice", guid, CONFIDENTIALITY, level(5), None)
        .unwrap_err();
    assert!(matches!(err, metacohort_repl::CohortError::NotHome { .. }));

    cohort
        .member(1)
        .declassify_entity("carol", guid, CONFIDENTIALITY)
        .unwrap();
    assert!(wait_until(|| classified_version(home, guid).is_none()).await);
    assert!(wait_until(|| classified_version(cohort.member(2), guid).is_none()).await);
    cohort.shutdown().await;
}

#[tokio::test]
async fn test_partitioned_publisher_redelivers_after_heal() {
    let cohort = TestCohort::start(2);
    let home = cohort.member(0);
    let replica = cohort.member(1);

    cohort.topic.partition(home.local_member_id());
    let guid = add_asset(home, "audit").guid();
    assert!(wait_until(|| home.fabric().pending_redelivery() > 0).await);
    assert!(replica.store().cached_entity(guid).is_none());

    cohort.topic.heal(home.local_member_id());
    assert!(wait_until(|| replica.store().cached_entity(guid).is_some()).await);
    assert!(wait_until(|| home.fabric().pending_redelivery() == 0).await);
    assert!(home.fabric().stats().redelivered >= 1);
    cohort.shutdown().await;
}

#[tokio::test]
async fn test_unannounced_member_registered_from_event() {
    let mut cohort = TestCohort::start(1);
    let early = MetadataCollectionId::new("m1");
    assert!(wait_until(|| cohort.member(0).fabric().stats().sent >= 1).await);

    // m2 connects after m1 announced itself, so it only learns of m1 from
    // m1's events.
    cohort.join(member_config("m2"));
    let late = cohort.member(1);
    assert!(late.registry().lookup(&early).is_none());

    add_asset(cohort.member(0), "contracts");
    assert!(wait_until(|| cohort.member(1).registry().lookup(&early).is_some()).await);
    let record = cohort.member(1).registry().lookup(&early).unwrap();
    assert!(record.last_seen_event_us.is_some());
    assert!(!record.stale);

    // m1 heard m2's announcement.
    assert!(
        wait_until(|| cohort
            .member(0)
            .registry()
            .lookup(&MetadataCollectionId::new("m2"))
            .is_some())
        .await
    );
    cohort.shutdown().await;
}

#[tokio::test]
async fn test_delete_and_purge_replicate() {
    let cohort = TestCohort::start(2);
    let home = cohort.member(0);
    let replica = cohort.member(1);
    let guid = add_asset(home, "temp").guid();
    assert!(wait_until(|| replica.store().cached_entity(guid).is_some()).await);

    home.home().delete_entity("alice", guid, None).unwrap();
    assert!(wait_until(|| replica
        .store()
        .cached_entity(guid)
        .map(|e| e.header.status == metacohort_repl::instance::InstanceStatus::Deleted)
        .unwrap_or(false))
    .await);
    let found = replica
        .find_entities_by_property(
            "bob",
            None,
            &InstanceProperties::new(),
            MatchCriteria::All,
            0,
            0,
        )
        .unwrap();
    assert!(found.iter().all(|e| e.guid() != guid));

    home.home().purge_entity("alice", guid).unwrap();
    assert!(wait_until(|| replica.store().is_purged(guid)).await);
    assert!(replica.store().cached_entity(guid).is_none());
    cohort.shutdown().await;
}
