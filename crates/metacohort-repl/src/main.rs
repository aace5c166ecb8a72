#![warn(missing_docs)]

//! MetaCohort member: runs a small in-process cohort on an in-memory topic.

use anyhow::Result;
use clap::Parser;
use metacohort_repl::config::MemberConfig;
use metacohort_repl::fabric::InMemoryTopic;
use metacohort_repl::instance::{
    InstanceProperties, InstancePropertyValue, MetadataCollectionId, PropertyCategory,
};
use metacohort_repl::storage::InMemoryStorage;
use metacohort_repl::types::{InMemoryTypeRegistry, TypeDef, TypeRegistry};
use metacohort_repl::CohortMember;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "mc-member", about = "MetaCohort replication member")]
struct Cli {
    /// Member config file (.toml or .json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Member id, used when no config file is given
    #[arg(long, default_value = "member-1")]
    member_id: String,

    /// Additional in-process peers to join to the same topic
    #[arg(long, default_value_t = 1)]
    peers: usize,

    /// Create and classify one entity after startup
    #[arg(long)]
    demo: bool,
}

fn demo_types() -> Arc<dyn TypeRegistry> {
    Arc::new(
        InMemoryTypeRegistry::new()
            .with(
                TypeDef::entity("asset-type", "Asset")
                    .with_property("name", PropertyCategory::Primitive),
            )
            .with(
                TypeDef::classification("confidentiality-type", "Confidentiality")
                    .with_property("level", PropertyCategory::Primitive),
            ),
    )
}

fn build_member(topic: &InMemoryTopic, config: MemberConfig) -> Result<CohortMember> {
    let transport = Arc::new(topic.connect(MetadataCollectionId::new(
        config.member_id.clone(),
    )));
    Ok(CohortMember::new(
        config,
        Arc::new(InMemoryStorage::new()),
        demo_types(),
        transport,
    )?)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => MemberConfig::from_file(path)?,
        None => MemberConfig::for_member(&cli.member_id),
    };
    tracing::info!("MetaCohort member {} starting...", config.member_id);

    let topic = InMemoryTopic::new();
    let mut members = vec![build_member(&topic, config)?];
    for i in 0..cli.peers {
        let peer = MemberConfig::for_member(&format!("peer-{}", i + 1));
        members.push(build_member(&topic, peer)?);
    }
    for member in &members {
        member.start()?;
    }

    if cli.demo {
        let local = &members[0];
        let entity = local.home().add_entity(
            "demo",
            "Asset",
            InstanceProperties::new().with("name", InstancePropertyValue::string("payroll")),
        )?;
        let measured = local.timed("classify_entity", |m| {
            m.classify_entity(
                "demo",
                entity.guid(),
                "Confidentiality",
                InstanceProperties::new().with("level", InstancePropertyValue::int(3)),
            )
        });
        measured.value?;
        tracing::info!("classified {} in {:?}", entity.guid(), measured.elapsed);
        tokio::time::sleep(Duration::from_millis(200)).await;
        for peer in &members[1..] {
            tracing::info!(
                "{} holds {} reference copies",
                peer.local_member_id(),
                peer.store().len()
            );
        }
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    for member in &members {
        member.shutdown().await;
    }
    Ok(())
}
