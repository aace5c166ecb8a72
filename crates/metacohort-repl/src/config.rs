//! Member configuration, loaded from TOML or JSON.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Publish retry and listener settings for the event fabric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    /// Timeout for a single send attempt (ms).
    pub attempt_timeout_ms: u64,
    /// Send attempts before an event is parked for redelivery.
    pub max_attempts: u32,
    /// Backoff before the second attempt (ms).
    pub initial_backoff_ms: u64,
    /// Cap on the backoff between attempts (ms).
    pub max_backoff_ms: u64,
    /// Growth factor of the backoff.
    pub backoff_multiplier: f64,
    /// Add up to 50% random jitter to each backoff.
    pub jitter: bool,
    /// How often the redelivery queue is drained (ms).
    pub redelivery_interval_ms: u64,
    /// Number of tasks draining the inbound side of the transport.
    pub listener_tasks: usize,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            attempt_timeout_ms: 2_000,
            max_attempts: 5,
            initial_backoff_ms: 50,
            max_backoff_ms: 5_000,
            backoff_multiplier: 2.0,
            jitter: true,
            redelivery_interval_ms: 1_000,
            listener_tasks: 1,
        }
    }
}

impl PublishConfig {
    /// Per-attempt timeout.
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    /// Interval of the redelivery timer.
    pub fn redelivery_interval(&self) -> Duration {
        Duration::from_millis(self.redelivery_interval_ms)
    }
}

/// Federated query settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Upper bound on any page; a page size of 0 asks for this many.
    pub max_page_size: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self { max_page_size: 500 }
    }
}

/// Configuration of one cohort member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemberConfig {
    /// Metadata collection id of this member.
    pub member_id: String,
    /// Human-readable name announced to the cohort.
    pub display_name: String,
    /// Endpoint announced to the cohort, if any.
    pub endpoint: Option<String>,
    /// Classification types this member may attach to entities homed elsewhere.
    pub external_classifications: Vec<String>,
    /// Silence after which another member is marked stale (seconds).
    pub stale_after_secs: u64,
    /// Fabric settings.
    pub publish: PublishConfig,
    /// Query settings.
    pub query: QueryConfig,
}

impl Default for MemberConfig {
    fn default() -> Self {
        Self {
            member_id: String::from("local-member"),
            display_name: String::from("Local member"),
            endpoint: None,
            external_classifications: Vec::new(),
            stale_after_secs: 300,
            publish: PublishConfig::default(),
            query: QueryConfig::default(),
        }
    }
}

impl MemberConfig {
    /// Config for `member_id` with default settings.
    pub fn for_member(member_id: &str) -> Self {
        Self {
            member_id: member_id.to_string(),
            display_name: member_id.to_string(),
            ..Self::default()
        }
    }

    /// Load from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: MemberConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the member cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.member_id.trim().is_empty() {
            anyhow::bail!("member_id must not be empty");
        }
        if self.publish.max_attempts == 0 {
            anyhow::bail!("publish.max_attempts must be at least 1");
        }
        if self.publish.attempt_timeout_ms == 0 {
            anyhow::bail!("publish.attempt_timeout_ms must be positive");
        }
        if self.publish.backoff_multiplier < 1.0 {
            anyhow::bail!(
                "publish.backoff_multiplier must be >= 1.0, got {}",
                self.publish.backoff_multiplier
            );
        }
        if self.publish.initial_backoff_ms > self.publish.max_backoff_ms {
            anyhow::bail!("publish.initial_backoff_ms exceeds publish.max_backoff_ms");
        }
        if self.publish.redelivery_interval_ms == 0 {
            anyhow::bail!("publish.redelivery_interval_ms must be positive");
        }
        if self.publish.listener_tasks == 0 {
            anyhow::bail!("publish.listener_tasks must be at least 1");
        }
        if self.query.max_page_size == 0 {
            anyhow::bail!("query.max_page_size must be at least 1");
        }
        Ok(())
    }
}
