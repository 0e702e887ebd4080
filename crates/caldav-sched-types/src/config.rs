//! Server configuration (spec §6.5).
//!
//! Shaped after the teacher's `bpmn_integration::config::WorkflowConfig`:
//! a `serde`-derived struct loaded from YAML with `Default` filling in every
//! knob, and environment variables (via `dotenvy`) only ever overriding the
//! database URL and bind address — never the scheduling knobs themselves.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Work-queue delay and batching knobs (§6.5's `workQueues.*`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkQueuesConfig {
    pub enabled: bool,
    pub request_delay_seconds: u64,
    pub reply_delay_seconds: u64,
    pub attendee_refresh_batch_delay_seconds: u64,
    pub attendee_refresh_batch_interval_seconds: u64,
}

impl Default for WorkQueuesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            request_delay_seconds: 5,
            reply_delay_seconds: 5,
            attendee_refresh_batch_delay_seconds: 5,
            attendee_refresh_batch_interval_seconds: 5,
        }
    }
}

impl WorkQueuesConfig {
    pub fn request_delay(&self) -> Duration {
        Duration::from_secs(self.request_delay_seconds)
    }

    pub fn reply_delay(&self) -> Duration {
        Duration::from_secs(self.reply_delay_seconds)
    }

    pub fn attendee_refresh_batch_delay(&self) -> Duration {
        Duration::from_secs(self.attendee_refresh_batch_delay_seconds)
    }
}

/// Split-engine knobs (§6.5's `splitting.*`, §4.10).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SplittingConfig {
    pub enabled: bool,
    pub size: u32,
    pub past_days: u32,
    pub delay_seconds: u64,
}

impl Default for SplittingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            size: 100,
            past_days: 14,
            delay_seconds: 5,
        }
    }
}

/// Top-level configuration for both the dispatcher and the scheduling core
/// (§6.5 in full).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Cap on accept-loop iterations per cycle (§4.3, §6.5).
    pub max_accepts: u32,
    /// Global concurrent-connection cap; accept is paused once every active
    /// worker's effective load reaches this divided across active workers
    /// (§4.3 D2).
    pub max_requests: u32,
    pub work_queues: WorkQueuesConfig,
    pub auto_reply_delay_seconds: u64,
    pub attendee_refresh_batch: u32,
    pub splitting: SplittingConfig,
    pub max_attendees_per_instance: u32,
    pub max_resource_size: u64,
    #[serde(default = "default_db_url")]
    pub database_url: String,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_worker_count")]
    pub worker_count: u32,
}

fn default_db_url() -> String {
    "postgres://localhost/caldav_sched".to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0:8443".to_string()
}

fn default_worker_count() -> u32 {
    4
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_accepts: 50,
            max_requests: 600,
            work_queues: WorkQueuesConfig::default(),
            auto_reply_delay_seconds: 5,
            attendee_refresh_batch: 5,
            splitting: SplittingConfig::default(),
            max_attendees_per_instance: 100,
            max_resource_size: 1_048_576,
            database_url: default_db_url(),
            bind_addr: default_bind_addr(),
            worker_count: default_worker_count(),
        }
    }
}

impl ServerConfig {
    /// Parse from a YAML document, falling back to [`Default`] for any
    /// field the document omits.
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    /// Load from `path`, then let `DATABASE_URL`/`BIND_ADDR` environment
    /// variables (populated from a `.env` file by `dotenvy`, if present)
    /// override the corresponding fields. Mirrors the teacher's pattern of
    /// layering env vars over a YAML base rather than driving configuration
    /// from the environment alone.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();
        let text = std::fs::read_to_string(path)?;
        let mut cfg = Self::from_yaml(&text)?;
        if let Ok(url) = std::env::var("DATABASE_URL") {
            cfg.database_url = url;
        }
        if let Ok(addr) = std::env::var("BIND_ADDR") {
            cfg.bind_addr = addr;
        }
        Ok(cfg)
    }
}
