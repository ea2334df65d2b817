//! Runtime configuration.
//!
//! Loaded from `<vault>/config.toml`; every section and field is optional
//! and falls back to the documented default, so an empty vault runs with no
//! config file at all.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub execute: ExecuteConfig,
    #[serde(default)]
    pub persist: PersistConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub compaction: CompactionConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
}

impl Config {
    /// Load `config.toml` from the vault root. A missing file yields all
    /// defaults; a malformed file is an error.
    pub fn load(vault_path: &Path) -> Result<Self> {
        let path = vault_path.join("config.toml");
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)?;
        toml::from_str(&raw).map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Context stage
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Token-budget and history knobs for the CONTEXT stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Model context window, in estimated tokens.
    #[serde(default = "d_100_000")]
    pub context_window: usize,
    /// Tokens reserved for the response.
    #[serde(default = "d_4_000")]
    pub reserve_tokens: usize,
    /// Fraction of the usable window that triggers a memory flush.
    #[serde(default = "d_0_70")]
    pub flush_threshold: f64,
    /// Fraction of the usable window that triggers compaction.
    #[serde(default = "d_0_85")]
    pub compaction_threshold: f64,
    /// Tail-truncate the loaded transcript to this many messages.
    #[serde(default = "d_100")]
    pub max_history_messages: usize,
    /// Tool results newer than this rank are never pruned.
    #[serde(default = "d_5")]
    pub keep_recent_tool_results: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            context_window: 100_000,
            reserve_tokens: 4_000,
            flush_threshold: 0.70,
            compaction_threshold: 0.85,
            max_history_messages: 100,
            keep_recent_tool_results: 5,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Execute stage
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteConfig {
    /// Maximum tool-call loop iterations before force-stop.
    #[serde(default = "d_10")]
    pub max_tool_iterations: u32,
    /// Whole-turn wall clock limit, milliseconds.
    #[serde(default = "d_600_000")]
    pub execution_timeout_ms: u64,
    /// Per-tool wall clock limit, milliseconds.
    #[serde(default = "d_30_000")]
    pub tool_timeout_ms: u64,
    /// LLM call retry attempts.
    #[serde(default = "d_3")]
    pub max_retries: u32,
    /// Base delay for LLM call retries, milliseconds.
    #[serde(default = "d_1_000")]
    pub retry_base_delay_ms: u64,
}

impl Default for ExecuteConfig {
    fn default() -> Self {
        Self {
            max_tool_iterations: 10,
            execution_timeout_ms: 600_000,
            tool_timeout_ms: 30_000,
            max_retries: 3,
            retry_base_delay_ms: 1_000,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Persist stage
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistConfig {
    #[serde(default = "d_3")]
    pub max_retries: u32,
    #[serde(default = "d_100_u64")]
    pub retry_base_delay_ms: u64,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_delay_ms: 100,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Retry manager defaults
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "d_1_000")]
    pub initial_delay_ms: u64,
    #[serde(default = "d_2_0")]
    pub multiplier: f64,
    #[serde(default = "d_30_000")]
    pub max_delay_ms: u64,
    /// Add 0–25 % random jitter to each delay.
    #[serde(default = "d_true")]
    pub jitter: bool,
    #[serde(default = "d_3")]
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            jitter: true,
            max_attempts: 3,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Working memory
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Total serialized document size cap, characters.
    #[serde(default = "d_50_000")]
    pub total_limit: usize,
    /// Per-section content cap, characters.
    #[serde(default = "d_10_000")]
    pub section_limit: usize,
    #[serde(default = "d_20")]
    pub max_sections: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            total_limit: 50_000,
            section_limit: 10_000,
            max_sections: 20,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session lock & lifecycle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LockConfig {
    /// Lease TTL, seconds. An expired lease may be reaped by any acquirer.
    #[serde(default = "d_900")]
    pub ttl_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self { ttl_secs: 900 }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// An `active` session idle longer than this is treated as ended.
    #[serde(default = "d_24")]
    pub idle_expiry_hours: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            idle_expiry_hours: 24,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Compaction
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Token budget for the produced summary.
    #[serde(default = "d_2_000")]
    pub summary_budget: usize,
    /// Recent messages kept verbatim.
    #[serde(default = "d_5")]
    pub preserve_recent: usize,
    /// Keep messages carrying importance markers out of the summary.
    #[serde(default = "d_true")]
    pub preserve_important: bool,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            summary_budget: 2_000,
            preserve_recent: 5,
            preserve_important: true,
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_true() -> bool {
    true
}
fn d_3() -> u32 {
    3
}
fn d_10() -> u32 {
    10
}
fn d_5() -> usize {
    5
}
fn d_20() -> usize {
    20
}
fn d_24() -> u64 {
    24
}
fn d_100() -> usize {
    100
}
fn d_100_u64() -> u64 {
    100
}
fn d_900() -> u64 {
    900
}
fn d_1_000() -> u64 {
    1_000
}
fn d_2_000() -> usize {
    2_000
}
fn d_4_000() -> usize {
    4_000
}
fn d_10_000() -> usize {
    10_000
}
fn d_30_000() -> u64 {
    30_000
}
fn d_50_000() -> usize {
    50_000
}
fn d_100_000() -> usize {
    100_000
}
fn d_600_000() -> u64 {
    600_000
}
fn d_0_70() -> f64 {
    0.70
}
fn d_0_85() -> f64 {
    0.85
}
fn d_2_0() -> f64 {
    2.0
}
