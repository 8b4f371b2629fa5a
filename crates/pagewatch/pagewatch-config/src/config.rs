use serde::Deserialize;
use std::path::Path;

/// How the engine captures writes.
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMode {
    /// Page-protection traps: writes fault, the handler records them.
    #[default]
    Protect,
    /// Periodic re-hashing of every region, for platforms where write
    /// faults cannot be trapped reliably.
    Sample,
}

#[derive(Deserialize, Debug, Clone)]
pub struct EngineConfig {
    #[serde(default = "defaults::log_level")]
    pub log_level: String,
    #[serde(default)]
    pub capture_mode: CaptureMode,
    /// Raw-event ring slots; must be a power of two.
    #[serde(default = "defaults::ring_capacity")]
    pub ring_capacity: usize,
    /// How long a faulted page stays writable so write bursts fuse into
    /// one diff.
    #[serde(default = "defaults::coalesce_window_ms")]
    pub coalesce_window_ms: u64,
    #[serde(default = "defaults::idle_sleep_ms")]
    pub idle_sleep_ms: u64,
    #[serde(default = "defaults::poll_queue_capacity")]
    pub poll_queue_capacity: usize,
    /// Regions up to this size keep a byte snapshot for old-value diffs;
    /// larger regions diff by hash alone.
    #[serde(default = "defaults::snapshot_cap_bytes")]
    pub snapshot_cap_bytes: usize,
    #[serde(default = "defaults::sample_interval_ms")]
    pub sample_interval_ms: u64,
    /// Armed-page table slots; must be a power of two.
    #[serde(default = "defaults::page_table_capacity")]
    pub page_table_capacity: usize,
    #[serde(default)]
    pub store: StoreSection,
}

#[derive(Deserialize, Debug, Clone)]
pub struct StoreSection {
    #[serde(default = "defaults::store_enabled")]
    pub enabled: bool,
    /// Also journal a compact record of every change event under
    /// `evt/{seq}` so the history survives the process.
    #[serde(default)]
    pub persist_events: bool,
    #[serde(default = "defaults::store_path")]
    pub path: String,
    #[serde(default = "defaults::store_initial_capacity")]
    pub initial_capacity_bytes: u64,
    #[serde(default = "defaults::store_initial_slots")]
    pub initial_slots: u32,
    #[serde(default = "defaults::store_value_max")]
    pub value_max_bytes: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read '{path}'")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config")]
    Parse(#[from] toml::de::Error),
}

mod defaults {
    pub fn log_level() -> String {
        "info".into()
    }

    pub fn ring_capacity() -> usize {
        1 << 16 // 65536
    }

    pub fn coalesce_window_ms() -> u64 {
        5
    }

    pub fn idle_sleep_ms() -> u64 {
        1
    }

    pub fn poll_queue_capacity() -> usize {
        1024
    }

    pub fn snapshot_cap_bytes() -> usize {
        1 << 20 // 1 MiB
    }

    pub fn sample_interval_ms() -> u64 {
        10
    }

    pub fn page_table_capacity() -> usize {
        8192
    }

    pub fn store_enabled() -> bool {
        true
    }

    pub fn store_path() -> String {
        "/tmp/pagewatch_spill.store".into()
    }

    pub fn store_initial_capacity() -> u64 {
        1 << 20
    }

    pub fn store_initial_slots() -> u32 {
        16_384
    }

    pub fn store_value_max() -> usize {
        100 * 1024
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty config must deserialize from defaults")
    }
}

impl Default for StoreSection {
    fn default() -> Self {
        toml::from_str("").expect("empty store section must deserialize from defaults")
    }
}

impl EngineConfig {
    pub fn load(path: impl AsRef<Path> + ToString) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        let config: EngineConfig = toml::from_str(&text)?;
        Ok(config)
    }
}
