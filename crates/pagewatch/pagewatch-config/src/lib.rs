pub mod config;

pub use config::{CaptureMode, ConfigError, EngineConfig, StoreSection};
